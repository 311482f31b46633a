use flightline::{ControlState, InputSample};

/// Pilot controls as sampled by the frame loop.
#[derive(Debug, Clone, Default)]
pub struct InputState {
    pub thrust: f32,
    pub strafe_x: f32,
    pub strafe_y: f32,
    pub yaw: f32,
    pub flight_assist: bool,
}

impl InputState {
    pub fn control(&self) -> ControlState {
        ControlState::new(self.thrust, self.strafe_x, self.strafe_y, self.yaw)
    }

    pub fn to_sample(&self, sequence: u32, timestamp_ms: u64, dt: f32) -> InputSample {
        InputSample::new(sequence, timestamp_ms, self.control(), self.flight_assist, dt)
    }
}
