use glam::Vec2;

use crate::net::ControlState;

use super::state::{EntityState, normalize_angle};

/// The integration rule shared by client prediction and the authoritative
/// server. Implementations must be deterministic: the same state, control
/// and step always produce the same result.
pub trait Integrator: Send + Sync {
    fn integrate(&self, state: &mut EntityState, control: &ControlState, flight_assist: bool, dt: f32);
}

#[derive(Debug, Clone)]
pub struct FlightConfig {
    pub thrust_acceleration: f32,
    pub strafe_acceleration: f32,
    pub angular_acceleration: f32,
    pub max_speed: f32,
    pub max_angular_speed: f32,
    /// Per-second decay of uncommanded linear velocity with flight assist on.
    pub assist_damping: f32,
    pub assist_angular_damping: f32,
}

impl Default for FlightConfig {
    fn default() -> Self {
        Self {
            thrust_acceleration: 20.0,
            strafe_acceleration: 10.0,
            angular_acceleration: 6.0,
            max_speed: 60.0,
            max_angular_speed: 4.0,
            assist_damping: 1.5,
            assist_angular_damping: 4.0,
        }
    }
}

/// Newtonian top-down flight: thrust pushes along the heading, strafe_x
/// across it, strafe_y along the hull, yaw spins the ship.
#[derive(Debug, Clone, Default)]
pub struct FlightModel {
    config: FlightConfig,
}

impl FlightModel {
    pub fn new(config: FlightConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FlightConfig {
        &self.config
    }

    fn local_acceleration(&self, control: &ControlState) -> Vec2 {
        Vec2::new(
            control.thrust * self.config.thrust_acceleration
                + control.strafe_y * self.config.strafe_acceleration,
            control.strafe_x * self.config.strafe_acceleration,
        )
    }
}

impl Integrator for FlightModel {
    fn integrate(&self, state: &mut EntityState, control: &ControlState, flight_assist: bool, dt: f32) {
        if !dt.is_finite() || dt <= 0.0 {
            return;
        }
        let control = control.clamped();

        let heading = Vec2::from_angle(state.rotation);
        let acceleration = heading.rotate(self.local_acceleration(&control));

        state.velocity += acceleration * dt;
        state.angular_velocity += control.yaw_input * self.config.angular_acceleration * dt;

        if flight_assist {
            let translating =
                control.thrust != 0.0 || control.strafe_x != 0.0 || control.strafe_y != 0.0;
            if !translating {
                state.velocity *= (-self.config.assist_damping * dt).exp();
            }
            if control.yaw_input == 0.0 {
                state.angular_velocity *= (-self.config.assist_angular_damping * dt).exp();
            }
        }

        state.velocity = state.velocity.clamp_length_max(self.config.max_speed);
        state.angular_velocity = state
            .angular_velocity
            .clamp(-self.config.max_angular_speed, self.config.max_angular_speed);

        state.position += state.velocity * dt;
        state.rotation = normalize_angle(state.rotation + state.angular_velocity * dt);
    }
}
