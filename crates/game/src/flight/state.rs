use std::f32::consts::{PI, TAU};

use glam::Vec2;

use crate::net::{ControlState, EntitySnapshot, PlayerInput, Transform, Velocity};

/// Wraps an angle into `(-PI, PI]`.
pub fn normalize_angle(angle: f32) -> f32 {
    let mut normalized = angle % TAU;
    if normalized > PI {
        normalized -= TAU;
    } else if normalized <= -PI {
        normalized += TAU;
    }
    normalized
}

/// Kinematic state of one ship. Always passed by value so predicted and
/// authoritative copies never alias.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EntityState {
    pub position: Vec2,
    pub rotation: f32,
    pub velocity: Vec2,
    pub angular_velocity: f32,
}

impl EntityState {
    pub fn at(position: Vec2, rotation: f32) -> Self {
        Self {
            position,
            rotation: normalize_angle(rotation),
            ..Default::default()
        }
    }

    pub fn position_error(&self, other: &EntityState) -> f32 {
        self.position.distance(other.position)
    }

    /// Shortest angular distance to `other`, in `[0, PI]`.
    pub fn rotation_error(&self, other: &EntityState) -> f32 {
        normalize_angle(self.rotation - other.rotation).abs()
    }

    pub fn transform(&self) -> Transform {
        Transform {
            position: self.position.to_array(),
            rotation: self.rotation,
        }
    }

    pub fn velocity_state(&self) -> Velocity {
        Velocity {
            linear: self.velocity.to_array(),
            angular: self.angular_velocity,
        }
    }

    /// Rebuilds state from a snapshot entry. Entries without a transform
    /// carry nothing to correct against.
    pub fn from_snapshot(entity: &EntitySnapshot) -> Option<Self> {
        let transform = entity.transform?;
        let velocity = entity.velocity.unwrap_or_default();
        Some(Self {
            position: Vec2::from_array(transform.position),
            rotation: transform.rotation,
            velocity: Vec2::from_array(velocity.linear),
            angular_velocity: velocity.angular,
        })
    }

    pub fn is_finite(&self) -> bool {
        self.position.is_finite()
            && self.velocity.is_finite()
            && self.rotation.is_finite()
            && self.angular_velocity.is_finite()
    }
}

/// One sampled frame of control input, tagged with the client's sequence
/// number. Built once per input tick and only ever copied afterwards.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InputSample {
    pub sequence: u32,
    pub timestamp_ms: u64,
    pub control: ControlState,
    pub flight_assist: bool,
    pub dt: f32,
}

impl InputSample {
    pub fn new(
        sequence: u32,
        timestamp_ms: u64,
        control: ControlState,
        flight_assist: bool,
        dt: f32,
    ) -> Self {
        Self {
            sequence,
            timestamp_ms,
            control: control.clamped(),
            flight_assist,
            dt,
        }
    }

    pub fn to_wire(&self, client_id: u32) -> PlayerInput {
        PlayerInput {
            client_id,
            sequence_number: self.sequence,
            timestamp_ms: self.timestamp_ms,
            control_state: self.control,
            flight_assist: self.flight_assist,
        }
    }

    /// The wire format carries no step; the receiver supplies the one it
    /// integrates with.
    pub fn from_wire(input: &PlayerInput, dt: f32) -> Self {
        Self::new(
            input.sequence_number,
            input.timestamp_ms,
            input.control_state,
            input.flight_assist,
            dt,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_angle() {
        assert!((normalize_angle(2.5 * PI) - PI / 2.0).abs() < 1e-5);
        assert!((normalize_angle(-3.0 * PI / 2.0) - PI / 2.0).abs() < 1e-5);
        assert_eq!(normalize_angle(0.5), 0.5);
    }

    #[test]
    fn test_rotation_error_wraps() {
        let a = EntityState::at(Vec2::ZERO, PI - 0.05);
        let b = EntityState::at(Vec2::ZERO, -PI + 0.05);
        assert!((a.rotation_error(&b) - 0.1).abs() < 1e-4);
    }

    #[test]
    fn test_snapshot_without_transform_is_ignored() {
        let entity = EntitySnapshot::new(3);
        assert!(EntityState::from_snapshot(&entity).is_none());
    }

    #[test]
    fn test_sample_clamps_control() {
        let sample = InputSample::new(1, 0, ControlState::new(0.0, 0.0, 0.0, 0.0), true, 0.01);
        let raw = ControlState {
            thrust: 4.0,
            ..sample.control
        };
        let sample = InputSample::new(2, 0, raw, true, 0.01);
        assert_eq!(sample.control.thrust, 1.0);

        let wire = sample.to_wire(9);
        assert_eq!(wire.client_id, 9);
        assert_eq!(wire.sequence_number, 2);
        assert_eq!(InputSample::from_wire(&wire, 0.01), sample);
    }
}
