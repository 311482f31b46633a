use std::f32::consts::TAU;

use glam::Vec2;

use flightline::{EntityHandle, Integrator, PlayerInput, World};

const SPAWN_RING_RADIUS: f32 = 20.0;
const SPAWN_SLOTS: u32 = 12;

/// An authorized input waiting for the next simulation step.
#[derive(Debug, Clone)]
pub struct QueuedInput {
    pub client_id: u32,
    pub entity_id: u32,
    pub input: PlayerInput,
}

/// Spreads new ships around a ring so they do not spawn on top of each other.
pub fn spawn_point(client_id: u32) -> Vec2 {
    let slot = client_id % SPAWN_SLOTS;
    Vec2::from_angle(TAU * slot as f32 / SPAWN_SLOTS as f32) * SPAWN_RING_RADIUS
}

/// Steps the input's entity once. Returns `false` when the entity is gone.
pub fn apply_input<I: Integrator + ?Sized>(
    world: &mut World,
    integrator: &I,
    queued: &QueuedInput,
    dt: f32,
) -> bool {
    let Some(entity) = world.get_mut(EntityHandle(queued.entity_id)) else {
        return false;
    };

    let control = queued.input.control_state.clamped();
    entity.control = control;
    entity.flight_assist = queued.input.flight_assist;
    integrator.integrate(&mut entity.state, &control, entity.flight_assist, dt);

    if !entity.state.is_finite() {
        log::error!(
            "Entity {} left the finite range, resetting to spawn",
            entity.id
        );
        entity.state = flightline::EntityState::at(spawn_point(queued.client_id), 0.0);
    }
    true
}

#[cfg(test)]
mod tests {
    use flightline::{ControlState, FlightModel};

    use super::*;

    fn queued(entity_id: u32, thrust: f32, sequence: u32) -> QueuedInput {
        QueuedInput {
            client_id: 1,
            entity_id,
            input: PlayerInput {
                client_id: 1,
                sequence_number: sequence,
                timestamp_ms: 0,
                control_state: ControlState::new(thrust, 0.0, 0.0, 0.0),
                flight_assist: false,
            },
        }
    }

    #[test]
    fn test_input_moves_its_entity() {
        let mut world = World::new();
        let handle = world.spawn_ship(Vec2::ZERO);
        let model = FlightModel::default();

        assert!(apply_input(&mut world, &model, &queued(handle.id(), 1.0, 1), 1.0 / 60.0));

        let entity = world.get(handle).unwrap();
        assert!(entity.state.position.x > 0.0);
        assert_eq!(entity.control.thrust, 1.0);
        assert!(!entity.flight_assist);
    }

    #[test]
    fn test_missing_entity_is_reported() {
        let mut world = World::new();
        let model = FlightModel::default();
        assert!(!apply_input(&mut world, &model, &queued(77, 1.0, 1), 1.0 / 60.0));
    }

    #[test]
    fn test_spawn_points_differ() {
        assert_ne!(spawn_point(1), spawn_point(2));
        assert!((spawn_point(5).length() - SPAWN_RING_RADIUS).abs() < 1e-3);
    }
}
