use glam::Vec2;

use crate::flight::EntityState;
use crate::net::{ControlState, EntitySnapshot};

pub const DEFAULT_HEALTH: f32 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityHandle(pub u32);

impl EntityHandle {
    pub fn id(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone)]
pub struct Entity {
    pub id: u32,
    pub state: EntityState,
    pub control: ControlState,
    pub flight_assist: bool,
    pub health: f32,
}

impl Entity {
    pub fn ship(id: u32, spawn_position: Vec2) -> Self {
        Self {
            id,
            state: EntityState::at(spawn_position, 0.0),
            control: ControlState::default(),
            flight_assist: true,
            health: DEFAULT_HEALTH,
        }
    }

    pub fn handle(&self) -> EntityHandle {
        EntityHandle(self.id)
    }

    pub fn to_snapshot(&self, last_processed_sequence: u32) -> EntitySnapshot {
        EntitySnapshot {
            entity_id: self.id,
            transform: Some(self.state.transform()),
            velocity: Some(self.state.velocity_state()),
            control_state: Some(self.control),
            flight_assist: Some(self.flight_assist),
            health: Some(self.health),
            last_processed_sequence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_carries_full_state() {
        let mut entity = Entity::ship(42, Vec2::new(10.0, 5.0));
        entity.state.velocity = Vec2::new(2.5, -1.0);
        entity.state.angular_velocity = 0.5;

        let snapshot = entity.to_snapshot(17);
        let restored = EntityState::from_snapshot(&snapshot).unwrap();

        assert_eq!(snapshot.entity_id, 42);
        assert_eq!(snapshot.last_processed_sequence, 17);
        assert_eq!(snapshot.flight_assist, Some(true));
        assert_eq!(restored, entity.state);
    }
}
