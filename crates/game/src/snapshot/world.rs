use std::collections::{BTreeMap, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

use glam::Vec2;

use crate::net::WorldSnapshot;

use super::entity::{Entity, EntityHandle};

/// Authoritative entity store. Entities are kept ordered by id so every
/// snapshot lists them in the same order.
#[derive(Debug)]
pub struct World {
    tick: u64,
    start_time_ms: u64,
    entities: BTreeMap<u32, Entity>,
    next_entity_id: u32,
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl World {
    pub fn new() -> Self {
        Self {
            tick: 0,
            start_time_ms: current_time_ms(),
            entities: BTreeMap::new(),
            next_entity_id: 1,
        }
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn advance_tick(&mut self) {
        self.tick = self.tick.wrapping_add(1);
    }

    pub fn server_time_ms(&self) -> u64 {
        current_time_ms().saturating_sub(self.start_time_ms)
    }

    pub fn spawn_ship(&mut self, spawn_position: Vec2) -> EntityHandle {
        let id = self.allocate_id();
        self.entities.insert(id, Entity::ship(id, spawn_position));
        EntityHandle(id)
    }

    pub fn despawn(&mut self, handle: EntityHandle) -> Option<Entity> {
        self.entities.remove(&handle.0)
    }

    pub fn get(&self, handle: EntityHandle) -> Option<&Entity> {
        self.entities.get(&handle.0)
    }

    pub fn get_mut(&mut self, handle: EntityHandle) -> Option<&mut Entity> {
        self.entities.get_mut(&handle.0)
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Builds a full snapshot, stamping each entity with its owner's last
    /// processed input sequence (zero when unowned).
    pub fn snapshot(&self, owner_sequences: &HashMap<u32, u32>) -> WorldSnapshot {
        let entities = self
            .entities
            .values()
            .map(|entity| {
                let sequence = owner_sequences.get(&entity.id).copied().unwrap_or(0);
                entity.to_snapshot(sequence)
            })
            .collect();

        WorldSnapshot {
            tick: self.tick,
            timestamp_ms: self.server_time_ms(),
            entities,
        }
    }

    fn allocate_id(&mut self) -> u32 {
        let id = self.next_entity_id;
        self.next_entity_id += 1;
        id
    }
}

fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
