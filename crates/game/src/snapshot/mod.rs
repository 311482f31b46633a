mod entity;
mod world;

pub use entity::{DEFAULT_HEALTH, Entity, EntityHandle};
pub use world::World;
