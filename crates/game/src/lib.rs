pub mod flight;
pub mod net;
pub mod simulation;
pub mod snapshot;

pub use flight::{EntityState, FlightConfig, FlightModel, InputSample, Integrator};
pub use net::{
    ControlState, DEFAULT_BRIDGE_PORT, DEFAULT_SNAPSHOT_RATE, DEFAULT_TICK_RATE,
    DEFAULT_UDP_PORT, EntitySnapshot, MAX_PACKET_SIZE, PROTOCOL_VERSION, Packet, PacketError,
    PacketType, PlayerInput, Transform, Velocity, WorldSnapshot,
};
pub use simulation::{Cadence, FixedSchedule, FixedTimestep};
pub use snapshot::{Entity, EntityHandle, World};
