mod protocol;

pub use protocol::{
    ControlState, DEFAULT_BRIDGE_PORT, DEFAULT_SNAPSHOT_RATE, DEFAULT_TICK_RATE,
    DEFAULT_UDP_PORT, EntitySnapshot, MAX_PACKET_SIZE, PROTOCOL_MAGIC, PROTOCOL_VERSION, Packet,
    PacketError, PacketHeader, PacketType, PlayerInput, Transform, Velocity, WorldSnapshot,
};
