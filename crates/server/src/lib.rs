pub mod bridge;
pub mod config;
pub mod events;
pub mod registry;
pub mod router;
pub mod server;
pub mod simulation;
pub mod tick;

pub use bridge::{BridgeError, BridgeSend, Datagram, TransportBridge};
pub use config::{BridgeConfig, ServerConfig};
pub use events::{DisconnectReason, ServerEvent};
pub use registry::{ConnectionRecord, ConnectionRegistry, RegistryError};
pub use router::{DatagramRouter, PacketLossSimulation};
pub use server::{GameServer, ServerError};
pub use tick::{TickConfig, TickLoop};
