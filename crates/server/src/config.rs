use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use flightline::{DEFAULT_BRIDGE_PORT, DEFAULT_SNAPSHOT_RATE, DEFAULT_TICK_RATE, DEFAULT_UDP_PORT};

use crate::router::PacketLossSimulation;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub udp_addr: SocketAddr,
    /// `None` disables the WebSocket bridge.
    pub bridge: Option<BridgeConfig>,
    pub tick_rate: u32,
    pub snapshot_rate: u32,
    pub max_clients: usize,
    pub connection_timeout: Duration,
    pub reap_interval: Duration,
    /// Consecutive undecodable datagrams before a connection loses acceptance.
    pub max_decode_errors: u32,
    pub input_queue: usize,
    pub shutdown_grace: Duration,
    pub packet_loss: Option<PacketLossSimulation>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            udp_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_UDP_PORT)),
            bridge: Some(BridgeConfig::default()),
            tick_rate: DEFAULT_TICK_RATE,
            snapshot_rate: DEFAULT_SNAPSHOT_RATE,
            max_clients: 32,
            connection_timeout: Duration::from_secs(10),
            reap_interval: Duration::from_secs(1),
            max_decode_errors: 16,
            input_queue: 1024,
            shutdown_grace: Duration::from_secs(2),
            packet_loss: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub bind_addr: SocketAddr,
    /// Port of the first virtual endpoint; later ones count up from here.
    pub virtual_base_port: u16,
    /// Outbound frames buffered per WebSocket before sends are dropped.
    pub outbound_queue: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_BRIDGE_PORT)),
            virtual_base_port: 10_000,
            outbound_queue: 256,
        }
    }
}
