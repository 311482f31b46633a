pub mod backoff;
pub mod client;
pub mod config;
pub mod input;
pub mod link;
pub mod prediction;
pub mod transport;

pub use backoff::{Backoff, BackoffConfig, RetryDecision};
pub use client::NetworkClient;
pub use config::ClientConfig;
pub use input::InputState;
pub use link::{
    Connector, Link, SessionInfo, TransportError, UdpConnector, UdpLink, WsConnector, WsLink,
};
pub use prediction::{Correction, CorrectionPolicy, PredictionEngine, ReconciliationConfig};
pub use transport::{
    ConnectionPhase, ConnectionStatus, TransportEvent, TransportHandle, TransportLayer,
};
