pub mod net;

pub use net::{
    BackoffConfig, ClientConfig, ConnectionPhase, ConnectionStatus, CorrectionPolicy, InputState,
    NetworkClient, PredictionEngine, ReconciliationConfig, TransportError,
};
