use std::time::Duration;

use super::backoff::BackoffConfig;
use super::prediction::ReconciliationConfig;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub player_name: String,
    /// Input samples produced, applied and sent per second.
    pub input_rate: u32,
    pub handshake_timeout: Duration,
    /// Silence from the server longer than this drops the session.
    pub connection_timeout: Duration,
    /// Consecutive undecodable packets tolerated before the session is dropped.
    pub max_decode_errors: u32,
    pub outbound_queue: usize,
    pub reconciliation: ReconciliationConfig,
    pub backoff: BackoffConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            player_name: "pilot".to_string(),
            input_rate: 60,
            handshake_timeout: Duration::from_secs(5),
            connection_timeout: Duration::from_secs(10),
            max_decode_errors: 16,
            outbound_queue: 256,
            reconciliation: ReconciliationConfig::default(),
            backoff: BackoffConfig::default(),
        }
    }
}
