use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tokio::time::{Instant, MissedTickBehavior};

use flightline::{DEFAULT_BRIDGE_PORT, DEFAULT_UDP_PORT};
use flightline_client::{
    BackoffConfig, ClientConfig, CorrectionPolicy, InputState, NetworkClient, ReconciliationConfig,
};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TransportKind {
    Udp,
    Ws,
}

#[derive(Parser)]
#[command(name = "flightline-client")]
#[command(about = "Headless flightline pilot")]
struct Args {
    #[arg(short, long, default_value = "127.0.0.1", help = "Server host")]
    server: String,

    #[arg(short, long, help = "Server port (defaults to the transport's default port)")]
    port: Option<u16>,

    #[arg(short, long, value_enum, default_value_t = TransportKind::Udp)]
    transport: TransportKind,

    #[arg(short, long, default_value = "pilot")]
    name: String,

    #[arg(long, default_value_t = 60, help = "Input samples per second")]
    input_rate: u32,

    #[arg(long, default_value_t = 60, help = "Frames per second of the local loop")]
    frame_rate: u32,

    #[arg(long, default_value_t = 0.05, help = "Position error in meters that forces a correction")]
    reconcile_threshold: f32,

    #[arg(long, default_value_t = 0.001, help = "Rotation error in radians that forces a correction")]
    rotation_tolerance: f32,

    #[arg(long, help = "Only snap position and rotation, keep predicted velocities")]
    keep_velocity: bool,

    #[arg(long, help = "Do not reconnect after a failure")]
    no_reconnect: bool,

    #[arg(long, default_value_t = 250)]
    base_delay_ms: u64,

    #[arg(long, default_value_t = 10_000)]
    max_delay_ms: u64,

    #[arg(long, default_value_t = 2.0)]
    backoff_factor: f64,

    #[arg(long, default_value_t = 250)]
    jitter_ms: u64,

    #[arg(long, default_value_t = 10, help = "Reconnect attempts before giving up (0 = forever)")]
    max_retries: u32,

    #[arg(long, default_value_t = 16)]
    max_decode_errors: u32,

    #[arg(long, default_value_t = 5_000)]
    handshake_timeout_ms: u64,

    #[arg(long, help = "Exit after this many seconds")]
    duration_secs: Option<u64>,
}

impl Args {
    fn client_config(&self) -> ClientConfig {
        let defaults = ClientConfig::default();
        ClientConfig {
            player_name: self.name.clone(),
            input_rate: self.input_rate,
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            max_decode_errors: self.max_decode_errors,
            reconciliation: ReconciliationConfig {
                position_threshold: self.reconcile_threshold,
                rotation_tolerance: self.rotation_tolerance,
                correction: if self.keep_velocity {
                    CorrectionPolicy::PositionAndRotation
                } else {
                    CorrectionPolicy::FullState
                },
                ..defaults.reconciliation.clone()
            },
            backoff: BackoffConfig {
                enabled: !self.no_reconnect,
                base_delay_ms: self.base_delay_ms,
                max_delay_ms: self.max_delay_ms,
                factor: self.backoff_factor,
                jitter_ms: self.jitter_ms,
                max_retries: self.max_retries,
            },
            ..defaults
        }
    }
}

/// Slow circles: full thrust with a gentle, periodically reversed yaw.
fn autopilot(elapsed: Duration) -> InputState {
    let phase = (elapsed.as_secs() / 4) % 2;
    InputState {
        thrust: 0.6,
        strafe_x: 0.0,
        strafe_y: 0.0,
        yaw: if phase == 0 { 0.3 } else { -0.3 },
        flight_assist: true,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = args.client_config();

    let mut client = match args.transport {
        TransportKind::Udp => {
            let port = args.port.unwrap_or(DEFAULT_UDP_PORT);
            let server: SocketAddr = tokio::net::lookup_host((args.server.as_str(), port))
                .await?
                .next()
                .with_context(|| format!("could not resolve {}", args.server))?;
            NetworkClient::udp(server, config)
        }
        TransportKind::Ws => {
            let port = args.port.unwrap_or(DEFAULT_BRIDGE_PORT);
            NetworkClient::websocket(format!("ws://{}:{}", args.server, port), config)
        }
    };
    client.start();

    let frame = Duration::from_secs_f64(1.0 / args.frame_rate.max(1) as f64);
    let mut frames = tokio::time::interval(frame);
    frames.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut report = tokio::time::interval(Duration::from_secs(2));

    let started = Instant::now();
    let deadline = args.duration_secs.map(|secs| started + Duration::from_secs(secs));
    let mut last_frame = Instant::now();
    let mut last_phase = client.status().phase;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted");
                break;
            }
            _ = report.tick() => {
                let state = client.predicted_state();
                log::info!(
                    "tick {:?} | pos ({:.2}, {:.2}) rot {:.2} | corrections {} | pending {}",
                    client.latest_tick(),
                    state.position.x,
                    state.position.y,
                    state.rotation,
                    client.prediction().correction_count(),
                    client.prediction().history_len()
                );
            }
            now = frames.tick() => {
                let dt = now.duration_since(last_frame).as_secs_f32();
                last_frame = now;
                client.update(dt, &autopilot(now.duration_since(started)));

                let status = client.status();
                if status.phase != last_phase {
                    last_phase = status.phase;
                    log::info!("Connection {:?} (attempts {})", status.phase, status.attempts);
                }
                if status.terminal && !status.connected {
                    match &status.last_error {
                        Some(error) => log::error!("Connection lost for good: {}", error),
                        None => log::info!("Connection closed"),
                    }
                    break;
                }
                if deadline.is_some_and(|deadline| now >= deadline) {
                    break;
                }
            }
        }
    }

    client.stop();
    // Give the transport a moment to flush the disconnect.
    tokio::time::sleep(Duration::from_millis(100)).await;
    Ok(())
}
