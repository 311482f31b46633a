use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;

use flightline::{DEFAULT_BRIDGE_PORT, DEFAULT_SNAPSHOT_RATE, DEFAULT_TICK_RATE, DEFAULT_UDP_PORT};
use flightline_server::{
    BridgeConfig, GameServer, PacketLossSimulation, ServerConfig, ServerEvent,
};

#[derive(Parser)]
#[command(name = "flightline-server")]
#[command(about = "Authoritative flightline server")]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: IpAddr,

    #[arg(short, long, default_value_t = DEFAULT_UDP_PORT)]
    port: u16,

    #[arg(long, default_value_t = DEFAULT_BRIDGE_PORT, help = "WebSocket bridge port")]
    bridge_port: u16,

    #[arg(long, help = "Serve UDP only")]
    no_bridge: bool,

    #[arg(short, long, default_value_t = DEFAULT_TICK_RATE)]
    tick_rate: u32,

    #[arg(long, default_value_t = DEFAULT_SNAPSHOT_RATE)]
    snapshot_rate: u32,

    #[arg(short, long, default_value_t = 32)]
    max_clients: usize,

    #[arg(long, default_value_t = 10)]
    connection_timeout_secs: u64,

    #[arg(long, default_value_t = 10_000, help = "First port handed to bridged clients")]
    virtual_base_port: u16,

    #[arg(long, default_value_t = 16)]
    max_decode_errors: u32,

    #[arg(long, default_value_t = 1024, help = "Inputs buffered between ticks")]
    input_queue: usize,

    #[arg(long, help = "Enable outbound packet loss simulation")]
    simulate_packet_loss: bool,

    #[arg(long, default_value_t = 0.0, help = "Packet loss percentage (0-100)")]
    loss_percent: f32,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        let bridge = (!self.no_bridge).then(|| BridgeConfig {
            bind_addr: SocketAddr::new(self.bind, self.bridge_port),
            virtual_base_port: self.virtual_base_port,
            ..Default::default()
        });
        let packet_loss = self.simulate_packet_loss.then(|| PacketLossSimulation {
            enabled: true,
            loss_percent: self.loss_percent,
        });

        ServerConfig {
            udp_addr: SocketAddr::new(self.bind, self.port),
            bridge,
            tick_rate: self.tick_rate,
            snapshot_rate: self.snapshot_rate,
            max_clients: self.max_clients,
            connection_timeout: Duration::from_secs(self.connection_timeout_secs),
            max_decode_errors: self.max_decode_errors,
            input_queue: self.input_queue,
            packet_loss,
            ..Default::default()
        }
    }
}

fn log_event(event: &ServerEvent) {
    match event {
        ServerEvent::ClientConnecting { addr } => {
            log::debug!("Connection request from {}", addr);
        }
        ServerEvent::ClientConnected {
            client_id,
            addr,
            entity_id,
        } => {
            log::info!(
                "Client {} connected from {} (entity {})",
                client_id,
                addr,
                entity_id
            );
        }
        ServerEvent::ClientDisconnected { client_id, reason } => {
            log::info!("Client {} {}", client_id, reason.as_str());
        }
        ServerEvent::ConnectionDenied { addr, reason } => {
            log::warn!("Connection denied to {}: {}", addr, reason);
        }
        ServerEvent::Error { message } => {
            log::error!("{}", message);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = args.server_config();
    let grace = config.shutdown_grace;

    let server = GameServer::start(config).await?;
    if let Some(bridge) = server.bridge_addr() {
        log::info!("WebSocket clients: ws://{}", bridge);
    }

    let mut events = server.subscribe();
    let event_log = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(missed)) => log::warn!("Missed {} server events", missed),
                Err(RecvError::Closed) => break,
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    log::info!("Server shutting down");
    server.shutdown(grace).await;
    drop(server);
    event_log.abort();

    Ok(())
}
