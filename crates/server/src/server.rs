use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use flightline::{
    EntityHandle, FlightModel, Integrator, MAX_PACKET_SIZE, PROTOCOL_VERSION, Packet, PacketError,
    PacketType, PlayerInput, World,
};

use crate::bridge::{BridgeError, Datagram, TransportBridge};
use crate::config::ServerConfig;
use crate::events::{DisconnectReason, ServerEvent};
use crate::registry::{ConnectionRecord, ConnectionRegistry, RegistryError};
use crate::router::DatagramRouter;
use crate::simulation::{QueuedInput, spawn_point};
use crate::tick::{TickConfig, TickContext, TickLoop};

const INBOUND_QUEUE: usize = 4096;
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind UDP socket on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

/// Shared by the receive path and the reaper.
struct PacketHandler {
    registry: Arc<ConnectionRegistry>,
    world: Arc<Mutex<World>>,
    router: DatagramRouter,
    inputs: mpsc::Sender<QueuedInput>,
    events: broadcast::Sender<ServerEvent>,
    max_decode_errors: u32,
}

impl PacketHandler {
    fn emit(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }

    fn send(&self, addr: SocketAddr, payload: PacketType) {
        let kind = payload.kind();
        match Packet::new(payload).serialize() {
            Ok(bytes) => {
                self.router.send_to(addr, &bytes);
            }
            Err(e) => {
                log::error!("Failed to encode {} for {}: {}", kind, addr, e);
                self.emit(ServerEvent::Error {
                    message: format!("failed to encode {} for {}: {}", kind, addr, e),
                });
            }
        }
    }

    fn despawn(&self, record: &ConnectionRecord) {
        if let Some(entity_id) = record.entity_id {
            self.world.lock().despawn(EntityHandle(entity_id));
        }
    }

    fn handle(&self, datagram: Datagram) {
        let addr = datagram.addr;
        let record = self.registry.resolve(addr);

        let packet = match Packet::deserialize(&datagram.bytes) {
            Ok(packet) => packet,
            Err(e) => {
                self.on_decode_error(&record, e);
                return;
            }
        };
        if record.decode_errors > 0 {
            self.registry.clear_decode_errors(&addr);
        }

        match packet.payload {
            PacketType::ConnectionRequest {
                player_name,
                version,
            } => self.on_connection_request(&record, &player_name, version),
            PacketType::PlayerInput(input) => self.on_input(addr, input),
            PacketType::Disconnect { .. } => self.on_disconnect(addr),
            other => log::warn!("Dropping {} sent by client {}", other.kind(), addr),
        }
    }

    fn on_decode_error(&self, record: &ConnectionRecord, error: PacketError) {
        let count = self.registry.record_decode_error(&record.addr);
        log::warn!(
            "Undecodable datagram from {} ({}/{}): {}",
            record.addr,
            count,
            self.max_decode_errors,
            error
        );
        if count < self.max_decode_errors || !record.accepted {
            return;
        }

        if let Some(revoked) = self.registry.revoke(&record.addr) {
            self.despawn(&revoked);
            self.send(
                record.addr,
                PacketType::Disconnect {
                    client_id: revoked.client_id,
                    reason: "too many malformed packets".to_string(),
                },
            );
            log::warn!("Client {} dropped for protocol violations", revoked.client_id);
            self.emit(ServerEvent::ClientDisconnected {
                client_id: revoked.client_id,
                reason: DisconnectReason::ProtocolViolation,
            });
        }
    }

    fn on_connection_request(&self, record: &ConnectionRecord, player_name: &str, version: u32) {
        let addr = record.addr;
        if !record.accepted {
            self.emit(ServerEvent::ClientConnecting { addr });
        }

        if version != PROTOCOL_VERSION {
            self.deny(
                record,
                format!("protocol version {} unsupported, expected {}", version, PROTOCOL_VERSION),
            );
            return;
        }

        let world = &self.world;
        let accepted = self.registry.accept(addr, player_name, |client_id| {
            world.lock().spawn_ship(spawn_point(client_id)).id()
        });

        match accepted {
            Ok(accepted) => {
                let Some(entity_id) = accepted.entity_id else {
                    log::error!("Client {} accepted without an entity", accepted.client_id);
                    return;
                };
                let server_time_ms = self.world.lock().server_time_ms();
                self.send(
                    addr,
                    PacketType::ConnectionAccepted {
                        client_id: accepted.client_id,
                        entity_id,
                        server_time_ms,
                    },
                );
                if !record.accepted {
                    log::info!(
                        "Client {} ({}) connected from {} with entity {}",
                        accepted.client_id,
                        accepted.player_name,
                        addr,
                        entity_id
                    );
                    self.emit(ServerEvent::ClientConnected {
                        client_id: accepted.client_id,
                        addr,
                        entity_id,
                    });
                }
            }
            Err(RegistryError::Full(max)) => {
                self.deny(record, format!("server full ({} clients)", max));
            }
            Err(e) => log::warn!("Could not accept {}: {}", addr, e),
        }
    }

    fn deny(&self, record: &ConnectionRecord, reason: String) {
        log::info!("Denied connection from {}: {}", record.addr, reason);
        self.send(
            record.addr,
            PacketType::Disconnect {
                client_id: record.client_id,
                reason: reason.clone(),
            },
        );
        self.emit(ServerEvent::ConnectionDenied {
            addr: record.addr,
            reason,
        });
    }

    fn on_input(&self, addr: SocketAddr, input: PlayerInput) {
        let record = match self.registry.authorize_input(&addr, input.client_id) {
            Ok(record) => record,
            Err(e) => {
                log::debug!("Dropping input {}: {}", input.sequence_number, e);
                return;
            }
        };
        let Some(entity_id) = record.entity_id else {
            return;
        };

        let queued = QueuedInput {
            client_id: record.client_id,
            entity_id,
            input,
        };
        if let Err(e) = self.inputs.try_send(queued) {
            log::warn!("Input queue rejected input from client {}: {}", record.client_id, e);
        }
    }

    fn on_disconnect(&self, addr: SocketAddr) {
        if let Some(record) = self.registry.remove(&addr) {
            self.despawn(&record);
            log::info!("Client {} disconnected", record.client_id);
            self.emit(ServerEvent::ClientDisconnected {
                client_id: record.client_id,
                reason: DisconnectReason::Graceful,
            });
        }
    }

    fn reap(&self, timeout: Duration) {
        for record in self.registry.evict_stale(timeout) {
            self.despawn(&record);
            if record.accepted {
                log::info!("Client {} timed out", record.client_id);
                self.emit(ServerEvent::ClientDisconnected {
                    client_id: record.client_id,
                    reason: DisconnectReason::Timeout,
                });
            } else {
                log::debug!("Forgot idle peer {}", record.addr);
            }
        }
    }

    fn kick(&self, client_id: u32, reason: DisconnectReason) -> bool {
        let Some(record) = self.registry.remove_id(client_id) else {
            return false;
        };
        self.send(
            record.addr,
            PacketType::Disconnect {
                client_id,
                reason: reason.as_str().to_string(),
            },
        );
        self.despawn(&record);
        self.emit(ServerEvent::ClientDisconnected { client_id, reason });
        true
    }
}

/// Authoritative game server: UDP plus an optional WebSocket bridge feeding
/// one packet handler, a fixed-rate tick loop and a stale-connection reaper.
pub struct GameServer {
    config: ServerConfig,
    local_addr: SocketAddr,
    bridge: Option<Arc<TransportBridge>>,
    handler: Arc<PacketHandler>,
    tick_loop: TickLoop,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl GameServer {
    pub async fn start(config: ServerConfig) -> Result<Self, ServerError> {
        Self::start_with_integrator(config, Arc::new(FlightModel::default())).await
    }

    pub async fn start_with_integrator(
        config: ServerConfig,
        integrator: Arc<dyn Integrator>,
    ) -> Result<Self, ServerError> {
        let bind_error = |source| ServerError::Bind {
            addr: config.udp_addr,
            source,
        };
        let socket = Arc::new(UdpSocket::bind(config.udp_addr).await.map_err(bind_error)?);
        let local_addr = socket.local_addr().map_err(bind_error)?;

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let bridge = match &config.bridge {
            Some(bridge_config) => Some(Arc::new(
                TransportBridge::bind(bridge_config, inbound_tx.clone()).await?,
            )),
            None => None,
        };

        let registry = Arc::new(ConnectionRegistry::new(config.max_clients));
        let world = Arc::new(Mutex::new(World::new()));
        let router = DatagramRouter::new(
            Arc::clone(&socket),
            bridge.clone(),
            config.packet_loss.clone(),
        );

        let (input_tx, input_rx) = mpsc::channel(config.input_queue.max(1));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let handler = Arc::new(PacketHandler {
            registry: Arc::clone(&registry),
            world: Arc::clone(&world),
            router: router.clone(),
            inputs: input_tx,
            events,
            max_decode_errors: config.max_decode_errors.max(1),
        });

        let tick_loop = TickLoop::new(
            TickConfig::from(&config),
            TickContext::new(world, registry, router, integrator, config.tick_rate),
            input_rx,
        );

        let (shutdown, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(receive_loop(socket, inbound_tx, shutdown_rx.clone())),
            tokio::spawn(handle_loop(
                Arc::clone(&handler),
                inbound_rx,
                shutdown_rx.clone(),
            )),
            tokio::spawn(reap_loop(
                Arc::clone(&handler),
                config.reap_interval,
                config.connection_timeout,
                shutdown_rx,
            )),
        ];
        tick_loop.start();

        log::info!("Server listening on udp://{}", local_addr);
        Ok(Self {
            config,
            local_addr,
            bridge,
            handler,
            tick_loop,
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn bridge_addr(&self) -> Option<SocketAddr> {
        self.bridge.as_ref().map(|b| b.local_addr())
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.handler.registry
    }

    pub fn world(&self) -> &Arc<Mutex<World>> {
        &self.handler.world
    }

    pub fn tick(&self) -> u64 {
        self.handler.world.lock().tick()
    }

    pub fn client_count(&self) -> usize {
        self.handler.registry.accepted_count()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.handler.events.subscribe()
    }

    pub fn kick(&self, client_id: u32) -> bool {
        self.handler.kick(client_id, DisconnectReason::Kicked)
    }

    /// Says goodbye to every client and stops all tasks, waiting up to
    /// `grace` for each stage before aborting.
    pub async fn shutdown(&self, grace: Duration) {
        for record in self.handler.registry.accepted() {
            self.handler.kick(record.client_id, DisconnectReason::Shutdown);
        }

        self.tick_loop.stop().await;
        if let Some(bridge) = &self.bridge {
            bridge.shutdown(grace).await;
        }

        let _ = self.shutdown.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for mut task in tasks {
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                task.abort();
            }
        }
        log::info!("Server on {} shut down", self.local_addr);
    }
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    inbound: mpsc::Sender<Datagram>,
    mut shutdown: watch::Receiver<bool>,
) {
    // One byte past the limit so oversized datagrams are caught, not truncated.
    let mut buffer = vec![0u8; MAX_PACKET_SIZE + 1];
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            received = socket.recv_from(&mut buffer) => match received {
                Ok((len, addr)) => {
                    let datagram = Datagram {
                        addr,
                        bytes: buffer[..len].to_vec(),
                    };
                    if inbound.send(datagram).await.is_err() {
                        break;
                    }
                }
                Err(e) => log::debug!("UDP receive failed: {}", e),
            },
        }
    }
}

async fn handle_loop(
    handler: Arc<PacketHandler>,
    mut inbound: mpsc::Receiver<Datagram>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            datagram = inbound.recv() => match datagram {
                Some(datagram) => handler.handle(datagram),
                None => break,
            },
        }
    }
}

async fn reap_loop(
    handler: Arc<PacketHandler>,
    every: Duration,
    timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(every.max(Duration::from_millis(10)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => handler.reap(timeout),
        }
    }
}
