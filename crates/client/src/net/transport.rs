use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, sleep_until, timeout_at};

use flightline::{InputSample, Packet, PacketType};

use super::backoff::{Backoff, RetryDecision};
use super::config::ClientConfig;
use super::link::{Connector, Link, SessionInfo, TransportError, handshake};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Idle,
    Connecting,
    Connected,
    Disconnected,
}

/// Snapshot of the transport state machine, emitted on every transition.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStatus {
    pub phase: ConnectionPhase,
    pub connected: bool,
    pub connecting: bool,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub changed_at_ms: u64,
    /// Delay until the scheduled reconnect, if one is pending.
    pub next_retry_ms: Option<u64>,
    /// No reconnect will happen until `start()` is called again.
    pub terminal: bool,
}

impl ConnectionStatus {
    pub fn idle() -> Self {
        Self {
            phase: ConnectionPhase::Idle,
            connected: false,
            connecting: false,
            attempts: 0,
            last_error: None,
            changed_at_ms: unix_millis(),
            next_retry_ms: None,
            terminal: false,
        }
    }
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    Status(ConnectionStatus),
    /// Server message, in arrival order. Acceptance is delivered as
    /// `PacketType::ConnectionAccepted` right after the `Connected` status.
    Message(PacketType),
}

enum Command {
    Start,
    Stop,
    Send(InputSample),
}

enum LinkEvent {
    Inbound { generation: u64, payload: PacketType },
    Down { generation: u64, error: TransportError },
}

/// Cheap, cloneable front end of the transport actor. Never blocks.
#[derive(Clone)]
pub struct TransportHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl TransportHandle {
    pub fn start(&self) {
        let _ = self.commands.send(Command::Start);
    }

    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
    }

    /// Dropped unless the transport is connected.
    pub fn send_input(&self, sample: InputSample) {
        let _ = self.commands.send(Command::Send(sample));
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }
}

struct Session {
    info: SessionInfo,
    generation: u64,
    outbound: mpsc::Sender<Vec<u8>>,
}

type AttemptResult<L> = Result<(L, SessionInfo), TransportError>;

/// Owns one logical connection to the server: connect, handshake, pump
/// traffic and reconnect with backoff after faults.
pub struct TransportLayer<C: Connector> {
    connector: Arc<C>,
    config: ClientConfig,
    backoff: Backoff,
    rng: StdRng,
    events: mpsc::UnboundedSender<TransportEvent>,
    status: ConnectionStatus,
    attempt: Option<JoinHandle<AttemptResult<C::Link>>>,
    retry_at: Option<Instant>,
    session: Option<Session>,
    generation: u64,
    link_tx: mpsc::UnboundedSender<LinkEvent>,
    link_rx: mpsc::UnboundedReceiver<LinkEvent>,
}

impl<C: Connector> TransportLayer<C> {
    /// Spawns the actor on the current runtime. The actor stays idle until
    /// `start()` and exits once every handle is dropped.
    pub fn spawn(
        connector: C,
        config: ClientConfig,
    ) -> (TransportHandle, mpsc::UnboundedReceiver<TransportEvent>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (link_tx, link_rx) = mpsc::unbounded_channel();

        let layer = Self {
            connector: Arc::new(connector),
            backoff: Backoff::new(config.backoff.clone()),
            config,
            rng: StdRng::from_entropy(),
            events: events_tx,
            status: ConnectionStatus::idle(),
            attempt: None,
            retry_at: None,
            session: None,
            generation: 0,
            link_tx,
            link_rx,
        };
        tokio::spawn(layer.run(commands_rx));

        (
            TransportHandle {
                commands: commands_tx,
            },
            events_rx,
        )
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let retry_at = self.retry_at;
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        self.stop();
                        break;
                    }
                },
                result = wait_attempt(&mut self.attempt) => self.on_attempt_finished(result),
                _ = sleep_until_some(retry_at) => {
                    self.retry_at = None;
                    self.begin_attempt();
                }
                Some(event) = self.link_rx.recv() => self.on_link_event(event),
            }
        }
        log::debug!("Transport for {} stopped", self.connector.describe());
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start => self.start(),
            Command::Stop => self.stop(),
            Command::Send(sample) => self.send_input(sample),
        }
    }

    fn start(&mut self) {
        match self.status.phase {
            ConnectionPhase::Connected => log::debug!("start() while connected, ignoring"),
            _ => {
                self.backoff.reset();
                self.status.last_error = None;
                self.begin_attempt();
            }
        }
    }

    fn stop(&mut self) {
        let already_stopped = self.status.terminal
            || (self.status.phase == ConnectionPhase::Idle
                && self.attempt.is_none()
                && self.retry_at.is_none());

        self.cancel_pending();
        if let Some(session) = self.session.take() {
            let goodbye = Packet::new(PacketType::Disconnect {
                client_id: session.info.client_id,
                reason: "client disconnect".to_string(),
            });
            match goodbye.serialize() {
                // Dropping the sender lets the pump flush this and close the link.
                Ok(bytes) => {
                    let _ = session.outbound.try_send(bytes);
                }
                Err(e) => log::warn!("Failed to encode disconnect: {}", e),
            }
        }

        if !already_stopped {
            log::info!("Disconnected from {}", self.connector.describe());
            self.status.terminal = true;
            self.transition(ConnectionPhase::Disconnected);
        }
    }

    fn send_input(&mut self, sample: InputSample) {
        let Some(session) = self.session.as_ref() else {
            log::trace!("Not connected, dropping input {}", sample.sequence);
            return;
        };
        let packet = Packet::new(PacketType::PlayerInput(
            sample.to_wire(session.info.client_id),
        ));
        match packet.serialize() {
            Ok(bytes) => {
                if session.outbound.try_send(bytes).is_err() {
                    log::debug!("Outbound queue full, dropping input {}", sample.sequence);
                }
            }
            Err(e) => log::warn!("Failed to encode input {}: {}", sample.sequence, e),
        }
    }

    fn cancel_pending(&mut self) {
        self.retry_at = None;
        if let Some(attempt) = self.attempt.take() {
            attempt.abort();
        }
    }

    fn begin_attempt(&mut self) {
        self.cancel_pending();
        self.status.terminal = false;

        let connector = Arc::clone(&self.connector);
        let player_name = self.config.player_name.clone();
        let timeout = self.config.handshake_timeout;
        self.attempt = Some(tokio::spawn(async move {
            let mut link = connector.open().await?;
            let info = handshake(&mut link, &player_name, timeout).await?;
            Ok::<_, TransportError>((link, info))
        }));

        log::info!(
            "Connecting to {} (attempt {})",
            self.connector.describe(),
            self.backoff.attempts() + 1
        );
        self.transition(ConnectionPhase::Connecting);
    }

    fn on_attempt_finished(&mut self, result: Result<AttemptResult<C::Link>, JoinError>) {
        match result {
            Ok(Ok((link, info))) => self.on_connected(link, info),
            Ok(Err(error)) => self.on_failure(error),
            Err(e) if e.is_cancelled() => {}
            Err(e) => self.on_failure(TransportError::TaskFailed(e.to_string())),
        }
    }

    fn on_connected(&mut self, link: C::Link, info: SessionInfo) {
        self.generation += 1;
        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.outbound_queue.max(1));
        tokio::spawn(pump(
            link,
            outbound_rx,
            self.link_tx.clone(),
            self.generation,
            self.config.connection_timeout,
            self.config.max_decode_errors.max(1),
        ));
        self.session = Some(Session {
            info,
            generation: self.generation,
            outbound: outbound_tx,
        });

        self.backoff.reset();
        self.status.last_error = None;
        log::info!(
            "Connected to {} as client {} (entity {})",
            self.connector.describe(),
            info.client_id,
            info.entity_id
        );
        self.transition(ConnectionPhase::Connected);
        let _ = self
            .events
            .send(TransportEvent::Message(PacketType::ConnectionAccepted {
                client_id: info.client_id,
                entity_id: info.entity_id,
                server_time_ms: info.server_time_ms,
            }));
    }

    fn on_link_event(&mut self, event: LinkEvent) {
        let current = self.session.as_ref().map(|s| s.generation);
        match event {
            LinkEvent::Inbound {
                generation,
                payload,
            } if Some(generation) == current => {
                let _ = self.events.send(TransportEvent::Message(payload));
            }
            LinkEvent::Down { generation, error } if Some(generation) == current => {
                self.session = None;
                self.on_failure(error);
            }
            _ => log::trace!("Dropping event from a closed link"),
        }
    }

    fn on_failure(&mut self, error: TransportError) {
        log::warn!("Connection to {} failed: {}", self.connector.describe(), error);
        self.status.last_error = Some(error.to_string());

        match self.backoff.on_failure(&mut self.rng) {
            RetryDecision::Retry(delay) => {
                log::info!("Reconnecting in {:?}", delay);
                self.retry_at = Some(Instant::now() + delay);
            }
            RetryDecision::GiveUp => {
                log::error!(
                    "Giving up on {} after {} attempts",
                    self.connector.describe(),
                    self.backoff.attempts()
                );
                self.status.terminal = true;
            }
        }
        self.transition(ConnectionPhase::Disconnected);
    }

    fn transition(&mut self, phase: ConnectionPhase) {
        let now = Instant::now();
        self.status.phase = phase;
        self.status.connected = phase == ConnectionPhase::Connected;
        self.status.connecting = phase == ConnectionPhase::Connecting;
        self.status.attempts = self.backoff.attempts();
        self.status.changed_at_ms = unix_millis();
        self.status.next_retry_ms = self
            .retry_at
            .map(|at| at.saturating_duration_since(now).as_millis() as u64);
        let _ = self.events.send(TransportEvent::Status(self.status.clone()));
    }
}

async fn wait_attempt<T>(attempt: &mut Option<JoinHandle<T>>) -> Result<T, JoinError> {
    match attempt.as_mut() {
        Some(handle) => {
            let result = handle.await;
            *attempt = None;
            result
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Moves bytes between one live link and the actor until either side stops.
async fn pump<L: Link>(
    mut link: L,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    events: mpsc::UnboundedSender<LinkEvent>,
    generation: u64,
    idle_timeout: Duration,
    max_decode_errors: u32,
) {
    let mut last_received = Instant::now();
    let mut decode_errors = 0u32;

    let failure = loop {
        tokio::select! {
            bytes = outbound.recv() => match bytes {
                Some(bytes) => {
                    if let Err(e) = link.send(bytes).await {
                        break Some(e);
                    }
                }
                None => break None,
            },
            received = timeout_at(last_received + idle_timeout, link.recv()) => match received {
                Err(_) => break Some(TransportError::Idle(idle_timeout)),
                Ok(Err(e)) => break Some(e),
                Ok(Ok(None)) => break Some(TransportError::Closed),
                Ok(Ok(Some(bytes))) => {
                    last_received = Instant::now();
                    match Packet::deserialize(&bytes) {
                        Ok(packet) => {
                            decode_errors = 0;
                            match packet.payload {
                                PacketType::Disconnect { reason, .. } => {
                                    break Some(TransportError::ServerDisconnect(reason));
                                }
                                payload => {
                                    let _ = events.send(LinkEvent::Inbound { generation, payload });
                                }
                            }
                        }
                        Err(e) => {
                            decode_errors += 1;
                            log::warn!(
                                "Dropping undecodable packet ({}/{}): {}",
                                decode_errors,
                                max_decode_errors,
                                e
                            );
                            if decode_errors >= max_decode_errors {
                                break Some(TransportError::TooManyDecodeErrors(decode_errors));
                            }
                        }
                    }
                }
            },
        }
    };

    link.close().await;
    if let Some(error) = failure {
        let _ = events.send(LinkEvent::Down { generation, error });
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
