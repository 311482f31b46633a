use std::net::SocketAddr;
use std::time::Instant;

use tokio::sync::mpsc;

use flightline::{EntityState, FixedTimestep, PacketType, WorldSnapshot};

use super::config::ClientConfig;
use super::input::InputState;
use super::link::{Connector, SessionInfo, UdpConnector, WsConnector};
use super::prediction::PredictionEngine;
use super::transport::{ConnectionStatus, TransportEvent, TransportHandle, TransportLayer};

/// Frame-loop facing side of the network stack. `update` is called once per
/// frame and never waits on the network.
pub struct NetworkClient {
    transport: TransportHandle,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    status: ConnectionStatus,
    prediction: PredictionEngine,
    input_clock: FixedTimestep,
    next_sequence: u32,
    session: Option<SessionInfo>,
    latest_tick: Option<u64>,
    synced: bool,
    started_at: Instant,
}

impl NetworkClient {
    /// Spawns the transport actor, so this must run inside a Tokio runtime.
    pub fn new<C: Connector>(connector: C, config: ClientConfig) -> Self {
        let prediction = PredictionEngine::new(config.reconciliation.clone());
        let input_clock = FixedTimestep::new(config.input_rate);
        let (transport, events) = TransportLayer::spawn(connector, config);

        Self {
            transport,
            events,
            status: ConnectionStatus::idle(),
            prediction,
            input_clock,
            next_sequence: 1,
            session: None,
            latest_tick: None,
            synced: false,
            started_at: Instant::now(),
        }
    }

    pub fn udp(server: SocketAddr, config: ClientConfig) -> Self {
        Self::new(UdpConnector::new(server), config)
    }

    pub fn websocket(url: impl Into<String>, config: ClientConfig) -> Self {
        Self::new(WsConnector::new(url), config)
    }

    pub fn start(&self) {
        self.transport.start();
    }

    pub fn stop(&self) {
        self.transport.stop();
    }

    pub fn update(&mut self, frame_dt: f32, input: &InputState) {
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event);
        }

        if self.session.is_none() {
            return;
        }

        self.input_clock.accumulate(frame_dt);
        let dt = self.input_clock.dt();
        while self.input_clock.consume_tick() {
            let timestamp_ms = self.started_at.elapsed().as_millis() as u64;
            let sample = input.to_sample(self.next_sequence, timestamp_ms, dt);
            self.next_sequence += 1;

            self.prediction.apply_input(sample, dt);
            self.transport.send_input(sample);
        }
    }

    pub(crate) fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Status(status) => {
                if !status.connected {
                    self.session = None;
                }
                self.status = status;
            }
            TransportEvent::Message(PacketType::ConnectionAccepted {
                client_id,
                entity_id,
                server_time_ms,
            }) => {
                self.session = Some(SessionInfo {
                    client_id,
                    entity_id,
                    server_time_ms,
                });
                self.prediction.reset(EntityState::default());
                self.input_clock.reset();
                self.next_sequence = 1;
                self.latest_tick = None;
                self.synced = false;
            }
            TransportEvent::Message(PacketType::WorldSnapshot(snapshot)) => {
                self.on_snapshot(snapshot);
            }
            TransportEvent::Message(other) => {
                log::debug!("Ignoring unexpected {} from server", other.kind());
            }
        }
    }

    fn on_snapshot(&mut self, snapshot: WorldSnapshot) {
        let Some(session) = self.session else {
            return;
        };
        // Large worlds arrive as several packets sharing one tick.
        if self.latest_tick.is_some_and(|tick| snapshot.tick < tick) {
            log::debug!("Dropping stale snapshot for tick {}", snapshot.tick);
            return;
        }
        self.latest_tick = Some(snapshot.tick);

        let Some(entity) = snapshot.entity(session.entity_id) else {
            return;
        };
        let Some(server_state) = EntityState::from_snapshot(entity) else {
            return;
        };

        let dt = self.input_clock.dt();
        if self.synced {
            self.prediction
                .reconcile(server_state, entity.last_processed_sequence, dt);
        } else {
            self.prediction
                .rebase(server_state, entity.last_processed_sequence, dt);
            self.synced = true;
        }
    }

    pub fn status(&self) -> &ConnectionStatus {
        &self.status
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    pub fn predicted_state(&self) -> EntityState {
        self.prediction.state()
    }

    pub fn prediction(&self) -> &PredictionEngine {
        &self.prediction
    }

    pub fn client_id(&self) -> Option<u32> {
        self.session.map(|s| s.client_id)
    }

    pub fn entity_id(&self) -> Option<u32> {
        self.session.map(|s| s.entity_id)
    }

    pub fn latest_tick(&self) -> Option<u64> {
        self.latest_tick
    }

    pub fn next_sequence(&self) -> u32 {
        self.next_sequence
    }
}

impl Drop for NetworkClient {
    fn drop(&mut self) {
        self.transport.stop();
    }
}
