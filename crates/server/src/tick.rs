use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use flightline::{
    Cadence, FixedSchedule, Integrator, Packet, PacketError, PacketType, World, WorldSnapshot,
};

use crate::config::ServerConfig;
use crate::registry::ConnectionRegistry;
use crate::router::DatagramRouter;
use crate::simulation::{QueuedInput, apply_input};

#[derive(Debug, Clone)]
pub struct TickConfig {
    pub tick_rate: u32,
    pub snapshot_rate: u32,
    pub shutdown_grace: Duration,
}

impl From<&ServerConfig> for TickConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            tick_rate: config.tick_rate,
            snapshot_rate: config.snapshot_rate,
            shutdown_grace: config.shutdown_grace,
        }
    }
}

/// Encodes `snapshot` into as few packets as fit the size limit. Each packet
/// carries the full tick header and a disjoint run of entities.
pub fn encode_snapshot(snapshot: WorldSnapshot) -> Result<Vec<Vec<u8>>, PacketError> {
    let entity_count = snapshot.entities.len();
    match Packet::new(PacketType::WorldSnapshot(snapshot.clone())).serialize() {
        Ok(bytes) => Ok(vec![bytes]),
        Err(PacketError::TooLarge(_)) if entity_count > 1 => {
            let WorldSnapshot {
                tick,
                timestamp_ms,
                mut entities,
            } = snapshot;
            let tail = entities.split_off(entity_count / 2);
            let mut packets = encode_snapshot(WorldSnapshot {
                tick,
                timestamp_ms,
                entities,
            })?;
            packets.extend(encode_snapshot(WorldSnapshot {
                tick,
                timestamp_ms,
                entities: tail,
            })?);
            Ok(packets)
        }
        Err(e) => Err(e),
    }
}

/// State the simulation task works on.
pub struct TickContext {
    world: Arc<Mutex<World>>,
    registry: Arc<ConnectionRegistry>,
    router: DatagramRouter,
    integrator: Arc<dyn Integrator>,
    dt: f32,
}

impl TickContext {
    pub fn new(
        world: Arc<Mutex<World>>,
        registry: Arc<ConnectionRegistry>,
        router: DatagramRouter,
        integrator: Arc<dyn Integrator>,
        tick_rate: u32,
    ) -> Self {
        Self {
            world,
            registry,
            router,
            integrator,
            dt: 1.0 / tick_rate.max(1) as f32,
        }
    }

    /// Applies every queued input that is newer than its client's last
    /// processed sequence, then advances the world tick. Returns the number
    /// of inputs applied.
    pub fn step(&self, inputs: &mut mpsc::Receiver<QueuedInput>) -> usize {
        let mut fresh = Vec::new();
        while let Ok(queued) = inputs.try_recv() {
            if self
                .registry
                .mark_processed(queued.client_id, queued.input.sequence_number)
            {
                fresh.push(queued);
            } else {
                log::trace!(
                    "Skipping stale input {} from client {}",
                    queued.input.sequence_number,
                    queued.client_id
                );
            }
        }

        let mut world = self.world.lock();
        for queued in &fresh {
            if !apply_input(&mut world, self.integrator.as_ref(), queued, self.dt) {
                log::debug!(
                    "Input for missing entity {} from client {}",
                    queued.entity_id,
                    queued.client_id
                );
            }
        }
        world.advance_tick();
        fresh.len()
    }

    /// Sends the current world to every accepted connection. Returns the
    /// number of packets handed to a transport.
    pub fn broadcast(&self) -> usize {
        let recipients = self.registry.accepted();
        if recipients.is_empty() {
            return 0;
        }

        let owners = self.registry.owner_sequences();
        let snapshot = self.world.lock().snapshot(&owners);
        let tick = snapshot.tick;
        let packets = match encode_snapshot(snapshot) {
            Ok(packets) => packets,
            Err(e) => {
                log::error!("Failed to encode snapshot for tick {}: {}", tick, e);
                return 0;
            }
        };

        let mut sent = 0;
        for recipient in &recipients {
            for bytes in &packets {
                if self.router.send_to(recipient.addr, bytes) {
                    sent += 1;
                }
            }
        }
        sent
    }
}

struct Running {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<mpsc::Receiver<QueuedInput>>,
}

/// Authoritative fixed-rate loop: simulation steps at `tick_rate`, world
/// broadcasts at `snapshot_rate`, both from one task.
pub struct TickLoop {
    config: TickConfig,
    context: Arc<TickContext>,
    inputs: Mutex<Option<mpsc::Receiver<QueuedInput>>>,
    running: Mutex<Option<Running>>,
}

impl TickLoop {
    pub fn new(
        config: TickConfig,
        context: TickContext,
        inputs: mpsc::Receiver<QueuedInput>,
    ) -> Self {
        Self {
            config,
            context: Arc::new(context),
            inputs: Mutex::new(Some(inputs)),
            running: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Spawns the loop. Returns `false` if it is already running.
    pub fn start(&self) -> bool {
        let mut running = self.running.lock();
        if running.is_some() {
            return false;
        }
        let Some(inputs) = self.inputs.lock().take() else {
            log::error!("Tick loop has no input queue, not starting");
            return false;
        };

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run(
            Arc::clone(&self.context),
            self.config.clone(),
            inputs,
            shutdown_rx,
        ));
        *running = Some(Running { shutdown, task });
        true
    }

    /// Signals the loop and waits up to the grace period before aborting it.
    pub async fn stop(&self) {
        let Some(Running {
            shutdown,
            mut task,
        }) = self.running.lock().take()
        else {
            return;
        };

        let _ = shutdown.send(true);
        match tokio::time::timeout(self.config.shutdown_grace, &mut task).await {
            Ok(Ok(inputs)) => *self.inputs.lock() = Some(inputs),
            Ok(Err(e)) => log::error!("Tick loop task failed: {}", e),
            Err(_) => {
                log::warn!(
                    "Tick loop did not stop within {:?}, aborting",
                    self.config.shutdown_grace
                );
                task.abort();
            }
        }
    }
}

async fn run(
    context: Arc<TickContext>,
    config: TickConfig,
    mut inputs: mpsc::Receiver<QueuedInput>,
    mut shutdown: watch::Receiver<bool>,
) -> mpsc::Receiver<QueuedInput> {
    let start = Instant::now();
    let mut simulation = FixedSchedule::from_rate(config.tick_rate, start);
    let mut broadcast = FixedSchedule::from_rate(config.snapshot_rate, start);
    log::info!(
        "Tick loop running at {} Hz, snapshots at {} Hz",
        config.tick_rate,
        config.snapshot_rate
    );

    loop {
        let next = simulation.next_fire().min(broadcast.next_fire());
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(next)) => {}
        }

        if simulation.is_due(Instant::now()) {
            context.step(&mut inputs);
            if let Cadence::Behind { lag } = simulation.advance(Instant::now()) {
                log::warn!("Simulation running behind by {:?}", lag);
            }
        }
        if broadcast.is_due(Instant::now()) {
            context.broadcast();
            if let Cadence::Behind { lag } = broadcast.advance(Instant::now()) {
                log::warn!("Snapshot broadcast running behind by {:?}", lag);
            }
        }
    }

    log::info!("Tick loop stopped");
    inputs
}
