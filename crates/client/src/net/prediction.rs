use std::collections::VecDeque;

use flightline::{EntityState, FlightModel, InputSample, Integrator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CorrectionPolicy {
    /// Snap position and rotation; keep the locally predicted velocities.
    PositionAndRotation,
    /// Snap every field of the authoritative state, velocities included.
    #[default]
    FullState,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconciliationConfig {
    /// Positional error in meters above which a correction happens.
    pub position_threshold: f32,
    /// Rotational error in radians above which a correction happens.
    pub rotation_tolerance: f32,
    pub correction: CorrectionPolicy,
    pub history_capacity: usize,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            position_threshold: 0.05,
            rotation_tolerance: 0.001,
            correction: CorrectionPolicy::FullState,
            history_capacity: 128,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingInput {
    sample: InputSample,
    dt: f32,
    state_before: EntityState,
}

/// Record of the last snap-and-replay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correction {
    pub acked_sequence: u32,
    pub position_error: f32,
    pub rotation_error: f32,
    pub replayed: usize,
}

/// Client-side prediction of the locally controlled entity.
///
/// Inputs are applied immediately and kept until the server acknowledges
/// them. When an authoritative state disagrees with the prediction by more
/// than the configured thresholds, the engine snaps to it and replays the
/// unacknowledged inputs through the same integrator the server uses.
pub struct PredictionEngine<I: Integrator = FlightModel> {
    config: ReconciliationConfig,
    integrator: I,
    state: EntityState,
    history: VecDeque<PendingInput>,
    last_sequence: Option<u32>,
    correction_count: u64,
    last_correction: Option<Correction>,
}

impl PredictionEngine<FlightModel> {
    pub fn new(config: ReconciliationConfig) -> Self {
        Self::with_integrator(config, FlightModel::default(), EntityState::default())
    }
}

impl<I: Integrator> PredictionEngine<I> {
    pub fn with_integrator(config: ReconciliationConfig, integrator: I, state: EntityState) -> Self {
        let capacity = config.history_capacity.max(1);
        Self {
            config,
            integrator,
            state,
            history: VecDeque::with_capacity(capacity),
            last_sequence: None,
            correction_count: 0,
            last_correction: None,
        }
    }

    pub fn config(&self) -> &ReconciliationConfig {
        &self.config
    }

    pub fn state(&self) -> EntityState {
        self.state
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn history_sequences(&self) -> Vec<u32> {
        self.history.iter().map(|p| p.sample.sequence).collect()
    }

    pub fn correction_count(&self) -> u64 {
        self.correction_count
    }

    pub fn last_correction(&self) -> Option<Correction> {
        self.last_correction
    }

    /// Clears history and counters and starts predicting from `state`.
    pub fn reset(&mut self, state: EntityState) {
        self.state = state;
        self.history.clear();
        self.last_sequence = None;
        self.correction_count = 0;
        self.last_correction = None;
    }

    pub fn apply_input(&mut self, sample: InputSample, dt: f32) {
        if let Some(last) = self.last_sequence {
            if sample.sequence <= last {
                log::warn!(
                    "Ignoring input {} (last applied {})",
                    sample.sequence,
                    last
                );
                return;
            }
        }

        let state_before = self.state;
        self.integrator
            .integrate(&mut self.state, &sample.control, sample.flight_assist, dt);
        self.history.push_back(PendingInput {
            sample,
            dt,
            state_before,
        });
        self.last_sequence = Some(sample.sequence);

        let capacity = self.config.history_capacity.max(1);
        while self.history.len() > capacity {
            if let Some(dropped) = self.history.pop_front() {
                log::debug!(
                    "Input history full, dropping sequence {}",
                    dropped.sample.sequence
                );
            }
        }
    }

    /// Folds an authoritative state into the prediction and returns the
    /// result. `dt` stands in for any pending entry recorded without a step.
    pub fn reconcile(
        &mut self,
        server_state: EntityState,
        last_processed_sequence: u32,
        dt: f32,
    ) -> EntityState {
        self.acknowledge(last_processed_sequence);

        let position_error = self.state.position_error(&server_state);
        let rotation_error = self.state.rotation_error(&server_state);
        if position_error > self.config.position_threshold
            || rotation_error > self.config.rotation_tolerance
        {
            self.correct(
                server_state,
                last_processed_sequence,
                position_error,
                rotation_error,
                dt,
            );
        }
        self.state
    }

    /// Unconditionally snaps to `server_state` and replays pending inputs.
    /// Used when the first authoritative state arrives.
    pub fn rebase(&mut self, server_state: EntityState, last_processed_sequence: u32, dt: f32) {
        self.acknowledge(last_processed_sequence);
        let position_error = self.state.position_error(&server_state);
        let rotation_error = self.state.rotation_error(&server_state);
        self.correct(
            server_state,
            last_processed_sequence,
            position_error,
            rotation_error,
            dt,
        );
    }

    fn acknowledge(&mut self, last_processed_sequence: u32) {
        while self
            .history
            .front()
            .is_some_and(|p| p.sample.sequence <= last_processed_sequence)
        {
            self.history.pop_front();
        }
    }

    fn correct(
        &mut self,
        server_state: EntityState,
        acked_sequence: u32,
        position_error: f32,
        rotation_error: f32,
        fallback_dt: f32,
    ) {
        let mut state = match self.config.correction {
            CorrectionPolicy::FullState => server_state,
            CorrectionPolicy::PositionAndRotation => {
                // Velocities come from the prediction at the acknowledged point,
                // not from the drifted head, so repeated corrections agree.
                let base = self
                    .history
                    .front()
                    .map(|p| p.state_before)
                    .unwrap_or(self.state);
                EntityState {
                    position: server_state.position,
                    rotation: server_state.rotation,
                    velocity: base.velocity,
                    angular_velocity: base.angular_velocity,
                }
            }
        };

        for pending in self.history.iter_mut() {
            pending.state_before = state;
            let step = if pending.dt > 0.0 { pending.dt } else { fallback_dt };
            self.integrator.integrate(
                &mut state,
                &pending.sample.control,
                pending.sample.flight_assist,
                step,
            );
        }

        let correction = Correction {
            acked_sequence,
            position_error,
            rotation_error,
            replayed: self.history.len(),
        };
        log::warn!(
            "Prediction corrected at sequence {}: position error {:.4} m, rotation error {:.4} rad, replayed {}",
            correction.acked_sequence,
            correction.position_error,
            correction.rotation_error,
            correction.replayed
        );

        self.state = state;
        self.correction_count += 1;
        self.last_correction = Some(correction);
    }
}

#[cfg(test)]
mod tests {
    use flightline::ControlState;
    use glam::Vec2;

    use super::*;

    fn sample(sequence: u32, control: ControlState, dt: f32) -> InputSample {
        InputSample::new(sequence, 0, control, false, dt)
    }

    fn engine(position_threshold: f32) -> PredictionEngine {
        PredictionEngine::new(ReconciliationConfig {
            position_threshold,
            ..Default::default()
        })
    }

    #[test]
    fn test_small_threshold_corrects_and_replays() {
        let mut engine = engine(0.0001);
        let thrust = ControlState::new(0.1, 0.0, 0.0, 0.0);

        engine.apply_input(sample(1, thrust, 0.01), 0.01);
        engine.apply_input(sample(2, thrust, 0.01), 0.01);
        engine.apply_input(sample(3, thrust, 0.01), 0.01);

        // The server only saw the first input and left the ship at rest.
        let result = engine.reconcile(EntityState::default(), 1, 0.01);

        assert_eq!(engine.correction_count(), 1);
        assert_eq!(engine.history_sequences(), vec![2, 3]);
        assert!(result.position.x > 0.0);
        assert_eq!(engine.last_correction().map(|c| c.replayed), Some(2));
    }

    #[test]
    fn test_large_threshold_keeps_prediction() {
        let mut engine = engine(10.0);
        let thrust = ControlState::new(0.1, 0.0, 0.0, 0.0);

        engine.apply_input(sample(1, thrust, 0.01), 0.01);
        engine.apply_input(sample(2, thrust, 0.01), 0.01);
        let predicted = engine.state();

        let result = engine.reconcile(EntityState::default(), 1, 0.01);

        assert_eq!(engine.correction_count(), 0);
        assert_eq!(result, predicted);
        assert_eq!(engine.history_len(), 1);
    }

    #[test]
    fn test_rotation_drift_triggers_correction() {
        let mut engine = PredictionEngine::new(ReconciliationConfig::default());
        let yaw = ControlState::new(0.0, 0.0, 0.0, 1.0);

        engine.apply_input(sample(1, yaw, 0.01), 0.01);
        engine.apply_input(sample(2, yaw, 0.01), 0.01);
        assert_eq!(engine.state().position, Vec2::ZERO);

        engine.reconcile(EntityState::default(), 1, 0.01);

        assert_eq!(engine.correction_count(), 1);
        assert_eq!(engine.history_len(), 1);
        assert_eq!(engine.history_sequences(), vec![2]);
        assert!(engine.last_correction().is_some_and(|c| c.rotation_error > 0.001));
    }

    #[test]
    fn test_rotation_inside_tolerance_is_trusted() {
        let mut engine = PredictionEngine::new(ReconciliationConfig {
            rotation_tolerance: 0.01,
            ..Default::default()
        });
        let yaw = ControlState::new(0.0, 0.0, 0.0, 1.0);

        engine.apply_input(sample(1, yaw, 0.01), 0.01);
        engine.apply_input(sample(2, yaw, 0.01), 0.01);
        let predicted = engine.state();

        let result = engine.reconcile(EntityState::default(), 1, 0.01);

        assert_eq!(engine.correction_count(), 0);
        assert_eq!(result, predicted);
    }

    #[test]
    fn test_matching_server_state_is_a_no_op() {
        let mut engine = engine(0.05);
        let thrust = ControlState::new(1.0, 0.0, 0.0, 0.0);

        engine.apply_input(sample(1, thrust, 0.016), 0.016);
        let after_first = engine.state();
        engine.apply_input(sample(2, thrust, 0.016), 0.016);
        let predicted = engine.state();

        let result = engine.reconcile(after_first, 1, 0.016);

        assert_eq!(result, predicted);
        assert_eq!(engine.correction_count(), 0);
        assert_eq!(engine.history_sequences(), vec![2]);
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        for policy in [CorrectionPolicy::FullState, CorrectionPolicy::PositionAndRotation] {
            let mut engine = PredictionEngine::new(ReconciliationConfig {
                position_threshold: 0.0001,
                correction: policy,
                ..Default::default()
            });
            let control = ControlState::new(1.0, 0.3, 0.0, 0.5);
            for seq in 1..=5 {
                engine.apply_input(sample(seq, control, 0.016), 0.016);
            }

            let server = EntityState::at(Vec2::new(-3.0, 2.0), 0.4);
            let first = engine.reconcile(server, 2, 0.016);
            let second = engine.reconcile(server, 2, 0.016);

            assert_eq!(first, second, "{policy:?}");
            assert_eq!(engine.history_sequences(), vec![3, 4, 5]);
        }
    }

    #[test]
    fn test_empty_history_snaps_to_server() {
        let mut engine = engine(0.05);
        let server = EntityState::at(Vec2::new(5.0, 0.0), 0.0);

        let result = engine.reconcile(server, 0, 0.016);

        assert_eq!(result, server);
        assert_eq!(engine.history_len(), 0);
        assert_eq!(engine.correction_count(), 1);
    }

    #[test]
    fn test_stale_sequence_is_ignored() {
        let mut engine = engine(0.05);
        let thrust = ControlState::new(1.0, 0.0, 0.0, 0.0);

        engine.apply_input(sample(4, thrust, 0.016), 0.016);
        let predicted = engine.state();
        engine.apply_input(sample(4, thrust, 0.016), 0.016);
        engine.apply_input(sample(2, thrust, 0.016), 0.016);

        assert_eq!(engine.state(), predicted);
        assert_eq!(engine.history_sequences(), vec![4]);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut engine = PredictionEngine::new(ReconciliationConfig {
            history_capacity: 4,
            ..Default::default()
        });
        for seq in 1..=10 {
            engine.apply_input(sample(seq, ControlState::default(), 0.016), 0.016);
        }
        assert_eq!(engine.history_sequences(), vec![7, 8, 9, 10]);
    }

    #[test]
    fn test_zero_step_entries_replay_with_fallback() {
        let mut engine = engine(0.0001);
        let thrust = ControlState::new(1.0, 0.0, 0.0, 0.0);

        engine.apply_input(sample(1, thrust, 0.0), 0.0);
        assert_eq!(engine.state(), EntityState::default());

        engine.reconcile(EntityState::at(Vec2::new(0.0, 1.0), 0.0), 0, 0.02);
        assert!(engine.state().position.x > 0.0);
    }

    #[test]
    fn test_rebase_always_snaps() {
        let mut engine = engine(10.0);
        let server = EntityState::at(Vec2::new(1.0, 1.0), 0.0);

        engine.rebase(server, 0, 0.016);

        assert_eq!(engine.state(), server);
        assert_eq!(engine.correction_count(), 1);
    }
}
