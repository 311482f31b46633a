use std::time::{Duration, Instant};

/// Longest frame folded into the accumulator; anything beyond is dropped.
const MAX_FRAME_DELTA: f32 = 0.25;

/// Fixed-step accumulator for frame-driven loops: real frame time goes in,
/// whole steps come out.
pub struct FixedTimestep {
    tick_rate: u32,
    dt: f32,
    accumulator: f32,
}

impl FixedTimestep {
    pub fn new(tick_rate: u32) -> Self {
        let tick_rate = tick_rate.max(1);
        Self {
            tick_rate,
            dt: 1.0 / tick_rate as f32,
            accumulator: 0.0,
        }
    }

    pub fn tick_rate(&self) -> u32 {
        self.tick_rate
    }

    pub fn dt(&self) -> f32 {
        self.dt
    }

    pub fn accumulate(&mut self, delta: f32) {
        if !delta.is_finite() || delta <= 0.0 {
            return;
        }
        if delta > MAX_FRAME_DELTA {
            log::debug!(
                "Frame of {:.3}s clamped to {:.3}s",
                delta,
                MAX_FRAME_DELTA
            );
        }
        self.accumulator += delta.min(MAX_FRAME_DELTA);
    }

    pub fn should_tick(&self) -> bool {
        self.accumulator >= self.dt
    }

    pub fn consume_tick(&mut self) -> bool {
        if self.accumulator >= self.dt {
            self.accumulator -= self.dt;
            true
        } else {
            false
        }
    }

    pub fn alpha(&self) -> f32 {
        self.accumulator / self.dt
    }

    pub fn reset(&mut self) {
        self.accumulator = 0.0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    OnTime,
    /// The iteration overran its slot; the schedule was re-based from now.
    Behind { lag: Duration },
}

/// Wall-clock schedule on a monotonic clock. Fire times advance by adding
/// the interval to the previous fire time, so per-iteration jitter never
/// accumulates into drift.
#[derive(Debug, Clone)]
pub struct FixedSchedule {
    interval: Duration,
    next_fire: Instant,
}

impl FixedSchedule {
    pub fn new(interval: Duration, start: Instant) -> Self {
        Self {
            interval: interval.max(Duration::from_micros(1)),
            next_fire: start,
        }
    }

    pub fn from_rate(rate_hz: u32, start: Instant) -> Self {
        Self::new(Duration::from_secs_f64(1.0 / rate_hz.max(1) as f64), start)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn next_fire(&self) -> Instant {
        self.next_fire
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.next_fire
    }

    /// Marks the current slot as done. When the next slot has already passed
    /// by `now`, the schedule restarts one interval from `now` instead of
    /// firing back-to-back to catch up.
    pub fn advance(&mut self, now: Instant) -> Cadence {
        self.next_fire += self.interval;
        if self.next_fire <= now {
            let lag = now - self.next_fire;
            self.next_fire = now + self.interval;
            Cadence::Behind { lag }
        } else {
            Cadence::OnTime
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_timestep_accumulation() {
        let mut ts = FixedTimestep::new(60);

        ts.accumulate(1.0 / 30.0);
        assert!(ts.should_tick());
        assert!(ts.consume_tick());
        assert!(ts.consume_tick());
        assert!(!ts.consume_tick());
    }

    #[test]
    fn fixed_timestep_ignores_bad_frames() {
        let mut ts = FixedTimestep::new(60);
        ts.accumulate(-1.0);
        ts.accumulate(f32::NAN);
        assert!(!ts.should_tick());
    }

    #[test]
    fn fixed_timestep_clamps_long_frames() {
        let mut ts = FixedTimestep::new(8);
        ts.accumulate(2.0);

        let mut ticks = 0;
        while ts.consume_tick() {
            ticks += 1;
        }
        assert_eq!(ticks, 2);
    }

    #[test]
    fn schedule_adds_interval_without_drift() {
        let start = Instant::now();
        let interval = Duration::from_millis(10);
        let mut schedule = FixedSchedule::new(interval, start);

        // Each iteration finishes a little late but inside its slot.
        for i in 1..=5u32 {
            let finished = start + interval * (i - 1) + Duration::from_millis(3);
            assert_eq!(schedule.advance(finished), Cadence::OnTime);
            assert_eq!(schedule.next_fire(), start + interval * i);
        }
    }

    #[test]
    fn schedule_rebases_when_behind() {
        let start = Instant::now();
        let interval = Duration::from_millis(10);
        let mut schedule = FixedSchedule::new(interval, start);

        let finished = start + Duration::from_millis(35);
        let cadence = schedule.advance(finished);

        assert_eq!(
            cadence,
            Cadence::Behind {
                lag: Duration::from_millis(25)
            }
        );
        assert_eq!(schedule.next_fire(), finished + interval);
        assert!(!schedule.is_due(finished));
        assert!(schedule.is_due(finished + interval));
    }

    #[test]
    fn schedule_from_rate() {
        let schedule = FixedSchedule::from_rate(20, Instant::now());
        assert_eq!(schedule.interval(), Duration::from_millis(50));
    }
}
