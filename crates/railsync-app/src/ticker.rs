//! Fixed-step simulation clock for the headless node.
//!
//! Wall-clock time is accumulated and consumed in whole steps, so train
//! motion advances by the same `dt` however irregular the tokio interval is.

use std::time::Instant;

/// Longest frame the clock will account for. Anything slower is clamped so a
/// stalled process does not replay minutes of motion in one go.
pub const MAX_FRAME_TIME: f64 = 0.25;

pub struct FixedStep {
    step: f64,
    previous: Instant,
    accumulator: f64,
    total: f64,
    steps_run: u64,
}

impl FixedStep {
    /// A clock running `hz` steps per second. `hz` of zero is treated as one.
    pub fn new(hz: u32) -> Self {
        Self {
            step: 1.0 / f64::from(hz.max(1)),
            previous: Instant::now(),
            accumulator: 0.0,
            total: 0.0,
            steps_run: 0,
        }
    }

    /// Measure the time since the last call and run the steps it covers.
    /// `update(dt)` is called once per step.
    pub fn advance(&mut self, update: impl FnMut(f64)) -> u32 {
        let now = Instant::now();
        let frame_time = now.duration_since(self.previous).as_secs_f64();
        self.previous = now;
        self.advance_by(frame_time, update)
    }

    /// Run the steps covered by `frame_time` seconds.
    pub fn advance_by(&mut self, frame_time: f64, mut update: impl FnMut(f64)) -> u32 {
        let frame_time = if frame_time > MAX_FRAME_TIME {
            tracing::warn!(
                "Frame time {:.1}ms exceeds maximum, clamping to {:.1}ms",
                frame_time * 1000.0,
                MAX_FRAME_TIME * 1000.0
            );
            MAX_FRAME_TIME
        } else {
            frame_time.max(0.0)
        };

        self.accumulator += frame_time;
        let mut steps = 0;
        while self.accumulator >= self.step {
            update(self.step);
            self.total += self.step;
            self.accumulator -= self.step;
            self.steps_run += 1;
            steps += 1;
        }
        steps
    }

    pub fn step(&self) -> f64 {
        self.step
    }

    /// Simulated seconds since start.
    pub fn total(&self) -> f64 {
        self.total
    }

    pub fn steps_run(&self) -> u64 {
        self.steps_run
    }
}
