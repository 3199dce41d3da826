//! Game clock shared by dispatcher and clients.
//!
//! The dispatcher's clock is authoritative. It sends its reading in every
//! `TIMECHECK`; clients keep a correction on top of their local clock so
//! grace windows and broadcast throttles run on the same time base.

/// Result of [`compute_adjustment`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClockAdjustment {
    /// Within tolerance.
    None,
    /// Small drift; move a fraction of the way.
    Nudge(f64),
    /// Drift too large; jump to the dispatcher's time.
    HardReset(f64),
}

/// Offsets below this many seconds are ignored.
pub const TOLERANCE_SECS: f64 = 0.1;

/// Offsets at or above this many seconds are applied at once.
pub const HARD_RESET_SECS: f64 = 2.0;

/// Share of a small offset applied per time check.
const NUDGE_FACTOR: f64 = 0.25;

/// Decide how to correct a clock that is `offset` seconds behind the
/// dispatcher (negative when ahead).
///
/// - `|offset| < 0.1`: no adjustment
/// - `0.1 <= |offset| < 2.0`: gradual nudge
/// - `|offset| >= 2.0`: hard reset
pub fn compute_adjustment(offset: f64) -> ClockAdjustment {
    if offset.abs() >= HARD_RESET_SECS {
        ClockAdjustment::HardReset(offset)
    } else if offset.abs() >= TOLERANCE_SECS {
        ClockAdjustment::Nudge(offset * NUDGE_FACTOR)
    } else {
        ClockAdjustment::None
    }
}

/// Local clock plus a correction towards the dispatcher.
#[derive(Debug, Clone, Default)]
pub struct GameClock {
    local: f64,
    correction: f64,
}

impl GameClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the local simulation clock for this tick.
    pub fn advance(&mut self, local: f64) {
        self.local = local;
    }

    /// Session time: local clock plus correction.
    pub fn now(&self) -> f64 {
        self.local + self.correction
    }

    /// Current correction in seconds.
    pub fn correction(&self) -> f64 {
        self.correction
    }

    /// Fold in a dispatcher reading.
    pub fn apply_time_check(&mut self, dispatcher_clock: f64) -> ClockAdjustment {
        let adjustment = compute_adjustment(dispatcher_clock - self.now());
        match adjustment {
            ClockAdjustment::None => {}
            ClockAdjustment::Nudge(delta) | ClockAdjustment::HardReset(delta) => {
                self.correction += delta;
            }
        }
        adjustment
    }

    /// Forget the correction, e.g. when falling back to single-player.
    pub fn reset_correction(&mut self) {
        self.correction = 0.0;
    }
}
