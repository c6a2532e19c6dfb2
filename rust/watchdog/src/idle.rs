//! Idle decision with hysteresis.

use crate::sampler::AveragedUtilization;

/// Where the detector is in its idle streak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdlePhase {
    /// Last cycle had at least one busy device.
    Active,
    /// Idle, but not for long enough yet.
    Cooling,
    /// Idle for the required number of consecutive cycles.
    IdleConfirmed,
}

/// Counts consecutive cycles in which every device was below the threshold.
///
/// A single busy device resets the streak. `IdleConfirmed` is re-evaluated
/// every cycle; callers that decline to act on it call [`IdleDetector::reset`]
/// so a fresh streak is needed before it fires again.
#[derive(Debug, Clone)]
pub struct IdleDetector {
    threshold: f64,
    required: u32,
    consecutive_low_cycles: u32,
}

impl IdleDetector {
    #[must_use]
    pub fn new(threshold: f64, required: u32) -> Self {
        Self {
            threshold,
            required: required.max(1),
            consecutive_low_cycles: 0,
        }
    }

    /// Feed one averaged window and return the resulting phase.
    pub fn observe(&mut self, usage: &AveragedUtilization) -> IdlePhase {
        if usage.all_below(self.threshold) {
            self.consecutive_low_cycles = self.consecutive_low_cycles.saturating_add(1);
        } else {
            self.consecutive_low_cycles = 0;
        }
        self.phase()
    }

    #[must_use]
    pub fn phase(&self) -> IdlePhase {
        match self.consecutive_low_cycles {
            0 => IdlePhase::Active,
            n if n < self.required => IdlePhase::Cooling,
            _ => IdlePhase::IdleConfirmed,
        }
    }

    pub fn reset(&mut self) {
        self.consecutive_low_cycles = 0;
    }

    #[must_use]
    pub fn consecutive_low_cycles(&self) -> u32 {
        self.consecutive_low_cycles
    }

    #[must_use]
    pub fn required(&self) -> u32 {
        self.required
    }

    #[must_use]
    pub fn threshold(&self) -> f64 {
        self.threshold
    }
}
