//! Step-interval feedback for the stall detection window.

use core::sync::atomic::{AtomicU32, Ordering};

use tmc2660::StepTiming;

/// Per-axis step intervals published by the step generator.
///
/// The stored value is the interval between microsteps in step-clock ticks,
/// 0 while an axis is idle. Lock-free on both sides: the step generator
/// stores, the SPI interrupt loads.
pub struct StepPlan {
    intervals: [AtomicU32; Self::MAX_AXES],
}

impl StepPlan {
    pub const MAX_AXES: usize = 8;

    pub const fn new() -> Self {
        const IDLE: AtomicU32 = AtomicU32::new(0);
        Self {
            intervals: [IDLE; Self::MAX_AXES],
        }
    }

    /// Publish the current microstep interval for an axis, 0 when idle.
    pub fn set_step_interval(&self, axis: usize, ticks: u32) {
        if let Some(slot) = self.intervals.get(axis) {
            slot.store(ticks, Ordering::Relaxed);
        }
    }
}

impl StepTiming for StepPlan {
    fn step_interval(&self, axis: u32, microstep_shift: u32) -> u32 {
        let ticks = self
            .intervals
            .get(axis as usize)
            .map_or(0, |slot| slot.load(Ordering::Relaxed));
        // Scale the microstep interval up to the full-step interval the
        // stall window is calibrated against.
        ticks.saturating_mul(1 << microstep_shift)
    }
}
