//! Per-context bookkeeping counters.
//!
//! Shared handles: the owning context updates them, and the UTILITY
//! clear operation resets every context's counters device-wide.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Default)]
pub struct Instruments {
    flush_times: AtomicU64,
    shadowing_times: AtomicU64,
    shadowing_micros: AtomicU64,
    hypercalls: AtomicU64,
}

impl Instruments {
    pub fn increment_flush(&self) -> u64 {
        self.flush_times.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn increment_shadowing(&self, elapsed: Duration) -> Duration {
        self.shadowing_times.fetch_add(1, Ordering::Relaxed);
        let total = self
            .shadowing_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed)
            + elapsed.as_micros() as u64;
        Duration::from_micros(total)
    }

    pub fn hypercall(&self, id: u32, op: u8) {
        self.hypercalls.fetch_add(1, Ordering::Relaxed);
        log::debug!("call from [{}] {} : {}", id, op, crate::pv::op_name(op));
    }

    pub fn hypercall_count(&self) -> u64 {
        self.hypercalls.load(Ordering::Relaxed)
    }

    pub fn shadowing_count(&self) -> u64 {
        self.shadowing_times.load(Ordering::Relaxed)
    }

    pub fn clear_shadowing_utilization(&self) {
        self.flush_times.store(0, Ordering::Relaxed);
        self.shadowing_times.store(0, Ordering::Relaxed);
        self.shadowing_micros.store(0, Ordering::Relaxed);
    }
}
