//! Memory accounting and admission control.
//!
//! The gauge tracks bytes held by queued jobs and in-flight dispatches
//! through RAII reservations. A supervisor samples the gauge on a fixed
//! cadence and pauses submission admission above the soft limit; workers
//! keep draining. Admission resumes once usage drops below the limit
//! minus the hysteresis margin.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Byte gauge with a soft limit and hysteresis.
pub struct MemoryGauge {
    used: AtomicUsize,
    /// 0 disables the ceiling entirely.
    soft_limit: usize,
    hysteresis: usize,
    admitting: AtomicBool,
}

impl MemoryGauge {
    pub fn new(soft_limit: usize, hysteresis: usize) -> Self {
        Self {
            used: AtomicUsize::new(0),
            soft_limit,
            hysteresis: hysteresis.min(soft_limit),
            admitting: AtomicBool::new(true),
        }
    }

    /// Reserve bytes; released when the returned guard drops.
    pub fn reserve(self: &Arc<Self>, bytes: usize) -> Reservation {
        self.used.fetch_add(bytes, Ordering::Relaxed);
        Reservation {
            gauge: Arc::clone(self),
            bytes,
        }
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    /// Whether new submissions are currently admitted.
    pub fn admitting(&self) -> bool {
        self.soft_limit == 0 || self.admitting.load(Ordering::Acquire)
    }

    /// One supervisor sample: flip the admission flag with hysteresis.
    pub fn sample(&self) {
        if self.soft_limit == 0 {
            return;
        }
        let used = self.used();
        if used > self.soft_limit {
            if self.admitting.swap(false, Ordering::AcqRel) {
                tracing::warn!(used, limit = self.soft_limit, "memory ceiling hit, pausing admission");
            }
        } else if used + self.hysteresis <= self.soft_limit
            && !self.admitting.swap(true, Ordering::AcqRel)
        {
            tracing::info!(used, "memory pressure cleared, resuming admission");
        }
    }

    /// Spawn the sampling loop.
    pub fn spawn_supervisor(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => self.sample(),
                }
            }
        })
    }
}

/// RAII reservation against a gauge.
pub struct Reservation {
    gauge: Arc<MemoryGauge>,
    bytes: usize,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.gauge.used.fetch_sub(self.bytes, Ordering::Relaxed);
    }
}
