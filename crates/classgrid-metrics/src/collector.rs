//! Gateway request counters.
//!
//! Counters are plain atomics. Latency samples live in a bounded window
//! behind a mutex that is only held to push or copy samples.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::trace;

use classgrid_core::ErrorTag;

/// Latency samples kept for percentile computation.
const LATENCY_WINDOW: usize = 1024;

#[derive(Debug, Default)]
pub struct GatewayMetrics {
    submitted: AtomicU64,
    completed: AtomicU64,
    capability_failed: AtomicU64,
    payload_missing: AtomicU64,
    poison: AtomicU64,
    timed_out: AtomicU64,
    duplicates: AtomicU64,
    rejected: AtomicU64,
    internal_errors: AtomicU64,
    /// Round-trip latencies of completed submissions, in microseconds.
    latencies: Mutex<VecDeque<u64>>,
}

/// Point-in-time copy of the gateway counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GatewaySnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub capability_failed: u64,
    pub payload_missing: u64,
    pub poison: u64,
    pub timed_out: u64,
    pub duplicates: u64,
    pub rejected: u64,
    pub internal_errors: u64,
    pub latency_p50_ms: f64,
    pub latency_p99_ms: f64,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// A submission was accepted for dispatch.
    pub fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// A submission came back with a label.
    pub fn record_completed(&self, latency: Duration) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        let mut window = self.latencies.lock().unwrap_or_else(|e| e.into_inner());
        if window.len() == LATENCY_WINDOW {
            window.pop_front();
        }
        window.push_back(latency.as_micros() as u64);
        trace!(latency_us = latency.as_micros() as u64, "completion recorded");
    }

    /// A submission came back with an error tag.
    pub fn record_failed(&self, tag: ErrorTag) {
        let counter = match tag {
            ErrorTag::CapabilityFailed => &self.capability_failed,
            ErrorTag::PayloadMissing => &self.payload_missing,
            ErrorTag::PoisonMessage => &self.poison,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    /// A malformed upload was turned away before dispatch.
    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Storage or broker failure while dispatching.
    pub fn record_internal_error(&self) {
        self.internal_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> GatewaySnapshot {
        let samples: Vec<u64> = self
            .latencies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .copied()
            .collect();
        let (p50, p99) = compute_percentiles(&samples);

        GatewaySnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            capability_failed: self.capability_failed.load(Ordering::Relaxed),
            payload_missing: self.payload_missing.load(Ordering::Relaxed),
            poison: self.poison.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            internal_errors: self.internal_errors.load(Ordering::Relaxed),
            latency_p50_ms: p50,
            latency_p99_ms: p99,
        }
    }
}

/// Compute P50 and P99 latency from unsorted microsecond samples.
///
/// Returns (p50_ms, p99_ms). If empty, returns (0.0, 0.0).
fn compute_percentiles(latencies: &[u64]) -> (f64, f64) {
    if latencies.is_empty() {
        return (0.0, 0.0);
    }

    let mut sorted = latencies.to_vec();
    sorted.sort_unstable();

    let p50_idx = (sorted.len() as f64 * 0.50) as usize;
    let p99_idx = (sorted.len() as f64 * 0.99) as usize;

    let p50 = sorted[p50_idx.min(sorted.len() - 1)] as f64 / 1000.0;
    let p99 = sorted[p99_idx.min(sorted.len() - 1)] as f64 / 1000.0;

    (p50, p99)
}
