use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Outbound call counters. Surfaced for logging, never read for control flow.
#[derive(Debug, Default)]
pub struct ApiMetrics {
    calls_made: AtomicU64,
    calls_retried: AtomicU64,
    quota_rejected: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiMetricsSnapshot {
    pub calls_made: u64,
    pub calls_retried: u64,
    pub quota_rejected: u64,
}

impl ApiMetrics {
    pub fn record_call(&self) {
        self.calls_made.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.calls_retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_quota_rejection(&self) {
        self.quota_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ApiMetricsSnapshot {
        ApiMetricsSnapshot {
            calls_made: self.calls_made.load(Ordering::Relaxed),
            calls_retried: self.calls_retried.load(Ordering::Relaxed),
            quota_rejected: self.quota_rejected.load(Ordering::Relaxed),
        }
    }
}

impl ApiMetricsSnapshot {
    /// Counters accumulated since `earlier`.
    pub fn since(&self, earlier: &ApiMetricsSnapshot) -> ApiMetricsSnapshot {
        ApiMetricsSnapshot {
            calls_made: self.calls_made.saturating_sub(earlier.calls_made),
            calls_retried: self.calls_retried.saturating_sub(earlier.calls_retried),
            quota_rejected: self.quota_rejected.saturating_sub(earlier.quota_rejected),
        }
    }
}
