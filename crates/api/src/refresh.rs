use chrono::{DateTime, NaiveDate, Utc};
use marketpulse_core::pipeline::{CancelSignal, PipelineCounts, PipelineResult};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RefreshRequest {
    pub as_of_date: Option<String>,
    pub top_n: Option<usize>,
    pub indices: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshPhase {
    #[default]
    Idle,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RefreshStatus {
    pub phase: RefreshPhase,
    pub as_of_date: Option<NaiveDate>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub run_id: Option<Uuid>,
    pub failure: Option<String>,
    pub counts: Option<PipelineCounts>,
    pub persisted: bool,
    pub cancel_requested: bool,
}

#[derive(Debug, Default)]
struct Inner {
    status: RefreshStatus,
    cancel: Option<CancelSignal>,
}

/// Single-flight guard for background refresh runs. The lock is never held across an await.
#[derive(Debug, Clone, Default)]
pub struct RefreshTracker {
    inner: Arc<Mutex<Inner>>,
}

impl RefreshTracker {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// `None` while another refresh is running.
    pub fn try_begin(&self, as_of_date: NaiveDate) -> Option<CancelSignal> {
        let mut inner = self.lock();
        if inner.status.phase == RefreshPhase::Running {
            return None;
        }
        let cancel = CancelSignal::new();
        inner.cancel = Some(cancel.clone());
        inner.status = RefreshStatus {
            phase: RefreshPhase::Running,
            as_of_date: Some(as_of_date),
            started_at: Some(Utc::now()),
            ..Default::default()
        };
        Some(cancel)
    }

    pub fn finish(&self, result: &PipelineResult, persisted: bool) {
        let mut inner = self.lock();
        inner.cancel = None;
        let status = &mut inner.status;
        status.phase = if result.success {
            RefreshPhase::Succeeded
        } else if result.cancelled {
            RefreshPhase::Cancelled
        } else {
            RefreshPhase::Failed
        };
        status.finished_at = Some(result.finished_at);
        status.run_id = Some(result.run_id);
        status.failure = result.failure.clone();
        status.counts = Some(result.counts.clone());
        status.persisted = persisted;
    }

    /// For runs that never reached the pipeline (bad config, lock held elsewhere).
    pub fn fail(&self, reason: String) {
        let mut inner = self.lock();
        inner.cancel = None;
        inner.status.phase = RefreshPhase::Failed;
        inner.status.finished_at = Some(Utc::now());
        inner.status.failure = Some(reason);
    }

    /// Raises the cancel signal of the running refresh; false when nothing is running.
    pub fn cancel(&self) -> bool {
        let mut inner = self.lock();
        let Some(cancel) = inner.cancel.as_ref() else {
            return false;
        };
        cancel.cancel();
        inner.status.cancel_requested = true;
        true
    }

    pub fn status(&self) -> RefreshStatus {
        self.lock().status.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, 27).unwrap()
    }

    fn result(success: bool, cancelled: bool) -> PipelineResult {
        let now = Utc::now();
        PipelineResult {
            run_id: Uuid::new_v4(),
            success,
            failure: (!success).then(|| "cancelled during full fetch".to_string()),
            cancelled,
            as_of_date: date(),
            started_at: now,
            finished_at: now,
            snapshots: Vec::new(),
            summary: None,
            projections: Vec::new(),
            projection_summary: None,
            errors: Vec::new(),
            counts: PipelineCounts::default(),
            api: Default::default(),
        }
    }

    #[test]
    fn only_one_refresh_runs_at_a_time() {
        let tracker = RefreshTracker::default();
        assert!(tracker.try_begin(date()).is_some());
        assert!(tracker.try_begin(date()).is_none());
        assert_eq!(tracker.status().phase, RefreshPhase::Running);

        tracker.finish(&result(true, false), true);
        let status = tracker.status();
        assert_eq!(status.phase, RefreshPhase::Succeeded);
        assert!(status.persisted);

        assert!(tracker.try_begin(date()).is_some());
    }

    #[test]
    fn cancel_raises_the_running_signal() {
        let tracker = RefreshTracker::default();
        assert!(!tracker.cancel());

        let signal = tracker.try_begin(date()).unwrap();
        assert!(tracker.cancel());
        assert!(signal.is_cancelled());
        assert!(tracker.status().cancel_requested);

        tracker.finish(&result(false, true), false);
        let status = tracker.status();
        assert_eq!(status.phase, RefreshPhase::Cancelled);
        assert_eq!(status.failure.as_deref(), Some("cancelled during full fetch"));
        assert!(!tracker.cancel());
    }

    #[test]
    fn setup_failure_frees_the_slot() {
        let tracker = RefreshTracker::default();
        tracker.try_begin(date()).unwrap();
        tracker.fail("FINNHUB_API_KEY is required".to_string());
        assert_eq!(tracker.status().phase, RefreshPhase::Failed);
        assert!(tracker.try_begin(date()).is_some());
    }
}
