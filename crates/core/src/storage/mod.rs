pub mod json_file;
pub mod lock;
pub mod postgres;

use crate::domain::market::Snapshot;
use crate::domain::projection::{Projection, ProjectionSummary};
use crate::domain::summary::MarketSummary;
use crate::ingest::error::FetchError;
use crate::ingest::metrics::ApiMetricsSnapshot;
use crate::pipeline::{PipelineCounts, PipelineResult};
use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

pub async fn migrate(pool: &sqlx::PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("sqlx migrations failed")?;
    Ok(())
}

/// What a sink receives for one run. Borrowed from the pipeline result; the sink picks the format.
#[derive(Debug, Clone, Serialize)]
pub struct StoredRun<'a> {
    pub run_id: uuid::Uuid,
    pub as_of_date: NaiveDate,
    pub status: RunStatus,
    pub error: Option<&'a str>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub snapshots: &'a [Snapshot],
    pub summary: Option<&'a MarketSummary>,
    pub projections: &'a [Projection],
    pub projection_summary: Option<&'a ProjectionSummary>,
    pub errors: &'a [FetchError],
    pub counts: &'a PipelineCounts,
    pub api: ApiMetricsSnapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Error,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }
}

impl<'a> From<&'a PipelineResult> for StoredRun<'a> {
    fn from(r: &'a PipelineResult) -> Self {
        let status = if r.success {
            RunStatus::Success
        } else if r.cancelled {
            RunStatus::Cancelled
        } else {
            RunStatus::Error
        };
        Self {
            run_id: r.run_id,
            as_of_date: r.as_of_date,
            status,
            error: r.failure.as_deref(),
            started_at: r.started_at,
            finished_at: r.finished_at,
            snapshots: &r.snapshots,
            summary: r.summary.as_ref(),
            projections: &r.projections,
            projection_summary: r.projection_summary.as_ref(),
            errors: &r.errors,
            counts: &r.counts,
            api: r.api,
        }
    }
}

#[async_trait::async_trait]
pub trait StorageSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn store(&self, run: &StoredRun<'_>) -> anyhow::Result<()>;
}
