use crate::analysis::analyzer::{analyze, index_membership};
use crate::analysis::projector::{summarize, ProjectionParams, Projector};
use crate::config::{env_parse, Settings};
use crate::domain::market::Snapshot;
use crate::domain::projection::{Projection, ProjectionSummary};
use crate::domain::summary::MarketSummary;
use crate::ingest::error::FetchError;
use crate::ingest::finnhub::FinnhubClient;
use crate::ingest::metrics::{ApiMetrics, ApiMetricsSnapshot};
use crate::ingest::provider::QuoteSource;
use crate::ingest::rate_limiter::{RateLimitConfig, RateLimiter};
use crate::ingest::universe::UniverseEntry;
use crate::pipeline::cancel::CancelSignal;
use crate::pipeline::fetcher::fetch_full;
use crate::pipeline::filters::ScreenFilters;
use crate::pipeline::pool::{dedup_symbols, PoolConfig};
use crate::pipeline::screener::screen;
use crate::time::us_market::TradingCalendar;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub screen_pool: PoolConfig,
    pub fetch_pool: PoolConfig,
    /// When off, the first `top_n` universe symbols go straight to the full fetch.
    pub use_screener: bool,
    /// Below this many snapshots, projection is skipped.
    pub min_snapshots_for_projection: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            screen_pool: PoolConfig::screening(),
            fetch_pool: PoolConfig::fetching(),
            use_screener: true,
            min_snapshots_for_projection: 1,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            screen_pool: PoolConfig::screening_from_env(),
            fetch_pool: PoolConfig::fetching_from_env(),
            use_screener: true,
            min_snapshots_for_projection: env_parse::<usize>("MIN_SNAPSHOTS_FOR_PROJECTION")
                .unwrap_or(1),
        }
    }
}

/// Stage tallies for one run. Logged and stored; never used for control flow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineCounts {
    pub universe: usize,
    pub unique_symbols: usize,
    pub screened: usize,
    pub passed: usize,
    pub screen_failed: usize,
    pub selected: usize,
    pub fetched: usize,
    pub fetch_failed: usize,
    pub market_cap_filtered: usize,
    pub market_cap_unknown: usize,
    pub projected: usize,
    pub projection_skipped: usize,
    /// Failures worth re-running later (transport, quota, deadline).
    pub retryable_failures: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub run_id: uuid::Uuid,
    pub success: bool,
    pub failure: Option<String>,
    pub cancelled: bool,
    pub as_of_date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub snapshots: Vec<Snapshot>,
    pub summary: Option<MarketSummary>,
    pub projections: Vec<Projection>,
    pub projection_summary: Option<ProjectionSummary>,
    pub errors: Vec<FetchError>,
    pub counts: PipelineCounts,
    pub api: ApiMetricsSnapshot,
}

impl PipelineResult {
    fn started(as_of_date: NaiveDate) -> Self {
        let now = Utc::now();
        Self {
            run_id: uuid::Uuid::new_v4(),
            success: false,
            failure: None,
            cancelled: false,
            as_of_date,
            started_at: now,
            finished_at: now,
            snapshots: Vec::new(),
            summary: None,
            projections: Vec::new(),
            projection_summary: None,
            errors: Vec::new(),
            counts: PipelineCounts::default(),
            api: ApiMetricsSnapshot::default(),
        }
    }
}

/// Screener -> Fetcher -> Analyzer/Projector over one shared quote source.
pub struct Pipeline {
    source: Arc<dyn QuoteSource>,
    metrics: Arc<ApiMetrics>,
    projector: Projector,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        source: Arc<dyn QuoteSource>,
        metrics: Arc<ApiMetrics>,
        projector: Projector,
        config: PipelineConfig,
    ) -> Self {
        Self {
            source,
            metrics,
            projector,
            config,
        }
    }

    /// Wires the live quote client, one limiter shared by every stage, and the projector.
    pub fn from_settings(settings: &Settings, config: PipelineConfig) -> anyhow::Result<Self> {
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig::from_env()));
        let metrics = Arc::new(ApiMetrics::default());
        let client = FinnhubClient::from_settings(settings, limiter, metrics.clone())?;
        let projector = Projector::new(
            ProjectionParams::from_settings(settings)?,
            TradingCalendar::from_env(),
        );
        Ok(Self::new(Arc::new(client), metrics, projector, config))
    }

    /// Runs every stage for `as_of_date`.
    ///
    /// Per-symbol failures accumulate in `errors`. The run fails only when the universe is empty,
    /// when no snapshot survives, or when `cancel` is raised; partial data is kept either way.
    pub async fn run_pipeline(
        &self,
        universe: &[UniverseEntry],
        filters: &ScreenFilters,
        top_n: usize,
        as_of_date: NaiveDate,
        cancel: &CancelSignal,
    ) -> PipelineResult {
        let api_before = self.metrics.snapshot();
        let mut result = PipelineResult::started(as_of_date);
        let outcome = self
            .run_stages(universe, filters, top_n, as_of_date, cancel, &mut result)
            .await;

        result.counts.retryable_failures = result
            .errors
            .iter()
            .filter(|e| e.cause.is_retryable())
            .count();
        result.api = self.metrics.snapshot().since(&api_before);
        result.finished_at = Utc::now();
        match outcome {
            Ok(()) => result.success = true,
            Err(err) => {
                result.cancelled = cancel.is_cancelled();
                let reason = format!("{err:#}");
                tracing::error!(%as_of_date, run_id = %result.run_id, reason = %reason, "pipeline run failed");
                result.failure = Some(reason);
            }
        }

        tracing::info!(
            %as_of_date,
            run_id = %result.run_id,
            success = result.success,
            counts = ?result.counts,
            calls_made = result.api.calls_made,
            calls_retried = result.api.calls_retried,
            quota_rejected = result.api.quota_rejected,
            "pipeline run finished"
        );
        result
    }

    async fn run_stages(
        &self,
        universe: &[UniverseEntry],
        filters: &ScreenFilters,
        top_n: usize,
        as_of_date: NaiveDate,
        cancel: &CancelSignal,
        result: &mut PipelineResult,
    ) -> anyhow::Result<()> {
        let counts = &mut result.counts;
        counts.universe = universe.len();
        let symbols = dedup_symbols(universe.iter().map(|e| e.symbol.as_str()));
        counts.unique_symbols = symbols.len();
        if symbols.is_empty() {
            anyhow::bail!("universe unavailable: no symbols to screen");
        }
        let membership = index_membership(universe);
        let top_n = top_n.max(1);

        let selected: Vec<String> = if self.config.use_screener {
            let screened = screen(
                self.source.clone(),
                &symbols,
                filters,
                &self.config.screen_pool,
                cancel,
            )
            .await;
            counts.screened = screened.screened;
            counts.passed = screened.ranked.len();
            counts.screen_failed = screened.failures.len();
            result.errors.extend(screened.failures);
            if screened.cancelled {
                anyhow::bail!("cancelled during screening");
            }
            screened
                .ranked
                .into_iter()
                .take(top_n)
                .map(|c| c.symbol)
                .collect()
        } else {
            symbols.into_iter().take(top_n).collect()
        };
        counts.selected = selected.len();

        if cancel.is_cancelled() {
            anyhow::bail!("cancelled before full fetch");
        }
        if selected.is_empty() {
            anyhow::bail!("no symbols passed screening");
        }

        tracing::info!(selected = selected.len(), top_n, %as_of_date, "shortlist ready");
        let fetched = fetch_full(
            self.source.clone(),
            &selected,
            as_of_date,
            &self.config.fetch_pool,
            cancel,
        )
        .await;
        counts.fetched = fetched.snapshots.len();
        counts.fetch_failed = fetched.errors.len();
        result.errors.extend(fetched.errors);

        // Screening quotes carry no market cap, so the floor is applied here.
        counts.market_cap_unknown = fetched
            .snapshots
            .iter()
            .filter(|s| s.market_cap.is_none())
            .count();
        let before = fetched.snapshots.len();
        let snapshots: Vec<Snapshot> = fetched
            .snapshots
            .into_iter()
            .filter(|s| filters.passes_market_cap(s.market_cap))
            .collect();
        counts.market_cap_filtered = before - snapshots.len();

        // Drained snapshots stay on the result even when the run is cancelled here.
        if fetched.cancelled {
            result.snapshots = snapshots;
            anyhow::bail!("cancelled during full fetch");
        }
        if snapshots.is_empty() {
            anyhow::bail!("no snapshots produced");
        }

        result.summary = Some(analyze(&snapshots, &membership, as_of_date));

        if snapshots.len() >= self.config.min_snapshots_for_projection {
            let batch = self.projector.project(&snapshots);
            counts.projected = batch.projections.len();
            counts.projection_skipped = batch.skipped;
            if !batch.projections.is_empty() {
                result.projection_summary = Some(summarize(&batch.projections));
            }
            result.projections = batch.projections;
        } else {
            tracing::warn!(
                snapshots = snapshots.len(),
                floor = self.config.min_snapshots_for_projection,
                "too few snapshots; skipping projection"
            );
        }

        result.snapshots = snapshots;
        Ok(())
    }
}
