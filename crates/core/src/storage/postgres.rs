use crate::domain::market::Snapshot;
use crate::domain::projection::{Projection, ProjectionSummary, Recommendation, RiskLevel, Trend};
use crate::domain::summary::MarketSummary;
use crate::storage::{RunStatus, StorageSink, StoredRun};
use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

const INSERT_BATCH: usize = 200;

#[derive(Debug, Clone)]
pub struct PgStorage {
    pool: PgPool,
}

/// One persisted run, as the dashboard reads it back.
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub id: Uuid,
    pub as_of_date: NaiveDate,
    pub status: String,
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
    pub counts: serde_json::Value,
    pub api_metrics: serde_json::Value,
    pub market_summary: Option<MarketSummary>,
    pub projection_summary: Option<ProjectionSummary>,
}

/// One symbol on one as-of date, with the projection made that day when there was one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryPoint {
    pub as_of_date: NaiveDate,
    pub close: f64,
    pub change_percent: f64,
    pub volume: u64,
    pub target_mid: Option<f64>,
    pub recommendation: Option<Recommendation>,
}

#[derive(sqlx::FromRow)]
struct HistoryRow {
    as_of_date: NaiveDate,
    close: f64,
    change_percent: f64,
    volume: i64,
    target_mid: Option<f64>,
    recommendation: Option<String>,
}

#[derive(sqlx::FromRow)]
struct RunRow {
    id: Uuid,
    as_of_date: NaiveDate,
    status: String,
    error: Option<String>,
    finished_at: DateTime<Utc>,
    counts: serde_json::Value,
    api_metrics: serde_json::Value,
    market_summary: Option<serde_json::Value>,
    projection_summary: Option<serde_json::Value>,
}

#[derive(sqlx::FromRow)]
struct SnapshotRow {
    as_of_date: NaiveDate,
    symbol: String,
    name: String,
    close: f64,
    previous_close: f64,
    change: f64,
    change_percent: f64,
    open: Option<f64>,
    high: Option<f64>,
    low: Option<f64>,
    volume: i64,
    market_cap: Option<f64>,
    exchange: String,
}

#[derive(sqlx::FromRow)]
struct ProjectionRow {
    symbol: String,
    name: String,
    current_price: f64,
    target_low: f64,
    target_mid: f64,
    target_high: f64,
    expected_change_percent: f64,
    recommendation: String,
    confidence: i16,
    trend: String,
    momentum_score: f64,
    volatility_score: f64,
    risk_level: String,
    reason: String,
    projection_date: NaiveDate,
    generated_at: DateTime<Utc>,
}

const RUN_COLUMNS: &str = "id, as_of_date, status, error, finished_at, counts, api_metrics, \
                           market_summary, projection_summary";

const PROJECTION_COLUMNS: &str = "symbol, name, current_price, target_low, target_mid, target_high, \
     expected_change_percent, recommendation, confidence, trend, momentum_score, volatility_score, \
     risk_level, reason, projection_date, generated_at";

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Successful runs write everything in one transaction; failed runs only record the run row.
    pub async fn persist(&self, run: &StoredRun<'_>) -> anyhow::Result<Uuid> {
        match run.status {
            RunStatus::Success => self.persist_success(run).await,
            RunStatus::Error | RunStatus::Cancelled => self.persist_failure(run).await,
        }
    }

    async fn persist_success(&self, run: &StoredRun<'_>) -> anyhow::Result<Uuid> {
        anyhow::ensure!(!run.snapshots.is_empty(), "successful run must carry snapshots");

        let mut tx = self.pool.begin().await.context("begin transaction failed")?;
        insert_run(&mut tx, run).await?;

        for chunk in run.snapshots.chunks(INSERT_BATCH) {
            let mut qb = sqlx::QueryBuilder::new(
                "INSERT INTO market_snapshots (run_id, as_of_date, symbol, name, close, previous_close, \
                 change, change_percent, open, high, low, volume, market_cap, exchange) ",
            );
            qb.push_values(chunk, |mut b, s| {
                b.push_bind(run.run_id)
                    .push_bind(s.as_of_date)
                    .push_bind(s.symbol.trim())
                    .push_bind(s.name.trim())
                    .push_bind(s.close)
                    .push_bind(s.previous_close)
                    .push_bind(s.change)
                    .push_bind(s.change_percent)
                    .push_bind(s.open)
                    .push_bind(s.high)
                    .push_bind(s.low)
                    .push_bind(i64::try_from(s.volume).unwrap_or(i64::MAX))
                    .push_bind(s.market_cap)
                    .push_bind(s.exchange.as_str());
            });
            qb.build()
                .persistent(false)
                .execute(&mut *tx)
                .await
                .context("batch insert market_snapshots failed")?;
        }

        for chunk in run.projections.chunks(INSERT_BATCH) {
            let mut qb = sqlx::QueryBuilder::new(format!(
                "INSERT INTO projections (run_id, as_of_date, {PROJECTION_COLUMNS}) "
            ));
            qb.push_values(chunk, |mut b, p| {
                b.push_bind(run.run_id)
                    .push_bind(run.as_of_date)
                    .push_bind(p.symbol.as_str())
                    .push_bind(p.name.as_str())
                    .push_bind(p.current_price)
                    .push_bind(p.target_low)
                    .push_bind(p.target_mid)
                    .push_bind(p.target_high)
                    .push_bind(p.expected_change_percent)
                    .push_bind(p.recommendation.as_str())
                    .push_bind(p.confidence as i16)
                    .push_bind(p.trend.as_str())
                    .push_bind(p.momentum_score)
                    .push_bind(p.volatility_score)
                    .push_bind(p.risk_level.as_str())
                    .push_bind(p.reason.as_str())
                    .push_bind(p.projection_date)
                    .push_bind(p.generated_at);
            });
            qb.build()
                .persistent(false)
                .execute(&mut *tx)
                .await
                .context("batch insert projections failed")?;
        }

        tx.commit().await.context("commit transaction failed")?;
        tracing::info!(
            run_id = %run.run_id,
            as_of_date = %run.as_of_date,
            snapshots = run.snapshots.len(),
            projections = run.projections.len(),
            "run persisted"
        );
        Ok(run.run_id)
    }

    async fn persist_failure(&self, run: &StoredRun<'_>) -> anyhow::Result<Uuid> {
        let mut tx = self.pool.begin().await.context("begin transaction failed")?;
        insert_run(&mut tx, run).await?;
        tx.commit().await.context("commit transaction failed")?;
        Ok(run.run_id)
    }

    pub async fn latest_run(&self) -> anyhow::Result<Option<RunRecord>> {
        let row: Option<RunRow> = sqlx::query_as(&format!(
            "SELECT {RUN_COLUMNS} FROM pipeline_runs WHERE status = 'success' \
             ORDER BY as_of_date DESC, finished_at DESC LIMIT 1"
        ))
        .persistent(false)
        .fetch_optional(&self.pool)
        .await
        .context("select latest pipeline_runs failed")?;
        row.map(RunRecord::try_from).transpose()
    }

    pub async fn run_for_date(&self, as_of_date: NaiveDate) -> anyhow::Result<Option<RunRecord>> {
        let row: Option<RunRow> = sqlx::query_as(&format!(
            "SELECT {RUN_COLUMNS} FROM pipeline_runs WHERE status = 'success' AND as_of_date = $1 \
             ORDER BY finished_at DESC LIMIT 1"
        ))
        .persistent(false)
        .bind(as_of_date)
        .fetch_optional(&self.pool)
        .await
        .context("select pipeline_runs by date failed")?;
        row.map(RunRecord::try_from).transpose()
    }

    pub async fn snapshots_for_run(&self, run_id: Uuid) -> anyhow::Result<Vec<Snapshot>> {
        let rows: Vec<SnapshotRow> = sqlx::query_as(
            "SELECT as_of_date, symbol, name, close, previous_close, change, change_percent, \
             open, high, low, volume, market_cap, exchange \
             FROM market_snapshots WHERE run_id = $1 ORDER BY change_percent DESC, symbol ASC",
        )
        .persistent(false)
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .context("select market_snapshots failed")?;
        Ok(rows.into_iter().map(Snapshot::from).collect())
    }

    pub async fn projections_for_run(&self, run_id: Uuid) -> anyhow::Result<Vec<Projection>> {
        let rows: Vec<ProjectionRow> = sqlx::query_as(&format!(
            "SELECT {PROJECTION_COLUMNS} FROM projections WHERE run_id = $1 \
             ORDER BY confidence DESC, symbol ASC"
        ))
        .persistent(false)
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .context("select projections failed")?;
        rows.into_iter().map(Projection::try_from).collect()
    }

    pub async fn snapshot_in_run(
        &self,
        run_id: Uuid,
        symbol: &str,
    ) -> anyhow::Result<Option<Snapshot>> {
        let row: Option<SnapshotRow> = sqlx::query_as(
            "SELECT as_of_date, symbol, name, close, previous_close, change, change_percent, \
             open, high, low, volume, market_cap, exchange \
             FROM market_snapshots WHERE run_id = $1 AND symbol = $2",
        )
        .persistent(false)
        .bind(run_id)
        .bind(symbol.trim().to_ascii_uppercase())
        .fetch_optional(&self.pool)
        .await
        .context("select market_snapshot failed")?;
        Ok(row.map(Snapshot::from))
    }

    /// The latest `days` as-of dates for `symbol`, oldest first. One point per date, taken from
    /// that date's latest successful run.
    pub async fn symbol_history(&self, symbol: &str, days: u32) -> anyhow::Result<Vec<HistoryPoint>> {
        let rows: Vec<HistoryRow> = sqlx::query_as(
            "SELECT DISTINCT ON (s.as_of_date) s.as_of_date, s.close, s.change_percent, s.volume, \
             p.target_mid, p.recommendation \
             FROM market_snapshots s \
             JOIN pipeline_runs r ON r.id = s.run_id AND r.status = 'success' \
             LEFT JOIN projections p ON p.run_id = s.run_id AND p.symbol = s.symbol \
             WHERE s.symbol = $1 \
             ORDER BY s.as_of_date DESC, r.finished_at DESC \
             LIMIT $2",
        )
        .persistent(false)
        .bind(symbol.trim().to_ascii_uppercase())
        .bind(i64::from(days))
        .fetch_all(&self.pool)
        .await
        .context("select symbol history failed")?;

        let mut out = rows
            .into_iter()
            .map(HistoryPoint::try_from)
            .collect::<anyhow::Result<Vec<_>>>()?;
        out.reverse();
        Ok(out)
    }

    /// From the latest successful run for that date.
    pub async fn projection_for(
        &self,
        as_of_date: NaiveDate,
        symbol: &str,
    ) -> anyhow::Result<Option<Projection>> {
        let row: Option<ProjectionRow> = sqlx::query_as(&format!(
            "SELECT {PROJECTION_COLUMNS} FROM projections p \
             JOIN pipeline_runs r ON r.id = p.run_id \
             WHERE r.status = 'success' AND p.as_of_date = $1 AND p.symbol = $2 \
             ORDER BY r.finished_at DESC LIMIT 1"
        ))
        .persistent(false)
        .bind(as_of_date)
        .bind(symbol.trim().to_ascii_uppercase())
        .fetch_optional(&self.pool)
        .await
        .context("select projection failed")?;
        row.map(Projection::try_from).transpose()
    }
}

#[async_trait::async_trait]
impl StorageSink for PgStorage {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn store(&self, run: &StoredRun<'_>) -> anyhow::Result<()> {
        self.persist(run).await.map(|_| ())
    }
}

async fn insert_run(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    run: &StoredRun<'_>,
) -> anyhow::Result<()> {
    let counts = serde_json::to_value(run.counts).context("serialize counts failed")?;
    let api = serde_json::to_value(run.api).context("serialize api metrics failed")?;
    let summary = run
        .summary
        .map(serde_json::to_value)
        .transpose()
        .context("serialize market summary failed")?;
    let projection_summary = run
        .projection_summary
        .map(serde_json::to_value)
        .transpose()
        .context("serialize projection summary failed")?;
    let errors = serde_json::to_value(run.errors).context("serialize fetch errors failed")?;

    sqlx::query(
        "INSERT INTO pipeline_runs (id, as_of_date, started_at, finished_at, status, error, counts, \
         api_metrics, market_summary, projection_summary, fetch_errors) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
    )
    .persistent(false)
    .bind(run.run_id)
    .bind(run.as_of_date)
    .bind(run.started_at)
    .bind(run.finished_at)
    .bind(run.status.as_str())
    .bind(run.error)
    .bind(counts)
    .bind(api)
    .bind(summary)
    .bind(projection_summary)
    .bind(errors)
    .execute(&mut **tx)
    .await
    .context("insert pipeline_runs failed")?;
    Ok(())
}

impl TryFrom<RunRow> for RunRecord {
    type Error = anyhow::Error;

    fn try_from(r: RunRow) -> anyhow::Result<Self> {
        Ok(Self {
            market_summary: r
                .market_summary
                .map(serde_json::from_value)
                .transpose()
                .context("stored market_summary does not parse")?,
            projection_summary: r
                .projection_summary
                .map(serde_json::from_value)
                .transpose()
                .context("stored projection_summary does not parse")?,
            id: r.id,
            as_of_date: r.as_of_date,
            status: r.status,
            error: r.error,
            finished_at: r.finished_at,
            counts: r.counts,
            api_metrics: r.api_metrics,
        })
    }
}

impl TryFrom<HistoryRow> for HistoryPoint {
    type Error = anyhow::Error;

    fn try_from(r: HistoryRow) -> anyhow::Result<Self> {
        let recommendation = r
            .recommendation
            .map(|s| {
                Recommendation::parse(&s).with_context(|| format!("unknown recommendation {s:?}"))
            })
            .transpose()?;
        Ok(Self {
            as_of_date: r.as_of_date,
            close: r.close,
            change_percent: r.change_percent,
            volume: u64::try_from(r.volume).unwrap_or(0),
            target_mid: r.target_mid,
            recommendation,
        })
    }
}

impl From<SnapshotRow> for Snapshot {
    fn from(r: SnapshotRow) -> Self {
        Self {
            symbol: r.symbol,
            name: r.name,
            close: r.close,
            previous_close: r.previous_close,
            change: r.change,
            change_percent: r.change_percent,
            open: r.open,
            high: r.high,
            low: r.low,
            volume: u64::try_from(r.volume).unwrap_or(0),
            market_cap: r.market_cap,
            exchange: r.exchange,
            as_of_date: r.as_of_date,
        }
    }
}

impl TryFrom<ProjectionRow> for Projection {
    type Error = anyhow::Error;

    fn try_from(r: ProjectionRow) -> anyhow::Result<Self> {
        let recommendation = Recommendation::parse(&r.recommendation)
            .with_context(|| format!("unknown recommendation {:?}", r.recommendation))?;
        let trend = Trend::parse(&r.trend).with_context(|| format!("unknown trend {:?}", r.trend))?;
        let risk_level = RiskLevel::parse(&r.risk_level)
            .with_context(|| format!("unknown risk level {:?}", r.risk_level))?;
        Ok(Self {
            symbol: r.symbol,
            name: r.name,
            current_price: r.current_price,
            target_low: r.target_low,
            target_mid: r.target_mid,
            target_high: r.target_high,
            expected_change_percent: r.expected_change_percent,
            recommendation,
            confidence: r.confidence.clamp(0, 100) as u8,
            trend,
            momentum_score: r.momentum_score,
            volatility_score: r.volatility_score,
            risk_level,
            reason: r.reason,
            projection_date: r.projection_date,
            generated_at: r.generated_at,
        })
    }
}
