use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use marketpulse_core::config::Settings;
use marketpulse_core::domain::market::Snapshot;
use marketpulse_core::domain::projection::{Projection, ProjectionSummary, Recommendation};
use marketpulse_core::ingest::universe;
use marketpulse_core::pipeline::filters::ScreenFilters;
use marketpulse_core::pipeline::{CancelSignal, Pipeline, PipelineConfig, PipelineResult};
use marketpulse_core::storage::lock::AsOfDateLock;
use marketpulse_core::storage::postgres::{HistoryPoint, PgStorage, RunRecord};
use marketpulse_core::storage::{StorageSink, StoredRun};
use marketpulse_core::time::us_market::TradingCalendar;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod refresh;

use refresh::{RefreshRequest, RefreshStatus, RefreshTracker};

const DEFAULT_OPPORTUNITY_LIMIT: usize = 10;
const MAX_OPPORTUNITY_LIMIT: usize = 50;
const DEFAULT_MOVER_LIMIT: usize = 10;
const MAX_MOVER_LIMIT: usize = 50;
const DEFAULT_HISTORY_DAYS: u32 = 30;
const MAX_HISTORY_DAYS: u32 = 365;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();
    let pool: Option<PgPool> = match settings.require_database_url() {
        Ok(db_url) => match sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await
        {
            Ok(pool) => match marketpulse_core::storage::migrate(&pool).await {
                Ok(()) => Some(pool),
                Err(e) => {
                    sentry_anyhow::capture_anyhow(&e);
                    tracing::error!(error = %e, "db migrations failed; starting API in degraded mode");
                    None
                }
            },
            Err(e) => {
                let err = anyhow::Error::new(e);
                sentry_anyhow::capture_anyhow(&err);
                tracing::error!(error = %err, "db connect failed; starting API in degraded mode");
                None
            }
        },
        Err(e) => {
            tracing::warn!(error = %e, "DATABASE_URL missing; starting API in degraded mode");
            None
        }
    };

    let state = AppState {
        storage: pool.map(PgStorage::new),
        settings: Arc::new(settings),
        refresh: RefreshTracker::default(),
    };

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/market/latest", get(get_latest_market))
        .route("/market/movers", get(get_market_movers))
        .route("/market/:as_of_date", get(get_market_by_date))
        .route("/stocks/:key", get(get_stocks))
        .route("/stocks/:key/historical", get(get_stock_history))
        .route("/projections/summary", get(get_projection_summary))
        .route("/projections/opportunities", get(get_opportunities))
        .route("/projections/:as_of_date/:symbol", get(get_projection))
        .route("/refresh", post(start_refresh))
        .route("/refresh/status", get(get_refresh_status))
        .route("/refresh/cancel", post(cancel_refresh))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3000);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));

    tracing::info!(%addr, "api listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Clone)]
struct AppState {
    storage: Option<PgStorage>,
    settings: Arc<Settings>,
    refresh: RefreshTracker,
}

impl AppState {
    fn storage(&self) -> Result<&PgStorage, StatusCode> {
        self.storage.as_ref().ok_or(StatusCode::SERVICE_UNAVAILABLE)
    }
}

fn internal_error(e: anyhow::Error) -> StatusCode {
    sentry_anyhow::capture_anyhow(&e);
    tracing::error!(error = ?e, "request failed");
    StatusCode::INTERNAL_SERVER_ERROR
}

fn parse_date(s: &str) -> Result<NaiveDate, StatusCode> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| StatusCode::BAD_REQUEST)
}

async fn get_latest_market(State(state): State<AppState>) -> Result<Json<RunRecord>, StatusCode> {
    let run = state
        .storage()?
        .latest_run()
        .await
        .map_err(internal_error)?
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(run))
}

async fn get_market_by_date(
    State(state): State<AppState>,
    Path(as_of_date): Path<String>,
) -> Result<Json<RunRecord>, StatusCode> {
    let as_of_date = parse_date(&as_of_date)?;
    let run = state
        .storage()?
        .run_for_date(as_of_date)
        .await
        .map_err(internal_error)?
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(run))
}

#[derive(Debug, Deserialize)]
struct MoverQuery {
    #[serde(rename = "type")]
    kind: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MoverKind {
    Gainers,
    Losers,
}

impl MoverKind {
    fn parse(s: Option<&str>) -> Option<Self> {
        match s.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            None | Some("") | Some("gainers") => Some(Self::Gainers),
            Some("losers") => Some(Self::Losers),
            _ => None,
        }
    }
}

/// Largest moves in the requested direction, ties broken by symbol.
fn select_movers(mut snapshots: Vec<Snapshot>, kind: MoverKind, limit: usize) -> Vec<Snapshot> {
    snapshots.sort_by(|a, b| {
        let ord = match kind {
            MoverKind::Gainers => b.change_percent.total_cmp(&a.change_percent),
            MoverKind::Losers => a.change_percent.total_cmp(&b.change_percent),
        };
        ord.then_with(|| a.symbol.cmp(&b.symbol))
    });
    snapshots.truncate(limit);
    snapshots
}

async fn get_market_movers(
    State(state): State<AppState>,
    Query(q): Query<MoverQuery>,
) -> Result<Json<Vec<Snapshot>>, StatusCode> {
    let kind = MoverKind::parse(q.kind.as_deref()).ok_or(StatusCode::BAD_REQUEST)?;
    let limit = q.limit.unwrap_or(DEFAULT_MOVER_LIMIT).clamp(1, MAX_MOVER_LIMIT);

    let storage = state.storage()?;
    let run = storage
        .latest_run()
        .await
        .map_err(internal_error)?
        .ok_or(StatusCode::NOT_FOUND)?;
    let snapshots = storage.snapshots_for_run(run.id).await.map_err(internal_error)?;
    Ok(Json(select_movers(snapshots, kind, limit)))
}

/// `/stocks/:key` serves both the per-date listing and the per-symbol detail.
#[derive(Debug, Clone, PartialEq, Eq)]
enum StocksKey {
    Date(NaiveDate),
    Symbol(String),
}

impl StocksKey {
    fn parse(key: &str) -> Result<Self, StatusCode> {
        let key = key.trim();
        if key.len() == 10 && key.as_bytes()[4] == b'-' && key.as_bytes()[7] == b'-' {
            return parse_date(key).map(Self::Date);
        }
        parse_symbol(key).map(Self::Symbol)
    }
}

fn parse_symbol(s: &str) -> Result<String, StatusCode> {
    let s = s.trim();
    let valid = !s.is_empty()
        && s.len() <= 12
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-');
    if valid {
        Ok(s.to_ascii_uppercase())
    } else {
        Err(StatusCode::BAD_REQUEST)
    }
}

#[derive(Debug, Serialize)]
struct StockDetail {
    as_of_date: NaiveDate,
    snapshot: Snapshot,
    projection: Option<Projection>,
}

async fn get_stocks(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Response, StatusCode> {
    let storage = state.storage()?;
    match StocksKey::parse(&key)? {
        StocksKey::Date(as_of_date) => {
            let run = storage
                .run_for_date(as_of_date)
                .await
                .map_err(internal_error)?
                .ok_or(StatusCode::NOT_FOUND)?;
            let snapshots = storage.snapshots_for_run(run.id).await.map_err(internal_error)?;
            Ok(Json(snapshots).into_response())
        }
        StocksKey::Symbol(symbol) => {
            let run = storage
                .latest_run()
                .await
                .map_err(internal_error)?
                .ok_or(StatusCode::NOT_FOUND)?;
            let snapshot = storage
                .snapshot_in_run(run.id, &symbol)
                .await
                .map_err(internal_error)?
                .ok_or(StatusCode::NOT_FOUND)?;
            let projection = storage
                .projection_for(run.as_of_date, &symbol)
                .await
                .map_err(internal_error)?;
            Ok(Json(StockDetail {
                as_of_date: run.as_of_date,
                snapshot,
                projection,
            })
            .into_response())
        }
    }
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    days: Option<u32>,
}

fn history_days(days: Option<u32>) -> u32 {
    days.unwrap_or(DEFAULT_HISTORY_DAYS).clamp(1, MAX_HISTORY_DAYS)
}

async fn get_stock_history(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(q): Query<HistoryQuery>,
) -> Result<Json<Vec<HistoryPoint>>, StatusCode> {
    let symbol = parse_symbol(&key)?;
    let points = state
        .storage()?
        .symbol_history(&symbol, history_days(q.days))
        .await
        .map_err(internal_error)?;
    if points.is_empty() {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(points))
}

async fn get_projection_summary(
    State(state): State<AppState>,
) -> Result<Json<ProjectionSummary>, StatusCode> {
    let run = state
        .storage()?
        .latest_run()
        .await
        .map_err(internal_error)?
        .ok_or(StatusCode::NOT_FOUND)?;
    run.projection_summary
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

#[derive(Debug, Deserialize)]
struct OpportunityQuery {
    #[serde(rename = "type")]
    kind: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpportunityKind {
    Buy,
    Sell,
    All,
}

impl OpportunityKind {
    fn parse(s: Option<&str>) -> Option<Self> {
        match s.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            None | Some("") | Some("all") => Some(Self::All),
            Some("buy") => Some(Self::Buy),
            Some("sell") => Some(Self::Sell),
            _ => None,
        }
    }

    fn admits(self, r: Recommendation) -> bool {
        match self {
            Self::Buy => matches!(r, Recommendation::StrongBuy | Recommendation::Buy),
            Self::Sell => matches!(r, Recommendation::StrongSell | Recommendation::Sell),
            Self::All => r != Recommendation::Hold,
        }
    }
}

/// Highest-confidence actionable projections from the latest run.
fn select_opportunities(
    mut projections: Vec<Projection>,
    kind: OpportunityKind,
    limit: usize,
) -> Vec<Projection> {
    projections.retain(|p| kind.admits(p.recommendation));
    projections.sort_by(|a, b| {
        b.confidence
            .cmp(&a.confidence)
            .then_with(|| a.symbol.cmp(&b.symbol))
    });
    projections.truncate(limit);
    projections
}

async fn get_opportunities(
    State(state): State<AppState>,
    Query(q): Query<OpportunityQuery>,
) -> Result<Json<Vec<Projection>>, StatusCode> {
    let kind = OpportunityKind::parse(q.kind.as_deref()).ok_or(StatusCode::BAD_REQUEST)?;
    let limit = q
        .limit
        .unwrap_or(DEFAULT_OPPORTUNITY_LIMIT)
        .clamp(1, MAX_OPPORTUNITY_LIMIT);

    let storage = state.storage()?;
    let run = storage
        .latest_run()
        .await
        .map_err(internal_error)?
        .ok_or(StatusCode::NOT_FOUND)?;
    let projections = storage.projections_for_run(run.id).await.map_err(internal_error)?;
    Ok(Json(select_opportunities(projections, kind, limit)))
}

async fn get_projection(
    State(state): State<AppState>,
    Path((as_of_date, symbol)): Path<(String, String)>,
) -> Result<Json<Projection>, StatusCode> {
    let as_of_date = parse_date(&as_of_date)?;
    let projection = state
        .storage()?
        .projection_for(as_of_date, &symbol)
        .await
        .map_err(internal_error)?
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(projection))
}

async fn start_refresh(
    State(state): State<AppState>,
    body: Option<Json<RefreshRequest>>,
) -> Result<(StatusCode, Json<RefreshStatus>), (StatusCode, Json<RefreshStatus>)> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let as_of_date = TradingCalendar::from_env()
        .resolve_as_of_date(req.as_of_date.as_deref(), chrono::Utc::now())
        .map_err(|_| (StatusCode::BAD_REQUEST, Json(state.refresh.status())))?;

    let Some(cancel) = state.refresh.try_begin(as_of_date) else {
        return Err((StatusCode::CONFLICT, Json(state.refresh.status())));
    };

    tracing::info!(%as_of_date, "refresh started");
    let task_state = state.clone();
    tokio::spawn(async move {
        match run_refresh(&task_state, &req, as_of_date, &cancel).await {
            Ok((result, persisted)) => task_state.refresh.finish(&result, persisted),
            Err(err) => {
                sentry_anyhow::capture_anyhow(&err);
                tracing::error!(%as_of_date, error = ?err, "refresh failed before completing");
                task_state.refresh.fail(format!("{err:#}"));
            }
        }
    });

    Ok((StatusCode::ACCEPTED, Json(state.refresh.status())))
}

async fn run_refresh(
    state: &AppState,
    req: &RefreshRequest,
    as_of_date: NaiveDate,
    cancel: &CancelSignal,
) -> anyhow::Result<(PipelineResult, bool)> {
    let settings = state.settings.as_ref();
    let filters = ScreenFilters::from_settings(settings)?;
    let pipeline = Pipeline::from_settings(settings, PipelineConfig::from_env())?;
    let top_n = req.top_n.unwrap_or(filters.top_n);
    let indices = req
        .indices
        .clone()
        .unwrap_or_else(|| settings.tracked_indices.clone());

    let lock = match &state.storage {
        Some(storage) => match AsOfDateLock::try_acquire(storage.pool(), as_of_date).await? {
            Some(lock) => Some(lock),
            None => anyhow::bail!("another run for {as_of_date} is in progress"),
        },
        None => None,
    };

    let universe = match universe::from_settings(settings).constituents(&indices).await {
        Ok(entries) => entries,
        Err(err) => {
            tracing::error!(error = ?err, ?indices, "universe provider failed");
            Vec::new()
        }
    };

    let result = pipeline
        .run_pipeline(&universe, &filters, top_n, as_of_date, cancel)
        .await;

    let persisted = match (&state.storage, lock) {
        (Some(storage), Some(lock)) => {
            let stored = storage.store(&StoredRun::from(&result)).await;
            if let Err(err) = lock.release().await {
                tracing::warn!(error = ?err, %as_of_date, "failed to release as_of_date lock");
            }
            stored?;
            true
        }
        _ => false,
    };
    Ok((result, persisted))
}

async fn get_refresh_status(State(state): State<AppState>) -> Json<RefreshStatus> {
    Json(state.refresh.status())
}

async fn cancel_refresh(State(state): State<AppState>) -> (StatusCode, Json<RefreshStatus>) {
    let code = if state.refresh.cancel() {
        tracing::warn!("refresh cancel requested");
        StatusCode::ACCEPTED
    } else {
        StatusCode::CONFLICT
    };
    (code, Json(state.refresh.status()))
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn init_sentry(settings: &Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}
