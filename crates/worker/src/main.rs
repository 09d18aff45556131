use anyhow::Context;
use clap::Parser;
use marketpulse_core::alerts::AlertEngine;
use marketpulse_core::ingest::universe;
use marketpulse_core::pipeline::filters::ScreenFilters;
use marketpulse_core::pipeline::{CancelSignal, Pipeline, PipelineConfig, PipelineResult};
use marketpulse_core::storage::StoredRun;
use marketpulse_core::time::us_market::TradingCalendar;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod sink;

#[derive(Debug, Parser)]
#[command(name = "marketpulse_worker")]
struct Args {
    /// Market as-of date (YYYY-MM-DD). Defaults to the latest completed US trading day.
    #[arg(long)]
    as_of_date: Option<String>,

    /// Run the pipeline but persist nothing.
    #[arg(long)]
    dry_run: bool,

    /// How many screened symbols get the full fetch. Defaults to the filter record's top_n.
    #[arg(long)]
    top_n: Option<usize>,

    /// Comma-separated index names. Defaults to TRACKED_INDICES.
    #[arg(long, value_delimiter = ',')]
    indices: Vec<String>,

    /// Skip screening and fetch the first top_n universe symbols directly.
    #[arg(long)]
    no_screener: bool,

    /// Write run_<date>.json here instead of the database.
    #[arg(long)]
    output_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = marketpulse_core::config::Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();

    let args = Args::parse();

    let calendar = TradingCalendar::from_env();
    let as_of_date = calendar.resolve_as_of_date(args.as_of_date.as_deref(), chrono::Utc::now())?;

    let filters = ScreenFilters::from_settings(&settings)?;
    let top_n = args.top_n.unwrap_or(filters.top_n);
    let indices = if args.indices.is_empty() {
        settings.tracked_indices.clone()
    } else {
        args.indices.clone()
    };

    let mut config = PipelineConfig::from_env();
    config.use_screener = !args.no_screener;
    let pipeline = Pipeline::from_settings(&settings, config)?;
    let alerts = AlertEngine::from_settings(&settings)?;

    let destination = if args.dry_run {
        None
    } else {
        match sink::open(&settings, args.output_dir.as_deref(), as_of_date).await? {
            Some(d) => Some(d),
            None => {
                tracing::warn!(%as_of_date, "as_of_date lock not acquired; another run in progress");
                return Ok(());
            }
        }
    };

    let universe = match universe::from_settings(&settings).constituents(&indices).await {
        Ok(entries) => entries,
        Err(err) => {
            // An empty universe fails the run below, so the failure still gets recorded.
            tracing::error!(error = ?err, ?indices, "universe provider failed");
            Vec::new()
        }
    };

    let cancel = CancelSignal::new();
    spawn_ctrl_c(cancel.clone());

    tracing::info!(
        %as_of_date,
        dry_run = args.dry_run,
        top_n,
        universe_len = universe.len(),
        use_screener = !args.no_screener,
        "starting pipeline run"
    );
    let result = pipeline
        .run_pipeline(&universe, &filters, top_n, as_of_date, &cancel)
        .await;

    match destination {
        Some(destination) => {
            let name = destination.name();
            destination
                .store_and_release(&StoredRun::from(&result))
                .await
                .with_context(|| format!("failed to store run via {name}"))?;
        }
        None => log_dry_run(&result),
    }

    if result.success {
        if let Some(alerts) = &alerts {
            evaluate_alerts(alerts, &result).await;
        }
    } else {
        let reason = result.failure.as_deref().unwrap_or("unknown failure");
        let err = anyhow::anyhow!("pipeline run {} failed: {reason}", result.run_id);
        sentry_anyhow::capture_anyhow(&err);
        return Err(err);
    }
    Ok(())
}

fn spawn_ctrl_c(cancel: CancelSignal) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("ctrl-c received; cancelling after in-flight symbols drain");
            cancel.cancel();
        }
    });
}

async fn evaluate_alerts(alerts: &AlertEngine, result: &PipelineResult) {
    match alerts.evaluate(&result.snapshots, chrono::Utc::now()).await {
        Ok(fired) => tracing::info!(run_id = %result.run_id, fired = fired.len(), "alerts evaluated"),
        Err(err) => tracing::warn!(error = ?err, run_id = %result.run_id, "alert evaluation failed"),
    }
}

fn log_dry_run(result: &PipelineResult) {
    let top_movers: Vec<String> = result
        .summary
        .iter()
        .flat_map(|s| s.top_gainers.iter().chain(s.top_losers.iter()))
        .map(|m| format!("{} {:+.2}%", m.symbol, m.change_percent))
        .collect();
    tracing::info!(
        as_of_date = %result.as_of_date,
        run_id = %result.run_id,
        dry_run = true,
        success = result.success,
        snapshots = result.snapshots.len(),
        projections = result.projections.len(),
        errors = result.errors.len(),
        ?top_movers,
        sentiment = result.projection_summary.as_ref().map(|p| p.sentiment.as_str()),
        "dry run finished; nothing persisted"
    );
}

fn init_sentry(settings: &marketpulse_core::config::Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}
