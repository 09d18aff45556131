use crate::domain::market::Snapshot;
use crate::ingest::error::FetchError;
use crate::ingest::provider::QuoteSource;
use crate::pipeline::cancel::CancelSignal;
use crate::pipeline::pool::{dedup_symbols, run_bounded, PoolConfig};
use chrono::NaiveDate;
use std::sync::Arc;

#[derive(Debug)]
pub struct FetchOutcome {
    /// At most one per requested symbol, sorted by symbol.
    pub snapshots: Vec<Snapshot>,
    pub errors: Vec<FetchError>,
    pub cancelled: bool,
}

/// Full (quote + profile) pull for an already-shortlisted symbol list.
pub async fn fetch_full(
    source: Arc<dyn QuoteSource>,
    symbols: &[String],
    as_of_date: NaiveDate,
    pool: &PoolConfig,
    cancel: &CancelSignal,
) -> FetchOutcome {
    let symbols = dedup_symbols(symbols);
    tracing::info!(
        symbols = symbols.len(),
        workers = pool.workers,
        %as_of_date,
        "full fetch started"
    );

    let out = run_bounded("fetch", symbols, pool, cancel, |symbol| {
        let source = source.clone();
        async move { source.get_full(&symbol, as_of_date).await }
    })
    .await;

    let mut snapshots = out.ok;
    snapshots.sort_by(|a, b| a.symbol.cmp(&b.symbol));

    tracing::info!(
        fetched = snapshots.len(),
        failed = out.errors.len(),
        cancelled = out.cancelled,
        %as_of_date,
        "full fetch finished"
    );

    FetchOutcome {
        snapshots,
        errors: out.errors,
        cancelled: out.cancelled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::error::FetchCause;
    use crate::ingest::provider::fake::{FakeSource, Script};
    use std::time::Duration;

    fn as_of() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, 27).unwrap()
    }

    fn pool() -> PoolConfig {
        PoolConfig {
            workers: 4,
            stagger_every: 5,
            stagger: Duration::from_millis(300),
            deadline: Duration::from_secs(120),
            progress_every: 0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_become_errors_without_aborting_batch() {
        let mut source = FakeSource::new();
        let mut symbols = Vec::new();
        for i in 0..20 {
            let symbol = format!("SYM{i:02}");
            source = if i % 7 == 3 {
                source.with(&symbol, Script::Slow(Duration::from_secs(600)))
            } else {
                source.quote(&symbol, 40.0 + i as f64, 2.5, 3_000_000)
            };
            symbols.push(symbol);
        }

        let out = fetch_full(Arc::new(source), &symbols, as_of(), &pool(), &CancelSignal::new()).await;

        assert_eq!(out.snapshots.len(), 17);
        assert_eq!(out.errors.len(), 3);
        assert!(out
            .errors
            .iter()
            .all(|e| matches!(e.cause, FetchCause::DeadlineExceeded(_))));
        assert!(out.snapshots.iter().all(|s| s.validate().is_ok()));
    }

    #[tokio::test]
    async fn one_snapshot_per_symbol() {
        let source = Arc::new(FakeSource::new().quote("AAPL", 200.0, 1.0, 5_000_000));
        let symbols = vec!["AAPL".to_string(), "AAPL".to_string(), "UNKNOWN".to_string()];
        let out = fetch_full(source.clone(), &symbols, as_of(), &pool(), &CancelSignal::new()).await;

        assert_eq!(out.snapshots.len(), 1);
        assert_eq!(out.snapshots[0].as_of_date, as_of());
        assert_eq!(out.errors.len(), 1);
        assert_eq!(out.errors[0].cause, FetchCause::NotFound);
        assert_eq!(source.profile_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn raised_cancel_dispatches_nothing() {
        let cancel = CancelSignal::new();
        cancel.cancel();
        let source = Arc::new(FakeSource::new().quote("AAPL", 200.0, 1.0, 5_000_000));
        let out = fetch_full(source, &["AAPL".to_string()], as_of(), &pool(), &cancel).await;
        assert!(out.cancelled);
        assert!(out.snapshots.is_empty());
        assert!(out.errors.is_empty());
    }
}
