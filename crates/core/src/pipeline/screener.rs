use crate::domain::market::ScreeningCandidate;
use crate::ingest::error::FetchError;
use crate::ingest::provider::QuoteSource;
use crate::pipeline::cancel::CancelSignal;
use crate::pipeline::filters::ScreenFilters;
use crate::pipeline::pool::{dedup_symbols, run_bounded, PoolConfig};
use std::cmp::Ordering;
use std::sync::Arc;

#[derive(Debug)]
pub struct ScreenOutcome {
    /// Passing candidates, best first. Not truncated; the caller applies `top_n`.
    pub ranked: Vec<ScreeningCandidate>,
    pub screened: usize,
    pub rejected: usize,
    pub failures: Vec<FetchError>,
    pub cancelled: bool,
}

/// One quote-only call per symbol, filter, rank. Fetch failures are dropped from the ranking and
/// reported in `failures`.
pub async fn screen(
    source: Arc<dyn QuoteSource>,
    symbols: &[String],
    filters: &ScreenFilters,
    pool: &PoolConfig,
    cancel: &CancelSignal,
) -> ScreenOutcome {
    let symbols = dedup_symbols(symbols);
    tracing::info!(
        symbols = symbols.len(),
        workers = pool.workers,
        provider = source.provider_name(),
        "screening started"
    );

    let judge = filters.clone();
    let out = run_bounded("screen", symbols, pool, cancel, |symbol| {
        let source = source.clone();
        let judge = judge.clone();
        async move {
            let candidate = source.get_screening(&symbol).await?;
            let verdict = judge.judge(&candidate.quote);
            Ok(candidate.with_verdict(verdict))
        }
    })
    .await;

    let screened = out.ok.len();
    let (mut ranked, rejected): (Vec<_>, Vec<_>) = out.ok.into_iter().partition(|c| c.passed);
    for c in rejected.iter().take(5) {
        tracing::debug!(symbol = %c.symbol, verdict = %c.verdict, "screened out");
    }
    rank(&mut ranked);

    tracing::info!(
        screened,
        passed = ranked.len(),
        rejected = rejected.len(),
        failures = out.errors.len(),
        cancelled = out.cancelled,
        "screening finished"
    );

    ScreenOutcome {
        ranked,
        screened,
        rejected: rejected.len(),
        failures: out.errors,
        cancelled: out.cancelled,
    }
}

/// Largest absolute move first; ties by higher volume, then symbol for a stable order.
pub fn rank(candidates: &mut [ScreeningCandidate]) {
    candidates.sort_by(|a, b| {
        b.change_percent
            .abs()
            .partial_cmp(&a.change_percent.abs())
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.quote.volume.cmp(&a.quote.volume))
            .then_with(|| a.symbol.cmp(&b.symbol))
    });
}
