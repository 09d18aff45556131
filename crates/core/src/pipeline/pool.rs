use crate::config::env_parse;
use crate::ingest::error::{FetchCause, FetchError};
use crate::pipeline::cancel::CancelSignal;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

const DEFAULT_WORKERS: usize = 2;
const DEFAULT_DEADLINE_SECS: u64 = 120;
const MAX_LOGGED_FAILURES: usize = 10;

/// Sizing and pacing for one stage's worker pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub workers: usize,
    /// Every `stagger_every`-th dispatch waits `stagger` first. 0 disables.
    pub stagger_every: usize,
    pub stagger: Duration,
    /// Wall-clock ceiling for one symbol's work, retries included.
    pub deadline: Duration,
    pub progress_every: usize,
}

impl PoolConfig {
    pub fn screening() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            stagger_every: 10,
            stagger: Duration::from_millis(200),
            deadline: Duration::from_secs(DEFAULT_DEADLINE_SECS),
            progress_every: 50,
        }
    }

    pub fn fetching() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            stagger_every: 5,
            stagger: Duration::from_millis(300),
            deadline: Duration::from_secs(DEFAULT_DEADLINE_SECS),
            progress_every: 10,
        }
    }

    pub fn screening_from_env() -> Self {
        Self::screening().with_env("SCREEN")
    }

    pub fn fetching_from_env() -> Self {
        Self::fetching().with_env("FETCH")
    }

    fn with_env(mut self, prefix: &str) -> Self {
        if let Some(n) = env_parse::<usize>(&format!("{prefix}_WORKERS")) {
            self.workers = n.max(1);
        }
        if let Some(n) = env_parse::<usize>(&format!("{prefix}_STAGGER_EVERY")) {
            self.stagger_every = n;
        }
        if let Some(ms) = env_parse::<u64>(&format!("{prefix}_STAGGER_MS")) {
            self.stagger = Duration::from_millis(ms);
        }
        if let Some(secs) = env_parse::<u64>("SYMBOL_DEADLINE_SECS") {
            self.deadline = Duration::from_secs(secs.max(1));
        }
        self
    }
}

#[derive(Debug)]
pub struct PoolOutcome<T> {
    pub ok: Vec<T>,
    pub errors: Vec<FetchError>,
    pub dispatched: usize,
    pub cancelled: bool,
}

/// Drops repeats and blanks, keeping first-seen order.
pub fn dedup_symbols<I, S>(symbols: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    symbols
        .into_iter()
        .map(|s| s.as_ref().trim().to_string())
        .filter(|s| !s.is_empty() && seen.insert(s.clone()))
        .collect()
}

/// Runs `work` once per symbol on at most `config.workers` concurrent tasks.
///
/// Dispatch stops early when `cancel` is raised; tasks already running drain normally. Each
/// symbol is bounded by `config.deadline` and an expired deadline is reported as a
/// [`FetchCause::DeadlineExceeded`] error. Per-symbol failures never stop the batch.
pub async fn run_bounded<T, F, Fut>(
    stage: &'static str,
    symbols: Vec<String>,
    config: &PoolConfig,
    cancel: &CancelSignal,
    work: F,
) -> PoolOutcome<T>
where
    T: Send + 'static,
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
{
    let total = symbols.len();
    let semaphore = Arc::new(Semaphore::new(config.workers.max(1)));
    let mut set: JoinSet<(String, Result<T, FetchError>)> = JoinSet::new();
    let mut outcome = PoolOutcome {
        ok: Vec::with_capacity(total),
        errors: Vec::new(),
        dispatched: 0,
        cancelled: false,
    };

    for (idx, symbol) in symbols.into_iter().enumerate() {
        if idx != 0
            && config.stagger_every != 0
            && idx % config.stagger_every == 0
            && !config.stagger.is_zero()
        {
            tokio::time::sleep(config.stagger).await;
        }

        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            break;
        };

        // Checked after the wait for a free worker, which is where a long run spends its time.
        if cancel.is_cancelled() {
            outcome.cancelled = true;
            tracing::warn!(
                stage,
                dispatched = outcome.dispatched,
                total,
                "cancellation requested; draining in-flight work"
            );
            break;
        }

        let fut = work(symbol.clone());
        let deadline = config.deadline;
        set.spawn(async move {
            let _permit = permit;
            let res = match tokio::time::timeout(deadline, fut).await {
                Ok(res) => res,
                Err(_) => Err(FetchError::new(
                    symbol.clone(),
                    FetchCause::DeadlineExceeded(deadline),
                )),
            };
            (symbol, res)
        });
        outcome.dispatched += 1;
    }

    let mut done = 0usize;
    while let Some(joined) = set.join_next().await {
        done += 1;
        match joined {
            Ok((_, Ok(item))) => outcome.ok.push(item),
            Ok((symbol, Err(err))) => {
                if outcome.errors.len() < MAX_LOGGED_FAILURES {
                    tracing::warn!(
                        stage,
                        %symbol,
                        failure_count = outcome.errors.len() + 1,
                        error = %err.cause,
                        "symbol failed; skipping"
                    );
                }
                outcome.errors.push(err);
            }
            Err(join_err) => {
                tracing::error!(stage, error = %join_err, "pool task aborted");
            }
        }

        if config.progress_every != 0
            && (done == outcome.dispatched || done % config.progress_every == 0)
        {
            tracing::info!(
                stage,
                processed = done,
                dispatched = outcome.dispatched,
                total,
                ok = outcome.ok.len(),
                failures = outcome.errors.len(),
                "pool progress"
            );
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn quick() -> PoolConfig {
        PoolConfig {
            workers: 3,
            stagger_every: 0,
            stagger: Duration::ZERO,
            deadline: Duration::from_secs(5),
            progress_every: 0,
        }
    }

    #[test]
    fn dedup_keeps_first_occurrence() {
        assert_eq!(
            dedup_symbols(["AAPL", " MSFT", "AAPL", "", "MSFT ", "NVDA"]),
            vec!["AAPL", "MSFT", "NVDA"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_worker_count() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let symbols: Vec<String> = (0..12).map(|i| format!("S{i}")).collect();

        let out = run_bounded("test", symbols, &quick(), &CancelSignal::new(), |s| {
            let running = running.clone();
            let peak = peak.clone();
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, FetchError>(s)
            }
        })
        .await;

        assert_eq!(out.ok.len(), 12);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_becomes_fetch_error() {
        let symbols = vec!["FAST".to_string(), "STUCK".to_string()];
        let out = run_bounded("test", symbols, &quick(), &CancelSignal::new(), |s| async move {
            if s == "STUCK" {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            Ok::<_, FetchError>(s)
        })
        .await;

        assert_eq!(out.ok, vec!["FAST".to_string()]);
        assert_eq!(out.errors.len(), 1);
        assert_eq!(out.errors[0].symbol, "STUCK");
        assert_eq!(
            out.errors[0].cause,
            FetchCause::DeadlineExceeded(Duration::from_secs(5))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_dispatch_but_drains_in_flight() {
        let cancel = CancelSignal::new();
        let symbols: Vec<String> = (0..10).map(|i| format!("S{i}")).collect();
        let config = PoolConfig {
            workers: 2,
            ..quick()
        };

        let trigger = cancel.clone();
        let out = run_bounded("test", symbols, &config, &cancel, move |s| {
            let trigger = trigger.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                if s == "S1" {
                    trigger.cancel();
                }
                Ok::<_, FetchError>(s)
            }
        })
        .await;

        assert!(out.cancelled);
        assert_eq!(out.ok.len(), out.dispatched);
        assert!(out.dispatched < 10);
    }

    #[tokio::test(start_paused = true)]
    async fn stagger_spaces_out_dispatch() {
        let config = PoolConfig {
            workers: 10,
            stagger_every: 2,
            stagger: Duration::from_secs(1),
            ..quick()
        };
        let start = tokio::time::Instant::now();
        let symbols: Vec<String> = (0..6).map(|i| format!("S{i}")).collect();
        let out = run_bounded("test", symbols, &config, &CancelSignal::new(), |s| async move {
            Ok::<_, FetchError>((s, tokio::time::Instant::now()))
        })
        .await;

        let last = out.ok.iter().map(|(_, at)| *at).max().unwrap();
        assert!(last.duration_since(start) >= Duration::from_secs(2));
    }
}
