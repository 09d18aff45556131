use crate::domain::market::{Profile, Quote, ScreeningCandidate, Snapshot};
use crate::ingest::error::{FetchCause, FetchError};
use chrono::NaiveDate;

/// Per-symbol access to the upstream quote API. Every method is one or more rate-limited calls.
#[async_trait::async_trait]
pub trait QuoteSource: Send + Sync {
    fn provider_name(&self) -> &'static str;

    async fn get_quote(&self, symbol: &str) -> Result<Quote, FetchError>;

    async fn get_profile(&self, symbol: &str) -> Result<Profile, FetchError>;

    /// Quote only; one call.
    async fn get_screening(&self, symbol: &str) -> Result<ScreeningCandidate, FetchError> {
        let quote = self.get_quote(symbol).await?;
        Ok(ScreeningCandidate::from_quote(quote))
    }

    /// Quote + profile; two calls. A failed profile degrades to a placeholder.
    async fn get_full(&self, symbol: &str, as_of_date: NaiveDate) -> Result<Snapshot, FetchError> {
        let quote = self.get_quote(symbol).await?;

        let profile = match self.get_profile(symbol).await {
            Ok(profile) => profile,
            Err(err) => {
                tracing::warn!(%symbol, error = %err, "profile fetch failed; using placeholder");
                Profile::placeholder(symbol)
            }
        };

        Snapshot::try_from_parts(&quote, &profile, as_of_date)
            .map_err(|err| FetchError::new(symbol, FetchCause::Malformed(format!("{err:#}"))))
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! Scripted in-memory source for pipeline tests.

    use super::*;
    use crate::domain::market::fixtures;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug, Clone)]
    pub enum Script {
        Quote { price: f64, change_percent: f64, volume: u64 },
        Fail(FetchCause),
        /// Sleeps before answering with a 1% move.
        Slow(Duration),
    }

    #[derive(Debug, Default)]
    pub struct FakeSource {
        scripts: HashMap<String, Script>,
        pub quote_calls: AtomicUsize,
        pub profile_calls: AtomicUsize,
        pub requested: Mutex<Vec<String>>,
    }

    impl FakeSource {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with(mut self, symbol: &str, script: Script) -> Self {
            self.scripts.insert(symbol.to_string(), script);
            self
        }

        pub fn quote(self, symbol: &str, price: f64, change_percent: f64, volume: u64) -> Self {
            self.with(
                symbol,
                Script::Quote {
                    price,
                    change_percent,
                    volume,
                },
            )
        }
    }

    #[async_trait::async_trait]
    impl QuoteSource for FakeSource {
        fn provider_name(&self) -> &'static str {
            "fake"
        }

        async fn get_quote(&self, symbol: &str) -> Result<Quote, FetchError> {
            self.quote_calls.fetch_add(1, Ordering::SeqCst);
            self.requested.lock().unwrap().push(symbol.to_string());
            match self.scripts.get(symbol).cloned() {
                Some(Script::Quote {
                    price,
                    change_percent,
                    volume,
                }) => {
                    let previous_close = price / (1.0 + change_percent / 100.0);
                    Ok(fixtures::quote(symbol, price, previous_close, volume))
                }
                Some(Script::Fail(cause)) => Err(FetchError::new(symbol, cause)),
                Some(Script::Slow(delay)) => {
                    tokio::time::sleep(delay).await;
                    Ok(fixtures::quote(symbol, 101.0, 100.0, 2_000_000))
                }
                None => Err(FetchError::new(symbol, FetchCause::NotFound)),
            }
        }

        async fn get_profile(&self, symbol: &str) -> Result<Profile, FetchError> {
            self.profile_calls.fetch_add(1, Ordering::SeqCst);
            Ok(Profile {
                symbol: symbol.to_string(),
                name: format!("{symbol} Corp"),
                market_cap: Some(5_000_000_000.0),
                exchange: "NYSE".to_string(),
            })
        }
    }
}
