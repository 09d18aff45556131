//! Wire shapes of the upstream quote API and their validation into domain types.

use crate::domain::market::{Profile, Quote};
use crate::ingest::error::FetchCause;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

/// Upstream millions -> currency units.
const MARKET_CAP_UNIT: f64 = 1_000_000.0;

#[derive(Debug, Clone, Deserialize)]
pub struct WireQuote {
    /// Current price.
    pub c: Option<f64>,
    pub h: Option<f64>,
    pub l: Option<f64>,
    pub o: Option<f64>,
    /// Previous close.
    pub pc: Option<f64>,
    /// Unix seconds.
    pub t: Option<i64>,
    pub v: Option<f64>,
    pub error: Option<String>,
}

impl WireQuote {
    pub fn validate_and_into_quote(
        self,
        symbol: &str,
        fetched_at: DateTime<Utc>,
    ) -> Result<Quote, FetchCause> {
        if let Some(err) = self.error {
            return Err(FetchCause::Api(err));
        }

        let price = self
            .c
            .ok_or_else(|| FetchCause::Malformed("quote has no current price".to_string()))?;
        let previous_close = self.pc.unwrap_or(price);

        // Unknown tickers come back as an all-zero quote.
        if price == 0.0 && previous_close == 0.0 {
            return Err(FetchCause::NotFound);
        }
        if !price.is_finite() || price <= 0.0 {
            return Err(FetchCause::Malformed(format!("non-positive price {price}")));
        }
        if !previous_close.is_finite() {
            return Err(FetchCause::Malformed("non-finite previous close".to_string()));
        }

        let volume = match self.v {
            Some(v) if v.is_finite() && v >= 0.0 => v.round() as u64,
            Some(v) => return Err(FetchCause::Malformed(format!("invalid volume {v}"))),
            None => 0,
        };

        let timestamp = self
            .t
            .filter(|t| *t > 0)
            .and_then(|t| Utc.timestamp_opt(t, 0).single())
            .unwrap_or(fetched_at);

        Ok(Quote {
            symbol: symbol.to_string(),
            price,
            previous_close,
            open: positive(self.o),
            high: positive(self.h),
            low: positive(self.l),
            volume,
            timestamp,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireProfile {
    pub name: Option<String>,
    pub ticker: Option<String>,
    pub exchange: Option<String>,
    #[serde(rename = "marketCapitalization")]
    pub market_capitalization: Option<f64>,
    pub error: Option<String>,
}

impl WireProfile {
    pub fn validate_and_into_profile(self, symbol: &str) -> Result<Profile, FetchCause> {
        if let Some(err) = self.error {
            return Err(FetchCause::Api(err));
        }

        // The profile endpoint answers unknown symbols with an empty object.
        if self.name.is_none() && self.ticker.is_none() && self.market_capitalization.is_none() {
            return Err(FetchCause::NotFound);
        }

        let name = self
            .name
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| symbol.to_string());
        let exchange = self
            .exchange
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| Profile::UNKNOWN_EXCHANGE.to_string());
        let market_cap = self
            .market_capitalization
            .filter(|m| m.is_finite() && *m > 0.0)
            .map(|m| m * MARKET_CAP_UNIT);

        Ok(Profile {
            symbol: symbol.to_string(),
            name,
            market_cap,
            exchange,
        })
    }
}

fn positive(v: Option<f64>) -> Option<f64> {
    v.filter(|x| x.is_finite() && *x > 0.0)
}
