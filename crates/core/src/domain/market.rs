use anyhow::ensure;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One point-in-time read for a security.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub price: f64,
    pub previous_close: f64,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub volume: u64,
    pub timestamp: DateTime<Utc>,
}

impl Quote {
    pub fn change(&self) -> f64 {
        self.price - self.previous_close
    }

    /// Zero when the previous close is unusable.
    pub fn change_percent(&self) -> f64 {
        if self.previous_close > 0.0 {
            self.change() / self.previous_close * 100.0
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub symbol: String,
    pub name: String,
    /// Currency units. `None` when the upstream has no figure.
    pub market_cap: Option<f64>,
    pub exchange: String,
}

impl Profile {
    pub const UNKNOWN_EXCHANGE: &'static str = "Unknown";

    /// Stand-in used when the profile call fails; the quote alone still makes a valid snapshot.
    pub fn placeholder(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            name: symbol.to_string(),
            market_cap: None,
            exchange: Self::UNKNOWN_EXCHANGE.to_string(),
        }
    }
}

/// Merged quote + profile record; the unit the rest of the pipeline works on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub symbol: String,
    pub name: String,
    pub close: f64,
    pub previous_close: f64,
    pub change: f64,
    pub change_percent: f64,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub volume: u64,
    pub market_cap: Option<f64>,
    pub exchange: String,
    pub as_of_date: NaiveDate,
}

impl Snapshot {
    pub fn try_from_parts(
        quote: &Quote,
        profile: &Profile,
        as_of_date: NaiveDate,
    ) -> anyhow::Result<Self> {
        let snapshot = Self {
            symbol: quote.symbol.clone(),
            name: profile.name.clone(),
            close: quote.price,
            previous_close: quote.previous_close,
            change: quote.change(),
            change_percent: quote.change_percent(),
            open: quote.open,
            high: quote.high,
            low: quote.low,
            volume: quote.volume,
            market_cap: profile.market_cap,
            exchange: profile.exchange.clone(),
            as_of_date,
        };
        snapshot.validate()?;
        Ok(snapshot)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(!self.symbol.trim().is_empty(), "symbol must be non-empty");
        ensure!(
            self.close.is_finite() && self.close > 0.0,
            "close must be positive (got {})",
            self.close
        );
        ensure!(
            self.previous_close.is_finite() && self.previous_close > 0.0,
            "previous_close must be positive (got {})",
            self.previous_close
        );
        let expected = (self.close - self.previous_close) / self.previous_close * 100.0;
        ensure!(
            (self.change_percent - expected).abs() <= 1e-6 * expected.abs().max(1.0),
            "change_percent {} disagrees with close/previous_close ({expected})",
            self.change_percent
        );
        if let Some(cap) = self.market_cap {
            ensure!(cap.is_finite() && cap >= 0.0, "market_cap must be non-negative");
        }
        Ok(())
    }

    /// Intraday high-low range as a percentage of the close, when the quote carried a usable range.
    pub fn intraday_range_percent(&self) -> Option<f64> {
        let (high, low) = (self.high?, self.low?);
        if !(high.is_finite() && low.is_finite()) || low <= 0.0 || high < low {
            return None;
        }
        Some((high - low) / self.close * 100.0)
    }
}

/// Why a screening candidate was kept or dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScreenVerdict {
    Passed,
    LowVolume { volume: u64, threshold: u64 },
    PriceOutOfRange { price: f64, min: f64, max: f64 },
    SmallMove { change_percent: f64, min: f64 },
}

impl fmt::Display for ScreenVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passed => write!(f, "passed"),
            Self::LowVolume { volume, threshold } => {
                write!(f, "volume {volume} below {threshold}")
            }
            Self::PriceOutOfRange { price, min, max } => {
                write!(f, "price {price:.2} outside {min:.2}..={max:.2}")
            }
            Self::SmallMove {
                change_percent,
                min,
            } => write!(f, "move {change_percent:+.2}% smaller than {min:.2}%"),
        }
    }
}

/// A symbol with its single screening quote. Only lives during the screening phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreeningCandidate {
    pub symbol: String,
    pub quote: Quote,
    pub change_percent: f64,
    pub passed: bool,
    pub verdict: ScreenVerdict,
}

impl ScreeningCandidate {
    /// Builds an unjudged candidate; the screener fills in the verdict.
    pub fn from_quote(quote: Quote) -> Self {
        Self {
            symbol: quote.symbol.clone(),
            change_percent: quote.change_percent(),
            quote,
            passed: false,
            verdict: ScreenVerdict::Passed,
        }
    }

    pub fn with_verdict(mut self, verdict: ScreenVerdict) -> Self {
        self.passed = verdict == ScreenVerdict::Passed;
        self.verdict = verdict;
        self
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use chrono::TimeZone;

    pub fn quote(symbol: &str, price: f64, previous_close: f64, volume: u64) -> Quote {
        Quote {
            symbol: symbol.to_string(),
            price,
            previous_close,
            open: Some(previous_close),
            high: None,
            low: None,
            volume,
            timestamp: Utc.with_ymd_and_hms(2026, 1, 27, 21, 0, 0).unwrap(),
        }
    }

    /// Snapshot with a given percentage move off a 100.0 previous close.
    pub fn snapshot(symbol: &str, change_percent: f64, volume: u64) -> Snapshot {
        let previous_close = 100.0;
        let close = previous_close * (1.0 + change_percent / 100.0);
        let q = quote(symbol, close, previous_close, volume);
        let profile = Profile {
            symbol: symbol.to_string(),
            name: format!("{symbol} Inc"),
            market_cap: Some(50_000_000_000.0),
            exchange: "NASDAQ NMS - GLOBAL MARKET".to_string(),
        };
        Snapshot::try_from_parts(&q, &profile, chrono::NaiveDate::from_ymd_opt(2026, 1, 27).unwrap())
            .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn snapshot_derives_change_from_quote() {
        let s = snapshot("AAPL", 4.0, 1_000);
        assert!((s.change - 4.0).abs() < 1e-9);
        assert!((s.change_percent - 4.0).abs() < 1e-9);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn rejects_zero_previous_close() {
        let q = quote("ZERO", 10.0, 0.0, 100);
        let as_of = NaiveDate::from_ymd_opt(2026, 1, 27).unwrap();
        let err = Snapshot::try_from_parts(&q, &Profile::placeholder("ZERO"), as_of).unwrap_err();
        assert!(err.to_string().contains("previous_close"));
    }

    #[test]
    fn intraday_range_requires_consistent_bounds() {
        let mut s = snapshot("MSFT", 1.0, 1_000);
        assert_eq!(s.intraday_range_percent(), None);
        s.high = Some(103.0);
        s.low = Some(99.0);
        let range = s.intraday_range_percent().unwrap();
        assert!((range - 4.0 / 101.0 * 100.0).abs() < 1e-9);
        s.low = Some(104.0);
        assert_eq!(s.intraday_range_percent(), None);
    }

    #[test]
    fn verdict_sets_passed_flag() {
        let c = ScreeningCandidate::from_quote(quote("X", 50.0, 48.0, 10));
        let c = c.with_verdict(ScreenVerdict::LowVolume {
            volume: 10,
            threshold: 1_000,
        });
        assert!(!c.passed);
        assert_eq!(c.verdict.to_string(), "volume 10 below 1000");
    }
}
