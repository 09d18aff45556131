use crate::config::{env_parse, Settings};
use crate::domain::market::{Quote, ScreenVerdict};
use anyhow::{ensure, Context};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Flat filter/threshold record for one run. Validated when loaded; consumed as-is by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreenFilters {
    pub volume_threshold: u64,
    pub price_min: f64,
    pub price_max: f64,
    /// Minimum absolute daily move, in percent.
    pub min_daily_change_pct: f64,
    /// Currency units. Applied after the full fetch, since screening quotes carry no profile.
    pub market_cap_min: f64,
    pub top_n: usize,
}

impl Default for ScreenFilters {
    fn default() -> Self {
        Self {
            volume_threshold: 1_000_000,
            price_min: 10.0,
            price_max: 500.0,
            min_daily_change_pct: 2.0,
            market_cap_min: 1_000_000_000.0,
            top_n: 100,
        }
    }
}

impl ScreenFilters {
    /// File (when `FILTERS_PATH` is set) then `SCREEN_*` env overrides, then validation.
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let mut out = match &settings.filters_path {
            Some(path) => Self::from_json_file(path)?,
            None => Self::default(),
        };

        if let Some(n) = env_parse::<u64>("SCREEN_VOLUME_THRESHOLD") {
            out.volume_threshold = n;
        }
        if let Some(n) = env_parse::<f64>("SCREEN_PRICE_MIN") {
            out.price_min = n;
        }
        if let Some(n) = env_parse::<f64>("SCREEN_PRICE_MAX") {
            out.price_max = n;
        }
        if let Some(n) = env_parse::<f64>("SCREEN_MIN_CHANGE_PCT") {
            out.min_daily_change_pct = n;
        }
        if let Some(n) = env_parse::<f64>("SCREEN_MARKET_CAP_MIN") {
            out.market_cap_min = n;
        }
        if let Some(n) = env_parse::<usize>("SCREEN_TOP_N") {
            out.top_n = n;
        }

        out.validate()?;
        Ok(out)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read filters file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("filters file {} does not parse", path.display()))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            self.price_min.is_finite() && self.price_min >= 0.0,
            "price_min must be >= 0 (got {})",
            self.price_min
        );
        ensure!(
            self.price_max.is_finite() && self.price_max >= self.price_min,
            "price_max must be >= price_min (got {}..={})",
            self.price_min,
            self.price_max
        );
        ensure!(
            self.min_daily_change_pct.is_finite() && self.min_daily_change_pct >= 0.0,
            "min_daily_change_pct must be >= 0 (got {})",
            self.min_daily_change_pct
        );
        ensure!(
            self.market_cap_min.is_finite() && self.market_cap_min >= 0.0,
            "market_cap_min must be >= 0 (got {})",
            self.market_cap_min
        );
        ensure!(self.top_n >= 1, "top_n must be >= 1");
        Ok(())
    }

    /// Volume, then price band, then move size. The first failing check is the verdict.
    pub fn judge(&self, quote: &Quote) -> ScreenVerdict {
        if quote.volume < self.volume_threshold {
            return ScreenVerdict::LowVolume {
                volume: quote.volume,
                threshold: self.volume_threshold,
            };
        }
        if quote.price < self.price_min || quote.price > self.price_max {
            return ScreenVerdict::PriceOutOfRange {
                price: quote.price,
                min: self.price_min,
                max: self.price_max,
            };
        }
        let change_percent = quote.change_percent();
        if change_percent.abs() < self.min_daily_change_pct {
            return ScreenVerdict::SmallMove {
                change_percent,
                min: self.min_daily_change_pct,
            };
        }
        ScreenVerdict::Passed
    }

    /// `None` (unknown cap) passes.
    pub fn passes_market_cap(&self, market_cap: Option<f64>) -> bool {
        market_cap.map_or(true, |cap| cap >= self.market_cap_min)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::market::fixtures::quote;

    #[test]
    fn judges_in_order() {
        let f = ScreenFilters {
            price_min: 5.0,
            ..ScreenFilters::default()
        };
        assert!(matches!(
            f.judge(&quote("A", 600.0, 500.0, 10)),
            ScreenVerdict::LowVolume { .. }
        ));
        assert!(matches!(
            f.judge(&quote("B", 600.0, 500.0, 2_000_000)),
            ScreenVerdict::PriceOutOfRange { .. }
        ));
        assert!(matches!(
            f.judge(&quote("C", 50.5, 50.0, 2_000_000)),
            ScreenVerdict::SmallMove { .. }
        ));
        assert_eq!(f.judge(&quote("D", 48.5, 50.0, 2_000_000)), ScreenVerdict::Passed);
    }

    #[test]
    fn bounds_are_inclusive() {
        let f = ScreenFilters {
            price_min: 10.0,
            price_max: 500.0,
            ..ScreenFilters::default()
        };
        assert_eq!(f.judge(&quote("LO", 10.0, 9.0, 1_000_000)), ScreenVerdict::Passed);
        assert_eq!(f.judge(&quote("HI", 500.0, 450.0, 1_000_000)), ScreenVerdict::Passed);
    }

    #[test]
    fn rejects_inverted_price_band() {
        let f = ScreenFilters {
            price_min: 50.0,
            price_max: 10.0,
            ..ScreenFilters::default()
        };
        assert!(f.validate().unwrap_err().to_string().contains("price_max"));
        let f = ScreenFilters {
            top_n: 0,
            ..ScreenFilters::default()
        };
        assert!(f.validate().is_err());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let f: ScreenFilters = serde_json::from_value(serde_json::json!({
            "volume_threshold": 250000,
            "top_n": 20
        }))
        .unwrap();
        assert_eq!(f.volume_threshold, 250_000);
        assert_eq!(f.top_n, 20);
        assert_eq!(f.price_max, 500.0);
    }

    #[test]
    fn unknown_market_cap_passes() {
        let f = ScreenFilters::default();
        assert!(f.passes_market_cap(None));
        assert!(!f.passes_market_cap(Some(5.0e8)));
        assert!(f.passes_market_cap(Some(1.0e9)));
    }
}
