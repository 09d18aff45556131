use crate::config::{env_parse, Settings};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

const DEFAULT_MAX_PER_INDEX: usize = 100;

pub const SP500: &str = "S&P 500";
pub const NASDAQ100: &str = "NASDAQ-100";
pub const DOW_JONES: &str = "Dow Jones";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UniverseEntry {
    pub symbol: String,
    pub index_name: String,
}

/// Source of index constituents. No retry logic; a failure here fails the run.
#[async_trait::async_trait]
pub trait UniverseProvider: Send + Sync {
    async fn constituents(&self, indices: &[String]) -> anyhow::Result<Vec<UniverseEntry>>;
}

#[derive(Debug, Clone)]
pub struct UniverseOptions {
    pub max_per_index: usize,
}

impl Default for UniverseOptions {
    fn default() -> Self {
        Self {
            max_per_index: DEFAULT_MAX_PER_INDEX,
        }
    }
}

impl UniverseOptions {
    pub fn from_env() -> Self {
        let mut out = Self::default();
        if let Some(n) = env_parse::<usize>("UNIVERSE_MAX_PER_INDEX") {
            out.max_per_index = n.max(1);
        }
        out
    }
}

/// Maps the spellings operators use ("SP500", "nasdaq 100", "DJIA") onto canonical index names.
pub fn normalize_index_name(name: &str) -> Option<&'static str> {
    let upper = name.trim().to_ascii_uppercase();
    if upper.contains("S&P") || upper.contains("SP500") || upper.contains("SP 500") {
        Some(SP500)
    } else if upper.contains("NASDAQ") && upper.contains("100") {
        Some(NASDAQ100)
    } else if upper.contains("DOW") || upper.contains("DJIA") {
        Some(DOW_JONES)
    } else {
        None
    }
}

/// Static constituent lists compiled into the binary.
#[derive(Debug, Clone, Default)]
pub struct BuiltinUniverse {
    opts: UniverseOptions,
}

impl BuiltinUniverse {
    pub fn new(opts: UniverseOptions) -> Self {
        Self { opts }
    }

    fn symbols_for(index: &str) -> &'static [&'static str] {
        match index {
            SP500 => SP500_SYMBOLS,
            NASDAQ100 => NASDAQ100_SYMBOLS,
            DOW_JONES => DOW_SYMBOLS,
            _ => &[],
        }
    }
}

#[async_trait::async_trait]
impl UniverseProvider for BuiltinUniverse {
    async fn constituents(&self, indices: &[String]) -> anyhow::Result<Vec<UniverseEntry>> {
        let mut out = Vec::new();
        for requested in indices {
            let Some(index) = normalize_index_name(requested) else {
                tracing::warn!(index = %requested, "unknown index; skipping");
                continue;
            };
            out.extend(
                Self::symbols_for(index)
                    .iter()
                    .take(self.opts.max_per_index)
                    .map(|s| UniverseEntry {
                        symbol: s.to_string(),
                        index_name: index.to_string(),
                    }),
            );
        }
        anyhow::ensure!(
            !out.is_empty(),
            "universe unavailable: no constituents for indices {indices:?}"
        );
        Ok(out)
    }
}

/// Constituents read from a JSON map `{ "<index>": ["SYM", ...] }`.
#[derive(Debug, Clone)]
pub struct FileUniverse {
    path: PathBuf,
    opts: UniverseOptions,
}

impl FileUniverse {
    pub fn new(path: impl Into<PathBuf>, opts: UniverseOptions) -> Self {
        Self {
            path: path.into(),
            opts,
        }
    }

    fn select(
        &self,
        map: &BTreeMap<String, Vec<String>>,
        indices: &[String],
    ) -> Vec<UniverseEntry> {
        let mut out = Vec::new();
        for requested in indices {
            let wanted = normalize_index_name(requested);
            let Some((name, symbols)) = map.iter().find(|(k, _)| {
                k.as_str() == requested.as_str()
                    || (wanted.is_some() && normalize_index_name(k) == wanted)
            }) else {
                tracing::warn!(index = %requested, path = %self.path.display(), "index missing from universe file");
                continue;
            };
            let index_name = wanted.map(str::to_string).unwrap_or_else(|| name.clone());
            out.extend(
                symbols
                    .iter()
                    .map(|s| s.trim().to_ascii_uppercase())
                    .filter(|s| !s.is_empty())
                    .take(self.opts.max_per_index)
                    .map(|symbol| UniverseEntry {
                        symbol,
                        index_name: index_name.clone(),
                    }),
            );
        }
        out
    }
}

#[async_trait::async_trait]
impl UniverseProvider for FileUniverse {
    async fn constituents(&self, indices: &[String]) -> anyhow::Result<Vec<UniverseEntry>> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("failed to read universe file {}", self.path.display()))?;
        let map: BTreeMap<String, Vec<String>> = serde_json::from_str(&raw)
            .with_context(|| format!("universe file {} is not a JSON map", self.path.display()))?;

        let out = self.select(&map, indices);
        anyhow::ensure!(
            !out.is_empty(),
            "universe unavailable: {} has no constituents for {indices:?}",
            self.path.display()
        );
        Ok(out)
    }
}

/// Picks the file universe when `UNIVERSE_FILE` is set, the builtin lists otherwise.
pub fn from_settings(settings: &Settings) -> Box<dyn UniverseProvider> {
    let opts = UniverseOptions::from_env();
    match &settings.universe_file {
        Some(path) => Box::new(FileUniverse::new(path, opts)),
        None => Box::new(BuiltinUniverse::new(opts)),
    }
}

const DOW_SYMBOLS: &[&str] = &[
    "AAPL", "AMGN", "AMZN", "AXP", "BA", "CAT", "CRM", "CSCO", "CVX", "DIS", "GS", "HD", "HON",
    "IBM", "JNJ", "JPM", "KO", "MCD", "MMM", "MRK", "MSFT", "NKE", "NVDA", "PG", "SHW", "TRV",
    "UNH", "V", "VZ", "WMT",
];

const NASDAQ100_SYMBOLS: &[&str] = &[
    "AAPL", "MSFT", "NVDA", "AMZN", "META", "AVGO", "GOOGL", "GOOG", "TSLA", "COST", "NFLX",
    "TMUS", "ASML", "CSCO", "AMD", "PEP", "LIN", "ADBE", "AZN", "ISRG", "INTU", "QCOM", "TXN",
    "BKNG", "AMGN", "PDD", "CMCSA", "ARM", "HON", "AMAT", "PANW", "ADP", "VRTX", "GILD", "SBUX",
    "MU", "ADI", "MELI", "LRCX", "INTC", "KLAC", "CTAS", "MDLZ", "CRWD", "PYPL", "SNPS", "CDNS",
    "MAR", "REGN", "ORLY", "CEG", "MRVL", "FTNT", "CSX", "ADSK", "DASH", "ROP", "ABNB", "PCAR",
    "WDAY", "CHTR", "NXPI", "TTD", "MNST", "CPRT", "AEP", "PAYX", "FANG", "ROST", "ODFL", "KDP",
    "FAST", "EA", "BKR", "VRSK", "CTSH", "XEL", "GEHC", "EXC", "KHC", "LULU", "DDOG", "CCEP",
    "IDXX", "TEAM", "AXON", "ZS", "CSGP", "TTWO", "ANSS", "ON", "DXCM", "CDW", "GFS", "BIIB",
    "WBD", "MDB", "ILMN", "MCHP", "SMCI",
];

const SP500_SYMBOLS: &[&str] = &[
    "AAPL", "MSFT", "NVDA", "AMZN", "META", "GOOGL", "GOOG", "BRK.B", "AVGO", "TSLA", "JPM",
    "LLY", "UNH", "V", "XOM", "MA", "COST", "HD", "PG", "JNJ", "WMT", "NFLX", "ABBV", "BAC",
    "CRM", "ORCL", "CVX", "MRK", "KO", "AMD", "PEP", "TMO", "ADBE", "LIN", "ACN", "MCD", "CSCO",
    "WFC", "ABT", "IBM", "GE", "PM", "DHR", "TXN", "QCOM", "INTU", "CAT", "VZ", "AMGN", "ISRG",
    "NOW", "DIS", "GS", "PFE", "NEE", "SPGI", "RTX", "AMAT", "CMCSA", "UNP", "T", "LOW", "PGR",
    "AXP", "HON", "UBER", "BKNG", "BLK", "SYK", "ELV", "COP", "ETN", "MS", "TJX", "VRTX", "C",
    "BSX", "LMT", "SCHW", "PLD", "REGN", "ADP", "MDT", "CB", "PANW", "ADI", "MMC", "BX", "SBUX",
    "DE", "KLAC", "FI", "GILD", "AMT", "BMY", "MU", "LRCX", "SO", "CI", "INTC", "MO", "SHW",
    "DUK", "ICE", "ZTS", "MDLZ", "CL", "CME", "EQIX", "TT", "ANET", "SNPS", "PH", "WM", "CDNS",
    "APH", "MCK", "PYPL", "NOC", "CVS", "ITW", "USB", "TGT", "PNC", "EOG", "MSI", "BDX", "ORLY",
];

#[cfg(test)]
mod tests {
    use super::*;

    fn indices(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn normalizes_index_aliases() {
        assert_eq!(normalize_index_name("sp500"), Some(SP500));
        assert_eq!(normalize_index_name("NASDAQ 100"), Some(NASDAQ100));
        assert_eq!(normalize_index_name("DJIA"), Some(DOW_JONES));
        assert_eq!(normalize_index_name("Russell 2000"), None);
    }

    #[tokio::test]
    async fn builtin_caps_each_index_and_tags_membership() {
        let u = BuiltinUniverse::new(UniverseOptions { max_per_index: 10 });
        let out = u
            .constituents(&indices(&["S&P 500", "Dow Jones", "FTSE"]))
            .await
            .unwrap();
        assert_eq!(out.len(), 20);
        assert!(out[..10].iter().all(|e| e.index_name == SP500));
        assert!(out[10..].iter().all(|e| e.index_name == DOW_JONES));
    }

    #[tokio::test]
    async fn builtin_fails_when_nothing_matches() {
        let u = BuiltinUniverse::default();
        let err = u.constituents(&indices(&["FTSE"])).await.unwrap_err();
        assert!(err.to_string().contains("universe unavailable"));
    }

    #[tokio::test]
    async fn dow_list_is_complete() {
        let u = BuiltinUniverse::default();
        let out = u.constituents(&indices(&["Dow Jones"])).await.unwrap();
        assert_eq!(out.len(), 30);
    }

    #[tokio::test]
    async fn file_universe_matches_aliases_and_uppercases() {
        let dir = std::env::temp_dir().join(format!("marketpulse-universe-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("universe.json");
        std::fs::write(
            &path,
            r#"{"SP500": ["aapl", " msft ", ""], "Custom": ["ZZZ"]}"#,
        )
        .unwrap();

        let u = FileUniverse::new(&path, UniverseOptions::default());
        let out = u
            .constituents(&indices(&["S&P 500", "Custom"]))
            .await
            .unwrap();
        assert_eq!(
            out,
            vec![
                UniverseEntry { symbol: "AAPL".into(), index_name: SP500.into() },
                UniverseEntry { symbol: "MSFT".into(), index_name: SP500.into() },
                UniverseEntry { symbol: "ZZZ".into(), index_name: "Custom".into() },
            ]
        );
        std::fs::remove_dir_all(&dir).ok();
    }
}
