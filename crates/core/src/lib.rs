pub mod alerts;
pub mod analysis;
pub mod domain;
pub mod ingest;
pub mod pipeline;
pub mod storage;
pub mod time;

pub mod config {
    use anyhow::Context;
    use std::str::FromStr;

    const DEFAULT_INDICES: &[&str] = &["S&P 500", "NASDAQ-100"];

    #[derive(Debug, Clone)]
    pub struct Settings {
        pub database_url: Option<String>,
        pub sentry_dsn: Option<String>,
        pub finnhub_api_key: Option<String>,
        pub finnhub_base_url: Option<String>,
        pub tracked_indices: Vec<String>,
        pub universe_file: Option<String>,
        pub filters_path: Option<String>,
        pub projection_params_path: Option<String>,
        pub alerts_path: Option<String>,
        pub alerts_history_dir: Option<String>,
    }

    impl Settings {
        pub fn from_env() -> anyhow::Result<Self> {
            Ok(Self {
                database_url: std::env::var("DATABASE_URL").ok(),
                sentry_dsn: std::env::var("SENTRY_DSN").ok(),
                finnhub_api_key: std::env::var("FINNHUB_API_KEY").ok(),
                finnhub_base_url: std::env::var("FINNHUB_BASE_URL").ok(),
                tracked_indices: parse_indices(std::env::var("TRACKED_INDICES").ok()),
                universe_file: non_empty_var("UNIVERSE_FILE"),
                filters_path: non_empty_var("FILTERS_PATH"),
                projection_params_path: non_empty_var("PROJECTION_PARAMS_PATH"),
                alerts_path: non_empty_var("ALERTS_PATH"),
                alerts_history_dir: non_empty_var("ALERTS_HISTORY_DIR"),
            })
        }

        pub fn require_database_url(&self) -> anyhow::Result<&str> {
            self.database_url
                .as_deref()
                .context("DATABASE_URL is required")
        }

        pub fn require_finnhub_api_key(&self) -> anyhow::Result<&str> {
            self.finnhub_api_key
                .as_deref()
                .filter(|s| !s.trim().is_empty())
                .context("FINNHUB_API_KEY is required (get a free key at https://finnhub.io/register)")
        }
    }

    /// Parses an env var, ignoring values that fail to parse.
    pub fn env_parse<T: FromStr>(key: &str) -> Option<T> {
        std::env::var(key).ok().and_then(|s| s.trim().parse::<T>().ok())
    }

    fn non_empty_var(key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|s| !s.trim().is_empty())
    }

    pub fn parse_indices(v: Option<String>) -> Vec<String> {
        let parsed: Vec<String> = v
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if parsed.is_empty() {
            return DEFAULT_INDICES.iter().map(|s| s.to_string()).collect();
        }
        parsed
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn falls_back_to_default_indices() {
            assert_eq!(parse_indices(None), vec!["S&P 500", "NASDAQ-100"]);
            assert_eq!(parse_indices(Some(" , ".to_string())), vec!["S&P 500", "NASDAQ-100"]);
            assert_eq!(
                parse_indices(Some("Dow Jones, NASDAQ-100".to_string())),
                vec!["Dow Jones", "NASDAQ-100"]
            );
        }
    }
}
