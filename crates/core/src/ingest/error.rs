use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Per-symbol failure. Never aborts a batch; collected next to the successful results.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{symbol}: {cause}")]
pub struct FetchError {
    pub symbol: String,
    pub cause: FetchCause,
}

impl FetchError {
    pub fn new(symbol: impl Into<String>, cause: FetchCause) -> Self {
        Self {
            symbol: symbol.into(),
            cause,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FetchCause {
    /// Transport failure or 5xx that survived every backoff retry.
    #[error("transient network error: {0}")]
    Transient(String),

    #[error("quota exceeded after {attempts} rate-limit rejections")]
    QuotaExceeded { attempts: u32 },

    #[error("symbol not found")]
    NotFound,

    /// Non-retryable 4xx other than 404/429.
    #[error("request rejected: HTTP {status}: {message}")]
    Rejected { status: u16, message: String },

    /// Error payload returned inside a successful response.
    #[error("upstream API error: {0}")]
    Api(String),

    /// Response that does not parse or breaks the snapshot invariants.
    #[error("malformed data: {0}")]
    Malformed(String),

    #[error("per-symbol deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),
}

impl FetchCause {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::QuotaExceeded { .. } | Self::DeadlineExceeded(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_symbol_and_cause() {
        let err = FetchError::new("AAPL", FetchCause::QuotaExceeded { attempts: 3 });
        assert_eq!(err.to_string(), "AAPL: quota exceeded after 3 rate-limit rejections");
        assert!(err.cause.is_retryable());
        assert!(!FetchCause::NotFound.is_retryable());
        assert!(FetchCause::DeadlineExceeded(Duration::from_secs(120)).is_retryable());
    }

    #[test]
    fn serializes_with_kind_tag() {
        let err = FetchError::new("MSFT", FetchCause::Rejected { status: 403, message: "no".into() });
        let v = serde_json::to_value(&err).unwrap();
        assert_eq!(v["symbol"], "MSFT");
        assert_eq!(v["cause"]["kind"], "rejected");
        assert_eq!(v["cause"]["detail"]["status"], 403);
        let back: FetchError = serde_json::from_value(v).unwrap();
        assert_eq!(back, err);
    }
}
