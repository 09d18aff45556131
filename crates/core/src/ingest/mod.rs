pub mod error;
pub mod finnhub;
pub mod metrics;
pub mod provider;
pub mod rate_limiter;
pub mod universe;
