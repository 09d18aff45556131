use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Recommendation {
    #[serde(rename = "STRONG BUY")]
    StrongBuy,
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "HOLD")]
    Hold,
    #[serde(rename = "SELL")]
    Sell,
    #[serde(rename = "STRONG SELL")]
    StrongSell,
}

impl Recommendation {
    pub const ALL: [Recommendation; 5] = [
        Self::StrongBuy,
        Self::Buy,
        Self::Hold,
        Self::Sell,
        Self::StrongSell,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StrongBuy => "STRONG BUY",
            Self::Buy => "BUY",
            Self::Hold => "HOLD",
            Self::Sell => "SELL",
            Self::StrongSell => "STRONG SELL",
        }
    }

    /// Accepts both the display form ("STRONG BUY") and the query form ("STRONG_BUY").
    pub fn parse(s: &str) -> Option<Self> {
        let normalized = s.trim().to_ascii_uppercase().replace('_', " ");
        Self::ALL.into_iter().find(|r| r.as_str() == normalized)
    }
}

impl fmt::Display for Recommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Trend {
    Bullish,
    Neutral,
    Bearish,
}

impl Trend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bullish => "Bullish",
            Self::Neutral => "Neutral",
            Self::Bearish => "Bearish",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [Self::Bullish, Self::Neutral, Self::Bearish]
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "Low",
            Self::Medium => "Medium",
            Self::High => "High",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [Self::Low, Self::Medium, Self::High]
            .into_iter()
            .find(|r| r.as_str().eq_ignore_ascii_case(s.trim()))
    }
}

/// Five-day projection for one snapshot. `target_low <= target_mid <= target_high` always holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Projection {
    pub symbol: String,
    pub name: String,
    pub current_price: f64,
    pub target_low: f64,
    pub target_mid: f64,
    pub target_high: f64,
    pub expected_change_percent: f64,
    pub recommendation: Recommendation,
    pub confidence: u8,
    pub trend: Trend,
    pub momentum_score: f64,
    pub volatility_score: f64,
    pub risk_level: RiskLevel,
    pub reason: String,
    pub projection_date: NaiveDate,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub symbol: String,
    pub target_mid: f64,
    pub confidence: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionSummary {
    pub total_projections: usize,
    pub recommendations: BTreeMap<Recommendation, usize>,
    pub trends: BTreeMap<Trend, usize>,
    pub risk_profile: BTreeMap<RiskLevel, usize>,
    pub average_confidence: f64,
    pub average_expected_change: f64,
    pub sentiment: Trend,
    pub strong_buys: Vec<Opportunity>,
    pub strong_sells: Vec<Opportunity>,
    pub projection_date: Option<NaiveDate>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recommendation_serializes_with_spaces() {
        let s = serde_json::to_string(&Recommendation::StrongBuy).unwrap();
        assert_eq!(s, "\"STRONG BUY\"");
        let back: Recommendation = serde_json::from_str("\"STRONG SELL\"").unwrap();
        assert_eq!(back, Recommendation::StrongSell);
    }

    #[test]
    fn parses_query_form() {
        assert_eq!(Recommendation::parse("strong_buy"), Some(Recommendation::StrongBuy));
        assert_eq!(Recommendation::parse("HOLD"), Some(Recommendation::Hold));
        assert_eq!(Recommendation::parse("MAYBE"), None);
        assert_eq!(Trend::parse("bearish"), Some(Trend::Bearish));
        assert_eq!(RiskLevel::parse(" Medium "), Some(RiskLevel::Medium));
    }
}
