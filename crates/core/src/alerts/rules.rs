use crate::domain::market::Snapshot;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    LessThan,
    LessOrEqual,
    GreaterThan,
    GreaterOrEqual,
    Equal,
}

impl Comparison {
    pub fn holds(self, actual: f64, target: f64) -> bool {
        match self {
            Self::LessThan => actual < target,
            Self::LessOrEqual => actual <= target,
            Self::GreaterThan => actual > target,
            Self::GreaterOrEqual => actual >= target,
            Self::Equal => (actual - target).abs() < 1e-9,
        }
    }
}

/// Every filter that is set must pass; an empty filter set matches everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchFilters {
    pub volume_threshold: Option<u64>,
    /// Minimum absolute daily move, in percent.
    pub min_daily_change_pct: Option<f64>,
    pub price_min: Option<f64>,
    pub price_max: Option<f64>,
}

impl MatchFilters {
    pub fn matches(&self, s: &Snapshot) -> bool {
        self.volume_threshold.map_or(true, |v| s.volume >= v)
            && self
                .min_daily_change_pct
                .map_or(true, |m| s.change_percent.abs() >= m)
            && self.price_min.map_or(true, |m| s.close >= m)
            && self.price_max.map_or(true, |m| s.close <= m)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    PriceThreshold {
        symbol: String,
        operator: Comparison,
        value: f64,
    },
    ScreeningMatch {
        #[serde(default)]
        filters: MatchFilters,
    },
}

impl Condition {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PriceThreshold { .. } => "price_threshold",
            Self::ScreeningMatch { .. } => "screening_match",
        }
    }

    /// Symbols in `snapshots` that satisfy the condition, in input order.
    pub fn matching(&self, snapshots: &[Snapshot]) -> Vec<String> {
        match self {
            Self::PriceThreshold {
                symbol,
                operator,
                value,
            } => snapshots
                .iter()
                .filter(|s| s.symbol.eq_ignore_ascii_case(symbol.trim()))
                .filter(|s| operator.holds(s.close, *value))
                .map(|s| s.symbol.clone())
                .collect(),
            Self::ScreeningMatch { filters } => snapshots
                .iter()
                .filter(|s| filters.matches(s))
                .map(|s| s.symbol.clone())
                .collect(),
        }
    }
}

fn default_notifications() -> Vec<String> {
    vec!["log".to_string()]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub cooldown_minutes: u32,
    #[serde(default = "default_notifications")]
    pub notifications: Vec<String>,
    pub condition: Condition,
}

impl AlertRule {
    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

#[derive(Deserialize)]
struct AlertsFile {
    #[serde(default)]
    alerts: Vec<serde_json::Value>,
}

/// Loads the enabled rules from an `{"alerts": [...]}` file.
///
/// A rule that does not parse (unknown condition type, missing field) is logged and skipped so one
/// bad entry does not silence the others.
pub fn load_rules(path: impl AsRef<Path>) -> anyhow::Result<Vec<AlertRule>> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read alerts file {}", path.display()))?;
    parse_rules(&raw).with_context(|| format!("alerts file {} does not parse", path.display()))
}

pub fn parse_rules(raw: &str) -> anyhow::Result<Vec<AlertRule>> {
    let file: AlertsFile = serde_json::from_str(raw)?;
    let mut rules = Vec::with_capacity(file.alerts.len());
    for (idx, value) in file.alerts.into_iter().enumerate() {
        match serde_json::from_value::<AlertRule>(value) {
            Ok(rule) if rule.enabled => rules.push(rule),
            Ok(rule) => tracing::debug!(alert_id = %rule.id, "alert disabled"),
            Err(err) => tracing::warn!(index = idx, error = %err, "skipping unparseable alert"),
        }
    }
    Ok(rules)
}
