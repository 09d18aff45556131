//! Five-day price projections from a single day's snapshot.
//!
//! Every threshold lives in [`ProjectionParams`] so it can be tuned from a JSON file. The model
//! is a fixed heuristic: momentum is the scaled daily move, volatility the scaled intraday range
//! (or the move itself when no range is known), and the recommendation follows a strict
//! first-match precedence over those two scores. The reason string is produced from the same
//! signals by an ordered rule list, so it never mentions a factor the decision did not use.

use crate::analysis::round_to;
use crate::config::Settings;
use crate::domain::market::Snapshot;
use crate::domain::projection::{
    Opportunity, Projection, ProjectionSummary, Recommendation, RiskLevel, Trend,
};
use crate::time::us_market::TradingCalendar;
use anyhow::{ensure, Context};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::Path;

const TOP_OPPORTUNITIES: usize = 5;
const SENTIMENT_THRESHOLD_PCT: f64 = 1.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectionParams {
    pub horizon_trading_days: u32,

    /// momentum = change% * momentum_scale, clamped to [-100, 100].
    pub momentum_scale: f64,
    /// volatility = range% (or |change%|) * volatility_scale, clamped to [0, 100].
    pub volatility_scale: f64,

    pub trend_threshold: f64,
    pub strong_momentum: f64,
    /// Strong calls require volatility strictly below this.
    pub strong_volatility_gate: f64,
    pub action_momentum: f64,

    pub risk_low_below: f64,
    pub risk_high_above: f64,

    /// Move projected at |momentum| = 100, in percent.
    pub max_base_move_pct: f64,
    pub spike_change_pct: f64,
    pub spike_damping: f64,
    pub calm_change_pct: f64,
    pub calm_boost: f64,
    /// Half-width of the target band at volatility = 100, in percent.
    pub max_spread_pct: f64,

    pub confidence_base: f64,
    pub confidence_momentum_weight: f64,
    pub confidence_stability_weight: f64,
    pub confidence_volume_weight: f64,
    pub confidence_cap_weight: f64,
    pub volume_floor: f64,
    pub volume_full: f64,
    pub market_cap_full: f64,
}

impl Default for ProjectionParams {
    fn default() -> Self {
        Self {
            horizon_trading_days: 5,
            momentum_scale: 10.0,
            volatility_scale: 5.0,
            trend_threshold: 15.0,
            strong_momentum: 40.0,
            strong_volatility_gate: 60.0,
            action_momentum: 15.0,
            risk_low_below: 40.0,
            risk_high_above: 70.0,
            max_base_move_pct: 5.0,
            spike_change_pct: 5.0,
            spike_damping: 0.5,
            calm_change_pct: 1.0,
            calm_boost: 1.2,
            max_spread_pct: 3.0,
            confidence_base: 20.0,
            confidence_momentum_weight: 30.0,
            confidence_stability_weight: 30.0,
            confidence_volume_weight: 10.0,
            confidence_cap_weight: 10.0,
            volume_floor: 1_000_000.0,
            volume_full: 10_000_000.0,
            market_cap_full: 100_000_000_000.0,
        }
    }
}

impl ProjectionParams {
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let out = match &settings.projection_params_path {
            Some(path) => Self::from_json_file(path)?,
            None => Self::default(),
        };
        out.validate()?;
        Ok(out)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read projection params {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("projection params {} do not parse", path.display()))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.horizon_trading_days >= 1, "horizon_trading_days must be >= 1");
        ensure!(self.momentum_scale > 0.0, "momentum_scale must be > 0");
        ensure!(self.volatility_scale > 0.0, "volatility_scale must be > 0");
        ensure!(
            0.0 < self.action_momentum && self.action_momentum <= self.strong_momentum,
            "expected 0 < action_momentum <= strong_momentum (got {} / {})",
            self.action_momentum,
            self.strong_momentum
        );
        ensure!(
            (0.0..=100.0).contains(&self.strong_volatility_gate),
            "strong_volatility_gate must be within 0..=100"
        );
        ensure!(
            self.risk_low_below <= self.risk_high_above,
            "risk_low_below must be <= risk_high_above"
        );
        ensure!(
            self.max_base_move_pct >= 0.0 && self.max_base_move_pct < 100.0,
            "max_base_move_pct must be within 0..100"
        );
        ensure!(
            self.max_spread_pct >= 0.0 && self.max_spread_pct < 100.0,
            "max_spread_pct must be within 0..100"
        );
        ensure!(
            self.spike_damping > 0.0 && self.calm_boost > 0.0,
            "spike_damping and calm_boost must be > 0"
        );
        ensure!(
            self.calm_change_pct >= 0.0 && self.calm_change_pct <= self.spike_change_pct,
            "expected 0 <= calm_change_pct <= spike_change_pct (got {} / {})",
            self.calm_change_pct,
            self.spike_change_pct
        );
        // The largest adjusted move must stay under 100% or target_mid can go negative.
        let widest_factor = self.calm_boost.max(self.spike_damping).max(1.0);
        ensure!(
            self.max_base_move_pct * widest_factor < 100.0,
            "max_base_move_pct * {widest_factor} must be < 100 (got {})",
            self.max_base_move_pct
        );
        ensure!(
            self.volume_floor < self.volume_full,
            "volume_floor must be < volume_full"
        );
        ensure!(self.market_cap_full > 0.0, "market_cap_full must be > 0");
        Ok(())
    }
}

/// How the base move was adjusted for the size of today's move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Damping {
    None,
    /// Large spike; project a partial continuation only.
    Spike,
    /// Quiet day; small moves tend to persist.
    Calm,
}

/// Everything a projection decision was made from.
struct Signals<'a> {
    params: &'a ProjectionParams,
    change_percent: f64,
    volume: u64,
    momentum: f64,
    volatility: f64,
    trend: Trend,
    damping: Damping,
}

struct ReasonRule {
    applies: fn(&Signals<'_>) -> bool,
    phrase: fn(&Signals<'_>) -> String,
}

const REASON_RULES: &[ReasonRule] = &[
    ReasonRule {
        applies: |s| s.trend == Trend::Bullish && s.change_percent > s.params.spike_change_pct,
        phrase: |s| format!("Strong +{:.1}% gain", s.change_percent),
    },
    ReasonRule {
        applies: |s| s.trend == Trend::Bullish && s.change_percent <= s.params.spike_change_pct,
        phrase: |s| format!("Positive +{:.1}% momentum", s.change_percent),
    },
    ReasonRule {
        applies: |s| s.trend == Trend::Bearish && s.change_percent < -s.params.spike_change_pct,
        phrase: |s| format!("Sharp {:.1}% decline", s.change_percent),
    },
    ReasonRule {
        applies: |s| s.trend == Trend::Bearish && s.change_percent >= -s.params.spike_change_pct,
        phrase: |s| format!("Negative {:.1}% pressure", s.change_percent),
    },
    ReasonRule {
        applies: |s| s.trend == Trend::Neutral,
        phrase: |s| format!("Stable {:+.1}% change", s.change_percent),
    },
    ReasonRule {
        applies: |s| s.momentum.abs() > s.params.strong_momentum,
        phrase: |_| "strong momentum".to_string(),
    },
    ReasonRule {
        applies: |s| {
            s.momentum.abs() > s.params.action_momentum
                && s.momentum.abs() <= s.params.strong_momentum
        },
        phrase: |_| "moderate momentum".to_string(),
    },
    ReasonRule {
        applies: |s| {
            s.momentum.abs() > s.params.strong_momentum
                && s.volatility >= s.params.strong_volatility_gate
        },
        phrase: |_| "high volatility caps conviction".to_string(),
    },
    ReasonRule {
        applies: |s| s.volume as f64 >= s.params.volume_full,
        phrase: |_| "high volume support".to_string(),
    },
    ReasonRule {
        applies: |s| (s.volume as f64) < s.params.volume_floor,
        phrase: |_| "low volume caution".to_string(),
    },
    ReasonRule {
        applies: |s| s.damping == Damping::Spike,
        phrase: |_| "potential for reversal".to_string(),
    },
    ReasonRule {
        applies: |s| s.damping == Damping::Calm,
        phrase: |_| "trend likely to continue".to_string(),
    },
];

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionBatch {
    pub projections: Vec<Projection>,
    /// Snapshots that failed validation and were not projected.
    pub skipped: usize,
}

#[derive(Debug, Clone)]
pub struct Projector {
    params: ProjectionParams,
    calendar: TradingCalendar,
}

impl Projector {
    pub fn new(params: ProjectionParams, calendar: TradingCalendar) -> Self {
        Self { params, calendar }
    }

    pub fn project(&self, snapshots: &[Snapshot]) -> ProjectionBatch {
        self.project_at(snapshots, Utc::now())
    }

    /// Same as [`Projector::project`] with a fixed `generated_at`; otherwise fully deterministic.
    pub fn project_at(&self, snapshots: &[Snapshot], generated_at: DateTime<Utc>) -> ProjectionBatch {
        let mut projections = Vec::with_capacity(snapshots.len());
        let mut skipped = 0usize;

        for snapshot in snapshots {
            match self.project_one(snapshot, generated_at) {
                Ok(p) => projections.push(p),
                Err(err) => {
                    skipped += 1;
                    tracing::warn!(symbol = %snapshot.symbol, error = ?err, "skipping projection");
                }
            }
        }

        tracing::debug!(projected = projections.len(), skipped, "projections generated");
        ProjectionBatch {
            projections,
            skipped,
        }
    }

    pub fn project_one(
        &self,
        snapshot: &Snapshot,
        generated_at: DateTime<Utc>,
    ) -> anyhow::Result<Projection> {
        snapshot
            .validate()
            .with_context(|| format!("invalid snapshot for {}", snapshot.symbol))?;

        let p = &self.params;
        let price = snapshot.close;
        let change = snapshot.change_percent;

        // Decisions run on the rounded scores so the published numbers explain the call.
        let momentum = round_to(momentum_score(change, p), 1);
        let volatility = round_to(volatility_score(snapshot, p), 1);
        let trend = trend_for(momentum, p);

        let (damping, factor) = if change.abs() > p.spike_change_pct {
            (Damping::Spike, p.spike_damping)
        } else if change.abs() < p.calm_change_pct {
            (Damping::Calm, p.calm_boost)
        } else {
            (Damping::None, 1.0)
        };
        let base_move_pct = momentum / 100.0 * p.max_base_move_pct * factor;
        let spread_pct = volatility / 100.0 * p.max_spread_pct;

        let mid = price * (1.0 + base_move_pct / 100.0);
        let low = mid * (1.0 - spread_pct / 100.0);
        let high = mid * (1.0 + spread_pct / 100.0);

        let signals = Signals {
            params: p,
            change_percent: change,
            volume: snapshot.volume,
            momentum,
            volatility,
            trend,
            damping,
        };
        let reason = REASON_RULES
            .iter()
            .filter(|r| (r.applies)(&signals))
            .map(|r| (r.phrase)(&signals))
            .collect::<Vec<_>>()
            .join("; ");

        Ok(Projection {
            symbol: snapshot.symbol.clone(),
            name: snapshot.name.clone(),
            current_price: round_to(price, 2),
            target_low: round_to(low, 2),
            target_mid: round_to(mid, 2),
            target_high: round_to(high, 2),
            expected_change_percent: round_to((mid - price) / price * 100.0, 2),
            recommendation: classify(momentum, volatility, p),
            confidence: confidence(momentum, volatility, snapshot.volume, snapshot.market_cap, p),
            trend,
            momentum_score: momentum,
            volatility_score: volatility,
            risk_level: risk_for(volatility, p),
            reason,
            projection_date: self
                .calendar
                .add_trading_days(snapshot.as_of_date, p.horizon_trading_days),
            generated_at,
        })
    }
}

pub fn momentum_score(change_percent: f64, params: &ProjectionParams) -> f64 {
    (change_percent * params.momentum_scale).clamp(-100.0, 100.0)
}

/// Intraday range when the quote carried one, else the size of the daily move.
pub fn volatility_score(snapshot: &Snapshot, params: &ProjectionParams) -> f64 {
    let basis = snapshot
        .intraday_range_percent()
        .unwrap_or_else(|| snapshot.change_percent.abs());
    (basis * params.volatility_scale).clamp(0.0, 100.0)
}

pub fn trend_for(momentum: f64, params: &ProjectionParams) -> Trend {
    if momentum > params.trend_threshold {
        Trend::Bullish
    } else if momentum < -params.trend_threshold {
        Trend::Bearish
    } else {
        Trend::Neutral
    }
}

/// First match wins: strong calls need low volatility, then plain buy/sell on momentum alone.
pub fn classify(momentum: f64, volatility: f64, params: &ProjectionParams) -> Recommendation {
    let calm = volatility < params.strong_volatility_gate;
    if momentum > params.strong_momentum && calm {
        Recommendation::StrongBuy
    } else if momentum < -params.strong_momentum && calm {
        Recommendation::StrongSell
    } else if momentum > params.action_momentum {
        Recommendation::Buy
    } else if momentum < -params.action_momentum {
        Recommendation::Sell
    } else {
        Recommendation::Hold
    }
}

pub fn risk_for(volatility: f64, params: &ProjectionParams) -> RiskLevel {
    if volatility < params.risk_low_below {
        RiskLevel::Low
    } else if volatility <= params.risk_high_above {
        RiskLevel::Medium
    } else {
        RiskLevel::High
    }
}

pub fn confidence(
    momentum: f64,
    volatility: f64,
    volume: u64,
    market_cap: Option<f64>,
    params: &ProjectionParams,
) -> u8 {
    let momentum_sub = momentum.abs() / 100.0;
    let stability_sub = 1.0 - volatility / 100.0;
    let volume_sub = ((volume as f64 - params.volume_floor)
        / (params.volume_full - params.volume_floor))
        .clamp(0.0, 1.0);
    let cap_sub = market_cap
        .map(|cap| (cap / params.market_cap_full).clamp(0.0, 1.0))
        .unwrap_or(0.0);

    let raw = params.confidence_base
        + params.confidence_momentum_weight * momentum_sub
        + params.confidence_stability_weight * stability_sub
        + params.confidence_volume_weight * volume_sub
        + params.confidence_cap_weight * cap_sub;
    raw.round().clamp(0.0, 100.0) as u8
}

/// Aggregate view over one run's projections.
pub fn summarize(projections: &[Projection]) -> ProjectionSummary {
    let mut recommendations: BTreeMap<Recommendation, usize> = BTreeMap::new();
    let mut trends: BTreeMap<Trend, usize> = BTreeMap::new();
    let mut risk_profile: BTreeMap<RiskLevel, usize> = BTreeMap::new();
    for p in projections {
        *recommendations.entry(p.recommendation).or_default() += 1;
        *trends.entry(p.trend).or_default() += 1;
        *risk_profile.entry(p.risk_level).or_default() += 1;
    }

    let n = projections.len();
    let (average_confidence, average_expected_change) = if n == 0 {
        (0.0, 0.0)
    } else {
        (
            projections.iter().map(|p| p.confidence as f64).sum::<f64>() / n as f64,
            projections.iter().map(|p| p.expected_change_percent).sum::<f64>() / n as f64,
        )
    };

    let sentiment = if average_expected_change > SENTIMENT_THRESHOLD_PCT {
        Trend::Bullish
    } else if average_expected_change < -SENTIMENT_THRESHOLD_PCT {
        Trend::Bearish
    } else {
        Trend::Neutral
    };

    ProjectionSummary {
        total_projections: n,
        recommendations,
        trends,
        risk_profile,
        average_confidence: round_to(average_confidence, 1),
        average_expected_change: round_to(average_expected_change, 2),
        sentiment,
        strong_buys: top_opportunities(projections, Recommendation::StrongBuy),
        strong_sells: top_opportunities(projections, Recommendation::StrongSell),
        projection_date: projections.iter().map(|p| p.projection_date).max(),
    }
}

fn top_opportunities(projections: &[Projection], kind: Recommendation) -> Vec<Opportunity> {
    let mut picks: Vec<&Projection> = projections
        .iter()
        .filter(|p| p.recommendation == kind)
        .collect();
    picks.sort_by(|a, b| {
        b.confidence
            .cmp(&a.confidence)
            .then_with(|| {
                b.expected_change_percent
                    .abs()
                    .partial_cmp(&a.expected_change_percent.abs())
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| a.symbol.cmp(&b.symbol))
    });
    picks
        .into_iter()
        .take(TOP_OPPORTUNITIES)
        .map(|p| Opportunity {
            symbol: p.symbol.clone(),
            target_mid: p.target_mid,
            confidence: p.confidence,
        })
        .collect()
}
