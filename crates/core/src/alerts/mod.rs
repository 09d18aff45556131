pub mod history;
pub mod rules;

use crate::config::Settings;
use crate::domain::market::Snapshot;
use chrono::{DateTime, Utc};
use history::AlertHistory;
use rules::AlertRule;
use serde::{Deserialize, Serialize};
use std::path::Path;

const DEFAULT_HISTORY_DIR: &str = "data";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub alert_id: String,
    pub alert_name: String,
    /// `price_threshold` or `screening_match`.
    pub condition: String,
    pub symbols: Vec<String>,
    pub triggered_at: DateTime<Utc>,
}

/// Delivery channel named in a rule's `notifications` list.
pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;
    fn notify(&self, event: &AlertEvent);
}

pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn name(&self) -> &'static str {
        "log"
    }

    fn notify(&self, event: &AlertEvent) {
        tracing::info!(
            alert_id = %event.alert_id,
            alert_name = %event.alert_name,
            condition = %event.condition,
            symbols = ?event.symbols,
            "alert triggered"
        );
    }
}

/// Checks enabled rules against a run's snapshots, honoring per-rule cooldowns kept in history.
pub struct AlertEngine {
    rules: Vec<AlertRule>,
    history: AlertHistory,
    notifiers: Vec<Box<dyn Notifier>>,
}

impl AlertEngine {
    pub fn new(rules: Vec<AlertRule>, history: AlertHistory) -> Self {
        Self {
            rules,
            history,
            notifiers: vec![Box::new(LogNotifier)],
        }
    }

    /// `None` when `ALERTS_PATH` is unset or the file enables no rules.
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Option<Self>> {
        let Some(path) = &settings.alerts_path else {
            return Ok(None);
        };
        let rules = rules::load_rules(path)?;
        if rules.is_empty() {
            tracing::info!(path = %path, "no enabled alerts");
            return Ok(None);
        }
        let dir = settings
            .alerts_history_dir
            .as_deref()
            .unwrap_or(DEFAULT_HISTORY_DIR);
        tracing::info!(rules = rules.len(), "alert rules loaded");
        Ok(Some(Self::new(rules, AlertHistory::in_dir(Path::new(dir)))))
    }

    /// Returns the events that fired. History is only rewritten when something fired.
    pub async fn evaluate(
        &self,
        snapshots: &[Snapshot],
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<AlertEvent>> {
        let mut state = self.history.load().await?;
        let mut fired = Vec::new();

        for rule in &self.rules {
            if state.cooling_down(&rule.id, rule.cooldown_minutes, now) {
                tracing::debug!(alert_id = %rule.id, "alert in cooldown");
                continue;
            }
            let symbols = rule.condition.matching(snapshots);
            if symbols.is_empty() {
                continue;
            }

            let event = AlertEvent {
                alert_id: rule.id.clone(),
                alert_name: rule.display_name().to_string(),
                condition: rule.condition.kind().to_string(),
                symbols,
                triggered_at: now,
            };
            self.dispatch(rule, &event);
            state.record(event.clone());
            fired.push(event);
        }

        if !fired.is_empty() {
            self.history.save(&mut state).await?;
        }
        Ok(fired)
    }

    fn dispatch(&self, rule: &AlertRule, event: &AlertEvent) {
        for channel in &rule.notifications {
            match self.notifiers.iter().find(|n| n.name() == channel.as_str()) {
                Some(n) => n.notify(event),
                None => tracing::warn!(alert_id = %rule.id, channel = %channel, "unknown notification channel"),
            }
        }
    }
}
