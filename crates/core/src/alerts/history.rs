use super::AlertEvent;
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const KEEP_EVENTS: usize = 500;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryState {
    #[serde(default)]
    pub last_triggered: BTreeMap<String, DateTime<Utc>>,
    /// Newest last; trimmed to the most recent entries on every save.
    #[serde(default)]
    pub events: Vec<AlertEvent>,
}

/// `alerts_history.json` under a data directory. A missing file reads as empty history.
#[derive(Debug, Clone)]
pub struct AlertHistory {
    path: PathBuf,
}

impl AlertHistory {
    pub const FILE_NAME: &'static str = "alerts_history.json";

    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(Self::FILE_NAME),
        }
    }

    pub async fn load(&self) -> anyhow::Result<HistoryState> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(HistoryState::default())
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read {}", self.path.display()))
            }
        };
        serde_json::from_slice(&raw)
            .with_context(|| format!("alert history {} does not parse", self.path.display()))
    }

    pub async fn save(&self, state: &mut HistoryState) -> anyhow::Result<()> {
        if state.events.len() > KEEP_EVENTS {
            let excess = state.events.len() - KEEP_EVENTS;
            state.events.drain(..excess);
        }
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        let body = serde_json::to_vec_pretty(state).context("failed to serialize alert history")?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &body)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("failed to move alert history into place at {}", self.path.display()))?;
        Ok(())
    }
}

impl HistoryState {
    /// True while `now` is still inside the rule's cooldown since it last fired.
    pub fn cooling_down(&self, alert_id: &str, cooldown_minutes: u32, now: DateTime<Utc>) -> bool {
        if cooldown_minutes == 0 {
            return false;
        }
        self.last_triggered.get(alert_id).is_some_and(|last| {
            now.signed_duration_since(*last) < chrono::Duration::minutes(i64::from(cooldown_minutes))
        })
    }

    pub fn record(&mut self, event: AlertEvent) {
        self.last_triggered
            .insert(event.alert_id.clone(), event.triggered_at);
        self.events.push(event);
    }
}
