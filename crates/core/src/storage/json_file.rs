use crate::storage::{StorageSink, StoredRun};
use anyhow::Context;
use std::path::PathBuf;

/// Writes each run to `<dir>/run_<as_of_date>.json`, replacing an earlier run for the same date.
#[derive(Debug, Clone)]
pub struct JsonFileSink {
    dir: PathBuf,
}

impl JsonFileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, run: &StoredRun<'_>) -> PathBuf {
        self.dir.join(format!("run_{}.json", run.as_of_date.format("%Y-%m-%d")))
    }
}

#[async_trait::async_trait]
impl StorageSink for JsonFileSink {
    fn name(&self) -> &'static str {
        "json-file"
    }

    async fn store(&self, run: &StoredRun<'_>) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("failed to create output dir {}", self.dir.display()))?;

        let path = self.path_for(run);
        let body = serde_json::to_vec_pretty(run).context("failed to serialize run")?;

        // Write then rename so readers never see a half-written file.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &body)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("failed to move run file into place at {}", path.display()))?;

        tracing::info!(path = %path.display(), bytes = body.len(), "run written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::market::fixtures::snapshot;
    use crate::pipeline::{PipelineCounts, PipelineResult};
    use chrono::{NaiveDate, Utc};

    #[tokio::test]
    async fn writes_dated_file() {
        let dir = std::env::temp_dir().join(format!("marketpulse-sink-{}", uuid::Uuid::new_v4()));
        let sink = JsonFileSink::new(&dir);
        let now = Utc::now();
        let result = PipelineResult {
            run_id: uuid::Uuid::new_v4(),
            success: true,
            failure: None,
            cancelled: false,
            as_of_date: NaiveDate::from_ymd_opt(2026, 1, 27).unwrap(),
            started_at: now,
            finished_at: now,
            snapshots: vec![snapshot("AAPL", 2.0, 3_000_000)],
            summary: None,
            projections: Vec::new(),
            projection_summary: None,
            errors: Vec::new(),
            counts: PipelineCounts::default(),
            api: Default::default(),
        };

        let run = StoredRun::from(&result);
        sink.store(&run).await.unwrap();

        let path = dir.join("run_2026-01-27.json");
        let v: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(v["status"], "success");
        assert_eq!(v["snapshots"][0]["symbol"], "AAPL");
        assert_eq!(v["as_of_date"], "2026-01-27");
        std::fs::remove_dir_all(&dir).ok();
    }
}
