use anyhow::Context;
use chrono::NaiveDate;
use marketpulse_core::config::Settings;
use marketpulse_core::storage::json_file::JsonFileSink;
use marketpulse_core::storage::lock::AsOfDateLock;
use marketpulse_core::storage::postgres::PgStorage;
use marketpulse_core::storage::{StorageSink, StoredRun};
use std::path::Path;

const DEFAULT_OUTPUT_DIR: &str = "data";

/// Where a finished run goes, plus the as-of date lock when the target is the database.
pub struct Destination {
    sink: Box<dyn StorageSink>,
    lock: Option<AsOfDateLock>,
}

impl Destination {
    pub fn name(&self) -> &'static str {
        self.sink.name()
    }

    pub async fn store_and_release(self, run: &StoredRun<'_>) -> anyhow::Result<()> {
        let stored = self.sink.store(run).await;
        if let Some(lock) = self.lock {
            if let Err(err) = lock.release().await {
                tracing::warn!(error = ?err, as_of_date = %run.as_of_date, "failed to release as_of_date lock");
            }
        }
        stored
    }
}

/// `--output-dir` wins; without it the database is used when `DATABASE_URL` is set.
///
/// Returns `Ok(None)` when another worker holds the lock for `as_of_date`.
pub async fn open(
    settings: &Settings,
    output_dir: Option<&Path>,
    as_of_date: NaiveDate,
) -> anyhow::Result<Option<Destination>> {
    if output_dir.is_some() || settings.database_url.is_none() {
        let dir = output_dir.unwrap_or_else(|| Path::new(DEFAULT_OUTPUT_DIR));
        tracing::info!(dir = %dir.display(), "writing run to JSON file");
        return Ok(Some(Destination {
            sink: Box::new(JsonFileSink::new(dir)),
            lock: None,
        }));
    }

    let db_url = settings.require_database_url()?;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(db_url)
        .await
        .context("connect DATABASE_URL failed")?;

    marketpulse_core::storage::migrate(&pool).await?;

    let Some(lock) = AsOfDateLock::try_acquire(&pool, as_of_date).await? else {
        return Ok(None);
    };

    Ok(Some(Destination {
        sink: Box::new(PgStorage::new(pool)),
        lock: Some(lock),
    }))
}
