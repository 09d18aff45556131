use anyhow::Context;
use chrono::{Datelike, NaiveDate};

// Session-scoped advisory lock so two workers never persist the same as-of date at once.
const LOCK_NAMESPACE: i64 = 0x4D50_554C_5345; // "MPULSE"

fn lock_key_for_date(as_of_date: NaiveDate) -> i64 {
    LOCK_NAMESPACE ^ (as_of_date.num_days_from_ce() as i64)
}

/// Holds the lock on a dedicated connection; advisory locks belong to the session that took them.
pub struct AsOfDateLock {
    conn: sqlx::pool::PoolConnection<sqlx::Postgres>,
    key: i64,
}

impl AsOfDateLock {
    /// `Ok(None)` when another session already holds the lock.
    pub async fn try_acquire(
        pool: &sqlx::PgPool,
        as_of_date: NaiveDate,
    ) -> anyhow::Result<Option<Self>> {
        let key = lock_key_for_date(as_of_date);
        let mut conn = pool
            .acquire()
            .await
            .context("failed to check out a connection for the advisory lock")?;
        let acquired: (bool,) = sqlx::query_as("SELECT pg_try_advisory_lock($1)")
            .persistent(false)
            .bind(key)
            .fetch_one(&mut *conn)
            .await
            .with_context(|| format!("failed to acquire advisory lock (key={key})"))?;

        Ok(acquired.0.then_some(Self { conn, key }))
    }

    pub async fn release(mut self) -> anyhow::Result<()> {
        let key = self.key;
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .persistent(false)
            .bind(key)
            .execute(&mut *self.conn)
            .await
            .with_context(|| format!("failed to release advisory lock (key={key})"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_differ_per_date() {
        let a = lock_key_for_date(NaiveDate::from_ymd_opt(2026, 1, 27).unwrap());
        let b = lock_key_for_date(NaiveDate::from_ymd_opt(2026, 1, 28).unwrap());
        assert_ne!(a, b);
    }
}
