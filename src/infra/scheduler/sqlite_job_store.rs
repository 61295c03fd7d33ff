// SQLite-backed job store for scheduled posts and member jobs.
//
// Tables:
// - scheduled_jobs: One row per job; the job kind is stored as JSON

use crate::core::scheduler::{JobKind, JobStore, NewJob, ScheduledJob, SchedulerError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Pool, Row, Sqlite};

fn storage_err(e: impl std::fmt::Display) -> SchedulerError {
    SchedulerError::StorageError(e.to_string())
}

pub struct SqliteJobStore {
    pool: Pool<Sqlite>,
}

impl SqliteJobStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Run database migrations to create required tables.
    pub async fn migrate(&self) -> Result<(), SchedulerError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scheduled_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                group_id INTEGER NOT NULL,
                payload TEXT NOT NULL,
                run_at TEXT NOT NULL,
                interval_secs INTEGER,
                created_by INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_scheduled_jobs_run_at
                ON scheduled_jobs(run_at);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    fn row_to_job(row: &SqliteRow) -> Result<ScheduledJob, SchedulerError> {
        let payload: &str = row.get("payload");
        let run_at: &str = row.get("run_at");
        Ok(ScheduledJob {
            id: row.get("id"),
            group_id: row.get("group_id"),
            kind: serde_json::from_str::<JobKind>(payload).map_err(storage_err)?,
            run_at: DateTime::parse_from_rfc3339(run_at)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(storage_err)?,
            interval_secs: row.get::<Option<i64>, _>("interval_secs").map(|s| s as u64),
            created_by: row.get::<i64, _>("created_by") as u64,
        })
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn insert_job(&self, job: NewJob) -> Result<ScheduledJob, SchedulerError> {
        let payload = serde_json::to_string(&job.kind).map_err(storage_err)?;
        let result = sqlx::query(
            r#"
            INSERT INTO scheduled_jobs (group_id, payload, run_at, interval_secs, created_by)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(job.group_id)
        .bind(payload)
        .bind(job.run_at.to_rfc3339())
        .bind(job.interval_secs.map(|s| s as i64))
        .bind(job.created_by as i64)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(ScheduledJob {
            id: result.last_insert_rowid(),
            group_id: job.group_id,
            kind: job.kind,
            run_at: job.run_at,
            interval_secs: job.interval_secs,
            created_by: job.created_by,
        })
    }

    async fn list_jobs(&self, group_id: i64) -> Result<Vec<ScheduledJob>, SchedulerError> {
        let rows = sqlx::query(
            "SELECT * FROM scheduled_jobs WHERE group_id = ? ORDER BY run_at ASC, id ASC",
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.iter().map(Self::row_to_job).collect()
    }

    async fn delete_job(&self, group_id: i64, job_id: i64) -> Result<bool, SchedulerError> {
        let result = sqlx::query("DELETE FROM scheduled_jobs WHERE group_id = ? AND id = ?")
            .bind(group_id)
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledJob>, SchedulerError> {
        // RFC 3339 strings in UTC sort chronologically
        let rows = sqlx::query("SELECT * FROM scheduled_jobs WHERE run_at <= ? ORDER BY run_at ASC")
            .bind(now.to_rfc3339())
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;

        rows.iter().map(Self::row_to_job).collect()
    }

    async fn reschedule(&self, job_id: i64, run_at: DateTime<Utc>) -> Result<(), SchedulerError> {
        sqlx::query("UPDATE scheduled_jobs SET run_at = ? WHERE id = ?")
            .bind(run_at.to_rfc3339())
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn update_kind(&self, job_id: i64, kind: &JobKind) -> Result<bool, SchedulerError> {
        let payload = serde_json::to_string(kind).map_err(storage_err)?;
        let result = sqlx::query("UPDATE scheduled_jobs SET payload = ? WHERE id = ?")
            .bind(payload)
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::sqlite_pool;
    use chrono::Duration;
    use tempfile::NamedTempFile;

    async fn store() -> (SqliteJobStore, NamedTempFile) {
        let tmp = NamedTempFile::new().unwrap();
        let pool = sqlite_pool::connect(&format!("sqlite://{}", tmp.path().display()))
            .await
            .unwrap();
        let store = SqliteJobStore::new(pool);
        store.migrate().await.unwrap();
        (store, tmp)
    }

    fn job(group_id: i64, run_at: DateTime<Utc>, interval_secs: Option<u64>) -> NewJob {
        NewJob {
            group_id,
            kind: JobKind::Announce {
                text: "Weekly call in 10 minutes".to_string(),
            },
            run_at,
            interval_secs,
            created_by: 3,
        }
    }

    #[tokio::test]
    async fn test_due_jobs_and_reschedule() {
        let (store, _tmp) = store().await;
        let now = DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        let past = store.insert_job(job(-1, now - Duration::minutes(1), Some(3600))).await.unwrap();
        let future = store.insert_job(job(-1, now + Duration::minutes(1), None)).await.unwrap();

        let due = store.due_jobs(now).await.unwrap();
        assert_eq!(due, vec![past.clone()]);

        store.reschedule(past.id, now + Duration::hours(1)).await.unwrap();
        assert!(store.due_jobs(now).await.unwrap().is_empty());

        let listed = store.list_jobs(-1).await.unwrap();
        assert_eq!(listed.iter().map(|j| j.id).collect::<Vec<_>>(), vec![future.id, past.id]);
    }

    #[tokio::test]
    async fn test_delete_is_scoped_to_group() {
        let (store, _tmp) = store().await;
        let stored = store.insert_job(job(-1, Utc::now(), None)).await.unwrap();

        assert!(!store.delete_job(-2, stored.id).await.unwrap());
        assert!(store.delete_job(-1, stored.id).await.unwrap());
        assert!(store.list_jobs(-1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_kind_rewrites_payload() {
        let (store, _tmp) = store().await;
        let mut new_job = job(-1, Utc::now(), Some(86400));
        new_job.kind = JobKind::RotatePin {
            text: "Rules".to_string(),
            unpin_previous: true,
            last_pinned: None,
        };
        let stored = store.insert_job(new_job).await.unwrap();

        let pinned = JobKind::RotatePin {
            text: "Rules".to_string(),
            unpin_previous: true,
            last_pinned: Some(99),
        };
        assert!(store.update_kind(stored.id, &pinned).await.unwrap());
        assert_eq!(store.list_jobs(-1).await.unwrap()[0].kind, pinned);

        store.delete_job(-1, stored.id).await.unwrap();
        assert!(!store.update_kind(stored.id, &pinned).await.unwrap());
    }

    #[tokio::test]
    async fn test_member_job_payload_roundtrip() {
        let (store, _tmp) = store().await;
        let mut new_job = job(-1, Utc::now(), None);
        new_job.kind = JobKind::CaptchaTimeout {
            user_id: u64::from(u32::MAX) + 1,
            prompt_message_id: Some(12),
            answer: None,
        };
        let stored = store.insert_job(new_job).await.unwrap();
        assert_eq!(store.list_jobs(-1).await.unwrap(), vec![stored]);
    }
}
