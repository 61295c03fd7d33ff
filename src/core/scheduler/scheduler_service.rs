// Scheduler service - stores jobs and hands out the due ones.
//
// Admins schedule announcements and rotating pins. Moderation schedules
// per-member jobs (timed unmute/unban, join challenge timeouts); a member
// has at most one job of each such kind per group.
//
// The Telegram layer polls `take_due` on a fixed tick. A job is moved
// forward (or deleted) before it is returned, so a crash between taking and
// sending skips one run instead of repeating it.

use super::scheduler_models::{JobKind, NewJob, ScheduledJob};
use crate::core::duration::{parse_duration, InvalidDuration};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

/// Repeating jobs may not fire more often than this.
pub const MIN_INTERVAL_SECS: u64 = 60;

/// Longest announcement Telegram will accept in one message.
const MAX_TEXT_LEN: usize = 4096;

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Storage error: {0}")]
    StorageError(String),

    #[error(transparent)]
    InvalidDuration(#[from] InvalidDuration),

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("Job #{0} not found")]
    JobNotFound(i64),
}

// ============================================================================
// STORAGE TRAIT (PORT)
// ============================================================================

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_job(&self, job: NewJob) -> Result<ScheduledJob, SchedulerError>;

    /// Jobs of one group, soonest first.
    async fn list_jobs(&self, group_id: i64) -> Result<Vec<ScheduledJob>, SchedulerError>;

    /// Returns false if the group has no such job.
    async fn delete_job(&self, group_id: i64, job_id: i64) -> Result<bool, SchedulerError>;

    /// Jobs with `run_at <= now` across all groups.
    async fn due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledJob>, SchedulerError>;

    async fn reschedule(&self, job_id: i64, run_at: DateTime<Utc>) -> Result<(), SchedulerError>;

    /// Replace a job's payload. Returns false if the job is gone.
    async fn update_kind(&self, job_id: i64, kind: &JobKind) -> Result<bool, SchedulerError>;
}

// ============================================================================
// CORE SERVICE
// ============================================================================

pub struct SchedulerService<J: JobStore> {
    store: J,
}

impl<J: JobStore> SchedulerService<J> {
    pub fn new(store: J) -> Self {
        Self { store }
    }

    /// Schedule `text` to be posted after `delay`, optionally repeating
    /// `every` interval afterwards.
    pub async fn schedule_announcement(
        &self,
        group_id: i64,
        created_by: u64,
        delay: &str,
        every: Option<&str>,
        text: String,
        now: DateTime<Utc>,
    ) -> Result<ScheduledJob, SchedulerError> {
        let text = checked_text(text)?;
        self.schedule_post(group_id, created_by, delay, every, JobKind::Announce { text }, now)
            .await
    }

    /// Like an announcement, but the message gets pinned and, with
    /// `unpin_previous`, replaces the pin from the previous run.
    #[allow(clippy::too_many_arguments)]
    pub async fn schedule_rotating_pin(
        &self,
        group_id: i64,
        created_by: u64,
        delay: &str,
        every: Option<&str>,
        text: String,
        unpin_previous: bool,
        now: DateTime<Utc>,
    ) -> Result<ScheduledJob, SchedulerError> {
        let kind = JobKind::RotatePin {
            text: checked_text(text)?,
            unpin_previous,
            last_pinned: None,
        };
        self.schedule_post(group_id, created_by, delay, every, kind, now)
            .await
    }

    async fn schedule_post(
        &self,
        group_id: i64,
        created_by: u64,
        delay: &str,
        every: Option<&str>,
        kind: JobKind,
        now: DateTime<Utc>,
    ) -> Result<ScheduledJob, SchedulerError> {
        let delay_secs = finite_secs(delay, "delay")?;
        let interval_secs = match every {
            Some(raw) => {
                let secs = finite_secs(raw, "interval")?;
                if secs < MIN_INTERVAL_SECS {
                    return Err(SchedulerError::InvalidSchedule(format!(
                        "interval must be at least {}s",
                        MIN_INTERVAL_SECS
                    )));
                }
                Some(secs)
            }
            None => None,
        };

        let run_at = add_secs(now, delay_secs)?;
        let job = self
            .store
            .insert_job(NewJob {
                group_id,
                kind,
                run_at,
                interval_secs,
                created_by,
            })
            .await?;

        tracing::info!(
            group_id,
            job_id = job.id,
            kind = job.kind.name(),
            run_at = %job.run_at,
            "Post scheduled"
        );
        Ok(job)
    }

    /// Schedule a one-shot job for one member, replacing any job of the
    /// same kind already pending for them in the group.
    pub async fn schedule_for_user(
        &self,
        group_id: i64,
        created_by: u64,
        kind: JobKind,
        run_at: DateTime<Utc>,
    ) -> Result<ScheduledJob, SchedulerError> {
        let Some(user_id) = kind.target_user() else {
            return Err(SchedulerError::InvalidSchedule(format!(
                "{} jobs are not tied to a member",
                kind.name()
            )));
        };
        self.cancel_for_user(group_id, user_id, kind.name()).await?;

        let job = self
            .store
            .insert_job(NewJob {
                group_id,
                kind,
                run_at,
                interval_secs: None,
                created_by,
            })
            .await?;
        tracing::debug!(
            group_id,
            user_id,
            job_id = job.id,
            kind = job.kind.name(),
            run_at = %job.run_at,
            "Member job scheduled"
        );
        Ok(job)
    }

    /// The pending job of kind `name` for a member, if any.
    pub async fn pending_for_user(
        &self,
        group_id: i64,
        user_id: u64,
        name: &str,
    ) -> Result<Option<ScheduledJob>, SchedulerError> {
        Ok(self
            .store
            .list_jobs(group_id)
            .await?
            .into_iter()
            .find(|job| job.kind.name() == name && job.kind.target_user() == Some(user_id)))
    }

    /// Drop a member's pending jobs of kind `name`. Returns true if one
    /// was still there; the caller that gets `true` owns the outcome.
    pub async fn cancel_for_user(
        &self,
        group_id: i64,
        user_id: u64,
        name: &str,
    ) -> Result<bool, SchedulerError> {
        let mut cancelled = false;
        for job in self.store.list_jobs(group_id).await? {
            if job.kind.name() == name && job.kind.target_user() == Some(user_id) {
                cancelled |= self.store.delete_job(group_id, job.id).await?;
            }
        }
        Ok(cancelled)
    }

    /// Remember which message a rotating pin job pinned last.
    pub async fn record_pinned(&self, job: &ScheduledJob, message_id: i32) -> Result<(), SchedulerError> {
        let JobKind::RotatePin {
            text,
            unpin_previous,
            ..
        } = &job.kind
        else {
            return Err(SchedulerError::InvalidSchedule(format!(
                "job #{} does not pin messages",
                job.id
            )));
        };
        let kind = JobKind::RotatePin {
            text: text.clone(),
            unpin_previous: *unpin_previous,
            last_pinned: Some(message_id),
        };
        // A one-shot job is already gone; nothing to remember then
        self.store.update_kind(job.id, &kind).await?;
        Ok(())
    }

    pub async fn list_jobs(&self, group_id: i64) -> Result<Vec<ScheduledJob>, SchedulerError> {
        self.store.list_jobs(group_id).await
    }

    pub async fn cancel_job(&self, group_id: i64, job_id: i64) -> Result<(), SchedulerError> {
        if !self.store.delete_job(group_id, job_id).await? {
            return Err(SchedulerError::JobNotFound(job_id));
        }
        tracing::info!(group_id, job_id, "Job cancelled");
        Ok(())
    }

    /// Return every job due at `now`. One-shot jobs are deleted, repeating
    /// jobs move to `now + interval`.
    pub async fn take_due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledJob>, SchedulerError> {
        let due = self.store.due_jobs(now).await?;

        for job in &due {
            match job.interval_secs {
                Some(secs) => {
                    let next = add_secs(now, secs)?;
                    self.store.reschedule(job.id, next).await?;
                }
                None => {
                    self.store.delete_job(job.group_id, job.id).await?;
                }
            }
        }

        Ok(due)
    }
}

fn checked_text(text: String) -> Result<String, SchedulerError> {
    let text = text.trim().to_string();
    if text.is_empty() {
        return Err(SchedulerError::InvalidSchedule(
            "announcement text is empty".to_string(),
        ));
    }
    if text.chars().count() > MAX_TEXT_LEN {
        return Err(SchedulerError::InvalidSchedule(format!(
            "announcement is longer than {} characters",
            MAX_TEXT_LEN
        )));
    }
    Ok(text)
}

/// Parse a duration that must not be "perm".
fn finite_secs(raw: &str, what: &str) -> Result<u64, SchedulerError> {
    parse_duration(raw)?
        .as_secs()
        .ok_or_else(|| SchedulerError::InvalidSchedule(format!("{} cannot be permanent", what)))
}

fn add_secs(at: DateTime<Utc>, secs: u64) -> Result<DateTime<Utc>, SchedulerError> {
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .and_then(|d| at.checked_add_signed(d))
        .ok_or_else(|| SchedulerError::InvalidSchedule("time is too far in the future".to_string()))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use dashmap::DashMap;
    use std::sync::atomic::{AtomicI64, Ordering};

    /// In-memory store for testing
    #[derive(Default)]
    struct MockJobStore {
        jobs: DashMap<i64, ScheduledJob>,
        next_id: AtomicI64,
    }

    #[async_trait]
    impl JobStore for MockJobStore {
        async fn insert_job(&self, job: NewJob) -> Result<ScheduledJob, SchedulerError> {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            let stored = ScheduledJob {
                id,
                group_id: job.group_id,
                kind: job.kind,
                run_at: job.run_at,
                interval_secs: job.interval_secs,
                created_by: job.created_by,
            };
            self.jobs.insert(id, stored.clone());
            Ok(stored)
        }

        async fn list_jobs(&self, group_id: i64) -> Result<Vec<ScheduledJob>, SchedulerError> {
            let mut jobs: Vec<_> = self
                .jobs
                .iter()
                .filter(|j| j.group_id == group_id)
                .map(|j| j.clone())
                .collect();
            jobs.sort_by_key(|j| (j.run_at, j.id));
            Ok(jobs)
        }

        async fn delete_job(&self, group_id: i64, job_id: i64) -> Result<bool, SchedulerError> {
            Ok(self
                .jobs
                .remove_if(&job_id, |_, j| j.group_id == group_id)
                .is_some())
        }

        async fn due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledJob>, SchedulerError> {
            Ok(self
                .jobs
                .iter()
                .filter(|j| j.run_at <= now)
                .map(|j| j.clone())
                .collect())
        }

        async fn reschedule(&self, job_id: i64, run_at: DateTime<Utc>) -> Result<(), SchedulerError> {
            if let Some(mut job) = self.jobs.get_mut(&job_id) {
                job.run_at = run_at;
            }
            Ok(())
        }

        async fn update_kind(&self, job_id: i64, kind: &JobKind) -> Result<bool, SchedulerError> {
            Ok(match self.jobs.get_mut(&job_id) {
                Some(mut job) => {
                    job.kind = kind.clone();
                    true
                }
                None => false,
            })
        }
    }

    const GROUP: i64 = -42;

    #[tokio::test]
    async fn test_schedule_sets_run_at() {
        let service = SchedulerService::new(MockJobStore::default());
        let now = Utc::now();

        let job = service
            .schedule_announcement(GROUP, 1, "10m", None, "Meeting soon".to_string(), now)
            .await
            .unwrap();

        assert_eq!(job.run_at, now + Duration::seconds(600));
        assert_eq!(job.interval_secs, None);
        assert_eq!(
            job.kind,
            JobKind::Announce {
                text: "Meeting soon".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_rejects_bad_schedules() {
        let service = SchedulerService::new(MockJobStore::default());
        let now = Utc::now();

        let perm = service
            .schedule_announcement(GROUP, 1, "perm", None, "x".to_string(), now)
            .await;
        assert!(matches!(perm, Err(SchedulerError::InvalidSchedule(_))));

        let garbage = service
            .schedule_announcement(GROUP, 1, "soon", None, "x".to_string(), now)
            .await;
        assert!(matches!(garbage, Err(SchedulerError::InvalidDuration(_))));

        let too_often = service
            .schedule_announcement(GROUP, 1, "1m", Some("10s"), "x".to_string(), now)
            .await;
        assert!(matches!(too_often, Err(SchedulerError::InvalidSchedule(_))));

        let empty = service
            .schedule_announcement(GROUP, 1, "1m", None, "   ".to_string(), now)
            .await;
        assert!(empty.is_err());
    }

    #[tokio::test]
    async fn test_take_due_removes_one_shot_and_reschedules_repeating() {
        let service = SchedulerService::new(MockJobStore::default());
        let now = Utc::now();

        let once = service
            .schedule_announcement(GROUP, 1, "1m", None, "once".to_string(), now)
            .await
            .unwrap();
        let daily = service
            .schedule_announcement(GROUP, 1, "1m", Some("1d"), "daily".to_string(), now)
            .await
            .unwrap();
        service
            .schedule_announcement(GROUP, 1, "2h", None, "later".to_string(), now)
            .await
            .unwrap();

        let tick = now + Duration::seconds(90);
        let mut due = service.take_due(tick).await.unwrap();
        due.sort_by_key(|j| j.id);
        assert_eq!(due.iter().map(|j| j.id).collect::<Vec<_>>(), vec![once.id, daily.id]);

        let remaining = service.list_jobs(GROUP).await.unwrap();
        assert_eq!(remaining.len(), 2);
        let daily_next = remaining.iter().find(|j| j.id == daily.id).unwrap();
        assert_eq!(daily_next.run_at, tick + Duration::days(1));

        // Nothing is due twice
        assert!(service.take_due(tick).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_take_due_runs_every_job_kind() {
        let service = SchedulerService::new(MockJobStore::default());
        let now = Utc::now();

        service
            .schedule_announcement(GROUP, 1, "1m", None, "hello".to_string(), now)
            .await
            .unwrap();
        let pin = service
            .schedule_rotating_pin(GROUP, 1, "1m", Some("1d"), "Read the rules".to_string(), true, now)
            .await
            .unwrap();
        let release_at = now + Duration::seconds(30);
        for kind in [
            JobKind::TimedUnmute { user_id: 7 },
            JobKind::TimedUnban { user_id: 8 },
            JobKind::CaptchaTimeout {
                user_id: 9,
                prompt_message_id: Some(55),
                answer: Some(12),
            },
        ] {
            service
                .schedule_for_user(GROUP, 0, kind, release_at)
                .await
                .unwrap();
        }

        let tick = now + Duration::seconds(90);
        let due = service.take_due(tick).await.unwrap();
        let mut names: Vec<&str> = due.iter().map(|j| j.kind.name()).collect();
        names.sort();
        assert_eq!(
            names,
            vec!["announce", "captcha_timeout", "rotate_pin", "timed_unban", "timed_unmute"]
        );

        // Only the repeating pin survives
        let remaining = service.list_jobs(GROUP).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, pin.id);
        assert_eq!(remaining[0].run_at, tick + Duration::days(1));
    }

    #[tokio::test]
    async fn test_member_jobs_replace_and_cancel() {
        let service = SchedulerService::new(MockJobStore::default());
        let now = Utc::now();

        service
            .schedule_for_user(GROUP, 1, JobKind::TimedUnmute { user_id: 7 }, now + Duration::hours(1))
            .await
            .unwrap();
        let later = service
            .schedule_for_user(GROUP, 1, JobKind::TimedUnmute { user_id: 7 }, now + Duration::hours(3))
            .await
            .unwrap();
        service
            .schedule_for_user(GROUP, 1, JobKind::TimedUnban { user_id: 7 }, now + Duration::hours(2))
            .await
            .unwrap();

        let pending = service
            .pending_for_user(GROUP, 7, "timed_unmute")
            .await
            .unwrap();
        assert_eq!(pending.map(|j| j.id), Some(later.id));
        assert_eq!(service.list_jobs(GROUP).await.unwrap().len(), 2);

        assert!(service.cancel_for_user(GROUP, 7, "timed_unmute").await.unwrap());
        assert!(!service.cancel_for_user(GROUP, 7, "timed_unmute").await.unwrap());

        let not_per_user = service
            .schedule_for_user(GROUP, 1, JobKind::Announce { text: "x".to_string() }, now)
            .await;
        assert!(matches!(not_per_user, Err(SchedulerError::InvalidSchedule(_))));
    }

    #[tokio::test]
    async fn test_record_pinned_keeps_rotation_settings() {
        let service = SchedulerService::new(MockJobStore::default());
        let job = service
            .schedule_rotating_pin(GROUP, 1, "1m", Some("1h"), "Pinned".to_string(), false, Utc::now())
            .await
            .unwrap();

        service.record_pinned(&job, 321).await.unwrap();

        let stored = service.list_jobs(GROUP).await.unwrap().remove(0);
        assert_eq!(
            stored.kind,
            JobKind::RotatePin {
                text: "Pinned".to_string(),
                unpin_previous: false,
                last_pinned: Some(321),
            }
        );
    }

    #[tokio::test]
    async fn test_cancel_job() {
        let service = SchedulerService::new(MockJobStore::default());
        let job = service
            .schedule_announcement(GROUP, 1, "1h", None, "x".to_string(), Utc::now())
            .await
            .unwrap();

        assert!(matches!(
            service.cancel_job(GROUP + 1, job.id).await,
            Err(SchedulerError::JobNotFound(_))
        ));
        service.cancel_job(GROUP, job.id).await.unwrap();
        assert!(service.list_jobs(GROUP).await.unwrap().is_empty());
    }
}
