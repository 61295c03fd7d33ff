// Verification service - tracks pending join challenges.
//
// A pending challenge is its timeout job: starting a challenge schedules a
// `CaptchaTimeout` job, a correct answer cancels it, and the scheduler
// firing it means time ran out. Whichever side removes the job first wins,
// so a late answer can't rescue a member who is already being kicked.

use super::challenge::is_correct;
use crate::core::moderation::CaptchaSettings;
use crate::core::scheduler::{JobKind, JobStore, ScheduledJob, SchedulerError, SchedulerService};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

const CAPTCHA_JOB: &str = "captcha_timeout";

/// Extra time the restriction outlives the challenge, so the kick happens
/// while the member is still muted.
const RESTRICTION_GRACE_SECS: i64 = 60;

/// What a button press did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Challenge solved; lift the restriction and drop the prompt
    Passed { prompt_message_id: Option<i32> },
    /// Wrong option; the challenge stays open
    Wrong,
    /// No open challenge (already solved, or timed out)
    NotPending,
}

/// How long to mute a member while their challenge is open.
pub fn challenge_mute_until(settings: &CaptchaSettings, now: DateTime<Utc>) -> DateTime<Utc> {
    let secs = i64::try_from(settings.timeout_secs).unwrap_or(86400);
    now + Duration::seconds(secs + RESTRICTION_GRACE_SECS)
}

pub struct VerificationService<J: JobStore> {
    scheduler: Arc<SchedulerService<J>>,
}

impl<J: JobStore> VerificationService<J> {
    pub fn new(scheduler: Arc<SchedulerService<J>>) -> Self {
        Self { scheduler }
    }

    /// Open a challenge for a member whose prompt was just sent. A second
    /// join replaces the first challenge.
    pub async fn start(
        &self,
        group_id: i64,
        user_id: u64,
        settings: &CaptchaSettings,
        prompt_message_id: Option<i32>,
        answer: Option<u8>,
        now: DateTime<Utc>,
    ) -> Result<ScheduledJob, SchedulerError> {
        let secs = i64::try_from(settings.timeout_secs).unwrap_or(86400);
        let job = self
            .scheduler
            .schedule_for_user(
                group_id,
                0,
                JobKind::CaptchaTimeout {
                    user_id,
                    prompt_message_id,
                    answer,
                },
                now + Duration::seconds(secs),
            )
            .await?;
        tracing::info!(group_id, user_id, job_id = job.id, "Join challenge started");
        Ok(job)
    }

    /// Check a member's answer to their own challenge.
    pub async fn answer(
        &self,
        group_id: i64,
        user_id: u64,
        choice: Option<u8>,
    ) -> Result<Verdict, SchedulerError> {
        let Some(job) = self
            .scheduler
            .pending_for_user(group_id, user_id, CAPTCHA_JOB)
            .await?
        else {
            return Ok(Verdict::NotPending);
        };
        let JobKind::CaptchaTimeout {
            prompt_message_id,
            answer,
            ..
        } = job.kind
        else {
            return Ok(Verdict::NotPending);
        };

        if !is_correct(answer, choice) {
            tracing::debug!(group_id, user_id, "Wrong challenge answer");
            return Ok(Verdict::Wrong);
        }
        if !self
            .scheduler
            .cancel_for_user(group_id, user_id, CAPTCHA_JOB)
            .await?
        {
            return Ok(Verdict::NotPending);
        }

        tracing::info!(group_id, user_id, "Join challenge passed");
        Ok(Verdict::Passed { prompt_message_id })
    }
}

// ============================================================================
// TESTS
// ============================================================================
