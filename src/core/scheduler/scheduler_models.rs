// Scheduled job models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a job does when it fires. Stored as JSON next to the job row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobKind {
    /// Post a message to the group
    Announce { text: String },
    /// Post and pin a message, unpinning the one pinned on the last run
    RotatePin {
        text: String,
        #[serde(default = "default_true")]
        unpin_previous: bool,
        #[serde(default)]
        last_pinned: Option<i32>,
    },
    /// Give a muted member their permissions back
    TimedUnmute { user_id: u64 },
    /// Lift a member's ban
    TimedUnban { user_id: u64 },
    /// Kick a new member who never answered the join challenge.
    /// While this job exists the challenge is pending.
    CaptchaTimeout {
        user_id: u64,
        #[serde(default)]
        prompt_message_id: Option<i32>,
        /// `None` for a plain button challenge
        #[serde(default)]
        answer: Option<u8>,
    },
}

fn default_true() -> bool {
    true
}

impl JobKind {
    pub fn name(&self) -> &'static str {
        match self {
            JobKind::Announce { .. } => "announce",
            JobKind::RotatePin { .. } => "rotate_pin",
            JobKind::TimedUnmute { .. } => "timed_unmute",
            JobKind::TimedUnban { .. } => "timed_unban",
            JobKind::CaptchaTimeout { .. } => "captcha_timeout",
        }
    }

    /// The member a per-user job acts on.
    pub fn target_user(&self) -> Option<u64> {
        match self {
            JobKind::TimedUnmute { user_id }
            | JobKind::TimedUnban { user_id }
            | JobKind::CaptchaTimeout { user_id, .. } => Some(*user_id),
            JobKind::Announce { .. } | JobKind::RotatePin { .. } => None,
        }
    }

    /// Jobs admins schedule themselves; the rest are bookkeeping.
    pub fn is_announcement(&self) -> bool {
        matches!(self, JobKind::Announce { .. } | JobKind::RotatePin { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledJob {
    pub id: i64,
    pub group_id: i64,
    pub kind: JobKind,
    /// Next time the job is due
    pub run_at: DateTime<Utc>,
    /// Repeat period; `None` for one-shot jobs
    pub interval_secs: Option<u64>,
    pub created_by: u64,
}

/// A job before the store assigns its id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub group_id: i64,
    pub kind: JobKind,
    pub run_at: DateTime<Utc>,
    pub interval_secs: Option<u64>,
    pub created_by: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotate_pin_payload_defaults() {
        let kind: JobKind = serde_json::from_str(r#"{"kind":"rotate_pin","text":"Rules"}"#).unwrap();
        assert_eq!(
            kind,
            JobKind::RotatePin {
                text: "Rules".to_string(),
                unpin_previous: true,
                last_pinned: None,
            }
        );
    }

    #[test]
    fn test_target_user() {
        assert_eq!(JobKind::TimedUnban { user_id: 5 }.target_user(), Some(5));
        assert_eq!(
            JobKind::Announce {
                text: "hi".to_string()
            }
            .target_user(),
            None
        );
        let json = serde_json::to_string(&JobKind::TimedUnmute { user_id: 5 }).unwrap();
        assert_eq!(json, r#"{"kind":"timed_unmute","user_id":5}"#);
    }
}
