// Scheduled announcements and rotating pins.

use crate::core::duration::{format_duration, DurationSpec};
use crate::core::scheduler::{JobKind, ScheduledJob};
use crate::telegram::{Data, Error};
use chrono::Utc;

/// Longest text shown per job in /jobs.
const PREVIEW_CHARS: usize = 40;

#[derive(Debug, PartialEq)]
pub struct AnnounceArgs<'a> {
    pub delay: &'a str,
    pub every: Option<&'a str>,
    pub text: &'a str,
}

/// "<delay> [every <interval>] <text>", e.g. "10m every 1d Standup time!".
pub fn parse_announce_args(args: &str) -> Result<AnnounceArgs<'_>, String> {
    let usage = || "usage: /announce <delay> [every <interval>] <text>".to_string();

    let (delay, rest) = args.trim().split_once(char::is_whitespace).ok_or_else(usage)?;
    let rest = rest.trim_start();

    let (every, text) = match rest.split_once(char::is_whitespace) {
        Some((word, after)) if word.eq_ignore_ascii_case("every") => {
            let (interval, text) = after
                .trim_start()
                .split_once(char::is_whitespace)
                .ok_or_else(usage)?;
            (Some(interval), text.trim())
        }
        _ => (None, rest.trim()),
    };

    if text.is_empty() {
        return Err(usage());
    }
    Ok(AnnounceArgs { delay, every, text })
}

pub async fn announce(data: &Data, group_id: i64, actor: u64, args: &str) -> Result<String, Error> {
    let parsed = parse_announce_args(args)?;
    let job = data
        .scheduler
        .schedule_announcement(
            group_id,
            actor,
            parsed.delay,
            parsed.every,
            parsed.text.to_string(),
            Utc::now(),
        )
        .await?;
    Ok(format!("📣 Scheduled as job #{}: {}", job.id, describe_timing(&job)))
}

/// "<delay> [every <interval>] [keep] <text>". The new pin replaces the
/// previous one unless "keep" is given.
pub async fn rotate_pin(data: &Data, group_id: i64, actor: u64, args: &str) -> Result<String, Error> {
    let usage = "usage: /rotatepin <delay> [every <interval>] [keep] <text>";
    let parsed = parse_announce_args(args).map_err(|_| usage)?;
    let (unpin_previous, text) = match parsed.text.split_once(char::is_whitespace) {
        Some((word, rest)) if word.eq_ignore_ascii_case("keep") => (false, rest.trim()),
        _ => (true, parsed.text),
    };
    let job = data
        .scheduler
        .schedule_rotating_pin(
            group_id,
            actor,
            parsed.delay,
            parsed.every,
            text.to_string(),
            unpin_previous,
            Utc::now(),
        )
        .await?;
    Ok(format!("📌 Pin scheduled as job #{}: {}", job.id, describe_timing(&job)))
}

pub async fn jobs(data: &Data, group_id: i64) -> Result<String, Error> {
    let jobs = data.scheduler.list_jobs(group_id).await?;
    if jobs.is_empty() {
        return Ok("No jobs scheduled.".to_string());
    }
    let lines: Vec<String> = jobs.iter().map(describe_job).collect();
    Ok(format!("🗓️ Scheduled jobs:\n{}", lines.join("\n")))
}

pub async fn cancel_job(data: &Data, group_id: i64, args: &str) -> Result<String, Error> {
    let id = args
        .trim()
        .trim_start_matches('#')
        .parse::<i64>()
        .map_err(|_| "usage: /canceljob <id>")?;
    data.scheduler.cancel_job(group_id, id).await?;
    Ok(format!("🗑️ Job #{} cancelled.", id))
}

fn describe_timing(job: &ScheduledJob) -> String {
    let mut timing = format!("next run {} UTC", job.run_at.format("%Y-%m-%d %H:%M"));
    if let Some(secs) = job.interval_secs {
        timing.push_str(&format!(
            ", then every {}",
            format_duration(&DurationSpec::from_secs(secs))
        ));
    }
    timing
}

fn preview(text: &str) -> String {
    let mut preview: String = text.chars().take(PREVIEW_CHARS).collect();
    if text.chars().count() > PREVIEW_CHARS {
        preview.push('…');
    }
    preview
}

pub fn describe_job(job: &ScheduledJob) -> String {
    let what = match &job.kind {
        JobKind::Announce { text } => preview(text),
        JobKind::RotatePin {
            text,
            unpin_previous,
            ..
        } => {
            let mode = if *unpin_previous { "pin" } else { "pin, keep old" };
            format!("📌 ({}) {}", mode, preview(text))
        }
        JobKind::TimedUnmute { user_id } => format!("unmute user {}", user_id),
        JobKind::TimedUnban { user_id } => format!("unban user {}", user_id),
        JobKind::CaptchaTimeout { user_id, .. } => {
            format!("kick user {} if the join challenge is unanswered", user_id)
        }
    };
    format!("#{} {}: {}", job.id, describe_timing(job), what)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_one_shot() {
        assert_eq!(
            parse_announce_args("10m Meeting in the voice chat"),
            Ok(AnnounceArgs {
                delay: "10m",
                every: None,
                text: "Meeting in the voice chat",
            })
        );
    }

    #[test]
    fn test_parse_repeating() {
        assert_eq!(
            parse_announce_args("1h every 1d  Daily reminder: be nice"),
            Ok(AnnounceArgs {
                delay: "1h",
                every: Some("1d"),
                text: "Daily reminder: be nice",
            })
        );
    }

    #[test]
    fn test_parse_rejects_missing_text() {
        assert!(parse_announce_args("10m").is_err());
        assert!(parse_announce_args("10m every 1d").is_err());
        assert!(parse_announce_args("").is_err());
    }

    #[test]
    fn test_describe_job_truncates() {
        let job = ScheduledJob {
            id: 4,
            group_id: -1,
            kind: JobKind::Announce {
                text: "x".repeat(60),
            },
            run_at: Utc.with_ymd_and_hms(2024, 1, 2, 9, 0, 0).unwrap(),
            interval_secs: Some(86400),
            created_by: 1,
        };
        let line = describe_job(&job);
        assert!(line.starts_with("#4 next run 2024-01-02 09:00 UTC, then every 1 day: "));
        assert!(line.ends_with('…'));
    }

    #[test]
    fn test_describe_every_job_kind() {
        let job = |kind| ScheduledJob {
            id: 9,
            group_id: -1,
            kind,
            run_at: Utc.with_ymd_and_hms(2024, 1, 2, 9, 0, 0).unwrap(),
            interval_secs: None,
            created_by: 1,
        };

        let line = describe_job(&job(JobKind::RotatePin {
            text: "Read the rules".to_string(),
            unpin_previous: false,
            last_pinned: Some(3),
        }));
        assert_eq!(line, "#9 next run 2024-01-02 09:00 UTC: 📌 (pin, keep old) Read the rules");

        let line = describe_job(&job(JobKind::TimedUnmute { user_id: 42 }));
        assert!(line.ends_with(": unmute user 42"));
        let line = describe_job(&job(JobKind::TimedUnban { user_id: 42 }));
        assert!(line.ends_with(": unban user 42"));
        let line = describe_job(&job(JobKind::CaptchaTimeout {
            user_id: 42,
            prompt_message_id: None,
            answer: Some(7),
        }));
        assert!(line.contains("kick user 42"));
    }
}
