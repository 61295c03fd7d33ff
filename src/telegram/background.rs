// Background loops started from main: scheduled jobs (announcements,
// rotating pins, restriction lifts, challenge timeouts) and the
// restriction expiry sweep.

use crate::core::scheduler::{JobKind, ScheduledJob};
use crate::telegram::api::api_log;
use crate::telegram::moderation::{lift_restrictions, unban_member};
use crate::telegram::Data;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use teloxide::prelude::*;
use teloxide::types::MessageId;
use tokio::time::sleep;

/// Run due jobs every `tick`.
pub fn spawn_scheduler(bot: Bot, data: Arc<Data>, tick: StdDuration) {
    tokio::spawn(async move {
        loop {
            match data.scheduler.take_due(Utc::now()).await {
                Ok(jobs) => {
                    if !jobs.is_empty() {
                        tracing::info!("Running {} scheduled jobs", jobs.len());
                    }
                    for job in jobs {
                        run_job(&bot, &data, &job).await;
                    }
                }
                Err(err) => tracing::warn!("Scheduler tick failed: {}", err),
            }

            sleep(tick).await;
        }
    });
}

async fn run_job(bot: &Bot, data: &Data, job: &ScheduledJob) {
    tracing::debug!(group_id = job.group_id, job_id = job.id, kind = job.kind.name(), "Running job");
    let chat = ChatId(job.group_id);
    match &job.kind {
        JobKind::Announce { text } => {
            api_log("send_message", bot.send_message(chat, text.as_str())).await;
        }
        JobKind::RotatePin {
            text,
            unpin_previous,
            last_pinned,
        } => {
            let Some(sent) = api_log("send_message", bot.send_message(chat, text.as_str())).await
            else {
                return;
            };
            api_log(
                "pin_chat_message",
                bot.pin_chat_message(chat, sent.id).disable_notification(true),
            )
            .await;
            if let (true, Some(previous)) = (*unpin_previous, last_pinned) {
                api_log(
                    "unpin_chat_message",
                    bot.unpin_chat_message(chat).message_id(MessageId(*previous)),
                )
                .await;
            }
            if let Err(e) = data.scheduler.record_pinned(job, sent.id.0).await {
                tracing::warn!(job_id = job.id, error = %e, "Failed to remember the pinned message");
            }
        }
        JobKind::TimedUnmute { user_id } => {
            tracing::info!(group_id = job.group_id, user_id, "Mute expired");
            lift_restrictions(bot, chat, UserId(*user_id)).await;
        }
        JobKind::TimedUnban { user_id } => {
            tracing::info!(group_id = job.group_id, user_id, "Ban expired");
            unban_member(bot, chat, UserId(*user_id)).await;
        }
        JobKind::CaptchaTimeout {
            user_id,
            prompt_message_id,
            ..
        } => {
            tracing::info!(group_id = job.group_id, user_id, "Join challenge timed out; kicking");
            // Kick: ban, then unban so the member may try again later
            let user = UserId(*user_id);
            if api_log("ban_chat_member", bot.ban_chat_member(chat, user))
                .await
                .is_some()
            {
                api_log("unban_chat_member", bot.unban_chat_member(chat, user)).await;
            }
            if let Some(id) = prompt_message_id {
                api_log("delete_message", bot.delete_message(chat, MessageId(*id))).await;
            }
        }
    }
}

/// Clear expired mutes and bans every `interval`.
pub fn spawn_sweeper(data: Arc<Data>, interval: StdDuration) {
    tokio::spawn(async move {
        loop {
            sleep(interval).await;

            match data.moderation.sweep_expired(Utc::now()).await {
                Ok(0) => tracing::debug!("Expiry sweep found nothing to clear"),
                Ok(cleared) => tracing::info!("Expiry sweep cleared {} restrictions", cleared),
                Err(err) => tracing::warn!("Expiry sweep failed: {}", err),
            }
            data.admins.prune();
        }
    });
}
