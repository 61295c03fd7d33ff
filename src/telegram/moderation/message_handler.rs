// Group message moderation.
//
// Turns a Telegram message into a `MessageEvent`, runs it through the
// moderation service and carries out the decided action. Every Bot API
// failure is logged and swallowed; a missing admin right must never stop
// the dispatcher.

pub mod commands;

use crate::core::duration::{format_duration, DurationSpec};
use crate::core::moderation::{MessageEvent, MessageKind, ModerationAction, ModerationOutcome};
use crate::core::scheduler::JobKind;
use crate::telegram::api::api_log;
use crate::telegram::{Data, Error};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::{
    ChatPermissions, MessageEntityKind, MessageKind as TgMessageKind, ReplyParameters, User,
};

/// Posts from a linked channel arrive from this account.
const TELEGRAM_SERVICE_USER: u64 = 777000;

/// Telegram treats restrictions shorter than 30 seconds as permanent, so
/// short ones are sent a little longer and lifted on time by the scheduler.
const MIN_RESTRICT_SECS: i64 = 35;

pub async fn handle_group_message(bot: Bot, msg: Message, data: Arc<Data>) -> Result<(), Error> {
    moderate(&bot, &msg, &data).await;
    Ok(())
}

/// Moderate one message. Returns `None` if the message is exempt
/// (private chat, bot or admin sender, service message).
pub async fn moderate(bot: &Bot, msg: &Message, data: &Data) -> Option<ModerationOutcome> {
    if msg.chat.is_private() || msg.chat.is_channel() {
        return None;
    }
    let sender = msg.from.as_ref()?;
    if sender.is_bot || sender.id.0 == TELEGRAM_SERVICE_USER {
        return None;
    }
    let event = message_event(msg)?;

    if data.admins.is_admin(bot, msg.chat.id, sender.id).await {
        return None;
    }

    let outcome = data.moderation.process_message(&event).await;
    if !outcome.action.is_none() {
        tracing::info!(
            group_id = event.group_id,
            user_id = event.user_id,
            message_id = event.message_id,
            action = outcome.action.label(),
            "Moderation action"
        );
        execute(bot, data, msg, sender, &outcome).await;
    }
    Some(outcome)
}

/// Build the evaluator input. Service messages (joins, pins, ...) yield `None`.
pub fn message_event(msg: &Message) -> Option<MessageEvent> {
    if !matches!(msg.kind, TgMessageKind::Common(_)) {
        return None;
    }
    let sender = msg.from.as_ref()?;

    let mut text = msg
        .text()
        .or_else(|| msg.caption())
        .unwrap_or_default()
        .to_string();
    // Links hidden behind link text are checked like visible ones
    let entities = msg
        .entities()
        .or_else(|| msg.caption_entities())
        .unwrap_or_default();
    for entity in entities {
        if let MessageEntityKind::TextLink { url } = &entity.kind {
            text.push('\n');
            text.push_str(url.as_str());
        }
    }

    Some(MessageEvent {
        group_id: msg.chat.id.0,
        user_id: sender.id.0,
        message_id: msg.id.0,
        text,
        timestamp: msg.date,
        kind: message_kind(msg),
        is_forward: msg.forward_origin().is_some(),
    })
}

pub fn message_kind(msg: &Message) -> MessageKind {
    if msg.photo().is_some() {
        MessageKind::Photo
    } else if msg.video().is_some() {
        MessageKind::Video
    } else if msg.animation().is_some() {
        MessageKind::Animation
    } else if msg.document().is_some() {
        MessageKind::Document
    } else if msg.sticker().is_some() {
        MessageKind::Sticker
    } else if msg.voice().is_some() {
        MessageKind::Voice
    } else if msg.audio().is_some() {
        MessageKind::Audio
    } else if msg.video_note().is_some() {
        MessageKind::VideoNote
    } else if msg.text().is_some() {
        MessageKind::Text
    } else {
        MessageKind::Other
    }
}

async fn execute(bot: &Bot, data: &Data, msg: &Message, sender: &User, outcome: &ModerationOutcome) {
    let chat = msg.chat.id;
    let reason = outcome
        .violation
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_default();

    match &outcome.action {
        ModerationAction::None => {}
        ModerationAction::Delete => {
            api_log("delete_message", bot.delete_message(chat, msg.id)).await;
        }
        ModerationAction::Warn { count, limit } => {
            api_log("delete_message", bot.delete_message(chat, msg.id)).await;
            notify(
                bot,
                chat,
                format!(
                    "⚠️ {} has been warned ({}/{}).\nReason: {}",
                    sender.first_name, count, limit, reason
                ),
            )
            .await;
        }
        ModerationAction::Mute { duration } => {
            api_log("delete_message", bot.delete_message(chat, msg.id)).await;
            restrict_member(bot, chat, sender.id, duration).await;
            let release = JobKind::TimedUnmute {
                user_id: sender.id.0,
            };
            release_later(data, chat, release, duration).await;
            notify(
                bot,
                chat,
                format!(
                    "🔇 {} has been muted {}.\nReason: {}",
                    sender.first_name,
                    span(duration),
                    reason
                ),
            )
            .await;
        }
        ModerationAction::Ban { duration } => {
            api_log("delete_message", bot.delete_message(chat, msg.id)).await;
            ban_member(bot, chat, sender.id, duration).await;
            let release = JobKind::TimedUnban {
                user_id: sender.id.0,
            };
            release_later(data, chat, release, duration).await;
            notify(
                bot,
                chat,
                format!(
                    "🔨 {} has been banned {}.\nReason: {}",
                    sender.first_name,
                    span(duration),
                    reason
                ),
            )
            .await;
        }
        ModerationAction::Reply { text } => {
            api_log(
                "send_message",
                bot.send_message(chat, text.as_str())
                    .reply_parameters(ReplyParameters::new(msg.id)),
            )
            .await;
        }
    }
}

async fn notify(bot: &Bot, chat: ChatId, text: String) {
    api_log("send_message", bot.send_message(chat, text)).await;
}

/// "for 10 minutes" or "permanently".
pub fn span(duration: &DurationSpec) -> String {
    if duration.is_permanent() {
        format_duration(duration)
    } else {
        format!("for {}", format_duration(duration))
    }
}

/// Bot API `until_date` for a restriction; `None` means forever.
pub fn restriction_until(duration: &DurationSpec, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let secs = duration.for_restriction().as_secs()?;
    let secs = i64::try_from(secs).unwrap_or(i64::MAX).max(MIN_RESTRICT_SECS);
    Some(now + Duration::seconds(secs))
}

// ============================================================================
// RESTRICTIONS (shared with the admin commands)
// ============================================================================

pub async fn restrict_member(bot: &Bot, chat: ChatId, user: UserId, duration: &DurationSpec) {
    let req = bot.restrict_chat_member(chat, user, ChatPermissions::empty());
    match restriction_until(duration, Utc::now()) {
        Some(until) => api_log("restrict_chat_member", req.until_date(until)).await,
        None => api_log("restrict_chat_member", req).await,
    };
}

pub async fn lift_restrictions(bot: &Bot, chat: ChatId, user: UserId) {
    api_log(
        "restrict_chat_member",
        bot.restrict_chat_member(chat, user, ChatPermissions::all()),
    )
    .await;
}

pub async fn ban_member(bot: &Bot, chat: ChatId, user: UserId, duration: &DurationSpec) {
    let req = bot.ban_chat_member(chat, user);
    match restriction_until(duration, Utc::now()) {
        Some(until) => api_log("ban_chat_member", req.until_date(until)).await,
        None => api_log("ban_chat_member", req).await,
    };
}

/// Queue the lift of a timed mute or ban, or drop a queued one when the
/// new restriction is permanent.
pub async fn release_later(data: &Data, chat: ChatId, release: JobKind, duration: &DurationSpec) {
    let Some(user_id) = release.target_user() else {
        return;
    };
    let result = match duration.for_restriction().as_secs() {
        Some(secs) => {
            let run_at = Utc::now() + Duration::seconds(i64::try_from(secs).unwrap_or(0));
            data.scheduler
                .schedule_for_user(chat.0, 0, release, run_at)
                .await
                .map(|_| ())
        }
        None => data
            .scheduler
            .cancel_for_user(chat.0, user_id, release.name())
            .await
            .map(|_| ()),
    };
    if let Err(e) = result {
        tracing::warn!(group_id = chat.0, user_id, error = %e, "Failed to queue restriction lift");
    }
}

/// Forget a queued lift after an admin lifted the restriction by hand.
pub async fn cancel_release(data: &Data, chat: ChatId, user: UserId, kind: &str) {
    if let Err(e) = data.scheduler.cancel_for_user(chat.0, user.0, kind).await {
        tracing::warn!(group_id = chat.0, user_id = user.0, error = %e, "Failed to cancel restriction lift");
    }
}

pub async fn unban_member(bot: &Bot, chat: ChatId, user: UserId) {
    api_log(
        "unban_chat_member",
        bot.unban_chat_member(chat, user).only_if_banned(true),
    )
    .await;
}
