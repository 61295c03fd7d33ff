// Join challenges and join request onboarding.
//
// New members are muted and asked to press a button (or solve a sum)
// before they can talk; the scheduler kicks them if time runs out. Join
// requests get the rules in private and, depending on the group's
// settings, are approved right away or after the member accepts.

use crate::core::moderation::{CaptchaSettings, GroupConfig};
use crate::core::verification::{
    challenge_mute_until, decide, rules_message, CaptchaPress, Challenge, JoinDecision, JoinPress,
    Verdict,
};
use crate::telegram::api::api_log;
use crate::telegram::moderation::lift_restrictions;
use crate::telegram::{Data, Error};
use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::{
    ChatJoinRequest, ChatPermissions, InlineKeyboardButton, InlineKeyboardMarkup, MessageId, User,
};

// ============================================================================
// JOIN CHALLENGES
// ============================================================================

/// Mute a new member and post their challenge. Any failure after the mute
/// lifts it again so nobody is left muted without a way out.
pub async fn challenge_member(
    bot: &Bot,
    data: &Data,
    chat: ChatId,
    member: &User,
    settings: &CaptchaSettings,
) {
    let now = Utc::now();
    let muted = api_log(
        "restrict_chat_member",
        bot.restrict_chat_member(chat, member.id, ChatPermissions::empty())
            .until_date(challenge_mute_until(settings, now)),
    )
    .await;
    if muted.is_none() {
        return;
    }

    let challenge = {
        let mut rng = StdRng::from_entropy();
        Challenge::new(settings.mode, &member.first_name, &mut rng)
    };
    let keyboard = challenge_keyboard(chat.0, member.id.0, &challenge);
    let Some(prompt) = api_log(
        "send_message",
        bot.send_message(chat, challenge.prompt.as_str())
            .reply_markup(keyboard),
    )
    .await
    else {
        lift_restrictions(bot, chat, member.id).await;
        return;
    };

    if let Err(e) = data
        .verification
        .start(
            chat.0,
            member.id.0,
            settings,
            Some(prompt.id.0),
            challenge.answer,
            now,
        )
        .await
    {
        tracing::error!(group_id = chat.0, user_id = member.id.0, error = %e, "Failed to start join challenge");
        lift_restrictions(bot, chat, member.id).await;
        api_log("delete_message", bot.delete_message(chat, prompt.id)).await;
    }
}

/// One button for a button challenge, one per option for a sum.
pub fn challenge_keyboard(group_id: i64, user_id: u64, challenge: &Challenge) -> InlineKeyboardMarkup {
    if challenge.options.is_empty() {
        let press = CaptchaPress {
            group_id,
            user_id,
            choice: None,
        };
        return InlineKeyboardMarkup::new(vec![vec![InlineKeyboardButton::callback(
            "✅ I'm not a robot",
            press.to_data(),
        )]]);
    }

    let row = challenge
        .options
        .iter()
        .map(|&option| {
            let press = CaptchaPress {
                group_id,
                user_id,
                choice: Some(option),
            };
            InlineKeyboardButton::callback(option.to_string(), press.to_data())
        })
        .collect::<Vec<_>>();
    InlineKeyboardMarkup::new(vec![row])
}

pub async fn handle_captcha_press(bot: Bot, q: CallbackQuery, data: Arc<Data>) -> Result<(), Error> {
    let Some(press) = q.data.as_deref().and_then(CaptchaPress::parse) else {
        api_log("answer_callback_query", bot.answer_callback_query(q.id.clone())).await;
        return Ok(());
    };
    if press.user_id != q.from.id.0 {
        answer(&bot, &q, "This challenge is for someone else.").await;
        return Ok(());
    }

    let chat = ChatId(press.group_id);
    match data
        .verification
        .answer(press.group_id, press.user_id, press.choice)
        .await?
    {
        Verdict::Passed { prompt_message_id } => {
            lift_restrictions(&bot, chat, q.from.id).await;
            if let Some(id) = prompt_message_id {
                api_log("delete_message", bot.delete_message(chat, MessageId(id))).await;
            }
            answer(&bot, &q, "Welcome! You can chat now.").await;
        }
        Verdict::Wrong => answer(&bot, &q, "Not quite, try again.").await,
        Verdict::NotPending => answer(&bot, &q, "This challenge is no longer open.").await,
    }
    Ok(())
}

async fn answer(bot: &Bot, q: &CallbackQuery, text: &str) {
    api_log(
        "answer_callback_query",
        bot.answer_callback_query(q.id.clone()).text(text),
    )
    .await;
}

// ============================================================================
// JOIN REQUESTS
// ============================================================================

pub async fn handle_join_request(bot: Bot, req: ChatJoinRequest, data: Arc<Data>) -> Result<(), Error> {
    let group_id = req.chat.id.0;
    let user_id = req.from.id.0;
    let config = data.moderation.config_for(group_id).await?;

    let decision = decide(&config.onboarding);
    tracing::info!(group_id, user_id, decision = ?decision, "Join request");
    match decision {
        JoinDecision::Ignore => {}
        JoinDecision::Approve => {
            send_rules(&bot, &req, &config, None).await;
            api_log(
                "approve_chat_join_request",
                bot.approve_chat_join_request(req.chat.id, req.from.id),
            )
            .await;
        }
        JoinDecision::AskToAccept => {
            let keyboard = join_keyboard(group_id, user_id);
            if send_rules(&bot, &req, &config, Some(keyboard)).await.is_none() {
                tracing::warn!(group_id, user_id, "Could not send the rules; request left for admins");
            }
        }
    }
    Ok(())
}

async fn send_rules(
    bot: &Bot,
    req: &ChatJoinRequest,
    config: &GroupConfig,
    keyboard: Option<InlineKeyboardMarkup>,
) -> Option<Message> {
    let title = req.chat.title().unwrap_or("the group");
    let text = rules_message(title, config.rules_text.as_deref(), keyboard.is_some());
    let req = bot.send_message(req.user_chat_id, text);
    match keyboard {
        Some(keyboard) => api_log("send_message", req.reply_markup(keyboard)).await,
        None => api_log("send_message", req).await,
    }
}

pub fn join_keyboard(group_id: i64, user_id: u64) -> InlineKeyboardMarkup {
    let press = |accept| JoinPress {
        accept,
        group_id,
        user_id,
    };
    InlineKeyboardMarkup::new(vec![vec![
        InlineKeyboardButton::callback("✅ Accept", press(true).to_data()),
        InlineKeyboardButton::callback("❌ Decline", press(false).to_data()),
    ]])
}

pub async fn handle_join_press(bot: Bot, q: CallbackQuery, _data: Arc<Data>) -> Result<(), Error> {
    let Some(press) = q.data.as_deref().and_then(JoinPress::parse) else {
        api_log("answer_callback_query", bot.answer_callback_query(q.id.clone())).await;
        return Ok(());
    };
    if press.user_id != q.from.id.0 {
        answer(&bot, &q, "This request is not yours.").await;
        return Ok(());
    }

    let chat = ChatId(press.group_id);
    let (handled, reply) = if press.accept {
        let done = api_log(
            "approve_chat_join_request",
            bot.approve_chat_join_request(chat, q.from.id),
        )
        .await;
        (done, "✅ Thanks! Your request was approved.")
    } else {
        let done = api_log(
            "decline_chat_join_request",
            bot.decline_chat_join_request(chat, q.from.id),
        )
        .await;
        (done, "Your request was withdrawn.")
    };
    tracing::info!(group_id = press.group_id, user_id = press.user_id, accept = press.accept, "Join request answered");

    let reply = if handled.is_some() {
        reply
    } else {
        "This request is no longer open."
    };
    if let Some(message) = q.message.as_ref() {
        api_log(
            "edit_message_text",
            bot.edit_message_text(message.chat().id, message.id(), reply),
        )
        .await;
    }
    answer(&bot, &q, reply).await;
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
