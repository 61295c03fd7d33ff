// Greets new members with the group's welcome template, or challenges
// them first when the group has join challenges on.

use crate::core::moderation::CaptchaMode;
use crate::telegram::api::api_log;
use crate::telegram::moderation::commands::parse_switch;
use crate::telegram::verification::challenge_member;
use crate::telegram::{Data, Error};
use std::sync::Arc;
use teloxide::prelude::*;

pub async fn greet_new_members(bot: Bot, msg: Message, data: Arc<Data>) -> Result<(), Error> {
    let Some(members) = msg.new_chat_members() else {
        return Ok(());
    };
    let group_id = msg.chat.id.0;

    let config = match data.moderation.config_for(group_id).await {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(group_id, error = %e, "Failed to load config for welcome");
            return Ok(());
        }
    };
    let title = msg.chat.title().unwrap_or("the group");
    for member in members.iter().filter(|m| !m.is_bot) {
        tracing::info!(group_id, user_id = member.id.0, "New member joined");
        if config.captcha.enabled {
            challenge_member(&bot, &data, msg.chat.id, member, &config.captcha).await;
            continue;
        }
        if !config.welcome.enabled {
            continue;
        }
        let text = config.welcome.render(&member.first_name, title);
        api_log("send_message", bot.send_message(msg.chat.id, text)).await;
    }
    Ok(())
}

/// "/welcome on|off", "/welcome set <template>", "/welcome reset", or no
/// arguments to preview.
pub async fn configure(data: &Data, group_id: i64, actor: u64, args: &str) -> Result<String, Error> {
    let args = args.trim();
    let (verb, rest) = match args.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb.to_lowercase(), rest.trim()),
        None => (args.to_lowercase(), ""),
    };

    match verb.as_str() {
        "" => {
            let config = data.moderation.config_for(group_id).await?;
            let state = if config.welcome.enabled { "on" } else { "off" };
            Ok(format!(
                "👋 Welcome messages are {}. Preview:\n\n{}",
                state,
                config.welcome.render("Alice", "this group")
            ))
        }
        "on" | "off" => {
            let enabled = verb == "on";
            data.moderation
                .set_welcome_enabled(group_id, actor, enabled)
                .await?;
            Ok(format!("✅ Welcome messages are {}.", verb))
        }
        "set" if !rest.is_empty() => {
            data.moderation
                .set_welcome_template(group_id, actor, Some(rest.to_string()))
                .await?;
            Ok("✅ Welcome message updated. Use {first_name} and {group_title} as placeholders.".to_string())
        }
        "reset" => {
            data.moderation
                .set_welcome_template(group_id, actor, None)
                .await?;
            Ok("✅ Welcome message reset to the default.".to_string())
        }
        _ => Err("usage: /welcome on | off | set <template> | reset".into()),
    }
}

/// One /captcha change.
#[derive(Debug, PartialEq)]
pub enum CaptchaArg<'a> {
    Show,
    Enabled(bool),
    Mode(CaptchaMode),
    Timeout(&'a str),
}

/// "on|off", "button|math", "timeout <duration>", or nothing to show.
pub fn parse_captcha_args(args: &str) -> Result<CaptchaArg<'_>, String> {
    let args = args.trim();
    let (verb, rest) = match args.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb.to_lowercase(), rest.trim()),
        None => (args.to_lowercase(), ""),
    };
    match verb.as_str() {
        "" => Ok(CaptchaArg::Show),
        "timeout" if !rest.is_empty() => Ok(CaptchaArg::Timeout(rest)),
        "button" | "math" => Ok(CaptchaArg::Mode(verb.parse()?)),
        _ => parse_switch(&verb)
            .map(CaptchaArg::Enabled)
            .map_err(|_| "usage: /captcha on | off | button | math | timeout <duration>".to_string()),
    }
}

pub async fn captcha(data: &Data, group_id: i64, actor: u64, args: &str) -> Result<String, Error> {
    let config = match parse_captcha_args(args)? {
        CaptchaArg::Show => data.moderation.config_for(group_id).await?,
        CaptchaArg::Enabled(enabled) => {
            data.moderation
                .set_captcha_enabled(group_id, actor, enabled)
                .await?
        }
        CaptchaArg::Mode(mode) => data.moderation.set_captcha_mode(group_id, actor, mode).await?,
        CaptchaArg::Timeout(raw) => {
            data.moderation
                .set_captcha_timeout(group_id, actor, raw)
                .await?
        }
    };
    let settings = &config.captcha;
    let state = if settings.enabled { "on" } else { "off" };
    Ok(format!(
        "🧩 Join challenge is {} ({} mode, {}s to answer).",
        state, settings.mode, settings.timeout_secs
    ))
}

pub async fn auto_approve(data: &Data, group_id: i64, actor: u64, args: &str) -> Result<String, Error> {
    let enabled = parse_switch(args)?;
    data.moderation
        .set_auto_approve(group_id, actor, enabled)
        .await?;
    Ok(format!(
        "✅ Join requests are {}approved automatically.",
        if enabled { "" } else { "no longer " }
    ))
}

pub async fn require_accept(data: &Data, group_id: i64, actor: u64, args: &str) -> Result<String, Error> {
    let enabled = parse_switch(args)?;
    data.moderation
        .set_require_accept(group_id, actor, enabled)
        .await?;
    Ok(if enabled {
        "✅ Members must accept the rules before their join request is approved.".to_string()
    } else {
        "✅ Join requests no longer wait for rules acceptance.".to_string()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_captcha_args() {
        assert_eq!(parse_captcha_args(""), Ok(CaptchaArg::Show));
        assert_eq!(parse_captcha_args("ON"), Ok(CaptchaArg::Enabled(true)));
        assert_eq!(parse_captcha_args("off"), Ok(CaptchaArg::Enabled(false)));
        assert_eq!(
            parse_captcha_args("math"),
            Ok(CaptchaArg::Mode(CaptchaMode::Math))
        );
        assert_eq!(
            parse_captcha_args("timeout 3m"),
            Ok(CaptchaArg::Timeout("3m"))
        );
        assert!(parse_captcha_args("timeout").is_err());
        assert!(parse_captcha_args("sometimes").is_err());
    }
}
