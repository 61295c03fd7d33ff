// Inline settings panel posted by /settings.
//
// Each button carries "panel:<action>". Presses are checked against the
// admin cache before anything changes, then the panel message is redrawn
// from the saved config.

use crate::core::moderation::{FloodAction, GroupConfig};
use crate::telegram::api::api_log;
use crate::telegram::moderation::commands::describe_config;
use crate::telegram::{Data, Error};
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::{CallbackQuery, InlineKeyboardButton, InlineKeyboardMarkup};

const CALLBACK_PREFIX: &str = "panel:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanelAction {
    ToggleAntispam,
    ToggleBlockLinks,
    ToggleWelcome,
    ToggleCaptcha,
    SwitchFloodAction,
    Refresh,
}

impl PanelAction {
    fn key(&self) -> &'static str {
        match self {
            PanelAction::ToggleAntispam => "antispam",
            PanelAction::ToggleBlockLinks => "links",
            PanelAction::ToggleWelcome => "welcome",
            PanelAction::ToggleCaptcha => "captcha",
            PanelAction::SwitchFloodAction => "flood",
            PanelAction::Refresh => "refresh",
        }
    }

    fn callback_data(&self) -> String {
        format!("{}{}", CALLBACK_PREFIX, self.key())
    }
}

pub fn parse_panel_action(data: &str) -> Option<PanelAction> {
    match data.strip_prefix(CALLBACK_PREFIX)? {
        "antispam" => Some(PanelAction::ToggleAntispam),
        "links" => Some(PanelAction::ToggleBlockLinks),
        "welcome" => Some(PanelAction::ToggleWelcome),
        "captcha" => Some(PanelAction::ToggleCaptcha),
        "flood" => Some(PanelAction::SwitchFloodAction),
        "refresh" => Some(PanelAction::Refresh),
        _ => None,
    }
}

fn mark(on: bool) -> &'static str {
    if on {
        "✅"
    } else {
        "❌"
    }
}

pub fn panel_keyboard(config: &GroupConfig) -> InlineKeyboardMarkup {
    let button = |label: String, action: PanelAction| {
        InlineKeyboardButton::callback(label, action.callback_data())
    };
    let flood = match config.flood_action {
        FloodAction::Warn => "warn",
        FloodAction::Mute => "mute",
    };

    InlineKeyboardMarkup::new(vec![
        vec![
            button(
                format!("{} Anti-spam", mark(config.enabled)),
                PanelAction::ToggleAntispam,
            ),
            button(
                format!("{} Block links", mark(config.link_policy.block_all)),
                PanelAction::ToggleBlockLinks,
            ),
        ],
        vec![
            button(
                format!("{} Welcome", mark(config.welcome.enabled)),
                PanelAction::ToggleWelcome,
            ),
            button(
                format!("🌊 Flood: {}", flood),
                PanelAction::SwitchFloodAction,
            ),
        ],
        vec![
            button(
                format!("{} Join challenge", mark(config.captcha.enabled)),
                PanelAction::ToggleCaptcha,
            ),
            button("🔄 Refresh".to_string(), PanelAction::Refresh),
        ],
    ])
}

pub async fn post_panel(bot: &Bot, msg: &Message, data: &Data) -> Result<(), Error> {
    let config = data.moderation.config_for(msg.chat.id.0).await?;
    api_log(
        "send_message",
        bot.send_message(msg.chat.id, describe_config(&config))
            .reply_markup(panel_keyboard(&config)),
    )
    .await;
    Ok(())
}

async fn apply(
    data: &Data,
    group_id: i64,
    actor: u64,
    action: PanelAction,
) -> Result<GroupConfig, Error> {
    let service = &data.moderation;
    let current = service.config_for(group_id).await?;

    let config = match action {
        PanelAction::ToggleAntispam => {
            service
                .set_enabled(group_id, actor, !current.enabled)
                .await?
        }
        PanelAction::ToggleBlockLinks => {
            service
                .set_block_all_links(group_id, actor, !current.link_policy.block_all)
                .await?
        }
        PanelAction::ToggleWelcome => {
            service
                .set_welcome_enabled(group_id, actor, !current.welcome.enabled)
                .await?
        }
        PanelAction::ToggleCaptcha => {
            service
                .set_captcha_enabled(group_id, actor, !current.captcha.enabled)
                .await?
        }
        PanelAction::SwitchFloodAction => {
            let next = match current.flood_action {
                FloodAction::Warn => FloodAction::Mute,
                FloodAction::Mute => FloodAction::Warn,
            };
            service.set_flood_action(group_id, actor, next).await?
        }
        PanelAction::Refresh => current,
    };
    Ok(config)
}

pub async fn handle_callback(bot: Bot, q: CallbackQuery, data: Arc<Data>) -> Result<(), Error> {
    let action = q.data.as_deref().and_then(parse_panel_action);
    let (Some(action), Some(message)) = (action, q.message.as_ref()) else {
        api_log("answer_callback_query", bot.answer_callback_query(q.id.clone())).await;
        return Ok(());
    };
    let chat = message.chat().id;

    if !data.admins.is_admin(&bot, chat, q.from.id).await {
        api_log(
            "answer_callback_query",
            bot.answer_callback_query(q.id.clone())
                .text("Only admins can change these settings."),
        )
        .await;
        return Ok(());
    }

    match apply(&data, chat.0, q.from.id.0, action).await {
        Ok(config) => {
            api_log(
                "edit_message_text",
                bot.edit_message_text(chat, message.id(), describe_config(&config))
                    .reply_markup(panel_keyboard(&config)),
            )
            .await;
            api_log(
                "answer_callback_query",
                bot.answer_callback_query(q.id.clone()).text("Saved"),
            )
            .await;
        }
        Err(e) => {
            tracing::warn!(group_id = chat.0, action = action.key(), error = %e, "Panel update failed");
            api_log(
                "answer_callback_query",
                bot.answer_callback_query(q.id.clone())
                    .text(format!("❌ {}", e)),
            )
            .await;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use teloxide::types::InlineKeyboardButtonKind;

    #[test]
    fn test_callback_data_round_trips() {
        for action in [
            PanelAction::ToggleAntispam,
            PanelAction::ToggleBlockLinks,
            PanelAction::ToggleWelcome,
            PanelAction::ToggleCaptcha,
            PanelAction::SwitchFloodAction,
            PanelAction::Refresh,
        ] {
            assert_eq!(parse_panel_action(&action.callback_data()), Some(action));
        }
        assert_eq!(parse_panel_action("panel:unknown"), None);
        assert_eq!(parse_panel_action("captcha:ok:-1:5"), None);
    }

    #[test]
    fn test_keyboard_reflects_config() {
        let mut config = GroupConfig::new(-1);
        config.link_policy.block_all = true;
        config.flood_action = FloodAction::Mute;

        let keyboard = panel_keyboard(&config);
        let labels: Vec<&str> = keyboard
            .inline_keyboard
            .iter()
            .flatten()
            .map(|b| b.text.as_str())
            .collect();

        assert_eq!(
            labels,
            vec![
                "✅ Anti-spam",
                "✅ Block links",
                "✅ Welcome",
                "🌊 Flood: mute",
                "❌ Join challenge",
                "🔄 Refresh"
            ]
        );

        let first = &keyboard.inline_keyboard[0][0];
        assert_eq!(
            first.kind,
            InlineKeyboardButtonKind::CallbackData("panel:antispam".to_string())
        );
    }
}
