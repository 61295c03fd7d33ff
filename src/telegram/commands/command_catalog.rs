// Telegram commands.
// Each feature gets its own command file; this one holds the catalog and
// the admin gate in front of it.

pub mod announce;
pub mod info;

use crate::telegram::admin_panel;
use crate::telegram::api::api_log;
use crate::telegram::moderation::{self, commands as mod_cmds};
use crate::telegram::welcome;
use crate::telegram::{Data, Error};
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::ReplyParameters;
use teloxide::utils::command::BotCommands;

#[derive(BotCommands, Clone, Debug, PartialEq)]
#[command(rename_rule = "lowercase", description = "These commands are supported:")]
pub enum Command {
    #[command(description = "show this help")]
    Help,
    #[command(description = "show the group rules")]
    Rules,
    #[command(description = "set the group rules text (empty to clear)")]
    SetRules(String),
    #[command(description = "open the settings panel")]
    Settings,
    #[command(description = "on | off, or show the current settings")]
    Antispam(String),
    #[command(description = "<messages> <window>: flood limit, e.g. 8 5s")]
    SetFlood(String),
    #[command(description = "<duration>: length of automatic mutes")]
    SetMute(String),
    #[command(description = "<duration>: length of automatic bans")]
    SetBan(String),
    #[command(description = "<number>: warnings before a mute")]
    WarnLimit(String),
    #[command(description = "warn | mute: first response to flooding")]
    FloodAction(String),
    #[command(description = "<word|regex> <action>[:duration] [prio=N] [esc=N/window/action] <pattern> [| reply]")]
    AddRule(String),
    #[command(description = "list content rules")]
    ListRules,
    #[command(description = "<id>: delete a content rule")]
    DelRule(String),
    #[command(description = "warn a user (reply or id) [reason]")]
    Warn(String),
    #[command(description = "remove one warning from a user")]
    Unwarn(String),
    #[command(description = "reset a user's warnings")]
    ResetWarns(String),
    #[command(description = "mute a user [duration] [reason]")]
    Mute(String),
    #[command(description = "unmute a user")]
    Unmute(String),
    #[command(description = "ban a user [duration] [reason]")]
    Ban(String),
    #[command(description = "unban a user")]
    Unban(String),
    #[command(description = "<domain>: always allow links to a domain")]
    AllowDomain(String),
    #[command(description = "<domain>: block links to a domain")]
    DenyDomain(String),
    #[command(description = "<domain>: remove a domain from both lists")]
    RmDomain(String),
    #[command(description = "on | off: block every link")]
    BlockLinks(String),
    #[command(description = "<invites|telegram|shorteners|other> <action>")]
    LinkType(String),
    #[command(description = "off | <from hour> <to hour> [timezone]")]
    NightMode(String),
    #[command(description = "<type> [action]: lock forwards or a media type")]
    Lock(String),
    #[command(description = "<type>: remove a lock")]
    Unlock(String),
    #[command(description = "on | off | set <template> | reset")]
    Welcome(String),
    #[command(description = "on | off | button | math | timeout <duration>: join challenge")]
    Captcha(String),
    #[command(description = "on | off: approve join requests automatically")]
    AutoApprove(String),
    #[command(description = "on | off: join requests must accept the rules")]
    RequireAccept(String),
    #[command(description = "[count]: recent moderation log")]
    Audit(String),
    #[command(description = "<delay> [every <interval>] <text>")]
    Announce(String),
    #[command(description = "<delay> [every <interval>] [keep] <text>: post and pin")]
    RotatePin(String),
    #[command(description = "list scheduled jobs")]
    Jobs,
    #[command(description = "<id>: cancel a scheduled job")]
    CancelJob(String),
}

impl Command {
    /// Commands anyone may use.
    pub fn is_public(&self) -> bool {
        matches!(self, Command::Help | Command::Rules)
    }
}

pub async fn handle_command(bot: Bot, msg: Message, cmd: Command, data: Arc<Data>) -> Result<(), Error> {
    let Some(sender) = msg.from.as_ref() else {
        return Ok(());
    };
    let actor = sender.id.0;

    if !msg.chat.is_private() && !data.admins.is_admin(&bot, msg.chat.id, sender.id).await {
        // Commands from members count towards flood control like any message
        let outcome = moderation::moderate(&bot, &msg, &data).await;
        let acted = outcome.is_some_and(|o| !o.action.is_none());
        if cmd.is_public() && !acted {
            reply_result(&bot, &msg, run_public(&msg, &data, cmd).await).await;
        }
        return Ok(());
    }

    if msg.chat.is_private() && !cmd.is_public() {
        reply(&bot, &msg, "Use this command in a group where you are an admin.".to_string()).await;
        return Ok(());
    }

    tracing::debug!(group_id = msg.chat.id.0, user_id = actor, command = ?cmd, "Admin command");
    let group_id = msg.chat.id.0;
    let data = data.as_ref();

    let result = match cmd {
        cmd @ (Command::Help | Command::Rules) => run_public(&msg, data, cmd).await,
        Command::SetRules(args) => info::set_rules(data, group_id, actor, &args).await,
        Command::Settings => {
            admin_panel::post_panel(&bot, &msg, data).await?;
            return Ok(());
        }
        Command::Antispam(args) => mod_cmds::antispam(data, group_id, actor, &args).await,
        Command::SetFlood(args) => mod_cmds::set_flood(data, group_id, actor, &args).await,
        Command::SetMute(args) => mod_cmds::set_mute(data, group_id, actor, &args).await,
        Command::SetBan(args) => mod_cmds::set_ban(data, group_id, actor, &args).await,
        Command::WarnLimit(args) => mod_cmds::warn_limit(data, group_id, actor, &args).await,
        Command::FloodAction(args) => mod_cmds::flood_action(data, group_id, actor, &args).await,
        Command::AddRule(args) => mod_cmds::add_rule(data, group_id, actor, &args).await,
        Command::ListRules => mod_cmds::list_rules(data, group_id).await,
        Command::DelRule(args) => mod_cmds::del_rule(data, group_id, actor, &args).await,
        Command::Warn(args) => mod_cmds::warn(&bot, &msg, data, actor, &args).await,
        Command::Unwarn(args) => mod_cmds::unwarn(&bot, &msg, data, actor, &args).await,
        Command::ResetWarns(args) => mod_cmds::reset_warns(&bot, &msg, data, actor, &args).await,
        Command::Mute(args) => mod_cmds::mute(&bot, &msg, data, actor, &args).await,
        Command::Unmute(args) => mod_cmds::unmute(&bot, &msg, data, actor, &args).await,
        Command::Ban(args) => mod_cmds::ban(&bot, &msg, data, actor, &args).await,
        Command::Unban(args) => mod_cmds::unban(&bot, &msg, data, actor, &args).await,
        Command::AllowDomain(args) => mod_cmds::allow_domain(data, group_id, actor, &args).await,
        Command::DenyDomain(args) => mod_cmds::deny_domain(data, group_id, actor, &args).await,
        Command::RmDomain(args) => mod_cmds::rm_domain(data, group_id, actor, &args).await,
        Command::BlockLinks(args) => mod_cmds::block_links(data, group_id, actor, &args).await,
        Command::LinkType(args) => mod_cmds::link_type(data, group_id, actor, &args).await,
        Command::NightMode(args) => mod_cmds::night_mode(data, group_id, actor, &args).await,
        Command::Lock(args) => mod_cmds::lock(data, group_id, actor, &args).await,
        Command::Unlock(args) => mod_cmds::unlock(data, group_id, actor, &args).await,
        Command::Welcome(args) => welcome::configure(data, group_id, actor, &args).await,
        Command::Captcha(args) => welcome::captcha(data, group_id, actor, &args).await,
        Command::AutoApprove(args) => welcome::auto_approve(data, group_id, actor, &args).await,
        Command::RequireAccept(args) => welcome::require_accept(data, group_id, actor, &args).await,
        Command::Audit(args) => info::audit(data, group_id, &args).await,
        Command::Announce(args) => announce::announce(data, group_id, actor, &args).await,
        Command::RotatePin(args) => announce::rotate_pin(data, group_id, actor, &args).await,
        Command::Jobs => announce::jobs(data, group_id).await,
        Command::CancelJob(args) => announce::cancel_job(data, group_id, &args).await,
    };

    reply_result(&bot, &msg, result).await;
    Ok(())
}

async fn run_public(msg: &Message, data: &Data, cmd: Command) -> Result<String, Error> {
    match cmd {
        Command::Help => Ok(info::help()),
        Command::Rules => info::rules(data, msg).await,
        _ => Err("not a public command".into()),
    }
}

/// Reply with the handler's text, or its error as a "❌" line.
async fn reply_result(bot: &Bot, msg: &Message, result: Result<String, Error>) {
    let text = match result {
        Ok(text) => text,
        Err(e) => {
            tracing::debug!(group_id = msg.chat.id.0, error = %e, "Command rejected");
            format!("❌ {}", e)
        }
    };
    reply(bot, msg, text).await;
}

async fn reply(bot: &Bot, msg: &Message, text: String) {
    api_log(
        "send_message",
        bot.send_message(msg.chat.id, text)
            .reply_parameters(ReplyParameters::new(msg.id)),
    )
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            Command::parse("/setflood 8 5s", "guard_bot").unwrap(),
            Command::SetFlood("8 5s".to_string())
        );
        assert_eq!(
            Command::parse("/help@guard_bot", "guard_bot").unwrap(),
            Command::Help
        );
        assert_eq!(
            Command::parse("/addrule word delete spam", "guard_bot").unwrap(),
            Command::AddRule("word delete spam".to_string())
        );
        assert_eq!(
            Command::parse("/rotatepin 1h every 1d keep Read the rules", "guard_bot").unwrap(),
            Command::RotatePin("1h every 1d keep Read the rules".to_string())
        );
        assert_eq!(
            Command::parse("/autoapprove on", "guard_bot").unwrap(),
            Command::AutoApprove("on".to_string())
        );
        assert!(Command::parse("/nosuchcommand", "guard_bot").is_err());
    }

    #[test]
    fn test_only_help_and_rules_are_public() {
        assert!(Command::Help.is_public());
        assert!(Command::Rules.is_public());
        assert!(!Command::Settings.is_public());
        assert!(!Command::Ban(String::new()).is_public());
    }

    #[test]
    fn test_descriptions_list_every_command() {
        let help = Command::descriptions().to_string();
        for name in [
            "/antispam",
            "/addrule",
            "/nightmode",
            "/announce",
            "/canceljob",
            "/captcha",
            "/autoapprove",
            "/requireaccept",
            "/rotatepin",
        ] {
            assert!(help.contains(name), "missing {}", name);
        }
    }
}
