// Moderation and anti-spam admin commands.
//
// Each handler returns the text to reply with; the catalog sends it and
// turns errors into a "❌ ..." reply.

use super::{
    ban_member, cancel_release, lift_restrictions, release_later, restrict_member, span,
    unban_member,
};
use crate::core::duration::{format_duration, parse_duration, DurationSpec};
use crate::core::moderation::{
    FloodAction, GroupConfig, LinkCategory, LockTarget, ModerationAction, NewRule, NightMode,
    PatternKind, PolicyAction, Rule, RuleAction, RuleEscalation,
};
use crate::core::scheduler::JobKind;
use crate::telegram::{Data, Error};
use teloxide::prelude::*;

// ============================================================================
// ARGUMENT PARSING
// ============================================================================

/// Split off the first whitespace-separated token.
fn next_token(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    if s.is_empty() {
        return None;
    }
    Some(match s.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim_start()),
        None => (s, ""),
    })
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

pub fn parse_switch(args: &str) -> Result<bool, String> {
    match args.trim().to_lowercase().as_str() {
        "on" | "yes" | "true" | "enable" => Ok(true),
        "off" | "no" | "false" | "disable" => Ok(false),
        other => Err(format!("expected on or off, got '{}'", other)),
    }
}

/// Who a moderation command is aimed at.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    pub user_id: u64,
    pub name: String,
}

/// The target is the author of the replied-to message, or else a numeric
/// id as the first argument. Returns the target and the remaining args.
pub fn split_target(replied: Option<Target>, args: &str) -> Result<(Target, &str), String> {
    if let Some(target) = replied {
        return Ok((target, args.trim()));
    }
    match next_token(args) {
        Some((id, rest)) => match id.parse::<u64>() {
            Ok(user_id) => Ok((
                Target {
                    user_id,
                    name: user_id.to_string(),
                },
                rest,
            )),
            Err(_) => Err("reply to a message or give a numeric user id".to_string()),
        },
        None => Err("reply to a message or give a numeric user id".to_string()),
    }
}

/// "[duration] [reason...]". The first token counts as a duration only if
/// it parses as one.
pub fn split_duration_reason(args: &str) -> (Option<DurationSpec>, Option<String>) {
    match next_token(args) {
        Some((first, rest)) => match parse_duration(first) {
            Ok(duration) => (Some(duration), non_empty(rest)),
            Err(_) => (None, non_empty(args)),
        },
        None => (None, None),
    }
}

/// "/setflood 8 5s": threshold then window.
pub fn parse_flood_args(args: &str) -> Result<(u32, String), String> {
    let usage = || "usage: /setflood <messages> <window, e.g. 5s>".to_string();
    let (threshold, rest) = next_token(args).ok_or_else(usage)?;
    let (window, extra) = next_token(rest).ok_or_else(usage)?;
    if !extra.is_empty() {
        return Err(usage());
    }
    let threshold = threshold.parse::<u32>().map_err(|_| usage())?;
    Ok((threshold, window.to_string()))
}

/// "esc=3/10m/ban": three hits inside ten minutes turn into a ban.
pub fn parse_escalation(spec: &str) -> Result<RuleEscalation, String> {
    let usage = || format!("invalid escalation '{}', expected e.g. esc=3/10m/ban", spec);
    let mut parts = spec.split('/');
    let (Some(threshold), Some(window), Some(action), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(usage());
    };

    let window = parse_duration(window)
        .map_err(|e| e.to_string())?
        .as_secs()
        .ok_or_else(|| "escalation window cannot be permanent".to_string())?;
    Ok(RuleEscalation {
        threshold: threshold.parse().map_err(|_| usage())?,
        within_secs: window,
        action: action.parse()?,
    })
}

/// "/addrule <word|regex> <action>[:duration] [prio=N] [esc=N/window/action] <pattern> [| reply]".
pub fn parse_rule_args(args: &str, created_by: u64) -> Result<NewRule, String> {
    let usage = || {
        "usage: /addrule <word|regex> <action>[:duration] [prio=N] [esc=N/window/action] <pattern> [| reply text]"
            .to_string()
    };

    // " | " rather than "|" so regex alternation stays in the pattern
    let (head, reply_text) = match args.split_once(" | ") {
        Some((head, reply)) => (head, non_empty(reply)),
        None => (args, None),
    };

    let (kind, rest) = next_token(head).ok_or_else(usage)?;
    let kind: PatternKind = kind.parse()?;

    let (action_spec, mut rest) = next_token(rest).ok_or_else(usage)?;
    let (action, duration) = match action_spec.split_once(':') {
        Some((action, duration)) => (
            action,
            Some(parse_duration(duration).map_err(|e| e.to_string())?),
        ),
        None => (action_spec, None),
    };
    let action: RuleAction = action.parse()?;

    let mut priority = 0;
    let mut escalation = None;
    while let Some((token, after)) = next_token(rest) {
        if let Some(value) = token.strip_prefix("prio=") {
            priority = value
                .parse::<i64>()
                .map_err(|_| format!("invalid priority '{}'", value))?;
        } else if let Some(value) = token.strip_prefix("esc=") {
            escalation = Some(parse_escalation(value)?);
        } else {
            break;
        }
        rest = after;
    }

    let pattern = non_empty(rest).ok_or_else(usage)?;

    Ok(NewRule {
        kind,
        pattern,
        action,
        duration,
        reply_text,
        priority,
        escalation,
        created_by,
    })
}

/// "off" or "<from hour> <to hour> [timezone]".
pub fn parse_night_mode(args: &str) -> Result<Option<NightMode>, String> {
    let usage = || "usage: /nightmode off | <from hour> <to hour> [timezone]".to_string();
    let args = args.trim();
    if args.eq_ignore_ascii_case("off") {
        return Ok(None);
    }

    let parts: Vec<&str> = args.split_whitespace().collect();
    let (from, to, timezone) = match parts.as_slice() {
        [from, to] => (*from, *to, "UTC"),
        [from, to, tz] => (*from, *to, *tz),
        _ => return Err(usage()),
    };

    Ok(Some(NightMode {
        from_hour: from.parse().map_err(|_| usage())?,
        to_hour: to.parse().map_err(|_| usage())?,
        timezone: timezone.to_string(),
    }))
}

/// "<target> [action]"; the action defaults to delete.
pub fn parse_lock_args(args: &str) -> Result<(LockTarget, PolicyAction), String> {
    let (target, rest) = next_token(args).ok_or("usage: /lock <type> [action]")?;
    let target: LockTarget = target.parse()?;
    let action = match non_empty(rest) {
        Some(action) => action.parse::<PolicyAction>()?,
        None => PolicyAction::Delete,
    };
    Ok((target, action))
}

/// "<category> <action>".
pub fn parse_linktype_args(args: &str) -> Result<(LinkCategory, PolicyAction), String> {
    let usage = || "usage: /linktype <invites|telegram|shorteners|other> <action>".to_string();
    let (category, rest) = next_token(args).ok_or_else(usage)?;
    let action = non_empty(rest).ok_or_else(usage)?;
    Ok((category.parse()?, action.parse()?))
}

// ============================================================================
// FORMATTING
// ============================================================================

fn on_off(value: bool) -> &'static str {
    if value {
        "on"
    } else {
        "off"
    }
}

pub fn describe_config(config: &GroupConfig) -> String {
    let links = &config.link_policy;
    let mut lines = vec![
        "🛡️ Moderation settings".to_string(),
        format!("Anti-spam: {}", on_off(config.enabled)),
        format!(
            "Flood: {} messages / {}s, then {}",
            config.flood_threshold,
            config.flood_window_secs,
            match config.flood_action {
                FloodAction::Warn => "warn",
                FloodAction::Mute => "mute",
            }
        ),
        format!(
            "Escalation: {} warnings, mute {}, ban {}",
            config.warn_limit,
            config.mute_duration,
            config.ban_duration
        ),
        format!(
            "Links: block all {}, default action {}",
            on_off(links.block_all),
            links.action
        ),
    ];

    if !links.allowlist.is_empty() {
        lines.push(format!("Allowed domains: {}", links.allowlist.join(", ")));
    }
    if !links.denylist.is_empty() {
        lines.push(format!("Denied domains: {}", links.denylist.join(", ")));
    }
    for (category, action) in &links.categories {
        lines.push(format!("Link type {}: {}", category, action));
    }
    if let Some(night) = &links.night_mode {
        lines.push(format!(
            "Night mode: {:02}:00 to {:02}:00 {}",
            night.from_hour, night.to_hour, night.timezone
        ));
    }
    if let Some(action) = config.locks.forwards {
        lines.push(format!("Lock forwards: {}", action));
    }
    for (kind, action) in &config.locks.media {
        lines.push(format!("Lock {}: {}", kind, action));
    }
    lines.push(format!("Welcome: {}", on_off(config.welcome.enabled)));
    if config.captcha.enabled {
        lines.push(format!(
            "Join challenge: {} within {}",
            config.captcha.mode,
            DurationSpec::from_secs(config.captcha.timeout_secs)
        ));
    } else {
        lines.push("Join challenge: off".to_string());
    }
    lines.push(format!(
        "Join requests: auto-approve {}, rules acceptance {}",
        on_off(config.onboarding.auto_approve),
        on_off(config.onboarding.require_accept)
    ));

    lines.join("\n")
}

pub fn describe_rule(rule: &Rule) -> String {
    let mut line = format!("#{} [{}] {}", rule.id, rule.kind.as_str(), rule.action);
    if let Some(duration) = &rule.duration {
        line.push_str(&format!(":{}", duration));
    }
    if rule.priority != 0 {
        line.push_str(&format!(" prio={}", rule.priority));
    }
    if let Some(esc) = &rule.escalation {
        let window = DurationSpec::from_secs(esc.within_secs);
        line.push_str(&format!(" esc={}/{}/{}", esc.threshold, window, esc.action));
    }
    line.push_str(&format!(" {}", rule.pattern));
    if let Some(reply) = &rule.reply_text {
        line.push_str(&format!(" | {}", reply));
    }
    line
}

// ============================================================================
// HANDLERS
// ============================================================================

/// Target for a moderation command, refusing admins.
async fn target(bot: &Bot, msg: &Message, data: &Data, args: &str) -> Result<(Target, String), Error> {
    let replied = msg
        .reply_to_message()
        .and_then(|m| m.from.as_ref())
        .map(|u| Target {
            user_id: u.id.0,
            name: u.first_name.clone(),
        });
    let (target, rest) = split_target(replied, args)?;

    if data
        .admins
        .is_admin(bot, msg.chat.id, UserId(target.user_id))
        .await
    {
        return Err("admins cannot be moderated".into());
    }
    Ok((target, rest.to_string()))
}

pub async fn antispam(data: &Data, group_id: i64, actor: u64, args: &str) -> Result<String, Error> {
    if args.trim().is_empty() {
        let config = data.moderation.config_for(group_id).await?;
        return Ok(describe_config(&config));
    }
    let enabled = parse_switch(args)?;
    data.moderation.set_enabled(group_id, actor, enabled).await?;
    Ok(if enabled {
        "✅ Anti-spam protection has been enabled.".to_string()
    } else {
        "❌ Anti-spam protection has been disabled.".to_string()
    })
}

pub async fn set_flood(data: &Data, group_id: i64, actor: u64, args: &str) -> Result<String, Error> {
    let (threshold, window) = parse_flood_args(args)?;
    let config = data
        .moderation
        .set_flood(group_id, actor, threshold, &window)
        .await?;
    Ok(format!(
        "✅ Flood limit set to {} messages per {}s.",
        config.flood_threshold, config.flood_window_secs
    ))
}

pub async fn set_mute(data: &Data, group_id: i64, actor: u64, args: &str) -> Result<String, Error> {
    let config = data
        .moderation
        .set_mute_duration(group_id, actor, args)
        .await?;
    Ok(format!(
        "✅ Automatic mutes now last {}.",
        format_duration(&config.mute_duration)
    ))
}

pub async fn set_ban(data: &Data, group_id: i64, actor: u64, args: &str) -> Result<String, Error> {
    let config = data
        .moderation
        .set_ban_duration(group_id, actor, args)
        .await?;
    Ok(format!(
        "✅ Automatic bans now last {}.",
        format_duration(&config.ban_duration)
    ))
}

pub async fn warn_limit(data: &Data, group_id: i64, actor: u64, args: &str) -> Result<String, Error> {
    let limit = args
        .trim()
        .parse::<u32>()
        .map_err(|_| "usage: /warnlimit <number>")?;
    data.moderation.set_warn_limit(group_id, actor, limit).await?;
    Ok(format!("✅ Users are muted after {} warnings.", limit))
}

pub async fn flood_action(data: &Data, group_id: i64, actor: u64, args: &str) -> Result<String, Error> {
    let action: FloodAction = args.parse()?;
    data.moderation
        .set_flood_action(group_id, actor, action)
        .await?;
    Ok(format!("✅ Flood action set to {}.", args.trim().to_lowercase()))
}

pub async fn add_rule(data: &Data, group_id: i64, actor: u64, args: &str) -> Result<String, Error> {
    let rule = parse_rule_args(args, actor)?;
    let rule = data.moderation.add_rule(group_id, rule).await?;
    Ok(format!("✅ Rule added: {}", describe_rule(&rule)))
}

pub async fn list_rules(data: &Data, group_id: i64) -> Result<String, Error> {
    let rules = data.moderation.list_rules(group_id).await?;
    if rules.is_empty() {
        return Ok("No content rules yet. Add one with /addrule.".to_string());
    }
    let lines: Vec<String> = rules.iter().map(describe_rule).collect();
    Ok(format!("📋 Content rules (first match wins):\n{}", lines.join("\n")))
}

pub async fn del_rule(data: &Data, group_id: i64, actor: u64, args: &str) -> Result<String, Error> {
    let id = args
        .trim()
        .trim_start_matches('#')
        .parse::<i64>()
        .map_err(|_| "usage: /delrule <id>")?;
    data.moderation.delete_rule(group_id, actor, id).await?;
    Ok(format!("🗑️ Rule #{} deleted.", id))
}

pub async fn warn(bot: &Bot, msg: &Message, data: &Data, actor: u64, args: &str) -> Result<String, Error> {
    let (target, rest) = target(bot, msg, data, args).await?;
    let reason = non_empty(&rest);
    let action = data
        .moderation
        .warn_user(msg.chat.id.0, actor, target.user_id, reason)
        .await?;

    Ok(match action {
        ModerationAction::Mute { duration } => {
            restrict_member(bot, msg.chat.id, UserId(target.user_id), &duration).await;
            format!(
                "🔇 {} reached the warning limit and has been muted {}.",
                target.name,
                span(&duration)
            )
        }
        ModerationAction::Warn { count, limit } => {
            format!("⚠️ {} has been warned ({}/{}).", target.name, count, limit)
        }
        other => format!("{}: {}", target.name, other.label()),
    })
}

pub async fn unwarn(bot: &Bot, msg: &Message, data: &Data, actor: u64, args: &str) -> Result<String, Error> {
    let (target, _) = target(bot, msg, data, args).await?;
    let remaining = data
        .moderation
        .remove_warning(msg.chat.id.0, actor, target.user_id)
        .await?;
    Ok(format!(
        "✅ Removed a warning from {}; {} left.",
        target.name, remaining
    ))
}

pub async fn reset_warns(bot: &Bot, msg: &Message, data: &Data, actor: u64, args: &str) -> Result<String, Error> {
    let (target, _) = target(bot, msg, data, args).await?;
    data.moderation
        .reset_warnings(msg.chat.id.0, actor, target.user_id)
        .await?;
    Ok(format!("✅ Warnings of {} have been reset.", target.name))
}

pub async fn mute(bot: &Bot, msg: &Message, data: &Data, actor: u64, args: &str) -> Result<String, Error> {
    let (target, rest) = target(bot, msg, data, args).await?;
    let (duration, reason) = split_duration_reason(&rest);
    let duration = data
        .moderation
        .mute_user(msg.chat.id.0, actor, target.user_id, duration, reason)
        .await?;
    restrict_member(bot, msg.chat.id, UserId(target.user_id), &duration).await;
    let release = JobKind::TimedUnmute {
        user_id: target.user_id,
    };
    release_later(data, msg.chat.id, release, &duration).await;
    Ok(format!("🔇 {} has been muted {}.", target.name, span(&duration)))
}

pub async fn unmute(bot: &Bot, msg: &Message, data: &Data, actor: u64, args: &str) -> Result<String, Error> {
    let (target, _) = target(bot, msg, data, args).await?;
    data.moderation
        .unmute_user(msg.chat.id.0, actor, target.user_id)
        .await?;
    lift_restrictions(bot, msg.chat.id, UserId(target.user_id)).await;
    cancel_release(data, msg.chat.id, UserId(target.user_id), "timed_unmute").await;
    Ok(format!("🔊 {} can talk again.", target.name))
}

pub async fn ban(bot: &Bot, msg: &Message, data: &Data, actor: u64, args: &str) -> Result<String, Error> {
    let (target, rest) = target(bot, msg, data, args).await?;
    let (duration, reason) = split_duration_reason(&rest);
    let duration = data
        .moderation
        .ban_user(msg.chat.id.0, actor, target.user_id, duration, reason)
        .await?;
    ban_member(bot, msg.chat.id, UserId(target.user_id), &duration).await;
    let release = JobKind::TimedUnban {
        user_id: target.user_id,
    };
    release_later(data, msg.chat.id, release, &duration).await;
    Ok(format!("🔨 {} has been banned {}.", target.name, span(&duration)))
}

pub async fn unban(bot: &Bot, msg: &Message, data: &Data, actor: u64, args: &str) -> Result<String, Error> {
    let (target, _) = target(bot, msg, data, args).await?;
    data.moderation
        .unban_user(msg.chat.id.0, actor, target.user_id)
        .await?;
    unban_member(bot, msg.chat.id, UserId(target.user_id)).await;
    cancel_release(data, msg.chat.id, UserId(target.user_id), "timed_unban").await;
    Ok(format!("✅ {} has been unbanned.", target.name))
}

pub async fn allow_domain(data: &Data, group_id: i64, actor: u64, args: &str) -> Result<String, Error> {
    data.moderation.allow_domain(group_id, actor, args).await?;
    Ok(format!("✅ Links to {} are always allowed.", args.trim()))
}

pub async fn deny_domain(data: &Data, group_id: i64, actor: u64, args: &str) -> Result<String, Error> {
    data.moderation.deny_domain(group_id, actor, args).await?;
    Ok(format!("🚫 Links to {} are now blocked.", args.trim()))
}

pub async fn rm_domain(data: &Data, group_id: i64, actor: u64, args: &str) -> Result<String, Error> {
    data.moderation.remove_domain(group_id, actor, args).await?;
    Ok(format!("✅ {} removed from the domain lists.", args.trim()))
}

pub async fn block_links(data: &Data, group_id: i64, actor: u64, args: &str) -> Result<String, Error> {
    let block_all = parse_switch(args)?;
    data.moderation
        .set_block_all_links(group_id, actor, block_all)
        .await?;
    Ok(format!("✅ Blocking of all links is {}.", on_off(block_all)))
}

pub async fn link_type(data: &Data, group_id: i64, actor: u64, args: &str) -> Result<String, Error> {
    let (category, action) = parse_linktype_args(args)?;
    data.moderation
        .set_link_category_action(group_id, actor, category, action)
        .await?;
    Ok(format!("✅ {} links: {}.", category, action))
}

pub async fn night_mode(data: &Data, group_id: i64, actor: u64, args: &str) -> Result<String, Error> {
    let night = parse_night_mode(args)?;
    let reply = match &night {
        Some(n) => format!(
            "🌙 Links are blocked from {:02}:00 to {:02}:00 ({}).",
            n.from_hour, n.to_hour, n.timezone
        ),
        None => "☀️ Night mode is off.".to_string(),
    };
    data.moderation.set_night_mode(group_id, actor, night).await?;
    Ok(reply)
}

pub async fn lock(data: &Data, group_id: i64, actor: u64, args: &str) -> Result<String, Error> {
    let (target, action) = parse_lock_args(args)?;
    data.moderation
        .set_lock(group_id, actor, target, action)
        .await?;
    Ok(format!("🔒 {} locked ({}).", target, action))
}

pub async fn unlock(data: &Data, group_id: i64, actor: u64, args: &str) -> Result<String, Error> {
    let target: LockTarget = args.parse()?;
    data.moderation.clear_lock(group_id, actor, target).await?;
    Ok(format!("🔓 {} unlocked.", target))
}
