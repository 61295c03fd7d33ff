// Help, group rules and the moderation log.

use super::Command;
use crate::core::moderation::AuditRecord;
use crate::telegram::{Data, Error};
use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;

const DEFAULT_AUDIT_ENTRIES: u32 = 10;
const MAX_AUDIT_ENTRIES: u32 = 50;

pub fn help() -> String {
    format!(
        "{}\n\nAll commands except /help and /rules are for group admins.",
        Command::descriptions()
    )
}

pub async fn rules(data: &Data, msg: &Message) -> Result<String, Error> {
    if msg.chat.is_private() {
        return Ok("Use /rules inside a group.".to_string());
    }
    let config = data.moderation.config_for(msg.chat.id.0).await?;
    Ok(match config.rules_text {
        Some(text) => format!("📜 Group rules\n\n{}", text),
        None => "This group has no rules set yet.".to_string(),
    })
}

pub async fn set_rules(data: &Data, group_id: i64, actor: u64, args: &str) -> Result<String, Error> {
    let text = args.trim();
    let text = (!text.is_empty()).then(|| text.to_string());
    let cleared = text.is_none();
    data.moderation.set_rules_text(group_id, actor, text).await?;
    Ok(if cleared {
        "✅ Group rules cleared.".to_string()
    } else {
        "✅ Group rules updated.".to_string()
    })
}

pub async fn audit(data: &Data, group_id: i64, args: &str) -> Result<String, Error> {
    let limit = match args.trim() {
        "" => DEFAULT_AUDIT_ENTRIES,
        raw => raw
            .parse::<u32>()
            .map_err(|_| "usage: /audit [count]")?
            .clamp(1, MAX_AUDIT_ENTRIES),
    };

    let records = data.moderation.recent_audit(group_id, limit).await?;
    if records.is_empty() {
        return Ok("The moderation log is empty.".to_string());
    }
    let lines: Vec<String> = records.iter().map(format_audit).collect();
    Ok(format!("🧾 Recent moderation log:\n{}", lines.join("\n")))
}

pub fn format_audit(record: &AuditRecord) -> String {
    let actor = match record.actor_id {
        Some(id) => format!("admin {}", id),
        None => "auto".to_string(),
    };
    let mut line = format!(
        "#{} {} {} by {}",
        record.id,
        record.created_at.format("%Y-%m-%d %H:%M"),
        record.action,
        actor
    );
    if let Some(target) = record.target_user_id {
        line.push_str(&format!(" on {}", target));
    }
    if let Some(reason) = record
        .details
        .get("violation")
        .or_else(|| record.details.get("reason"))
        .or_else(|| record.details.get("setting"))
        .filter(|v| !v.is_null())
    {
        line.push_str(&format!(" ({})", summarize(reason)));
    }
    line
}

fn summarize(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Object(map) => map
            .get("reason")
            .and_then(|r| r.as_str())
            .or_else(|| map.get("type").and_then(|t| t.as_str()))
            .map(str::to_string)
            .unwrap_or_else(|| value.to_string()),
        other => other.to_string(),
    }
}
