// SQLite-backed moderation store.
//
// Tables:
// - group_configs: Per-group settings (policies stored as JSON)
// - content_rules: Word/regex rules per group, with optional escalation
// - user_states: Warn counts, flood window, rule hits and restriction expiry per user
// - audit_log: Append-only record of every moderation action

use crate::core::duration::{parse_duration, DurationSpec, Expiry};
use crate::core::moderation::{
    AuditRecord, FloodAction, GroupConfig, ModerationError, ModerationStore, NewAuditRecord,
    NewRule, PatternKind, RecentMessage, Rule, RuleAction, UserState,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use sqlx::sqlite::SqliteRow;
use sqlx::{Pool, Row, Sqlite};

/// Stored in place of a timestamp for restrictions without expiry.
const NEVER: &str = "never";

fn storage_err(e: impl std::fmt::Display) -> ModerationError {
    ModerationError::StorageError(e.to_string())
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, ModerationError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| storage_err(format!("bad timestamp '{}': {}", raw, e)))
}

fn encode_expiry(expiry: Option<Expiry>) -> Option<String> {
    expiry.map(|e| match e {
        Expiry::At(at) => at.to_rfc3339(),
        Expiry::Never => NEVER.to_string(),
    })
}

fn decode_expiry(raw: Option<String>) -> Result<Option<Expiry>, ModerationError> {
    match raw.as_deref() {
        None => Ok(None),
        Some(NEVER) => Ok(Some(Expiry::Never)),
        Some(ts) => parse_timestamp(ts).map(|at| Some(Expiry::At(at))),
    }
}

fn from_json<T: DeserializeOwned>(raw: &str, column: &str) -> Result<T, ModerationError> {
    serde_json::from_str(raw).map_err(|e| storage_err(format!("bad {} JSON: {}", column, e)))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, ModerationError> {
    serde_json::to_string(value).map_err(storage_err)
}

fn parse_column<T: std::str::FromStr<Err = String>>(raw: &str) -> Result<T, ModerationError> {
    raw.parse::<T>().map_err(storage_err)
}

fn parse_stored_duration(raw: &str) -> Result<DurationSpec, ModerationError> {
    parse_duration(raw).map_err(storage_err)
}

pub struct SqliteModerationStore {
    pool: Pool<Sqlite>,
}

impl SqliteModerationStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Add a column to a table created before the column existed.
    async fn add_column_if_missing(
        &self,
        table: &str,
        column: &str,
        definition: &str,
    ) -> Result<(), ModerationError> {
        let matches: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM pragma_table_info(?) WHERE name = ?",
        )
        .bind(table)
        .bind(column)
        .fetch_one(&self.pool)
        .await
        .map_err(storage_err)?;

        if matches == 0 {
            sqlx::query(&format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, definition))
                .execute(&self.pool)
                .await
                .map_err(storage_err)?;
        }
        Ok(())
    }

    /// Run database migrations to create required tables.
    pub async fn migrate(&self) -> Result<(), ModerationError> {
        // Config table
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS group_configs (
                group_id INTEGER PRIMARY KEY,
                enabled BOOLEAN NOT NULL DEFAULT 1,
                flood_window_secs INTEGER NOT NULL DEFAULT 5,
                flood_threshold INTEGER NOT NULL DEFAULT 8,
                flood_cooldown_secs INTEGER NOT NULL DEFAULT 300,
                flood_action TEXT NOT NULL DEFAULT 'warn',
                mute_duration TEXT NOT NULL DEFAULT '1m',
                ban_duration TEXT NOT NULL DEFAULT '10m',
                warn_limit INTEGER NOT NULL DEFAULT 3,
                link_policy TEXT NOT NULL DEFAULT '{}',
                locks TEXT NOT NULL DEFAULT '{}',
                welcome TEXT NOT NULL DEFAULT '{}',
                rules_text TEXT,
                captcha TEXT NOT NULL DEFAULT '{}',
                onboarding TEXT NOT NULL DEFAULT '{}'
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        // Content rules table
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS content_rules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                group_id INTEGER NOT NULL,
                kind TEXT NOT NULL,
                pattern TEXT NOT NULL,
                action TEXT NOT NULL,
                duration TEXT,
                reply_text TEXT,
                priority INTEGER NOT NULL DEFAULT 0,
                escalation TEXT,
                created_by INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_content_rules_group
                ON content_rules(group_id, priority, id);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        // Per-user state table
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_states (
                group_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                warn_count INTEGER NOT NULL DEFAULT 0,
                recent_messages TEXT NOT NULL DEFAULT '[]',
                last_flood_at TEXT,
                muted_until TEXT,
                banned_until TEXT,
                last_message_id INTEGER,
                rule_hits TEXT NOT NULL DEFAULT '{}',
                PRIMARY KEY (group_id, user_id)
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        self.add_column_if_missing("group_configs", "captcha", "TEXT NOT NULL DEFAULT '{}'")
            .await?;
        self.add_column_if_missing("group_configs", "onboarding", "TEXT NOT NULL DEFAULT '{}'")
            .await?;
        self.add_column_if_missing("content_rules", "escalation", "TEXT")
            .await?;
        self.add_column_if_missing("user_states", "last_message_id", "INTEGER")
            .await?;
        self.add_column_if_missing("user_states", "rule_hits", "TEXT NOT NULL DEFAULT '{}'")
            .await?;

        // Audit log table
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                group_id INTEGER NOT NULL,
                actor_id INTEGER,
                action TEXT NOT NULL,
                target_user_id INTEGER,
                details TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_log_group
                ON audit_log(group_id, id);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }

    fn row_to_rule(row: &SqliteRow) -> Result<Rule, ModerationError> {
        let duration: Option<String> = row.get("duration");
        let escalation: Option<String> = row.get("escalation");
        Ok(Rule {
            id: row.get("id"),
            group_id: row.get("group_id"),
            kind: parse_column::<PatternKind>(row.get("kind"))?,
            pattern: row.get("pattern"),
            action: parse_column::<RuleAction>(row.get("action"))?,
            duration: duration.as_deref().map(parse_stored_duration).transpose()?,
            reply_text: row.get("reply_text"),
            priority: row.get("priority"),
            escalation: escalation
                .as_deref()
                .map(|raw| from_json(raw, "escalation"))
                .transpose()?,
            created_by: row.get::<i64, _>("created_by") as u64,
            created_at: parse_timestamp(row.get("created_at"))?,
        })
    }

    fn row_to_state(row: &SqliteRow) -> Result<UserState, ModerationError> {
        let recent: Vec<RecentMessage> = from_json(row.get("recent_messages"), "recent_messages")?;
        let last_flood_at: Option<String> = row.get("last_flood_at");
        Ok(UserState {
            group_id: row.get("group_id"),
            user_id: row.get::<i64, _>("user_id") as u64,
            warn_count: row.get::<i64, _>("warn_count") as u32,
            recent_messages: recent,
            last_flood_at: last_flood_at.as_deref().map(parse_timestamp).transpose()?,
            muted_until: decode_expiry(row.get("muted_until"))?,
            banned_until: decode_expiry(row.get("banned_until"))?,
            last_message_id: row
                .get::<Option<i64>, _>("last_message_id")
                .map(|id| id as i32),
            rule_hits: from_json(row.get("rule_hits"), "rule_hits")?,
        })
    }
}

#[async_trait]
impl ModerationStore for SqliteModerationStore {
    async fn get_config(&self, group_id: i64) -> Result<Option<GroupConfig>, ModerationError> {
        let row = sqlx::query("SELECT * FROM group_configs WHERE group_id = ?")
            .bind(group_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let flood_action: String = row.get("flood_action");
        Ok(Some(GroupConfig {
            group_id,
            enabled: row.get("enabled"),
            flood_window_secs: row.get::<i64, _>("flood_window_secs") as u64,
            flood_threshold: row.get::<i64, _>("flood_threshold") as u32,
            flood_cooldown_secs: row.get::<i64, _>("flood_cooldown_secs") as u64,
            flood_action: parse_column::<FloodAction>(&flood_action)?,
            mute_duration: parse_stored_duration(row.get("mute_duration"))?,
            ban_duration: parse_stored_duration(row.get("ban_duration"))?,
            warn_limit: row.get::<i64, _>("warn_limit") as u32,
            link_policy: from_json(row.get("link_policy"), "link_policy")?,
            locks: from_json(row.get("locks"), "locks")?,
            welcome: from_json(row.get("welcome"), "welcome")?,
            rules_text: row.get("rules_text"),
            captcha: from_json(row.get("captcha"), "captcha")?,
            onboarding: from_json(row.get("onboarding"), "onboarding")?,
        }))
    }

    async fn save_config(&self, config: &GroupConfig) -> Result<(), ModerationError> {
        let flood_action = match config.flood_action {
            FloodAction::Warn => "warn",
            FloodAction::Mute => "mute",
        };

        sqlx::query(
            r#"
            INSERT INTO group_configs (
                group_id, enabled, flood_window_secs, flood_threshold, flood_cooldown_secs,
                flood_action, mute_duration, ban_duration, warn_limit,
                link_policy, locks, welcome, rules_text, captcha, onboarding
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(group_id) DO UPDATE SET
                enabled = excluded.enabled,
                flood_window_secs = excluded.flood_window_secs,
                flood_threshold = excluded.flood_threshold,
                flood_cooldown_secs = excluded.flood_cooldown_secs,
                flood_action = excluded.flood_action,
                mute_duration = excluded.mute_duration,
                ban_duration = excluded.ban_duration,
                warn_limit = excluded.warn_limit,
                link_policy = excluded.link_policy,
                locks = excluded.locks,
                welcome = excluded.welcome,
                rules_text = excluded.rules_text,
                captcha = excluded.captcha,
                onboarding = excluded.onboarding
            "#,
        )
        .bind(config.group_id)
        .bind(config.enabled)
        .bind(config.flood_window_secs as i64)
        .bind(config.flood_threshold as i64)
        .bind(config.flood_cooldown_secs as i64)
        .bind(flood_action)
        .bind(config.mute_duration.to_string())
        .bind(config.ban_duration.to_string())
        .bind(config.warn_limit as i64)
        .bind(to_json(&config.link_policy)?)
        .bind(to_json(&config.locks)?)
        .bind(to_json(&config.welcome)?)
        .bind(&config.rules_text)
        .bind(to_json(&config.captcha)?)
        .bind(to_json(&config.onboarding)?)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn list_rules(&self, group_id: i64) -> Result<Vec<Rule>, ModerationError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM content_rules
            WHERE group_id = ?
            ORDER BY priority ASC, id ASC
            "#,
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.iter().map(Self::row_to_rule).collect()
    }

    async fn insert_rule(
        &self,
        group_id: i64,
        rule: NewRule,
        created_at: DateTime<Utc>,
    ) -> Result<Rule, ModerationError> {
        let result = sqlx::query(
            r#"
            INSERT INTO content_rules (
                group_id, kind, pattern, action, duration, reply_text,
                priority, escalation, created_by, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(group_id)
        .bind(rule.kind.as_str())
        .bind(&rule.pattern)
        .bind(rule.action.as_str())
        .bind(rule.duration.map(|d| d.to_string()))
        .bind(&rule.reply_text)
        .bind(rule.priority)
        .bind(rule.escalation.as_ref().map(to_json).transpose()?)
        .bind(rule.created_by as i64)
        .bind(created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(Rule {
            id: result.last_insert_rowid(),
            group_id,
            kind: rule.kind,
            pattern: rule.pattern,
            action: rule.action,
            duration: rule.duration,
            reply_text: rule.reply_text,
            priority: rule.priority,
            escalation: rule.escalation,
            created_by: rule.created_by,
            created_at,
        })
    }

    async fn delete_rule(&self, group_id: i64, rule_id: i64) -> Result<bool, ModerationError> {
        let result = sqlx::query("DELETE FROM content_rules WHERE group_id = ? AND id = ?")
            .bind(group_id)
            .bind(rule_id)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_user_state(
        &self,
        group_id: i64,
        user_id: u64,
    ) -> Result<Option<UserState>, ModerationError> {
        let row = sqlx::query("SELECT * FROM user_states WHERE group_id = ? AND user_id = ?")
            .bind(group_id)
            .bind(user_id as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;

        row.as_ref().map(Self::row_to_state).transpose()
    }

    async fn save_user_state(&self, state: &UserState) -> Result<(), ModerationError> {
        sqlx::query(
            r#"
            INSERT INTO user_states (
                group_id, user_id, warn_count, recent_messages,
                last_flood_at, muted_until, banned_until, last_message_id, rule_hits
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(group_id, user_id) DO UPDATE SET
                warn_count = excluded.warn_count,
                recent_messages = excluded.recent_messages,
                last_flood_at = excluded.last_flood_at,
                muted_until = excluded.muted_until,
                banned_until = excluded.banned_until,
                last_message_id = excluded.last_message_id,
                rule_hits = excluded.rule_hits
            "#,
        )
        .bind(state.group_id)
        .bind(state.user_id as i64)
        .bind(state.warn_count as i64)
        .bind(to_json(&state.recent_messages)?)
        .bind(state.last_flood_at.map(|t| t.to_rfc3339()))
        .bind(encode_expiry(state.muted_until))
        .bind(encode_expiry(state.banned_until))
        .bind(state.last_message_id.map(i64::from))
        .bind(to_json(&state.rule_hits)?)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn append_audit(&self, record: NewAuditRecord) -> Result<i64, ModerationError> {
        let result = sqlx::query(
            r#"
            INSERT INTO audit_log (group_id, actor_id, action, target_user_id, details, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.group_id)
        .bind(record.actor_id.map(|id| id as i64))
        .bind(&record.action)
        .bind(record.target_user_id.map(|id| id as i64))
        .bind(record.details.to_string())
        .bind(record.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(result.last_insert_rowid())
    }

    async fn recent_audit(
        &self,
        group_id: i64,
        limit: u32,
    ) -> Result<Vec<AuditRecord>, ModerationError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM audit_log
            WHERE group_id = ?
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(group_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.iter()
            .map(|row| {
                Ok(AuditRecord {
                    id: row.get("id"),
                    group_id: row.get("group_id"),
                    actor_id: row.get::<Option<i64>, _>("actor_id").map(|id| id as u64),
                    action: row.get("action"),
                    target_user_id: row
                        .get::<Option<i64>, _>("target_user_id")
                        .map(|id| id as u64),
                    details: from_json(row.get("details"), "details")?,
                    created_at: parse_timestamp(row.get("created_at"))?,
                })
            })
            .collect()
    }

    async fn list_restricted(&self) -> Result<Vec<UserState>, ModerationError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM user_states
            WHERE muted_until IS NOT NULL OR banned_until IS NOT NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.iter().map(Self::row_to_state).collect()
    }
}
