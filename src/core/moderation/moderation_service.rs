// Moderation service - wraps the evaluator with persistence and locking.
//
// This service handles:
// - Running group messages through the escalation evaluator
// - Serializing state updates per (group, user)
// - Admin configuration changes and content rules
// - Manual warn / mute / ban and the audit trail
//
// NO Telegram dependencies here - just pure domain logic.

use super::evaluator::{self, RuleSet};
use super::link_policy;
use super::moderation_models::{
    AuditRecord, CaptchaMode, FloodAction, GroupConfig, LinkCategory, LockTarget, MessageEvent,
    ModerationAction, ModerationOutcome, NewAuditRecord, NewRule, NightMode, PolicyAction,
    Rule, RuleAction, UserState, Violation,
};
use crate::core::duration::{parse_duration, DurationSpec, InvalidDuration};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::json;
use std::hash::Hash;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum ModerationError {
    #[error("Storage error: {0}")]
    StorageError(String),

    #[error(transparent)]
    InvalidDuration(#[from] InvalidDuration),

    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Invalid setting: {0}")]
    InvalidConfig(String),

    #[error("Rule #{0} not found")]
    RuleNotFound(i64),
}

// ============================================================================
// STORAGE TRAIT (PORT)
// ============================================================================

/// Trait for persisting moderation data.
#[async_trait]
pub trait ModerationStore: Send + Sync {
    /// Get the config for a group, if one was ever created.
    async fn get_config(&self, group_id: i64) -> Result<Option<GroupConfig>, ModerationError>;

    /// Insert or replace a group config.
    async fn save_config(&self, config: &GroupConfig) -> Result<(), ModerationError>;

    /// All rules of a group in evaluation order (priority, then id).
    async fn list_rules(&self, group_id: i64) -> Result<Vec<Rule>, ModerationError>;

    async fn insert_rule(
        &self,
        group_id: i64,
        rule: NewRule,
        created_at: DateTime<Utc>,
    ) -> Result<Rule, ModerationError>;

    /// Returns false if no such rule exists in the group.
    async fn delete_rule(&self, group_id: i64, rule_id: i64) -> Result<bool, ModerationError>;

    async fn get_user_state(
        &self,
        group_id: i64,
        user_id: u64,
    ) -> Result<Option<UserState>, ModerationError>;

    async fn save_user_state(&self, state: &UserState) -> Result<(), ModerationError>;

    /// Append an audit entry. Returns its id.
    async fn append_audit(&self, record: NewAuditRecord) -> Result<i64, ModerationError>;

    /// Newest entries first.
    async fn recent_audit(
        &self,
        group_id: i64,
        limit: u32,
    ) -> Result<Vec<AuditRecord>, ModerationError>;

    /// Users with a mute or ban recorded, expired or not.
    async fn list_restricted(&self) -> Result<Vec<UserState>, ModerationError>;
}

// ============================================================================
// CORE SERVICE
// ============================================================================

const MIN_CAPTCHA_TIMEOUT_SECS: u64 = 30;
const MAX_CAPTCHA_TIMEOUT_SECS: u64 = 86400;

/// Get (or create) the lock handle for `key`.
fn lock_handle<K: Eq + Hash + Copy>(locks: &DashMap<K, Arc<Mutex<()>>>, key: K) -> Arc<Mutex<()>> {
    locks.entry(key).or_default().clone()
}

/// Compiled rules for one group. `generation` moves on every rule change so
/// a list read before the change is never cached after it.
#[derive(Default)]
struct CachedRules {
    generation: u64,
    rules: Option<Arc<RuleSet>>,
}

pub struct ModerationService<S: ModerationStore> {
    store: S,
    rule_cache: DashMap<i64, CachedRules>,
    user_locks: DashMap<(i64, u64), Arc<Mutex<()>>>,
    config_locks: DashMap<i64, Arc<Mutex<()>>>,
}

impl<S: ModerationStore> ModerationService<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            rule_cache: DashMap::new(),
            user_locks: DashMap::new(),
            config_locks: DashMap::new(),
        }
    }

    /// Evaluate a group message and persist the outcome.
    ///
    /// Never fails: a storage error is retried once, after which the message
    /// is let through and the failure is logged.
    pub async fn process_message(&self, event: &MessageEvent) -> ModerationOutcome {
        let lock = lock_handle(&self.user_locks, (event.group_id, event.user_id));
        let _guard = lock.lock().await;

        match self.try_process(event).await {
            Ok(outcome) => outcome,
            Err(first) => {
                tracing::warn!(
                    group_id = event.group_id,
                    user_id = event.user_id,
                    error = %first,
                    "Moderation storage failed, retrying once"
                );
                match self.try_process(event).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        tracing::error!(
                            group_id = event.group_id,
                            user_id = event.user_id,
                            message_id = event.message_id,
                            error = %e,
                            "Moderation skipped after repeated storage failure"
                        );
                        ModerationOutcome::ok()
                    }
                }
            }
        }
    }

    async fn try_process(&self, event: &MessageEvent) -> Result<ModerationOutcome, ModerationError> {
        let config = self.config_for(event.group_id).await?;
        let rules = self.rules_for(event.group_id).await?;
        let state = self
            .store
            .get_user_state(event.group_id, event.user_id)
            .await?
            .unwrap_or_else(|| UserState::new(event.group_id, event.user_id));

        let evaluation = evaluator::evaluate(&config, &rules, &state, event);

        if evaluation.state != state {
            self.store.save_user_state(&evaluation.state).await?;
        }

        let outcome = evaluation.outcome;
        if !outcome.action.is_none() {
            tracing::info!(
                group_id = event.group_id,
                user_id = event.user_id,
                action = outcome.action.label(),
                "Moderation action decided"
            );
            self.audit(NewAuditRecord {
                group_id: event.group_id,
                actor_id: None,
                action: outcome.action.label().to_string(),
                target_user_id: Some(event.user_id),
                details: json!({
                    "message_id": event.message_id,
                    "violation": outcome.violation,
                    "duration": action_duration(&outcome.action),
                }),
                created_at: event.timestamp,
            })
            .await;
        }

        Ok(outcome)
    }

    /// State is already saved when this runs, so an audit failure is only
    /// logged. Failing here would make the retry see a replayed message.
    async fn audit(&self, record: NewAuditRecord) {
        let group_id = record.group_id;
        let action = record.action.clone();
        if let Err(e) = self.store.append_audit(record).await {
            tracing::error!(group_id, action = %action, error = %e, "Failed to write audit record");
        }
    }

    /// Get the group's config, creating the default on first contact.
    pub async fn config_for(&self, group_id: i64) -> Result<GroupConfig, ModerationError> {
        if let Some(config) = self.store.get_config(group_id).await? {
            return Ok(config);
        }
        let lock = lock_handle(&self.config_locks, group_id);
        let _guard = lock.lock().await;
        self.load_or_create_config(group_id).await
    }

    /// Caller holds the group's config lock, so an admin change made since
    /// the unlocked read is seen here instead of being overwritten.
    async fn load_or_create_config(&self, group_id: i64) -> Result<GroupConfig, ModerationError> {
        if let Some(config) = self.store.get_config(group_id).await? {
            return Ok(config);
        }
        let config = GroupConfig::new(group_id);
        self.store.save_config(&config).await?;
        tracing::info!(group_id, "Created default moderation config");
        Ok(config)
    }

    async fn rules_for(&self, group_id: i64) -> Result<Arc<RuleSet>, ModerationError> {
        let generation = match self.rule_cache.get(&group_id) {
            Some(cached) => match &cached.rules {
                Some(rules) => return Ok(rules.clone()),
                None => cached.generation,
            },
            None => 0,
        };

        let rules = Arc::new(RuleSet::compile(self.store.list_rules(group_id).await?));

        let mut cached = self.rule_cache.entry(group_id).or_default();
        if cached.generation == generation {
            cached.rules = Some(rules.clone());
        }
        Ok(rules)
    }

    /// Drop the group's compiled rules. Call after the store changed.
    fn invalidate_rules(&self, group_id: i64) {
        let mut cached = self.rule_cache.entry(group_id).or_default();
        cached.generation += 1;
        cached.rules = None;
    }

    // ------------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------------

    /// Read-modify-write a group config under the group's config lock.
    async fn update_config<F>(
        &self,
        group_id: i64,
        actor_id: u64,
        setting: &str,
        apply: F,
    ) -> Result<GroupConfig, ModerationError>
    where
        F: FnOnce(&mut GroupConfig) -> Result<serde_json::Value, ModerationError>,
    {
        let lock = lock_handle(&self.config_locks, group_id);
        let _guard = lock.lock().await;

        let mut config = self.load_or_create_config(group_id).await?;
        let value = apply(&mut config)?;
        self.store.save_config(&config).await?;

        tracing::info!(group_id, actor_id, setting, "Group setting changed");
        self.audit(NewAuditRecord {
            group_id,
            actor_id: Some(actor_id),
            action: "config".to_string(),
            target_user_id: None,
            details: json!({ "setting": setting, "value": value }),
            created_at: Utc::now(),
        })
        .await;

        Ok(config)
    }

    pub async fn set_enabled(
        &self,
        group_id: i64,
        actor_id: u64,
        enabled: bool,
    ) -> Result<GroupConfig, ModerationError> {
        self.update_config(group_id, actor_id, "enabled", |c| {
            c.enabled = enabled;
            Ok(json!(enabled))
        })
        .await
    }

    /// Set the flood threshold (messages) and window ("5s", "1m").
    pub async fn set_flood(
        &self,
        group_id: i64,
        actor_id: u64,
        threshold: u32,
        window: &str,
    ) -> Result<GroupConfig, ModerationError> {
        if threshold == 0 {
            return Err(ModerationError::InvalidConfig(
                "flood threshold must be at least 1".to_string(),
            ));
        }
        let window_secs = parse_duration(window)?.as_secs().ok_or_else(|| {
            ModerationError::InvalidConfig("flood window cannot be permanent".to_string())
        })?;

        self.update_config(group_id, actor_id, "flood", |c| {
            c.flood_threshold = threshold;
            c.flood_window_secs = window_secs;
            Ok(json!({ "threshold": threshold, "window_secs": window_secs }))
        })
        .await
    }

    pub async fn set_flood_action(
        &self,
        group_id: i64,
        actor_id: u64,
        action: FloodAction,
    ) -> Result<GroupConfig, ModerationError> {
        self.update_config(group_id, actor_id, "flood_action", |c| {
            c.flood_action = action;
            Ok(json!(action))
        })
        .await
    }

    pub async fn set_mute_duration(
        &self,
        group_id: i64,
        actor_id: u64,
        raw: &str,
    ) -> Result<GroupConfig, ModerationError> {
        let duration = parse_duration(raw)?;
        self.update_config(group_id, actor_id, "mute_duration", |c| {
            c.mute_duration = duration;
            Ok(json!(duration))
        })
        .await
    }

    pub async fn set_ban_duration(
        &self,
        group_id: i64,
        actor_id: u64,
        raw: &str,
    ) -> Result<GroupConfig, ModerationError> {
        let duration = parse_duration(raw)?;
        self.update_config(group_id, actor_id, "ban_duration", |c| {
            c.ban_duration = duration;
            Ok(json!(duration))
        })
        .await
    }

    pub async fn set_warn_limit(
        &self,
        group_id: i64,
        actor_id: u64,
        limit: u32,
    ) -> Result<GroupConfig, ModerationError> {
        if limit == 0 {
            return Err(ModerationError::InvalidConfig(
                "warn limit must be at least 1".to_string(),
            ));
        }
        self.update_config(group_id, actor_id, "warn_limit", |c| {
            c.warn_limit = limit;
            Ok(json!(limit))
        })
        .await
    }

    /// Allowlist a domain (and take it off the denylist).
    pub async fn allow_domain(
        &self,
        group_id: i64,
        actor_id: u64,
        raw: &str,
    ) -> Result<GroupConfig, ModerationError> {
        let domain = parse_domain(raw)?;
        self.update_config(group_id, actor_id, "allow_domain", |c| {
            let policy = &mut c.link_policy;
            policy.denylist.retain(|d| d != &domain);
            if !policy.allowlist.contains(&domain) {
                policy.allowlist.push(domain.clone());
            }
            Ok(json!(domain))
        })
        .await
    }

    /// Denylist a domain (and take it off the allowlist).
    pub async fn deny_domain(
        &self,
        group_id: i64,
        actor_id: u64,
        raw: &str,
    ) -> Result<GroupConfig, ModerationError> {
        let domain = parse_domain(raw)?;
        self.update_config(group_id, actor_id, "deny_domain", |c| {
            let policy = &mut c.link_policy;
            policy.allowlist.retain(|d| d != &domain);
            if !policy.denylist.contains(&domain) {
                policy.denylist.push(domain.clone());
            }
            Ok(json!(domain))
        })
        .await
    }

    /// Remove a domain from both lists.
    pub async fn remove_domain(
        &self,
        group_id: i64,
        actor_id: u64,
        raw: &str,
    ) -> Result<GroupConfig, ModerationError> {
        let domain = parse_domain(raw)?;
        self.update_config(group_id, actor_id, "remove_domain", |c| {
            let policy = &mut c.link_policy;
            let before = policy.allowlist.len() + policy.denylist.len();
            policy.allowlist.retain(|d| d != &domain);
            policy.denylist.retain(|d| d != &domain);
            if policy.allowlist.len() + policy.denylist.len() == before {
                return Err(ModerationError::InvalidConfig(format!(
                    "{} is not on either list",
                    domain
                )));
            }
            Ok(json!(domain))
        })
        .await
    }

    pub async fn set_block_all_links(
        &self,
        group_id: i64,
        actor_id: u64,
        block_all: bool,
    ) -> Result<GroupConfig, ModerationError> {
        self.update_config(group_id, actor_id, "block_all_links", |c| {
            c.link_policy.block_all = block_all;
            Ok(json!(block_all))
        })
        .await
    }

    pub async fn set_link_category_action(
        &self,
        group_id: i64,
        actor_id: u64,
        category: LinkCategory,
        action: PolicyAction,
    ) -> Result<GroupConfig, ModerationError> {
        self.update_config(group_id, actor_id, "link_category", |c| {
            c.link_policy.categories.insert(category, action);
            Ok(json!({ "category": category, "action": action }))
        })
        .await
    }

    /// Turn night mode on (`Some`) or off (`None`).
    pub async fn set_night_mode(
        &self,
        group_id: i64,
        actor_id: u64,
        night: Option<NightMode>,
    ) -> Result<GroupConfig, ModerationError> {
        if let Some(night) = &night {
            if night.from_hour > 23 || night.to_hour > 23 {
                return Err(ModerationError::InvalidConfig(
                    "night mode hours must be between 0 and 23".to_string(),
                ));
            }
            if night.from_hour == night.to_hour {
                return Err(ModerationError::InvalidConfig(
                    "night mode start and end must differ".to_string(),
                ));
            }
            if link_policy::parse_timezone(&night.timezone).is_none() {
                return Err(ModerationError::InvalidConfig(format!(
                    "unknown timezone '{}'",
                    night.timezone
                )));
            }
        }

        self.update_config(group_id, actor_id, "night_mode", |c| {
            let value = json!(night);
            c.link_policy.night_mode = night;
            Ok(value)
        })
        .await
    }

    pub async fn set_lock(
        &self,
        group_id: i64,
        actor_id: u64,
        target: LockTarget,
        action: PolicyAction,
    ) -> Result<GroupConfig, ModerationError> {
        self.update_config(group_id, actor_id, "lock", |c| {
            match target {
                LockTarget::Forwards => c.locks.forwards = Some(action),
                LockTarget::Media(kind) => {
                    c.locks.media.insert(kind, action);
                }
            }
            Ok(json!({ "target": target.to_string(), "action": action }))
        })
        .await
    }

    pub async fn clear_lock(
        &self,
        group_id: i64,
        actor_id: u64,
        target: LockTarget,
    ) -> Result<GroupConfig, ModerationError> {
        self.update_config(group_id, actor_id, "unlock", |c| {
            match target {
                LockTarget::Forwards => c.locks.forwards = None,
                LockTarget::Media(kind) => {
                    c.locks.media.remove(&kind);
                }
            }
            Ok(json!(target.to_string()))
        })
        .await
    }

    pub async fn set_welcome_enabled(
        &self,
        group_id: i64,
        actor_id: u64,
        enabled: bool,
    ) -> Result<GroupConfig, ModerationError> {
        self.update_config(group_id, actor_id, "welcome_enabled", |c| {
            c.welcome.enabled = enabled;
            Ok(json!(enabled))
        })
        .await
    }

    /// `None` restores the default greeting.
    pub async fn set_welcome_template(
        &self,
        group_id: i64,
        actor_id: u64,
        template: Option<String>,
    ) -> Result<GroupConfig, ModerationError> {
        let template = template.filter(|t| !t.trim().is_empty());
        self.update_config(group_id, actor_id, "welcome_template", |c| {
            let value = json!(template);
            c.welcome.template = template;
            Ok(value)
        })
        .await
    }

    pub async fn set_rules_text(
        &self,
        group_id: i64,
        actor_id: u64,
        text: Option<String>,
    ) -> Result<GroupConfig, ModerationError> {
        let text = text.filter(|t| !t.trim().is_empty());
        self.update_config(group_id, actor_id, "rules_text", |c| {
            let value = json!(text.is_some());
            c.rules_text = text;
            Ok(value)
        })
        .await
    }

    pub async fn set_captcha_enabled(
        &self,
        group_id: i64,
        actor_id: u64,
        enabled: bool,
    ) -> Result<GroupConfig, ModerationError> {
        self.update_config(group_id, actor_id, "captcha_enabled", |c| {
            c.captcha.enabled = enabled;
            Ok(json!(enabled))
        })
        .await
    }

    pub async fn set_captcha_mode(
        &self,
        group_id: i64,
        actor_id: u64,
        mode: CaptchaMode,
    ) -> Result<GroupConfig, ModerationError> {
        self.update_config(group_id, actor_id, "captcha_mode", |c| {
            c.captcha.mode = mode;
            Ok(json!(mode))
        })
        .await
    }

    /// How long a new member has to answer, at least 30s.
    pub async fn set_captcha_timeout(
        &self,
        group_id: i64,
        actor_id: u64,
        raw: &str,
    ) -> Result<GroupConfig, ModerationError> {
        let secs = parse_duration(raw)?.as_secs().ok_or_else(|| {
            ModerationError::InvalidConfig("captcha timeout cannot be permanent".to_string())
        })?;
        if !(MIN_CAPTCHA_TIMEOUT_SECS..=MAX_CAPTCHA_TIMEOUT_SECS).contains(&secs) {
            return Err(ModerationError::InvalidConfig(format!(
                "captcha timeout must be between {}s and {}s",
                MIN_CAPTCHA_TIMEOUT_SECS, MAX_CAPTCHA_TIMEOUT_SECS
            )));
        }
        self.update_config(group_id, actor_id, "captcha_timeout", |c| {
            c.captcha.timeout_secs = secs;
            Ok(json!(secs))
        })
        .await
    }

    pub async fn set_auto_approve(
        &self,
        group_id: i64,
        actor_id: u64,
        enabled: bool,
    ) -> Result<GroupConfig, ModerationError> {
        self.update_config(group_id, actor_id, "auto_approve", |c| {
            c.onboarding.auto_approve = enabled;
            Ok(json!(enabled))
        })
        .await
    }

    pub async fn set_require_accept(
        &self,
        group_id: i64,
        actor_id: u64,
        enabled: bool,
    ) -> Result<GroupConfig, ModerationError> {
        self.update_config(group_id, actor_id, "require_accept", |c| {
            c.onboarding.require_accept = enabled;
            Ok(json!(enabled))
        })
        .await
    }

    // ------------------------------------------------------------------------
    // Content rules
    // ------------------------------------------------------------------------

    /// Validate and store a content rule.
    pub async fn add_rule(&self, group_id: i64, rule: NewRule) -> Result<Rule, ModerationError> {
        if rule.pattern.trim().is_empty() {
            return Err(ModerationError::InvalidPattern {
                pattern: rule.pattern,
                reason: "pattern is empty".to_string(),
            });
        }
        if let Err(e) = evaluator::validate_pattern(rule.kind, &rule.pattern) {
            return Err(ModerationError::InvalidPattern {
                pattern: rule.pattern,
                reason: e.to_string(),
            });
        }
        if rule.action == RuleAction::Reply
            && rule.reply_text.as_deref().map_or(true, |t| t.trim().is_empty())
        {
            return Err(ModerationError::InvalidConfig(
                "reply rules need a reply text".to_string(),
            ));
        }
        if let Some(escalation) = &rule.escalation {
            if escalation.threshold < 2 {
                return Err(ModerationError::InvalidConfig(
                    "escalation needs a threshold of at least 2 hits".to_string(),
                ));
            }
            if escalation.within_secs == 0 {
                return Err(ModerationError::InvalidConfig(
                    "escalation window cannot be empty".to_string(),
                ));
            }
            if matches!(escalation.action, RuleAction::Reply) {
                return Err(ModerationError::InvalidConfig(
                    "a rule cannot escalate to a reply".to_string(),
                ));
            }
        }
        let restricts = |action: RuleAction| matches!(action, RuleAction::Mute | RuleAction::Ban);
        if rule.duration.is_some()
            && !restricts(rule.action)
            && !rule.escalation.is_some_and(|e| restricts(e.action))
        {
            return Err(ModerationError::InvalidConfig(
                "only mute and ban rules take a duration".to_string(),
            ));
        }

        let actor_id = rule.created_by;
        let stored = self.store.insert_rule(group_id, rule, Utc::now()).await?;
        self.invalidate_rules(group_id);

        tracing::info!(group_id, rule_id = stored.id, "Content rule added");
        self.audit(NewAuditRecord {
            group_id,
            actor_id: Some(actor_id),
            action: "add_rule".to_string(),
            target_user_id: None,
            details: json!({
                "rule_id": stored.id,
                "kind": stored.kind.as_str(),
                "pattern": stored.pattern,
                "action": stored.action.as_str(),
                "escalation": stored.escalation,
            }),
            created_at: stored.created_at,
        })
        .await;

        Ok(stored)
    }

    pub async fn list_rules(&self, group_id: i64) -> Result<Vec<Rule>, ModerationError> {
        self.store.list_rules(group_id).await
    }

    pub async fn delete_rule(
        &self,
        group_id: i64,
        actor_id: u64,
        rule_id: i64,
    ) -> Result<(), ModerationError> {
        if !self.store.delete_rule(group_id, rule_id).await? {
            return Err(ModerationError::RuleNotFound(rule_id));
        }
        self.invalidate_rules(group_id);

        self.audit(NewAuditRecord {
            group_id,
            actor_id: Some(actor_id),
            action: "delete_rule".to_string(),
            target_user_id: None,
            details: json!({ "rule_id": rule_id }),
            created_at: Utc::now(),
        })
        .await;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Manual moderation
    // ------------------------------------------------------------------------

    /// Load, change and save one user's state under their lock.
    async fn modify_user<T, F>(
        &self,
        group_id: i64,
        user_id: u64,
        change: F,
    ) -> Result<T, ModerationError>
    where
        F: FnOnce(&GroupConfig, &mut UserState, DateTime<Utc>) -> T,
    {
        let lock = lock_handle(&self.user_locks, (group_id, user_id));
        let _guard = lock.lock().await;

        let config = self.config_for(group_id).await?;
        let mut state = self
            .store
            .get_user_state(group_id, user_id)
            .await?
            .unwrap_or_else(|| UserState::new(group_id, user_id));
        let before = state.clone();

        let now = Utc::now();
        state.clear_expired(now);
        let result = change(&config, &mut state, now);

        if state != before {
            self.store.save_user_state(&state).await?;
        }
        Ok(result)
    }

    async fn audit_manual(
        &self,
        group_id: i64,
        actor_id: u64,
        target_id: u64,
        action: &str,
        details: serde_json::Value,
    ) {
        tracing::info!(group_id, actor_id, user_id = target_id, action, "Manual moderation");
        self.audit(NewAuditRecord {
            group_id,
            actor_id: Some(actor_id),
            action: action.to_string(),
            target_user_id: Some(target_id),
            details,
            created_at: Utc::now(),
        })
        .await;
    }

    /// Warn a user. Returns `Mute` when this warning hits the limit.
    pub async fn warn_user(
        &self,
        group_id: i64,
        actor_id: u64,
        target_id: u64,
        reason: Option<String>,
    ) -> Result<ModerationAction, ModerationError> {
        let action = self
            .modify_user(group_id, target_id, |config, state, now| {
                evaluator::apply_warn(state, config, now)
            })
            .await?;

        let violation = Violation::Manual { reason };
        self.audit_manual(
            group_id,
            actor_id,
            target_id,
            action.label(),
            json!({ "violation": violation, "duration": action_duration(&action) }),
        )
        .await;
        Ok(action)
    }

    /// Take back one warning. Returns the new count.
    pub async fn remove_warning(
        &self,
        group_id: i64,
        actor_id: u64,
        target_id: u64,
    ) -> Result<u32, ModerationError> {
        let count = self
            .modify_user(group_id, target_id, |_, state, _| {
                state.warn_count = state.warn_count.saturating_sub(1);
                state.warn_count
            })
            .await?;
        self.audit_manual(group_id, actor_id, target_id, "unwarn", json!({ "warn_count": count }))
            .await;
        Ok(count)
    }

    pub async fn reset_warnings(
        &self,
        group_id: i64,
        actor_id: u64,
        target_id: u64,
    ) -> Result<(), ModerationError> {
        self.modify_user(group_id, target_id, |_, state, _| state.warn_count = 0)
            .await?;
        self.audit_manual(group_id, actor_id, target_id, "reset_warns", json!({}))
            .await;
        Ok(())
    }

    /// Mute a user. `None` uses the group's mute duration.
    pub async fn mute_user(
        &self,
        group_id: i64,
        actor_id: u64,
        target_id: u64,
        duration: Option<DurationSpec>,
        reason: Option<String>,
    ) -> Result<DurationSpec, ModerationError> {
        let duration = self
            .modify_user(group_id, target_id, |config, state, now| {
                let duration = duration.unwrap_or(config.mute_duration);
                evaluator::apply_mute(state, duration, now);
                duration
            })
            .await?;
        self.audit_manual(
            group_id,
            actor_id,
            target_id,
            "mute",
            json!({ "duration": duration, "reason": reason }),
        )
        .await;
        Ok(duration)
    }

    pub async fn unmute_user(
        &self,
        group_id: i64,
        actor_id: u64,
        target_id: u64,
    ) -> Result<(), ModerationError> {
        self.modify_user(group_id, target_id, |_, state, _| state.muted_until = None)
            .await?;
        self.audit_manual(group_id, actor_id, target_id, "unmute", json!({}))
            .await;
        Ok(())
    }

    /// Ban a user. `None` uses the group's ban duration.
    pub async fn ban_user(
        &self,
        group_id: i64,
        actor_id: u64,
        target_id: u64,
        duration: Option<DurationSpec>,
        reason: Option<String>,
    ) -> Result<DurationSpec, ModerationError> {
        let duration = self
            .modify_user(group_id, target_id, |config, state, now| {
                let duration = duration.unwrap_or(config.ban_duration);
                evaluator::apply_ban(state, duration, now);
                duration
            })
            .await?;
        self.audit_manual(
            group_id,
            actor_id,
            target_id,
            "ban",
            json!({ "duration": duration, "reason": reason }),
        )
        .await;
        Ok(duration)
    }

    pub async fn unban_user(
        &self,
        group_id: i64,
        actor_id: u64,
        target_id: u64,
    ) -> Result<(), ModerationError> {
        self.modify_user(group_id, target_id, |_, state, _| state.banned_until = None)
            .await?;
        self.audit_manual(group_id, actor_id, target_id, "unban", json!({}))
            .await;
        Ok(())
    }

    pub async fn user_state(&self, group_id: i64, user_id: u64) -> Result<UserState, ModerationError> {
        Ok(self
            .store
            .get_user_state(group_id, user_id)
            .await?
            .unwrap_or_else(|| UserState::new(group_id, user_id)))
    }

    // ------------------------------------------------------------------------
    // Audit & housekeeping
    // ------------------------------------------------------------------------

    pub async fn recent_audit(
        &self,
        group_id: i64,
        limit: u32,
    ) -> Result<Vec<AuditRecord>, ModerationError> {
        self.store.recent_audit(group_id, limit).await
    }

    /// Clear mutes and bans that ran out, then drop idle lock handles.
    /// Returns how many users were updated.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize, ModerationError> {
        let mut cleared = 0;

        for candidate in self.store.list_restricted().await? {
            let mut probe = candidate.clone();
            if !probe.clear_expired(now) {
                continue;
            }

            let key = (candidate.group_id, candidate.user_id);
            let lock = lock_handle(&self.user_locks, key);
            let _guard = lock.lock().await;

            // Re-read under the lock; a message may have changed it meanwhile
            let Some(mut state) = self.store.get_user_state(key.0, key.1).await? else {
                continue;
            };
            if state.clear_expired(now) {
                self.store.save_user_state(&state).await?;
                cleared += 1;
            }
        }

        // A handle nobody else holds can't be guarding anything
        self.user_locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        self.config_locks.retain(|_, lock| Arc::strong_count(lock) > 1);

        if cleared > 0 {
            tracing::debug!(cleared, "Cleared expired restrictions");
        }
        Ok(cleared)
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.user_locks.len()
    }
}

fn parse_domain(raw: &str) -> Result<String, ModerationError> {
    link_policy::normalize_domain(raw)
        .ok_or_else(|| ModerationError::InvalidConfig(format!("'{}' is not a domain", raw.trim())))
}

fn action_duration(action: &ModerationAction) -> Option<String> {
    match action {
        ModerationAction::Mute { duration } | ModerationAction::Ban { duration } => {
            Some(duration.to_string())
        }
        _ => None,
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::duration::Expiry;
    use crate::core::moderation::moderation_models::{MessageKind, PatternKind, RuleEscalation};
    use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
    use tokio::sync::Notify;

    const GROUP: i64 = -100123;

    /// Parks the next read after it has loaded its data, until released.
    #[derive(Default)]
    struct ReadGate {
        armed: AtomicBool,
        reached: Notify,
        release: Notify,
    }

    impl ReadGate {
        fn arm(&self) {
            self.armed.store(true, Ordering::SeqCst);
        }

        async fn pass(&self) {
            if self.armed.swap(false, Ordering::SeqCst) {
                self.reached.notify_one();
                self.release.notified().await;
            }
        }
    }

    /// In-memory store for testing
    #[derive(Default)]
    struct MockModerationStore {
        configs: DashMap<i64, GroupConfig>,
        rules: DashMap<i64, Vec<Rule>>,
        states: DashMap<(i64, u64), UserState>,
        audit: DashMap<i64, Vec<AuditRecord>>,
        next_id: AtomicI64,
        /// Fail this many state reads before succeeding
        failing_reads: AtomicU32,
        state_reads: AtomicU32,
        config_gate: ReadGate,
        rules_gate: ReadGate,
    }

    impl MockModerationStore {
        fn new() -> Self {
            Self::default()
        }

        fn failing(times: u32) -> Self {
            let store = Self::default();
            store.failing_reads.store(times, Ordering::SeqCst);
            store
        }

        fn audit_actions(&self, group_id: i64) -> Vec<String> {
            self.audit
                .get(&group_id)
                .map(|a| a.iter().map(|r| r.action.clone()).collect())
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl ModerationStore for MockModerationStore {
        async fn get_config(&self, group_id: i64) -> Result<Option<GroupConfig>, ModerationError> {
            let config = self.configs.get(&group_id).map(|c| c.clone());
            self.config_gate.pass().await;
            Ok(config)
        }

        async fn save_config(&self, config: &GroupConfig) -> Result<(), ModerationError> {
            self.configs.insert(config.group_id, config.clone());
            Ok(())
        }

        async fn list_rules(&self, group_id: i64) -> Result<Vec<Rule>, ModerationError> {
            let mut rules = self
                .rules
                .get(&group_id)
                .map(|r| r.clone())
                .unwrap_or_default();
            rules.sort_by_key(|r| (r.priority, r.id));
            self.rules_gate.pass().await;
            Ok(rules)
        }

        async fn insert_rule(
            &self,
            group_id: i64,
            rule: NewRule,
            created_at: DateTime<Utc>,
        ) -> Result<Rule, ModerationError> {
            let stored = Rule {
                id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
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
            };
            self.rules.entry(group_id).or_default().push(stored.clone());
            Ok(stored)
        }

        async fn delete_rule(&self, group_id: i64, rule_id: i64) -> Result<bool, ModerationError> {
            let mut rules = self.rules.entry(group_id).or_default();
            let before = rules.len();
            rules.retain(|r| r.id != rule_id);
            Ok(rules.len() != before)
        }

        async fn get_user_state(
            &self,
            group_id: i64,
            user_id: u64,
        ) -> Result<Option<UserState>, ModerationError> {
            self.state_reads.fetch_add(1, Ordering::SeqCst);
            let failing = self.failing_reads.load(Ordering::SeqCst);
            if failing > 0 {
                self.failing_reads.store(failing - 1, Ordering::SeqCst);
                return Err(ModerationError::StorageError("database is locked".to_string()));
            }
            let state = self.states.get(&(group_id, user_id)).map(|s| s.clone());
            // Give other tasks a chance to interleave between read and write
            tokio::task::yield_now().await;
            Ok(state)
        }

        async fn save_user_state(&self, state: &UserState) -> Result<(), ModerationError> {
            self.states
                .insert((state.group_id, state.user_id), state.clone());
            Ok(())
        }

        async fn append_audit(&self, record: NewAuditRecord) -> Result<i64, ModerationError> {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            self.audit.entry(record.group_id).or_default().push(AuditRecord {
                id,
                group_id: record.group_id,
                actor_id: record.actor_id,
                action: record.action,
                target_user_id: record.target_user_id,
                details: record.details,
                created_at: record.created_at,
            });
            Ok(id)
        }

        async fn recent_audit(
            &self,
            group_id: i64,
            limit: u32,
        ) -> Result<Vec<AuditRecord>, ModerationError> {
            let mut records = self
                .audit
                .get(&group_id)
                .map(|a| a.clone())
                .unwrap_or_default();
            records.reverse();
            records.truncate(limit as usize);
            Ok(records)
        }

        async fn list_restricted(&self) -> Result<Vec<UserState>, ModerationError> {
            Ok(self
                .states
                .iter()
                .filter(|s| s.muted_until.is_some() || s.banned_until.is_some())
                .map(|s| s.clone())
                .collect())
        }
    }

    fn message(id: i32, user_id: u64, text: &str) -> MessageEvent {
        MessageEvent {
            group_id: GROUP,
            user_id,
            message_id: id,
            text: text.to_string(),
            timestamp: Utc::now(),
            kind: MessageKind::Text,
            is_forward: false,
        }
    }

    fn word_rule(pattern: &str, action: RuleAction) -> NewRule {
        NewRule {
            kind: PatternKind::Word,
            pattern: pattern.to_string(),
            action,
            duration: None,
            reply_text: None,
            priority: 0,
            escalation: None,
            created_by: 1,
        }
    }

    #[tokio::test]
    async fn test_first_message_creates_default_config() {
        let service = ModerationService::new(MockModerationStore::new());

        let outcome = service.process_message(&message(1, 7, "hello")).await;

        assert!(outcome.action.is_none());
        assert!(service.store.configs.contains_key(&GROUP));
        assert!(service.store.audit_actions(GROUP).is_empty());
    }

    #[tokio::test]
    async fn test_rule_match_is_audited() {
        let service = ModerationService::new(MockModerationStore::new());
        service
            .add_rule(GROUP, word_rule("scam", RuleAction::Delete))
            .await
            .unwrap();

        let outcome = service.process_message(&message(1, 7, "SCAM link")).await;

        assert_eq!(outcome.action, ModerationAction::Delete);
        assert_eq!(service.store.audit_actions(GROUP), vec!["add_rule", "delete"]);
        let latest = &service.recent_audit(GROUP, 1).await.unwrap()[0];
        assert_eq!(latest.actor_id, None);
        assert_eq!(latest.target_user_id, Some(7));
    }

    #[tokio::test]
    async fn test_storage_error_retried_once() {
        let service = ModerationService::new(MockModerationStore::failing(1));
        service
            .add_rule(GROUP, word_rule("spam", RuleAction::Delete))
            .await
            .unwrap();

        let outcome = service.process_message(&message(1, 7, "spam")).await;

        assert_eq!(outcome.action, ModerationAction::Delete);
        assert_eq!(service.store.state_reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_repeated_storage_error_is_a_no_op() {
        let service = ModerationService::new(MockModerationStore::failing(2));
        service
            .add_rule(GROUP, word_rule("spam", RuleAction::Ban))
            .await
            .unwrap();

        let outcome = service.process_message(&message(1, 7, "spam")).await;

        assert_eq!(outcome, ModerationOutcome::ok());
        assert!(service.store.states.is_empty());
    }

    #[tokio::test]
    async fn test_rejects_invalid_rules() {
        let service = ModerationService::new(MockModerationStore::new());

        let mut bad_regex = word_rule("(unclosed", RuleAction::Delete);
        bad_regex.kind = PatternKind::Regex;
        assert!(matches!(
            service.add_rule(GROUP, bad_regex).await,
            Err(ModerationError::InvalidPattern { .. })
        ));

        let reply_without_text = word_rule("faq", RuleAction::Reply);
        assert!(matches!(
            service.add_rule(GROUP, reply_without_text).await,
            Err(ModerationError::InvalidConfig(_))
        ));

        assert!(service.list_rules(GROUP).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rule_cache_invalidated_on_delete() {
        let service = ModerationService::new(MockModerationStore::new());
        let rule = service
            .add_rule(GROUP, word_rule("spam", RuleAction::Delete))
            .await
            .unwrap();

        let outcome = service.process_message(&message(1, 7, "spam")).await;
        assert_eq!(outcome.action, ModerationAction::Delete);

        service.delete_rule(GROUP, 1, rule.id).await.unwrap();
        let outcome = service.process_message(&message(2, 7, "spam")).await;
        assert!(outcome.action.is_none());

        assert!(matches!(
            service.delete_rule(GROUP, 1, rule.id).await,
            Err(ModerationError::RuleNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_duration_rejected_at_write_time() {
        let service = ModerationService::new(MockModerationStore::new());

        let result = service.set_mute_duration(GROUP, 1, "soon").await;
        assert!(matches!(result, Err(ModerationError::InvalidDuration(_))));

        let config = service.set_mute_duration(GROUP, 1, "2h").await.unwrap();
        assert_eq!(config.mute_duration.as_secs(), Some(7200));
        assert!(matches!(
            service.set_flood(GROUP, 1, 5, "perm").await,
            Err(ModerationError::InvalidConfig(_))
        ));
        assert!(matches!(
            service.set_warn_limit(GROUP, 1, 0).await,
            Err(ModerationError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_domain_lists_and_night_mode() {
        let service = ModerationService::new(MockModerationStore::new());

        service.deny_domain(GROUP, 1, "https://spam.io/x").await.unwrap();
        let config = service.allow_domain(GROUP, 1, "spam.io").await.unwrap();
        assert_eq!(config.link_policy.allowlist, vec!["spam.io".to_string()]);
        assert!(config.link_policy.denylist.is_empty());

        let config = service.remove_domain(GROUP, 1, "spam.io").await.unwrap();
        assert!(config.link_policy.allowlist.is_empty());
        assert!(service.remove_domain(GROUP, 1, "spam.io").await.is_err());

        let bad_tz = NightMode {
            from_hour: 22,
            to_hour: 6,
            timezone: "Mars/Olympus".to_string(),
        };
        assert!(service.set_night_mode(GROUP, 1, Some(bad_tz)).await.is_err());
    }

    #[tokio::test]
    async fn test_join_settings() {
        let service = ModerationService::new(MockModerationStore::new());

        service.set_captcha_enabled(GROUP, 1, true).await.unwrap();
        service.set_captcha_mode(GROUP, 1, CaptchaMode::Math).await.unwrap();
        let config = service.set_captcha_timeout(GROUP, 1, "3m").await.unwrap();
        assert!(config.captcha.enabled);
        assert_eq!(config.captcha.mode, CaptchaMode::Math);
        assert_eq!(config.captcha.timeout_secs, 180);

        assert!(service.set_captcha_timeout(GROUP, 1, "5s").await.is_err());
        assert!(service.set_captcha_timeout(GROUP, 1, "perm").await.is_err());

        let config = service.set_require_accept(GROUP, 1, true).await.unwrap();
        assert!(config.onboarding.require_accept);
        assert!(!config.onboarding.auto_approve);
        assert_eq!(
            service.store.audit_actions(GROUP).last().map(String::as_str),
            Some("config")
        );
    }

    #[tokio::test]
    async fn test_manual_warns_escalate_and_reset() {
        let service = ModerationService::new(MockModerationStore::new());
        service.set_warn_limit(GROUP, 1, 2).await.unwrap();

        let first = service.warn_user(GROUP, 1, 9, None).await.unwrap();
        assert_eq!(first, ModerationAction::Warn { count: 1, limit: 2 });
        assert_eq!(service.remove_warning(GROUP, 1, 9).await.unwrap(), 0);

        service.warn_user(GROUP, 1, 9, None).await.unwrap();
        let second = service
            .warn_user(GROUP, 1, 9, Some("rude".to_string()))
            .await
            .unwrap();
        assert!(matches!(second, ModerationAction::Mute { .. }));

        let state = service.user_state(GROUP, 9).await.unwrap();
        assert_eq!(state.warn_count, 0);
        assert!(state.is_muted(Utc::now()));
    }

    #[tokio::test]
    async fn test_mute_and_unmute() {
        let service = ModerationService::new(MockModerationStore::new());

        let duration = service
            .mute_user(GROUP, 1, 9, Some(DurationSpec::Permanent), None)
            .await
            .unwrap();
        assert_eq!(duration, DurationSpec::Permanent);

        let outcome = service.process_message(&message(1, 9, "hi")).await;
        assert_eq!(outcome.action, ModerationAction::Delete);

        service.unmute_user(GROUP, 1, 9).await.unwrap();
        let outcome = service.process_message(&message(2, 9, "hi")).await;
        assert!(outcome.action.is_none());
    }

    #[tokio::test]
    async fn test_sweep_clears_expired_and_prunes_locks() {
        let service = ModerationService::new(MockModerationStore::new());
        let mut state = UserState::new(GROUP, 5);
        state.banned_until = Some(Expiry::At(Utc::now() - chrono::Duration::seconds(5)));
        service.store.save_user_state(&state).await.unwrap();

        let mut permanent = UserState::new(GROUP, 6);
        permanent.banned_until = Some(Expiry::Never);
        service.store.save_user_state(&permanent).await.unwrap();

        service.process_message(&message(1, 7, "hello")).await;
        assert!(service.tracked_locks() > 0);

        let cleared = service.sweep_expired(Utc::now()).await.unwrap();

        assert_eq!(cleared, 1);
        assert_eq!(service.user_state(GROUP, 5).await.unwrap().banned_until, None);
        assert!(service.user_state(GROUP, 6).await.unwrap().is_banned(Utc::now()));
        assert_eq!(service.tracked_locks(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_warnings_do_not_lose_updates() {
        let service = Arc::new(ModerationService::new(MockModerationStore::new()));
        service.set_warn_limit(GROUP, 1, 1000).await.unwrap();

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let service = service.clone();
                tokio::spawn(async move { service.warn_user(GROUP, 1, 7, None).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let state = service.user_state(GROUP, 7).await.unwrap();
        assert_eq!(state.warn_count, 50);
    }

    #[tokio::test]
    async fn test_messages_in_order_are_all_counted() {
        let service = ModerationService::new(MockModerationStore::new());
        service.set_warn_limit(GROUP, 1, 1000).await.unwrap();
        service.set_flood(GROUP, 1, 1000, "5s").await.unwrap();
        service
            .add_rule(GROUP, word_rule("spam", RuleAction::Warn))
            .await
            .unwrap();

        for id in 1..=20 {
            service.process_message(&message(id, 7, "spam")).await;
        }
        // Redelivered messages are skipped
        service.process_message(&message(20, 7, "spam")).await;
        service.process_message(&message(5, 7, "spam")).await;

        let state = service.user_state(GROUP, 7).await.unwrap();
        assert_eq!(state.warn_count, 20);
        assert_eq!(state.last_message_id, Some(20));
    }

    #[tokio::test]
    async fn test_rule_added_during_a_rules_read_is_not_lost() {
        let service = Arc::new(ModerationService::new(MockModerationStore::new()));
        service.store.rules_gate.arm();

        let reader = {
            let service = service.clone();
            tokio::spawn(async move { service.process_message(&message(1, 7, "spam")).await })
        };
        // The reader has loaded an empty rule list and is parked
        service.store.rules_gate.reached.notified().await;

        service
            .add_rule(GROUP, word_rule("spam", RuleAction::Delete))
            .await
            .unwrap();
        service.store.rules_gate.release.notify_one();

        let first = reader.await.unwrap();
        assert!(first.action.is_none());

        let second = service.process_message(&message(2, 7, "spam")).await;
        assert_eq!(second.action, ModerationAction::Delete);
    }

    #[tokio::test]
    async fn test_first_message_does_not_overwrite_admin_change() {
        let service = Arc::new(ModerationService::new(MockModerationStore::new()));
        service.store.config_gate.arm();

        let reader = {
            let service = service.clone();
            tokio::spawn(async move { service.process_message(&message(1, 7, "hello")).await })
        };
        // The message saw no config yet and is parked before creating one
        service.store.config_gate.reached.notified().await;

        service.set_warn_limit(GROUP, 1, 7).await.unwrap();
        service.store.config_gate.release.notify_one();
        reader.await.unwrap();

        let stored = service.store.configs.get(&GROUP).map(|c| c.warn_limit);
        assert_eq!(stored, Some(7));
    }

    #[tokio::test]
    async fn test_escalating_rule_validation_and_step_up() {
        let service = ModerationService::new(MockModerationStore::new());

        let mut to_reply = word_rule("spam", RuleAction::Delete);
        to_reply.escalation = Some(RuleEscalation {
            threshold: 3,
            within_secs: 600,
            action: RuleAction::Reply,
        });
        assert!(service.add_rule(GROUP, to_reply).await.is_err());

        let mut rule = word_rule("spam", RuleAction::Delete);
        rule.duration = Some(DurationSpec::from_secs(3600));
        rule.escalation = Some(RuleEscalation {
            threshold: 2,
            within_secs: 600,
            action: RuleAction::Mute,
        });
        service.add_rule(GROUP, rule).await.unwrap();

        let first = service.process_message(&message(1, 7, "spam")).await;
        assert_eq!(first.action, ModerationAction::Delete);
        let second = service.process_message(&message(2, 7, "spam")).await;
        assert_eq!(
            second.action,
            ModerationAction::Mute {
                duration: DurationSpec::from_secs(3600)
            }
        );
    }
}
