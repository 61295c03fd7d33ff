// Moderation domain models - data structures for the escalation policy.
//
// These are pure domain types with no Telegram dependencies.
// The Telegram layer converts messages into `MessageEvent`s and turns
// `ModerationAction`s back into Bot API calls.

use crate::core::duration::{DurationSpec, Expiry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

// ============================================================================
// INBOUND EVENTS
// ============================================================================

/// What kind of content a message carries. Used by media locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Photo,
    Video,
    Animation,
    Document,
    Sticker,
    Voice,
    Audio,
    VideoNote,
    Other,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Photo => "photo",
            MessageKind::Video => "video",
            MessageKind::Animation => "animation",
            MessageKind::Document => "document",
            MessageKind::Sticker => "sticker",
            MessageKind::Voice => "voice",
            MessageKind::Audio => "audio",
            MessageKind::VideoNote => "video_note",
            MessageKind::Other => "other",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "text" => Ok(MessageKind::Text),
            "photo" => Ok(MessageKind::Photo),
            "video" => Ok(MessageKind::Video),
            "animation" | "gif" => Ok(MessageKind::Animation),
            "document" => Ok(MessageKind::Document),
            "sticker" => Ok(MessageKind::Sticker),
            "voice" => Ok(MessageKind::Voice),
            "audio" => Ok(MessageKind::Audio),
            "video_note" => Ok(MessageKind::VideoNote),
            other => Err(format!("unknown message type '{}'", other)),
        }
    }
}

/// A group message as seen by the evaluator.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEvent {
    pub group_id: i64,
    pub user_id: u64,
    pub message_id: i32,
    /// Text or caption; empty for media without caption
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub kind: MessageKind,
    pub is_forward: bool,
}

// ============================================================================
// ACTIONS
// ============================================================================

/// What the action executor should do with a message and its sender.
#[derive(Debug, Clone, PartialEq)]
pub enum ModerationAction {
    /// Message is fine
    None,
    /// Delete the message without further action
    Delete,
    /// Delete the message and warn the sender
    Warn { count: u32, limit: u32 },
    /// Delete the message and restrict the sender
    Mute { duration: DurationSpec },
    /// Delete the message and ban the sender
    Ban { duration: DurationSpec },
    /// Leave the message alone and answer it
    Reply { text: String },
}

impl ModerationAction {
    pub fn label(&self) -> &'static str {
        match self {
            ModerationAction::None => "none",
            ModerationAction::Delete => "delete",
            ModerationAction::Warn { .. } => "warn",
            ModerationAction::Mute { .. } => "mute",
            ModerationAction::Ban { .. } => "ban",
            ModerationAction::Reply { .. } => "reply",
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, ModerationAction::None)
    }
}

/// Why an action was taken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Violation {
    /// Sender is still muted or banned
    Restricted,
    Flood { messages: usize, window_secs: u64 },
    /// Flooded again inside the cool-down
    RepeatFlood { messages: usize, window_secs: u64 },
    Lock { target: String },
    Link { host: String, category: LinkCategory },
    ContentRule { rule_id: i64 },
    /// Issued by an admin command
    Manual { reason: Option<String> },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::Restricted => write!(f, "Sender is restricted"),
            Violation::Flood {
                messages,
                window_secs,
            } => write!(f, "Flooding ({} messages in {}s)", messages, window_secs),
            Violation::RepeatFlood {
                messages,
                window_secs,
            } => write!(
                f,
                "Repeated flooding ({} messages in {}s)",
                messages, window_secs
            ),
            Violation::Lock { target } => write!(f, "{} is not allowed here", target),
            Violation::Link { host, .. } => write!(f, "Link to {} is not allowed", host),
            Violation::ContentRule { rule_id } => write!(f, "Matched content rule #{}", rule_id),
            Violation::Manual { reason: Some(r) } => write!(f, "{}", r),
            Violation::Manual { reason: None } => write!(f, "No reason given"),
        }
    }
}

/// Result of running a message through moderation.
#[derive(Debug, Clone, PartialEq)]
pub struct ModerationOutcome {
    pub action: ModerationAction,
    pub violation: Option<Violation>,
}

impl ModerationOutcome {
    /// Create a "no action" result
    pub fn ok() -> Self {
        Self {
            action: ModerationAction::None,
            violation: None,
        }
    }

    pub fn acted(action: ModerationAction, violation: Violation) -> Self {
        Self {
            action,
            violation: Some(violation),
        }
    }
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Action a content rule takes on match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Delete,
    Warn,
    Mute,
    Ban,
    Reply,
}

impl RuleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleAction::Delete => "delete",
            RuleAction::Warn => "warn",
            RuleAction::Mute => "mute",
            RuleAction::Ban => "ban",
            RuleAction::Reply => "reply",
        }
    }
}

impl fmt::Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "delete" => Ok(RuleAction::Delete),
            "warn" => Ok(RuleAction::Warn),
            "mute" => Ok(RuleAction::Mute),
            "ban" => Ok(RuleAction::Ban),
            "reply" => Ok(RuleAction::Reply),
            other => Err(format!("unknown rule action '{}'", other)),
        }
    }
}

/// Action used by link policy and locks. `Allow` means "let it through".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    Allow,
    Delete,
    Warn,
    Mute,
    Ban,
}

impl PolicyAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyAction::Allow => "allow",
            PolicyAction::Delete => "delete",
            PolicyAction::Warn => "warn",
            PolicyAction::Mute => "mute",
            PolicyAction::Ban => "ban",
        }
    }
}

impl fmt::Display for PolicyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "allow" => Ok(PolicyAction::Allow),
            "delete" => Ok(PolicyAction::Delete),
            "warn" => Ok(PolicyAction::Warn),
            "mute" => Ok(PolicyAction::Mute),
            "ban" => Ok(PolicyAction::Ban),
            other => Err(format!("unknown action '{}'", other)),
        }
    }
}

/// What happens on the first flood inside the cool-down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FloodAction {
    Warn,
    Mute,
}

impl FromStr for FloodAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "warn" => Ok(FloodAction::Warn),
            "mute" => Ok(FloodAction::Mute),
            other => Err(format!("flood action must be warn or mute, got '{}'", other)),
        }
    }
}

/// Link categories the policy can act on separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkCategory {
    /// t.me/joinchat and t.me/+ invite links
    Invites,
    /// Any other t.me / telegram.me link
    Telegram,
    /// URL shorteners
    Shorteners,
    Other,
}

impl fmt::Display for LinkCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkCategory::Invites => "invites",
            LinkCategory::Telegram => "telegram",
            LinkCategory::Shorteners => "shorteners",
            LinkCategory::Other => "other",
        };
        f.write_str(s)
    }
}

impl FromStr for LinkCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "invites" => Ok(LinkCategory::Invites),
            "telegram" => Ok(LinkCategory::Telegram),
            "shorteners" => Ok(LinkCategory::Shorteners),
            "other" => Ok(LinkCategory::Other),
            other => Err(format!("unknown link category '{}'", other)),
        }
    }
}

/// Hours during which every link is blocked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NightMode {
    pub from_hour: u32,
    pub to_hour: u32,
    /// IANA timezone name, e.g. "Europe/Berlin"
    pub timezone: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkPolicy {
    #[serde(default)]
    pub allowlist: Vec<String>,
    #[serde(default)]
    pub denylist: Vec<String>,
    #[serde(default)]
    pub block_all: bool,
    /// Action for denylisted links and for everything when `block_all` is set
    pub action: PolicyAction,
    #[serde(default)]
    pub categories: BTreeMap<LinkCategory, PolicyAction>,
    #[serde(default)]
    pub night_mode: Option<NightMode>,
}

impl Default for LinkPolicy {
    fn default() -> Self {
        Self {
            allowlist: Vec::new(),
            denylist: Vec::new(),
            block_all: false,
            action: PolicyAction::Delete,
            categories: BTreeMap::new(),
            night_mode: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockPolicy {
    #[serde(default)]
    pub forwards: Option<PolicyAction>,
    #[serde(default)]
    pub media: BTreeMap<MessageKind, PolicyAction>,
}

/// What a `/lock` command refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockTarget {
    Forwards,
    Media(MessageKind),
}

impl fmt::Display for LockTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockTarget::Forwards => f.write_str("forwards"),
            LockTarget::Media(kind) => write!(f, "{}", kind),
        }
    }
}

impl FromStr for LockTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        if s == "forwards" || s == "forward" {
            return Ok(LockTarget::Forwards);
        }
        match s.parse::<MessageKind>()? {
            MessageKind::Text | MessageKind::Other => {
                Err(format!("'{}' cannot be locked", s))
            }
            kind => Ok(LockTarget::Media(kind)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WelcomeSettings {
    pub enabled: bool,
    /// Supports {first_name} and {group_title}
    pub template: Option<String>,
}

impl Default for WelcomeSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            template: None,
        }
    }
}

impl WelcomeSettings {
    const DEFAULT_TEMPLATE: &'static str = "Welcome to {group_title}, {first_name}!";

    pub fn render(&self, first_name: &str, group_title: &str) -> String {
        self.template
            .as_deref()
            .unwrap_or(Self::DEFAULT_TEMPLATE)
            .replace("{first_name}", first_name)
            .replace("{group_title}", group_title)
    }
}

/// How new members prove they are human.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptchaMode {
    /// One "I'm human" button
    Button,
    /// Pick the sum of two digits out of three options
    Math,
}

impl FromStr for CaptchaMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "button" => Ok(CaptchaMode::Button),
            "math" => Ok(CaptchaMode::Math),
            other => Err(format!("captcha mode must be button or math, got '{}'", other)),
        }
    }
}

impl fmt::Display for CaptchaMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptchaMode::Button => f.write_str("button"),
            CaptchaMode::Math => f.write_str("math"),
        }
    }
}

/// Join challenge for new members. Off by default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptchaSettings {
    pub enabled: bool,
    pub mode: CaptchaMode,
    /// Unanswered challenges are kicked after this long
    pub timeout_secs: u64,
}

impl Default for CaptchaSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: CaptchaMode::Button,
            timeout_secs: 120,
        }
    }
}

/// What happens to join requests for groups that require approval.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JoinSettings {
    /// Approve every request after sending the rules
    pub auto_approve: bool,
    /// Approve only after the member accepts the rules in a private chat
    pub require_accept: bool,
}

/// Per-group moderation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupConfig {
    pub group_id: i64,
    /// Whether automatic moderation runs in this group
    pub enabled: bool,
    /// Sliding flood window in seconds
    pub flood_window_secs: u64,
    /// Messages allowed inside the window; one more is a flood
    pub flood_threshold: u32,
    /// A second flood inside this many seconds is a ban
    pub flood_cooldown_secs: u64,
    pub flood_action: FloodAction,
    pub mute_duration: DurationSpec,
    pub ban_duration: DurationSpec,
    /// Warnings before an automatic mute
    pub warn_limit: u32,
    pub link_policy: LinkPolicy,
    pub locks: LockPolicy,
    pub welcome: WelcomeSettings,
    pub rules_text: Option<String>,
    pub captcha: CaptchaSettings,
    pub onboarding: JoinSettings,
}

impl GroupConfig {
    pub fn new(group_id: i64) -> Self {
        Self {
            group_id,
            enabled: true,
            flood_window_secs: 5,    // 8 messages...
            flood_threshold: 8,      // ...in 5 seconds
            flood_cooldown_secs: 300, // second flood within 5 minutes is a ban
            flood_action: FloodAction::Warn,
            mute_duration: DurationSpec::from_secs(60),
            ban_duration: DurationSpec::from_secs(600),
            warn_limit: 3,
            link_policy: LinkPolicy::default(),
            locks: LockPolicy::default(),
            welcome: WelcomeSettings::default(),
            rules_text: None,
            captcha: CaptchaSettings::default(),
            onboarding: JoinSettings::default(),
        }
    }
}

/// How a rule pattern is matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    /// Case-insensitive substring
    Word,
    /// Case-insensitive regular expression
    Regex,
}

impl PatternKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternKind::Word => "word",
            PatternKind::Regex => "regex",
        }
    }
}

impl FromStr for PatternKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "word" => Ok(PatternKind::Word),
            "regex" => Ok(PatternKind::Regex),
            other => Err(format!("rule type must be word or regex, got '{}'", other)),
        }
    }
}

/// A stored content rule.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub id: i64,
    pub group_id: i64,
    pub kind: PatternKind,
    pub pattern: String,
    pub action: RuleAction,
    /// Overrides the group mute/ban duration
    pub duration: Option<DurationSpec>,
    pub reply_text: Option<String>,
    /// Lower runs first; ties keep insertion order
    pub priority: i64,
    pub escalation: Option<RuleEscalation>,
    pub created_by: u64,
    pub created_at: DateTime<Utc>,
}

/// A rule that has not been stored yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRule {
    pub kind: PatternKind,
    pub pattern: String,
    pub action: RuleAction,
    pub duration: Option<DurationSpec>,
    pub reply_text: Option<String>,
    pub priority: i64,
    pub escalation: Option<RuleEscalation>,
    pub created_by: u64,
}

/// Step a rule up to a harsher action when one user keeps hitting it.
///
/// `threshold` hits inside `within_secs` replace the rule's action with
/// `action` for that hit, after which the count starts over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleEscalation {
    pub threshold: u32,
    pub within_secs: u64,
    pub action: RuleAction,
}

// ============================================================================
// PER-USER STATE
// ============================================================================

/// A message counted by flood control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentMessage {
    pub message_id: i32,
    pub at: DateTime<Utc>,
}

/// Mutable counters for one user in one group.
#[derive(Debug, Clone, PartialEq)]
pub struct UserState {
    pub group_id: i64,
    pub user_id: u64,
    pub warn_count: u32,
    /// Oldest first, pruned to the flood window
    pub recent_messages: Vec<RecentMessage>,
    pub last_flood_at: Option<DateTime<Utc>>,
    pub muted_until: Option<Expiry>,
    pub banned_until: Option<Expiry>,
    /// Highest message id already evaluated; anything at or below is a replay
    pub last_message_id: Option<i32>,
    /// Recent hit times per escalating rule id
    pub rule_hits: BTreeMap<i64, Vec<DateTime<Utc>>>,
}

impl UserState {
    pub fn new(group_id: i64, user_id: u64) -> Self {
        Self {
            group_id,
            user_id,
            warn_count: 0,
            recent_messages: Vec::new(),
            last_flood_at: None,
            muted_until: None,
            banned_until: None,
            last_message_id: None,
            rule_hits: BTreeMap::new(),
        }
    }

    /// True if this message id was already evaluated for the user.
    pub fn has_seen(&self, message_id: i32) -> bool {
        self.last_message_id.is_some_and(|last| message_id <= last)
            || self.recent_messages.iter().any(|m| m.message_id == message_id)
    }

    pub fn is_muted(&self, now: DateTime<Utc>) -> bool {
        self.muted_until.is_some_and(|e| e.is_active(now))
    }

    pub fn is_banned(&self, now: DateTime<Utc>) -> bool {
        self.banned_until.is_some_and(|e| e.is_active(now))
    }

    pub fn is_restricted(&self, now: DateTime<Utc>) -> bool {
        self.is_muted(now) || self.is_banned(now)
    }

    /// Drop mute/ban expiries that have passed. Returns true if anything changed.
    pub fn clear_expired(&mut self, now: DateTime<Utc>) -> bool {
        let mut changed = false;
        if self.muted_until.is_some() && !self.is_muted(now) {
            self.muted_until = None;
            changed = true;
        }
        if self.banned_until.is_some() && !self.is_banned(now) {
            self.banned_until = None;
            changed = true;
        }
        changed
    }
}

// ============================================================================
// AUDIT
// ============================================================================

/// An entry in the append-only moderation log.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditRecord {
    pub id: i64,
    pub group_id: i64,
    /// `None` for actions the bot took on its own
    pub actor_id: Option<u64>,
    pub action: String,
    pub target_user_id: Option<u64>,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// An audit entry before the store assigns its id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAuditRecord {
    pub group_id: i64,
    pub actor_id: Option<u64>,
    pub action: String,
    pub target_user_id: Option<u64>,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
