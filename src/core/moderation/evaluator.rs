// Escalation evaluator - decides what to do with one group message.
//
// `evaluate` is pure and synchronous: it takes the group config, the compiled
// rules and the sender's current state, and returns the action plus the next
// state. All time comes from the event. Persistence and locking live in
// `ModerationService`.

use super::link_policy;
use super::moderation_models::{
    FloodAction, GroupConfig, MessageEvent, ModerationAction, ModerationOutcome, PatternKind,
    PolicyAction, RecentMessage, Rule, RuleAction, UserState, Violation,
};
use crate::core::duration::DurationSpec;
use chrono::{DateTime, Duration, Utc};
use regex::{Regex, RegexBuilder};

/// Compiled regexes are capped so a hostile pattern can't eat memory.
const REGEX_SIZE_LIMIT: usize = 1 << 20;

// ============================================================================
// RULE SET
// ============================================================================

enum Matcher {
    /// Lowercased needle
    Word(String),
    Regex(Regex),
}

struct CompiledRule {
    rule: Rule,
    matcher: Matcher,
}

impl CompiledRule {
    fn matches(&self, text: &str, lowered: &str) -> bool {
        match &self.matcher {
            Matcher::Word(needle) => lowered.contains(needle.as_str()),
            Matcher::Regex(re) => re.is_match(text),
        }
    }
}

/// A group's content rules, sorted and compiled once.
#[derive(Default)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
}

impl RuleSet {
    /// Sort rules by (priority, id) and compile them. Rules whose regex does
    /// not compile are logged and left out.
    pub fn compile(mut rules: Vec<Rule>) -> Self {
        rules.sort_by_key(|r| (r.priority, r.id));

        let rules = rules
            .into_iter()
            .filter_map(|rule| match compile_pattern(rule.kind, &rule.pattern) {
                Ok(matcher) => Some(CompiledRule { rule, matcher }),
                Err(e) => {
                    tracing::warn!(
                        group_id = rule.group_id,
                        rule_id = rule.id,
                        error = %e,
                        "Skipping content rule with invalid regex"
                    );
                    None
                }
            })
            .collect();

        Self { rules }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// First rule matching `text`, in evaluation order.
    pub fn first_match(&self, text: &str) -> Option<&Rule> {
        if text.is_empty() {
            return None;
        }
        let lowered = text.to_lowercase();
        self.rules
            .iter()
            .find(|r| r.matches(text, &lowered))
            .map(|r| &r.rule)
    }
}

fn compile_pattern(kind: PatternKind, pattern: &str) -> Result<Matcher, regex::Error> {
    match kind {
        PatternKind::Word => Ok(Matcher::Word(pattern.to_lowercase())),
        PatternKind::Regex => RegexBuilder::new(pattern)
            .case_insensitive(true)
            .size_limit(REGEX_SIZE_LIMIT)
            .build()
            .map(Matcher::Regex),
    }
}

/// Check that a pattern compiles. Used before a rule is stored.
pub fn validate_pattern(kind: PatternKind, pattern: &str) -> Result<(), regex::Error> {
    compile_pattern(kind, pattern).map(|_| ())
}

// ============================================================================
// EVALUATION
// ============================================================================

/// The evaluator's answer: what to do and the sender's next state.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub outcome: ModerationOutcome,
    pub state: UserState,
}

/// Run one message through flood control, locks, link policy, content rules
/// and the warn limit, in that order. The first step that fires decides.
pub fn evaluate(
    config: &GroupConfig,
    rules: &RuleSet,
    state: &UserState,
    event: &MessageEvent,
) -> Evaluation {
    let unchanged = || Evaluation {
        outcome: ModerationOutcome::ok(),
        state: state.clone(),
    };

    if !config.enabled {
        return unchanged();
    }

    // Replayed delivery of a message we already evaluated
    if state.has_seen(event.message_id) {
        return unchanged();
    }

    let now = event.timestamp;
    let mut next = state.clone();
    next.last_message_id = Some(event.message_id);
    next.clear_expired(now);

    if next.is_restricted(now) {
        return Evaluation {
            outcome: ModerationOutcome::acted(ModerationAction::Delete, Violation::Restricted),
            state: next,
        };
    }

    let outcome = check_flood(config, &mut next, event)
        .or_else(|| check_locks(config, &mut next, event))
        .or_else(|| check_links(config, &mut next, event))
        .or_else(|| check_rules(config, rules, &mut next, event))
        .unwrap_or_else(ModerationOutcome::ok);

    Evaluation {
        outcome,
        state: next,
    }
}

fn check_flood(
    config: &GroupConfig,
    state: &mut UserState,
    event: &MessageEvent,
) -> Option<ModerationOutcome> {
    let now = event.timestamp;
    let window = seconds(config.flood_window_secs);

    state
        .recent_messages
        .retain(|m| now.signed_duration_since(m.at) <= window);
    state.recent_messages.push(RecentMessage {
        message_id: event.message_id,
        at: now,
    });

    // Only threshold + 1 entries can ever matter
    let cap = config.flood_threshold as usize + 1;
    if state.recent_messages.len() > cap {
        let excess = state.recent_messages.len() - cap;
        state.recent_messages.drain(..excess);
    }

    let messages = state.recent_messages.len();
    if messages <= config.flood_threshold as usize {
        return None;
    }

    let repeat = state
        .last_flood_at
        .is_some_and(|at| now.signed_duration_since(at) <= seconds(config.flood_cooldown_secs));
    state.recent_messages.clear();
    state.last_flood_at = Some(now);

    let window_secs = config.flood_window_secs;
    if repeat {
        let action = apply_ban(state, config.ban_duration, now);
        return Some(ModerationOutcome::acted(
            action,
            Violation::RepeatFlood {
                messages,
                window_secs,
            },
        ));
    }

    let action = match config.flood_action {
        FloodAction::Warn => apply_warn(state, config, now),
        FloodAction::Mute => apply_mute(state, config.mute_duration, now),
    };
    Some(ModerationOutcome::acted(
        action,
        Violation::Flood {
            messages,
            window_secs,
        },
    ))
}

fn check_locks(
    config: &GroupConfig,
    state: &mut UserState,
    event: &MessageEvent,
) -> Option<ModerationOutcome> {
    let locks = &config.locks;

    let (target, action) = match locks.forwards {
        Some(action) if event.is_forward && action != PolicyAction::Allow => {
            ("Forwarded messages".to_string(), action)
        }
        _ => {
            let action = locks.media.get(&event.kind).copied()?;
            if action == PolicyAction::Allow {
                return None;
            }
            (format!("Sending {}", event.kind), action)
        }
    };

    let action = apply_policy_action(state, config, action, event.timestamp);
    Some(ModerationOutcome::acted(action, Violation::Lock { target }))
}

fn check_links(
    config: &GroupConfig,
    state: &mut UserState,
    event: &MessageEvent,
) -> Option<ModerationOutcome> {
    let found = link_policy::check_links(&config.link_policy, &event.text, event.timestamp)?;
    let action = apply_policy_action(state, config, found.action, event.timestamp);
    Some(ModerationOutcome::acted(
        action,
        Violation::Link {
            host: found.host,
            category: found.category,
        },
    ))
}

fn check_rules(
    config: &GroupConfig,
    rules: &RuleSet,
    state: &mut UserState,
    event: &MessageEvent,
) -> Option<ModerationOutcome> {
    let rule = rules.first_match(&event.text)?;
    let now = event.timestamp;

    let rule_action = escalate(state, rule, now).unwrap_or(rule.action);
    let action = match rule_action {
        RuleAction::Delete => ModerationAction::Delete,
        RuleAction::Warn => apply_warn(state, config, now),
        RuleAction::Mute => apply_mute(state, rule.duration.unwrap_or(config.mute_duration), now),
        RuleAction::Ban => apply_ban(state, rule.duration.unwrap_or(config.ban_duration), now),
        RuleAction::Reply => ModerationAction::Reply {
            text: rule.reply_text.clone().unwrap_or_default(),
        },
    };

    Some(ModerationOutcome::acted(
        action,
        Violation::ContentRule { rule_id: rule.id },
    ))
}

/// Count a hit on a rule with escalation. Returns the harsher action once
/// the user reaches the threshold inside the window, and starts over.
fn escalate(state: &mut UserState, rule: &Rule, now: DateTime<Utc>) -> Option<RuleAction> {
    let escalation = rule.escalation?;
    let window = seconds(escalation.within_secs);

    let hits = state.rule_hits.entry(rule.id).or_default();
    hits.retain(|at| now.signed_duration_since(*at) <= window);
    hits.push(now);

    if hits.len() < escalation.threshold as usize {
        return None;
    }
    state.rule_hits.remove(&rule.id);
    Some(escalation.action)
}

fn apply_policy_action(
    state: &mut UserState,
    config: &GroupConfig,
    action: PolicyAction,
    now: DateTime<Utc>,
) -> ModerationAction {
    match action {
        PolicyAction::Allow => ModerationAction::None,
        PolicyAction::Delete => ModerationAction::Delete,
        PolicyAction::Warn => apply_warn(state, config, now),
        PolicyAction::Mute => apply_mute(state, config.mute_duration, now),
        PolicyAction::Ban => apply_ban(state, config.ban_duration, now),
    }
}

// ============================================================================
// STATE TRANSITIONS
// ============================================================================

/// Add a warning. Reaching the warn limit turns it into a mute.
pub fn apply_warn(
    state: &mut UserState,
    config: &GroupConfig,
    now: DateTime<Utc>,
) -> ModerationAction {
    state.warn_count = state.warn_count.saturating_add(1);
    if state.warn_count >= config.warn_limit {
        return apply_mute(state, config.mute_duration, now);
    }
    ModerationAction::Warn {
        count: state.warn_count,
        limit: config.warn_limit,
    }
}

/// Record a mute and reset warnings. Mutes past a year are permanent.
pub fn apply_mute(
    state: &mut UserState,
    duration: DurationSpec,
    now: DateTime<Utc>,
) -> ModerationAction {
    let duration = duration.for_restriction();
    state.muted_until = Some(duration.expiry_from(now));
    state.warn_count = 0;
    ModerationAction::Mute { duration }
}

/// Record a ban and reset warnings. Bans past a year are permanent.
pub fn apply_ban(
    state: &mut UserState,
    duration: DurationSpec,
    now: DateTime<Utc>,
) -> ModerationAction {
    let duration = duration.for_restriction();
    state.banned_until = Some(duration.expiry_from(now));
    state.warn_count = 0;
    ModerationAction::Ban { duration }
}

fn seconds(secs: u64) -> Duration {
    Duration::try_seconds(i64::try_from(secs).unwrap_or(i64::MAX)).unwrap_or(Duration::MAX)
}

// ============================================================================
// TESTS
// ============================================================================
