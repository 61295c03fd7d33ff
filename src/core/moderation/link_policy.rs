// Link detection and link policy matching.
//
// Pure functions over message text and a `LinkPolicy`. The evaluator calls
// `check_links`; the service uses `normalize_domain` and `parse_timezone`
// to validate admin input before it is stored.

use super::moderation_models::{LinkCategory, LinkPolicy, NightMode, PolicyAction};
use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;
use regex::Regex;
use std::sync::OnceLock;

const SHORTENERS: [&str; 9] = [
    "bit.ly",
    "tinyurl.com",
    "t.co",
    "goo.gl",
    "is.gd",
    "ow.ly",
    "rebrand.ly",
    "buff.ly",
    "bit.do",
];

const TELEGRAM_HOSTS: [&str; 2] = ["t.me", "telegram.me"];

fn url_regex() -> &'static Regex {
    static URL_RE: OnceLock<Regex> = OnceLock::new();
    URL_RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:(?:https?|tg)://|(?:t|telegram)\.me/)\S+")
            .expect("URL pattern is a valid regex")
    })
}

/// A link found in a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub url: String,
    pub host: String,
    pub path: String,
}

/// The policy decision for the first offending link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkMatch {
    pub host: String,
    pub category: LinkCategory,
    /// Never `PolicyAction::Allow`
    pub action: PolicyAction,
}

/// Find every http(s)/tg link in `text`, plus bare t.me links.
pub fn extract_links(text: &str) -> Vec<Link> {
    url_regex()
        .find_iter(text)
        .map(|m| parse_link(m.as_str()))
        .collect()
}

fn parse_link(raw: &str) -> Link {
    let lower = raw.to_lowercase();
    let rest = match lower.find("://") {
        Some(idx) => &lower[idx + 3..],
        None => lower.as_str(),
    };

    let authority_end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let authority = &rest[..authority_end];
    // Drop userinfo
    let authority = authority.rsplit('@').next().unwrap_or(authority);

    let host: String = authority
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '.')
        .collect();
    let host = host.trim_end_matches('.').to_string();

    let path = rest[authority_end..]
        .split(['?', '#'])
        .next()
        .unwrap_or("")
        .to_string();

    Link {
        url: raw.to_string(),
        host,
        path,
    }
}

/// Sort a link into one of the policy categories.
pub fn classify(link: &Link) -> LinkCategory {
    if link.url.to_lowercase().starts_with("tg://join") {
        return LinkCategory::Invites;
    }
    if TELEGRAM_HOSTS.contains(&link.host.as_str()) {
        if link.path.starts_with("/joinchat") || link.path.starts_with("/+") {
            return LinkCategory::Invites;
        }
        return LinkCategory::Telegram;
    }
    if SHORTENERS.contains(&link.host.as_str()) {
        return LinkCategory::Shorteners;
    }
    LinkCategory::Other
}

/// A host matches a listed domain when the host itself or its last two
/// labels equal it.
pub fn domain_listed(host: &str, domains: &[String]) -> bool {
    let labels: Vec<&str> = host.split('.').collect();
    let registrable = if labels.len() >= 2 {
        Some(labels[labels.len() - 2..].join("."))
    } else {
        None
    };

    domains.iter().any(|d| {
        let d = d.to_lowercase();
        d == host || registrable.as_deref() == Some(d.as_str())
    })
}

/// Look up an IANA timezone name.
pub fn parse_timezone(name: &str) -> Option<Tz> {
    name.trim().parse::<Tz>().ok()
}

/// Whether `now` falls inside the night-mode window. The window may wrap
/// midnight (e.g. 22 to 6). An unknown timezone is treated as UTC.
pub fn is_night(night: &NightMode, now: DateTime<Utc>) -> bool {
    let hour = match parse_timezone(&night.timezone) {
        Some(tz) => now.with_timezone(&tz).hour(),
        None => {
            tracing::warn!(timezone = %night.timezone, "Unknown night mode timezone, using UTC");
            now.hour()
        }
    };

    let from = night.from_hour % 24;
    let to = night.to_hour % 24;
    if from <= to {
        from <= hour && hour < to
    } else {
        hour >= from || hour < to
    }
}

/// Decide what to do about the links in `text`.
///
/// Links are checked in order. Allowlisted hosts are skipped. A category
/// action wins over the denylist; otherwise a denylisted host, or any host
/// while links are blocked, gets the policy's default action.
pub fn check_links(policy: &LinkPolicy, text: &str, now: DateTime<Utc>) -> Option<LinkMatch> {
    let links = extract_links(text);
    if links.is_empty() {
        return None;
    }

    let block_all = policy.block_all
        || policy
            .night_mode
            .as_ref()
            .is_some_and(|night| is_night(night, now));

    for link in links {
        if link.host.is_empty() && !link.url.to_lowercase().starts_with("tg://") {
            continue;
        }
        if domain_listed(&link.host, &policy.allowlist) {
            continue;
        }

        let category = classify(&link);
        let action = match policy.categories.get(&category) {
            Some(PolicyAction::Allow) => continue,
            Some(action) => *action,
            None if block_all || domain_listed(&link.host, &policy.denylist) => policy.action,
            None => continue,
        };

        return Some(LinkMatch {
            host: link.host,
            category,
            action,
        });
    }

    None
}

/// Reduce admin input ("https://www.Example.com/x") to a bare domain.
pub fn normalize_domain(input: &str) -> Option<String> {
    let link = parse_link(input.trim());
    let host = link.host.strip_prefix("www.").unwrap_or(&link.host).to_string();

    let valid = host.contains('.')
        && !host.starts_with('.')
        && host.split('.').all(|label| !label.is_empty());
    valid.then_some(host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at_hour(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, hour, 30, 0).unwrap()
    }

    #[test]
    fn test_extract_links() {
        let links = extract_links("see https://Example.com/a?b=1 and t.me/+abc, not example.org");
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].host, "example.com");
        assert_eq!(links[0].path, "/a");
        assert_eq!(links[1].host, "t.me");
        assert_eq!(links[1].path, "/+abc,");
    }

    #[test]
    fn test_classify_categories() {
        let cat = |url: &str| classify(&extract_links(url)[0]);
        assert_eq!(cat("https://t.me/joinchat/xyz"), LinkCategory::Invites);
        assert_eq!(cat("https://t.me/+xyz"), LinkCategory::Invites);
        assert_eq!(cat("tg://join?invite=xyz"), LinkCategory::Invites);
        assert_eq!(cat("https://telegram.me/somechannel"), LinkCategory::Telegram);
        assert_eq!(cat("https://bit.ly/3abc"), LinkCategory::Shorteners);
        assert_eq!(cat("https://docs.rs/regex"), LinkCategory::Other);
    }

    #[test]
    fn test_domain_listed_matches_last_two_labels() {
        let list = vec!["example.com".to_string()];
        assert!(domain_listed("example.com", &list));
        assert!(domain_listed("cdn.example.com", &list));
        assert!(!domain_listed("example.org", &list));
        assert!(!domain_listed("notexample.com", &list));
    }

    #[test]
    fn test_denylist_uses_default_action() {
        let policy = LinkPolicy {
            denylist: vec!["spam.io".to_string()],
            action: PolicyAction::Warn,
            ..Default::default()
        };
        let found = check_links(&policy, "buy at https://shop.spam.io now", at_hour(12)).unwrap();
        assert_eq!(found.action, PolicyAction::Warn);
        assert_eq!(found.host, "shop.spam.io");

        assert_eq!(check_links(&policy, "https://rust-lang.org", at_hour(12)), None);
    }

    #[test]
    fn test_allowlist_beats_block_all() {
        let policy = LinkPolicy {
            allowlist: vec!["rust-lang.org".to_string()],
            block_all: true,
            ..Default::default()
        };
        assert_eq!(check_links(&policy, "https://www.rust-lang.org/learn", at_hour(12)), None);

        let found = check_links(&policy, "https://example.com", at_hour(12)).unwrap();
        assert_eq!(found.action, PolicyAction::Delete);
    }

    #[test]
    fn test_category_action_and_allow() {
        let mut policy = LinkPolicy::default();
        policy.categories.insert(LinkCategory::Invites, PolicyAction::Ban);
        policy.categories.insert(LinkCategory::Telegram, PolicyAction::Allow);
        policy.block_all = true;

        let found = check_links(&policy, "join https://t.me/+secret", at_hour(12)).unwrap();
        assert_eq!(found.category, LinkCategory::Invites);
        assert_eq!(found.action, PolicyAction::Ban);

        assert_eq!(check_links(&policy, "https://t.me/rustlang", at_hour(12)), None);

        // An allowed link does not stop the scan
        let mixed = "https://t.me/rustlang then https://t.me/+secret";
        let found = check_links(&policy, mixed, at_hour(12)).unwrap();
        assert_eq!(found.category, LinkCategory::Invites);
    }

    #[test]
    fn test_night_mode_blocks_links() {
        let policy = LinkPolicy {
            night_mode: Some(NightMode {
                from_hour: 22,
                to_hour: 6,
                timezone: "UTC".to_string(),
            }),
            ..Default::default()
        };
        assert!(check_links(&policy, "https://example.com", at_hour(23)).is_some());
        assert!(check_links(&policy, "https://example.com", at_hour(3)).is_some());
        assert!(check_links(&policy, "https://example.com", at_hour(12)).is_none());
    }

    #[test]
    fn test_night_mode_respects_timezone() {
        let night = NightMode {
            from_hour: 0,
            to_hour: 6,
            timezone: "Asia/Tokyo".to_string(),
        };
        // 18:30 UTC is 03:30 in Tokyo
        assert!(is_night(&night, at_hour(18)));
        assert!(!is_night(&night, at_hour(3)));
    }

    #[test]
    fn test_normalize_domain() {
        assert_eq!(
            normalize_domain("https://www.Example.com/path"),
            Some("example.com".to_string())
        );
        assert_eq!(normalize_domain("spam.io"), Some("spam.io".to_string()));
        assert_eq!(normalize_domain("localhost"), None);
        assert_eq!(normalize_domain(""), None);
    }
}
