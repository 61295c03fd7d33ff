// Join request onboarding: whether to approve, ask the member to accept
// the rules first, or leave the request to the admins.

use crate::core::moderation::JoinSettings;

/// Callback data prefix for the accept/decline buttons.
pub const JOIN_PREFIX: &str = "join:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinDecision {
    /// Send the rules privately with accept/decline buttons
    AskToAccept,
    /// Send the rules privately, then approve
    Approve,
    /// Leave the request for an admin
    Ignore,
}

/// Accepting the rules wins over auto-approval.
pub fn decide(settings: &JoinSettings) -> JoinDecision {
    if settings.require_accept {
        JoinDecision::AskToAccept
    } else if settings.auto_approve {
        JoinDecision::Approve
    } else {
        JoinDecision::Ignore
    }
}

/// A press on the accept/decline buttons sent with the rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinPress {
    pub accept: bool,
    pub group_id: i64,
    pub user_id: u64,
}

impl JoinPress {
    pub fn to_data(&self) -> String {
        let verb = if self.accept { "accept" } else { "decline" };
        format!("{}{}:{}:{}", JOIN_PREFIX, verb, self.group_id, self.user_id)
    }

    pub fn parse(data: &str) -> Option<Self> {
        let rest = data.strip_prefix(JOIN_PREFIX)?;
        let parts: Vec<&str> = rest.split(':').collect();
        let [verb, group, user] = parts.as_slice() else {
            return None;
        };
        let accept = match *verb {
            "accept" => true,
            "decline" => false,
            _ => return None,
        };
        Some(Self {
            accept,
            group_id: group.parse().ok()?,
            user_id: user.parse().ok()?,
        })
    }
}

/// The private message a joining member gets.
pub fn rules_message(group_title: &str, rules: Option<&str>, needs_accept: bool) -> String {
    let rules = rules.unwrap_or("Be kind, stay on topic and don't spam.");
    let mut text = format!("📜 Rules of {}:\n\n{}", group_title, rules);
    if needs_accept {
        text.push_str("\n\nPress Accept to join, or Decline to withdraw your request.");
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decide() {
        let mut settings = JoinSettings::default();
        assert_eq!(decide(&settings), JoinDecision::Ignore);

        settings.auto_approve = true;
        assert_eq!(decide(&settings), JoinDecision::Approve);

        settings.require_accept = true;
        assert_eq!(decide(&settings), JoinDecision::AskToAccept);
    }

    #[test]
    fn test_join_press_data() {
        let press = JoinPress {
            accept: false,
            group_id: -100,
            user_id: 5,
        };
        assert_eq!(press.to_data(), "join:decline:-100:5");
        assert_eq!(JoinPress::parse(&press.to_data()), Some(press));
        assert_eq!(JoinPress::parse("join:maybe:-100:5"), None);
        assert_eq!(JoinPress::parse("join:accept:-100"), None);
        assert_eq!(JoinPress::parse("captcha:ok:-100:5"), None);
    }

    #[test]
    fn test_rules_message() {
        let text = rules_message("Rustaceans", Some("No spam"), true);
        assert!(text.starts_with("📜 Rules of Rustaceans:\n\nNo spam"));
        assert!(text.contains("Accept"));
        assert!(!rules_message("x", None, false).contains("Accept"));
    }
}
