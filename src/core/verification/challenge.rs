// Join challenges: what a new member is asked and how their button press
// is encoded in callback data.

use crate::core::moderation::CaptchaMode;
use rand::Rng;
use std::collections::BTreeSet;

/// Callback data prefix for challenge buttons.
pub const CAPTCHA_PREFIX: &str = "captcha:";

/// A challenge as shown to one member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub prompt: String,
    /// Answer buttons for math challenges; empty for a single button
    pub options: Vec<u8>,
    pub answer: Option<u8>,
}

impl Challenge {
    pub fn new(mode: CaptchaMode, first_name: &str, rng: &mut impl Rng) -> Self {
        match mode {
            CaptchaMode::Button => Self {
                prompt: format!(
                    "👋 Welcome, {}! Press the button below within the time limit to start chatting.",
                    first_name
                ),
                options: Vec::new(),
                answer: None,
            },
            CaptchaMode::Math => {
                let a: u8 = rng.gen_range(1..=9);
                let b: u8 = rng.gen_range(1..=9);
                let answer = a + b;

                let mut options = BTreeSet::from([answer]);
                for _ in 0..2 {
                    options.insert(rng.gen_range(1..=18));
                }
                Self {
                    prompt: format!(
                        "👋 Welcome, {}! To start chatting, tap the answer: what is {} + {}?",
                        first_name, a, b
                    ),
                    options: options.into_iter().collect(),
                    answer: Some(answer),
                }
            }
        }
    }
}

/// A press on a challenge button.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptchaPress {
    pub group_id: i64,
    pub user_id: u64,
    /// The picked option; `None` for the single button
    pub choice: Option<u8>,
}

impl CaptchaPress {
    pub fn to_data(&self) -> String {
        match self.choice {
            Some(choice) => format!(
                "{}math:{}:{}:{}",
                CAPTCHA_PREFIX, self.group_id, self.user_id, choice
            ),
            None => format!("{}ok:{}:{}", CAPTCHA_PREFIX, self.group_id, self.user_id),
        }
    }

    pub fn parse(data: &str) -> Option<Self> {
        let rest = data.strip_prefix(CAPTCHA_PREFIX)?;
        let parts: Vec<&str> = rest.split(':').collect();
        let (group_id, user_id, choice) = match parts.as_slice() {
            ["ok", group, user] => (group, user, None),
            ["math", group, user, choice] => (group, user, Some(choice.parse::<u8>().ok()?)),
            _ => return None,
        };
        Some(Self {
            group_id: group_id.parse().ok()?,
            user_id: user_id.parse().ok()?,
            choice,
        })
    }
}

/// Whether a press answers the challenge. Any press passes a button
/// challenge; a math challenge needs the right option.
pub fn is_correct(answer: Option<u8>, choice: Option<u8>) -> bool {
    match answer {
        None => true,
        Some(answer) => choice == Some(answer),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_math_challenge_contains_answer() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let challenge = Challenge::new(CaptchaMode::Math, "Ana", &mut rng);
            let answer = challenge.answer.unwrap();
            assert!((2..=18).contains(&answer));
            assert!(challenge.options.contains(&answer));
            assert!(challenge.options.len() <= 3);
            assert!(challenge.options.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn test_button_challenge() {
        let mut rng = StdRng::seed_from_u64(1);
        let challenge = Challenge::new(CaptchaMode::Button, "Bo", &mut rng);
        assert_eq!(challenge.answer, None);
        assert!(challenge.options.is_empty());
        assert!(challenge.prompt.contains("Bo"));
    }

    #[test]
    fn test_press_data() {
        let press = CaptchaPress {
            group_id: -1001234567890,
            user_id: 42,
            choice: Some(12),
        };
        assert_eq!(press.to_data(), "captcha:math:-1001234567890:42:12");
        assert_eq!(CaptchaPress::parse(&press.to_data()), Some(press));
        assert!(press.to_data().len() <= 64);

        let button = CaptchaPress::parse("captcha:ok:-5:9").unwrap();
        assert_eq!(button.choice, None);

        assert_eq!(CaptchaPress::parse("panel:toggle:-5"), None);
        assert_eq!(CaptchaPress::parse("captcha:math:-5:9"), None);
        assert_eq!(CaptchaPress::parse("captcha:math:-5:9:x"), None);
    }

    #[test]
    fn test_is_correct() {
        assert!(is_correct(None, None));
        assert!(is_correct(Some(7), Some(7)));
        assert!(!is_correct(Some(7), Some(8)));
        assert!(!is_correct(Some(7), None));
    }
}
