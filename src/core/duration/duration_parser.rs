// Compact duration parsing shared by moderation and scheduling.
//
// Admins type durations like "30s", "10m", "2h", "3d" or "perm". The same
// compact form is what we write back into config rows, so a stored value
// always parses again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Words that mean "no expiry".
const PERMANENT_WORDS: [&str; 3] = ["perm", "permanent", "forever"];

/// Longest timed restriction Telegram honours; anything longer is forever.
pub const MAX_RESTRICTION_SECS: u64 = 365 * 86400;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid duration '{0}'. Use 30s, 10m, 2h, 3d, or perm")]
pub struct InvalidDuration(pub String);

/// How long a mute or ban lasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DurationSpec {
    For(Duration),
    /// The no-expiry sentinel
    Permanent,
}

impl DurationSpec {
    pub fn from_secs(secs: u64) -> Self {
        DurationSpec::For(Duration::from_secs(secs))
    }

    pub fn as_secs(&self) -> Option<u64> {
        match self {
            DurationSpec::For(d) => Some(d.as_secs()),
            DurationSpec::Permanent => None,
        }
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, DurationSpec::Permanent)
    }

    /// The duration a mute or ban really lasts on Telegram.
    pub fn for_restriction(self) -> Self {
        match self.as_secs() {
            Some(secs) if secs > MAX_RESTRICTION_SECS => DurationSpec::Permanent,
            _ => self,
        }
    }

    /// The expiry this duration produces when applied at `now`.
    pub fn expiry_from(&self, now: DateTime<Utc>) -> Expiry {
        match self {
            DurationSpec::For(d) => {
                let secs = i64::try_from(d.as_secs()).unwrap_or(i64::MAX);
                match chrono::Duration::try_seconds(secs).and_then(|d| now.checked_add_signed(d)) {
                    Some(at) => Expiry::At(at),
                    None => Expiry::Never,
                }
            }
            DurationSpec::Permanent => Expiry::Never,
        }
    }
}

impl fmt::Display for DurationSpec {
    /// Writes the compact form using the largest unit that divides evenly.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = match self {
            DurationSpec::Permanent => return write!(f, "perm"),
            DurationSpec::For(d) => d.as_secs(),
        };
        if secs != 0 && secs % 86400 == 0 {
            write!(f, "{}d", secs / 86400)
        } else if secs != 0 && secs % 3600 == 0 {
            write!(f, "{}h", secs / 3600)
        } else if secs != 0 && secs % 60 == 0 {
            write!(f, "{}m", secs / 60)
        } else {
            write!(f, "{}s", secs)
        }
    }
}

impl TryFrom<String> for DurationSpec {
    type Error = InvalidDuration;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        parse_duration(&value)
    }
}

impl From<DurationSpec> for String {
    fn from(value: DurationSpec) -> Self {
        value.to_string()
    }
}

/// When a mute or ban ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expiry {
    At(DateTime<Utc>),
    Never,
}

impl Expiry {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        match self {
            Expiry::At(at) => now < *at,
            Expiry::Never => true,
        }
    }

    /// Timestamp to hand to the Bot API; `None` means forever.
    pub fn until(&self) -> Option<DateTime<Utc>> {
        match self {
            Expiry::At(at) => Some(*at),
            Expiry::Never => None,
        }
    }
}

/// Parse a compact duration like "30s", "10m", "2h", "3d" or "perm".
pub fn parse_duration(input: &str) -> Result<DurationSpec, InvalidDuration> {
    let normalized = input.trim().to_lowercase();

    if PERMANENT_WORDS.contains(&normalized.as_str()) {
        return Ok(DurationSpec::Permanent);
    }

    parse_compact_format(&normalized)
        .map(DurationSpec::For)
        .ok_or_else(|| InvalidDuration(input.trim().to_string()))
}

/// Parse "<digits><unit>" where unit is one of s, m, h, d.
fn parse_compact_format(input: &str) -> Option<Duration> {
    let unit = input.chars().last()?;
    let multiplier: u64 = match unit {
        's' => 1,
        'm' => 60,
        'h' => 3600,
        'd' => 86400,
        _ => return None,
    };

    // The unit is ASCII, so slicing off one byte is safe.
    let num_str = &input[..input.len() - 1];
    if num_str.is_empty() || !num_str.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let number: u64 = num_str.parse().ok()?;
    if number == 0 {
        return None;
    }

    number.checked_mul(multiplier).map(Duration::from_secs)
}

/// Format a duration for chat messages ("2 hours", "permanently").
pub fn format_duration(spec: &DurationSpec) -> String {
    let total_secs = match spec {
        DurationSpec::Permanent => return "permanently".to_string(),
        DurationSpec::For(d) => d.as_secs(),
    };

    let plural = |n: u64| if n == 1 { "" } else { "s" };

    if total_secs < 60 {
        format!("{} second{}", total_secs, plural(total_secs))
    } else if total_secs < 3600 {
        let mins = total_secs / 60;
        format!("{} minute{}", mins, plural(mins))
    } else if total_secs < 86400 {
        let hours = total_secs / 3600;
        let mins = (total_secs % 3600) / 60;
        if mins > 0 {
            format!(
                "{} hour{} and {} minute{}",
                hours,
                plural(hours),
                mins,
                plural(mins)
            )
        } else {
            format!("{} hour{}", hours, plural(hours))
        }
    } else {
        let days = total_secs / 86400;
        let hours = (total_secs % 86400) / 3600;
        if hours > 0 {
            format!(
                "{} day{} and {} hour{}",
                days,
                plural(days),
                hours,
                plural(hours)
            )
        } else {
            format!("{} day{}", days, plural(days))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_each_unit() {
        assert_eq!(parse_duration("30s"), Ok(DurationSpec::from_secs(30)));
        assert_eq!(parse_duration("10m"), Ok(DurationSpec::from_secs(600)));
        assert_eq!(parse_duration("2h"), Ok(DurationSpec::from_secs(7200)));
        assert_eq!(parse_duration("3d"), Ok(DurationSpec::from_secs(259_200)));
    }

    #[test]
    fn test_two_hours_is_7200_seconds() {
        let spec = parse_duration("2h").unwrap();
        assert_eq!(spec.as_secs(), Some(7200));
    }

    #[test]
    fn test_permanent_sentinel() {
        assert_eq!(parse_duration("perm"), Ok(DurationSpec::Permanent));
        assert_eq!(parse_duration(" Forever "), Ok(DurationSpec::Permanent));
        assert_eq!(parse_duration("permanent"), Ok(DurationSpec::Permanent));
        assert!(parse_duration("perm").unwrap().is_permanent());
    }

    #[test]
    fn test_restrictions_past_a_year_are_forever() {
        assert_eq!(
            DurationSpec::from_secs(MAX_RESTRICTION_SECS).for_restriction(),
            DurationSpec::from_secs(MAX_RESTRICTION_SECS)
        );
        assert_eq!(parse_duration("400d").unwrap().for_restriction(), DurationSpec::Permanent);
        assert_eq!(DurationSpec::Permanent.for_restriction(), DurationSpec::Permanent);
    }

    #[test]
    fn test_rejects_garbage() {
        assert_eq!(parse_duration("abc"), Err(InvalidDuration("abc".to_string())));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("h").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("10w").is_err());
        assert!(parse_duration("-5m").is_err());
        assert!(parse_duration("1.5h").is_err());
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("99999999999999999999d").is_err());
    }

    #[test]
    fn test_case_and_whitespace_insensitive() {
        assert_eq!(parse_duration("  15M "), Ok(DurationSpec::from_secs(900)));
    }

    #[test]
    fn test_display_roundtrips_through_parser() {
        for raw in ["45s", "90s", "5m", "2h", "3d", "perm"] {
            let spec = parse_duration(raw).unwrap();
            assert_eq!(parse_duration(&spec.to_string()).unwrap(), spec);
        }
        assert_eq!(DurationSpec::from_secs(7200).to_string(), "2h");
        assert_eq!(DurationSpec::from_secs(90).to_string(), "90s");
    }

    #[test]
    fn test_serde_uses_compact_form() {
        let json = serde_json::to_string(&DurationSpec::from_secs(600)).unwrap();
        assert_eq!(json, "\"10m\"");
        let back: DurationSpec = serde_json::from_str("\"perm\"").unwrap();
        assert_eq!(back, DurationSpec::Permanent);
        assert!(serde_json::from_str::<DurationSpec>("\"soon\"").is_err());
    }

    #[test]
    fn test_expiry_activity() {
        let now = Utc::now();
        let expiry = DurationSpec::from_secs(60).expiry_from(now);
        assert!(expiry.is_active(now));
        assert!(!expiry.is_active(now + chrono::Duration::seconds(61)));
        assert!(DurationSpec::Permanent.expiry_from(now).is_active(now));
        assert_eq!(Expiry::Never.until(), None);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(&DurationSpec::from_secs(1)), "1 second");
        assert_eq!(format_duration(&DurationSpec::from_secs(600)), "10 minutes");
        assert_eq!(
            format_duration(&DurationSpec::from_secs(5400)),
            "1 hour and 30 minutes"
        );
        assert_eq!(format_duration(&DurationSpec::from_secs(172_800)), "2 days");
        assert_eq!(format_duration(&DurationSpec::Permanent), "permanently");
    }
}
