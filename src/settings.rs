// Bot settings read from the environment (after `.env` is loaded).

use std::env;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_DATABASE_URL: &str = "sqlite://data/guard.db?mode=rwc";
const DEFAULT_SCHEDULER_TICK_SECS: u64 = 30;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
const DEFAULT_ADMIN_CACHE_TTL_SECS: u64 = 20;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} environment variable not set")]
    MissingEnvVar(&'static str),

    #[error("{name} has an invalid value '{value}'")]
    InvalidValue { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct BotSettings {
    pub bot_token: String,
    pub database_url: String,
    /// Users treated as admins in every group
    pub owner_ids: Vec<u64>,
    pub scheduler_tick: Duration,
    pub sweep_interval: Duration,
    pub admin_cache_ttl: Duration,
}

impl BotSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bot_token = lookup("TELOXIDE_TOKEN")
            .filter(|s| !s.trim().is_empty())
            .ok_or(ConfigError::MissingEnvVar("TELOXIDE_TOKEN"))?;

        let database_url = lookup("DATABASE_URL")
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());

        let owner_ids = match lookup("OWNER_IDS") {
            Some(raw) => parse_id_list(&raw).ok_or(ConfigError::InvalidValue {
                name: "OWNER_IDS",
                value: raw,
            })?,
            None => Vec::new(),
        };

        let secs = |name: &'static str, default: u64| -> Result<Duration, ConfigError> {
            match lookup(name) {
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .ok()
                    .filter(|s| *s > 0)
                    .map(Duration::from_secs)
                    .ok_or(ConfigError::InvalidValue { name, value: raw }),
                None => Ok(Duration::from_secs(default)),
            }
        };

        Ok(Self {
            bot_token,
            database_url,
            owner_ids,
            scheduler_tick: secs("SCHEDULER_TICK_SECS", DEFAULT_SCHEDULER_TICK_SECS)?,
            sweep_interval: secs("SWEEP_INTERVAL_SECS", DEFAULT_SWEEP_INTERVAL_SECS)?,
            admin_cache_ttl: secs("ADMIN_CACHE_TTL_SECS", DEFAULT_ADMIN_CACHE_TTL_SECS)?,
        })
    }
}

/// Parse "1, 2,3" into ids. Empty entries are ignored.
fn parse_id_list(raw: &str) -> Option<Vec<u64>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<u64>().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> Result<BotSettings, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        BotSettings::from_lookup(|name| map.get(name).cloned())
    }

    #[test]
    fn test_token_required() {
        assert_eq!(
            settings(&[]).unwrap_err(),
            ConfigError::MissingEnvVar("TELOXIDE_TOKEN")
        );
    }

    #[test]
    fn test_defaults() {
        let s = settings(&[("TELOXIDE_TOKEN", "123:abc")]).unwrap();
        assert_eq!(s.database_url, DEFAULT_DATABASE_URL);
        assert!(s.owner_ids.is_empty());
        assert_eq!(s.scheduler_tick, Duration::from_secs(30));
        assert_eq!(s.sweep_interval, Duration::from_secs(60));
        assert_eq!(s.admin_cache_ttl, Duration::from_secs(20));
    }

    #[test]
    fn test_owner_ids_and_overrides() {
        let s = settings(&[
            ("TELOXIDE_TOKEN", "123:abc"),
            ("OWNER_IDS", "11, 22,,33"),
            ("ADMIN_CACHE_TTL_SECS", "5"),
        ])
        .unwrap();
        assert_eq!(s.owner_ids, vec![11, 22, 33]);
        assert_eq!(s.admin_cache_ttl, Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            settings(&[("TELOXIDE_TOKEN", "x"), ("OWNER_IDS", "alice")]),
            Err(ConfigError::InvalidValue { name: "OWNER_IDS", .. })
        ));
        assert!(matches!(
            settings(&[("TELOXIDE_TOKEN", "x"), ("SWEEP_INTERVAL_SECS", "0")]),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
