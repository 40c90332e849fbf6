use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CallerError, CallerResult};

pub const SEARCH_ROOT_ENV: &str = "TPROUTE_SEARCH_ROOT";
pub const VALIDATION_INTERVAL_ENV: &str = "TPROUTE_VALIDATION_INTERVAL";
pub const TRANSACTION_STICKY_ENV: &str = "TPROUTE_TRANSACTION_STICKY";
pub const TOPOLOGY_CHANGED_DELAY_ENV: &str = "TPROUTE_TOPOLOGY_CHANGED_DELAY";

/// Router configuration.
///
/// Every field has a default, so an empty TOML document is a valid config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerConfig {
    /// Root under which pools are enumerated (default: `eis`).
    #[serde(default = "default_search_root")]
    pub search_root: String,
    /// Interval between pool validation passes in milliseconds (default: 5000).
    #[serde(default = "default_validation_interval_ms")]
    pub validation_interval_ms: u64,
    /// Pin each distributed transaction to one pool (default: false).
    #[serde(default)]
    pub transaction_sticky: bool,
    /// Delay before rediscovering a domain after a topology change, in
    /// milliseconds (default: 50).
    #[serde(default = "default_topology_change_delay_ms")]
    pub topology_change_delay_ms: u64,
    /// Maximum number of queued delayed tasks (default: 1024).
    #[serde(default = "default_scheduler_capacity")]
    pub scheduler_capacity: usize,
}

fn default_search_root() -> String {
    "eis".to_string()
}

fn default_validation_interval_ms() -> u64 {
    5000
}

fn default_topology_change_delay_ms() -> u64 {
    50
}

fn default_scheduler_capacity() -> usize {
    1024
}

impl Default for CallerConfig {
    fn default() -> Self {
        Self {
            search_root: default_search_root(),
            validation_interval_ms: default_validation_interval_ms(),
            transaction_sticky: false,
            topology_change_delay_ms: default_topology_change_delay_ms(),
            scheduler_capacity: default_scheduler_capacity(),
        }
    }
}

impl CallerConfig {
    /// Parse a TOML document and validate it.
    pub fn from_toml_str(s: &str) -> CallerResult<Self> {
        let config: CallerConfig =
            toml::from_str(s).map_err(|e| CallerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by any `TPROUTE_*` environment variables that are set.
    pub fn from_env() -> CallerResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> CallerResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = CallerConfig::default();
        if let Some(root) = lookup(SEARCH_ROOT_ENV) {
            config.search_root = root;
        }
        if let Some(v) = lookup(VALIDATION_INTERVAL_ENV) {
            config.validation_interval_ms = parse_env(VALIDATION_INTERVAL_ENV, &v)?;
        }
        if let Some(v) = lookup(TRANSACTION_STICKY_ENV) {
            config.transaction_sticky = parse_env(TRANSACTION_STICKY_ENV, &v.to_ascii_lowercase())?;
        }
        if let Some(v) = lookup(TOPOLOGY_CHANGED_DELAY_ENV) {
            config.topology_change_delay_ms = parse_env(TOPOLOGY_CHANGED_DELAY_ENV, &v)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CallerResult<()> {
        if self.validation_interval_ms == 0 {
            return Err(CallerError::Config(
                "validation_interval_ms must be greater than 0".into(),
            ));
        }
        if self.scheduler_capacity == 0 {
            return Err(CallerError::Config(
                "scheduler_capacity must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    pub fn validation_interval(&self) -> Duration {
        Duration::from_millis(self.validation_interval_ms)
    }

    pub fn topology_change_delay(&self) -> Duration {
        Duration::from_millis(self.topology_change_delay_ms)
    }
}

fn parse_env<T>(key: &str, value: &str) -> CallerResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| CallerError::Config(format!("{key}={value}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let c = CallerConfig::default();
        assert_eq!(c.search_root, "eis");
        assert_eq!(c.validation_interval_ms, 5000);
        assert!(!c.transaction_sticky);
        assert_eq!(c.topology_change_delay_ms, 50);
        assert_eq!(c.topology_change_delay(), Duration::from_millis(50));
    }

    #[test]
    fn test_empty_toml_is_default() {
        let c = CallerConfig::from_toml_str("").unwrap();
        assert_eq!(c, CallerConfig::default());
    }

    #[test]
    fn test_toml_overrides() {
        let c = CallerConfig::from_toml_str(
            r#"
            search_root = "eis/casual"
            transaction_sticky = true
            validation_interval_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(c.search_root, "eis/casual");
        assert!(c.transaction_sticky);
        assert_eq!(c.validation_interval_ms, 250);
        assert_eq!(c.topology_change_delay_ms, 50);
    }

    #[test]
    fn test_toml_rejects_zero_interval() {
        let err = CallerConfig::from_toml_str("validation_interval_ms = 0").unwrap_err();
        assert!(err.is_user_error());
    }

    #[test]
    fn test_env_lookup() {
        let vars: HashMap<&str, &str> = [
            (SEARCH_ROOT_ENV, "pools"),
            (TRANSACTION_STICKY_ENV, "TRUE"),
            (TOPOLOGY_CHANGED_DELAY_ENV, "10"),
        ]
        .into_iter()
        .collect();
        let c = CallerConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(c.search_root, "pools");
        assert!(c.transaction_sticky);
        assert_eq!(c.topology_change_delay_ms, 10);
        assert_eq!(c.validation_interval_ms, 5000);
    }

    #[test]
    fn test_env_malformed_value() {
        let err = CallerConfig::from_lookup(|k| {
            (k == VALIDATION_INTERVAL_ENV).then(|| "soon".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains(VALIDATION_INTERVAL_ENV));
    }
}
