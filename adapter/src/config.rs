//! Process settings for the demo binary.

use std::env;
use std::time::Duration;

/// Settings loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Name of the store the demo syncs
    pub store: String,
    /// Follow the change feed after the initial read
    pub listen: bool,
    /// Simulated latency of opening a store
    pub open_delay: Option<Duration>,
}

impl Settings {
    /// Load settings from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let store = lookup("DOCSYNC_STORE").unwrap_or_else(|| "todos".to_string());
        if store.trim().is_empty() {
            return Err(ConfigError::EmptyStoreName);
        }

        let listen = match lookup("DOCSYNC_LISTEN") {
            None => true,
            Some(value) => match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => return Err(ConfigError::InvalidListen(value)),
            },
        };

        let open_delay = lookup("DOCSYNC_OPEN_DELAY_MS")
            .map(|value| {
                value
                    .parse::<u64>()
                    .map(Duration::from_millis)
                    .map_err(|_| ConfigError::InvalidOpenDelay(value))
            })
            .transpose()?;

        Ok(Self {
            store,
            listen,
            open_delay,
        })
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("DOCSYNC_STORE must not be empty")]
    EmptyStoreName,

    #[error("Invalid DOCSYNC_LISTEN value: {0}")]
    InvalidListen(String),

    #[error("Invalid DOCSYNC_OPEN_DELAY_MS value: {0}")]
    InvalidOpenDelay(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> Result<Settings, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let settings = settings(&[]).unwrap();
        assert_eq!(settings.store, "todos");
        assert!(settings.listen);
        assert_eq!(settings.open_delay, None);
    }

    #[test]
    fn overrides() {
        let settings = settings(&[
            ("DOCSYNC_STORE", "notes"),
            ("DOCSYNC_LISTEN", "off"),
            ("DOCSYNC_OPEN_DELAY_MS", "250"),
        ])
        .unwrap();

        assert_eq!(settings.store, "notes");
        assert!(!settings.listen);
        assert_eq!(settings.open_delay, Some(Duration::from_millis(250)));
    }

    #[test]
    fn invalid_values() {
        assert!(matches!(
            settings(&[("DOCSYNC_LISTEN", "maybe")]),
            Err(ConfigError::InvalidListen(_))
        ));
        assert!(matches!(
            settings(&[("DOCSYNC_OPEN_DELAY_MS", "soon")]),
            Err(ConfigError::InvalidOpenDelay(_))
        ));
        assert!(matches!(
            settings(&[("DOCSYNC_STORE", " ")]),
            Err(ConfigError::EmptyStoreName)
        ));
    }
}
