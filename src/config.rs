//! Runtime configuration.
//!
//! Broker credentials come from the environment (a `.env` file is loaded at startup)
//! and are mandatory: a missing value is reported as a [`ConfigError`] and the views
//! mount in a blocking configuration-error state instead of aborting the process.
//!
//! Connection tuning lives in an optional TOML file. A missing file yields the
//! defaults, a malformed one is an error.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::mqtt::config::TopicNames;
use crate::sync::decoder::InboundPolicy;

pub const BROKER_URL_VAR: &str = "VFD_MQTT_BROKER_URL";
pub const USERNAME_VAR: &str = "VFD_MQTT_USERNAME";
pub const PASSWORD_VAR: &str = "VFD_MQTT_PASSWORD";
pub const SETTINGS_PATH_VAR: &str = "VFDCONTROL_SETTINGS";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing {0} environment variable.")]
    MissingVariable(&'static str),

    #[error("Invalid broker URL '{url}': {reason}")]
    InvalidBrokerUrl { url: String, reason: String },

    #[error("Failed to read settings file {path:?}: {source}")]
    SettingsIo {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse settings file {path:?}: {source}")]
    SettingsParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid setting: {0}")]
    InvalidSetting(String),
}

/// Plaintext broker credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct BrokerCredentials {
    pub url: String,
    pub username: String,
    pub password: String,
}

impl BrokerCredentials {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads the three required variables through `lookup`. Empty values count as
    /// missing. Variables are checked in URL, username, password order so the first
    /// missing one is reported.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &'static str| {
            lookup(name)
                .filter(|value| !value.trim().is_empty())
                .ok_or(ConfigError::MissingVariable(name))
        };

        Ok(Self {
            url: required(BROKER_URL_VAR)?.trim().to_string(),
            username: required(USERNAME_VAR)?.trim().to_string(),
            password: required(PASSWORD_VAR)?,
        })
    }
}

impl fmt::Debug for BrokerCredentials {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BrokerCredentials")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl fmt::Display for BrokerCredentials {
    /// `user@url`, never the password.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{}", self.username, self.url)
    }
}

/// Tunables read from `settings.toml`.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Prefix of the MQTT client id; the process id is appended.
    pub client_id: String,
    pub keep_alive_secs: u64,
    /// Fixed delay between reconnect attempts.
    pub reconnect_period_secs: u64,
    pub channel_capacity: usize,
    /// Maximum number of retained log lines, oldest evicted first.
    pub log_capacity: usize,
    pub inbound_policy: InboundPolicy,
    pub topics: TopicNames,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            client_id: "vfdcontrol".to_string(),
            keep_alive_secs: 5,
            reconnect_period_secs: 5,
            channel_capacity: 100,
            log_capacity: 1000,
            inbound_policy: InboundPolicy::default(),
            topics: TopicNames::default(),
        }
    }
}

impl Settings {
    /// Loads settings from `$VFDCONTROL_SETTINGS` or the platform config directory.
    pub fn load() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) => Self::load_from(&path),
            None => {
                info!("No configuration directory available, using default settings");
                Ok(Self::default())
            }
        }
    }

    pub fn default_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(SETTINGS_PATH_VAR) {
            return Some(PathBuf::from(path));
        }
        dirs::config_dir().map(|dir| dir.join("vfdcontrol").join("settings.toml"))
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            info!("No settings file at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|source| ConfigError::SettingsIo {
            path: path.to_path_buf(),
            source,
        })?;
        let settings: Settings =
            toml::from_str(&content).map_err(|source| ConfigError::SettingsParse {
                path: path.to_path_buf(),
                source,
            })?;
        settings.validate()?;

        debug!("Loaded settings from {:?}: {:?}", path, settings);
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client_id.trim().is_empty() {
            return Err(ConfigError::InvalidSetting(
                "client_id must not be empty".to_string(),
            ));
        }
        if self.log_capacity == 0 {
            return Err(ConfigError::InvalidSetting(
                "log_capacity must be at least 1".to_string(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::InvalidSetting(
                "channel_capacity must be at least 1".to_string(),
            ));
        }
        if self.reconnect_period_secs == 0 {
            return Err(ConfigError::InvalidSetting(
                "reconnect_period_secs must be at least 1".to_string(),
            ));
        }
        if self.topics.iter().any(|topic| topic.trim().is_empty()) {
            return Err(ConfigError::InvalidSetting(
                "topic names must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn reads_all_credentials() {
        let creds = BrokerCredentials::from_lookup(lookup_from(&[
            (BROKER_URL_VAR, "wss://broker:8884/mqtt"),
            (USERNAME_VAR, "operator"),
            (PASSWORD_VAR, "hunter2"),
        ]))
        .unwrap();

        assert_eq!(creds.url, "wss://broker:8884/mqtt");
        assert_eq!(creds.username, "operator");
        assert_eq!(creds.password, "hunter2");
        assert_eq!(creds.to_string(), "operator@wss://broker:8884/mqtt");
        assert!(!format!("{:?}", creds).contains("hunter2"));
    }

    #[test]
    fn reports_first_missing_variable() {
        let err = BrokerCredentials::from_lookup(lookup_from(&[(USERNAME_VAR, "operator")]))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Missing VFD_MQTT_BROKER_URL environment variable."
        );

        let err = BrokerCredentials::from_lookup(lookup_from(&[
            (BROKER_URL_VAR, "mqtt://broker"),
            (USERNAME_VAR, "operator"),
            (PASSWORD_VAR, ""),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingVariable(PASSWORD_VAR)));
    }

    #[test]
    fn missing_settings_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn partial_settings_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(
            file,
            "log_capacity = 50\ninbound_policy = \"reject\"\n\n[topics]\nstatus = \"plant/vfd/status\""
        )
        .unwrap();

        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(settings.log_capacity, 50);
        assert_eq!(settings.inbound_policy, InboundPolicy::Reject);
        assert_eq!(settings.topics.status, "plant/vfd/status");
        assert_eq!(settings.topics.logs, "vfd/logs");
        assert_eq!(settings.keep_alive_secs, 5);
    }

    #[test]
    fn rejects_zero_log_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        fs::write(&path, "log_capacity = 0\n").unwrap();

        assert!(matches!(
            Settings::load_from(&path),
            Err(ConfigError::InvalidSetting(_))
        ));
    }

    #[test]
    fn reports_malformed_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        fs::write(&path, "log_capacity = \"many\"\n").unwrap();

        assert!(matches!(
            Settings::load_from(&path),
            Err(ConfigError::SettingsParse { .. })
        ));
    }
}
