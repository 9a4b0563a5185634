//! Worker configuration from environment variables.

use std::time::Duration;

use thiserror::Error;

use hubjobs_observability::LogFormat;

pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";
pub const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_GITHUB_TOKEN_ID: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// `REDIS_URL`
    pub redis_url: String,
    /// `GITHUB_TOKEN`
    pub github_token: Option<String>,
    /// `GITHUB_TOKEN_ID`: name of the token's rate-limit entry in Redis, so the
    /// secret itself never lands in keys or logs.
    pub github_token_id: String,
    /// `GITHUB_API_URL`
    pub github_api_url: String,
    /// `GITHUB_HOOK_URL`: when set, only hooks delivering to this URL count.
    pub github_hook_url: Option<String>,
    /// `HUBJOBS_POLL_INTERVAL_MS`
    pub poll_interval: Duration,
    /// `HUBJOBS_LOG_FORMAT`
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?} ({reason})")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            github_token: None,
            github_token_id: DEFAULT_GITHUB_TOKEN_ID.to_string(),
            github_api_url: DEFAULT_GITHUB_API_URL.to_string(),
            github_hook_url: None,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            log_format: LogFormat::default(),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let poll_interval = match get("HUBJOBS_POLL_INTERVAL_MS") {
            Some(raw) => {
                let ms: u64 = raw.trim().parse().map_err(|e: std::num::ParseIntError| {
                    ConfigError::Invalid {
                        name: "HUBJOBS_POLL_INTERVAL_MS",
                        value: raw.clone(),
                        reason: e.to_string(),
                    }
                })?;
                if ms == 0 {
                    return Err(ConfigError::Invalid {
                        name: "HUBJOBS_POLL_INTERVAL_MS",
                        value: raw,
                        reason: "must be positive".to_string(),
                    });
                }
                Duration::from_millis(ms)
            }
            None => defaults.poll_interval,
        };

        let log_format = match get("HUBJOBS_LOG_FORMAT") {
            Some(raw) => raw.parse().map_err(|e: hubjobs_observability::ParseLogFormatError| {
                ConfigError::Invalid {
                    name: "HUBJOBS_LOG_FORMAT",
                    value: raw.clone(),
                    reason: e.to_string(),
                }
            })?,
            None => defaults.log_format,
        };

        Ok(Self {
            redis_url: get("REDIS_URL").unwrap_or(defaults.redis_url),
            github_token: get("GITHUB_TOKEN"),
            github_token_id: get("GITHUB_TOKEN_ID").unwrap_or(defaults.github_token_id),
            github_api_url: get("GITHUB_API_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.github_api_url),
            github_hook_url: get("GITHUB_HOOK_URL"),
            poll_interval,
            log_format,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from(vars: &[(&str, &str)]) -> Result<WorkerConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WorkerConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        assert_eq!(from(&[]).unwrap(), WorkerConfig::default());
    }

    #[test]
    fn reads_every_variable() {
        let config = from(&[
            ("REDIS_URL", "redis://cache:6380/2"),
            ("GITHUB_TOKEN", "ghp_x"),
            ("GITHUB_TOKEN_ID", "bot"),
            ("GITHUB_API_URL", "https://ghe.example.com/api/v3/"),
            ("GITHUB_HOOK_URL", "https://tracker.example.com/hook"),
            ("HUBJOBS_POLL_INTERVAL_MS", "250"),
            ("HUBJOBS_LOG_FORMAT", "compact"),
        ])
        .unwrap();

        assert_eq!(config.redis_url, "redis://cache:6380/2");
        assert_eq!(config.github_token.as_deref(), Some("ghp_x"));
        assert_eq!(config.github_token_id, "bot");
        assert_eq!(config.github_api_url, "https://ghe.example.com/api/v3");
        assert_eq!(
            config.github_hook_url.as_deref(),
            Some("https://tracker.example.com/hook")
        );
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.log_format, LogFormat::Compact);
    }

    #[test]
    fn empty_values_count_as_unset() {
        let config = from(&[("GITHUB_TOKEN", ""), ("REDIS_URL", "  ")]).unwrap();
        assert_eq!(config.github_token, None);
        assert_eq!(config.redis_url, DEFAULT_REDIS_URL);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = from(&[("HUBJOBS_POLL_INTERVAL_MS", "soon")]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                name: "HUBJOBS_POLL_INTERVAL_MS",
                ..
            }
        ));
        assert!(from(&[("HUBJOBS_POLL_INTERVAL_MS", "0")]).is_err());
        assert!(from(&[("HUBJOBS_LOG_FORMAT", "xml")]).is_err());
    }
}
