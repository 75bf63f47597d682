use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::limiter::RateSettings;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub locale: LocaleConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    /// Update kinds to request, e.g. `message`, `callback_query`. Empty
    /// means the platform default.
    #[serde(default)]
    pub allowed_updates: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DispatchConfig {
    #[serde(default = "default_workers_count")]
    pub workers_count: usize,
    /// Inbound updates per second per user; `-1` disables the limiter.
    #[serde(default = "default_messages_per_second")]
    pub messages_per_second: i64,
    #[serde(default = "default_burst")]
    pub burst: u32,
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_limiter_sweep_secs")]
    pub limiter_sweep_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TransportConfig {
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_wait_ms")]
    pub retry_wait_ms: u64,
    #[serde(default = "default_global_per_second")]
    pub global_per_second: i64,
    #[serde(default = "default_per_chat_per_second")]
    pub per_chat_per_second: i64,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StorageConfig {
    /// SQLite file; in-memory storage when unset.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LocaleConfig {
    #[serde(default)]
    pub file_path: Option<PathBuf>,
}

fn default_workers_count() -> usize {
    1
}

fn default_messages_per_second() -> i64 {
    -1
}

fn default_burst() -> u32 {
    1
}

fn default_mailbox_capacity() -> usize {
    10
}

fn default_tick_ms() -> u64 {
    100
}

fn default_limiter_sweep_secs() -> u64 {
    30 * 60
}

fn default_retries() -> u32 {
    3
}

fn default_retry_wait_ms() -> u64 {
    1000
}

fn default_global_per_second() -> i64 {
    25
}

fn default_per_chat_per_second() -> i64 {
    1
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers_count: default_workers_count(),
            messages_per_second: default_messages_per_second(),
            burst: default_burst(),
            mailbox_capacity: default_mailbox_capacity(),
            tick_ms: default_tick_ms(),
            limiter_sweep_secs: default_limiter_sweep_secs(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            retry_wait_ms: default_retry_wait_ms(),
            global_per_second: default_global_per_second(),
            per_chat_per_second: default_per_chat_per_second(),
        }
    }
}

impl DispatchConfig {
    pub fn rate(&self) -> RateSettings {
        RateSettings::new(self.messages_per_second, self.burst)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.limiter_sweep_secs.max(1))
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config = Self::parse(&content)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }

    /// Applies `BOT_TOKEN`, `ALLOWED_UPDATES`, `WORKERS_COUNT`,
    /// `MESSAGE_PER_SECOND` and `LOCALIZATION_FILE_PATH` from `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = lookup("BOT_TOKEN") {
            self.telegram.bot_token = token;
        }
        if let Some(updates) = lookup("ALLOWED_UPDATES") {
            self.telegram.allowed_updates = updates
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(workers) = lookup("WORKERS_COUNT") {
            self.dispatch.workers_count = workers
                .trim()
                .parse()
                .with_context(|| format!("Invalid WORKERS_COUNT: {workers}"))?;
        }
        if let Some(rate) = lookup("MESSAGE_PER_SECOND") {
            self.dispatch.messages_per_second = rate
                .trim()
                .parse()
                .with_context(|| format!("Invalid MESSAGE_PER_SECOND: {rate}"))?;
        }
        if let Some(path) = lookup("LOCALIZATION_FILE_PATH") {
            self.locale.file_path = Some(PathBuf::from(path));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.telegram.bot_token.is_empty() {
            bail!("telegram.bot_token is not set (config file or BOT_TOKEN)");
        }
        if self.dispatch.workers_count == 0 {
            bail!("dispatch.workers_count must be at least 1");
        }
        if self.dispatch.mailbox_capacity == 0 {
            bail!("dispatch.mailbox_capacity must be at least 1");
        }
        if self.dispatch.burst == 0 {
            bail!("dispatch.burst must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::parse("[telegram]\nbot_token = \"t\"\n").unwrap();
        assert_eq!(config.dispatch.workers_count, 1);
        assert_eq!(config.dispatch.messages_per_second, -1);
        assert_eq!(config.dispatch.mailbox_capacity, 10);
        assert_eq!(config.dispatch.tick(), Duration::from_millis(100));
        assert_eq!(config.transport.global_per_second, 25);
        assert!(config.storage.database_path.is_none());
        assert!(config.telegram.allowed_updates.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::parse(
            r#"
            [telegram]
            bot_token = "from-file"

            [dispatch]
            workers_count = 2
            "#,
        )
        .unwrap();
        let env: HashMap<&str, &str> = HashMap::from([
            ("BOT_TOKEN", "from-env"),
            ("WORKERS_COUNT", "8"),
            ("MESSAGE_PER_SECOND", "3"),
            ("ALLOWED_UPDATES", "message, callback_query,"),
            ("LOCALIZATION_FILE_PATH", "/tmp/locales.json"),
        ]);
        config
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.telegram.bot_token, "from-env");
        assert_eq!(config.dispatch.workers_count, 8);
        assert_eq!(config.dispatch.rate(), RateSettings::new(3, 1));
        assert_eq!(
            config.telegram.allowed_updates,
            vec!["message".to_string(), "callback_query".to_string()]
        );
        assert_eq!(
            config.locale.file_path,
            Some(PathBuf::from("/tmp/locales.json"))
        );
    }

    #[test]
    fn test_bad_override_rejected() {
        let mut config = Config::parse("[telegram]\nbot_token = \"t\"\n").unwrap();
        assert!(config
            .apply_overrides(|k| (k == "WORKERS_COUNT").then(|| "many".to_string()))
            .is_err());
    }

    #[test]
    fn test_validation() {
        let mut config = Config::parse("[telegram]\n").unwrap();
        assert!(config.validate().is_err());
        config.telegram.bot_token = "t".to_string();
        config.dispatch.workers_count = 0;
        assert!(config.validate().is_err());
    }
}
