use anyhow::{bail, Context};
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub base_url: String,
    /// Name of an environment variable whose value overrides `base_url`
    pub base_url_env: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_grace_period_ms() -> u64 {
    5_000
}

fn default_retry_delay_ms() -> u64 {
    2_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_poll_interval_ms() -> u64 {
    15_000
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: default_grace_period_ms(),
            retry_delay_ms: default_retry_delay_ms(),
            max_retries: default_max_retries(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl MonitorConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_filter")]
    pub filter: String,
    #[serde(default = "default_history")]
    pub history: usize,
}

fn default_filter() -> String {
    "info".to_string()
}

fn default_history() -> usize {
    32
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            history: default_history(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub backend: BackendConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    pub fn load_default() -> anyhow::Result<Self> {
        let default = include_str!("../config/default.toml");
        let cfg: AppConfig = toml::from_str(default).context("embedded default config")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load_from(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let p = path.into();
        let s = fs::read_to_string(&p).with_context(|| format!("reading {}", p.display()))?;
        let cfg: AppConfig =
            toml::from_str(&s).with_context(|| format!("parsing {}", p.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Backend base URL, taking the override variable into account when it is set.
    pub fn resolved_base_url(&self) -> String {
        if let Some(env_var) = &self.backend.base_url_env {
            if let Ok(url) = std::env::var(env_var) {
                if !url.trim().is_empty() {
                    return url;
                }
            }
        }
        self.backend.base_url.clone()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.backend.base_url.trim().is_empty() {
            bail!("backend.base_url must not be empty");
        }
        if self.monitor.poll_interval_ms == 0 {
            bail!("monitor.poll_interval_ms must be greater than zero");
        }
        if self.monitor.grace_period_ms >= self.monitor.poll_interval_ms {
            bail!(
                "monitor.grace_period_ms ({}) must be shorter than monitor.poll_interval_ms ({})",
                self.monitor.grace_period_ms,
                self.monitor.poll_interval_ms
            );
        }
        Ok(())
    }
}
