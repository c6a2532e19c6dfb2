//! Configuration parsing for the watchdog.
//!
//! Everything lives in one TOML file where every field has a default, so an
//! empty file (or no file at all) is a valid configuration. Secrets and the
//! instance identity are read from the environment and override the file.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

/// Top-level watchdog configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatchdogConfig {
    #[serde(default)]
    pub monitor: MonitorSettings,
    #[serde(default)]
    pub results: ResultSettings,
    #[serde(default)]
    pub transfer: TransferSettings,
    #[serde(default)]
    pub notify: NotifySettings,
    #[serde(default)]
    pub instance: InstanceSettings,
}

/// Idle detection and loop timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSettings {
    /// A device counts as idle when its averaged utilization is strictly below this (percent).
    #[serde(default = "default_low_usage_threshold")]
    pub low_usage_threshold: f64,
    /// Consecutive idle cycles needed before shutdown.
    #[serde(default = "default_consecutive_low_cycles")]
    pub consecutive_low_cycles: u32,
    /// Minutes between cycles.
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u64,
    /// Send a status notification every this many cycles.
    #[serde(default = "default_notify_every")]
    pub notify_every: u32,
    /// Terminate the instance once idle is confirmed. When false the watchdog
    /// only notifies and starts counting again.
    #[serde(default = "default_true")]
    pub auto_terminate: bool,
    /// Point samples averaged into one window.
    #[serde(default = "default_samples_per_window")]
    pub samples_per_window: usize,
    /// Seconds between point samples.
    #[serde(default = "default_sample_delay_secs")]
    pub sample_delay_secs: u64,
    /// Upper bound for a single `nvidia-smi` call.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    /// Path to `nvidia-smi`.
    #[serde(default = "default_nvidia_smi")]
    pub nvidia_smi: String,
}

impl MonitorSettings {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes * 60)
    }

    #[must_use]
    pub fn sample_delay(&self) -> Duration {
        Duration::from_secs(self.sample_delay_secs)
    }

    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            low_usage_threshold: default_low_usage_threshold(),
            consecutive_low_cycles: default_consecutive_low_cycles(),
            interval_minutes: default_interval_minutes(),
            notify_every: default_notify_every(),
            auto_terminate: true,
            samples_per_window: default_samples_per_window(),
            sample_delay_secs: default_sample_delay_secs(),
            command_timeout_secs: default_command_timeout_secs(),
            nvidia_smi: default_nvidia_smi(),
        }
    }
}

/// Where training results are written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultSettings {
    /// Directory whose newest subdirectory is the current run.
    #[serde(default = "default_base_path")]
    pub base_path: PathBuf,
    /// Newline-delimited JSON log inside each run directory.
    #[serde(default = "default_log_file")]
    pub log_file: String,
    /// Metric to report alongside the latest record. Empty disables it.
    #[serde(default = "default_metric")]
    pub metric: String,
}

impl ResultSettings {
    #[must_use]
    pub fn metric_name(&self) -> Option<&str> {
        Some(self.metric.as_str()).filter(|m| !m.is_empty())
    }
}

impl Default for ResultSettings {
    fn default() -> Self {
        Self {
            base_path: default_base_path(),
            log_file: default_log_file(),
            metric: default_metric(),
        }
    }
}

/// Artifact transfer via rclone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    /// rclone remote name. Transfer is skipped when unset.
    #[serde(default)]
    pub remote: Option<String>,
    /// Path on the remote; the run directory name is appended.
    #[serde(default = "default_transfer_path")]
    pub path: String,
    #[serde(default = "default_rclone")]
    pub binary: String,
    #[serde(default = "default_transfer_timeout_secs")]
    pub timeout_secs: u64,
}

impl TransferSettings {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            remote: None,
            path: default_transfer_path(),
            binary: default_rclone(),
            timeout_secs: default_transfer_timeout_secs(),
        }
    }
}

/// Operator channel settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifySettings {
    /// Slack channel ID.
    #[serde(default)]
    pub channel: Option<String>,
    /// User mentioned in the termination alert.
    #[serde(default)]
    pub mention_user: Option<String>,
    #[serde(default = "default_slack_api_base")]
    pub api_base: String,
    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
    /// Bot token. Only read from `SLACK_API_TOKEN`.
    #[serde(skip)]
    pub token: Option<String>,
}

impl NotifySettings {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for NotifySettings {
    fn default() -> Self {
        Self {
            channel: None,
            mention_user: None,
            api_base: default_slack_api_base(),
            timeout_secs: default_http_timeout_secs(),
            token: None,
        }
    }
}

/// Cloud provider used to terminate the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Lambda Labs cloud API.
    #[default]
    Lambda,
    /// Runpod, through the pre-authenticated `runpodctl` CLI.
    Runpod,
    /// Never terminate.
    None,
}

/// Instance identity and termination settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSettings {
    #[serde(default)]
    pub provider: Provider,
    /// Instance (or pod) ID. Overridden by `LAMBDALABS_INSTANCE_ID` or `RUNPOD_POD_ID`.
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default = "default_lambda_api_base")]
    pub api_base: String,
    #[serde(default = "default_runpodctl")]
    pub runpodctl: String,
    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
    /// Only read from `LAMBDALABS_API_KEY`.
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl InstanceSettings {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Human-readable instance label for messages.
    #[must_use]
    pub fn label(&self) -> &str {
        self.instance_id.as_deref().unwrap_or("unknown")
    }
}

impl Default for InstanceSettings {
    fn default() -> Self {
        Self {
            provider: Provider::default(),
            instance_id: None,
            api_base: default_lambda_api_base(),
            runpodctl: default_runpodctl(),
            timeout_secs: default_http_timeout_secs(),
            api_key: None,
        }
    }
}

fn default_low_usage_threshold() -> f64 {
    5.0
}

fn default_consecutive_low_cycles() -> u32 {
    2
}

fn default_interval_minutes() -> u64 {
    15
}

fn default_notify_every() -> u32 {
    4
}

fn default_true() -> bool {
    true
}

fn default_samples_per_window() -> usize {
    crate::sampler::DEFAULT_SAMPLES_PER_WINDOW
}

fn default_sample_delay_secs() -> u64 {
    1
}

fn default_command_timeout_secs() -> u64 {
    60
}

fn default_nvidia_smi() -> String {
    "nvidia-smi".to_string()
}

fn default_base_path() -> PathBuf {
    PathBuf::from("./output")
}

fn default_log_file() -> String {
    crate::results::DEFAULT_LOG_FILE.to_string()
}

fn default_metric() -> String {
    "eval_loss".to_string()
}

fn default_transfer_path() -> String {
    "rclone".to_string()
}

fn default_rclone() -> String {
    "rclone".to_string()
}

fn default_transfer_timeout_secs() -> u64 {
    6 * 60 * 60
}

fn default_slack_api_base() -> String {
    "https://slack.com/api".to_string()
}

fn default_lambda_api_base() -> String {
    "https://cloud.lambdalabs.com/api/v1".to_string()
}

fn default_runpodctl() -> String {
    "runpodctl".to_string()
}

fn default_http_timeout_secs() -> u64 {
    30
}

impl WatchdogConfig {
    /// Load configuration from a TOML file and apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(path.as_ref().display().to_string(), e))?;
        let mut config = Self::parse(&content)?;
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a config file.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse TOML without touching the environment.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply environment overrides. `lookup` is `std::env::var` outside tests.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(token) = lookup("SLACK_API_TOKEN") {
            self.notify.token = Some(token);
        }
        if let Some(channel) = lookup("SLACK_CHANNEL") {
            self.notify.channel = Some(channel);
        }
        if let Some(user) = lookup("SLACK_MENTION_USER_ID") {
            self.notify.mention_user = Some(user);
        }

        match self.instance.provider {
            Provider::Lambda => {
                if let Some(key) = lookup("LAMBDALABS_API_KEY") {
                    self.instance.api_key = Some(key);
                }
                if let Some(id) = lookup("LAMBDALABS_INSTANCE_ID") {
                    self.instance.instance_id = Some(id);
                }
            }
            Provider::Runpod => {
                if let Some(id) = lookup("RUNPOD_POD_ID") {
                    self.instance.instance_id = Some(id);
                }
            }
            Provider::None => {}
        }
    }

    /// Reject settings the monitor loop cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let monitor = &self.monitor;
        if !(0.0..=100.0).contains(&monitor.low_usage_threshold) {
            return Err(ConfigError::Invalid(format!(
                "low_usage_threshold must be within 0..=100, got {}",
                monitor.low_usage_threshold
            )));
        }
        if monitor.consecutive_low_cycles == 0 {
            return Err(ConfigError::Invalid(
                "consecutive_low_cycles must be at least 1".into(),
            ));
        }
        if monitor.notify_every == 0 {
            return Err(ConfigError::Invalid("notify_every must be at least 1".into()));
        }
        if monitor.samples_per_window == 0 {
            return Err(ConfigError::Invalid(
                "samples_per_window must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Io(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}
