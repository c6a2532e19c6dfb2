//! Instance termination.
//!
//! Lambda Labs instances are terminated through the cloud API with the
//! account key. Runpod pods are stopped with the `runpodctl` CLI, which is
//! pre-authenticated inside the pod.

use std::{fmt, process::Command as StdCommand, time::Duration};

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;

use crate::config::{InstanceSettings, Provider};

/// A provider that can shut down the instance this watchdog runs on.
#[async_trait]
pub trait Terminator: Send + Sync {
    /// Provider name for messages.
    fn provider(&self) -> &'static str;

    fn instance_id(&self) -> Option<&str>;

    /// Check configuration and return any problems.
    /// Returns None if everything is OK, Some(warning) if there's an issue.
    fn check_config(&self) -> Option<String>;

    /// Issue a single terminate request. Returns the provider's response text.
    async fn terminate(&self) -> Result<String, TerminateError>;
}

/// Build the terminator for the configured provider, or `None` when
/// termination is disabled.
pub fn from_settings(
    settings: &InstanceSettings,
) -> Result<Option<Box<dyn Terminator>>, TerminateError> {
    let terminator: Box<dyn Terminator> = match settings.provider {
        Provider::Lambda => Box::new(LambdaLabs::new(
            settings.api_base.clone(),
            settings.api_key.clone(),
            settings.instance_id.clone(),
            settings.timeout(),
        )?),
        Provider::Runpod => Box::new(Runpod::new(
            settings.runpodctl.clone(),
            settings.instance_id.clone(),
            settings.timeout(),
        )),
        Provider::None => return Ok(None),
    };
    Ok(Some(terminator))
}

/// Lambda Labs cloud API.
pub struct LambdaLabs {
    /// HTTP client carrying the request timeout.
    client: reqwest::Client,
    /// Cloud API root, without a trailing slash.
    api_base: String,
    /// Account API key from environment.
    api_key: Option<String>,
    /// Instance ID from environment.
    instance_id: Option<String>,
}

#[derive(Serialize)]
struct TerminateRequest<'a> {
    instance_ids: [&'a str; 1],
}

impl LambdaLabs {
    pub fn new(
        api_base: impl Into<String>,
        api_key: Option<String>,
        instance_id: Option<String>,
        timeout: Duration,
    ) -> Result<Self, TerminateError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key,
            instance_id,
        })
    }
}

#[async_trait]
impl Terminator for LambdaLabs {
    fn provider(&self) -> &'static str {
        "Lambda Labs"
    }

    fn instance_id(&self) -> Option<&str> {
        self.instance_id.as_deref()
    }

    fn check_config(&self) -> Option<String> {
        let mut problems = Vec::new();

        if self.api_key.is_none() {
            problems.push("LAMBDALABS_API_KEY environment variable not set");
        }

        if self.instance_id.is_none() {
            problems.push("LAMBDALABS_INSTANCE_ID environment variable not set");
        }

        if problems.is_empty() {
            None
        } else {
            Some(format!(
                "Lambda Labs termination won't work: {}",
                problems.join(", ")
            ))
        }
    }

    async fn terminate(&self) -> Result<String, TerminateError> {
        let api_key = self.api_key.as_ref().ok_or(TerminateError::NoApiKey)?;
        let instance_id = self
            .instance_id
            .as_deref()
            .ok_or(TerminateError::NoInstanceId)?;

        tracing::info!("Terminating Lambda Labs instance {}", instance_id);

        let response = self
            .client
            .post(format!("{}/instance-operations/terminate", self.api_base))
            .basic_auth(api_key, None::<&str>)
            .json(&TerminateRequest {
                instance_ids: [instance_id],
            })
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(TerminateError::Status(status.as_u16(), body));
        }
        Ok(body)
    }
}

/// Runpod integration through `runpodctl`.
pub struct Runpod {
    /// Path or name of the runpodctl binary.
    binary: String,
    /// Pod ID from environment.
    pod_id: Option<String>,
    /// Whether runpodctl CLI is available.
    has_cli: bool,
    /// Upper bound for the stop command.
    timeout: Duration,
}

impl Runpod {
    #[must_use]
    pub fn new(binary: impl Into<String>, pod_id: Option<String>, timeout: Duration) -> Self {
        let binary = binary.into();
        let has_cli = Self::check_cli(&binary);
        Self {
            binary,
            pod_id,
            has_cli,
            timeout,
        }
    }

    /// Check if the CLI is installed.
    fn check_cli(binary: &str) -> bool {
        StdCommand::new("which")
            .arg(binary)
            .output()
            .is_ok_and(|o| o.status.success())
    }
}

#[async_trait]
impl Terminator for Runpod {
    fn provider(&self) -> &'static str {
        "Runpod"
    }

    fn instance_id(&self) -> Option<&str> {
        self.pod_id.as_deref()
    }

    fn check_config(&self) -> Option<String> {
        let mut problems = Vec::new();

        if self.pod_id.is_none() {
            problems.push("RUNPOD_POD_ID environment variable not set".to_string());
        }

        if !self.has_cli {
            problems.push(format!("{} CLI not found in PATH", self.binary));
        }

        if problems.is_empty() {
            None
        } else {
            Some(format!(
                "Runpod auto-shutdown enabled but won't work: {}",
                problems.join(", ")
            ))
        }
    }

    async fn terminate(&self) -> Result<String, TerminateError> {
        let pod_id = self.pod_id.as_ref().ok_or(TerminateError::NoInstanceId)?;

        tracing::info!("Stopping runpod {}", pod_id);

        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.binary)
                .args(["stop", "pod", pod_id])
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| TerminateError::Timeout(self.timeout))?
        .map_err(|e| TerminateError::Command(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TerminateError::Command(stderr.trim().to_string()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// How the termination step went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationOutcome {
    Terminated { instance_id: String, detail: String },
    Failed { reason: String },
    Skipped { reason: String },
}

impl TerminationOutcome {
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated { .. })
    }
}

impl fmt::Display for TerminationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Terminated { instance_id, .. } => write!(f, "instance {instance_id} terminated"),
            Self::Failed { reason } => write!(f, "termination failed: {reason}"),
            Self::Skipped { reason } => write!(f, "termination skipped: {reason}"),
        }
    }
}

/// Errors that can occur when terminating the instance.
#[derive(Debug, thiserror::Error)]
pub enum TerminateError {
    #[error("LAMBDALABS_API_KEY not set")]
    NoApiKey,
    #[error("instance ID not set")]
    NoInstanceId,
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("terminate request returned {0}: {1}")]
    Status(u16, String),
    #[error("runpodctl command failed: {0}")]
    Command(String),
    #[error("terminate request timed out after {0:?}")]
    Timeout(Duration),
}
