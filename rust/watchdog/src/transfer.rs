//! Result export via rclone.

use std::{fmt, path::Path, time::Duration};

use async_trait::async_trait;
use tokio::process::Command;

/// Copies a directory to a remote destination.
#[async_trait]
pub trait Transfer: Send + Sync {
    async fn copy(&self, source: &Path, destination: &str) -> Result<(), TransferError>;
}

/// `rclone copy -P <source> <destination>`.
pub struct Rclone {
    /// Path or name of the rclone binary.
    binary: String,
    /// Upper bound for one copy, which can take hours for large checkpoints.
    timeout: Duration,
}

impl Rclone {
    #[must_use]
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Transfer for Rclone {
    async fn copy(&self, source: &Path, destination: &str) -> Result<(), TransferError> {
        tracing::info!(
            "Running {} copy -P {} {}",
            self.binary,
            source.display(),
            destination
        );

        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.binary)
                .args(["copy", "-P"])
                .arg(source)
                .arg(destination)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| TransferError::Timeout(self.timeout))?
        .map_err(|e| TransferError::Spawn(self.binary.clone(), e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TransferError::Exit(
                output.status.code(),
                last_lines(&stderr, 5),
            ));
        }

        tracing::debug!("rclone output: {}", String::from_utf8_lossy(&output.stdout));
        Ok(())
    }
}

/// Keep the tail of noisy progress output for messages.
fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.trim().lines().collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}

/// `<remote>:<path>/<directory>`. Without a remote there is nowhere to copy to.
pub fn resolve_destination(
    remote: Option<&str>,
    path: &str,
    directory: &str,
) -> Result<String, TransferError> {
    let remote = remote
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .ok_or(TransferError::NoDestination)?;
    let path = path.trim_matches('/');
    if path.is_empty() {
        Ok(format!("{remote}:{directory}"))
    } else {
        Ok(format!("{remote}:{path}/{directory}"))
    }
}

/// How the transfer step went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed { destination: String },
    Failed { destination: String, reason: String },
    Skipped { reason: String },
}

impl TransferOutcome {
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

impl fmt::Display for TransferOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed { destination } => write!(f, "transferred to {destination}"),
            Self::Failed {
                destination,
                reason,
            } => write!(f, "transfer to {destination} failed: {reason}"),
            Self::Skipped { reason } => write!(f, "transfer skipped: {reason}"),
        }
    }
}

/// Errors that can occur during transfer.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("no transfer remote configured")]
    NoDestination,
    #[error("failed to run {0}: {1}")]
    Spawn(String, std::io::Error),
    #[error("rclone exited with {0:?}: {1}")]
    Exit(Option<i32>, String),
    #[error("transfer timed out after {0:?}")]
    Timeout(Duration),
}
