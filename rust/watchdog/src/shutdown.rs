//! The shutdown sequence: export the latest results, then terminate.
//!
//! Every step is best effort. A failed transfer never prevents termination,
//! so a paid instance is not left running, and each failure is reported to
//! the operator channel instead of being propagated.

use std::{fmt, sync::Arc};

use crate::{
    config::TransferSettings,
    notify::{Notifier, deliver, mention},
    results::ResultLocator,
    terminate::{TerminationOutcome, Terminator},
    transfer::{Transfer, TransferOutcome, resolve_destination},
};

/// Outcome of both steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub transfer: TransferOutcome,
    pub termination: TerminationOutcome,
}

impl ShutdownReport {
    #[must_use]
    pub fn terminated(&self) -> bool {
        self.termination.is_terminated()
    }
}

impl fmt::Display for ShutdownReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}; {}", self.transfer, self.termination)
    }
}

/// Where to copy results on the remote.
#[derive(Debug, Clone, Default)]
pub struct TransferTarget {
    /// rclone remote name; `None` skips the transfer.
    pub remote: Option<String>,
    /// Directory on the remote under which run directories are copied.
    pub path: String,
}

impl From<&TransferSettings> for TransferTarget {
    fn from(settings: &TransferSettings) -> Self {
        Self {
            remote: settings.remote.clone(),
            path: settings.path.clone(),
        }
    }
}

/// Runs transfer then termination, in that order, exactly once per call.
pub struct ShutdownSequence {
    locator: ResultLocator,
    target: TransferTarget,
    transfer: Box<dyn Transfer>,
    terminator: Option<Box<dyn Terminator>>,
    notifier: Arc<dyn Notifier>,
    mention_user: Option<String>,
}

impl ShutdownSequence {
    #[must_use]
    pub fn new(
        locator: ResultLocator,
        target: TransferTarget,
        transfer: Box<dyn Transfer>,
        terminator: Option<Box<dyn Terminator>>,
        notifier: Arc<dyn Notifier>,
        mention_user: Option<String>,
    ) -> Self {
        Self {
            locator,
            target,
            transfer,
            terminator,
            notifier,
            mention_user,
        }
    }

    #[must_use]
    pub fn terminator(&self) -> Option<&dyn Terminator> {
        self.terminator.as_deref()
    }

    /// Transfer the latest results, then terminate regardless of how the
    /// transfer went.
    pub async fn execute(&self) -> ShutdownReport {
        let transfer = self.transfer_results().await;
        tracing::info!("Transfer step: {transfer}");

        let termination = self.terminate_instance().await;
        tracing::info!("Termination step: {termination}");

        ShutdownReport {
            transfer,
            termination,
        }
    }

    async fn transfer_results(&self) -> TransferOutcome {
        let Some(directory) = self.locator.latest_directory() else {
            let reason = format!(
                "no training result directory found under {}",
                self.locator.base_path().display()
            );
            deliver(&*self.notifier, &format!("Transfer skipped: {reason}.")).await;
            return TransferOutcome::Skipped { reason };
        };

        let destination =
            match resolve_destination(self.target.remote.as_deref(), &self.target.path, &directory) {
                Ok(destination) => destination,
                Err(e) => {
                    let reason = e.to_string();
                    deliver(
                        &*self.notifier,
                        &format!("Transfer of {directory} skipped: {reason}."),
                    )
                    .await;
                    return TransferOutcome::Skipped { reason };
                }
            };

        let source = self.locator.base_path().join(&directory);
        match self.transfer.copy(&source, &destination).await {
            Ok(()) => {
                deliver(
                    &*self.notifier,
                    &format!("Results transferred: {destination}"),
                )
                .await;
                TransferOutcome::Completed { destination }
            }
            Err(e) => {
                let reason = e.to_string();
                tracing::error!("Transfer to {} failed: {}", destination, reason);
                deliver(
                    &*self.notifier,
                    &format!("Transfer to {destination} failed: {reason}"),
                )
                .await;
                TransferOutcome::Failed {
                    destination,
                    reason,
                }
            }
        }
    }

    async fn terminate_instance(&self) -> TerminationOutcome {
        let Some(terminator) = self.terminator.as_deref() else {
            let reason = "no termination provider configured".to_string();
            deliver(
                &*self.notifier,
                "Termination skipped: no termination provider configured. The instance is still running.",
            )
            .await;
            return TerminationOutcome::Skipped { reason };
        };

        let instance_id = terminator.instance_id().unwrap_or("unknown").to_string();

        // The alert goes out before the remote call so someone hears about it
        // even if the call hangs or fails.
        let alert = format!(
            "Terminating {} instance {}",
            terminator.provider(),
            instance_id
        );
        let alert = match &self.mention_user {
            Some(user) => format!("{} {alert}", mention(user)),
            None => alert,
        };
        deliver(&*self.notifier, &alert).await;

        match terminator.terminate().await {
            Ok(detail) => {
                tracing::info!("Termination response: {}", detail);
                TerminationOutcome::Terminated {
                    instance_id,
                    detail,
                }
            }
            Err(e) => {
                let reason = e.to_string();
                tracing::error!("Failed to terminate {}: {}", instance_id, reason);
                deliver(
                    &*self.notifier,
                    &format!("Failed to terminate instance {instance_id}: {reason}"),
                )
                .await;
                TerminationOutcome::Failed { reason }
            }
        }
    }
}
