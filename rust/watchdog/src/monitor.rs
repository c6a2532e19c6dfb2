//! The monitoring loop.
//!
//! One cycle: sample a window, send status every `notify_every` cycles, feed
//! the idle detector, and run the shutdown sequence once idle is confirmed.
//! Cycles are strictly sequential; nothing runs in the background.

use std::{future::Future, sync::Arc};

use crate::{
    config::{MonitorSettings, WatchdogConfig},
    idle::{IdleDetector, IdlePhase},
    notify::{self, Notifier, NotifyError, deliver},
    results::{LogReport, ResultLocator},
    sampler::{DeviceProbe, NvidiaSmi, Sampler},
    shutdown::{ShutdownReport, ShutdownSequence, TransferTarget},
    terminate::{self, TerminateError, Terminator},
    transfer::{Rclone, Transfer},
};

/// External tools the monitor talks to.
pub struct Collaborators {
    pub probe: Box<dyn DeviceProbe>,
    pub notifier: Arc<dyn Notifier>,
    pub transfer: Box<dyn Transfer>,
    pub terminator: Option<Box<dyn Terminator>>,
}

impl Collaborators {
    /// The real tools: `nvidia-smi`, Slack (or the log), rclone and the configured provider.
    pub fn from_config(config: &WatchdogConfig) -> Result<Self, MonitorError> {
        Ok(Self {
            probe: Box::new(NvidiaSmi::new(
                config.monitor.nvidia_smi.clone(),
                config.monitor.command_timeout(),
            )),
            notifier: Arc::from(notify::from_settings(&config.notify)?),
            transfer: Box::new(Rclone::new(
                config.transfer.binary.clone(),
                config.transfer.timeout(),
            )),
            terminator: terminate::from_settings(&config.instance)?,
        })
    }
}

/// Local wall-clock time for status messages.
fn now_timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// What a single cycle ended with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Decision made, keep monitoring.
    Continue(IdlePhase),
    /// Sampling failed; the detector was not updated.
    SampleFailed,
    /// Idle confirmed but auto-terminate is off; the detector was reset.
    IdleDeclined,
    /// The shutdown sequence ran.
    ShutDown(ShutdownReport),
}

/// Why the loop returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorExit {
    ShutDown(ShutdownReport),
    Interrupted,
}

/// Owns the idle state and drives one cycle at a time.
pub struct Monitor {
    settings: MonitorSettings,
    sampler: Sampler,
    detector: IdleDetector,
    locator: ResultLocator,
    notifier: Arc<dyn Notifier>,
    shutdown: ShutdownSequence,
    instance_label: String,
    cycle: u64,
}

impl Monitor {
    #[must_use]
    pub fn new(config: &WatchdogConfig, collaborators: Collaborators) -> Self {
        let settings = config.monitor.clone();
        let locator = ResultLocator::from_settings(&config.results);
        let shutdown = ShutdownSequence::new(
            locator.clone(),
            TransferTarget::from(&config.transfer),
            collaborators.transfer,
            collaborators.terminator,
            collaborators.notifier.clone(),
            config.notify.mention_user.clone(),
        );

        Self {
            sampler: Sampler::new(
                collaborators.probe,
                settings.samples_per_window,
                settings.sample_delay(),
            ),
            detector: IdleDetector::new(
                settings.low_usage_threshold,
                settings.consecutive_low_cycles,
            ),
            locator,
            notifier: collaborators.notifier,
            shutdown,
            instance_label: config.instance.label().to_string(),
            cycle: 0,
            settings,
        }
    }

    #[must_use]
    pub fn detector(&self) -> &IdleDetector {
        &self.detector
    }

    #[must_use]
    pub fn shutdown_sequence(&self) -> &ShutdownSequence {
        &self.shutdown
    }

    #[must_use]
    pub fn cycles(&self) -> u64 {
        self.cycle
    }

    /// Run cycles until the shutdown sequence has run or `stop` resolves.
    ///
    /// `stop` is only checked between cycles, never in the middle of one.
    pub async fn run_until(&mut self, stop: impl Future<Output = ()>) -> MonitorExit {
        tokio::pin!(stop);

        tracing::info!(
            "Watching instance {}: threshold {:.1}%, {} consecutive cycles, every {} min",
            self.instance_label,
            self.settings.low_usage_threshold,
            self.settings.consecutive_low_cycles,
            self.settings.interval_minutes
        );

        loop {
            if let CycleOutcome::ShutDown(report) = self.run_cycle().await {
                return MonitorExit::ShutDown(report);
            }

            tokio::select! {
                () = tokio::time::sleep(self.settings.interval()) => {}
                () = &mut stop => {
                    tracing::info!("Stop requested after {} cycles", self.cycle);
                    return MonitorExit::Interrupted;
                }
            }
        }
    }

    /// One full cycle, without the trailing wait.
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        self.cycle += 1;
        let notify_now = self.cycle % u64::from(self.settings.notify_every.max(1)) == 0;

        let usage = match self.sampler.sample_window().await {
            Ok(usage) => usage,
            Err(e) => {
                tracing::error!("Cycle {}: utilization sampling failed: {}", self.cycle, e);
                deliver(
                    &*self.notifier,
                    &format!(
                        "Instance {}: GPU utilization sampling failed: {e}",
                        self.instance_label
                    ),
                )
                .await;
                return CycleOutcome::SampleFailed;
            }
        };

        if notify_now {
            let status = format!(
                "------- Instance -------\n{}\n------- GPU utilization ({}) -------\n{}",
                self.instance_label,
                now_timestamp(),
                usage
            );
            deliver(&*self.notifier, &status).await;
            self.notify_latest_log().await;
        }

        let phase = self.detector.observe(&usage);
        tracing::info!(
            "Cycle {}: {} -> {:?} ({}/{} idle cycles)",
            self.cycle,
            usage,
            phase,
            self.detector.consecutive_low_cycles(),
            self.detector.required()
        );

        if phase != IdlePhase::IdleConfirmed {
            return CycleOutcome::Continue(phase);
        }

        let idle_message = format!(
            "Instance {}: all GPUs below {:.1}% for {} consecutive checks. Training appears finished.",
            self.instance_label,
            self.settings.low_usage_threshold,
            self.detector.consecutive_low_cycles()
        );

        if !self.settings.auto_terminate {
            deliver(
                &*self.notifier,
                &format!("{idle_message} Auto-terminate is disabled; leaving the instance running."),
            )
            .await;
            self.detector.reset();
            return CycleOutcome::IdleDeclined;
        }

        deliver(
            &*self.notifier,
            &format!("{idle_message} Starting shutdown sequence."),
        )
        .await;
        let report = self.shutdown.execute().await;
        tracing::info!("Shutdown sequence finished: {report}");
        CycleOutcome::ShutDown(report)
    }

    async fn notify_latest_log(&self) {
        let report = self.locator.report();
        match report.message() {
            Some(text) => deliver(&*self.notifier, &text).await,
            None => {
                if let LogReport::Summary { directory } = &report {
                    tracing::info!(
                        "Latest record in {} is the run summary; skipping log notification",
                        directory
                    );
                }
            }
        }
    }
}

/// Errors that can occur while setting up the monitor.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("notifier setup failed: {0}")]
    Notify(#[from] NotifyError),
    #[error("terminator setup failed: {0}")]
    Terminate(#[from] TerminateError),
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use tempfile::tempdir;

    use super::*;
    use crate::{
        mock::{Journal, MockNotifier, MockTerminator, MockTransfer, ScriptedProbe},
        terminate::TerminationOutcome,
        transfer::TransferOutcome,
    };

    fn config(base: &Path, auto_terminate: bool, notify_every: u32) -> WatchdogConfig {
        let mut config = WatchdogConfig::default();
        config.monitor.low_usage_threshold = 5.0;
        config.monitor.consecutive_low_cycles = 2;
        config.monitor.notify_every = notify_every;
        config.monitor.auto_terminate = auto_terminate;
        config.monitor.sample_delay_secs = 0;
        config.results.base_path = base.to_path_buf();
        config.transfer.remote = Some("backup".into());
        config.instance.instance_id = Some("i-123".into());
        config
    }

    fn monitor(
        config: &WatchdogConfig,
        windows: &[&[f64]],
        transfer_ok: bool,
        journal: &Journal,
    ) -> Monitor {
        let collaborators = Collaborators {
            probe: Box::new(ScriptedProbe::windows(
                windows,
                config.monitor.samples_per_window,
            )),
            notifier: Arc::new(MockNotifier::new(journal.clone())),
            transfer: Box::new(MockTransfer::new(transfer_ok, journal.clone())),
            terminator: Some(Box::new(MockTerminator::new(true, journal.clone()))),
        };
        Monitor::new(config, collaborators)
    }

    #[tokio::test]
    async fn test_idle_scenario_runs_shutdown_in_order() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("v1-run")).unwrap();
        let journal = Journal::default();
        let config = config(dir.path(), true, 100);
        let mut monitor = monitor(&config, &[&[2.0, 1.0], &[0.5, 3.0]], false, &journal);

        assert_eq!(
            monitor.run_cycle().await,
            CycleOutcome::Continue(IdlePhase::Cooling)
        );
        let CycleOutcome::ShutDown(report) = monitor.run_cycle().await else {
            panic!("expected shutdown on the second idle cycle");
        };

        assert!(matches!(report.transfer, TransferOutcome::Failed { .. }));
        assert!(matches!(
            report.termination,
            TerminationOutcome::Terminated { .. }
        ));

        let events = journal.events();
        let copy = events.iter().position(|e| e.starts_with("copy ")).unwrap();
        let terminate = events.iter().position(|e| e == "terminate").unwrap();
        assert!(copy < terminate);
    }

    #[tokio::test]
    async fn test_busy_device_keeps_instance_alive() {
        let dir = tempdir().unwrap();
        let journal = Journal::default();
        let config = config(dir.path(), true, 100);
        let mut monitor = monitor(
            &config,
            &[&[1.0, 1.0], &[1.0, 90.0], &[1.0, 1.0]],
            true,
            &journal,
        );

        assert_eq!(monitor.run_cycle().await, CycleOutcome::Continue(IdlePhase::Cooling));
        assert_eq!(monitor.run_cycle().await, CycleOutcome::Continue(IdlePhase::Active));
        assert_eq!(monitor.run_cycle().await, CycleOutcome::Continue(IdlePhase::Cooling));
        assert!(!journal.events().iter().any(|e| e == "terminate"));
    }

    #[tokio::test]
    async fn test_declined_idle_resets_counter() {
        let dir = tempdir().unwrap();
        let journal = Journal::default();
        let config = config(dir.path(), false, 100);
        let idle: &[f64] = &[0.0];
        let mut monitor = monitor(&config, &[idle, idle, idle, idle], true, &journal);

        assert_eq!(monitor.run_cycle().await, CycleOutcome::Continue(IdlePhase::Cooling));
        assert_eq!(monitor.run_cycle().await, CycleOutcome::IdleDeclined);
        assert_eq!(monitor.detector().consecutive_low_cycles(), 0);
        // A fresh streak is needed before the next confirmation
        assert_eq!(monitor.run_cycle().await, CycleOutcome::Continue(IdlePhase::Cooling));
        assert_eq!(monitor.run_cycle().await, CycleOutcome::IdleDeclined);

        assert!(!journal.events().iter().any(|e| e == "terminate"));
        let declined = journal
            .notifications()
            .iter()
            .filter(|n| n.contains("Auto-terminate is disabled"))
            .count();
        assert_eq!(declined, 2);
    }

    #[tokio::test]
    async fn test_sampling_failure_leaves_counter_untouched() {
        let dir = tempdir().unwrap();
        let journal = Journal::default();
        let config = config(dir.path(), true, 100);
        // One full window, then the script runs dry
        let mut monitor = monitor(&config, &[&[0.0]], true, &journal);

        assert_eq!(monitor.run_cycle().await, CycleOutcome::Continue(IdlePhase::Cooling));
        assert_eq!(monitor.run_cycle().await, CycleOutcome::SampleFailed);
        assert_eq!(monitor.detector().consecutive_low_cycles(), 1);
        assert!(
            journal
                .notifications()
                .iter()
                .any(|n| n.contains("sampling failed"))
        );
    }

    #[tokio::test]
    async fn test_status_notifications_follow_cadence() {
        let dir = tempdir().unwrap();
        let run = dir.path().join("v1-run");
        std::fs::create_dir(&run).unwrap();
        std::fs::write(
            run.join("logging.jsonl"),
            "{\"loss\": 1.0, \"eval_loss\": 0.9}\n{\"loss\": 0.8}\n",
        )
        .unwrap();

        let journal = Journal::default();
        let config = config(dir.path(), true, 2);
        let busy: &[f64] = &[80.0, 75.0];
        let mut monitor = monitor(&config, &[busy, busy, busy, busy], true, &journal);

        monitor.run_cycle().await;
        assert!(journal.notifications().is_empty());

        monitor.run_cycle().await;
        let notifications = journal.notifications();
        assert_eq!(notifications.len(), 2);
        assert!(notifications[0].contains("i-123"));
        assert!(notifications[0].contains("1: 80.0%, 2: 75.0%"));
        assert!(notifications[1].contains("[v1-run]"));
        assert!(notifications[1].contains(r#"{"loss":0.8}"#));
        assert!(notifications[1].contains("latest eval_loss: 0.9"));

        monitor.run_cycle().await;
        assert_eq!(journal.notifications().len(), 2);
        assert_eq!(monitor.cycles(), 3);
    }

    #[tokio::test]
    async fn test_summary_record_not_notified() {
        let dir = tempdir().unwrap();
        let run = dir.path().join("v1-run");
        std::fs::create_dir(&run).unwrap();
        std::fs::write(
            run.join("logging.jsonl"),
            "{\"loss\": 0.8}\n{\"model_parameter_info\": \"14B\", \"loss\": 0.8}\n",
        )
        .unwrap();

        let journal = Journal::default();
        let config = config(dir.path(), true, 1);
        let mut monitor = monitor(&config, &[&[80.0]], true, &journal);

        monitor.run_cycle().await;
        let notifications = journal.notifications();
        assert_eq!(notifications.len(), 1);
        assert!(notifications[0].contains("GPU utilization"));
    }

    #[tokio::test]
    async fn test_run_until_stops_between_cycles() {
        let dir = tempdir().unwrap();
        let journal = Journal::default();
        let config = config(dir.path(), true, 100);
        let mut monitor = monitor(&config, &[&[90.0]], true, &journal);

        let exit = monitor.run_until(async {}).await;
        assert_eq!(exit, MonitorExit::Interrupted);
        assert_eq!(monitor.cycles(), 1);
    }

    #[tokio::test]
    async fn test_run_until_returns_after_shutdown() {
        let dir = tempdir().unwrap();
        let journal = Journal::default();
        let mut config = config(dir.path(), true, 100);
        config.monitor.consecutive_low_cycles = 1;
        let mut monitor = monitor(&config, &[&[0.0]], true, &journal);

        let exit = monitor.run_until(std::future::pending::<()>()).await;
        let MonitorExit::ShutDown(report) = exit else {
            panic!("expected shutdown");
        };
        assert!(report.terminated());
        assert_eq!(journal.events().iter().filter(|e| *e == "terminate").count(), 1);
    }
}
