//! GPU Idle Watchdog CLI
//!
//! Watches GPU utilization on a training host and, once training has gone
//! idle, exports the latest results and terminates the instance.

use clap::{Parser, Subcommand};
use gpu_watchdog::{
    config::WatchdogConfig,
    monitor::{Collaborators, Monitor, MonitorExit},
    notify,
    results::LogReport,
};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "gpu-watchdog", about = "Idle GPU watchdog")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the monitoring loop
    Run {
        /// Path to watchdog.toml (defaults plus environment if omitted)
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Take one sample window and print per-GPU averages
    Sample {
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Print the latest result directory and log record
    Latest {
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Transfer results and terminate the instance now
    Shutdown {
        #[arg(short, long)]
        config: Option<String>,

        /// Required, since this terminates the instance
        #[arg(long)]
        yes: bool,
    },

    /// Validate configuration and report termination problems
    Check {
        #[arg(short, long)]
        config: Option<String>,
    },
}

fn load_config(path: Option<&str>) -> Result<WatchdogConfig, Box<dyn std::error::Error>> {
    Ok(match path {
        Some(path) => WatchdogConfig::load(path)?,
        None => WatchdogConfig::from_env()?,
    })
}

#[cfg(unix)]
async fn wait_for_termination() {
    use tokio::signal::unix::{SignalKind, signal};

    let (Ok(mut sigterm), Ok(mut sigint)) = (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) else {
        tracing::warn!("Failed to install signal handlers");
        return std::future::pending().await;
    };

    tokio::select! {
        _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
        _ = sigint.recv() => tracing::info!("Received SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() {
    let _ = tokio::signal::ctrl_c().await;
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(tracing::Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => {
            let config = load_config(config.as_deref())?;
            let mut monitor = Monitor::new(&config, Collaborators::from_config(&config)?);

            // Fail early rather than discover a broken terminator after training
            if config.monitor.auto_terminate
                && let Some(terminator) = monitor.shutdown_sequence().terminator()
                && let Some(warning) = terminator.check_config()
            {
                eprintln!("ERROR: {warning}");
                eprintln!(
                    "Fix the configuration, set [instance] provider = \"none\" or [monitor] auto_terminate = false"
                );
                return Err(warning.into());
            }

            match monitor.run_until(wait_for_termination()).await {
                MonitorExit::ShutDown(report) => {
                    println!("Shutdown sequence finished: {report}");
                }
                MonitorExit::Interrupted => {
                    println!("Watchdog stopped after {} cycles", monitor.cycles());
                }
            }
        }

        Commands::Sample { config } => {
            let config = load_config(config.as_deref())?;
            let collaborators = Collaborators::from_config(&config)?;
            let sampler = gpu_watchdog::Sampler::new(
                collaborators.probe,
                config.monitor.samples_per_window,
                config.monitor.sample_delay(),
            );
            let usage = sampler.sample_window().await?;
            let idle = usage.all_below(config.monitor.low_usage_threshold);
            println!("{usage}");
            println!(
                "All GPUs below {:.1}%: {}",
                config.monitor.low_usage_threshold,
                if idle { "yes" } else { "no" }
            );
        }

        Commands::Latest { config } => {
            let config = load_config(config.as_deref())?;
            let locator = gpu_watchdog::ResultLocator::from_settings(&config.results);
            match locator.report() {
                LogReport::NoDirectory => {
                    println!("No result directory under {}", locator.base_path().display());
                }
                LogReport::NoRecord { directory } => {
                    println!("{directory}: no log record");
                }
                LogReport::Summary { directory } => {
                    println!("{directory}: run summary (not notified)");
                }
                LogReport::Progress {
                    directory,
                    record,
                    metric,
                } => {
                    println!("{directory}: {record}");
                    if let Some((name, value)) = metric {
                        println!("latest {name}: {value}");
                    }
                }
            }
        }

        Commands::Shutdown { config, yes } => {
            if !yes {
                return Err("refusing to terminate without --yes".into());
            }
            let config = load_config(config.as_deref())?;
            let monitor = Monitor::new(&config, Collaborators::from_config(&config)?);
            let report = monitor.shutdown_sequence().execute().await;
            println!("{report}");
            if !report.terminated() {
                return Err(format!("instance not terminated: {}", report.termination).into());
            }
        }

        Commands::Check { config } => {
            let config = load_config(config.as_deref())?;
            let collaborators = Collaborators::from_config(&config)?;
            println!("Configuration OK");
            println!(
                "Idle below {:.1}% for {} cycles of {} min; status every {} cycles",
                config.monitor.low_usage_threshold,
                config.monitor.consecutive_low_cycles,
                config.monitor.interval_minutes,
                config.monitor.notify_every
            );
            if config.notify.token.is_none() {
                println!("Notifications: log only (SLACK_API_TOKEN not set)");
            }
            match &collaborators.terminator {
                Some(terminator) => match terminator.check_config() {
                    Some(warning) => println!("WARNING: {warning}"),
                    None => println!("Termination: {} ready", terminator.provider()),
                },
                None => println!("Termination: disabled"),
            }
            notify::deliver(
                &*collaborators.notifier,
                &format!("gpu-watchdog configured on instance {}", config.instance.label()),
            )
            .await;
        }
    }

    Ok(())
}
