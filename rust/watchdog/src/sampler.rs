//! GPU utilization sampling.
//!
//! A window is a fixed number of point samples taken a fixed delay apart and
//! averaged per device. Unreadable device values count as 0%. The first point
//! sample fixes the device count; a window whose device count changes midway
//! fails instead of guessing which device is which.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use tokio::process::Command;

/// Point samples per window unless configured otherwise.
pub const DEFAULT_SAMPLES_PER_WINDOW: usize = 6;

const QUERY_ARGS: [&str; 2] = [
    "--query-gpu=utilization.gpu",
    "--format=csv,noheader,nounits",
];

/// Per-device utilization percentages at one instant.
pub type UtilizationSample = Vec<f64>;

/// Source of point samples.
#[async_trait]
pub trait DeviceProbe: Send + Sync {
    /// Read the current utilization of every device at once.
    async fn poll(&self) -> Result<UtilizationSample, ProbeError>;
}

/// Probe backed by `nvidia-smi`.
pub struct NvidiaSmi {
    /// Path or name of the nvidia-smi binary.
    binary: String,
    /// Upper bound for one query.
    timeout: Duration,
}

impl NvidiaSmi {
    #[must_use]
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }
}

#[async_trait]
impl DeviceProbe for NvidiaSmi {
    async fn poll(&self) -> Result<UtilizationSample, ProbeError> {
        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.binary)
                .args(QUERY_ARGS)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| ProbeError::Timeout(self.timeout))?
        .map_err(|e| ProbeError::Spawn(self.binary.clone(), e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProbeError::Exit(output.status.code(), stderr.trim().to_string()));
        }

        Ok(parse_readings(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Parse one utilization value per line. Lines that are not a finite number
/// (`[N/A]`, `[Not Supported]`, garbage) read as 0.0.
#[must_use]
pub fn parse_readings(text: &str) -> UtilizationSample {
    text.trim()
        .lines()
        .map(|line| {
            line.trim()
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .unwrap_or(0.0)
        })
        .collect()
}

/// Mean utilization per device over one window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AveragedUtilization(Vec<f64>);

impl AveragedUtilization {
    #[must_use]
    pub fn new(values: Vec<f64>) -> Self {
        Self(values)
    }

    #[must_use]
    pub fn values(&self) -> &[f64] {
        &self.0
    }

    #[must_use]
    pub fn device_count(&self) -> usize {
        self.0.len()
    }

    /// True if there is at least one device and every device is strictly below `threshold`.
    #[must_use]
    pub fn all_below(&self, threshold: f64) -> bool {
        !self.0.is_empty() && self.0.iter().all(|usage| *usage < threshold)
    }
}

impl fmt::Display for AveragedUtilization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, usage) in self.0.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}: {usage:.1}%", idx + 1)?;
        }
        Ok(())
    }
}

/// Average a window of samples per device index.
///
/// The device count is taken from the first sample; callers must make sure
/// every sample has the same length.
#[must_use]
pub fn average_window(window: &[UtilizationSample]) -> AveragedUtilization {
    let Some(first) = window.first() else {
        return AveragedUtilization::default();
    };

    let mut sums = vec![0.0; first.len()];
    for sample in window {
        for (sum, usage) in sums.iter_mut().zip(sample) {
            *sum += usage;
        }
    }

    let n = window.len() as f64;
    AveragedUtilization(sums.into_iter().map(|sum| sum / n).collect())
}

/// Takes sample windows from a probe.
pub struct Sampler {
    probe: Box<dyn DeviceProbe>,
    samples: usize,
    delay: Duration,
}

impl Sampler {
    #[must_use]
    pub fn new(probe: Box<dyn DeviceProbe>, samples: usize, delay: Duration) -> Self {
        Self {
            probe,
            samples: samples.max(1),
            delay,
        }
    }

    /// Take exactly `samples` point samples `delay` apart and average them.
    ///
    /// A failed poll aborts the window; there is no retry inside a window.
    pub async fn sample_window(&self) -> Result<AveragedUtilization, SampleError> {
        let mut window: Vec<UtilizationSample> = Vec::with_capacity(self.samples);

        for i in 0..self.samples {
            if i > 0 && !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            let sample = self.probe.poll().await?;
            match window.first() {
                None if sample.is_empty() => return Err(SampleError::NoDevices),
                Some(first) if first.len() != sample.len() => {
                    return Err(SampleError::DeviceCountChanged {
                        expected: first.len(),
                        found: sample.len(),
                        sample: i,
                    });
                }
                _ => {}
            }
            tracing::trace!("Point sample {}/{}: {:?}", i + 1, self.samples, sample);
            window.push(sample);
        }

        Ok(average_window(&window))
    }
}

/// Errors from a single poll of the device tool.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("failed to run {0}: {1}")]
    Spawn(String, std::io::Error),
    #[error("device query exited with {0:?}: {1}")]
    Exit(Option<i32>, String),
    #[error("device query timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors that abort a sample window.
#[derive(Debug, thiserror::Error)]
pub enum SampleError {
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error("device query reported no devices")]
    NoDevices,
    #[error("device count changed from {expected} to {found} at point sample {sample}")]
    DeviceCountChanged {
        expected: usize,
        found: usize,
        sample: usize,
    },
}
