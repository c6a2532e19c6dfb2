//! Locating the newest training output and its latest log record.
//!
//! Nothing here is an error: a missing base directory, an empty one, a run
//! without a log file or a log with only garbage lines all read as "absent".

use std::{
    fmt,
    fs::File,
    io::{self, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
    time::SystemTime,
};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::config::ResultSettings;

/// Log file written by the trainer inside each run directory.
pub const DEFAULT_LOG_FILE: &str = "logging.jsonl";

/// Field that marks the final summary record of a run.
pub const SUMMARY_MARKER: &str = "model_parameter_info";

/// One JSON object from the training log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Present only on the final summary record (even when `null`).
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub model_parameter_info: Option<Value>,
    /// Everything else, in file order.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Deserialize a field that is present as `Some`, including JSON `null`.
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl LogRecord {
    /// Parse one log line. Only JSON objects are records.
    #[must_use]
    pub fn parse(line: &str) -> Option<Self> {
        serde_json::from_str(line).ok()
    }

    /// Summary records carry model metadata, not progress, and are not worth notifying.
    #[must_use]
    pub fn is_summary(&self) -> bool {
        self.model_parameter_info.is_some()
    }

    /// Numeric value of `name`, if the record has one.
    #[must_use]
    pub fn metric(&self, name: &str) -> Option<f64> {
        self.fields.get(name)?.as_f64()
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}

/// Latest record of a log plus the most recent value of the requested metric,
/// which may come from an older record.
#[derive(Debug, Clone, PartialEq)]
pub struct LatestLog {
    pub record: LogRecord,
    pub metric: Option<f64>,
}

/// Name of the most recently modified immediate subdirectory of `base_path`.
#[must_use]
pub fn latest_directory(base_path: &Path) -> Option<String> {
    let entries = match std::fs::read_dir(base_path) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!("Cannot list {}: {}", base_path.display(), e);
            return None;
        }
    };

    entries
        .filter_map(Result::ok)
        .filter_map(|entry| {
            // Follows symlinks, so a linked run directory counts too
            let meta = std::fs::metadata(entry.path()).ok()?;
            if !meta.is_dir() {
                return None;
            }
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            Some((modified, entry.file_name().to_string_lossy().into_owned()))
        })
        .max_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)))
        .map(|(_, name)| name)
}

/// Latest record of `<directory>/logging.jsonl`.
#[must_use]
pub fn latest_log_record(directory: &Path, metric: Option<&str>) -> Option<LatestLog> {
    scan_log_file(&directory.join(DEFAULT_LOG_FILE), metric)
}

/// Latest record of a newline-delimited JSON file, read backward from the end.
#[must_use]
pub fn scan_log_file(path: &Path, metric: Option<&str>) -> Option<LatestLog> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
        Err(e) => {
            tracing::warn!("Failed to open {}: {}", path.display(), e);
            return None;
        }
    };
    let lines = match ReverseLines::new(file) {
        Ok(lines) => lines,
        Err(e) => {
            tracing::warn!("Failed to read {}: {}", path.display(), e);
            return None;
        }
    };

    let lines = lines.map_while(|line| {
        line.map_err(|e| tracing::warn!("Failed to read {}: {}", path.display(), e))
            .ok()
    });
    scan_newest_first(lines, metric)
}

/// Scan lines from the end. Blank and unparseable lines are skipped; the first
/// record found is the latest one. Scanning continues only until a record with
/// the metric turns up.
pub fn scan_lines<'a, I>(lines: I, metric: Option<&str>) -> Option<LatestLog>
where
    I: DoubleEndedIterator<Item = &'a str>,
{
    scan_newest_first(lines.rev(), metric)
}

/// Same as [`scan_lines`] over raw lines already in newest-first order.
/// Lines that are not valid UTF-8 are skipped like any other garbage.
fn scan_newest_first<I, T>(lines: I, metric: Option<&str>) -> Option<LatestLog>
where
    I: IntoIterator<Item = T>,
    T: AsRef<[u8]>,
{
    let mut latest: Option<LogRecord> = None;
    let mut metric_value = None;

    for line in lines {
        let Ok(line) = std::str::from_utf8(line.as_ref()) else {
            continue;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some(record) = LogRecord::parse(line) else {
            continue;
        };

        if metric_value.is_none()
            && let Some(name) = metric
        {
            metric_value = record.metric(name);
        }
        if latest.is_none() {
            latest = Some(record);
        }
        if metric.is_none() || metric_value.is_some() {
            break;
        }
    }

    latest.map(|record| LatestLog {
        record,
        metric: metric_value,
    })
}

const CHUNK_SIZE: u64 = 64 * 1024;

/// Yields the lines of a seekable reader last to first, without the trailing
/// `\n`, reading fixed-size chunks backward from the end. Memory use is one
/// chunk plus the longest line.
struct ReverseLines<R> {
    reader: R,
    /// Offset of the first byte already read.
    pos: u64,
    /// Bytes from `pos` up to the start of the last line yielded.
    pending: Vec<u8>,
    chunk_size: u64,
    finished: bool,
}

impl<R: Read + Seek> ReverseLines<R> {
    fn new(reader: R) -> io::Result<Self> {
        Self::with_chunk_size(reader, CHUNK_SIZE)
    }

    fn with_chunk_size(mut reader: R, chunk_size: u64) -> io::Result<Self> {
        let pos = reader.seek(SeekFrom::End(0))?;
        Ok(Self {
            reader,
            pos,
            pending: Vec::new(),
            chunk_size: chunk_size.max(1),
            finished: false,
        })
    }

    fn read_previous_chunk(&mut self) -> io::Result<()> {
        let len = self.pos.min(self.chunk_size);
        self.pos -= len;
        self.reader.seek(SeekFrom::Start(self.pos))?;

        let mut chunk = Vec::new();
        self.reader.by_ref().take(len).read_to_end(&mut chunk)?;
        if (chunk.len() as u64) < len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "log file shrank while reading",
            ));
        }
        chunk.extend_from_slice(&self.pending);
        self.pending = chunk;
        Ok(())
    }
}

impl<R: Read + Seek> Iterator for ReverseLines<R> {
    type Item = io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        loop {
            if let Some(newline) = self.pending.iter().rposition(|&b| b == b'\n') {
                let line = self.pending.split_off(newline + 1);
                self.pending.truncate(newline);
                return Some(Ok(line));
            }
            if self.pos == 0 {
                self.finished = true;
                return Some(Ok(std::mem::take(&mut self.pending)));
            }
            if let Err(e) = self.read_previous_chunk() {
                self.finished = true;
                return Some(Err(e));
            }
        }
    }
}

/// What the locator found, ready to be turned into an operator message.
#[derive(Debug, Clone, PartialEq)]
pub enum LogReport {
    NoDirectory,
    NoRecord {
        directory: String,
    },
    /// The run ended with its summary record; nothing to report.
    Summary {
        directory: String,
    },
    Progress {
        directory: String,
        record: LogRecord,
        metric: Option<(String, f64)>,
    },
}

impl LogReport {
    /// Operator text, or `None` for summary records.
    #[must_use]
    pub fn message(&self) -> Option<String> {
        const HEADER: &str = "------- Training log -------";
        match self {
            Self::NoDirectory => Some(format!("{HEADER}\nNo training result directory found.")),
            Self::NoRecord { directory } => {
                Some(format!("{HEADER}\n[{directory}] No log record found yet."))
            }
            Self::Summary { .. } => None,
            Self::Progress {
                directory,
                record,
                metric,
            } => {
                let mut text = format!("{HEADER}\n[{directory}]\n{record}");
                if let Some((name, value)) = metric {
                    text.push_str(&format!("\nlatest {name}: {value}"));
                }
                Some(text)
            }
        }
    }
}

/// Result lookup bound to one base path.
#[derive(Debug, Clone)]
pub struct ResultLocator {
    base_path: PathBuf,
    log_file: String,
    metric: Option<String>,
}

impl ResultLocator {
    #[must_use]
    pub fn new(
        base_path: impl Into<PathBuf>,
        log_file: impl Into<String>,
        metric: Option<String>,
    ) -> Self {
        Self {
            base_path: base_path.into(),
            log_file: log_file.into(),
            metric,
        }
    }

    #[must_use]
    pub fn from_settings(settings: &ResultSettings) -> Self {
        Self::new(
            settings.base_path.clone(),
            settings.log_file.clone(),
            settings.metric_name().map(String::from),
        )
    }

    #[must_use]
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    #[must_use]
    pub fn latest_directory(&self) -> Option<String> {
        latest_directory(&self.base_path)
    }

    #[must_use]
    pub fn latest_log(&self, directory: &str) -> Option<LatestLog> {
        let path = self.base_path.join(directory).join(&self.log_file);
        scan_log_file(&path, self.metric.as_deref())
    }

    /// Locate the newest run and classify its latest record.
    #[must_use]
    pub fn report(&self) -> LogReport {
        let Some(directory) = self.latest_directory() else {
            return LogReport::NoDirectory;
        };
        let Some(latest) = self.latest_log(&directory) else {
            return LogReport::NoRecord { directory };
        };
        if latest.record.is_summary() {
            return LogReport::Summary { directory };
        }

        let metric = self.metric.clone().zip(latest.metric);
        LogReport::Progress {
            directory,
            record: latest.record,
            metric,
        }
    }
}
