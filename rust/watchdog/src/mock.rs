//! In-process fakes for the external tools, used by unit tests.

use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
    task::JoinHandle,
};

use crate::{
    notify::{Notifier, NotifyError},
    sampler::{DeviceProbe, ProbeError, UtilizationSample},
    terminate::{TerminateError, Terminator},
    transfer::{Transfer, TransferError},
};

/// Ordered record of every call made to the fakes.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn record(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn notifications(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| e.strip_prefix("notify: ").map(String::from))
            .collect()
    }
}

/// Replays point samples, then fails once the script runs out.
pub struct ScriptedProbe(Mutex<VecDeque<UtilizationSample>>);

impl ScriptedProbe {
    pub fn new(samples: Vec<UtilizationSample>) -> Self {
        Self(Mutex::new(samples.into()))
    }

    /// Each averaged window repeated `samples_per_window` times.
    pub fn windows(windows: &[&[f64]], samples_per_window: usize) -> Self {
        Self::new(
            windows
                .iter()
                .flat_map(|w| std::iter::repeat_n(w.to_vec(), samples_per_window))
                .collect(),
        )
    }
}

#[async_trait]
impl DeviceProbe for ScriptedProbe {
    async fn poll(&self) -> Result<UtilizationSample, ProbeError> {
        self.0
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ProbeError::Exit(None, "script exhausted".into()))
    }
}

pub struct MockNotifier(Journal);

impl MockNotifier {
    pub fn new(journal: Journal) -> Self {
        Self(journal)
    }
}

#[async_trait]
impl Notifier for MockNotifier {
    async fn send(&self, text: &str) -> Result<(), NotifyError> {
        self.0.record(format!("notify: {text}"));
        Ok(())
    }
}

pub struct MockTransfer {
    succeed: bool,
    journal: Journal,
}

impl MockTransfer {
    pub fn new(succeed: bool, journal: Journal) -> Self {
        Self { succeed, journal }
    }
}

#[async_trait]
impl Transfer for MockTransfer {
    async fn copy(&self, source: &Path, destination: &str) -> Result<(), TransferError> {
        self.journal
            .record(format!("copy {} {destination}", source.display()));
        if self.succeed {
            Ok(())
        } else {
            Err(TransferError::Exit(Some(1), "quota exceeded".into()))
        }
    }
}

pub struct MockTerminator {
    succeed: bool,
    journal: Journal,
}

impl MockTerminator {
    pub fn new(succeed: bool, journal: Journal) -> Self {
        Self { succeed, journal }
    }
}

#[async_trait]
impl Terminator for MockTerminator {
    fn provider(&self) -> &'static str {
        "Mock"
    }

    fn instance_id(&self) -> Option<&str> {
        Some("i-123")
    }

    fn check_config(&self) -> Option<String> {
        None
    }

    async fn terminate(&self) -> Result<String, TerminateError> {
        self.journal.record("terminate");
        if self.succeed {
            Ok("{\"data\":{\"terminated_instances\":[]}}".into())
        } else {
            Err(TerminateError::Status(500, "internal error".into()))
        }
    }
}

/// One HTTP request as received by [`serve_once`].
#[derive(Debug)]
pub struct CapturedRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl CapturedRequest {
    /// Header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body).unwrap()
    }
}

/// Serve a single canned HTTP/1.1 response on a loopback port.
///
/// Returns the base URL and a handle resolving to the captured request.
pub async fn serve_once(
    status: &'static str,
    body: &'static str,
) -> (String, JoinHandle<CapturedRequest>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut raw = Vec::new();
        let mut buf = [0u8; 4096];
        let (head_end, content_length) = loop {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "connection closed before the request was complete");
            raw.extend_from_slice(&buf[..n]);
            if let Some(end) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&raw[..end]).to_ascii_lowercase();
                let length = head
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                break (end, length);
            }
        };
        while raw.len() < head_end + 4 + content_length {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "connection closed before the body was complete");
            raw.extend_from_slice(&buf[..n]);
        }

        let response = format!(
            "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(response.as_bytes()).await.unwrap();
        stream.shutdown().await.ok();

        let head = String::from_utf8_lossy(&raw[..head_end]).into_owned();
        let mut lines = head.split("\r\n");
        let mut request_line = lines.next().unwrap().split_whitespace();
        let method = request_line.next().unwrap().to_string();
        let path = request_line.next().unwrap().to_string();
        let headers = lines
            .filter_map(|l| l.split_once(':'))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect();
        let body = String::from_utf8_lossy(&raw[head_end + 4..]).into_owned();

        CapturedRequest {
            method,
            path,
            headers,
            body,
        }
    });

    (format!("http://{addr}"), handle)
}

/// Executable that records its PID in `pid_file` and then hangs.
#[cfg(unix)]
pub fn hanging_script(dir: &Path, pid_file: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let script = dir.join("hang.sh");
    std::fs::write(
        &script,
        format!("#!/bin/sh\necho $$ > '{}'\nexec sleep 30\n", pid_file.display()),
    )
    .unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    script
}

/// Wait up to five seconds for the process recorded in `pid_file` to be gone
/// or a zombie.
#[cfg(target_os = "linux")]
pub async fn process_exits(pid_file: &Path) -> bool {
    let pid = std::fs::read_to_string(pid_file).unwrap();
    let stat = format!("/proc/{}/stat", pid.trim());
    for _ in 0..50 {
        match std::fs::read_to_string(&stat) {
            Err(_) => return true,
            // The state field follows the parenthesised command name
            Ok(content) if content.rsplit(')').next().unwrap().trim_start().starts_with('Z') => {
                return true;
            }
            Ok(_) => tokio::time::sleep(std::time::Duration::from_millis(100)).await,
        }
    }
    false
}
