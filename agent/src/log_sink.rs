//! Log sinks: durable record of lifecycle and experiment events
//!
//! A sink is injected into every component that reports events; there is no
//! process-wide log handle. Writes never block the caller: the file sink
//! queues lines in a bounded buffer that evicts the oldest pending line when
//! full, and a background task does the actual file I/O.

use serde::Serialize;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Severity of a sink entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARN",
            Severity::Error => "ERROR",
        }
    }
}

/// Anything that can durably record a tagged, leveled entry.
///
/// Implementations must accept concurrent writes and never interleave
/// partial lines.
pub trait LogSink: Send + Sync {
    fn write(&self, source: &str, message: &str, severity: Severity);
}

pub type SharedSink = Arc<dyn LogSink>;

/// Forwards entries to `tracing`, which plays the role of the host event log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn write(&self, source: &str, message: &str, severity: Severity) {
        match severity {
            Severity::Info => info!(source = %source, "{message}"),
            Severity::Warning => warn!(source = %source, "{message}"),
            Severity::Error => error!(source = %source, "{message}"),
        }
    }
}

/// Writes every entry to each inner sink in order
pub struct FanoutSink {
    sinks: Vec<SharedSink>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<SharedSink>) -> Self {
        Self { sinks }
    }
}

impl LogSink for FanoutSink {
    fn write(&self, source: &str, message: &str, severity: Severity) {
        for sink in &self.sinks {
            sink.write(source, message, severity);
        }
    }
}

/// A recorded entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub source: String,
    pub message: String,
    pub severity: Severity,
}

/// Keeps entries in memory
#[derive(Debug, Default)]
pub struct RecordingSink {
    entries: Mutex<Vec<LogEntry>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Entries whose source matches exactly
    pub fn from_source(&self, source: &str) -> Vec<LogEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.source == source)
            .collect()
    }
}

impl LogSink for RecordingSink {
    fn write(&self, source: &str, message: &str, severity: Severity) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(LogEntry {
                source: source.to_string(),
                message: message.to_string(),
                severity,
            });
        }
    }
}

/// Line format used by [`FileSink`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct FileSinkOptions {
    pub path: PathBuf,
    pub format: LogFormat,
    pub queue_capacity: usize,
    /// Rotate once the file grows past this many bytes; 0 disables rotation
    pub max_bytes: u64,
    pub keep_files: u32,
}

#[derive(Serialize)]
struct JsonLine<'a> {
    timestamp: String,
    severity: Severity,
    source: &'a str,
    message: &'a str,
}

struct Queue {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
    dropped: AtomicU64,
    closed: AtomicBool,
    notify: Notify,
}

impl Queue {
    fn new(capacity: usize) -> Self {
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    fn push(&self, line: String) {
        if let Ok(mut lines) = self.lines.lock() {
            while lines.len() >= self.capacity {
                lines.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            lines.push_back(line);
        }
        self.notify.notify_one();
    }

    fn drain(&self) -> Vec<String> {
        self.lines
            .lock()
            .map(|mut lines| lines.drain(..).collect())
            .unwrap_or_default()
    }
}

/// Appends entries to a local file through a bounded drop-oldest queue,
/// rotating the file by size.
#[derive(Clone)]
pub struct FileSink {
    queue: Arc<Queue>,
    format: LogFormat,
}

impl FileSink {
    /// Open the sink and start its writer task. Must be called inside a
    /// tokio runtime. The returned handle completes after [`FileSink::close`]
    /// once every queued line has been written.
    pub fn open(options: FileSinkOptions) -> (Self, JoinHandle<()>) {
        let queue = Arc::new(Queue::new(options.queue_capacity));
        let sink = Self {
            queue: Arc::clone(&queue),
            format: options.format,
        };
        let handle = tokio::spawn(write_loop(queue, options));
        (sink, handle)
    }

    /// Ask the writer task to flush everything queued and exit.
    pub fn close(&self) {
        self.queue.closed.store(true, Ordering::SeqCst);
        self.queue.notify.notify_one();
    }

    /// Number of entries evicted because the queue was full
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    fn format_line(&self, source: &str, message: &str, severity: Severity) -> String {
        let message = flatten(message);
        let timestamp = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        match self.format {
            LogFormat::Text => format!("{timestamp} {} [{source}] {message}", severity.as_str()),
            LogFormat::Json => serde_json::to_string(&JsonLine {
                timestamp,
                severity,
                source,
                message: &message,
            })
            .unwrap_or_else(|_| format!("[{source}] {message}")),
        }
    }
}

impl LogSink for FileSink {
    fn write(&self, source: &str, message: &str, severity: Severity) {
        let line = self.format_line(source, message, severity);
        self.queue.push(line);
    }
}

fn flatten(message: &str) -> String {
    message.replace("\r\n", " ").replace(['\n', '\r'], " ")
}

async fn open_append(path: &Path) -> std::io::Result<(File, u64)> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path).await?;
    let len = file.metadata().await.map(|m| m.len()).unwrap_or(0);
    Ok((file, len))
}

fn rotated_path(path: &Path, index: u32) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}

async fn rotate(path: &Path, keep_files: u32) -> std::io::Result<()> {
    if keep_files == 0 {
        return fs::remove_file(path).await;
    }
    let _ = fs::remove_file(rotated_path(path, keep_files)).await;
    for index in (1..keep_files).rev() {
        let from = rotated_path(path, index);
        if fs::metadata(&from).await.is_ok() {
            fs::rename(&from, rotated_path(path, index + 1)).await?;
        }
    }
    fs::rename(path, rotated_path(path, 1)).await
}

async fn write_loop(queue: Arc<Queue>, options: FileSinkOptions) {
    let (mut file, mut written) = match open_append(&options.path).await {
        Ok(opened) => opened,
        Err(e) => {
            error!("Failed to open log file {}: {e}", options.path.display());
            return;
        }
    };
    let mut reported_drops = 0u64;

    loop {
        let mut batch = queue.drain();
        let dropped = queue.dropped.load(Ordering::Relaxed);
        if dropped > reported_drops {
            batch.insert(
                0,
                format!("[LogSink] dropped {} entries (queue full)", dropped - reported_drops),
            );
            reported_drops = dropped;
        }

        if batch.is_empty() {
            if queue.closed.load(Ordering::SeqCst) {
                break;
            }
            queue.notify.notified().await;
            continue;
        }

        for line in batch {
            let bytes = format!("{line}\n");
            if let Err(e) = file.write_all(bytes.as_bytes()).await {
                warn!("Failed to write to log file: {e}");
                continue;
            }
            written += bytes.len() as u64;

            if options.max_bytes > 0 && written >= options.max_bytes {
                let _ = file.flush().await;
                if let Err(e) = rotate(&options.path, options.keep_files).await {
                    warn!("Log rotation failed for {}: {e}", options.path.display());
                }
                match open_append(&options.path).await {
                    Ok((reopened, len)) => {
                        file = reopened;
                        written = len;
                    }
                    Err(e) => {
                        error!("Failed to reopen log file {}: {e}", options.path.display());
                        return;
                    }
                }
            }
        }
        let _ = file.flush().await;
    }
    let _ = file.flush().await;
}
