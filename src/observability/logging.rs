use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Severity levels accepted by the driver log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Returns the canonical uppercase representation.
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = LoggingError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_uppercase().as_str() {
            "TRACE" => Ok(LogLevel::Trace),
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARN" | "WARNING" => Ok(LogLevel::Warn),
            "ERROR" => Ok(LogLevel::Error),
            other => Err(LoggingError::UnknownLevel(other.to_string())),
        }
    }
}

/// Rotation policy for file sinks (default 256 MiB × 4 files).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRotationPolicy {
    pub max_bytes: usize,
    pub max_files: usize,
}

impl Default for LogRotationPolicy {
    fn default() -> Self {
        Self {
            max_bytes: 256 << 20,
            max_files: 4,
        }
    }
}

/// Accumulated log lines for an in-memory segment.
#[derive(Debug, Default, Clone)]
pub struct LogFile {
    lines: Vec<String>,
    bytes_written: usize,
}

impl LogFile {
    /// Lines contained within the segment.
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Total bytes recorded before rotation.
    pub fn bytes_written(&self) -> usize {
        self.bytes_written
    }
}

/// Destination for serialized log lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSink {
    Stderr,
    File(PathBuf),
    Memory,
}

#[derive(Debug)]
enum SinkState {
    Stderr,
    File {
        path: PathBuf,
        file: File,
        bytes_written: usize,
    },
    Memory {
        files: VecDeque<LogFile>,
        active: LogFile,
    },
}

/// JSON-line logger with size-based rotation.
#[derive(Debug)]
pub struct JsonLineLogger {
    policy: LogRotationPolicy,
    current_level: LogLevel,
    sink: SinkState,
}

impl JsonLineLogger {
    /// Creates a logger writing to the provided sink.
    pub fn new(sink: LogSink, policy: LogRotationPolicy) -> Result<Self, LoggingError> {
        let sink = match sink {
            LogSink::Stderr => SinkState::Stderr,
            LogSink::Memory => SinkState::Memory {
                files: VecDeque::new(),
                active: LogFile::default(),
            },
            LogSink::File(path) => {
                let file = open_append(&path)?;
                let bytes_written = file
                    .metadata()
                    .map(|meta| meta.len() as usize)
                    .unwrap_or(0);
                SinkState::File {
                    path,
                    file,
                    bytes_written,
                }
            }
        };
        Ok(Self {
            policy,
            current_level: LogLevel::Info,
            sink,
        })
    }

    /// In-memory logger used by tests and embedded callers.
    pub fn in_memory(policy: LogRotationPolicy) -> Self {
        Self {
            policy,
            current_level: LogLevel::Info,
            sink: SinkState::Memory {
                files: VecDeque::new(),
                active: LogFile::default(),
            },
        }
    }

    /// Returns the current minimum level.
    pub fn level(&self) -> LogLevel {
        self.current_level
    }

    /// Applies a log-level override.
    pub fn set_level(&mut self, level: LogLevel) {
        self.current_level = level;
    }

    /// Emits a JSON-line log entry.
    pub fn log(&mut self, record: &LogRecord<'_>) -> Result<(), LoggingError> {
        if record.level < self.current_level {
            return Ok(());
        }
        let line = serde_json::to_string(record).map_err(LoggingError::Serialize)?;
        self.write_line(line)
    }

    /// Returns rotated + active in-memory segments; empty for stream sinks.
    pub fn files(&self) -> Vec<&LogFile> {
        match &self.sink {
            SinkState::Memory { files, active } => {
                files.iter().chain(std::iter::once(active)).collect()
            }
            _ => Vec::new(),
        }
    }

    fn write_line(&mut self, line: String) -> Result<(), LoggingError> {
        let policy = self.policy;
        match &mut self.sink {
            SinkState::Stderr => {
                let mut stderr = io::stderr().lock();
                writeln!(stderr, "{line}").map_err(LoggingError::Io)?;
            }
            SinkState::Memory { files, active } => {
                if active.bytes_written + line.len() > policy.max_bytes {
                    if !active.lines.is_empty() {
                        files.push_back(std::mem::take(active));
                        while files.len() > policy.max_files {
                            files.pop_front();
                        }
                    }
                    *active = LogFile::default();
                }
                active.bytes_written = active.bytes_written.saturating_add(line.len());
                active.lines.push(line);
            }
            SinkState::File {
                path,
                file,
                bytes_written,
            } => {
                if *bytes_written > 0 && *bytes_written + line.len() + 1 > policy.max_bytes {
                    rotate_files(path, policy.max_files)?;
                    *file = open_append(path)?;
                    *bytes_written = 0;
                }
                writeln!(file, "{line}").map_err(LoggingError::Io)?;
                *bytes_written = bytes_written.saturating_add(line.len() + 1);
            }
        }
        Ok(())
    }
}

fn open_append(path: &Path) -> Result<File, LoggingError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(LoggingError::Io)?;
        }
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(LoggingError::Io)
}

fn rotated_path(path: &Path, generation: usize) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{generation}"));
    PathBuf::from(name)
}

fn rotate_files(path: &Path, max_files: usize) -> Result<(), LoggingError> {
    if max_files == 0 {
        return fs::remove_file(path).map_err(LoggingError::Io);
    }
    let oldest = rotated_path(path, max_files);
    if oldest.exists() {
        fs::remove_file(&oldest).map_err(LoggingError::Io)?;
    }
    for generation in (1..max_files).rev() {
        let from = rotated_path(path, generation);
        if from.exists() {
            fs::rename(&from, rotated_path(path, generation + 1)).map_err(LoggingError::Io)?;
        }
    }
    fs::rename(path, rotated_path(path, 1)).map_err(LoggingError::Io)
}

/// Serialized shape of a single log line.
#[derive(Debug, Serialize)]
pub struct LogRecord<'a> {
    pub ts: u64,
    pub level: LogLevel,
    pub module: &'a str,
    pub run_id: &'a str,
    pub message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<&'a Map<String, Value>>,
}

impl Serialize for LogLevel {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Cloneable handle shared by every component of a run.
#[derive(Debug, Clone)]
pub struct DriverLog {
    inner: Arc<Mutex<JsonLineLogger>>,
    module: Arc<str>,
    run_id: Arc<str>,
}

impl DriverLog {
    /// Wraps a logger under the given module and run identifiers.
    pub fn new(logger: JsonLineLogger, module: &str, run_id: &str) -> Self {
        Self {
            inner: Arc::new(Mutex::new(logger)),
            module: Arc::from(module),
            run_id: Arc::from(run_id),
        }
    }

    /// In-memory log, mostly for tests.
    pub fn capture(module: &str) -> Self {
        Self::new(
            JsonLineLogger::in_memory(LogRotationPolicy::default()),
            module,
            "capture",
        )
    }

    /// Returns a handle that tags lines with a different module name.
    pub fn for_module(&self, module: &str) -> Self {
        Self {
            inner: self.inner.clone(),
            module: Arc::from(module),
            run_id: self.run_id.clone(),
        }
    }

    /// Returns a handle that tags lines with a different run identifier.
    pub fn for_run(&self, run_id: &str) -> Self {
        Self {
            inner: self.inner.clone(),
            module: self.module.clone(),
            run_id: Arc::from(run_id),
        }
    }

    pub fn set_level(&self, level: LogLevel) {
        self.inner.lock().unwrap().set_level(level);
    }

    pub fn debug(&self, message: &str) {
        self.emit(LogLevel::Debug, message, None);
    }

    pub fn info(&self, message: &str) {
        self.emit(LogLevel::Info, message, None);
    }

    pub fn warn(&self, message: &str) {
        self.emit(LogLevel::Warn, message, None);
    }

    pub fn error(&self, message: &str) {
        self.emit(LogLevel::Error, message, None);
    }

    /// Emits a line with an attached structured `fields` object.
    pub fn event(&self, level: LogLevel, message: &str, fields: Value) {
        match fields {
            Value::Object(map) => self.emit(level, message, Some(&map)),
            Value::Null => self.emit(level, message, None),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                self.emit(level, message, Some(&map));
            }
        }
    }

    /// Copies every captured line (in-memory sinks only).
    pub fn captured_lines(&self) -> Vec<String> {
        let guard = self.inner.lock().unwrap();
        guard
            .files()
            .into_iter()
            .flat_map(|file| file.lines().iter().cloned())
            .collect()
    }

    fn emit(&self, level: LogLevel, message: &str, fields: Option<&Map<String, Value>>) {
        let record = LogRecord {
            ts: epoch_ms(),
            level,
            module: &self.module,
            run_id: &self.run_id,
            message,
            fields,
        };
        // Logging failures must never take down a run.
        let _ = self.inner.lock().unwrap().log(&record);
    }
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}

/// Errors surfaced while writing JSON-line logs.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to serialize log record: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("log sink i/o failure: {0}")]
    Io(io::Error),
    #[error("unknown log level '{0}'")]
    UnknownLevel(String),
}
