//! Loader log: a timestamped file plus an in-memory ring of recent entries.

use crate::boot::LogSink;
use log::{Level, LevelFilter, Metadata, Record};
use std::backtrace::Backtrace;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

/// Entries kept in memory.
pub const RING_CAPACITY: usize = 1000;

const LOG_PREFIX: &str = "loader_";

/// Log entry with full details.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub level: Level,
    pub message: String,
    pub target: String,
    pub timestamp: SystemTime,
}

/// `%APPDATA%\Reloaded-II\Logs`, or `./Reloaded-II/Logs` without a config dir.
pub fn default_log_dir() -> PathBuf {
    let mut dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    dir.push("Reloaded-II");
    dir.push("Logs");
    dir
}

/// Logger writing to both a file and the in-memory ring.
pub struct LoaderLog {
    entries: Mutex<VecDeque<LogEntry>>,
    file_logger: Option<env_logger::Logger>,
    path: Option<PathBuf>,
    level: LevelFilter,
}

impl LoaderLog {
    /// Create a log file in `dir`. Falls back to memory only if the file
    /// cannot be created; the loader must start regardless.
    pub fn new(dir: &Path, level: LevelFilter) -> Self {
        match Self::open_file(dir) {
            Ok((file, path)) => {
                let file_logger = env_logger::Builder::new()
                    .filter_level(level)
                    .target(env_logger::Target::Pipe(Box::new(file)))
                    .build();

                Self {
                    entries: Mutex::new(VecDeque::with_capacity(RING_CAPACITY)),
                    file_logger: Some(file_logger),
                    path: Some(path),
                    level,
                }
            }
            Err(e) => {
                eprintln!("Failed to create log file in {}: {}", dir.display(), e);
                Self::memory_only(level)
            }
        }
    }

    pub fn memory_only(level: LevelFilter) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(RING_CAPACITY)),
            file_logger: None,
            path: None,
            level,
        }
    }

    fn open_file(dir: &Path) -> std::io::Result<(fs::File, PathBuf)> {
        fs::create_dir_all(dir)?;

        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let path = dir.join(format!("{}{}.log", LOG_PREFIX, timestamp));
        let file = fs::File::create(&path)?;

        Ok((file, path))
    }

    /// Register `log` as the global logger.
    pub fn install(log: Arc<LoaderLog>) -> anyhow::Result<()> {
        let level = log.level;
        log::set_boxed_logger(Box::new(GlobalLog(log)))
            .map_err(|e| anyhow::anyhow!("Failed to set logger: {}", e))?;
        log::set_max_level(level);
        Ok(())
    }

    /// Snapshot of the in-memory ring, oldest first.
    pub fn entries(&self) -> Vec<LogEntry> {
        match self.entries.lock() {
            Ok(entries) => entries.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }
}

impl log::Log for LoaderLog {
    fn enabled(&self, metadata: &Metadata) -> bool {
        match &self.file_logger {
            Some(logger) => logger.enabled(metadata),
            None => metadata.level() <= self.level,
        }
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        if let Some(logger) = &self.file_logger {
            logger.log(record);
        }

        let entry = LogEntry {
            level: record.level(),
            message: format!("{}", record.args()),
            target: record.target().to_string(),
            timestamp: SystemTime::now(),
        };

        if let Ok(mut entries) = self.entries.lock() {
            if entries.len() == RING_CAPACITY {
                entries.pop_front();
            }
            entries.push_back(entry);
        }
    }

    fn flush(&self) {
        if let Some(logger) = &self.file_logger {
            logger.flush();
        }
    }
}

impl LogSink for LoaderLog {
    fn write_line(&self, line: &str) {
        log::Log::log(
            self,
            &Record::builder()
                .args(format_args!("{}", line))
                .level(Level::Info)
                .target("reloaded")
                .build(),
        );
    }

    fn flush(&self) {
        log::Log::flush(self);
    }

    fn log_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

struct GlobalLog(Arc<LoaderLog>);

impl log::Log for GlobalLog {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.0.enabled(metadata)
    }

    fn log(&self, record: &Record) {
        self.0.log(record);
    }

    fn flush(&self) {
        log::Log::flush(self.0.as_ref());
    }
}

/// Route panics to the log sink, with a backtrace, and flush.
pub fn install_panic_hook(sink: Arc<dyn LogSink>) {
    std::panic::set_hook(Box::new(move |info| {
        let backtrace = Backtrace::force_capture();
        sink.write_line(&format!("Panic: {}\n{}", info, backtrace));
        sink.flush();
    }));
}

/// Delete all but the newest `keep_count` loader logs in `dir`.
/// Returns how many were deleted.
pub fn rotate_logs(dir: &Path, keep_count: usize) -> anyhow::Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }

    let mut logs: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension().and_then(|s| s.to_str()) == Some("log")
                && path
                    .file_name()
                    .and_then(|s| s.to_str())
                    .is_some_and(|name| name.starts_with(LOG_PREFIX))
        })
        .collect();

    // Timestamped names sort chronologically; newest first.
    logs.sort();
    logs.reverse();

    let mut deleted = 0;
    for old in logs.iter().skip(keep_count) {
        match fs::remove_file(old) {
            Ok(()) => {
                log::debug!("Deleted old log: {}", old.display());
                deleted += 1;
            }
            Err(e) => log::warn!("Failed to delete old log {}: {}", old.display(), e),
        }
    }

    Ok(deleted)
}
