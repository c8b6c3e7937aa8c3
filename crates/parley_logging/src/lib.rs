//! Logging for the Parley broker.
//!
//! Two log families share one size-capped rotation engine: the broker's
//! own tracing output, and one JSONL stream per spawned reviewer worker.
//! A full live file is archived under an increasing sequence number and
//! the oldest archives are pruned down to the configured backup count.

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde_json::json;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "parley_broker=info,parley_logging=info";
const DEFAULT_MAX_BYTES: u64 = 10 * 1024 * 1024;
const DEFAULT_BACKUPS: usize = 5;

/// Size cap and archive count for one log family.
#[derive(Debug, Clone, Copy)]
pub struct RotationLimit {
    pub max_bytes: u64,
    pub backups: usize,
}

impl RotationLimit {
    fn from_env(bytes_var: &str, backups_var: &str) -> Self {
        Self {
            max_bytes: env_number(bytes_var).unwrap_or(DEFAULT_MAX_BYTES),
            backups: env_number(backups_var).unwrap_or(DEFAULT_BACKUPS as u64) as usize,
        }
    }

    /// Broker tracing log: BROKER_LOG_MAX_BYTES / BROKER_LOG_BACKUPS.
    pub fn broker() -> Self {
        Self::from_env("BROKER_LOG_MAX_BYTES", "BROKER_LOG_BACKUPS")
    }

    /// Per-worker JSONL logs: BROKER_REVIEWER_LOG_MAX_BYTES /
    /// BROKER_REVIEWER_LOG_BACKUPS.
    pub fn reviewer() -> Self {
        Self::from_env(
            "BROKER_REVIEWER_LOG_MAX_BYTES",
            "BROKER_REVIEWER_LOG_BACKUPS",
        )
    }
}

fn env_number(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.trim().parse().ok()
}

/// Logging configuration for the broker binary.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    pub verbose: bool,
}

/// Initialize tracing: rotating file output plus stderr.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let log_dir = ensure_logs_dir().context("Failed to ensure log directory")?;
    let file_log = RotatingLog::open(log_dir, config.app_name, RotationLimit::broker())
        .context("Failed to open broker log")?;

    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let console_filter = if config.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_log)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .init();

    Ok(())
}

/// Broker home directory: ~/.parley_broker (BROKER_HOME override).
pub fn broker_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("BROKER_HOME") {
        return PathBuf::from(override_path);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".parley_broker")
}

/// Logs directory: ~/.parley_broker/logs
pub fn logs_dir() -> PathBuf {
    broker_home().join("logs")
}

/// Per-worker logs directory: ~/.parley_broker/logs/reviewers
pub fn reviewer_log_dir() -> PathBuf {
    logs_dir().join("reviewers")
}

/// Ensure the logs directory tree exists.
pub fn ensure_logs_dir() -> Result<PathBuf> {
    let logs = logs_dir();
    fs::create_dir_all(&logs)
        .with_context(|| format!("Failed to create logs directory: {}", logs.display()))?;
    let reviewers = reviewer_log_dir();
    fs::create_dir_all(&reviewers).with_context(|| {
        format!(
            "Failed to create reviewer logs directory: {}",
            reviewers.display()
        )
    })?;
    Ok(logs)
}

/// A shared, size-capped log file.
///
/// The live file is `<stem>.log`. When a write would push it past the
/// cap it is renamed to `<stem>.log.<seq>` (the sequence only ever
/// grows) and archives beyond the backup count are pruned oldest-first.
/// Cloning shares the underlying file, so a clone can serve directly as
/// a tracing writer.
#[derive(Clone)]
pub struct RotatingLog {
    inner: Arc<Mutex<LogFile>>,
}

struct LogFile {
    dir: PathBuf,
    stem: String,
    limit: RotationLimit,
    file: Option<File>,
    written: u64,
    next_seq: u64,
}

impl RotatingLog {
    pub fn open(dir: PathBuf, name: &str, limit: RotationLimit) -> Result<Self> {
        let inner = LogFile::open(dir, safe_file_stem(name), limit)
            .with_context(|| format!("Failed to open log file for {}", name))?;
        Ok(Self {
            inner: Arc::new(Mutex::new(inner)),
        })
    }

    fn append(&self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log lock poisoned"))?;
        inner.append(buf)?;
        Ok(buf.len())
    }
}

impl Write for RotatingLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.append(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log lock poisoned"))?;
        inner.flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for RotatingLog {
    type Writer = RotatingLog;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

impl LogFile {
    fn open(dir: PathBuf, stem: String, limit: RotationLimit) -> io::Result<Self> {
        fs::create_dir_all(&dir)?;
        let mut log = Self {
            dir,
            stem,
            limit,
            file: None,
            written: 0,
            next_seq: 1,
        };
        log.next_seq = log.archive_seqs().last().map_or(1, |last| last + 1);
        log.reopen()?;
        Ok(log)
    }

    fn live_path(&self) -> PathBuf {
        self.dir.join(format!("{}.log", self.stem))
    }

    fn archive_path(&self, seq: u64) -> PathBuf {
        self.dir.join(format!("{}.log.{}", self.stem, seq))
    }

    /// Existing archive sequence numbers, ascending.
    fn archive_seqs(&self) -> Vec<u64> {
        let prefix = format!("{}.log.", self.stem);
        let mut seqs: Vec<u64> = fs::read_dir(&self.dir)
            .into_iter()
            .flatten()
            .flatten()
            .filter_map(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .and_then(|name| name.strip_prefix(&prefix))
                    .and_then(|suffix| suffix.parse().ok())
            })
            .collect();
        seqs.sort_unstable();
        seqs
    }

    fn reopen(&mut self) -> io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.live_path())?;
        self.written = file.metadata()?.len();
        self.file = Some(file);
        Ok(())
    }

    fn roll(&mut self) -> io::Result<()> {
        self.flush()?;
        self.file = None;

        if self.limit.backups == 0 {
            fs::remove_file(self.live_path())?;
        } else {
            fs::rename(self.live_path(), self.archive_path(self.next_seq))?;
            self.next_seq += 1;
            let seqs = self.archive_seqs();
            for seq in seqs.iter().take(seqs.len().saturating_sub(self.limit.backups)) {
                let _ = fs::remove_file(self.archive_path(*seq));
            }
        }
        self.reopen()
    }

    fn append(&mut self, buf: &[u8]) -> io::Result<()> {
        // A single record larger than the cap still lands in one file.
        if self.written > 0 && self.written + buf.len() as u64 > self.limit.max_bytes {
            self.roll()?;
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "log file unavailable"))?;
        file.write_all(buf)?;
        self.written += buf.len() as u64;
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
        }
        Ok(())
    }
}

/// Captured stdout/stderr of one reviewer worker, one JSON object per
/// line: `{"ts": "...", "stream": "stdout", "line": "..."}`.
#[derive(Clone)]
pub struct WorkerLogSink {
    log: RotatingLog,
}

impl WorkerLogSink {
    /// Open (or append to) the sink for `reviewer_id` under the default
    /// reviewer log directory.
    pub fn open(reviewer_id: &str) -> Result<Self> {
        Self::open_in(reviewer_log_dir(), reviewer_id)
    }

    /// Open a sink rooted at an explicit directory (tests use a tempdir).
    pub fn open_in(dir: PathBuf, reviewer_id: &str) -> Result<Self> {
        let log = RotatingLog::open(dir, reviewer_id, RotationLimit::reviewer())?;
        Ok(Self { log })
    }

    /// Append one captured line from the worker's stdout or stderr.
    pub fn record_line(&self, stream: &str, line: &str) {
        let entry = json!({
            "ts": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            "stream": stream,
            "line": line,
        });
        let _ = self.log.append(format!("{entry}\n").as_bytes());
    }
}

/// Reduce an arbitrary identifier to a filesystem-safe file stem.
fn safe_file_stem(name: &str) -> String {
    let stem: String = name
        .chars()
        .map(|ch| match ch {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => ch,
            _ => '-',
        })
        .collect();
    if stem.is_empty() {
        "log".to_string()
    } else {
        stem
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SMALL: RotationLimit = RotationLimit {
        max_bytes: 64,
        backups: 3,
    };

    #[test]
    fn full_live_file_is_archived() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = RotatingLog::open(dir.path().to_path_buf(), "worker", SMALL).unwrap();

        for _ in 0..4 {
            log.write_all(&[b'x'; 32]).unwrap();
        }
        log.flush().unwrap();

        assert!(dir.path().join("worker.log").exists());
        assert!(dir.path().join("worker.log.1").exists());
    }

    #[test]
    fn archives_are_pruned_to_backup_count() {
        let dir = tempfile::tempdir().unwrap();
        let limit = RotationLimit {
            max_bytes: 16,
            backups: 1,
        };
        let mut log = RotatingLog::open(dir.path().to_path_buf(), "worker", limit).unwrap();

        for _ in 0..10 {
            log.write_all(&[b'y'; 16]).unwrap();
        }
        log.flush().unwrap();

        let archives: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .filter(|name| name.starts_with("worker.log."))
            .collect();
        assert_eq!(archives.len(), 1);
        // Only the most recent archive survives, and the sequence keeps
        // growing across rotations.
        assert!(!dir.path().join("worker.log.1").exists());
    }

    #[test]
    fn zero_backups_discards_full_files() {
        let dir = tempfile::tempdir().unwrap();
        let limit = RotationLimit {
            max_bytes: 16,
            backups: 0,
        };
        let mut log = RotatingLog::open(dir.path().to_path_buf(), "worker", limit).unwrap();

        for _ in 0..4 {
            log.write_all(&[b'z'; 16]).unwrap();
        }
        log.flush().unwrap();

        let archives = std::fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| {
                e.file_name()
                    .to_str()
                    .map_or(false, |n| n.starts_with("worker.log."))
            })
            .count();
        assert_eq!(archives, 0);
        assert!(dir.path().join("worker.log").exists());
    }

    #[test]
    fn sequence_resumes_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut log = RotatingLog::open(dir.path().to_path_buf(), "worker", SMALL).unwrap();
            for _ in 0..4 {
                log.write_all(&[b'a'; 32]).unwrap();
            }
        }
        {
            let mut log = RotatingLog::open(dir.path().to_path_buf(), "worker", SMALL).unwrap();
            for _ in 0..4 {
                log.write_all(&[b'b'; 32]).unwrap();
            }
        }

        // Later rotations never overwrite the earlier archive.
        assert!(dir.path().join("worker.log.1").exists());
        assert!(dir.path().join("worker.log.2").exists());
    }

    #[test]
    fn oversized_single_record_does_not_loop() {
        let dir = tempfile::tempdir().unwrap();
        let limit = RotationLimit {
            max_bytes: 8,
            backups: 2,
        };
        let mut log = RotatingLog::open(dir.path().to_path_buf(), "worker", limit).unwrap();
        log.write_all(&[b'q'; 64]).unwrap();
        log.write_all(&[b'q'; 4]).unwrap();
        assert!(dir.path().join("worker.log.1").exists());
    }

    #[test]
    fn worker_sink_writes_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let sink = WorkerLogSink::open_in(dir.path().to_path_buf(), "codex-r1-abc").unwrap();
        sink.record_line("stdout", "hello from the worker");

        let contents = std::fs::read_to_string(dir.path().join("codex-r1-abc.log")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(contents.trim()).unwrap();
        assert_eq!(parsed["stream"], "stdout");
        assert_eq!(parsed["line"], "hello from the worker");
        assert!(parsed["ts"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn unsafe_characters_are_replaced_in_stems() {
        assert_eq!(safe_file_stem("a/b\\c:d"), "a-b-c-d");
        assert_eq!(safe_file_stem(""), "log");
    }
}
