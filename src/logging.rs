//! Logging setup for the broker.
//!
//! Installs an `env_logger` logger that writes every record to stderr and, when
//! a log directory is configured, to a dated log file with size-based rotation
//! and cleanup of old files.

use chrono::{Local, NaiveDate};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Maximum log file size before rotation (5MB)
const MAX_LOG_SIZE: u64 = 5 * 1024 * 1024;

/// Maximum number of log files to keep
pub const MAX_LOG_FILES: usize = 5;

lazy_static::lazy_static! {
    /// Set once the global logger has been installed.
    static ref LOGGER_INSTALLED: Mutex<bool> = Mutex::new(false);
}

/// Initialize logging. Filter comes from `RUST_LOG`, default `info`.
///
/// Calling this again after a successful initialization is a no-op.
pub fn init_logging(log_dir: Option<&Path>) -> io::Result<()> {
    let mut installed = LOGGER_INSTALLED.lock();
    if *installed {
        return Ok(());
    }

    let file = match log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            cleanup_old_logs(dir);
            Some(LogFile::open(dir.to_path_buf())?)
        }
        None => None,
    };

    let sink = LogSink { file };

    let env = env_logger::Env::default().default_filter_or("info");
    let result = env_logger::Builder::from_env(env)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] [{}] {}",
                Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.args()
            )
        })
        .target(env_logger::Target::Pipe(Box::new(sink)))
        .try_init();

    // Another logger may already own the facade (host application, tests).
    if let Err(e) = result {
        eprintln!("[LOGGING] logger already installed: {}", e);
    }
    *installed = true;

    log::info!("[BROKER] Logging initialized");
    if let Some(dir) = log_dir {
        log::info!("[BROKER] Log directory: {:?}", dir);
    }
    Ok(())
}

/// Path of today's log file.
pub fn current_log_path(log_dir: &Path) -> PathBuf {
    dated_log_path(log_dir, Local::now().date_naive())
}

fn dated_log_path(log_dir: &Path, date: NaiveDate) -> PathBuf {
    log_dir.join(format!("framebroker_{}.log", date.format("%Y-%m-%d")))
}

/// Keep only the newest MAX_LOG_FILES `.log` files.
fn cleanup_old_logs(log_dir: &Path) {
    if let Ok(entries) = fs::read_dir(log_dir) {
        let mut log_files: Vec<_> = entries
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.path()
                    .extension()
                    .map(|ext| ext == "log")
                    .unwrap_or(false)
            })
            .collect();

        // Newest first
        log_files.sort_by(|a, b| {
            let a_time = a.metadata().and_then(|m| m.modified()).ok();
            let b_time = b.metadata().and_then(|m| m.modified()).ok();
            b_time.cmp(&a_time)
        });

        for file in log_files.into_iter().skip(MAX_LOG_FILES) {
            let _ = fs::remove_file(file.path());
        }
    }
}

// ============================================================================
// Sink
// ============================================================================

struct LogFile {
    dir: PathBuf,
    /// Dated path `file` was opened at.
    path: PathBuf,
    file: File,
}

impl LogFile {
    fn open(dir: PathBuf) -> io::Result<Self> {
        let path = current_log_path(&dir);
        Self::open_at(dir, path)
    }

    fn open_at(dir: PathBuf, path: PathBuf) -> io::Result<Self> {
        let file = append_to(&path)?;
        Ok(Self { dir, path, file })
    }

    /// Move to a new file when the date changed or the current one is full.
    fn rotate_if_needed(&mut self) {
        let today = current_log_path(&self.dir);
        if today != self.path {
            if let Ok(file) = append_to(&today) {
                self.file = file;
                self.path = today;
                cleanup_old_logs(&self.dir);
            }
            return;
        }

        let oversized = fs::metadata(&self.path)
            .map(|m| m.len() > MAX_LOG_SIZE)
            .unwrap_or(false);
        if !oversized {
            return;
        }

        let timestamp = Local::now().format("%Y-%m-%d_%H%M%S");
        let rotated = self.dir.join(format!("framebroker_{}.log", timestamp));
        let _ = fs::rename(&self.path, &rotated);

        if let Ok(file) = append_to(&self.path) {
            self.file = file;
        }
        cleanup_old_logs(&self.dir);
    }
}

fn append_to(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Writes to stderr and the log file.
struct LogSink {
    file: Option<LogFile>,
}

impl Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = io::stderr().write_all(buf);
        if let Some(log) = self.file.as_mut() {
            let _ = log.file.write_all(buf);
            log.rotate_if_needed();
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(log) = self.file.as_mut() {
            log.file.flush()?;
        }
        io::stderr().flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_file_name_is_dated() {
        let path = current_log_path(Path::new("logs"));
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("framebroker_"));
        assert!(name.ends_with(".log"));
        assert_eq!(name.len(), "framebroker_2024-01-01.log".len());
    }

    #[test]
    fn test_date_change_switches_file() {
        let dir = tempfile::tempdir().unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let yesterday = dated_log_path(dir.path(), date);
        let mut log = LogFile::open_at(dir.path().into(), yesterday.clone()).unwrap();
        log.file.write_all(b"old day\n").unwrap();

        log.rotate_if_needed();
        log.file.write_all(b"new day\n").unwrap();
        log.file.flush().unwrap();

        let today = current_log_path(dir.path());
        assert_eq!(log.path, today);
        assert_eq!(fs::read_to_string(&yesterday).unwrap(), "old day\n");
        assert_eq!(fs::read_to_string(&today).unwrap(), "new day\n");
    }

    #[test]
    fn test_cleanup_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..(MAX_LOG_FILES + 3) {
            fs::write(dir.path().join(format!("old_{}.log", i)), "x").unwrap();
        }
        fs::write(dir.path().join("notes.txt"), "keep").unwrap();

        cleanup_old_logs(dir.path());

        let logs = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|x| x == "log"))
            .count();
        assert_eq!(logs, MAX_LOG_FILES);
        assert!(dir.path().join("notes.txt").exists());
    }

    #[test]
    fn test_init_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        init_logging(Some(dir.path())).unwrap();
        init_logging(None).unwrap();
    }
}
