//! Log setup: stderr plus one file per day, pruned after a week

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const LOG_RETENTION_DAYS: u64 = 7;
const LOG_PREFIX: &str = "reelbot";

pub struct LogDir {
    path: PathBuf,
}

impl LogDir {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn current_log_path(&self) -> PathBuf {
        let today = chrono::Local::now().format("%Y-%m-%d");
        self.path.join(format!("{}.{}.log", LOG_PREFIX, today))
    }

    fn is_log_file(path: &Path) -> bool {
        path.file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(LOG_PREFIX) && name.ends_with(".log"))
    }

    /// Deletes our log files last modified before `cutoff`.
    pub fn remove_older_than(&self, cutoff: SystemTime) -> Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.path)? {
            let path = entry?.path();
            if !path.is_file() || !Self::is_log_file(&path) {
                continue;
            }
            if fs::metadata(&path)?.modified()? >= cutoff {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => eprintln!("Failed to delete old log {}: {}", path.display(), e),
            }
        }
        Ok(removed)
    }

    pub fn cleanup_old_logs(&self) -> Result<usize> {
        let cutoff = SystemTime::now() - Duration::from_secs(LOG_RETENTION_DAYS * 24 * 60 * 60);
        self.remove_older_than(cutoff)
    }
}

pub struct LoggingGuard {
    _guard: WorkerGuard,
}

fn filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"))
    })
}

/// Stderr-only logging for short-lived commands.
pub fn init_stderr(log_level: &str) -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_filter(filter(log_level)))
        .try_init()?;
    Ok(())
}

pub fn init_logging(log_dir: &Path, log_level: &str) -> Result<LoggingGuard> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log dir {}", log_dir.display()))?;
    let logs = LogDir::new(log_dir.to_path_buf());
    let removed = logs.cleanup_old_logs()?;

    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(logs.current_log_path())?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_line_number(true)
        .with_filter(filter(log_level));

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(true)
        .with_filter(filter(log_level));

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .try_init()?;

    if removed > 0 {
        tracing::info!("Cleaned up {} old log file(s)", removed);
    }

    Ok(LoggingGuard { _guard: guard })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_log_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "reelbot-logs-test-{}-{}",
            name,
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).expect("create log dir");
        dir
    }

    #[test]
    fn current_log_is_dated() {
        let logs = LogDir::new(PathBuf::from("/var/log/reelbot"));
        let name = logs.current_log_path();
        let name = name.file_name().and_then(|n| n.to_str()).expect("file name");
        assert!(name.starts_with("reelbot.20"));
        assert!(name.ends_with(".log"));
    }

    #[test]
    fn cleanup_only_touches_own_logs() {
        let dir = temp_log_dir("cleanup");
        fs::write(dir.join("reelbot.2020-01-01.log"), "old").expect("write");
        fs::write(dir.join("notes.txt"), "keep").expect("write");
        fs::write(dir.join("other.2020-01-01.log"), "keep").expect("write");

        // every existing file is older than a cutoff in the future
        let future = SystemTime::now() + Duration::from_secs(60);
        let removed = LogDir::new(dir.clone())
            .remove_older_than(future)
            .expect("cleanup");

        assert_eq!(removed, 1);
        assert!(!dir.join("reelbot.2020-01-01.log").exists());
        assert!(dir.join("notes.txt").exists());
        assert!(dir.join("other.2020-01-01.log").exists());
    }

    #[test]
    fn fresh_logs_survive_retention() {
        let dir = temp_log_dir("retention");
        fs::write(dir.join("reelbot.today.log"), "new").expect("write");
        let removed = LogDir::new(dir.clone()).cleanup_old_logs().expect("cleanup");
        assert_eq!(removed, 0);
        assert!(dir.join("reelbot.today.log").exists());
    }
}
