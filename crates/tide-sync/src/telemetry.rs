use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

fn env_truthy(var: &str) -> Option<bool> {
    std::env::var(var).map(|v| v != "0" && !v.is_empty()).ok()
}

static PERF_ENABLED: Lazy<bool> = Lazy::new(|| env_truthy("TIDE_PERF").unwrap_or(false));

static STATS: Lazy<Mutex<HashMap<&'static str, PerfStat>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

static GAUGES: Lazy<Mutex<HashMap<&'static str, GaugeStat>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

#[derive(Default)]
struct GaugeStat {
    last: u64,
    samples: u64,
}

#[derive(Default)]
struct PerfStat {
    total_ns: u128,
    max_ns: u128,
    count: u64,
}

pub fn enabled() -> bool {
    *PERF_ENABLED
}

pub fn record_duration(label: &'static str, duration: Duration) {
    if !enabled() {
        return;
    }
    let Ok(mut stats) = STATS.lock() else {
        return;
    };
    let entry = stats.entry(label).or_default();
    entry.count += 1;
    let nanos = duration.as_nanos();
    entry.total_ns += nanos;
    if nanos > entry.max_ns {
        entry.max_ns = nanos;
    }
    if entry.count % 50 == 0 {
        let avg_us = (entry.total_ns / entry.count as u128) as f64 / 1_000.0;
        let max_us = entry.max_ns as f64 / 1_000.0;
        tracing::info!(
            target = "tide.perf",
            label,
            count = entry.count,
            avg_us,
            max_us,
            "perf sample"
        );
    }
}

pub fn record_gauge(label: &'static str, value: u64) {
    if !enabled() {
        return;
    }
    let Ok(mut gauges) = GAUGES.lock() else {
        return;
    };
    let entry = gauges.entry(label).or_default();
    entry.last = value;
    entry.samples = entry.samples.saturating_add(1);
    if entry.samples % 50 == 0 {
        tracing::info!(
            target = "tide.perf",
            label,
            gauge = entry.last,
            samples = entry.samples,
            "gauge sample"
        );
    }
}

pub struct PerfGuard {
    label: &'static str,
    start: Instant,
}

impl PerfGuard {
    pub fn new(label: &'static str) -> Option<Self> {
        if !enabled() {
            return None;
        }
        Some(Self {
            label,
            start: Instant::now(),
        })
    }
}

impl Drop for PerfGuard {
    fn drop(&mut self) {
        record_duration(self.label, self.start.elapsed());
    }
}

/// Subscriber setup for hosts that do not install their own.
pub mod logging {
    use std::path::{Path, PathBuf};
    use std::sync::OnceLock;

    use serde::Deserialize;
    use tracing_appender::non_blocking::WorkerGuard;
    use tracing_appender::rolling::{RollingFileAppender, Rotation};
    use tracing_subscriber::EnvFilter;

    use crate::config::LogSettings;

    /// Replaces the derived directives entirely when set.
    pub const FILTER_ENV: &str = "TIDE_LOG_FILTER";

    /// Verbosity of the sync crates. Everything else stays at `warn`.
    #[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
    #[serde(rename_all = "lowercase")]
    pub enum LogLevel {
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    impl LogLevel {
        fn directive(self) -> &'static str {
            match self {
                LogLevel::Error => "error",
                LogLevel::Warn => "warn",
                LogLevel::Info => "info",
                LogLevel::Debug => "debug",
                LogLevel::Trace => "trace",
            }
        }
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("log file path {0:?} does not name a file")]
        NoFileName(PathBuf),
        #[error("failed to open log file: {0}")]
        File(#[from] tracing_appender::rolling::InitError),
        #[error("another global subscriber is already installed")]
        AlreadyInstalled,
    }

    static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    /// Installs a fmt subscriber writing to stderr, or appending to
    /// `settings.file`. Returns `Ok` without doing anything once installed.
    pub fn init(settings: &LogSettings) -> Result<(), InitError> {
        if GUARD.get().is_some() {
            return Ok(());
        }
        let (writer, guard) = match settings.file.as_deref() {
            Some(path) => {
                let (dir, name) = split_log_path(path)?;
                let appender = RollingFileAppender::builder()
                    .rotation(Rotation::NEVER)
                    .filename_prefix(name)
                    .build(dir)?;
                tracing_appender::non_blocking(appender)
            }
            None => tracing_appender::non_blocking(std::io::stderr()),
        };
        tracing_subscriber::fmt()
            .with_env_filter(filter(settings.level))
            .with_ansi(settings.file.is_none())
            .with_writer(writer)
            .try_init()
            .map_err(|_| InitError::AlreadyInstalled)?;
        let _ = GUARD.set(guard);
        Ok(())
    }

    fn filter(level: LogLevel) -> EnvFilter {
        match std::env::var(FILTER_ENV) {
            Ok(directives) if !directives.trim().is_empty() => EnvFilter::new(directives),
            _ => EnvFilter::new(default_directives(level)),
        }
    }

    fn default_directives(level: LogLevel) -> String {
        let level = level.directive();
        format!("warn,tide_sync={level},change_feed={level}")
    }

    fn split_log_path(path: &Path) -> Result<(PathBuf, String), InitError> {
        let name = path
            .file_name()
            .ok_or_else(|| InitError::NoFileName(path.to_path_buf()))?;
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        Ok((dir, name.to_string_lossy().into_owned()))
    }

}
