//! Log sinks for the agent process.
//!
//! Logs go to the configured file, which is rotated by size. Rotated copies
//! are numbered `greeter.log.1`, `greeter.log.2` and so on, newest first, and
//! only `max_backups` of them are kept. Copies older than `max_age_days` are
//! removed when logging starts. Logs are also forwarded to syslog when enabled,
//! and mirrored to stderr while the dev mode marker file exists.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use file_rotate::{compression::Compression, suffix::AppendCount, ContentLimit, FileRotate};
use tracing::warn;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

use crate::config::LoggingConfig;
use crate::{Error, InternalResult};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

const SYSLOG_IDENTITY: &std::ffi::CStr = c"greeter";
const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Installs the global subscriber. `RUST_LOG` overrides `config.level`.
pub fn init(config: &LoggingConfig) -> InternalResult<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let pruned = match (&config.file, config.max_age_days) {
        (Some(path), Some(days)) => {
            prune_backups(path, Duration::from_secs(days * SECS_PER_DAY))
        }
        _ => Ok(Vec::new()),
    };

    tracing_subscriber::registry()
        .with(build_layers(config)?)
        .with(filter)
        .try_init()
        .map_err(|e| Error::internal(format!("Failed to set tracing subscriber: {}", e)))?;

    match pruned {
        Ok(removed) if !removed.is_empty() => {
            tracing::debug!(count = removed.len(), "removed expired log backups")
        }
        Ok(_) => {}
        Err(e) => warn!("Failed to prune log backups: {}", e),
    }
    Ok(())
}

pub fn dev_mode(config: &LoggingConfig) -> bool {
    config.dev_mode_marker.exists()
}

fn build_layers(config: &LoggingConfig) -> InternalResult<Vec<BoxedLayer>> {
    let json = config.format == "json";
    let mut layers: Vec<BoxedLayer> = Vec::new();

    if let Some(path) = &config.file {
        let writer = Mutex::new(rotating_writer(path, config)?);
        let layer = fmt::layer().with_ansi(false).with_writer(writer);
        layers.push(if json {
            layer.json().boxed()
        } else {
            layer.boxed()
        });
    }

    if config.syslog {
        // openlog は一度しか呼べないので二回目以降は None になる
        let syslog =
            syslog_tracing::Syslog::new(SYSLOG_IDENTITY, Default::default(), Default::default());
        match syslog {
            Some(syslog) => layers.push(
                fmt::layer()
                    .with_ansi(false)
                    .without_time()
                    .with_writer(syslog)
                    .boxed(),
            ),
            None => eprintln!("syslog is already initialized, not forwarding logs to it"),
        }
    }

    if dev_mode(config) {
        let layer = fmt::layer().with_ansi(false).with_writer(std::io::stderr);
        layers.push(if json {
            layer.json().boxed()
        } else {
            layer.boxed()
        });
    }

    Ok(layers)
}

fn rotating_writer(path: &Path, config: &LoggingConfig) -> InternalResult<FileRotate<AppendCount>> {
    ensure_writable(path)?;
    Ok(FileRotate::new(
        path,
        AppendCount::new(config.max_backups),
        ContentLimit::Bytes(config.max_size_bytes),
        Compression::None,
        #[cfg(unix)]
        None,
    ))
}

/// `FileRotate` swallows open errors, so the file is opened once up front.
fn ensure_writable(path: &Path) -> InternalResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            Error::internal(format!(
                "Failed to create log directory {}: {}",
                parent.display(),
                e
            ))
        })?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map(drop)
        .map_err(|e| Error::internal(format!("Failed to open log file {}: {}", path.display(), e)))
}

/// Removes rotated copies of `path` last modified more than `max_age` ago.
/// The active file is never touched. Returns the removed paths.
fn prune_backups(path: &Path, max_age: Duration) -> std::io::Result<Vec<PathBuf>> {
    let (Some(dir), Some(name)) = (path.parent(), path.file_name().and_then(|n| n.to_str()))
    else {
        return Ok(Vec::new());
    };
    let dir = if dir.as_os_str().is_empty() {
        Path::new(".")
    } else {
        dir
    };
    let prefix = format!("{}.", name);
    let now = SystemTime::now();

    let mut removed = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(suffix) = file_name.to_str().and_then(|n| n.strip_prefix(&prefix)) else {
            continue;
        };
        if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }

        let modified = entry.metadata()?.modified()?;
        let age = now.duration_since(modified).unwrap_or_default();
        if age > max_age {
            fs::remove_file(entry.path())?;
            removed.push(entry.path());
        }
    }
    Ok(removed)
}
