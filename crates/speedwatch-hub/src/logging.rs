//! Hub logs go to stdout and, when a log directory is configured, are also
//! appended to `speedwatch-hub.log` there.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::EnvFilter;

pub const LOG_FILE_NAME: &str = "speedwatch-hub.log";
const LEVEL_ENV: &str = "SPEEDWATCH_LOG_LEVEL";

/// Holds the log file open for the life of the process.
pub struct LogGuard {
    path: Option<PathBuf>,
    _file: Option<Arc<File>>,
}

impl LogGuard {
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

/// `--debug` beats `SPEEDWATCH_LOG_LEVEL`, which beats `info`. A set
/// `RUST_LOG` overrides all of them.
pub fn default_directive(debug: bool, env_level: Option<&str>) -> String {
    if debug {
        return "debug".to_string();
    }
    env_level
        .map(str::trim)
        .filter(|level| !level.is_empty())
        .unwrap_or("info")
        .to_string()
}

pub fn init_logging(debug: bool, log_dir: &str) -> LogGuard {
    let env_level = std::env::var(LEVEL_ENV).ok();
    let directive = default_directive(debug, env_level.as_deref());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

    let (guard, writer) = match open_log_file(log_dir) {
        Ok(Some((path, file))) => {
            let file = Arc::new(file);
            let writer = BoxMakeWriter::new(io::stdout.and(file.clone()));
            (
                LogGuard {
                    path: Some(path),
                    _file: Some(file),
                },
                writer,
            )
        }
        Ok(None) => (unlogged(), BoxMakeWriter::new(io::stdout)),
        Err(err) => {
            eprintln!("log_file_error: {err}");
            (unlogged(), BoxMakeWriter::new(io::stdout))
        }
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("log_init_skipped: a global subscriber is already installed");
    }
    guard
}

fn unlogged() -> LogGuard {
    LogGuard {
        path: None,
        _file: None,
    }
}

/// `Ok(None)` when file logging is disabled by a blank directory.
pub fn open_log_file(log_dir: &str) -> io::Result<Option<(PathBuf, File)>> {
    if log_dir.trim().is_empty() {
        return Ok(None);
    }
    let dir = PathBuf::from(log_dir);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(LOG_FILE_NAME);
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    Ok(Some((path, file)))
}
