use crate::config::LogSettings;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;

pub const LOG_FILE_NAME: &str = "socks-over-http.log";

/// Prefix the SOCKS5 front-end puts on failure lines
pub const ERROR_MARKER: &str = "[ERR] ";

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("fail to make logging directory {}: {source}", dir.display())]
    CreateDir {
        dir: PathBuf,
        source: std::io::Error,
    },

    #[error("fail to open log file in {}: {source}", dir.display())]
    OpenFile { dir: PathBuf, source: InitError },

    #[error("fail to install logger: {0}")]
    Install(Box<dyn std::error::Error + Send + Sync + 'static>),
}

/// Install the process-wide subscriber writing to `<dir>/socks-over-http.log`.
///
/// `RUST_LOG` takes precedence over the configured level. The returned guard
/// flushes the background writer on drop and must outlive every log call.
pub fn init(settings: &LogSettings) -> Result<WorkerGuard, LoggingError> {
    std::fs::create_dir_all(&settings.dir).map_err(|source| LoggingError::CreateDir {
        dir: settings.dir.clone(),
        source,
    })?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(LOG_FILE_NAME)
        .build(&settings.dir)
        .map_err(|source| LoggingError::OpenFile {
            dir: settings.dir.clone(),
            source,
        })?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("soh={}", settings.level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .map_err(LoggingError::Install)?;

    Ok(guard)
}

/// How a plain-text front-end line maps onto a structured log level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Line<'a> {
    Error(&'a str),
    Info(&'a str),
    Empty,
}

pub fn classify(line: &str) -> Line<'_> {
    let line = line.strip_suffix('\n').unwrap_or(line);
    if line.is_empty() {
        return Line::Empty;
    }
    match line.strip_prefix(ERROR_MARKER) {
        Some(message) => Line::Error(message),
        None => Line::Info(line),
    }
}

/// Line sink handed to the SOCKS5 front-end of one listener.
///
/// Every entry is tagged `socks5://<bind addr>`; lines carrying
/// [`ERROR_MARKER`] are logged at error level, everything else at info.
#[derive(Debug, Clone)]
pub struct SocksLog {
    who: Arc<str>,
}

impl SocksLog {
    pub fn new(bind_addr: &str) -> Self {
        Self {
            who: format!("socks5://{}", bind_addr).into(),
        }
    }

    pub fn who(&self) -> &str {
        &self.who
    }

    pub fn line(&self, line: &str) {
        match classify(line) {
            Line::Error(message) => error!(who = %self.who, "{}", message),
            Line::Info(message) => info!(who = %self.who, "{}", message),
            Line::Empty => {}
        }
    }
}
