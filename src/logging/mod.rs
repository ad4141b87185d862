//! Logging setup on top of `tracing-subscriber`
//!
//! The library itself only emits `tracing` events. Binaries, benches and tests
//! call [`init_logging_default`] (or [`init_with_config`]) once to install a
//! subscriber.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: full tracing filter, wins over everything else
//!   (e.g. `"graphforge::executor=debug,info"`)
//! - `GRAPHFORGE_LOG_LEVEL`: plain level (error, warn, info, debug, trace)
//! - `GRAPHFORGE_LOG_FORMAT`: `human` or `json`
//! - `GRAPHFORGE_LOG_FILE`: optional path; the file always receives JSON lines

use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use thiserror::Error;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    registry::Registry,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

static SUBSCRIBER_INSTALLED: OnceCell<()> = OnceCell::new();

const LOG_LEVEL_ENV: &str = "GRAPHFORGE_LOG_LEVEL";
const LOG_FORMAT_ENV: &str = "GRAPHFORGE_LOG_FORMAT";
const LOG_FILE_ENV: &str = "GRAPHFORGE_LOG_FILE";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// Errors raised while installing the subscriber
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter: {0}")]
    InvalidFilter(String),

    #[error("cannot open log file {path}: {reason}")]
    LogFile { path: PathBuf, reason: String },

    #[error("a global subscriber is already installed: {0}")]
    AlreadyInstalled(String),
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Parse a level name (case-insensitive)
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Some(LogLevel::Error),
            "warn" | "warning" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            "trace" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    pub fn as_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

/// Console output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

impl LogFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "human" | "pretty" | "text" => Some(LogFormat::Human),
            "json" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

/// Subscriber configuration
#[derive(Debug, Clone, Default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    /// Include file and line in console output
    pub with_file_info: bool,
    /// Emit an event when each span (e.g. a `run`) closes
    pub with_span_events: bool,
    pub log_file: Option<PathBuf>,
}

impl LoggingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `GRAPHFORGE_LOG_*` variables. Unparseable values fall back to
    /// the defaults.
    pub fn from_env() -> Self {
        let level = std::env::var(LOG_LEVEL_ENV)
            .ok()
            .and_then(|s| LogLevel::parse(&s))
            .unwrap_or_default();
        let format = std::env::var(LOG_FORMAT_ENV)
            .ok()
            .and_then(|s| LogFormat::parse(&s))
            .unwrap_or_default();
        let log_file = std::env::var(LOG_FILE_ENV)
            .ok()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        Self {
            level,
            format,
            log_file,
            ..Self::default()
        }
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file_info(mut self, enabled: bool) -> Self {
        self.with_file_info = enabled;
        self
    }

    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    /// Filter used by the subscriber. `RUST_LOG` overrides the level.
    pub fn env_filter(&self) -> Result<EnvFilter, LoggingError> {
        match std::env::var("RUST_LOG") {
            Ok(directives) if !directives.trim().is_empty() => EnvFilter::try_new(directives)
                .map_err(|e| LoggingError::InvalidFilter(e.to_string())),
            _ => Ok(EnvFilter::new(self.level.as_str())),
        }
    }

    fn span_events(&self) -> FmtSpan {
        if self.with_span_events {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }

    fn console_layer(&self) -> BoxedLayer {
        match self.format {
            LogFormat::Json => fmt::layer()
                .json()
                .with_target(false)
                .with_file(self.with_file_info)
                .with_line_number(self.with_file_info)
                .with_span_events(self.span_events())
                .boxed(),
            LogFormat::Human => fmt::layer()
                .with_target(true)
                .with_thread_names(true)
                .with_file(self.with_file_info)
                .with_line_number(self.with_file_info)
                .with_span_events(self.span_events())
                .boxed(),
        }
    }

    fn file_layer(&self, path: &Path) -> Result<BoxedLayer, LoggingError> {
        let open_error = |e: std::io::Error| LoggingError::LogFile {
            path: path.to_path_buf(),
            reason: e.to_string(),
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(open_error)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(open_error)?;

        Ok(fmt::layer()
            .json()
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .with_file(true)
            .with_line_number(true)
            .with_span_events(self.span_events())
            .boxed())
    }

    fn install(&self) -> Result<(), LoggingError> {
        let mut layers = vec![self.console_layer()];
        if let Some(path) = &self.log_file {
            layers.push(self.file_layer(path)?);
        }

        tracing_subscriber::registry()
            .with(layers)
            .with(self.env_filter()?)
            .try_init()
            .map_err(|e| LoggingError::AlreadyInstalled(e.to_string()))
    }
}

/// Install a subscriber configured from the environment.
///
/// Idempotent; failures are swallowed so a host application that already
/// installed its own subscriber keeps it.
pub fn init_logging_default() {
    init_with_config(&LoggingConfig::from_env());
}

/// Install a subscriber with an explicit configuration. Idempotent.
pub fn init_with_config(config: &LoggingConfig) {
    SUBSCRIBER_INSTALLED.get_or_init(|| {
        if let Err(e) = config.install() {
            eprintln!("graphforge: logging not installed: {}", e);
        }
    });
}

/// True once [`init_logging_default`] or [`init_with_config`] ran
pub fn is_initialized() -> bool {
    SUBSCRIBER_INSTALLED.get().is_some()
}
