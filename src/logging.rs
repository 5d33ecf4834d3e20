//! Logging for the pool and for work item callbacks.
//!
//! Every process (the caller and each worker process) owns its own subscriber;
//! nothing is aggregated across processes.
//!
//! # Environment Variables
//!
//! - `MPWORK_LOG` - Log filter (overrides RUST_LOG)
//! - `MPWORK_LOG_LEVEL` - Log level: error, warn, info, debug, trace
//! - `MPWORK_LOG_FORMAT` - Output format: pretty, compact, json
//! - `MPWORK_LOG_FILE` - Path to log file (in addition to stderr)
//! - `RUST_LOG` - Standard Rust log filter (fallback)
//!
//! # Example
//!
//! ```no_run
//! use mpwork::logging::{LogConfig, init};
//!
//! init(LogConfig::default().with_env_overrides());
//! ```

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Once;

use tracing::{Level, Span};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, MakeWriter, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Target used for events emitted through a [`WorkLogger`].
pub const ITEM_TARGET: &str = "mpwork::item";

/// Extra keyword arguments handed to a [`LoggerInit::WithArgs`] initializer.
pub type LogArgs = serde_json::Map<String, serde_json::Value>;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable pretty format (default)
    #[default]
    Pretty,
    /// Compact single-line format
    Compact,
    /// JSON format for log aggregation systems
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "full" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "Unknown log format: '{}'. Valid options: pretty, compact, json",
                s
            )),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Compact => write!(f, "compact"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Log rotation for file output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogRotation {
    Hourly,
    #[default]
    Daily,
    Never,
}

impl FromStr for LogRotation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            "never" => Ok(Self::Never),
            _ => Err(format!(
                "Unknown log rotation: '{}'. Valid options: hourly, daily, never",
                s
            )),
        }
    }
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

/// Logging configuration.
///
/// This is also the "logger handle" a [`LoggerInit`] callback receives: the
/// callback adjusts it, then the pool installs it once for the process.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base log level (default: INFO)
    pub level: Level,
    /// Log format (default: Pretty)
    pub format: LogFormat,
    /// Path to log file (None = stderr only)
    pub file_path: Option<PathBuf>,
    /// Log rotation for file output (default: Daily)
    pub rotation: LogRotation,
    /// Log span timing on close
    pub span_events: bool,
    /// Custom filter string (overrides level if set)
    pub filter: Option<String>,
    /// Show target module in logs (default: true)
    pub show_target: bool,
    /// Show thread names (default: false)
    pub show_thread_names: bool,
    /// Show line numbers (default: false)
    pub show_line_numbers: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            file_path: None,
            rotation: LogRotation::Daily,
            span_events: false,
            filter: None,
            show_target: true,
            show_thread_names: false,
            show_line_numbers: false,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Default handler for work item loggers: INFO to stderr, thread names shown.
    pub fn for_work_items() -> Self {
        Self {
            show_thread_names: true,
            ..Self::default()
        }
    }

    /// Worker processes that were not asked for a logger only report the
    /// pool's own warnings.
    pub fn for_worker() -> Self {
        Self {
            level: Level::WARN,
            format: LogFormat::Compact,
            show_thread_names: true,
            ..Self::default()
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file(mut self, path: PathBuf) -> Self {
        self.file_path = Some(path);
        self
    }

    pub fn with_rotation(mut self, rotation: LogRotation) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.span_events = enabled;
        self
    }

    pub fn with_filter(mut self, filter: String) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Apply environment variable overrides.
    ///
    /// A filter that is already set (e.g. from `-v` on the command line) wins
    /// over `MPWORK_LOG`, `RUST_LOG` and `MPWORK_LOG_LEVEL`.
    pub fn with_env_overrides(mut self) -> Self {
        if self.filter.is_none() {
            if let Ok(filter) = std::env::var("MPWORK_LOG") {
                self.filter = Some(filter);
            } else if let Ok(filter) = std::env::var("RUST_LOG") {
                self.filter = Some(filter);
            }
        }

        if self.filter.is_none()
            && let Ok(level_str) = std::env::var("MPWORK_LOG_LEVEL")
        {
            self.level = parse_level(&level_str).unwrap_or(self.level);
        }

        if let Ok(format) = std::env::var("MPWORK_LOG_FORMAT")
            && let Ok(f) = format.parse()
        {
            self.format = f;
        }

        if let Ok(path) = std::env::var("MPWORK_LOG_FILE") {
            self.file_path = Some(PathBuf::from(path));
        }

        self
    }

    fn build_filter(&self) -> EnvFilter {
        let fallback = || EnvFilter::new(self.level.to_string().to_lowercase());
        match self.filter {
            Some(ref filter) => EnvFilter::try_new(filter).unwrap_or_else(|_| {
                eprintln!("Warning: Invalid log filter '{}', using default", filter);
                fallback()
            }),
            None => fallback(),
        }
    }
}

/// Parse a log level string.
pub fn parse_level(s: &str) -> Option<Level> {
    match s.to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

fn output_layer<W>(config: &LogConfig, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let span_events = if config.span_events {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_span_events(span_events)
        .with_target(config.show_target)
        .with_thread_names(config.show_thread_names)
        .with_line_number(config.show_line_numbers);

    match config.format {
        LogFormat::Json => layer.json().with_filter(config.build_filter()).boxed(),
        LogFormat::Compact => layer.compact().with_filter(config.build_filter()).boxed(),
        LogFormat::Pretty => layer.with_filter(config.build_filter()).boxed(),
    }
}

fn file_appender(path: &Path, rotation: LogRotation) -> RollingFileAppender {
    let parent = path.parent().unwrap_or(Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("mpwork.log");
    RollingFileAppender::new(rotation.into(), parent, file_name)
}

/// Initialize the global tracing subscriber.
///
/// Logs to stderr, and additionally to `config.file_path` when set.
/// Subsequent calls are silently ignored.
pub fn init(config: LogConfig) {
    let mut layers: Vec<BoxedLayer> = vec![output_layer(&config, std::io::stderr, true)];
    if let Some(path) = config.file_path.as_deref() {
        layers.push(output_layer(
            &config,
            file_appender(path, config.rotation),
            false,
        ));
    }

    // Already initialized (e.g. by the caller in inline mode) is fine.
    let _ = tracing_subscriber::registry().with(layers).try_init();
}

static PROCESS_INIT: Once = Once::new();

/// Initialize logging at most once for this process.
///
/// Returns `true` if this call performed the initialization.
pub fn init_once(config: LogConfig) -> bool {
    let mut ran = false;
    PROCESS_INIT.call_once(|| {
        init(config);
        ran = true;
    });
    ran
}

/// Caller-supplied logging initializer, run once in each process that
/// provides a logger to work item callbacks.
#[derive(Debug, Clone, Copy)]
pub enum LoggerInit {
    /// Receives only the logger handle.
    Plain(fn(&mut LogConfig)),
    /// Receives the logger handle plus the extra keyword arguments.
    WithArgs(fn(&mut LogConfig, &LogArgs)),
}

impl LoggerInit {
    pub fn takes_args(&self) -> bool {
        matches!(self, Self::WithArgs(_))
    }

    /// Same variant wrapping the same function.
    pub fn same_as(&self, other: &LoggerInit) -> bool {
        match (self, other) {
            (Self::Plain(a), Self::Plain(b)) => std::ptr::fn_addr_eq(*a, *b),
            (Self::WithArgs(a), Self::WithArgs(b)) => std::ptr::fn_addr_eq(*a, *b),
            _ => false,
        }
    }

    /// Run the initializer against `config`.
    pub fn apply(&self, config: &mut LogConfig, args: &LogArgs) {
        match self {
            Self::Plain(init) => init(config),
            Self::WithArgs(init) => init(config, args),
        }
    }
}

/// Set up the process logger for work item callbacks.
///
/// The caller's initializer (if any) adjusts the default INFO handler before it
/// is installed. Only the first call in a process installs anything.
pub fn init_work_logging(init: Option<LoggerInit>, args: &LogArgs) -> WorkLogger {
    let mut config = LogConfig::for_work_items().with_env_overrides();
    if let Some(init) = init {
        init.apply(&mut config, args);
    }
    init_once(config);
    WorkLogger::for_process()
}

/// Logger handle passed to work item callbacks that take one.
///
/// Events are emitted under [`ITEM_TARGET`] inside a span carrying the pid.
#[derive(Debug, Clone)]
pub struct WorkLogger {
    span: Span,
}

impl WorkLogger {
    pub fn for_process() -> Self {
        Self {
            span: tracing::info_span!("work", pid = std::process::id()),
        }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn debug(&self, message: impl Display) {
        self.span
            .in_scope(|| tracing::debug!(target: ITEM_TARGET, "{}", message));
    }

    pub fn info(&self, message: impl Display) {
        self.span
            .in_scope(|| tracing::info!(target: ITEM_TARGET, "{}", message));
    }

    pub fn warn(&self, message: impl Display) {
        self.span
            .in_scope(|| tracing::warn!(target: ITEM_TARGET, "{}", message));
    }

    pub fn error(&self, message: impl Display) {
        self.span
            .in_scope(|| tracing::error!(target: ITEM_TARGET, "{}", message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_from_str() {
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("full".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("compact".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_log_rotation_from_str() {
        assert_eq!(
            "hourly".parse::<LogRotation>().unwrap(),
            LogRotation::Hourly
        );
        assert_eq!("never".parse::<LogRotation>().unwrap(), LogRotation::Never);
        assert!("weekly".parse::<LogRotation>().is_err());
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("warning"), Some(Level::WARN));
        assert_eq!(parse_level("INFO"), Some(Level::INFO));
        assert_eq!(parse_level("trace"), Some(Level::TRACE));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn test_presets() {
        let items = LogConfig::for_work_items();
        assert_eq!(items.level, Level::INFO);
        assert!(items.show_thread_names);

        let worker = LogConfig::for_worker();
        assert_eq!(worker.level, Level::WARN);
        assert_eq!(worker.format, LogFormat::Compact);
    }

    #[test]
    fn test_log_config_builder() {
        let config = LogConfig::new()
            .with_level(Level::DEBUG)
            .with_format(LogFormat::Json)
            .with_span_events(true)
            .with_file(PathBuf::from("/tmp/mpwork-test.log"));

        assert_eq!(config.level, Level::DEBUG);
        assert_eq!(config.format, LogFormat::Json);
        assert!(config.span_events);
        assert_eq!(
            config.file_path,
            Some(PathBuf::from("/tmp/mpwork-test.log"))
        );
    }

    fn set_debug(config: &mut LogConfig) {
        config.level = Level::DEBUG;
    }

    fn set_from_args(config: &mut LogConfig, args: &LogArgs) {
        if let Some(level) = args.get("level").and_then(|v| v.as_str()) {
            config.level = parse_level(level).unwrap_or(config.level);
        }
    }

    #[test]
    fn test_logger_init_apply() {
        let mut args = LogArgs::new();
        args.insert("level".into(), "error".into());

        let mut config = LogConfig::default();
        LoggerInit::Plain(set_debug).apply(&mut config, &args);
        assert_eq!(config.level, Level::DEBUG);

        let init = LoggerInit::WithArgs(set_from_args);
        assert!(init.takes_args());
        init.apply(&mut config, &args);
        assert_eq!(config.level, Level::ERROR);
    }
}
