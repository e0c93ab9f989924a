//! Logging setup for applications embedding the eventing stack.
//!
//! The library itself only emits `tracing` events. Applications that don't
//! install their own subscriber can use [`init_logging`] or
//! [`init_logging_from_env`].

use std::str::FromStr;

use tracing_subscriber::{fmt, EnvFilter, Registry};

/// Where log output goes and how verbose it is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingMode {
    /// No subscriber installed
    Silent,
    /// Compact stderr output at `info`
    Development,
    /// Pretty output at `debug` with source locations
    Debug,
    /// One JSON object per line at `info`, for log collectors
    Json,
}

impl FromStr for LoggingMode {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "silent" => Ok(LoggingMode::Silent),
            "development" | "dev" => Ok(LoggingMode::Development),
            "debug" => Ok(LoggingMode::Debug),
            "json" => Ok(LoggingMode::Json),
            other => Err(LoggingError::InvalidEnv(format!(
                "{}={}",
                LOG_MODE_VAR, other
            ))),
        }
    }
}

/// Logging configuration error
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Failed to initialize tracing subscriber: {0}")]
    TracingInit(String),

    #[error("Invalid environment variable: {0}")]
    InvalidEnv(String),
}

const LOG_MODE_VAR: &str = "UPNP_EVENTING_LOG_MODE";
const LOG_LEVEL_VAR: &str = "UPNP_EVENTING_LOG_LEVEL";

/// Install a global subscriber for `mode`.
///
/// The filter comes from `UPNP_EVENTING_LOG_LEVEL`, then `RUST_LOG`, then
/// the mode's default level. Fails if a global subscriber is already set.
///
/// ```rust,ignore
/// upnp_eventing::logging::init_logging(LoggingMode::Development)?;
/// ```
pub fn init_logging(mode: LoggingMode) -> Result<(), LoggingError> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    match mode {
        LoggingMode::Silent => Ok(()),
        LoggingMode::Development => Registry::default()
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .compact(),
            )
            .with(create_env_filter("info")?)
            .try_init()
            .map_err(|e| LoggingError::TracingInit(e.to_string())),
        LoggingMode::Debug => Registry::default()
            .with(
                fmt::layer()
                    .pretty()
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .with(create_env_filter("debug")?)
            .try_init()
            .map_err(|e| LoggingError::TracingInit(e.to_string())),
        LoggingMode::Json => Registry::default()
            .with(fmt::layer().json().with_current_span(false))
            .with(create_env_filter("info")?)
            .try_init()
            .map_err(|e| LoggingError::TracingInit(e.to_string())),
    }
}

/// Install a subscriber chosen by `UPNP_EVENTING_LOG_MODE`
/// (`silent`, `development`, `debug` or `json`). Unset means silent.
pub fn init_logging_from_env() -> Result<(), LoggingError> {
    let mode = match std::env::var(LOG_MODE_VAR) {
        Ok(value) => value.parse()?,
        Err(_) => LoggingMode::Silent,
    };

    init_logging(mode)
}

fn create_env_filter(default_level: &str) -> Result<EnvFilter, LoggingError> {
    let directives = std::env::var(LOG_LEVEL_VAR)
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| default_level.to_string());

    EnvFilter::try_new(&directives)
        .map_err(|e| LoggingError::InvalidEnv(format!("{}: {}", directives, e)))
}

/// Whether a global subscriber has already been installed.
pub fn is_initialized() -> bool {
    tracing::dispatcher::has_been_set()
}
