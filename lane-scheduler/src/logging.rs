//! Logging setup for applications driving a lane scheduler
//!
//! The scheduler logs through `tracing`. Hosts that already install a
//! subscriber need nothing from this module; the rest can pick one of the
//! [`LoggingMode`]s here.

use tracing_subscriber::{fmt, EnvFilter, Registry};

/// Logging mode for different use cases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingMode {
    /// Install nothing; all events are dropped
    Silent,
    /// Compact stderr output at info level
    Development,
    /// Verbose output with thread ids and source locations
    Debug,
    /// One JSON object per line, for log shippers
    Json,
}

impl std::str::FromStr for LoggingMode {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "silent" => Ok(LoggingMode::Silent),
            "development" | "dev" => Ok(LoggingMode::Development),
            "debug" => Ok(LoggingMode::Debug),
            "json" => Ok(LoggingMode::Json),
            other => Err(LoggingError::InvalidEnv(format!(
                "{MODE_VAR}={other}"
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

const MODE_VAR: &str = "LANES_LOG_MODE";
const LEVEL_VAR: &str = "LANES_LOG_LEVEL";

/// Initialize logging with the specified mode
///
/// Call this once, before creating a scheduler.
///
/// # Examples
///
/// ```rust,ignore
/// lane_scheduler::logging::init_logging(LoggingMode::Development)?;
/// ```
///
/// # Environment Variables
///
/// - `LANES_LOG_LEVEL`: filter directives, e.g. `debug` or `lane_scheduler=trace`
/// - `RUST_LOG`: used when `LANES_LOG_LEVEL` is unset
pub fn init_logging(mode: LoggingMode) -> Result<(), LoggingError> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let result = match mode {
        LoggingMode::Silent => return Ok(()),
        LoggingMode::Development => Registry::default()
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .compact(),
            )
            .with(create_env_filter("info"))
            .try_init(),
        LoggingMode::Debug => Registry::default()
            .with(
                fmt::layer()
                    .pretty()
                    .with_thread_names(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .with(create_env_filter("debug"))
            .try_init(),
        LoggingMode::Json => Registry::default()
            .with(fmt::layer().json().with_current_span(false))
            .with(create_env_filter("info"))
            .try_init(),
    };

    result.map_err(|e| LoggingError::TracingInit(e.to_string()))
}

/// Initialize logging from the `LANES_LOG_MODE` environment variable
///
/// Accepts `silent`, `development`, `debug` and `json`. Unset means silent;
/// any other value is an error.
pub fn init_logging_from_env() -> Result<(), LoggingError> {
    let mode = match std::env::var(MODE_VAR) {
        Ok(value) => value.parse()?,
        Err(_) => LoggingMode::Silent,
    };
    init_logging(mode)
}

fn create_env_filter(default_level: &str) -> EnvFilter {
    // LANES_LOG_LEVEL, then RUST_LOG, then the mode's default
    if let Ok(level) = std::env::var(LEVEL_VAR) {
        EnvFilter::new(level)
    } else if let Ok(rust_log) = std::env::var("RUST_LOG") {
        EnvFilter::new(rust_log)
    } else {
        EnvFilter::new(default_level)
    }
}

/// Check if a global subscriber has been installed
pub fn is_initialized() -> bool {
    tracing::dispatcher::has_been_set()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_silent_mode() {
        assert!(init_logging(LoggingMode::Silent).is_ok());
    }

    #[rstest]
    #[case("silent", LoggingMode::Silent)]
    #[case("Development", LoggingMode::Development)]
    #[case("dev", LoggingMode::Development)]
    #[case("DEBUG", LoggingMode::Debug)]
    #[case("json", LoggingMode::Json)]
    fn test_parse_mode(#[case] input: &str, #[case] expected: LoggingMode) {
        assert_eq!(input.parse::<LoggingMode>().unwrap(), expected);
    }

    #[test]
    fn test_parse_invalid_mode() {
        let err = "verbose".parse::<LoggingMode>().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid environment variable: LANES_LOG_MODE=verbose"
        );
    }
}
