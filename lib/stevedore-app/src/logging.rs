//! Logging.

use std::io::IsTerminal as _;

use stevedore_error::{generic_error, GenericError};
use tracing::Subscriber;
use tracing_subscriber::{
    filter::LevelFilter, layer::SubscriberExt as _, registry::LookupSpan, util::SubscriberInitExt as _, EnvFilter,
    Layer,
};

const LOG_LEVEL_ENV_VAR: &str = "STEVEDORE_LOG_LEVEL";
const LOG_FORMAT_JSON_ENV_VAR: &str = "STEVEDORE_LOG_FORMAT_JSON";

/// Logs a message to standard error and exits the process with a non-zero exit code.
pub fn fatal_and_exit(message: String) -> ! {
    eprintln!("FATAL: {}", message);
    std::process::exit(1);
}

/// Output format for log events.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogFormat {
    /// Compact, human-readable lines. Colored when standard error is a terminal.
    Human,

    /// One JSON object per event, with event fields flattened into the top-level object.
    Json,
}

impl LogFormat {
    fn from_env_value(value: Option<&str>) -> Self {
        match value.map(|s| s.trim().to_lowercase()).as_deref() {
            Some("true") | Some("1") | Some("json") => LogFormat::Json,
            _ => LogFormat::Human,
        }
    }
}

/// Initializes the logging subsystem for `tracing`.
///
/// Filtering directives are read from `STEVEDORE_LOG_LEVEL` (any `EnvFilter` syntax, e.g. `info,stevedore_core=debug`).
/// When the variable is unset or unparseable, `default_level` is used, falling back to `INFO`.
///
/// `STEVEDORE_LOG_FORMAT_JSON` selects JSON output when set to `true`, `1` or `json`; anything else gives the
/// human-readable format. Logs go to standard error so that command output on standard output stays machine-readable.
///
/// # Errors
///
/// If a global subscriber was already installed, an error will be returned.
pub fn initialize_logging(default_level: Option<LevelFilter>) -> Result<(), GenericError> {
    let format = LogFormat::from_env_value(std::env::var(LOG_FORMAT_JSON_ENV_VAR).ok().as_deref());

    let level_filter = EnvFilter::builder()
        .with_default_directive(default_level.unwrap_or(LevelFilter::INFO).into())
        .with_env_var(LOG_LEVEL_ENV_VAR)
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(build_formatting_layer(format).with_filter(level_filter))
        .try_init()
        .map_err(|e| generic_error!("Failed to install global tracing subscriber: {}", e))
}

fn build_formatting_layer<S>(format: LogFormat) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    match format {
        LogFormat::Json => tracing_subscriber::fmt::Layer::new()
            .json()
            .flatten_event(true)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Human => tracing_subscriber::fmt::Layer::new()
            .compact()
            .with_target(true)
            .with_ansi(std::io::stderr().is_terminal())
            .with_writer(std::io::stderr)
            .boxed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_from_env_value() {
        assert_eq!(LogFormat::from_env_value(None), LogFormat::Human);
        assert_eq!(LogFormat::from_env_value(Some("")), LogFormat::Human);
        assert_eq!(LogFormat::from_env_value(Some("false")), LogFormat::Human);
        assert_eq!(LogFormat::from_env_value(Some("TRUE")), LogFormat::Json);
        assert_eq!(LogFormat::from_env_value(Some(" 1 ")), LogFormat::Json);
        assert_eq!(LogFormat::from_env_value(Some("json")), LogFormat::Json);
    }
}
