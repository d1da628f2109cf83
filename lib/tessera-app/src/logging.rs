//! Logging.

use serde::Deserialize;
use tessera_config::GenericConfiguration;
use tessera_error::{generic_error, ErrorContext as _, GenericError};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    filter::LevelFilter, fmt::MakeWriter, layer::SubscriberExt as _, util::SubscriberInitExt as _, EnvFilter, Layer,
    Registry,
};

/// A type-erased layer that can be installed alongside the logging layers.
pub type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

const fn default_false() -> bool {
    false
}

fn default_log_level() -> LogLevel {
    LogLevel(String::from("info"))
}

/// Logging configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct LoggingConfiguration {
    /// Filtering directives, in `EnvFilter` syntax.
    ///
    /// Either a bare level such as `debug`, or a comma-separated list of directives such as
    /// `info,tessera_io=trace`. Defaults to `info`.
    #[serde(default = "default_log_level")]
    log_level: LogLevel,

    /// Whether to emit logs as JSON lines instead of human-readable text.
    #[serde(default = "default_false")]
    log_format_json: bool,
}

impl LoggingConfiguration {
    /// Creates a new `LoggingConfiguration` from the given configuration.
    ///
    /// # Errors
    ///
    /// If the configuration cannot be deserialized as `LoggingConfiguration`, or the log level is not a valid set of
    /// filtering directives, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        config
            .as_typed::<Self>()
            .error_context("Failed to parse logging configuration.")
    }

    /// Returns `true` if debug-level events are enabled for at least one target.
    pub fn debug_enabled(&self) -> bool {
        self.log_level
            .as_env_filter()
            .max_level_hint()
            .is_some_and(|level| level >= LevelFilter::DEBUG)
    }

    /// Returns `true` if logs are emitted as JSON.
    pub const fn json(&self) -> bool {
        self.log_format_json
    }
}

impl Default for LoggingConfiguration {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format_json: false,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(try_from = "String")]
struct LogLevel(String);

impl LogLevel {
    fn as_env_filter(&self) -> EnvFilter {
        // Directives were validated on construction.
        EnvFilter::builder().parse_lossy(&self.0)
    }
}

impl TryFrom<String> for LogLevel {
    type Error = GenericError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let value = value.trim().to_string();
        if value.is_empty() {
            return Err(generic_error!("Log level cannot be empty."));
        }

        EnvFilter::builder()
            .parse(&value)
            .map(|_| Self(value))
            .error_context("Failed to parse valid log level.")
    }
}

/// Holds the background writers behind the logging layers.
///
/// Must be held until the process is about to exit so that pending log lines are flushed.
#[derive(Default)]
pub struct LoggingGuard {
    worker_guards: Vec<WorkerGuard>,
}

impl LoggingGuard {
    fn add_worker_guard(&mut self, guard: WorkerGuard) {
        self.worker_guards.push(guard);
    }
}

/// Logs a message to standard error and exits the process with a non-zero exit code.
///
/// Used for failures that happen before logging is initialized.
pub fn fatal_and_exit(message: String) {
    eprintln!("FATAL: {}", message);
    std::process::exit(1);
}

/// Initializes the global `tracing` subscriber.
///
/// Log lines are written to standard error through a non-blocking writer, filtered by the configured level. Any
/// `extra_layers`, such as the trace output layer, are installed next to the logging layer and carry their own
/// filtering.
///
/// # Errors
///
/// If the global subscriber was already initialized, an error will be returned.
pub fn initialize_logging(
    config: &LoggingConfiguration, extra_layers: Vec<BoxedLayer>,
) -> Result<LoggingGuard, GenericError> {
    let mut logging_guard = LoggingGuard::default();

    let (nb_stderr, guard) = tracing_appender::non_blocking(std::io::stderr());
    logging_guard.add_worker_guard(guard);

    let mut layers = vec![build_logging_layer(config, nb_stderr)];
    layers.extend(extra_layers);

    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .error_context("Failed to install global logging subscriber.")?;

    Ok(logging_guard)
}

fn build_logging_layer<W>(config: &LoggingConfiguration, writer: W) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let filter = config.log_level.as_env_filter();
    if config.log_format_json {
        tracing_subscriber::fmt::Layer::new()
            .json()
            .flatten_event(true)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_writer(writer)
            .with_filter(filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::Layer::new()
            .with_target(true)
            .with_writer(writer)
            .with_filter(filter)
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{self, Write},
        sync::{Arc, Mutex},
    };

    use tessera_config::ConfigurationLoader;

    use super::*;

    #[derive(Clone, Default)]
    struct CapturedWriter(Arc<Mutex<Vec<u8>>>);

    impl CapturedWriter {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl Write for CapturedWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'w> MakeWriter<'w> for CapturedWriter {
        type Writer = Self;

        fn make_writer(&'w self) -> Self::Writer {
            self.clone()
        }
    }

    fn config_from_yaml(contents: &str) -> Result<LoggingConfiguration, GenericError> {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        let config = ConfigurationLoader::default().from_yaml(file.path())?.into_generic();
        LoggingConfiguration::from_configuration(&config)
    }

    #[test]
    fn defaults_to_info_text() {
        let config = LoggingConfiguration::from_configuration(&GenericConfiguration::empty()).unwrap();
        assert!(!config.json());
        assert!(!config.debug_enabled());
    }

    #[test]
    fn debug_enabled_follows_most_verbose_directive() {
        assert!(config_from_yaml("log_level: debug\n").unwrap().debug_enabled());
        assert!(config_from_yaml("log_level: \"warn,tessera_io=trace\"\n").unwrap().debug_enabled());
        assert!(!config_from_yaml("log_level: warn\n").unwrap().debug_enabled());
    }

    #[test]
    fn invalid_log_level_is_rejected() {
        assert!(config_from_yaml("log_level: \"\"\n").is_err());
        assert!(config_from_yaml("log_level: \"tessera=notalevel\"\n").is_err());
    }

    #[test]
    fn json_layer_writes_structured_fields() {
        let config = config_from_yaml("log_level: info\nlog_format_json: true\n").unwrap();
        let writer = CapturedWriter::default();
        let subscriber = tracing_subscriber::registry().with(build_logging_layer(&config, writer.clone()));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(actor = "receive", "Actor exited.");
            tracing::debug!("filtered out");
        });

        let output = writer.contents();
        assert!(output.contains("\"actor\":\"receive\""), "{}", output);
        assert!(output.contains("\"message\":\"Actor exited.\""), "{}", output);
        assert!(!output.contains("filtered out"));
    }
}
