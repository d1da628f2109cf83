//! Tracer initialization.

use std::{fs::OpenOptions, path::PathBuf};

use tessera_config::GenericConfiguration;
use tessera_core::runtime::{Tracer, TracerCloser, TRACE_TARGET};
use tessera_error::{ErrorContext as _, GenericError};
use tracing_subscriber::{filter::filter_fn, fmt::format::FmtSpan, Layer as _};

use crate::logging::BoxedLayer;

/// Tracer configuration.
#[derive(Clone, Debug, Default)]
pub struct TracerConfiguration {
    output_file: Option<PathBuf>,
}

impl TracerConfiguration {
    /// Creates a new `TracerConfiguration` from the given configuration.
    ///
    /// Reads `tracing.output_file`. When it is absent, tracing is disabled.
    ///
    /// # Errors
    ///
    /// If the value is present but is not a path, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        Ok(Self {
            output_file: config
                .try_get_typed("tracing.output_file")
                .error_context("Failed to parse tracing configuration.")?,
        })
    }

    /// Sets the file that finished spans are appended to.
    pub fn with_output_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.output_file = Some(path.into());
        self
    }
}

/// The pieces produced by [`initialize_tracer`].
pub struct TracerComponents {
    /// Handle used by actors to start spans.
    pub tracer: Tracer,

    /// Releases the trace writer. Handed to the tracer lifecycle actor.
    pub closer: TracerCloser,

    /// Layer that writes trace spans. Installed through [`initialize_logging`][crate::logging::initialize_logging].
    pub layer: Option<BoxedLayer>,
}

/// Builds the tracer for `service`.
///
/// When an output file is configured, every span created through the returned [`Tracer`] is written to it as a JSON
/// line when the span closes. Writes go through a background writer which is flushed when the returned closer is
/// released. Without an output file, a disabled tracer and a no-op closer are returned.
///
/// # Errors
///
/// If the output file cannot be opened for appending, an error is returned.
pub fn initialize_tracer(config: &TracerConfiguration, service: &str) -> Result<TracerComponents, GenericError> {
    let Some(path) = &config.output_file else {
        return Ok(TracerComponents {
            tracer: Tracer::noop(),
            closer: TracerCloser::noop(),
            layer: None,
        });
    };

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_error_context(|| format!("Failed to open trace output file '{}'.", path.display()))?;
    let (writer, guard) = tracing_appender::non_blocking(file);

    let layer = tracing_subscriber::fmt::Layer::new()
        .json()
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(writer)
        .with_filter(filter_fn(|metadata| metadata.target() == TRACE_TARGET))
        .boxed();

    Ok(TracerComponents {
        tracer: Tracer::new(service),
        closer: TracerCloser::new(move || drop(guard)),
        layer: Some(layer),
    })
}

#[cfg(test)]
mod tests {
    use tracing_subscriber::layer::SubscriberExt as _;

    use super::*;

    #[test]
    fn disabled_without_output_file() {
        let components = initialize_tracer(&TracerConfiguration::default(), "receive").unwrap();
        assert!(!components.tracer.is_enabled());
        assert!(components.layer.is_none());
    }

    #[test]
    fn spans_are_written_when_closer_is_released() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("traces.json");
        let config = TracerConfiguration::default().with_output_file(&path);

        let TracerComponents { tracer, closer, layer } = initialize_tracer(&config, "receive").unwrap();
        assert!(tracer.is_enabled());
        let subscriber = tracing_subscriber::registry().with(layer.unwrap());

        tracing::subscriber::with_default(subscriber, || {
            let span = tracer.start_span("decode_write_request");
            let _entered = span.enter();
            tracing::info!(target: "unrelated", "unrelated event");
        });
        closer.close();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("decode_write_request"), "{}", written);
        assert!(written.contains("receive"), "{}", written);
        assert!(!written.contains("unrelated event"), "{}", written);
    }

    #[test]
    fn unopenable_output_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = TracerConfiguration::default().with_output_file(dir.path().join("missing").join("traces.json"));
        assert!(initialize_tracer(&config, "receive").is_err());
    }
}
