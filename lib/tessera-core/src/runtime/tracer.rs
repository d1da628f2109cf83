use std::{fmt, sync::Arc};

use tracing::{info_span, Span};

/// Target used for spans emitted through a [`Tracer`].
pub const TRACE_TARGET: &str = "tessera::trace";

/// A handle for creating request-scoped trace spans.
///
/// A disabled tracer hands out disabled spans, so callers never need to check whether tracing is configured.
#[derive(Clone, Default)]
pub struct Tracer {
    service: Option<Arc<str>>,
}

impl Tracer {
    /// Creates a tracer that records nothing.
    pub fn noop() -> Self {
        Self { service: None }
    }

    /// Creates a tracer that records spans for `service` on the [`TRACE_TARGET`] target.
    pub fn new<S: Into<Arc<str>>>(service: S) -> Self {
        Self {
            service: Some(service.into()),
        }
    }

    /// Returns `true` if this tracer records spans.
    pub fn is_enabled(&self) -> bool {
        self.service.is_some()
    }

    /// Starts a span for `operation`.
    pub fn start_span(&self, operation: &'static str) -> Span {
        match &self.service {
            Some(service) => info_span!(target: TRACE_TARGET, "trace", service = %service, operation),
            None => Span::none(),
        }
    }
}

impl fmt::Debug for Tracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracer").field("service", &self.service).finish()
    }
}

/// Releases the resources behind a [`Tracer`], such as a background writer that must be flushed.
///
/// The release runs exactly once: either when [`close`][TracerCloser::close] is called or when the closer is dropped,
/// whichever comes first.
pub struct TracerCloser {
    close: Option<Box<dyn FnOnce() + Send>>,
}

impl TracerCloser {
    /// Creates a closer that runs `close` on release.
    pub fn new<F>(close: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            close: Some(Box::new(close)),
        }
    }

    /// Creates a closer with nothing to release.
    pub fn noop() -> Self {
        Self { close: None }
    }

    /// Releases the tracer's resources.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(close) = self.close.take() {
            close();
        }
    }
}

impl Drop for TracerCloser {
    fn drop(&mut self) {
        self.release();
    }
}
