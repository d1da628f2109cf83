use std::{
    io,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use bytesize::ByteSize;
use snafu::{OptionExt as _, Snafu};
use tessera_config::{ConfigurationError, GenericConfiguration};
use tessera_core::runtime::{ActorGroup, ReloadReceiver, Tracer};
use tessera_io::codec::{Codec, CodecRegistry};
use tracing::Span;

/// Subsystem setup errors.
///
/// Any of these aborts the process before the actor group runs.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum SetupError {
    /// A codec the subsystem depends on was not registered.
    #[snafu(display("No codec registered under '{}'.", name))]
    MissingCodec { name: &'static str },

    /// A listener could not be bound.
    #[snafu(display("Failed to bind listener on {}: {}", address, source))]
    Bind { address: SocketAddr, source: io::Error },

    /// Subsystem configuration could not be read.
    #[snafu(display("Failed to read {} configuration: {}", subsystem, source))]
    Configuration {
        subsystem: &'static str,
        source: ConfigurationError,
    },

    /// An input file does not exist or is not a file.
    #[snafu(display("Input file '{}' does not exist or is not a regular file.", path.display()))]
    MissingInput { path: PathBuf },
}

/// Everything a subsystem needs to register its actors.
pub struct SubsystemContext {
    group: ActorGroup,
    span: Span,
    tracer: Tracer,
    registry: Arc<CodecRegistry>,
    reload_rx: Option<ReloadReceiver>,
    configuration: GenericConfiguration,
    config_path: Option<PathBuf>,
    memory_limit: Option<ByteSize>,
    debug: bool,
}

impl SubsystemContext {
    /// Creates a new `SubsystemContext` around `group`.
    pub fn new(group: ActorGroup, registry: Arc<CodecRegistry>, configuration: GenericConfiguration) -> Self {
        Self {
            group,
            span: Span::none(),
            tracer: Tracer::noop(),
            registry,
            reload_rx: None,
            configuration,
            config_path: None,
            memory_limit: None,
            debug: false,
        }
    }

    /// Sets the span that the subsystem's actors run in.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Sets the shared tracer.
    pub fn with_tracer(mut self, tracer: Tracer) -> Self {
        self.tracer = tracer;
        self
    }

    /// Hands the receiver of the process reload queue to the subsystem.
    pub fn with_reload_receiver(mut self, reload_rx: ReloadReceiver) -> Self {
        self.reload_rx = Some(reload_rx);
        self
    }

    /// Sets the configuration file the process was started with.
    pub fn with_config_path(mut self, config_path: Option<PathBuf>) -> Self {
        self.config_path = config_path;
        self
    }

    /// Sets the effective memory limit of the process.
    pub fn with_memory_limit(mut self, memory_limit: Option<ByteSize>) -> Self {
        self.memory_limit = memory_limit;
        self
    }

    /// Sets whether debug logging is enabled.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Returns the group that actors are added to.
    pub fn group_mut(&mut self) -> &mut ActorGroup {
        &mut self.group
    }

    /// Returns the span scoped to this subsystem.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Returns the shared tracer.
    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    /// Returns the codec registered under `name`.
    ///
    /// # Errors
    ///
    /// If no codec is registered under `name`, an error is returned.
    pub fn codec(&self, name: &'static str) -> Result<Arc<dyn Codec>, SetupError> {
        self.registry.get(name).context(MissingCodec { name })
    }

    /// Takes the reload queue receiver.
    ///
    /// Only one actor may consume reload notifications, so this returns `None` after the first call.
    pub fn take_reload_receiver(&mut self) -> Option<ReloadReceiver> {
        self.reload_rx.take()
    }

    /// Returns the configuration the process was started with.
    pub fn configuration(&self) -> &GenericConfiguration {
        &self.configuration
    }

    /// Returns the configuration file the process was started with, if any.
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Returns the effective memory limit of the process, if any.
    pub fn memory_limit(&self) -> Option<ByteSize> {
        self.memory_limit
    }

    /// Returns `true` if debug logging is enabled.
    pub fn debug_enabled(&self) -> bool {
        self.debug
    }

    /// Consumes the context, returning the group with every registered actor.
    pub fn into_group(self) -> ActorGroup {
        self.group
    }
}

/// A deployable unit of the process, selected by subcommand.
#[async_trait]
pub trait Subsystem: Send + Sized {
    /// Name of the subsystem, used in logs and as the trace service name.
    fn name(&self) -> &'static str;

    /// Registers the subsystem's actors with the group in `context`.
    ///
    /// # Errors
    ///
    /// If the subsystem cannot be set up, an error is returned and the group is never run.
    async fn setup(self, context: &mut SubsystemContext) -> Result<(), SetupError>;
}
