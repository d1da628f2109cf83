//! Tessera process core.
//!
//! A single binary whose subcommands select the subsystem to run. Every subsystem runs inside one actor group next to
//! the built-in signal, reload and tracer actors: the first actor to return stops all of the others, and its outcome
//! decides the exit code of the process.

#![deny(warnings)]
#![deny(missing_docs)]

use std::{path::Path, process::ExitCode, sync::Arc, time::Duration};

use bytesize::ByteSize;
use clap::Parser as _;
use tessera_app::{
    logging::{fatal_and_exit, initialize_logging, LoggingConfiguration},
    runtime::{RuntimeConfiguration, RuntimeConfigurator},
    tracer::{initialize_tracer, TracerComponents, TracerConfiguration},
};
use tessera_config::{ConfigurationError, ConfigurationLoader, GenericConfiguration};
use tessera_core::runtime::{
    actors::{reload_actor, termination_actor, tracer_actor},
    reload_queue, ActorGroup, ReloadSender,
};
use tessera_error::GenericError;
use tessera_io::{
    buf::{BufferPool, TieredBufferPool},
    codec::{CodecRegistry, PooledCodec, ProtobufCodec, RegistrationError, PROTOBUF_CODEC_NAME},
};
use tracing::{debug, error, info, info_span};

mod config;
use self::config::{Action, Cli};

mod subsystem;
use self::subsystem::SubsystemContext;

mod subsystems;

#[cfg(target_os = "linux")]
#[global_allocator]
static ALLOC: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

const ENV_PREFIX: &str = "tessera";
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Fraction of the effective memory limit that idle pooled buffers may hold, as a divisor.
const BUFFER_POOL_MEMORY_SHARE: u64 = 8;

fn main() -> ExitCode {
    let cli = Cli::parse();
    let name = cli.action.name();

    let configuration = match load_configuration(cli.config_file.as_deref()) {
        Ok(configuration) => configuration,
        Err(e) => {
            fatal_and_exit(format!("failed to load configuration: {}", e));
            return ExitCode::FAILURE;
        }
    };

    // Allocator and worker thread settings must be in place before the runtime starts.
    let runtime_config = match RuntimeConfiguration::from_configuration(&configuration) {
        Ok(runtime_config) => runtime_config,
        Err(e) => {
            fatal_and_exit(format!("invalid runtime configuration: {:#}", GenericError::from(e)));
            return ExitCode::FAILURE;
        }
    };
    let settings = RuntimeConfigurator::new(runtime_config).configure();
    let runtime = match settings.build_runtime() {
        Ok(runtime) => runtime,
        Err(e) => {
            fatal_and_exit(format!("failed to build runtime: {:#}", GenericError::from(e)));
            return ExitCode::FAILURE;
        }
    };

    let logging_config = match LoggingConfiguration::from_configuration(&configuration) {
        Ok(logging_config) => logging_config,
        Err(e) => {
            fatal_and_exit(format!("invalid logging configuration: {:#}", e));
            return ExitCode::FAILURE;
        }
    };
    let tracer_components = match TracerConfiguration::from_configuration(&configuration)
        .and_then(|tracer_config| initialize_tracer(&tracer_config, &format!("tessera-{}", name)))
    {
        Ok(components) => components,
        Err(e) => {
            fatal_and_exit(format!("failed to initialize tracer: {:#}", e));
            return ExitCode::FAILURE;
        }
    };
    let TracerComponents { tracer, closer, layer } = tracer_components;
    let tracing_enabled = layer.is_some();

    let logging_guard = match initialize_logging(&logging_config, layer.into_iter().collect()) {
        Ok(guard) => guard,
        Err(e) => {
            fatal_and_exit(format!("failed to initialize logging: {:#}", e));
            return ExitCode::FAILURE;
        }
    };
    settings.log_summary();
    if !tracing_enabled {
        debug!("No trace output configured. Tracing disabled.");
    }

    let registry = match build_codec_registry(settings.memory_limit()) {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            error!("Failed to build codec registry: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let (reload_tx, reload_rx) = reload_queue();

    let mut group = ActorGroup::new();
    group.add(tracer_actor(closer));

    let context = SubsystemContext::new(group, registry, configuration)
        .with_span(info_span!("subsystem", name))
        .with_tracer(tracer)
        .with_reload_receiver(reload_rx)
        .with_config_path(cli.config_file.clone())
        .with_memory_limit(settings.memory_limit())
        .with_debug(logging_config.debug_enabled());

    let exit_code = runtime.block_on(run(cli.action, context, reload_tx));

    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
    drop(logging_guard);

    exit_code
}

async fn run(action: Action, mut context: SubsystemContext, reload_tx: ReloadSender) -> ExitCode {
    let name = action.name();
    info!(subsystem = name, "Tessera starting...");

    if let Err(e) = action.setup(&mut context).await {
        error!("Failed to set up subsystem '{}': {}", name, e);
        return ExitCode::FAILURE;
    }

    let mut group = context.into_group();
    if let Err(e) = add_signal_actors(&mut group, reload_tx) {
        error!("{:?}", e);
        return ExitCode::FAILURE;
    }

    info!(subsystem = name, actors = group.len(), "Tessera started.");

    match group.run().await {
        Ok(()) => {
            info!("Tessera stopped.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{:?}", GenericError::from(e));
            ExitCode::FAILURE
        }
    }
}

#[cfg(unix)]
fn add_signal_actors(group: &mut ActorGroup, reload_tx: ReloadSender) -> Result<(), GenericError> {
    use tessera_core::runtime::OsSignals;
    use tessera_error::ErrorContext as _;

    let termination = OsSignals::termination().error_context("Failed to install termination signal handlers.")?;
    let reload = OsSignals::reload().error_context("Failed to install reload signal handler.")?;

    group.add(termination_actor(termination));
    group.add(reload_actor(reload, reload_tx));
    Ok(())
}

#[cfg(not(unix))]
fn add_signal_actors(group: &mut ActorGroup, reload_tx: ReloadSender) -> Result<(), GenericError> {
    use tokio::sync::mpsc;

    // Without OS signal support, the group only ends through its own actors.
    let (_termination_tx, termination_rx) = mpsc::unbounded_channel();
    let (_reload_signal_tx, reload_rx) = mpsc::unbounded_channel();
    group.add(termination_actor(termination_rx));
    group.add(reload_actor(reload_rx, reload_tx));
    Ok(())
}

fn load_configuration(config_file: Option<&Path>) -> Result<GenericConfiguration, ConfigurationError> {
    let loader = match config_file {
        Some(path) => ConfigurationLoader::default().from_yaml(path)?,
        None => ConfigurationLoader::default(),
    };
    Ok(loader.from_environment(ENV_PREFIX)?.into_generic())
}

/// Builds the codec registry used by every subsystem.
///
/// The protobuf codec is registered as the baseline and then wrapped so that large messages are encoded into pooled
/// buffers. With a memory limit, idle pooled buffers are held to a fixed share of it.
pub(crate) fn build_codec_registry(memory_limit: Option<ByteSize>) -> Result<CodecRegistry, RegistrationError> {
    let pool: Arc<dyn BufferPool> = Arc::new(build_buffer_pool(memory_limit));
    let mut registry = CodecRegistry::with_baseline(Arc::new(ProtobufCodec));
    registry.install_override(PROTOBUF_CODEC_NAME, |baseline| Arc::new(PooledCodec::wrap(baseline, pool)))?;
    Ok(registry)
}

fn build_buffer_pool(memory_limit: Option<ByteSize>) -> TieredBufferPool {
    let pool = TieredBufferPool::new();
    let Some(limit) = memory_limit else {
        return pool;
    };

    let share = limit.as_u64() / BUFFER_POOL_MEMORY_SHARE;
    info!(retained_bytes_limit = %ByteSize::b(share), "Bounded buffer pool by memory limit.");
    pool.with_retained_bytes_limit(usize::try_from(share).unwrap_or(usize::MAX))
}
