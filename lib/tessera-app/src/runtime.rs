//! Runtime resource configuration.
//!
//! Everything here is evaluated once, before the async runtime exists and before the global logging subscriber is
//! installed. Decisions that deserve a log line are therefore recorded on [`RuntimeSettings`] and emitted by
//! [`RuntimeSettings::log_summary`] once logging is up.

use std::{
    any::Any,
    fs, io,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use bytesize::ByteSize;
use serde::Deserialize;
use snafu::{ResultExt as _, Snafu};
use tessera_config::{ConfigurationError, GenericConfiguration};
use tracing::{debug, error, info, warn};

/// Environment variable overriding how long, in milliseconds, the allocator holds on to unused memory.
pub const ALLOCATOR_DECAY_ENV_VAR: &str = "TESSERA_ALLOCATOR_DECAY_MS";

/// Decay applied when no override is set.
///
/// Half of jemalloc's built-in 10 second default, so freed pages are handed back to the OS sooner.
pub const DEFAULT_ALLOCATOR_DECAY_MS: u64 = 5000;

const WORKER_THREADS_ENV_VAR: &str = "TOKIO_WORKER_THREADS";
const DEBUG_ENV_VAR: &str = "DEBUG";

// cgroup v1 reports "no limit" as a page-aligned `i64::MAX`.
const CGROUP_V1_UNLIMITED_THRESHOLD: u64 = 1 << 62;

const fn default_memory_limit_ratio() -> f64 {
    0.9
}

/// Runtime configuration errors.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum RuntimeError {
    /// Runtime configuration could not be read.
    #[snafu(display("Failed to parse runtime configuration."))]
    Configuration {
        /// Error source.
        source: ConfigurationError,
    },

    /// The memory limit ratio was outside of `(0, 1]`.
    #[snafu(display("Memory limit ratio must be greater than 0 and at most 1, got {}.", ratio))]
    InvalidMemoryLimitRatio {
        /// Configured ratio.
        ratio: f64,
    },

    /// An explicit memory limit of zero bytes was configured.
    #[snafu(display("Memory limit must be greater than zero."))]
    ZeroMemoryLimit,

    /// Both an explicit memory limit and automatic detection were configured.
    #[snafu(display("An explicit memory limit cannot be combined with automatic memory limit detection."))]
    ConflictingMemoryLimit,

    /// The async runtime could not be built.
    #[snafu(display("Failed to build async runtime."))]
    BuildRuntime {
        /// Error source.
        source: io::Error,
    },
}

/// How the process reacts to a panic.
///
/// Only Rust panics are covered. Hardware faults such as `SIGBUS` or `SIGSEGV` still terminate the process under either
/// policy.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MemoryFaultPolicy {
    /// The panic is logged and unwinds. A panicking actor ends its group with an error.
    #[default]
    Recoverable,

    /// The panic is logged and the process aborts immediately.
    Fatal,
}

/// Runtime configuration, read from the `runtime` section.
#[derive(Clone, Debug)]
pub struct RuntimeConfiguration {
    memory_limit: Option<ByteSize>,
    auto_memory_limit: bool,
    memory_limit_ratio: f64,
    memory_fault_policy: MemoryFaultPolicy,
}

impl RuntimeConfiguration {
    /// Creates a new `RuntimeConfiguration` from the given configuration.
    ///
    /// # Errors
    ///
    /// If a value cannot be deserialized, or the memory limit parameters are invalid, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, RuntimeError> {
        let runtime_config = Self {
            memory_limit: config.try_get_typed("runtime.memory_limit").context(Configuration)?,
            auto_memory_limit: config
                .try_get_typed("runtime.auto_memory_limit")
                .context(Configuration)?
                .unwrap_or(false),
            memory_limit_ratio: config
                .try_get_typed("runtime.memory_limit_ratio")
                .context(Configuration)?
                .unwrap_or_else(default_memory_limit_ratio),
            memory_fault_policy: config
                .try_get_typed("runtime.memory_fault_policy")
                .context(Configuration)?
                .unwrap_or_default(),
        };
        runtime_config.validate()?;
        Ok(runtime_config)
    }

    fn validate(&self) -> Result<(), RuntimeError> {
        let ratio = self.memory_limit_ratio;
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(RuntimeError::InvalidMemoryLimitRatio { ratio });
        }

        match self.memory_limit {
            Some(limit) if limit.as_u64() == 0 => Err(RuntimeError::ZeroMemoryLimit),
            Some(_) if self.auto_memory_limit => Err(RuntimeError::ConflictingMemoryLimit),
            _ => Ok(()),
        }
    }
}

impl Default for RuntimeConfiguration {
    fn default() -> Self {
        Self {
            memory_limit: None,
            auto_memory_limit: false,
            memory_limit_ratio: default_memory_limit_ratio(),
            memory_fault_policy: MemoryFaultPolicy::default(),
        }
    }
}

/// Allocator decay decision.
#[derive(Clone, Debug, PartialEq)]
pub enum AllocatorDecay {
    /// Taken from [`ALLOCATOR_DECAY_ENV_VAR`].
    Explicit(u64),

    /// No override was set, so [`DEFAULT_ALLOCATOR_DECAY_MS`] is applied and exported.
    Default(u64),

    /// The override could not be parsed. The allocator keeps its built-in default.
    Invalid(String),
}

impl AllocatorDecay {
    /// Returns the decay to apply, if any.
    pub fn decay_ms(&self) -> Option<u64> {
        match self {
            Self::Explicit(ms) | Self::Default(ms) => Some(*ms),
            Self::Invalid(_) => None,
        }
    }
}

/// Worker thread decision.
#[derive(Clone, Debug, PartialEq)]
pub enum WorkerThreads {
    /// Taken from `TOKIO_WORKER_THREADS`.
    Explicit(usize),

    /// Derived from the CPU quota of the enclosing cgroup, or host parallelism when there is no quota.
    Derived {
        /// Number of worker threads.
        threads: usize,

        /// CPU quota, in cores, if one was found.
        cpu_quota: Option<f64>,
    },
}

impl WorkerThreads {
    /// Returns the number of worker threads.
    pub fn count(&self) -> usize {
        match self {
            Self::Explicit(threads) | Self::Derived { threads, .. } => *threads,
        }
    }
}

/// Reads resource limits from the cgroup hierarchy of the current process.
#[derive(Clone, Debug)]
pub struct CgroupReader {
    proc_cgroup: PathBuf,
    root: PathBuf,
}

enum CgroupPath {
    Unified(PathBuf),
    Legacy(PathBuf),
}

impl CgroupReader {
    /// Reads the cgroup of the current process from the standard locations.
    pub fn system() -> Self {
        Self::new("/proc/self/cgroup", "/sys/fs/cgroup")
    }

    /// Reads cgroup membership from `proc_cgroup` and controller files below `root`.
    pub fn new<P: Into<PathBuf>, R: Into<PathBuf>>(proc_cgroup: P, root: R) -> Self {
        Self {
            proc_cgroup: proc_cgroup.into(),
            root: root.into(),
        }
    }

    /// Resolves the directory of `controller` for this process.
    ///
    /// A single membership line means a unified (v2) hierarchy. Otherwise the legacy (v1) line listing `controller` is
    /// used.
    fn controller_path(&self, controller: &str) -> Option<CgroupPath> {
        let contents = fs::read_to_string(&self.proc_cgroup).ok()?;
        let lines: Vec<&str> = contents.trim().lines().collect();
        if lines.len() == 1 {
            let path = lines[0].splitn(3, ':').nth(2)?;
            return Some(CgroupPath::Unified(join_cgroup(&self.root, path)));
        }

        lines.iter().find_map(|line| {
            let mut parts = line.splitn(3, ':');
            let controllers = parts.nth(1)?;
            let path = parts.next()?;
            controllers
                .split(',')
                .any(|name| name == controller)
                .then(|| CgroupPath::Legacy(join_cgroup(&self.root.join(controller), path)))
        })
    }

    /// Returns the CPU quota in cores, or `None` if there is no quota or it cannot be read.
    pub fn cpu_quota(&self) -> Option<f64> {
        match self.controller_path("cpu")? {
            CgroupPath::Unified(dir) => parse_cpu_max(&fs::read_to_string(dir.join("cpu.max")).ok()?),
            CgroupPath::Legacy(dir) => {
                let quota = fs::read_to_string(dir.join("cpu.cfs_quota_us")).ok()?;
                let period = fs::read_to_string(dir.join("cpu.cfs_period_us")).ok()?;
                parse_cfs_quota(&quota, &period)
            }
        }
    }

    /// Returns the memory limit, or `None` if there is no limit or it cannot be read.
    pub fn memory_limit(&self) -> Option<ByteSize> {
        let raw = match self.controller_path("memory")? {
            CgroupPath::Unified(dir) => fs::read_to_string(dir.join("memory.max")).ok()?,
            CgroupPath::Legacy(dir) => fs::read_to_string(dir.join("memory.limit_in_bytes")).ok()?,
        };
        parse_memory_limit(&raw)
    }
}

fn join_cgroup(base: &Path, cgroup_path: &str) -> PathBuf {
    base.join(cgroup_path.trim_start_matches('/'))
}

fn parse_cpu_max(contents: &str) -> Option<f64> {
    let mut fields = contents.split_whitespace();
    let quota = fields.next()?;
    if quota == "max" {
        return None;
    }
    let period = fields.next().unwrap_or("100000");
    ratio_of(quota, period)
}

fn parse_cfs_quota(quota: &str, period: &str) -> Option<f64> {
    if quota.trim().starts_with('-') {
        return None;
    }
    ratio_of(quota, period)
}

fn ratio_of(quota: &str, period: &str) -> Option<f64> {
    let quota = quota.trim().parse::<u64>().ok()?;
    let period = period.trim().parse::<u64>().ok()?;
    if quota == 0 || period == 0 {
        return None;
    }
    Some(quota as f64 / period as f64)
}

fn parse_memory_limit(contents: &str) -> Option<ByteSize> {
    let contents = contents.trim();
    if contents == "max" {
        return None;
    }
    let bytes = contents.parse::<u64>().ok()?;
    (bytes > 0 && bytes < CGROUP_V1_UNLIMITED_THRESHOLD).then_some(ByteSize::b(bytes))
}

fn derive_worker_threads(cpu_quota: Option<f64>, host_parallelism: usize) -> usize {
    let host_parallelism = host_parallelism.max(1);
    match cpu_quota {
        Some(quota) => (quota.ceil() as usize).clamp(1, host_parallelism),
        None => host_parallelism,
    }
}

/// Settles process-wide resource settings before the async runtime is built.
pub struct RuntimeConfigurator {
    config: RuntimeConfiguration,
    cgroups: CgroupReader,
    host_parallelism: usize,
}

impl RuntimeConfigurator {
    /// Creates a new `RuntimeConfigurator` for the current host.
    pub fn new(config: RuntimeConfiguration) -> Self {
        Self {
            config,
            cgroups: CgroupReader::system(),
            host_parallelism: std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
        }
    }

    /// Reads cgroup limits through `cgroups` instead of the system locations.
    pub fn with_cgroups(mut self, cgroups: CgroupReader) -> Self {
        self.cgroups = cgroups;
        self
    }

    /// Overrides the detected host parallelism.
    pub fn with_host_parallelism(mut self, host_parallelism: usize) -> Self {
        self.host_parallelism = host_parallelism;
        self
    }

    /// Resolves and applies the runtime settings for this process.
    ///
    /// The allocator decay is exported through the environment so that child processes inherit it, the allocator is
    /// reconfigured, and a panic hook enforcing the memory fault policy is installed.
    pub fn configure(self) -> RuntimeSettings {
        let mut settings = self.resolve(|key| std::env::var(key).ok());

        if let AllocatorDecay::Default(ms) = settings.allocator_decay {
            std::env::set_var(ALLOCATOR_DECAY_ENV_VAR, ms.to_string());
        }
        if let Some(ms) = settings.allocator_decay.decay_ms() {
            if let Err(e) = apply_allocator_decay(ms) {
                settings
                    .notes
                    .push(format!("Failed to apply allocator decay of {}ms: {}", ms, e));
            }
        }

        install_fault_hook(settings.memory_fault_policy);
        settings
    }

    /// Resolves the runtime settings, reading environment variables through `env`, without applying anything.
    pub fn resolve<E>(&self, env: E) -> RuntimeSettings
    where
        E: Fn(&str) -> Option<String>,
    {
        let mut notes = Vec::new();

        let allocator_decay = match env(ALLOCATOR_DECAY_ENV_VAR).filter(|value| !value.is_empty()) {
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(ms) => AllocatorDecay::Explicit(ms),
                Err(_) => {
                    notes.push(format!(
                        "Could not parse {}='{}'. Using the allocator's built-in decay.",
                        ALLOCATOR_DECAY_ENV_VAR, raw
                    ));
                    AllocatorDecay::Invalid(raw)
                }
            },
            None => AllocatorDecay::Default(DEFAULT_ALLOCATOR_DECAY_MS),
        };

        let explicit_threads = env(WORKER_THREADS_ENV_VAR).and_then(|raw| match raw.trim().parse::<usize>() {
            Ok(threads) if threads > 0 => Some(threads),
            _ => {
                notes.push(format!(
                    "Ignoring invalid {}='{}'. Deriving worker threads instead.",
                    WORKER_THREADS_ENV_VAR, raw
                ));
                None
            }
        });
        let worker_threads = match explicit_threads {
            Some(threads) => WorkerThreads::Explicit(threads),
            None => {
                let cpu_quota = self.cgroups.cpu_quota();
                WorkerThreads::Derived {
                    threads: derive_worker_threads(cpu_quota, self.host_parallelism),
                    cpu_quota,
                }
            }
        };

        let memory_limit = if self.config.auto_memory_limit {
            match self.cgroups.memory_limit() {
                Some(detected) => {
                    let limit = ByteSize::b((detected.as_u64() as f64 * self.config.memory_limit_ratio) as u64);
                    Some(limit)
                }
                None => {
                    notes.push(String::from(
                        "Automatic memory limit requested, but no cgroup memory limit was found.",
                    ));
                    None
                }
            }
        } else {
            self.config.memory_limit
        };

        RuntimeSettings {
            allocator_decay,
            worker_threads,
            memory_limit,
            memory_fault_policy: self.config.memory_fault_policy,
            thread_diagnostics: env(DEBUG_ENV_VAR).is_some_and(|value| !value.is_empty()),
            notes,
        }
    }
}

/// The resolved runtime settings for this process.
#[derive(Clone, Debug)]
pub struct RuntimeSettings {
    allocator_decay: AllocatorDecay,
    worker_threads: WorkerThreads,
    memory_limit: Option<ByteSize>,
    memory_fault_policy: MemoryFaultPolicy,
    thread_diagnostics: bool,
    notes: Vec<String>,
}

impl RuntimeSettings {
    /// Returns the allocator decay decision.
    pub fn allocator_decay(&self) -> &AllocatorDecay {
        &self.allocator_decay
    }

    /// Returns the worker thread decision.
    pub fn worker_threads(&self) -> &WorkerThreads {
        &self.worker_threads
    }

    /// Returns the effective memory limit of the process, if any.
    pub fn memory_limit(&self) -> Option<ByteSize> {
        self.memory_limit
    }

    /// Returns the memory fault policy.
    pub fn memory_fault_policy(&self) -> MemoryFaultPolicy {
        self.memory_fault_policy
    }

    /// Returns `true` if runtime thread lifecycle diagnostics are enabled.
    pub fn thread_diagnostics(&self) -> bool {
        self.thread_diagnostics
    }

    /// Builds the multi-threaded async runtime.
    ///
    /// # Errors
    ///
    /// If the runtime cannot be created, an error is returned.
    pub fn build_runtime(&self) -> Result<tokio::runtime::Runtime, RuntimeError> {
        let thread_id = Arc::new(AtomicUsize::new(0));

        let mut builder = tokio::runtime::Builder::new_multi_thread();
        builder
            .enable_all()
            .worker_threads(self.worker_threads.count())
            .thread_name_fn(move || {
                let new_thread_id = thread_id.fetch_add(1, Ordering::SeqCst);
                format!("tessera-worker-{:02}", new_thread_id)
            });

        if self.thread_diagnostics {
            builder
                .on_thread_start(|| debug!(thread = ?std::thread::current().name(), "Runtime thread started."))
                .on_thread_stop(|| debug!(thread = ?std::thread::current().name(), "Runtime thread stopped."));
        }

        builder.build().context(BuildRuntime)
    }

    /// Logs the resolved settings, along with anything that did not go as configured.
    pub fn log_summary(&self) {
        for note in &self.notes {
            warn!("{}", note);
        }

        match &self.worker_threads {
            WorkerThreads::Explicit(threads) => {
                info!(threads, "Using worker thread count from {}.", WORKER_THREADS_ENV_VAR)
            }
            WorkerThreads::Derived {
                threads,
                cpu_quota: Some(quota),
            } => info!(threads, cpu_quota = quota, "Derived worker thread count from cgroup CPU quota."),
            WorkerThreads::Derived { threads, cpu_quota: None } => {
                info!(threads, "No CPU quota found. Using host parallelism for worker thread count.")
            }
        }

        match self.allocator_decay.decay_ms() {
            Some(decay_ms) => debug!(decay_ms, "Configured allocator decay."),
            None => debug!("Using the allocator's built-in decay."),
        }

        match self.memory_limit {
            Some(limit) => info!(memory_limit = %limit, "Effective memory limit set."),
            None => debug!("No memory limit set for the process."),
        }

        debug!(policy = ?self.memory_fault_policy, diagnostics = self.thread_diagnostics, "Runtime configured.");
    }
}

#[cfg(target_os = "linux")]
fn apply_allocator_decay(decay_ms: u64) -> Result<(), tikv_jemalloc_ctl::Error> {
    let value = isize::try_from(decay_ms).unwrap_or(isize::MAX);

    // `arenas.*` only seeds arenas created later. Index 4096 (`MALLCTL_ARENAS_ALL`) updates the ones already in use.
    //
    // SAFETY: All keys are documented as `ssize_t` and are writable.
    unsafe {
        tikv_jemalloc_ctl::raw::write(b"arenas.dirty_decay_ms\0", value)?;
        tikv_jemalloc_ctl::raw::write(b"arenas.muzzy_decay_ms\0", value)?;
        tikv_jemalloc_ctl::raw::write(b"arena.4096.dirty_decay_ms\0", value)?;
        tikv_jemalloc_ctl::raw::write(b"arena.4096.muzzy_decay_ms\0", value)?;
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn apply_allocator_decay(_decay_ms: u64) -> Result<(), std::convert::Infallible> {
    Ok(())
}

fn install_fault_hook(policy: MemoryFaultPolicy) {
    std::panic::set_hook(Box::new(move |info| {
        let location = info.location().map(|location| location.to_string()).unwrap_or_default();
        let message = panic_payload_message(info.payload());
        let current = std::thread::current();
        let thread = current.name().unwrap_or("<unnamed>");

        match policy {
            MemoryFaultPolicy::Recoverable => {
                error!(%location, thread, "Thread panicked: {}", message);
            }
            MemoryFaultPolicy::Fatal => {
                error!(%location, thread, "Thread panicked: {}. Aborting.", message);
                eprintln!("FATAL: thread '{}' panicked at {}: {}", thread, location, message);
                std::process::abort();
            }
        }
    }));
}

fn panic_payload_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic payload"
    }
}
