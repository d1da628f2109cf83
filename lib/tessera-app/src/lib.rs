//! Process bootstrap helpers shared by Tessera binaries.
//!
//! Binaries call into this crate in a fixed order: [`runtime`] settles the allocator, worker threads and fault policy
//! and builds the async runtime, [`logging`] installs the global subscriber, and [`tracer`] produces the tracer handle
//! along with the resource that the tracer lifecycle actor releases on shutdown.
#![deny(warnings)]
#![deny(missing_docs)]

#[cfg(all(test, target_os = "linux"))]
#[global_allocator]
static ALLOC: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

pub mod logging;
pub mod runtime;
pub mod tracer;
