//! Core primitives for running a process as a group of fate-sharing actors.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod runtime;
