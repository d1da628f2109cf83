//! Buffers and wire codecs used by the RPC transport.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod buf;
pub mod codec;
