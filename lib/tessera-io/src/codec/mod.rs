//! Wire codecs.
//!
//! A [`Codec`] turns a [`WireMessage`] into a [`BufferSlice`] and back. Every message supports the generic
//! prost-derived encoding; messages that also carry a hand-written fast path advertise it through
//! [`WireMessage::as_optimized`], and [`PooledCodec`] takes that path when it is available.
//!
//! Codecs are looked up by name in a [`CodecRegistry`]. The baseline codec for a name must be registered before an
//! override can be installed on top of it.

use snafu::Snafu;
use tessera_protos::WireError;

use crate::buf::BufferSlice;

mod messages;

mod pooled;
pub use self::pooled::PooledCodec;

mod protobuf;
pub use self::protobuf::{ProtobufCodec, PROTOBUF_CODEC_NAME};

mod registry;
pub use self::registry::{CodecRegistry, RegistrationError};

/// Marshal errors.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum MarshalError {
    /// The fast path failed to encode the message.
    #[snafu(display("Failed to encode {}: {}", message, source))]
    FastEncode {
        /// Name of the message type.
        message: &'static str,

        /// Underlying error.
        source: WireError,
    },

    /// The fast path wrote a different number of bytes than it said it would.
    #[snafu(display("Encoded {} bytes for {} but expected {}.", actual, message, expected))]
    SizeMismatch {
        /// Name of the message type.
        message: &'static str,

        /// Size computed before encoding.
        expected: usize,

        /// Bytes actually written.
        actual: usize,
    },
}

/// Unmarshal errors.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum UnmarshalError {
    /// The fast path failed to decode the message.
    #[snafu(display("Failed to decode {}: {}", message, source))]
    FastDecode {
        /// Name of the message type.
        message: &'static str,

        /// Underlying error.
        source: WireError,
    },

    /// The generic decoder failed to decode the message.
    #[snafu(display("Failed to decode {}: {}", message, source))]
    GenericDecode {
        /// Name of the message type.
        message: &'static str,

        /// Underlying error.
        source: prost::DecodeError,
    },
}

/// A message that can be encoded and decoded by the generic, prost-derived encoder.
pub trait GenericCodable: Send + Sync {
    /// Encodes the message into a new vector.
    fn encode_generic(&self) -> Vec<u8>;

    /// Replaces the message with the one encoded in `data`.
    ///
    /// # Errors
    ///
    /// If `data` is not a valid encoding of the message, an error is returned.
    fn decode_generic(&mut self, data: &[u8]) -> Result<(), prost::DecodeError>;
}

impl<T> GenericCodable for T
where
    T: prost::Message + Default,
{
    fn encode_generic(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    fn decode_generic(&mut self, data: &[u8]) -> Result<(), prost::DecodeError> {
        self.clear();
        self.merge(data)
    }
}

/// A message with a hand-written fast path.
pub trait OptimizedCodable {
    /// Returns the exact encoded size of the message, in bytes.
    fn encoded_size(&self) -> usize;

    /// Encodes the message into `buf`, which is exactly [`encoded_size`][OptimizedCodable::encoded_size] bytes long.
    ///
    /// Returns the number of bytes written.
    ///
    /// # Errors
    ///
    /// If the message cannot be encoded into `buf`, an error is returned.
    fn encode_to_sized_buffer(&self, buf: &mut [u8]) -> Result<usize, WireError>;

    /// Replaces the message with the one encoded in `data`.
    ///
    /// # Errors
    ///
    /// If `data` is not a valid encoding of the message, an error is returned.
    fn decode_from_slice(&mut self, data: &[u8]) -> Result<(), WireError>;
}

/// A message that can be carried by a [`Codec`].
pub trait WireMessage: GenericCodable {
    /// Name of the message type, used in errors.
    fn message_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Returns the fast path for this message, if it has one.
    fn as_optimized(&self) -> Option<&dyn OptimizedCodable> {
        None
    }

    /// Returns the fast path for this message, if it has one.
    fn as_optimized_mut(&mut self) -> Option<&mut dyn OptimizedCodable> {
        None
    }
}

/// A named wire codec.
pub trait Codec: Send + Sync {
    /// Name the codec is registered under.
    fn name(&self) -> &str;

    /// Encodes `message`.
    ///
    /// # Errors
    ///
    /// If the message cannot be encoded, an error is returned. No buffer is retained on failure.
    fn marshal(&self, message: &dyn WireMessage) -> Result<BufferSlice, MarshalError>;

    /// Decodes `data` into `message`, replacing its previous contents.
    ///
    /// # Errors
    ///
    /// If `data` is not a valid encoding of the message, an error is returned and `message` may be partially updated.
    fn unmarshal(&self, data: &BufferSlice, message: &mut dyn WireMessage) -> Result<(), UnmarshalError>;
}
