use snafu::ResultExt as _;

use super::{Codec, GenericDecode, MarshalError, UnmarshalError, WireMessage};
use crate::buf::BufferSlice;

/// Name of the protobuf codec.
pub const PROTOBUF_CODEC_NAME: &str = "proto";

/// The baseline protobuf codec.
///
/// Every message goes through the generic, prost-derived encoder. Output is always a single owned fragment.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProtobufCodec;

impl Codec for ProtobufCodec {
    fn name(&self) -> &str {
        PROTOBUF_CODEC_NAME
    }

    fn marshal(&self, message: &dyn WireMessage) -> Result<BufferSlice, MarshalError> {
        Ok(BufferSlice::from(message.encode_generic()))
    }

    fn unmarshal(&self, data: &BufferSlice, message: &mut dyn WireMessage) -> Result<(), UnmarshalError> {
        let name = message.message_name();
        let contiguous = data.contiguous();
        message
            .decode_generic(&contiguous)
            .context(GenericDecode { message: name })
    }
}
