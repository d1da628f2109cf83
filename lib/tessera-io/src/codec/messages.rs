use tessera_protos::{fast::FastMessage as _, WireError, WriteRequest, WriteResponse};

use super::{OptimizedCodable, WireMessage};

impl OptimizedCodable for WriteRequest {
    fn encoded_size(&self) -> usize {
        self.fast_encoded_len()
    }

    fn encode_to_sized_buffer(&self, buf: &mut [u8]) -> Result<usize, WireError> {
        self.fast_encode_to(buf)
    }

    fn decode_from_slice(&mut self, data: &[u8]) -> Result<(), WireError> {
        self.fast_decode(data)
    }
}

impl WireMessage for WriteRequest {
    fn message_name(&self) -> &'static str {
        "WriteRequest"
    }

    fn as_optimized(&self) -> Option<&dyn OptimizedCodable> {
        Some(self)
    }

    fn as_optimized_mut(&mut self) -> Option<&mut dyn OptimizedCodable> {
        Some(self)
    }
}

impl WireMessage for WriteResponse {
    fn message_name(&self) -> &'static str {
        "WriteResponse"
    }
}
