//! Low-level protobuf wire primitives for the fast path.

use snafu::Snafu;

/// Fast-path encoding and decoding errors.
#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum WireError {
    /// The destination buffer cannot hold the encoded message.
    #[snafu(display("Buffer too small: need {} more byte(s) than the {} available.", required, available))]
    BufferTooSmall {
        /// Bytes still required when space ran out.
        required: usize,

        /// Bytes that were still free.
        available: usize,
    },

    /// The input ended in the middle of a field.
    #[snafu(display("Unexpected end of input while decoding {}.", what))]
    Truncated {
        /// What was being decoded.
        what: &'static str,
    },

    /// A varint was longer than ten bytes or overflowed 64 bits.
    #[snafu(display("Invalid varint."))]
    InvalidVarint,

    /// The field key carried field number zero.
    #[snafu(display("Invalid field number 0."))]
    InvalidTag,

    /// The field key carried an unknown wire type.
    #[snafu(display("Unknown wire type {} for field {}.", wire_type, tag))]
    UnknownWireType {
        /// Field number.
        tag: u32,

        /// Raw wire type value.
        wire_type: u8,
    },

    /// A known field arrived with a wire type that does not match its declaration.
    #[snafu(display("Unexpected wire type {:?} for field {}.{}.", wire_type, message, tag))]
    UnexpectedWireType {
        /// Message being decoded.
        message: &'static str,

        /// Field number.
        tag: u32,

        /// Wire type found on the wire.
        wire_type: WireType,
    },

    /// A string field did not contain valid UTF-8.
    #[snafu(display("Field {} is not valid UTF-8.", field))]
    InvalidUtf8 {
        /// Field name.
        field: &'static str,
    },

    /// Messages or groups were nested deeper than [`RECURSION_LIMIT`].
    #[snafu(display("Recursion limit reached."))]
    RecursionLimit,

    /// A group was opened and never closed, or closed without being opened.
    #[snafu(display("Unbalanced group for field {}.", tag))]
    UnbalancedGroup {
        /// Field number of the group.
        tag: u32,
    },
}

/// Maximum nesting of embedded messages and groups accepted while decoding.
///
/// Matches the limit applied by `prost`, so both decoders reject the same inputs.
pub const RECURSION_LIMIT: u32 = 100;

/// Protobuf wire types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WireType {
    /// Varint-encoded scalar.
    Varint,

    /// Eight byte little-endian scalar.
    SixtyFourBit,

    /// Length-prefixed bytes, strings, and embedded messages.
    LengthDelimited,

    /// Start of a group.
    StartGroup,

    /// End of a group.
    EndGroup,

    /// Four byte little-endian scalar.
    ThirtyTwoBit,
}

impl WireType {
    const fn as_u64(self) -> u64 {
        match self {
            Self::Varint => 0,
            Self::SixtyFourBit => 1,
            Self::LengthDelimited => 2,
            Self::StartGroup => 3,
            Self::EndGroup => 4,
            Self::ThirtyTwoBit => 5,
        }
    }

    fn try_from_raw(tag: u32, raw: u8) -> Result<Self, WireError> {
        match raw {
            0 => Ok(Self::Varint),
            1 => Ok(Self::SixtyFourBit),
            2 => Ok(Self::LengthDelimited),
            3 => Ok(Self::StartGroup),
            4 => Ok(Self::EndGroup),
            5 => Ok(Self::ThirtyTwoBit),
            wire_type => Err(WireError::UnknownWireType { tag, wire_type }),
        }
    }
}

/// Returns the number of bytes needed to encode `value` as a varint.
#[inline]
pub(crate) const fn varint_len(value: u64) -> usize {
    // Seven payload bits per byte: bit-length 0..=7 takes one byte, 8..=14 two, and so on up to ten.
    ((((value | 1).leading_zeros() ^ 63) * 9 + 73) / 64) as usize
}

/// Returns the number of bytes needed to encode the key for field `tag`.
#[inline]
pub(crate) const fn key_len(tag: u32) -> usize {
    varint_len((tag as u64) << 3)
}

/// Returns the encoded size of a length-delimited field whose payload is `len` bytes long.
#[inline]
pub(crate) const fn length_delimited_len(tag: u32, len: usize) -> usize {
    key_len(tag) + varint_len(len as u64) + len
}

/// Writes protobuf fields back to front into a fixed buffer.
///
/// Writing in reverse means an embedded message's length is known by the time its prefix has to be written, so each
/// message is sized exactly once. Fields must therefore be written in descending field order, and repeated fields in
/// reverse element order, to produce canonical output.
pub(crate) struct ReverseWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> ReverseWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        let pos = buf.len();
        Self { buf, pos }
    }

    /// Number of bytes written so far.
    pub fn written(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn reserve(&mut self, len: usize) -> Result<usize, WireError> {
        if len > self.pos {
            return Err(WireError::BufferTooSmall {
                required: len - self.pos,
                available: self.pos,
            });
        }

        self.pos -= len;
        Ok(self.pos)
    }

    pub fn put_slice(&mut self, data: &[u8]) -> Result<(), WireError> {
        let start = self.reserve(data.len())?;
        self.buf[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn put_varint(&mut self, mut value: u64) -> Result<(), WireError> {
        let mut idx = self.reserve(varint_len(value))?;
        while value >= 0x80 {
            self.buf[idx] = (value as u8 & 0x7F) | 0x80;
            value >>= 7;
            idx += 1;
        }
        self.buf[idx] = value as u8;
        Ok(())
    }

    pub fn put_key(&mut self, tag: u32, wire_type: WireType) -> Result<(), WireError> {
        self.put_varint(((tag as u64) << 3) | wire_type.as_u64())
    }

    pub fn put_bytes_field(&mut self, tag: u32, data: &[u8]) -> Result<(), WireError> {
        self.put_slice(data)?;
        self.put_varint(data.len() as u64)?;
        self.put_key(tag, WireType::LengthDelimited)
    }

    pub fn put_double_field(&mut self, tag: u32, value: f64) -> Result<(), WireError> {
        self.put_slice(&value.to_bits().to_le_bytes())?;
        self.put_key(tag, WireType::SixtyFourBit)
    }

    pub fn put_varint_field(&mut self, tag: u32, value: u64) -> Result<(), WireError> {
        self.put_varint(value)?;
        self.put_key(tag, WireType::Varint)
    }

    /// Writes an embedded message whose body is produced by `body`.
    pub fn put_message_field<F>(&mut self, tag: u32, body: F) -> Result<(), WireError>
    where
        F: FnOnce(&mut Self) -> Result<(), WireError>,
    {
        let before = self.written();
        body(self)?;
        let len = self.written() - before;
        self.put_varint(len as u64)?;
        self.put_key(tag, WireType::LengthDelimited)
    }
}

/// Reads protobuf fields front to back from a byte span.
pub(crate) struct SliceReader<'a> {
    data: &'a [u8],
}

impl<'a> SliceReader<'a> {
    pub const fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn read_varint(&mut self) -> Result<u64, WireError> {
        let mut value = 0u64;
        for (i, byte) in self.data.iter().copied().enumerate().take(10) {
            if i == 9 && byte > 0x01 {
                return Err(WireError::InvalidVarint);
            }

            value |= u64::from(byte & 0x7F) << (i * 7);
            if byte < 0x80 {
                self.data = &self.data[i + 1..];
                return Ok(value);
            }
        }

        if self.data.len() >= 10 {
            Err(WireError::InvalidVarint)
        } else {
            Err(WireError::Truncated { what: "varint" })
        }
    }

    pub fn read_key(&mut self) -> Result<(u32, WireType), WireError> {
        let key = self.read_varint()?;
        if key > u64::from(u32::MAX) {
            return Err(WireError::InvalidVarint);
        }

        let tag = (key >> 3) as u32;
        if tag == 0 {
            return Err(WireError::InvalidTag);
        }

        let wire_type = WireType::try_from_raw(tag, (key & 0x07) as u8)?;
        Ok((tag, wire_type))
    }

    fn take(&mut self, len: usize, what: &'static str) -> Result<&'a [u8], WireError> {
        if len > self.data.len() {
            return Err(WireError::Truncated { what });
        }

        let (head, tail) = self.data.split_at(len);
        self.data = tail;
        Ok(head)
    }

    pub fn read_length_delimited(&mut self) -> Result<&'a [u8], WireError> {
        let len = self.read_varint()?;
        let len = usize::try_from(len).map_err(|_| WireError::Truncated {
            what: "length-delimited field",
        })?;
        self.take(len, "length-delimited field")
    }

    pub fn read_fixed64(&mut self) -> Result<u64, WireError> {
        let bytes = self.take(8, "fixed64")?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(raw))
    }

    pub fn read_double(&mut self) -> Result<f64, WireError> {
        self.read_fixed64().map(f64::from_bits)
    }

    /// Skips over the value of a field the caller does not recognize.
    ///
    /// `budget` is the nesting still allowed below the current message. Each nested group consumes one level.
    pub fn skip_field(&mut self, tag: u32, wire_type: WireType, budget: u32) -> Result<(), WireError> {
        if budget == 0 {
            return Err(WireError::RecursionLimit);
        }

        match wire_type {
            WireType::Varint => self.read_varint().map(drop),
            WireType::SixtyFourBit => self.take(8, "fixed64").map(drop),
            WireType::ThirtyTwoBit => self.take(4, "fixed32").map(drop),
            WireType::LengthDelimited => self.read_length_delimited().map(drop),
            WireType::StartGroup => loop {
                if self.is_empty() {
                    return Err(WireError::UnbalancedGroup { tag });
                }

                let (inner_tag, inner_wire_type) = self.read_key()?;
                if inner_wire_type == WireType::EndGroup {
                    if inner_tag != tag {
                        return Err(WireError::UnbalancedGroup { tag: inner_tag });
                    }
                    return Ok(());
                }
                self.skip_field(inner_tag, inner_wire_type, budget - 1)?;
            },
            WireType::EndGroup => Err(WireError::UnbalancedGroup { tag }),
        }
    }
}
