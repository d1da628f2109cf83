use std::{borrow::Cow, sync::Arc};

use bytes::Bytes;

use super::{BufferPool, PooledBuffer};

/// A single fragment of encoded data.
#[derive(Debug)]
pub enum Buffer {
    /// Data owned outright.
    Owned(Bytes),

    /// Data held in a buffer borrowed from a pool.
    Pooled(PooledBuffer),
}

impl Buffer {
    /// Returns the data in this fragment.
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Self::Owned(data) => &data[..],
            Self::Pooled(data) => &data[..],
        }
    }

    /// Returns `true` if this fragment must be returned to a pool once released.
    pub fn is_pooled(&self) -> bool {
        matches!(self, Self::Pooled(_))
    }
}

impl From<Bytes> for Buffer {
    fn from(data: Bytes) -> Self {
        Self::Owned(data)
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(data: Vec<u8>) -> Self {
        Self::Owned(Bytes::from(data))
    }
}

impl From<PooledBuffer> for Buffer {
    fn from(data: PooledBuffer) -> Self {
        Self::Pooled(data)
    }
}

/// An ordered sequence of fragments that together form one encoded message.
#[derive(Debug, Default)]
pub struct BufferSlice {
    buffers: Vec<Buffer>,
}

impl BufferSlice {
    /// Creates an empty `BufferSlice`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a fragment.
    pub fn push<B: Into<Buffer>>(&mut self, buffer: B) {
        self.buffers.push(buffer.into());
    }

    /// Returns the fragments, in order.
    pub fn buffers(&self) -> &[Buffer] {
        &self.buffers
    }

    /// Returns an iterator over the data of each fragment, in order.
    pub fn fragments(&self) -> impl Iterator<Item = &[u8]> {
        self.buffers.iter().map(Buffer::as_slice)
    }

    /// Total length of all fragments, in bytes.
    pub fn len(&self) -> usize {
        self.fragments().map(<[u8]>::len).sum()
    }

    /// Returns `true` if there is no data in any fragment.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies every fragment into a single freshly allocated vector.
    pub fn materialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for fragment in self.fragments() {
            out.extend_from_slice(fragment);
        }
        out
    }

    /// Returns the data as one contiguous span, borrowing when there is at most one fragment.
    pub fn contiguous(&self) -> Cow<'_, [u8]> {
        match self.buffers.as_slice() {
            [] => Cow::Borrowed(&[]),
            [single] => Cow::Borrowed(single.as_slice()),
            _ => Cow::Owned(self.materialize()),
        }
    }

    /// Returns the data as one contiguous span, copying into a buffer from `pool` when there are multiple fragments.
    ///
    /// The pooled copy, if any, is released when the returned value is dropped.
    pub fn materialize_to_buffer(&self, pool: &Arc<dyn BufferPool>) -> Materialized<'_> {
        match self.buffers.as_slice() {
            [] => Materialized::Borrowed(&[]),
            [single] => Materialized::Borrowed(single.as_slice()),
            _ => {
                let mut buf = PooledBuffer::acquire(pool, self.len());
                let mut offset = 0;
                for fragment in self.fragments() {
                    buf[offset..offset + fragment.len()].copy_from_slice(fragment);
                    offset += fragment.len();
                }
                Materialized::Pooled(buf)
            }
        }
    }
}

impl From<Buffer> for BufferSlice {
    fn from(buffer: Buffer) -> Self {
        Self { buffers: vec![buffer] }
    }
}

macro_rules! impl_single_fragment {
    ($($ty:ty),+) => {
        $(
            impl From<$ty> for BufferSlice {
                fn from(data: $ty) -> Self {
                    Self::from(Buffer::from(data))
                }
            }
        )+
    };
}

impl_single_fragment!(Bytes, Vec<u8>, PooledBuffer);

/// A contiguous, read-only view of a [`BufferSlice`].
#[derive(Debug)]
pub enum Materialized<'a> {
    /// A view directly into the single fragment of the slice.
    Borrowed(&'a [u8]),

    /// A pooled copy of multiple fragments.
    Pooled(PooledBuffer),
}

impl Materialized<'_> {
    /// Returns the data.
    pub fn read_only_data(&self) -> &[u8] {
        match self {
            Self::Borrowed(data) => *data,
            Self::Pooled(buf) => &buf[..],
        }
    }
}
