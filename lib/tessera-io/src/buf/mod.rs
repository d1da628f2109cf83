//! Byte buffers and buffer pooling.

mod pool;
pub use self::pool::{
    is_below_pooling_threshold, BufferPool, PooledBuffer, TieredBufferPool, BUFFER_POOLING_THRESHOLD,
    DEFAULT_TIER_CAPACITY,
};

mod slice;
pub use self::slice::{Buffer, BufferSlice, Materialized};
