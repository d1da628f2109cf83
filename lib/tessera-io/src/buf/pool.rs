use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync::{
        atomic::{AtomicUsize, Ordering::Relaxed},
        Arc,
    },
};

use crossbeam_queue::ArrayQueue;
use metrics::{counter, Counter};

/// Encoded size, in bytes, below which buffers are freshly allocated instead of taken from a pool.
pub const BUFFER_POOLING_THRESHOLD: usize = 1024;

/// Default number of idle buffers retained per size class.
pub const DEFAULT_TIER_CAPACITY: usize = 64;

const TIER_SIZES: [usize; 5] = [256, 4 * 1024, 16 * 1024, 32 * 1024, 1024 * 1024];

/// Largest capacity a size class retains, as a multiple of its size.
const MAX_RETAINED_CAPACITY_FACTOR: usize = 2;

/// Returns `true` if a buffer of `size` bytes should bypass the pool.
pub const fn is_below_pooling_threshold(size: usize) -> bool {
    size < BUFFER_POOLING_THRESHOLD
}

/// A shared source of reusable byte buffers.
///
/// Pools never fail: when no idle buffer is available, a new one is allocated.
pub trait BufferPool: Send + Sync {
    /// Returns a buffer whose length is exactly `size`.
    ///
    /// The contents of the buffer are unspecified.
    fn get(&self, size: usize) -> Vec<u8>;

    /// Returns a buffer to the pool.
    ///
    /// The pool may drop the buffer instead of retaining it.
    fn put(&self, buf: Vec<u8>);
}

struct Tier {
    size: usize,
    idle: ArrayQueue<Vec<u8>>,
}

struct Telemetry {
    hits: Counter,
    misses: Counter,
    discards: Counter,
}

impl Telemetry {
    fn new() -> Self {
        Self {
            hits: counter!("buffer_pool_hits_total"),
            misses: counter!("buffer_pool_misses_total"),
            discards: counter!("buffer_pool_discards_total"),
        }
    }
}

/// A buffer pool partitioned into fixed size classes.
///
/// Each size class keeps a bounded, lock-free queue of idle buffers. Requests are served from the smallest class that
/// fits; requests larger than the largest class are always freshly allocated. A returned buffer is dropped instead of
/// retained when its class is full, when its capacity is more than twice its class size, or when retaining it would
/// exceed the pool's retained bytes limit.
pub struct TieredBufferPool {
    tiers: Vec<Tier>,
    retained_bytes: AtomicUsize,
    retained_bytes_limit: usize,
    telemetry: Telemetry,
}

impl TieredBufferPool {
    /// Creates a new `TieredBufferPool` retaining up to [`DEFAULT_TIER_CAPACITY`] idle buffers per size class.
    pub fn new() -> Self {
        Self::with_tier_capacity(DEFAULT_TIER_CAPACITY)
    }

    /// Creates a new `TieredBufferPool` retaining up to `capacity` idle buffers per size class.
    ///
    /// A capacity of zero is treated as one.
    pub fn with_tier_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let tiers = TIER_SIZES
            .iter()
            .map(|&size| Tier {
                size,
                idle: ArrayQueue::new(capacity),
            })
            .collect();

        Self {
            tiers,
            retained_bytes: AtomicUsize::new(0),
            retained_bytes_limit: usize::MAX,
            telemetry: Telemetry::new(),
        }
    }

    /// Caps the total capacity of idle buffers held by the pool at `limit` bytes.
    pub fn with_retained_bytes_limit(mut self, limit: usize) -> Self {
        self.retained_bytes_limit = limit;
        self
    }

    /// Creates a shareable handle to a new pool with the default configuration.
    pub fn shared() -> Arc<dyn BufferPool> {
        Arc::new(Self::new())
    }

    /// Number of idle buffers currently held, across all size classes.
    pub fn idle_buffers(&self) -> usize {
        self.tiers.iter().map(|tier| tier.idle.len()).sum()
    }

    /// Total capacity, in bytes, of the idle buffers currently held.
    pub fn retained_bytes(&self) -> usize {
        self.retained_bytes.load(Relaxed)
    }

    fn try_reserve(&self, capacity: usize) -> bool {
        self.retained_bytes
            .fetch_update(Relaxed, Relaxed, |retained| {
                retained
                    .checked_add(capacity)
                    .filter(|&total| total <= self.retained_bytes_limit)
            })
            .is_ok()
    }

    fn tier_for_request(&self, size: usize) -> Option<&Tier> {
        self.tiers.iter().find(|tier| size <= tier.size)
    }

    fn tier_for_capacity(&self, capacity: usize) -> Option<&Tier> {
        self.tiers
            .iter()
            .rev()
            .find(|tier| tier.size <= capacity)
            .filter(|tier| capacity <= tier.size * MAX_RETAINED_CAPACITY_FACTOR)
    }
}

impl BufferPool for TieredBufferPool {
    fn get(&self, size: usize) -> Vec<u8> {
        let Some(tier) = self.tier_for_request(size) else {
            self.telemetry.misses.increment(1);
            return vec![0; size];
        };

        let mut buf = match tier.idle.pop() {
            Some(buf) => {
                self.retained_bytes.fetch_sub(buf.capacity(), Relaxed);
                self.telemetry.hits.increment(1);
                buf
            }
            None => {
                self.telemetry.misses.increment(1);
                Vec::with_capacity(tier.size)
            }
        };
        buf.resize(size, 0);
        buf
    }

    fn put(&self, buf: Vec<u8>) {
        let capacity = buf.capacity();
        let Some(tier) = self.tier_for_capacity(capacity) else {
            self.telemetry.discards.increment(1);
            return;
        };

        if !self.try_reserve(capacity) {
            self.telemetry.discards.increment(1);
            return;
        }

        if tier.idle.push(buf).is_err() {
            self.retained_bytes.fetch_sub(capacity, Relaxed);
            self.telemetry.discards.increment(1);
        }
    }
}

impl fmt::Debug for TieredBufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TieredBufferPool")
            .field("tiers", &TIER_SIZES)
            .field("idle_buffers", &self.idle_buffers())
            .field("retained_bytes", &self.retained_bytes())
            .finish()
    }
}

/// A byte buffer borrowed from a [`BufferPool`].
///
/// The buffer is returned to its pool when dropped or explicitly [freed][PooledBuffer::free]. Ownership moves with the
/// value, so whoever holds it last is responsible for the release.
pub struct PooledBuffer {
    data: Vec<u8>,
    pool: Arc<dyn BufferPool>,
}

impl PooledBuffer {
    /// Takes a buffer of exactly `size` bytes from `pool`.
    pub fn acquire(pool: &Arc<dyn BufferPool>, size: usize) -> Self {
        Self {
            data: pool.get(size),
            pool: Arc::clone(pool),
        }
    }

    /// Returns the buffer to its pool.
    pub fn free(self) {
        drop(self);
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        self.pool.put(data);
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer").field("len", &self.data.len()).finish()
    }
}
