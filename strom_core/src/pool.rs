//! Memory pool integration.
//!
//! Outbound payload buffers come from an abstract pool. The streaming core
//! treats the pool as opaque: it takes blocks, wraps them in refcounted
//! ranges, and the block finds its own way home when the last reference
//! drops. Pools announce reclaimed blocks to subscribed sinks so stalled
//! producers can resume.

use crate::{ConnectorId, StreamError, StreamResult, StreamUnit, UpstreamMessage};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// Receiver of pool events. Callbacks run on whichever thread released the
/// last reference to a block, so implementations must be quick.
pub trait PoolEventSink: Send + Sync {
    fn blocks_available(&self);
}

/// Home of a memory block; receives the raw buffer back on final release.
pub trait BlockHome: Send + Sync {
    fn reclaim(&self, buf: Box<[u8]>);
}

/// One block of pool memory.
///
/// A freshly allocated block is uniquely owned and writable. Once wrapped in
/// an `Arc` and referenced by ranges it is immutable; dropping the last
/// reference returns the buffer to its pool.
pub struct MemoryBlock {
    buf: Box<[u8]>,
    home: Weak<dyn BlockHome>,
}

impl MemoryBlock {
    pub fn new(buf: Box<[u8]>, home: Weak<dyn BlockHome>) -> Self {
        Self { buf, home }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.buf
    }

    /// Write access, only available while the block is not yet shared.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for MemoryBlock {
    fn drop(&mut self) {
        if let Some(home) = self.home.upgrade() {
            home.reclaim(std::mem::take(&mut self.buf));
        }
    }
}

/// Abstract memory pool as seen by streaming units.
pub trait MemoryPool: Send + Sync {
    /// Move up to `count` blocks out of the pool into `dest`. Returns the
    /// number of blocks obtained; zero available blocks is `ObjectEmpty`.
    /// `owner` names the requesting unit, recorded for tracing only.
    fn get_memory_blocks(
        &self,
        dest: &mut Vec<MemoryBlock>,
        count: usize,
        owner: &str,
    ) -> StreamResult<usize>;

    /// Size of one block in bytes.
    fn block_size(&self) -> usize;

    /// Subscribe to "blocks available" events.
    fn subscribe(&self, sink: Weak<dyn PoolEventSink>);
}

struct HeapPoolShared {
    free: Mutex<Vec<Box<[u8]>>>,
    sinks: Mutex<Vec<Weak<dyn PoolEventSink>>>,
    block_size: usize,
    total_blocks: usize,
}

impl HeapPoolShared {
    fn notify(&self) {
        let mut sinks = self.sinks.lock();
        sinks.retain(|sink| match sink.upgrade() {
            Some(sink) => {
                sink.blocks_available();
                true
            }
            None => false,
        });
    }
}

impl BlockHome for HeapPoolShared {
    fn reclaim(&self, buf: Box<[u8]>) {
        let was_empty = {
            let mut free = self.free.lock();
            let was_empty = free.is_empty();
            free.push(buf);
            was_empty
        };
        if was_empty {
            self.notify();
        }
    }
}

/// Simple heap backed pool with a fixed number of fixed size blocks.
pub struct HeapPool {
    shared: Arc<HeapPoolShared>,
}

impl HeapPool {
    pub fn new(num_blocks: usize, block_size: usize) -> Arc<Self> {
        let free = (0..num_blocks)
            .map(|_| vec![0u8; block_size].into_boxed_slice())
            .collect();
        Arc::new(Self {
            shared: Arc::new(HeapPoolShared {
                free: Mutex::new(free),
                sinks: Mutex::new(Vec::new()),
                block_size,
                total_blocks: num_blocks,
            }),
        })
    }

    /// Number of blocks currently at home in the pool.
    pub fn free_blocks(&self) -> usize {
        self.shared.free.lock().len()
    }

    pub fn total_blocks(&self) -> usize {
        self.shared.total_blocks
    }
}

impl MemoryPool for HeapPool {
    fn get_memory_blocks(
        &self,
        dest: &mut Vec<MemoryBlock>,
        count: usize,
        owner: &str,
    ) -> StreamResult<usize> {
        let home = Arc::downgrade(&self.shared) as Weak<dyn BlockHome>;
        let mut free = self.shared.free.lock();
        if free.is_empty() {
            log::trace!("pool empty, {owner} has to wait for blocks");
            return Err(StreamError::ObjectEmpty);
        }
        let taken = count.min(free.len());
        let start = free.len() - taken;
        for buf in free.drain(start..) {
            dest.push(MemoryBlock::new(buf, home.clone()));
        }
        log::trace!("{owner} took {taken}/{count} blocks");
        Ok(taken)
    }

    fn block_size(&self) -> usize {
        self.shared.block_size
    }

    fn subscribe(&self, sink: Weak<dyn PoolEventSink>) {
        self.shared.sinks.lock().push(sink);
    }
}

/// The streaming-unit view of a memory pool.
///
/// Wraps whichever allocator arrived from downstream, and forwards the
/// pool's "blocks available" events as `allocator_blocks_available`
/// upstream notifications on the owning unit, so a stalled producer wakes
/// up again.
pub struct PoolAllocator {
    unit: Weak<dyn StreamUnit>,
    connector: ConnectorId,
    pool: Mutex<Option<Arc<dyn MemoryPool>>>,
}

impl PoolAllocator {
    pub fn new(unit: Weak<dyn StreamUnit>, connector: ConnectorId) -> Arc<Self> {
        Arc::new(Self {
            unit,
            connector,
            pool: Mutex::new(None),
        })
    }

    /// Install (or clear) the allocator and subscribe to its events.
    pub fn set_pool(self: &Arc<Self>, pool: Option<Arc<dyn MemoryPool>>) {
        if let Some(pool) = &pool {
            pool.subscribe(Arc::downgrade(self) as Weak<dyn PoolEventSink>);
        }
        *self.pool.lock() = pool;
    }

    pub fn has_pool(&self) -> bool {
        self.pool.lock().is_some()
    }

    pub fn pool(&self) -> Option<Arc<dyn MemoryPool>> {
        self.pool.lock().clone()
    }

    pub fn get_memory_blocks(
        &self,
        dest: &mut Vec<MemoryBlock>,
        count: usize,
    ) -> StreamResult<usize> {
        let pool = self.pool().ok_or(StreamError::IncompleteConfiguration)?;
        let owner = self
            .unit
            .upgrade()
            .map(|u| u.base().name().to_owned())
            .unwrap_or_default();
        pool.get_memory_blocks(dest, count, &owner)
    }
}

impl PoolEventSink for PoolAllocator {
    fn blocks_available(&self) {
        if let Some(unit) = self.unit.upgrade() {
            if let Err(err) =
                unit.upstream_notification(self.connector, UpstreamMessage::AllocatorBlocksAvailable)
            {
                log::debug!("blocks-available notification dropped: {err}");
            }
        }
    }
}
