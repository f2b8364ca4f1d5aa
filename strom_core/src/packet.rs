//! Streaming data packets and per-output packet pools.
//!
//! A packet is the transport quantum of the graph: identification, flags,
//! timing, and a payload of up to [`MAX_PACKET_ENTRIES`] tags and ranges
//! (tags first). Packets are owned by whichever unit currently processes
//! them and return to their originating pool when released, independent of
//! the graph topology.

use crate::{DataRange, StreamError, StreamResult, Tag};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::{
    Arc, Weak,
    atomic::{AtomicU64, Ordering},
};
use strom_primitives::{PacketFlags, StreamTime, TickDuration};

/// Maximum number of tags plus ranges in one packet.
///
/// A fixed limit keeps the payload inline; it is no real limitation as
/// another packet can carry what does not fit.
pub const MAX_PACKET_ENTRIES: usize = 16;

pub type PacketBox = Box<StreamPacket>;

/// A packet hand-off that was refused; the caller gets the packet back and
/// decides whether the error is recoverable.
#[derive(Debug)]
pub struct PacketRefused {
    pub packet: PacketBox,
    pub error: StreamError,
}

impl PacketRefused {
    pub fn new(packet: PacketBox, error: StreamError) -> Self {
        Self { packet, error }
    }
}

pub type PacketResult = Result<(), PacketRefused>;

static NEXT_PACKET_SERIAL: AtomicU64 = AtomicU64::new(1);

/// The transport quantum of the streaming graph.
#[derive(Debug, Default)]
pub struct StreamPacket {
    /// The segment this packet belongs to. Valid with the segment flags.
    pub segment_number: u16,
    /// Ascending for all packets between group start and group end.
    pub group_number: u16,
    pub flags: PacketFlags,
    /// Presentation start time, valid with `START_TIME_VALID`.
    pub start_time: StreamTime,
    /// Presentation end time, valid with `END_TIME_VALID`.
    pub end_time: StreamTime,
    /// Stream time to skip at group start, valid with `SKIP_UNTIL`.
    pub skip_duration: TickDuration,
    /// Stream time after which group data is discarded, valid with `CUT_AFTER`.
    pub cut_duration: TickDuration,
    /// Bitmap marking the ranges that begin a frame.
    pub frame_start_flags: u16,

    tags: SmallVec<[Tag; 4]>,
    ranges: SmallVec<[DataRange; 4]>,

    serial: u64,
    origin: Option<PacketOrigin>,
}

impl StreamPacket {
    /// A free-standing packet without an originating pool, e.g. built by the
    /// application for delivery through a proxy.
    pub fn new() -> Self {
        Self {
            serial: NEXT_PACKET_SERIAL.fetch_add(1, Ordering::Relaxed),
            ..Default::default()
        }
    }

    fn pooled(origin: PacketOrigin) -> PacketBox {
        let mut packet = Self::new();
        packet.origin = Some(origin);
        Box::new(packet)
    }

    /// Identity of this packet allocation, stable across reuse cycles of
    /// the same pool entry within one processing pass.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn num_tags(&self) -> usize {
        self.tags.len()
    }

    pub fn num_ranges(&self) -> usize {
        self.ranges.len()
    }

    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }

    pub fn ranges(&self) -> &[DataRange] {
        &self.ranges
    }

    /// Total number of payload bytes across all ranges.
    pub fn data_size(&self) -> usize {
        self.ranges.iter().map(|r| r.len()).sum()
    }

    pub fn push_tag(&mut self, tag: Tag) -> StreamResult<()> {
        if self.tags.len() + self.ranges.len() >= MAX_PACKET_ENTRIES {
            return Err(StreamError::ObjectFull);
        }
        debug_assert!(self.ranges.is_empty(), "tags precede ranges in a packet");
        self.tags.push(tag);
        Ok(())
    }

    /// Append a range, taking a reference on its block with this packet as
    /// the holder.
    pub fn push_range(&mut self, range: DataRange) -> StreamResult<()> {
        if self.tags.len() + self.ranges.len() >= MAX_PACKET_ENTRIES {
            return Err(StreamError::ObjectFull);
        }
        self.ranges.push(range);
        Ok(())
    }

    /// Release the packet's references on its contained ranges.
    pub fn release_ranges(&mut self) {
        self.ranges.clear();
    }

    /// Move the contained ranges out, transferring their block references
    /// to the caller.
    pub fn transfer_ranges(&mut self) -> SmallVec<[DataRange; 4]> {
        std::mem::take(&mut self.ranges)
    }

    /// Copy identification, flags, timing and payload from another packet.
    /// Cloned ranges take new references with this packet as holder. The
    /// origin and serial of `self` are preserved.
    pub fn copy_from(&mut self, other: &StreamPacket) {
        self.segment_number = other.segment_number;
        self.group_number = other.group_number;
        self.flags = other.flags;
        self.start_time = other.start_time;
        self.end_time = other.end_time;
        self.skip_duration = other.skip_duration;
        self.cut_duration = other.cut_duration;
        self.frame_start_flags = other.frame_start_flags;
        self.tags = other.tags.clone();
        self.ranges = other.ranges.clone();
    }

    /// Reset everything except origin and serial.
    pub fn reset(&mut self) {
        let origin = self.origin.take();
        let serial = self.serial;
        *self = Self::default();
        self.origin = origin;
        self.serial = serial;
    }

    /// Hand the packet back to its originating pool. Range references must
    /// have been released before. A packet without an origin is dropped.
    pub fn return_to_origin(mut self: PacketBox) {
        debug_assert!(
            self.ranges.is_empty(),
            "packet returned to origin with live range references"
        );
        self.release_ranges();
        if let Some(origin) = self.origin.clone() {
            origin.put_back(self);
        }
    }
}

/// Handle through which packets find their way back to their pool.
#[derive(Clone)]
pub struct PacketOrigin {
    shared: Weak<PoolShared>,
}

impl std::fmt::Debug for PacketOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PacketOrigin")
    }
}

impl PacketOrigin {
    fn put_back(&self, mut packet: PacketBox) {
        if let Some(shared) = self.shared.upgrade() {
            packet.reset();
            shared.stack.lock().push(packet);
        }
    }
}

struct PoolShared {
    stack: Mutex<Vec<PacketBox>>,
}

/// A stack of empty packets owned by an output connector (or a mixer
/// output). `get_empty` pops, `return_to_origin` pushes.
pub struct PacketPool {
    shared: Arc<PoolShared>,
    capacity: usize,
}

impl PacketPool {
    pub fn new(num_packets: usize) -> Self {
        let shared = Arc::new(PoolShared {
            stack: Mutex::new(Vec::with_capacity(num_packets)),
        });
        let origin = PacketOrigin {
            shared: Arc::downgrade(&shared),
        };
        {
            let mut stack = shared.stack.lock();
            for _ in 0..num_packets {
                stack.push(StreamPacket::pooled(origin.clone()));
            }
        }
        Self {
            shared,
            capacity: num_packets,
        }
    }

    pub fn get_empty(&self) -> StreamResult<PacketBox> {
        self.shared
            .stack
            .lock()
            .pop()
            .ok_or(StreamError::ObjectEmpty)
    }

    /// Number of empty packets currently at home.
    pub fn available(&self) -> usize {
        self.shared.stack.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::{MAX_PACKET_ENTRIES, PacketPool, StreamPacket};
    use crate::{DataRange, HeapPool, MemoryPool, StreamError, Tag};
    use std::sync::Arc;
    use strom_primitives::PacketFlags;

    fn test_range(len: usize) -> DataRange {
        let pool = HeapPool::new(1, len);
        let mut blocks = Vec::new();
        pool.get_memory_blocks(&mut blocks, 1, "test").ok();
        DataRange::whole(Arc::new(blocks.remove(0)))
    }

    #[test]
    fn payload_capacity_is_shared() {
        let mut packet = StreamPacket::new();
        for _ in 0..6 {
            packet.push_tag(Tag::default()).ok();
        }
        let range = test_range(8);
        for _ in 0..MAX_PACKET_ENTRIES - 6 {
            assert!(packet.push_range(range.clone()).is_ok());
        }
        assert_eq!(packet.push_range(range), Err(StreamError::ObjectFull));
    }

    #[test]
    fn pool_round_trip() {
        let pool = PacketPool::new(2);
        let mut packet = pool.get_empty().expect("pool starts full");
        packet.flags = PacketFlags::SEGMENT_START;
        packet.segment_number = 7;
        assert_eq!(pool.available(), 1);

        packet.return_to_origin();
        assert_eq!(pool.available(), 2);

        let packet = pool.get_empty().expect("returned packet is reusable");
        assert_eq!(packet.flags, PacketFlags::empty());
        assert_eq!(packet.segment_number, 0);
    }

    #[test]
    fn copy_re_references_ranges() {
        let mem = HeapPool::new(1, 16);
        let mut blocks = Vec::new();
        mem.get_memory_blocks(&mut blocks, 1, "test").ok();
        let block = Arc::new(blocks.remove(0));

        let mut original = StreamPacket::new();
        original.push_range(DataRange::whole(block.clone())).ok();
        drop(block);

        let mut copy = StreamPacket::new();
        copy.copy_from(&original);
        original.release_ranges();
        assert_eq!(mem.free_blocks(), 0);
        copy.release_ranges();
        assert_eq!(mem.free_blocks(), 1);
    }
}
