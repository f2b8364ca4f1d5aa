//! Support types for stream processing units.

use crate::{DataRange, PacketFormatter, StreamError, StreamResult};

/// An ordered staging queue of data ranges with byte-exact editing.
///
/// Decoders and frame mixers collect the ranges of a presentation unit
/// here, trim them (skip/cut), and hand them onwards to a formatter in one
/// go. Ranges keep their block references while queued.
pub struct RangeQueue {
    ranges: Vec<DataRange>,
    sent: usize,
    max_ranges: usize,
    size: usize,
}

impl RangeQueue {
    pub fn new(max_ranges: usize) -> Self {
        Self {
            ranges: Vec::with_capacity(max_ranges),
            sent: 0,
            max_ranges,
            size: 0,
        }
    }

    /// Total queued bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn append_range(&mut self, range: DataRange) -> StreamResult<()> {
        if self.ranges.len() == self.max_ranges {
            return Err(StreamError::ObjectFull);
        }
        if !range.is_empty() {
            self.size += range.len();
            self.ranges.push(range);
        }
        Ok(())
    }

    pub fn append_sub_range(
        &mut self,
        range: &DataRange,
        offset: usize,
        size: usize,
    ) -> StreamResult<()> {
        if self.ranges.len() == self.max_ranges {
            return Err(StreamError::ObjectFull);
        }
        if size > 0 {
            self.size += size;
            self.ranges.push(range.sub_range(offset, size));
        }
        Ok(())
    }

    /// Move every range of `other` to the end of this queue.
    pub fn append_queue(&mut self, other: &mut RangeQueue) -> StreamResult<()> {
        if self.ranges.len() + other.ranges.len() > self.max_ranges {
            return Err(StreamError::ObjectFull);
        }
        self.size += other.size;
        self.ranges.append(&mut other.ranges);
        other.sent = 0;
        other.size = 0;
        Ok(())
    }

    /// Release all queued ranges.
    pub fn flush_ranges(&mut self) {
        self.ranges.clear();
        self.sent = 0;
        self.size = 0;
    }

    /// Put all queued ranges into the formatter. On `ObjectFull` already
    /// delivered ranges stay released and the remainder is retried later.
    pub fn send_ranges(&mut self, formatter: &mut PacketFormatter) -> StreamResult<()> {
        while self.sent < self.ranges.len() {
            formatter.put_range(self.ranges[self.sent].clone())?;
            self.sent += 1;
        }
        self.flush_ranges();
        Ok(())
    }

    /// Drop up to `num` bytes from the front; returns how many went.
    pub fn drop_bytes(&mut self, mut num: usize) -> usize {
        let mut done = 0;
        while !self.ranges.is_empty() && num > 0 {
            let first = &mut self.ranges[0];
            if first.len() > num {
                first.advance_front(num);
                done += num;
                num = 0;
            } else {
                num -= first.len();
                done += first.len();
                self.ranges.remove(0);
            }
        }
        self.size -= done;
        done
    }

    /// Keep only the first `num` bytes, releasing the tail.
    pub fn limit_bytes(&mut self, num: usize) {
        if num >= self.size {
            return;
        }
        let mut excess = self.size - num;
        self.size = num;
        while let Some(last) = self.ranges.last_mut() {
            if excess == 0 {
                break;
            }
            if last.len() > excess {
                last.truncate(last.len() - excess);
                excess = 0;
            } else {
                excess -= last.len();
                self.ranges.pop();
            }
        }
    }

    /// Remove `num` bytes starting at `offset`, splitting a range when the
    /// cut lies inside one.
    pub fn skip_bytes(&mut self, offset: usize, num: usize) {
        if num == 0 {
            return;
        }
        if offset == 0 {
            self.drop_bytes(num);
            return;
        }
        if offset + num >= self.size {
            self.limit_bytes(offset);
            return;
        }

        // Locate the first affected range
        let mut first = 0;
        let mut in_offset = offset;
        while in_offset > self.ranges[first].len() {
            in_offset -= self.ranges[first].len();
            first += 1;
        }

        // Locate the last affected range
        let mut last = first;
        let mut remaining = num + in_offset;
        while remaining >= self.ranges[last].len() {
            remaining -= self.ranges[last].len();
            last += 1;
        }

        self.size -= num;
        if first == last {
            // The cut is inside one range; keep head and tail views.
            let tail = self.ranges[first]
                .sub_range(remaining, self.ranges[first].len() - remaining);
            self.ranges[first].truncate(in_offset);
            self.ranges.insert(first + 1, tail);
        } else {
            self.ranges[first].truncate(in_offset);
            self.ranges[last].advance_front(remaining);
            self.ranges.drain(first + 1..last);
        }
    }

    /// Byte at queue position `at`.
    pub fn byte(&self, mut at: usize) -> u8 {
        debug_assert!(at < self.size);
        let mut i = 0;
        while at >= self.ranges[i].len() {
            at -= self.ranges[i].len();
            i += 1;
        }
        self.ranges[i].data()[at]
    }
}

#[cfg(test)]
mod tests {
    use super::RangeQueue;
    use crate::{DataRange, HeapPool, MemoryPool};
    use std::sync::Arc;

    fn numbered_range(len: usize, start: u8) -> DataRange {
        let pool = HeapPool::new(1, len);
        let mut blocks = Vec::new();
        pool.get_memory_blocks(&mut blocks, 1, "test").ok();
        let mut block = blocks.remove(0);
        for (i, b) in block.data_mut().iter_mut().enumerate() {
            *b = start + i as u8;
        }
        DataRange::whole(Arc::new(block))
    }

    fn bytes_of(queue: &RangeQueue) -> Vec<u8> {
        (0..queue.size()).map(|i| queue.byte(i)).collect()
    }

    #[test]
    fn drop_and_limit() {
        let mut queue = RangeQueue::new(8);
        queue.append_range(numbered_range(4, 0)).ok();
        queue.append_range(numbered_range(4, 10)).ok();
        assert_eq!(queue.drop_bytes(5), 5);
        assert_eq!(bytes_of(&queue), vec![11, 12, 13]);
        queue.limit_bytes(2);
        assert_eq!(bytes_of(&queue), vec![11, 12]);
    }

    #[test]
    fn skip_inside_one_range() {
        let mut queue = RangeQueue::new(8);
        queue.append_range(numbered_range(8, 0)).ok();
        queue.skip_bytes(2, 3);
        assert_eq!(bytes_of(&queue), vec![0, 1, 5, 6, 7]);
    }

    #[test]
    fn skip_across_ranges() {
        let mut queue = RangeQueue::new(8);
        queue.append_range(numbered_range(4, 0)).ok();
        queue.append_range(numbered_range(4, 10)).ok();
        queue.append_range(numbered_range(4, 20)).ok();
        queue.skip_bytes(3, 6);
        assert_eq!(bytes_of(&queue), vec![0, 1, 2, 21, 22, 23]);
    }
}
