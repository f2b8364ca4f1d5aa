//! The streaming packet formatter, complementary to the parser.
//!
//! A single output packet is assembled until one of the forced-flush
//! conditions triggers a send: the tag list hits capacity, the range count
//! hits the configured threshold, an end time is already placed, a segment
//! end or time discontinuity is formatted, or the client commits.

use crate::{
    DataRange, MAX_PACKET_ENTRIES, OutputConnector, PacketBox, StreamError, StreamResult, Tag,
    TagId,
};
use std::sync::Arc;
use strom_primitives::{PacketFlags, StreamTime, TickDuration};

/// Where a formatter sends its finished packets.
pub trait PacketOutput: Send + Sync {
    fn get_empty_packet(&self) -> StreamResult<PacketBox>;
    /// On refusal the packet stays with the formatter for a later retry.
    fn send_packet(&self, packet: PacketBox) -> Result<(), crate::PacketRefused>;
    /// Tag ids supported downstream; empty means pass-through.
    fn stream_tag_ids(&self) -> Vec<TagId> {
        Vec::new()
    }
}

impl PacketOutput for OutputConnector {
    fn get_empty_packet(&self) -> StreamResult<PacketBox> {
        OutputConnector::get_empty_packet(self)
    }
    fn send_packet(&self, packet: PacketBox) -> Result<(), crate::PacketRefused> {
        OutputConnector::send_packet(self, packet)
    }
    fn stream_tag_ids(&self) -> Vec<TagId> {
        OutputConnector::stream_tag_ids(self).unwrap_or_default()
    }
}

/// Assembles outbound packets over a [`PacketOutput`].
pub struct PacketFormatter {
    output: Arc<dyn PacketOutput>,
    packet: Option<PacketBox>,
    group_number: u16,
    segment_number: u16,
    pending_frame_start: bool,
    range_threshold: usize,
    tag_unit_ids: Vec<TagId>,
}

impl PacketFormatter {
    pub fn new(output: Arc<dyn PacketOutput>) -> Self {
        Self {
            output,
            packet: None,
            group_number: 0,
            segment_number: 0,
            pending_frame_start: false,
            range_threshold: MAX_PACKET_ENTRIES,
            tag_unit_ids: Vec::new(),
        }
    }

    /// Force a send whenever the open packet reaches this many ranges.
    pub fn set_range_threshold(&mut self, threshold: usize) {
        self.range_threshold = threshold.clamp(1, MAX_PACKET_ENTRIES);
    }

    /// Cache the downstream tag id set. Called at connection completion
    /// time; querying during streaming would race the data path.
    pub fn complete_connection(&mut self) {
        self.tag_unit_ids = self.output.stream_tag_ids();
    }

    fn send_current(&mut self) -> StreamResult<()> {
        if let Some(packet) = self.packet.take() {
            if let Err(refused) = self.output.send_packet(packet) {
                self.packet = Some(refused.packet);
                return Err(refused.error);
            }
        }
        Ok(())
    }

    /// Ensure an open packet, optionally sending the current one first.
    fn update_packet(&mut self, send: bool) -> StreamResult<()> {
        if send {
            self.send_current()?;
        }
        if self.packet.is_none() {
            let mut packet = match self.output.get_empty_packet() {
                Ok(packet) => packet,
                // An exhausted pool reads as "full" to the producing side.
                Err(StreamError::ObjectEmpty) => return Err(StreamError::ObjectFull),
                Err(err) => return Err(err),
            };
            packet.reset();
            packet.group_number = self.group_number;
            packet.segment_number = self.segment_number;
            self.packet = Some(packet);
        }
        Ok(())
    }

    //
    // Streaming control
    //

    /// Drop the open packet without sending it.
    pub fn flush(&mut self) -> StreamResult<()> {
        if let Some(mut packet) = self.packet.take() {
            packet.release_ranges();
            packet.return_to_origin();
        }
        self.pending_frame_start = false;
        Ok(())
    }

    /// Send the open packet now.
    pub fn commit(&mut self) -> StreamResult<()> {
        self.send_current()
    }

    /// Send the open packet only if it already carries enough to be worth a
    /// downstream wakeup: five or more ranges, a group end, or an end time.
    pub fn low_latency_commit(&mut self) -> StreamResult<()> {
        let worth_sending = match &self.packet {
            Some(packet) => {
                packet.num_ranges() > 4
                    || packet
                        .flags
                        .intersects(PacketFlags::GROUP_END | PacketFlags::END_TIME_VALID)
            }
            None => false,
        };
        if worth_sending {
            self.send_current()?;
        }
        Ok(())
    }

    //
    // Tag list formatting
    //

    pub fn put_tag(&mut self, tag: Tag) -> StreamResult<()> {
        // Drop tags the downstream units do not support.
        if !tag.matches_units(&self.tag_unit_ids) {
            return Ok(());
        }

        // Tags precede ranges; a completed tag set also closes the packet.
        let send = match &self.packet {
            Some(packet) => {
                packet.num_ranges() != 0 || packet.flags.contains(PacketFlags::TAGS_VALID)
            }
            None => false,
        };
        self.update_packet(send)?;

        // The tag list of one packet is capped; a full list closes it.
        let tags_full = matches!(
            &self.packet,
            Some(packet) if packet.num_tags() == MAX_PACKET_ENTRIES - 1
        );
        if tags_full {
            if let Some(packet) = &mut self.packet {
                packet.flags |= PacketFlags::TAGS_VALID;
            }
            self.update_packet(true)?;
        }

        if let Some(packet) = &mut self.packet {
            packet.push_tag(tag)?;
        }
        Ok(())
    }

    /// Mark the collected tag list as complete.
    pub fn complete_tags(&mut self) -> StreamResult<()> {
        self.update_packet(false)?;
        if let Some(packet) = &mut self.packet {
            if packet.num_tags() > 0
                && packet.num_ranges() == 0
                && !packet.flags.contains(PacketFlags::TAGS_VALID)
            {
                packet.flags |= PacketFlags::TAGS_VALID;
            }
        }
        Ok(())
    }

    //
    // Data range formatting
    //

    pub fn put_range(&mut self, range: DataRange) -> StreamResult<()> {
        let send = match &self.packet {
            Some(packet) => {
                packet.num_ranges() + packet.num_tags() == MAX_PACKET_ENTRIES
                    || packet.flags.contains(PacketFlags::END_TIME_VALID)
            }
            None => false,
        };
        self.update_packet(send)?;

        let frame_start = std::mem::take(&mut self.pending_frame_start);
        let mut hit_threshold = false;
        if let Some(packet) = &mut self.packet {
            if frame_start {
                packet.frame_start_flags |= 1 << packet.num_ranges();
            }
            packet.push_range(range)?;
            hit_threshold = packet.num_ranges() >= self.range_threshold;
        }

        if hit_threshold {
            // Hitting the threshold is a hint, not a hard condition.
            match self.update_packet(true) {
                Ok(()) | Err(StreamError::ObjectFull) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// The next range put begins a frame.
    pub fn put_frame_start(&mut self) -> StreamResult<()> {
        self.pending_frame_start = true;
        Ok(())
    }

    //
    // Range information formatting
    //

    pub fn put_data_discontinuity(&mut self) -> StreamResult<()> {
        self.update_packet(false)?;
        if let Some(packet) = &mut self.packet {
            packet.flags |= PacketFlags::DATA_DISCONTINUITY;
        }
        Ok(())
    }

    /// A time discontinuity is always flushed out immediately; there may be
    /// no new data for a while after it.
    pub fn put_time_discontinuity(&mut self) -> StreamResult<()> {
        self.update_packet(false)?;
        if let Some(packet) = &mut self.packet {
            packet.flags |= PacketFlags::TIME_DISCONTINUITY;
        }
        self.send_current()
    }

    pub fn begin_group(
        &mut self,
        group_number: u16,
        notification: bool,
        single_unit: bool,
    ) -> StreamResult<()> {
        let send = match &self.packet {
            Some(packet) => packet.flags.contains(PacketFlags::GROUP_END),
            None => false,
        };
        self.update_packet(send)?;
        self.group_number = group_number;
        if let Some(packet) = &mut self.packet {
            packet.flags |= PacketFlags::GROUP_START;
            if notification {
                packet.flags |= PacketFlags::GROUP_START_NOTIFICATION;
            }
            if single_unit {
                packet.flags |= PacketFlags::SINGLE_UNIT_GROUP;
            }
            packet.group_number = group_number;
        }
        Ok(())
    }

    pub fn complete_group(&mut self, notification: bool) -> StreamResult<()> {
        self.update_packet(false)?;
        if let Some(packet) = &mut self.packet {
            packet.flags |= PacketFlags::GROUP_END;
            if notification {
                packet.flags |= PacketFlags::GROUP_END_NOTIFICATION;
            }
        }
        self.group_number = 0;
        Ok(())
    }

    pub fn begin_segment(&mut self, segment_number: u16, notification: bool) -> StreamResult<()> {
        let send = match &self.packet {
            Some(packet) => packet.flags.contains(PacketFlags::SEGMENT_END),
            None => false,
        };
        self.update_packet(send)?;
        self.segment_number = segment_number;
        if let Some(packet) = &mut self.packet {
            packet.flags |= PacketFlags::SEGMENT_START;
            if notification {
                packet.flags |= PacketFlags::SEGMENT_START_NOTIFICATION;
            }
            packet.segment_number = segment_number;
        }
        Ok(())
    }

    /// A segment end always closes and sends the packet.
    pub fn complete_segment(&mut self, notification: bool) -> StreamResult<()> {
        self.update_packet(false)?;
        if let Some(packet) = &mut self.packet {
            packet.flags |= PacketFlags::SEGMENT_END;
            if notification {
                packet.flags |= PacketFlags::SEGMENT_END_NOTIFICATION;
            }
        }
        self.send_current()
    }

    //
    // Time information
    //

    pub fn put_start_time(&mut self, time: StreamTime) -> StreamResult<()> {
        let send = match &self.packet {
            Some(packet) => packet.num_ranges() > 0,
            None => false,
        };
        self.update_packet(send)?;
        if let Some(packet) = &mut self.packet {
            packet.flags |= PacketFlags::START_TIME_VALID;
            packet.start_time = time;
        }
        Ok(())
    }

    pub fn put_end_time(&mut self, time: StreamTime) -> StreamResult<()> {
        self.update_packet(false)?;
        if let Some(packet) = &mut self.packet {
            packet.flags |= PacketFlags::END_TIME_VALID;
            packet.end_time = time;
        }
        Ok(())
    }

    pub fn put_cut_duration(&mut self, duration: TickDuration) -> StreamResult<()> {
        self.update_packet(false)?;
        if let Some(packet) = &mut self.packet {
            packet.flags |= PacketFlags::CUT_AFTER;
            packet.cut_duration = duration;
        }
        Ok(())
    }

    pub fn put_skip_duration(&mut self, duration: TickDuration) -> StreamResult<()> {
        self.update_packet(false)?;
        if let Some(packet) = &mut self.packet {
            packet.flags |= PacketFlags::SKIP_UNTIL;
            packet.skip_duration = duration;
        }
        Ok(())
    }
}
