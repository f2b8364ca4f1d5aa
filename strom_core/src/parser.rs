//! The streaming packet parser.
//!
//! Parsing of one packet is a linear state machine visiting the packet's
//! content in stream order. Each step is elided when its flag or field is
//! absent. When the host returns `ObjectFull` at any step the state is
//! preserved and parsing resumes from the same step on the next invocation
//! with the same packet.

use crate::{DataRange, StreamError, StreamPacket, StreamResult, Tag};
use strom_primitives::{PacketFlags, StreamTime, TickDuration};

/// Host callbacks of the packet parser, invoked in stream order.
///
/// Units implement this with interior mutability; the parser only requires
/// shared references so that callbacks can travel across connector plugs.
pub trait ParseEvents {
    //
    // Streaming control
    //
    fn parse_flush(&self) -> StreamResult<()>;
    fn parse_commit(&self) -> StreamResult<()>;
    fn parse_interrupted(&self) -> StreamResult<()>;

    //
    // Tag list parsing
    //
    /// May return [`StreamError::DeferConfigure`] to have the tags queued
    /// and applied later through [`PacketParser::parse_deferred_configure`].
    fn parse_begin_configure(&self) -> StreamResult<()>;
    fn parse_configure(&self, tags: &[Tag]) -> StreamResult<()>;
    fn parse_complete_configure(&self) -> StreamResult<()>;

    //
    // Data range parsing
    //
    fn parse_ranges(
        &self,
        ranges: &[DataRange],
        num: usize,
        range: &mut usize,
        offset: &mut usize,
    ) -> StreamResult<()> {
        while *range < num {
            self.parse_range(&ranges[*range], offset)?;
            *range += 1;
            *offset = 0;
        }
        Ok(())
    }
    fn parse_range(&self, _range: &DataRange, _offset: &mut usize) -> StreamResult<()> {
        Ok(())
    }

    //
    // Range information parsing
    //
    fn parse_frame_start(&self) -> StreamResult<()> {
        Ok(())
    }
    fn parse_data_discontinuity(&self) -> StreamResult<()>;
    fn parse_time_discontinuity(&self) -> StreamResult<()>;
    fn parse_begin_segment(&self, segment: u16, notification: bool) -> StreamResult<()>;
    fn parse_end_segment(&self, segment: u16, notification: bool) -> StreamResult<()>;
    fn parse_begin_group(&self, group: u16, notification: bool, single_unit: bool)
    -> StreamResult<()>;
    fn parse_end_group(&self, group: u16, notification: bool) -> StreamResult<()>;

    //
    // Time information
    //
    fn parse_start_time(&self, time: StreamTime) -> StreamResult<()>;
    fn parse_end_time(&self, time: StreamTime) -> StreamResult<()>;
    fn parse_cut_duration(&self, duration: TickDuration) -> StreamResult<()>;
    fn parse_skip_duration(&self, duration: TickDuration) -> StreamResult<()>;
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
enum ParseState {
    #[default]
    Idle,
    DataDiscontinuity,
    BeginSegment,
    BeginConfigure,
    Configure,
    EndConfigure,
    BeginGroup,
    StartTime,
    SkipUntil,
    CutAfter,
    DataRange,
    EndTime,
    EndGroup,
    TimeDiscontinuity,
    EndSegment,
    DeferredBeginConfigure,
    DeferredConfigure,
    DeferredEndConfigure,
}

impl ParseState {
    /// Deferred tags may only be applied outside of a running tag
    /// configuration, i.e. before the configure steps of a packet or after
    /// they have passed.
    fn allows_deferred(self) -> bool {
        !matches!(
            self,
            ParseState::BeginConfigure
                | ParseState::Configure
                | ParseState::EndConfigure
                | ParseState::DeferredBeginConfigure
                | ParseState::DeferredConfigure
                | ParseState::DeferredEndConfigure
        )
    }
}

/// Resumable parser over one packet at a time.
#[derive(Default)]
pub struct PacketParser {
    state: ParseState,
    pushed_state: ParseState,
    serial: Option<u64>,
    range: usize,
    offset: usize,
    in_configure: bool,
    tags_pending: bool,
    deferred: Vec<Tag>,
    deferred_active: Vec<Tag>,
}

impl PacketParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset all parse state and notify the host.
    pub fn flush(&mut self, events: &dyn ParseEvents) -> StreamResult<()> {
        self.serial = None;
        self.state = ParseState::Idle;
        self.in_configure = false;
        self.tags_pending = false;
        self.range = 0;
        self.offset = 0;
        self.deferred.clear();
        self.deferred_active.clear();
        events.parse_flush()
    }

    pub fn commit(&mut self, events: &dyn ParseEvents) -> StreamResult<()> {
        events.parse_commit()
    }

    fn enqueue_deferred(&mut self, tags: &[Tag]) {
        self.deferred.extend_from_slice(tags);
    }

    /// Apply tags that a previous `parse_begin_configure` deferred. Must be
    /// called at a step where no configuration is in flight.
    pub fn parse_deferred_configure(&mut self, events: &dyn ParseEvents) -> StreamResult<()> {
        if !self.state.allows_deferred() {
            return Err(StreamError::InvalidConfiguration);
        }
        if !self.deferred.is_empty() {
            self.pushed_state = self.state;
            self.state = ParseState::DeferredBeginConfigure;
            self.deferred_active = std::mem::take(&mut self.deferred);
        }
        loop {
            match self.state {
                ParseState::DeferredBeginConfigure => {
                    events.parse_begin_configure()?;
                    self.state = ParseState::DeferredConfigure;
                }
                ParseState::DeferredConfigure => {
                    events.parse_configure(&self.deferred_active)?;
                    self.deferred_active.clear();
                    self.state = ParseState::DeferredEndConfigure;
                }
                ParseState::DeferredEndConfigure => {
                    events.parse_complete_configure()?;
                    self.state = self.pushed_state;
                }
                _ => return Ok(()),
            }
        }
    }

    /// Parse one packet, resuming where a previous attempt bailed with
    /// `ObjectFull`. Completion means the whole packet was consumed.
    pub fn parse(&mut self, packet: &StreamPacket, events: &dyn ParseEvents) -> StreamResult<()> {
        if let Some(serial) = self.serial {
            if serial != packet.serial() {
                // A different packet arrived while one was mid-parse.
                self.state = ParseState::Idle;
                self.in_configure = false;
                events.parse_interrupted()?;
            }
        }
        self.serial = Some(packet.serial());

        let flags = packet.flags;
        loop {
            match self.state {
                ParseState::Idle => {
                    // Shortcut for pure data packets
                    if flags.is_empty() && !self.in_configure {
                        self.range = 0;
                        self.offset = 0;
                        self.state = ParseState::DataRange;
                        continue;
                    }
                    self.state = ParseState::DataDiscontinuity;
                }
                ParseState::DataDiscontinuity => {
                    if flags.contains(PacketFlags::DATA_DISCONTINUITY) {
                        events.parse_data_discontinuity()?;
                    }
                    self.state = ParseState::BeginSegment;
                }
                ParseState::BeginSegment => {
                    if flags.contains(PacketFlags::SEGMENT_START) {
                        events.parse_begin_segment(
                            packet.segment_number,
                            flags.contains(PacketFlags::SEGMENT_START_NOTIFICATION),
                        )?;
                    }
                    self.state = ParseState::BeginConfigure;
                }
                ParseState::BeginConfigure => {
                    self.tags_pending = false;
                    if flags.contains(PacketFlags::TAGS_VALID) {
                        if !self.deferred.is_empty() {
                            // A deferral is already open; keep collecting.
                            self.enqueue_deferred(packet.tags());
                            self.state = ParseState::BeginGroup;
                            continue;
                        }
                        if !self.in_configure {
                            match events.parse_begin_configure() {
                                Ok(()) => self.in_configure = true,
                                Err(StreamError::DeferConfigure) => {
                                    self.enqueue_deferred(packet.tags());
                                    self.state = ParseState::BeginGroup;
                                    continue;
                                }
                                Err(err) => return Err(err),
                            }
                        }
                        self.tags_pending = true;
                    }
                    self.state = ParseState::Configure;
                }
                ParseState::Configure => {
                    if self.tags_pending {
                        events.parse_configure(packet.tags())?;
                        self.tags_pending = false;
                    }
                    self.state = ParseState::EndConfigure;
                }
                ParseState::EndConfigure => {
                    if self.in_configure {
                        let concluded = !flags.contains(PacketFlags::TAGS_VALID)
                            || packet.num_ranges() > 0
                            || flags.contains(PacketFlags::GROUP_START);
                        if concluded {
                            events.parse_complete_configure()?;
                            self.in_configure = false;
                        }
                    }
                    self.state = ParseState::BeginGroup;
                }
                ParseState::BeginGroup => {
                    if flags.contains(PacketFlags::GROUP_START) {
                        events.parse_begin_group(
                            packet.group_number,
                            flags.contains(PacketFlags::GROUP_START_NOTIFICATION),
                            flags.contains(PacketFlags::SINGLE_UNIT_GROUP),
                        )?;
                    }
                    self.state = ParseState::StartTime;
                }
                ParseState::StartTime => {
                    if flags.contains(PacketFlags::START_TIME_VALID) {
                        events.parse_start_time(packet.start_time)?;
                    }
                    self.state = ParseState::SkipUntil;
                }
                ParseState::SkipUntil => {
                    if flags.contains(PacketFlags::SKIP_UNTIL) {
                        events.parse_skip_duration(packet.skip_duration)?;
                    }
                    self.state = ParseState::CutAfter;
                }
                ParseState::CutAfter => {
                    if flags.contains(PacketFlags::CUT_AFTER) {
                        events.parse_cut_duration(packet.cut_duration)?;
                    }
                    self.range = 0;
                    self.offset = 0;
                    self.state = ParseState::DataRange;
                }
                ParseState::DataRange => {
                    let num = packet.num_ranges();
                    if self.range < num {
                        let ranges = packet.ranges();
                        if packet.frame_start_flags != 0 {
                            // Visit the ranges in frame bounded sub groups
                            // so the host sees every frame start.
                            while self.range < num {
                                if self.offset == 0
                                    && (packet.frame_start_flags >> self.range) & 1 != 0
                                {
                                    events.parse_frame_start()?;
                                }
                                let mut bound = self.range + 1;
                                while bound < num && (packet.frame_start_flags >> bound) & 1 == 0 {
                                    bound += 1;
                                }
                                events.parse_ranges(
                                    ranges,
                                    bound,
                                    &mut self.range,
                                    &mut self.offset,
                                )?;
                            }
                        } else {
                            events.parse_ranges(ranges, num, &mut self.range, &mut self.offset)?;
                        }
                    }

                    // Shortcut for pure data packets
                    if flags.is_empty() {
                        self.serial = None;
                        self.state = ParseState::Idle;
                        return Ok(());
                    }
                    self.state = ParseState::EndTime;
                }
                ParseState::EndTime => {
                    if flags.contains(PacketFlags::END_TIME_VALID) {
                        events.parse_end_time(packet.end_time)?;
                    }
                    self.state = ParseState::EndGroup;
                }
                ParseState::EndGroup => {
                    if flags.contains(PacketFlags::GROUP_END) {
                        events.parse_end_group(
                            packet.group_number,
                            flags.contains(PacketFlags::GROUP_END_NOTIFICATION),
                        )?;
                    }
                    self.state = ParseState::TimeDiscontinuity;
                }
                ParseState::TimeDiscontinuity => {
                    if flags.contains(PacketFlags::TIME_DISCONTINUITY) {
                        events.parse_time_discontinuity()?;
                    }
                    self.state = ParseState::EndSegment;
                }
                ParseState::EndSegment => {
                    if flags.contains(PacketFlags::SEGMENT_END) {
                        events.parse_end_segment(
                            packet.segment_number,
                            flags.contains(PacketFlags::SEGMENT_END_NOTIFICATION),
                        )?;
                    }
                    self.serial = None;
                    self.state = ParseState::Idle;
                    return Ok(());
                }
                ParseState::DeferredBeginConfigure => {
                    events.parse_begin_configure()?;
                    self.state = ParseState::DeferredConfigure;
                }
                ParseState::DeferredConfigure => {
                    events.parse_configure(&self.deferred_active)?;
                    self.deferred_active.clear();
                    self.state = ParseState::DeferredEndConfigure;
                }
                ParseState::DeferredEndConfigure => {
                    events.parse_complete_configure()?;
                    self.state = self.pushed_state;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{PacketParser, ParseEvents};
    use crate::{StreamError, StreamPacket, StreamResult, Tag, TagId};
    use parking_lot::Mutex;
    use strom_primitives::{PacketFlags, StreamTime, TickDuration};

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
        fail_on_end_group: Mutex<bool>,
        defer_configure: bool,
    }
    impl Recorder {
        fn push(&self, s: impl Into<String>) {
            self.events.lock().push(s.into());
        }
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut self.events.lock())
        }
    }
    impl ParseEvents for Recorder {
        fn parse_flush(&self) -> StreamResult<()> {
            self.push("flush");
            Ok(())
        }
        fn parse_commit(&self) -> StreamResult<()> {
            Ok(())
        }
        fn parse_interrupted(&self) -> StreamResult<()> {
            self.push("interrupted");
            Ok(())
        }
        fn parse_begin_configure(&self) -> StreamResult<()> {
            if self.defer_configure {
                return Err(StreamError::DeferConfigure);
            }
            self.push("begin_configure");
            Ok(())
        }
        fn parse_configure(&self, tags: &[Tag]) -> StreamResult<()> {
            self.push(format!("configure:{}", tags.len()));
            Ok(())
        }
        fn parse_complete_configure(&self) -> StreamResult<()> {
            self.push("complete_configure");
            Ok(())
        }
        fn parse_range(&self, range: &crate::DataRange, _offset: &mut usize) -> StreamResult<()> {
            self.push(format!("range:{}", range.len()));
            Ok(())
        }
        fn parse_frame_start(&self) -> StreamResult<()> {
            self.push("frame_start");
            Ok(())
        }
        fn parse_data_discontinuity(&self) -> StreamResult<()> {
            self.push("data_discontinuity");
            Ok(())
        }
        fn parse_time_discontinuity(&self) -> StreamResult<()> {
            self.push("time_discontinuity");
            Ok(())
        }
        fn parse_begin_segment(&self, segment: u16, _n: bool) -> StreamResult<()> {
            self.push(format!("begin_segment:{segment}"));
            Ok(())
        }
        fn parse_end_segment(&self, segment: u16, _n: bool) -> StreamResult<()> {
            self.push(format!("end_segment:{segment}"));
            Ok(())
        }
        fn parse_begin_group(&self, group: u16, _n: bool, _s: bool) -> StreamResult<()> {
            self.push(format!("begin_group:{group}"));
            Ok(())
        }
        fn parse_end_group(&self, group: u16, _n: bool) -> StreamResult<()> {
            if *self.fail_on_end_group.lock() {
                return Err(StreamError::ObjectFull);
            }
            self.push(format!("end_group:{group}"));
            Ok(())
        }
        fn parse_start_time(&self, time: StreamTime) -> StreamResult<()> {
            self.push(format!("start_time:{}", time.as_millis()));
            Ok(())
        }
        fn parse_end_time(&self, time: StreamTime) -> StreamResult<()> {
            self.push(format!("end_time:{}", time.as_millis()));
            Ok(())
        }
        fn parse_cut_duration(&self, _d: TickDuration) -> StreamResult<()> {
            self.push("cut");
            Ok(())
        }
        fn parse_skip_duration(&self, _d: TickDuration) -> StreamResult<()> {
            self.push("skip");
            Ok(())
        }
    }

    fn boundary_packet() -> StreamPacket {
        let mut packet = StreamPacket::new();
        packet.flags = PacketFlags::SEGMENT_START
            | PacketFlags::GROUP_START
            | PacketFlags::GROUP_END
            | PacketFlags::SEGMENT_END
            | PacketFlags::START_TIME_VALID;
        packet.segment_number = 3;
        packet.group_number = 9;
        packet.start_time = StreamTime::from_millis(500);
        packet
    }

    #[test]
    fn boundary_steps_fire_in_stream_order() {
        let recorder = Recorder::default();
        let mut parser = PacketParser::new();
        parser
            .parse(&boundary_packet(), &recorder)
            .expect("clean parse");
        assert_eq!(
            recorder.take(),
            vec![
                "begin_segment:3",
                "begin_group:9",
                "start_time:500",
                "end_group:9",
                "end_segment:3",
            ]
        );
    }

    #[test]
    fn object_full_resumes_at_the_failing_step() {
        let recorder = Recorder::default();
        *recorder.fail_on_end_group.lock() = true;
        let mut parser = PacketParser::new();
        let packet = boundary_packet();
        assert_eq!(
            parser.parse(&packet, &recorder),
            Err(StreamError::ObjectFull)
        );
        recorder.take();

        *recorder.fail_on_end_group.lock() = false;
        parser.parse(&packet, &recorder).expect("resumed parse");
        // Everything before end_group already happened in the first pass.
        assert_eq!(recorder.take(), vec!["end_group:9", "end_segment:3"]);
    }

    #[test]
    fn deferred_tags_apply_later() {
        let recorder = Recorder {
            defer_configure: true,
            ..Default::default()
        };
        let mut parser = PacketParser::new();
        let mut packet = StreamPacket::new();
        packet.flags = PacketFlags::TAGS_VALID;
        packet.push_tag(Tag::new(TagId(0x100), crate::TagValue::Int(1))).ok();
        packet.push_tag(Tag::new(TagId(0x200), crate::TagValue::Int(2))).ok();
        parser.parse(&packet, &recorder).expect("deferred parse");
        assert_eq!(recorder.take(), Vec::<String>::new());

        let recorder = Recorder::default();
        parser
            .parse_deferred_configure(&recorder)
            .expect("deferred apply");
        assert_eq!(
            recorder.take(),
            vec!["begin_configure", "configure:2", "complete_configure"]
        );
    }
}
