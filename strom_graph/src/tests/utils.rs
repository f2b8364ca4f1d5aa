//! Shared fixtures for the graph tests: a byte-counting frame mixer, a
//! feedback-echoing renderer, and an echo sink for fanout chains.

use crate::mixer::{FrameMixer, InputFeedback, MixerInputType, MixerStartupRequest};
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use strom_core::parser::ParseEvents;
use strom_core::support::RangeQueue;
use strom_core::timer::system_time_now;
use strom_core::{
    CommandKind, ConnectorHandle, ConnectorId, DataRange, FlushMode, HeapPool, Ingress,
    InputConnector, MemoryPool, PacketBox, PacketFlags, PacketProcessor, PacketResult, Speed,
    StreamCommand, StreamError, StreamPacket, StreamResult, StreamTime, StreamUnit, Tag, TagId,
    TickDuration, UnitBase, UpstreamMessage,
};

//
// Frame mixer fixture
//

struct TestInputState {
    queue: RangeQueue,
    stream_time: StreamTime,
    time_valid: bool,
    started: bool,
    was_starved: bool,
    start_possible_sent: bool,
    start_required_sent: bool,
}

impl TestInputState {
    fn new() -> Self {
        Self {
            queue: RangeQueue::new(64),
            stream_time: StreamTime::ZERO,
            time_valid: false,
            started: false,
            was_starved: false,
            start_possible_sent: false,
            start_required_sent: false,
        }
    }
}

/// A frame mixer that consumes a fixed number of bytes per input per frame
/// and emits timing-only frames. Startup readiness is one frame of data;
/// eight frames mean the queues are considered full.
pub(crate) struct TestFrameMixer {
    frame: TickDuration,
    frame_bytes: usize,
    inputs: Vec<TestInputState>,
}

impl TestFrameMixer {
    pub fn new(frame: TickDuration, frame_bytes: usize) -> Self {
        Self {
            frame,
            frame_bytes,
            inputs: Vec::new(),
        }
    }
}

impl FrameMixer for TestFrameMixer {
    fn register_input(
        &mut self,
        input: usize,
        _input_type: MixerInputType,
        _free_parameter: u32,
    ) -> StreamResult<()> {
        while self.inputs.len() <= input {
            self.inputs.push(TestInputState::new());
        }
        Ok(())
    }

    fn frame_duration(&self) -> TickDuration {
        self.frame
    }

    fn receive_input_packet(
        &mut self,
        input: usize,
        packet: &StreamPacket,
    ) -> StreamResult<MixerStartupRequest> {
        let frame_bytes = self.frame_bytes;
        let state = self.inputs.get_mut(input).ok_or(StreamError::RangeViolation)?;
        for range in packet.ranges() {
            state.queue.append_range(range.clone())?;
        }
        if packet.flags.contains(PacketFlags::START_TIME_VALID) && !state.time_valid {
            state.stream_time = packet.start_time;
            state.time_valid = true;
        }

        if !state.started {
            if state.queue.size() >= 8 * frame_bytes && !state.start_required_sent {
                state.start_required_sent = true;
                return Ok(MixerStartupRequest::StartRequired);
            }
            if state.queue.size() >= frame_bytes && !state.start_possible_sent {
                state.start_possible_sent = true;
                return Ok(MixerStartupRequest::StartPossible);
            }
        }
        Ok(MixerStartupRequest::None)
    }

    fn mix_frame(
        &mut self,
        packets: &mut [Option<PacketBox>],
        feedback: &mut [InputFeedback],
    ) -> StreamResult<()> {
        let mut frame_time = None;
        for (i, state) in self.inputs.iter_mut().enumerate() {
            if !state.started {
                continue;
            }
            if state.queue.size() >= self.frame_bytes {
                state.queue.drop_bytes(self.frame_bytes);
                frame_time.get_or_insert(state.stream_time);
                state.stream_time += self.frame;
                state.was_starved = false;
                if state.queue.size() < 2 * self.frame_bytes {
                    if let Some(fb) = feedback.get_mut(i) {
                        fb.packet_request = true;
                    }
                }
            } else if !state.was_starved {
                // Report the transition into starvation only once.
                state.was_starved = true;
                if let Some(fb) = feedback.get_mut(i) {
                    fb.starvation = true;
                    fb.packet_request = true;
                }
            }
        }

        for packet in packets.iter_mut().flatten() {
            if let Some(time) = frame_time {
                packet.flags |= PacketFlags::START_TIME_VALID | PacketFlags::END_TIME_VALID;
                packet.start_time = time;
                packet.end_time = time + self.frame;
            }
        }
        Ok(())
    }

    fn receive_allocator(
        &mut self,
        _output: usize,
        _pool: Arc<dyn MemoryPool>,
    ) -> StreamResult<()> {
        Ok(())
    }

    fn prepare_stream(&mut self, input: usize) -> StreamResult<()> {
        if let Some(state) = self.inputs.get_mut(input) {
            state.start_possible_sent = false;
            state.start_required_sent = false;
            state.was_starved = false;
        }
        Ok(())
    }

    fn start_stream(
        &mut self,
        input: usize,
        _frame_number: u32,
        _speed: Speed,
        start_time: StreamTime,
    ) -> StreamResult<()> {
        let state = self.inputs.get_mut(input).ok_or(StreamError::RangeViolation)?;
        state.started = true;
        state.stream_time = start_time;
        state.time_valid = true;
        Ok(())
    }

    fn stop_stream(&mut self, input: usize) -> StreamResult<()> {
        if let Some(state) = self.inputs.get_mut(input) {
            state.started = false;
        }
        Ok(())
    }

    fn step_stream(&mut self, input: usize, num_frames: u32) -> StreamResult<()> {
        let state = self.inputs.get_mut(input).ok_or(StreamError::RangeViolation)?;
        state.stream_time += self.frame * num_frames;
        Ok(())
    }

    fn flush_stream(&mut self, input: usize, _mode: FlushMode) -> StreamResult<()> {
        let state = self.inputs.get_mut(input).ok_or(StreamError::RangeViolation)?;
        state.queue.flush_ranges();
        state.time_valid = false;
        state.started = false;
        Ok(())
    }

    fn stream_tag_ids(&self, _input: usize) -> Vec<TagId> {
        Vec::new()
    }

    fn configure_stream_tags(&mut self, _input: usize, _tags: &[Tag]) -> StreamResult<()> {
        Ok(())
    }

    fn update_stream_tags(&mut self, _input: usize) -> StreamResult<()> {
        Ok(())
    }

    fn set_renderer_information(
        &mut self,
        _render_time: StreamTime,
        _render_frame: u32,
    ) -> StreamResult<()> {
        Ok(())
    }

    fn current_input_stream_time(&self, input: usize) -> StreamTime {
        self.inputs
            .get(input)
            .map(|s| s.stream_time)
            .unwrap_or(StreamTime::ZERO)
    }

    fn begin_output(&mut self, _output: usize) -> StreamResult<()> {
        Ok(())
    }

    fn flush_output(&mut self, _output: usize) -> StreamResult<()> {
        Ok(())
    }
}

//
// Renderer fixture
//

/// Sink of a rendering chain: consumes frames, echoes the boundary
/// feedback a hardware renderer would produce, and owns the chain's
/// memory pool.
pub(crate) struct TestRenderer {
    base: UnitBase,
    input: Arc<InputConnector>,
    pool: Arc<HeapPool>,
    frame: TickDuration,
    /// Wall-clock time one frame blocks the caller, like a hardware write.
    pace: Duration,
    timed_frames: Mutex<Vec<StreamTime>>,
    pub frame_count: AtomicU32,
}

impl TestRenderer {
    pub fn new(name: &str, frame: TickDuration, pace: Duration, pool: Arc<HeapPool>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let input = InputConnector::unqueued(0, weak.clone() as Weak<dyn StreamUnit>);
            let base = UnitBase::new(name);
            base.add_connector(ConnectorHandle::Input(input.clone()));
            Self {
                base,
                input,
                pool,
                frame,
                pace,
                timed_frames: Mutex::new(Vec::new()),
                frame_count: AtomicU32::new(0),
            }
        })
    }

    pub fn start_times(&self) -> Vec<StreamTime> {
        self.timed_frames.lock().clone()
    }
}

impl StreamUnit for TestRenderer {
    fn base(&self) -> &UnitBase {
        &self.base
    }

    fn begin_command(&self, command: &StreamCommand) -> StreamResult<()> {
        self.base
            .signal_command_completion(command.kind(), Ok(()))
    }

    fn receive_packet(&self, _connector: ConnectorId, packet: PacketBox) -> PacketResult {
        if !self.pace.is_zero() {
            std::thread::sleep(self.pace);
        }
        let flags = packet.flags;
        if flags.contains(PacketFlags::START_TIME_VALID) {
            self.timed_frames.lock().push(packet.start_time);
        }
        self.frame_count.fetch_add(1, Ordering::SeqCst);

        if flags.notifies(PacketFlags::SEGMENT_START, PacketFlags::SEGMENT_START_NOTIFICATION) {
            let _ = self.input.send_upstream(UpstreamMessage::SegmentStart {
                segment: packet.segment_number,
            });
            let _ = self.input.send_upstream(UpstreamMessage::SegmentStartTime {
                time: system_time_now(),
            });
        }
        if flags.notifies(PacketFlags::GROUP_END, PacketFlags::GROUP_END_NOTIFICATION) {
            let _ = self.input.send_upstream(UpstreamMessage::GroupEnd {
                group: packet.group_number,
                delta: self.frame,
            });
        }

        let mut packet = packet;
        packet.release_ranges();
        packet.return_to_origin();
        Ok(())
    }

    fn complete_connection(&self) -> StreamResult<()> {
        match self
            .input
            .provide_allocator(self.pool.clone() as Arc<dyn MemoryPool>)
        {
            Ok(()) | Err(StreamError::NotConnected) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

//
// Echo sink fixture
//

/// A parse-and-discard sink that echoes every requested boundary
/// notification upstream, like a rendering chain with instant timing.
pub(crate) struct EchoSink {
    base: UnitBase,
    ingress: Ingress,
    input: Arc<InputConnector>,
    pub packets: AtomicUsize,
}

impl EchoSink {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let input = InputConnector::unqueued(0, weak.clone() as Weak<dyn StreamUnit>);
            let base = UnitBase::new(name);
            base.add_connector(ConnectorHandle::Input(input.clone()));
            Self {
                base,
                ingress: Ingress::new(),
                input,
                packets: AtomicUsize::new(0),
            }
        })
    }
}

impl PacketProcessor for EchoSink {
    fn ingress(&self) -> &Ingress {
        &self.ingress
    }
    fn ingress_input(&self) -> &InputConnector {
        &self.input
    }
    fn unit_base(&self) -> &UnitBase {
        &self.base
    }
    fn as_parse_events(&self) -> &dyn ParseEvents {
        self
    }
    fn process_packet(&self, packet: &StreamPacket) -> StreamResult<()> {
        self.packets.fetch_add(1, Ordering::SeqCst);
        self.ingress.parser().lock().parse(packet, self)
    }
}

impl StreamUnit for EchoSink {
    fn base(&self) -> &UnitBase {
        &self.base
    }

    fn begin_command(&self, command: &StreamCommand) -> StreamResult<()> {
        if let StreamCommand::Begin { .. } = command {
            self.input.send_upstream(UpstreamMessage::StartPossible)?;
        }
        self.ingress.standard_begin_command(self, command)
    }

    fn complete_command(&self, _command: CommandKind, target: crate::StreamState) -> StreamResult<()> {
        self.ingress.standard_complete_command(self, target)
    }

    fn receive_packet(&self, _connector: ConnectorId, packet: PacketBox) -> PacketResult {
        self.ingress.receive_packet(self, packet)
    }

    fn upstream_notification(
        &self,
        _connector: ConnectorId,
        message: UpstreamMessage,
    ) -> StreamResult<()> {
        self.ingress.standard_upstream(self, message)
    }
}

impl ParseEvents for EchoSink {
    fn parse_flush(&self) -> StreamResult<()> {
        Ok(())
    }
    fn parse_commit(&self) -> StreamResult<()> {
        Ok(())
    }
    fn parse_interrupted(&self) -> StreamResult<()> {
        Ok(())
    }
    fn parse_begin_configure(&self) -> StreamResult<()> {
        Ok(())
    }
    fn parse_configure(&self, _tags: &[Tag]) -> StreamResult<()> {
        Ok(())
    }
    fn parse_complete_configure(&self) -> StreamResult<()> {
        Ok(())
    }
    fn parse_data_discontinuity(&self) -> StreamResult<()> {
        Ok(())
    }
    fn parse_time_discontinuity(&self) -> StreamResult<()> {
        Ok(())
    }
    fn parse_begin_segment(&self, segment: u16, notification: bool) -> StreamResult<()> {
        if notification {
            self.input
                .send_upstream(UpstreamMessage::SegmentStart { segment })?;
            self.input
                .send_upstream(UpstreamMessage::SegmentStartTime {
                    time: system_time_now(),
                })?;
        }
        Ok(())
    }
    fn parse_end_segment(&self, segment: u16, notification: bool) -> StreamResult<()> {
        if notification {
            self.input
                .send_upstream(UpstreamMessage::SegmentEnd { segment })?;
        }
        Ok(())
    }
    fn parse_begin_group(
        &self,
        group: u16,
        notification: bool,
        _single_unit: bool,
    ) -> StreamResult<()> {
        if notification {
            self.input.send_upstream(UpstreamMessage::GroupStart {
                group,
                delta: TickDuration::ZERO,
            })?;
        }
        Ok(())
    }
    fn parse_end_group(&self, group: u16, notification: bool) -> StreamResult<()> {
        if notification {
            self.input.send_upstream(UpstreamMessage::GroupEnd {
                group,
                delta: TickDuration::ZERO,
            })?;
        }
        Ok(())
    }
    fn parse_start_time(&self, _time: StreamTime) -> StreamResult<()> {
        Ok(())
    }
    fn parse_end_time(&self, _time: StreamTime) -> StreamResult<()> {
        Ok(())
    }
    fn parse_cut_duration(&self, _duration: TickDuration) -> StreamResult<()> {
        Ok(())
    }
    fn parse_skip_duration(&self, _duration: TickDuration) -> StreamResult<()> {
        Ok(())
    }
}

//
// Helpers
//

/// Wait for an event satisfying `pred`, discarding everything before it.
pub(crate) fn wait_for(
    events: &Receiver<UpstreamMessage>,
    timeout: Duration,
    pred: impl Fn(&UpstreamMessage) -> bool,
) -> Option<UpstreamMessage> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.checked_duration_since(Instant::now())?;
        match events.recv_timeout(remaining) {
            Ok(message) if pred(&message) => return Some(message),
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}

/// Wait for the completion event of one command.
pub(crate) fn wait_for_completion(
    events: &Receiver<UpstreamMessage>,
    kind: CommandKind,
    timeout: Duration,
) -> Option<Result<(), StreamError>> {
    wait_for(events, timeout, |message| {
        matches!(message, UpstreamMessage::CommandCompleted { command, .. } if *command == kind)
    })
    .and_then(|message| match message {
        UpstreamMessage::CommandCompleted { result, .. } => Some(result),
        _ => None,
    })
}

/// Collect every already queued event matching `pred` within `window`.
pub(crate) fn drain_matching(
    events: &Receiver<UpstreamMessage>,
    window: Duration,
    pred: impl Fn(&UpstreamMessage) -> bool,
) -> Vec<UpstreamMessage> {
    let deadline = Instant::now() + window;
    let mut matched = Vec::new();
    while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        match events.recv_timeout(remaining) {
            Ok(message) => {
                if pred(&message) {
                    matched.push(message);
                }
            }
            Err(_) => break,
        }
    }
    matched
}

/// One application packet carrying `size` fresh payload bytes.
pub(crate) fn data_packet(pool: &Arc<HeapPool>, size: usize) -> StreamResult<StreamPacket> {
    let mut blocks = Vec::new();
    pool.get_memory_blocks(&mut blocks, 1, "test-source")?;
    let block = Arc::new(blocks.remove(0));
    let mut packet = StreamPacket::new();
    packet.push_range(DataRange::new(block.clone(), 0, size.min(block.len())))?;
    Ok(packet)
}
