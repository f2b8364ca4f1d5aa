//! The stream replicator: one input stream duplicated onto any number of
//! output streams, with upstream notifications combined so the source sees
//! each boundary exactly once.

use parking_lot::Mutex;
use std::sync::{
    Arc, Weak,
    atomic::{AtomicI32, Ordering},
};
use strom_core::parser::ParseEvents;
use strom_core::{
    CommandKind, ConnectorHandle, ConnectorId, Ingress, InputConnector, OutputConnector, PacketBox,
    PacketProcessor, PacketResult, StreamCommand, StreamError, StreamPacket, StreamResult,
    StreamState, StreamTime, StreamUnit, Tag, TagId, TickDuration, UnitBase, UpstreamMessage,
};

/// How upstream notifications from the outputs are combined.
///
/// `All` has to be used if none of the downstream clients reports messages,
/// to avoid stalling on counters that would never drain.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ForwardMode {
    /// Start messages forward on the first report, end messages when every
    /// output has reported.
    #[default]
    Default,
    /// Every message type forwards on the first report.
    First,
    /// Every message type waits for all outputs.
    Combine,
    /// Only messages of the main output (id 0) forward.
    Main,
    /// Every message of every output forwards unfiltered.
    All,
}

/// One counter bank per message kind, keyed by segment or group number.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum CounterKind {
    SegmentStart = 0,
    SegmentStartTime = 1,
    SegmentEnd = 2,
    GroupStart = 3,
    GroupEnd = 4,
}
const NUM_COUNTER_KINDS: usize = 5;

/// Keys cover this many in-flight groups/segments stored downstream before
/// the replicator starts bouncing packets.
const NUM_COUNTER_KEYS: usize = 64;
const COUNTER_KEY_MASK: u16 = NUM_COUNTER_KEYS as u16 - 1;

#[derive(Clone)]
struct EventCounter {
    key: u16,
    counter: i32,
    reported: Vec<bool>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum SendState {
    ArmSegmentStart,
    ArmSegmentStartTime,
    ArmSegmentEnd,
    ArmGroupStart,
    ArmGroupEnd,
    ReplicatePackets,
    SendPackets,
}

struct ReplicateState {
    sending: SendState,
    pending_out: Vec<Option<PacketBox>>,
    replicated: usize,
    delivered: usize,
}

struct TimedState {
    output_stream_times: Vec<TickDuration>,
    output_segment_numbers: Vec<u16>,
    last_message_time: TickDuration,
}

/// 1-to-N fanout unit.
pub struct StreamReplicator {
    base: UnitBase,
    ingress: Ingress,
    input: Arc<InputConnector>,
    outputs: Vec<Arc<OutputConnector>>,
    mode: ForwardMode,

    replicate: Mutex<ReplicateState>,
    counters: Mutex<Vec<[EventCounter; NUM_COUNTER_KINDS]>>,
    timed: Mutex<TimedState>,
    startup_possible: AtomicI32,
    startup_required: AtomicI32,
    tag_ids: Mutex<Option<Vec<TagId>>>,
}

impl StreamReplicator {
    pub fn new(
        name: impl AsRef<str>,
        num_outputs: usize,
        num_packets_per_output: usize,
        mode: ForwardMode,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let base = UnitBase::new(name);
            let input = InputConnector::unqueued(0, weak.clone() as Weak<dyn StreamUnit>);
            base.add_connector(ConnectorHandle::Input(input.clone()));

            let mut outputs = Vec::with_capacity(num_outputs);
            for i in 0..num_outputs {
                let output = OutputConnector::new(
                    num_packets_per_output,
                    1 + i as ConnectorId,
                    weak.clone() as Weak<dyn StreamUnit>,
                );
                base.add_connector(ConnectorHandle::Output(output.clone()));
                outputs.push(output);
            }

            let counter = EventCounter {
                key: 0,
                counter: 0,
                reported: vec![false; num_outputs],
            };
            Self {
                base,
                ingress: Ingress::new(),
                input,
                outputs,
                mode,
                replicate: Mutex::new(ReplicateState {
                    sending: SendState::ArmSegmentStart,
                    pending_out: (0..num_outputs).map(|_| None).collect(),
                    replicated: 0,
                    delivered: 0,
                }),
                counters: Mutex::new(vec![
                    std::array::from_fn(|_| counter.clone());
                    NUM_COUNTER_KEYS
                ]),
                timed: Mutex::new(TimedState {
                    output_stream_times: vec![TickDuration::ZERO; num_outputs],
                    output_segment_numbers: vec![0; num_outputs],
                    last_message_time: TickDuration::ZERO,
                }),
                startup_possible: AtomicI32::new(num_outputs as i32),
                startup_required: AtomicI32::new(1),
                tag_ids: Mutex::new(None),
            }
        })
    }

    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    fn num_outputs_i32(&self) -> i32 {
        self.outputs.len() as i32
    }

    /// Remember a packet's boundary flags inside the upstream counters.
    /// Arming fails with `ObjectFull` while the keyed counter is still
    /// draining an earlier boundary.
    fn arm_counter(&self, kind: CounterKind, key: u16, value: i32) -> StreamResult<()> {
        let mut counters = self.counters.lock();
        let counter = &mut counters[(key & COUNTER_KEY_MASK) as usize][kind as usize];

        if self.mode != ForwardMode::All && counter.counter > 0 {
            return Err(StreamError::ObjectFull);
        }

        counter.counter = match self.mode {
            ForwardMode::Default => value,
            ForwardMode::First | ForwardMode::Main => 1,
            // The counters stay unused; every message forwards directly.
            ForwardMode::All => 0,
            ForwardMode::Combine => self.num_outputs_i32(),
        };
        counter.key = key;
        counter.reported.fill(false);
        Ok(())
    }

    fn reset_counters(&self) {
        let mut counters = self.counters.lock();
        for bank in counters.iter_mut() {
            for counter in bank.iter_mut() {
                counter.counter = 0;
                counter.reported.fill(false);
            }
        }
        let mut timed = self.timed.lock();
        timed.output_stream_times.fill(TickDuration::ZERO);
        timed.output_segment_numbers.fill(0);
        timed.last_message_time = TickDuration::ZERO;

        self.startup_possible
            .store(self.num_outputs_i32(), Ordering::SeqCst);
        self.startup_required.store(1, Ordering::SeqCst);
    }

    /// Record that `output` contributed to the keyed counter and forward
    /// one upstream notification when the counter reaches zero.
    fn trigger_counter(
        &self,
        kind: CounterKind,
        key: u16,
        output: usize,
        mut message: UpstreamMessage,
    ) -> StreamResult<()> {
        if self.mode == ForwardMode::All {
            return self.input.send_upstream(message);
        }

        let fire = {
            let mut counters = self.counters.lock();
            let counter = &mut counters[(key & COUNTER_KEY_MASK) as usize][kind as usize];
            if counter.key != key {
                log::debug!(
                    "{}: counter {:?} unarmed, skipping #{key} from output {output}",
                    self.base.name(),
                    kind
                );
                return Ok(());
            }
            if counter.reported[output] {
                log::debug!(
                    "{}: output {output} reported {:?} #{key} again",
                    self.base.name(),
                    kind
                );
                return Ok(());
            }
            counter.reported[output] = true;

            if self.mode == ForwardMode::Main && output != 0 {
                false
            } else {
                counter.counter -= 1;
                counter.counter == 0
            }
        };
        if !fire {
            return Ok(());
        }

        // Timed messages carry the delta to the last timed message of the
        // whole replicator, clamped non-negative.
        {
            let mut timed = self.timed.lock();
            match &mut message {
                UpstreamMessage::SegmentStartTime { .. } => {
                    timed.last_message_time = timed.output_stream_times[output];
                }
                UpstreamMessage::GroupStart { delta, .. }
                | UpstreamMessage::GroupEnd { delta, .. } => {
                    let advance = timed.output_stream_times[output] - timed.last_message_time;
                    if advance > TickDuration::ZERO {
                        timed.last_message_time = timed.output_stream_times[output];
                        *delta = advance;
                    } else {
                        *delta = TickDuration::ZERO;
                    }
                }
                _ => {}
            }
        }

        self.input.send_upstream(message)?;

        // A bounced input packet can flow again once downstream reported;
        // unless a replicate/send pass is mid-flight anyway. A held state
        // lock means this notification arrived from inside such a pass.
        let mid_flight = match self.replicate.try_lock() {
            Some(state) => matches!(
                state.sending,
                SendState::ReplicatePackets | SendState::SendPackets
            ),
            None => true,
        };
        if self.ingress.packet_bounced() && !mid_flight {
            self.input.request_packets()?;
        }
        Ok(())
    }
}

impl PacketProcessor for StreamReplicator {
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

    /// The replicator consumes whole packets; no parsing involved.
    fn process_packet(&self, packet: &StreamPacket) -> StreamResult<()> {
        use strom_core::PacketFlags as F;

        let flags = packet.flags;
        let segment = packet.segment_number;
        let group = packet.group_number;
        let mut state = self.replicate.lock();

        loop {
            match state.sending {
                SendState::ArmSegmentStart => {
                    if flags.notifies(F::SEGMENT_START, F::SEGMENT_START_NOTIFICATION) {
                        self.arm_counter(CounterKind::SegmentStart, segment, 1)?;
                    }
                    state.sending = SendState::ArmSegmentStartTime;
                }
                SendState::ArmSegmentStartTime => {
                    if flags.notifies(F::SEGMENT_START, F::SEGMENT_START_NOTIFICATION) {
                        self.arm_counter(CounterKind::SegmentStartTime, segment, 1)?;
                    }
                    state.sending = SendState::ArmSegmentEnd;
                }
                SendState::ArmSegmentEnd => {
                    if flags.notifies(F::SEGMENT_END, F::SEGMENT_END_NOTIFICATION) {
                        self.arm_counter(
                            CounterKind::SegmentEnd,
                            segment,
                            self.num_outputs_i32(),
                        )?;
                    }
                    state.sending = SendState::ArmGroupStart;
                }
                SendState::ArmGroupStart => {
                    if flags.notifies(F::GROUP_START, F::GROUP_START_NOTIFICATION) {
                        self.arm_counter(CounterKind::GroupStart, group, 1)?;
                    }
                    state.sending = SendState::ArmGroupEnd;
                }
                SendState::ArmGroupEnd => {
                    if flags.notifies(F::GROUP_END, F::GROUP_END_NOTIFICATION) {
                        self.arm_counter(CounterKind::GroupEnd, group, self.num_outputs_i32())?;
                    }
                    state.sending = SendState::ReplicatePackets;
                }
                SendState::ReplicatePackets => {
                    while state.replicated < self.outputs.len() {
                        let index = state.replicated;
                        let mut copy = match self.outputs[index].get_empty_packet() {
                            Ok(packet) => packet,
                            // No empty packet: bail and resume right here.
                            Err(StreamError::ObjectEmpty) => return Err(StreamError::ObjectFull),
                            Err(err) => return Err(err),
                        };
                        copy.copy_from(packet);
                        state.pending_out[index] = Some(copy);
                        state.replicated += 1;
                    }
                    state.sending = SendState::SendPackets;
                }
                SendState::SendPackets => {
                    for (index, output) in self.outputs.iter().enumerate() {
                        if let Some(copy) = state.pending_out[index].take() {
                            match output.send_packet(copy) {
                                Ok(()) => state.delivered += 1,
                                Err(refused) => {
                                    state.pending_out[index] = Some(refused.packet);
                                }
                            }
                        }
                    }
                    if state.delivered < self.outputs.len() {
                        return Err(StreamError::ObjectFull);
                    }
                    state.delivered = 0;
                    state.replicated = 0;
                    state.sending = SendState::ArmSegmentStart;
                    return Ok(());
                }
            }
        }
    }

    fn process_flushing(&self) -> StreamResult<()> {
        {
            let mut state = self.replicate.lock();
            for slot in state.pending_out.iter_mut() {
                if let Some(mut packet) = slot.take() {
                    packet.release_ranges();
                    packet.return_to_origin();
                }
            }
            state.delivered = 0;
            state.replicated = 0;
            state.sending = SendState::ArmSegmentStart;
        }
        self.reset_counters();
        self.ingress.parser().lock().flush(self.as_parse_events())
    }
}

impl StreamUnit for StreamReplicator {
    fn base(&self) -> &UnitBase {
        &self.base
    }

    fn prepare_command(&self, command: &StreamCommand, target: StreamState) -> StreamResult<()> {
        if let StreamCommand::Begin { .. } = command {
            // The "start possible" needs every output; "start required"
            // is first-output-wins until the next begin.
            self.startup_possible
                .store(self.num_outputs_i32(), Ordering::SeqCst);
            self.startup_required.store(1, Ordering::SeqCst);
        }
        self.base.set_state(target);
        Ok(())
    }

    fn begin_command(&self, command: &StreamCommand) -> StreamResult<()> {
        self.ingress.standard_begin_command(self, command)
    }

    fn complete_command(&self, _command: CommandKind, target: StreamState) -> StreamResult<()> {
        self.ingress.standard_complete_command(self, target)
    }

    fn receive_packet(&self, _connector: ConnectorId, packet: PacketBox) -> PacketResult {
        self.ingress.receive_packet(self, packet)
    }

    fn upstream_notification(
        &self,
        connector: ConnectorId,
        message: UpstreamMessage,
    ) -> StreamResult<()> {
        // Output connector ids start at 1; the input is 0.
        let output = (connector as usize).saturating_sub(1);
        match message {
            UpstreamMessage::StartPossible => {
                // Logical AND over all outputs.
                if self.startup_possible.fetch_sub(1, Ordering::SeqCst) == 1 {
                    self.input.send_upstream(message)?;
                }
                Ok(())
            }
            UpstreamMessage::StartRequired => {
                // First output wins; later reports are absorbed.
                if self.startup_required.fetch_sub(1, Ordering::SeqCst) == 1 {
                    self.input.send_upstream(message)?;
                }
                Ok(())
            }
            UpstreamMessage::SegmentStart { segment } => {
                self.timed.lock().output_segment_numbers[output] = segment;
                self.trigger_counter(CounterKind::SegmentStart, segment, output, message)
            }
            UpstreamMessage::SegmentStartTime { .. } => {
                let segment = self.timed.lock().output_segment_numbers[output];
                self.trigger_counter(CounterKind::SegmentStartTime, segment, output, message)
            }
            UpstreamMessage::SegmentEnd { segment } => {
                self.trigger_counter(CounterKind::SegmentEnd, segment, output, message)
            }
            UpstreamMessage::GroupStart { group, delta } => {
                self.timed.lock().output_stream_times[output] += delta;
                self.trigger_counter(CounterKind::GroupStart, group, output, message)
            }
            UpstreamMessage::GroupEnd { group, delta } => {
                self.timed.lock().output_stream_times[output] += delta;
                self.trigger_counter(CounterKind::GroupEnd, group, output, message)
            }
            other => self.ingress.standard_upstream(self, other),
        }
    }

    fn receive_allocator(
        &self,
        _connector: ConnectorId,
        pool: std::sync::Arc<dyn strom_core::MemoryPool>,
    ) -> StreamResult<()> {
        self.input.provide_allocator(pool)
    }

    fn complete_connection(&self) -> StreamResult<()> {
        // Cache the union of the downstream tag id sets now; collecting it
        // during streaming would race the data path.
        let mut ids = Vec::new();
        for output in &self.outputs {
            ids.extend(output.stream_tag_ids().unwrap_or_default());
        }
        ids.sort_unstable_by_key(|id| id.0);
        ids.dedup();
        *self.tag_ids.lock() = Some(ids);
        Ok(())
    }

    fn stream_tag_ids(&self, _connector: ConnectorId) -> StreamResult<Vec<TagId>> {
        if let Some(ids) = self.tag_ids.lock().clone() {
            return Ok(ids);
        }
        let mut ids = Vec::new();
        for output in &self.outputs {
            ids.extend(output.stream_tag_ids()?);
        }
        ids.sort_unstable_by_key(|id| id.0);
        ids.dedup();
        Ok(ids)
    }
}

/// The replicator never parses; every event hook is inert.
impl ParseEvents for StreamReplicator {
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
    fn parse_begin_segment(&self, _segment: u16, _notification: bool) -> StreamResult<()> {
        Ok(())
    }
    fn parse_end_segment(&self, _segment: u16, _notification: bool) -> StreamResult<()> {
        Ok(())
    }
    fn parse_begin_group(
        &self,
        _group: u16,
        _notification: bool,
        _single_unit: bool,
    ) -> StreamResult<()> {
        Ok(())
    }
    fn parse_end_group(&self, _group: u16, _notification: bool) -> StreamResult<()> {
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
