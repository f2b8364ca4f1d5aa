//! The chain link pair: a passive bridge between two independently
//! activated streaming chains.
//!
//! The link input terminates the producing chain; the link output exposes
//! the adopted stream at the head of the receiving chain. When the
//! receiving chain is not ready the data is dropped, but the boundary
//! messages derived from the dropped packets are still generated on the
//! producing chain so its message causality stays intact. The link output
//! renumbers segments and groups for its chain and maps presentation times
//! across the two chains' clocks.

use parking_lot::Mutex;
use std::sync::{
    Arc, Weak,
    atomic::{AtomicBool, AtomicI32, Ordering},
};
use strom_core::clock::{ClockClient, ClockClientId, ClockStartupInfo, StreamingClock};
use strom_core::timer::system_time_now;
use strom_core::{
    CommandKind, ConnectorHandle, ConnectorId, InputConnector, MemoryPool, OutputConnector,
    PacketBox, PacketFlags, PacketResult, StreamCommand, StreamError, StreamResult,
    StreamState, StreamTime, StreamUnit, TickDuration, UnitBase, UpstreamMessage,
};

/// Tail unit of the producing chain.
pub struct LinkInput {
    base: UnitBase,
    input: Arc<InputConnector>,
    output: Arc<LinkOutput>,
    clock: Mutex<Option<Arc<dyn StreamingClock>>>,
}

impl LinkInput {
    /// Create the producing side and register it with its peer.
    pub fn new(name: impl AsRef<str>, output: &Arc<LinkOutput>) -> StreamResult<Arc<Self>> {
        let unit = Arc::new_cyclic(|weak: &Weak<Self>| {
            let input = InputConnector::unqueued(0, weak.clone() as Weak<dyn StreamUnit>);
            let base = UnitBase::new(name);
            base.add_connector(ConnectorHandle::Input(input.clone()));
            Self {
                base,
                input,
                output: output.clone(),
                clock: Mutex::new(None),
            }
        });
        output.register_link_input(Arc::downgrade(&unit))?;
        Ok(unit)
    }

    /// Producing chain state, queried by the link output.
    fn streaming_state(&self) -> StreamState {
        self.base.state()
    }

    /// Current stream time offset of the producing (capture) chain.
    fn capture_stream_time_offset(&self) -> StreamResult<TickDuration> {
        let clock = self
            .clock
            .lock()
            .clone()
            .ok_or(StreamError::IncompleteConfiguration)?;
        clock.current_stream_time_offset()
    }

    fn notify_upstream(&self, message: UpstreamMessage) -> StreamResult<()> {
        self.input.send_upstream(message)
    }

    fn provide_allocator_upstream(&self, pool: Arc<dyn MemoryPool>) -> StreamResult<()> {
        self.input.provide_allocator(pool)
    }

    fn pushing(&self) -> StreamResult<bool> {
        self.input.is_pushing_chain()
    }
}

impl StreamUnit for LinkInput {
    fn base(&self) -> &UnitBase {
        &self.base
    }

    fn begin_command(&self, command: &StreamCommand) -> StreamResult<()> {
        // The state of the target chain is ignored on purpose; a target
        // that cannot take data is handled packet by packet.
        self.base
            .signal_command_completion(command.kind(), Ok(()))
    }

    fn receive_packet(&self, _connector: ConnectorId, packet: PacketBox) -> PacketResult {
        // Forward verbatim while the target chain can take data.
        let target_state = self.output.streaming_state();
        if target_state == StreamState::Ready || target_state == StreamState::Streaming {
            return self.output.adopt_packet(packet);
        }

        // Otherwise generate the requested boundary messages and burn the
        // packet and its content here.
        let flags = packet.flags;
        if flags.notifies(PacketFlags::SEGMENT_END, PacketFlags::SEGMENT_END_NOTIFICATION) {
            let _ = self.input.send_upstream(UpstreamMessage::SegmentEnd {
                segment: packet.segment_number,
            });
        }
        if flags.notifies(PacketFlags::SEGMENT_START, PacketFlags::SEGMENT_START_NOTIFICATION) {
            let _ = self.input.send_upstream(UpstreamMessage::SegmentStart {
                segment: packet.segment_number,
            });
        }
        if flags.notifies(PacketFlags::GROUP_END, PacketFlags::GROUP_END_NOTIFICATION) {
            let _ = self.input.send_upstream(UpstreamMessage::GroupEnd {
                group: packet.group_number,
                delta: TickDuration::ZERO,
            });
        }
        if flags.notifies(PacketFlags::GROUP_START, PacketFlags::GROUP_START_NOTIFICATION) {
            let _ = self.input.send_upstream(UpstreamMessage::GroupStart {
                group: packet.group_number,
                delta: TickDuration::ZERO,
            });
        }

        let mut packet = packet;
        packet.release_ranges();
        packet.return_to_origin();
        Ok(())
    }

    fn propagate_clock(&self, clock: &Arc<dyn StreamingClock>) -> StreamResult<()> {
        *self.clock.lock() = Some(clock.clone());
        Ok(())
    }
}

struct LinkOutputState {
    is_pushing: bool,
    is_pulling: bool,
    stop_request: bool,
    flush_request: bool,
    discontinuity_pending: bool,
    first_packet: bool,
    inside_segment: bool,
    inside_group: bool,
    segment_number: u16,
    group_number: u16,
    pending: Option<PacketBox>,
    target: Option<PacketBox>,
    current_stream_time: StreamTime,
    previous_input_time: StreamTime,
    current_system_time_offset: TickDuration,
    system_start_time: StreamTime,
}

impl LinkOutputState {
    fn new() -> Self {
        Self {
            is_pushing: false,
            is_pulling: false,
            stop_request: false,
            flush_request: false,
            discontinuity_pending: false,
            first_packet: true,
            inside_segment: false,
            inside_group: false,
            segment_number: 0,
            group_number: 0,
            pending: None,
            target: None,
            current_stream_time: StreamTime::ZERO,
            previous_input_time: StreamTime::ZERO,
            current_system_time_offset: TickDuration::ZERO,
            system_start_time: StreamTime::ZERO,
        }
    }

    fn release(packet: &mut Option<PacketBox>) {
        if let Some(mut packet) = packet.take() {
            packet.release_ranges();
            packet.return_to_origin();
        }
    }
}

/// Head unit of the receiving chain.
pub struct LinkOutput {
    base: UnitBase,
    output: Arc<OutputConnector>,
    link_input: Mutex<Option<Weak<LinkInput>>>,
    clock: Mutex<Option<Arc<dyn StreamingClock>>>,
    clock_id: Mutex<Option<ClockClientId>>,
    /// Clock priority of the adopted stream.
    priority: u32,
    /// Propagation delay across the bridge, added to every mapped time.
    chain_delay: TickDuration,

    state: Mutex<LinkOutputState>,
    pending_lock: AtomicI32,
    process_request: AtomicBool,
    weak_self: Weak<LinkOutput>,
}

impl LinkOutput {
    pub fn new(name: impl AsRef<str>, priority: u32, chain_delay: TickDuration) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let output = OutputConnector::new(16, 0, weak.clone() as Weak<dyn StreamUnit>);
            let base = UnitBase::new(name);
            base.add_connector(ConnectorHandle::Output(output.clone()));
            Self {
                base,
                output,
                link_input: Mutex::new(None),
                clock: Mutex::new(None),
                clock_id: Mutex::new(None),
                priority,
                chain_delay,
                state: Mutex::new(LinkOutputState::new()),
                pending_lock: AtomicI32::new(0),
                process_request: AtomicBool::new(false),
                weak_self: weak.clone(),
            }
        })
    }

    fn register_link_input(&self, input: Weak<LinkInput>) -> StreamResult<()> {
        let mut slot = self.link_input.lock();
        if slot.is_some() {
            return Err(StreamError::InUse);
        }
        *slot = Some(input);
        Ok(())
    }

    fn link_input(&self) -> StreamResult<Arc<LinkInput>> {
        self.link_input
            .lock()
            .clone()
            .and_then(|weak| weak.upgrade())
            .ok_or(StreamError::ObjectNotCurrent)
    }

    fn streaming_state(&self) -> StreamState {
        self.base.state()
    }

    /// Packet hand-over from the producing side.
    fn adopt_packet(&self, packet: PacketBox) -> PacketResult {
        let pushing = self.state.lock().is_pushing;
        if !pushing {
            // Pull model: hand straight through.
            return self.output.send_packet(packet);
        }

        if self.base.state() != StreamState::Streaming {
            let mut packet = packet;
            packet.release_ranges();
            packet.return_to_origin();
            return Ok(());
        }

        self.process_pending();
        {
            let mut state = self.state.lock();
            if state.pending.is_none() {
                state.pending = Some(packet);
            } else {
                let mut packet = packet;
                packet.release_ranges();
                packet.return_to_origin();
                return Ok(());
            }
        }
        self.process_pending();
        Ok(())
    }

    /// Map a presentation time of the producing chain onto the receiving
    /// chain's clock, synchronizing this link's clock clientship on the
    /// way.
    fn calculate_packet_time(
        &self,
        state: &mut LinkOutputState,
        input_time: StreamTime,
    ) -> StreamResult<StreamTime> {
        let capture_offset = self.link_input()?.capture_stream_time_offset()?;
        let system_capture_time = input_time - capture_offset;

        let clock = self
            .clock
            .lock()
            .clone()
            .ok_or(StreamError::IncompleteConfiguration)?;
        if state.first_packet {
            state.current_system_time_offset = clock.current_stream_time_offset()?;
            state.first_packet = false;
        } else {
            state.current_stream_time += input_time - state.previous_input_time;
            let clock_id = self
                .clock_id
                .lock()
                .clone()
                .ok_or(StreamError::IncompleteConfiguration)?;
            state.current_system_time_offset = clock.synchronize_client(
                clock_id,
                self.priority,
                state.current_stream_time - system_capture_time,
            )?;
        }
        state.previous_input_time = input_time;
        state.current_stream_time = system_capture_time + state.current_system_time_offset;

        Ok(state.current_stream_time + self.chain_delay)
    }

    /// Send the prepared target packet; segment/group tracking follows the
    /// flags of what actually went out. The state lock is dropped around
    /// the send because the receiving chain may call back in.
    fn send_target(&self) {
        let packet = self.state.lock().target.take();
        let Some(packet) = packet else {
            return;
        };
        let flags = packet.flags;
        match self.output.send_packet(packet) {
            Err(refused) if refused.error == StreamError::ObjectFull => {
                self.state.lock().target = Some(refused.packet);
                return;
            }
            Err(refused) => {
                log::warn!(
                    "{}: target packet dropped: {}",
                    self.base.name(),
                    refused.error
                );
                let mut packet = refused.packet;
                packet.release_ranges();
                packet.return_to_origin();
                return;
            }
            Ok(()) => {}
        }

        let mut state = self.state.lock();
        if flags.contains(PacketFlags::SEGMENT_START) {
            state.inside_segment = true;
        }
        if flags.contains(PacketFlags::GROUP_START) {
            state.inside_group = true;
        }
        if flags.contains(PacketFlags::GROUP_END) {
            state.inside_group = false;
            state.group_number = state.group_number.wrapping_add(1);
        }
        if flags.contains(PacketFlags::SEGMENT_END) {
            state.inside_segment = false;
            state.group_number = 0;
            state.segment_number = state.segment_number.wrapping_add(1);
        }
    }

    /// The pending packet drain, interlocked so that only one path of
    /// control adapts and forwards at a time.
    fn process_pending(&self) {
        self.process_request.store(true, Ordering::SeqCst);
        loop {
            if self.pending_lock.fetch_add(1, Ordering::SeqCst) == 0 {
                self.process_request.store(false, Ordering::SeqCst);
                self.drain_pending();
            }
            let remaining = self.pending_lock.fetch_sub(1, Ordering::SeqCst) - 1;
            if !(remaining == 0 && self.process_request.load(Ordering::SeqCst)) {
                break;
            }
        }
    }

    fn drain_pending(&self) {
        {
            let mut state = self.state.lock();
            if state.flush_request {
                LinkOutputState::release(&mut state.pending);
                LinkOutputState::release(&mut state.target);

                state.inside_group = false;
                state.inside_segment = false;
                state.stop_request = false;
                state.group_number = 0;
                state.segment_number = 0;
                state.first_packet = true;
                state.is_pushing = false;
                state.is_pulling = false;
                state.flush_request = false;

                drop(state);
                if let Err(err) = self
                    .base
                    .signal_command_completion(CommandKind::Flush, Ok(()))
                {
                    log::warn!("{}: flush completion failed: {err}", self.base.name());
                }
                return;
            }

            if state.stop_request {
                LinkOutputState::release(&mut state.pending);
                LinkOutputState::release(&mut state.target);

                if state.inside_segment {
                    // Close the adopted segment before reporting completion.
                    // An exhausted pool leaves the request armed for the
                    // next drain.
                    if let Ok(mut packet) = self.output.get_empty_packet() {
                        packet.flags = PacketFlags::SEGMENT_END | PacketFlags::TIME_DISCONTINUITY;
                        if state.inside_group {
                            packet.flags |= PacketFlags::GROUP_END;
                        }
                        packet.group_number = state.group_number;
                        packet.segment_number = state.segment_number;
                        state.target = Some(packet);
                        state.stop_request = false;

                        drop(state);
                        let _ = self
                            .base
                            .signal_command_completion(CommandKind::Begin, Ok(()));
                        self.send_target();
                    }
                } else {
                    state.stop_request = false;
                    drop(state);
                    let _ = self
                        .base
                        .signal_command_completion(CommandKind::Begin, Ok(()));
                }
                return;
            }
        }

        self.send_target();

        let need_discontinuity = {
            let state = self.state.lock();
            state.target.is_none() && state.discontinuity_pending
        };
        if need_discontinuity {
            if let Ok(mut packet) = self.output.get_empty_packet() {
                {
                    let mut state = self.state.lock();
                    packet.flags = PacketFlags::TIME_DISCONTINUITY;
                    if state.inside_group {
                        packet.flags |= PacketFlags::GROUP_END;
                    }
                    packet.group_number = state.group_number;
                    packet.segment_number = state.segment_number;
                    state.target = Some(packet);
                    state.first_packet = true;
                    state.discontinuity_pending = false;
                }
                self.send_target();
            }
        }

        let mut send_adopted = false;
        {
            let mut state = self.state.lock();
            if state.pending.is_some() && !state.discontinuity_pending {
                // Adoption starts at a group boundary; mid-group joiners
                // wait for the next discontinuity handling.
                let group_start = state
                    .pending
                    .as_ref()
                    .map(|p| p.flags.contains(PacketFlags::GROUP_START))
                    .unwrap_or(false);
                if !state.first_packet || group_start {
                    if state.target.is_none() {
                        match self.output.get_empty_packet() {
                            Ok(mut packet) => {
                                if let Some(pending) = state.pending.as_ref() {
                                    packet.copy_from(pending);
                                }

                                if packet.flags.contains(PacketFlags::START_TIME_VALID) {
                                    match self
                                        .calculate_packet_time(&mut state, packet.start_time)
                                    {
                                        Ok(time) => packet.start_time = time,
                                        Err(err) => {
                                            log::warn!(
                                                "{}: time adjustment failed: {err}",
                                                self.base.name()
                                            );
                                        }
                                    }
                                }
                                if packet.flags.contains(PacketFlags::END_TIME_VALID) {
                                    if let Ok(time) =
                                        self.calculate_packet_time(&mut state, packet.end_time)
                                    {
                                        packet.end_time = time;
                                    }
                                }

                                if !state.inside_segment {
                                    packet.flags |= PacketFlags::SEGMENT_START;
                                }
                                packet.segment_number = state.segment_number;
                                packet.group_number = state.group_number;
                                state.target = Some(packet);
                                send_adopted = true;
                            }
                            Err(_) => state.discontinuity_pending = true,
                        }
                    } else {
                        state.discontinuity_pending = true;
                    }
                }
            }
            LinkOutputState::release(&mut state.pending);
        }
        if send_adopted {
            self.send_target();
        }
    }
}

impl StreamUnit for LinkOutput {
    fn base(&self) -> &UnitBase {
        &self.base
    }

    fn begin_command(&self, command: &StreamCommand) -> StreamResult<()> {
        let link_state = self.link_input().map(|input| input.streaming_state());
        let result = match link_state {
            Ok(_) => {
                match *command {
                    StreamCommand::Step { .. } => Ok(()),
                    StreamCommand::Begin { .. } => {
                        let pushing = self.state.lock().is_pushing;
                        if pushing {
                            self.state.lock().stop_request = true;
                            self.process_pending();
                            // Completion comes out of the stop handling.
                            return Ok(());
                        }
                        self.is_pushing_link().map(|_| ())
                    }
                    StreamCommand::Do { .. } => {
                        let info = {
                            let mut state = self.state.lock();
                            state.first_packet = true;
                            state.system_start_time = system_time_now() + self.chain_delay;
                            ClockStartupInfo {
                                stream_start_time: StreamTime::ZERO,
                                stream_start_time_valid: state.is_pushing,
                                render_frame_duration: TickDuration::from_millis(1),
                                next_render_frame_time: state.system_start_time,
                                next_render_frame_number: 0,
                            }
                        };
                        let clock = self
                            .clock
                            .lock()
                            .clone()
                            .ok_or(StreamError::IncompleteConfiguration)?;
                        let clock_id = self
                            .clock_id
                            .lock()
                            .clone()
                            .ok_or(StreamError::IncompleteConfiguration)?;
                        clock.report_startup(clock_id, info)?;
                        // Completion arrives with the startup frame.
                        return Ok(());
                    }
                    StreamCommand::Flush { .. } => {
                        let pushing = self.state.lock().is_pushing;
                        if pushing {
                            self.state.lock().flush_request = true;
                            self.process_pending();
                            return Ok(());
                        }
                        let mut state = self.state.lock();
                        state.is_pushing = false;
                        state.is_pulling = false;
                        Ok(())
                    }
                }
            }
            Err(err) => {
                log::warn!("{}: link peer state query failed: {err}", self.base.name());
                Err(err)
            }
        };

        self.base.signal_command_completion(command.kind(), result)
    }

    fn upstream_notification(
        &self,
        _connector: ConnectorId,
        message: UpstreamMessage,
    ) -> StreamResult<()> {
        let pushing = self.state.lock().is_pushing;
        match message {
            UpstreamMessage::StartPossible | UpstreamMessage::StartRequired => {
                match self.base.parent() {
                    Some(parent) => parent.upchain_notification(message),
                    None => Ok(()),
                }
            }
            UpstreamMessage::PacketRequest { .. } => {
                if pushing {
                    self.process_pending();
                    Ok(())
                } else {
                    self.link_input()?.notify_upstream(message)
                }
            }
            other => {
                if pushing {
                    match self.base.parent() {
                        Some(parent) => parent.upchain_notification(other),
                        None => Ok(()),
                    }
                } else {
                    self.link_input()?.notify_upstream(other)
                }
            }
        }
    }

    fn receive_allocator(
        &self,
        _connector: ConnectorId,
        pool: Arc<dyn MemoryPool>,
    ) -> StreamResult<()> {
        self.link_input()?.provide_allocator_upstream(pool)
    }

    fn propagate_clock(&self, clock: &Arc<dyn StreamingClock>) -> StreamResult<()> {
        *self.clock.lock() = Some(clock.clone());
        Ok(())
    }

    fn complete_connection(&self) -> StreamResult<()> {
        if let Some(clock) = self.clock.lock().clone() {
            let id = clock.register_client(self.weak_self.clone() as Weak<dyn ClockClient>);
            *self.clock_id.lock() = Some(id);
        }
        Ok(())
    }

    fn is_pushing_chain(&self, _connector: ConnectorId) -> bool {
        self.is_pushing_link().unwrap_or(false)
    }
}

impl LinkOutput {
    /// Pull/push detection across the bridge, cached after first query.
    fn is_pushing_link(&self) -> StreamResult<bool> {
        {
            let state = self.state.lock();
            if state.is_pushing {
                return Ok(true);
            }
            if state.is_pulling {
                return Ok(false);
            }
        }
        let pushing = self.link_input()?.pushing()?;
        let mut state = self.state.lock();
        if pushing {
            state.is_pushing = true;
        } else {
            state.is_pulling = true;
        }
        Ok(pushing)
    }
}

impl ClockClient for LinkOutput {
    fn set_startup_frame(&self, frame_number: u32, start_time: StreamTime) -> StreamResult<()> {
        {
            let mut state = self.state.lock();
            state.current_stream_time = start_time;
            state.current_system_time_offset = state.current_stream_time
                - (state.system_start_time + TickDuration::from_millis(frame_number as i64));
        }
        self.base
            .signal_command_completion(CommandKind::Do, Ok(()))
    }

    fn current_stream_time_offset(&self) -> StreamResult<TickDuration> {
        Ok(self.state.lock().current_system_time_offset)
    }
}
