//! The streaming proxy: the chain as the application sees it.
//!
//! The proxy accepts commands, runs the three phase protocol over every
//! participating unit, owns the chain's streaming clock, and exposes the
//! chain's external connectors as application packet endpoints. The
//! application hears back through an event channel carrying every upstream
//! notification plus command completions.

use crate::chain::CommandFanout;
use crate::clock::StreamClock;
use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use strom_core::clock::StreamingClock;
use strom_core::{
    ChainParent, CommandKind, ConnectorHandle, ConnectorId, InputConnector, MemoryPool,
    OutputConnector, Speed, StreamCommand, StreamError, StreamPacket, StreamResult, StreamState,
    StreamUnit, TickDuration, UnitBase, UnitRef, UpstreamMessage, plug,
};

/// Queue size of the application facing input connectors.
const APP_INPUT_QUEUE: usize = 15;
/// Empty packet pool size of the application facing output connectors.
const APP_OUTPUT_PACKETS: usize = 50;

/// Application surface of one streaming chain.
pub struct StreamProxy {
    base: UnitBase,
    children: Mutex<Vec<UnitRef>>,
    fanout: CommandFanout,
    clock: Arc<StreamClock>,
    /// Serializes commands; a second command while one is mid-phase is
    /// rejected, not queued.
    command_mutex: Mutex<()>,
    direction: Mutex<i32>,
    speed: Mutex<Speed>,

    /// Chain outputs, queued towards the application.
    app_inputs: Mutex<Vec<Arc<InputConnector>>>,
    /// Chain inputs, fed by the application.
    app_outputs: Mutex<Vec<Arc<OutputConnector>>>,
    /// Allocators received from the chain inputs, per app output.
    chain_allocators: Mutex<Vec<Option<Arc<dyn MemoryPool>>>>,

    events_tx: Sender<UpstreamMessage>,
    events_rx: Receiver<UpstreamMessage>,
    weak_self: Weak<StreamProxy>,
}

impl StreamProxy {
    /// Build a proxy over the chain rooted at `root`, plugging application
    /// connectors against every external connector of the root and
    /// completing the connection of the whole graph.
    pub fn new(name: impl AsRef<str>, root: UnitRef) -> StreamResult<Arc<Self>> {
        let (events_tx, events_rx) = unbounded();
        let proxy = Arc::new_cyclic(|weak: &Weak<StreamProxy>| Self {
            base: UnitBase::new(name),
            children: Mutex::new(vec![root.clone()]),
            fanout: CommandFanout::new(),
            clock: Arc::new(StreamClock::new()),
            command_mutex: Mutex::new(()),
            direction: Mutex::new(1),
            speed: Mutex::new(Speed::ZERO),
            app_inputs: Mutex::new(Vec::new()),
            app_outputs: Mutex::new(Vec::new()),
            chain_allocators: Mutex::new(Vec::new()),
            events_tx,
            events_rx,
            weak_self: weak.clone(),
        });

        root.set_parent(proxy.weak_self.clone() as Weak<dyn ChainParent>);

        // Walk the root's external connectors: every chain input gets an
        // application output plugged into it and vice versa.
        let unit_ref = proxy.weak_self.clone() as Weak<dyn StreamUnit>;
        let mut id: ConnectorId = 0;
        loop {
            match root.find_connector(id) {
                Ok(ConnectorHandle::Input(chain_input)) => {
                    let out_id = proxy.app_outputs.lock().len() as ConnectorId;
                    let output = OutputConnector::new(APP_OUTPUT_PACKETS, out_id, unit_ref.clone());
                    plug(&output, &chain_input)?;
                    proxy.app_outputs.lock().push(output);
                    proxy.chain_allocators.lock().push(None);
                }
                Ok(ConnectorHandle::Output(chain_output)) => {
                    let in_id = proxy.app_inputs.lock().len() as ConnectorId;
                    let input =
                        InputConnector::queued(in_id, unit_ref.clone(), APP_INPUT_QUEUE, 1);
                    plug(&chain_output, &input)?;
                    proxy.app_inputs.lock().push(input);
                }
                Err(StreamError::RangeViolation) | Err(StreamError::ObjectEmpty) => break,
                Err(err) => return Err(err),
            }
            id += 1;
        }

        // The master clock must be distributed before the connection is
        // completed; clock clients register during completion.
        let clock = proxy.clock.clone() as Arc<dyn StreamingClock>;
        root.propagate_clock(&clock)?;
        root.complete_connection()?;

        Ok(proxy)
    }

    /// The channel on which the application receives upstream notifications
    /// and command completions.
    pub fn events(&self) -> Receiver<UpstreamMessage> {
        self.events_rx.clone()
    }

    pub fn state(&self) -> StreamState {
        self.base.state()
    }

    /// The chain's streaming clock (owned by this proxy).
    pub fn clock(&self) -> Arc<dyn StreamingClock> {
        self.clock.clone()
    }

    /// Offset of the current stream time relative to the system time,
    /// combined over all clock clients.
    pub fn current_stream_time_offset(&self) -> StreamResult<TickDuration> {
        self.clock.current_stream_time_offset()
    }

    fn children(&self) -> Vec<UnitRef> {
        self.children.lock().clone()
    }

    fn emit(&self, message: UpstreamMessage) {
        if self.events_tx.send(message).is_err() {
            log::warn!("{}: application event channel gone", self.base.name());
        }
    }

    fn immediate_completion(&self, command: CommandKind, result: Result<(), StreamError>) {
        self.emit(UpstreamMessage::CommandCompleted { command, result });
    }

    /// Validate command parameters against the stored direction.
    fn validate(&self, command: &StreamCommand) -> StreamResult<()> {
        let direction = *self.direction.lock();
        match command {
            StreamCommand::Begin { direction } => {
                if *direction == 1 || *direction == -1 {
                    Ok(())
                } else {
                    Err(StreamError::InvalidDirection)
                }
            }
            StreamCommand::Do { speed } => {
                if speed.raw() != 0 && (speed.raw() >= 0) == (direction >= 0) {
                    Ok(())
                } else {
                    Err(StreamError::InvalidSpeed)
                }
            }
            StreamCommand::Step { frames } => {
                if *frames == 0 || (*frames >= 0) == (direction >= 0) {
                    Ok(())
                } else {
                    Err(StreamError::InvalidStepCount)
                }
            }
            StreamCommand::Flush { .. } => Ok(()),
        }
    }

    /// True when the command changes nothing and completes immediately
    /// without visiting the chain.
    fn is_noop(&self, command: &StreamCommand, state: StreamState) -> bool {
        match command {
            StreamCommand::Begin { direction } => {
                state == StreamState::Ready && *direction == *self.direction.lock()
            }
            StreamCommand::Do { speed } => {
                state == StreamState::Streaming && *speed == *self.speed.lock()
            }
            StreamCommand::Step { frames } => *frames == 0,
            StreamCommand::Flush { .. } => state == StreamState::Idle,
        }
    }

    /// Asynchronously execute a command on the chain. Completion is
    /// delivered as a `CommandCompleted` event; only one command runs at a
    /// time system-wide.
    pub fn send_command(&self, command: StreamCommand) -> StreamResult<()> {
        let _serialized = self.command_mutex.lock();

        let state = self.base.state();
        if state == StreamState::Terminated {
            return Err(StreamError::Terminated);
        }
        // Only accept a command when not already processing another.
        if !state.is_steady() {
            return Err(StreamError::ProcessingCommand);
        }

        if let Err(err) = self.validate(&command) {
            self.immediate_completion(command.kind(), Err(err));
            return Err(err);
        }

        if self.is_noop(&command, state) {
            self.immediate_completion(command.kind(), Ok(()));
            return Ok(());
        }

        let target = match state.transition_for(&command) {
            Ok(target) => target,
            Err(err) => {
                self.immediate_completion(command.kind(), Err(err));
                return Err(err);
            }
        };

        match command {
            StreamCommand::Begin { direction } => *self.direction.lock() = direction,
            StreamCommand::Do { speed } => *self.speed.lock() = speed,
            _ => {}
        }

        self.base.set_state(target);
        self.fanout.add_participant();

        let children = self.children();
        let mut result = self.fanout.forward_prepare(&children, &command, target);
        if result.is_ok() {
            if let StreamCommand::Do { speed } = command {
                // Arm the startup synchronisation clock before any
                // participant reports its startup info.
                self.clock.begin_startup_sequence(speed);
            }
            result = self.fanout.forward_begin(&children, &command);
        }

        // The proxy itself has finished its part.
        self.command_completed(command.kind(), result);

        result
    }

    /// One participant (or the proxy itself) reported completion.
    fn command_completed(&self, command: CommandKind, result: Result<(), StreamError>) {
        let Some(merged) = self.fanout.completed(result) else {
            return;
        };

        let children = self.children();
        let settle = match merged {
            // A failed command phase is fatal to the chain.
            Err(_) => StreamState::Terminated,
            Ok(()) => StreamState::settled_for(command),
        };
        if let Err(err) = self.fanout.forward_complete(&children, command, settle) {
            log::error!("{}: complete phase failed: {err}", self.base.name());
        }
        self.base.set_state(settle);

        self.emit(UpstreamMessage::CommandCompleted {
            command,
            result: merged,
        });
    }

    fn app_input(&self, connector: ConnectorId) -> StreamResult<Arc<InputConnector>> {
        let outputs = self.app_outputs.lock().len() as ConnectorId;
        let index = connector
            .checked_sub(outputs)
            .ok_or(StreamError::NotFound)?;
        self.app_inputs
            .lock()
            .get(index as usize)
            .cloned()
            .ok_or(StreamError::NotFound)
    }

    fn app_output(&self, connector: ConnectorId) -> StreamResult<Arc<OutputConnector>> {
        self.app_outputs
            .lock()
            .get(connector as usize)
            .cloned()
            .ok_or(StreamError::NotFound)
    }

    /// Number of chain inputs (application outputs). Application connector
    /// ids are outputs first, inputs after.
    pub fn num_outputs(&self) -> usize {
        self.app_outputs.lock().len()
    }

    pub fn num_inputs(&self) -> usize {
        self.app_inputs.lock().len()
    }

    /// Deliver application packets into the chain. Packet content is copied
    /// into pooled packets; the given packets can be reused immediately.
    /// Returns how many packets were accepted.
    pub fn deliver_packets(
        &self,
        connector: ConnectorId,
        packets: &[StreamPacket],
    ) -> StreamResult<usize> {
        let output = self.app_output(connector)?;
        let mut accepted = 0;
        for source in packets {
            let mut packet = match output.get_empty_packet() {
                Ok(packet) => packet,
                Err(StreamError::ObjectEmpty) => break,
                Err(err) => return Err(err),
            };
            packet.copy_from(source);
            match output.send_packet(packet) {
                Ok(()) => accepted += 1,
                Err(refused) => {
                    let mut packet = refused.packet;
                    packet.release_ranges();
                    packet.return_to_origin();
                    if refused.error.is_flow_control() {
                        break;
                    }
                    return Err(refused.error);
                }
            }
        }
        Ok(accepted)
    }

    /// Retrieve packets that arrived on an application input connector
    /// after a `PacketArrival` event. Returns how many entries of `dest`
    /// were filled.
    pub fn get_packets(
        &self,
        connector: ConnectorId,
        dest: &mut [StreamPacket],
    ) -> StreamResult<usize> {
        let input = self.app_input(connector)?;
        let mut filled = 0;
        for slot in dest.iter_mut() {
            match input.dequeue_packet() {
                Ok(mut packet) => {
                    slot.copy_from(&packet);
                    packet.release_ranges();
                    packet.return_to_origin();
                    filled += 1;
                }
                Err(StreamError::ObjectEmpty) => break,
                Err(err) => return Err(err),
            }
        }
        Ok(filled)
    }

    /// Keep a pull model stream flowing: ask the chain for more packets on
    /// an application input connector.
    pub fn request_packets(&self, connector: ConnectorId) -> StreamResult<()> {
        self.app_input(connector)?.request_packets()
    }

    /// Provide an allocator for a chain output (application input side).
    pub fn provide_allocator(
        &self,
        connector: ConnectorId,
        pool: Arc<dyn MemoryPool>,
    ) -> StreamResult<()> {
        self.app_input(connector)?.provide_allocator(pool)
    }

    /// The allocator the chain offers at one of its inputs (application
    /// output side).
    pub fn request_allocator(&self, connector: ConnectorId) -> StreamResult<Arc<dyn MemoryPool>> {
        self.chain_allocators
            .lock()
            .get(connector as usize)
            .cloned()
            .flatten()
            .ok_or(StreamError::NotFound)
    }
}

impl StreamUnit for StreamProxy {
    fn base(&self) -> &UnitBase {
        &self.base
    }

    /// Packets from the chain land in the application input queues; the
    /// queue signals arrival here.
    fn signal_packet_arrival(&self, connector: ConnectorId, count: usize) -> StreamResult<()> {
        let outputs = self.app_outputs.lock().len() as ConnectorId;
        self.emit(UpstreamMessage::PacketArrival {
            connector: outputs + connector,
            count: count as u32,
        });
        Ok(())
    }

    fn upstream_notification(
        &self,
        connector: ConnectorId,
        message: UpstreamMessage,
    ) -> StreamResult<()> {
        match message {
            // A starved chain input translates into a packet request to
            // the application, stamped with the local connector id.
            UpstreamMessage::PacketRequest { .. } => {
                self.emit(UpstreamMessage::PacketRequest { connector });
                Ok(())
            }
            other => {
                self.emit(other);
                Ok(())
            }
        }
    }

    fn receive_allocator(
        &self,
        connector: ConnectorId,
        pool: Arc<dyn MemoryPool>,
    ) -> StreamResult<()> {
        let mut allocators = self.chain_allocators.lock();
        let slot = allocators
            .get_mut(connector as usize)
            .ok_or(StreamError::RangeViolation)?;
        *slot = Some(pool);
        Ok(())
    }

    fn is_pushing_chain(&self, _connector: ConnectorId) -> bool {
        // The application side is never a capture source.
        false
    }
}

impl ChainParent for StreamProxy {
    fn upchain_notification(&self, message: UpstreamMessage) -> StreamResult<()> {
        match message {
            UpstreamMessage::CommandCompleted { command, result } => {
                self.command_completed(command, result);
                Ok(())
            }
            other => {
                self.emit(other);
                Ok(())
            }
        }
    }
}
