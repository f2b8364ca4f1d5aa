//! Base machinery shared by all streaming units.
//!
//! Units are `Arc`-shared objects with interior mutability behind the
//! object-safe [`StreamUnit`] interface. A unit holds its connectors, its
//! streaming state, and a non-owning backlink to its enclosing chain for
//! upchain notifications. Non-threaded units process at most one pending
//! packet at a time through the interlocked [`Ingress`] machinery; threaded
//! units run the same machinery from their own thread loop.

use crate::clock::StreamingClock;
use crate::parser::{PacketParser, ParseEvents};
use crate::{
    CommandKind, ConnectorId, InputConnector, MemoryPool, OutputConnector, PacketBox,
    PacketRefused, PacketResult, StreamCommand, StreamError, StreamResult, StreamState, TagId,
    ThreadCtx, UpstreamMessage,
};
use ecow::EcoString;
use parking_lot::Mutex;
use std::sync::{
    Arc, Weak,
    atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering},
};

/// One entry in a unit's connector table.
#[derive(Clone)]
pub enum ConnectorHandle {
    Input(Arc<InputConnector>),
    Output(Arc<OutputConnector>),
}

/// The enclosing chain of a unit, receiver of upchain notifications
/// (command completions and everything bound for the application).
pub trait ChainParent: Send + Sync {
    fn upchain_notification(&self, message: UpstreamMessage) -> StreamResult<()>;
}

/// Common state of every streaming unit.
pub struct UnitBase {
    name: EcoString,
    state: Mutex<StreamState>,
    parent: Mutex<Weak<dyn ChainParent>>,
    connectors: Mutex<Vec<ConnectorHandle>>,
}

impl UnitBase {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self {
            name: EcoString::from(name.as_ref()),
            state: Mutex::new(StreamState::Idle),
            parent: Mutex::new(weak_parent_none()),
            connectors: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> StreamState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: StreamState) {
        *self.state.lock() = state;
    }

    pub fn add_connector(&self, connector: ConnectorHandle) {
        self.connectors.lock().push(connector);
    }

    pub fn connector(&self, id: ConnectorId) -> StreamResult<ConnectorHandle> {
        let connectors = self.connectors.lock();
        if connectors.is_empty() {
            return Err(StreamError::ObjectEmpty);
        }
        connectors
            .get(id as usize)
            .cloned()
            .ok_or(StreamError::RangeViolation)
    }

    pub fn num_connectors(&self) -> usize {
        self.connectors.lock().len()
    }

    pub fn set_parent(&self, parent: Weak<dyn ChainParent>) {
        *self.parent.lock() = parent;
    }

    pub fn parent(&self) -> Option<Arc<dyn ChainParent>> {
        self.parent.lock().upgrade()
    }

    /// Report command completion to the enclosing chain.
    pub fn signal_command_completion(
        &self,
        command: CommandKind,
        result: Result<(), StreamError>,
    ) -> StreamResult<()> {
        match self.parent() {
            Some(parent) => {
                log::trace!("{}: completed {:?} with {:?}", self.name, command, result);
                parent.upchain_notification(UpstreamMessage::CommandCompleted { command, result })
            }
            None => {
                log::warn!("{}: command completion without a parent chain", self.name);
                Ok(())
            }
        }
    }

    /// True if any input of this unit is fed by a pushing chain.
    pub fn any_input_pushing(&self) -> bool {
        let connectors = self.connectors.lock().clone();
        connectors.iter().any(|c| match c {
            ConnectorHandle::Input(input) => input.is_pushing_chain().unwrap_or(false),
            ConnectorHandle::Output(_) => false,
        })
    }
}

fn weak_parent_none() -> Weak<dyn ChainParent> {
    // A Weak that never upgrades, without a dummy allocation.
    struct Never;
    impl ChainParent for Never {
        fn upchain_notification(&self, _message: UpstreamMessage) -> StreamResult<()> {
            Ok(())
        }
    }
    Weak::<Never>::new()
}

/// Object-safe interface of a streaming unit, dispatched from neighbors.
///
/// Default implementations cover the common cases; units override what
/// their connectors actually use. Entry points a unit does not offer
/// return [`StreamError::Unsupported`].
pub trait StreamUnit: Send + Sync {
    fn base(&self) -> &UnitBase;

    //
    // Command protocol (three phases, driven by the proxy)
    //

    /// Set up the transitional state. No long-running work.
    fn prepare_command(&self, _command: &StreamCommand, target: StreamState) -> StreamResult<()> {
        self.base().set_state(target);
        Ok(())
    }

    /// Start command execution; completion is signalled upchain, possibly
    /// asynchronously.
    fn begin_command(&self, command: &StreamCommand) -> StreamResult<()> {
        self.base()
            .signal_command_completion(command.kind(), Ok(()))
    }

    /// Settle into the new steady state.
    fn complete_command(&self, _command: CommandKind, target: StreamState) -> StreamResult<()> {
        self.base().set_state(target);
        Ok(())
    }

    fn state(&self) -> StreamState {
        self.base().state()
    }

    //
    // Data path
    //

    fn receive_packet(&self, _connector: ConnectorId, packet: PacketBox) -> PacketResult {
        Err(PacketRefused::new(packet, StreamError::Unsupported))
    }

    fn signal_packet_arrival(&self, _connector: ConnectorId, _count: usize) -> StreamResult<()> {
        Err(StreamError::Unsupported)
    }

    fn upstream_notification(
        &self,
        _connector: ConnectorId,
        _message: UpstreamMessage,
    ) -> StreamResult<()> {
        Err(StreamError::Unsupported)
    }

    fn receive_allocator(
        &self,
        _connector: ConnectorId,
        _pool: Arc<dyn MemoryPool>,
    ) -> StreamResult<()> {
        Err(StreamError::Unsupported)
    }

    //
    // Wiring
    //

    fn find_connector(&self, id: ConnectorId) -> StreamResult<ConnectorHandle> {
        self.base().connector(id)
    }

    fn set_parent(&self, parent: Weak<dyn ChainParent>) {
        self.base().set_parent(parent)
    }

    /// The clock owner propagates the chain clock top down; clock clients
    /// keep it, everyone else ignores it.
    fn propagate_clock(&self, _clock: &Arc<dyn StreamingClock>) -> StreamResult<()> {
        Ok(())
    }

    /// Called top down after all connections are established; used to
    /// provide allocators and cache cross-plug queries.
    fn complete_connection(&self) -> StreamResult<()> {
        Ok(())
    }

    fn stream_tag_ids(&self, _connector: ConnectorId) -> StreamResult<Vec<TagId>> {
        Ok(Vec::new())
    }

    fn is_pushing_chain(&self, _connector: ConnectorId) -> bool {
        self.base().any_input_pushing()
    }
}

pub type UnitRef = Arc<dyn StreamUnit>;

/// Host side of the pending-packet machinery: the unit behind an
/// [`Ingress`]. Implementations are the parser event sink and expose their
/// ingress state and input connector.
pub trait PacketProcessor: ParseEvents + Send + Sync {
    fn ingress(&self) -> &Ingress;
    fn ingress_input(&self) -> &InputConnector;
    fn unit_base(&self) -> &UnitBase;

    /// Unit-specific flush work (parser and formatter state).
    fn process_flushing(&self) -> StreamResult<()> {
        let ingress = self.ingress();
        let mut parser = ingress.parser.lock();
        parser.flush(self.as_parse_events())
    }

    /// Consume one pending packet. The default runs the packet parser;
    /// units with their own packet-level state machine override this.
    fn process_packet(&self, packet: &crate::StreamPacket) -> StreamResult<()> {
        let ingress = self.ingress();
        let mut parser = ingress.parser.lock();
        parser.parse(packet, self.as_parse_events())
    }

    /// Called after all input of one delivery has been consumed.
    fn low_latency_commit(&self) -> StreamResult<()> {
        Ok(())
    }

    /// Apply tag change sets that must be synchronized with stream
    /// processing.
    fn process_synchronized_tags(&self, _change_set: u32) -> StreamResult<()> {
        Ok(())
    }

    /// View of self as the parser event sink.
    fn as_parse_events(&self) -> &dyn ParseEvents;
}

/// Extension of [`PacketProcessor`] for units with their own thread.
pub trait ThreadedProcessor: PacketProcessor {
    /// Output-side work to do per thread iteration (e.g. delivery of
    /// produced data after an asynchronous completion).
    fn complete_output_processing(&self) -> StreamResult<()> {
        Ok(())
    }
}

/// Pending-packet state of a non-threaded (or threaded) streaming unit.
///
/// An interlocked entry counter ensures only one logical thread runs the
/// processing section; any colliding entrant flags a retry and leaves, so
/// drainage is guaranteed without recursion and without a blocking lock on
/// the ingress path.
pub struct Ingress {
    pending_lock: AtomicI32,
    process_request: AtomicBool,
    flush_request: AtomicBool,
    packet_bounced: AtomicBool,
    pending: Mutex<Option<PacketBox>>,
    parser: Mutex<PacketParser>,
    pending_change_set: AtomicU32,
}

impl Default for Ingress {
    fn default() -> Self {
        Self::new()
    }
}

impl Ingress {
    pub fn new() -> Self {
        Self {
            pending_lock: AtomicI32::new(0),
            process_request: AtomicBool::new(false),
            flush_request: AtomicBool::new(false),
            packet_bounced: AtomicBool::new(false),
            pending: Mutex::new(None),
            parser: Mutex::new(PacketParser::new()),
            pending_change_set: AtomicU32::new(0),
        }
    }

    pub fn parser(&self) -> &Mutex<PacketParser> {
        &self.parser
    }

    pub fn has_pending(&self) -> bool {
        self.pending.lock().is_some()
    }

    pub fn flush_requested(&self) -> bool {
        self.flush_request.load(Ordering::SeqCst)
    }

    /// Ask the next processing pass to flush. Threaded units wake their
    /// thread afterwards; non-threaded units call
    /// [`Self::process_pending`] directly.
    pub fn request_flush(&self) {
        self.flush_request.store(true, Ordering::SeqCst);
    }

    /// Queue tag change set bits to be applied synchronized with stream
    /// processing.
    pub fn merge_pending_changes(&self, change_set: u32) {
        self.pending_change_set.fetch_or(change_set, Ordering::SeqCst);
    }

    pub fn packet_bounced(&self) -> bool {
        self.packet_bounced.load(Ordering::SeqCst)
    }

    /// Mark that a packet bounced so the next drain re-requests delivery.
    pub fn set_packet_bounced(&self) {
        self.packet_bounced.store(true, Ordering::SeqCst);
    }

    /// Try to process the pending packet.
    ///
    /// Only one path of control may be inside the parsing section. We have
    /// to retry on collision, otherwise a packet request could get lost
    /// when a thread is rescheduled between a failed delivery and leaving
    /// the locked area.
    pub fn process_pending(
        &self,
        host: &(impl PacketProcessor + ?Sized),
        low_latency: bool,
    ) -> StreamResult<()> {
        let mut result = Ok(());
        self.process_request.store(true, Ordering::SeqCst);
        loop {
            if self.pending_lock.fetch_add(1, Ordering::SeqCst) == 0 {
                self.process_request.store(false, Ordering::SeqCst);
                if self.flush_request.load(Ordering::SeqCst) {
                    result = self.run_flush(host);
                } else {
                    result = self.run_parse(host, low_latency);
                }
            }
            let remaining = self.pending_lock.fetch_sub(1, Ordering::SeqCst) - 1;
            if !(remaining == 0 && self.process_request.load(Ordering::SeqCst)) {
                break;
            }
        }
        result
    }

    fn run_flush(&self, host: &(impl PacketProcessor + ?Sized)) -> StreamResult<()> {
        let result = host.process_flushing();
        if let Err(err) = host.ingress_input().flush_packets() {
            log::warn!("{}: flushing input failed: {err}", host.unit_base().name());
        }
        if let Some(mut packet) = self.pending.lock().take() {
            packet.release_ranges();
            packet.return_to_origin();
        }
        let completion = host
            .unit_base()
            .signal_command_completion(CommandKind::Flush, result);
        self.flush_request.store(false, Ordering::SeqCst);
        result.and(completion)
    }

    fn run_parse(
        &self,
        host: &(impl PacketProcessor + ?Sized),
        low_latency: bool,
    ) -> StreamResult<()> {
        let change_set = self.pending_change_set.swap(0, Ordering::SeqCst);
        if change_set != 0 {
            if let Err(err) = host.process_synchronized_tags(change_set) {
                log::warn!(
                    "{}: synchronized tag update failed: {err}",
                    host.unit_base().name()
                );
            }
        }

        let mut consumed = false;
        let mut result = Ok(());
        {
            let mut pending = self.pending.lock();
            if pending.is_some() {
                let parse_result = match pending.as_ref() {
                    Some(packet) => host.process_packet(packet),
                    None => Ok(()),
                };
                match parse_result {
                    Err(StreamError::ObjectFull) => {
                        // Input of a downstream stage is full; keep the
                        // packet pending and resume on the next signal.
                    }
                    other => {
                        if let Some(mut packet) = pending.take() {
                            packet.release_ranges();
                            packet.return_to_origin();
                        }
                        consumed = other.is_ok();
                        result = other;
                    }
                }
            }
        }

        if consumed && low_latency {
            result = result.and(host.low_latency_commit());
        }

        if self.packet_bounced() && !self.has_pending() {
            // Reset before requesting, otherwise every retry floods the
            // upstream units with packet requests.
            self.packet_bounced.store(false, Ordering::SeqCst);
            if let Err(err) = host.ingress_input().request_packets() {
                if err != StreamError::NotConnected {
                    log::warn!("{}: packet request failed: {err}", host.unit_base().name());
                }
            }
        }

        result
    }

    /// Standard ingress entry: make the new packet pending if the slot is
    /// free, otherwise bounce it with `ObjectFull`.
    pub fn receive_packet(
        &self,
        host: &(impl PacketProcessor + ?Sized),
        packet: PacketBox,
    ) -> PacketResult {
        self.packet_bounced.store(false, Ordering::SeqCst);

        // Process a possibly pending packet first.
        if let Err(err) = self.process_pending(host, false) {
            if err != StreamError::ObjectFull {
                return Err(PacketRefused::new(packet, err));
            }
        }

        // Set the bounce flag before the check to close the race with a
        // concurrent drain observing an empty slot.
        self.packet_bounced.store(true, Ordering::SeqCst);
        {
            let mut pending = self.pending.lock();
            if pending.is_some() {
                return Err(PacketRefused::new(packet, StreamError::ObjectFull));
            }
            self.packet_bounced.store(false, Ordering::SeqCst);
            *pending = Some(packet);
        }

        if let Err(err) = self.process_pending(host, true) {
            // The packet was consumed or returned; the failure travels
            // through command completion, not through the data path.
            log::warn!("{}: processing failed: {err}", host.unit_base().name());
        }
        Ok(())
    }

    /// Standard upstream notification handling: a packet request or a pool
    /// refill may let the pending packet through; everything else travels
    /// further upstream across the input plug.
    pub fn standard_upstream(
        &self,
        host: &(impl PacketProcessor + ?Sized),
        message: UpstreamMessage,
    ) -> StreamResult<()> {
        match message {
            UpstreamMessage::PacketRequest { .. } | UpstreamMessage::AllocatorBlocksAvailable => {
                let _ = self.process_pending(host, true);
                Ok(())
            }
            other => host.ingress_input().send_upstream(other),
        }
    }

    /// Standard begin phase: flush runs through the processing section (or
    /// the unit's thread); everything else completes immediately.
    pub fn standard_begin_command(
        &self,
        host: &(impl PacketProcessor + ?Sized),
        command: &StreamCommand,
    ) -> StreamResult<()> {
        match command.kind() {
            CommandKind::Flush => {
                self.request_flush();
                self.process_pending(host, false)
            }
            kind => host.unit_base().signal_command_completion(kind, Ok(())),
        }
    }

    /// Standard complete phase: entering `ready` kicks a drain so data
    /// bounced during the transition flows again.
    pub fn standard_complete_command(
        &self,
        host: &(impl PacketProcessor + ?Sized),
        target: StreamState,
    ) -> StreamResult<()> {
        host.unit_base().set_state(target);
        if target == StreamState::Ready {
            self.set_packet_bounced();
            let _ = self.process_pending(host, false);
        }
        Ok(())
    }
}

/// Thread loop of a threaded streaming unit: drain pending input, keep the
/// input queue flowing, run output-side work, sleep on the signal.
pub fn threaded_ingress_loop(host: Weak<dyn ThreadedProcessor>, ctx: ThreadCtx) {
    // Nothing to do until data arrives (or is requested) the first time.
    ctx.wait();

    while !ctx.terminated() {
        let Some(host) = host.upgrade() else {
            break;
        };
        let ingress = host.ingress();

        if let Err(err) = ingress.process_pending(&*host, false) {
            log::warn!("{}: thread processing: {err}", host.unit_base().name());
        }
        if !ingress.has_pending() || !ingress.packet_bounced() {
            // All pending data was consumed; pull more from the queue.
            if let Err(err) = host.ingress_input().request_packets() {
                if err != StreamError::NotConnected {
                    log::warn!("{}: thread request: {err}", host.unit_base().name());
                }
            }
        }

        if !ingress.flush_requested() {
            if let Err(err) = host.complete_output_processing() {
                log::warn!("{}: output processing: {err}", host.unit_base().name());
            }
        }

        drop(host);
        ctx.wait();
    }
}
