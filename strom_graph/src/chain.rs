//! Chain units: aggregation of child streaming units under the three phase
//! command protocol, with optional external connectors so a whole chain can
//! be nested as one unit inside another chain or under a proxy.

use parking_lot::Mutex;
use std::sync::{
    Arc, Weak,
    atomic::{AtomicI32, Ordering},
};
use strom_core::clock::StreamingClock;
use strom_core::{
    ChainParent, CommandKind, ConnectorHandle, ConnectorId, InputConnector, MemoryPool,
    OutputConnector, PacketBox, PacketRefused, PacketResult, StreamCommand, StreamError,
    StreamResult, StreamState, StreamUnit, TagId, UnitBase, UnitRef, UpstreamMessage, plug,
};

/// Completion counting for commands fanned out over child units.
///
/// Every participant (the forwarding unit included) is counted in before its
/// begin phase; the last completion report triggers the settle path.
pub(crate) struct CommandFanout {
    issued: AtomicI32,
    result: Mutex<Result<(), StreamError>>,
}

impl CommandFanout {
    pub fn new() -> Self {
        Self {
            issued: AtomicI32::new(0),
            result: Mutex::new(Ok(())),
        }
    }

    /// Count the forwarding unit itself in as a participant.
    pub fn add_participant(&self) {
        self.issued.fetch_add(1, Ordering::SeqCst);
        *self.result.lock() = Ok(());
    }

    pub fn forward_prepare(
        &self,
        children: &[UnitRef],
        command: &StreamCommand,
        target: StreamState,
    ) -> StreamResult<()> {
        for child in children {
            child.prepare_command(command, target)?;
        }
        Ok(())
    }

    pub fn forward_begin(&self, children: &[UnitRef], command: &StreamCommand) -> StreamResult<()> {
        for child in children {
            self.issued.fetch_add(1, Ordering::SeqCst);
            if let Err(err) = child.begin_command(command) {
                self.issued.fetch_sub(1, Ordering::SeqCst);
                return Err(err);
            }
        }
        Ok(())
    }

    pub fn forward_complete(
        &self,
        children: &[UnitRef],
        command: CommandKind,
        target: StreamState,
    ) -> StreamResult<()> {
        for child in children {
            child.complete_command(command, target)?;
        }
        Ok(())
    }

    /// Record one participant's completion. Returns the merged result when
    /// this was the last one, `None` while others are still pending.
    pub fn completed(&self, result: Result<(), StreamError>) -> Option<Result<(), StreamError>> {
        {
            let mut merged = self.result.lock();
            if merged.is_ok() && result.is_err() {
                *merged = result;
            }
        }
        if self.issued.fetch_sub(1, Ordering::SeqCst) == 1 {
            Some(*self.result.lock())
        } else {
            None
        }
    }
}

/// An external connector of a chain bridged onto a child connector.
enum ChainBridge {
    /// Chain input: packets received on `external` flow out of `internal`
    /// into a child unit; notifications travel back.
    Inbound {
        external: Arc<InputConnector>,
        internal: Arc<OutputConnector>,
    },
    /// Chain output: packets a child sends into `internal` flow out of
    /// `external` to whatever the chain is plugged into.
    Outbound {
        internal: Arc<InputConnector>,
        external: Arc<OutputConnector>,
    },
}

/// A directed subgraph of units operated as one unit.
pub struct ChainUnit {
    base: UnitBase,
    children: Mutex<Vec<UnitRef>>,
    fanout: CommandFanout,
    bridges: Mutex<Vec<ChainBridge>>,
    weak_self: Weak<ChainUnit>,
}

impl ChainUnit {
    pub fn new(name: impl AsRef<str>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            base: UnitBase::new(name),
            children: Mutex::new(Vec::new()),
            fanout: CommandFanout::new(),
            bridges: Mutex::new(Vec::new()),
            weak_self: weak.clone(),
        })
    }

    /// Register a child streaming unit; the chain becomes its parent.
    pub fn add_unit(&self, unit: UnitRef) -> usize {
        unit.set_parent(self.weak_self.clone() as Weak<dyn ChainParent>);
        let mut children = self.children.lock();
        children.push(unit);
        children.len() - 1
    }

    pub fn unit(&self, index: usize) -> StreamResult<UnitRef> {
        self.children
            .lock()
            .get(index)
            .cloned()
            .ok_or(StreamError::RangeViolation)
    }

    fn children(&self) -> Vec<UnitRef> {
        self.children.lock().clone()
    }

    /// Plug an output connector of one child into an input connector of
    /// another.
    pub fn plug_units(
        &self,
        source: usize,
        output: ConnectorId,
        dest: usize,
        input: ConnectorId,
    ) -> StreamResult<()> {
        let source = self.unit(source)?;
        let dest = self.unit(dest)?;
        match (source.find_connector(output)?, dest.find_connector(input)?) {
            (ConnectorHandle::Output(output), ConnectorHandle::Input(input)) => {
                plug(&output, &input)
            }
            _ => Err(StreamError::RangeViolation),
        }
    }

    /// Expose an input connector of a child as an external input of the
    /// chain. Returns the external connector id.
    pub fn expose_input(&self, unit: usize, input: ConnectorId) -> StreamResult<ConnectorId> {
        let child = self.unit(unit)?;
        let ConnectorHandle::Input(child_input) = child.find_connector(input)? else {
            return Err(StreamError::RangeViolation);
        };
        let unit_ref = self.weak_self.clone() as Weak<dyn StreamUnit>;
        let id = self.base.num_connectors() as ConnectorId;
        let external = InputConnector::unqueued(id, unit_ref.clone());
        // The internal side owns no packets; it only forwards.
        let internal = OutputConnector::new(0, id, unit_ref);
        plug(&internal, &child_input)?;
        self.base
            .add_connector(ConnectorHandle::Input(external.clone()));
        self.bridges.lock().push(ChainBridge::Inbound {
            external,
            internal,
        });
        Ok(id)
    }

    /// Expose an output connector of a child as an external output of the
    /// chain. Returns the external connector id.
    pub fn expose_output(
        &self,
        unit: usize,
        output: ConnectorId,
        num_packets: usize,
    ) -> StreamResult<ConnectorId> {
        let child = self.unit(unit)?;
        let ConnectorHandle::Output(child_output) = child.find_connector(output)? else {
            return Err(StreamError::RangeViolation);
        };
        let unit_ref = self.weak_self.clone() as Weak<dyn StreamUnit>;
        let id = self.base.num_connectors() as ConnectorId;
        let internal = InputConnector::unqueued(id, unit_ref.clone());
        let external = OutputConnector::new(num_packets, id, unit_ref);
        plug(&child_output, &internal)?;
        self.base
            .add_connector(ConnectorHandle::Output(external.clone()));
        self.bridges.lock().push(ChainBridge::Outbound {
            internal,
            external,
        });
        Ok(id)
    }

    fn bridge_for<'a>(
        bridges: &'a [ChainBridge],
        id: ConnectorId,
    ) -> StreamResult<&'a ChainBridge> {
        bridges
            .get(id as usize)
            .ok_or(StreamError::RangeViolation)
    }
}

impl StreamUnit for ChainUnit {
    fn base(&self) -> &UnitBase {
        &self.base
    }

    fn prepare_command(&self, command: &StreamCommand, target: StreamState) -> StreamResult<()> {
        self.base.set_state(target);
        self.fanout
            .forward_prepare(&self.children(), command, target)
    }

    fn begin_command(&self, command: &StreamCommand) -> StreamResult<()> {
        // Count this chain in as a participant of its own fanout.
        self.fanout.add_participant();
        let result = self.fanout.forward_begin(&self.children(), command);
        // The chain itself has nothing asynchronous to do; a forwarding
        // failure travels to the caller, not through the counter.
        if let Some(merged) = self.fanout.completed(Ok(())) {
            self.base
                .signal_command_completion(command.kind(), merged)?;
        }
        result
    }

    fn complete_command(&self, command: CommandKind, target: StreamState) -> StreamResult<()> {
        let result = self
            .fanout
            .forward_complete(&self.children(), command, target);
        self.base.set_state(target);
        result
    }

    fn receive_packet(&self, connector: ConnectorId, packet: PacketBox) -> PacketResult {
        let bridges = self.bridges.lock();
        match Self::bridge_for(&bridges, connector) {
            Ok(ChainBridge::Inbound { internal, .. }) => internal.send_packet(packet),
            Ok(ChainBridge::Outbound { external, .. }) => external.send_packet(packet),
            Err(err) => Err(PacketRefused::new(packet, err)),
        }
    }

    fn upstream_notification(
        &self,
        connector: ConnectorId,
        message: UpstreamMessage,
    ) -> StreamResult<()> {
        let bridges = self.bridges.lock();
        match Self::bridge_for(&bridges, connector)? {
            // A child sent upstream across an inbound bridge: leave the
            // chain through the external input.
            ChainBridge::Inbound { external, .. } => external.send_upstream(message),
            // Downstream of the chain sent upstream into an outbound
            // bridge: enter the chain towards the child output.
            ChainBridge::Outbound { internal, .. } => internal.send_upstream(message),
        }
    }

    fn receive_allocator(
        &self,
        connector: ConnectorId,
        pool: Arc<dyn MemoryPool>,
    ) -> StreamResult<()> {
        let bridges = self.bridges.lock();
        match Self::bridge_for(&bridges, connector)? {
            ChainBridge::Outbound { internal, .. } => internal.provide_allocator(pool),
            ChainBridge::Inbound { external, .. } => external.provide_allocator(pool),
        }
    }

    fn propagate_clock(&self, clock: &Arc<dyn StreamingClock>) -> StreamResult<()> {
        for child in self.children() {
            child.propagate_clock(clock)?;
        }
        Ok(())
    }

    fn complete_connection(&self) -> StreamResult<()> {
        for child in self.children() {
            child.complete_connection()?;
        }
        Ok(())
    }

    fn stream_tag_ids(&self, connector: ConnectorId) -> StreamResult<Vec<TagId>> {
        let bridges = self.bridges.lock();
        match Self::bridge_for(&bridges, connector)? {
            // Tag support of a chain input is whatever sits behind the
            // internal output's plug.
            ChainBridge::Inbound { internal, .. } => internal.stream_tag_ids(),
            // A child asking across an outbound bridge wants to know what
            // the chain's downstream neighbour supports.
            ChainBridge::Outbound { external, .. } => external.stream_tag_ids(),
        }
    }

    fn is_pushing_chain(&self, connector: ConnectorId) -> bool {
        let bridges = self.bridges.lock();
        match Self::bridge_for(&bridges, connector) {
            // Downstream asks at a chain output: the answer comes from the
            // child feeding the bridge.
            Ok(ChainBridge::Outbound { internal, .. }) => {
                internal.is_pushing_chain().unwrap_or(false)
            }
            // A child asks at a chain input: the answer comes from whatever
            // feeds the chain.
            Ok(ChainBridge::Inbound { external, .. }) => {
                external.is_pushing_chain().unwrap_or(false)
            }
            Err(_) => false,
        }
    }
}

impl ChainParent for ChainUnit {
    fn upchain_notification(&self, message: UpstreamMessage) -> StreamResult<()> {
        match message {
            UpstreamMessage::CommandCompleted { command, result } => {
                if let Some(merged) = self.fanout.completed(result) {
                    self.base.signal_command_completion(command, merged)?;
                }
                Ok(())
            }
            other => match self.base.parent() {
                Some(parent) => parent.upchain_notification(other),
                None => {
                    log::warn!(
                        "{}: upchain notification without a parent",
                        self.base.name()
                    );
                    Ok(())
                }
            },
        }
    }
}
