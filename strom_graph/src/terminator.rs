//! Chain terminating sink units.
//!
//! A terminator consumes and discards the stream while honouring the
//! message contract: boundary notifications requested by the producer are
//! echoed upstream immediately, and `begin` fakes a `start_possible` so a
//! chain without a real renderer can still be started. Useful for tests and
//! for chains whose tail end is not (yet) populated.

use std::sync::{Arc, Weak};
use strom_core::parser::ParseEvents;
use strom_core::{
    ConnectorHandle, ConnectorId, Ingress, InputConnector, MemoryPool, PacketBox, PacketProcessor,
    PacketResult, StreamCommand, StreamResult, StreamTime, StreamUnit, Tag, TickDuration, UnitBase,
    UpstreamMessage,
};

/// Parse-and-discard sink for one stream.
pub struct TerminatorUnit {
    base: UnitBase,
    ingress: Ingress,
    input: Arc<InputConnector>,
}

impl TerminatorUnit {
    pub fn new(name: impl AsRef<str>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let input = InputConnector::unqueued(0, weak.clone() as Weak<dyn StreamUnit>);
            let base = UnitBase::new(name);
            base.add_connector(ConnectorHandle::Input(input.clone()));
            Self {
                base,
                ingress: Ingress::new(),
                input,
            }
        })
    }
}

impl PacketProcessor for TerminatorUnit {
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
}

impl StreamUnit for TerminatorUnit {
    fn base(&self) -> &UnitBase {
        &self.base
    }

    fn begin_command(&self, command: &StreamCommand) -> StreamResult<()> {
        if let StreamCommand::Begin { .. } = command {
            // Fake the signal that enough data was received to start; a
            // terminated chain never fills any queues.
            self.input.send_upstream(UpstreamMessage::StartPossible)?;
        }
        self.ingress.standard_begin_command(self, command)
    }

    fn complete_command(
        &self,
        _command: strom_core::CommandKind,
        target: strom_core::StreamState,
    ) -> StreamResult<()> {
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

    fn receive_allocator(
        &self,
        _connector: ConnectorId,
        pool: Arc<dyn MemoryPool>,
    ) -> StreamResult<()> {
        self.input.provide_allocator(pool)
    }
}

impl ParseEvents for TerminatorUnit {
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
        _group: u16,
        _notification: bool,
        _single_unit: bool,
    ) -> StreamResult<()> {
        // Group starts are reported by a non-terminated sibling output with
        // real timing; the first report wins upstream.
        Ok(())
    }
    fn parse_end_group(&self, group: u16, notification: bool) -> StreamResult<()> {
        if notification {
            // Report immediately to keep upstream group counters moving.
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
