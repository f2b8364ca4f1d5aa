//! Notification messages travelling against the data flow.

use crate::{CommandKind, ConnectorId, StreamError};
use strom_primitives::{StreamTime, TickDuration};

/// Upstream notifications, sent from downstream units towards the source or
/// from a proxy to the application.
///
/// Boundary messages are only generated when the matching notification
/// request bit was set in the packet that carried the boundary.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UpstreamMessage {
    /// A downstream unit that bounced a packet is free again and wants more.
    PacketRequest { connector: ConnectorId },
    /// Packets are retrievable from a proxy output.
    PacketArrival { connector: ConnectorId, count: u32 },
    /// Streaming was interrupted because one input starved.
    Starving,
    /// A command finished on the chain.
    CommandCompleted {
        command: CommandKind,
        result: Result<(), StreamError>,
    },
    /// A segment start has been processed.
    SegmentStart { segment: u16 },
    /// First render time of the segment, in system time.
    SegmentStartTime { time: StreamTime },
    /// A segment has been completely processed.
    SegmentEnd { segment: u16 },
    /// A group start has been processed; `delta` is the elapsed time since
    /// the last timed message from the same input.
    GroupStart { group: u16, delta: TickDuration },
    /// A group end has been processed; `delta` as for [`Self::GroupStart`].
    GroupEnd { group: u16, delta: TickDuration },
    /// The chain has enough data buffered to start streaming.
    StartPossible,
    /// The chain's queues are full; streaming must be started now.
    StartRequired,
    /// A memory pool allocator has blocks available again.
    AllocatorBlocksAvailable,
    /// A data discontinuity was flushed through.
    DataDiscontinuityProcessed,
}

impl UpstreamMessage {
    /// True for the messages whose parameters carry render time
    /// (serialized in non-decreasing render time per input).
    pub fn is_timed(&self) -> bool {
        matches!(
            self,
            UpstreamMessage::SegmentStartTime { .. }
                | UpstreamMessage::GroupStart { .. }
                | UpstreamMessage::GroupEnd { .. }
        )
    }
}

/// Notifications from the stream mixer to one of its input units.
///
/// These are delivered through the input's message sink, which is backed by
/// a dedicated dispatcher thread so the mixer thread never blocks on an
/// upstream consumer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MixerMessage {
    /// Stopping of mixing for the input has finished.
    Stopped,
    /// Preparation of the input has finished (`begin` execution).
    Prepared,
    /// A single step has finished (`step` execution).
    Stepped { result: Result<(), StreamError> },
    /// Flushing of the input has finished (`flush` execution).
    Flushed,
    /// The mixer wants more data on this input.
    PacketRequest,
    /// No more data available on this input.
    Starvation,
    /// Enough data buffered for the input to allow `do`.
    StartPossible,
    /// Queues full; `do` is required.
    StartRequired,
    /// Trigger a resynchronisation round for this input.
    SyncRequest,
    /// A timed boundary notification that fell due at render time and must
    /// be forwarded upstream unmodified.
    Upstream(UpstreamMessage),
}
