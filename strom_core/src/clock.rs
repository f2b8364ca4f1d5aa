//! Interfaces of the per-chain streaming clock.
//!
//! The clock is owned by the chain's proxy and propagated down through the
//! graph during connection. Units that feed a continuously running renderer
//! register as clients; the clock computes a common start frame for all of
//! them and arbitrates mastership during playback.

use crate::StreamResult;
use std::sync::Weak;
use strom_primitives::{Speed, StreamTime, TickDuration};

/// Clock relative client id, assigned at registration.
pub type ClockClientId = u32;

/// Startup timing information provided by one client.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ClockStartupInfo {
    /// Stream time of the first available sample in the client's buffer.
    pub stream_start_time: StreamTime,
    pub stream_start_time_valid: bool,
    /// Duration of a single atomic frame in the client's renderer.
    pub render_frame_duration: TickDuration,
    /// System time of the next available frame start in the renderer.
    pub next_render_frame_time: StreamTime,
    /// Renderer frame number for the first available sample.
    pub next_render_frame_number: u32,
}

/// A unit participating in clock startup and synchronization.
pub trait ClockClient: Send + Sync {
    /// The clock announces the common startup frame. The client starts
    /// emitting its data at the given frame number.
    fn set_startup_frame(&self, frame_number: u32, start_time: StreamTime) -> StreamResult<()>;

    /// Current stream-time-minus-system-time offset of the client, speed
    /// adapted.
    fn current_stream_time_offset(&self) -> StreamResult<TickDuration>;
}

/// The per-chain rendezvous and master-selection service.
pub trait StreamingClock: Send + Sync {
    /// Register a client. All clients of one chain register exactly once,
    /// during connection completion.
    fn register_client(&self, client: Weak<dyn ClockClient>) -> ClockClientId;

    /// Arm the startup rendezvous; every client must report once via
    /// [`Self::report_startup`] before playback starts.
    fn begin_startup_sequence(&self, speed: Speed);

    /// Deliver one client's startup info. When the last pending client
    /// reports, the clock computes the common start frame and calls
    /// `set_startup_frame` on every client exactly once.
    fn report_startup(&self, id: ClockClientId, info: ClockStartupInfo) -> StreamResult<()>;

    /// Store this client's current system offset under the given priority
    /// (0 denotes "no opinion") and return the offset of the current
    /// master, i.e. the client with the highest priority.
    fn synchronize_client(
        &self,
        id: ClockClientId,
        priority: u32,
        system_offset: TickDuration,
    ) -> StreamResult<TickDuration>;

    /// Combined stream time offset over all clients: the maximum for
    /// forward playback, the minimum for reverse.
    fn current_stream_time_offset(&self) -> StreamResult<TickDuration>;
}
