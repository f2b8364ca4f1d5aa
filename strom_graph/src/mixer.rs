//! The stream mixer: an N-input, M-output frame-synchronous scheduler.
//!
//! The mixer sits above a pluggable [`FrameMixer`], the codec or platform
//! specific engine that assembles one output frame from per-input state.
//! A dedicated thread walks `packet allocation -> mix frame -> send frame`
//! and runs service passes over all inputs and outputs in between. Mixer
//! inputs terminate decoding chains; mixer outputs feed rendering chains
//! whose boundary feedback drives the render clock and the timed upstream
//! messages.

use crate::diagnostics::{self, MixerStats};
use crossbeam_channel::{Receiver, Sender, unbounded};
use ecow::EcoString;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use strom_core::clock::{ClockClient, ClockClientId, ClockStartupInfo, StreamingClock};
use strom_core::{
    CommandKind, ConnectorHandle, ConnectorId, FlushMode, InputConnector, MemoryPool, MixerMessage,
    OutputConnector, PacketBox, PacketFlags, PacketRefused, PacketResult, PoolAllocator, Speed,
    StreamCommand, StreamError, StreamPacket, StreamResult, StreamState, StreamTime, StreamUnit,
    Tag, TagId, ThreadCtx, ThreadOptions, TickDuration, UnitBase, UnitThread, UpstreamMessage,
};

/// Frames of a mixer input with this start frame are not considered for
/// mixing; the input is not scheduled.
pub const INFINITE_FRAME_NUMBER: u32 = u32::MAX;

/// Size of the pending-notification ring per input. Must be a power of 2.
const NOTIFICATION_QUEUE_SIZE: usize = 64;
/// A packet can enqueue at most this many notifications; fewer free slots
/// bounce the packet.
const NOTIFICATION_SLOTS_PER_PACKET: usize = 5;
/// A sync request goes out to every active input each time this many mixer
/// frames have elapsed.
const SYNC_REQUEST_FRAME_INTERVAL: u32 = 16;

/// Media type of a mixer input stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MixerInputType {
    Audio,
    Video,
    Subpicture,
    Other(u32),
}

/// Startup request a frame mixer can raise on reception of input data,
/// used during the streaming startup phase to generate the startup
/// messages that trigger the `do` command.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MixerStartupRequest {
    None,
    StartPossible,
    StartRequired,
}

/// Per-input feedback of one `mix_frame` call.
#[derive(Copy, Clone, Debug, Default)]
pub struct InputFeedback {
    /// The input is running low; request more data upstream.
    pub packet_request: bool,
    /// The input ran dry; mixing continued without it.
    pub starvation: bool,
}

/// The codec specific engine inside the stream mixer.
///
/// Frame mixers keep their own per-input decode state; the stream mixer
/// owns scheduling, timing and the message traffic.
pub trait FrameMixer: Send {
    /// A new input was registered under `input`.
    fn register_input(
        &mut self,
        input: usize,
        input_type: MixerInputType,
        free_parameter: u32,
    ) -> StreamResult<()>;

    /// Duration of one mixer output frame.
    fn frame_duration(&self) -> TickDuration;

    /// Consume one packet of input data. Ranges the mixer needs are
    /// re-referenced; the packet itself stays with the caller. Only the
    /// frame mixer can decide what amount of data triggers a start message.
    fn receive_input_packet(
        &mut self,
        input: usize,
        packet: &StreamPacket,
    ) -> StreamResult<MixerStartupRequest>;

    /// Mix one frame. Success means every provided packet was filled.
    fn mix_frame(
        &mut self,
        packets: &mut [Option<PacketBox>],
        feedback: &mut [InputFeedback],
    ) -> StreamResult<()>;

    /// A rendering chain provided its allocator for `output`.
    fn receive_allocator(&mut self, output: usize, pool: Arc<dyn MemoryPool>) -> StreamResult<()>;

    /// Prepare an input stream for mixing.
    fn prepare_stream(&mut self, input: usize) -> StreamResult<()>;

    /// Mixing for an input starts at the given mixer frame.
    fn start_stream(
        &mut self,
        input: usize,
        frame_number: u32,
        speed: Speed,
        start_time: StreamTime,
    ) -> StreamResult<()> {
        let _ = (input, frame_number, speed, start_time);
        Ok(())
    }

    /// Mixing for an input has stopped.
    fn stop_stream(&mut self, input: usize) -> StreamResult<()> {
        let _ = input;
        Ok(())
    }

    /// Advance an input stream by a number of frames.
    fn step_stream(&mut self, input: usize, num_frames: u32) -> StreamResult<()>;

    /// Drop all pending data of an input stream.
    fn flush_stream(&mut self, input: usize, mode: FlushMode) -> StreamResult<()>;

    fn stream_tag_ids(&self, input: usize) -> Vec<TagId>;
    fn configure_stream_tags(&mut self, input: usize, tags: &[Tag]) -> StreamResult<()>;
    fn update_stream_tags(&mut self, input: usize) -> StreamResult<()>;

    /// Renderer feedback: current render time and frame number.
    fn set_renderer_information(
        &mut self,
        render_time: StreamTime,
        render_frame: u32,
    ) -> StreamResult<()>;

    /// Current stream time at an input: the last timestamp seen, advanced
    /// by the frames consumed since.
    fn current_input_stream_time(&self, input: usize) -> StreamTime;

    fn begin_output(&mut self, output: usize) -> StreamResult<()>;
    fn flush_output(&mut self, output: usize) -> StreamResult<()>;
}

/// Output side counterpart of the mixer: where finished frames go and how
/// the output's unit hears about command completion.
pub trait MixerOutputPort: Send + Sync {
    fn get_empty_packet(&self) -> StreamResult<PacketBox>;
    fn send_packet(&self, packet: PacketBox) -> PacketResult;
    /// Done on behalf of the mixer thread; must not take long.
    fn mixer_notification(&self, message: MixerMessage) -> StreamResult<()>;
}

//
// Render-time triple buffer
//

/// Lock-free exchange of the current renderer frame/time pair.
///
/// The producer writes all five slots in order; the consumer retries until
/// two successive slots agree. This replaces a mutex that would invert
/// priorities between the renderer callback and the mixer thread.
struct RenderFrameTime {
    frame0: AtomicU32,
    time0: AtomicI64,
    frame1: AtomicU32,
    time1: AtomicI64,
    frame2: AtomicU32,
}

impl RenderFrameTime {
    fn new() -> Self {
        Self {
            frame0: AtomicU32::new(0),
            time0: AtomicI64::new(0),
            frame1: AtomicU32::new(0),
            time1: AtomicI64::new(0),
            frame2: AtomicU32::new(0),
        }
    }

    fn set(&self, time: StreamTime, frame: u32) {
        self.frame0.store(frame, Ordering::SeqCst);
        self.time0.store(time.ticks(), Ordering::SeqCst);
        self.frame1.store(frame, Ordering::SeqCst);
        self.time1.store(time.ticks(), Ordering::SeqCst);
        self.frame2.store(frame, Ordering::SeqCst);
    }

    fn get(&self) -> (StreamTime, u32) {
        loop {
            let frame2 = self.frame2.load(Ordering::SeqCst);
            let time1 = self.time1.load(Ordering::SeqCst);
            let frame1 = self.frame1.load(Ordering::SeqCst);
            let time0 = self.time0.load(Ordering::SeqCst);
            let frame0 = self.frame0.load(Ordering::SeqCst);
            if frame2 == frame1 {
                return (StreamTime::from_ticks(time1), frame1);
            }
            if frame1 == frame0 {
                return (StreamTime::from_ticks(time0), frame0);
            }
        }
    }
}

//
// Input and output nodes
//

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum MixDirection {
    Unknown,
    Forward,
    Backward,
}

/// Startup phase of one input while its chain is `ready`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum StartupState {
    /// Mixing is running (or was never prepared).
    Initial,
    NotEnoughData,
    #[allow(dead_code)]
    SufficientData,
    #[allow(dead_code)]
    Full,
}

struct InputNodeState {
    start_stream_time_valid: bool,
    start_stream_time: StreamTime,
    req_start_stream_time: StreamTime,
    start_frame_number: u32,
    frame_number: u32,
    speed: Speed,
    direction: MixDirection,

    command_stop: bool,
    command_resync: bool,
    command_prepare: bool,
    configure_pending: bool,

    starvation: bool,
    packet_request: bool,
    packet_bounced: bool,

    startup_state: StartupState,
    last_timed_message_time: StreamTime,
}

impl InputNodeState {
    fn new() -> Self {
        Self {
            start_stream_time_valid: false,
            start_stream_time: StreamTime::ZERO,
            req_start_stream_time: StreamTime::ZERO,
            start_frame_number: INFINITE_FRAME_NUMBER,
            frame_number: INFINITE_FRAME_NUMBER,
            speed: Speed::UNITY,
            direction: MixDirection::Unknown,
            command_stop: false,
            command_resync: false,
            command_prepare: false,
            configure_pending: false,
            starvation: false,
            packet_request: false,
            packet_bounced: true,
            startup_state: StartupState::Initial,
            last_timed_message_time: StreamTime::ZERO,
        }
    }
}

/// Pending timed boundary notifications of one input, delayed until the
/// corresponding render time has been reached.
struct NotificationRing {
    entries: VecDeque<(StreamTime, UpstreamMessage)>,
}

impl NotificationRing {
    fn new() -> Self {
        Self {
            entries: VecDeque::with_capacity(NOTIFICATION_QUEUE_SIZE),
        }
    }

    fn available(&self) -> usize {
        NOTIFICATION_QUEUE_SIZE - self.entries.len()
    }

    fn insert(&mut self, due: StreamTime, message: UpstreamMessage) -> StreamResult<()> {
        if self.entries.len() >= NOTIFICATION_QUEUE_SIZE {
            return Err(StreamError::ObjectFull);
        }
        self.entries.push_back((due, message));
        Ok(())
    }

    /// Pop the first message whose due time has been reached.
    fn first_due(&mut self, time: StreamTime, backward: bool) -> Option<UpstreamMessage> {
        let (due, _) = self.entries.front()?;
        let reached = if backward { *due >= time } else { *due <= time };
        if reached {
            self.entries.pop_front().map(|(_, message)| message)
        } else {
            None
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

struct MixerInputNode {
    sink: Sender<MixerMessage>,
    #[allow(dead_code)]
    input_type: MixerInputType,
    state: Mutex<InputNodeState>,
    notifications: Mutex<NotificationRing>,
    allocator: Mutex<Option<Arc<dyn MemoryPool>>>,
}

#[derive(Default)]
struct OutputNodeState {
    streaming: bool,
    first_output_packet: bool,
    render_started: bool,
    command_flush: bool,
    command_prepare: bool,
}

struct MixerOutputNode {
    port: Weak<dyn MixerOutputPort>,
    state: Mutex<OutputNodeState>,
}

//
// The stream mixer
//

pub struct StreamMixer {
    name: EcoString,
    frame_mixer: Mutex<Box<dyn FrameMixer>>,
    inputs: RwLock<Vec<Arc<MixerInputNode>>>,
    outputs: RwLock<Vec<Arc<MixerOutputNode>>>,
    streaming_outputs: AtomicUsize,
    mixer_frame_num: AtomicU32,
    mixer_frame_duration: Mutex<TickDuration>,
    render_time: RenderFrameTime,
    output_segment_number: AtomicU32,
    render_start_frame: AtomicU32,

    config_mutex: Mutex<()>,
    config_write_lock: AtomicBool,
    config_read_lock: AtomicBool,
    config_signal: strom_core::ThreadSignal,

    stats: Arc<MixerStats>,
    thread: Mutex<Option<UnitThread>>,
}

impl StreamMixer {
    pub fn new(
        name: impl AsRef<str>,
        frame_mixer: Box<dyn FrameMixer>,
        thread_options: ThreadOptions,
    ) -> StreamResult<Arc<Self>> {
        let duration = frame_mixer.frame_duration();
        let mixer = Arc::new(Self {
            name: EcoString::from(name.as_ref()),
            frame_mixer: Mutex::new(frame_mixer),
            inputs: RwLock::new(Vec::new()),
            outputs: RwLock::new(Vec::new()),
            streaming_outputs: AtomicUsize::new(0),
            mixer_frame_num: AtomicU32::new(0),
            mixer_frame_duration: Mutex::new(duration),
            render_time: RenderFrameTime::new(),
            output_segment_number: AtomicU32::new(0),
            render_start_frame: AtomicU32::new(0),
            config_mutex: Mutex::new(()),
            config_write_lock: AtomicBool::new(false),
            config_read_lock: AtomicBool::new(false),
            config_signal: strom_core::ThreadSignal::new(),
            stats: diagnostics::register_mixer(name.as_ref()),
            thread: Mutex::new(None),
        });

        let weak = Arc::downgrade(&mixer);
        let thread = UnitThread::spawn(thread_options, move |ctx| mixer_thread(weak, ctx))?;
        *mixer.thread.lock() = Some(thread);
        Ok(mixer)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn wake_thread(&self) {
        if let Some(thread) = self.thread.lock().as_ref() {
            thread.wake();
        }
    }

    fn input(&self, input: usize) -> StreamResult<Arc<MixerInputNode>> {
        self.inputs
            .read()
            .get(input)
            .cloned()
            .ok_or(StreamError::RangeViolation)
    }

    fn output(&self, output: usize) -> StreamResult<Arc<MixerOutputNode>> {
        self.outputs
            .read()
            .get(output)
            .cloned()
            .ok_or(StreamError::RangeViolation)
    }

    //
    // Registration
    //

    /// Register a mixer input. `sink` receives the mixer's notifications;
    /// it is drained by a dispatcher thread of the input unit so this
    /// mixer's thread never blocks on an upstream consumer.
    pub fn register_input(
        &self,
        sink: Sender<MixerMessage>,
        input_type: MixerInputType,
        free_parameter: u32,
    ) -> StreamResult<usize> {
        let mut inputs = self.inputs.write();
        let input_id = inputs.len();
        inputs.push(Arc::new(MixerInputNode {
            sink,
            input_type,
            state: Mutex::new(InputNodeState::new()),
            notifications: Mutex::new(NotificationRing::new()),
            allocator: Mutex::new(None),
        }));
        drop(inputs);

        let mut frame_mixer = self.frame_mixer.lock();
        frame_mixer.register_input(input_id, input_type, free_parameter)?;
        frame_mixer.prepare_stream(input_id)?;
        Ok(input_id)
    }

    pub fn register_output(&self, port: Weak<dyn MixerOutputPort>) -> usize {
        let mut outputs = self.outputs.write();
        outputs.push(Arc::new(MixerOutputNode {
            port,
            state: Mutex::new(OutputNodeState::default()),
        }));
        outputs.len() - 1
    }

    /// Allocator the decoding chain of `input` should allocate from.
    pub fn set_input_allocator(&self, input: usize, pool: Arc<dyn MemoryPool>) -> StreamResult<()> {
        *self.input(input)?.allocator.lock() = Some(pool);
        Ok(())
    }

    pub fn input_allocator(&self, input: usize) -> Option<Arc<dyn MemoryPool>> {
        self.input(input).ok().and_then(|n| n.allocator.lock().clone())
    }

    /// Allocator of the rendering chain behind `output`.
    pub fn receive_allocator(&self, output: usize, pool: Arc<dyn MemoryPool>) -> StreamResult<()> {
        self.frame_mixer.lock().receive_allocator(output, pool)
    }

    //
    // Output commands
    //

    pub fn prepare_output(&self, output: usize) -> StreamResult<()> {
        self.output(output)?.state.lock().command_prepare = true;
        self.wake_thread();
        Ok(())
    }

    pub fn flush_output(&self, output: usize) -> StreamResult<()> {
        self.output(output)?.state.lock().command_flush = true;
        self.wake_thread();
        Ok(())
    }

    //
    // Tag handling
    //

    /// Run a multi-stage tag configuration for one input under the config
    /// write lock. The mixer thread's tag update pass holds the read lock;
    /// a signal-driven loop keeps the two fair.
    pub fn configure_stream(
        &self,
        input: usize,
        configure: impl FnOnce(&mut dyn FrameMixer) -> StreamResult<()>,
    ) -> StreamResult<()> {
        let node = self.input(input)?;
        let _serialized = self.config_mutex.lock();

        self.config_write_lock.store(true, Ordering::SeqCst);
        while self.config_read_lock.load(Ordering::SeqCst) {
            // The mixer thread is mid-update; retry once it signals.
            self.config_write_lock.store(false, Ordering::SeqCst);
            self.config_signal.wait();
            self.config_write_lock.store(true, Ordering::SeqCst);
        }

        let result = configure(&mut **self.frame_mixer.lock());

        node.state.lock().configure_pending = true;
        self.config_write_lock.store(false, Ordering::SeqCst);
        self.wake_thread();
        result
    }

    pub fn stream_tag_ids(&self, input: usize) -> Vec<TagId> {
        self.frame_mixer.lock().stream_tag_ids(input)
    }

    //
    // Synchronisation startup handling
    //

    /// Startup timing information for one input, built from the render
    /// clock and the frame mixer's frame duration.
    pub fn stream_startup_info(&self, input: usize) -> StreamResult<ClockStartupInfo> {
        let node = self.input(input)?;
        let duration = self.frame_mixer.lock().frame_duration();
        *self.mixer_frame_duration.lock() = duration;

        let (render_time, render_frame) = self.render_time.get();
        // A few frames of headroom so the start frame is still in the
        // future once every client has reported.
        let next_frame_number = self.mixer_frame_num.load(Ordering::SeqCst).wrapping_add(4);
        let next_frame_time =
            render_time + duration * (next_frame_number.wrapping_sub(render_frame) as i64);

        let state = node.state.lock();
        Ok(ClockStartupInfo {
            stream_start_time: state.start_stream_time,
            stream_start_time_valid: state.start_stream_time_valid,
            render_frame_duration: duration,
            next_render_frame_time: next_frame_time,
            next_render_frame_number: next_frame_number,
        })
    }

    /// Current stream time offset of one input, relative to system time and
    /// adapted to its speed.
    pub fn stream_time_offset(&self, input: usize) -> StreamResult<TickDuration> {
        let node = self.input(input)?;
        let duration = *self.mixer_frame_duration.lock();
        let (render_time, render_frame) = self.render_time.get();

        let state = node.state.lock();
        let offset = if state.start_frame_number != INFINITE_FRAME_NUMBER {
            let frames = render_frame.wrapping_sub(state.start_frame_number) as i64;
            let rendered = match state.direction {
                MixDirection::Backward => render_time + duration * frames,
                _ => render_time - duration * frames,
            };
            state.start_stream_time - rendered.fract_mul(state.speed)
        } else {
            state.start_stream_time - render_time.fract_mul(state.speed)
        };
        Ok(offset)
    }

    /// Store a resync request; the mixer thread applies it at the next
    /// service pass.
    pub fn set_stream_time_offset(&self, input: usize, offset: TickDuration) -> StreamResult<()> {
        let node = self.input(input)?;
        let duration = *self.mixer_frame_duration.lock();
        let (render_time, render_frame) = self.render_time.get();

        let mut state = node.state.lock();
        if state.start_frame_number != INFINITE_FRAME_NUMBER
            && state.start_frame_number <= render_frame
        {
            let frames = render_frame.wrapping_sub(state.start_frame_number) as i64;
            let rendered = render_time - duration * frames;
            state.req_start_stream_time = rendered.fract_mul(state.speed) + offset;
            state.command_resync = true;
        } else if state.start_frame_number == INFINITE_FRAME_NUMBER {
            state.req_start_stream_time = StreamTime::ZERO + offset;
            state.command_resync = true;
        }
        Ok(())
    }

    //
    // Data flow control
    //

    /// Start mixing for one input. Called on behalf of the streaming clock
    /// once it has determined the common start frame.
    pub fn start_stream(
        &self,
        input: usize,
        mix_frame_number: u32,
        speed: Speed,
        start_time: StreamTime,
    ) -> StreamResult<()> {
        let node = self.input(input)?;
        let mut state = node.state.lock();
        state.startup_state = StartupState::Initial;
        state.speed = speed;
        state.start_frame_number = mix_frame_number;
        state.frame_number = mix_frame_number;
        state.start_stream_time_valid = true;
        state.start_stream_time = start_time;
        // Ask for buffers before the start frame needs them.
        state.packet_request = true;
        drop(state);
        self.frame_mixer
            .lock()
            .start_stream(input, mix_frame_number, speed, start_time)?;
        self.wake_thread();
        Ok(())
    }

    pub fn stop_stream(&self, input: usize) -> StreamResult<()> {
        self.input(input)?.state.lock().command_stop = true;
        self.wake_thread();
        Ok(())
    }

    pub fn prepare_stream(&self, input: usize, direction: i32) -> StreamResult<()> {
        let node = self.input(input)?;
        {
            let mut state = node.state.lock();
            // Preparation starts with the assumption of too little data.
            state.startup_state = StartupState::NotEnoughData;
            state.command_prepare = true;
            state.direction = match direction {
                1 => MixDirection::Forward,
                -1 => MixDirection::Backward,
                _ => {
                    state.direction = MixDirection::Unknown;
                    return Err(StreamError::InvalidDirection);
                }
            };
        }
        self.wake_thread();
        Ok(())
    }

    pub fn step_stream(&self, input: usize, num_frames: u32) -> StreamResult<()> {
        let node = self.input(input)?;
        let result = self.frame_mixer.lock().step_stream(input, num_frames);
        // The other streams have moved; inject a resync round.
        let _ = node.sink.send(MixerMessage::SyncRequest);
        let _ = node.sink.send(MixerMessage::Stepped { result });
        Ok(())
    }

    /// Flushing is synchronous; it assumes mixing for the input is already
    /// stopped.
    pub fn flush_stream(&self, input: usize, mode: FlushMode) -> StreamResult<()> {
        let node = self.input(input)?;
        node.notifications.lock().clear();
        self.frame_mixer.lock().flush_stream(input, mode)?;
        let _ = node.sink.send(MixerMessage::Flushed);
        Ok(())
    }

    /// Ingress of one input packet.
    pub fn receive_packet(&self, input: usize, packet: PacketBox) -> PacketResult {
        let node = match self.input(input) {
            Ok(node) => node,
            Err(err) => return Err(PacketRefused::new(packet, err)),
        };

        if node.notifications.lock().available() < NOTIFICATION_SLOTS_PER_PACKET {
            node.state.lock().packet_bounced = true;
            self.stats.packets_bounced.fetch_add(1, Ordering::Relaxed);
            self.wake_thread();
            return Err(PacketRefused::new(packet, StreamError::ObjectFull));
        }

        let flags = packet.flags;
        let (start_time, startup, receive_result, end_time) = {
            let mut frame_mixer = self.frame_mixer.lock();
            let start_time = if flags.contains(PacketFlags::START_TIME_VALID) {
                packet.start_time
            } else {
                frame_mixer.current_input_stream_time(input)
            };
            let result = frame_mixer.receive_input_packet(input, &packet);
            let end_time = if flags.contains(PacketFlags::END_TIME_VALID) {
                packet.end_time
            } else {
                frame_mixer.current_input_stream_time(input)
            };
            match result {
                Ok(startup) => (start_time, startup, Ok(()), end_time),
                Err(err) => (start_time, MixerStartupRequest::None, Err(err), end_time),
            }
        };

        match startup {
            MixerStartupRequest::None => {}
            MixerStartupRequest::StartPossible => {
                let _ = node.sink.send(MixerMessage::StartPossible);
            }
            MixerStartupRequest::StartRequired => {
                let _ = node.sink.send(MixerMessage::StartRequired);
            }
        }

        if let Err(err) = receive_result {
            self.wake_thread();
            return Err(PacketRefused::new(packet, err));
        }

        // Boundary notifications fire when their stream time is rendered,
        // not now; queue them against the input's notification ring.
        {
            let mut ring = node.notifications.lock();
            if flags.notifies(PacketFlags::SEGMENT_START, PacketFlags::SEGMENT_START_NOTIFICATION)
            {
                let _ = ring.insert(
                    start_time,
                    UpstreamMessage::SegmentStart {
                        segment: packet.segment_number,
                    },
                );
                // The presentation start time is unknown here; the real
                // time is patched in at emission.
                let _ = ring.insert(
                    start_time,
                    UpstreamMessage::SegmentStartTime {
                        time: StreamTime::ZERO,
                    },
                );
            }
            if flags.notifies(PacketFlags::GROUP_START, PacketFlags::GROUP_START_NOTIFICATION) {
                let _ = ring.insert(
                    start_time,
                    UpstreamMessage::GroupStart {
                        group: packet.group_number,
                        delta: TickDuration::ZERO,
                    },
                );
            }
            if flags.notifies(PacketFlags::GROUP_END, PacketFlags::GROUP_END_NOTIFICATION) {
                let _ = ring.insert(
                    end_time,
                    UpstreamMessage::GroupEnd {
                        group: packet.group_number,
                        delta: TickDuration::ZERO,
                    },
                );
            }
            if flags.notifies(PacketFlags::SEGMENT_END, PacketFlags::SEGMENT_END_NOTIFICATION) {
                let _ = ring.insert(
                    end_time,
                    UpstreamMessage::SegmentEnd {
                        segment: packet.segment_number,
                    },
                );
            }
        }

        let mut packet = packet;
        packet.release_ranges();
        packet.return_to_origin();
        self.wake_thread();
        Ok(())
    }

    //
    // Renderer feedback
    //

    fn set_render_frame_time(&self, render_time: StreamTime, render_frame: u32) {
        self.render_time.set(render_time, render_frame);
        if let Err(err) = self
            .frame_mixer
            .lock()
            .set_renderer_information(render_time, render_frame)
        {
            log::warn!("{}: renderer information rejected: {err}", self.name);
        }
    }

    /// Reconstruct the full mixer frame number from a 16-bit group number
    /// reported back by a renderer.
    fn widen_group_number(&self, group: u16) -> u32 {
        let frame = self.mixer_frame_num.load(Ordering::SeqCst);
        let mut upper = frame & 0xffff_0000;
        if (group as u32 & 0x8000) > (frame & 0x8000) {
            upper = upper.wrapping_sub(0x0001_0000);
        }
        upper.wrapping_add(group as u32)
    }

    /// Boundary feedback from one mixer output's rendering chain. The
    /// master output (id 0) drives the render clock and the emission of the
    /// timed upstream messages.
    pub fn output_notification(&self, output: usize, message: UpstreamMessage) -> StreamResult<()> {
        let is_master = output == 0;
        match message {
            UpstreamMessage::SegmentStartTime { time } => {
                if is_master {
                    let frame = self.render_start_frame.load(Ordering::SeqCst);
                    self.set_render_frame_time(time, frame);
                }
                if let Ok(node) = self.output(output) {
                    node.state.lock().render_started = true;
                }
                // The mixing thread may be waiting in its prepare pass.
                self.wake_thread();
            }
            UpstreamMessage::GroupStart { group, delta } => {
                if is_master && delta != TickDuration::ZERO {
                    let frame = self.widen_group_number(group);
                    let (time, _) = self.render_time.get();
                    self.set_render_frame_time(time + delta, frame);
                }
            }
            UpstreamMessage::GroupEnd { group, delta } => {
                if is_master {
                    let frame = self.widen_group_number(group);
                    let (time, _) = self.render_time.get();
                    self.set_render_frame_time(time + delta, frame.wrapping_add(1));
                }
            }
            UpstreamMessage::PacketRequest { .. } => {
                self.wake_thread();
            }
            _ => {}
        }

        if is_master && matches!(
            message,
            UpstreamMessage::GroupStart { .. }
                | UpstreamMessage::GroupEnd { .. }
                | UpstreamMessage::SegmentStart { .. }
                | UpstreamMessage::SegmentEnd { .. }
        ) {
            self.emit_due_notifications()?;
        }
        Ok(())
    }

    /// Walk every input's pending-notification ring and emit everything
    /// whose stream time has been rendered, rewriting the per-type timing
    /// parameters.
    fn emit_due_notifications(&self) -> StreamResult<()> {
        let inputs = self.inputs.read().clone();
        for (input_id, node) in inputs.iter().enumerate() {
            let (system_time, _) = self.render_time.get();
            let offset = self.stream_time_offset(input_id)?;
            let speed = node.state.lock().speed;
            let stream_time = system_time.fract_mul(speed) + offset;
            let backward = node.state.lock().direction == MixDirection::Backward;

            loop {
                let message = {
                    let mut ring = node.notifications.lock();
                    ring.first_due(stream_time, backward)
                };
                let Some(mut message) = message else {
                    break;
                };

                match &mut message {
                    UpstreamMessage::SegmentStartTime { time } => {
                        // Patch in the renderer's actual system time.
                        *time = system_time;
                    }
                    UpstreamMessage::GroupStart { delta, .. }
                    | UpstreamMessage::GroupEnd { delta, .. } => {
                        let last = node.state.lock().last_timed_message_time;
                        *delta = system_time - last;
                    }
                    _ => {}
                }
                node.state.lock().last_timed_message_time = system_time;

                if node.sink.send(MixerMessage::Upstream(message)).is_err() {
                    log::warn!("{}: input {input_id} sink is gone", self.name);
                    break;
                }
            }
        }
        Ok(())
    }
}

//
// The mixer thread
//

#[derive(Copy, Clone, PartialEq, Eq)]
enum MixState {
    PacketAllocation,
    MixFrame,
    SendFrame,
}

fn mixer_thread(mixer: Weak<StreamMixer>, ctx: ThreadCtx) {
    let mut mix_state = MixState::PacketAllocation;
    let mut packets: Vec<Option<PacketBox>> = Vec::new();
    let mut feedback: Vec<InputFeedback> = Vec::new();
    let mut num_ready = 0usize;
    // Reset whenever any forward progress is made; an idle loop sleeps on
    // the signal instead of spinning.
    let mut idled_loop = true;

    while !ctx.terminated() {
        if idled_loop {
            if mix_state == MixState::SendFrame && num_ready > 0 {
                // A send failed downstream; the packet request feedback is
                // the primary wake source, the timeout bounds a lost one.
                let backoff = mixer
                    .upgrade()
                    .map(|m| *m.mixer_frame_duration.lock())
                    .unwrap_or(TickDuration::from_millis(5));
                ctx.wait_timeout(Duration::from_millis(backoff.as_millis().max(1) as u64));
            } else {
                ctx.wait();
            }
        }
        let Some(mixer) = mixer.upgrade() else {
            break;
        };
        idled_loop = true;

        let outputs = mixer.outputs.read().clone();
        let inputs = mixer.inputs.read().clone();
        packets.resize_with(outputs.len(), || None);
        feedback.resize_with(inputs.len(), InputFeedback::default);

        //
        // The mix state machine; states fall through while progress holds.
        //
        'mix: loop {
            match mix_state {
                MixState::PacketAllocation => {
                    let streaming = mixer.streaming_outputs.load(Ordering::SeqCst);
                    if streaming == 0 {
                        break 'mix;
                    }
                    for (i, node) in outputs.iter().enumerate() {
                        let mut state = node.state.lock();
                        if packets[i].is_none() && state.streaming {
                            let Some(port) = node.port.upgrade() else {
                                continue;
                            };
                            match port.get_empty_packet() {
                                Ok(mut packet) => {
                                    idled_loop = false;
                                    num_ready += 1;

                                    packet.flags = PacketFlags::GROUP_START_NOTIFICATION
                                        | PacketFlags::GROUP_END_NOTIFICATION
                                        | PacketFlags::GROUP_START
                                        | PacketFlags::GROUP_END;
                                    if state.first_output_packet {
                                        packet.flags |= PacketFlags::SEGMENT_START_NOTIFICATION
                                            | PacketFlags::SEGMENT_START
                                            | PacketFlags::DATA_DISCONTINUITY;
                                        state.first_output_packet = false;
                                    }
                                    packet.segment_number = mixer
                                        .output_segment_number
                                        .load(Ordering::SeqCst)
                                        as u16;
                                    packet.group_number =
                                        mixer.mixer_frame_num.load(Ordering::SeqCst) as u16;
                                    packet.frame_start_flags = 1;
                                    packets[i] = Some(packet);
                                }
                                Err(_) => {
                                    log::trace!(
                                        "{}: no empty packet on output {i}, mixer stalls",
                                        mixer.name
                                    );
                                }
                            }
                        }
                    }
                    if num_ready == streaming {
                        mix_state = MixState::MixFrame;
                    } else {
                        break 'mix;
                    }
                }
                MixState::MixFrame => {
                    if mixer.streaming_outputs.load(Ordering::SeqCst) != 0 {
                        feedback.fill(InputFeedback::default());
                        let result = mixer
                            .frame_mixer
                            .lock()
                            .mix_frame(&mut packets, &mut feedback);
                        for (i, fb) in feedback.iter().enumerate() {
                            if fb.packet_request || fb.starvation {
                                let mut state = inputs[i].state.lock();
                                state.packet_request |= fb.packet_request;
                                state.starvation |= fb.starvation;
                            }
                        }
                        match result {
                            Ok(()) => {
                                idled_loop = false;
                                mix_state = MixState::SendFrame;
                            }
                            Err(_) => break 'mix,
                        }
                    } else {
                        mix_state = MixState::SendFrame;
                    }
                }
                MixState::SendFrame => {
                    for (i, node) in outputs.iter().enumerate() {
                        if let Some(packet) = packets[i].take() {
                            let Some(port) = node.port.upgrade() else {
                                num_ready -= 1;
                                continue;
                            };
                            match port.send_packet(packet) {
                                Ok(()) => {
                                    idled_loop = false;
                                    num_ready -= 1;
                                }
                                Err(refused) => {
                                    packets[i] = Some(refused.packet);
                                }
                            }
                        }
                    }
                    if num_ready == 0 {
                        idled_loop = false;
                        mixer.mixer_frame_num.fetch_add(1, Ordering::SeqCst);
                        mixer.stats.frames_mixed.fetch_add(1, Ordering::Relaxed);
                        mix_state = MixState::PacketAllocation;
                        break 'mix;
                    }
                    break 'mix;
                }
            }
        }

        //
        // Output state transitions happen in a safe state only: no packets
        // in flight.
        //
        if num_ready == 0 {
            for (i, node) in outputs.iter().enumerate() {
                let mut state = node.state.lock();
                if state.command_prepare {
                    if !state.streaming {
                        if let Err(err) = mixer.frame_mixer.lock().begin_output(i) {
                            log::error!("{}: begin output {i} failed: {err}", mixer.name);
                        }
                        state.streaming = true;
                        state.first_output_packet = true;
                        state.render_started = false;
                        mixer.streaming_outputs.fetch_add(1, Ordering::SeqCst);
                    }
                    state.command_prepare = false;
                    drop(state);
                    if let Some(port) = node.port.upgrade() {
                        let _ = port.mixer_notification(MixerMessage::Prepared);
                    }
                    idled_loop = false;
                } else if state.command_flush {
                    if let Err(err) = mixer.frame_mixer.lock().flush_output(i) {
                        log::error!("{}: flush output {i} failed: {err}", mixer.name);
                    }
                    if state.streaming {
                        state.streaming = false;
                        mixer.streaming_outputs.fetch_sub(1, Ordering::SeqCst);
                    }
                    state.command_flush = false;
                    drop(state);
                    if let Some(port) = node.port.upgrade() {
                        let _ = port.mixer_notification(MixerMessage::Flushed);
                    }
                    idled_loop = false;
                }
            }
        }

        //
        // Service pass over all inputs.
        //
        let frame_num = mixer.mixer_frame_num.load(Ordering::SeqCst);
        let frame_duration = *mixer.mixer_frame_duration.lock();
        for (input_id, node) in inputs.iter().enumerate() {
            let mut state = node.state.lock();

            // Periodic resynchronisation for active inputs.
            if frame_num % SYNC_REQUEST_FRAME_INTERVAL == 0
                && mix_state == MixState::PacketAllocation
                && state.frame_number != state.start_frame_number
                && state.start_frame_number != INFINITE_FRAME_NUMBER
            {
                let _ = node.sink.send(MixerMessage::SyncRequest);
            }

            if state.packet_request {
                idled_loop = false;
                state.packet_request = false;
                let _ = node.sink.send(MixerMessage::PacketRequest);
            }

            if state.starvation {
                idled_loop = false;
                state.starvation = false;
                mixer.stats.starvations.fetch_add(1, Ordering::Relaxed);
                let _ = node.sink.send(MixerMessage::Starvation);
            }

            if state.command_stop {
                idled_loop = false;
                state.command_stop = false;

                // Carry the stream time forward to the stop point so a
                // later restart resumes at the right position.
                if state.start_frame_number != INFINITE_FRAME_NUMBER {
                    let frames = frame_num.wrapping_sub(state.start_frame_number) as i64;
                    let advance = (frame_duration * frames).fract_mul(state.speed);
                    state.start_stream_time = match state.direction {
                        MixDirection::Backward => state.start_stream_time - advance,
                        _ => state.start_stream_time + advance,
                    };
                }
                state.start_frame_number = INFINITE_FRAME_NUMBER;
                state.frame_number = INFINITE_FRAME_NUMBER;
                state.speed = Speed::ZERO;
                drop(state);
                if let Err(err) = mixer.frame_mixer.lock().stop_stream(input_id) {
                    log::warn!("{}: stop of input {input_id} failed: {err}", mixer.name);
                }
                state = node.state.lock();
                let _ = node.sink.send(MixerMessage::Stopped);
            }

            if state.command_resync {
                idled_loop = false;
                state.start_stream_time = state.req_start_stream_time;
                state.command_resync = false;
            }

            if state.command_prepare {
                // Hold preparation until every output's renderer reported
                // its first segment start back.
                let all_started = outputs
                    .iter()
                    .all(|output| output.state.lock().render_started);
                if all_started {
                    state.command_prepare = false;
                    let _ = node.sink.send(MixerMessage::Prepared);
                    idled_loop = false;
                }
            }

            if state.configure_pending {
                // Read side of the tag configure lock pair.
                mixer.config_read_lock.store(true, Ordering::SeqCst);
                if !mixer.config_write_lock.load(Ordering::SeqCst) {
                    idled_loop = false;
                    drop(state);
                    if let Err(err) = mixer.frame_mixer.lock().update_stream_tags(input_id) {
                        log::warn!("{}: tag update failed: {err}", mixer.name);
                    }
                    node.state.lock().configure_pending = false;
                    mixer.config_read_lock.store(false, Ordering::SeqCst);
                    mixer.config_signal.set();
                    continue;
                }
                mixer.config_read_lock.store(false, Ordering::SeqCst);
                mixer.config_signal.set();
            }
        }
    }
}

//
// Mixer input unit
//

/// A streaming unit terminating a decoding chain at one mixer input.
///
/// Owns the dispatcher thread that forwards mixer notifications upstream
/// without blocking the mixer thread, and participates in the chain's
/// streaming clock as a client.
pub struct MixerInput {
    base: UnitBase,
    input: Arc<InputConnector>,
    mixer: Arc<StreamMixer>,
    input_id: usize,
    /// Clock priority during normal speed streaming.
    base_priority: u32,
    /// Clock priority during trick mode streaming.
    trick_priority: u32,

    clock: Mutex<Option<Arc<dyn StreamingClock>>>,
    clock_id: Mutex<Option<ClockClientId>>,
    previous_state: Mutex<StreamState>,
    pending_command: Mutex<Option<StreamCommand>>,
    speed: Mutex<Speed>,
    direction: Mutex<i32>,

    dispatcher: Mutex<Option<std::thread::JoinHandle<()>>>,
    shutdown: Mutex<Option<Sender<()>>>,
    weak_self: Weak<MixerInput>,
}

impl MixerInput {
    pub fn new(
        name: impl AsRef<str>,
        mixer: &Arc<StreamMixer>,
        input_type: MixerInputType,
        free_parameter: u32,
        base_priority: u32,
        trick_priority: u32,
    ) -> StreamResult<Arc<Self>> {
        let (sink_tx, sink_rx) = unbounded();
        let (shutdown_tx, shutdown_rx) = unbounded();
        let input_id = mixer.register_input(sink_tx, input_type, free_parameter)?;

        let unit = Arc::new_cyclic(|weak: &Weak<Self>| {
            let input = InputConnector::unqueued(0, weak.clone() as Weak<dyn StreamUnit>);
            let base = UnitBase::new(name);
            base.add_connector(ConnectorHandle::Input(input.clone()));
            Self {
                base,
                input,
                mixer: mixer.clone(),
                input_id,
                base_priority,
                trick_priority,
                clock: Mutex::new(None),
                clock_id: Mutex::new(None),
                previous_state: Mutex::new(StreamState::Idle),
                pending_command: Mutex::new(None),
                speed: Mutex::new(Speed::ZERO),
                direction: Mutex::new(1),
                dispatcher: Mutex::new(None),
                shutdown: Mutex::new(Some(shutdown_tx)),
                weak_self: weak.clone(),
            }
        });

        let weak = Arc::downgrade(&unit);
        let handle = std::thread::Builder::new()
            .name(format!("{}-dispatch", unit.base.name()))
            .spawn(move || dispatch_mixer_messages(weak, sink_rx, shutdown_rx))
            .map_err(|_| StreamError::NotEnoughMemory)?;
        *unit.dispatcher.lock() = Some(handle);
        Ok(unit)
    }

    pub fn input_id(&self) -> usize {
        self.input_id
    }

    /// Configure stream tags of this input under the mixer's configure
    /// lock protocol.
    pub fn configure_tags(&self, tags: &[Tag]) -> StreamResult<()> {
        let input = self.input_id;
        self.mixer
            .configure_stream(input, |frame_mixer| {
                frame_mixer.configure_stream_tags(input, tags)
            })
    }

    fn clock(&self) -> StreamResult<(Arc<dyn StreamingClock>, ClockClientId)> {
        let clock = self
            .clock
            .lock()
            .clone()
            .ok_or(StreamError::IncompleteConfiguration)?;
        let id = self
            .clock_id
            .lock()
            .clone()
            .ok_or(StreamError::IncompleteConfiguration)?;
        Ok((clock, id))
    }

    /// Handler of mixer notifications, running on the dispatcher thread.
    fn mixer_notification(&self, message: MixerMessage) -> StreamResult<()> {
        match message {
            MixerMessage::Stopped => match self.base.state() {
                StreamState::Stopping => {
                    let direction = *self.direction.lock();
                    self.mixer.prepare_stream(self.input_id, direction)
                }
                StreamState::Starting => {
                    let (clock, clock_id) = self.clock()?;
                    let info = self.mixer.stream_startup_info(self.input_id)?;
                    clock.report_startup(clock_id, info)
                }
                StreamState::Flushing => {
                    let mode = match *self.pending_command.lock() {
                        Some(StreamCommand::Flush { mode }) => mode,
                        _ => FlushMode::Reset,
                    };
                    self.mixer.flush_stream(self.input_id, mode)
                }
                _ => Ok(()),
            },
            MixerMessage::Prepared => self
                .base
                .signal_command_completion(CommandKind::Begin, Ok(())),
            MixerMessage::Stepped { result } => self
                .base
                .signal_command_completion(CommandKind::Step, result),
            MixerMessage::Flushed => self
                .base
                .signal_command_completion(CommandKind::Flush, Ok(())),
            MixerMessage::PacketRequest => self.input.request_packets(),
            MixerMessage::Starvation => {
                // Report the interruption and immediately pull for data.
                self.input.send_upstream(UpstreamMessage::Starving)?;
                self.input.request_packets()
            }
            MixerMessage::StartPossible => self.input.send_upstream(UpstreamMessage::StartPossible),
            MixerMessage::StartRequired => self.input.send_upstream(UpstreamMessage::StartRequired),
            MixerMessage::SyncRequest => {
                let state = self.base.state();
                if state != StreamState::Streaming && state != StreamState::Stepping {
                    return Ok(());
                }
                let (clock, clock_id) = self.clock()?;
                let offset = self.mixer.stream_time_offset(self.input_id)?;
                let speed = *self.speed.lock();
                let normal_playback = *self.direction.lock() == 1
                    && speed == Speed::UNITY
                    && state == StreamState::Streaming;
                let priority = if normal_playback {
                    self.base_priority
                } else {
                    self.trick_priority
                };
                let master_offset = clock.synchronize_client(clock_id, priority, offset)?;
                if master_offset != offset {
                    self.mixer
                        .set_stream_time_offset(self.input_id, master_offset)?;
                }
                Ok(())
            }
            MixerMessage::Upstream(message) => self.input.send_upstream(message),
        }
    }
}

fn dispatch_mixer_messages(
    unit: Weak<MixerInput>,
    messages: Receiver<MixerMessage>,
    shutdown: Receiver<()>,
) {
    loop {
        crossbeam_channel::select! {
            recv(messages) -> message => {
                let Ok(message) = message else { break };
                let Some(unit) = unit.upgrade() else { break };
                if let Err(err) = unit.mixer_notification(message) {
                    if !err.is_flow_control() {
                        log::warn!("{}: mixer notification failed: {err}", unit.base.name());
                    }
                }
            }
            recv(shutdown) -> _ => break,
        }
    }
}

impl Drop for MixerInput {
    fn drop(&mut self) {
        self.shutdown.lock().take();
        if let Some(handle) = self.dispatcher.lock().take() {
            if handle.thread().id() != std::thread::current().id() && handle.join().is_err() {
                log::error!("mixer input dispatcher panicked");
            }
        }
    }
}

impl StreamUnit for MixerInput {
    fn base(&self) -> &UnitBase {
        &self.base
    }

    fn prepare_command(&self, _command: &StreamCommand, target: StreamState) -> StreamResult<()> {
        *self.previous_state.lock() = self.base.state();
        self.base.set_state(target);
        Ok(())
    }

    fn begin_command(&self, command: &StreamCommand) -> StreamResult<()> {
        *self.pending_command.lock() = Some(*command);
        let previous = *self.previous_state.lock();
        match *command {
            StreamCommand::Begin { direction } => {
                *self.direction.lock() = direction;
                if self.base.state() == StreamState::Stopping {
                    self.mixer.stop_stream(self.input_id)
                } else {
                    self.mixer.prepare_stream(self.input_id, direction)
                }
            }
            StreamCommand::Do { speed } => {
                *self.speed.lock() = speed;
                if previous == StreamState::Streaming {
                    self.mixer.stop_stream(self.input_id)
                } else {
                    let (clock, clock_id) = self.clock()?;
                    let info = self.mixer.stream_startup_info(self.input_id)?;
                    clock.report_startup(clock_id, info)
                }
            }
            StreamCommand::Step { frames } => {
                self.mixer.step_stream(self.input_id, frames.unsigned_abs())
            }
            StreamCommand::Flush { mode } => {
                if previous == StreamState::Streaming {
                    self.mixer.stop_stream(self.input_id)
                } else {
                    self.mixer.flush_stream(self.input_id, mode)
                }
            }
        }
    }

    fn complete_command(&self, _command: CommandKind, target: StreamState) -> StreamResult<()> {
        self.base.set_state(target);
        if target == StreamState::Ready {
            match self.input.request_packets() {
                Ok(()) | Err(StreamError::NotConnected) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn receive_packet(&self, _connector: ConnectorId, packet: PacketBox) -> PacketResult {
        match self.mixer.receive_packet(self.input_id, packet) {
            Ok(()) => Ok(()),
            Err(refused) if refused.error == StreamError::ObjectFull => {
                // One immediate retry; the ring may have drained.
                self.mixer.receive_packet(self.input_id, refused.packet)
            }
            Err(refused) => Err(refused),
        }
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
        // Hand the decoding chain its allocator, if one was wired up.
        if let Some(pool) = self.mixer.input_allocator(self.input_id) {
            match self.input.provide_allocator(pool) {
                Ok(()) | Err(StreamError::NotConnected) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn stream_tag_ids(&self, _connector: ConnectorId) -> StreamResult<Vec<TagId>> {
        Ok(self.mixer.stream_tag_ids(self.input_id))
    }
}

impl ClockClient for MixerInput {
    fn set_startup_frame(&self, frame_number: u32, start_time: StreamTime) -> StreamResult<()> {
        let speed = *self.speed.lock();
        let result = self
            .mixer
            .start_stream(self.input_id, frame_number, speed, start_time);
        self.base
            .signal_command_completion(CommandKind::Do, result)?;
        result
    }

    fn current_stream_time_offset(&self) -> StreamResult<TickDuration> {
        self.mixer.stream_time_offset(self.input_id)
    }
}

//
// Mixer output unit
//

/// A streaming unit heading a rendering chain at one mixer output.
///
/// Owns the empty packet store the mixer thread draws from, forwards mixed
/// frames into the rendering chain, and routes the renderer's boundary
/// feedback and allocator back into the mixer.
pub struct MixerOutput {
    base: UnitBase,
    output: Arc<OutputConnector>,
    /// Store of empty packets to be filled and sent by the mixer thread.
    packet_store: strom_core::PacketPool,
    pool_allocator: Arc<PoolAllocator>,
    mixer: Arc<StreamMixer>,
    output_id: usize,
}

impl MixerOutput {
    pub fn new(
        name: impl AsRef<str>,
        mixer: &Arc<StreamMixer>,
        num_packets: usize,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let output = OutputConnector::new(0, 0, weak.clone() as Weak<dyn StreamUnit>);
            let base = UnitBase::new(name);
            base.add_connector(ConnectorHandle::Output(output.clone()));
            let output_id = mixer.register_output(weak.clone() as Weak<dyn MixerOutputPort>);
            Self {
                base,
                output,
                packet_store: strom_core::PacketPool::new(num_packets),
                pool_allocator: PoolAllocator::new(weak.clone() as Weak<dyn StreamUnit>, 0),
                mixer: mixer.clone(),
                output_id,
            }
        })
    }

    pub fn output_id(&self) -> usize {
        self.output_id
    }
}

impl MixerOutputPort for MixerOutput {
    fn get_empty_packet(&self) -> StreamResult<PacketBox> {
        self.packet_store.get_empty()
    }

    fn send_packet(&self, packet: PacketBox) -> PacketResult {
        self.output.send_packet(packet)
    }

    fn mixer_notification(&self, message: MixerMessage) -> StreamResult<()> {
        match message {
            MixerMessage::Prepared => self
                .base
                .signal_command_completion(CommandKind::Begin, Ok(())),
            MixerMessage::Flushed => self
                .base
                .signal_command_completion(CommandKind::Flush, Ok(())),
            _ => Ok(()),
        }
    }
}

impl StreamUnit for MixerOutput {
    fn base(&self) -> &UnitBase {
        &self.base
    }

    fn begin_command(&self, command: &StreamCommand) -> StreamResult<()> {
        match command {
            StreamCommand::Begin { .. } => self.mixer.prepare_output(self.output_id),
            StreamCommand::Flush { .. } => self.mixer.flush_output(self.output_id),
            _ => self
                .base
                .signal_command_completion(command.kind(), Ok(())),
        }
    }

    fn upstream_notification(
        &self,
        _connector: ConnectorId,
        message: UpstreamMessage,
    ) -> StreamResult<()> {
        match message {
            UpstreamMessage::StartPossible | UpstreamMessage::StartRequired => {
                // Straight up the chain so the application can issue `do`.
                match self.base.parent() {
                    Some(parent) => parent.upchain_notification(message),
                    None => Ok(()),
                }
            }
            UpstreamMessage::PacketRequest { .. } | UpstreamMessage::AllocatorBlocksAvailable => {
                // Either way the mixer can try to produce again.
                self.mixer.output_notification(
                    self.output_id,
                    UpstreamMessage::PacketRequest { connector: 0 },
                )
            }
            UpstreamMessage::SegmentStart { .. }
            | UpstreamMessage::SegmentStartTime { .. }
            | UpstreamMessage::SegmentEnd { .. }
            | UpstreamMessage::GroupStart { .. }
            | UpstreamMessage::GroupEnd { .. } => {
                self.mixer.output_notification(self.output_id, message)
            }
            UpstreamMessage::DataDiscontinuityProcessed => Ok(()),
            other => {
                log::debug!("{}: unhandled renderer message {other:?}", self.base.name());
                Ok(())
            }
        }
    }

    fn receive_allocator(
        &self,
        _connector: ConnectorId,
        pool: Arc<dyn MemoryPool>,
    ) -> StreamResult<()> {
        self.pool_allocator.set_pool(Some(pool.clone()));
        self.mixer.receive_allocator(self.output_id, pool)
    }
}
