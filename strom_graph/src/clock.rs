//! The per-chain streaming clock: startup rendezvous and ongoing
//! master/slave offset reconciliation.

use parking_lot::Mutex;
use std::sync::{
    Weak,
    atomic::{AtomicI32, Ordering},
};
use strom_core::clock::{ClockClient, ClockClientId, ClockStartupInfo, StreamingClock};
use strom_core::{Speed, StreamError, StreamResult, StreamTime, TickDuration};

/// Streams whose first sample lies further than this behind the common
/// start are outside the scope of one startup; their silence is clamped.
const STARTUP_SILENCE_HORIZON: TickDuration = TickDuration::from_secs(100);

struct ClientSlot {
    client: Weak<dyn ClockClient>,
    info: ClockStartupInfo,
    startup_silence: TickDuration,
    delay_frames: u32,
    system_offset: TickDuration,
    /// Stored priority plus one; zero denotes "no opinion yet".
    priority: u32,
}

/// The chain-wide clock, owned by the proxy and propagated to every unit
/// during connection completion.
pub struct StreamClock {
    clients: Mutex<Vec<ClientSlot>>,
    pending_clients: AtomicI32,
    speed: AtomicI32,
}

impl StreamClock {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(Vec::new()),
            pending_clients: AtomicI32::new(0),
            speed: AtomicI32::new(0),
        }
    }

    pub fn num_clients(&self) -> usize {
        self.clients.lock().len()
    }

    /// The startup rendezvous. Runs when the last pending client has
    /// reported; calls `set_startup_frame` on every client exactly once.
    fn run_startup_rendezvous(&self, speed: Speed) -> StreamResult<()> {
        let mut starts: Vec<(Weak<dyn ClockClient>, u32, StreamTime)> = Vec::new();
        {
            let mut clients = self.clients.lock();
            if clients.is_empty() {
                return Ok(());
            }

            // Find the first available sample in all of the streams.
            let mut first_stream_time = None;
            for slot in clients.iter() {
                if slot.info.stream_start_time_valid {
                    let t = slot.info.stream_start_time;
                    first_stream_time =
                        Some(first_stream_time.map_or(t, |f: StreamTime| f.min(t)));
                }
            }
            let first_stream_time = match first_stream_time {
                Some(t) => t,
                None => {
                    log::warn!("startup rendezvous without any valid stream start time");
                    clients
                        .last()
                        .map(|s| s.info.stream_start_time)
                        .unwrap_or(StreamTime::ZERO)
                }
            };

            // Clients without a valid start time adopt it, and every client
            // gets its channel startup silence: the render-time distance of
            // its first sample from the common first sample.
            for slot in clients.iter_mut() {
                if !slot.info.stream_start_time_valid {
                    slot.info.stream_start_time = first_stream_time;
                }
                let gap = slot.info.stream_start_time - first_stream_time;
                slot.startup_silence = if gap < STARTUP_SILENCE_HORIZON {
                    gap.fract_div(speed)
                } else {
                    STARTUP_SILENCE_HORIZON
                };
            }

            // The earliest moment every stream can start: a channel that
            // starts later may carry more startup latency without delaying
            // the whole startup, because its silence is not played.
            let mut common_start_frame_time =
                clients[0].info.next_render_frame_time - clients[0].startup_silence;
            for slot in clients.iter().skip(1) {
                let start = slot.info.next_render_frame_time - slot.startup_silence;
                if start > common_start_frame_time {
                    common_start_frame_time = start;
                }
            }

            // Quantize against the channel with the largest frame duration.
            let mut max_index = 0;
            for (i, slot) in clients.iter().enumerate().skip(1) {
                if slot.info.render_frame_duration
                    > clients[max_index].info.render_frame_duration
                {
                    max_index = i;
                }
            }

            {
                let max_client = &mut clients[max_index];
                let frame = max_client.info.render_frame_duration;
                let mut delay = common_start_frame_time + max_client.startup_silence
                    - max_client.info.next_render_frame_time;
                let mut frames = delay.frames(frame);
                if frame * frames < delay {
                    frames += 1;
                }
                delay = frame * frames;
                max_client.delay_frames = frames as u32;

                common_start_frame_time = max_client.info.next_render_frame_time + delay
                    - max_client.startup_silence;
            }
            let adapted_start_frame_time = common_start_frame_time;

            // Start frames for the other channels, rounded to the nearest
            // own frame: when more than half a frame remains, wait one more.
            for (i, slot) in clients.iter_mut().enumerate() {
                if i != max_index {
                    let frame = slot.info.render_frame_duration;
                    let delay = adapted_start_frame_time + slot.startup_silence
                        - slot.info.next_render_frame_time;
                    let mut frames = delay.frames(frame);

                    let start =
                        slot.info.next_render_frame_time + frame * frames - slot.startup_silence;
                    if (adapted_start_frame_time - start) * 2i64 > frame {
                        frames += 1;
                    }
                    slot.delay_frames = frames as u32;
                }
                starts.push((
                    slot.client.clone(),
                    slot.info.next_render_frame_number + slot.delay_frames,
                    slot.info.stream_start_time,
                ));
            }
        }

        // Trigger the startup of all channels outside the client table
        // lock; clients complete commands from inside this call.
        for (client, frame, start_time) in starts {
            if let Some(client) = client.upgrade() {
                client.set_startup_frame(frame, start_time)?;
            } else {
                log::warn!("clock client vanished before startup");
            }
        }
        Ok(())
    }
}

impl StreamingClock for StreamClock {
    fn register_client(&self, client: Weak<dyn ClockClient>) -> ClockClientId {
        let mut clients = self.clients.lock();
        clients.push(ClientSlot {
            client,
            info: ClockStartupInfo::default(),
            startup_silence: TickDuration::ZERO,
            delay_frames: 0,
            system_offset: TickDuration::ZERO,
            priority: 0,
        });
        (clients.len() - 1) as ClockClientId
    }

    fn begin_startup_sequence(&self, speed: Speed) {
        self.speed.store(speed.raw(), Ordering::SeqCst);
        let clients = self.clients.lock().len() as i32;
        self.pending_clients.store(clients, Ordering::SeqCst);
    }

    fn report_startup(&self, id: ClockClientId, info: ClockStartupInfo) -> StreamResult<()> {
        {
            let mut clients = self.clients.lock();
            let slot = clients
                .get_mut(id as usize)
                .ok_or(StreamError::RangeViolation)?;
            slot.info = info;
            slot.priority = 0;
        }

        // The last reporter runs the rendezvous.
        if self.pending_clients.fetch_sub(1, Ordering::SeqCst) == 1 {
            let speed = Speed(self.speed.load(Ordering::SeqCst));
            if speed.raw() > 0 {
                self.run_startup_rendezvous(speed)?;
            }
        }
        Ok(())
    }

    fn synchronize_client(
        &self,
        id: ClockClientId,
        priority: u32,
        system_offset: TickDuration,
    ) -> StreamResult<TickDuration> {
        let mut clients = self.clients.lock();
        let slot = clients
            .get_mut(id as usize)
            .ok_or(StreamError::RangeViolation)?;
        slot.system_offset = system_offset;
        // Avoid zero, which denotes a not yet defined offset.
        slot.priority = priority + 1;

        let mut master = 0;
        let mut best = clients[0].priority;
        for (i, slot) in clients.iter().enumerate().skip(1) {
            if slot.priority > best {
                best = slot.priority;
                master = i;
            }
        }
        Ok(clients[master].system_offset)
    }

    fn current_stream_time_offset(&self) -> StreamResult<TickDuration> {
        let clients: Vec<Weak<dyn ClockClient>> =
            self.clients.lock().iter().map(|s| s.client.clone()).collect();
        let forward = self.speed.load(Ordering::SeqCst) >= 0;

        let mut combined: Option<TickDuration> = None;
        for client in clients {
            let Some(client) = client.upgrade() else {
                continue;
            };
            let offset = client.current_stream_time_offset()?;
            combined = Some(match combined {
                None => offset,
                Some(current) if forward => current.max(offset),
                Some(current) => current.min(offset),
            });
        }
        combined.ok_or(StreamError::ObjectEmpty)
    }
}

#[cfg(test)]
mod tests {
    use super::StreamClock;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use strom_core::clock::{ClockClient, ClockStartupInfo, StreamingClock};
    use strom_core::{Speed, StreamResult, StreamTime, TickDuration};

    struct TestClient {
        startup: Mutex<Vec<(u32, StreamTime)>>,
        offset: TickDuration,
    }
    impl TestClient {
        fn new(offset_ms: i64) -> Arc<Self> {
            Arc::new(Self {
                startup: Mutex::new(Vec::new()),
                offset: TickDuration::from_millis(offset_ms),
            })
        }
    }
    impl ClockClient for TestClient {
        fn set_startup_frame(&self, frame_number: u32, start_time: StreamTime) -> StreamResult<()> {
            self.startup.lock().push((frame_number, start_time));
            Ok(())
        }
        fn current_stream_time_offset(&self) -> StreamResult<TickDuration> {
            Ok(self.offset)
        }
    }

    fn info(
        start_ms: Option<i64>,
        frame_us: i64,
        next_frame_ms: i64,
        next_frame_number: u32,
    ) -> ClockStartupInfo {
        ClockStartupInfo {
            stream_start_time: StreamTime::from_millis(start_ms.unwrap_or(0)),
            stream_start_time_valid: start_ms.is_some(),
            render_frame_duration: TickDuration::from_ticks(frame_us * 108),
            next_render_frame_time: StreamTime::from_millis(next_frame_ms),
            next_render_frame_number: next_frame_number,
        }
    }

    /// Three clients with frame durations 18.52 ms, 40 ms, 40 ms and stream
    /// starts T, T+10ms, T+25ms. The 40 ms clients win the quantization and
    /// every startup frame is called exactly once.
    #[test]
    fn rendezvous_schedules_every_client_once() {
        let clock = StreamClock::new();
        let audio = TestClient::new(0);
        let video_a = TestClient::new(0);
        let video_b = TestClient::new(0);

        let ids = [
            clock.register_client(Arc::downgrade(&audio) as _),
            clock.register_client(Arc::downgrade(&video_a) as _),
            clock.register_client(Arc::downgrade(&video_b) as _),
        ];

        clock.begin_startup_sequence(Speed::UNITY);
        clock
            .report_startup(ids[0], info(Some(1000), 18_520, 200, 10))
            .expect("first report");
        clock
            .report_startup(ids[1], info(Some(1010), 40_000, 210, 5))
            .expect("second report");
        assert!(audio.startup.lock().is_empty());
        clock
            .report_startup(ids[2], info(Some(1025), 40_000, 215, 7))
            .expect("last report triggers rendezvous");

        let a = audio.startup.lock();
        let va = video_a.startup.lock();
        let vb = video_b.startup.lock();
        assert_eq!((a.len(), va.len(), vb.len()), (1, 1, 1));
        // Clients start at or after their next available render frame.
        assert!(a[0].0 >= 10);
        assert!(va[0].0 >= 5);
        assert!(vb[0].0 >= 7);
        // Every client keeps its own stream start time.
        assert_eq!(a[0].1, StreamTime::from_millis(1000));
        assert_eq!(va[0].1, StreamTime::from_millis(1010));
        assert_eq!(vb[0].1, StreamTime::from_millis(1025));
    }

    #[test]
    fn highest_priority_client_is_master() {
        let clock = StreamClock::new();
        let a = TestClient::new(5);
        let b = TestClient::new(9);
        let id_a = clock.register_client(Arc::downgrade(&a) as _);
        let id_b = clock.register_client(Arc::downgrade(&b) as _);

        let off_a = TickDuration::from_millis(5);
        let off_b = TickDuration::from_millis(9);
        // First reporter is its own master.
        assert_eq!(clock.synchronize_client(id_a, 1, off_a), Ok(off_a));
        // A higher priority takes over.
        assert_eq!(clock.synchronize_client(id_b, 3, off_b), Ok(off_b));
        // The low priority client is steered towards the master offset.
        assert_eq!(clock.synchronize_client(id_a, 1, off_a), Ok(off_b));
    }

    #[test]
    fn aggregate_offset_follows_direction() {
        let clock = StreamClock::new();
        let a = TestClient::new(5);
        let b = TestClient::new(9);
        clock.register_client(Arc::downgrade(&a) as _);
        clock.register_client(Arc::downgrade(&b) as _);

        clock.begin_startup_sequence(Speed::UNITY);
        assert_eq!(
            clock.current_stream_time_offset(),
            Ok(TickDuration::from_millis(9))
        );
        clock.begin_startup_sequence(Speed(-0x10000));
        assert_eq!(
            clock.current_stream_time_offset(),
            Ok(TickDuration::from_millis(5))
        );
    }
}
