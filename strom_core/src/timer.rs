//! The message timer: one thread draining a due-time ordered queue of
//! scheduled upstream messages, plus the process-wide system tick clock.

use crate::{StreamResult, ThreadOptions, UnitThread, UpstreamMessage};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::{
    Arc, OnceLock,
    atomic::{AtomicU64, Ordering},
};
use std::time::{Duration, Instant};
use strom_primitives::{StreamTime, TICKS_PER_SECOND, TickDuration};

/// Current system time in 108 MHz ticks, monotone for the process lifetime.
pub fn system_time_now() -> StreamTime {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = *EPOCH.get_or_init(Instant::now);
    let elapsed = epoch.elapsed();
    let ticks = elapsed.as_secs() as i64 * TICKS_PER_SECOND
        + (elapsed.subsec_nanos() as i64 * TICKS_PER_SECOND / 1_000_000_000);
    StreamTime::from_ticks(ticks)
}

/// Identifier of a scheduled message, usable for cancellation.
pub type TimerId = u64;

/// A cloneable target for scheduled messages. The embedded id allows
/// cancelling everything bound for one sink.
#[derive(Clone)]
pub struct TimerSink {
    id: u64,
    tx: Sender<UpstreamMessage>,
}

impl TimerSink {
    pub fn id(&self) -> u64 {
        self.id
    }
}

struct ScheduledMessage {
    due: StreamTime,
    id: TimerId,
    sink: TimerSink,
    message: UpstreamMessage,
}

impl PartialEq for ScheduledMessage {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.id == other.id
    }
}
impl Eq for ScheduledMessage {}
impl PartialOrd for ScheduledMessage {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for ScheduledMessage {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed so the BinaryHeap pops the earliest due time first.
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.id.cmp(&self.id))
    }
}

struct TimerShared {
    queue: Mutex<BinaryHeap<ScheduledMessage>>,
    next_id: AtomicU64,
}

/// Scheduled delivery of upstream messages at absolute system times.
pub struct MessageTimer {
    shared: Arc<TimerShared>,
    thread: UnitThread,
}

impl MessageTimer {
    pub fn new() -> StreamResult<Self> {
        let shared = Arc::new(TimerShared {
            queue: Mutex::new(BinaryHeap::new()),
            next_id: AtomicU64::new(1),
        });
        let worker = shared.clone();
        let thread = UnitThread::spawn(ThreadOptions::named("strom-timer"), move |ctx| {
            while !ctx.terminated() {
                let now = system_time_now();
                let mut wait = None;
                loop {
                    let mut queue = worker.queue.lock();
                    match queue.peek() {
                        Some(entry) if entry.due <= now => {
                            let Some(entry) = queue.pop() else {
                                break;
                            };
                            drop(queue);
                            if entry.sink.tx.send(entry.message).is_err() {
                                log::debug!("timer sink {} is gone", entry.sink.id);
                            }
                        }
                        Some(entry) => {
                            wait = Some(entry.due - now);
                            break;
                        }
                        None => break,
                    }
                }
                match wait {
                    Some(duration) => {
                        ctx.wait_timeout(tick_duration_to_std(duration));
                    }
                    None => ctx.wait(),
                }
            }
        })?;
        Ok(Self { shared, thread })
    }

    /// Wrap a channel sender as a cancellable timer sink.
    pub fn sink(&self, tx: Sender<UpstreamMessage>) -> TimerSink {
        TimerSink {
            id: self.shared.next_id.fetch_add(1, Ordering::Relaxed),
            tx,
        }
    }

    /// Schedule `message` for delivery to `sink` at system time `due`.
    pub fn schedule(
        &self,
        due: StreamTime,
        sink: &TimerSink,
        message: UpstreamMessage,
    ) -> TimerId {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared.queue.lock().push(ScheduledMessage {
            due,
            id,
            sink: sink.clone(),
            message,
        });
        self.thread.wake();
        id
    }

    /// Cancel one scheduled message by id.
    pub fn cancel(&self, id: TimerId) {
        let mut queue = self.shared.queue.lock();
        let entries: Vec<ScheduledMessage> = queue.drain().filter(|e| e.id != id).collect();
        queue.extend(entries);
    }

    /// Cancel every scheduled message bound for the given sink.
    pub fn cancel_sink(&self, sink: &TimerSink) {
        let mut queue = self.shared.queue.lock();
        let entries: Vec<ScheduledMessage> =
            queue.drain().filter(|e| e.sink.id != sink.id).collect();
        queue.extend(entries);
    }

    pub fn pending(&self) -> usize {
        self.shared.queue.lock().len()
    }
}

fn tick_duration_to_std(duration: TickDuration) -> Duration {
    if duration.is_negative() {
        return Duration::ZERO;
    }
    Duration::from_nanos((duration.ticks() as u128 * 1_000_000_000 / TICKS_PER_SECOND as u128) as u64)
}

#[cfg(test)]
mod tests {
    use super::{MessageTimer, system_time_now};
    use crate::UpstreamMessage;
    use strom_primitives::TickDuration;

    #[test]
    fn messages_fire_in_due_order() {
        let timer = MessageTimer::new().expect("timer thread");
        let (tx, rx) = crossbeam_channel::unbounded();
        let sink = timer.sink(tx);

        let now = system_time_now();
        timer.schedule(
            now + TickDuration::from_millis(30),
            &sink,
            UpstreamMessage::StartRequired,
        );
        timer.schedule(
            now + TickDuration::from_millis(5),
            &sink,
            UpstreamMessage::StartPossible,
        );

        let first = rx
            .recv_timeout(std::time::Duration::from_secs(2))
            .expect("first message");
        let second = rx
            .recv_timeout(std::time::Duration::from_secs(2))
            .expect("second message");
        assert_eq!(first, UpstreamMessage::StartPossible);
        assert_eq!(second, UpstreamMessage::StartRequired);
    }

    #[test]
    fn cancel_by_sink_drops_everything() {
        let timer = MessageTimer::new().expect("timer thread");
        let (tx, rx) = crossbeam_channel::unbounded();
        let sink = timer.sink(tx);
        let now = system_time_now();
        timer.schedule(
            now + TickDuration::from_secs(5),
            &sink,
            UpstreamMessage::Starving,
        );
        timer.schedule(
            now + TickDuration::from_secs(6),
            &sink,
            UpstreamMessage::Starving,
        );
        assert_eq!(timer.pending(), 2);
        timer.cancel_sink(&sink);
        assert_eq!(timer.pending(), 0);
        assert!(rx.try_recv().is_err());
    }
}
