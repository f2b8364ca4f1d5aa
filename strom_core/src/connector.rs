//! Input and output connectors: the typed plug pairs between units.
//!
//! An output connector owns the pool of empty packets for its stream and
//! pushes packets into the plugged input connector. An input connector is
//! either unqueued (forwards synchronously into its unit) or queued (bounded
//! FIFO with an arrival signal threshold). Upstream notifications and
//! allocators travel the opposite way across the same plug.

use crate::{
    MemoryPool, PacketBox, PacketPool, PacketRefused, PacketResult, StreamError, StreamResult,
    StreamUnit, TagId, UpstreamMessage,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};

/// Id of a connector, local to its unit. Connectors are indexed from 0.
pub type ConnectorId = u32;

struct InputQueue {
    packets: Mutex<VecDeque<PacketBox>>,
    capacity: usize,
    threshold: usize,
}

/// Input endpoint of a unit.
pub struct InputConnector {
    id: ConnectorId,
    unit: Weak<dyn StreamUnit>,
    queue: Option<InputQueue>,
    peer: Mutex<Weak<OutputConnector>>,
}

impl InputConnector {
    /// An input that forwards packets synchronously into its unit.
    pub fn unqueued(id: ConnectorId, unit: Weak<dyn StreamUnit>) -> Arc<Self> {
        Arc::new(Self {
            id,
            unit,
            queue: None,
            peer: Mutex::new(Weak::new()),
        })
    }

    /// An input with a bounded FIFO. `threshold` is the fill level at which
    /// the unit's `signal_packet_arrival` fires.
    pub fn queued(
        id: ConnectorId,
        unit: Weak<dyn StreamUnit>,
        capacity: usize,
        threshold: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            unit,
            queue: Some(InputQueue {
                packets: Mutex::new(VecDeque::with_capacity(capacity)),
                capacity,
                threshold: threshold.max(1),
            }),
            peer: Mutex::new(Weak::new()),
        })
    }

    pub fn id(&self) -> ConnectorId {
        self.id
    }

    pub fn is_queued(&self) -> bool {
        self.queue.is_some()
    }

    fn unit(&self) -> StreamResult<Arc<dyn StreamUnit>> {
        self.unit.upgrade().ok_or(StreamError::NotConnected)
    }

    fn peer(&self) -> StreamResult<Arc<OutputConnector>> {
        self.peer.lock().upgrade().ok_or(StreamError::NotConnected)
    }

    /// Break the connection with the plugged output. Only legal while the
    /// chain is idle.
    pub fn unplug(&self) {
        if let Some(peer) = self.peer.lock().upgrade() {
            *peer.peer.lock() = Weak::new();
        }
        *self.peer.lock() = Weak::new();
    }

    /// Receive one packet. Queued inputs enqueue and return immediately;
    /// unqueued inputs return after downstream processing.
    pub fn receive_packet(&self, packet: PacketBox) -> PacketResult {
        match &self.queue {
            Some(queue) => {
                let fill = {
                    let mut packets = queue.packets.lock();
                    if packets.len() >= queue.capacity {
                        return Err(PacketRefused::new(packet, StreamError::ObjectFull));
                    }
                    packets.push_back(packet);
                    packets.len()
                };
                if fill >= queue.threshold {
                    if let Ok(unit) = self.unit() {
                        if let Err(err) = unit.signal_packet_arrival(self.id, fill) {
                            log::warn!("packet arrival signal failed on {}: {err}", self.id);
                        }
                    }
                }
                Ok(())
            }
            None => match self.unit() {
                Ok(unit) => unit.receive_packet(self.id, packet),
                Err(err) => Err(PacketRefused::new(packet, err)),
            },
        }
    }

    /// Ask for more packets. Queued packets are delivered to the unit in the
    /// caller's context first; when the queue runs dry (or there is no
    /// queue), the request travels upstream across the plug.
    pub fn request_packets(&self) -> StreamResult<()> {
        if let Some(queue) = &self.queue {
            loop {
                let Some(packet) = queue.packets.lock().pop_front() else {
                    break;
                };
                let unit = self.unit()?;
                if let Err(refused) = unit.receive_packet(self.id, packet) {
                    queue.packets.lock().push_front(refused.packet);
                    // The unit is saturated; it will re-request on drain.
                    return Ok(());
                }
            }
        }
        let peer = self.peer()?;
        peer.upstream_notification(UpstreamMessage::PacketRequest {
            connector: peer.id(),
        })
    }

    /// Drop all queued packets, returning them to their originators.
    pub fn flush_packets(&self) -> StreamResult<()> {
        if let Some(queue) = &self.queue {
            let drained: Vec<PacketBox> = queue.packets.lock().drain(..).collect();
            for mut packet in drained {
                packet.release_ranges();
                packet.return_to_origin();
            }
        }
        Ok(())
    }

    /// Take one queued packet without processing it (proxy retrieval path).
    pub fn dequeue_packet(&self) -> StreamResult<PacketBox> {
        let queue = self.queue.as_ref().ok_or(StreamError::Unsupported)?;
        queue
            .packets
            .lock()
            .pop_front()
            .ok_or(StreamError::ObjectEmpty)
    }

    pub fn queued_packets(&self) -> usize {
        self.queue
            .as_ref()
            .map(|q| q.packets.lock().len())
            .unwrap_or(0)
    }

    /// Send an upstream notification across the plug.
    pub fn send_upstream(&self, message: UpstreamMessage) -> StreamResult<()> {
        self.peer()?.upstream_notification(message)
    }

    /// Push an allocator to the plugged output's unit.
    pub fn provide_allocator(&self, pool: Arc<dyn MemoryPool>) -> StreamResult<()> {
        let peer = self.peer()?;
        let unit = peer.unit()?;
        unit.receive_allocator(peer.id(), pool)
    }

    /// Whether the chain feeding this input is source driven.
    pub fn is_pushing_chain(&self) -> StreamResult<bool> {
        let peer = self.peer()?;
        let unit = peer.unit()?;
        Ok(unit.is_pushing_chain(peer.id()))
    }

    /// Stream tag ids supported behind this input (i.e. by this unit).
    pub fn stream_tag_ids(&self) -> StreamResult<Vec<TagId>> {
        self.unit()?.stream_tag_ids(self.id)
    }
}

/// Output endpoint of a unit; owns the empty-packet pool of its stream.
pub struct OutputConnector {
    id: ConnectorId,
    unit: Weak<dyn StreamUnit>,
    pool: PacketPool,
    peer: Mutex<Weak<InputConnector>>,
}

impl OutputConnector {
    pub fn new(num_packets: usize, id: ConnectorId, unit: Weak<dyn StreamUnit>) -> Arc<Self> {
        Arc::new(Self {
            id,
            unit,
            pool: PacketPool::new(num_packets),
            peer: Mutex::new(Weak::new()),
        })
    }

    pub fn id(&self) -> ConnectorId {
        self.id
    }

    fn unit(&self) -> StreamResult<Arc<dyn StreamUnit>> {
        self.unit.upgrade().ok_or(StreamError::NotConnected)
    }

    fn peer(&self) -> StreamResult<Arc<InputConnector>> {
        self.peer.lock().upgrade().ok_or(StreamError::NotConnected)
    }

    /// Pop an empty packet from the pool.
    pub fn get_empty_packet(&self) -> StreamResult<PacketBox> {
        self.pool.get_empty()
    }

    /// Number of empty packets left in the pool.
    pub fn empty_packets(&self) -> usize {
        self.pool.available()
    }

    /// Send one packet to the plugged input.
    pub fn send_packet(&self, packet: PacketBox) -> PacketResult {
        match self.peer() {
            Ok(peer) => peer.receive_packet(packet),
            Err(err) => Err(PacketRefused::new(packet, err)),
        }
    }

    /// Deliver an upstream notification from the plugged input to the unit
    /// of this output.
    pub fn upstream_notification(&self, message: UpstreamMessage) -> StreamResult<()> {
        self.unit()?.upstream_notification(self.id, message)
    }

    /// Stream tag ids supported downstream of this output, queried across
    /// the plug. Cached by formatters at connection completion time.
    pub fn stream_tag_ids(&self) -> StreamResult<Vec<TagId>> {
        self.peer()?.stream_tag_ids()
    }

    /// Whether the chain behind this output's unit is source driven.
    pub fn is_pushing_chain(&self) -> StreamResult<bool> {
        Ok(self.unit()?.is_pushing_chain(self.id))
    }
}

/// Plug an output connector into an input connector.
pub fn plug(output: &Arc<OutputConnector>, input: &Arc<InputConnector>) -> StreamResult<()> {
    let mut out_peer = output.peer.lock();
    let mut in_peer = input.peer.lock();
    if out_peer.upgrade().is_some() || in_peer.upgrade().is_some() {
        return Err(StreamError::InUse);
    }
    *out_peer = Arc::downgrade(input);
    *in_peer = Arc::downgrade(output);
    Ok(())
}
