use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::packet::{Packet, PacketKind, StreamId};
use crate::units::DataSize;

/// Holding area for packets waiting to be paced out.
///
/// One FIFO per [`PacketKind`], selected between in priority order: audio, retransmissions,
/// FEC, video, padding. Packets are never reordered within their class.
#[derive(Debug, Default)]
pub(crate) struct PacketQueue {
    /// One queue per kind, indexed by [`PacketKind::priority`].
    queues: [VecDeque<Packet>; 5],
    /// Number of queued packets per stream.
    streams: HashMap<StreamId, usize>,
    total: TotalQueue,
}

impl PacketQueue {
    pub fn push(&mut self, now: Instant, mut packet: Packet) {
        assert!(
            !packet.size.is_negative(),
            "packet size must not be negative: {}",
            packet.size
        );

        packet.enqueued_at = Some(now);

        self.total.increase(now, packet.size);
        *self.streams.entry(packet.stream_id).or_default() += 1;
        self.queues[packet.kind.priority()].push_back(packet);
    }

    /// The packet [`PacketQueue::pop`] would return.
    pub fn peek(&self) -> Option<&Packet> {
        self.queues.iter().find_map(|q| q.front())
    }

    pub fn pop(&mut self, now: Instant) -> Option<Packet> {
        let queue = self.queues.iter_mut().find(|q| !q.is_empty())?;

        let packet = queue.pop_front()?;
        self.forget(now, &packet);

        Some(packet)
    }

    /// Whether any audio is queued. Audio is unpaced and always goes first.
    pub fn has_unpaced(&self) -> bool {
        !self.queues[PacketKind::Audio.priority()].is_empty()
    }

    /// Remove every packet belonging to `stream_id`, across all kinds.
    ///
    /// Returns the number of bytes freed.
    pub fn remove_for_stream(&mut self, now: Instant, stream_id: StreamId) -> DataSize {
        if !self.streams.contains_key(&stream_id) {
            return DataSize::ZERO;
        }

        let mut removed = Vec::new();

        for queue in &mut self.queues {
            // Preserves the relative order of the packets kept.
            let (keep, drop): (VecDeque<_>, VecDeque<_>) =
                queue.drain(..).partition(|p| p.stream_id != stream_id);
            *queue = keep;
            removed.extend(drop);
        }

        let mut freed = DataSize::ZERO;
        for packet in &removed {
            self.forget(now, packet);
            freed += packet.size;
        }

        assert!(
            !self.streams.contains_key(&stream_id),
            "stream index out of sync after removing {stream_id}"
        );

        freed
    }

    /// Total bytes queued.
    pub fn size(&self) -> DataSize {
        self.total.unsent_size
    }

    pub fn packet_count(&self) -> usize {
        self.total.unsent_count
    }

    pub fn count_of(&self, kind: PacketKind) -> usize {
        self.queues[kind.priority()].len()
    }

    pub fn is_empty(&self) -> bool {
        self.total.unsent_count == 0
    }

    /// Enqueue time of the packet that has waited the longest.
    pub fn oldest_enqueue_time(&self) -> Option<Instant> {
        self.queues
            .iter()
            .filter_map(|q| q.front())
            .filter_map(|p| p.enqueued_at)
            .min()
    }

    /// Average time the currently queued packets have spent in the queue.
    pub fn average_queue_time(&self, now: Instant) -> Duration {
        if self.total.unsent_count == 0 {
            return Duration::ZERO;
        }

        self.total.queue_time_at(now) / (self.total.unsent_count as u32)
    }

    fn forget(&mut self, now: Instant, packet: &Packet) {
        let enqueued_at = packet.enqueued_at.unwrap_or(now);
        let queue_time = now.saturating_duration_since(enqueued_at);
        self.total.decrease(now, packet.size, queue_time);

        let Some(count) = self.streams.get_mut(&packet.stream_id) else {
            panic!("stream {} missing from queue index", packet.stream_id);
        };
        *count -= 1;
        if *count == 0 {
            self.streams.remove(&packet.stream_id);
        }

        let queued: usize = self.queues.iter().map(|q| q.len()).sum();
        assert_eq!(
            queued, self.total.unsent_count,
            "queue count out of sync with queue contents"
        );
    }
}

// Total queue time in buffer. This lovely drawing explains how to add more time.
//
// -time--------------------------------------------------------->
//
// +--------------+
// |              |
// +--------------+
//      +---------+                          Already
//      |         |                           queued
//      +---------+                         durations
//          +-----+
//          |     |
//          +-----+
//                       +-+
//                       | |         <-----  Add next
//                       +-+                  packet
//
//
//
// +--------------+--------+
// |              |@@@@@@@@|
// +--------------+--------+
//      +---------+--------+                 The @ is
//      |         |@@@@@@@@|                  what's
//      +---------+--------+                  added
//          +-----+--------+
//          |     |@@@@@@@@|
//          +-----+--------+
//                       +-+
//                       |@|
//                       +-+
#[derive(Debug, Default)]
struct TotalQueue {
    /// Number of unsent packets.
    unsent_count: usize,
    /// The data size of the unsent packets.
    unsent_size: DataSize,
    /// The total queue time of all the unsent packets, as of `last`.
    queue_time: Duration,
    /// When `queue_time` was last moved forward.
    last: Option<Instant>,
}

impl TotalQueue {
    fn move_time_forward(&mut self, now: Instant) {
        if let Some(last) = self.last {
            assert!(self.unsent_count > 0);
            let from_last = now.saturating_duration_since(last);
            self.queue_time += from_last * (self.unsent_count as u32);
            self.last = Some(now.max(last));
        } else {
            assert!(self.unsent_count == 0);
            assert!(self.unsent_size == DataSize::ZERO);
            assert!(self.queue_time == Duration::ZERO);
        }
    }

    fn queue_time_at(&self, now: Instant) -> Duration {
        let Some(last) = self.last else {
            return Duration::ZERO;
        };
        self.queue_time + now.saturating_duration_since(last) * (self.unsent_count as u32)
    }

    fn increase(&mut self, now: Instant, size: DataSize) {
        self.move_time_forward(now);
        self.unsent_count += 1;
        self.unsent_size += size;
        if self.last.is_none() {
            self.last = Some(now);
        }
    }

    fn decrease(&mut self, now: Instant, size: DataSize, queue_time: Duration) {
        self.move_time_forward(now);

        assert!(self.unsent_count > 0, "decrease on empty queue");
        self.unsent_count -= 1;
        self.unsent_size -= size;
        assert!(
            !self.unsent_size.is_negative(),
            "queued size out of sync: {}",
            self.unsent_size
        );

        self.queue_time = self.queue_time.saturating_sub(queue_time);

        if self.unsent_count == 0 {
            assert!(self.unsent_size == DataSize::ZERO);
            self.queue_time = Duration::ZERO;
            self.last = None;
        }
    }
}
