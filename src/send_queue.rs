use std::collections::VecDeque;
use bytes::Bytes;
use tokio::time::Instant;

use crate::packet_id::PacketId;

/// A DATA packet that was sent and is waiting for its ACK
#[derive(Debug)]
pub struct SendQueueEntry {
    pub id: PacketId,
    pub packet: Bytes,
    pub deadline: Instant,
    /// number of resends so far, i.e. 0 for a packet that was sent once
    pub attempts: u32,
}

impl SendQueueEntry {
    pub fn resend(&mut self, deadline: Instant) {
        self.deadline = deadline;
        self.attempts += 1;
    }
}

/// Unacknowledged packets in the order they were sent. Ids in the queue are consecutive, so the
///  queue stays small and a linear scan by id is cheap.
#[derive(Debug)]
pub struct SendQueue {
    entries: VecDeque<SendQueueEntry>,
    max_size: usize,
}

impl SendQueue {
    pub fn new(max_size: usize) -> SendQueue {
        SendQueue {
            entries: VecDeque::new(),
            max_size,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.max_size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// NB: shrinking the limit below the current length does not evict anything, it only blocks
    ///      new entries until ACKs have drained the queue
    pub fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
    }

    pub fn push(&mut self, entry: SendQueueEntry) {
        self.entries.push_back(entry);
    }

    pub fn remove(&mut self, id: PacketId) -> Option<SendQueueEntry> {
        let idx = self.entries.iter().position(|e| e.id == id)?;
        self.entries.remove(idx)
    }

    pub fn contains(&self, id: PacketId) -> bool {
        self.entries.iter().any(|e| e.id == id)
    }

    pub fn expired_mut(&mut self, now: Instant) -> impl Iterator<Item = &mut SendQueueEntry> {
        self.entries.iter_mut()
            .filter(move |e| e.deadline <= now)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
