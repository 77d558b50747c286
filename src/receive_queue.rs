use bytes::Bytes;
use rustc_hash::FxHashMap;

use crate::packet_id::PacketId;

/// Payloads that arrived ahead of the next expected id, waiting for the gap to close
#[derive(Debug, Default)]
pub struct ReceiveQueue {
    payloads: FxHashMap<PacketId, Bytes>,
}

impl ReceiveQueue {
    /// returns `false` if a payload with this id is buffered already
    pub fn insert(&mut self, id: PacketId, payload: Bytes) -> bool {
        if self.payloads.contains_key(&id) {
            return false;
        }
        self.payloads.insert(id, payload);
        true
    }

    /// Removes and returns the payload for `*expected` if it is buffered, advancing `expected` to
    ///  the following id. Calling this repeatedly drains the contiguous run of buffered payloads.
    pub fn pop_in_order(&mut self, expected: &mut PacketId) -> Option<Bytes> {
        let payload = self.payloads.remove(expected)?;
        *expected = expected.next();
        Some(payload)
    }

    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }

    pub fn clear(&mut self) {
        self.payloads.clear();
    }
}
