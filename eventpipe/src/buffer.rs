//! A fixed-size per-thread arena of event records (§4.4, C1).
//!
//! The distilled spec describes a raw byte arena with pointer
//! arithmetic; this crate keeps the same budget-and-cursor discipline
//! but stores already-structured records rather than packed bytes —
//! the packing into wire bytes is `BlockSerializer`'s job (§4.5), and
//! keeping records structured here avoids a second parse pass during
//! drain. `used_bytes` still tracks the same quantity the byte arena
//! would have, so the capacity invariant is unchanged.

use eventpipe_wire::ActivityId;

/// Fixed per-record overhead counted against a buffer's capacity,
/// independent of payload size: metadata id, sequence, thread id,
/// timestamp, both activity ids, and the payload/stack length
/// prefixes that would precede them on the wire.
const RECORD_HEADER_BYTES: usize = 4 + 4 + 8 + 8 + 16 + 16 + 4 + 4;

#[derive(Clone, Debug)]
pub struct RawEventRecord {
    pub metadata_id: u32,
    pub sequence: u32,
    pub os_thread_id: u64,
    pub timestamp: i64,
    pub activity_id: ActivityId,
    pub related_activity_id: ActivityId,
    pub payload: Vec<u8>,
    pub stack: Vec<u64>,
}

impl RawEventRecord {
    fn wire_size(&self) -> usize {
        RECORD_HEADER_BYTES + self.payload.len() + self.stack.len() * 8
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BufferState {
    Writable,
    ReadOnly,
}

/// A single arena. One-way `Writable -> ReadOnly` transition.
pub struct Buffer {
    capacity_bytes: usize,
    used_bytes: usize,
    records: Vec<RawEventRecord>,
    read_cursor: usize,
    state: BufferState,
    pub created_at: i64,
}

impl Buffer {
    pub fn new(capacity_bytes: usize, created_at: i64) -> Self {
        Self {
            capacity_bytes,
            used_bytes: 0,
            records: Vec::new(),
            read_cursor: 0,
            state: BufferState::Writable,
            created_at,
        }
    }

    pub fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    /// Appends `record` if it fits. On failure the buffer is left
    /// completely unchanged (§4.4 invariant).
    pub fn try_append(&mut self, record: RawEventRecord) -> bool {
        if self.state != BufferState::Writable {
            return false;
        }
        let size = record.wire_size();
        if self.used_bytes + size > self.capacity_bytes {
            return false;
        }
        self.used_bytes += size;
        self.records.push(record);
        true
    }

    pub fn mark_read_only(&mut self) {
        self.state = BufferState::ReadOnly;
    }

    pub fn has_unread(&self) -> bool {
        self.read_cursor < self.records.len()
    }

    pub fn peek_timestamp(&self) -> Option<i64> {
        self.records.get(self.read_cursor).map(|r| r.timestamp)
    }

    /// Removes and returns the oldest unread record.
    pub fn pop_front(&mut self) -> Option<RawEventRecord> {
        if !self.has_unread() {
            return None;
        }
        let record = self.records[self.read_cursor].clone();
        self.read_cursor += 1;
        Some(record)
    }

    pub fn is_fully_drained(&self) -> bool {
        self.read_cursor >= self.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ts: i64, payload_len: usize) -> RawEventRecord {
        RawEventRecord {
            metadata_id: 1,
            sequence: 1,
            os_thread_id: 42,
            timestamp: ts,
            activity_id: ActivityId::NIL,
            related_activity_id: ActivityId::NIL,
            payload: vec![0u8; payload_len],
            stack: Vec::new(),
        }
    }

    #[test]
    fn append_fails_without_rollback_when_full() {
        let mut buf = Buffer::new(RECORD_HEADER_BYTES + 4, 0);
        assert!(buf.try_append(record(1, 4)));
        assert!(!buf.try_append(record(2, 4)));
        // First record is still there, untouched.
        assert_eq!(buf.peek_timestamp(), Some(1));
    }

    #[test]
    fn append_rejected_once_read_only() {
        let mut buf = Buffer::new(1024, 0);
        buf.mark_read_only();
        assert!(!buf.try_append(record(1, 4)));
    }

    #[test]
    fn drain_order_is_fifo() {
        let mut buf = Buffer::new(1024, 0);
        buf.try_append(record(10, 0));
        buf.try_append(record(20, 0));
        assert_eq!(buf.pop_front().unwrap().timestamp, 10);
        assert_eq!(buf.pop_front().unwrap().timestamp, 20);
        assert!(buf.pop_front().is_none());
        assert!(buf.is_fully_drained());
    }
}
