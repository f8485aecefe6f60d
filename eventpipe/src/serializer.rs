//! Binary block serializer (§4.5, §6.1, C7).
//!
//! Three block kinds (event, metadata, stack) share the same
//! header-compressed per-record encoding in format v4: a flags byte
//! says which fields differ from the previous record *in this
//! block*, absent fields are inherited, present fields are varints.
//! Format v3 instead emits a fixed-width record per event and carries
//! no cross-record state. The sequence-point block has its own fixed
//! layout (§6.1) and does not go through either per-record encoder.

use crate::buffer_manager::DrainedEvent;
use eventpipe_wire::{
    read_varint, read_varint_i64, write_varint, write_varint_i64, ActivityId, BlockHeader,
    BlockKind, EventFlags, FormatVersion, StreamHeader, STREAM_MAGIC,
};
use std::collections::HashMap;

/// Legacy object-serialization tag preceding the `"Trace"` name and
/// the `StreamHeader` fields (§6.1 preamble). The exact numeric value
/// is an implementation detail private to this crate's readers/writers.
const STREAM_OBJECT_TAG: u8 = 0x05;
const STREAM_OBJECT_NAME: &[u8] = b"Trace";
const STREAM_OBJECT_VERSION: (i32, i32) = (4, 0);

/// Builds the full preamble: magic, object tag + name + version ints,
/// then the fixed `StreamHeader` struct.
pub fn encode_stream_preamble(header: &StreamHeader) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(STREAM_MAGIC);
    out.push(STREAM_OBJECT_TAG);
    out.extend_from_slice(&(STREAM_OBJECT_NAME.len() as u32).to_le_bytes());
    out.extend_from_slice(STREAM_OBJECT_NAME);
    out.extend_from_slice(&STREAM_OBJECT_VERSION.0.to_le_bytes());
    out.extend_from_slice(&STREAM_OBJECT_VERSION.1.to_le_bytes());
    out.extend_from_slice(bytemuck::bytes_of(header));
    out
}

/// Terminal marker: a tag byte no `BlockKind` uses.
pub fn end_of_stream_marker() -> Vec<u8> {
    vec![END_OF_STREAM_TAG]
}

/// Tag byte written before every `<block-header><block-body>` pair.
/// Not part of `BlockHeader` itself (§6.1: "repeating `<block-tag>
/// <block-header> <block-body>`").
fn block_tag(kind: BlockKind) -> u8 {
    kind as u8
}

/// Sentinel tag terminating the stream, in place of a block tag.
pub const END_OF_STREAM_TAG: u8 = 0xFF;

const BLOCK_VERSION_V4: i32 = 2;
const BLOCK_MIN_READER_V4: i32 = 2;
const BLOCK_VERSION_V3: i32 = 1;
const BLOCK_MIN_READER_V3: i32 = 0;

fn wrap_block(kind: BlockKind, version: i32, min_reader_version: i32, body: Vec<u8>) -> Vec<u8> {
    let header = BlockHeader::new(version, min_reader_version, body.len() as i32);
    let mut out = Vec::with_capacity(1 + std::mem::size_of::<BlockHeader>() + body.len());
    out.push(block_tag(kind));
    out.extend_from_slice(bytemuck::bytes_of(&header));
    out.extend_from_slice(&body);
    out
}

/// One event, ready to be encoded: metadata id and stack id already
/// resolved, payload already trimmed/truncated if needed.
#[derive(Debug, Clone)]
pub struct EncodableRecord {
    pub metadata_id: u32,
    pub sequence: u32,
    pub capture_thread_id: u64,
    pub capture_proc_number: u32,
    pub thread_id: u64,
    pub stack_id: u32,
    pub timestamp: i64,
    pub activity_id: ActivityId,
    pub related_activity_id: ActivityId,
    pub payload: Vec<u8>,
    /// "No later record in this block has a smaller timestamp"
    /// (§4.5 sortedness invariant).
    pub sorted: bool,
}

/// Per-event-id metadata record, queued the first time a session
/// encounters that event, flushed in the `MetadataBlock` preceding
/// the `EventBlock` that first references it (§4.5, "metadata
/// precedes use").
#[derive(Debug, Clone)]
pub struct MetadataDescriptor {
    pub metadata_id: u32,
    pub provider_name: String,
    pub event_id: u32,
    pub event_version: u32,
    pub level: u8,
    pub keywords: u64,
}

/// Decoded form of one header-compressed record, produced by the
/// decoder used in tests and by the CLI's trace inspector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRecord {
    pub metadata_id: u32,
    pub sequence: u32,
    pub capture_thread_id: u64,
    pub capture_proc_number: u32,
    pub thread_id: u64,
    pub stack_id: u32,
    pub timestamp: i64,
    pub activity_id: ActivityId,
    pub related_activity_id: ActivityId,
    pub sorted: bool,
    pub payload: Vec<u8>,
}

/// Per-block decode/encode carry-over state. Resets at every block
/// boundary (§4.5: "On block transition, the 'previous' state
/// resets.").
#[derive(Default)]
struct PrevState {
    metadata_id: u32,
    sequence: u32,
    capture_thread_id: u64,
    capture_proc_number: u32,
    thread_id: u64,
    stack_id: u32,
    timestamp: i64,
    activity_id: ActivityId,
    related_activity_id: ActivityId,
    data_length: u32,
}

fn encode_record(prev: &mut PrevState, rec: &EncodableRecord, out: &mut Vec<u8>) {
    let mut flags = EventFlags::empty();
    let metadata_changed = rec.metadata_id != prev.metadata_id;
    let triple_changed = rec.sequence != prev.sequence
        || rec.capture_thread_id != prev.capture_thread_id
        || rec.capture_proc_number != prev.capture_proc_number;
    let thread_changed = rec.thread_id != prev.thread_id;
    let stack_changed = rec.stack_id != prev.stack_id;
    let activity_changed = rec.activity_id != prev.activity_id;
    let related_changed = rec.related_activity_id != prev.related_activity_id;
    let data_length = rec.payload.len() as u32;
    let data_length_changed = data_length != prev.data_length;

    if metadata_changed {
        flags.set(EventFlags::METADATA_ID);
    }
    if triple_changed {
        flags.set(EventFlags::SEQUENCE_TRIPLE);
    }
    if thread_changed {
        flags.set(EventFlags::THREAD_ID);
    }
    if stack_changed {
        flags.set(EventFlags::STACK_ID);
    }
    if activity_changed {
        flags.set(EventFlags::ACTIVITY_ID);
    }
    if related_changed {
        flags.set(EventFlags::RELATED_ACTIVITY_ID);
    }
    if rec.sorted {
        flags.set(EventFlags::SORTED);
    }
    if data_length_changed {
        flags.set(EventFlags::DATA_LENGTH);
    }

    out.push(flags.0);
    if metadata_changed {
        write_varint(out, rec.metadata_id as u64);
    }
    if triple_changed {
        write_varint(out, rec.sequence as u64);
        write_varint(out, rec.capture_thread_id);
        write_varint(out, rec.capture_proc_number as u64);
    }
    if thread_changed {
        write_varint(out, rec.thread_id);
    }
    if stack_changed {
        write_varint(out, rec.stack_id as u64);
    }
    write_varint_i64(out, rec.timestamp - prev.timestamp);
    if activity_changed {
        out.extend_from_slice(&rec.activity_id.0);
    }
    if related_changed {
        out.extend_from_slice(&rec.related_activity_id.0);
    }
    if data_length_changed {
        write_varint(out, data_length as u64);
    }
    out.extend_from_slice(&rec.payload);

    prev.metadata_id = rec.metadata_id;
    prev.sequence = rec.sequence;
    prev.capture_thread_id = rec.capture_thread_id;
    prev.capture_proc_number = rec.capture_proc_number;
    prev.thread_id = rec.thread_id;
    prev.stack_id = rec.stack_id;
    prev.timestamp = rec.timestamp;
    prev.activity_id = rec.activity_id;
    prev.related_activity_id = rec.related_activity_id;
    prev.data_length = data_length;
}

/// Decodes one record starting at `input[0]`. Returns the record and
/// the number of bytes consumed, or `None` on truncated input.
fn decode_record(prev: &mut PrevState, input: &[u8]) -> Option<(DecodedRecord, usize)> {
    let mut pos = 0usize;
    let flags = EventFlags(*input.get(pos)?);
    pos += 1;

    let metadata_id = if flags.contains(EventFlags::METADATA_ID) {
        let (v, n) = read_varint(&input[pos..])?;
        pos += n;
        v as u32
    } else {
        prev.metadata_id
    };
    let (sequence, capture_thread_id, capture_proc_number) =
        if flags.contains(EventFlags::SEQUENCE_TRIPLE) {
            let (seq, n1) = read_varint(&input[pos..])?;
            pos += n1;
            let (tid, n2) = read_varint(&input[pos..])?;
            pos += n2;
            let (proc, n3) = read_varint(&input[pos..])?;
            pos += n3;
            (seq as u32, tid, proc as u32)
        } else {
            (prev.sequence, prev.capture_thread_id, prev.capture_proc_number)
        };
    let thread_id = if flags.contains(EventFlags::THREAD_ID) {
        let (v, n) = read_varint(&input[pos..])?;
        pos += n;
        v
    } else {
        prev.thread_id
    };
    let stack_id = if flags.contains(EventFlags::STACK_ID) {
        let (v, n) = read_varint(&input[pos..])?;
        pos += n;
        v as u32
    } else {
        prev.stack_id
    };
    let (delta, n) = read_varint_i64(&input[pos..])?;
    pos += n;
    let timestamp = prev.timestamp + delta;

    let activity_id = if flags.contains(EventFlags::ACTIVITY_ID) {
        let bytes: [u8; 16] = input.get(pos..pos + 16)?.try_into().ok()?;
        pos += 16;
        ActivityId(bytes)
    } else {
        prev.activity_id
    };
    let related_activity_id = if flags.contains(EventFlags::RELATED_ACTIVITY_ID) {
        let bytes: [u8; 16] = input.get(pos..pos + 16)?.try_into().ok()?;
        pos += 16;
        ActivityId(bytes)
    } else {
        prev.related_activity_id
    };
    let data_length = if flags.contains(EventFlags::DATA_LENGTH) {
        let (v, n) = read_varint(&input[pos..])?;
        pos += n;
        v as u32
    } else {
        prev.data_length
    };
    let payload = input.get(pos..pos + data_length as usize)?.to_vec();
    pos += data_length as usize;

    prev.metadata_id = metadata_id;
    prev.sequence = sequence;
    prev.capture_thread_id = capture_thread_id;
    prev.capture_proc_number = capture_proc_number;
    prev.thread_id = thread_id;
    prev.stack_id = stack_id;
    prev.timestamp = timestamp;
    prev.activity_id = activity_id;
    prev.related_activity_id = related_activity_id;
    prev.data_length = data_length;

    Some((
        DecodedRecord {
            metadata_id,
            sequence,
            capture_thread_id,
            capture_proc_number,
            thread_id,
            stack_id,
            timestamp,
            activity_id,
            related_activity_id,
            sorted: flags.contains(EventFlags::SORTED),
            payload,
        },
        pos,
    ))
}

/// Decodes every record in a v4 `EventBlock`/`MetadataBlock` body
/// (the bytes after the `BlockHeader`, i.e. `payload_size` bytes).
pub fn decode_v4_block_body(body: &[u8]) -> Vec<DecodedRecord> {
    let mut prev = PrevState::default();
    let mut pos = 0;
    let mut out = Vec::new();
    while pos < body.len() {
        match decode_record(&mut prev, &body[pos..]) {
            Some((rec, consumed)) => {
                pos += consumed;
                out.push(rec);
            }
            None => break,
        }
    }
    out
}

/// Owns the cross-drain state a session's serializer must keep alive
/// for the lifetime of the stream: stack de-duplication (§8 property
/// 6) and the chosen wire format.
pub struct BlockSerializer {
    format: FormatVersion,
    stack_ids: HashMap<u64, u32>,
    next_stack_id: u32,
    pending_stacks: Vec<(u32, Vec<u64>)>,
}

impl BlockSerializer {
    pub fn new(format: FormatVersion) -> Self {
        Self {
            format,
            stack_ids: HashMap::new(),
            next_stack_id: 1,
            pending_stacks: Vec::new(),
        }
    }

    pub fn format(&self) -> FormatVersion {
        self.format
    }

    /// Hashes `frames` and returns its stable stack id, assigning a
    /// fresh one (and queuing it for the next `StackBlock`) the first
    /// time this exact frame sequence is seen in the stream. An empty
    /// stack is id 0 ("no stack"), never queued.
    pub fn resolve_stack_id(&mut self, frames: &[u64]) -> u32 {
        if frames.is_empty() {
            return 0;
        }
        let hash = hash_frames(frames);
        if let Some(&id) = self.stack_ids.get(&hash) {
            return id;
        }
        let id = self.next_stack_id;
        self.next_stack_id += 1;
        self.stack_ids.insert(hash, id);
        self.pending_stacks.push((id, frames.to_vec()));
        id
    }

    /// Encodes every `DrainedEvent` into one `EventBlock` (v4) or a
    /// sequence of fixed-layout records (v3). Events are assumed to
    /// already be in drain (timestamp) order; the caller resolves
    /// `stack_id` and `metadata_id` before building `EncodableRecord`s.
    pub fn encode_event_block(&self, records: &[EncodableRecord]) -> Vec<u8> {
        match self.format {
            FormatVersion::V4HeaderCompressed => {
                let mut body = Vec::new();
                let mut prev = PrevState::default();
                for rec in records {
                    encode_record(&mut prev, rec, &mut body);
                }
                wrap_block(BlockKind::Event, BLOCK_VERSION_V4, BLOCK_MIN_READER_V4, body)
            }
            FormatVersion::V3Legacy => {
                let mut body = Vec::new();
                for rec in records {
                    encode_v3_record(rec, &mut body);
                }
                wrap_block(BlockKind::Event, BLOCK_VERSION_V3, BLOCK_MIN_READER_V3, body)
            }
        }
    }

    /// Encodes queued `MetadataDescriptor`s (assigned, not yet
    /// emitted) as a `MetadataBlock`. `metadata_id` is always 0 on the
    /// wire per record; the descriptor's own id lives in the payload
    /// (§6.1, §4.5).
    pub fn encode_metadata_block(&self, descriptors: &[MetadataDescriptor]) -> Option<Vec<u8>> {
        if descriptors.is_empty() {
            return None;
        }
        let mut prev = PrevState::default();
        let mut body = Vec::new();
        for desc in descriptors {
            let payload = encode_metadata_descriptor(desc);
            let rec = EncodableRecord {
                metadata_id: 0,
                sequence: 0,
                capture_thread_id: 0,
                capture_proc_number: 0,
                thread_id: 0,
                stack_id: 0,
                timestamp: 0,
                activity_id: ActivityId::NIL,
                related_activity_id: ActivityId::NIL,
                payload,
                sorted: true,
            };
            match self.format {
                FormatVersion::V4HeaderCompressed => encode_record(&mut prev, &rec, &mut body),
                FormatVersion::V3Legacy => encode_v3_record(&rec, &mut body),
            }
        }
        Some(wrap_block(
            BlockKind::Metadata,
            BLOCK_VERSION_V4,
            BLOCK_MIN_READER_V4,
            body,
        ))
    }

    /// Drains and encodes every stack queued by `resolve_stack_id`
    /// since the last call.
    pub fn encode_stack_block(&mut self) -> Option<Vec<u8>> {
        if self.pending_stacks.is_empty() {
            return None;
        }
        let pending = std::mem::take(&mut self.pending_stacks);
        let initial_id = pending[0].0;
        let mut body = Vec::new();
        body.extend_from_slice(&initial_id.to_le_bytes());
        body.extend_from_slice(&(pending.len() as u32).to_le_bytes());
        for (_, frames) in &pending {
            let size = (frames.len() * 8) as u32;
            body.extend_from_slice(&size.to_le_bytes());
            for ip in frames {
                body.extend_from_slice(&ip.to_le_bytes());
            }
        }
        Some(wrap_block(BlockKind::Stack, BLOCK_VERSION_V4, BLOCK_MIN_READER_V4, body))
    }

    /// Encodes a `SequencePointBlock`: the drain timestamp plus every
    /// thread's next-expected sequence number (§4.5, §6.1).
    pub fn encode_sequence_point_block(
        &self,
        timestamp: i64,
        next_sequence_by_thread: &[(u64, u32)],
    ) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&timestamp.to_le_bytes());
        body.extend_from_slice(&(next_sequence_by_thread.len() as u32).to_le_bytes());
        for (thread_id, seq) in next_sequence_by_thread {
            body.extend_from_slice(&thread_id.to_le_bytes());
            body.extend_from_slice(&seq.to_le_bytes());
        }
        wrap_block(
            BlockKind::SequencePoint,
            BLOCK_VERSION_V4,
            BLOCK_MIN_READER_V4,
            body,
        )
    }
}

fn encode_metadata_descriptor(desc: &MetadataDescriptor) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&desc.metadata_id.to_le_bytes());
    for unit in desc.provider_name.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out.extend_from_slice(&0u16.to_le_bytes()); // UTF-16 null terminator
    out.extend_from_slice(&desc.event_id.to_le_bytes());
    out.extend_from_slice(&desc.event_version.to_le_bytes());
    out.push(desc.level);
    out.extend_from_slice(&desc.keywords.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // descriptor_count = 0 (§4.5 resolved)
    out
}

fn encode_v3_record(rec: &EncodableRecord, out: &mut Vec<u8>) {
    let start = out.len();
    out.extend_from_slice(&0i32.to_le_bytes()); // totalSize placeholder
    out.extend_from_slice(&rec.metadata_id.to_le_bytes());
    out.extend_from_slice(&(rec.thread_id as u32).to_le_bytes());
    out.extend_from_slice(&rec.timestamp.to_le_bytes());
    out.extend_from_slice(&rec.activity_id.0);
    out.extend_from_slice(&rec.related_activity_id.0);
    out.extend_from_slice(&(rec.payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&rec.payload);
    while (out.len() - start) % 4 != 0 {
        out.push(0);
    }
    out.extend_from_slice(&0u32.to_le_bytes()); // stackSize (stacks carried out-of-band via StackBlock)
    let total = (out.len() - start) as i32;
    out[start..start + 4].copy_from_slice(&total.to_le_bytes());
}

fn hash_frames(frames: &[u64]) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    frames.hash(&mut hasher);
    hasher.finish()
}

/// Builds the `DrainedEvent` list into `EncodableRecord`s, resolving
/// each event's stack id through `serializer` and threading
/// `metadata_id` through unchanged (already resolved by `Session`
/// before the event reached the buffer).
pub fn to_encodable(serializer: &mut BlockSerializer, drained: &[DrainedEvent]) -> Vec<EncodableRecord> {
    let last = drained.len().saturating_sub(1);
    drained
        .iter()
        .enumerate()
        .map(|(i, event)| {
            let stack_id = serializer.resolve_stack_id(&event.record.stack);
            EncodableRecord {
                metadata_id: event.record.metadata_id,
                sequence: event.record.sequence,
                capture_thread_id: event.os_thread_id,
                capture_proc_number: 0,
                thread_id: event.os_thread_id,
                stack_id,
                timestamp: event.record.timestamp,
                activity_id: event.record.activity_id,
                related_activity_id: event.record.related_activity_id,
                payload: event.record.payload.clone(),
                sorted: i != last,
            }
        })
        .collect()
}
