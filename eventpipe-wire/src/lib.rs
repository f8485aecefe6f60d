//! Wire-format types for the eventpipe binary trace stream.
//!
//! Everything here is `#[repr(C)]` and `Pod`/`Zeroable` so it can be
//! written to a stream with a straight byte copy. Multi-byte scalars
//! are little-endian on every platform this crate builds for.

pub mod block;
pub mod header;
pub mod varint;

pub use block::{BlockKind, EventFlags};
pub use header::{BlockHeader, StreamHeader};
pub use varint::{read_varint, read_varint_i64, write_varint, write_varint_i64};

/// `MaxSessions` from the session table: the fixed width of the
/// session-enabled bitmask carried on providers and events.
pub const MAX_SESSIONS: usize = 64;

/// 128-bit activity correlation id. Opaque to the pipeline; callers
/// supply it, the wire format just carries it.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, bytemuck::Pod, bytemuck::Zeroable)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct ActivityId(pub [u8; 16]);

impl ActivityId {
    pub const NIL: ActivityId = ActivityId([0u8; 16]);

    pub fn is_nil(&self) -> bool {
        self.0 == [0u8; 16]
    }
}

impl Default for ActivityId {
    fn default() -> Self {
        Self::NIL
    }
}

/// Trace format version a session was configured with. Both are real
/// wire formats; the legacy fixed-layout form is kept because a
/// session-control client is free to request it (see `BlockFormat`
/// documentation in the core crate).
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub enum FormatVersion {
    V3Legacy = 3,
    V4HeaderCompressed = 4,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activity_id_layout() {
        assert_eq!(std::mem::size_of::<ActivityId>(), 16);
        assert_eq!(std::mem::align_of::<ActivityId>(), 1);
    }

    #[test]
    fn activity_id_roundtrip_json() {
        let id = ActivityId([7u8; 16]);
        let json = serde_json::to_string(&id).unwrap();
        let back: ActivityId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
