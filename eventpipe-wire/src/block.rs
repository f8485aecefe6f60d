//! Block kinds and the per-event header-compression flags byte (§6.1).

/// Which of the four block kinds a `<block-tag>` introduces.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub enum BlockKind {
    Event = 0,
    Metadata = 1,
    Stack = 2,
    SequencePoint = 3,
}

/// The 1-byte flags field that precedes every header-compressed event
/// record in a v4 `EventBlock`/`MetadataBlock`. Bit layout is fixed
/// by the wire format, not reorderable.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct EventFlags(pub u8);

impl EventFlags {
    pub const METADATA_ID: u8 = 1 << 0;
    pub const SEQUENCE_TRIPLE: u8 = 1 << 1;
    pub const THREAD_ID: u8 = 1 << 2;
    pub const STACK_ID: u8 = 1 << 3;
    pub const ACTIVITY_ID: u8 = 1 << 4;
    pub const RELATED_ACTIVITY_ID: u8 = 1 << 5;
    pub const SORTED: u8 = 1 << 6;
    pub const DATA_LENGTH: u8 = 1 << 7;

    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn contains(&self, bit: u8) -> bool {
        self.0 & bit != 0
    }

    pub fn set(&mut self, bit: u8) {
        self.0 |= bit;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_set_and_contains() {
        let mut f = EventFlags::empty();
        assert!(!f.contains(EventFlags::METADATA_ID));
        f.set(EventFlags::METADATA_ID);
        f.set(EventFlags::SORTED);
        assert!(f.contains(EventFlags::METADATA_ID));
        assert!(f.contains(EventFlags::SORTED));
        assert!(!f.contains(EventFlags::STACK_ID));
    }
}
