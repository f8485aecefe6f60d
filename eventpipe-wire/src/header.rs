//! Stream and block preambles (§6.1).

/// Legacy marker written once at the very start of the stream.
pub const STREAM_MAGIC: &[u8; 8] = b"Nettrace";

/// Fixed-layout stream header. Written once, immediately after
/// `STREAM_MAGIC` and the object-serialization tag.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct StreamHeader {
    /// Y, M, DayOfWeek, D, h, m, s, ms — matches the wall-clock fields
    /// the stream-open time is split into.
    pub file_open_system_time: [u16; 8],
    /// OS performance-counter reading at stream open.
    pub file_open_timestamp: i64,
    /// Ticks per second for every timestamp in the stream.
    pub time_stamp_frequency: i64,
    pub pointer_size: u32,
    pub process_id: u32,
    pub number_of_processors: u32,
    pub sampling_rate_in_ns: u32,
}

impl StreamHeader {
    pub const fn zeroed() -> Self {
        Self {
            file_open_system_time: [0; 8],
            file_open_timestamp: 0,
            time_stamp_frequency: 0,
            pointer_size: 0,
            process_id: 0,
            number_of_processors: 0,
            sampling_rate_in_ns: 0,
        }
    }
}

/// Per-block header. `payload_size` does not include this header.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct BlockHeader {
    pub version: i32,
    pub min_reader_version: i32,
    pub payload_size: i32,
    _reserved: i32,
}

impl BlockHeader {
    pub const fn new(version: i32, min_reader_version: i32, payload_size: i32) -> Self {
        Self {
            version,
            min_reader_version,
            payload_size,
            _reserved: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_header_layout() {
        // 8*2 + 8 + 8 + 4*4 bytes, no implicit padding: Pod derive
        // would refuse to compile otherwise.
        assert_eq!(std::mem::size_of::<StreamHeader>(), 16 + 8 + 8 + 16);
    }

    #[test]
    fn block_header_layout() {
        assert_eq!(std::mem::size_of::<BlockHeader>(), 16);
    }
}
