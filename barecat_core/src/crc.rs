//! Streaming CRC32C (Castagnoli) over appends and reads.

/// Incremental CRC32C hasher.
///
/// Wraps the hardware-accelerated `crc32c` crate with the streaming
/// update/finalize shape the sharder and verifier need. The crate
/// already applies the conventional initial value and final
/// complement, so `finalize` is just the accumulated state.
#[derive(Debug, Clone, Copy, Default)]
pub struct Crc32c {
    state: u32,
}

impl Crc32c {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.state = crc32c::crc32c_append(self.state, bytes);
    }

    pub fn finalize(self) -> u32 {
        self.state
    }
}

/// One-shot CRC32C of a byte slice.
pub fn crc32c_of(bytes: &[u8]) -> u32 {
    crc32c::crc32c(bytes)
}
