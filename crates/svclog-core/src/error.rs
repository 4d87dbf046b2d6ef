use thiserror::Error;

/// Errors surfaced by the ring buffer and its iterators.
#[derive(Debug, Error)]
pub enum RingError {
    /// A write landed on a buffer that has already been closed.
    #[error("ring buffer is closed")]
    ClosedPipe,

    /// The write was larger than the buffer's capacity; only the tail
    /// `capacity` bytes were retained.
    #[error("write of {len} bytes exceeds buffer capacity {capacity}, tail retained")]
    ShortWrite { len: usize, capacity: usize },

    /// A `Copy`/`WriteTo` request referenced a position outside
    /// `[readIndex, writeIndex]`.
    #[error("position {position} outside of valid range [{read_index}, {write_index}]")]
    Range {
        position: u64,
        read_index: u64,
        write_index: u64,
    },

    /// `WriteTo` failed while writing out to the destination.
    #[error("writing buffered bytes out failed: {0}")]
    Io(#[from] std::io::Error),

    /// `Copy`/`WriteTo` has caught up to `writeIndex` and the buffer is
    /// closed: there is nothing left to read and nothing more is coming.
    #[error("end of stream: ring buffer closed and fully drained")]
    Eof,
}
