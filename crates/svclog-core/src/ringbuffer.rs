use std::sync::{Arc, Mutex, RwLock, Weak};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::RingError;

/// Sentinel line emitted by a lagging iterator in place of the bytes it lost
/// to an overwrite. Emitted exactly once per detected gap, ahead of whatever
/// real bytes follow.
pub const TRUNCATION_SENTINEL: &[u8] = b"(... output truncated ...)\n";

struct State {
    data: Box<[u8]>,
    read_index: u64,
    write_index: u64,
    closed: bool,
}

impl State {
    fn buffered(&self) -> u64 {
        self.write_index - self.read_index
    }

    fn byte_at(&self, absolute: u64) -> u8 {
        let capacity = self.data.len() as u64;
        self.data[(absolute % capacity) as usize]
    }

    fn copy_range(&self, start: u64, end: u64) -> Vec<u8> {
        let capacity = self.data.len() as u64;
        let len = (end - start) as usize;
        let mut out = Vec::with_capacity(len);
        let start_offset = (start % capacity) as usize;
        let tail = self.data.len() - start_offset;
        if len <= tail {
            out.extend_from_slice(&self.data[start_offset..start_offset + len]);
        } else {
            out.extend_from_slice(&self.data[start_offset..]);
            out.extend_from_slice(&self.data[..len - tail]);
        }
        out
    }
}

struct Shared {
    capacity: usize,
    state: RwLock<State>,
    notifiers: Mutex<Vec<Weak<Notify>>>,
}

/// A fixed-capacity, multi-reader, overwrite-on-full byte ring buffer.
///
/// Writers never block on readers: once the buffer is full, the oldest bytes
/// are discarded to make room, and any iterator that had not yet consumed
/// them observes a [`TRUNCATION_SENTINEL`] line the next time it reads.
///
/// Cloning a `RingBuffer` is cheap and shares the same underlying storage
/// (it is backed by an `Arc` internally), mirroring how iterators hold a
/// handle to the buffer they tail.
#[derive(Clone)]
pub struct RingBuffer {
    shared: Arc<Shared>,
}

/// Outcome of reading the bytes available to an iterator since its last
/// observed position.
enum ReadOutcome {
    Data(Vec<u8>),
    Lagged,
    UpToDate { closed: bool },
}

impl RingBuffer {
    /// Creates a new, empty ring buffer with room for `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                capacity,
                state: RwLock::new(State {
                    data: vec![0u8; capacity].into_boxed_slice(),
                    read_index: 0,
                    write_index: 0,
                    closed: false,
                }),
                notifiers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.shared.capacity
    }

    /// Returns `(readIndex, writeIndex)`.
    pub fn positions(&self) -> (u64, u64) {
        let state = self.read_state();
        (state.read_index, state.write_index)
    }

    pub fn buffered(&self) -> u64 {
        self.read_state().buffered()
    }

    pub fn available(&self) -> usize {
        self.shared.capacity - self.buffered() as usize
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, State> {
        self.shared.state.read().expect("ring buffer lock poisoned")
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, State> {
        self.shared.state.write().expect("ring buffer lock poisoned")
    }

    /// Appends `buf` to the buffer, overwriting the oldest bytes if it would
    /// not otherwise fit. A write larger than `capacity` retains only the
    /// tail `capacity` bytes and returns [`RingError::ShortWrite`]; the
    /// truncated write still lands in the buffer.
    pub fn write(&self, buf: &[u8]) -> Result<usize, RingError> {
        let capacity = self.shared.capacity;
        let (short, payload): (bool, &[u8]) = if buf.len() > capacity {
            (true, &buf[buf.len() - capacity..])
        } else {
            (false, buf)
        };

        {
            let mut state = self.write_state();
            if state.closed {
                return Err(RingError::ClosedPipe);
            }

            let new_write_index = state.write_index + payload.len() as u64;
            let min_read_index = new_write_index.saturating_sub(capacity as u64);
            if state.read_index < min_read_index {
                state.read_index = min_read_index;
            }

            let capacity_u64 = capacity as u64;
            let offset = (state.write_index % capacity_u64) as usize;
            let tail = capacity - offset;
            if payload.len() <= tail {
                state.data[offset..offset + payload.len()].copy_from_slice(payload);
            } else {
                let (first, second) = payload.split_at(tail);
                state.data[offset..].copy_from_slice(first);
                state.data[..second.len()].copy_from_slice(second);
            }
            state.write_index = new_write_index;
        }

        self.notify_all();

        if short {
            return Err(RingError::ShortWrite {
                len: buf.len(),
                capacity,
            });
        }
        Ok(payload.len())
    }

    /// Marks the buffer closed. Subsequent writes fail; iterators that have
    /// caught up to `writeIndex` observe end-of-stream rather than blocking.
    pub fn close(&self) {
        {
            let mut state = self.write_state();
            state.closed = true;
        }
        self.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.read_state().closed
    }

    /// Advances `readIndex` by up to `n` bytes, never past `writeIndex`.
    pub fn discard(&self, n: u64) {
        let mut state = self.write_state();
        state.read_index = (state.read_index + n).min(state.write_index);
    }

    /// Copies up to `dest.len()` bytes starting at absolute position `from`
    /// into `dest`. Returns `(next_position, bytes_copied)`.
    ///
    /// Once `from` has caught up to `writeIndex`, returns `Ok((from, 0))` if
    /// the buffer is still open (more may yet be written) or
    /// `Err(RingError::Eof)` if it's closed (nothing more is coming).
    pub fn copy(&self, dest: &mut [u8], from: u64) -> Result<(u64, usize), RingError> {
        let state = self.read_state();
        if from < state.read_index || from > state.write_index {
            return Err(RingError::Range {
                position: from,
                read_index: state.read_index,
                write_index: state.write_index,
            });
        }
        if from == state.write_index {
            return if state.closed { Err(RingError::Eof) } else { Ok((from, 0)) };
        }
        let available = (state.write_index - from) as usize;
        let n = available.min(dest.len());
        let bytes = state.copy_range(from, from + n as u64);
        dest[..n].copy_from_slice(&bytes);
        Ok((from + n as u64, n))
    }

    /// Writes every byte available from `from` up to the current
    /// `writeIndex` into `writer`. Returns `(next_position, bytes_written)`.
    ///
    /// Same end-of-stream behavior as [`RingBuffer::copy`]: `Err(RingError::Eof)`
    /// once `from` has caught up to a closed buffer's `writeIndex`.
    pub fn write_to(&self, writer: &mut impl std::io::Write, from: u64) -> Result<(u64, usize), RingError> {
        let bytes = {
            let state = self.read_state();
            if from < state.read_index || from > state.write_index {
                return Err(RingError::Range {
                    position: from,
                    read_index: state.read_index,
                    write_index: state.write_index,
                });
            }
            if from == state.write_index {
                return if state.closed { Err(RingError::Eof) } else { Ok((from, 0)) };
            }
            state.copy_range(from, state.write_index)
        };
        writer.write_all(&bytes)?;
        Ok((from + bytes.len() as u64, bytes.len()))
    }

    /// Returns an iterator starting at the buffer's current `readIndex`:
    /// every byte written from now on, plus anything still buffered.
    pub fn tail_iterator(&self) -> RingIterator {
        let position = self.read_state().read_index;
        self.make_iterator(position)
    }

    /// Returns an iterator positioned `n_lines` complete lines back from the
    /// current `writeIndex`. If fewer than `n_lines` complete lines are
    /// still buffered, the iterator starts at `readIndex` and silently
    /// yields however many lines are actually available.
    pub fn head_iterator(&self, n_lines: usize) -> RingIterator {
        let state = self.read_state();
        let position = if n_lines == 0 {
            state.write_index
        } else {
            let mut lines = 0u64;
            let mut i = state.write_index;
            let mut found = None;
            while i > state.read_index {
                i -= 1;
                if state.byte_at(i) == b'\n' {
                    lines += 1;
                    if lines == n_lines as u64 + 1 {
                        found = Some(i + 1);
                        break;
                    }
                }
            }
            found.unwrap_or(state.read_index)
        };
        drop(state);
        self.make_iterator(position)
    }

    fn make_iterator(&self, position: u64) -> RingIterator {
        let notify = Arc::new(Notify::new());
        {
            let mut notifiers = self.shared.notifiers.lock().expect("notifier lock poisoned");
            notifiers.retain(|w| w.strong_count() > 0);
            notifiers.push(Arc::downgrade(&notify));
        }
        RingIterator {
            buffer: self.clone(),
            position,
            truncation_pending: false,
            notify,
        }
    }

    fn notify_all(&self) {
        let mut notifiers = self.shared.notifiers.lock().expect("notifier lock poisoned");
        notifiers.retain(|weak| {
            if let Some(notify) = weak.upgrade() {
                notify.notify_one();
                true
            } else {
                false
            }
        });
    }

    fn read_since(&self, position: &mut u64) -> ReadOutcome {
        let state = self.read_state();
        if *position < state.read_index {
            *position = state.read_index;
            return ReadOutcome::Lagged;
        }
        if *position < state.write_index {
            let bytes = state.copy_range(*position, state.write_index);
            *position = state.write_index;
            return ReadOutcome::Data(bytes);
        }
        ReadOutcome::UpToDate { closed: state.closed }
    }
}

/// A cursor over a [`RingBuffer`] created by [`RingBuffer::tail_iterator`] or
/// [`RingBuffer::head_iterator`].
///
/// Each call to [`RingIterator::next`] waits for new bytes (or cancellation,
/// or end of stream) and returns the next chunk of raw bytes to feed to a
/// [`crate::parser::Parser`]. A lost-data gap surfaces as a single
/// [`TRUNCATION_SENTINEL`] chunk ahead of the bytes that follow it.
pub struct RingIterator {
    buffer: RingBuffer,
    position: u64,
    truncation_pending: bool,
    notify: Arc<Notify>,
}

impl RingIterator {
    /// Waits until there is something to read, then returns it. Returns
    /// `None` once the buffer is closed and fully drained, or when
    /// `cancel` fires first.
    pub async fn next(&mut self, cancel: &CancellationToken) -> Option<Vec<u8>> {
        loop {
            if self.truncation_pending {
                self.truncation_pending = false;
                return Some(TRUNCATION_SENTINEL.to_vec());
            }
            match self.buffer.read_since(&mut self.position) {
                ReadOutcome::Data(bytes) => return Some(bytes),
                ReadOutcome::Lagged => {
                    self.truncation_pending = true;
                    continue;
                }
                ReadOutcome::UpToDate { closed: true } => return None,
                ReadOutcome::UpToDate { closed: false } => {
                    tokio::select! {
                        _ = self.notify.notified() => continue,
                        _ = cancel.cancelled() => return None,
                    }
                }
            }
        }
    }

    pub fn position(&self) -> u64 {
        self.position
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_and_read_roundtrip() {
        let rb = RingBuffer::new(64);
        rb.write(b"hello\n").unwrap();
        let (read_index, write_index) = rb.positions();
        assert_eq!(read_index, 0);
        assert_eq!(write_index, 6);
        assert_eq!(rb.buffered(), 6);
    }

    #[test]
    fn overwrite_advances_read_index() {
        let rb = RingBuffer::new(8);
        rb.write(b"abcdefgh").unwrap();
        rb.write(b"xy").unwrap();
        let (read_index, write_index) = rb.positions();
        assert_eq!(write_index - read_index, 8);
        assert_eq!(read_index, 2);
    }

    #[test]
    fn oversized_write_is_truncated_to_tail() {
        let rb = RingBuffer::new(4);
        let err = rb.write(b"abcdef").unwrap_err();
        assert!(matches!(err, RingError::ShortWrite { len: 6, capacity: 4 }));
        let mut out = [0u8; 4];
        let (_, n) = rb.copy(&mut out, 0).unwrap();
        assert_eq!(n, 4);
        assert_eq!(&out, b"cdef");
    }

    #[test]
    fn head_iterator_finds_exact_boundary() {
        let rb = RingBuffer::new(64);
        rb.write(b"first\nsecond\nthird\nfourth\nfifth\n").unwrap();
        let iter = rb.head_iterator(2);
        assert_eq!(iter.position(), 19);
    }

    #[test]
    fn head_iterator_silently_yields_fewer_lines_when_short() {
        let rb = RingBuffer::new(64);
        rb.write(b"only\none\n").unwrap();
        let iter = rb.head_iterator(5);
        assert_eq!(iter.position(), 0);
    }

    #[tokio::test]
    async fn tail_iterator_observes_new_writes() {
        let rb = RingBuffer::new(64);
        let cancel = CancellationToken::new();
        let mut iter = rb.tail_iterator();
        rb.write(b"line one\n").unwrap();
        let chunk = iter.next(&cancel).await.unwrap();
        assert_eq!(chunk, b"line one\n");
    }

    #[tokio::test]
    async fn tail_iterator_closes_cleanly() {
        let rb = RingBuffer::new(64);
        let cancel = CancellationToken::new();
        let mut iter = rb.tail_iterator();
        rb.close();
        assert!(iter.next(&cancel).await.is_none());
    }

    #[tokio::test]
    async fn lagging_iterator_sees_truncation_sentinel() {
        let rb = RingBuffer::new(8);
        let mut iter = rb.tail_iterator();
        rb.write(b"12345678").unwrap();
        rb.write(b"overwritten").unwrap();
        let cancel = CancellationToken::new();
        let chunk = iter.next(&cancel).await.unwrap();
        assert_eq!(chunk, TRUNCATION_SENTINEL);
    }

    #[tokio::test]
    async fn cancellation_stops_a_blocked_iterator() {
        let rb = RingBuffer::new(64);
        let cancel = CancellationToken::new();
        let mut iter = rb.tail_iterator();
        cancel.cancel();
        assert!(iter.next(&cancel).await.is_none());
    }

    #[test]
    fn copy_returns_zero_without_eof_while_open() {
        let rb = RingBuffer::new(64);
        rb.write(b"hello\n").unwrap();
        let mut out = [0u8; 6];
        let (pos, n) = rb.copy(&mut out, 6).unwrap();
        assert_eq!((pos, n), (6, 0));
    }

    #[test]
    fn copy_reports_eof_once_closed_and_drained() {
        let rb = RingBuffer::new(64);
        rb.write(b"hello\n").unwrap();
        rb.close();
        let mut out = [0u8; 6];
        assert!(matches!(rb.copy(&mut out, 6), Err(RingError::Eof)));
    }

    #[test]
    fn write_to_reports_eof_once_closed_and_drained() {
        let rb = RingBuffer::new(64);
        rb.write(b"hello\n").unwrap();
        rb.close();
        let mut out = Vec::new();
        assert!(matches!(rb.write_to(&mut out, 6), Err(RingError::Eof)));
    }
}
