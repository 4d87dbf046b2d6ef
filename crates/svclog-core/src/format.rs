use std::io;

use chrono::Utc;

use crate::error::RingError;
use crate::ringbuffer::RingBuffer;

/// Adapts a [`RingBuffer`] to [`std::io::Write`].
///
/// A short write (payload larger than the buffer's capacity) is not treated
/// as an I/O failure here: the truncated tail still landed in the buffer, so
/// callers that only care about "did my bytes get written" see `Ok`. Only a
/// write to a closed buffer surfaces as an error.
pub struct RingBufferSink(pub RingBuffer);

impl io::Write for RingBufferSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.0.write(buf) {
            Ok(n) => Ok(n),
            Err(RingError::ShortWrite { capacity, .. }) => Ok(capacity),
            Err(e) => Err(io::Error::other(e)),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Prefixes raw, possibly partial, byte chunks with a timestamp and service
/// name at every line boundary before forwarding them to an underlying
/// sink.
///
/// Input does not need to arrive line-aligned: a line split across two
/// `write` calls is held in an internal scratch buffer until its terminating
/// `\n` shows up.
pub struct LineFormatter<W> {
    service: String,
    sink: W,
    scratch: Vec<u8>,
}

impl<W: io::Write> LineFormatter<W> {
    pub fn new(service: impl Into<String>, sink: W) -> Self {
        Self {
            service: service.into(),
            sink,
            scratch: Vec::new(),
        }
    }

    /// Appends `buf`, emitting every complete line it completes.
    pub fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        self.scratch.extend_from_slice(buf);
        loop {
            let Some(pos) = self.scratch.iter().position(|&b| b == b'\n') else {
                break;
            };
            let line: Vec<u8> = self.scratch.drain(..=pos).collect();
            self.emit_line(&line[..line.len() - 1])?;
        }
        Ok(())
    }

    /// Forces out whatever partial line is still held in scratch, as if it
    /// had ended with a newline. Used when a producer closes without
    /// terminating its final line.
    pub fn flush(&mut self) -> io::Result<()> {
        if !self.scratch.is_empty() {
            let line = std::mem::take(&mut self.scratch);
            self.emit_line(&line)?;
        }
        Ok(())
    }

    fn emit_line(&mut self, line: &[u8]) -> io::Result<()> {
        let prefix = format!(
            "{} [{}] ",
            Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            self.service
        );
        self.sink.write_all(prefix.as_bytes())?;
        self.sink.write_all(line)?;
        self.sink.write_all(b"\n")
    }
}
