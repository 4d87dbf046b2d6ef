//! In-memory log ring buffer, line formatter, and line parser.
//!
//! This crate has no knowledge of services, targets, or sinks: it is the
//! storage and framing layer that `svclog-forward` builds on.

pub mod entry;
pub mod error;
pub mod format;
pub mod parser;
pub mod ringbuffer;

pub use entry::Entry;
pub use error::RingError;
pub use format::{LineFormatter, RingBufferSink};
pub use parser::Parser;
pub use ringbuffer::{RingBuffer, RingIterator, TRUNCATION_SENTINEL};
