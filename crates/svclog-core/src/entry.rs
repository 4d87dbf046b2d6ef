use std::fmt;

use chrono::{DateTime, Utc};

/// A single parsed log line: a timestamp, the service that produced it, and
/// the message body.
///
/// `message` never contains a trailing newline; continuation lines (see
/// [`crate::parser::Parser`]) are folded into the message of the entry they
/// continue rather than becoming entries of their own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub timestamp: DateTime<Utc>,
    pub service: String,
    pub message: String,
}

impl Entry {
    pub fn new(timestamp: DateTime<Utc>, service: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp,
            service: service.into(),
            message: message.into(),
        }
    }
}

/// Reproduces the wire line for this entry, without a trailing newline.
///
/// Forward clients reuse this for transports (syslog message bodies) that
/// need the same `RFC3339ms [service] message` layout the ring buffer stores.
impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] {}",
            self.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            self.service,
            self.message
        )
    }
}
