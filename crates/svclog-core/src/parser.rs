use chrono::{DateTime, Utc};

use crate::entry::Entry;

/// Turns a stream of raw, newline-delimited bytes into [`Entry`] values.
///
/// A line is a well-formed entry header when it splits (on the first two
/// spaces) into an RFC3339 timestamp, a `[service]` tag, and a message. Any
/// line that doesn't parse that way — blank, truncated, or produced by
/// something that wrote straight to the buffer without going through
/// [`crate::format::LineFormatter`] — is folded into the message of the
/// entry it follows rather than dropped or treated as its own entry.
pub struct Parser {
    buf: Vec<u8>,
    pending: Option<Entry>,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            pending: None,
        }
    }

    /// Appends raw bytes from an iterator chunk to the parser's internal
    /// buffer.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Returns the next fully-terminated entry, if the buffer holds enough
    /// complete lines to know one has ended. Call repeatedly after each
    /// `feed` until it returns `None`.
    pub fn next(&mut self) -> Option<Entry> {
        loop {
            let pos = self.buf.iter().position(|&b| b == b'\n')?;
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();

            match parse_header(&text) {
                Some((timestamp, service, message)) => {
                    let finished = self.pending.replace(Entry::new(timestamp, service, message));
                    if finished.is_some() {
                        return finished;
                    }
                }
                None => {
                    if let Some(entry) = self.pending.as_mut() {
                        entry.message.push('\n');
                        entry.message.push_str(&text);
                    }
                }
            }
        }
    }

    /// Returns whatever entry is still pending, without waiting for a line
    /// that would terminate it. Used once the source stream has ended.
    pub fn flush(&mut self) -> Option<Entry> {
        self.pending.take()
    }
}

fn parse_header(line: &str) -> Option<(DateTime<Utc>, String, String)> {
    let mut parts = line.splitn(3, ' ');
    let ts_str = parts.next()?;
    let svc_str = parts.next()?;
    let message = parts.next().unwrap_or("").to_string();

    let timestamp = DateTime::parse_from_rfc3339(ts_str).ok()?.with_timezone(&Utc);

    if svc_str.len() < 2 || !svc_str.starts_with('[') || !svc_str.ends_with(']') {
        return None;
    }
    let service = svc_str[1..svc_str.len() - 1].to_string();

    Some((timestamp, service, message))
}
