use std::collections::HashMap;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;

use super::buffer::SlidingWindow;
use super::Client;
use crate::error::ForwardError;
use crate::puller::PulledEntry;

const DEFAULT_MAX_REQUEST_ENTRIES: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
}

/// Ships RFC 5424 messages to a syslog receiver.
///
/// TCP keeps one persistent connection, reframing each message with an
/// RFC 5425 octet-count prefix, and drops the connection on any write error
/// so the next flush reconnects from scratch. UDP sends one datagram per
/// line and keeps no connection state between flushes.
pub struct SyslogClient {
    transport: Transport,
    address: String,
    hostname: String,
    sdid: String,
    enterprise_num: String,
    labels: HashMap<String, HashMap<String, String>>,
    buffer: SlidingWindow<PulledEntry>,
    tcp: Option<TcpStream>,
}

impl SyslogClient {
    pub fn new(transport: Transport, address: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            transport,
            address: address.into(),
            hostname: hostname.into(),
            sdid: "svclog".to_string(),
            enterprise_num: "32473".to_string(),
            labels: HashMap::new(),
            buffer: SlidingWindow::new(DEFAULT_MAX_REQUEST_ENTRIES),
            tcp: None,
        }
    }

    pub fn with_structured_data_id(mut self, sdid: impl Into<String>, enterprise_num: impl Into<String>) -> Self {
        self.sdid = sdid.into();
        self.enterprise_num = enterprise_num.into();
        self
    }

    fn format_message(&self, pulled: &PulledEntry) -> String {
        let hostname = if self.hostname.is_empty() { "-" } else { &self.hostname };
        format!(
            "<13>1 {} {} {} - - {} {}",
            pulled.entry.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            hostname,
            pulled.service,
            self.structured_data(&pulled.service),
            pulled.entry.message,
        )
    }

    fn structured_data(&self, service: &str) -> String {
        let labels = match self.labels.get(service) {
            Some(labels) if !labels.is_empty() => labels,
            _ => return "-".to_string(),
        };
        let mut keys: Vec<&String> = labels.keys().collect();
        keys.sort();

        let mut out = format!("[{}@{}", self.sdid, self.enterprise_num);
        for key in keys {
            out.push(' ');
            out.push_str(key);
            out.push_str("=\"");
            out.push_str(&escape_sd_value(&labels[key]));
            out.push('"');
        }
        out.push(']');
        out
    }

    async fn send_all(&mut self, messages: &[String]) -> Result<(), ForwardError> {
        match self.transport {
            Transport::Tcp => {
                if self.tcp.is_none() {
                    self.tcp = Some(TcpStream::connect(&self.address).await?);
                }
                let stream = self.tcp.as_mut().expect("just connected");
                for message in messages {
                    let framed = format!("{} {}", message.len(), message);
                    if let Err(err) = stream.write_all(framed.as_bytes()).await {
                        self.tcp = None;
                        return Err(ForwardError::Io(err));
                    }
                }
                Ok(())
            }
            Transport::Udp => {
                let socket = UdpSocket::bind("0.0.0.0:0").await?;
                for message in messages {
                    socket.send_to(message.as_bytes(), &self.address).await?;
                }
                Ok(())
            }
        }
    }
}

fn escape_sd_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if c == '"' || c == '\\' || c == ']' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[async_trait::async_trait]
impl Client for SyslogClient {
    fn add(&mut self, entry: PulledEntry) {
        self.buffer.push(entry);
    }

    async fn flush(&mut self, cancel: &CancellationToken) -> Result<(), ForwardError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let messages: Vec<String> = self.buffer.iter().map(|p| self.format_message(p)).collect();

        tokio::select! {
            result = self.send_all(&messages) => {
                match result {
                    Ok(()) => {
                        self.buffer.drain_all();
                        Ok(())
                    }
                    Err(err) => Err(err),
                }
            }
            _ = cancel.cancelled() => Ok(()),
        }
    }

    fn set_labels(&mut self, service: &str, labels: Option<HashMap<String, String>>) {
        match labels {
            Some(labels) => {
                self.labels.insert(service.to_string(), labels);
            }
            None => {
                self.labels.remove(service);
            }
        }
    }

    async fn close(&mut self) {
        self.tcp = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use svclog_core::Entry;

    fn pulled(service: &str, message: &str) -> PulledEntry {
        PulledEntry {
            service: service.to_string(),
            entry: Entry::new(Utc::now(), service, message),
        }
    }

    #[test]
    fn structured_data_sorts_keys_and_escapes_values() {
        let mut client = SyslogClient::new(Transport::Udp, "127.0.0.1:0", "host1");
        let mut labels = HashMap::new();
        labels.insert("b".to_string(), "has \"quotes\"".to_string());
        labels.insert("a".to_string(), "plain".to_string());
        client.set_labels("svc1", Some(labels));

        let sd = client.structured_data("svc1");
        assert_eq!(sd, "[svclog@32473 a=\"plain\" b=\"has \\\"quotes\\\"\"]");
    }

    #[test]
    fn structured_data_is_dash_when_no_labels() {
        let client = SyslogClient::new(Transport::Udp, "127.0.0.1:0", "host1");
        assert_eq!(client.structured_data("svc1"), "-");
    }

    #[test]
    fn formatted_message_matches_rfc5424_layout() {
        let client = SyslogClient::new(Transport::Udp, "127.0.0.1:0", "host1");
        let message = client.format_message(&pulled("worker", "hello"));
        assert!(message.starts_with("<13>1 "));
        assert!(message.contains(" host1 worker - - - hello"));
    }
}
