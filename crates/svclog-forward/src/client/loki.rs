use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use super::buffer::SlidingWindow;
use super::Client;
use crate::error::ForwardError;
use crate::puller::PulledEntry;

const DEFAULT_MAX_REQUEST_ENTRIES: usize = 1000;

/// Pushes batches to a Loki `POST <location>` endpoint.
///
/// Response handling: 2xx drops the batch; 429 and 5xx keep it for the next
/// flush (the bounded buffer eventually drops the oldest entries on its
/// own); any other 4xx is unrecoverable and drops the batch; anything else
/// (a transport failure, no response at all) conservatively keeps it.
pub struct LokiClient {
    http: reqwest::Client,
    location: String,
    user_agent: String,
    labels: HashMap<String, HashMap<String, String>>,
    buffer: SlidingWindow<PulledEntry>,
}

impl LokiClient {
    pub fn new(location: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self::with_capacity(location, user_agent, DEFAULT_MAX_REQUEST_ENTRIES)
    }

    pub fn with_capacity(location: impl Into<String>, user_agent: impl Into<String>, max_request_entries: usize) -> Self {
        Self {
            http: reqwest::Client::new(),
            location: location.into(),
            user_agent: user_agent.into(),
            labels: HashMap::new(),
            buffer: SlidingWindow::new(max_request_entries),
        }
    }

    fn build_body(&self) -> serde_json::Value {
        let mut by_service: BTreeMap<&str, Vec<&PulledEntry>> = BTreeMap::new();
        for pulled in self.buffer.iter() {
            by_service.entry(pulled.service.as_str()).or_default().push(pulled);
        }

        let streams: Vec<serde_json::Value> = by_service
            .into_iter()
            .map(|(service, entries)| {
                let mut stream = self.labels.get(service).cloned().unwrap_or_default();
                stream.insert("pebble_service".to_string(), service.to_string());

                let values: Vec<[String; 2]> = entries
                    .into_iter()
                    .map(|pulled| {
                        let nanos = pulled
                            .entry
                            .timestamp
                            .timestamp_nanos_opt()
                            .unwrap_or_default();
                        [nanos.to_string(), pulled.entry.message.clone()]
                    })
                    .collect();

                serde_json::json!({ "stream": stream, "values": values })
            })
            .collect();

        serde_json::json!({ "streams": streams })
    }
}

#[async_trait::async_trait]
impl Client for LokiClient {
    fn add(&mut self, entry: PulledEntry) {
        self.buffer.push(entry);
    }

    async fn flush(&mut self, cancel: &CancellationToken) -> Result<(), ForwardError> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let body = self.build_body();
        let request = self
            .http
            .post(&self.location)
            .header("Content-Type", "application/json")
            .header("User-Agent", &self.user_agent)
            .json(&body)
            .send();

        let response = tokio::select! {
            result = request => result,
            _ = cancel.cancelled() => return Ok(()),
        };

        match response {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    self.buffer.drain_all();
                    Ok(())
                } else if status.as_u16() == 429 || status.is_server_error() {
                    Err(ForwardError::LokiRetryable { status: status.as_u16() })
                } else if status.is_client_error() {
                    self.buffer.drain_all();
                    Err(ForwardError::LokiUnrecoverable { status: status.as_u16() })
                } else {
                    Err(ForwardError::LokiRetryable { status: status.as_u16() })
                }
            }
            Err(err) => Err(ForwardError::Http(err)),
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
}
