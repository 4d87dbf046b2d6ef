use std::collections::{BTreeMap, HashMap};

use opentelemetry_proto::tonic::collector::logs::v1::ExportLogsServiceRequest;
use opentelemetry_proto::tonic::common::v1::any_value::Value as AnyValueValue;
use opentelemetry_proto::tonic::common::v1::{AnyValue, InstrumentationScope, KeyValue};
use opentelemetry_proto::tonic::logs::v1::{LogRecord, ResourceLogs, ScopeLogs};
use opentelemetry_proto::tonic::resource::v1::Resource;
use tokio_util::sync::CancellationToken;

use super::buffer::SlidingWindow;
use super::Client;
use crate::error::ForwardError;
use crate::puller::PulledEntry;

const DEFAULT_MAX_REQUEST_ENTRIES: usize = 1000;

/// Posts OTLP log-data-model JSON to `<location>/v1/logs`.
///
/// Entries are grouped into one `resourceLogs` element per service, the
/// same grouping Loki uses for its streams. Response handling mirrors the
/// Loki client's categorisation: there is nothing in the spec that singles
/// out OTLP for different treatment, and both are HTTP-JSON sinks.
pub struct OpenTelemetryClient {
    http: reqwest::Client,
    location: String,
    scope_name: String,
    labels: HashMap<String, HashMap<String, String>>,
    buffer: SlidingWindow<PulledEntry>,
}

impl OpenTelemetryClient {
    pub fn new(location: impl Into<String>) -> Self {
        Self::with_capacity(location, DEFAULT_MAX_REQUEST_ENTRIES)
    }

    pub fn with_capacity(location: impl Into<String>, max_request_entries: usize) -> Self {
        Self {
            http: reqwest::Client::new(),
            location: location.into(),
            scope_name: "svclog".to_string(),
            labels: HashMap::new(),
            buffer: SlidingWindow::new(max_request_entries),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/logs", self.location.trim_end_matches('/'))
    }

    fn build_request(&self) -> ExportLogsServiceRequest {
        let mut by_service: BTreeMap<&str, Vec<&PulledEntry>> = BTreeMap::new();
        for pulled in self.buffer.iter() {
            by_service.entry(pulled.service.as_str()).or_default().push(pulled);
        }

        let resource_logs = by_service
            .into_iter()
            .map(|(service, entries)| {
                let mut attributes = vec![KeyValue {
                    key: "service.name".to_string(),
                    value: Some(string_value(service)),
                }];
                if let Some(labels) = self.labels.get(service) {
                    let mut keys: Vec<&String> = labels.keys().collect();
                    keys.sort();
                    for key in keys {
                        attributes.push(KeyValue {
                            key: key.clone(),
                            value: Some(string_value(&labels[key])),
                        });
                    }
                }

                let log_records = entries
                    .into_iter()
                    .map(|pulled| {
                        let nanos = pulled.entry.timestamp.timestamp_nanos_opt().unwrap_or_default();
                        LogRecord {
                            time_unix_nano: nanos as u64,
                            observed_time_unix_nano: nanos as u64,
                            severity_number: 0,
                            severity_text: String::new(),
                            body: Some(string_value(&pulled.entry.message)),
                            attributes: Vec::new(),
                            dropped_attributes_count: 0,
                            flags: 0,
                            trace_id: Vec::new(),
                            span_id: Vec::new(),
                            event_name: String::new(),
                        }
                    })
                    .collect();

                ResourceLogs {
                    resource: Some(Resource {
                        attributes,
                        dropped_attributes_count: 0,
                        entity_refs: Vec::new(),
                    }),
                    scope_logs: vec![ScopeLogs {
                        scope: Some(InstrumentationScope {
                            name: self.scope_name.clone(),
                            version: String::new(),
                            attributes: Vec::new(),
                            dropped_attributes_count: 0,
                        }),
                        log_records,
                        schema_url: String::new(),
                    }],
                    schema_url: String::new(),
                }
            })
            .collect();

        ExportLogsServiceRequest { resource_logs }
    }
}

fn string_value(s: &str) -> AnyValue {
    AnyValue {
        value: Some(AnyValueValue::StringValue(s.to_string())),
    }
}

#[async_trait::async_trait]
impl Client for OpenTelemetryClient {
    fn add(&mut self, entry: PulledEntry) {
        self.buffer.push(entry);
    }

    async fn flush(&mut self, cancel: &CancellationToken) -> Result<(), ForwardError> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let request = self.build_request();
        let send = self.http.post(self.endpoint()).json(&request).send();

        let response = tokio::select! {
            result = send => result,
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

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use svclog_core::Entry;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn pulled(service: &str, message: &str) -> PulledEntry {
        PulledEntry {
            service: service.to_string(),
            entry: Entry::new(Utc::now(), service, message),
        }
    }

    #[tokio::test]
    async fn successful_flush_drains_the_buffer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/logs"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let mut client = OpenTelemetryClient::new(server.uri());
        client.add(pulled("svc1", "hello"));

        let cancel = CancellationToken::new();
        client.flush(&cancel).await.unwrap();
        assert!(client.buffer.is_empty());
    }

    #[test]
    fn request_groups_entries_by_service() {
        let mut client = OpenTelemetryClient::new("http://example.invalid");
        client.add(pulled("svc1", "a"));
        client.add(pulled("svc2", "b"));
        let request = client.build_request();
        assert_eq!(request.resource_logs.len(), 2);
    }
}
