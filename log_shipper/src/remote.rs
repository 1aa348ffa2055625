//! Remote indexing sink speaking the `_bulk` NDJSON protocol

use crate::errors::{Result, SerializationError, SinkError};
use crate::event::{LogBatch, LogEvent};
use crate::index::IndexTemplate;
use crate::metrics::DropReason;
use crate::sink::{DispatchResult, Sink};
use crate::transport::{BasicAuth, HttpTransport, is_retryable_item};
use async_trait::async_trait;
use chrono::SecondsFormat;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RemoteSinkConfig {
    pub endpoint: String,
    pub index_template: IndexTemplate,
    pub application: String,
    /// Used for the index name when an event has no `Environment` property
    pub environment: String,
    pub http_timeout: Duration,
    pub max_event_bytes: usize,
    pub auth: Option<BasicAuth>,
}

pub struct RemoteSink {
    name: String,
    transport: HttpTransport,
    index_template: IndexTemplate,
    application: String,
    environment: String,
    max_event_bytes: usize,
}

impl RemoteSink {
    pub fn new(config: RemoteSinkConfig) -> Result<Self> {
        let transport = HttpTransport::new(&config.endpoint, config.http_timeout, config.auth)?;
        if transport.endpoint().is_none() {
            warn!("Remote sink endpoint '{}' is malformed, its events will be dropped", config.endpoint);
        }

        Ok(Self {
            name: "remote".to_string(),
            transport,
            index_template: config.index_template,
            application: config.application,
            environment: config.environment,
            max_event_bytes: config.max_event_bytes,
        })
    }

    pub fn index_name(&self, event: &LogEvent) -> String {
        let environment = event
            .properties
            .get("Environment")
            .and_then(Value::as_str)
            .unwrap_or(self.environment.as_str());
        self.index_template.render(&self.application, environment, event.timestamp)
    }

    /// The document body. `index` repeats the target index name so documents
    /// can be traced back to it after reindexing.
    pub fn document(&self, event: &LogEvent) -> Value {
        let mut fields = event.flattened_fields();
        if let Some(context) = &event.source_context {
            fields
                .entry("SourceContext")
                .or_insert_with(|| Value::String(context.clone()));
        }

        let mut document = json!({
            "@timestamp": event.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            "level": event.level.to_string(),
            "messageTemplate": event.message_template,
            "message": event.render_message(),
            "fields": fields,
            "index": self.index_name(event),
        });
        if let Some(exception) = &event.exception {
            document["exception"] = json!({
                "type": exception.type_name,
                "message": exception.message,
                "stackTrace": exception.stack_trace(),
                "summary": exception.summary(),
            });
        }
        document
    }

    /// Action line plus document line for one event.
    pub fn encode(&self, event: &LogEvent) -> std::result::Result<Vec<u8>, SerializationError> {
        let document = self.document(event);
        let action = json!({ "index": { "_index": document["index"] } });
        let document = serde_json::to_vec(&document)?;
        if document.len() > self.max_event_bytes {
            return Err(SerializationError::TooLarge {
                size: document.len(),
                limit: self.max_event_bytes,
            });
        }

        let mut lines = serde_json::to_vec(&action)?;
        lines.push(b'\n');
        lines.extend_from_slice(&document);
        lines.push(b'\n');
        Ok(lines)
    }
}

#[async_trait]
impl Sink for RemoteSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, batch: &LogBatch) -> std::result::Result<DispatchResult, SinkError> {
        let mut body = Vec::new();
        let mut sent = Vec::with_capacity(batch.len());
        let mut result = DispatchResult::default();

        for (position, event) in batch.events.iter().enumerate() {
            match self.encode(event) {
                Ok(lines) => {
                    body.extend_from_slice(&lines);
                    sent.push(position);
                }
                Err(e) => {
                    warn!(batch_id = %batch.metadata.batch_id, "Dropping event that cannot be encoded: {}", e);
                    result.dropped.push((position, DropReason::Serialization));
                }
            }
        }

        if sent.is_empty() {
            return Ok(result);
        }

        let response = self.transport.post_bulk(body).await?;

        if !response.errors {
            result.acknowledged = sent.len();
            debug!(batch_id = %batch.metadata.batch_id, "Bulk request acknowledged {} documents", sent.len());
            return Ok(result);
        }

        let mut rejected = 0;
        for (item_index, position) in sent.into_iter().enumerate() {
            match response.item(item_index) {
                Some(item) if (200..300).contains(&item.status) => result.acknowledged += 1,
                Some(item) if !is_retryable_item(item.status) => {
                    rejected += 1;
                    result.dropped.push((position, DropReason::Rejected));
                }
                // retryable status, or the backend did not report this item
                _ => result.retryable.push(position),
            }
        }

        result.error = Some(format!(
            "{} documents acknowledged, {} to retry, {} rejected",
            result.acknowledged,
            result.retryable.len(),
            rejected
        ));
        Ok(result)
    }

    async fn probe(&self) -> bool {
        match self.transport.health_check().await {
            Ok(()) => true,
            Err(e) => {
                debug!("Remote sink probe failed: {}", e);
                false
            }
        }
    }
}
