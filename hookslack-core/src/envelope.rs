// ABOUTME: Routed unit of work: a decoded JSON payload plus routing metadata.
// ABOUTME: Also converts to and from the on-disk record format used by the recorder.

use crate::request::OutboundRequest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key under which routing metadata is stored in recorded payloads.
pub const METADATA_KEY: &str = "hookslack_metadata";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// Pushed over the streaming connection
    Stream,
    /// Reply to a router-issued API request
    Http,
    /// Produced inside the application
    Local,
}

impl Source {
    /// Recorder subdirectory
    pub fn subdir(&self) -> &'static str {
        match self {
            Source::Stream => "websocket",
            Source::Http => "http",
            Source::Local => "local",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct RecordedMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    team: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    process_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub payload: Value,
    pub team: Option<String>,
    pub correlation_id: Option<String>,
    /// Handler hint for request results, e.g. `conversationshistory`
    pub process_method: Option<String>,
    pub source: Source,
    pub received_at: DateTime<Utc>,
}

impl Envelope {
    pub fn from_stream(team: &str, payload: Value, now: DateTime<Utc>) -> Self {
        Self {
            payload,
            team: Some(team.to_string()),
            correlation_id: None,
            process_method: None,
            source: Source::Stream,
            received_at: now,
        }
    }

    pub fn from_http(request: &OutboundRequest, payload: Value, now: DateTime<Utc>) -> Self {
        Self {
            payload,
            team: Some(request.team.clone()),
            correlation_id: Some(request.response_id.clone()),
            process_method: Some(request.normalized_method.clone()),
            source: Source::Http,
            received_at: now,
        }
    }

    pub fn local(payload: Value, now: DateTime<Utc>) -> Self {
        Self {
            payload,
            team: None,
            correlation_id: None,
            process_method: None,
            source: Source::Local,
            received_at: now,
        }
    }

    /// Message id this payload replies to, for streamed replies
    pub fn reply_to(&self) -> Option<i64> {
        self.payload.get("reply_to").and_then(Value::as_i64)
    }

    pub fn declared_type(&self) -> Option<&str> {
        self.payload.get("type").and_then(Value::as_str)
    }

    /// Handler key by precedence: reply marker, declared type, process
    /// method hint, then `unknown`.
    pub fn handler_name(&self) -> &str {
        if self.reply_to().is_some() {
            "reply"
        } else if let Some(kind) = self.declared_type() {
            kind
        } else if let Some(method) = self.process_method.as_deref() {
            method
        } else {
            "unknown"
        }
    }

    /// Identifier field of the payload (`user`, `channel`) when it is a bare string
    pub fn reference(&self, field: &str) -> Option<&str> {
        self.payload.get(field).and_then(Value::as_str)
    }

    /// Payload with routing metadata embedded, as written by the recorder.
    pub fn to_record(&self) -> Value {
        let metadata = RecordedMetadata {
            team: self.team.clone(),
            process_method: self.process_method.clone(),
            correlation_id: self.correlation_id.clone(),
        };
        let mut record = match &self.payload {
            Value::Object(map) => map.clone(),
            other => {
                let mut map = Map::new();
                map.insert("payload".to_string(), other.clone());
                map
            }
        };
        record.insert(
            METADATA_KEY.to_string(),
            serde_json::to_value(metadata).unwrap_or(Value::Null),
        );
        Value::Object(record)
    }

    /// Rebuild an envelope from a recorded payload.
    pub fn from_record(mut record: Value, source: Source, now: DateTime<Utc>) -> Self {
        let metadata = record
            .as_object_mut()
            .and_then(|map| map.remove(METADATA_KEY))
            .and_then(|value| serde_json::from_value::<RecordedMetadata>(value).ok())
            .unwrap_or_default();
        Self {
            payload: record,
            team: metadata.team,
            correlation_id: metadata.correlation_id,
            process_method: metadata.process_method,
            source,
            received_at: now,
        }
    }
}
