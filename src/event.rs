use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use jsonschema::Validator;
use jsonschema::error::ValidationErrorKind;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::{HostError, HostResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Incoming => "incoming",
            Direction::Outgoing => "outgoing",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = HostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "incoming" => Ok(Direction::Incoming),
            "outgoing" => Ok(Direction::Outgoing),
            other => Err(HostError::validation(
                "middleware",
                "direction",
                format!("must be `incoming` or `outgoing`, got `{other}`"),
            )),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub name: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NluResult {
    pub intent: Option<Intent>,
    pub intents: Vec<Intent>,
    pub entities: Vec<Value>,
    pub language: Option<String>,
    pub detected_language: Option<String>,
    pub ambiguous: bool,
    pub slots: Map<String, Value>,
    pub errored: bool,
    pub included_contexts: Vec<String>,
    pub ms: u64,
    pub spell_checked: Option<String>,
}

/// Envelope of every conversation event flowing through the engine.
///
/// Missing fields deserialize to empty values so production hosts, which skip
/// validation, accept envelopes a development host would reject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub event_type: String,
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub bot_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    pub direction: Direction,
    #[serde(default)]
    pub payload: Value,
    #[serde(default = "Utc::now")]
    pub created_on: DateTime<Utc>,
    #[serde(default)]
    pub flags: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nlu: Option<NluResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incoming_event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestions: Option<Vec<Value>>,
    #[serde(default)]
    pub state: Map<String, Value>,
    #[serde(default)]
    pub processing: Map<String, Value>,
}

impl Event {
    pub fn new(
        bot_id: impl Into<String>,
        channel: impl Into<String>,
        target: impl Into<String>,
        direction: Direction,
        payload: Value,
    ) -> Self {
        let event_type = payload
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("text")
            .to_string();
        let preview = payload.get("text").and_then(Value::as_str).map(str::to_string);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type,
            channel: channel.into(),
            target: target.into(),
            bot_id: bot_id.into(),
            thread_id: None,
            direction,
            payload,
            created_on: Utc::now(),
            flags: Map::new(),
            nlu: None,
            message_id: None,
            incoming_event_id: None,
            preview,
            suggestions: None,
            state: Map::new(),
            processing: Map::new(),
        }
    }

    pub fn with_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn is_incoming(&self) -> bool {
        self.direction == Direction::Incoming
    }
}

static EVENT_VALIDATOR: Lazy<Result<Validator, String>> = Lazy::new(|| {
    let nullable_string = json!({ "type": ["string", "null"] });
    let required_string = json!({ "type": "string", "minLength": 1 });
    let schema = json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "title": "Event",
        "type": "object",
        "required": ["id", "type", "channel", "target", "botId", "direction", "payload", "createdOn", "flags"],
        "properties": {
            "id": required_string,
            "type": required_string,
            "channel": required_string,
            "target": required_string,
            "botId": required_string,
            "threadId": nullable_string,
            "direction": { "enum": ["incoming", "outgoing"] },
            "payload": { "type": "object" },
            "createdOn": { "type": "string" },
            "flags": { "type": "object" },
            "nlu": { "type": ["object", "null"] },
            "messageId": {
                "type": ["string", "null"],
                "pattern": "^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$"
            },
            "incomingEventId": nullable_string,
            "preview": nullable_string,
            "suggestions": { "type": ["array", "null"] },
            "state": { "type": "object" },
            "processing": { "type": "object" }
        }
    });
    jsonschema::validator_for(&schema).map_err(|e| e.to_string())
});

/// Checks a raw envelope; the error names the first offending field.
pub fn validate_event(value: &Value) -> HostResult<()> {
    let validator = EVENT_VALIDATOR
        .as_ref()
        .map_err(|e| anyhow::anyhow!("event schema does not compile: {e}"))?;
    match validator.iter_errors(value).next() {
        None => Ok(()),
        Some(err) => {
            let field = match &err.kind {
                ValidationErrorKind::Required { property } => {
                    property.as_str().unwrap_or_default().to_string()
                }
                _ => {
                    let path = err.instance_path.to_string();
                    path.trim_start_matches('/')
                        .split('/')
                        .next()
                        .unwrap_or_default()
                        .to_string()
                }
            };
            let field = if field.is_empty() { "event".to_string() } else { field };
            Err(HostError::validation("event", field, err.to_string()))
        }
    }
}

/// Parses an envelope received over the wire, validating it first unless in production.
pub fn parse_event(value: Value, is_production: bool) -> HostResult<Event> {
    if !is_production {
        validate_event(&value)?;
    }
    serde_json::from_value(value).map_err(|e| HostError::validation("event", "body", e.to_string()))
}
