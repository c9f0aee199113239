use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::Method;

/// JSON‑RPC 2.0 core types exchanged between the master and its workers over
/// stdin/stdout, one message per line. Only notifications travel on the
/// channel; lines that are not requests are ignored by both ends.
///
/// Usage example (with `serde_json`):
/// ```ignore
/// use serde_json::json;
/// use worker_channel::jsonrpc::Request;
/// use worker_channel::message::Method;
///
/// let req = Request::notification(Method::WorkerReady, Some(json!({"port": 3000})));
/// let line = req.to_line().unwrap();
/// ```
pub const JSONRPC_VERSION: &str = "2.0";

/// `id` MAY be a string, number or null. We support all forms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Id {
    Number(i64),
    String(String),
    Null,
}

/// JSON‑RPC 2.0 Request object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Omitted for *notifications*.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Id>,
}

fn default_version() -> String {
    JSONRPC_VERSION.to_owned()
}

impl Request {
    /// Create a *notification* (no response expected).
    pub fn notification(method: Method, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            method: method.to_string(),
            params,
            id: None,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Parses `method` into the known method set.
    pub fn method(&self) -> Option<Method> {
        self.method.parse().ok()
    }

    /// Serializes the request followed by the line terminator used on the wire.
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}
