use thiserror::Error;

/// Errors surfaced by the host's public operations.
///
/// Infrastructure layers (store, cache, transport, launcher) speak `anyhow`;
/// they are wrapped here when they cross a component boundary.
#[derive(Debug, Error)]
pub enum HostError {
    /// Bad bot configuration. Fatal to one mount attempt, never retried.
    #[error("configuration error for bot `{bot_id}`: {reason}")]
    Configuration { bot_id: String, reason: String },

    /// Malformed input rejected at the call boundary.
    #[error("invalid {entity}: `{field}` {reason}")]
    Validation {
        entity: &'static str,
        field: String,
        reason: String,
    },

    #[error("An error occurred on \"{path}\" on \"{folder}\". {reason}")]
    Hook {
        path: String,
        folder: String,
        reason: String,
    },

    #[error("hook script \"{path}\" on \"{folder}\" timed out after {timeout_ms} ms")]
    HookTimeout {
        path: String,
        folder: String,
        timeout_ms: u64,
    },

    #[error("middleware `{name}` did not complete within {timeout_ms} ms")]
    MiddlewareTimeout { name: String, timeout_ms: u64 },

    #[error("middleware `{name}` failed: {reason}")]
    Middleware { name: String, reason: String },

    #[error("no worker is available to receive the event")]
    NoWorkers,

    #[error("script store error: {0:#}")]
    Store(#[source] anyhow::Error),

    #[error("cluster cache error: {0:#}")]
    Cache(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HostError {
    pub fn validation(
        entity: &'static str,
        field: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        HostError::Validation {
            entity,
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn configuration(bot_id: impl Into<String>, reason: impl Into<String>) -> Self {
        HostError::Configuration {
            bot_id: bot_id.into(),
            reason: reason.into(),
        }
    }

    /// Field named by a validation error, if any.
    pub fn field(&self) -> Option<&str> {
        match self {
            HostError::Validation { field, .. } => Some(field),
            _ => None,
        }
    }
}

pub type HostResult<T> = Result<T, HostError>;
