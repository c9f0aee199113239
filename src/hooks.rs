//! User scripts fired at named lifecycle points.
//!
//! Scripts are Rhai files stored under `hooks/<folder>/` in the global scope of
//! the script store, or in a bot scope for hooks that carry a `bot_id`. A file
//! whose name starts with a dot is disabled.

pub mod debounce;
pub mod modules;
pub mod sandbox;
pub mod service;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use strum_macros::{Display, EnumIter, EnumString, IntoStaticStr};

pub use service::{HookInvalidation, HookService, HookServiceOptions};

pub const SCRIPT_EXTENSION: &str = "rhai";

/// Every lifecycle point the host fires hooks at, serialized as its folder name.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, IntoStaticStr,
    Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum HookType {
    AfterServerStart,
    OnIncidentStatusChanged,
    BeforeBotImport,
    #[strum(serialize = "on_stage_request")]
    #[serde(rename = "on_stage_request")]
    OnStageChangeRequest,
    #[strum(serialize = "after_stage_change")]
    #[serde(rename = "after_stage_change")]
    AfterStageChanged,
    AfterBotMount,
    AfterBotUnmount,
}

impl HookType {
    pub fn folder(&self) -> &'static str {
        self.into()
    }

    pub fn default_options(&self) -> HookOptions {
        match self {
            // listeners must be able to veto the stage change
            HookType::OnStageChangeRequest => HookOptions {
                timeout: None,
                throw_on_error: true,
            },
            _ => HookOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HookOptions {
    /// Falls back to the service default (1000 ms).
    pub timeout: Option<Duration>,
    pub throw_on_error: bool,
}

/// One firing of a hook.
#[derive(Debug, Clone, PartialEq)]
pub struct Hook {
    pub folder: String,
    pub args: Map<String, Value>,
    pub options: HookOptions,
}

impl Hook {
    pub fn new(hook_type: HookType, args: Value) -> Self {
        Self {
            folder: hook_type.folder().to_string(),
            args: match args {
                Value::Object(map) => map,
                Value::Null => Map::new(),
                other => Map::from_iter([("value".to_string(), other)]),
            },
            options: hook_type.default_options(),
        }
    }

    pub fn with_options(mut self, options: HookOptions) -> Self {
        self.options = options;
        self
    }

    pub fn after_server_start() -> Self {
        Self::new(HookType::AfterServerStart, Value::Null)
    }

    pub fn after_bot_mount(bot_id: &str) -> Self {
        Self::new(HookType::AfterBotMount, json!({ "bot_id": bot_id }))
    }

    pub fn after_bot_unmount(bot_id: &str) -> Self {
        Self::new(HookType::AfterBotUnmount, json!({ "bot_id": bot_id }))
    }

    pub fn on_stage_change_request(bot_id: &str, previous_stage: &str, next_stage: &str) -> Self {
        Self::new(
            HookType::OnStageChangeRequest,
            json!({
                "bot_id": bot_id,
                "previous_stage": previous_stage,
                "next_stage": next_stage,
                "hook_result": { "actions": [] },
            }),
        )
    }

    pub fn after_stage_changed(bot_id: &str, previous_stage: &str, next_stage: &str) -> Self {
        Self::new(
            HookType::AfterStageChanged,
            json!({ "bot_id": bot_id, "previous_stage": previous_stage, "next_stage": next_stage }),
        )
    }

    pub fn bot_id(&self) -> Option<&str> {
        self.args.get("bot_id").and_then(Value::as_str)
    }
}

/// A discovered script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookScript {
    /// Path inside the store, e.g. `hooks/after_bot_mount/01_greet.rhai`.
    pub path: String,
    /// Directory of the script relative to its scope.
    pub dir: String,
    pub filename: String,
    pub name: String,
    pub code: String,
    pub bot_id: Option<String>,
}

/// Outcome of one hook firing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HookReport {
    pub executed: usize,
    /// Paths of scripts that failed and were skipped.
    pub failed: Vec<String>,
    /// Final value of `hook_result` after the last script.
    pub result: Option<Value>,
}

/// Appends the script extension when `name` has none.
pub fn script_file(name: &str) -> String {
    if name.ends_with(&format!(".{SCRIPT_EXTENSION}")) {
        name.to_string()
    } else {
        format!("{name}.{SCRIPT_EXTENSION}")
    }
}

pub fn hook_dir(folder: &str, module: Option<&str>) -> String {
    match module {
        Some(m) if !m.is_empty() => format!("hooks/{folder}/{m}"),
        _ => format!("hooks/{folder}"),
    }
}
