//! Bot mount/unmount state machine and health reporting.

pub mod config;
pub mod content;
pub mod health;
pub mod libraries;
pub mod service;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

pub use config::BotConfig;
pub use service::{BotService, BotServiceDeps};

pub const BOT_CONFIG_FILENAME: &str = "bot.config.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BotStatus {
    Healthy,
    Unhealthy,
    #[default]
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum StatKind {
    Error,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotHealth {
    pub status: BotStatus,
    pub error_count: u64,
    pub warning_count: u64,
    pub critical_count: u64,
}

/// Health of every bot known to one node, as published to the cluster cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerHealth {
    pub server_id: String,
    pub hostname: String,
    pub bots: BTreeMap<String, BotHealth>,
}

/// Notifications published on the lifecycle bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    BotMounted { bot_id: String },
    AfterBotUnmount { bot_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MountState {
    Unmounted,
    Mounting,
    Mounted,
    Unmounting,
}
