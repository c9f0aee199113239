use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display, Default,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Critical,
}

/// JSON-RPC methods understood on the worker control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr, Display, Serialize, Deserialize)]
#[strum(serialize_all = "camelCase")]
pub enum Method {
    /// worker → master: the internal HTTP surface is listening
    WorkerReady,
    /// master → worker: stop accepting work and exit
    Shutdown,
}

/// Parameters the front controller hands to the master when asking for a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartWorkerParams {
    pub external_url: String,
    pub root_path: String,
    pub app_secret: String,
    pub front_port: u16,
    pub pro_enabled: bool,
}

/// Messages travelling from the front controller to the master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "params")]
pub enum ControlMessage {
    StartWorker(StartWorkerParams),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerReadyParams {
    pub port: u16,
}

pub const ENV_PORT: &str = "PORT";
pub const ENV_INTERNAL_PASSWORD: &str = "INTERNAL_PASSWORD";
pub const ENV_PROJECT_LOCATION: &str = "PROJECT_LOCATION";
pub const ENV_APP_DATA_PATH: &str = "APP_DATA_PATH";
pub const ENV_DATA_FOLDER: &str = "BP_DATA_FOLDER";
pub const ENV_SERVER_ID: &str = "SERVER_ID";
pub const ENV_WORKER_ID: &str = "WORKER_ID";
pub const ENV_PRO_ENABLED: &str = "PRO_ENABLED";
pub const ENV_CORE_PORT: &str = "CORE_PORT";
pub const ENV_EXTERNAL_URL: &str = "EXTERNAL_URL";
pub const ENV_ROOT_PATH: &str = "ROOT_PATH";
pub const ENV_APP_SECRET: &str = "APP_SECRET";
pub const ENV_IS_WORKER: &str = "IS_WORKER";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvError {
    #[error("missing worker environment variable `{0}`")]
    Missing(&'static str),
    #[error("invalid value `{value}` for worker environment variable `{key}`")]
    Invalid { key: &'static str, value: String },
}

/// Startup parameters of a spawned worker, passed through its environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEnv {
    pub worker_id: u64,
    pub port: u16,
    pub internal_password: String,
    pub project_location: PathBuf,
    pub app_data_path: PathBuf,
    pub data_folder: PathBuf,
    pub server_id: String,
    pub pro_enabled: bool,
    pub core_port: u16,
    pub external_url: String,
    pub root_path: String,
    pub app_secret: String,
}

impl WorkerEnv {
    pub fn to_vars(&self) -> Vec<(String, String)> {
        vec![
            (ENV_WORKER_ID.into(), self.worker_id.to_string()),
            (ENV_PORT.into(), self.port.to_string()),
            (ENV_INTERNAL_PASSWORD.into(), self.internal_password.clone()),
            (
                ENV_PROJECT_LOCATION.into(),
                self.project_location.display().to_string(),
            ),
            (
                ENV_APP_DATA_PATH.into(),
                self.app_data_path.display().to_string(),
            ),
            (ENV_DATA_FOLDER.into(), self.data_folder.display().to_string()),
            (ENV_SERVER_ID.into(), self.server_id.clone()),
            (ENV_PRO_ENABLED.into(), self.pro_enabled.to_string()),
            (ENV_CORE_PORT.into(), self.core_port.to_string()),
            (ENV_EXTERNAL_URL.into(), self.external_url.clone()),
            (ENV_ROOT_PATH.into(), self.root_path.clone()),
            (ENV_APP_SECRET.into(), self.app_secret.clone()),
            (ENV_IS_WORKER.into(), "true".into()),
        ]
    }

    /// Rebuilds the parameters from any key lookup (the process environment in production).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, EnvError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &'static str| lookup(key).ok_or(EnvError::Missing(key));
        let optional = |key: &'static str| lookup(key).unwrap_or_default();

        Ok(Self {
            worker_id: parse(ENV_WORKER_ID, required(ENV_WORKER_ID)?)?,
            port: parse(ENV_PORT, required(ENV_PORT)?)?,
            internal_password: required(ENV_INTERNAL_PASSWORD)?,
            project_location: PathBuf::from(required(ENV_PROJECT_LOCATION)?),
            app_data_path: PathBuf::from(optional(ENV_APP_DATA_PATH)),
            data_folder: PathBuf::from(required(ENV_DATA_FOLDER)?),
            server_id: required(ENV_SERVER_ID)?,
            pro_enabled: optional(ENV_PRO_ENABLED) == "true",
            core_port: parse(ENV_CORE_PORT, required(ENV_CORE_PORT)?)?,
            external_url: optional(ENV_EXTERNAL_URL),
            root_path: optional(ENV_ROOT_PATH),
            app_secret: optional(ENV_APP_SECRET),
        })
    }

    pub fn from_env() -> Result<Self, EnvError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// The external parameters this worker was started with.
    pub fn start_params(&self) -> StartWorkerParams {
        StartWorkerParams {
            external_url: self.external_url.clone(),
            root_path: self.root_path.clone(),
            app_secret: self.app_secret.clone(),
            front_port: self.core_port,
            pro_enabled: self.pro_enabled,
        }
    }
}

fn parse<T: std::str::FromStr>(key: &'static str, value: String) -> Result<T, EnvError> {
    value
        .parse()
        .map_err(|_| EnvError::Invalid { key, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn sample() -> WorkerEnv {
        WorkerEnv {
            worker_id: 4,
            port: 3002,
            internal_password: "s3cret".into(),
            project_location: PathBuf::from("/srv/bot"),
            app_data_path: PathBuf::from("/var/lib/bot"),
            data_folder: PathBuf::from("/srv/bot/data"),
            server_id: "node-a".into(),
            pro_enabled: true,
            core_port: 3100,
            external_url: "https://bots.example.com".into(),
            root_path: "/studio".into(),
            app_secret: "app".into(),
        }
    }

    #[test]
    fn start_worker_message_wire_format() {
        let msg = ControlMessage::StartWorker(sample().start_params());
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "StartWorker");
        assert_eq!(v["params"]["externalUrl"], "https://bots.example.com");
        assert_eq!(v["params"]["frontPort"], 3100);
        assert_eq!(v["params"]["proEnabled"], true);
    }

    #[test]
    fn env_survives_the_spawn_environment() {
        let env = sample();
        let vars: HashMap<String, String> = env.to_vars().into_iter().collect();
        let rebuilt = WorkerEnv::from_lookup(|k| vars.get(k).cloned()).unwrap();
        assert_eq!(rebuilt, env);
    }

    #[test]
    fn missing_port_is_reported() {
        let mut vars: HashMap<String, String> = sample().to_vars().into_iter().collect();
        vars.remove(ENV_PORT);
        let err = WorkerEnv::from_lookup(|k| vars.get(k).cloned()).unwrap_err();
        assert_eq!(err, EnvError::Missing(ENV_PORT));
    }

    #[test]
    fn invalid_port_is_reported() {
        let mut vars: HashMap<String, String> = sample().to_vars().into_iter().collect();
        vars.insert(ENV_PORT.into(), "not-a-port".into());
        let err = WorkerEnv::from_lookup(|k| vars.get(k).cloned()).unwrap_err();
        assert!(matches!(err, EnvError::Invalid { key: ENV_PORT, .. }));
    }

    #[test]
    fn log_level_parses_lowercase() {
        assert_eq!("warn".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!(LogLevel::Critical.to_string(), "critical");
    }
}
