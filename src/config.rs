use async_trait::async_trait;
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{env, path::PathBuf, str::FromStr, time::Duration};
use tracing::{info, warn};

use crate::error::{HostError, HostResult};

/// Key/value source the host reads its settings from.
#[async_trait]
#[typetag::serde]
pub trait ConfigManagerType: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

#[derive(Serialize, Deserialize)]
pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl ConfigManager {
    pub async fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).await
    }
}

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Process environment, optionally seeded from a `.env` file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvConfigManager {
    env_file: PathBuf,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        if env_file.exists() {
            match dotenvy::from_path(&env_file) {
                Ok(()) => info!("Loaded .env from {}", env_file.display()),
                Err(e) => warn!("could not parse {}: {e}", env_file.display()),
            }
        } else {
            info!("no .env at {}, using the process environment", env_file.display());
        }

        Box::new(Self { env_file })
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("EnvConfigManager({})", self.env_file.display())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct MapConfigManager {
    #[schemars(with = "std::collections::HashMap<String, String>")]
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self::default())
    }

    pub fn with(pairs: &[(&str, &str)]) -> Box<Self> {
        let mgr = Self::default();
        for (k, v) in pairs {
            mgr.map.insert(k.to_string(), v.to_string());
        }
        Box::new(mgr)
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

/// Settings shared by the front controller, the master and the workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    /// Skips event validation when set.
    pub is_production: bool,
    pub cluster_enabled: bool,
    pub server_id: String,
    /// Optional prefix for every cluster cache key.
    pub cache_scope: Option<String>,
    /// Session state is mirrored in the cluster cache.
    pub distributed_sessions: bool,
    pub health_interval: Duration,
    pub health_ttl: Duration,
    pub hook_timeout: Duration,
    pub hooks_debounce: Duration,
    pub hooks_outside_sandbox: bool,
    pub data_folder: PathBuf,
    pub project_location: PathBuf,
    pub worker_base_port: u16,
    pub internal_password: String,
    pub external_url: String,
    pub root_path: String,
    pub app_secret: String,
    pub front_port: u16,
    pub pro_enabled: bool,
    pub worker_executable: Option<PathBuf>,
    pub version: String,
}

impl HostConfig {
    /// Defaults for a single-node development host rooted at `data_folder`.
    pub fn defaults(data_folder: PathBuf) -> Self {
        let server_id = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());
        Self {
            is_production: false,
            cluster_enabled: false,
            server_id,
            cache_scope: None,
            distributed_sessions: false,
            health_interval: Duration::from_millis(15_000),
            health_ttl: Duration::from_millis(20_000),
            hook_timeout: Duration::from_millis(1_000),
            hooks_debounce: Duration::from_millis(2_000),
            hooks_outside_sandbox: false,
            project_location: data_folder
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            data_folder,
            worker_base_port: 3000,
            internal_password: uuid::Uuid::new_v4().to_string(),
            external_url: String::new(),
            root_path: String::new(),
            app_secret: String::new(),
            front_port: 3100,
            pro_enabled: false,
            worker_executable: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub async fn load(config: &ConfigManager) -> HostResult<Self> {
        let data_folder = config
            .get("BP_DATA_FOLDER")
            .await
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data"));
        let mut cfg = Self::defaults(data_folder);

        cfg.is_production = flag(config, "BP_PRODUCTION", cfg.is_production).await?;
        cfg.cluster_enabled = flag(config, "CLUSTER_ENABLED", cfg.cluster_enabled).await?;
        if let Some(id) = config.get("SERVER_ID").await {
            cfg.server_id = id;
        }
        cfg.cache_scope = config.get("BP_CACHE_SCOPE").await.filter(|s| !s.is_empty());
        cfg.distributed_sessions = flag(config, "USE_REDIS_STATE", false).await?;
        cfg.health_interval = millis(config, "BOT_HEALTH_INTERVAL_MS", cfg.health_interval).await?;
        cfg.health_ttl = millis(config, "BOT_HEALTH_TTL_MS", cfg.health_ttl).await?;
        cfg.hook_timeout = millis(config, "HOOK_TIMEOUT_MS", cfg.hook_timeout).await?;
        cfg.hooks_debounce = millis(config, "HOOKS_DEBOUNCE_MS", cfg.hooks_debounce).await?;
        cfg.hooks_outside_sandbox = flag(config, "HOOKS_RUN_OUTSIDE_SANDBOX", false).await?;
        if let Some(p) = config.get("PROJECT_LOCATION").await {
            cfg.project_location = PathBuf::from(p);
        }
        cfg.worker_base_port = parsed(config, "WORKER_BASE_PORT", cfg.worker_base_port).await?;
        if let Some(pw) = config.get("INTERNAL_PASSWORD").await {
            cfg.internal_password = pw;
        }
        cfg.external_url = config.get("EXTERNAL_URL").await.unwrap_or_default();
        cfg.root_path = config.get("ROOT_PATH").await.unwrap_or_default();
        cfg.app_secret = config.get("APP_SECRET").await.unwrap_or_default();
        cfg.front_port = parsed(config, "FRONT_PORT", cfg.front_port).await?;
        cfg.pro_enabled = flag(config, "PRO_ENABLED", false).await?;
        cfg.worker_executable = config.get("WORKER_EXECUTABLE").await.map(PathBuf::from);

        if cfg.health_ttl <= cfg.health_interval {
            return Err(HostError::validation(
                "config",
                "BOT_HEALTH_TTL_MS",
                "must be longer than BOT_HEALTH_INTERVAL_MS",
            ));
        }
        Ok(cfg)
    }

    /// Prefixes `key` with the configured cache scope.
    pub fn cache_key(&self, key: &str) -> String {
        match &self.cache_scope {
            Some(scope) => format!("{scope}:{key}"),
            None => key.to_string(),
        }
    }
}

async fn parsed<T: FromStr>(config: &ConfigManager, key: &str, default: T) -> HostResult<T> {
    match config.get(key).await {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| HostError::validation("config", key, format!("cannot parse `{raw}`"))),
    }
}

async fn millis(config: &ConfigManager, key: &str, default: Duration) -> HostResult<Duration> {
    let ms: u64 = parsed(config, key, default.as_millis() as u64).await?;
    if ms == 0 {
        return Err(HostError::validation("config", key, "must be greater than zero"));
    }
    Ok(Duration::from_millis(ms))
}

async fn flag(config: &ConfigManager, key: &str, default: bool) -> HostResult<bool> {
    match config.get(key).await.as_deref().map(str::trim) {
        None => Ok(default),
        Some("true") | Some("1") | Some("yes") => Ok(true),
        Some("false") | Some("0") | Some("no") | Some("") => Ok(false),
        Some(other) => Err(HostError::validation(
            "config",
            key,
            format!("expected a boolean, got `{other}`"),
        )),
    }
}
