use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, RwLock, Weak};
use std::time::{Duration, Instant};

use anyhow::Result;
use dashmap::DashMap;
use futures::FutureExt;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::content::ContentRegistry;
use super::health::{self, HealthRegistry};
use super::libraries;
use super::{
    BOT_CONFIG_FILENAME, BotConfig, BotHealth, BotStatus, LifecycleEvent, MountState, ServerHealth, StatKind,
};
use crate::broadcast::{Broadcasted, Broadcaster, LocalFn};
use crate::cache::SharedCache;
use crate::config::HostConfig;
use crate::error::{HostError, HostResult};
use crate::hooks::{Hook, HookReport, HookService};
use crate::store::{Scope, SharedStore};

const LIFECYCLE_CAPACITY: usize = 64;

pub struct BotServiceDeps {
    pub config: HostConfig,
    pub store: SharedStore,
    /// Absent on a single node without a shared cache.
    pub cache: Option<SharedCache>,
    pub hooks: Arc<HookService>,
    pub broadcaster: Broadcaster,
}

/// Mounts and unmounts bots on this node and reports their health to the cluster.
pub struct BotService {
    server_id: String,
    hostname: String,
    data_folder: PathBuf,
    health_interval: Duration,
    health_ttl: Duration,
    health_key: String,
    health_pattern: String,
    store: SharedStore,
    cache: Option<SharedCache>,
    hooks: Arc<HookService>,
    content: ContentRegistry,
    health: HealthRegistry,
    states: DashMap<String, MountState>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    bot_ids: RwLock<Option<Vec<String>>>,
    lifecycle: broadcast::Sender<LifecycleEvent>,
    mount: Broadcasted<String, bool>,
    unmount: Broadcasted<String, ()>,
    sync_libs: Broadcasted<(String, String), ()>,
}

/// Adapts a method of the service to a broadcastable function without keeping it alive.
fn bound<A, R, F, Fut>(weak: &Weak<BotService>, fallback: R, f: F) -> LocalFn<A, R>
where
    A: Send + 'static,
    R: Clone + Send + Sync + 'static,
    F: Fn(Arc<BotService>, A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
{
    let weak = weak.clone();
    Arc::new(move |args: A| {
        let pending = weak.upgrade().map(|service| f(service, args));
        let fallback = fallback.clone();
        async move {
            match pending {
                Some(fut) => fut.await,
                None => fallback,
            }
        }
        .boxed()
    })
}

impl BotService {
    pub fn new(deps: BotServiceDeps) -> Arc<Self> {
        let BotServiceDeps {
            config,
            store,
            cache,
            hooks,
            broadcaster,
        } = deps;
        let (lifecycle, _) = broadcast::channel(LIFECYCLE_CAPACITY);
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| config.server_id.clone());

        Arc::new_cyclic(|weak| BotService {
            mount: broadcaster.wrap(
                "mount_bot",
                bound(weak, false, |service, bot_id: String| async move {
                    service.local_mount(&bot_id).await
                }),
            ),
            unmount: broadcaster.wrap(
                "unmount_bot",
                bound(weak, (), |service, bot_id: String| async move {
                    service.local_unmount(&bot_id).await
                }),
            ),
            sync_libs: broadcaster.wrap(
                "sync_libs",
                bound(weak, (), |service, (bot_id, origin): (String, String)| async move {
                    service.local_sync_libs(&bot_id, &origin).await
                }),
            ),
            health_key: config.cache_key(&health::server_key(&config.server_id)),
            health_pattern: config.cache_key(&health::server_key("*")),
            server_id: config.server_id,
            hostname,
            data_folder: config.data_folder,
            health_interval: config.health_interval,
            health_ttl: config.health_ttl,
            store,
            cache,
            hooks,
            content: ContentRegistry::new(),
            health: HealthRegistry::new(),
            states: DashMap::new(),
            locks: DashMap::new(),
            bot_ids: RwLock::new(None),
            lifecycle,
        })
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn content(&self) -> &ContentRegistry {
        &self.content
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle.subscribe()
    }

    /// Mounts the bot on every node of the cluster; returns this node's outcome.
    pub async fn mount_bot(&self, bot_id: &str) -> bool {
        self.mount.call(bot_id.to_string()).await
    }

    pub async fn unmount_bot(&self, bot_id: &str) {
        self.unmount.call(bot_id.to_string()).await
    }

    /// Asks the other nodes to re-extract the bot's libraries produced on `origin`.
    pub async fn sync_libs(&self, bot_id: &str, origin: &str) {
        self.sync_libs
            .call((bot_id.to_string(), origin.to_string()))
            .await
    }

    /// Stores a freshly packed `libraries/node_modules.tgz`, extracts it on this
    /// node and has every other node extract it too.
    pub async fn publish_libraries(&self, bot_id: &str, archive: Vec<u8>) -> HostResult<()> {
        if !self.bot_exists(bot_id).await {
            return Err(HostError::validation("libraries", "botId", format!("unknown bot `{bot_id}`")));
        }
        let store = self.store.as_ref();
        store
            .upsert_file(
                &Scope::Bot(bot_id.to_string()),
                "libraries",
                libraries::NODE_MODULES_ARCHIVE,
                archive,
            )
            .await
            .map_err(HostError::Store)?;
        libraries::extract_node_modules(store, &self.data_folder, bot_id)
            .await
            .map_err(HostError::Store)?;
        self.sync_libs(bot_id, &self.server_id).await;
        Ok(())
    }

    /// Mounts every bot that is not disabled; returns how many are mounted afterwards.
    pub async fn mount_all(&self) -> usize {
        let bots = self.get_bots().await;
        for (bot_id, config) in &bots {
            if config.disabled {
                debug!(bot_id, "skipping disabled bot");
                continue;
            }
            self.mount_bot(bot_id).await;
        }
        self.mounted_bots().len()
    }

    fn lock_for(&self, bot_id: &str) -> Arc<Mutex<()>> {
        self.locks.entry(bot_id.to_string()).or_default().clone()
    }

    fn state(&self, bot_id: &str) -> MountState {
        self.states
            .get(bot_id)
            .map(|s| *s)
            .unwrap_or(MountState::Unmounted)
    }

    fn set_state(&self, bot_id: &str, state: MountState) {
        self.states.insert(bot_id.to_string(), state);
    }

    async fn local_mount(&self, bot_id: &str) -> bool {
        let lock = self.lock_for(bot_id);
        let _guard = lock.lock().await;
        if self.state(bot_id) == MountState::Mounted {
            return true;
        }

        let started = Instant::now();
        self.set_state(bot_id, MountState::Mounting);
        let mounted = match self.try_mount(bot_id).await {
            Ok(()) => {
                self.set_state(bot_id, MountState::Mounted);
                self.health.set_status(bot_id, BotStatus::Healthy);
                self.invalidate_bot_ids();
                let _ = self.lifecycle.send(LifecycleEvent::BotMounted {
                    bot_id: bot_id.to_string(),
                });
                info!(bot_id, "bot mounted");
                true
            }
            Err(e) => {
                self.set_state(bot_id, MountState::Unmounted);
                self.health.increment(bot_id, StatKind::Critical);
                error!(bot_id, "Cannot mount bot \"{bot_id}\": {e}");
                false
            }
        };

        if let Err(e) = self.publish_health().await {
            warn!("could not publish bot health: {e:#}");
        }
        debug!(bot_id, elapsed_ms = started.elapsed().as_millis() as u64, "mount finished");
        mounted
    }

    async fn try_mount(&self, bot_id: &str) -> HostResult<()> {
        let scope = Scope::Bot(bot_id.to_string());
        let exists = self
            .store
            .file_exists(&scope, "", BOT_CONFIG_FILENAME)
            .await
            .map_err(HostError::Store)?;
        if !exists {
            return Err(HostError::configuration(
                bot_id,
                "Make sure it exists on the filesystem or the database",
            ));
        }
        let raw = self
            .store
            .read_to_string(&scope, "", BOT_CONFIG_FILENAME)
            .await
            .map_err(HostError::Store)?;
        BotConfig::parse(bot_id, &raw)?;

        let store = self.store.as_ref();
        self.content.load_content_types(store).await.map_err(HostError::Store)?;
        self.content
            .extract_bot_components(store, bot_id)
            .await
            .map_err(HostError::Store)?;
        self.content
            .load_elements_for_bot(store, bot_id)
            .await
            .map_err(HostError::Store)?;

        libraries::sync_to_disk(store, &self.data_folder, bot_id)
            .await
            .map_err(HostError::Store)?;
        if let Err(e) = libraries::extract_node_modules(store, &self.data_folder, bot_id).await {
            error!(bot_id, "Error extracting node modules: {e:#}");
        }

        self.hooks.execute_hook(&Hook::after_bot_mount(bot_id)).await?;
        Ok(())
    }

    async fn local_unmount(&self, bot_id: &str) {
        let lock = self.lock_for(bot_id);
        let _guard = lock.lock().await;
        if self.state(bot_id) != MountState::Mounted {
            self.invalidate_bot_ids();
            return;
        }

        self.set_state(bot_id, MountState::Unmounting);
        self.content.clear_elements(bot_id);
        if let Err(e) = self.hooks.execute_hook(&Hook::after_bot_unmount(bot_id)).await {
            warn!(bot_id, "after_bot_unmount hook failed: {e}");
        }
        self.set_state(bot_id, MountState::Unmounted);
        self.health.set_status(bot_id, BotStatus::Disabled);

        if let Err(e) = self.publish_health().await {
            warn!("could not publish bot health: {e:#}");
        }
        self.invalidate_bot_ids();
        info!(bot_id, "bot unmounted");
        let _ = self.lifecycle.send(LifecycleEvent::AfterBotUnmount {
            bot_id: bot_id.to_string(),
        });
    }

    async fn local_sync_libs(&self, bot_id: &str, origin: &str) {
        // the origin node produced the archive and already has the files
        if origin == self.server_id {
            return;
        }
        if let Err(e) = libraries::extract_node_modules(self.store.as_ref(), &self.data_folder, bot_id).await {
            error!(bot_id, "Error extracting node modules: {e:#}");
        }
    }

    /// Requests a pipeline stage change. `on_stage_request` scripts may veto it by failing.
    pub async fn change_stage(&self, bot_id: &str, next_stage: &str) -> HostResult<HookReport> {
        let scope = Scope::Bot(bot_id.to_string());
        let raw = self
            .store
            .read_to_string(&scope, "", BOT_CONFIG_FILENAME)
            .await
            .map_err(HostError::Store)?;
        let mut config = BotConfig::parse(bot_id, &raw)?;
        let previous = config.stage().unwrap_or_default().to_string();

        let report = self
            .hooks
            .execute_hook(&Hook::on_stage_change_request(bot_id, &previous, next_stage))
            .await?;

        config.set_stage(next_stage);
        let updated = serde_json::to_vec_pretty(&config).map_err(anyhow::Error::from)?;
        self.store
            .upsert_file(&scope, "", BOT_CONFIG_FILENAME, updated)
            .await
            .map_err(HostError::Store)?;
        info!(bot_id, previous = %previous, next = next_stage, "bot stage changed");

        self.hooks
            .execute_hook(&Hook::after_stage_changed(bot_id, &previous, next_stage))
            .await?;
        Ok(report)
    }

    /// Ids of every bot folder holding a `bot.config.json`, cached until invalidated.
    pub async fn get_bot_ids(&self) -> HostResult<Vec<String>> {
        if let Some(ids) = self.bot_ids.read().ok().and_then(|ids| ids.clone()) {
            return Ok(ids);
        }
        let suffix = format!("/{BOT_CONFIG_FILENAME}");
        let ids: Vec<String> = self
            .store
            .directory_listing(&Scope::Bots, "", BOT_CONFIG_FILENAME)
            .await
            .map_err(HostError::Store)?
            .iter()
            .filter_map(|rel| rel.strip_suffix(&suffix))
            .filter(|dir| !dir.is_empty() && !dir.contains('/'))
            .map(str::to_string)
            .collect();
        if let Ok(mut cached) = self.bot_ids.write() {
            *cached = Some(ids.clone());
        }
        Ok(ids)
    }

    pub fn invalidate_bot_ids(&self) {
        if let Ok(mut cached) = self.bot_ids.write() {
            *cached = None;
        }
    }

    pub async fn bot_exists(&self, bot_id: &str) -> bool {
        self.get_bot_ids()
            .await
            .map(|ids| ids.iter().any(|id| id == bot_id))
            .unwrap_or(false)
    }

    pub async fn find_bot_by_id(&self, bot_id: &str) -> HostResult<Option<BotConfig>> {
        let scope = Scope::Bot(bot_id.to_string());
        if !self
            .store
            .file_exists(&scope, "", BOT_CONFIG_FILENAME)
            .await
            .map_err(HostError::Store)?
        {
            warn!(bot_id, "Bot \"{bot_id}\" not found. Make sure it exists on your filesystem or database.");
            return Ok(None);
        }
        let raw = self
            .store
            .read_to_string(&scope, "", BOT_CONFIG_FILENAME)
            .await
            .map_err(HostError::Store)?;
        BotConfig::parse(bot_id, &raw).map(Some)
    }

    /// Every readable bot config; unreadable ones are logged and skipped.
    pub async fn get_bots(&self) -> BTreeMap<String, BotConfig> {
        let ids = match self.get_bot_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                error!("could not list bots: {e}");
                return BTreeMap::new();
            }
        };
        let mut bots = BTreeMap::new();
        for bot_id in ids {
            match self.find_bot_by_id(&bot_id).await {
                Ok(Some(config)) => {
                    bots.insert(bot_id, config);
                }
                Ok(None) => {}
                Err(e) => error!(bot_id = %bot_id, "Bot configuration file not found for bot \"{bot_id}\": {e}"),
            }
        }
        bots
    }

    pub fn is_bot_mounted(&self, bot_id: &str) -> bool {
        self.state(bot_id) == MountState::Mounted
    }

    pub fn mounted_bots(&self) -> Vec<String> {
        let mut bots: Vec<String> = self
            .states
            .iter()
            .filter(|e| *e.value() == MountState::Mounted)
            .map(|e| e.key().clone())
            .collect();
        bots.sort();
        bots
    }

    pub fn increment_bot_stats(&self, bot_id: &str, kind: StatKind) {
        self.health.increment(bot_id, kind);
    }

    pub fn set_bot_status(&self, bot_id: &str, status: BotStatus) {
        self.health.set_status(bot_id, status);
    }

    pub fn bot_health(&self, bot_id: &str) -> Option<BotHealth> {
        self.health.get(bot_id)
    }

    pub fn local_health(&self) -> ServerHealth {
        ServerHealth {
            server_id: self.server_id.clone(),
            hostname: self.hostname.clone(),
            bots: self.health.snapshot(),
        }
    }

    /// Prunes unknown bots, then writes this node's health with its TTL.
    pub async fn publish_health(&self) -> Result<()> {
        match self.get_bot_ids().await {
            Ok(ids) => self.health.retain_known(&ids),
            Err(e) => warn!("could not list bots to prune health: {e}"),
        }
        let Some(cache) = &self.cache else {
            return Ok(());
        };
        health::publish(cache.as_ref(), &self.health_key, &self.local_health(), self.health_ttl).await
    }

    /// Health of every live node, keyed by server id. Falls back to this node
    /// alone when there is no cache or it cannot be read.
    pub async fn get_bot_health(&self) -> BTreeMap<String, ServerHealth> {
        let local = || BTreeMap::from([(self.server_id.clone(), self.local_health())]);
        let Some(cache) = &self.cache else {
            return local();
        };
        match health::read_all(cache.as_ref(), &self.health_pattern).await {
            Ok(servers) => servers,
            Err(e) => {
                warn!("could not read cluster health, reporting local node only: {e:#}");
                local()
            }
        }
    }

    /// Publishes health every interval until `cancel` fires.
    pub fn spawn_health_reporter(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(service.health_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = service.publish_health().await {
                            warn!("could not publish bot health: {e:#}");
                        }
                    }
                }
            }
            debug!("health reporter stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{ClusterCache, InMemoryClusterCache};
    use crate::hooks::HookServiceOptions;
    use crate::hooks::sandbox::SandboxMode;
    use crate::logger::{Logger, LoggerType};
    use crate::store::{MemoryScriptStore, ScriptStore};
    use once_cell::sync::Lazy;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;
    use worker_channel::LogLevel;

    static CAPTURED: Lazy<StdMutex<Vec<String>>> = Lazy::new(|| StdMutex::new(vec![]));

    #[derive(Clone, Debug, Default, Serialize, Deserialize)]
    struct CaptureLogger;

    #[typetag::serde]
    impl LoggerType for CaptureLogger {
        fn log(&self, _level: LogLevel, _context: &str, msg: &str) {
            CAPTURED.lock().unwrap().push(msg.to_string());
        }
        fn clone_box(&self) -> Box<dyn LoggerType> {
            Box::new(self.clone())
        }
        fn debug_box(&self) -> String {
            "CaptureLogger".into()
        }
    }

    fn captured(msg: &str) -> usize {
        CAPTURED.lock().unwrap().iter().filter(|m| *m == msg).count()
    }

    struct Fixture {
        service: Arc<BotService>,
        store: Arc<MemoryScriptStore>,
        cache: Arc<InMemoryClusterCache>,
        _data: TempDir,
    }

    async fn fixture() -> Fixture {
        let data = TempDir::new().unwrap();
        let mut config = HostConfig::defaults(data.path().to_path_buf());
        config.server_id = "node-1".into();
        let store = MemoryScriptStore::new();
        let cache = InMemoryClusterCache::new();
        let hooks = HookService::new(
            store.clone(),
            HookServiceOptions {
                data_folder: data.path().to_path_buf(),
                mode: SandboxMode::Isolated,
                default_timeout: Duration::from_secs(1),
                debounce: Duration::from_millis(50),
                process: json!({}),
            },
            Logger(Box::new(CaptureLogger)),
        );
        let service = BotService::new(BotServiceDeps {
            config,
            store: store.clone(),
            cache: Some(cache.clone()),
            hooks,
            broadcaster: Broadcaster::disabled(),
        });
        Fixture {
            service,
            store,
            cache,
            _data: data,
        }
    }

    async fn add_bot(store: &MemoryScriptStore, bot_id: &str, config: serde_json::Value) {
        store
            .upsert_file(
                &Scope::Bot(bot_id.into()),
                "",
                BOT_CONFIG_FILENAME,
                config.to_string().into_bytes(),
            )
            .await
            .unwrap();
    }

    fn bot_config(bot_id: &str) -> serde_json::Value {
        json!({ "id": bot_id, "name": bot_id, "languages": ["en"], "defaultLanguage": "en" })
    }

    async fn add_hook(store: &MemoryScriptStore, folder: &str, file: &str, code: &str) {
        store
            .upsert_file(&Scope::Global, &format!("hooks/{folder}"), file, code.as_bytes().to_vec())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn mount_is_idempotent() {
        let f = fixture().await;
        add_bot(&f.store, "idem-bot", bot_config("idem-bot")).await;
        add_hook(&f.store, "after_bot_mount", "count.rhai", r#"print("mounted:" + bot_id);"#).await;
        let mut events = f.service.subscribe();

        assert!(f.service.mount_bot("idem-bot").await);
        assert!(f.service.mount_bot("idem-bot").await);

        assert_eq!(captured("mounted:idem-bot"), 1);
        assert_eq!(
            events.try_recv().unwrap(),
            LifecycleEvent::BotMounted { bot_id: "idem-bot".into() }
        );
        assert!(events.try_recv().is_err());
        assert!(f.service.is_bot_mounted("idem-bot"));
        assert_eq!(f.service.bot_health("idem-bot").unwrap().status, BotStatus::Healthy);
    }

    #[tokio::test]
    async fn concurrent_mounts_run_once() {
        let f = fixture().await;
        add_bot(&f.store, "race-bot", bot_config("race-bot")).await;
        add_hook(&f.store, "after_bot_mount", "count.rhai", r#"print("raced:" + bot_id);"#).await;

        let (a, b) = tokio::join!(f.service.mount_bot("race-bot"), f.service.mount_bot("race-bot"));
        assert!(a && b);
        assert_eq!(captured("raced:race-bot"), 1);
    }

    #[tokio::test]
    async fn failed_mounts_mark_bot_unhealthy() {
        let f = fixture().await;
        assert!(!f.service.mount_bot("ghost").await);
        assert!(!f.service.is_bot_mounted("ghost"));

        let mut bad = bot_config("bad");
        bad["defaultLanguage"] = json!("fr");
        add_bot(&f.store, "bad", bad).await;
        assert!(!f.service.mount_bot("bad").await);
        assert!(!f.service.is_bot_mounted("bad"));
        let health = f.service.bot_health("bad").unwrap();
        assert_eq!((health.status, health.critical_count), (BotStatus::Unhealthy, 1));

        assert!(!f.service.mount_bot("bad").await);
        assert_eq!(f.service.bot_health("bad").unwrap().critical_count, 2);
    }

    #[tokio::test]
    async fn unmount_notifies_and_disables() {
        let f = fixture().await;
        add_bot(&f.store, "welcome", bot_config("welcome")).await;
        assert!(f.service.mount_bot("welcome").await);
        let mut events = f.service.subscribe();

        f.service.unmount_bot("welcome").await;
        assert!(!f.service.is_bot_mounted("welcome"));
        assert_eq!(f.service.bot_health("welcome").unwrap(), BotHealth::default());
        assert_eq!(
            events.recv().await.unwrap(),
            LifecycleEvent::AfterBotUnmount { bot_id: "welcome".into() }
        );

        // unmounting again is a no-op
        f.service.unmount_bot("welcome").await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn bot_ids_are_cached_until_invalidated() {
        let f = fixture().await;
        add_bot(&f.store, "a", bot_config("a")).await;
        assert_eq!(f.service.get_bot_ids().await.unwrap(), vec!["a"]);

        add_bot(&f.store, "b", bot_config("b")).await;
        assert_eq!(f.service.get_bot_ids().await.unwrap(), vec!["a"]);
        f.service.invalidate_bot_ids();
        assert_eq!(f.service.get_bot_ids().await.unwrap(), vec!["a", "b"]);
        assert!(f.service.bot_exists("b").await);
        assert!(f.service.find_bot_by_id("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mount_all_skips_disabled_bots() {
        let f = fixture().await;
        add_bot(&f.store, "on", bot_config("on")).await;
        let mut off = bot_config("off");
        off["disabled"] = json!(true);
        add_bot(&f.store, "off", off).await;

        assert_eq!(f.service.mount_all().await, 1);
        assert_eq!(f.service.mounted_bots(), vec!["on"]);
    }

    #[tokio::test]
    async fn health_is_published_and_pruned() {
        let f = fixture().await;
        add_bot(&f.store, "welcome", bot_config("welcome")).await;
        f.service.set_bot_status("deleted-bot", BotStatus::Healthy);
        assert!(f.service.mount_bot("welcome").await);

        let raw = f.cache.get("bp_server_node-1_bots").await.unwrap().unwrap();
        let published: ServerHealth = serde_json::from_str(&raw).unwrap();
        assert_eq!(published.bots.keys().collect::<Vec<_>>(), vec!["welcome"]);

        let all = f.service.get_bot_health().await;
        assert_eq!(all["node-1"].bots["welcome"].status, BotStatus::Healthy);
    }

    #[tokio::test]
    async fn critical_stats_make_a_bot_unhealthy() {
        let f = fixture().await;
        add_bot(&f.store, "welcome", bot_config("welcome")).await;
        assert!(f.service.mount_bot("welcome").await);

        f.service.increment_bot_stats("welcome", StatKind::Warning);
        assert_eq!(f.service.bot_health("welcome").unwrap().status, BotStatus::Healthy);

        f.service.increment_bot_stats("welcome", StatKind::Critical);
        f.service.publish_health().await.unwrap();
        let health = &f.service.get_bot_health().await["node-1"].bots["welcome"];
        assert_eq!(health.status, BotStatus::Unhealthy);
        assert_eq!((health.warning_count, health.critical_count), (1, 1));
    }

    #[tokio::test]
    async fn libraries_of_unknown_bots_are_rejected() {
        let f = fixture().await;
        let err = f.service.publish_libraries("ghost", vec![1, 2, 3]).await.unwrap_err();
        assert_eq!(err.field(), Some("botId"));
        assert!(!f.store.file_exists(&Scope::Bot("ghost".into()), "libraries", "node_modules.tgz").await.unwrap());
    }

    #[tokio::test]
    async fn stage_change_can_be_vetoed() {
        let f = fixture().await;
        add_bot(&f.store, "welcome", bot_config("welcome")).await;

        f.service.change_stage("welcome", "staging").await.unwrap();
        let config = f.service.find_bot_by_id("welcome").await.unwrap().unwrap();
        assert_eq!(config.stage(), Some("staging"));

        add_hook(&f.store, "on_stage_request", "veto.rhai", r#"throw "frozen";"#).await;
        f.service.hooks.invalidate_path("/data/global/hooks/on_stage_request/veto.rhai");
        let err = f.service.change_stage("welcome", "prod").await.unwrap_err();
        assert!(matches!(err, HostError::Hook { .. }), "{err}");
        let config = f.service.find_bot_by_id("welcome").await.unwrap().unwrap();
        assert_eq!(config.stage(), Some("staging"));
    }
}
