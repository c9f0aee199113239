//! Composition root: wires the services of a front controller and of a worker.
//!
//! Dependency order is store/cache, broadcaster, hook service, bot service and
//! event engine, then the orchestrator and the internal HTTP surface.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::FutureExt;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use worker_channel::{StartWorkerParams, WorkerEnv};

use crate::bots::{BotService, BotServiceDeps, LifecycleEvent, health};
use crate::broadcast::{Broadcaster, ClusterTransport, InMemoryClusterBus};
use crate::cache::{InMemoryClusterCache, SharedCache};
use crate::config::HostConfig;
use crate::dialog::{InMemorySessionRepository, StateManager};
use crate::engine::{EventDispatcher, EventEngine};
use crate::error::{HostError, HostResult};
use crate::event::{Event, parse_event};
use crate::hooks::{Hook, HookService, HookServiceOptions};
use crate::http::{self, InternalApi};
use crate::logger::{IO_TARGET, Logger};
use crate::orchestrator::launcher::{InProcessWorker, WorkerBody, WorkerLauncher};
use crate::orchestrator::{CoreClient, FrontController, Master, MasterOptions};
use crate::store::{DiskScriptStore, ScriptStore, SharedStore};
use crate::watcher::DirectoryWatcher;

const SESSION_IDLE: Duration = Duration::from_secs(30 * 60);
const EVENT_BUS_CAPACITY: usize = 256;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Storage and cluster plumbing shared by every node of one process.
#[derive(Clone)]
pub struct Infrastructure {
    pub store: SharedStore,
    pub cache: SharedCache,
    pub transport: Arc<dyn ClusterTransport>,
}

impl Infrastructure {
    /// Disk store rooted at `data_folder` with in-memory cache and bus.
    pub fn local(data_folder: &Path) -> Self {
        Self {
            store: DiskScriptStore::new(data_folder),
            cache: InMemoryClusterCache::new(),
            transport: InMemoryClusterBus::new(EVENT_BUS_CAPACITY),
        }
    }
}

/// Named events relayed between the nodes' internal APIs.
pub type CoreEvents = broadcast::Sender<(String, Value)>;

fn lifecycle_name(event: &LifecycleEvent) -> (&'static str, &str) {
    match event {
        LifecycleEvent::BotMounted { bot_id } => ("bot_mounted", bot_id),
        LifecycleEvent::AfterBotUnmount { bot_id } => ("after_bot_unmount", bot_id),
    }
}

/// Incoming events go to the dialog engine's inbox; outgoing ones to the front
/// controller, or to the local outbox when the worker runs standalone.
struct WorkerDispatcher {
    core: Option<CoreClient>,
    inbox: broadcast::Sender<Event>,
    outbox: broadcast::Sender<Event>,
}

#[async_trait]
impl EventDispatcher for WorkerDispatcher {
    async fn dispatch(&self, event: Event) -> Result<()> {
        if event.is_incoming() {
            if self.inbox.send(event).is_err() {
                debug!("no dialog engine attached, incoming event dropped");
            }
            return Ok(());
        }
        match &self.core {
            Some(core) => core.send_outgoing(&event).await,
            None => {
                let _ = self.outbox.send(event);
                Ok(())
            }
        }
    }
}

struct WorkerApi {
    engine: Arc<EventEngine>,
    bots: Arc<BotService>,
    core_events: CoreEvents,
}

#[async_trait]
impl InternalApi for WorkerApi {
    async fn send_event(&self, event: Value) -> HostResult<()> {
        self.engine.send_raw_event(event).await.map(|_| ())
    }

    async fn emit_event(&self, name: String, args: Value) -> HostResult<()> {
        debug!(event = %name, "core event received");
        let _ = self.core_events.send((name, args));
        Ok(())
    }

    async fn health(&self) -> Value {
        serde_json::to_value(self.bots.get_bot_health().await).unwrap_or(Value::Null)
    }

    async fn publish_libraries(&self, bot_id: String, archive: Vec<u8>) -> HostResult<()> {
        self.bots.publish_libraries(&bot_id, archive).await
    }
}

/// How a worker is exposed.
#[derive(Debug, Clone, Default)]
pub struct WorkerOptions {
    /// Port of the internal API; `None` picks any free port.
    pub port: Option<u16>,
    /// Front controller client; `None` runs the worker standalone.
    pub core: Option<CoreClient>,
    /// Poll interval of the hook source watcher; `None` disables it.
    pub watch_poll: Option<Duration>,
}

/// A running worker node.
pub struct WorkerApp {
    pub bots: Arc<BotService>,
    pub engine: Arc<EventEngine>,
    pub hooks: Arc<HookService>,
    pub sessions: Arc<StateManager>,
    pub inbox: broadcast::Sender<Event>,
    pub outbox: broadcast::Sender<Event>,
    pub core_events: CoreEvents,
    pub port: u16,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    watcher: Option<DirectoryWatcher>,
}

pub async fn bootstrap_worker(
    config: HostConfig,
    infra: Infrastructure,
    logger: Logger,
    options: WorkerOptions,
) -> Result<WorkerApp> {
    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    let broadcaster = if config.cluster_enabled {
        Broadcaster::clustered(config.server_id.clone(), infra.transport.clone())
    } else {
        Broadcaster::disabled()
    };

    let hooks = HookService::new(infra.store.clone(), HookServiceOptions::from_config(&config), logger);
    let watcher = match options.watch_poll {
        Some(poll) if infra.store.is_disk_backed() => match hooks.watch(poll) {
            Ok(w) => Some(w),
            Err(e) => {
                warn!("hook sources will not be watched: {e:#}");
                None
            }
        },
        _ => None,
    };

    let bots = BotService::new(BotServiceDeps {
        config: config.clone(),
        store: infra.store.clone(),
        cache: Some(infra.cache.clone()),
        hooks: hooks.clone(),
        broadcaster: broadcaster.clone(),
    });
    if let Some(listener) = broadcaster.listen() {
        tasks.push(listener);
    }
    if let Err(e) = bots.content().load_content_types(infra.store.as_ref()).await {
        warn!("could not load content types: {e:#}");
    }

    let (inbox, _) = broadcast::channel(EVENT_BUS_CAPACITY);
    let (outbox, _) = broadcast::channel(EVENT_BUS_CAPACITY);
    let engine = Arc::new(EventEngine::new(
        config.is_production,
        Arc::new(WorkerDispatcher {
            core: options.core.clone(),
            inbox: inbox.clone(),
            outbox: outbox.clone(),
        }),
    ));

    let sessions = StateManager::new(
        InMemorySessionRepository::new(SESSION_IDLE),
        Some(infra.cache.clone()),
        config.distributed_sessions,
        config.cache_scope.clone(),
    );
    tasks.push(sessions.spawn_unmount_cleanup(bots.subscribe()));
    if let Some(core) = options.core.clone() {
        tasks.push(forward_lifecycle(core, bots.subscribe()));
    }
    tasks.push(bots.spawn_health_reporter(cancel.clone()));

    let (core_events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
    let listener = TcpListener::bind(("127.0.0.1", options.port.unwrap_or(0)))
        .await
        .context("could not bind the worker internal api")?;
    let port = listener.local_addr()?.port();
    let api = Arc::new(WorkerApi {
        engine: engine.clone(),
        bots: bots.clone(),
        core_events: core_events.clone(),
    });
    tasks.push(spawn_server(listener, http::router(api, &config.internal_password), cancel.clone()));

    if let Err(e) = hooks.execute_hook(&Hook::after_server_start()).await {
        error!("after_server_start hooks failed: {e}");
    }
    let mounted = bots.mount_all().await;
    info!(port, mounted, server_id = %config.server_id, "worker ready");

    Ok(WorkerApp {
        bots,
        engine,
        hooks,
        sessions,
        inbox,
        outbox,
        core_events,
        port,
        cancel,
        tasks,
        watcher,
    })
}

impl WorkerApp {
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(watcher) = self.watcher.take() {
            watcher.shutdown();
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        info!(port = self.port, "worker stopped");
    }
}

fn spawn_server(listener: TcpListener, router: axum::Router, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = http::serve(listener, router, cancel).await {
            error!("internal api stopped: {e:#}");
        }
    })
}

/// Relays every lifecycle event of this worker to the front controller.
fn forward_lifecycle(core: CoreClient, mut events: broadcast::Receiver<LifecycleEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let (name, bot_id) = lifecycle_name(&event);
                    if let Err(e) = core.emit_event(name, json!({ "botId": bot_id })).await {
                        warn!(event = name, "could not forward lifecycle event: {e:#}");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => warn!("lifecycle forwarder missed {n} events"),
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Overlays what the master passed through the worker environment.
/// Each worker gets its own `server_id` so siblings keep separate health entries
/// and hear each other's broadcasts.
pub fn apply_worker_env(config: &mut HostConfig, env: &WorkerEnv) {
    config.server_id = format!("{}-{}", env.server_id, env.worker_id);
    config.internal_password = env.internal_password.clone();
    config.project_location = env.project_location.clone();
    config.data_folder = env.data_folder.clone();
    config.pro_enabled = env.pro_enabled;
    config.external_url = env.external_url.clone();
    config.root_path = env.root_path.clone();
    config.app_secret = env.app_secret.clone();
}

/// Worker body for [`crate::orchestrator::InProcessLauncher`]: a full worker
/// running as a task of the master's process.
pub fn in_process_worker(config: HostConfig, infra: Infrastructure, logger: Logger) -> WorkerBody {
    Arc::new(move |worker: InProcessWorker| {
        let mut config = config.clone();
        let infra = infra.clone();
        let logger = logger.clone();
        async move {
            apply_worker_env(&mut config, &worker.env);
            let options = WorkerOptions {
                port: Some(worker.env.port),
                core: Some(CoreClient::from_env(&worker.env)),
                watch_poll: None,
            };
            let app = bootstrap_worker(config, infra, logger, options).await?;
            worker.announce_ready(app.port);
            worker.shutdown.cancelled().await;
            app.shutdown().await;
            Ok(())
        }
        .boxed()
    })
}

struct FrontApi {
    front: Arc<FrontController>,
    is_production: bool,
    outbox: broadcast::Sender<Event>,
    core_events: CoreEvents,
    cache: SharedCache,
    health_pattern: String,
}

#[async_trait]
impl InternalApi for FrontApi {
    async fn send_event(&self, event: Value) -> HostResult<()> {
        let event = parse_event(event, self.is_production)?;
        if event.is_incoming() {
            return self.front.send_incoming(&event).await;
        }
        tracing::info!(
            target: IO_TARGET,
            event_id = %event.id,
            bot_id = %event.bot_id,
            channel = %event.channel,
            "outgoing event received from worker"
        );
        let _ = self.outbox.send(event);
        Ok(())
    }

    async fn emit_event(&self, name: String, args: Value) -> HostResult<()> {
        info!(event = %name, "worker event");
        let _ = self.core_events.send((name, args));
        Ok(())
    }

    async fn health(&self) -> Value {
        match health::read_all(self.cache.as_ref(), &self.health_pattern).await {
            Ok(servers) => serde_json::to_value(servers).unwrap_or(Value::Null),
            Err(e) => {
                warn!("could not read cluster health: {e:#}");
                json!({})
            }
        }
    }
}

pub struct FrontOptions {
    pub launcher: Arc<dyn WorkerLauncher>,
    pub workers: usize,
    /// Port of the front internal API; `None` uses the configured one.
    pub port: Option<u16>,
}

/// The front controller, the master it drives and its internal API.
pub struct FrontApp {
    pub master: Arc<Master>,
    pub front: Arc<FrontController>,
    pub outbox: broadcast::Sender<Event>,
    pub core_events: CoreEvents,
    pub port: u16,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

pub async fn bootstrap_front(config: &HostConfig, cache: SharedCache, options: FrontOptions) -> Result<FrontApp> {
    let cancel = CancellationToken::new();
    let listener = TcpListener::bind(("127.0.0.1", options.port.unwrap_or(config.front_port)))
        .await
        .context("could not bind the front internal api")?;
    let port = listener.local_addr()?.port();

    let mut master_options = MasterOptions::from_config(config);
    master_options.core_port = port;
    let master = Master::new(master_options, options.launcher);
    let (control_tx, control_rx) = tokio::sync::mpsc::channel(16);
    let front = FrontController::new(control_tx, config.internal_password.clone());
    let mut tasks = vec![
        master.spawn_control_loop(control_rx),
        front.spawn_event_loop(master.subscribe()),
    ];

    let (outbox, _) = broadcast::channel(EVENT_BUS_CAPACITY);
    let (core_events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
    let api = Arc::new(FrontApi {
        front: front.clone(),
        is_production: config.is_production,
        outbox: outbox.clone(),
        core_events: core_events.clone(),
        cache,
        health_pattern: config.cache_key(&health::server_key("*")),
    });
    tasks.push(spawn_server(listener, http::router(api, &config.internal_password), cancel.clone()));

    let params = StartWorkerParams {
        external_url: config.external_url.clone(),
        root_path: config.root_path.clone(),
        app_secret: config.app_secret.clone(),
        front_port: port,
        pro_enabled: config.pro_enabled,
    };
    for _ in 0..options.workers {
        front.request_start(params.clone()).await?;
    }
    info!(port, workers = options.workers, "front controller started");

    Ok(FrontApp {
        master,
        front,
        outbox,
        core_events,
        port,
        cancel,
        tasks,
    })
}

impl FrontApp {
    pub async fn send_incoming(&self, event: &Event) -> HostResult<()> {
        self.front.send_incoming(event).await
    }

    pub async fn shutdown(self) {
        self.master.shutdown(SHUTDOWN_GRACE).await;
        self.cancel.cancel();
        for task in self.tasks {
            task.abort();
        }
        info!("front controller stopped");
    }
}

/// Rejects data folders that do not exist instead of silently creating them.
pub fn ensure_data_folder(config: &HostConfig) -> HostResult<()> {
    if config.data_folder.is_dir() {
        return Ok(());
    }
    Err(HostError::validation(
        "config",
        "BP_DATA_FOLDER",
        format!("`{}` is not a directory", config.data_folder.display()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Direction;
    use crate::store::Scope;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> HostConfig {
        let mut config = HostConfig::defaults(dir.path().to_path_buf());
        config.server_id = "node-a".into();
        config.internal_password = "secret".into();
        config
    }

    #[tokio::test]
    async fn standalone_worker_mounts_bots_and_routes_events() {
        let dir = TempDir::new().unwrap();
        let infra = Infrastructure::local(dir.path());
        let bot = Scope::Bot("welcome".into());
        infra
            .store
            .upsert_file(
                &bot,
                "",
                "bot.config.json",
                json!({ "id": "welcome", "name": "Welcome", "languages": ["en"], "defaultLanguage": "en" })
                    .to_string()
                    .into_bytes(),
            )
            .await
            .unwrap();

        let app = bootstrap_worker(config(&dir), infra, Logger::tracing(), WorkerOptions::default())
            .await
            .unwrap();
        assert!(app.bots.is_bot_mounted("welcome"));

        let mut inbox = app.inbox.subscribe();
        let mut outbox = app.outbox.subscribe();
        let incoming = Event::new("welcome", "web", "u1", Direction::Incoming, json!({ "type": "text", "text": "hi" }));
        app.engine.send_event(incoming.clone()).await.unwrap();
        assert_eq!(inbox.recv().await.unwrap().id, incoming.id);

        app.engine
            .reply_to_event(&incoming, vec![json!({ "type": "text", "text": "hello" })], Some(&incoming.id))
            .await
            .unwrap();
        let reply = outbox.recv().await.unwrap();
        assert_eq!(reply.incoming_event_id.as_deref(), Some(incoming.id.as_str()));

        app.shutdown().await;
    }

    #[test]
    fn worker_env_overrides_config() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        let env = WorkerEnv::from_lookup(|key| {
            Some(match key {
                "WORKER_ID" => "3".into(),
                "PORT" => "3003".into(),
                "CORE_PORT" => "3100".into(),
                "SERVER_ID" => "node-b".into(),
                "PRO_ENABLED" => "true".into(),
                _ => "v".into(),
            })
        })
        .unwrap();
        apply_worker_env(&mut config, &env);
        assert_eq!(config.server_id, "node-b-3");
        assert!(config.pro_enabled);
        assert_eq!(config.internal_password, "v");
    }

    fn sibling_env(worker_id: u64, dir: &TempDir) -> WorkerEnv {
        WorkerEnv {
            worker_id,
            port: 0,
            internal_password: "secret".into(),
            project_location: dir.path().to_path_buf(),
            app_data_path: dir.path().to_path_buf(),
            data_folder: dir.path().to_path_buf(),
            server_id: "node-a".into(),
            pro_enabled: false,
            core_port: 0,
            external_url: String::new(),
            root_path: String::new(),
            app_secret: String::new(),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sibling_workers_keep_separate_identities() {
        let dir = TempDir::new().unwrap();
        let infra = Infrastructure::local(dir.path());
        infra
            .store
            .upsert_file(
                &Scope::Bot("welcome".into()),
                "",
                "bot.config.json",
                json!({ "id": "welcome", "name": "Welcome", "languages": ["en"], "defaultLanguage": "en" })
                    .to_string()
                    .into_bytes(),
            )
            .await
            .unwrap();

        let mut apps = Vec::new();
        for worker_id in [1, 2] {
            let mut config = config(&dir);
            config.cluster_enabled = true;
            apply_worker_env(&mut config, &sibling_env(worker_id, &dir));
            let app = bootstrap_worker(config, infra.clone(), Logger::tracing(), WorkerOptions::default())
                .await
                .unwrap();
            apps.push(app);
        }
        assert!(apps.iter().all(|a| a.bots.is_bot_mounted("welcome")));

        let mut servers = Vec::new();
        for _ in 0..100 {
            servers = apps[0].bots.get_bot_health().await.into_keys().collect::<Vec<_>>();
            if servers.len() == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(servers, vec!["node-a-1", "node-a-2"]);

        // the sibling is no longer mistaken for the origin of the broadcast
        apps[0].bots.unmount_bot("welcome").await;
        let mut unmounted = false;
        for _ in 0..100 {
            if !apps[1].bots.is_bot_mounted("welcome") {
                unmounted = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(unmounted);

        for app in apps {
            app.shutdown().await;
        }
    }

    #[test]
    fn missing_data_folder_is_rejected() {
        let config = HostConfig::defaults("/definitely/not/here".into());
        assert!(matches!(ensure_data_folder(&config), Err(HostError::Validation { .. })));
    }
}
