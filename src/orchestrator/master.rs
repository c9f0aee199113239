use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::{Result, bail};
use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::net::TcpListener;
use tokio::sync::{Notify, broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use worker_channel::jsonrpc::Request;
use worker_channel::worker_runtime::shutdown_request;
use worker_channel::{ControlMessage, Method, StartWorkerParams, WorkerEnv, WorkerEvent, WorkerExit, WorkerReadyParams};

use super::launcher::WorkerLauncher;
use super::{MasterEvent, WorkerInfo, WorkerState};
use crate::config::HostConfig;

const PORT_PROBE_LIMIT: u32 = 1000;

/// Everything a worker inherits from the master besides its start parameters.
#[derive(Debug, Clone)]
pub struct MasterOptions {
    pub base_port: u16,
    pub internal_password: String,
    pub project_location: PathBuf,
    pub app_data_path: PathBuf,
    pub data_folder: PathBuf,
    pub server_id: String,
    /// Port of the front controller's internal HTTP surface.
    pub core_port: u16,
}

impl MasterOptions {
    pub fn from_config(config: &HostConfig) -> Self {
        Self {
            base_port: config.worker_base_port,
            internal_password: config.internal_password.clone(),
            project_location: config.project_location.clone(),
            app_data_path: config.data_folder.join("app"),
            data_folder: config.data_folder.clone(),
            server_id: config.server_id.clone(),
            core_port: config.front_port,
        }
    }
}

struct WorkerEntry {
    info: WorkerInfo,
    kill: Option<oneshot::Sender<()>>,
    control: mpsc::Sender<Request>,
}

/// Owns the worker processes: starts them, watches them and restarts them on exit.
pub struct Master {
    options: MasterOptions,
    launcher: Arc<dyn WorkerLauncher>,
    next_id: AtomicU64,
    last_port: Mutex<Option<u16>>,
    start_lock: tokio::sync::Mutex<()>,
    workers: DashMap<u64, WorkerEntry>,
    shutting_down: AtomicBool,
    events: broadcast::Sender<MasterEvent>,
    rpc: mpsc::UnboundedSender<WorkerEvent>,
    changed: Notify,
}

impl Master {
    pub fn new(options: MasterOptions, launcher: Arc<dyn WorkerLauncher>) -> Arc<Self> {
        let (rpc, rpc_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);
        let master = Arc::new(Self {
            options,
            launcher,
            next_id: AtomicU64::new(1),
            last_port: Mutex::new(None),
            start_lock: tokio::sync::Mutex::new(()),
            workers: DashMap::new(),
            shutting_down: AtomicBool::new(false),
            events,
            rpc,
            changed: Notify::new(),
        });
        tokio::spawn(Self::handle_notifications(Arc::downgrade(&master), rpc_rx));
        master
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MasterEvent> {
        self.events.subscribe()
    }

    pub fn workers(&self) -> Vec<WorkerInfo> {
        let mut workers: Vec<WorkerInfo> = self.workers.iter().map(|w| w.info.clone()).collect();
        workers.sort_by_key(|w| w.id);
        workers
    }

    /// Serves `StartWorker` requests from the front controller, one at a time.
    pub fn spawn_control_loop(self: &Arc<Self>, mut control: mpsc::Receiver<ControlMessage>) -> JoinHandle<()> {
        let master = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(message) = control.recv().await {
                let Some(master) = master.upgrade() else { break };
                match message {
                    ControlMessage::StartWorker(params) => {
                        if let Err(e) = master.start_worker(params).await {
                            error!("could not start worker: {e:#}");
                        }
                    }
                }
            }
        })
    }

    /// Starts one worker. Concurrent calls run one after the other.
    /// Returns `None` when the launcher skipped the start or the master is shutting down.
    pub async fn start_worker(self: &Arc<Self>, params: StartWorkerParams) -> Result<Option<u64>> {
        let _guard = self.start_lock.lock().await;
        if self.shutting_down.load(Ordering::SeqCst) {
            return Ok(None);
        }

        let port = self.allocate_port().await?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let env = WorkerEnv {
            worker_id: id,
            port,
            internal_password: self.options.internal_password.clone(),
            project_location: self.options.project_location.clone(),
            app_data_path: self.options.app_data_path.clone(),
            data_folder: self.options.data_folder.clone(),
            server_id: self.options.server_id.clone(),
            pro_enabled: params.pro_enabled,
            core_port: self.options.core_port,
            external_url: params.external_url.clone(),
            root_path: params.root_path.clone(),
            app_secret: params.app_secret.clone(),
        };

        let Some(launched) = self.launcher.launch(&env, self.rpc.clone()).await? else {
            return Ok(None);
        };
        info!(worker_id = id, port, pid = ?launched.pid, "worker started");
        self.workers.insert(
            id,
            WorkerEntry {
                info: WorkerInfo {
                    id,
                    port,
                    pid: launched.pid,
                    state: WorkerState::Starting,
                    params: params.clone(),
                },
                kill: Some(launched.kill),
                control: launched.control,
            },
        );
        self.watch_exit(id, params, launched.exited);
        Ok(Some(id))
    }

    /// Kills a worker. It is restarted like any other exited worker.
    pub fn kill_worker(&self, id: u64) -> bool {
        let Some(kill) = self.workers.get_mut(&id).and_then(|mut w| w.kill.take()) else {
            return false;
        };
        let _ = kill.send(());
        true
    }

    /// Asks every worker to stop, kills those still running after `grace` and
    /// disables restarts for good.
    pub async fn shutdown(&self, grace: Duration) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let controls: Vec<mpsc::Sender<Request>> = self.workers.iter().map(|w| w.control.clone()).collect();
        for control in controls {
            let _ = control.send(shutdown_request()).await;
        }
        if tokio::time::timeout(grace, self.wait_until_empty()).await.is_err() {
            let ids: Vec<u64> = self.workers.iter().map(|w| *w.key()).collect();
            warn!(remaining = ids.len(), "workers still running after grace period, killing them");
            for id in ids {
                self.kill_worker(id);
            }
            let _ = tokio::time::timeout(grace, self.wait_until_empty()).await;
        }
        info!("master stopped");
    }

    async fn wait_until_empty(&self) {
        loop {
            let notified = self.changed.notified();
            if self.workers.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Next free port, probing upward from the one after the last allocation.
    async fn allocate_port(&self) -> Result<u16> {
        let base = self.options.base_port;
        let mut candidate = match *self.last_port.lock().unwrap_or_else(|e| e.into_inner()) {
            Some(last) if last < u16::MAX => last + 1,
            _ => base,
        };
        for _ in 0..PORT_PROBE_LIMIT {
            let taken = self.workers.iter().any(|w| w.info.port == candidate);
            if !taken && TcpListener::bind(("127.0.0.1", candidate)).await.is_ok() {
                *self.last_port.lock().unwrap_or_else(|e| e.into_inner()) = Some(candidate);
                return Ok(candidate);
            }
            candidate = if candidate == u16::MAX { base } else { candidate + 1 };
        }
        bail!("no free port found from {base}")
    }

    fn watch_exit(self: &Arc<Self>, id: u64, params: StartWorkerParams, exited: oneshot::Receiver<WorkerExit>) {
        let master = self.clone();
        tokio::spawn(async move {
            let exit = exited.await.unwrap_or(WorkerExit { code: None, killed: true });
            master.on_exit(id, params, exit).await;
        });
    }

    fn on_exit(self: Arc<Self>, id: u64, params: StartWorkerParams, exit: WorkerExit) -> BoxFuture<'static, ()> {
        async move {
            self.workers.remove(&id);
            self.changed.notify_waiters();
            warn!(worker_id = id, code = ?exit.code, killed = exit.killed, "worker exited");
            let _ = self.events.send(MasterEvent::WorkerExited { id, code: exit.code });

            if self.shutting_down.load(Ordering::SeqCst) {
                return;
            }
            match self.start_worker(params).await {
                Ok(Some(new_id)) => info!(worker_id = new_id, replaced = id, "worker restarted"),
                Ok(None) => debug!(replaced = id, "worker not restarted"),
                Err(e) => error!(replaced = id, "could not restart worker: {e:#}"),
            }
        }
        .boxed()
    }

    async fn handle_notifications(master: Weak<Self>, mut rx: mpsc::UnboundedReceiver<WorkerEvent>) {
        while let Some((id, req)) = rx.recv().await {
            let Some(master) = master.upgrade() else { break };
            // a worker may announce itself before start_worker has registered it
            drop(master.start_lock.lock().await);
            if !req.is_notification() {
                warn!(worker_id = id, method = %req.method, "worker sent a call, the control channel never replies");
                continue;
            }
            match req.method() {
                Some(Method::WorkerReady) => {
                    let params = req
                        .params
                        .and_then(|p| serde_json::from_value::<WorkerReadyParams>(p).ok());
                    let Some(WorkerReadyParams { port }) = params else {
                        warn!(worker_id = id, "workerReady without a port");
                        continue;
                    };
                    if let Some(mut worker) = master.workers.get_mut(&id) {
                        worker.info.state = WorkerState::Running;
                        worker.info.port = port;
                    }
                    info!(worker_id = id, port, "worker ready");
                    let _ = master.events.send(MasterEvent::WorkerReady { id, port });
                }
                _ => debug!(worker_id = id, method = %req.method, "ignoring worker notification"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::launcher::{InProcessLauncher, InProcessWorker, WorkerBody};

    fn params() -> StartWorkerParams {
        StartWorkerParams {
            external_url: "http://bots.local".into(),
            root_path: String::new(),
            app_secret: "s".into(),
            front_port: 3100,
            pro_enabled: false,
        }
    }

    fn options(base_port: u16) -> MasterOptions {
        MasterOptions {
            base_port,
            internal_password: "secret".into(),
            project_location: PathBuf::from("."),
            app_data_path: PathBuf::from("./app"),
            data_folder: PathBuf::from("./data"),
            server_id: "node-a".into(),
            core_port: 3100,
        }
    }

    fn idle_worker() -> WorkerBody {
        Arc::new(|worker: InProcessWorker| {
            async move {
                worker.announce_ready(worker.env.port);
                worker.shutdown.cancelled().await;
                anyhow::Ok(())
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn ids_are_monotonic_and_ports_distinct() {
        let master = Master::new(options(41200), Arc::new(InProcessLauncher::new(idle_worker())));
        let a = master.start_worker(params()).await.unwrap().unwrap();
        let b = master.start_worker(params()).await.unwrap().unwrap();
        assert_eq!((a, b), (1, 2));
        let workers = master.workers();
        assert_ne!(workers[0].port, workers[1].port);
        assert!(workers.iter().all(|w| w.port >= 41200));
        master.shutdown(Duration::from_secs(1)).await;
        assert!(master.workers().is_empty());
    }

    #[tokio::test]
    async fn ready_notification_marks_the_worker_running() {
        let master = Master::new(options(41300), Arc::new(InProcessLauncher::new(idle_worker())));
        let mut events = master.subscribe();
        let id = master.start_worker(params()).await.unwrap().unwrap();
        let port = master.workers()[0].port;
        assert_eq!(events.recv().await.unwrap(), MasterEvent::WorkerReady { id, port });
        assert_eq!(master.workers()[0].state, WorkerState::Running);
        master.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn no_restart_after_shutdown() {
        let master = Master::new(options(41400), Arc::new(InProcessLauncher::new(idle_worker())));
        master.start_worker(params()).await.unwrap();
        master.shutdown(Duration::from_secs(1)).await;
        assert_eq!(master.start_worker(params()).await.unwrap(), None);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(master.workers().is_empty());
    }

    #[tokio::test]
    async fn calls_from_workers_are_not_treated_as_notifications() {
        let silent: WorkerBody = Arc::new(|worker: InProcessWorker| {
            async move {
                worker.shutdown.cancelled().await;
                anyhow::Ok(())
            }
            .boxed()
        });
        let master = Master::new(options(41600), Arc::new(InProcessLauncher::new(silent)));
        let mut events = master.subscribe();
        let id = master.start_worker(params()).await.unwrap().unwrap();
        let ready = serde_json::to_value(WorkerReadyParams { port: 41999 }).unwrap();

        let mut call = Request::notification(Method::WorkerReady, Some(ready.clone()));
        call.id = Some(worker_channel::jsonrpc::Id::Number(1));
        master.rpc.send((id, call)).unwrap();
        master
            .rpc
            .send((id, Request::notification(Method::WorkerReady, Some(ready))))
            .unwrap();

        assert_eq!(events.recv().await.unwrap(), MasterEvent::WorkerReady { id, port: 41999 });
        assert!(events.try_recv().is_err());
        assert_eq!(master.workers()[0].port, 41999);
        master.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn control_loop_serves_start_requests() {
        let master = Master::new(options(41500), Arc::new(InProcessLauncher::new(idle_worker())));
        let (tx, rx) = mpsc::channel(4);
        master.spawn_control_loop(rx);
        let mut events = master.subscribe();
        tx.send(ControlMessage::StartWorker(params())).await.unwrap();
        assert!(matches!(events.recv().await.unwrap(), MasterEvent::WorkerReady { id: 1, .. }));
        master.shutdown(Duration::from_secs(1)).await;
    }
}
