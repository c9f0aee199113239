use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use worker_channel::jsonrpc::Request;
use worker_channel::{Method, WorkerEnv, WorkerEvent, WorkerExit, spawn_worker_process};

/// A started worker as seen by the master.
#[derive(Debug)]
pub struct LaunchedWorker {
    pub pid: Option<u32>,
    pub exited: oneshot::Receiver<WorkerExit>,
    pub kill: oneshot::Sender<()>,
    pub control: mpsc::Sender<Request>,
}

#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Starts a worker with `env`. Notifications it sends (such as `workerReady`)
    /// go to `events`. `Ok(None)` means the start was skipped.
    async fn launch(
        &self,
        env: &WorkerEnv,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Result<Option<LaunchedWorker>>;
}

/// Runs workers as child processes speaking JSON-RPC over stdio.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(program: PathBuf, args: Vec<String>) -> Self {
        Self { program, args }
    }

    /// Re-executes the running binary with the `worker` subcommand.
    pub fn current_exe() -> Result<Self> {
        let program = std::env::current_exe().context("could not locate the host executable")?;
        Ok(Self::new(program, vec!["worker".to_string()]))
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(
        &self,
        env: &WorkerEnv,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Result<Option<LaunchedWorker>> {
        if !tokio::fs::try_exists(&self.program).await.unwrap_or(false) {
            warn!(program = %self.program.display(), "worker executable not found, start skipped");
            return Ok(None);
        }
        let handle = spawn_worker_process(env.worker_id, &self.program, &self.args, env.to_vars(), events)?;
        Ok(Some(LaunchedWorker {
            pid: handle.pid,
            exited: handle.exited,
            kill: handle.kill,
            control: handle.control,
        }))
    }
}

/// What an in-process worker body receives.
pub struct InProcessWorker {
    pub env: WorkerEnv,
    /// Cancelled on a `shutdown` request or when the master kills the worker.
    pub shutdown: CancellationToken,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

impl InProcessWorker {
    /// Same notification a child process writes on stdout.
    pub fn announce_ready(&self, port: u16) {
        let req = Request::notification(Method::WorkerReady, Some(json!({ "port": port })));
        let _ = self.events.send((self.env.worker_id, req));
    }
}

pub type WorkerBody = Arc<dyn Fn(InProcessWorker) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Runs the worker body as a tokio task of the current process.
#[derive(Clone)]
pub struct InProcessLauncher {
    body: WorkerBody,
}

impl InProcessLauncher {
    pub fn new(body: WorkerBody) -> Self {
        Self { body }
    }
}

#[async_trait]
impl WorkerLauncher for InProcessLauncher {
    async fn launch(
        &self,
        env: &WorkerEnv,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Result<Option<LaunchedWorker>> {
        let worker_id = env.worker_id;
        let shutdown = CancellationToken::new();
        let worker = InProcessWorker {
            env: env.clone(),
            shutdown: shutdown.clone(),
            events,
        };
        let mut task = tokio::spawn((self.body)(worker));

        let (control_tx, mut control_rx) = mpsc::channel::<Request>(16);
        let token = shutdown.clone();
        tokio::spawn(async move {
            while let Some(req) = control_rx.recv().await {
                if req.method() == Some(Method::Shutdown) {
                    token.cancel();
                }
            }
        });

        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let exit = tokio::select! {
                joined = &mut task => match joined {
                    Ok(Ok(())) => WorkerExit { code: Some(0), killed: false },
                    Ok(Err(e)) => {
                        error!(worker_id, "worker failed: {e:#}");
                        WorkerExit { code: Some(1), killed: false }
                    }
                    Err(e) => {
                        error!(worker_id, "worker task aborted: {e}");
                        WorkerExit { code: None, killed: false }
                    }
                },
                _ = kill_rx => {
                    shutdown.cancel();
                    task.abort();
                    WorkerExit { code: None, killed: true }
                }
            };
            let _ = exit_tx.send(exit);
        });

        Ok(Some(LaunchedWorker {
            pid: None,
            exited: exit_rx,
            kill: kill_tx,
            control: control_tx,
        }))
    }
}
