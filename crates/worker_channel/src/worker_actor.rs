use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command as TokioCommand;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::jsonrpc::Request;

/// Notification sent by a worker, tagged with the id the master gave it.
pub type WorkerEvent = (u64, Request);

/// How a worker went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    pub code: Option<i32>,
    pub killed: bool,
}

/// Handle on a spawned worker process.
#[derive(Debug)]
pub struct WorkerProcessHandle {
    pub pid: Option<u32>,
    /// Requests written to the child's stdin, one JSON line each.
    pub control: mpsc::Sender<Request>,
    /// Resolves once the child has exited.
    pub exited: oneshot::Receiver<WorkerExit>,
    /// Sending (or dropping the handle's sender) kills the child.
    pub kill: oneshot::Sender<()>,
}

/// Spawns `program` with `envs`, wiring stdin/stdout to the JSON‑RPC control channel.
///
/// Every request or notification the child prints on stdout is forwarded to
/// `event_tx`; lines that are not JSON‑RPC are logged and skipped.
pub fn spawn_worker_process<P: AsRef<Path>>(
    worker_id: u64,
    program: P,
    args: &[String],
    envs: Vec<(String, String)>,
    event_tx: mpsc::UnboundedSender<WorkerEvent>,
) -> Result<WorkerProcessHandle> {
    let program = program.as_ref();
    let mut child = TokioCommand::new(program)
        .args(args)
        .envs(envs)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("could not spawn worker {}", program.display()))?;

    let pid = child.id();
    let mut stdin = child.stdin.take().context("worker stdin unavailable")?;
    let stdout = child.stdout.take().context("worker stdout unavailable")?;

    // ── rx → child.stdin ───────────────────────────────────────────────
    let (control_tx, mut control_rx) = mpsc::channel::<Request>(16);
    tokio::spawn(async move {
        while let Some(req) = control_rx.recv().await {
            let line = match req.to_line() {
                Ok(line) => line,
                Err(e) => {
                    warn!("could not encode control request: {e}");
                    continue;
                }
            };
            if stdin.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            let _ = stdin.flush().await;
        }
    });

    // ── child.stdout → event_tx ────────────────────────────────────────
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Request>(&line) {
                Ok(req) => {
                    let _ = event_tx.send((worker_id, req));
                }
                Err(_) => debug!(worker_id, "worker stdout: {line}"),
            }
        }
    });

    // ── exit / kill supervision ────────────────────────────────────────
    let (exit_tx, exit_rx) = oneshot::channel();
    let (kill_tx, kill_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let exit = tokio::select! {
            status = child.wait() => WorkerExit {
                code: status.ok().and_then(|s| s.code()),
                killed: false,
            },
            _ = kill_rx => {
                let _ = child.kill().await;
                WorkerExit { code: None, killed: true }
            }
        };
        let _ = exit_tx.send(exit);
    });

    Ok(WorkerProcessHandle {
        pid,
        control: control_tx,
        exited: exit_rx,
        kill: kill_tx,
    })
}
