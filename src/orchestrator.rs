//! Master/worker process supervision.
//!
//! The front controller asks the master for workers over an in-process control
//! channel. The master spawns them through a [`WorkerLauncher`], restarts them
//! when they exit and reports readiness back so the front controller can route
//! incoming events to them.

pub mod front;
pub mod launcher;
pub mod master;

use serde::Serialize;
use worker_channel::StartWorkerParams;

pub use front::{CoreClient, FrontController, NodeClient};
pub use launcher::{InProcessLauncher, InProcessWorker, LaunchedWorker, ProcessLauncher, WorkerLauncher};
pub use master::{Master, MasterOptions};

/// A worker leaves the registry as soon as it exits, so there is no exited state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Starting,
    Running,
}

/// Snapshot of one worker owned by the master.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub id: u64,
    pub port: u16,
    pub pid: Option<u32>,
    pub state: WorkerState,
    pub params: StartWorkerParams,
}

/// Notifications the master sends to the front controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MasterEvent {
    WorkerReady { id: u64, port: u16 },
    WorkerExited { id: u64, code: Option<i32> },
}
