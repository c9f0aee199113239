pub mod jsonrpc;
pub mod message;
pub mod worker_actor;
pub mod worker_runtime;

pub use message::*;
pub use worker_actor::{WorkerEvent, WorkerExit, WorkerProcessHandle, spawn_worker_process};
