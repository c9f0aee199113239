//! Replicates state-mutating calls to every node of the cluster.
//!
//! [`Broadcaster::wrap`] turns a local async function into a [`Broadcasted`]
//! callable. Calling it always runs the function on this node and, in cluster
//! mode, publishes the arguments so every other node runs its own registered
//! copy. Remote executions are fire-and-forget: their results and failures never
//! reach the caller.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// One replicated call on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub name: String,
    pub origin: String,
    pub args: Value,
}

/// Cluster membership and delivery. Retry and persistence are the transport's concern.
#[async_trait]
pub trait ClusterTransport: Send + Sync {
    async fn publish(&self, message: BroadcastMessage) -> Result<()>;
    fn subscribe(&self) -> broadcast::Receiver<BroadcastMessage>;
}

/// Transport connecting nodes that live in the same process.
#[derive(Clone)]
pub struct InMemoryClusterBus {
    tx: broadcast::Sender<BroadcastMessage>,
}

impl InMemoryClusterBus {
    pub fn new(capacity: usize) -> Arc<Self> {
        let (tx, _) = broadcast::channel(capacity);
        Arc::new(Self { tx })
    }
}

#[async_trait]
impl ClusterTransport for InMemoryClusterBus {
    async fn publish(&self, message: BroadcastMessage) -> Result<()> {
        // no subscriber simply means no other node is up
        let _ = self.tx.send(message);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<BroadcastMessage> {
        self.tx.subscribe()
    }
}

pub type LocalFn<A, R> = Arc<dyn Fn(A) -> BoxFuture<'static, R> + Send + Sync>;
type RemoteFn = Arc<dyn Fn(Value) -> BoxFuture<'static, ()> + Send + Sync>;

struct Cluster {
    server_id: String,
    transport: Arc<dyn ClusterTransport>,
    handlers: DashMap<String, RemoteFn>,
}

/// Registry of replicated functions for one node.
#[derive(Clone)]
pub struct Broadcaster {
    cluster: Option<Arc<Cluster>>,
}

impl Broadcaster {
    /// Single-node mode: wrapping is the identity.
    pub fn disabled() -> Self {
        Self { cluster: None }
    }

    pub fn clustered(server_id: impl Into<String>, transport: Arc<dyn ClusterTransport>) -> Self {
        Self {
            cluster: Some(Arc::new(Cluster {
                server_id: server_id.into(),
                transport,
                handlers: DashMap::new(),
            })),
        }
    }

    /// Registers `f` under `name` and returns the replicated callable.
    pub fn wrap<A, R>(&self, name: &str, f: LocalFn<A, R>) -> Broadcasted<A, R>
    where
        A: Serialize + DeserializeOwned + Send + 'static,
        R: Send + 'static,
    {
        if let Some(cluster) = &self.cluster {
            let local = f.clone();
            let remote: RemoteFn = Arc::new(move |args: Value| {
                let local = local.clone();
                async move {
                    match serde_json::from_value::<A>(args) {
                        Ok(args) => {
                            let _ = local(args).await;
                        }
                        Err(e) => warn!("could not decode broadcast arguments: {e}"),
                    }
                }
                .boxed()
            });
            if cluster.handlers.insert(name.to_string(), remote).is_some() {
                warn!("broadcast handler `{name}` registered twice, keeping the latest");
            }
        }
        Broadcasted {
            name: name.to_string(),
            local: f,
            cluster: self.cluster.clone(),
        }
    }

    /// Starts executing calls published by other nodes. No-op in single-node mode.
    pub fn listen(&self) -> Option<JoinHandle<()>> {
        let cluster = self.cluster.clone()?;
        let mut rx = cluster.transport.subscribe();
        Some(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => {
                        if msg.origin == cluster.server_id {
                            continue;
                        }
                        let handler = cluster.handlers.get(&msg.name).map(|h| h.value().clone());
                        match handler {
                            Some(handler) => {
                                debug!(name = %msg.name, origin = %msg.origin, "running broadcast call");
                                tokio::spawn(handler(msg.args));
                            }
                            None => warn!(name = %msg.name, "no handler for broadcast call"),
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("missed {n} broadcast calls");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }))
    }
}

/// A function replicated across the cluster; see [`Broadcaster::wrap`].
pub struct Broadcasted<A, R> {
    name: String,
    local: LocalFn<A, R>,
    cluster: Option<Arc<Cluster>>,
}

impl<A, R> Broadcasted<A, R>
where
    A: Serialize + Send + 'static,
    R: Send + 'static,
{
    /// Runs locally and fans out to the other nodes; returns the local result.
    pub async fn call(&self, args: A) -> R {
        if let Some(cluster) = &self.cluster {
            match serde_json::to_value(&args) {
                Ok(value) => {
                    let message = BroadcastMessage {
                        name: self.name.clone(),
                        origin: cluster.server_id.clone(),
                        args: value,
                    };
                    if let Err(e) = cluster.transport.publish(message).await {
                        warn!(name = %self.name, "could not publish broadcast call: {e:#}");
                    }
                }
                Err(e) => warn!(name = %self.name, "could not encode broadcast arguments: {e}"),
            }
        }
        (self.local)(args).await
    }
}
