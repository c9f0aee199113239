use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::DashMap;
use rand::distr::Distribution;
use rand::distr::weighted::WeightedIndex;
use reqwest::Client;
use reqwest::header::AUTHORIZATION;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use worker_channel::{ControlMessage, StartWorkerParams, WorkerEnv};

use super::MasterEvent;
use crate::error::{HostError, HostResult};
use crate::event::Event;

pub const INTERNAL_PREFIX: &str = "/api/internal";

async fn post_internal<B: Serialize + ?Sized>(client: &Client, url: &str, password: &str, body: &B) -> Result<()> {
    client
        .post(url)
        .header(AUTHORIZATION, password)
        .json(body)
        .send()
        .await
        .with_context(|| format!("could not reach {url}"))?
        .error_for_status()
        .with_context(|| format!("{url} rejected the request"))?;
    Ok(())
}

/// A ready worker the front controller can route events to.
#[derive(Debug, Clone)]
pub struct NodeClient {
    pub id: u64,
    pub port: u16,
    pub weight: u32,
    base_url: String,
    client: Client,
}

impl NodeClient {
    pub fn new(id: u64, port: u16, client: Client) -> Self {
        Self {
            id,
            port,
            weight: 1,
            base_url: format!("http://localhost:{port}{INTERNAL_PREFIX}"),
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send_event(&self, event: &Event, password: &str) -> Result<()> {
        post_internal(&self.client, &format!("{}/sendEvent", self.base_url), password, event).await
    }
}

/// Public-facing side of the host: asks the master for workers and spreads
/// incoming events over the ready ones.
pub struct FrontController {
    nodes: DashMap<u64, NodeClient>,
    control: mpsc::Sender<ControlMessage>,
    internal_password: String,
    client: Client,
}

impl FrontController {
    pub fn new(control: mpsc::Sender<ControlMessage>, internal_password: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            nodes: DashMap::new(),
            control,
            internal_password: internal_password.into(),
            client: Client::new(),
        })
    }

    pub async fn request_start(&self, params: StartWorkerParams) -> Result<()> {
        self.control
            .send(ControlMessage::StartWorker(params))
            .await
            .context("master is not accepting start requests")
    }

    pub fn add_node(&self, id: u64, port: u16) {
        info!(worker_id = id, port, "worker registered for dispatch");
        self.nodes.insert(id, NodeClient::new(id, port, self.client.clone()));
    }

    pub fn remove_node(&self, id: u64) -> bool {
        self.nodes.remove(&id).is_some()
    }

    pub fn nodes(&self) -> Vec<NodeClient> {
        let mut nodes: Vec<NodeClient> = self.nodes.iter().map(|n| n.clone()).collect();
        nodes.sort_by_key(|n| n.id);
        nodes
    }

    /// Keeps the node registry in step with the master's worker events.
    pub fn spawn_event_loop(self: &Arc<Self>, mut events: broadcast::Receiver<MasterEvent>) -> JoinHandle<()> {
        let front = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(MasterEvent::WorkerReady { id, port }) => front.add_node(id, port),
                    Ok(MasterEvent::WorkerExited { id, .. }) => {
                        if front.remove_node(id) {
                            debug!(worker_id = id, "worker removed from dispatch");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => warn!("front controller missed {n} worker events"),
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Weighted random pick among the ready workers.
    pub fn pick_node(&self) -> Option<NodeClient> {
        let nodes = self.nodes();
        let dist = WeightedIndex::new(nodes.iter().map(|n| n.weight)).ok()?;
        nodes.into_iter().nth(dist.sample(&mut rand::rng()))
    }

    pub async fn send_incoming(&self, event: &Event) -> HostResult<()> {
        let node = self.pick_node().ok_or(HostError::NoWorkers)?;
        node.send_event(event, &self.internal_password).await?;
        debug!(worker_id = node.id, event_id = %event.id, "incoming event forwarded");
        Ok(())
    }
}

/// Worker-side client of the front controller's internal API.
#[derive(Debug, Clone)]
pub struct CoreClient {
    base_url: String,
    password: String,
    client: Client,
}

impl CoreClient {
    pub fn new(base_url: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            password: password.into(),
            client: Client::new(),
        }
    }

    pub fn from_env(env: &WorkerEnv) -> Self {
        Self::new(
            format!("http://localhost:{}{INTERNAL_PREFIX}", env.core_port),
            env.internal_password.clone(),
        )
    }

    pub async fn send_outgoing(&self, event: &Event) -> Result<()> {
        post_internal(&self.client, &format!("{}/sendEvent", self.base_url), &self.password, event).await
    }

    pub async fn emit_event(&self, name: &str, args: Value) -> Result<()> {
        let body = json!({ "event": name, "args": args });
        post_internal(
            &self.client,
            &format!("{}/emitBotpressEvent", self.base_url),
            &self.password,
            &body,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Direction;

    #[tokio::test]
    async fn no_workers_is_an_error() {
        let (tx, _rx) = mpsc::channel(1);
        let front = FrontController::new(tx, "pw");
        let event = Event::new("b", "web", "u", Direction::Incoming, json!({ "type": "text", "text": "hi" }));
        assert!(matches!(front.send_incoming(&event).await, Err(HostError::NoWorkers)));
    }

    #[tokio::test]
    async fn registry_follows_master_events() {
        let (tx, mut rx) = mpsc::channel(1);
        let front = FrontController::new(tx, "pw");
        let (events, events_rx) = broadcast::channel(8);
        let task = front.spawn_event_loop(events_rx);

        events.send(MasterEvent::WorkerReady { id: 1, port: 3001 }).unwrap();
        events.send(MasterEvent::WorkerReady { id: 2, port: 3002 }).unwrap();
        events.send(MasterEvent::WorkerExited { id: 1, code: Some(1) }).unwrap();
        drop(events);
        task.await.unwrap();

        let nodes = front.nodes();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].base_url(), "http://localhost:3002/api/internal");
        assert_eq!(front.pick_node().unwrap().id, 2);

        let params = StartWorkerParams {
            external_url: String::new(),
            root_path: String::new(),
            app_secret: String::new(),
            front_port: 3100,
            pro_enabled: false,
        };
        front.request_start(params.clone()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), ControlMessage::StartWorker(params));
    }

    #[test]
    fn weighted_pick_only_returns_known_nodes() {
        let (tx, _rx) = mpsc::channel(1);
        let front = FrontController::new(tx, "pw");
        front.add_node(7, 4007);
        front.add_node(8, 4008);
        for _ in 0..20 {
            let id = front.pick_node().unwrap().id;
            assert!(id == 7 || id == 8);
        }
    }
}
