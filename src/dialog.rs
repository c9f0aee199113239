//! Dialog session storage and teardown.
//!
//! Session ids have the form `<botId>::<channel>::<target>`, so every session of
//! a bot shares the `<botId>::` prefix.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bots::LifecycleEvent;
use crate::cache::{ClusterCache, SharedCache};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DialogSession {
    pub id: String,
    #[serde(default)]
    pub context: Value,
    #[serde(default)]
    pub temp_data: Value,
    #[serde(default)]
    pub session_data: Value,
    pub created_on: DateTime<Utc>,
    pub modified_on: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_expiry: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_expiry: Option<DateTime<Utc>>,
}

impl DialogSession {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            context: Value::Null,
            temp_data: Value::Null,
            session_data: Value::Null,
            created_on: now,
            modified_on: now,
            context_expiry: None,
            session_expiry: None,
        }
    }

    pub fn session_id(bot_id: &str, channel: &str, target: &str) -> String {
        format!("{bot_id}::{channel}::{target}")
    }
}

#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<DialogSession>>;
    async fn upsert(&self, session: DialogSession) -> Result<()>;
    async fn delete(&self, id: &str) -> Result<()>;
    /// Deletes every session whose id starts with `prefix`; returns their ids.
    async fn delete_by_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

#[derive(Clone)]
pub struct InMemorySessionRepository {
    sessions: Cache<String, DialogSession>,
}

impl InMemorySessionRepository {
    pub fn new(idle: Duration) -> Arc<Self> {
        Arc::new(Self {
            sessions: Cache::builder().time_to_idle(idle).build(),
        })
    }
}

#[async_trait]
impl SessionRepository for InMemorySessionRepository {
    async fn get(&self, id: &str) -> Result<Option<DialogSession>> {
        Ok(self.sessions.get(id).await)
    }

    async fn upsert(&self, session: DialogSession) -> Result<()> {
        self.sessions.insert(session.id.clone(), session).await;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.sessions.invalidate(id).await;
        Ok(())
    }

    async fn delete_by_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let ids: Vec<String> = self
            .sessions
            .iter()
            .filter(|(id, _)| id.starts_with(prefix))
            .map(|(id, _)| id.to_string())
            .collect();
        for id in &ids {
            self.sessions.invalidate(id).await;
        }
        Ok(ids)
    }
}

/// Keeps dialog sessions and, in distributed mode, their cluster-cache mirror.
pub struct StateManager {
    repository: Arc<dyn SessionRepository>,
    cache: Option<SharedCache>,
    distributed: bool,
    key_scope: Option<String>,
}

impl StateManager {
    pub fn new(
        repository: Arc<dyn SessionRepository>,
        cache: Option<SharedCache>,
        distributed: bool,
        key_scope: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            repository,
            cache,
            distributed,
            key_scope,
        })
    }

    fn state_key(&self, id: &str) -> String {
        match &self.key_scope {
            Some(scope) => format!("{scope}:sessionstate_{id}"),
            None => format!("sessionstate_{id}"),
        }
    }

    fn mirror(&self) -> Option<&SharedCache> {
        self.cache.as_ref().filter(|_| self.distributed)
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<DialogSession>> {
        self.repository.get(id).await
    }

    pub async fn save_session(&self, mut session: DialogSession) -> Result<()> {
        session.modified_on = Utc::now();
        if let Some(cache) = self.mirror() {
            cache
                .set(&self.state_key(&session.id), serde_json::to_string(&session)?, None)
                .await?;
        }
        self.repository.upsert(session).await
    }

    pub async fn delete_dialog_session(&self, id: &str) -> Result<()> {
        if let Some(cache) = self.mirror() {
            cache.del(&self.state_key(id)).await?;
        }
        self.repository.delete(id).await
    }

    /// Removes every session of `bot_id`; returns how many were deleted.
    pub async fn delete_bot_sessions(&self, bot_id: &str) -> Result<usize> {
        let ids = self.repository.delete_by_prefix(&format!("{bot_id}::")).await?;
        if let Some(cache) = self.mirror() {
            for id in &ids {
                cache.del(&self.state_key(id)).await?;
            }
        }
        debug!(bot_id, deleted = ids.len(), "dialog sessions removed");
        Ok(ids.len())
    }

    /// Drops the sessions of every bot unmounted on this node.
    pub fn spawn_unmount_cleanup(self: &Arc<Self>, mut events: broadcast::Receiver<LifecycleEvent>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(LifecycleEvent::AfterBotUnmount { bot_id }) => {
                        if let Err(e) = manager.delete_bot_sessions(&bot_id).await {
                            warn!(bot_id = %bot_id, "could not clean up dialog sessions: {e:#}");
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("dialog cleanup missed {n} lifecycle events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
