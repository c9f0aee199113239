use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use dashmap::DashMap;
use tracing::warn;

use super::{BotHealth, BotStatus, ServerHealth, StatKind};
use crate::cache::ClusterCache;

/// Health counters of the bots known to this node.
#[derive(Debug, Default)]
pub struct HealthRegistry {
    bots: DashMap<String, BotHealth>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, bot_id: &str) -> Option<BotHealth> {
        self.bots.get(bot_id).map(|h| *h)
    }

    pub fn increment(&self, bot_id: &str, kind: StatKind) {
        let mut health = self.bots.entry(bot_id.to_string()).or_default();
        match kind {
            StatKind::Error => health.error_count += 1,
            StatKind::Warning => health.warning_count += 1,
            StatKind::Critical => {
                health.critical_count += 1;
                health.status = BotStatus::Unhealthy;
            }
        }
    }

    pub fn set_status(&self, bot_id: &str, status: BotStatus) {
        let mut health = self.bots.entry(bot_id.to_string()).or_default();
        health.status = status;
        if status == BotStatus::Disabled {
            *health = BotHealth {
                status,
                ..BotHealth::default()
            };
        }
    }

    /// Drops entries of bots that no longer exist.
    pub fn retain_known(&self, known: &[String]) {
        self.bots.retain(|id, _| known.contains(id));
    }

    pub fn snapshot(&self) -> BTreeMap<String, BotHealth> {
        self.bots.iter().map(|e| (e.key().clone(), *e.value())).collect()
    }
}

pub fn server_key(server_id: &str) -> String {
    format!("bp_server_{server_id}_bots")
}

pub async fn publish(cache: &dyn ClusterCache, key: &str, health: &ServerHealth, ttl: Duration) -> Result<()> {
    let data = serde_json::to_string(health)?;
    cache
        .set(key, data, Some(ttl))
        .await
        .with_context(|| format!("could not publish health to {key}"))
}

/// Every server health entry matching `pattern`, keyed by server id.
/// Entries that fail to parse are skipped.
pub async fn read_all(cache: &dyn ClusterCache, pattern: &str) -> Result<BTreeMap<String, ServerHealth>> {
    let keys = cache.keys(pattern).await?;
    if keys.is_empty() {
        return Ok(BTreeMap::new());
    }
    let values = cache.mget(&keys).await?;
    let mut servers = BTreeMap::new();
    for (key, value) in keys.iter().zip(values) {
        let Some(raw) = value else { continue };
        match serde_json::from_str::<ServerHealth>(&raw) {
            Ok(health) => {
                servers.insert(health.server_id.clone(), health);
            }
            Err(e) => warn!(key, "ignoring malformed server health: {e}"),
        }
    }
    Ok(servers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryClusterCache;

    #[test]
    fn counters_follow_status_rules() {
        let registry = HealthRegistry::new();
        registry.increment("b", StatKind::Error);
        registry.increment("b", StatKind::Warning);
        assert_eq!(registry.get("b").unwrap().status, BotStatus::Disabled);

        registry.increment("b", StatKind::Critical);
        let health = registry.get("b").unwrap();
        assert_eq!(health.status, BotStatus::Unhealthy);
        assert_eq!((health.error_count, health.warning_count, health.critical_count), (1, 1, 1));

        registry.set_status("b", BotStatus::Healthy);
        assert_eq!(registry.get("b").unwrap().critical_count, 1);

        registry.set_status("b", BotStatus::Disabled);
        assert_eq!(registry.get("b").unwrap(), BotHealth::default());
    }

    #[test]
    fn prunes_unknown_bots() {
        let registry = HealthRegistry::new();
        registry.set_status("kept", BotStatus::Healthy);
        registry.set_status("gone", BotStatus::Healthy);
        registry.retain_known(&["kept".to_string()]);
        assert_eq!(registry.snapshot().keys().collect::<Vec<_>>(), vec!["kept"]);
    }

    #[tokio::test]
    async fn publish_and_read_back() {
        let cache = InMemoryClusterCache::new();
        let health = ServerHealth {
            server_id: "node-1".into(),
            hostname: "host".into(),
            bots: BTreeMap::from([("b".to_string(), BotHealth::default())]),
        };
        publish(cache.as_ref(), &server_key("node-1"), &health, Duration::from_secs(5))
            .await
            .unwrap();
        cache.set("bp_server_bad_bots", "not json".into(), None).await.unwrap();

        let servers = read_all(cache.as_ref(), &server_key("*")).await.unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers["node-1"], health);
    }
}
