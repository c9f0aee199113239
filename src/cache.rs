use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use moka::Expiry;
use moka::future::Cache;

pub type SharedCache = Arc<dyn ClusterCache>;

/// Key/value store with per-key TTL reachable by every node of the cluster.
#[async_trait]
pub trait ClusterCache: Send + Sync + std::fmt::Debug {
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<String>>;
    /// Keys matching a glob with `*` wildcards, e.g. `bp_server_*_bots`.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;
    /// Values in the same order as `keys`; missing keys yield `None`.
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>>;
    async fn del(&self, key: &str) -> Result<()>;
}

#[derive(Clone, Debug)]
struct Entry {
    value: String,
    ttl: Option<Duration>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self) -> bool {
        self.expires_at.is_none_or(|at| Instant::now() < at)
    }
}

struct EntryExpiry;

impl Expiry<String, Entry> for EntryExpiry {
    fn expire_after_create(&self, _key: &String, value: &Entry, _created_at: Instant) -> Option<Duration> {
        value.ttl
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Entry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value.ttl
    }
}

/// In-process cluster cache. Nodes of one process share it by cloning the `Arc`.
#[derive(Clone, Debug)]
pub struct InMemoryClusterCache {
    cache: Cache<String, Entry>,
}

impl InMemoryClusterCache {
    pub fn new() -> Arc<Self> {
        let cache = Cache::builder()
            .max_capacity(100_000)
            .expire_after(EntryExpiry)
            .build();
        Arc::new(Self { cache })
    }
}

#[async_trait]
impl ClusterCache for InMemoryClusterCache {
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        let entry = Entry {
            value,
            ttl,
            expires_at: ttl.map(|t| Instant::now() + t),
        };
        self.cache.insert(key.to_string(), entry).await;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .cache
            .get(key)
            .await
            .filter(Entry::is_live)
            .map(|e| e.value))
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .cache
            .iter()
            .filter(|(k, e)| e.is_live() && glob_match(pattern, k))
            .map(|(k, _)| k.to_string())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.get(key).await?);
        }
        Ok(values)
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.cache.invalidate(key).await;
        Ok(())
    }
}

/// Glob match supporting `*` only, which is all the key namespace needs.
pub fn glob_match(pattern: &str, key: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == key;
    }
    let (first, last) = (parts[0], parts[parts.len() - 1]);
    if !key.starts_with(first) || key.len() < first.len() + last.len() || !key.ends_with(last) {
        return false;
    }
    let mut rest = &key[first.len()..key.len() - last.len()];
    for part in &parts[1..parts.len() - 1] {
        match rest.find(part) {
            Some(idx) => rest = &rest[idx + part.len()..],
            None => return false,
        }
    }
    true
}
