use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use dashmap::DashMap;

pub type SharedStore = Arc<dyn ScriptStore>;

/// Area of the script store a path is relative to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Shared by every bot: hooks, libraries, content types.
    Global,
    /// Parent of every bot folder; used to enumerate bots.
    Bots,
    Bot(String),
}

impl Scope {
    fn prefix(&self) -> String {
        match self {
            Scope::Global => "global".to_string(),
            Scope::Bots => "bots".to_string(),
            Scope::Bot(id) => format!("bots/{id}"),
        }
    }
}

/// Hierarchical file store holding hook scripts, libraries and bot configuration.
///
/// Paths are `/`-separated and relative to the scope. Listings are recursive and
/// return paths relative to the listed directory.
#[async_trait]
pub trait ScriptStore: Send + Sync + std::fmt::Debug {
    /// Whether files already live on the local disk under the data folder.
    fn is_disk_backed(&self) -> bool;
    async fn file_exists(&self, scope: &Scope, dir: &str, file: &str) -> Result<bool>;
    async fn read_file(&self, scope: &Scope, dir: &str, file: &str) -> Result<Vec<u8>>;
    async fn directory_listing(&self, scope: &Scope, dir: &str, suffix: &str) -> Result<Vec<String>>;
    async fn upsert_file(&self, scope: &Scope, dir: &str, file: &str, content: Vec<u8>) -> Result<()>;
    /// Fails when `from` is missing or `to` already exists.
    async fn rename_file(&self, scope: &Scope, dir: &str, from: &str, to: &str) -> Result<()>;

    async fn read_to_string(&self, scope: &Scope, dir: &str, file: &str) -> Result<String> {
        let bytes = self.read_file(scope, dir, file).await?;
        String::from_utf8(bytes).with_context(|| format!("{dir}/{file} is not valid UTF-8"))
    }
}

/// Joins `dir` and `file`, rejecting absolute paths and parent traversal.
pub fn join(dir: &str, file: &str) -> Result<String> {
    let joined = match (dir.trim_matches('/'), file.trim_matches('/')) {
        ("", f) => f.to_string(),
        (d, "") => d.to_string(),
        (d, f) => format!("{d}/{f}"),
    };
    if Path::new(&joined)
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
    {
        bail!("path `{joined}` escapes its scope");
    }
    Ok(joined)
}

/// Store backed by the data folder: `<root>/global/...` and `<root>/bots/<botId>/...`.
#[derive(Debug, Clone)]
pub struct DiskScriptStore {
    root: PathBuf,
}

impl DiskScriptStore {
    pub fn new(root: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self { root: root.into() })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, scope: &Scope, dir: &str, file: &str) -> Result<PathBuf> {
        Ok(self.root.join(scope.prefix()).join(join(dir, file)?))
    }
}

#[async_trait]
impl ScriptStore for DiskScriptStore {
    fn is_disk_backed(&self) -> bool {
        true
    }

    async fn file_exists(&self, scope: &Scope, dir: &str, file: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.path(scope, dir, file)?).await?)
    }

    async fn read_file(&self, scope: &Scope, dir: &str, file: &str) -> Result<Vec<u8>> {
        let path = self.path(scope, dir, file)?;
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("could not read {}", path.display()))
    }

    async fn directory_listing(&self, scope: &Scope, dir: &str, suffix: &str) -> Result<Vec<String>> {
        let base = self.path(scope, dir, "")?;
        if !tokio::fs::try_exists(&base).await? {
            return Ok(vec![]);
        }
        let mut found = Vec::new();
        let mut pending = vec![base.clone()];
        while let Some(current) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&current)
                .await
                .with_context(|| format!("could not list {}", current.display()))?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if path.to_string_lossy().ends_with(suffix) {
                    let rel = path.strip_prefix(&base)?;
                    found.push(
                        rel.components()
                            .map(|c| c.as_os_str().to_string_lossy())
                            .collect::<Vec<_>>()
                            .join("/"),
                    );
                }
            }
        }
        found.sort();
        Ok(found)
    }

    async fn upsert_file(&self, scope: &Scope, dir: &str, file: &str, content: Vec<u8>) -> Result<()> {
        let path = self.path(scope, dir, file)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content)
            .await
            .with_context(|| format!("could not write {}", path.display()))
    }

    async fn rename_file(&self, scope: &Scope, dir: &str, from: &str, to: &str) -> Result<()> {
        let src = self.path(scope, dir, from)?;
        let dst = self.path(scope, dir, to)?;
        if !tokio::fs::try_exists(&src).await? {
            bail!("{} does not exist", src.display());
        }
        if tokio::fs::try_exists(&dst).await? {
            bail!("{} already exists", dst.display());
        }
        tokio::fs::rename(&src, &dst)
            .await
            .with_context(|| format!("could not rename {} to {}", src.display(), dst.display()))
    }
}

/// Store kept entirely in memory, standing in for a remote (database) backend.
#[derive(Debug, Default)]
pub struct MemoryScriptStore {
    files: DashMap<String, Vec<u8>>,
}

impl MemoryScriptStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn key(scope: &Scope, dir: &str, file: &str) -> Result<String> {
        Ok(format!("{}/{}", scope.prefix(), join(dir, file)?))
    }
}

#[async_trait]
impl ScriptStore for MemoryScriptStore {
    fn is_disk_backed(&self) -> bool {
        false
    }

    async fn file_exists(&self, scope: &Scope, dir: &str, file: &str) -> Result<bool> {
        Ok(self.files.contains_key(&Self::key(scope, dir, file)?))
    }

    async fn read_file(&self, scope: &Scope, dir: &str, file: &str) -> Result<Vec<u8>> {
        let key = Self::key(scope, dir, file)?;
        self.files
            .get(&key)
            .map(|v| v.clone())
            .ok_or_else(|| anyhow!("{key} does not exist"))
    }

    async fn directory_listing(&self, scope: &Scope, dir: &str, suffix: &str) -> Result<Vec<String>> {
        let base = Self::key(scope, dir, "")?;
        let prefix = format!("{}/", base.trim_end_matches('/'));
        let mut found: Vec<String> = self
            .files
            .iter()
            .filter_map(|e| e.key().strip_prefix(&prefix).map(str::to_string))
            .filter(|rel| rel.ends_with(suffix))
            .collect();
        found.sort();
        Ok(found)
    }

    async fn upsert_file(&self, scope: &Scope, dir: &str, file: &str, content: Vec<u8>) -> Result<()> {
        self.files.insert(Self::key(scope, dir, file)?, content);
        Ok(())
    }

    async fn rename_file(&self, scope: &Scope, dir: &str, from: &str, to: &str) -> Result<()> {
        let src = Self::key(scope, dir, from)?;
        let dst = Self::key(scope, dir, to)?;
        if self.files.contains_key(&dst) {
            bail!("{dst} already exists");
        }
        let (_, content) = self
            .files
            .remove(&src)
            .ok_or_else(|| anyhow!("{src} does not exist"))?;
        self.files.insert(dst, content);
        Ok(())
    }
}
