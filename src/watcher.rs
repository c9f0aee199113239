use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use notify::{Config, Event, EventKind, PollWatcher, RecursiveMode, Watcher};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{sync::mpsc::UnboundedReceiver, task::JoinHandle, time::Duration};
use tracing::{debug, warn};

/// Something that reacts to files changing under a watched directory.
#[async_trait]
pub trait WatchedType: Send + Sync + 'static {
    fn is_relevant(&self, path: &Path) -> bool;
    async fn on_create_or_modify(&self, path: &Path) -> Result<()>;
    async fn on_remove(&self, path: &Path) -> Result<()>;
}

/// Polls a directory tree and forwards relevant changes to a [`WatchedType`].
/// Dropping or shutting it down stops the polling.
pub struct DirectoryWatcher {
    dir: PathBuf,
    handle: JoinHandle<()>,
    // kept alive for as long as the watcher runs
    _watcher: PollWatcher,
}

impl DirectoryWatcher {
    pub fn new(
        dir: PathBuf,
        watched: Arc<dyn WatchedType>,
        poll_interval: Duration,
    ) -> Result<DirectoryWatcher> {
        if !dir.exists() {
            bail!("Directory {} does not exist", dir.display());
        }

        let (tx, rx): (_, UnboundedReceiver<notify::Result<Event>>) =
            tokio::sync::mpsc::unbounded_channel();

        let mut watcher = PollWatcher::new(
            move |res| {
                // nobody listening any more once the receiver is gone
                let _ = tx.send(res);
            },
            Config::default().with_poll_interval(poll_interval),
        )
        .context("failed to create PollWatcher")?;
        watcher
            .watch(&dir, RecursiveMode::Recursive)
            .with_context(|| format!("failed to watch {}", dir.display()))?;

        let handle = tokio::spawn(dispatch(rx, watched));
        debug!("watching {}", dir.display());

        Ok(DirectoryWatcher {
            dir,
            handle,
            _watcher: watcher,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn shutdown(self) {
        self.handle.abort();
    }
}

impl Drop for DirectoryWatcher {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn dispatch(mut rx: UnboundedReceiver<notify::Result<Event>>, watched: Arc<dyn WatchedType>) {
    while let Some(res) = rx.recv().await {
        let event = match res {
            Ok(event) => event,
            Err(e) => {
                warn!(?e, "Watcher error");
                continue;
            }
        };
        let removed = match event.kind {
            EventKind::Create(_) | EventKind::Modify(_) => false,
            EventKind::Remove(_) => true,
            _ => continue,
        };
        for path in event.paths.iter().filter(|p| watched.is_relevant(p)) {
            let result = if removed {
                watched.on_remove(path).await
            } else {
                watched.on_create_or_modify(path).await
            };
            if let Err(e) = result {
                warn!(?path, ?e, "Failed to handle file change");
            }
        }
    }
}
