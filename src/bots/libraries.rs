use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use tracing::{debug, info};

use crate::store::{Scope, ScriptStore};

pub const NODE_MODULES_ARCHIVE: &str = "node_modules.tgz";

/// Bot folders whose files must also exist on local disk to be importable.
const DISK_FOLDERS: [&str; 3] = ["libraries", "actions", "hooks"];

pub fn bot_dir(data_folder: &Path, bot_id: &str) -> PathBuf {
    data_folder.join("bots").join(bot_id)
}

/// Copies the bot's libraries, actions and hooks from a non-disk store to the data folder.
pub async fn sync_to_disk(store: &dyn ScriptStore, data_folder: &Path, bot_id: &str) -> Result<usize> {
    if store.is_disk_backed() {
        return Ok(0);
    }
    let scope = Scope::Bot(bot_id.to_string());
    let target = bot_dir(data_folder, bot_id);
    let mut copied = 0;
    for folder in DISK_FOLDERS {
        for rel in store.directory_listing(&scope, folder, "").await? {
            let content = store.read_file(&scope, folder, &rel).await?;
            let path = target.join(folder).join(&rel);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, content)
                .await
                .with_context(|| format!("could not write {}", path.display()))?;
            copied += 1;
        }
    }
    debug!(bot_id, copied, "bot files synced to disk");
    Ok(copied)
}

/// Unpacks `libraries/node_modules.tgz` of a bot into `<data>/bots/<id>/libraries/node_modules`.
/// Returns `false` when the bot has no archive.
pub async fn extract_node_modules(store: &dyn ScriptStore, data_folder: &Path, bot_id: &str) -> Result<bool> {
    let scope = Scope::Bot(bot_id.to_string());
    if !store.file_exists(&scope, "libraries", NODE_MODULES_ARCHIVE).await? {
        return Ok(false);
    }
    let archive = store.read_file(&scope, "libraries", NODE_MODULES_ARCHIVE).await?;
    let dest = bot_dir(data_folder, bot_id).join("libraries").join("node_modules");

    tokio::task::spawn_blocking(move || unpack(&archive, &dest))
        .await
        .context("archive extraction task failed")??;
    info!(bot_id, "bot libraries extracted");
    Ok(true)
}

/// Extracts next to `dest` first so a broken archive never replaces a working folder.
fn unpack(archive: &[u8], dest: &Path) -> Result<()> {
    let parent = dest.parent().context("destination has no parent")?;
    std::fs::create_dir_all(parent)?;
    let staging = tempfile::tempdir_in(parent)?;

    let mut tar = tar::Archive::new(GzDecoder::new(archive));
    tar.unpack(staging.path()).context("could not unpack archive")?;

    if dest.exists() {
        std::fs::remove_dir_all(dest)?;
    }
    std::fs::rename(staging.keep(), dest)
        .with_context(|| format!("could not move extracted files to {}", dest.display()))?;
    Ok(())
}
