use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use rhai::Shared;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::debounce::Debouncer;
use super::modules::ModuleCache;
use super::sandbox::{Sandbox, SandboxMode, ScriptContext, ScriptFailure};
use super::{Hook, HookReport, HookScript, SCRIPT_EXTENSION, hook_dir, script_file};
use crate::config::HostConfig;
use crate::error::{HostError, HostResult};
use crate::logger::Logger;
use crate::store::{Scope, SharedStore};
use crate::watcher::{DirectoryWatcher, WatchedType};

static INVALIDATING_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)[\\/]hooks[\\/]|[\\/]libraries").expect("valid regex"));

#[derive(Debug, Clone)]
pub struct HookServiceOptions {
    pub data_folder: PathBuf,
    pub mode: SandboxMode,
    pub default_timeout: Duration,
    pub debounce: Duration,
    /// Value of `process` inside scripts.
    pub process: Value,
}

impl HookServiceOptions {
    pub fn from_config(config: &HostConfig) -> Self {
        Self {
            data_folder: config.data_folder.clone(),
            mode: if config.hooks_outside_sandbox {
                SandboxMode::Direct
            } else {
                SandboxMode::Isolated
            },
            default_timeout: config.hook_timeout,
            debounce: config.hooks_debounce,
            process: super::sandbox::process_info(
                &config.server_id,
                config.is_production,
                config.cluster_enabled,
                &config.version,
            ),
        }
    }
}

/// A script file as listed for administration, disabled ones included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptEntry {
    pub path: String,
    pub name: String,
    pub enabled: bool,
}

/// Discovers, caches and runs hook scripts.
pub struct HookService {
    store: SharedStore,
    options: HookServiceOptions,
    sandbox: Sandbox,
    modules: Shared<ModuleCache>,
    scripts: DashMap<String, Arc<Vec<HookScript>>>,
    debouncer: Debouncer,
}

impl HookService {
    /// Must be called within a tokio runtime: the debouncer runs as a task.
    pub fn new(store: SharedStore, options: HookServiceOptions, logger: Logger) -> Arc<Self> {
        let modules = Shared::new(ModuleCache::new());
        let debounced = modules.clone();
        let debouncer = Debouncer::spawn(options.debounce, move || {
            debounced.invalidate();
        });
        Arc::new(Self {
            sandbox: Sandbox::new(modules.clone(), logger),
            store,
            options,
            modules,
            scripts: DashMap::new(),
            debouncer,
        })
    }

    pub fn modules(&self) -> &ModuleCache {
        &self.modules
    }

    /// Runs every enabled script of the hook's folder in filename order.
    pub async fn execute_hook(&self, hook: &Hook) -> HostResult<HookReport> {
        let scripts = self.extract_scripts(&hook.folder, hook.bot_id()).await;
        let timeout = hook.options.timeout.unwrap_or(self.options.default_timeout);
        let mut report = HookReport::default();
        if scripts.is_empty() {
            return Ok(report);
        }

        let mut args = hook.args.clone();
        for script in scripts.iter() {
            let ctx = ScriptContext {
                folder: hook.folder.clone(),
                args: args.clone(),
                process: self.options.process.clone(),
                lookup_paths: self.lookup_paths(script),
                timeout,
            };
            debug!(path = %script.path, "executing hook script");
            match self.sandbox.run(self.options.mode, script, &ctx).await {
                Ok(result) => {
                    report.executed += 1;
                    if let Some(value) = result {
                        args.insert("hook_result".to_string(), value.clone());
                        report.result = Some(value);
                    }
                }
                Err(failure) => {
                    let err = match failure {
                        ScriptFailure::Timeout => HostError::HookTimeout {
                            path: script.path.clone(),
                            folder: hook.folder.clone(),
                            timeout_ms: timeout.as_millis() as u64,
                        },
                        ScriptFailure::Error(reason) => HostError::Hook {
                            path: script.path.clone(),
                            folder: hook.folder.clone(),
                            reason,
                        },
                    };
                    error!("{err}");
                    if hook.options.throw_on_error {
                        return Err(err);
                    }
                    report.failed.push(script.path.clone());
                }
            }
        }
        Ok(report)
    }

    /// Enabled scripts for `folder`, global ones plus those of `bot_id` if given.
    pub async fn extract_scripts(&self, folder: &str, bot_id: Option<&str>) -> Arc<Vec<HookScript>> {
        let key = match bot_id {
            Some(bot) => format!("{bot}/{folder}"),
            None => folder.to_string(),
        };
        if let Some(cached) = self.scripts.get(&key) {
            return cached.clone();
        }

        match self.discover(folder, bot_id).await {
            Ok(scripts) => {
                let scripts = Arc::new(scripts);
                self.scripts.insert(key, scripts.clone());
                scripts
            }
            Err(e) => {
                warn!(folder, "could not list hook scripts: {e:#}");
                self.scripts.remove(&key);
                Arc::new(vec![])
            }
        }
    }

    async fn discover(&self, folder: &str, bot_id: Option<&str>) -> Result<Vec<HookScript>> {
        let dir = hook_dir(folder, None);
        let mut scopes = vec![(Scope::Global, None)];
        if let Some(bot) = bot_id {
            scopes.push((Scope::Bot(bot.to_string()), Some(bot.to_string())));
        }

        let mut scripts = Vec::new();
        let suffix = format!(".{SCRIPT_EXTENSION}");
        for (scope, owner) in scopes {
            for rel in self.store.directory_listing(&scope, &dir, &suffix).await? {
                let (sub, filename) = match rel.rsplit_once('/') {
                    Some((sub, file)) => (format!("{dir}/{sub}"), file.to_string()),
                    None => (dir.clone(), rel.clone()),
                };
                if filename.starts_with('.') {
                    continue;
                }
                let code = self.store.read_to_string(&scope, &sub, &filename).await?;
                let path = match &owner {
                    Some(bot) => format!("bots/{bot}/{sub}/{filename}"),
                    None => format!("{sub}/{filename}"),
                };
                scripts.push(HookScript {
                    path,
                    name: filename.trim_end_matches(&suffix).to_string(),
                    dir: sub,
                    filename,
                    code,
                    bot_id: owner.clone(),
                });
            }
        }
        scripts.sort_by(|a, b| a.filename.cmp(&b.filename));
        Ok(scripts)
    }

    /// Every script file of `folder` in the global scope, enabled or not.
    pub async fn list_scripts(&self, folder: &str) -> HostResult<Vec<ScriptEntry>> {
        let dir = hook_dir(folder, None);
        let listing = self
            .store
            .directory_listing(&Scope::Global, &dir, &format!(".{SCRIPT_EXTENSION}"))
            .await
            .map_err(HostError::Store)?;
        Ok(listing
            .into_iter()
            .map(|rel| {
                let file = rel.rsplit('/').next().unwrap_or(&rel);
                let enabled = !file.starts_with('.');
                let name = file
                    .trim_start_matches('.')
                    .trim_end_matches(&format!(".{SCRIPT_EXTENSION}"))
                    .to_string();
                ScriptEntry {
                    path: format!("{dir}/{rel}"),
                    name,
                    enabled,
                }
            })
            .collect())
    }

    pub async fn enable_script(&self, folder: &str, name: &str, module: Option<&str>) -> bool {
        let file = script_file(name);
        self.rename(folder, module, &format!(".{file}"), &file).await
    }

    pub async fn disable_script(&self, folder: &str, name: &str, module: Option<&str>) -> bool {
        let file = script_file(name);
        self.rename(folder, module, &file, &format!(".{file}")).await
    }

    async fn rename(&self, folder: &str, module: Option<&str>, from: &str, to: &str) -> bool {
        let dir = hook_dir(folder, module);
        match self.store.rename_file(&Scope::Global, &dir, from, to).await {
            Ok(()) => {
                info!(%dir, from, to, "hook script renamed");
                self.scripts.clear();
                true
            }
            Err(e) => {
                warn!(%dir, from, to, "could not rename hook script: {e:#}");
                false
            }
        }
    }

    /// Reacts to a changed file under the data folder.
    pub fn invalidate_path(&self, path: &str) {
        if INVALIDATING_PATH.is_match(path) {
            debug!(path, "hook sources changed");
            self.scripts.clear();
            self.debouncer.signal();
        }
    }

    /// Polls the data folder and feeds changes to [`HookService::invalidate_path`].
    pub fn watch(self: &Arc<Self>, poll_interval: Duration) -> Result<DirectoryWatcher> {
        DirectoryWatcher::new(
            self.options.data_folder.clone(),
            Arc::new(HookInvalidation(self.clone())),
            poll_interval,
        )
    }

    fn lookup_paths(&self, script: &HookScript) -> Vec<PathBuf> {
        let data = &self.options.data_folder;
        let mut paths = match &script.bot_id {
            Some(bot) => vec![data.join("bots").join(bot).join(&script.dir)],
            None => vec![data.join("global").join(&script.dir)],
        };
        paths.push(data.join("global").join("libraries"));
        if let Some(bot) = &script.bot_id {
            let libraries = data.join("bots").join(bot).join("libraries");
            paths.push(libraries.join("node_modules"));
            paths.push(libraries);
        }
        paths
    }
}

/// Forwards file-system changes to a [`HookService`].
pub struct HookInvalidation(pub Arc<HookService>);

#[async_trait]
impl WatchedType for HookInvalidation {
    fn is_relevant(&self, path: &Path) -> bool {
        INVALIDATING_PATH.is_match(&path.to_string_lossy())
    }

    async fn on_create_or_modify(&self, path: &Path) -> Result<()> {
        self.0.invalidate_path(&path.to_string_lossy());
        Ok(())
    }

    async fn on_remove(&self, path: &Path) -> Result<()> {
        self.0.invalidate_path(&path.to_string_lossy());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{HookOptions, HookType};
    use crate::store::{DiskScriptStore, MemoryScriptStore};
    use serde_json::json;
    use tempfile::TempDir;

    fn options(data: &Path) -> HookServiceOptions {
        HookServiceOptions {
            data_folder: data.to_path_buf(),
            mode: SandboxMode::Isolated,
            default_timeout: Duration::from_millis(1000),
            debounce: Duration::from_millis(50),
            process: json!({ "server_id": "test" }),
        }
    }

    async fn put(store: &SharedStore, folder: &str, file: &str, code: &str) {
        store
            .upsert_file(&Scope::Global, &hook_dir(folder, None), file, code.as_bytes().to_vec())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn runs_scripts_in_filename_order_and_chains_results() {
        let store: SharedStore = MemoryScriptStore::new();
        put(&store, "after_bot_mount", "02_second.rhai", r#"hook_result = hook_result + "b";"#).await;
        put(&store, "after_bot_mount", "01_first.rhai", r#"hook_result = bot_id + ":a";"#).await;
        put(&store, "after_bot_mount", ".00_disabled.rhai", r#"throw "never";"#).await;
        let service = HookService::new(store, options(Path::new("/tmp")), Logger::tracing());

        let report = service.execute_hook(&Hook::after_bot_mount("welcome")).await.unwrap();
        assert_eq!(report.executed, 2);
        assert!(report.failed.is_empty());
        assert_eq!(report.result, Some(json!("welcome:ab")));
    }

    #[tokio::test]
    async fn disable_and_enable_round_trip() {
        let tmp = TempDir::new().unwrap();
        let store: SharedStore = DiskScriptStore::new(tmp.path());
        put(&store, "after_bot_mount", "greet.rhai", "let a = 1;").await;
        let service = HookService::new(store, options(tmp.path()), Logger::tracing());

        let names = |s: Arc<Vec<HookScript>>| s.iter().map(|s| s.name.clone()).collect::<Vec<_>>();
        assert_eq!(names(service.extract_scripts("after_bot_mount", None).await), vec!["greet"]);

        assert!(service.disable_script("after_bot_mount", "greet", None).await);
        assert!(service.extract_scripts("after_bot_mount", None).await.is_empty());
        assert!(tmp.path().join("global/hooks/after_bot_mount/.greet.rhai").exists());
        assert!(!service.disable_script("after_bot_mount", "greet", None).await);

        assert!(service.enable_script("after_bot_mount", "greet", None).await);
        assert_eq!(names(service.extract_scripts("after_bot_mount", None).await), vec!["greet"]);

        let listed = service.list_scripts("after_bot_mount").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].enabled);
    }

    #[tokio::test]
    async fn failures_are_skipped_unless_throw_on_error() {
        let store: SharedStore = MemoryScriptStore::new();
        put(&store, "after_bot_mount", "01_bad.rhai", r#"throw "bad script";"#).await;
        put(&store, "after_bot_mount", "02_good.rhai", "hook_result = 7;").await;
        let service = HookService::new(store, options(Path::new("/tmp")), Logger::tracing());

        let report = service.execute_hook(&Hook::after_bot_mount("b")).await.unwrap();
        assert_eq!(report.executed, 1);
        assert_eq!(report.failed, vec!["hooks/after_bot_mount/01_bad.rhai".to_string()]);
        assert_eq!(report.result, Some(json!(7)));

        let strict = Hook::after_bot_mount("b").with_options(HookOptions {
            timeout: None,
            throw_on_error: true,
        });
        let err = service.execute_hook(&strict).await.unwrap_err();
        assert!(
            err.to_string()
                .starts_with(r#"An error occurred on "hooks/after_bot_mount/01_bad.rhai" on "after_bot_mount"."#),
            "{err}"
        );
    }

    #[tokio::test]
    async fn timeouts_propagate_for_veto_hooks() {
        let store: SharedStore = MemoryScriptStore::new();
        put(&store, "on_stage_request", "spin.rhai", "loop { }").await;
        let service = HookService::new(store, options(Path::new("/tmp")), Logger::tracing());

        let hook = Hook::new(HookType::OnStageChangeRequest, json!({ "bot_id": "b" })).with_options(
            HookOptions {
                timeout: Some(Duration::from_millis(50)),
                throw_on_error: true,
            },
        );
        let err = service.execute_hook(&hook).await.unwrap_err();
        assert!(matches!(err, HostError::HookTimeout { timeout_ms: 50, .. }), "{err}");
    }

    #[tokio::test]
    async fn bot_scoped_scripts_join_global_ones() {
        let store: SharedStore = MemoryScriptStore::new();
        put(&store, "after_bot_mount", "01_global.rhai", "hook_result = 1;").await;
        store
            .upsert_file(
                &Scope::Bot("welcome".into()),
                "hooks/after_bot_mount",
                "02_bot.rhai",
                b"hook_result = hook_result + 1;".to_vec(),
            )
            .await
            .unwrap();
        let service = HookService::new(store, options(Path::new("/tmp")), Logger::tracing());

        let report = service.execute_hook(&Hook::after_bot_mount("welcome")).await.unwrap();
        assert_eq!(report.result, Some(json!(2)));
        let other = service.execute_hook(&Hook::after_bot_mount("other")).await.unwrap();
        assert_eq!(other.executed, 1);
    }

    #[tokio::test]
    async fn invalidation_clears_scripts_and_bumps_modules() {
        let store: SharedStore = MemoryScriptStore::new();
        put(&store, "after_server_start", "a.rhai", "let a = 1;").await;
        let service = HookService::new(store.clone(), options(Path::new("/tmp")), Logger::tracing());
        assert_eq!(service.extract_scripts("after_server_start", None).await.len(), 1);

        put(&store, "after_server_start", "b.rhai", "let b = 1;").await;
        service.invalidate_path("/data/global/readme.md");
        assert_eq!(service.extract_scripts("after_server_start", None).await.len(), 1);

        service.invalidate_path("/data/global/hooks/after_server_start/b.rhai");
        assert_eq!(service.extract_scripts("after_server_start", None).await.len(), 2);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(service.modules().version(), 1);
    }
}
