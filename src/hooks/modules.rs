//! Import resolution for hook scripts.
//!
//! Compiled library modules are cached by resolved path together with the cache
//! version they were compiled under. Bumping the version makes every entry stale
//! at once without touching in-flight executions, which keep the `Arc` they hold.

use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use rhai::module_resolvers::ModuleResolver;
use rhai::{Engine, EvalAltResult, Module, Position, Scope, Shared};
use tracing::debug;

use super::SCRIPT_EXTENSION;

#[derive(Debug, Default)]
pub struct ModuleCache {
    version: AtomicU64,
    modules: DashMap<PathBuf, (u64, Shared<Module>)>,
}

impl ModuleCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Marks every cached module stale; returns the new version.
    pub fn invalidate(&self) -> u64 {
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        self.modules.retain(|_, (v, _)| *v >= version);
        debug!(version, "hook module cache invalidated");
        version
    }

    pub fn get(&self, path: &Path) -> Option<Shared<Module>> {
        let current = self.version();
        self.modules
            .get(path)
            .filter(|entry| entry.0 == current)
            .map(|entry| entry.1.clone())
    }

    pub fn insert(&self, path: PathBuf, module: Shared<Module>) {
        self.modules.insert(path, (self.version(), module));
    }

    pub fn len(&self) -> usize {
        let current = self.version();
        self.modules.iter().filter(|e| e.value().0 == current).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Resolves `import "name"` only against an explicit list of directories.
pub struct AllowListResolver {
    lookup_paths: Vec<PathBuf>,
    cache: Shared<ModuleCache>,
}

impl AllowListResolver {
    pub fn new(lookup_paths: Vec<PathBuf>, cache: Shared<ModuleCache>) -> Self {
        Self { lookup_paths, cache }
    }

    fn locate(&self, name: &str) -> Option<PathBuf> {
        let relative = Path::new(name);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return None;
        }
        let with_ext = relative.with_extension(SCRIPT_EXTENSION);
        self.lookup_paths
            .iter()
            .flat_map(|dir| [dir.join(relative), dir.join(&with_ext)])
            .find(|candidate| candidate.is_file())
    }
}

impl ModuleResolver for AllowListResolver {
    fn resolve(
        &self,
        engine: &Engine,
        _source: Option<&str>,
        path: &str,
        pos: Position,
    ) -> Result<Shared<Module>, Box<EvalAltResult>> {
        let not_found = || Box::new(EvalAltResult::ErrorModuleNotFound(path.to_string(), pos));
        let resolved = self.locate(path).ok_or_else(not_found)?;
        if let Some(module) = self.cache.get(&resolved) {
            return Ok(module);
        }

        let code = std::fs::read_to_string(&resolved).map_err(|_| not_found())?;
        let in_module = |err: Box<EvalAltResult>| {
            Box::new(EvalAltResult::ErrorInModule(path.to_string(), err, pos))
        };
        let ast = engine.compile(&code).map_err(|e| in_module(e.into()))?;
        let module: Shared<Module> = Module::eval_ast_as_new(Scope::new(), &ast, engine)
            .map_err(in_module)?
            .into();
        debug!(path = %resolved.display(), "compiled hook library");
        self.cache.insert(resolved, module.clone());
        Ok(module)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn engine_with(dir: &Path, cache: Shared<ModuleCache>) -> Engine {
        let mut engine = Engine::new();
        engine.set_module_resolver(AllowListResolver::new(vec![dir.to_path_buf()], cache));
        engine
    }

    #[test]
    fn resolves_from_lookup_paths_and_caches() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("greet.rhai"), r#"fn hello(n) { "hi " + n }"#).unwrap();
        let cache = Shared::new(ModuleCache::new());
        let engine = engine_with(tmp.path(), cache.clone());

        let out: String = engine
            .eval(r#"import "greet" as g; g::hello("bob")"#)
            .unwrap();
        assert_eq!(out, "hi bob");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn invalidation_bumps_version_and_recompiles() {
        let tmp = TempDir::new().unwrap();
        let lib = tmp.path().join("lib.rhai");
        std::fs::write(&lib, "fn v() { 1 }").unwrap();
        let cache = Shared::new(ModuleCache::new());
        let engine = engine_with(tmp.path(), cache.clone());

        let first: i64 = engine.eval(r#"import "lib" as l; l::v()"#).unwrap();
        std::fs::write(&lib, "fn v() { 2 }").unwrap();
        let cached: i64 = engine.eval(r#"import "lib" as l; l::v()"#).unwrap();
        assert_eq!((first, cached), (1, 1));

        assert_eq!(cache.invalidate(), 1);
        assert!(cache.is_empty());
        let fresh: i64 = engine.eval(r#"import "lib" as l; l::v()"#).unwrap();
        assert_eq!(fresh, 2);
    }

    #[test]
    fn rejects_paths_outside_the_allow_list() {
        let tmp = TempDir::new().unwrap();
        let inner = tmp.path().join("inner");
        std::fs::create_dir(&inner).unwrap();
        std::fs::write(tmp.path().join("secret.rhai"), "fn s() { 42 }").unwrap();
        let engine = engine_with(&inner, Shared::new(ModuleCache::new()));

        assert!(
            engine
                .eval::<i64>(r#"import "../secret" as s; s::s()"#)
                .is_err()
        );
    }
}
