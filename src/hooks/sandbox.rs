use std::path::PathBuf;
use std::time::{Duration, Instant};

use rhai::serde::{from_dynamic, to_dynamic};
use rhai::{Dynamic, Engine, EvalAltResult, Scope, Shared};
use serde_json::{Map, Value, json};
use worker_channel::LogLevel;

use super::HookScript;
use super::modules::{AllowListResolver, ModuleCache};
use crate::logger::Logger;

/// Extra time granted to the blocking thread to notice its deadline.
const TERMINATION_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxMode {
    /// Blocking thread, wall-clock deadline, restricted process info.
    Isolated,
    /// Blocking thread without a deadline.
    Direct,
}

/// Everything one script execution sees.
#[derive(Debug, Clone)]
pub struct ScriptContext {
    pub folder: String,
    pub args: Map<String, Value>,
    pub process: Value,
    pub lookup_paths: Vec<PathBuf>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptFailure {
    Error(String),
    Timeout,
}

/// Process information exposed to scripts as `process`.
pub fn process_info(server_id: &str, is_production: bool, cluster_enabled: bool, version: &str) -> Value {
    let env: Map<String, Value> = std::env::vars()
        .filter(|(k, _)| k.starts_with("EXPOSED_"))
        .map(|(k, v)| (k, Value::String(v)))
        .collect();
    json!({
        "server_id": server_id,
        "is_production": is_production,
        "cluster_enabled": cluster_enabled,
        "version": version,
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "env": env,
    })
}

#[derive(Debug, Clone)]
pub struct Sandbox {
    modules: Shared<ModuleCache>,
    logger: Logger,
}

impl Sandbox {
    pub fn new(modules: Shared<ModuleCache>, logger: Logger) -> Self {
        Self { modules, logger }
    }

    /// Runs one script and returns the value it left in `hook_result`, if any.
    pub async fn run(
        &self,
        mode: SandboxMode,
        script: &HookScript,
        ctx: &ScriptContext,
    ) -> Result<Option<Value>, ScriptFailure> {
        let code = script.code.clone();
        let task_ctx = ctx.clone();
        let modules = self.modules.clone();
        let logger = self.logger.clone();
        let bounded = mode == SandboxMode::Isolated;
        let task = tokio::task::spawn_blocking(move || {
            let deadline = bounded.then(|| Instant::now() + task_ctx.timeout);
            let engine = build_engine(&task_ctx, modules, logger, deadline);
            execute(&engine, &code, &task_ctx)
        });

        let joined = if bounded {
            match tokio::time::timeout(ctx.timeout + TERMINATION_GRACE, task).await {
                Err(_) => return Err(ScriptFailure::Timeout),
                Ok(joined) => joined,
            }
        } else {
            task.await
        };
        joined.map_err(|join| ScriptFailure::Error(join.to_string()))?
    }
}

fn build_engine(
    ctx: &ScriptContext,
    modules: Shared<ModuleCache>,
    logger: Logger,
    deadline: Option<Instant>,
) -> Engine {
    let mut engine = Engine::new();
    engine.disable_symbol("eval");
    engine.set_module_resolver(AllowListResolver::new(ctx.lookup_paths.clone(), modules));

    let (print_logger, folder) = (logger.clone(), ctx.folder.clone());
    engine.on_print(move |msg| print_logger.log(LogLevel::Info, &folder, msg));

    let (debug_logger, folder) = (logger.clone(), ctx.folder.clone());
    engine.on_debug(move |msg, _source, pos| {
        debug_logger.log(LogLevel::Debug, &folder, &format!("{msg} ({pos})"))
    });

    let folder = ctx.folder.clone();
    engine.register_fn("print_object", move |value: Dynamic| {
        let rendered = from_dynamic::<Value>(&value)
            .ok()
            .and_then(|v| serde_json::to_string_pretty(&v).ok())
            .unwrap_or_else(|| value.to_string());
        logger.log(LogLevel::Info, &folder, &rendered);
    });

    if let Some(deadline) = deadline {
        engine.on_progress(move |_ops| (Instant::now() >= deadline).then_some(Dynamic::UNIT));
    }
    engine
}

fn execute(engine: &Engine, code: &str, ctx: &ScriptContext) -> Result<Option<Value>, ScriptFailure> {
    let failed = |e: &dyn std::fmt::Display| ScriptFailure::Error(e.to_string());

    let ast = engine.compile(code).map_err(|e| failed(&e))?;
    let mut scope = Scope::new();
    for (name, value) in &ctx.args {
        scope.push_dynamic(name.as_str(), to_dynamic(value).map_err(|e| failed(&e))?);
    }
    if !ctx.args.contains_key("hook_result") {
        scope.push_dynamic("hook_result", Dynamic::UNIT);
    }
    scope.push_constant_dynamic("process", to_dynamic(&ctx.process).map_err(|e| failed(&e))?);

    engine
        .run_ast_with_scope(&mut scope, &ast)
        .map_err(|e| match *e {
            EvalAltResult::ErrorTerminated(..) => ScriptFailure::Timeout,
            other => failed(&other),
        })?;

    match scope.get_value::<Dynamic>("hook_result") {
        Some(result) if !result.is_unit() => from_dynamic::<Value>(&result)
            .map(Some)
            .map_err(|e| failed(&e)),
        _ => Ok(None),
    }
}
