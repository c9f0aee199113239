use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bothost::apps::{
    FrontOptions, Infrastructure, WorkerOptions, apply_worker_env, bootstrap_front, bootstrap_worker,
    ensure_data_folder, in_process_worker,
};
use bothost::config::{ConfigManager, EnvConfigManager, HostConfig};
use bothost::hooks::{HookService, HookServiceOptions};
use bothost::logger::{Logger, TracingOptions, init_tracing};
use bothost::orchestrator::{CoreClient, InProcessLauncher, ProcessLauncher, WorkerLauncher};
use bothost::store::DiskScriptStore;
use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};
use worker_channel::WorkerEnv;
use worker_channel::worker_runtime::{announce_ready, listen_stdin};

const HOOK_WATCH_POLL: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "bothost", about = "Control plane of a multi-tenant bot host", version)]
struct Cli {
    /// `.env` file read before the process environment
    #[arg(long, global = true, default_value = ".env")]
    env_file: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the front controller and its workers
    Run(RunArgs),

    /// Run one worker (spawned by the master)
    Worker(LogArgs),

    /// Manage hook scripts
    Hooks(HooksArgs),
}

#[derive(Args, Debug, Clone)]
struct LogArgs {
    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// OpenTelemetry logs endpoint (e.g. http://localhost:4318)
    #[arg(long)]
    otel_logs_endpoint: Option<String>,

    /// OpenTelemetry events endpoint (e.g. http://localhost:4318)
    #[arg(long)]
    otel_events_endpoint: Option<String>,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    log: LogArgs,

    /// Number of workers to start
    #[arg(long, default_value_t = 1)]
    workers: usize,

    /// Run workers as tasks of this process instead of child processes
    #[arg(long)]
    in_process: bool,
}

#[derive(Args, Debug)]
struct HooksArgs {
    #[command(subcommand)]
    command: HookCommands,
}

#[derive(Subcommand, Debug)]
enum HookCommands {
    /// List the scripts of a hook folder
    List { folder: String },
    /// Enable a disabled script
    Enable {
        folder: String,
        name: String,
        #[arg(long)]
        module: Option<String>,
    },
    /// Disable a script without deleting it
    Disable {
        folder: String,
        name: String,
        #[arg(long)]
        module: Option<String>,
    },
}

fn tracing_options(config: &HostConfig, log: &LogArgs, prefix: &str) -> TracingOptions {
    TracingOptions {
        log_dir: config.data_folder.join("logs"),
        log_file: format!("{prefix}.log"),
        event_file: format!("{prefix}_events.log"),
        log_level: log.log_level.clone(),
        otel_logs_endpoint: log.otel_logs_endpoint.clone(),
        otel_metrics_endpoint: log.otel_events_endpoint.clone(),
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_mgr = ConfigManager(EnvConfigManager::new(cli.env_file.clone()));
    let mut config = HostConfig::load(&config_mgr).await?;

    match cli.command.unwrap_or(Commands::Run(RunArgs {
        log: LogArgs {
            log_level: "info".to_string(),
            otel_logs_endpoint: None,
            otel_events_endpoint: None,
        },
        workers: 1,
        in_process: false,
    })) {
        Commands::Run(args) => {
            ensure_data_folder(&config)?;
            let (logger, _guard) = init_tracing(&tracing_options(&config, &args.log, "bothost"))?;
            if let Err(e) = run(config, logger, args).await {
                error!("bot host stopped with an error: {e:#}");
                process::exit(1);
            }
            Ok(())
        }
        Commands::Worker(log) => {
            let env = WorkerEnv::from_env()?;
            apply_worker_env(&mut config, &env);
            let (logger, _guard) =
                init_tracing(&tracing_options(&config, &log, &format!("worker_{}", env.worker_id)))?;
            run_worker(config, env, logger).await
        }
        Commands::Hooks(args) => {
            let store = DiskScriptStore::new(config.data_folder.clone());
            let hooks = HookService::new(store, HookServiceOptions::from_config(&config), Logger::tracing());
            match args.command {
                HookCommands::List { folder } => {
                    for script in hooks.list_scripts(&folder).await? {
                        let state = if script.enabled { "enabled" } else { "disabled" };
                        println!("{:<10} {}", state, script.path);
                    }
                }
                HookCommands::Enable { folder, name, module } => {
                    if !hooks.enable_script(&folder, &name, module.as_deref()).await {
                        anyhow::bail!("no disabled script `{name}` in `{folder}`");
                    }
                    println!("Enabled {folder}/{name}");
                }
                HookCommands::Disable { folder, name, module } => {
                    if !hooks.disable_script(&folder, &name, module.as_deref()).await {
                        anyhow::bail!("no enabled script `{name}` in `{folder}`");
                    }
                    println!("Disabled {folder}/{name}");
                }
            }
            Ok(())
        }
    }
}

async fn run(config: HostConfig, logger: Logger, args: RunArgs) -> anyhow::Result<()> {
    info!(server_id = %config.server_id, "bot host starting up");
    let infra = Infrastructure::local(&config.data_folder);

    let launcher: Arc<dyn WorkerLauncher> = if args.in_process {
        Arc::new(InProcessLauncher::new(in_process_worker(config.clone(), infra.clone(), logger)))
    } else {
        warn!(
            workers = args.workers,
            "worker processes each keep their own in-memory cache and bus, \
             so bot health and cluster broadcasts stay local to each worker"
        );
        match &config.worker_executable {
            Some(program) => Arc::new(ProcessLauncher::new(program.clone(), vec!["worker".to_string()])),
            None => Arc::new(ProcessLauncher::current_exe()?),
        }
    };
    let app = bootstrap_front(
        &config,
        infra.cache.clone(),
        FrontOptions {
            launcher,
            workers: args.workers,
            port: None,
        },
    )
    .await?;

    info!(port = app.port, "bot host running; press Ctrl-C to exit");
    tokio::signal::ctrl_c().await.context("could not listen for Ctrl-C")?;
    info!("bot host shutting down");
    app.shutdown().await;
    Ok(())
}

async fn run_worker(config: HostConfig, env: WorkerEnv, logger: Logger) -> anyhow::Result<()> {
    let stop = listen_stdin();
    let infra = Infrastructure::local(&config.data_folder);
    let options = WorkerOptions {
        port: Some(env.port),
        core: Some(CoreClient::from_env(&env)),
        watch_poll: Some(HOOK_WATCH_POLL),
    };
    let app = bootstrap_worker(config, infra, logger, options).await?;
    announce_ready(app.port).await?;

    let _ = stop.await;
    app.shutdown().await;
    Ok(())
}
