//! nfp CLI: run the controller or inspect its configuration.

use clap::{Parser, Subcommand};
use nfp_controller::config::{Config, ModuleSpec, load_modules};
use nfp_controller::engine::{Controller, LbPolicy};
use nfp_controller::module::ModuleCatalog;
use nfp_controller::telemetry::{TelemetryConfig, init_telemetry};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "nfp", about = "Service function event controller")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controller daemon
    Serve {
        /// TOML file listing the modules to load (overrides NFP_MODULES_FILE)
        #[arg(long)]
        modules: Option<PathBuf>,
        /// Number of worker threads (overrides NFP_WORKERS)
        #[arg(long)]
        workers: Option<usize>,
        /// Load balancer policy (overrides NFP_LB_POLICY)
        #[arg(long)]
        policy: Option<LbPolicy>,
    },
    /// Print the effective configuration and available module kinds
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let mut config = Config::from_env()?;

    match cli.command {
        Command::Serve {
            modules,
            workers,
            policy,
        } => {
            if let Some(path) = modules {
                config.modules_file = Some(path);
            }
            if let Some(workers) = workers {
                config.workers = workers;
            }
            if let Some(policy) = policy {
                config.lb_policy = policy;
            }
            cmd_serve(config).await
        }
        Command::Config => cmd_config(&config),
    }
}

fn module_specs(config: &Config) -> anyhow::Result<Vec<ModuleSpec>> {
    match config.modules_file {
        Some(ref path) => Ok(load_modules(path)?),
        None => Ok(Vec::new()),
    }
}

async fn cmd_serve(config: Config) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "nfp-controller".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let specs = module_specs(&config)?;
    let modules = ModuleCatalog::builtin().build_all(&specs)?;
    tracing::info!(modules = modules.len(), "modules loaded");

    let controller = Controller::new(config.controller_config())?;
    controller.init(&modules)?;
    controller.start()?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupt received, shutting down");
    controller.shutdown().await;
    Ok(())
}

fn cmd_config(config: &Config) -> anyhow::Result<()> {
    println!("Workers:            {}", config.workers);
    println!("LB Policy:          {}", config.lb_policy);
    println!("Poll Interval:      {:?}", config.poll_interval);
    println!("Report Interval:    {:?}", config.report_interval);
    println!("Worker Concurrency: {}", config.worker_concurrency);
    println!("Queue Poll Timeout: {:?}", config.queue_poll_timeout);
    println!("Poll Inbox:         {}", config.poll_inbox_capacity);
    println!("OTLP Endpoint:      {}", config.otel_endpoint.as_deref().unwrap_or("-"));
    println!("Log Level:          {}", config.log_level);

    let mut kinds: Vec<_> = ModuleCatalog::builtin().kinds().collect();
    kinds.sort_unstable();
    println!("Module Kinds:       {}", kinds.join(", "));

    match config.modules_file {
        Some(ref path) => {
            println!("Modules File:       {}", path.display());
            for spec in module_specs(config)? {
                println!("  - {} ({} setting(s))", spec.kind, spec.settings.len());
            }
        }
        None => println!("Modules File:       -"),
    }
    Ok(())
}
