//! nbkeep CLI entry point.
//!
//! Serves notebook operations as newline-delimited JSON-RPC on stdin/stdout.
//! Logs go to stderr so stdout carries only responses.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::info;
use nbkeep::config::{load_settings, load_settings_from, Settings};
use nbkeep::jupyter::JupyterBackend;
use nbkeep::{ManagerConfig, NotebookManager, RpcServer};

#[derive(Parser, Debug)]
#[command(name = "nbkeep")]
#[command(about = "Notebook editing and execution server for agent tooling")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Directory relative notebook paths resolve against (default: current dir)
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,

    /// Settings file (default: <config dir>/nbkeep/settings.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Undo snapshots kept per notebook
    #[arg(long, global = true)]
    history_size: Option<usize>,

    /// Seconds to wait for a notebook lock
    #[arg(long, global = true)]
    lock_timeout: Option<u64>,

    /// Default per-cell execution timeout in seconds
    #[arg(long, global = true)]
    exec_timeout: Option<u64>,

    /// Kernel for new notebooks
    #[arg(long, global = true)]
    kernel: Option<String>,

    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve JSON-RPC on stdio (default if no command specified)
    Serve,

    /// Print the effective settings as JSON
    Settings,
}

impl Cli {
    fn settings(&self) -> Settings {
        let mut settings = match &self.config {
            Some(path) => load_settings_from(path),
            None => load_settings(),
        };
        if let Some(size) = self.history_size {
            settings.history_size = size;
        }
        if let Some(secs) = self.lock_timeout {
            settings.lock_timeout_secs = secs;
        }
        if let Some(secs) = self.exec_timeout {
            settings.execution_timeout_secs = secs;
        }
        if let Some(kernel) = &self.kernel {
            settings.default_kernel = kernel.clone();
        }
        settings
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let settings = cli.settings();
    match cli.command {
        None | Some(Commands::Serve) => serve(cli.workspace, &settings).await,
        Some(Commands::Settings) => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(())
        }
    }
}

async fn serve(workspace: Option<PathBuf>, settings: &Settings) -> anyhow::Result<()> {
    let workspace = match workspace {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to resolve current directory")?,
    };
    let workspace = std::path::absolute(&workspace)
        .with_context(|| format!("Invalid workspace {:?}", workspace))?;

    let backend = JupyterBackend::new(Duration::from_secs(settings.kernel_startup_timeout_secs));
    let manager = NotebookManager::new(ManagerConfig::from(settings), Arc::new(backend));
    let server = RpcServer::new(manager, workspace.clone());

    let config = server.manager().config();
    info!("nbkeep starting...");
    info!("Configuration:");
    info!("  Workspace: {:?}", workspace);
    info!("  History size: {}", config.history_size);
    info!("  Lock timeout: {:?}", config.lock_timeout);
    info!("  Execution timeout: {:?}", config.execution_timeout);
    info!("  Kernel startup timeout: {}s", settings.kernel_startup_timeout_secs);
    info!("  Default kernel: {}", config.default_kernel);

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    server
        .serve(stdin, stdout)
        .await
        .context("stdio transport failed")?;

    info!("nbkeep stopped");
    Ok(())
}
