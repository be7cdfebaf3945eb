use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use arbor_core::EngineConfig;
use arbor_observability::init_process_logging;
use arbor_providers::ProviderRegistry;
use arbor_server::{serve, AppState};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8440;
const LOG_RETENTION_DAYS: u64 = 14;

#[derive(Parser)]
#[command(
    name = "arbor-engine",
    about = "Agent orchestration engine for the Arbor code editor",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP engine.
    Serve {
        #[arg(long, default_value = DEFAULT_HOST)]
        hostname: String,
        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,
        /// Override WORKSPACE_ROOT for this process.
        #[arg(long)]
        workspace: Option<PathBuf>,
    },
    /// List the providers configured in the environment.
    Providers,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            workspace,
        } => {
            let mut config = EngineConfig::from_env();
            if let Some(workspace) = workspace {
                config.workspace_root = workspace;
            }
            let (_guard, info) = init_process_logging(&config.logs_dir, LOG_RETENTION_DAYS)?;
            tracing::info!(
                logs_dir = info.logs_dir.as_str(),
                workspace = %config.workspace_root.display(),
                "engine starting"
            );

            let state = AppState::new(config).context("failed to initialize engine state")?;
            let _sweeper = state.engine.spawn_sweeper();

            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .with_context(|| format!("invalid listen address {hostname}:{port}"))?;
            serve(addr, state).await
        }
        Command::Providers => {
            let providers = ProviderRegistry::from_env(None);
            let list = providers.list();
            if list.is_empty() {
                println!("no providers configured (set OPENAI_API_KEY, ANTHROPIC_API_KEY, or CUSTOM_BASE_URL)");
            }
            for info in list {
                println!("{}\t{}\t{}", info.id, info.name, info.model);
            }
            Ok(())
        }
    }
}
