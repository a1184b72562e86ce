use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use layoutd::config::{self, AppConfig};
use layoutd::context::AppContext;
use layoutd::core::Orchestrator;
use layoutd::logging::{self, LogConfig};
use layoutd::rpc::RpcClient;
use serde::Serialize;
use serde_json::{Value, json};

#[derive(Parser)]
#[command(name = "layoutd")]
#[command(about = "pNFS layout door: hands out layouts that point clients at pool movers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default /etc/layoutd/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Daemon address for the admin commands (default: rpc_bind)
    #[arg(long, global = true)]
    rpc: Option<SocketAddr>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the door
    Daemon(DaemonArgs),
    /// Show door status
    Status,
    /// Show pools and their device ids
    Pools { pool: Option<String> },
    /// Show active transfers
    Transfers,
    /// Forget the device id of a pool
    ResetPool { pool: String },
    /// Kill a mover on a pool
    KillMover { pool: String, mover_id: u32 },
    /// Print the effective configuration
    Config,
}

#[derive(Args, Serialize)]
struct DaemonArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    rpc_bind: Option<SocketAddr>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    io_queue: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    reply_timeout_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    mover_kill_timeout_ms: Option<u64>,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    #[arg(long)]
    simulation: bool,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    #[arg(long, short)]
    verbose: bool,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let path = config::config_path(cli.config);

    let config = match &cli.command {
        Commands::Daemon(args) => AppConfig::load(&path, Some(args))?,
        _ => AppConfig::load(&path, None::<&DaemonArgs>)?,
    };

    match cli.command {
        Commands::Daemon(_) => {
            logging::init(LogConfig::from(&config));
            run_daemon(config).await.context("Failed to start daemon")?
        }
        Commands::Config => print!("{}", config.to_toml()?),
        admin => {
            let addr = cli.rpc.unwrap_or(config.rpc_bind);
            run_admin(addr, admin)
                .await
                .with_context(|| format!("Admin request to {} failed", addr))?
        }
    }

    Ok(())
}

async fn run_daemon(config: AppConfig) -> Result<()> {
    let (ctx, events) = AppContext::new(config)?;
    Orchestrator::new(ctx, events).start().await
}

async fn run_admin(addr: SocketAddr, command: Commands) -> Result<()> {
    let (method, params) = match command {
        Commands::Status => ("daemon.status", None),
        Commands::Pools { pool } => ("pools.list", Some(json!({ "pool": pool }))),
        Commands::Transfers => ("transfers.list", None),
        Commands::ResetPool { pool } => ("pool.reset_id", Some(json!({ "pool": pool }))),
        Commands::KillMover { pool, mover_id } => (
            "mover.kill",
            Some(json!({ "pool": pool, "mover_id": mover_id })),
        ),
        Commands::Daemon(_) | Commands::Config => anyhow::bail!("not an admin command"),
    };

    let result: Value = RpcClient::new(addr).call(method, params).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
