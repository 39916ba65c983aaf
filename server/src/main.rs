//! Skymap worker and controller daemon (skymapd)

use clap::{Parser, Subcommand};
use std::fs;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod commands;
mod config;
mod db;
mod index;
mod inventory;

use commands::dispatcher::{ClusterDispatcher, Dispatcher};
use config::Config;
use db::meta::SqlMetaStore;
use inventory::ChunkInventory;

#[derive(Parser)]
#[command(name = "skymapd")]
#[command(about = "Skymap worker and controller daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server (runs in background)
    Serve {
        /// Run in foreground (don't daemonize)
        #[arg(long)]
        foreground: bool,
    },
    /// Stop the server
    Down,
    /// Show server status
    Status,
    /// Create the metadata schemas
    Migrate,
    /// Regenerate the published chunk list from the physical tables
    /// and print the resulting inventory
    RebuildChunks,
}

fn pid_file() -> PathBuf {
    dirs::runtime_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("skymapd.pid")
}

fn is_server_running() -> Option<u32> {
    let pid_path = pid_file();
    if pid_path.exists() {
        if let Ok(pid_str) = fs::read_to_string(&pid_path) {
            if let Ok(pid) = pid_str.trim().parse::<u32>() {
                #[cfg(unix)]
                {
                    let result = Command::new("kill")
                        .args(["-0", &pid.to_string()])
                        .stdout(Stdio::null())
                        .stderr(Stdio::null())
                        .status();
                    if result.map(|s| s.success()).unwrap_or(false) {
                        return Some(pid);
                    }
                }
                #[cfg(not(unix))]
                {
                    return Some(pid);
                }
            }
        }
        // Stale pid file, remove it
        let _ = fs::remove_file(&pid_path);
    }
    None
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Commands that don't need full init
    match &cli.command {
        Commands::Down => {
            return stop_server();
        }
        Commands::Status => {
            return show_status();
        }
        Commands::Serve { foreground } if !foreground => {
            return start_daemon();
        }
        _ => {}
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "skymapd=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    match cli.command {
        Commands::Serve { foreground: _ } => {
            run_server(config).await?;
        }
        Commands::Down | Commands::Status => unreachable!(),
        Commands::Migrate => {
            run_migrations(&config).await?;
        }
        Commands::RebuildChunks => {
            rebuild_chunks(&config).await?;
        }
    }

    Ok(())
}

fn start_daemon() -> anyhow::Result<()> {
    if let Some(pid) = is_server_running() {
        println!("skymapd already running (pid {pid})");
        return Ok(());
    }

    let exe = std::env::current_exe()?;
    let child = Command::new(&exe)
        .args(["serve", "--foreground"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;
    let pid = child.id();

    let pid_path = pid_file();
    if let Some(parent) = pid_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&pid_path, pid.to_string())?;

    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    println!("skymapd serving on localhost:{}", config.rest_port);
    println!("pid: {pid}");
    Ok(())
}

fn stop_server() -> anyhow::Result<()> {
    if let Some(pid) = is_server_running() {
        #[cfg(unix)]
        {
            Command::new("kill").args([&pid.to_string()]).status()?;
        }
        #[cfg(not(unix))]
        {
            Command::new("taskkill").args(["/PID", &pid.to_string(), "/F"]).status()?;
        }
        let _ = fs::remove_file(pid_file());
        println!("skymapd stopped");
    } else {
        println!("skymapd not running");
    }
    Ok(())
}

fn show_status() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    if let Some(pid) = is_server_running() {
        println!("skymapd running");
        println!("  pid: {pid}");
        println!("  instance: {}", config.instance_name);
        println!("  rest: localhost:{}", config.rest_port);
    } else {
        println!("skymapd not running");
    }
    Ok(())
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    let pid_path = pid_file();
    if let Some(parent) = pid_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&pid_path, std::process::id().to_string())?;

    let db_pool = db::create_pool(&config.database_url).await?;

    // The schema bootstrap is idempotent; run it on every startup.
    db::bootstrap(&db_pool, &config.instance_name).await?;
    db::bootstrap_controller(&db_pool).await?;

    // Load the inventory from its persistent backing and advertise
    // every hosted chunk to the dispatcher fabric.
    let inventory = Arc::new(ChunkInventory::new(config.instance_name.clone()));
    let store = SqlMetaStore::new(db_pool.clone(), &config.instance_name);
    inventory.init(&store).await?;
    let dispatcher = Arc::new(ClusterDispatcher::new());

    // Fabric event log: everything the dispatcher is told about the
    // worker's resources, for operators tailing the daemon.
    let mut events = dispatcher.subscribe();
    tokio::spawn(async move {
        use tokio::sync::broadcast::error::RecvError;
        loop {
            match events.recv().await {
                Ok(event) => {
                    let change = if event.added { "added" } else { "removed" };
                    tracing::info!(resource = %event.resource, "{change} on the dispatcher fabric");
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "fabric event log fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    for (database, chunks) in inventory.exist_map() {
        for chunk in chunks {
            dispatcher.resource_added(&database, chunk);
        }
    }
    tracing::info!(
        instance = %config.instance_name,
        worker_id = %inventory.id(),
        databases = inventory.databases().len(),
        "chunk inventory loaded"
    );

    let app_state = api::AppState::new(db_pool, config.clone(), inventory, dispatcher);

    let rest_addr = format!("0.0.0.0:{}", config.rest_port).parse()?;
    tracing::info!("REST listening on {rest_addr}");
    api::rest::serve(rest_addr, app_state).await?;

    let _ = fs::remove_file(pid_file());
    Ok(())
}

async fn run_migrations(config: &Config) -> anyhow::Result<()> {
    println!("creating metadata schemas...");
    let pool = db::create_pool(&config.database_url).await?;
    db::bootstrap(&pool, &config.instance_name).await?;
    db::bootstrap_controller(&pool).await?;
    println!("schemas ready");
    Ok(())
}

async fn rebuild_chunks(config: &Config) -> anyhow::Result<()> {
    let pool = db::create_pool(&config.database_url).await?;
    let store = SqlMetaStore::new(pool, &config.instance_name);
    let inventory = ChunkInventory::new(config.instance_name.clone());
    inventory.rebuild(&store).await?;
    let map = inventory.exist_map();
    if map.is_empty() {
        println!("no published chunks");
    } else {
        for (database, chunks) in map {
            println!("{database}: {} chunks", chunks.len());
        }
    }
    Ok(())
}
