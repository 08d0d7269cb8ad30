use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use lavaseco_pos::api::ServerClient;
use lavaseco_pos::config::Config;
use lavaseco_pos::models::InvoicePayload;
use lavaseco_pos::offline::{InvoiceChanges, LocalSearch, OfflineQueue};
use lavaseco_pos::server::{self, AppState};
use lavaseco_pos::sync::SyncEngine;

#[derive(Parser)]
#[command(name = "lavaseco", version, about = "Lavaseco POS server and offline invoice queue")]
struct Cli {
    /// Directory for rolling log files.
    #[arg(long, global = true, env = "LAVASECO_LOG_DIR")]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API over the shared database.
    Serve {
        #[arg(long)]
        bind: Option<std::net::SocketAddr>,
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Push the offline queue to the server.
    Sync {
        #[command(flatten)]
        target: QueueTarget,
        /// Run a single cycle and exit.
        #[arg(long)]
        once: bool,
        /// Seconds between background cycles.
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Inspect or edit the local offline queue.
    Queue {
        #[command(flatten)]
        target: QueueTarget,
        #[command(subcommand)]
        action: QueueAction,
    },
}

#[derive(Args)]
struct QueueTarget {
    /// Offline queue database file.
    #[arg(long)]
    queue: Option<PathBuf>,
    /// Base URL of the POS server.
    #[arg(long)]
    server_url: Option<String>,
}

#[derive(Subcommand)]
enum QueueAction {
    /// Save an invoice locally (JSON from FILE, or stdin when omitted).
    Save {
        file: Option<PathBuf>,
        #[arg(long)]
        ticket: Option<i64>,
    },
    /// Apply a partial edit (JSON) to a queued invoice.
    Update { id: String, file: Option<PathBuf> },
    /// List invoices waiting to sync.
    Pending,
    /// List dead-lettered invoices.
    Failed,
    /// Search local invoices.
    Search {
        #[arg(short, long)]
        query: Option<String>,
        #[arg(long)]
        page: Option<usize>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Re-queue every dead-lettered invoice.
    Retry,
    /// Queue depth and connectivity.
    Status,
    /// Delete one invoice from the queue.
    Remove { id: String },
    /// Delete every invoice that has not synced yet.
    Clear,
}

fn read_json<T: DeserializeOwned>(file: Option<&PathBuf>) -> Result<T> {
    let raw = match file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("reading stdin")?;
            buf
        }
    };
    serde_json::from_str(&raw).context("parsing invoice JSON")
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn build_engine(config: &Config, target: &QueueTarget) -> Result<Arc<SyncEngine>> {
    let queue_path = target.queue.clone().unwrap_or_else(|| config.queue_path.clone());
    let server_url = target
        .server_url
        .clone()
        .unwrap_or_else(|| config.server_url.clone());
    if let Some(parent) = queue_path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let queue = OfflineQueue::open(&queue_path, config.sync_max_retries)
        .with_context(|| format!("opening queue {}", queue_path.display()))?;
    let client = ServerClient::new(&server_url)?;
    Ok(Arc::new(SyncEngine::new(queue, client)))
}

fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for shutdown signal: {e}");
            return;
        }
        info!("Shutdown requested");
        token.cancel();
    });
    cancel
}

async fn run_queue(engine: &SyncEngine, action: QueueAction) -> Result<()> {
    let queue = engine.queue();
    match action {
        QueueAction::Save { file, ticket } => {
            let payload: InvoicePayload = read_json(file.as_ref())?;
            let invoice = engine.save_and_trigger(&payload, ticket)?;
            print_json(&json!({ "success": true, "invoice": invoice }))
        }
        QueueAction::Update { id, file } => {
            let changes: InvoiceChanges = read_json(file.as_ref())?;
            let invoice = queue.mark_update(&id, &changes)?;
            print_json(&json!({ "success": true, "invoice": invoice }))
        }
        QueueAction::Pending => print_json(&json!({ "invoices": queue.pending()? })),
        QueueAction::Failed => print_json(&json!({ "invoices": queue.failed()? })),
        QueueAction::Search { query, page, limit } => {
            let params = LocalSearch {
                query,
                page,
                limit,
                ..Default::default()
            };
            print_json(&queue.search_local(&params)?)
        }
        QueueAction::Retry => print_json(&json!({ "requeued": queue.retry_failed()? })),
        QueueAction::Status => {
            engine.probe().await;
            print_json(&engine.status()?)
        }
        QueueAction::Remove { id } => print_json(&json!({ "removed": queue.remove(&id)? })),
        QueueAction::Clear => print_json(&json!({ "cleared": queue.clear_pending()? })),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let mut config = Config::from_env()?;
    if cli.log_dir.is_some() {
        config.log_dir = cli.log_dir.clone();
    }
    let _log_guard = lavaseco_pos::init_logging(config.log_dir.as_deref());

    match cli.command {
        Command::Serve { bind, db } => {
            if let Some(bind) = bind {
                config.bind = bind;
            }
            if let Some(db) = db {
                config.db_path = db;
            }
            if let Some(parent) = config.db_path.parent() {
                std::fs::create_dir_all(parent).ok();
            }
            let bind = config.bind;
            let state = AppState::open(config).context("opening database")?;
            let listener = tokio::net::TcpListener::bind(bind)
                .await
                .with_context(|| format!("binding {bind}"))?;
            server::serve(state, listener, shutdown_token()).await?;
        }
        Command::Sync {
            target,
            once,
            interval,
        } => {
            let engine = build_engine(&config, &target)?;
            if once {
                let report = engine.run_once().await?;
                print_json(&serde_json::to_value(report)?)?;
            } else {
                let interval = interval
                    .map(|s| Duration::from_secs(s.max(1)))
                    .unwrap_or(config.sync_interval);
                let handle = engine.clone().spawn_loop(interval, shutdown_token());
                handle.await.context("sync loop panicked")?;
            }
        }
        Command::Queue { target, action } => {
            let engine = build_engine(&config, &target)?;
            run_queue(&engine, action).await?;
        }
    }
    Ok(())
}
