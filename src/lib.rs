//! Lavaseco POS - dry-cleaning order tracking.
//!
//! The crate has two halves that share the domain model:
//! - the HTTP server (`server`) over the shared SQLite store, and
//! - the offline-first invoice queue (`offline`, `sync`) that a counter
//!   terminal uses to keep working while the server is unreachable.

use std::path::Path;

use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod admin;
pub mod api;
pub mod auth;
pub mod brain;
pub mod clients;
pub mod config;
pub mod db;
pub mod diagnostics;
pub mod email;
pub mod error;
pub mod logistics;
pub mod models;
pub mod offline;
pub mod orders;
pub mod payments;
pub mod sandbox;
pub mod search;
pub mod server;
pub mod shifts;
pub mod sync;

pub use error::{PosError, PosResult};

/// Initialize structured logging (console + daily rolling file).
///
/// The returned guard flushes the file writer on drop; keep it alive for
/// the lifetime of the process.
pub fn init_logging(log_dir: Option<&Path>) -> WorkerGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,lavaseco_pos=debug,lavaseco=debug"));

    let log_dir = diagnostics::get_log_dir(log_dir);
    std::fs::create_dir_all(&log_dir).ok();
    let pruned = diagnostics::prune_old_logs(&log_dir, diagnostics::MAX_LOG_FILES);

    let file_appender = tracing_appender::rolling::daily(&log_dir, diagnostics::LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init();

    info!(
        log_dir = %log_dir.display(),
        pruned = pruned,
        "Lavaseco POS v{}",
        env!("CARGO_PKG_VERSION")
    );
    guard
}
