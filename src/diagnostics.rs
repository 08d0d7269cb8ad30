//! Diagnostics: health report for `/api/health` and log-file housekeeping
//! used by `init_logging`.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use tracing::warn;

use crate::db::{self, DbState};
use crate::error::PosResult;

/// Maximum number of log files to retain.
pub const MAX_LOG_FILES: usize = 14;

/// Rolling file prefix; tracing-appender appends `.YYYY-MM-DD`.
pub const LOG_FILE_PREFIX: &str = "lavaseco";

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

/// DB ping plus a few counters.
pub fn health_report(db: &DbState) -> PosResult<Value> {
    let conn = db.lock()?;
    db::ping(&conn)?;
    let schema_version = db::schema_version(&conn)?;
    let orders: i64 = conn.query_row("SELECT COUNT(*) FROM orders", [], |row| row.get(0))?;
    let open_shifts: i64 = conn.query_row(
        "SELECT COUNT(*) FROM cash_shifts WHERE status = 'OPEN'",
        [],
        |row| row.get(0),
    )?;

    Ok(json!({
        "status": "ok",
        "database": "connected",
        "version": env!("CARGO_PKG_VERSION"),
        "schemaVersion": schema_version,
        "orders": orders,
        "openShifts": open_shifts,
        "timestamp": db::now_iso(),
    }))
}

// ---------------------------------------------------------------------------
// Log rotation helpers
// ---------------------------------------------------------------------------

/// `$LAVASECO_LOG_DIR`, else `$XDG_DATA_HOME/lavaseco/logs`, else
/// `~/.local/share/lavaseco/logs`.
pub fn get_log_dir(override_dir: Option<&Path>) -> PathBuf {
    if let Some(dir) = override_dir {
        return dir.to_path_buf();
    }
    let base = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                .join(".local")
                .join("share")
        });
    base.join("lavaseco").join("logs")
}

/// Remove log files beyond the newest `keep`.
pub fn prune_old_logs(log_dir: &Path, keep: usize) -> usize {
    if !log_dir.exists() {
        return 0;
    }

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    if let Ok(entries) = fs::read_dir(log_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let is_log = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|name| name.starts_with(LOG_FILE_PREFIX))
                .unwrap_or(false);
            if is_log {
                let modified = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(std::time::UNIX_EPOCH);
                log_files.push((path, modified));
            }
        }
    }

    // Newest first; ties broken by name so dated files order correctly.
    log_files.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));

    let mut removed = 0;
    for (path, _) in log_files.iter().skip(keep) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to prune log file {}: {e}", path.display()),
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Schema;

    #[test]
    fn test_health_report() {
        let db = db::open_in_memory(Schema::Server).unwrap();
        let report = health_report(&db).unwrap();
        assert_eq!(report["status"], "ok");
        assert_eq!(report["orders"], 0);
        assert_eq!(report["schemaVersion"], 3);
    }

    #[test]
    fn test_log_dir_override() {
        let dir = get_log_dir(Some(Path::new("/var/log/lavaseco")));
        assert_eq!(dir, PathBuf::from("/var/log/lavaseco"));
        assert!(get_log_dir(None).ends_with("lavaseco/logs"));
    }

    #[test]
    fn test_prune_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        for day in 1..=5 {
            fs::write(dir.path().join(format!("lavaseco.2025-01-0{day}")), b"x").unwrap();
        }
        fs::write(dir.path().join("unrelated.txt"), b"x").unwrap();

        let removed = prune_old_logs(dir.path(), 3);
        assert_eq!(removed, 2);
        assert!(dir.path().join("lavaseco.2025-01-05").exists());
        assert!(dir.path().join("unrelated.txt").exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 4);
    }

    #[test]
    fn test_prune_missing_dir() {
        assert_eq!(prune_old_logs(Path::new("/nonexistent/lavaseco/logs"), 3), 0);
    }
}
