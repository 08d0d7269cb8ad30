//! Environment-driven configuration.
//!
//! `.env` is loaded by the binary before [`Config::from_env`] runs; CLI flags
//! then override individual fields.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;
use zeroize::Zeroizing;

use crate::error::{PosError, PosResult};

pub const DEFAULT_DB_PATH: &str = "./data/lavaseco.db";
pub const DEFAULT_QUEUE_PATH: &str = "./data/offline-queue.db";
pub const DEFAULT_BIND: &str = "127.0.0.1:3000";
pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:3000";
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_SYNC_MAX_RETRIES: i64 = 8;
pub const DEFAULT_EMAIL_FROM: &str = "Lavaseco Orquídeas <onboarding@resend.dev>";

#[derive(Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub bind: SocketAddr,
    pub queue_path: PathBuf,
    pub server_url: String,
    pub sync_interval: Duration,
    pub sync_max_retries: i64,
    pub log_dir: Option<PathBuf>,
    pub resend_api_key: Option<Zeroizing<String>>,
    pub email_from: String,
    pub sandbox_api_key: Option<Zeroizing<String>>,
    pub sandbox_api_url: Option<String>,
    pub openai_api_key: Option<Zeroizing<String>>,
    pub super_admins: Vec<String>,
    /// Echo verification codes in auth responses when email delivery is
    /// unavailable. Development only.
    pub debug_codes: bool,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("db_path", &self.db_path)
            .field("bind", &self.bind)
            .field("queue_path", &self.queue_path)
            .field("server_url", &self.server_url)
            .field("sync_interval", &self.sync_interval)
            .field("sync_max_retries", &self.sync_max_retries)
            .field("log_dir", &self.log_dir)
            .field("resend_api_key", &self.resend_api_key.as_ref().map(|_| "***"))
            .field("email_from", &self.email_from)
            .field("sandbox_api_url", &self.sandbox_api_url)
            .field("super_admins", &self.super_admins)
            .finish_non_exhaustive()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            bind: SocketAddr::from(([127, 0, 0, 1], 3000)),
            queue_path: PathBuf::from(DEFAULT_QUEUE_PATH),
            server_url: DEFAULT_SERVER_URL.to_string(),
            sync_interval: Duration::from_secs(DEFAULT_SYNC_INTERVAL_SECS),
            sync_max_retries: DEFAULT_SYNC_MAX_RETRIES,
            log_dir: None,
            resend_api_key: None,
            email_from: DEFAULT_EMAIL_FROM.to_string(),
            sandbox_api_key: None,
            sandbox_api_url: None,
            openai_api_key: None,
            super_admins: Vec::new(),
            debug_codes: false,
        }
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn secret(key: &str) -> Option<Zeroizing<String>> {
    env_nonempty(key).map(Zeroizing::new)
}

/// `DATABASE_URL` is accepted as `sqlite://path` or `file:path`.
fn db_path_from_url(url: &str) -> Option<PathBuf> {
    let path = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .or_else(|| url.strip_prefix("file:"))?;
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() {
        None
    } else {
        Some(PathBuf::from(path))
    }
}

/// Comma-separated list, trimmed and lower-cased.
pub fn parse_email_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Config {
    pub fn from_env() -> PosResult<Self> {
        let mut cfg = Config::default();

        if let Some(path) = env_nonempty("LAVASECO_DB_PATH") {
            cfg.db_path = PathBuf::from(path);
        } else if let Some(url) = env_nonempty("DATABASE_URL") {
            match db_path_from_url(&url) {
                Some(path) => cfg.db_path = path,
                None => warn!("DATABASE_URL is not a sqlite URL; using {DEFAULT_DB_PATH}"),
            }
        }

        if let Some(bind) = env_nonempty("LAVASECO_BIND") {
            cfg.bind = bind
                .parse()
                .map_err(|e| PosError::Validation(format!("LAVASECO_BIND '{bind}': {e}")))?;
        }

        if let Some(path) = env_nonempty("LAVASECO_QUEUE_PATH") {
            cfg.queue_path = PathBuf::from(path);
        }
        if let Some(url) = env_nonempty("LAVASECO_SERVER_URL") {
            cfg.server_url = url;
        }

        if let Some(raw) = env_nonempty("LAVASECO_SYNC_INTERVAL_SECS") {
            let secs: u64 = raw.parse().map_err(|_| {
                PosError::Validation(format!("LAVASECO_SYNC_INTERVAL_SECS '{raw}' is not a number"))
            })?;
            cfg.sync_interval = Duration::from_secs(secs.max(1));
        }

        if let Some(raw) = env_nonempty("LAVASECO_SYNC_MAX_RETRIES") {
            let n: i64 = raw.parse().map_err(|_| {
                PosError::Validation(format!("LAVASECO_SYNC_MAX_RETRIES '{raw}' is not a number"))
            })?;
            cfg.sync_max_retries = n.max(1);
        }

        cfg.log_dir = env_nonempty("LAVASECO_LOG_DIR").map(PathBuf::from);
        cfg.resend_api_key = secret("RESEND_API_KEY");
        if let Some(from) = env_nonempty("EMAIL_FROM") {
            cfg.email_from = from;
        }
        cfg.sandbox_api_key = secret("E2B_API_KEY");
        cfg.sandbox_api_url = env_nonempty("SANDBOX_API_URL");
        cfg.openai_api_key = secret("OPENAI_API_KEY");
        cfg.super_admins = env_nonempty("LAVASECO_SUPER_ADMINS")
            .map(|raw| parse_email_list(&raw))
            .unwrap_or_default();
        cfg.debug_codes = env_nonempty("LAVASECO_DEBUG_CODES")
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        Ok(cfg)
    }

    pub fn is_super_admin(&self, email: &str) -> bool {
        let email = email.trim().to_lowercase();
        self.super_admins.iter().any(|e| *e == email)
    }
}
