//! SQLite database layer for the Lavaseco POS.
//!
//! Two databases share this module: the server database (clients, orders,
//! payments, shifts, auth, brain graph) and the client-side offline queue.
//! Both use rusqlite with WAL mode, a `schema_version` table, and a linear
//! migration ladder.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{error, info};

use crate::error::{PosError, PosResult};

/// Shared handle to one SQLite connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

impl DbState {
    pub fn lock(&self) -> PosResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(PosError::internal)
    }
}

/// Which migration ladder a database file follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schema {
    Server,
    Queue,
}

/// Current server schema version. Bump when adding new migrations.
const SERVER_SCHEMA_VERSION: i32 = 3;
const QUEUE_SCHEMA_VERSION: i32 = 1;

impl Schema {
    fn target_version(self) -> i32 {
        match self {
            Schema::Server => SERVER_SCHEMA_VERSION,
            Schema::Queue => QUEUE_SCHEMA_VERSION,
        }
    }
}

/// Open (or create) the database at `db_path` and migrate it.
pub fn init(db_path: &Path, schema: Schema) -> PosResult<DbState> {
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|e| PosError::Internal(format!("Failed to create data dir: {e}")))?;
    }

    info!("Opening {:?} database at {}", schema, db_path.display());
    let conn = open_and_configure(db_path)?;
    run_migrations(&conn, schema)?;

    info!(
        "Database initialized ({:?} schema v{})",
        schema,
        schema.target_version()
    );

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: db_path.to_path_buf(),
    })
}

/// In-memory database with the full schema applied.
pub fn open_in_memory(schema: Schema) -> PosResult<DbState> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )?;
    run_migrations(&conn, schema)?;
    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    })
}

fn open_and_configure(path: &Path) -> PosResult<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(conn)
}

fn run_migrations(conn: &Connection, schema: Schema) -> PosResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    let target = schema.target_version();
    if current >= target {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating {:?} database from v{current} to v{target}", schema);

    match schema {
        Schema::Server => {
            if current < 1 {
                migrate_server_v1(conn)?;
            }
            if current < 2 {
                migrate_server_v2(conn)?;
            }
            if current < 3 {
                migrate_server_v3(conn)?;
            }
        }
        Schema::Queue => {
            if current < 1 {
                migrate_queue_v1(conn)?;
            }
        }
    }

    Ok(())
}

/// Server v1: users, clients, orders, items, payment ledger, sequences.
fn migrate_server_v1(conn: &Connection) -> PosResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            email TEXT UNIQUE NOT NULL,
            password_hash TEXT NOT NULL,
            role TEXT NOT NULL DEFAULT 'STAFF' CHECK(role IN ('ADMIN','STAFF')),
            is_verified INTEGER NOT NULL DEFAULT 0,
            verification_code TEXT,
            last_verif_sent_at TEXT,
            verif_attempts INTEGER NOT NULL DEFAULT 0,
            lockout_until TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS allowed_admins (
            id TEXT PRIMARY KEY,
            email TEXT UNIQUE NOT NULL,
            added_by TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS clients (
            id TEXT PRIMARY KEY,
            cedula TEXT UNIQUE NOT NULL,
            name TEXT NOT NULL,
            phone TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS orders (
            id TEXT PRIMARY KEY,
            ticket_number INTEGER UNIQUE NOT NULL,
            client_id TEXT NOT NULL REFERENCES clients(id),
            client_request_id TEXT UNIQUE,
            status TEXT NOT NULL DEFAULT 'PENDIENTE',
            location TEXT NOT NULL DEFAULT 'RECEPCION',
            total_value REAL NOT NULL DEFAULT 0,
            paid_amount REAL NOT NULL DEFAULT 0,
            payment_status TEXT NOT NULL DEFAULT 'PENDIENTE'
                CHECK(payment_status IN ('PENDIENTE','ABONO','CANCELADO')),
            scheduled_date TEXT,
            delivered_date TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS order_items (
            id TEXT PRIMARY KEY,
            order_id TEXT NOT NULL REFERENCES orders(id) ON DELETE CASCADE,
            type TEXT NOT NULL,
            quantity INTEGER NOT NULL DEFAULT 1,
            price REAL NOT NULL DEFAULT 0,
            notes TEXT
        );

        CREATE TABLE IF NOT EXISTS payment_logs (
            id TEXT PRIMARY KEY,
            order_id TEXT NOT NULL REFERENCES orders(id) ON DELETE CASCADE,
            amount REAL NOT NULL,
            type TEXT NOT NULL CHECK(type IN ('ABONO_INICIAL','ABONO','CANCELACION')),
            note TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sequences (
            name TEXT PRIMARY KEY,
            value INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status);
        CREATE INDEX IF NOT EXISTS idx_orders_created_at ON orders(created_at);
        CREATE INDEX IF NOT EXISTS idx_orders_client ON orders(client_id);
        CREATE INDEX IF NOT EXISTS idx_order_items_order ON order_items(order_id);
        CREATE INDEX IF NOT EXISTS idx_payment_logs_order ON payment_logs(order_id);
        CREATE INDEX IF NOT EXISTS idx_payment_logs_created ON payment_logs(created_at);

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        e
    })?;

    info!("Applied migration v1");
    Ok(())
}

/// Server v2: cash shifts and expenses.
fn migrate_server_v2(conn: &Connection) -> PosResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS cash_shifts (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT,
            status TEXT NOT NULL DEFAULT 'OPEN' CHECK(status IN ('OPEN','CLOSED')),
            base_amount REAL NOT NULL DEFAULT 0,
            cash_count REAL NOT NULL DEFAULT 0,
            digital_count REAL NOT NULL DEFAULT 0,
            expense_count REAL NOT NULL DEFAULT 0,
            total_calculated REAL NOT NULL DEFAULT 0,
            declared_cash REAL,
            closed_by TEXT
        );

        CREATE TABLE IF NOT EXISTS expenses (
            id TEXT PRIMARY KEY,
            description TEXT NOT NULL,
            amount REAL NOT NULL,
            category TEXT NOT NULL DEFAULT 'GENERAL',
            date TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_cash_shifts_user_status ON cash_shifts(user_id, status);
        CREATE INDEX IF NOT EXISTS idx_expenses_date ON expenses(date);

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        e
    })?;

    info!("Applied migration v2 (cash shifts + expenses)");
    Ok(())
}

/// Server v3: garment counts and the assistant memory graph.
fn migrate_server_v3(conn: &Connection) -> PosResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS daily_garment_counts (
            id TEXT PRIMARY KEY,
            date TEXT UNIQUE NOT NULL,
            plant_count INTEGER NOT NULL DEFAULT 0,
            home_count INTEGER NOT NULL DEFAULT 0,
            plant_notes TEXT,
            home_notes TEXT,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS brain_nodes (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            type TEXT NOT NULL,
            properties TEXT NOT NULL DEFAULT '{}',
            origin TEXT NOT NULL DEFAULT 'system',
            version INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS brain_relations (
            id TEXT PRIMARY KEY,
            source TEXT NOT NULL REFERENCES brain_nodes(id) ON DELETE CASCADE,
            target TEXT NOT NULL REFERENCES brain_nodes(id) ON DELETE CASCADE,
            type TEXT NOT NULL,
            weight REAL NOT NULL DEFAULT 1.0,
            bidirectional INTEGER NOT NULL DEFAULT 0,
            context TEXT,
            origin TEXT NOT NULL DEFAULT 'system',
            version INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_brain_relations_source ON brain_relations(source);
        CREATE INDEX IF NOT EXISTS idx_brain_relations_target ON brain_relations(target);

        INSERT INTO schema_version (version) VALUES (3);
        ",
    )
    .map_err(|e| {
        error!("Migration v3 failed: {e}");
        e
    })?;

    info!("Applied migration v3 (daily counts + brain graph)");
    Ok(())
}

/// Queue v1: the offline invoice store with retry scheduling columns.
fn migrate_queue_v1(conn: &Connection) -> PosResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS offline_invoices (
            id TEXT PRIMARY KEY,
            ticket_number INTEGER,
            server_id TEXT,
            client_id TEXT,
            client_cedula TEXT NOT NULL DEFAULT '',
            client_name TEXT NOT NULL DEFAULT '',
            client_phone TEXT NOT NULL DEFAULT '',
            items TEXT NOT NULL DEFAULT '[]',
            total_value REAL NOT NULL DEFAULT 0,
            payment_amount REAL NOT NULL DEFAULT 0,
            payment_status TEXT NOT NULL DEFAULT 'PENDIENTE',
            payment_method TEXT,
            created_date TEXT,
            delivery_date TEXT,
            order_status TEXT,
            status TEXT NOT NULL
                CHECK(status IN ('PENDING_SYNC','PENDING_UPDATE','SYNCED','ERROR')),
            created_at INTEGER NOT NULL,
            updated_at TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 8,
            next_retry_at TEXT,
            retry_delay_ms INTEGER NOT NULL DEFAULT 5000,
            last_error TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_offline_invoices_status_next_retry
            ON offline_invoices(status, next_retry_at);
        CREATE INDEX IF NOT EXISTS idx_offline_invoices_created_at
            ON offline_invoices(created_at);

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Queue migration v1 failed: {e}");
        e
    })?;

    info!("Applied queue migration v1");
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Run `f` inside `BEGIN IMMEDIATE`, committing on success and rolling back
/// on any error.
pub fn with_transaction<T, F>(conn: &Connection, f: F) -> PosResult<T>
where
    F: FnOnce(&Connection) -> PosResult<T>,
{
    conn.execute_batch("BEGIN IMMEDIATE")?;
    match f(conn) {
        Ok(value) => {
            conn.execute_batch("COMMIT")?;
            Ok(value)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

/// Timestamps are stored as RFC 3339 UTC with millisecond precision so they
/// compare correctly as strings.
pub fn to_iso(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn now_iso() -> String {
    to_iso(Utc::now())
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Current value of a named counter (0 when never used).
pub fn current_sequence(conn: &Connection, name: &str) -> PosResult<i64> {
    let value: Option<i64> = conn
        .query_row(
            "SELECT value FROM sequences WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value.unwrap_or(0))
}

/// Increment and return a named counter.
pub fn next_sequence(conn: &Connection, name: &str) -> PosResult<i64> {
    conn.execute(
        "INSERT INTO sequences (name, value) VALUES (?1, 1)
         ON CONFLICT(name) DO UPDATE SET value = value + 1",
        params![name],
    )?;
    current_sequence(conn, name)
}

/// Overwrite a named counter so the next `next_sequence` call yields `value + 1`.
pub fn set_sequence(conn: &Connection, name: &str, value: i64) -> PosResult<()> {
    conn.execute(
        "INSERT INTO sequences (name, value) VALUES (?1, ?2)
         ON CONFLICT(name) DO UPDATE SET value = excluded.value",
        params![name, value],
    )?;
    Ok(())
}

pub fn ping(conn: &Connection) -> PosResult<()> {
    conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
    Ok(())
}

pub fn schema_version(conn: &Connection) -> PosResult<i32> {
    Ok(conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?)
}

// ===========================================================================
// Tests
// ===========================================================================
