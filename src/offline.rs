//! Client-side offline invoice queue.
//!
//! Invoices are written here first and never wait on the network. The sync
//! engine drains `PENDING_SYNC` / `PENDING_UPDATE` records to the server;
//! failures back off exponentially and land in `ERROR` once `max_retries`
//! is reached. Server orders are replicated back in as `SYNCED` records so
//! search works while offline.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::db::{self, DbState, Schema};
use crate::error::{PosError, PosResult};
use crate::models::{
    self, ClientInput, InvoicePayload, ItemInput, PaymentInput, PAYMENT_PENDING,
};
use crate::orders;
use crate::search::{self, QueryKind, SearchFilters};

pub const DEFAULT_RETRY_DELAY_MS: i64 = 5_000;
pub const MAX_RETRY_DELAY_MS: i64 = 300_000;
const DEFAULT_SEARCH_LIMIT: usize = 50;
const MAX_SEARCH_LIMIT: usize = 500;

// ---------------------------------------------------------------------------
// Record types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    PendingSync,
    PendingUpdate,
    Synced,
    Error,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::PendingSync => "PENDING_SYNC",
            SyncStatus::PendingUpdate => "PENDING_UPDATE",
            SyncStatus::Synced => "SYNCED",
            SyncStatus::Error => "ERROR",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "PENDING_SYNC" => Some(SyncStatus::PendingSync),
            "PENDING_UPDATE" => Some(SyncStatus::PendingUpdate),
            "SYNCED" => Some(SyncStatus::Synced),
            "ERROR" => Some(SyncStatus::Error),
            _ => None,
        }
    }

    pub fn is_pending(self) -> bool {
        matches!(self, SyncStatus::PendingSync | SyncStatus::PendingUpdate)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentSnapshot {
    pub amount: f64,
    pub status: String,
    pub method: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvoiceDates {
    pub created: Option<String>,
    pub delivery: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineInvoice {
    pub id: String,
    pub ticket_number: Option<i64>,
    pub server_id: Option<String>,
    pub client: ClientInput,
    pub items: Vec<ItemInput>,
    pub total_value: f64,
    pub payment: PaymentSnapshot,
    pub dates: InvoiceDates,
    pub order_status: Option<String>,
    pub status: SyncStatus,
    /// Epoch milliseconds.
    pub created_at: i64,
    pub updated_at: Option<String>,
    pub retry_count: i64,
    pub max_retries: i64,
    pub next_retry_at: Option<String>,
    pub retry_delay_ms: i64,
    pub last_error: Option<String>,
}

impl OfflineInvoice {
    /// Body sent to the server. The local id doubles as the idempotency key.
    pub fn to_payload(&self) -> InvoicePayload {
        InvoicePayload {
            client_request_id: Some(self.id.clone()),
            client: self.client.clone(),
            items: self.items.clone(),
            payment: PaymentInput {
                amount: self.payment.amount,
                status: Some(self.payment.status.clone()),
                method: self.payment.method.clone(),
                total: None,
            },
            total_value: Some(self.total_value),
            delivery_date: self.dates.delivery.clone(),
            order_status: self.order_status.clone(),
            created_at: DateTime::from_timestamp_millis(self.created_at)
                .map(db::to_iso)
                .or_else(|| self.dates.created.clone()),
        }
    }
}

/// Partial edit applied by `mark_update`. Absent fields keep their value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceChanges {
    #[serde(default)]
    pub client: Option<ClientInput>,
    #[serde(default)]
    pub items: Option<Vec<ItemInput>>,
    #[serde(default)]
    pub payment: Option<PaymentInput>,
    #[serde(default)]
    pub total_value: Option<f64>,
    #[serde(default, alias = "scheduledDate")]
    pub delivery_date: Option<String>,
    #[serde(default)]
    pub order_status: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalSearch {
    #[serde(default, alias = "q")]
    pub query: Option<String>,
    #[serde(default)]
    pub page: Option<usize>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default, flatten)]
    pub filters: SearchFilters,
}

const COLUMNS: &str = "id, ticket_number, server_id, client_id, client_cedula, client_name,
    client_phone, items, total_value, payment_amount, payment_status, payment_method,
    created_date, delivery_date, order_status, status, created_at, updated_at,
    retry_count, max_retries, next_retry_at, retry_delay_ms, last_error";

fn invoice_from_row(row: &Row<'_>) -> rusqlite::Result<OfflineInvoice> {
    let items_raw: String = row.get(7)?;
    let items: Vec<ItemInput> = serde_json::from_str(&items_raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let status_raw: String = row.get(15)?;
    let status = SyncStatus::parse(&status_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            15,
            rusqlite::types::Type::Text,
            format!("unknown sync status {status_raw}").into(),
        )
    })?;
    Ok(OfflineInvoice {
        id: row.get(0)?,
        ticket_number: row.get(1)?,
        server_id: row.get(2)?,
        client: ClientInput {
            id: row.get(3)?,
            cedula: row.get(4)?,
            name: row.get(5)?,
            phone: row.get(6)?,
        },
        items,
        total_value: row.get(8)?,
        payment: PaymentSnapshot {
            amount: row.get(9)?,
            status: row.get(10)?,
            method: row.get(11)?,
        },
        dates: InvoiceDates {
            created: row.get(12)?,
            delivery: row.get(13)?,
        },
        order_status: row.get(14)?,
        status,
        created_at: row.get(16)?,
        updated_at: row.get(17)?,
        retry_count: row.get(18)?,
        max_retries: row.get(19)?,
        next_retry_at: row.get(20)?,
        retry_delay_ms: row.get(21)?,
        last_error: row.get(22)?,
    })
}

fn query_invoices(
    conn: &Connection,
    where_sql: &str,
    args: impl rusqlite::Params,
) -> PosResult<Vec<OfflineInvoice>> {
    let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM offline_invoices {where_sql}"))?;
    let rows = stmt.query_map(args, invoice_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn load(conn: &Connection, id: &str) -> PosResult<Option<OfflineInvoice>> {
    Ok(conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM offline_invoices WHERE id = ?1"),
            params![id],
            invoice_from_row,
        )
        .optional()?)
}

fn write(conn: &Connection, inv: &OfflineInvoice) -> PosResult<()> {
    conn.execute(
        "INSERT INTO offline_invoices (
            id, ticket_number, server_id, client_id, client_cedula, client_name,
            client_phone, items, total_value, payment_amount, payment_status, payment_method,
            created_date, delivery_date, order_status, status, created_at, updated_at,
            retry_count, max_retries, next_retry_at, retry_delay_ms, last_error
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                   ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23)
         ON CONFLICT(id) DO UPDATE SET
            ticket_number = excluded.ticket_number,
            server_id = excluded.server_id,
            client_id = excluded.client_id,
            client_cedula = excluded.client_cedula,
            client_name = excluded.client_name,
            client_phone = excluded.client_phone,
            items = excluded.items,
            total_value = excluded.total_value,
            payment_amount = excluded.payment_amount,
            payment_status = excluded.payment_status,
            payment_method = excluded.payment_method,
            created_date = excluded.created_date,
            delivery_date = excluded.delivery_date,
            order_status = excluded.order_status,
            status = excluded.status,
            created_at = excluded.created_at,
            updated_at = excluded.updated_at,
            retry_count = excluded.retry_count,
            max_retries = excluded.max_retries,
            next_retry_at = excluded.next_retry_at,
            retry_delay_ms = excluded.retry_delay_ms,
            last_error = excluded.last_error",
        params![
            inv.id,
            inv.ticket_number,
            inv.server_id,
            inv.client.id,
            inv.client.cedula,
            inv.client.name,
            inv.client.phone,
            serde_json::to_string(&inv.items)?,
            inv.total_value,
            inv.payment.amount,
            inv.payment.status,
            inv.payment.method,
            inv.dates.created,
            inv.dates.delivery,
            inv.order_status,
            inv.status.as_str(),
            inv.created_at,
            inv.updated_at,
            inv.retry_count,
            inv.max_retries,
            inv.next_retry_at,
            inv.retry_delay_ms,
            inv.last_error,
        ],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

fn deterministic_jitter_ms(seed: i64) -> i64 {
    let positive = seed.checked_abs().unwrap_or(0);
    (positive % 700) + 50
}

fn jitter_seed(id: &str) -> i64 {
    id.bytes()
        .fold(0i64, |acc, b| acc.wrapping_mul(31).wrapping_add(i64::from(b)))
}

fn schedule_next_retry(now: DateTime<Utc>, delay_ms: i64, seed: i64) -> String {
    let bounded = delay_ms.clamp(1_000, MAX_RETRY_DELAY_MS);
    let jitter = deterministic_jitter_ms(seed);
    db::to_iso(now + ChronoDuration::milliseconds(bounded + jitter))
}

fn reset_retries(inv: &mut OfflineInvoice) {
    inv.retry_count = 0;
    inv.next_retry_at = None;
    inv.retry_delay_ms = DEFAULT_RETRY_DELAY_MS;
    inv.last_error = None;
}

fn iso_to_millis(ts: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|t| t.timestamp_millis())
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Handle over the local queue database.
#[derive(Clone)]
pub struct OfflineQueue {
    db: Arc<DbState>,
    max_retries: i64,
}

impl OfflineQueue {
    pub fn new(db: Arc<DbState>, max_retries: i64) -> Self {
        Self {
            db,
            max_retries: max_retries.max(1),
        }
    }

    pub fn open(path: &Path, max_retries: i64) -> PosResult<Self> {
        Ok(Self::new(Arc::new(db::init(path, Schema::Queue)?), max_retries))
    }

    pub fn in_memory(max_retries: i64) -> PosResult<Self> {
        Ok(Self::new(
            Arc::new(db::open_in_memory(Schema::Queue)?),
            max_retries,
        ))
    }

    pub fn db(&self) -> &Arc<DbState> {
        &self.db
    }

    /// Store a new invoice as `PENDING_SYNC`. `ticket_number` is the
    /// provisional folio shown to the customer until the server assigns one.
    pub fn save_locally(
        &self,
        payload: &InvoicePayload,
        ticket_number: Option<i64>,
    ) -> PosResult<OfflineInvoice> {
        if payload.client.cedula.trim().is_empty() {
            return Err(PosError::Validation("La cédula del cliente es obligatoria".into()));
        }
        if payload.client.name.trim().is_empty() {
            return Err(PosError::Validation("El nombre del cliente es obligatorio".into()));
        }
        orders::validate_items(&payload.items)?;
        orders::validate_amount(payload.payment.amount, "Abono")?;

        let now = Utc::now();
        let total = payload.resolved_total();
        let amount = payload.payment.amount;
        let invoice = OfflineInvoice {
            id: db::new_id(),
            ticket_number,
            server_id: None,
            client: payload.client.clone(),
            items: payload.items.clone(),
            total_value: total,
            payment: PaymentSnapshot {
                amount,
                status: models::payment_status_for(amount, total).to_string(),
                method: Some(payload.payment_method().to_string()),
            },
            dates: InvoiceDates {
                created: Some(db::to_iso(now)),
                delivery: payload.delivery_date.clone(),
            },
            order_status: payload.order_status.clone(),
            status: SyncStatus::PendingSync,
            created_at: now.timestamp_millis(),
            updated_at: Some(db::to_iso(now)),
            retry_count: 0,
            max_retries: self.max_retries,
            next_retry_at: None,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            last_error: None,
        };

        let conn = self.db.lock()?;
        write(&conn, &invoice)?;
        info!(invoice_id = %invoice.id, total = total, "Invoice saved locally");
        Ok(invoice)
    }

    pub fn get(&self, id: &str) -> PosResult<OfflineInvoice> {
        let conn = self.db.lock()?;
        load(&conn, id)?.ok_or_else(|| PosError::NotFound(format!("Factura local {id} no existe")))
    }

    /// Merge `changes` into a record. Records that already reached the
    /// server become `PENDING_UPDATE`; the rest stay `PENDING_SYNC`.
    pub fn mark_update(&self, id: &str, changes: &InvoiceChanges) -> PosResult<OfflineInvoice> {
        if let Some(items) = &changes.items {
            orders::validate_items(items)?;
        }
        if let Some(payment) = &changes.payment {
            orders::validate_amount(payment.amount, "Abono")?;
        }
        if let Some(total) = changes.total_value {
            orders::validate_amount(total, "Total")?;
        }
        let conn = self.db.lock()?;
        let mut inv = load(&conn, id)?
            .ok_or_else(|| PosError::NotFound(format!("Factura local {id} no existe")))?;

        if let Some(client) = &changes.client {
            if !client.cedula.trim().is_empty() {
                inv.client.cedula = client.cedula.clone();
            }
            if !client.name.trim().is_empty() {
                inv.client.name = client.name.clone();
            }
            if !client.phone.trim().is_empty() {
                inv.client.phone = client.phone.clone();
            }
        }
        if let Some(items) = &changes.items {
            inv.items = items.clone();
            if changes.total_value.is_none() {
                inv.total_value = items.iter().map(ItemInput::line_total).sum();
            }
        }
        if let Some(total) = changes.total_value {
            inv.total_value = total;
        }
        if let Some(payment) = &changes.payment {
            inv.payment.amount = payment.amount;
            if let Some(method) = payment.method.as_deref().filter(|m| !m.trim().is_empty()) {
                inv.payment.method = Some(method.to_string());
            }
        }
        inv.payment.status = models::payment_status_for(inv.payment.amount, inv.total_value).into();
        if let Some(date) = &changes.delivery_date {
            inv.dates.delivery = Some(date.clone());
        }
        if let Some(status) = &changes.order_status {
            inv.order_status = Some(status.clone());
        }

        let previous = inv.status;
        inv.status = if inv.server_id.is_some() {
            SyncStatus::PendingUpdate
        } else {
            SyncStatus::PendingSync
        };
        reset_retries(&mut inv);
        inv.updated_at = Some(db::now_iso());
        write(&conn, &inv)?;

        info!(
            invoice_id = %id,
            from = previous.as_str(),
            to = inv.status.as_str(),
            "Local invoice updated"
        );
        Ok(inv)
    }

    /// All records awaiting sync, oldest first.
    pub fn pending(&self) -> PosResult<Vec<OfflineInvoice>> {
        let conn = self.db.lock()?;
        query_invoices(
            &conn,
            "WHERE status IN ('PENDING_SYNC', 'PENDING_UPDATE') ORDER BY created_at, id",
            [],
        )
    }

    /// Pending records whose backoff has elapsed at `now`.
    pub fn due(&self, now: DateTime<Utc>) -> PosResult<Vec<OfflineInvoice>> {
        let conn = self.db.lock()?;
        query_invoices(
            &conn,
            "WHERE status IN ('PENDING_SYNC', 'PENDING_UPDATE')
               AND (next_retry_at IS NULL OR next_retry_at <= ?1)
             ORDER BY created_at, id",
            params![db::to_iso(now)],
        )
    }

    fn count_where(&self, where_sql: &str) -> PosResult<i64> {
        let conn = self.db.lock()?;
        Ok(conn.query_row(
            &format!("SELECT COUNT(*) FROM offline_invoices WHERE {where_sql}"),
            [],
            |r| r.get(0),
        )?)
    }

    pub fn pending_count(&self) -> PosResult<i64> {
        self.count_where("status IN ('PENDING_SYNC', 'PENDING_UPDATE')")
    }

    pub fn error_count(&self) -> PosResult<i64> {
        self.count_where("status = 'ERROR'")
    }

    pub fn failed(&self) -> PosResult<Vec<OfflineInvoice>> {
        let conn = self.db.lock()?;
        query_invoices(&conn, "WHERE status = 'ERROR' ORDER BY created_at, id", [])
    }

    /// The server accepted the record. Its ticket number replaces the local one.
    pub fn mark_synced(
        &self,
        id: &str,
        server_id: &str,
        ticket_number: Option<i64>,
    ) -> PosResult<()> {
        let conn = self.db.lock()?;
        let changed = conn.execute(
            "UPDATE offline_invoices
             SET status = 'SYNCED',
                 server_id = ?1,
                 ticket_number = COALESCE(?2, ticket_number),
                 retry_count = 0,
                 next_retry_at = NULL,
                 retry_delay_ms = ?3,
                 last_error = NULL,
                 updated_at = ?4
             WHERE id = ?5",
            params![server_id, ticket_number, DEFAULT_RETRY_DELAY_MS, db::now_iso(), id],
        )?;
        if changed == 0 {
            return Err(PosError::NotFound(format!("Factura local {id} no existe")));
        }
        debug!(invoice_id = %id, server_id = %server_id, ticket_number = ?ticket_number, "Invoice marked synced");
        Ok(())
    }

    /// Sync success for the snapshot `sent`. If the record was edited while
    /// the request was in flight it keeps the server identity but stays
    /// `PENDING_UPDATE`. Returns whether the record is now `SYNCED`.
    pub fn record_sync_success(
        &self,
        sent: &OfflineInvoice,
        server_id: &str,
        ticket_number: Option<i64>,
    ) -> PosResult<bool> {
        let conn = self.db.lock()?;
        let now = db::now_iso();
        let synced = conn.execute(
            "UPDATE offline_invoices
             SET status = 'SYNCED',
                 server_id = ?1,
                 ticket_number = COALESCE(?2, ticket_number),
                 retry_count = 0,
                 next_retry_at = NULL,
                 retry_delay_ms = ?3,
                 last_error = NULL,
                 updated_at = ?4
             WHERE id = ?5 AND updated_at IS ?6",
            params![
                server_id,
                ticket_number,
                DEFAULT_RETRY_DELAY_MS,
                now,
                sent.id,
                sent.updated_at
            ],
        )?;
        if synced > 0 {
            return Ok(true);
        }
        conn.execute(
            "UPDATE offline_invoices
             SET status = CASE WHEN status = 'PENDING_SYNC' THEN 'PENDING_UPDATE' ELSE status END,
                 server_id = ?1,
                 ticket_number = COALESCE(?2, ticket_number)
             WHERE id = ?3",
            params![server_id, ticket_number, sent.id],
        )?;
        info!(invoice_id = %sent.id, "Invoice changed during sync; update queued");
        Ok(false)
    }

    /// Record a failed attempt and schedule the next one. Returns the new
    /// status, `ERROR` once retries are exhausted.
    pub fn mark_failed(&self, id: &str, error: &str) -> PosResult<SyncStatus> {
        self.mark_failed_at(id, error, Utc::now())
    }

    fn mark_failed_at(&self, id: &str, error: &str, now: DateTime<Utc>) -> PosResult<SyncStatus> {
        let conn = self.db.lock()?;
        let mut inv = load(&conn, id)?
            .ok_or_else(|| PosError::NotFound(format!("Factura local {id} no existe")))?;

        inv.retry_count += 1;
        let exhausted = inv.retry_count >= inv.max_retries;
        let delay = inv.retry_delay_ms.max(DEFAULT_RETRY_DELAY_MS);
        if exhausted {
            inv.status = SyncStatus::Error;
            inv.next_retry_at = None;
        } else {
            inv.next_retry_at = Some(schedule_next_retry(now, delay, jitter_seed(id)));
        }
        inv.retry_delay_ms = (delay * 2).min(MAX_RETRY_DELAY_MS);
        inv.last_error = Some(error.to_string());
        inv.updated_at = Some(db::to_iso(now));
        write(&conn, &inv)?;

        if exhausted {
            warn!(
                invoice_id = %id,
                retries = inv.retry_count,
                error = %error,
                "Invoice sync retries exhausted; moved to ERROR"
            );
        } else {
            debug!(
                invoice_id = %id,
                retry = inv.retry_count,
                next_retry_at = ?inv.next_retry_at,
                "Invoice sync failed; retry scheduled"
            );
        }
        Ok(inv.status)
    }

    /// Move a record straight to `ERROR`; used when the server rejects the
    /// payload itself.
    pub fn mark_dead(&self, id: &str, error: &str) -> PosResult<()> {
        let conn = self.db.lock()?;
        let changed = conn.execute(
            "UPDATE offline_invoices
             SET status = 'ERROR', next_retry_at = NULL, last_error = ?1, updated_at = ?2
             WHERE id = ?3",
            params![error, db::now_iso(), id],
        )?;
        if changed == 0 {
            return Err(PosError::NotFound(format!("Factura local {id} no existe")));
        }
        warn!(invoice_id = %id, error = %error, "Invoice rejected by server; moved to ERROR");
        Ok(())
    }

    /// Requeue every `ERROR` record with fresh retry counters.
    pub fn retry_failed(&self) -> PosResult<usize> {
        let conn = self.db.lock()?;
        let n = conn.execute(
            "UPDATE offline_invoices
             SET status = CASE WHEN server_id IS NULL THEN 'PENDING_SYNC' ELSE 'PENDING_UPDATE' END,
                 retry_count = 0,
                 next_retry_at = NULL,
                 retry_delay_ms = ?1,
                 last_error = NULL,
                 updated_at = ?2
             WHERE status = 'ERROR'",
            params![DEFAULT_RETRY_DELAY_MS, db::now_iso()],
        )?;
        if n > 0 {
            info!(count = n, "Requeued failed invoices");
        }
        Ok(n)
    }

    /// Replicate server orders as `SYNCED` records. Records with local
    /// changes not yet pushed are left untouched. Returns how many were
    /// written.
    pub fn upsert_from_server(&self, orders: &[Value]) -> PosResult<usize> {
        let conn = self.db.lock()?;
        db::with_transaction(&conn, |tx| {
            let mut written = 0;
            for order in orders {
                let Some(server_id) = order.get("id").and_then(Value::as_str) else {
                    debug!("Skipping server order without id");
                    continue;
                };
                let request_id = order.get("clientRequestId").and_then(Value::as_str);

                let existing: Option<(String, String)> = tx
                    .query_row(
                        "SELECT id, status FROM offline_invoices
                         WHERE id = ?1 OR id = ?2 OR server_id = ?2
                         ORDER BY CASE WHEN id = ?1 THEN 0 ELSE 1 END
                         LIMIT 1",
                        params![request_id.unwrap_or(server_id), server_id],
                        |r| Ok((r.get(0)?, r.get(1)?)),
                    )
                    .optional()?;

                let local_id = match existing {
                    Some((id, status)) => {
                        if SyncStatus::parse(&status).is_some_and(SyncStatus::is_pending) {
                            debug!(invoice_id = %id, "Keeping local pending changes over server copy");
                            continue;
                        }
                        id
                    }
                    None => request_id.unwrap_or(server_id).to_string(),
                };

                write(tx, &server_record(order, local_id, server_id, self.max_retries))?;
                written += 1;
            }
            Ok(written)
        })
        .inspect(|n| {
            if *n > 0 {
                info!(count = n, "Replicated server orders into local queue");
            }
        })
    }

    pub fn remove(&self, id: &str) -> PosResult<bool> {
        let conn = self.db.lock()?;
        let n = conn.execute("DELETE FROM offline_invoices WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    /// Drop every record that never reached the server.
    pub fn clear_pending(&self) -> PosResult<usize> {
        let conn = self.db.lock()?;
        let n = conn.execute(
            "DELETE FROM offline_invoices WHERE status = 'PENDING_SYNC'",
            [],
        )?;
        if n > 0 {
            warn!(count = n, "Cleared unsynced local invoices");
        }
        Ok(n)
    }

    /// Linear scan over the queue, newest first, then paginate.
    pub fn search_local(&self, params: &LocalSearch) -> PosResult<Value> {
        let page = params.page.unwrap_or(1).max(1);
        let limit = params.limit.unwrap_or(DEFAULT_SEARCH_LIMIT).clamp(1, MAX_SEARCH_LIMIT);
        let raw = params.query.as_deref().unwrap_or("");
        let kind = search::classify_query(raw, search::today_local());
        let filters = ResolvedFilters::new(&params.filters)?;

        let all = {
            let conn = self.db.lock()?;
            query_invoices(&conn, "ORDER BY created_at DESC, id", [])?
        };

        let matching: Vec<&OfflineInvoice> = all
            .iter()
            .filter(|inv| matches_query(inv, &kind))
            .filter(|inv| matches!(kind, QueryKind::Date(_)) || filters.matches(inv))
            .collect();

        let total = matching.len();
        let invoices: Vec<&OfflineInvoice> =
            matching.into_iter().skip((page - 1) * limit).take(limit).collect();

        Ok(json!({
            "success": true,
            "invoices": invoices,
            "total": total,
            "page": page,
            "limit": limit,
            "totalPages": total.div_ceil(limit),
        }))
    }
}

fn server_record(order: &Value, local_id: String, server_id: &str, max_retries: i64) -> OfflineInvoice {
    let client = order.get("client").cloned().unwrap_or(Value::Null);
    let text = |v: &Value, key: &str| v.get(key).and_then(Value::as_str).unwrap_or("").to_string();

    let items: Vec<ItemInput> = order
        .get("items")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|i| serde_json::from_value::<ItemInput>(i.clone()).ok())
                .collect()
        })
        .unwrap_or_default();

    let total_value = order
        .get("totalValue")
        .and_then(Value::as_f64)
        .filter(|t| *t > 0.0)
        .unwrap_or_else(|| items.iter().map(ItemInput::line_total).sum());

    let paid = order
        .get("paidAmount")
        .and_then(Value::as_f64)
        .unwrap_or_else(|| {
            order
                .get("payments")
                .and_then(Value::as_array)
                .map(|ps| {
                    ps.iter()
                        .filter_map(|p| p.get("amount").and_then(Value::as_f64))
                        .sum()
                })
                .unwrap_or(0.0)
        });

    let created = order.get("createdAt").and_then(Value::as_str).map(String::from);
    let created_at = created
        .as_deref()
        .and_then(iso_to_millis)
        .unwrap_or_else(|| Utc::now().timestamp_millis());
    let delivery = order
        .get("scheduledDate")
        .and_then(Value::as_str)
        .map(String::from)
        .or_else(|| created.clone());

    OfflineInvoice {
        id: local_id,
        ticket_number: order.get("ticketNumber").and_then(Value::as_i64),
        server_id: Some(server_id.to_string()),
        client: ClientInput {
            id: order
                .get("clientId")
                .and_then(Value::as_str)
                .map(String::from),
            cedula: text(&client, "cedula"),
            name: text(&client, "name"),
            phone: text(&client, "phone"),
        },
        items,
        total_value,
        payment: PaymentSnapshot {
            amount: paid,
            status: order
                .get("paymentStatus")
                .and_then(Value::as_str)
                .unwrap_or(PAYMENT_PENDING)
                .to_string(),
            method: None,
        },
        dates: InvoiceDates { created, delivery },
        order_status: order.get("status").and_then(Value::as_str).map(String::from),
        status: SyncStatus::Synced,
        created_at,
        updated_at: order.get("updatedAt").and_then(Value::as_str).map(String::from),
        retry_count: 0,
        max_retries,
        next_retry_at: None,
        retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
        last_error: None,
    }
}

// ---------------------------------------------------------------------------
// Local search matching
// ---------------------------------------------------------------------------

fn day_millis(date: chrono::NaiveDate) -> (i64, i64) {
    let (start, end) = search::local_day_bounds(date);
    (start.timestamp_millis(), end.timestamp_millis())
}

fn contains_digits(haystack: &str, needle_digits: &str) -> bool {
    !needle_digits.is_empty() && search::normalize_digits(haystack).contains(needle_digits)
}

fn matches_query(inv: &OfflineInvoice, kind: &QueryKind) -> bool {
    let ticket = inv.ticket_number.map(|t| t.to_string());
    match kind {
        QueryKind::Empty => true,
        QueryKind::Date(date) => {
            let (start, end) = day_millis(*date);
            inv.created_at >= start && inv.created_at < end
        }
        QueryKind::Ticket { digits, exact } => match ticket {
            Some(t) if *exact => t == *digits,
            Some(t) => t.contains(digits.as_str()),
            None => false,
        },
        QueryKind::Text(term) => {
            let digits = search::normalize_digits(term);
            let client = &inv.client;
            ticket.is_some_and(|t| t.contains(term.as_str()))
                || client.name.to_lowercase().contains(term.as_str())
                || contains_digits(&client.cedula, &digits)
                || client.cedula.to_lowercase().contains(term.as_str())
                || client
                    .id
                    .as_deref()
                    .is_some_and(|id| id.to_lowercase().contains(term.as_str()))
                || contains_digits(&client.phone, &digits)
                || client.phone.to_lowercase().contains(term.as_str())
                || inv
                    .items
                    .iter()
                    .any(|i| i.description.to_lowercase().contains(term.as_str()))
        }
    }
}

/// Filter panel values, trimmed and pre-parsed.
struct ResolvedFilters {
    name: Option<String>,
    cedula: Option<String>,
    phone: Option<String>,
    ticket_number: Option<String>,
    description: Option<String>,
    start_ms: Option<i64>,
    end_ms: Option<i64>,
}

impl ResolvedFilters {
    fn new(filters: &SearchFilters) -> PosResult<Self> {
        let lower = |v: &Option<String>| search::filter_value(v).map(str::to_lowercase);
        let day = |v: &Option<String>| -> PosResult<Option<chrono::NaiveDate>> {
            search::filter_value(v)
                .map(|s| {
                    search::parse_day(s)
                        .ok_or_else(|| PosError::Validation(format!("Fecha inválida: {s}")))
                })
                .transpose()
        };
        Ok(Self {
            name: lower(&filters.name),
            cedula: lower(&filters.cedula),
            phone: lower(&filters.phone),
            ticket_number: search::filter_value(&filters.ticket_number).map(String::from),
            description: lower(&filters.description),
            start_ms: day(&filters.start_date)?.map(|d| day_millis(d).0),
            end_ms: day(&filters.end_date)?.map(|d| day_millis(d).1),
        })
    }

    fn matches(&self, inv: &OfflineInvoice) -> bool {
        let client = &inv.client;
        if let Some(name) = &self.name {
            if !client.name.to_lowercase().contains(name.as_str()) {
                return false;
            }
        }
        if let Some(cedula) = &self.cedula {
            let digits = search::normalize_digits(cedula);
            let id = client.id.as_deref().unwrap_or("");
            let hit = contains_digits(&client.cedula, &digits)
                || contains_digits(id, &digits)
                || client.cedula.to_lowercase().contains(cedula.as_str())
                || id.to_lowercase().contains(cedula.as_str());
            if !hit {
                return false;
            }
        }
        if let Some(phone) = &self.phone {
            let digits = search::normalize_digits(phone);
            let hit = contains_digits(&client.phone, &digits)
                || client.phone.to_lowercase().contains(phone.as_str());
            if !hit {
                return false;
            }
        }
        if let Some(ticket) = &self.ticket_number {
            if inv.ticket_number.map(|t| t.to_string()).as_deref() != Some(ticket.as_str()) {
                return false;
            }
        }
        if let Some(description) = &self.description {
            if !inv
                .items
                .iter()
                .any(|i| i.description.to_lowercase().contains(description.as_str()))
            {
                return false;
            }
        }
        if self.start_ms.is_some_and(|start| inv.created_at < start) {
            return false;
        }
        if self.end_ms.is_some_and(|end| inv.created_at >= end) {
            return false;
        }
        true
    }
}
