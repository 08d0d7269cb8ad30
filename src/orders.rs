//! Orders (invoices): creation with client upsert and initial abono,
//! idempotent sync create/update, lookup, smart search, logistics status,
//! delivery, and the ticket sequence.

use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::clients;
use crate::db::{self, DbState};
use crate::error::{PosError, PosResult};
use crate::models::{
    self, InvoicePayload, ItemInput, LOCATION_PLANT, LOCATION_RECEPTION, LOG_INITIAL,
    LOG_PARTIAL, LOG_SETTLEMENT, PAYMENT_SETTLED, STATUS_DELIVERED, STATUS_IN_PROCESS,
    STATUS_PENDING, STATUS_PROBLEM,
};
use crate::search::{self, QueryKind, SearchFilters};

pub const TICKET_SEQUENCE: &str = "order_ticket";

const RECENT_LIMIT: usize = 20;
const DEFAULT_PAGE_SIZE: usize = 20;
const MAX_PAGE_SIZE: usize = 200;

const ORDER_STATUSES: &[&str] = &[
    STATUS_PENDING,
    STATUS_IN_PROCESS,
    STATUS_PROBLEM,
    STATUS_DELIVERED,
];

// ---------------------------------------------------------------------------
// Serialization
// ---------------------------------------------------------------------------

/// Full order with client, items, and payment ledger.
pub fn order_json(conn: &Connection, id: &str) -> PosResult<Value> {
    let found = conn
        .query_row(
            "SELECT id, ticket_number, client_id, client_request_id, status, location,
                    total_value, paid_amount, payment_status, scheduled_date,
                    delivered_date, created_at, updated_at
             FROM orders WHERE id = ?1",
            params![id],
            |row| {
                let client_id: String = row.get(2)?;
                let order = json!({
                    "id": row.get::<_, String>(0)?,
                    "ticketNumber": row.get::<_, i64>(1)?,
                    "clientId": &client_id,
                    "clientRequestId": row.get::<_, Option<String>>(3)?,
                    "status": row.get::<_, String>(4)?,
                    "location": row.get::<_, String>(5)?,
                    "totalValue": row.get::<_, f64>(6)?,
                    "paidAmount": row.get::<_, f64>(7)?,
                    "paymentStatus": row.get::<_, String>(8)?,
                    "scheduledDate": row.get::<_, Option<String>>(9)?,
                    "deliveredDate": row.get::<_, Option<String>>(10)?,
                    "createdAt": row.get::<_, String>(11)?,
                    "updatedAt": row.get::<_, String>(12)?,
                });
                Ok((client_id, order))
            },
        )
        .optional()?;

    let (client_id, mut order) =
        found.ok_or_else(|| PosError::NotFound(format!("Orden {id} no encontrada")))?;

    order["client"] = clients::client_json(conn, &client_id)?;
    order["items"] = Value::Array(items_json(conn, id)?);
    order["payments"] = Value::Array(payments_json(conn, id)?);
    Ok(order)
}

fn items_json(conn: &Connection, order_id: &str) -> PosResult<Vec<Value>> {
    let mut stmt = conn.prepare(
        "SELECT id, type, quantity, price, notes FROM order_items
         WHERE order_id = ?1 ORDER BY rowid",
    )?;
    let rows = stmt.query_map(params![order_id], |row| {
        Ok(json!({
            "id": row.get::<_, String>(0)?,
            "type": row.get::<_, String>(1)?,
            "quantity": row.get::<_, i64>(2)?,
            "price": row.get::<_, f64>(3)?,
            "notes": row.get::<_, Option<String>>(4)?,
        }))
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn payments_json(conn: &Connection, order_id: &str) -> PosResult<Vec<Value>> {
    let mut stmt = conn.prepare(
        "SELECT id, amount, type, note, created_at FROM payment_logs
         WHERE order_id = ?1 ORDER BY created_at, rowid",
    )?;
    let rows = stmt.query_map(params![order_id], |row| {
        Ok(json!({
            "id": row.get::<_, String>(0)?,
            "amount": row.get::<_, f64>(1)?,
            "type": row.get::<_, String>(2)?,
            "note": row.get::<_, Option<String>>(3)?,
            "createdAt": row.get::<_, String>(4)?,
        }))
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

// ---------------------------------------------------------------------------
// Creation
// ---------------------------------------------------------------------------

pub(crate) fn validate_items(items: &[ItemInput]) -> PosResult<()> {
    if items.is_empty() {
        return Err(PosError::Validation("La orden debe tener al menos una prenda".into()));
    }
    for item in items {
        if item.description.trim().is_empty() {
            return Err(PosError::Validation("Cada prenda necesita una descripción".into()));
        }
        if item.quantity < 1 {
            return Err(PosError::Validation(format!(
                "Cantidad inválida para '{}'",
                item.description
            )));
        }
        if !item.price.is_finite() || item.price < 0.0 {
            return Err(PosError::Validation(format!(
                "Precio inválido para '{}'",
                item.description
            )));
        }
    }
    Ok(())
}

pub(crate) fn validate_amount(amount: f64, label: &str) -> PosResult<()> {
    if !amount.is_finite() || amount < 0.0 {
        return Err(PosError::Validation(format!("{label} inválido")));
    }
    Ok(())
}

fn insert_items(conn: &Connection, order_id: &str, items: &[ItemInput]) -> PosResult<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO order_items (id, order_id, type, quantity, price, notes)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;
    for item in items {
        stmt.execute(params![
            db::new_id(),
            order_id,
            item.description.trim(),
            item.quantity,
            item.price,
            item.notes.as_deref().map(str::trim).filter(|n| !n.is_empty()),
        ])?;
    }
    Ok(())
}

pub(crate) fn insert_payment_log(
    conn: &Connection,
    order_id: &str,
    amount: f64,
    log_type: &str,
    note: &str,
) -> PosResult<String> {
    insert_payment_log_at(conn, order_id, amount, log_type, note, &db::now_iso())
}

fn insert_payment_log_at(
    conn: &Connection,
    order_id: &str,
    amount: f64,
    log_type: &str,
    note: &str,
    created_at: &str,
) -> PosResult<String> {
    let id = db::new_id();
    conn.execute(
        "INSERT INTO payment_logs (id, order_id, amount, type, note, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![id, order_id, amount, log_type, note, created_at],
    )?;
    Ok(id)
}

/// Intake time for a new order: the client's `createdAt` when it parses and
/// is not in the future, otherwise now.
fn intake_time(raw: Option<&str>) -> String {
    let now = Utc::now();
    raw.and_then(|ts| DateTime::parse_from_rfc3339(ts.trim()).ok())
        .map(|ts| ts.with_timezone(&Utc))
        .filter(|ts| *ts <= now)
        .map_or_else(|| db::to_iso(now), db::to_iso)
}

fn find_by_request_id(conn: &Connection, request_id: &str) -> PosResult<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT id FROM orders WHERE client_request_id = ?1 LIMIT 1",
            params![request_id],
            |row| row.get(0),
        )
        .optional()?)
}

/// Create an invoice: upsert the client by cedula, take the next ticket
/// number, insert order and items, and record the initial abono. When
/// `clientRequestId` matches an existing order that order is returned with
/// `deduplicated: true` and nothing is written.
pub fn create_invoice(db: &DbState, payload: &InvoicePayload) -> PosResult<Value> {
    validate_items(&payload.items)?;
    validate_amount(payload.payment.amount, "Abono")?;

    let request_id = payload
        .client_request_id
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty());

    let conn = db.lock()?;

    if let Some(req_id) = request_id {
        if let Some(order_id) = find_by_request_id(&conn, req_id)? {
            info!(
                order_id = %order_id,
                client_request_id = %req_id,
                "Order create deduplicated via client_request_id"
            );
            return Ok(json!({
                "success": true,
                "deduplicated": true,
                "order": order_json(&conn, &order_id)?,
            }));
        }
    }

    let total = payload.resolved_total();
    let abono = payload.payment.amount;
    let method = payload.payment_method().to_string();

    let (order_id, ticket) = db::with_transaction(&conn, |tx| {
        let client_id = clients::upsert_by_cedula(tx, &payload.client)?;
        let ticket = db::next_sequence(tx, TICKET_SEQUENCE)?;
        let order_id = db::new_id();
        let created_at = intake_time(payload.created_at.as_deref());
        let status = payload
            .order_status
            .as_deref()
            .filter(|s| ORDER_STATUSES.contains(s))
            .unwrap_or(STATUS_PENDING);

        tx.execute(
            "INSERT INTO orders (
                id, ticket_number, client_id, client_request_id, status, location,
                total_value, paid_amount, payment_status, scheduled_date,
                created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                order_id,
                ticket,
                client_id,
                request_id,
                status,
                LOCATION_RECEPTION,
                total,
                abono,
                models::payment_status_for(abono, total),
                payload.delivery_date.as_deref(),
                created_at,
                db::now_iso(),
            ],
        )?;
        insert_items(tx, &order_id, &payload.items)?;

        if abono > 0.0 {
            insert_payment_log_at(
                tx,
                &order_id,
                abono,
                LOG_INITIAL,
                &format!("Abono inicial ({method})"),
                &created_at,
            )?;
        }
        Ok((order_id, ticket))
    })?;

    info!(
        order_id = %order_id,
        ticket_number = ticket,
        total = total,
        abono = abono,
        "Invoice created"
    );

    Ok(json!({
        "success": true,
        "deduplicated": false,
        "order": order_json(&conn, &order_id)?,
    }))
}

/// Apply an offline edit to an existing order, found by its
/// `client_request_id` or its server id.
///
/// Items are replaced when the payload carries any. A payment amount above
/// what the server has recorded is logged as a new abono for the difference.
pub fn update_invoice(db: &DbState, key: &str, payload: &InvoicePayload) -> PosResult<Value> {
    if !payload.items.is_empty() {
        validate_items(&payload.items)?;
    }
    validate_amount(payload.payment.amount, "Abono")?;

    let conn = db.lock()?;

    let existing: Option<(String, f64, f64)> = conn
        .query_row(
            "SELECT id, total_value, paid_amount FROM orders
             WHERE client_request_id = ?1 OR id = ?1 LIMIT 1",
            params![key],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    let Some((order_id, old_total, old_paid)) = existing else {
        return Err(PosError::NotFound(format!("Orden {key} no encontrada")));
    };

    let method = payload.payment_method().to_string();

    db::with_transaction(&conn, |tx| {
        let now = db::now_iso();

        if !payload.client.cedula.trim().is_empty() {
            let client_id = clients::upsert_by_cedula(tx, &payload.client)?;
            tx.execute(
                "UPDATE orders SET client_id = ?1 WHERE id = ?2",
                params![client_id, order_id],
            )?;
        }

        let total = if !payload.items.is_empty() {
            tx.execute("DELETE FROM order_items WHERE order_id = ?1", params![order_id])?;
            insert_items(tx, &order_id, &payload.items)?;
            payload.resolved_total()
        } else {
            payload
                .total_value
                .or(payload.payment.total)
                .filter(|t| *t > 0.0)
                .unwrap_or(old_total)
        };

        let mut paid = old_paid;
        let delta = payload.payment.amount - old_paid;
        if delta > 0.0 {
            paid = payload.payment.amount;
            let log_type = if models::payment_status_for(paid, total) == PAYMENT_SETTLED {
                LOG_SETTLEMENT
            } else {
                LOG_PARTIAL
            };
            insert_payment_log(
                tx,
                &order_id,
                delta,
                log_type,
                &format!("Abono registrado ({method})"),
            )?;
        }

        if let Some(status) = payload.order_status.as_deref() {
            if !ORDER_STATUSES.contains(&status) {
                return Err(PosError::Validation(format!("Estado de orden inválido: {status}")));
            }
            tx.execute(
                "UPDATE orders SET status = ?1 WHERE id = ?2",
                params![status, order_id],
            )?;
        }

        tx.execute(
            "UPDATE orders SET total_value = ?1, paid_amount = ?2, payment_status = ?3,
                    scheduled_date = COALESCE(?4, scheduled_date), updated_at = ?5
             WHERE id = ?6",
            params![
                total,
                paid,
                models::payment_status_for(paid, total),
                payload.delivery_date.as_deref(),
                now,
                order_id,
            ],
        )?;
        Ok(())
    })?;

    info!(order_id = %order_id, key = %key, "Invoice updated");

    Ok(json!({
        "success": true,
        "order": order_json(&conn, &order_id)?,
    }))
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

pub fn get_order(db: &DbState, id: &str) -> PosResult<Value> {
    let conn = db.lock()?;
    order_json(&conn, id)
}

fn orders_by_ids(conn: &Connection, ids: &[String]) -> PosResult<Vec<Value>> {
    ids.iter().map(|id| order_json(conn, id)).collect()
}

fn collect_ids(conn: &Connection, sql: &str, args: &[SqlValue]) -> PosResult<Vec<String>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params_from_iter(args.iter()), |row| row.get::<_, String>(0))?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Most recent orders, newest first.
pub fn list_recent(db: &DbState) -> PosResult<Value> {
    let conn = db.lock()?;
    let ids = collect_ids(
        &conn,
        "SELECT id FROM orders ORDER BY created_at DESC, ticket_number DESC LIMIT ?1",
        &[SqlValue::Integer(RECENT_LIMIT as i64)],
    )?;
    Ok(json!({ "success": true, "orders": orders_by_ids(&conn, &ids)? }))
}

/// Orders still in the shop's workflow.
pub fn pending_invoices(db: &DbState) -> PosResult<Value> {
    let conn = db.lock()?;
    let ids = collect_ids(
        &conn,
        "SELECT id FROM orders WHERE status IN (?1, ?2, ?3, ?4)
         ORDER BY created_at DESC",
        &[
            SqlValue::Text(STATUS_PENDING.into()),
            SqlValue::Text(STATUS_PROBLEM.into()),
            SqlValue::Text(STATUS_IN_PROCESS.into()),
            SqlValue::Text(STATUS_DELIVERED.into()),
        ],
    )?;
    let orders = orders_by_ids(&conn, &ids)?;
    Ok(json!({ "success": true, "count": orders.len(), "orders": orders }))
}

/// Ticket number the next invoice will receive.
pub fn next_folio(db: &DbState) -> PosResult<Value> {
    let conn = db.lock()?;
    let counter = db::current_sequence(&conn, TICKET_SEQUENCE)?;
    let max_ticket: i64 = conn.query_row(
        "SELECT COALESCE(MAX(ticket_number), 0) FROM orders",
        [],
        |row| row.get(0),
    )?;
    Ok(json!({ "success": true, "nextId": counter.max(max_ticket) + 1 }))
}

/// Restart the ticket sequence so the next invoice gets `target`.
pub fn reset_sequence(db: &DbState, target: i64) -> PosResult<Value> {
    if target < 1 {
        return Err(PosError::Validation("targetNumber debe ser mayor que cero".into()));
    }
    let conn = db.lock()?;
    let max_ticket: i64 = conn.query_row(
        "SELECT COALESCE(MAX(ticket_number), 0) FROM orders",
        [],
        |row| row.get(0),
    )?;
    if target <= max_ticket {
        return Err(PosError::Conflict(format!(
            "Ya existe la orden #{max_ticket}; la secuencia debe continuar después de ese número"
        )));
    }
    db::set_sequence(&conn, TICKET_SEQUENCE, target - 1)?;
    warn!(target = target, "Ticket sequence reset");
    Ok(json!({
        "success": true,
        "message": format!("Secuencia reiniciada. La próxima orden será #{target}"),
        "nextId": target,
    }))
}

// ---------------------------------------------------------------------------
// Logistics and delivery
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogisticsAction {
    Organize,
    Missing,
    Found,
}

impl LogisticsAction {
    fn target(self) -> (&'static str, &'static str) {
        match self {
            LogisticsAction::Organize | LogisticsAction::Found => {
                (STATUS_IN_PROCESS, LOCATION_PLANT)
            }
            LogisticsAction::Missing => (STATUS_PROBLEM, LOCATION_RECEPTION),
        }
    }
}

pub fn update_logistics_status(
    db: &DbState,
    order_id: &str,
    action: LogisticsAction,
) -> PosResult<Value> {
    let (status, location) = action.target();
    let conn = db.lock()?;
    let changed = conn.execute(
        "UPDATE orders SET status = ?1, location = ?2, updated_at = ?3 WHERE id = ?4",
        params![status, location, db::now_iso(), order_id],
    )?;
    if changed == 0 {
        return Err(PosError::NotFound(format!("Orden {order_id} no encontrada")));
    }
    info!(order_id = %order_id, action = ?action, status = status, location = location, "Logistics status updated");
    Ok(json!({ "success": true, "order": order_json(&conn, order_id)? }))
}

pub fn deliver_order(db: &DbState, order_id: &str) -> PosResult<Value> {
    let conn = db.lock()?;
    let now = db::now_iso();
    let changed = conn.execute(
        "UPDATE orders SET status = ?1, delivered_date = ?2, updated_at = ?2 WHERE id = ?3",
        params![STATUS_DELIVERED, now, order_id],
    )?;
    if changed == 0 {
        return Err(PosError::NotFound(format!("Orden {order_id} no encontrada")));
    }
    info!(order_id = %order_id, "Order delivered");
    Ok(json!({ "success": true, "order": order_json(&conn, order_id)? }))
}

// ---------------------------------------------------------------------------
// Search
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchParams {
    #[serde(default, alias = "q")]
    pub query: Option<String>,
    #[serde(default)]
    pub page: Option<usize>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(flatten)]
    pub filters: SearchFilters,
}

fn like_contains(term: &str) -> String {
    let escaped = term
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

#[derive(Default)]
struct WhereBuilder {
    clauses: Vec<String>,
    args: Vec<SqlValue>,
}

impl WhereBuilder {
    /// `clause` uses `?` placeholders; they are numbered on the way in.
    fn push(&mut self, clause: &str, args: Vec<SqlValue>) {
        let mut numbered = String::with_capacity(clause.len() + 8);
        let mut next = self.args.len();
        for ch in clause.chars() {
            if ch == '?' {
                next += 1;
                numbered.push_str(&format!("?{next}"));
            } else {
                numbered.push(ch);
            }
        }
        self.clauses.push(numbered);
        self.args.extend(args);
    }

    fn sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }
}

fn text(v: &str) -> SqlValue {
    SqlValue::Text(v.to_string())
}

const ITEM_MATCH: &str = "EXISTS (SELECT 1 FROM order_items i
    WHERE i.order_id = o.id AND lower(i.type) LIKE ? ESCAPE '\\')";

/// Server-side search with the same smart date detection as the local queue.
pub fn search_orders(db: &DbState, params: &SearchParams) -> PosResult<Value> {
    let page = params.page.unwrap_or(1).max(1);
    let limit = params.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let raw_query = params.query.as_deref().unwrap_or("");
    let kind = search::classify_query(raw_query, search::today_local());

    let mut wb = WhereBuilder::default();

    match &kind {
        QueryKind::Empty => {}
        QueryKind::Date(date) => {
            let (start, end) = search::local_day_bounds(*date);
            wb.push(
                "o.created_at >= ? AND o.created_at < ?",
                vec![text(&db::to_iso(start)), text(&db::to_iso(end))],
            );
        }
        QueryKind::Ticket { digits, .. } => {
            let ticket: i64 = digits.parse().unwrap_or(-1);
            wb.push("o.ticket_number = ?", vec![SqlValue::Integer(ticket)]);
        }
        QueryKind::Text(term) if term.chars().all(|c| c.is_ascii_digit()) => {
            let ticket: i64 = term.parse().unwrap_or(-1);
            let pattern = like_contains(term);
            wb.push(
                "(o.ticket_number = ? OR c.cedula LIKE ? ESCAPE '\\' OR c.phone LIKE ? ESCAPE '\\')",
                vec![SqlValue::Integer(ticket), text(&pattern), text(&pattern)],
            );
        }
        QueryKind::Text(term) => {
            let pattern = like_contains(term);
            wb.push(
                &format!("(lower(c.name) LIKE ? ESCAPE '\\' OR {ITEM_MATCH})"),
                vec![text(&pattern), text(&pattern)],
            );
        }
    }

    // A date phrase overrides the filter panel.
    if !matches!(kind, QueryKind::Date(_)) {
        apply_filters(&mut wb, &params.filters)?;
    }

    let from = "FROM orders o JOIN clients c ON c.id = o.client_id";
    let where_sql = wb.sql();

    let conn = db.lock()?;
    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) {from}{where_sql}"),
        params_from_iter(wb.args.iter()),
        |row| row.get(0),
    )?;

    let mut page_args = wb.args.clone();
    let n = page_args.len();
    page_args.push(SqlValue::Integer(limit as i64));
    page_args.push(SqlValue::Integer(((page - 1) * limit) as i64));
    let ids = collect_ids(
        &conn,
        &format!(
            "SELECT o.id {from}{where_sql}
             ORDER BY o.created_at DESC, o.ticket_number DESC
             LIMIT ?{} OFFSET ?{}",
            n + 1,
            n + 2
        ),
        &page_args,
    )?;
    let orders = orders_by_ids(&conn, &ids)?;

    let total_pages = (total as usize).div_ceil(limit);
    Ok(json!({
        "success": true,
        "orders": orders,
        "total": total,
        "page": page,
        "limit": limit,
        "totalPages": total_pages,
    }))
}

fn apply_filters(wb: &mut WhereBuilder, filters: &SearchFilters) -> PosResult<()> {
    if let Some(name) = search::filter_value(&filters.name) {
        wb.push(
            "lower(c.name) LIKE ? ESCAPE '\\'",
            vec![text(&like_contains(&name.to_lowercase()))],
        );
    }
    if let Some(cedula) = search::filter_value(&filters.cedula) {
        wb.push("c.cedula LIKE ? ESCAPE '\\'", vec![text(&like_contains(cedula))]);
    }
    if let Some(phone) = search::filter_value(&filters.phone) {
        wb.push("c.phone LIKE ? ESCAPE '\\'", vec![text(&like_contains(phone))]);
    }
    if let Some(ticket) = search::filter_value(&filters.ticket_number) {
        let ticket: i64 = ticket
            .parse()
            .map_err(|_| PosError::Validation(format!("Número de ticket inválido: {ticket}")))?;
        wb.push("o.ticket_number = ?", vec![SqlValue::Integer(ticket)]);
    }
    if let Some(description) = search::filter_value(&filters.description) {
        wb.push(
            ITEM_MATCH,
            vec![text(&like_contains(&description.to_lowercase()))],
        );
    }
    if let Some(start) = search::filter_value(&filters.start_date) {
        let day = search::parse_day(start)
            .ok_or_else(|| PosError::Validation(format!("Fecha inválida: {start}")))?;
        let (from, _) = search::local_day_bounds(day);
        wb.push("o.created_at >= ?", vec![text(&db::to_iso(from))]);
    }
    if let Some(end) = search::filter_value(&filters.end_date) {
        let day = search::parse_day(end)
            .ok_or_else(|| PosError::Validation(format!("Fecha inválida: {end}")))?;
        let (_, until) = search::local_day_bounds(day);
        wb.push("o.created_at < ?", vec![text(&db::to_iso(until))]);
    }
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Schema;
    use crate::models::{ClientInput, PaymentInput};

    fn test_db() -> DbState {
        db::open_in_memory(Schema::Server).expect("in-memory db")
    }

    fn payload(cedula: &str, name: &str, item: &str, price: f64, abono: f64) -> InvoicePayload {
        InvoicePayload {
            client: ClientInput {
                id: None,
                cedula: cedula.into(),
                name: name.into(),
                phone: "300 555 1234".into(),
            },
            items: vec![ItemInput {
                description: item.into(),
                quantity: 1,
                price,
                notes: None,
            }],
            payment: PaymentInput {
                amount: abono,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Move an order's created_at so date searches are deterministic.
    fn set_created_at(db: &DbState, id: &str, ts: &str) {
        let conn = db.lock().unwrap();
        conn.execute(
            "UPDATE orders SET created_at = ?1 WHERE id = ?2",
            params![ts, id],
        )
        .unwrap();
    }

    #[test]
    fn test_create_invoice_with_initial_abono() {
        let db = test_db();
        let result = create_invoice(&db, &payload("1020", "Ana", "Saco", 20000.0, 5000.0)).unwrap();
        assert_eq!(result["success"], true);
        assert_eq!(result["deduplicated"], false);

        let order = &result["order"];
        assert_eq!(order["ticketNumber"], 1);
        assert_eq!(order["status"], "PENDIENTE");
        assert_eq!(order["location"], "RECEPCION");
        assert_eq!(order["paymentStatus"], "ABONO");
        assert_eq!(order["paidAmount"], 5000.0);
        assert_eq!(order["items"][0]["type"], "Saco");
        assert_eq!(order["payments"][0]["type"], "ABONO_INICIAL");
        assert_eq!(order["payments"][0]["note"], "Abono inicial (Efectivo)");
    }

    #[test]
    fn test_create_keeps_offline_intake_time() {
        let db = test_db();
        let mut p = payload("1020", "Ana", "Saco", 1000.0, 500.0);
        p.created_at = Some("2024-01-15T14:30:00.000Z".into());
        let order = &create_invoice(&db, &p).unwrap()["order"];
        assert_eq!(order["createdAt"], "2024-01-15T14:30:00.000Z");
        assert_eq!(order["payments"][0]["createdAt"], "2024-01-15T14:30:00.000Z");
        assert_ne!(order["updatedAt"], "2024-01-15T14:30:00.000Z");

        // Future or unparseable times fall back to now.
        for bad in ["2999-01-01T00:00:00Z", "ayer"] {
            let mut p = payload("1021", "Beto", "Falda", 1000.0, 0.0);
            p.created_at = Some(bad.into());
            let before = Utc::now() - chrono::Duration::seconds(5);
            let order = &create_invoice(&db, &p).unwrap()["order"];
            let created = DateTime::parse_from_rfc3339(order["createdAt"].as_str().unwrap())
                .unwrap()
                .with_timezone(&Utc);
            assert!(created >= before && created <= Utc::now());
        }
    }

    #[test]
    fn test_create_reuses_client_by_cedula() {
        let db = test_db();
        let a = create_invoice(&db, &payload("1020", "Ana", "Saco", 1000.0, 0.0)).unwrap();
        let b = create_invoice(&db, &payload("1020", "Ana M", "Falda", 1000.0, 0.0)).unwrap();
        assert_eq!(a["order"]["clientId"], b["order"]["clientId"]);
        assert_eq!(b["order"]["client"]["name"], "Ana M");
        assert_eq!(b["order"]["ticketNumber"], 2);
        assert!(a["order"]["payments"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_create_is_idempotent_on_request_id() {
        let db = test_db();
        let mut p = payload("1020", "Ana", "Saco", 1000.0, 0.0);
        p.client_request_id = Some("local-abc".into());
        let first = create_invoice(&db, &p).unwrap();
        let second = create_invoice(&db, &p).unwrap();
        assert_eq!(second["deduplicated"], true);
        assert_eq!(first["order"]["id"], second["order"]["id"]);

        let conn = db.lock().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM orders", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_create_validation() {
        let db = test_db();
        let mut p = payload("1020", "Ana", "Saco", 1000.0, 0.0);
        p.items.clear();
        assert!(matches!(create_invoice(&db, &p), Err(PosError::Validation(_))));

        let p = payload("", "Ana", "Saco", 1000.0, 0.0);
        assert!(matches!(create_invoice(&db, &p), Err(PosError::Validation(_))));

        let p = payload("1020", "Ana", "Saco", 1000.0, -5.0);
        assert!(matches!(create_invoice(&db, &p), Err(PosError::Validation(_))));
    }

    #[test]
    fn test_failed_create_does_not_consume_ticket() {
        let db = test_db();
        let p = payload("777", "  ", "Saco", 1000.0, 0.0);
        assert!(create_invoice(&db, &p).is_err());
        assert_eq!(next_folio(&db).unwrap()["nextId"], 1);
    }

    #[test]
    fn test_update_by_request_id_records_delta_abono() {
        let db = test_db();
        let mut p = payload("1020", "Ana", "Saco", 10000.0, 2000.0);
        p.client_request_id = Some("local-1".into());
        create_invoice(&db, &p).unwrap();

        p.payment.amount = 10000.0;
        p.order_status = Some("EN_PROCESO".into());
        let updated = update_invoice(&db, "local-1", &p).unwrap();
        let order = &updated["order"];
        assert_eq!(order["paidAmount"], 10000.0);
        assert_eq!(order["paymentStatus"], "CANCELADO");
        assert_eq!(order["status"], "EN_PROCESO");
        let payments = order["payments"].as_array().unwrap();
        assert_eq!(payments.len(), 2);
        assert_eq!(payments[1]["type"], "CANCELACION");
        assert_eq!(payments[1]["amount"], 8000.0);
    }

    #[test]
    fn test_update_missing_is_not_found() {
        let db = test_db();
        let p = payload("1020", "Ana", "Saco", 1000.0, 0.0);
        assert!(matches!(
            update_invoice(&db, "nope", &p),
            Err(PosError::NotFound(_))
        ));
    }

    #[test]
    fn test_logistics_and_delivery() {
        let db = test_db();
        let created = create_invoice(&db, &payload("1", "Ana", "Saco", 1.0, 0.0)).unwrap();
        let id = created["order"]["id"].as_str().unwrap().to_string();

        let r = update_logistics_status(&db, &id, LogisticsAction::Missing).unwrap();
        assert_eq!(r["order"]["status"], "PROBLEMA");
        assert_eq!(r["order"]["location"], "RECEPCION");

        let r = update_logistics_status(&db, &id, LogisticsAction::Found).unwrap();
        assert_eq!(r["order"]["status"], "EN_PROCESO");
        assert_eq!(r["order"]["location"], "PLANTA");

        let r = deliver_order(&db, &id).unwrap();
        assert_eq!(r["order"]["status"], "delivered");
        assert!(r["order"]["deliveredDate"].is_string());

        assert!(matches!(
            deliver_order(&db, "missing"),
            Err(PosError::NotFound(_))
        ));
    }

    #[test]
    fn test_pending_lists_workflow_statuses() {
        let db = test_db();
        create_invoice(&db, &payload("1", "Ana", "Saco", 1.0, 0.0)).unwrap();
        let r = pending_invoices(&db).unwrap();
        assert_eq!(r["count"], 1);
    }

    #[test]
    fn test_reset_sequence() {
        let db = test_db();
        create_invoice(&db, &payload("1", "Ana", "Saco", 1.0, 0.0)).unwrap();
        assert_eq!(next_folio(&db).unwrap()["nextId"], 2);

        assert!(matches!(reset_sequence(&db, 1), Err(PosError::Conflict(_))));
        assert!(matches!(reset_sequence(&db, 0), Err(PosError::Validation(_))));

        reset_sequence(&db, 500).unwrap();
        assert_eq!(next_folio(&db).unwrap()["nextId"], 500);
        let created = create_invoice(&db, &payload("2", "Luis", "Saco", 1.0, 0.0)).unwrap();
        assert_eq!(created["order"]["ticketNumber"], 500);
    }

    #[test]
    fn test_search_numeric_and_text() {
        let db = test_db();
        create_invoice(&db, &payload("10203040", "Ana Pérez", "Saco azul", 1.0, 0.0)).unwrap();
        create_invoice(&db, &payload("555", "Luis Gómez", "Vestido", 1.0, 0.0)).unwrap();

        let by_ticket = search_orders(
            &db,
            &SearchParams {
                query: Some("2".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(by_ticket["total"], 1);
        assert_eq!(by_ticket["orders"][0]["client"]["name"], "Luis Gómez");

        let by_cedula = search_orders(
            &db,
            &SearchParams {
                query: Some("20304".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(by_cedula["total"], 1);
        assert_eq!(by_cedula["orders"][0]["client"]["cedula"], "10203040");

        let by_item = search_orders(
            &db,
            &SearchParams {
                query: Some("VESTIDO".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(by_item["total"], 1);

        let by_name = search_orders(
            &db,
            &SearchParams {
                query: Some("ana".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(by_name["total"], 1);
    }

    #[test]
    fn test_search_date_overrides_filters() {
        let db = test_db();
        let a = create_invoice(&db, &payload("1", "Ana", "Saco", 1.0, 0.0)).unwrap();
        let b = create_invoice(&db, &payload("2", "Luis", "Saco", 1.0, 0.0)).unwrap();

        let day = chrono::NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        let (start, _) = search::local_day_bounds(day);
        let noon = start + chrono::Duration::hours(12);
        set_created_at(&db, a["order"]["id"].as_str().unwrap(), &db::to_iso(noon));
        set_created_at(
            &db,
            b["order"]["id"].as_str().unwrap(),
            &db::to_iso(noon + chrono::Duration::days(1)),
        );

        let params = SearchParams {
            query: Some("15 de enero de 2024".into()),
            filters: SearchFilters {
                name: Some("Luis".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        let result = search_orders(&db, &params).unwrap();
        assert_eq!(result["total"], 1);
        assert_eq!(result["orders"][0]["client"]["name"], "Ana");
    }

    #[test]
    fn test_search_filters_and_pagination() {
        let db = test_db();
        for i in 0..5 {
            create_invoice(&db, &payload(&format!("9{i}"), "Marta", "Camisa", 1.0, 0.0)).unwrap();
        }
        create_invoice(&db, &payload("1", "Pedro", "Camisa", 1.0, 0.0)).unwrap();

        let params = SearchParams {
            page: Some(2),
            limit: Some(2),
            filters: SearchFilters {
                name: Some("marta".into()),
                description: Some("camisa".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        let result = search_orders(&db, &params).unwrap();
        assert_eq!(result["total"], 5);
        assert_eq!(result["totalPages"], 3);
        assert_eq!(result["orders"].as_array().unwrap().len(), 2);

        let bad = SearchParams {
            filters: SearchFilters {
                ticket_number: Some("abc".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(search_orders(&db, &bad), Err(PosError::Validation(_))));
    }

    #[test]
    fn test_like_escaping() {
        assert_eq!(like_contains("50%_off"), "%50\\%\\_off%");
    }
}
