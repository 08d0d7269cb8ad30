//! Abono registration, daily cash summary, and expenses.
//!
//! The payment ledger stores the method inside the note, e.g.
//! `"Abono registrado (Nequi)"`. Cash accounting parses it back out:
//! `Efectivo` is cash, everything else is digital.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::db::{self, DbState};
use crate::error::{PosError, PosResult};
use crate::models::{self, DEFAULT_PAYMENT_METHOD, LOG_PARTIAL, LOG_SETTLEMENT, PAYMENT_SETTLED};
use crate::orders;
use crate::search;

// ---------------------------------------------------------------------------
// Abonos
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    pub amount: f64,
    #[serde(default, alias = "paymentMethod")]
    pub method: Option<String>,
}

/// Add an abono to an order. The order update and the ledger row are
/// written in one transaction.
pub fn register_payment(db: &DbState, order_id: &str, req: &PaymentRequest) -> PosResult<Value> {
    if !req.amount.is_finite() || req.amount <= 0.0 {
        return Err(PosError::Validation("El monto del abono debe ser mayor que cero".into()));
    }
    let method = req
        .method
        .as_deref()
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .unwrap_or(DEFAULT_PAYMENT_METHOD)
        .to_string();

    let conn = db.lock()?;

    let (new_paid, payment_status) = db::with_transaction(&conn, |tx| {
        let current: Option<(f64, f64)> = tx
            .query_row(
                "SELECT paid_amount, total_value FROM orders WHERE id = ?1",
                params![order_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((paid, total)) = current else {
            return Err(PosError::NotFound(format!("Orden {order_id} no encontrada")));
        };

        let new_paid = paid + req.amount;
        let payment_status = models::payment_status_for(new_paid, total);
        let log_type = if payment_status == PAYMENT_SETTLED {
            LOG_SETTLEMENT
        } else {
            LOG_PARTIAL
        };

        tx.execute(
            "UPDATE orders SET paid_amount = ?1, payment_status = ?2, updated_at = ?3
             WHERE id = ?4",
            params![new_paid, payment_status, db::now_iso(), order_id],
        )?;
        orders::insert_payment_log(
            tx,
            order_id,
            req.amount,
            log_type,
            &format!("Abono registrado ({method})"),
        )?;
        Ok((new_paid, payment_status))
    })?;

    info!(
        order_id = %order_id,
        amount = req.amount,
        method = %method,
        payment_status = payment_status,
        "Payment registered"
    );

    Ok(json!({
        "success": true,
        "paidAmount": new_paid,
        "paymentStatus": payment_status,
        "order": orders::order_json(&conn, order_id)?,
    }))
}

/// Method named in parentheses at the end of a ledger note.
pub fn payment_method_from_note(note: Option<&str>) -> String {
    note.and_then(|n| {
        let open = n.rfind('(')?;
        let close = n[open..].find(')')? + open;
        let method = n[open + 1..close].trim();
        (!method.is_empty()).then(|| method.to_string())
    })
    .unwrap_or_else(|| DEFAULT_PAYMENT_METHOD.to_string())
}

pub fn is_cash_method(method: &str) -> bool {
    method.trim().eq_ignore_ascii_case(DEFAULT_PAYMENT_METHOD)
}

// ---------------------------------------------------------------------------
// Cash accounting
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CashTotals {
    pub cash: f64,
    pub digital: f64,
    pub by_method: BTreeMap<String, f64>,
    pub payments: usize,
}

/// Ledger income between two RFC 3339 instants (`start` inclusive).
pub fn income_between(conn: &Connection, start: &str, end: &str) -> PosResult<CashTotals> {
    let mut stmt = conn.prepare(
        "SELECT amount, note FROM payment_logs WHERE created_at >= ?1 AND created_at < ?2",
    )?;
    let rows = stmt.query_map(params![start, end], |row| {
        Ok((row.get::<_, f64>(0)?, row.get::<_, Option<String>>(1)?))
    })?;

    let mut totals = CashTotals::default();
    for row in rows {
        let (amount, note) = row?;
        let method = payment_method_from_note(note.as_deref());
        if is_cash_method(&method) {
            totals.cash += amount;
        } else {
            totals.digital += amount;
        }
        *totals.by_method.entry(method).or_insert(0.0) += amount;
        totals.payments += 1;
    }
    Ok(totals)
}

pub fn expenses_between(conn: &Connection, start: &str, end: &str) -> PosResult<Vec<Value>> {
    let mut stmt = conn.prepare(
        "SELECT id, description, amount, category, date FROM expenses
         WHERE date >= ?1 AND date < ?2 ORDER BY date",
    )?;
    let rows = stmt.query_map(params![start, end], |row| {
        Ok(json!({
            "id": row.get::<_, String>(0)?,
            "description": row.get::<_, String>(1)?,
            "amount": row.get::<_, f64>(2)?,
            "category": row.get::<_, String>(3)?,
            "date": row.get::<_, String>(4)?,
        }))
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn sum_amounts(expenses: &[Value]) -> f64 {
    expenses
        .iter()
        .filter_map(|e| e.get("amount").and_then(Value::as_f64))
        .sum()
}

/// Income and expenses for one local calendar day.
pub fn daily_cash_summary(db: &DbState, day: NaiveDate) -> PosResult<Value> {
    let (start, end) = search::local_day_bounds(day);
    let (start, end) = (db::to_iso(start), db::to_iso(end));

    let conn = db.lock()?;
    let income = income_between(&conn, &start, &end)?;
    let expenses = expenses_between(&conn, &start, &end)?;
    let total_expenses = sum_amounts(&expenses);

    Ok(json!({
        "success": true,
        "date": day.format("%Y-%m-%d").to_string(),
        "totalCash": income.cash,
        "totalDigital": income.digital,
        "totalIncome": income.cash + income.digital,
        "methodsSummary": income.by_method,
        "paymentsCount": income.payments,
        "expenses": expenses,
        "totalExpenses": total_expenses,
        "netCash": income.cash - total_expenses,
    }))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpenseInput {
    pub description: String,
    pub amount: f64,
    #[serde(default)]
    pub category: Option<String>,
    /// RFC 3339 instant or `YYYY-MM-DD`; defaults to now.
    #[serde(default)]
    pub date: Option<String>,
}

fn expense_timestamp(raw: Option<&str>) -> PosResult<String> {
    let Some(raw) = raw.map(str::trim).filter(|d| !d.is_empty()) else {
        return Ok(db::now_iso());
    };
    if let Ok(ts) = chrono::DateTime::parse_from_rfc3339(raw) {
        return Ok(db::to_iso(ts.with_timezone(&chrono::Utc)));
    }
    let day = search::parse_day(raw)
        .ok_or_else(|| PosError::Validation(format!("Fecha de gasto inválida: {raw}")))?;
    // Noon keeps the expense inside its local day.
    let (start, _) = search::local_day_bounds(day);
    Ok(db::to_iso(start + chrono::Duration::hours(12)))
}

pub fn register_expense(db: &DbState, input: &ExpenseInput) -> PosResult<Value> {
    let description = input.description.trim();
    if description.is_empty() {
        return Err(PosError::Validation("La descripción del gasto es obligatoria".into()));
    }
    if !input.amount.is_finite() || input.amount <= 0.0 {
        return Err(PosError::Validation("El monto del gasto debe ser mayor que cero".into()));
    }
    let category = input
        .category
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .unwrap_or("GENERAL");
    let date = expense_timestamp(input.date.as_deref())?;
    let id = db::new_id();

    let conn = db.lock()?;
    conn.execute(
        "INSERT INTO expenses (id, description, amount, category, date)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![id, description, input.amount, category, date],
    )?;

    info!(expense_id = %id, amount = input.amount, category = category, "Expense registered");
    Ok(json!({
        "success": true,
        "expense": {
            "id": id,
            "description": description,
            "amount": input.amount,
            "category": category,
            "date": date,
        }
    }))
}

pub fn delete_expense(db: &DbState, id: &str) -> PosResult<Value> {
    let conn = db.lock()?;
    let deleted = conn.execute("DELETE FROM expenses WHERE id = ?1", params![id])?;
    if deleted == 0 {
        return Err(PosError::NotFound(format!("Gasto {id} no encontrado")));
    }
    info!(expense_id = %id, "Expense deleted");
    Ok(json!({ "success": true }))
}
