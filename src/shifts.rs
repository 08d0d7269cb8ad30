//! Cash shift lifecycle.
//!
//! A user has at most one OPEN shift. Opening a new one first force-closes
//! any stale OPEN shift for that user (closed by the system). Closing
//! computes cash, digital, and expense totals from the payment ledger over
//! the shift window.

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::db::{self, DbState};
use crate::error::{PosError, PosResult};
use crate::payments;

pub const AUTO_CLOSE_BY: &str = "Sistema (Auto-cierre)";

// ---------------------------------------------------------------------------
// Open shift
// ---------------------------------------------------------------------------

/// Open a shift for `userId` with an optional `baseAmount` (opening cash).
pub fn open_shift(db: &DbState, payload: &Value) -> PosResult<Value> {
    let user_id = str_field(payload, "userId")
        .or_else(|| str_field(payload, "user_id"))
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| PosError::Validation("userId es obligatorio".into()))?;
    let base_amount = num_field(payload, "baseAmount")
        .or_else(|| num_field(payload, "base_amount"))
        .unwrap_or(0.0);
    if !base_amount.is_finite() || base_amount < 0.0 {
        return Err(PosError::Validation("baseAmount inválido".into()));
    }

    let conn = db.lock()?;
    let shift_id = db::new_id();

    let closed_stale = db::with_transaction(&conn, |tx| {
        let now = db::now_iso();
        let closed = tx.execute(
            "UPDATE cash_shifts SET status = 'CLOSED', end_time = ?1, closed_by = ?2
             WHERE user_id = ?3 AND status = 'OPEN'",
            params![now, AUTO_CLOSE_BY, user_id],
        )?;

        tx.execute(
            "INSERT INTO cash_shifts (id, user_id, start_time, status, base_amount, total_calculated)
             VALUES (?1, ?2, ?3, 'OPEN', ?4, ?4)",
            params![shift_id, user_id, now, base_amount],
        )?;
        Ok(closed)
    })?;

    if closed_stale > 0 {
        warn!(user_id = %user_id, count = closed_stale, "Force-closed stale open shift");
    }
    info!(shift_id = %shift_id, user_id = %user_id, base_amount = base_amount, "Shift opened");

    Ok(json!({
        "status": "SUCCESS",
        "success": true,
        "shiftId": shift_id,
        "closedStale": closed_stale,
    }))
}

// ---------------------------------------------------------------------------
// Close shift
// ---------------------------------------------------------------------------

/// Close a shift by `shiftId` (or the open shift of `userId`).
///
/// `declaredCash`, when given, is stored and compared with the expected
/// drawer total (`base + cash income - expenses`).
pub fn close_shift(db: &DbState, payload: &Value) -> PosResult<Value> {
    let shift_id = str_field(payload, "shiftId").or_else(|| str_field(payload, "shift_id"));
    let user_id = str_field(payload, "userId").or_else(|| str_field(payload, "user_id"));
    let closed_by = str_field(payload, "closedBy")
        .or_else(|| str_field(payload, "closed_by"))
        .or_else(|| user_id.clone())
        .unwrap_or_else(|| "desconocido".into());
    let declared_cash =
        num_field(payload, "declaredCash").or_else(|| num_field(payload, "declared_cash"));

    let conn = db.lock()?;

    let open: Option<(String, String, f64)> = match (&shift_id, &user_id) {
        (Some(id), _) => conn
            .query_row(
                "SELECT id, start_time, base_amount FROM cash_shifts
                 WHERE id = ?1 AND status = 'OPEN'",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?,
        (None, Some(user)) => conn
            .query_row(
                "SELECT id, start_time, base_amount FROM cash_shifts
                 WHERE user_id = ?1 AND status = 'OPEN'
                 ORDER BY start_time DESC LIMIT 1",
                params![user],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?,
        (None, None) => {
            return Err(PosError::Validation("shiftId o userId es obligatorio".into()));
        }
    };

    let Some((id, start_time, base_amount)) = open else {
        return Err(PosError::NotFound("No hay un turno abierto".into()));
    };

    let closed_at = chrono::Utc::now();
    let end_time = db::to_iso(closed_at);
    // Window end is exclusive; include anything stamped in the closing millisecond.
    let window_end = db::to_iso(closed_at + chrono::Duration::milliseconds(1));
    let income = payments::income_between(&conn, &start_time, &window_end)?;
    let expenses = payments::expenses_between(&conn, &start_time, &window_end)?;
    let expense_total = payments::sum_amounts(&expenses);
    let total_calculated = base_amount + income.cash - expense_total;

    conn.execute(
        "UPDATE cash_shifts SET status = 'CLOSED', end_time = ?1, closed_by = ?2,
                cash_count = ?3, digital_count = ?4, expense_count = ?5,
                total_calculated = ?6, declared_cash = ?7
         WHERE id = ?8",
        params![
            end_time,
            closed_by,
            income.cash,
            income.digital,
            expense_total,
            total_calculated,
            declared_cash,
            id,
        ],
    )?;

    let variance = declared_cash.map(|d| d - total_calculated);
    info!(
        shift_id = %id,
        cash = income.cash,
        digital = income.digital,
        expenses = expense_total,
        variance = ?variance,
        "Shift closed"
    );

    Ok(json!({
        "success": true,
        "shift": query_shift(&conn, "SELECT * FROM cash_shifts WHERE id = ?1", params![id])?,
        "variance": variance,
    }))
}

// ---------------------------------------------------------------------------
// Shift queries
// ---------------------------------------------------------------------------

/// Active shift for a user, or `null`.
pub fn get_active(db: &DbState, user_id: &str) -> PosResult<Value> {
    let conn = db.lock()?;
    let shift = query_shift(
        &conn,
        "SELECT * FROM cash_shifts WHERE user_id = ?1 AND status = 'OPEN'
         ORDER BY start_time DESC LIMIT 1",
        params![user_id],
    )?;
    Ok(json!({ "success": true, "shift": shift }))
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// First row as a camelCase JSON object, or null if not found.
fn query_shift(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> PosResult<Value> {
    let mut stmt = conn.prepare(sql)?;
    let col_names: Vec<String> = stmt
        .column_names()
        .into_iter()
        .map(snake_to_camel)
        .collect();

    let result = stmt.query_row(params, |row| {
        let mut obj = serde_json::Map::new();
        for (i, name) in col_names.iter().enumerate() {
            obj.insert(name.clone(), row_value_at(row, i));
        }
        Ok(Value::Object(obj))
    });

    match result {
        Ok(shift) => Ok(shift),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(Value::Null),
        Err(e) => Err(e.into()),
    }
}

fn snake_to_camel(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = false;
    for ch in name.chars() {
        if ch == '_' {
            upper = true;
        } else if upper {
            out.extend(ch.to_uppercase());
            upper = false;
        } else {
            out.push(ch);
        }
    }
    out
}

/// Column value using SQLite's stored type, so REAL 100.0 stays a float.
fn row_value_at(row: &rusqlite::Row, idx: usize) -> Value {
    use rusqlite::types::ValueRef;
    match row.get_ref(idx) {
        Ok(ValueRef::Integer(v)) => Value::Number(serde_json::Number::from(v)),
        Ok(ValueRef::Real(v)) => json!(v),
        Ok(ValueRef::Text(v)) => Value::String(String::from_utf8_lossy(v).into_owned()),
        Ok(ValueRef::Null) | Ok(ValueRef::Blob(_)) | Err(_) => Value::Null,
    }
}

fn str_field(v: &Value, key: &str) -> Option<String> {
    v.get(key).and_then(Value::as_str).map(String::from)
}

fn num_field(v: &Value, key: &str) -> Option<f64> {
    v.get(key).and_then(Value::as_f64)
}

// ===========================================================================
// Tests
// ===========================================================================
