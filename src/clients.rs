//! Client records keyed by cedula.

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::db::{self, DbState};
use crate::error::{PosError, PosResult};
use crate::models::ClientInput;

/// Find the client by cedula, refreshing name/phone when present, or create
/// it. Returns the client id. Must run inside the caller's transaction.
pub fn upsert_by_cedula(conn: &Connection, input: &ClientInput) -> PosResult<String> {
    let cedula = input.cedula.trim();
    let name = input.name.trim();
    let phone = input.phone.trim();

    if cedula.is_empty() {
        return Err(PosError::Validation("La cédula del cliente es obligatoria".into()));
    }

    let existing: Option<(String, String, String)> = conn
        .query_row(
            "SELECT id, name, phone FROM clients WHERE cedula = ?1",
            params![cedula],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    let now = db::now_iso();
    match existing {
        Some((id, old_name, old_phone)) => {
            let new_name = if name.is_empty() { old_name.as_str() } else { name };
            let new_phone = if phone.is_empty() { old_phone.as_str() } else { phone };
            if new_name != old_name || new_phone != old_phone {
                conn.execute(
                    "UPDATE clients SET name = ?1, phone = ?2, updated_at = ?3 WHERE id = ?4",
                    params![new_name, new_phone, now, id],
                )?;
                debug!(client_id = %id, "Client details refreshed");
            }
            Ok(id)
        }
        None => {
            if name.is_empty() {
                return Err(PosError::Validation("El nombre del cliente es obligatorio".into()));
            }
            let id = db::new_id();
            conn.execute(
                "INSERT INTO clients (id, cedula, name, phone, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![id, cedula, name, phone, now],
            )?;
            info!(client_id = %id, "Client created");
            Ok(id)
        }
    }
}

pub fn client_json(conn: &Connection, id: &str) -> PosResult<Value> {
    conn.query_row(
        "SELECT id, cedula, name, phone, created_at FROM clients WHERE id = ?1",
        params![id],
        |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "cedula": row.get::<_, String>(1)?,
                "name": row.get::<_, String>(2)?,
                "phone": row.get::<_, String>(3)?,
                "createdAt": row.get::<_, String>(4)?,
            }))
        },
    )
    .optional()?
    .ok_or_else(|| PosError::NotFound(format!("Cliente {id} no encontrado")))
}

/// Intake-form lookup.
pub fn find_by_cedula(db: &DbState, cedula: &str) -> PosResult<Value> {
    let conn = db.lock()?;
    let id: Option<String> = conn
        .query_row(
            "SELECT id FROM clients WHERE cedula = ?1",
            params![cedula.trim()],
            |row| row.get(0),
        )
        .optional()?;
    match id {
        Some(id) => client_json(&conn, &id),
        None => Err(PosError::NotFound(format!("Cliente con cédula {cedula} no encontrado"))),
    }
}
