//! Admin whitelist. Listed emails get the ADMIN role; removing an email
//! downgrades its user to STAFF. Super admins come from configuration and
//! cannot be removed.

use rusqlite::{params, OptionalExtension};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::auth;
use crate::db::{self, DbState};
use crate::error::{PosError, PosResult};

pub fn list_admins(db: &DbState) -> PosResult<Value> {
    let conn = db.lock()?;
    let mut stmt = conn.prepare(
        "SELECT id, email, added_by, created_at FROM allowed_admins ORDER BY created_at, email",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(json!({
            "id": row.get::<_, String>(0)?,
            "email": row.get::<_, String>(1)?,
            "addedBy": row.get::<_, Option<String>>(2)?,
            "createdAt": row.get::<_, String>(3)?,
        }))
    })?;
    let admins = rows.collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "success": true, "admins": admins }))
}

pub fn add_admin(db: &DbState, email: &str, added_by: Option<&str>) -> PosResult<Value> {
    let email = auth::normalize_email(email)?;
    let conn = db.lock()?;

    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM allowed_admins WHERE email = ?1",
            params![email],
            |row| row.get(0),
        )
        .optional()?;
    if exists.is_some() {
        return Err(PosError::Conflict(format!("{email} ya es administrador")));
    }

    let id = db::new_id();
    db::with_transaction(&conn, |tx| {
        tx.execute(
            "INSERT INTO allowed_admins (id, email, added_by, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![id, email, added_by, db::now_iso()],
        )?;
        tx.execute(
            "UPDATE users SET role = 'ADMIN', updated_at = ?1 WHERE email = ?2",
            params![db::now_iso(), email],
        )?;
        Ok(())
    })?;

    info!(email = %email, added_by = ?added_by, "Admin added to whitelist");
    Ok(json!({ "success": true, "admin": { "id": id, "email": email } }))
}

pub fn remove_admin(db: &DbState, email: &str, super_admins: &[String]) -> PosResult<Value> {
    let email = auth::normalize_email(email)?;
    if super_admins.iter().any(|s| *s == email) {
        warn!(email = %email, "Refused to remove super admin");
        return Err(PosError::Forbidden(
            "No se puede eliminar a un super administrador".into(),
        ));
    }

    let conn = db.lock()?;
    let removed = db::with_transaction(&conn, |tx| {
        let removed = tx.execute("DELETE FROM allowed_admins WHERE email = ?1", params![email])?;
        if removed > 0 {
            tx.execute(
                "UPDATE users SET role = 'STAFF', updated_at = ?1 WHERE email = ?2",
                params![db::now_iso(), email],
            )?;
        }
        Ok(removed)
    })?;

    if removed == 0 {
        return Err(PosError::NotFound(format!("{email} no está en la lista")));
    }
    info!(email = %email, "Admin removed from whitelist");
    Ok(json!({ "success": true }))
}
