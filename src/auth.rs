//! Email/password authentication with bcrypt and emailed verification codes.
//!
//! Functions here only touch the database and return the code that has to
//! be delivered; the HTTP layer sends the email. Users are created
//! unverified on first login. Code resends are limited to
//! `MAX_RESEND_ATTEMPTS` before a `LOCKOUT_MINUTES` lockout.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Value};
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::db::{self, DbState};
use crate::error::{PosError, PosResult};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const MAX_RESEND_ATTEMPTS: i64 = 3;
const LOCKOUT_MINUTES: i64 = 15;
const MIN_PASSWORD_LEN: usize = 6;

#[cfg(not(test))]
const BCRYPT_COST: u32 = bcrypt::DEFAULT_COST;
#[cfg(test)]
const BCRYPT_COST: u32 = 4;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum LoginOutcome {
    /// A fresh code was issued and must be emailed.
    VerifyNeeded { code: String, created: bool },
    Success { user: Value },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResendOutcome {
    pub code: String,
    pub attempts_left: i64,
}

struct UserRow {
    id: String,
    email: String,
    password_hash: String,
    role: String,
    is_verified: bool,
    verification_code: Option<String>,
    verif_attempts: i64,
    lockout_until: Option<String>,
}

impl UserRow {
    fn public_json(&self) -> Value {
        json!({
            "id": self.id,
            "email": self.email,
            "role": self.role,
            "isVerified": self.is_verified,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub fn normalize_email(email: &str) -> PosResult<String> {
    let email = email.trim().to_lowercase();
    let valid = email
        .split_once('@')
        .map(|(local, domain)| !local.is_empty() && domain.contains('.'))
        .unwrap_or(false);
    if !valid {
        return Err(PosError::Validation("Correo electrónico inválido".into()));
    }
    Ok(email)
}

/// Six-digit code from a v4 UUID's random bits.
pub fn generate_code() -> String {
    let n = uuid::Uuid::new_v4().as_u128() % 900_000 + 100_000;
    n.to_string()
}

fn hash_password(password: &str) -> PosResult<String> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(PosError::Validation(format!(
            "La contraseña debe tener al menos {MIN_PASSWORD_LEN} caracteres"
        )));
    }
    bcrypt::hash(password, BCRYPT_COST).map_err(|e| PosError::Internal(format!("bcrypt: {e}")))
}

fn load_user(conn: &Connection, email: &str) -> PosResult<Option<UserRow>> {
    Ok(conn
        .query_row(
            "SELECT id, email, password_hash, role, is_verified, verification_code,
                    verif_attempts, lockout_until
             FROM users WHERE email = ?1",
            params![email],
            |row| {
                Ok(UserRow {
                    id: row.get(0)?,
                    email: row.get(1)?,
                    password_hash: row.get(2)?,
                    role: row.get(3)?,
                    is_verified: row.get::<_, i64>(4)? != 0,
                    verification_code: row.get(5)?,
                    verif_attempts: row.get(6)?,
                    lockout_until: row.get(7)?,
                })
            },
        )
        .optional()?)
}

fn is_whitelisted_admin(conn: &Connection, email: &str) -> PosResult<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM allowed_admins WHERE email = ?1",
            params![email],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn store_code(conn: &Connection, user_id: &str, code: &str) -> PosResult<()> {
    let now = db::now_iso();
    conn.execute(
        "UPDATE users SET verification_code = ?1, last_verif_sent_at = ?2, updated_at = ?2
         WHERE id = ?3",
        params![code, now, user_id],
    )?;
    Ok(())
}

fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// Log in, creating an unverified account on first use.
pub fn login(db: &DbState, email: &str, password: &str) -> PosResult<LoginOutcome> {
    let email = normalize_email(email)?;
    let password = Zeroizing::new(password.to_string());
    if password.is_empty() {
        return Err(PosError::Validation("La contraseña es obligatoria".into()));
    }

    let existing = {
        let conn = db.lock()?;
        load_user(&conn, &email)?
    };

    let Some(user) = existing else {
        // Hash outside the lock.
        let hash = hash_password(&password)?;
        let code = generate_code();
        let conn = db.lock()?;
        let role = if is_whitelisted_admin(&conn, &email)? {
            "ADMIN"
        } else {
            "STAFF"
        };
        let id = db::new_id();
        let now = db::now_iso();
        conn.execute(
            "INSERT INTO users (id, email, password_hash, role, is_verified,
                                verification_code, last_verif_sent_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, ?6, ?6)",
            params![id, email, hash, role, code, now],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                PosError::Conflict("El usuario ya existe".into())
            }
            other => other.into(),
        })?;
        info!(user_id = %id, role = role, "User registered; verification pending");
        return Ok(LoginOutcome::VerifyNeeded {
            code,
            created: true,
        });
    };

    let password_ok = bcrypt::verify(password.as_str(), &user.password_hash).unwrap_or(false);
    if !password_ok {
        warn!(user_id = %user.id, "Login rejected: wrong password");
        return Err(PosError::Unauthorized("Credenciales inválidas".into()));
    }

    if !user.is_verified {
        let code = generate_code();
        let conn = db.lock()?;
        store_code(&conn, &user.id, &code)?;
        info!(user_id = %user.id, "Login requires verification; new code issued");
        return Ok(LoginOutcome::VerifyNeeded {
            code,
            created: false,
        });
    }

    info!(user_id = %user.id, "Login successful");
    Ok(LoginOutcome::Success {
        user: user.public_json(),
    })
}

/// Confirm the emailed code and mark the account verified.
pub fn verify(db: &DbState, email: &str, code: &str) -> PosResult<Value> {
    let email = normalize_email(email)?;
    let conn = db.lock()?;
    let user = load_user(&conn, &email)?
        .ok_or_else(|| PosError::NotFound("Usuario no encontrado".into()))?;

    let code = code.trim();
    if code.is_empty() || user.verification_code.as_deref() != Some(code) {
        return Err(PosError::Validation("Código incorrecto".into()));
    }

    conn.execute(
        "UPDATE users SET is_verified = 1, verification_code = NULL, verif_attempts = 0,
                lockout_until = NULL, updated_at = ?1
         WHERE id = ?2",
        params![db::now_iso(), user.id],
    )?;
    info!(user_id = %user.id, "User verified");

    let mut public = user.public_json();
    public["isVerified"] = json!(true);
    Ok(json!({ "status": "SUCCESS", "success": true, "user": public }))
}

/// Issue a new verification code, subject to the resend limit.
pub fn resend(db: &DbState, email: &str) -> PosResult<ResendOutcome> {
    resend_at(db, email, Utc::now())
}

fn resend_at(db: &DbState, email: &str, now: DateTime<Utc>) -> PosResult<ResendOutcome> {
    let email = normalize_email(email)?;
    let conn = db.lock()?;
    let user = load_user(&conn, &email)?
        .ok_or_else(|| PosError::NotFound("Usuario no encontrado".into()))?;

    if let Some(until) = user.lockout_until.as_deref().and_then(parse_ts) {
        if until > now {
            let minutes = (until - now).num_minutes() + 1;
            return Err(PosError::RateLimited(format!(
                "Demasiados intentos. Intenta de nuevo en {minutes} minutos"
            )));
        }
    }

    if user.verif_attempts >= MAX_RESEND_ATTEMPTS {
        let until = db::to_iso(now + Duration::minutes(LOCKOUT_MINUTES));
        conn.execute(
            "UPDATE users SET lockout_until = ?1, verif_attempts = 0, updated_at = ?2
             WHERE id = ?3",
            params![until, db::to_iso(now), user.id],
        )?;
        warn!(user_id = %user.id, "Verification resend locked out for {LOCKOUT_MINUTES} minutes");
        return Err(PosError::RateLimited(format!(
            "Demasiados intentos. Intenta de nuevo en {LOCKOUT_MINUTES} minutos"
        )));
    }

    let code = generate_code();
    let attempts = user.verif_attempts + 1;
    conn.execute(
        "UPDATE users SET verification_code = ?1, last_verif_sent_at = ?2,
                verif_attempts = ?3, lockout_until = NULL, updated_at = ?2
         WHERE id = ?4",
        params![code, db::to_iso(now), attempts, user.id],
    )?;
    info!(user_id = %user.id, attempts = attempts, "Verification code resent");

    Ok(ResendOutcome {
        code,
        attempts_left: MAX_RESEND_ATTEMPTS - attempts,
    })
}

/// Issue a reset code. `None` for unknown emails; callers answer the same
/// way in both cases.
pub fn forgot_password(db: &DbState, email: &str) -> PosResult<Option<String>> {
    let email = normalize_email(email)?;
    let conn = db.lock()?;
    let Some(user) = load_user(&conn, &email)? else {
        info!("Password reset requested for unknown email");
        return Ok(None);
    };
    let code = generate_code();
    store_code(&conn, &user.id, &code)?;
    info!(user_id = %user.id, "Password reset code issued");
    Ok(Some(code))
}

/// Replace the password after checking the emailed code. A successful reset
/// also proves ownership of the address, so the account becomes verified.
pub fn reset_password(db: &DbState, email: &str, code: &str, new_password: &str) -> PosResult<()> {
    let email = normalize_email(email)?;
    let new_password = Zeroizing::new(new_password.to_string());
    let code = code.trim();
    if code.is_empty() {
        return Err(PosError::Validation("El código es obligatorio".into()));
    }

    let user_id = {
        let conn = db.lock()?;
        let user = load_user(&conn, &email)?
            .ok_or_else(|| PosError::Validation("Código inválido".into()))?;
        if user.verification_code.as_deref() != Some(code) {
            return Err(PosError::Validation("Código inválido".into()));
        }
        user.id
    };

    let hash = hash_password(&new_password)?;
    let conn = db.lock()?;
    conn.execute(
        "UPDATE users SET password_hash = ?1, verification_code = NULL, is_verified = 1,
                verif_attempts = 0, lockout_until = NULL, updated_at = ?2
         WHERE id = ?3 AND verification_code = ?4",
        params![hash, db::now_iso(), user_id, code],
    )?;
    info!(user_id = %user_id, "Password reset");
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Schema;

    fn test_db() -> DbState {
        db::open_in_memory(Schema::Server).expect("in-memory db")
    }

    fn register_and_verify(db: &DbState, email: &str, password: &str) {
        let LoginOutcome::VerifyNeeded { code, created } = login(db, email, password).unwrap()
        else {
            panic!("expected VerifyNeeded");
        };
        assert!(created);
        verify(db, email, &code).unwrap();
    }

    #[test]
    fn test_first_login_creates_unverified_user() {
        let db = test_db();
        let outcome = login(&db, "Ana@Lavaseco.co", "secreto1").unwrap();
        let LoginOutcome::VerifyNeeded { code, created } = outcome else {
            panic!("expected VerifyNeeded");
        };
        assert!(created);
        assert_eq!(code.len(), 6);

        let conn = db.lock().unwrap();
        let (role, verified): (String, i64) = conn
            .query_row(
                "SELECT role, is_verified FROM users WHERE email = 'ana@lavaseco.co'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(role, "STAFF");
        assert_eq!(verified, 0);
    }

    #[test]
    fn test_whitelisted_email_registers_as_admin() {
        let db = test_db();
        {
            let conn = db.lock().unwrap();
            conn.execute(
                "INSERT INTO allowed_admins (id, email, created_at) VALUES ('a', 'jefe@lavaseco.co', 'now')",
                [],
            )
            .unwrap();
        }
        register_and_verify(&db, "jefe@lavaseco.co", "secreto1");
        let LoginOutcome::Success { user } = login(&db, "jefe@lavaseco.co", "secreto1").unwrap()
        else {
            panic!("expected Success");
        };
        assert_eq!(user["role"], "ADMIN");
    }

    #[test]
    fn test_login_flow_after_verification() {
        let db = test_db();
        register_and_verify(&db, "ana@lavaseco.co", "secreto1");

        assert!(matches!(
            login(&db, "ana@lavaseco.co", "incorrecta"),
            Err(PosError::Unauthorized(_))
        ));
        let outcome = login(&db, "ana@lavaseco.co", "secreto1").unwrap();
        assert!(matches!(outcome, LoginOutcome::Success { .. }));
    }

    #[test]
    fn test_unverified_login_reissues_code() {
        let db = test_db();
        login(&db, "ana@lavaseco.co", "secreto1").unwrap();
        let again = login(&db, "ana@lavaseco.co", "secreto1").unwrap();
        assert!(matches!(again, LoginOutcome::VerifyNeeded { created: false, .. }));
    }

    #[test]
    fn test_verify_errors() {
        let db = test_db();
        assert!(matches!(
            verify(&db, "nadie@lavaseco.co", "123456"),
            Err(PosError::NotFound(_))
        ));
        login(&db, "ana@lavaseco.co", "secreto1").unwrap();
        assert!(matches!(
            verify(&db, "ana@lavaseco.co", "000000x"),
            Err(PosError::Validation(_))
        ));
    }

    #[test]
    fn test_resend_limit_then_lockout() {
        let db = test_db();
        login(&db, "ana@lavaseco.co", "secreto1").unwrap();
        let now = Utc::now();

        assert_eq!(resend_at(&db, "ana@lavaseco.co", now).unwrap().attempts_left, 2);
        assert_eq!(resend_at(&db, "ana@lavaseco.co", now).unwrap().attempts_left, 1);
        assert_eq!(resend_at(&db, "ana@lavaseco.co", now).unwrap().attempts_left, 0);

        // Fourth request trips the lockout.
        assert!(matches!(
            resend_at(&db, "ana@lavaseco.co", now),
            Err(PosError::RateLimited(_))
        ));
        // Still locked ten minutes later.
        assert!(matches!(
            resend_at(&db, "ana@lavaseco.co", now + Duration::minutes(10)),
            Err(PosError::RateLimited(_))
        ));
        // After the window the counter starts over.
        let after = resend_at(&db, "ana@lavaseco.co", now + Duration::minutes(16)).unwrap();
        assert_eq!(after.attempts_left, 2);
    }

    #[test]
    fn test_forgot_and_reset_password() {
        let db = test_db();
        register_and_verify(&db, "ana@lavaseco.co", "secreto1");

        assert_eq!(forgot_password(&db, "nadie@lavaseco.co").unwrap(), None);
        let code = forgot_password(&db, "ana@lavaseco.co").unwrap().unwrap();

        assert!(matches!(
            reset_password(&db, "ana@lavaseco.co", "999999x", "nueva123"),
            Err(PosError::Validation(_))
        ));
        assert!(matches!(
            reset_password(&db, "ana@lavaseco.co", &code, "corta"),
            Err(PosError::Validation(_))
        ));
        reset_password(&db, "ana@lavaseco.co", &code, "nueva123").unwrap();

        assert!(matches!(
            login(&db, "ana@lavaseco.co", "secreto1"),
            Err(PosError::Unauthorized(_))
        ));
        assert!(matches!(
            login(&db, "ana@lavaseco.co", "nueva123").unwrap(),
            LoginOutcome::Success { .. }
        ));
    }

    #[test]
    fn test_normalize_email() {
        assert_eq!(normalize_email(" A@B.co ").unwrap(), "a@b.co");
        assert!(normalize_email("sin-arroba").is_err());
        assert!(normalize_email("@b.co").is_err());
    }
}
