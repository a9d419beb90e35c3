use argon2::password_hash::{
    rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
};
use argon2::Argon2;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Faculty,
    Student,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Faculty => "faculty",
            Role::Student => "student",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "admin" => Some(Role::Admin),
            "faculty" => Some(Role::Faculty),
            "student" => Some(Role::Student),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
    pub role: Role,
}

pub fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("password hashing failed: {e}"))?;
    Ok(hash.to_string())
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

/// Sessions store a sha256 digest of the opaque token, never the token.
pub fn token_digest(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn issue_session(
    conn: &Connection,
    user_id: &str,
    cfg: &Config,
) -> anyhow::Result<(String, DateTime<Utc>)> {
    let token = Uuid::new_v4().to_string();
    let expires_at = Utc::now() + Duration::days(cfg.session_ttl_days);
    conn.execute(
        "INSERT INTO sessions(id, token_hash, user_id, expires_at) VALUES(?, ?, ?, ?)",
        (
            Uuid::new_v4().to_string(),
            token_digest(&token),
            user_id,
            expires_at.to_rfc3339(),
        ),
    )?;
    Ok((token, expires_at))
}

/// Resolves a presented token to its user. Expired sessions are deleted
/// at read time; sessions close to expiry get a sliding renewal.
pub fn authenticate(conn: &Connection, token: &str, cfg: &Config) -> anyhow::Result<Option<AuthUser>> {
    let digest = token_digest(token);
    let row: Option<(String, String, String, String)> = conn
        .query_row(
            "SELECT s.id, s.expires_at, u.id, u.role
             FROM sessions s
             JOIN users u ON u.id = s.user_id
             WHERE s.token_hash = ? AND u.deleted_at IS NULL",
            [&digest],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()?;

    let Some((session_id, expires_raw, user_id, role_raw)) = row else {
        return Ok(None);
    };

    let expires_at = DateTime::parse_from_rfc3339(&expires_raw)?.with_timezone(&Utc);
    let now = Utc::now();
    if expires_at <= now {
        conn.execute("DELETE FROM sessions WHERE id = ?", [&session_id])?;
        return Ok(None);
    }
    if expires_at - now <= Duration::days(cfg.session_renew_days) {
        let renewed = now + Duration::days(cfg.session_ttl_days);
        conn.execute(
            "UPDATE sessions SET expires_at = ? WHERE id = ?",
            (renewed.to_rfc3339(), &session_id),
        )?;
    }

    let Some(role) = Role::parse(&role_raw) else {
        return Ok(None);
    };
    Ok(Some(AuthUser { user_id, role }))
}

/// Deletes the session for a presented token. Returns whether a row matched.
pub fn revoke_session(conn: &Connection, token: &str) -> anyhow::Result<bool> {
    let n = conn.execute(
        "DELETE FROM sessions WHERE token_hash = ?",
        [token_digest(token)],
    )?;
    Ok(n > 0)
}

/// Drops every session of a user, e.g. after a soft delete.
pub fn revoke_user_sessions(conn: &Connection, user_id: &str) -> anyhow::Result<()> {
    conn.execute("DELETE FROM sessions WHERE user_id = ?", [user_id])?;
    Ok(())
}
