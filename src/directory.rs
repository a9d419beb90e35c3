//! User/role directory: the base identity row shared by admins, faculty and
//! students, plus the closed designation sets per staff role. Role extension
//! rows live with their handlers; everything touching `users` goes through
//! here so conflict and email-domain policy stay in one place.

use chrono::Utc;
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use uuid::Uuid;

use crate::auth::{self, Role};
use crate::db::is_unique_violation;

#[derive(Debug)]
pub enum DirectoryError {
    EmailConflict,
    PhoneConflict,
    EmailDomainNotAllowed,
    Db(rusqlite::Error),
    Hash(String),
}

impl std::fmt::Display for DirectoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DirectoryError::EmailConflict => write!(f, "email already in use"),
            DirectoryError::PhoneConflict => write!(f, "phone already in use"),
            DirectoryError::EmailDomainNotAllowed => {
                write!(f, "email domain not allowed for this institute")
            }
            DirectoryError::Db(e) => write!(f, "database error: {e}"),
            DirectoryError::Hash(m) => write!(f, "password hashing error: {m}"),
        }
    }
}

impl std::error::Error for DirectoryError {}

impl From<rusqlite::Error> for DirectoryError {
    fn from(e: rusqlite::Error) -> Self {
        DirectoryError::Db(e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminDesignation {
    Principal,
    Hod,
    Maintenance,
}

impl AdminDesignation {
    pub fn as_str(self) -> &'static str {
        match self {
            AdminDesignation::Principal => "principal",
            AdminDesignation::Hod => "hod",
            AdminDesignation::Maintenance => "maintenance",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "principal" => Some(AdminDesignation::Principal),
            "hod" => Some(AdminDesignation::Hod),
            "maintenance" => Some(AdminDesignation::Maintenance),
            _ => None,
        }
    }
}

// The faculty set is distinct from the admin set; the two are not
// interchangeable even where the titles overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacultyDesignation {
    Lecturer,
    Tutor,
    Hod,
}

impl FacultyDesignation {
    pub fn as_str(self) -> &'static str {
        match self {
            FacultyDesignation::Lecturer => "lecturer",
            FacultyDesignation::Tutor => "tutor",
            FacultyDesignation::Hod => "hod",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "lecturer" => Some(FacultyDesignation::Lecturer),
            "tutor" => Some(FacultyDesignation::Tutor),
            "hod" => Some(FacultyDesignation::Hod),
            _ => None,
        }
    }
}

pub struct NewUser<'a> {
    pub first_name: &'a str,
    pub middle_name: Option<&'a str>,
    pub last_name: Option<&'a str>,
    pub email: &'a str,
    pub phone: &'a str,
    pub password: &'a str,
    pub role: Role,
}

pub fn check_email_domain(domain: Option<&str>, email: &str) -> Result<(), DirectoryError> {
    let Some(domain) = domain else {
        return Ok(());
    };
    let allowed = email
        .rsplit_once('@')
        .map(|(_, d)| d.eq_ignore_ascii_case(domain))
        .unwrap_or(false);
    if allowed {
        Ok(())
    } else {
        Err(DirectoryError::EmailDomainNotAllowed)
    }
}

/// Pre-checks email/phone uniqueness across all users (soft-deleted rows
/// still hold their unique claim). `exclude_user_id` exempts the row being
/// updated.
pub fn check_contact_conflicts(
    conn: &Connection,
    email: Option<&str>,
    phone: Option<&str>,
    exclude_user_id: Option<&str>,
) -> Result<(), DirectoryError> {
    let exclude = exclude_user_id.unwrap_or("");
    if let Some(email) = email {
        let hit: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM users WHERE email = ? AND id != ?",
                (email, exclude),
                |r| r.get(0),
            )
            .optional()?;
        if hit.is_some() {
            return Err(DirectoryError::EmailConflict);
        }
    }
    if let Some(phone) = phone {
        let hit: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM users WHERE phone = ? AND id != ?",
                (phone, exclude),
                |r| r.get(0),
            )
            .optional()?;
        if hit.is_some() {
            return Err(DirectoryError::PhoneConflict);
        }
    }
    Ok(())
}

/// Inserts the base user row (hashed password) and returns its id. The
/// caller owns the surrounding transaction that adds the role extension row.
pub fn insert_user(
    conn: &Connection,
    user: &NewUser<'_>,
    institute_domain: Option<&str>,
) -> Result<String, DirectoryError> {
    check_email_domain(institute_domain, user.email)?;
    check_contact_conflicts(conn, Some(user.email), Some(user.phone), None)?;

    let password_hash =
        auth::hash_password(user.password).map_err(|e| DirectoryError::Hash(e.to_string()))?;
    let user_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();

    let inserted = conn.execute(
        "INSERT INTO users(id, first_name, middle_name, last_name, email, phone,
                           password_hash, role, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &user_id,
            user.first_name,
            user.middle_name,
            user.last_name,
            user.email,
            user.phone,
            &password_hash,
            user.role.as_str(),
            &now,
            &now,
        ),
    );
    match inserted {
        Ok(_) => Ok(user_id),
        // Lost a race with a concurrent insert: same outcome as the pre-check.
        Err(e) if is_unique_violation(&e, "users.email") => Err(DirectoryError::EmailConflict),
        Err(e) if is_unique_violation(&e, "users.phone") => Err(DirectoryError::PhoneConflict),
        Err(e) => Err(DirectoryError::Db(e)),
    }
}

#[derive(Debug, Default)]
pub struct UserPatch {
    pub first_name: Option<String>,
    pub middle_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub password: Option<String>,
}

impl UserPatch {
    pub fn from_params(params: &serde_json::Value) -> Self {
        let get = |key: &str| {
            params
                .get(key)
                .and_then(|v| v.as_str())
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        Self {
            first_name: get("firstName"),
            middle_name: get("middleName"),
            last_name: get("lastName"),
            email: get("email"),
            phone: get("phone"),
            password: get("password"),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.first_name.is_none()
            && self.middle_name.is_none()
            && self.last_name.is_none()
            && self.email.is_none()
            && self.phone.is_none()
            && self.password.is_none()
    }
}

/// Applies the present fields of a partial update to the base user row.
pub fn apply_user_patch(
    conn: &Connection,
    user_id: &str,
    patch: &UserPatch,
    institute_domain: Option<&str>,
) -> Result<(), DirectoryError> {
    if patch.is_empty() {
        return Ok(());
    }
    if let Some(email) = &patch.email {
        check_email_domain(institute_domain, email)?;
    }
    check_contact_conflicts(
        conn,
        patch.email.as_deref(),
        patch.phone.as_deref(),
        Some(user_id),
    )?;

    let mut sets: Vec<&str> = Vec::new();
    let mut vals: Vec<Value> = Vec::new();
    if let Some(v) = &patch.first_name {
        sets.push("first_name = ?");
        vals.push(v.clone().into());
    }
    if let Some(v) = &patch.middle_name {
        sets.push("middle_name = ?");
        vals.push(v.clone().into());
    }
    if let Some(v) = &patch.last_name {
        sets.push("last_name = ?");
        vals.push(v.clone().into());
    }
    if let Some(v) = &patch.email {
        sets.push("email = ?");
        vals.push(v.clone().into());
    }
    if let Some(v) = &patch.phone {
        sets.push("phone = ?");
        vals.push(v.clone().into());
    }
    if let Some(v) = &patch.password {
        let hash = auth::hash_password(v).map_err(|e| DirectoryError::Hash(e.to_string()))?;
        sets.push("password_hash = ?");
        vals.push(hash.into());
    }
    sets.push("updated_at = ?");
    vals.push(Utc::now().to_rfc3339().into());
    vals.push(user_id.to_string().into());

    let sql = format!("UPDATE users SET {} WHERE id = ?", sets.join(", "));
    conn.execute(&sql, params_from_iter(vals))?;
    Ok(())
}

/// Soft delete: the row keeps its unique email/phone claim but disappears
/// from every read. Returns false when no live row matched.
pub fn soft_delete_user(conn: &Connection, user_id: &str) -> Result<bool, DirectoryError> {
    let n = conn.execute(
        "UPDATE users SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL",
        (Utc::now().to_rfc3339(), user_id),
    )?;
    Ok(n > 0)
}
