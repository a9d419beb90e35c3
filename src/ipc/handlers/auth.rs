use crate::auth::{self, Role};
use crate::directory::{self, AdminDesignation, NewUser};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{opt_str, req_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

/// Creates the very first admin. Once any admin row exists the endpoint is
/// closed; further admins come from admins.create or the create-admin CLI.
fn handle_signup(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let first_name = match req_str(&req.params, "firstName") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let email = match req_str(&req.params, "email") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let phone = match req_str(&req.params, "phone") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let password = match req_str(&req.params, "password") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let middle_name = opt_str(&req.params, "middleName");
    let last_name = opt_str(&req.params, "lastName");
    let designation = match opt_str(&req.params, "designation") {
        None => AdminDesignation::Principal,
        Some(raw) => match AdminDesignation::parse(&raw) {
            Some(d) => d,
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "unknown admin designation",
                    Some(json!({ "designation": raw })),
                )
            }
        },
    };

    let existing: Option<i64> = match conn
        .query_row("SELECT 1 FROM admins LIMIT 1", [], |r| r.get(0))
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if existing.is_some() {
        return err(&req.id, "admin_exists", "an admin account already exists", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let new_user = NewUser {
        first_name: &first_name,
        middle_name: middle_name.as_deref(),
        last_name: last_name.as_deref(),
        email: &email,
        phone: &phone,
        password: &password,
        role: Role::Admin,
    };
    let user_id = match directory::insert_user(&tx, &new_user, state.config.institute_domain.as_deref())
    {
        Ok(v) => v,
        Err(e) => {
            let _ = tx.rollback();
            return HandlerErr::from(e).response(&req.id);
        }
    };

    let admin_id = Uuid::new_v4().to_string();
    if let Err(e) = tx.execute(
        "INSERT INTO admins(id, user_id, designation) VALUES(?, ?, ?)",
        (&admin_id, &user_id, designation.as_str()),
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "admins" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    info!(admin_id = %admin_id, "first admin created via signup");
    ok(&req.id, json!({ "adminId": admin_id, "userId": user_id }))
}

fn handle_login(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let email = match req_str(&req.params, "email") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let password = match req_str(&req.params, "password") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let row: Option<(String, String, String, String)> = match conn
        .query_row(
            "SELECT id, first_name, password_hash, role
             FROM users WHERE email = ? AND deleted_at IS NULL",
            [&email],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((user_id, first_name, password_hash, role)) = row else {
        return err(&req.id, "user_not_found", "no account for that email", None);
    };

    if !auth::verify_password(&password, &password_hash) {
        warn!(email = %email, "failed login attempt");
        return err(&req.id, "invalid_credentials", "incorrect password", None);
    }

    let (token, expires_at) = match auth::issue_session(conn, &user_id, &state.config) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_insert_failed", e.to_string(), None),
    };

    info!(user_id = %user_id, "session issued");
    ok(
        &req.id,
        json!({
            "token": token,
            "expiresAt": expires_at.to_rfc3339(),
            "user": {
                "id": user_id,
                "firstName": first_name,
                "email": email,
                "role": role
            }
        }),
    )
}

fn handle_me(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    // The router already gated this call; re-resolve for the identity.
    let user = match req
        .token
        .as_deref()
        .map(|t| auth::authenticate(conn, t, &state.config))
    {
        Some(Ok(Some(u))) => u,
        Some(Ok(None)) | None => {
            return err(&req.id, "unauthenticated", "invalid or expired session", None)
        }
        Some(Err(e)) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let profile = conn.query_row(
        "SELECT first_name, middle_name, last_name, email, phone, role
         FROM users WHERE id = ? AND deleted_at IS NULL",
        [&user.user_id],
        |r| {
            Ok(json!({
                "id": user.user_id,
                "firstName": r.get::<_, String>(0)?,
                "middleName": r.get::<_, Option<String>>(1)?,
                "lastName": r.get::<_, Option<String>>(2)?,
                "email": r.get::<_, String>(3)?,
                "phone": r.get::<_, String>(4)?,
                "role": r.get::<_, String>(5)?
            }))
        },
    );
    let mut profile = match profile {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    // Attach the role extension summary.
    let extension = match user.role {
        Role::Admin => conn
            .query_row(
                "SELECT id, designation FROM admins WHERE user_id = ?",
                [&user.user_id],
                |r| {
                    Ok(json!({
                        "adminId": r.get::<_, String>(0)?,
                        "designation": r.get::<_, String>(1)?
                    }))
                },
            )
            .optional(),
        Role::Faculty => conn
            .query_row(
                "SELECT f.id, f.designation, b.title
                 FROM faculty f JOIN branches b ON b.id = f.branch_id
                 WHERE f.user_id = ?",
                [&user.user_id],
                |r| {
                    Ok(json!({
                        "facultyId": r.get::<_, String>(0)?,
                        "designation": r.get::<_, String>(1)?,
                        "branch": r.get::<_, String>(2)?
                    }))
                },
            )
            .optional(),
        Role::Student => conn
            .query_row(
                "SELECT s.id, s.registration_number, sem.title
                 FROM students s JOIN semesters sem ON sem.id = s.current_semester_id
                 WHERE s.user_id = ?",
                [&user.user_id],
                |r| {
                    Ok(json!({
                        "studentId": r.get::<_, String>(0)?,
                        "registrationNumber": r.get::<_, i64>(1)?,
                        "currentSemester": r.get::<_, String>(2)?
                    }))
                },
            )
            .optional(),
    };
    match extension {
        Ok(Some(ext)) => profile["extension"] = ext,
        Ok(None) => {}
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    ok(&req.id, profile)
}

fn handle_logout(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(token) = req.token.as_deref() else {
        return err(&req.id, "unauthenticated", "missing session token", None);
    };
    match auth::revoke_session(conn, token) {
        Ok(revoked) => ok(&req.id, json!({ "loggedOut": revoked })),
        Err(e) => return err(&req.id, "db_delete_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "auth.signup" => Some(handle_signup(state, req)),
        "auth.login" => Some(handle_login(state, req)),
        "auth.me" => Some(handle_me(state, req)),
        "auth.logout" => Some(handle_logout(state, req)),
        _ => None,
    }
}
