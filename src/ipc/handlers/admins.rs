use crate::auth::{self, Role};
use crate::directory::{self, AdminDesignation, NewUser, UserPatch};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{opt_str, req_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

fn handle_admins_create(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    info!(admin_id = %admin_id, "admin created");
    ok(&req.id, json!({ "adminId": admin_id, "userId": user_id }))
}

fn admin_row_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "adminId": r.get::<_, String>(0)?,
        "userId": r.get::<_, String>(1)?,
        "firstName": r.get::<_, String>(2)?,
        "middleName": r.get::<_, Option<String>>(3)?,
        "lastName": r.get::<_, Option<String>>(4)?,
        "email": r.get::<_, String>(5)?,
        "phone": r.get::<_, String>(6)?,
        "designation": r.get::<_, String>(7)?
    }))
}

const ADMIN_SELECT: &str = "SELECT a.id, u.id, u.first_name, u.middle_name, u.last_name,
        u.email, u.phone, a.designation
 FROM admins a JOIN users u ON u.id = a.user_id
 WHERE u.deleted_at IS NULL";

fn handle_admins_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let sql = format!("{ADMIN_SELECT} ORDER BY u.first_name");
    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |r| admin_row_json(r))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(admins) => ok(&req.id, json!({ "admins": admins })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_admins_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let admin_id = match req_str(&req.params, "adminId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let sql = format!("{ADMIN_SELECT} AND a.id = ?");
    match conn
        .query_row(&sql, [&admin_id], |r| admin_row_json(r))
        .optional()
    {
        Ok(Some(admin)) => ok(&req.id, admin),
        Ok(None) => err(&req.id, "not_found", "admin not found", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_admins_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let admin_id = match req_str(&req.params, "adminId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let Some(patch) = req.params.get("patch") else {
        return err(&req.id, "bad_params", "missing patch", None);
    };

    let user_id: Option<String> = match conn
        .query_row(
            "SELECT u.id FROM admins a JOIN users u ON u.id = a.user_id
             WHERE a.id = ? AND u.deleted_at IS NULL",
            [&admin_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(user_id) = user_id else {
        return err(&req.id, "not_found", "admin not found", None);
    };

    let designation = match patch.get("designation").and_then(|v| v.as_str()) {
        None => None,
        Some(raw) => match AdminDesignation::parse(raw) {
            Some(d) => Some(d),
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
    let user_patch = UserPatch::from_params(patch);

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = directory::apply_user_patch(
        &tx,
        &user_id,
        &user_patch,
        state.config.institute_domain.as_deref(),
    ) {
        let _ = tx.rollback();
        return HandlerErr::from(e).response(&req.id);
    }
    if let Some(d) = designation {
        if let Err(e) = tx.execute(
            "UPDATE admins SET designation = ? WHERE id = ?",
            (d.as_str(), &admin_id),
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "adminId": admin_id }))
}

fn handle_admins_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let admin_id = match req_str(&req.params, "adminId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let user_id: Option<String> = match conn
        .query_row("SELECT user_id FROM admins WHERE id = ?", [&admin_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(user_id) = user_id else {
        return err(&req.id, "not_found", "admin not found", None);
    };

    match directory::soft_delete_user(conn, &user_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "admin not found", None),
        Err(e) => return HandlerErr::from(e).response(&req.id),
    }
    if let Err(e) = auth::revoke_user_sessions(conn, &user_id) {
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }

    info!(admin_id = %admin_id, "admin soft-deleted");
    ok(&req.id, json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "admins.create" => Some(handle_admins_create(state, req)),
        "admins.list" => Some(handle_admins_list(state, req)),
        "admins.get" => Some(handle_admins_get(state, req)),
        "admins.update" => Some(handle_admins_update(state, req)),
        "admins.delete" => Some(handle_admins_delete(state, req)),
        _ => None,
    }
}
