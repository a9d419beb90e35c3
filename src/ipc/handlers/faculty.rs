use crate::auth::{self, Role};
use crate::directory::{self, FacultyDesignation, NewUser, UserPatch};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{opt_str, req_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

fn branch_exists(conn: &Connection, branch_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row(
        "SELECT 1 FROM branches WHERE id = ? AND deleted_at IS NULL",
        [branch_id],
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(HandlerErr::db_query)
}

fn handle_faculty_create(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let branch_id = match req_str(&req.params, "branchId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let middle_name = opt_str(&req.params, "middleName");
    let last_name = opt_str(&req.params, "lastName");
    let designation = match opt_str(&req.params, "designation") {
        None => FacultyDesignation::Lecturer,
        Some(raw) => match FacultyDesignation::parse(&raw) {
            Some(d) => d,
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "unknown faculty designation",
                    Some(json!({ "designation": raw })),
                )
            }
        },
    };

    match branch_exists(conn, &branch_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "branch_not_found", "branch not found", None),
        Err(e) => return e.response(&req.id),
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
        role: Role::Faculty,
    };
    let user_id = match directory::insert_user(&tx, &new_user, state.config.institute_domain.as_deref())
    {
        Ok(v) => v,
        Err(e) => {
            let _ = tx.rollback();
            return HandlerErr::from(e).response(&req.id);
        }
    };

    let faculty_id = Uuid::new_v4().to_string();
    if let Err(e) = tx.execute(
        "INSERT INTO faculty(id, user_id, designation, branch_id) VALUES(?, ?, ?, ?)",
        (&faculty_id, &user_id, designation.as_str(), &branch_id),
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "faculty" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    info!(faculty_id = %faculty_id, "faculty member created");
    ok(&req.id, json!({ "facultyId": faculty_id, "userId": user_id }))
}

fn faculty_row_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "facultyId": r.get::<_, String>(0)?,
        "userId": r.get::<_, String>(1)?,
        "firstName": r.get::<_, String>(2)?,
        "middleName": r.get::<_, Option<String>>(3)?,
        "lastName": r.get::<_, Option<String>>(4)?,
        "email": r.get::<_, String>(5)?,
        "phone": r.get::<_, String>(6)?,
        "designation": r.get::<_, String>(7)?,
        "branchId": r.get::<_, String>(8)?,
        "branch": r.get::<_, String>(9)?
    }))
}

const FACULTY_SELECT: &str = "SELECT f.id, u.id, u.first_name, u.middle_name, u.last_name,
        u.email, u.phone, f.designation, b.id, b.title
 FROM faculty f
 JOIN users u ON u.id = f.user_id
 JOIN branches b ON b.id = f.branch_id
 WHERE u.deleted_at IS NULL";

fn handle_faculty_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let sql = format!("{FACULTY_SELECT} ORDER BY u.first_name");
    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |r| faculty_row_json(r))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(faculty) => ok(&req.id, json!({ "faculty": faculty })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_faculty_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let faculty_id = match req_str(&req.params, "facultyId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let sql = format!("{FACULTY_SELECT} AND f.id = ?");
    match conn
        .query_row(&sql, [&faculty_id], |r| faculty_row_json(r))
        .optional()
    {
        Ok(Some(row)) => ok(&req.id, row),
        Ok(None) => err(&req.id, "not_found", "faculty member not found", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_faculty_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let faculty_id = match req_str(&req.params, "facultyId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let Some(patch) = req.params.get("patch") else {
        return err(&req.id, "bad_params", "missing patch", None);
    };

    let user_id: Option<String> = match conn
        .query_row(
            "SELECT u.id FROM faculty f JOIN users u ON u.id = f.user_id
             WHERE f.id = ? AND u.deleted_at IS NULL",
            [&faculty_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(user_id) = user_id else {
        return err(&req.id, "not_found", "faculty member not found", None);
    };

    let designation = match patch.get("designation").and_then(|v| v.as_str()) {
        None => None,
        Some(raw) => match FacultyDesignation::parse(raw) {
            Some(d) => Some(d),
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "unknown faculty designation",
                    Some(json!({ "designation": raw })),
                )
            }
        },
    };
    let branch_id = patch.get("branchId").and_then(|v| v.as_str()).map(String::from);
    if let Some(branch_id) = &branch_id {
        match branch_exists(conn, branch_id) {
            Ok(true) => {}
            Ok(false) => return err(&req.id, "branch_not_found", "branch not found", None),
            Err(e) => return e.response(&req.id),
        }
    }
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
            "UPDATE faculty SET designation = ? WHERE id = ?",
            (d.as_str(), &faculty_id),
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(b) = branch_id {
        if let Err(e) = tx.execute(
            "UPDATE faculty SET branch_id = ? WHERE id = ?",
            (&b, &faculty_id),
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "facultyId": faculty_id }))
}

fn handle_faculty_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let faculty_id = match req_str(&req.params, "facultyId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let user_id: Option<String> = match conn
        .query_row(
            "SELECT user_id FROM faculty WHERE id = ?",
            [&faculty_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(user_id) = user_id else {
        return err(&req.id, "not_found", "faculty member not found", None);
    };

    match directory::soft_delete_user(conn, &user_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "faculty member not found", None),
        Err(e) => return HandlerErr::from(e).response(&req.id),
    }
    if let Err(e) = auth::revoke_user_sessions(conn, &user_id) {
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }

    info!(faculty_id = %faculty_id, "faculty member soft-deleted");
    ok(&req.id, json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "faculty.create" => Some(handle_faculty_create(state, req)),
        "faculty.list" => Some(handle_faculty_list(state, req)),
        "faculty.get" => Some(handle_faculty_get(state, req)),
        "faculty.update" => Some(handle_faculty_update(state, req)),
        "faculty.delete" => Some(handle_faculty_delete(state, req)),
        _ => None,
    }
}
