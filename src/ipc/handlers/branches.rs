use crate::db::is_unique_violation;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{now, req_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

fn handle_branches_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let title = match req_str(&req.params, "title") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let branch_id = Uuid::new_v4().to_string();
    let ts = now();
    let inserted = conn.execute(
        "INSERT INTO branches(id, title, created_at, updated_at) VALUES(?, ?, ?, ?)",
        (&branch_id, &title, &ts, &ts),
    );
    match inserted {
        Ok(_) => {}
        Err(e) if is_unique_violation(&e, "branches.title") => {
            return err(&req.id, "title_conflict", "branch title already exists", None)
        }
        Err(e) => {
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "branches" })),
            )
        }
    }

    info!(branch_id = %branch_id, title = %title, "branch created");
    ok(&req.id, json!({ "branchId": branch_id, "title": title }))
}

fn handle_branches_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let mut stmt = match conn.prepare(
        "SELECT b.id, b.title,
           (SELECT COUNT(*) FROM batches bt WHERE bt.branch_id = b.id) AS batch_count
         FROM branches b
         WHERE b.deleted_at IS NULL
         ORDER BY b.title",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |r| {
            Ok(json!({
                "branchId": r.get::<_, String>(0)?,
                "title": r.get::<_, String>(1)?,
                "batchCount": r.get::<_, i64>(2)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(branches) => ok(&req.id, json!({ "branches": branches })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_branches_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let branch_id = match req_str(&req.params, "branchId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    match conn
        .query_row(
            "SELECT id, title, created_at FROM branches
             WHERE id = ? AND deleted_at IS NULL",
            [&branch_id],
            |r| {
                Ok(json!({
                    "branchId": r.get::<_, String>(0)?,
                    "title": r.get::<_, String>(1)?,
                    "createdAt": r.get::<_, String>(2)?
                }))
            },
        )
        .optional()
    {
        Ok(Some(branch)) => ok(&req.id, branch),
        Ok(None) => err(&req.id, "branch_not_found", "branch not found", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_branches_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let branch_id = match req_str(&req.params, "branchId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let title = match req_str(&req.params, "title") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let updated = conn.execute(
        "UPDATE branches SET title = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
        (&title, now(), &branch_id),
    );
    match updated {
        Ok(0) => err(&req.id, "branch_not_found", "branch not found", None),
        Ok(_) => ok(&req.id, json!({ "branchId": branch_id, "title": title })),
        Err(e) if is_unique_violation(&e, "branches.title") => {
            err(&req.id, "title_conflict", "branch title already exists", None)
        }
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

fn handle_branches_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let branch_id = match req_str(&req.params, "branchId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    match conn.execute(
        "UPDATE branches SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL",
        (now(), &branch_id),
    ) {
        Ok(0) => err(&req.id, "branch_not_found", "branch not found", None),
        Ok(_) => {
            info!(branch_id = %branch_id, "branch soft-deleted");
            ok(&req.id, json!({ "deleted": true }))
        }
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "branches.create" => Some(handle_branches_create(state, req)),
        "branches.list" => Some(handle_branches_list(state, req)),
        "branches.get" => Some(handle_branches_get(state, req)),
        "branches.update" => Some(handle_branches_update(state, req)),
        "branches.delete" => Some(handle_branches_delete(state, req)),
        _ => None,
    }
}
