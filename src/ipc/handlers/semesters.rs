use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{now, opt_str, req_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

/// Standalone semester, not linked to any batch. Batch-owned semesters are
/// provisioned by batches.create only.
fn handle_semesters_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let title = match req_str(&req.params, "title") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let start_date = opt_str(&req.params, "startDate");
    let end_date = opt_str(&req.params, "endDate");

    let semester_id = Uuid::new_v4().to_string();
    let ts = now();
    if let Err(e) = conn.execute(
        "INSERT INTO semesters(id, title, start_date, end_date, batch_id, created_at, updated_at)
         VALUES(?, ?, ?, ?, NULL, ?, ?)",
        (&semester_id, &title, &start_date, &end_date, &ts, &ts),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "semesters" })),
        );
    }

    info!(semester_id = %semester_id, "semester created");
    ok(&req.id, json!({ "semesterId": semester_id, "title": title }))
}

fn handle_semesters_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let mut stmt = match conn.prepare(
        "SELECT id, title, start_date, end_date, batch_id
         FROM semesters
         ORDER BY created_at, CAST(title AS INTEGER)",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |r| {
            Ok(json!({
                "semesterId": r.get::<_, String>(0)?,
                "title": r.get::<_, String>(1)?,
                "startDate": r.get::<_, Option<String>>(2)?,
                "endDate": r.get::<_, Option<String>>(3)?,
                "batchId": r.get::<_, Option<String>>(4)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(semesters) => ok(&req.id, json!({ "semesters": semesters })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_semesters_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let semester_id = match req_str(&req.params, "semesterId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let semester = match conn
        .query_row(
            "SELECT id, title, start_date, end_date, batch_id
             FROM semesters WHERE id = ?",
            [&semester_id],
            |r| {
                Ok(json!({
                    "semesterId": r.get::<_, String>(0)?,
                    "title": r.get::<_, String>(1)?,
                    "startDate": r.get::<_, Option<String>>(2)?,
                    "endDate": r.get::<_, Option<String>>(3)?,
                    "batchId": r.get::<_, Option<String>>(4)?
                }))
            },
        )
        .optional()
    {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "semester_not_found", "semester not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    // Assigned subjects with the branch each assignment is scoped to.
    let mut stmt = match conn.prepare(
        "SELECT sub.id, sub.title, sub.code, b.title
         FROM subject_semester_branches ssb
         JOIN subjects sub ON sub.id = ssb.subject_id
         JOIN branches b ON b.id = ssb.branch_id
         WHERE ssb.semester_id = ?
         ORDER BY sub.code",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let subjects = stmt
        .query_map([&semester_id], |r| {
            Ok(json!({
                "subjectId": r.get::<_, String>(0)?,
                "title": r.get::<_, String>(1)?,
                "code": r.get::<_, String>(2)?,
                "branch": r.get::<_, String>(3)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match subjects {
        Ok(subjects) => {
            let mut result = semester;
            result["subjects"] = json!(subjects);
            ok(&req.id, result)
        }
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_semesters_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let semester_id = match req_str(&req.params, "semesterId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let title = opt_str(&req.params, "title");
    let start_date = opt_str(&req.params, "startDate");
    let end_date = opt_str(&req.params, "endDate");
    if title.is_none() && start_date.is_none() && end_date.is_none() {
        return err(&req.id, "bad_params", "nothing to update", None);
    }

    let updated = conn.execute(
        "UPDATE semesters SET
            title = COALESCE(?, title),
            start_date = COALESCE(?, start_date),
            end_date = COALESCE(?, end_date),
            updated_at = ?
         WHERE id = ?",
        (&title, &start_date, &end_date, now(), &semester_id),
    );
    match updated {
        Ok(0) => err(&req.id, "semester_not_found", "semester not found", None),
        Ok(_) => ok(&req.id, json!({ "semesterId": semester_id })),
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

fn handle_semesters_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let semester_id = match req_str(&req.params, "semesterId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    // Batch-owned semesters and semesters with history stay.
    let blocked: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM semesters WHERE id = ?1 AND batch_id IS NOT NULL
             UNION SELECT 1 FROM student_marks WHERE semester_id = ?1
             UNION SELECT 1 FROM student_semesters WHERE semester_id = ?1",
            [&semester_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if blocked.is_some() {
        return err(
            &req.id,
            "semester_in_use",
            "semester belongs to a batch or has recorded history",
            None,
        );
    }

    match conn.execute("DELETE FROM semesters WHERE id = ?", [&semester_id]) {
        Ok(0) => err(&req.id, "semester_not_found", "semester not found", None),
        Ok(_) => {
            info!(semester_id = %semester_id, "semester deleted");
            ok(&req.id, json!({ "deleted": true }))
        }
        Err(e) => err(&req.id, "db_delete_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "semesters.create" => Some(handle_semesters_create(state, req)),
        "semesters.list" => Some(handle_semesters_list(state, req)),
        "semesters.get" => Some(handle_semesters_get(state, req)),
        "semesters.update" => Some(handle_semesters_update(state, req)),
        "semesters.delete" => Some(handle_semesters_delete(state, req)),
        _ => None,
    }
}
