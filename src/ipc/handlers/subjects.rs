use crate::db::is_unique_violation;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{now, opt_i64, req_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

const DEFAULT_MAX: i64 = 50;
const DEFAULT_PASSING: i64 = 20;

fn handle_subjects_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let title = match req_str(&req.params, "title") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let code = match req_str(&req.params, "code") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let internal_max = opt_i64(&req.params, "internalMax").unwrap_or(DEFAULT_MAX);
    let external_max = opt_i64(&req.params, "externalMax").unwrap_or(DEFAULT_MAX);
    let internal_passing = opt_i64(&req.params, "internalPassing").unwrap_or(DEFAULT_PASSING);
    let external_passing = opt_i64(&req.params, "externalPassing").unwrap_or(DEFAULT_PASSING);

    if internal_max <= 0 || external_max <= 0 || internal_passing < 0 || external_passing < 0 {
        return err(&req.id, "bad_params", "marks configuration must be non-negative", None);
    }
    if internal_passing > internal_max || external_passing > external_max {
        return err(
            &req.id,
            "bad_params",
            "passing marks cannot exceed maximum marks",
            Some(json!({
                "internalMax": internal_max,
                "internalPassing": internal_passing,
                "externalMax": external_max,
                "externalPassing": external_passing
            })),
        );
    }

    let subject_id = Uuid::new_v4().to_string();
    let ts = now();
    let inserted = conn.execute(
        "INSERT INTO subjects(id, title, code, internal_max, external_max,
                              internal_passing, external_passing, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &subject_id,
            &title,
            &code,
            internal_max,
            external_max,
            internal_passing,
            external_passing,
            &ts,
            &ts,
        ),
    );
    match inserted {
        Ok(_) => {}
        Err(e) if is_unique_violation(&e, "subjects.code") => {
            return err(&req.id, "code_conflict", "subject code already exists", None)
        }
        Err(e) => {
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "subjects" })),
            )
        }
    }

    info!(subject_id = %subject_id, code = %code, "subject created");
    ok(&req.id, json!({ "subjectId": subject_id, "code": code }))
}

fn subject_row_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "subjectId": r.get::<_, String>(0)?,
        "title": r.get::<_, String>(1)?,
        "code": r.get::<_, String>(2)?,
        "internalMax": r.get::<_, i64>(3)?,
        "externalMax": r.get::<_, i64>(4)?,
        "internalPassing": r.get::<_, i64>(5)?,
        "externalPassing": r.get::<_, i64>(6)?
    }))
}

fn handle_subjects_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let mut stmt = match conn.prepare(
        "SELECT id, title, code, internal_max, external_max, internal_passing, external_passing
         FROM subjects ORDER BY code",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |r| subject_row_json(r))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(subjects) => ok(&req.id, json!({ "subjects": subjects })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_subjects_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let subject_id = match req_str(&req.params, "subjectId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    match conn
        .query_row(
            "SELECT id, title, code, internal_max, external_max, internal_passing, external_passing
             FROM subjects WHERE id = ?",
            [&subject_id],
            |r| subject_row_json(r),
        )
        .optional()
    {
        Ok(Some(subject)) => ok(&req.id, subject),
        Ok(None) => err(&req.id, "subject_not_found", "subject not found", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_subjects_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let subject_id = match req_str(&req.params, "subjectId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let Some(patch) = req.params.get("patch") else {
        return err(&req.id, "bad_params", "missing patch", None);
    };

    let current: Option<(i64, i64, i64, i64)> = match conn
        .query_row(
            "SELECT internal_max, external_max, internal_passing, external_passing
             FROM subjects WHERE id = ?",
            [&subject_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((cur_imax, cur_emax, cur_ipass, cur_epass)) = current else {
        return err(&req.id, "subject_not_found", "subject not found", None);
    };

    let internal_max = opt_i64(patch, "internalMax").unwrap_or(cur_imax);
    let external_max = opt_i64(patch, "externalMax").unwrap_or(cur_emax);
    let internal_passing = opt_i64(patch, "internalPassing").unwrap_or(cur_ipass);
    let external_passing = opt_i64(patch, "externalPassing").unwrap_or(cur_epass);
    if internal_passing > internal_max || external_passing > external_max {
        return err(
            &req.id,
            "bad_params",
            "passing marks cannot exceed maximum marks",
            None,
        );
    }
    let title = patch.get("title").and_then(|v| v.as_str()).map(String::from);

    let updated = conn.execute(
        "UPDATE subjects SET
            title = COALESCE(?, title),
            internal_max = ?, external_max = ?,
            internal_passing = ?, external_passing = ?,
            updated_at = ?
         WHERE id = ?",
        (
            title,
            internal_max,
            external_max,
            internal_passing,
            external_passing,
            now(),
            &subject_id,
        ),
    );
    match updated {
        Ok(_) => ok(&req.id, json!({ "subjectId": subject_id })),
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

fn handle_subjects_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let subject_id = match req_str(&req.params, "subjectId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    // Refuse deletion while marks or assignments still reference the subject.
    let referenced: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM student_marks WHERE subject_id = ?
             UNION SELECT 1 FROM subject_semester_branches WHERE subject_id = ?",
            (&subject_id, &subject_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if referenced.is_some() {
        return err(
            &req.id,
            "subject_in_use",
            "subject has recorded marks or assignments",
            None,
        );
    }

    match conn.execute("DELETE FROM subjects WHERE id = ?", [&subject_id]) {
        Ok(0) => err(&req.id, "subject_not_found", "subject not found", None),
        Ok(_) => {
            info!(subject_id = %subject_id, "subject deleted");
            ok(&req.id, json!({ "deleted": true }))
        }
        Err(e) => err(&req.id, "db_delete_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "subjects.create" => Some(handle_subjects_create(state, req)),
        "subjects.list" => Some(handle_subjects_list(state, req)),
        "subjects.get" => Some(handle_subjects_get(state, req)),
        "subjects.update" => Some(handle_subjects_update(state, req)),
        "subjects.delete" => Some(handle_subjects_delete(state, req)),
        _ => None,
    }
}
