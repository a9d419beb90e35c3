use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{now, opt_str, req_i64, req_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchType {
    Regular,
    Ptd,
}

impl BatchType {
    fn as_str(self) -> &'static str {
        match self {
            BatchType::Regular => "regular",
            BatchType::Ptd => "ptd",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "regular" => Some(BatchType::Regular),
            "ptd" => Some(BatchType::Ptd),
            _ => None,
        }
    }

    /// Regular batches run 6 semesters; part-time-day batches run 8.
    fn semester_count(self) -> usize {
        match self {
            BatchType::Regular => 6,
            BatchType::Ptd => 8,
        }
    }
}

/// Creates a batch and fans out its semesters ("1".."N") in one
/// transaction; each semester is also associated with the batch's branch.
fn handle_batches_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let branch_id = match req_str(&req.params, "branchId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let start_year = match req_i64(&req.params, "startYear") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let end_year = match req_i64(&req.params, "endYear") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if end_year < start_year {
        return err(&req.id, "bad_params", "endYear is before startYear", None);
    }
    let batch_type = match opt_str(&req.params, "type") {
        None => BatchType::Regular,
        Some(raw) => match BatchType::parse(&raw) {
            Some(t) => t,
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "type must be one of: regular, ptd",
                    Some(json!({ "type": raw })),
                )
            }
        },
    };

    let branch: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM branches WHERE id = ? AND deleted_at IS NULL",
            [&branch_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if branch.is_none() {
        return err(&req.id, "branch_not_found", "branch not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let batch_id = Uuid::new_v4().to_string();
    let ts = now();
    if let Err(e) = tx.execute(
        "INSERT INTO batches(id, branch_id, start_year, end_year, type, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &batch_id,
            &branch_id,
            start_year,
            end_year,
            batch_type.as_str(),
            &ts,
            &ts,
        ),
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "batches" })),
        );
    }

    let mut semester_ids = Vec::with_capacity(batch_type.semester_count());
    for n in 1..=batch_type.semester_count() {
        let semester_id = Uuid::new_v4().to_string();
        if let Err(e) = tx.execute(
            "INSERT INTO semesters(id, title, batch_id, created_at, updated_at)
             VALUES(?, ?, ?, ?, ?)",
            (&semester_id, n.to_string(), &batch_id, &ts, &ts),
        ) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "semesters" })),
            );
        }
        if let Err(e) = tx.execute(
            "INSERT INTO semester_branches(semester_id, branch_id) VALUES(?, ?)",
            (&semester_id, &branch_id),
        ) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "semester_branches" })),
            );
        }
        semester_ids.push(semester_id);
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    info!(
        batch_id = %batch_id,
        semesters = semester_ids.len(),
        "batch provisioned"
    );
    ok(
        &req.id,
        json!({ "batchId": batch_id, "semesterIds": semester_ids }),
    )
}

fn handle_batches_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let mut stmt = match conn.prepare(
        "SELECT bt.id, bt.branch_id, b.title, bt.start_year, bt.end_year, bt.type,
           (SELECT COUNT(*) FROM students s WHERE s.batch_id = bt.id) AS student_count
         FROM batches bt
         JOIN branches b ON b.id = bt.branch_id
         WHERE b.deleted_at IS NULL
         ORDER BY bt.start_year, b.title",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |r| {
            Ok(json!({
                "batchId": r.get::<_, String>(0)?,
                "branchId": r.get::<_, String>(1)?,
                "branch": r.get::<_, String>(2)?,
                "startYear": r.get::<_, i64>(3)?,
                "endYear": r.get::<_, i64>(4)?,
                "type": r.get::<_, String>(5)?,
                "studentCount": r.get::<_, i64>(6)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(batches) => ok(&req.id, json!({ "batches": batches })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_batches_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let batch_id = match req_str(&req.params, "batchId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let batch = match conn
        .query_row(
            "SELECT bt.id, bt.branch_id, b.title, bt.start_year, bt.end_year, bt.type
             FROM batches bt JOIN branches b ON b.id = bt.branch_id
             WHERE bt.id = ?",
            [&batch_id],
            |r| {
                Ok(json!({
                    "batchId": r.get::<_, String>(0)?,
                    "branchId": r.get::<_, String>(1)?,
                    "branch": r.get::<_, String>(2)?,
                    "startYear": r.get::<_, i64>(3)?,
                    "endYear": r.get::<_, i64>(4)?,
                    "type": r.get::<_, String>(5)?
                }))
            },
        )
        .optional()
    {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "batch_not_found", "batch not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut stmt = match conn.prepare(
        "SELECT id, title, start_date, end_date FROM semesters
         WHERE batch_id = ? ORDER BY CAST(title AS INTEGER)",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let semesters = stmt
        .query_map([&batch_id], |r| {
            Ok(json!({
                "semesterId": r.get::<_, String>(0)?,
                "title": r.get::<_, String>(1)?,
                "startDate": r.get::<_, Option<String>>(2)?,
                "endDate": r.get::<_, Option<String>>(3)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match semesters {
        Ok(semesters) => {
            let mut result = batch;
            result["semesters"] = json!(semesters);
            ok(&req.id, result)
        }
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

/// Updates date ranges and subject assignments for a batch's semesters in
/// one transaction. Every semester entry must belong to the addressed
/// batch: the date update is filtered by id AND batch_id, and a zero-row
/// match aborts the whole call instead of skipping silently.
fn handle_batches_add_semester_details(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let batch_id = match req_str(&req.params, "batchId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let Some(entries) = req.params.get("semesters").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing/invalid semesters", None);
    };
    if entries.is_empty() {
        return err(&req.id, "bad_params", "semesters must not be empty", None);
    }

    let branch_id: Option<String> = match conn
        .query_row(
            "SELECT branch_id FROM batches WHERE id = ?",
            [&batch_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(branch_id) = branch_id else {
        return err(&req.id, "batch_not_found", "batch not found", None);
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let ts = now();
    let mut assigned = 0usize;
    for (idx, entry) in entries.iter().enumerate() {
        let semester_id = match entry.get("semesterId").and_then(|v| v.as_str()) {
            Some(v) => v.to_string(),
            None => {
                let _ = tx.rollback();
                return err(
                    &req.id,
                    "bad_params",
                    "missing semesterId",
                    Some(json!({ "entry": idx })),
                );
            }
        };
        let start_date = entry.get("startDate").and_then(|v| v.as_str());
        let end_date = entry.get("endDate").and_then(|v| v.as_str());

        let updated = match tx.execute(
            "UPDATE semesters SET
                start_date = COALESCE(?, start_date),
                end_date = COALESCE(?, end_date),
                updated_at = ?
             WHERE id = ? AND batch_id = ?",
            (start_date, end_date, &ts, &semester_id, &batch_id),
        ) {
            Ok(n) => n,
            Err(e) => {
                let _ = tx.rollback();
                return err(&req.id, "db_update_failed", e.to_string(), None);
            }
        };
        if updated == 0 {
            let _ = tx.rollback();
            return err(
                &req.id,
                "semester_not_in_batch",
                "semester does not belong to the batch",
                Some(json!({ "semesterId": semester_id, "batchId": batch_id })),
            );
        }

        let subject_ids: Vec<String> = entry
            .get("subjectIds")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();
        for subject_id in subject_ids {
            let known: Option<i64> = match tx
                .query_row("SELECT 1 FROM subjects WHERE id = ?", [&subject_id], |r| {
                    r.get(0)
                })
                .optional()
            {
                Ok(v) => v,
                Err(e) => {
                    let _ = tx.rollback();
                    return err(&req.id, "db_query_failed", e.to_string(), None);
                }
            };
            if known.is_none() {
                let _ = tx.rollback();
                return err(
                    &req.id,
                    "subject_not_found",
                    "subject not found",
                    Some(json!({ "subjectId": subject_id })),
                );
            }

            // Re-assigning the same subject is a no-op (unique triple).
            if let Err(e) = tx.execute(
                "INSERT OR IGNORE INTO subject_semester_branches(id, subject_id, semester_id, branch_id, created_at)
                 VALUES(?, ?, ?, ?, ?)",
                (
                    Uuid::new_v4().to_string(),
                    &subject_id,
                    &semester_id,
                    &branch_id,
                    &ts,
                ),
            ) {
                let _ = tx.rollback();
                return err(
                    &req.id,
                    "db_insert_failed",
                    e.to_string(),
                    Some(json!({ "table": "subject_semester_branches" })),
                );
            }
            assigned += 1;
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    info!(batch_id = %batch_id, entries = entries.len(), "semester details updated");
    ok(
        &req.id,
        json!({ "batchId": batch_id, "semestersUpdated": entries.len(), "subjectsAssigned": assigned }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "batches.create" => Some(handle_batches_create(state, req)),
        "batches.list" => Some(handle_batches_list(state, req)),
        "batches.get" => Some(handle_batches_get(state, req)),
        "batches.addSemesterDetails" => Some(handle_batches_add_semester_details(state, req)),
        _ => None,
    }
}
