use crate::auth::{self, Role};
use crate::db::is_unique_violation;
use crate::directory::{self, NewUser, UserPatch};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{opt_str, req_i64, req_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

fn batch_exists(conn: &Connection, batch_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM batches WHERE id = ?", [batch_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(HandlerErr::db_query)
}

fn semester_in_batch(
    conn: &Connection,
    semester_id: &str,
    batch_id: &str,
) -> Result<bool, HandlerErr> {
    conn.query_row(
        "SELECT 1 FROM semesters WHERE id = ? AND batch_id = ?",
        (semester_id, batch_id),
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(HandlerErr::db_query)
}

fn registration_taken(conn: &Connection, registration_number: i64) -> Result<bool, HandlerErr> {
    conn.query_row(
        "SELECT 1 FROM students WHERE registration_number = ?",
        [registration_number],
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(HandlerErr::db_query)
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let batch_id = match req_str(&req.params, "batchId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let current_semester_id = match req_str(&req.params, "currentSemesterId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let registration_number = match req_i64(&req.params, "registrationNumber") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let father_name = match req_str(&req.params, "fatherName") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let mother_name = match req_str(&req.params, "motherName") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let category = match req_str(&req.params, "category") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let middle_name = opt_str(&req.params, "middleName");
    let last_name = opt_str(&req.params, "lastName");

    match batch_exists(conn, &batch_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "batch_not_found", "batch not found", None),
        Err(e) => return e.response(&req.id),
    }
    match semester_in_batch(conn, &current_semester_id, &batch_id) {
        Ok(true) => {}
        Ok(false) => {
            return err(
                &req.id,
                "semester_not_in_batch",
                "semester does not belong to the batch",
                Some(json!({ "semesterId": current_semester_id, "batchId": batch_id })),
            )
        }
        Err(e) => return e.response(&req.id),
    }
    match registration_taken(conn, registration_number) {
        Ok(false) => {}
        Ok(true) => {
            return err(
                &req.id,
                "registration_conflict",
                "registration number already in use",
                None,
            )
        }
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
        role: Role::Student,
    };
    let user_id = match directory::insert_user(&tx, &new_user, state.config.institute_domain.as_deref())
    {
        Ok(v) => v,
        Err(e) => {
            let _ = tx.rollback();
            return HandlerErr::from(e).response(&req.id);
        }
    };

    let student_id = Uuid::new_v4().to_string();
    let inserted = tx.execute(
        "INSERT INTO students(id, user_id, batch_id, registration_number,
                              father_name, mother_name, category, current_semester_id)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &student_id,
            &user_id,
            &batch_id,
            registration_number,
            &father_name,
            &mother_name,
            &category,
            &current_semester_id,
        ),
    );
    match inserted {
        Ok(_) => {}
        Err(e) if is_unique_violation(&e, "students.registration_number") => {
            let _ = tx.rollback();
            return err(
                &req.id,
                "registration_conflict",
                "registration number already in use",
                None,
            );
        }
        Err(e) => {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "students" })),
            );
        }
    }

    // Enrollment in the current semester rides the same transaction.
    if let Err(e) = tx.execute(
        "INSERT INTO student_semesters(student_id, semester_id) VALUES(?, ?)",
        (&student_id, &current_semester_id),
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "student_semesters" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    info!(student_id = %student_id, "student created");
    ok(&req.id, json!({ "studentId": student_id, "userId": user_id }))
}

fn student_row_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "studentId": r.get::<_, String>(0)?,
        "userId": r.get::<_, String>(1)?,
        "firstName": r.get::<_, String>(2)?,
        "middleName": r.get::<_, Option<String>>(3)?,
        "lastName": r.get::<_, Option<String>>(4)?,
        "email": r.get::<_, String>(5)?,
        "phone": r.get::<_, String>(6)?,
        "registrationNumber": r.get::<_, i64>(7)?,
        "fatherName": r.get::<_, String>(8)?,
        "motherName": r.get::<_, String>(9)?,
        "category": r.get::<_, String>(10)?,
        "batchId": r.get::<_, String>(11)?,
        "branch": r.get::<_, String>(12)?,
        "currentSemester": r.get::<_, String>(13)?
    }))
}

const STUDENT_SELECT: &str = "SELECT s.id, u.id, u.first_name, u.middle_name, u.last_name,
        u.email, u.phone, s.registration_number, s.father_name, s.mother_name,
        s.category, s.batch_id, b.title, sem.title
 FROM students s
 JOIN users u ON u.id = s.user_id
 JOIN batches bt ON bt.id = s.batch_id
 JOIN branches b ON b.id = bt.branch_id
 JOIN semesters sem ON sem.id = s.current_semester_id
 WHERE u.deleted_at IS NULL";

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let sql = format!("{STUDENT_SELECT} ORDER BY s.registration_number");
    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |r| student_row_json(r))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let student_id = match req_str(&req.params, "studentId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let sql = format!("{STUDENT_SELECT} AND s.id = ?");
    match conn
        .query_row(&sql, [&student_id], |r| student_row_json(r))
        .optional()
    {
        Ok(Some(row)) => ok(&req.id, row),
        Ok(None) => err(&req.id, "student_not_found", "student not found", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let student_id = match req_str(&req.params, "studentId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let Some(patch) = req.params.get("patch") else {
        return err(&req.id, "bad_params", "missing patch", None);
    };

    let found: Option<(String, String)> = match conn
        .query_row(
            "SELECT u.id, s.batch_id FROM students s JOIN users u ON u.id = s.user_id
             WHERE s.id = ? AND u.deleted_at IS NULL",
            [&student_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((user_id, existing_batch)) = found else {
        return err(&req.id, "student_not_found", "student not found", None);
    };

    let batch_id = patch.get("batchId").and_then(|v| v.as_str()).map(String::from);
    if let Some(batch_id) = &batch_id {
        match batch_exists(conn, batch_id) {
            Ok(true) => {}
            Ok(false) => return err(&req.id, "batch_not_found", "batch not found", None),
            Err(e) => return e.response(&req.id),
        }
    }
    let current_semester_id = patch
        .get("currentSemesterId")
        .and_then(|v| v.as_str())
        .map(String::from);
    if let Some(sem_id) = &current_semester_id {
        let target_batch = batch_id.as_deref().unwrap_or(&existing_batch);
        match semester_in_batch(conn, sem_id, target_batch) {
            Ok(true) => {}
            Ok(false) => {
                return err(
                    &req.id,
                    "semester_not_in_batch",
                    "semester does not belong to the batch",
                    Some(json!({ "semesterId": sem_id, "batchId": target_batch })),
                )
            }
            Err(e) => return e.response(&req.id),
        }
    }

    let user_patch = UserPatch::from_params(patch);
    let father_name = patch.get("fatherName").and_then(|v| v.as_str()).map(String::from);
    let mother_name = patch.get("motherName").and_then(|v| v.as_str()).map(String::from);
    let category = patch.get("category").and_then(|v| v.as_str()).map(String::from);

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

    let ext_fields: [(&str, &Option<String>); 5] = [
        ("batch_id", &batch_id),
        ("current_semester_id", &current_semester_id),
        ("father_name", &father_name),
        ("mother_name", &mother_name),
        ("category", &category),
    ];
    for (column, value) in ext_fields {
        if let Some(v) = value {
            let sql = format!("UPDATE students SET {column} = ? WHERE id = ?");
            if let Err(e) = tx.execute(&sql, (v, &student_id)) {
                let _ = tx.rollback();
                return err(&req.id, "db_update_failed", e.to_string(), None);
            }
        }
    }

    // Changing the current semester also enrolls the student in it.
    if let Some(sem_id) = &current_semester_id {
        if let Err(e) = tx.execute(
            "INSERT OR IGNORE INTO student_semesters(student_id, semester_id) VALUES(?, ?)",
            (&student_id, sem_id),
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_insert_failed", e.to_string(), None);
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "studentId": student_id }))
}

fn handle_students_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let student_id = match req_str(&req.params, "studentId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let user_id: Option<String> = match conn
        .query_row(
            "SELECT user_id FROM students WHERE id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(user_id) = user_id else {
        return err(&req.id, "student_not_found", "student not found", None);
    };

    match directory::soft_delete_user(conn, &user_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "student_not_found", "student not found", None),
        Err(e) => return HandlerErr::from(e).response(&req.id),
    }
    if let Err(e) = auth::revoke_user_sessions(conn, &user_id) {
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }

    info!(student_id = %student_id, "student soft-deleted");
    ok(&req.id, json!({ "deleted": true }))
}

/// Per-semester mark totals for a student's enrolled semesters.
fn handle_students_semesters(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let student_id = match req_str(&req.params, "studentId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let exists: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM students s JOIN users u ON u.id = s.user_id
             WHERE s.id = ? AND u.deleted_at IS NULL",
            [&student_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "student_not_found", "student not found", None);
    }

    let mut stmt = match conn.prepare(
        "SELECT sem.id, sem.title, sem.start_date, sem.end_date,
                COUNT(m.id),
                COALESCE(SUM(m.total_marks), 0),
                COALESCE(SUM(CASE WHEN m.is_pass = 0 THEN 1 ELSE 0 END), 0)
         FROM student_semesters ss
         JOIN semesters sem ON sem.id = ss.semester_id
         LEFT JOIN student_marks m
                ON m.semester_id = sem.id AND m.student_id = ss.student_id
         WHERE ss.student_id = ?
         GROUP BY sem.id
         ORDER BY CAST(sem.title AS INTEGER)",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&student_id], |r| {
            Ok(json!({
                "semesterId": r.get::<_, String>(0)?,
                "title": r.get::<_, String>(1)?,
                "startDate": r.get::<_, Option<String>>(2)?,
                "endDate": r.get::<_, Option<String>>(3)?,
                "subjectCount": r.get::<_, i64>(4)?,
                "totalMarks": r.get::<_, i64>(5)?,
                "failedSubjects": r.get::<_, i64>(6)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(semesters) => ok(&req.id, json!({ "studentId": student_id, "semesters": semesters })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.create" => Some(handle_students_create(state, req)),
        "students.list" => Some(handle_students_list(state, req)),
        "students.get" => Some(handle_students_get(state, req)),
        "students.update" => Some(handle_students_update(state, req)),
        "students.delete" => Some(handle_students_delete(state, req)),
        "students.semesters" => Some(handle_students_semesters(state, req)),
        _ => None,
    }
}
