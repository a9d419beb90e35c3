use crate::db::is_unique_violation;
use crate::grading::{self, MarkRejection, SubjectScheme};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{now, opt_i64, req_i64, req_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashSet;
use tracing::info;
use uuid::Uuid;

struct SubjectInfo {
    title: String,
    code: String,
    scheme: SubjectScheme,
}

fn load_subject(conn: &Connection, subject_id: &str) -> Result<Option<SubjectInfo>, HandlerErr> {
    conn.query_row(
        "SELECT title, code, internal_max, external_max, internal_passing, external_passing
         FROM subjects WHERE id = ?",
        [subject_id],
        |r| {
            Ok(SubjectInfo {
                title: r.get(0)?,
                code: r.get(1)?,
                scheme: SubjectScheme {
                    internal_max: r.get(2)?,
                    external_max: r.get(3)?,
                    internal_passing: r.get(4)?,
                    external_passing: r.get(5)?,
                },
            })
        },
    )
    .optional()
    .map_err(HandlerErr::db_query)
}

struct StudentInfo {
    name: String,
    registration_number: i64,
}

fn load_student(conn: &Connection, student_id: &str) -> Result<Option<StudentInfo>, HandlerErr> {
    conn.query_row(
        "SELECT u.first_name || COALESCE(' ' || u.last_name, ''), s.registration_number
         FROM students s JOIN users u ON u.id = s.user_id
         WHERE s.id = ? AND u.deleted_at IS NULL",
        [student_id],
        |r| {
            Ok(StudentInfo {
                name: r.get(0)?,
                registration_number: r.get(1)?,
            })
        },
    )
    .optional()
    .map_err(HandlerErr::db_query)
}

fn load_semester_title(conn: &Connection, semester_id: &str) -> Result<Option<String>, HandlerErr> {
    conn.query_row(
        "SELECT title FROM semesters WHERE id = ?",
        [semester_id],
        |r| r.get(0),
    )
    .optional()
    .map_err(HandlerErr::db_query)
}

fn rejection_err(rejection: MarkRejection) -> HandlerErr {
    match rejection {
        MarkRejection::NegativeMarks => HandlerErr::new("bad_params", "marks must not be negative"),
        MarkRejection::InternalExceeded { submitted, max } => HandlerErr::with_details(
            "internal_marks_exceeded",
            "internal marks exceed the subject maximum",
            json!({ "submitted": submitted, "max": max }),
        ),
        MarkRejection::ExternalExceeded { submitted, max } => HandlerErr::with_details(
            "external_marks_exceeded",
            "external marks exceed the subject maximum",
            json!({ "submitted": submitted, "max": max }),
        ),
    }
}

struct MarkParams {
    student_id: String,
    semester_id: String,
    subject_id: String,
    internal: i64,
    external: i64,
}

impl MarkParams {
    fn from_params(params: &serde_json::Value) -> Result<Self, HandlerErr> {
        Ok(Self {
            student_id: req_str(params, "studentId")?,
            semester_id: req_str(params, "semesterId")?,
            subject_id: req_str(params, "subjectId")?,
            internal: req_i64(params, "internalMarks")?,
            external: req_i64(params, "externalMarks")?,
        })
    }
}

/// Full validation ladder for one submission. Subject config is checked
/// before entity existence so an out-of-range mark surfaces as a marks
/// error even when both ids are also wrong.
fn validate_submission(
    conn: &Connection,
    p: &MarkParams,
) -> Result<(SubjectInfo, StudentInfo, String), HandlerErr> {
    let Some(subject) = load_subject(conn, &p.subject_id)? else {
        return Err(HandlerErr::with_details(
            "subject_not_found",
            "subject not found",
            json!({ "subjectId": p.subject_id }),
        ));
    };
    grading::evaluate(&subject.scheme, p.internal, p.external).map_err(rejection_err)?;
    let Some(student) = load_student(conn, &p.student_id)? else {
        return Err(HandlerErr::with_details(
            "student_not_found",
            "student not found",
            json!({ "studentId": p.student_id }),
        ));
    };
    let Some(semester_title) = load_semester_title(conn, &p.semester_id)? else {
        return Err(HandlerErr::with_details(
            "semester_not_found",
            "semester not found",
            json!({ "semesterId": p.semester_id }),
        ));
    };
    let existing: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM student_marks WHERE student_id = ? AND semester_id = ? AND subject_id = ?",
            (&p.student_id, &p.semester_id, &p.subject_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    if existing.is_some() {
        return Err(HandlerErr::with_details(
            "marks_already_exist",
            "marks already recorded for this student/semester/subject",
            json!({ "subjectId": p.subject_id }),
        ));
    }
    Ok((subject, student, semester_title))
}

fn insert_mark(conn: &Connection, p: &MarkParams, total: i64, is_pass: bool) -> Result<String, HandlerErr> {
    let id = Uuid::new_v4().to_string();
    let ts = now();
    conn.execute(
        "INSERT INTO student_marks(id, student_id, semester_id, subject_id,
            internal_marks, external_marks, total_marks, is_pass, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &p.student_id,
            &p.semester_id,
            &p.subject_id,
            p.internal,
            p.external,
            total,
            is_pass as i64,
            &ts,
            &ts,
        ),
    )
    .map_err(|e| {
        if is_unique_violation(&e, "student_marks.") {
            HandlerErr::new(
                "marks_already_exist",
                "marks already recorded for this student/semester/subject",
            )
        } else {
            HandlerErr::new("db_insert_failed", e.to_string())
        }
    })?;
    Ok(id)
}

fn handle_marks_record(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let p = match MarkParams::from_params(&req.params) {
        Ok(p) => p,
        Err(e) => return e.response(&req.id),
    };
    let (subject, student, semester_title) = match validate_submission(conn, &p) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    // validate_submission already accepted (subject, internal, external)
    let outcome = match grading::evaluate(&subject.scheme, p.internal, p.external) {
        Ok(o) => o,
        Err(r) => return rejection_err(r).response(&req.id),
    };
    let mark_id = match insert_mark(conn, &p, outcome.total, outcome.is_pass) {
        Ok(id) => id,
        Err(e) => return e.response(&req.id),
    };

    info!(mark_id = %mark_id, student_id = %p.student_id, "marks recorded");
    ok(
        &req.id,
        json!({
            "markId": mark_id,
            "student": {
                "studentId": p.student_id,
                "name": student.name,
                "registrationNumber": student.registration_number
            },
            "semester": { "semesterId": p.semester_id, "title": semester_title },
            "subject": { "subjectId": p.subject_id, "title": subject.title, "code": subject.code },
            "internalMarks": p.internal,
            "externalMarks": p.external,
            "totalMarks": outcome.total,
            "isPass": outcome.is_pass
        }),
    )
}

/// All-or-nothing batch entry for one student in one semester: every
/// entry is validated up front and a single bad entry rejects the whole
/// submission with per-entry diagnostics and zero writes.
fn handle_marks_bulk_record(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let student_id = match req_str(&req.params, "studentId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let semester_id = match req_str(&req.params, "semesterId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let Some(entries) = req.params.get("marks").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing/invalid marks", None);
    };
    if entries.is_empty() {
        return err(&req.id, "bad_params", "marks must not be empty", None);
    }

    let mut seen = HashSet::new();
    let mut parsed = Vec::with_capacity(entries.len());
    let mut errors = Vec::new();
    for (idx, entry) in entries.iter().enumerate() {
        let with_ids = match (
            entry.get("subjectId").and_then(|v| v.as_str()),
            entry.get("internalMarks").and_then(|v| v.as_i64()),
            entry.get("externalMarks").and_then(|v| v.as_i64()),
        ) {
            (Some(subject_id), Some(internal), Some(external)) => MarkParams {
                student_id: student_id.clone(),
                semester_id: semester_id.clone(),
                subject_id: subject_id.to_string(),
                internal,
                external,
            },
            _ => {
                errors.push(json!({ "entry": idx, "code": "bad_params", "message": "missing subjectId/internalMarks/externalMarks" }));
                continue;
            }
        };
        if !seen.insert(with_ids.subject_id.clone()) {
            errors.push(json!({
                "entry": idx,
                "code": "duplicate_subject",
                "message": "subject appears more than once in the submission",
                "subjectId": with_ids.subject_id
            }));
            continue;
        }
        match validate_submission(conn, &with_ids) {
            Ok((subject, _, _)) => {
                // evaluate cannot fail after validate_submission accepted it
                if let Ok(outcome) = grading::evaluate(&subject.scheme, with_ids.internal, with_ids.external) {
                    parsed.push((with_ids, outcome));
                }
            }
            Err(e) => {
                let mut diag = json!({ "entry": idx, "code": e.code, "message": e.message });
                if let Some(d) = e.details {
                    diag["details"] = d;
                }
                errors.push(diag);
            }
        }
    }

    if !errors.is_empty() {
        return err(
            &req.id,
            "bulk_validation_failed",
            "one or more entries are invalid; nothing was recorded",
            Some(json!({ "errors": errors })),
        );
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let mut mark_ids = Vec::with_capacity(parsed.len());
    for (p, outcome) in &parsed {
        match insert_mark(&tx, p, outcome.total, outcome.is_pass) {
            Ok(id) => mark_ids.push(id),
            Err(e) => {
                let _ = tx.rollback();
                return e.response(&req.id);
            }
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    info!(
        student_id = %student_id,
        semester_id = %semester_id,
        recorded = mark_ids.len(),
        "bulk marks recorded"
    );
    ok(
        &req.id,
        json!({
            "studentId": student_id,
            "semesterId": semester_id,
            "recorded": mark_ids.len(),
            "markIds": mark_ids
        }),
    )
}

fn handle_marks_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let mark_id = match req_str(&req.params, "markId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let row = match conn
        .query_row(
            "SELECT subject_id, internal_marks, external_marks FROM student_marks WHERE id = ?",
            [&mark_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, i64>(1)?,
                    r.get::<_, i64>(2)?,
                ))
            },
        )
        .optional()
    {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "marks_not_found", "marks record not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let (subject_id, current_internal, current_external) = row;

    let internal = opt_i64(&req.params, "internalMarks").unwrap_or(current_internal);
    let external = opt_i64(&req.params, "externalMarks").unwrap_or(current_external);

    let subject = match load_subject(conn, &subject_id) {
        Ok(Some(s)) => s,
        Ok(None) => return err(&req.id, "subject_not_found", "subject not found", None),
        Err(e) => return e.response(&req.id),
    };
    let outcome = match grading::evaluate(&subject.scheme, internal, external) {
        Ok(o) => o,
        Err(r) => return rejection_err(r).response(&req.id),
    };

    if let Err(e) = conn.execute(
        "UPDATE student_marks SET internal_marks = ?, external_marks = ?,
            total_marks = ?, is_pass = ?, updated_at = ?
         WHERE id = ?",
        (
            internal,
            external,
            outcome.total,
            outcome.is_pass as i64,
            now(),
            &mark_id,
        ),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "markId": mark_id,
            "internalMarks": internal,
            "externalMarks": external,
            "totalMarks": outcome.total,
            "isPass": outcome.is_pass
        }),
    )
}

fn handle_marks_for_semester(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let student_id = match req_str(&req.params, "studentId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let semester_id = match req_str(&req.params, "semesterId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let student = match load_student(conn, &student_id) {
        Ok(Some(s)) => s,
        Ok(None) => return err(&req.id, "student_not_found", "student not found", None),
        Err(e) => return e.response(&req.id),
    };
    let semester_title = match load_semester_title(conn, &semester_id) {
        Ok(Some(t)) => t,
        Ok(None) => return err(&req.id, "semester_not_found", "semester not found", None),
        Err(e) => return e.response(&req.id),
    };

    let mut stmt = match conn.prepare(
        "SELECT m.id, m.subject_id, sub.title, sub.code,
            m.internal_marks, m.external_marks, m.total_marks, m.is_pass,
            sub.internal_max, sub.external_max, sub.internal_passing, sub.external_passing
         FROM student_marks m
         JOIN subjects sub ON sub.id = m.subject_id
         WHERE m.student_id = ? AND m.semester_id = ?
         ORDER BY sub.code",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let marks = stmt
        .query_map((&student_id, &semester_id), |r| {
            Ok(json!({
                "markId": r.get::<_, String>(0)?,
                "subjectId": r.get::<_, String>(1)?,
                "subject": r.get::<_, String>(2)?,
                "code": r.get::<_, String>(3)?,
                "internalMarks": r.get::<_, i64>(4)?,
                "externalMarks": r.get::<_, i64>(5)?,
                "totalMarks": r.get::<_, i64>(6)?,
                "isPass": r.get::<_, i64>(7)? != 0,
                "internalMax": r.get::<_, i64>(8)?,
                "externalMax": r.get::<_, i64>(9)?,
                "internalPassing": r.get::<_, i64>(10)?,
                "externalPassing": r.get::<_, i64>(11)?,
                "maximumMarks": r.get::<_, i64>(8)? + r.get::<_, i64>(9)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match marks {
        Ok(marks) => ok(
            &req.id,
            json!({
                "student": {
                    "studentId": student_id,
                    "name": student.name,
                    "registrationNumber": student.registration_number
                },
                "semester": { "semesterId": semester_id, "title": semester_title },
                "marks": marks
            }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_marks_delete_for_semester(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let student_id = match req_str(&req.params, "studentId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let semester_id = match req_str(&req.params, "semesterId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    match load_student(conn, &student_id) {
        Ok(Some(_)) => {}
        Ok(None) => return err(&req.id, "student_not_found", "student not found", None),
        Err(e) => return e.response(&req.id),
    }
    match load_semester_title(conn, &semester_id) {
        Ok(Some(_)) => {}
        Ok(None) => return err(&req.id, "semester_not_found", "semester not found", None),
        Err(e) => return e.response(&req.id),
    }

    let deleted = match conn.execute(
        "DELETE FROM student_marks WHERE student_id = ? AND semester_id = ?",
        (&student_id, &semester_id),
    ) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_delete_failed", e.to_string(), None),
    };

    info!(student_id = %student_id, semester_id = %semester_id, deleted, "semester marks deleted");
    ok(
        &req.id,
        json!({ "studentId": student_id, "semesterId": semester_id, "deleted": deleted }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "marks.record" => Some(handle_marks_record(state, req)),
        "marks.bulkRecord" => Some(handle_marks_bulk_record(state, req)),
        "marks.update" => Some(handle_marks_update(state, req)),
        "marks.forSemester" => Some(handle_marks_for_semester(state, req)),
        "marks.deleteForSemester" => Some(handle_marks_delete_for_semester(state, req)),
        _ => None,
    }
}
