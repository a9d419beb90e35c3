use crate::certificate::{self, CertificateData, SemesterRow};
use crate::grading;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::req_str;
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::OptionalExtension;
use serde_json::json;
use tracing::info;

/// Assembles the full transcript for a student and renders the
/// provisional certificate. Every recorded semester contributes a row;
/// the division is derived from the overall percentage, with any single
/// failed subject failing the transcript outright.
fn handle_certificates_provisional(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let student_id = match req_str(&req.params, "studentId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let student = match conn
        .query_row(
            "SELECT u.first_name || COALESCE(' ' || u.last_name, ''),
                s.father_name, s.registration_number,
                b.title, bt.start_year, bt.end_year
             FROM students s
             JOIN users u ON u.id = s.user_id
             JOIN batches bt ON bt.id = s.batch_id
             JOIN branches b ON b.id = bt.branch_id
             WHERE s.id = ? AND u.deleted_at IS NULL",
            [&student_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, i64>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, i64>(4)?,
                    r.get::<_, i64>(5)?,
                ))
            },
        )
        .optional()
    {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "student_not_found", "student not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let (name, father_name, registration_number, branch, start_year, end_year) = student;

    // Per-semester obtained/maximum plus a per-semester failed-subject flag,
    // in transcript order.
    let mut stmt = match conn.prepare(
        "SELECT sem.title,
            SUM(m.total_marks),
            SUM(sub.internal_max + sub.external_max),
            SUM(CASE WHEN m.is_pass = 0 THEN 1 ELSE 0 END)
         FROM student_marks m
         JOIN semesters sem ON sem.id = m.semester_id
         JOIN subjects sub ON sub.id = m.subject_id
         WHERE m.student_id = ?
         GROUP BY m.semester_id
         ORDER BY CAST(sem.title AS INTEGER)",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let per_semester = stmt
        .query_map([&student_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, i64>(1)?,
                r.get::<_, i64>(2)?,
                r.get::<_, i64>(3)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let per_semester = match per_semester {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if per_semester.is_empty() {
        return err(
            &req.id,
            "no_marks_recorded",
            "no marks have been recorded for this student",
            None,
        );
    }

    let mut rows = Vec::with_capacity(per_semester.len());
    let mut total_obtained = 0i64;
    let mut total_maximum = 0i64;
    let mut any_failed = false;
    for (title, obtained, maximum, failed) in per_semester {
        total_obtained += obtained;
        total_maximum += maximum;
        any_failed |= failed > 0;
        rows.push(SemesterRow {
            semester_title: title,
            obtained,
            maximum,
        });
    }

    let percent = grading::percentage(total_obtained, total_maximum);
    let division = grading::division(percent, any_failed);

    let data = CertificateData {
        student_name: name.clone(),
        father_name,
        registration_number,
        branch,
        session: format!("{start_year}-{end_year}"),
        issue_date: Utc::now().format("%Y-%m-%d").to_string(),
        rows,
        total_obtained,
        total_maximum,
        percentage: percent,
        division,
    };
    let html = certificate::render(&data);

    info!(student_id = %student_id, division = division.as_str(), "provisional certificate rendered");
    ok(
        &req.id,
        json!({
            "fileName": format!("provisional-{registration_number}.html"),
            "html": html,
            "summary": {
                "student": name,
                "registrationNumber": registration_number,
                "totalObtained": total_obtained,
                "totalMaximum": total_maximum,
                "percentage": percent,
                "division": division.as_str()
            }
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "certificates.provisional" => Some(handle_certificates_provisional(state, req)),
        _ => None,
    }
}
