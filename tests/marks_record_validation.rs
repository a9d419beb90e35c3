use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_daemon() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_registrard");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn registrard");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    token: Option<&str>,
    params: serde_json::Value,
) -> serde_json::Value {
    let mut payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    if let Some(t) = token {
        payload["token"] = json!(t);
    }
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    token: Option<&str>,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, token, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

struct Fixture {
    token: String,
    student_id: String,
    semester_id: String,
    subject_id: String,
}

/// admin + branch + batch + subject (default 50/20 scheme) + one student
/// enrolled in the batch's first semester.
fn setup_fixture(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &std::path::Path,
) -> Fixture {
    let _ = request_ok(
        stdin,
        reader,
        "f1",
        "workspace.select",
        None,
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        stdin,
        reader,
        "f2",
        "auth.signup",
        None,
        json!({
            "firstName": "Root",
            "email": "root@inst.test",
            "phone": "9000000001",
            "password": "pw-secret-1"
        }),
    );
    let login = request_ok(
        stdin,
        reader,
        "f3",
        "auth.login",
        None,
        json!({ "email": "root@inst.test", "password": "pw-secret-1" }),
    );
    let token = login
        .get("token")
        .and_then(|v| v.as_str())
        .expect("token")
        .to_string();

    let branch = request_ok(
        stdin,
        reader,
        "f4",
        "branches.create",
        Some(&token),
        json!({ "title": "Computer Science" }),
    );
    let branch_id = branch
        .get("branchId")
        .and_then(|v| v.as_str())
        .expect("branchId")
        .to_string();
    let batch = request_ok(
        stdin,
        reader,
        "f5",
        "batches.create",
        Some(&token),
        json!({ "branchId": branch_id, "startYear": 2024, "endYear": 2027 }),
    );
    let batch_id = batch
        .get("batchId")
        .and_then(|v| v.as_str())
        .expect("batchId")
        .to_string();
    let semester_id = batch
        .pointer("/semesterIds/0")
        .and_then(|v| v.as_str())
        .expect("first semester")
        .to_string();

    let subject = request_ok(
        stdin,
        reader,
        "f6",
        "subjects.create",
        Some(&token),
        json!({ "title": "Data Structures", "code": "CS201" }),
    );
    let subject_id = subject
        .get("subjectId")
        .and_then(|v| v.as_str())
        .expect("subjectId")
        .to_string();

    let student = request_ok(
        stdin,
        reader,
        "f7",
        "students.create",
        Some(&token),
        json!({
            "firstName": "Asha",
            "lastName": "Verma",
            "email": "asha@inst.test",
            "phone": "9000000010",
            "password": "pw-student-1",
            "batchId": batch_id,
            "currentSemesterId": semester_id,
            "registrationNumber": 20240101,
            "fatherName": "R. Verma",
            "motherName": "S. Verma",
            "category": "general"
        }),
    );
    let student_id = student
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();

    Fixture {
        token,
        student_id,
        semester_id,
        subject_id,
    }
}

#[test]
fn record_derives_total_and_pass_flag() {
    let workspace = temp_dir("registrar-marks-record");
    let (_child, mut stdin, mut reader) = spawn_daemon();
    let fx = setup_fixture(&mut stdin, &mut reader, &workspace);

    let recorded = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "marks.record",
        Some(&fx.token),
        json!({
            "studentId": fx.student_id,
            "semesterId": fx.semester_id,
            "subjectId": fx.subject_id,
            "internalMarks": 35,
            "externalMarks": 40
        }),
    );
    assert_eq!(recorded.get("totalMarks").and_then(|v| v.as_i64()), Some(75));
    assert_eq!(recorded.get("isPass").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(
        recorded.pointer("/student/registrationNumber").and_then(|v| v.as_i64()),
        Some(20240101)
    );
    assert_eq!(
        recorded.pointer("/subject/code").and_then(|v| v.as_str()),
        Some("CS201")
    );

    // The triple is now taken.
    let dup = request(
        &mut stdin,
        &mut reader,
        "2",
        "marks.record",
        Some(&fx.token),
        json!({
            "studentId": fx.student_id,
            "semesterId": fx.semester_id,
            "subjectId": fx.subject_id,
            "internalMarks": 10,
            "externalMarks": 10
        }),
    );
    assert_eq!(error_code(&dup), "marks_already_exist");

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn for_semester_rows_carry_subject_scheme() {
    let workspace = temp_dir("registrar-marks-scheme");
    let (_child, mut stdin, mut reader) = spawn_daemon();
    let fx = setup_fixture(&mut stdin, &mut reader, &workspace);

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "marks.record",
        Some(&fx.token),
        json!({
            "studentId": fx.student_id,
            "semesterId": fx.semester_id,
            "subjectId": fx.subject_id,
            "internalMarks": 35,
            "externalMarks": 40
        }),
    );

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "marks.forSemester",
        Some(&fx.token),
        json!({ "studentId": fx.student_id, "semesterId": fx.semester_id }),
    );
    let row = listed
        .pointer("/marks/0")
        .expect("one mark row");
    assert_eq!(row.get("internalMax").and_then(|v| v.as_i64()), Some(50));
    assert_eq!(row.get("externalMax").and_then(|v| v.as_i64()), Some(50));
    assert_eq!(row.get("internalPassing").and_then(|v| v.as_i64()), Some(20));
    assert_eq!(row.get("externalPassing").and_then(|v| v.as_i64()), Some(20));
    assert_eq!(row.get("maximumMarks").and_then(|v| v.as_i64()), Some(100));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn pass_requires_both_components() {
    let workspace = temp_dir("registrar-marks-components");
    let (_child, mut stdin, mut reader) = spawn_daemon();
    let fx = setup_fixture(&mut stdin, &mut reader, &workspace);

    // internal 15 < passing 20, so the aggregate 50 does not pass.
    let recorded = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "marks.record",
        Some(&fx.token),
        json!({
            "studentId": fx.student_id,
            "semesterId": fx.semester_id,
            "subjectId": fx.subject_id,
            "internalMarks": 15,
            "externalMarks": 35
        }),
    );
    assert_eq!(recorded.get("totalMarks").and_then(|v| v.as_i64()), Some(50));
    assert_eq!(recorded.get("isPass").and_then(|v| v.as_bool()), Some(false));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn record_validation_ladder() {
    let workspace = temp_dir("registrar-marks-validation");
    let (_child, mut stdin, mut reader) = spawn_daemon();
    let fx = setup_fixture(&mut stdin, &mut reader, &workspace);

    let no_subject = request(
        &mut stdin,
        &mut reader,
        "1",
        "marks.record",
        Some(&fx.token),
        json!({
            "studentId": fx.student_id,
            "semesterId": fx.semester_id,
            "subjectId": "no-such-subject",
            "internalMarks": 10,
            "externalMarks": 10
        }),
    );
    assert_eq!(error_code(&no_subject), "subject_not_found");

    let internal_over = request(
        &mut stdin,
        &mut reader,
        "2",
        "marks.record",
        Some(&fx.token),
        json!({
            "studentId": fx.student_id,
            "semesterId": fx.semester_id,
            "subjectId": fx.subject_id,
            "internalMarks": 51,
            "externalMarks": 10
        }),
    );
    assert_eq!(error_code(&internal_over), "internal_marks_exceeded");
    assert_eq!(
        internal_over.pointer("/error/details/max").and_then(|v| v.as_i64()),
        Some(50)
    );

    let external_over = request(
        &mut stdin,
        &mut reader,
        "3",
        "marks.record",
        Some(&fx.token),
        json!({
            "studentId": fx.student_id,
            "semesterId": fx.semester_id,
            "subjectId": fx.subject_id,
            "internalMarks": 10,
            "externalMarks": 51
        }),
    );
    assert_eq!(error_code(&external_over), "external_marks_exceeded");

    let negative = request(
        &mut stdin,
        &mut reader,
        "4",
        "marks.record",
        Some(&fx.token),
        json!({
            "studentId": fx.student_id,
            "semesterId": fx.semester_id,
            "subjectId": fx.subject_id,
            "internalMarks": -1,
            "externalMarks": 10
        }),
    );
    assert_eq!(error_code(&negative), "bad_params");

    let no_student = request(
        &mut stdin,
        &mut reader,
        "5",
        "marks.record",
        Some(&fx.token),
        json!({
            "studentId": "no-such-student",
            "semesterId": fx.semester_id,
            "subjectId": fx.subject_id,
            "internalMarks": 10,
            "externalMarks": 10
        }),
    );
    assert_eq!(error_code(&no_student), "student_not_found");

    let no_semester = request(
        &mut stdin,
        &mut reader,
        "6",
        "marks.record",
        Some(&fx.token),
        json!({
            "studentId": fx.student_id,
            "semesterId": "no-such-semester",
            "subjectId": fx.subject_id,
            "internalMarks": 10,
            "externalMarks": 10
        }),
    );
    assert_eq!(error_code(&no_semester), "semester_not_found");

    // Nothing was written by any rejected call.
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "marks.forSemester",
        Some(&fx.token),
        json!({ "studentId": fx.student_id, "semesterId": fx.semester_id }),
    );
    assert_eq!(
        listed.get("marks").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0)
    );

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn update_rederives_total_and_pass() {
    let workspace = temp_dir("registrar-marks-update");
    let (_child, mut stdin, mut reader) = spawn_daemon();
    let fx = setup_fixture(&mut stdin, &mut reader, &workspace);

    let recorded = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "marks.record",
        Some(&fx.token),
        json!({
            "studentId": fx.student_id,
            "semesterId": fx.semester_id,
            "subjectId": fx.subject_id,
            "internalMarks": 10,
            "externalMarks": 10
        }),
    );
    assert_eq!(recorded.get("isPass").and_then(|v| v.as_bool()), Some(false));
    let mark_id = recorded
        .get("markId")
        .and_then(|v| v.as_str())
        .expect("markId")
        .to_string();

    // Only the internal component changes; the rest is re-derived.
    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "marks.update",
        Some(&fx.token),
        json!({ "markId": mark_id, "internalMarks": 30, "externalMarks": 25 }),
    );
    assert_eq!(updated.get("totalMarks").and_then(|v| v.as_i64()), Some(55));
    assert_eq!(updated.get("isPass").and_then(|v| v.as_bool()), Some(true));

    let over = request(
        &mut stdin,
        &mut reader,
        "3",
        "marks.update",
        Some(&fx.token),
        json!({ "markId": mark_id, "internalMarks": 99 }),
    );
    assert_eq!(error_code(&over), "internal_marks_exceeded");

    let missing = request(
        &mut stdin,
        &mut reader,
        "4",
        "marks.update",
        Some(&fx.token),
        json!({ "markId": "no-such-mark", "internalMarks": 10 }),
    );
    assert_eq!(error_code(&missing), "marks_not_found");

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn delete_for_semester_clears_the_pair() {
    let workspace = temp_dir("registrar-marks-delete");
    let (_child, mut stdin, mut reader) = spawn_daemon();
    let fx = setup_fixture(&mut stdin, &mut reader, &workspace);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "marks.record",
        Some(&fx.token),
        json!({
            "studentId": fx.student_id,
            "semesterId": fx.semester_id,
            "subjectId": fx.subject_id,
            "internalMarks": 30,
            "externalMarks": 30
        }),
    );

    let deleted = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "marks.deleteForSemester",
        Some(&fx.token),
        json!({ "studentId": fx.student_id, "semesterId": fx.semester_id }),
    );
    assert_eq!(deleted.get("deleted").and_then(|v| v.as_i64()), Some(1));

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "marks.forSemester",
        Some(&fx.token),
        json!({ "studentId": fx.student_id, "semesterId": fx.semester_id }),
    );
    assert_eq!(
        listed.get("marks").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0)
    );

    let _ = std::fs::remove_dir_all(workspace);
}
