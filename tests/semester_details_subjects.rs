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

fn bootstrap_admin(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &std::path::Path,
) -> String {
    let _ = request_ok(
        stdin,
        reader,
        "b1",
        "workspace.select",
        None,
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        stdin,
        reader,
        "b2",
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
        "b3",
        "auth.login",
        None,
        json!({ "email": "root@inst.test", "password": "pw-secret-1" }),
    );
    login
        .get("token")
        .and_then(|v| v.as_str())
        .expect("token")
        .to_string()
}

/// branch -> batch -> (batch_id, semester_ids)
fn provision_batch(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    token: &str,
    branch_title: &str,
) -> (String, Vec<String>) {
    let branch = request_ok(
        stdin,
        reader,
        "p1",
        "branches.create",
        Some(token),
        json!({ "title": branch_title }),
    );
    let branch_id = branch
        .get("branchId")
        .and_then(|v| v.as_str())
        .expect("branchId")
        .to_string();
    let created = request_ok(
        stdin,
        reader,
        "p2",
        "batches.create",
        Some(token),
        json!({ "branchId": branch_id, "startYear": 2024, "endYear": 2027 }),
    );
    let batch_id = created
        .get("batchId")
        .and_then(|v| v.as_str())
        .expect("batchId")
        .to_string();
    let semester_ids = created
        .get("semesterIds")
        .and_then(|v| v.as_array())
        .expect("semesterIds")
        .iter()
        .filter_map(|v| v.as_str().map(String::from))
        .collect();
    (batch_id, semester_ids)
}

#[test]
fn semester_details_set_dates_and_assign_subjects() {
    let workspace = temp_dir("registrar-semdetails");
    let (_child, mut stdin, mut reader) = spawn_daemon();
    let token = bootstrap_admin(&mut stdin, &mut reader, &workspace);
    let (batch_id, semester_ids) = provision_batch(&mut stdin, &mut reader, &token, "CS");

    let subject = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "subjects.create",
        Some(&token),
        json!({ "title": "Data Structures", "code": "CS201" }),
    );
    let subject_id = subject
        .get("subjectId")
        .and_then(|v| v.as_str())
        .expect("subjectId")
        .to_string();

    let result = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "batches.addSemesterDetails",
        Some(&token),
        json!({
            "batchId": batch_id,
            "semesters": [{
                "semesterId": semester_ids[0],
                "startDate": "2024-08-01",
                "endDate": "2024-12-20",
                "subjectIds": [subject_id]
            }]
        }),
    );
    assert_eq!(result.get("semestersUpdated").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(result.get("subjectsAssigned").and_then(|v| v.as_i64()), Some(1));

    let got = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "batches.get",
        None,
        json!({ "batchId": batch_id }),
    );
    let first = got
        .pointer("/semesters/0")
        .expect("first semester");
    assert_eq!(
        first.get("startDate").and_then(|v| v.as_str()),
        Some("2024-08-01")
    );
    assert_eq!(
        first.get("endDate").and_then(|v| v.as_str()),
        Some("2024-12-20")
    );

    // The assignment is visible from the semester side too.
    let sem = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "semesters.get",
        None,
        json!({ "semesterId": semester_ids[0] }),
    );
    let codes: Vec<&str> = sem
        .get("subjects")
        .and_then(|v| v.as_array())
        .expect("subjects")
        .iter()
        .filter_map(|s| s.get("code").and_then(|v| v.as_str()))
        .collect();
    assert_eq!(codes, vec!["CS201"]);

    // Re-assigning the same subject is idempotent.
    let again = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "batches.addSemesterDetails",
        Some(&token),
        json!({
            "batchId": batch_id,
            "semesters": [{ "semesterId": semester_ids[0], "subjectIds": [subject_id] }]
        }),
    );
    assert_eq!(again.get("semestersUpdated").and_then(|v| v.as_i64()), Some(1));
    let sem = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "semesters.get",
        None,
        json!({ "semesterId": semester_ids[0] }),
    );
    assert_eq!(
        sem.get("subjects").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(1)
    );

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn foreign_semester_aborts_the_whole_update() {
    let workspace = temp_dir("registrar-semdetails-foreign");
    let (_child, mut stdin, mut reader) = spawn_daemon();
    let token = bootstrap_admin(&mut stdin, &mut reader, &workspace);
    let (batch_a, semesters_a) = provision_batch(&mut stdin, &mut reader, &token, "CS");
    let (_batch_b, semesters_b) = provision_batch(&mut stdin, &mut reader, &token, "EE");

    // First entry is valid, second addresses another batch's semester.
    let mixed = request(
        &mut stdin,
        &mut reader,
        "1",
        "batches.addSemesterDetails",
        Some(&token),
        json!({
            "batchId": batch_a,
            "semesters": [
                { "semesterId": semesters_a[0], "startDate": "2024-08-01" },
                { "semesterId": semesters_b[0], "startDate": "2024-08-01" }
            ]
        }),
    );
    assert_eq!(error_code(&mixed), "semester_not_in_batch");

    // The valid first entry was rolled back with the rest.
    let got = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "batches.get",
        None,
        json!({ "batchId": batch_a }),
    );
    assert!(got
        .pointer("/semesters/0/startDate")
        .map(|v| v.is_null())
        .unwrap_or(false));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn unknown_subject_rolls_back_date_updates() {
    let workspace = temp_dir("registrar-semdetails-subject");
    let (_child, mut stdin, mut reader) = spawn_daemon();
    let token = bootstrap_admin(&mut stdin, &mut reader, &workspace);
    let (batch_id, semester_ids) = provision_batch(&mut stdin, &mut reader, &token, "CS");

    let bad = request(
        &mut stdin,
        &mut reader,
        "1",
        "batches.addSemesterDetails",
        Some(&token),
        json!({
            "batchId": batch_id,
            "semesters": [{
                "semesterId": semester_ids[0],
                "startDate": "2024-08-01",
                "subjectIds": ["no-such-subject"]
            }]
        }),
    );
    assert_eq!(error_code(&bad), "subject_not_found");

    let got = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "batches.get",
        None,
        json!({ "batchId": batch_id }),
    );
    assert!(got
        .pointer("/semesters/0/startDate")
        .map(|v| v.is_null())
        .unwrap_or(false));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn unknown_batch_is_reported_before_any_update() {
    let workspace = temp_dir("registrar-semdetails-nobatch");
    let (_child, mut stdin, mut reader) = spawn_daemon();
    let token = bootstrap_admin(&mut stdin, &mut reader, &workspace);

    let missing = request(
        &mut stdin,
        &mut reader,
        "1",
        "batches.addSemesterDetails",
        Some(&token),
        json!({
            "batchId": "no-such-batch",
            "semesters": [{ "semesterId": "whatever" }]
        }),
    );
    assert_eq!(error_code(&missing), "batch_not_found");

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn assigned_subject_cannot_be_deleted() {
    let workspace = temp_dir("registrar-subject-delete");
    let (_child, mut stdin, mut reader) = spawn_daemon();
    let token = bootstrap_admin(&mut stdin, &mut reader, &workspace);
    let (batch_id, semester_ids) = provision_batch(&mut stdin, &mut reader, &token, "CS");

    let subject = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "subjects.create",
        Some(&token),
        json!({ "title": "Operating Systems", "code": "CS301" }),
    );
    let subject_id = subject
        .get("subjectId")
        .and_then(|v| v.as_str())
        .expect("subjectId")
        .to_string();
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "batches.addSemesterDetails",
        Some(&token),
        json!({
            "batchId": batch_id,
            "semesters": [{ "semesterId": semester_ids[0], "subjectIds": [subject_id] }]
        }),
    );

    let refused = request(
        &mut stdin,
        &mut reader,
        "3",
        "subjects.delete",
        Some(&token),
        json!({ "subjectId": subject_id }),
    );
    assert_eq!(error_code(&refused), "subject_in_use");

    // An unreferenced subject deletes cleanly.
    let spare = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "subjects.create",
        Some(&token),
        json!({ "title": "Discrete Mathematics", "code": "MA102" }),
    );
    let spare_id = spare
        .get("subjectId")
        .and_then(|v| v.as_str())
        .expect("subjectId")
        .to_string();
    let deleted = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "subjects.delete",
        Some(&token),
        json!({ "subjectId": spare_id }),
    );
    assert_eq!(deleted.get("deleted").and_then(|v| v.as_bool()), Some(true));
    let gone = request(
        &mut stdin,
        &mut reader,
        "6",
        "subjects.get",
        None,
        json!({ "subjectId": spare_id }),
    );
    assert_eq!(error_code(&gone), "subject_not_found");

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn batch_owned_semester_cannot_be_deleted() {
    let workspace = temp_dir("registrar-semester-delete");
    let (_child, mut stdin, mut reader) = spawn_daemon();
    let token = bootstrap_admin(&mut stdin, &mut reader, &workspace);
    let (_batch_id, semester_ids) = provision_batch(&mut stdin, &mut reader, &token, "CS");

    let refused = request(
        &mut stdin,
        &mut reader,
        "1",
        "semesters.delete",
        Some(&token),
        json!({ "semesterId": semester_ids[0] }),
    );
    assert_eq!(error_code(&refused), "semester_in_use");

    // A standalone semester with no history deletes cleanly.
    let spare = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "semesters.create",
        Some(&token),
        json!({ "title": "bridge" }),
    );
    let spare_id = spare
        .get("semesterId")
        .and_then(|v| v.as_str())
        .expect("semesterId")
        .to_string();
    let deleted = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "semesters.delete",
        Some(&token),
        json!({ "semesterId": spare_id }),
    );
    assert_eq!(deleted.get("deleted").and_then(|v| v.as_bool()), Some(true));

    let _ = std::fs::remove_dir_all(workspace);
}
