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

#[test]
fn regular_batch_provisions_six_ordered_semesters() {
    let workspace = temp_dir("registrar-batch-regular");
    let (_child, mut stdin, mut reader) = spawn_daemon();
    let token = bootstrap_admin(&mut stdin, &mut reader, &workspace);

    let branch = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "branches.create",
        Some(&token),
        json!({ "title": "Computer Science" }),
    );
    let branch_id = branch
        .get("branchId")
        .and_then(|v| v.as_str())
        .expect("branchId")
        .to_string();

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "batches.create",
        Some(&token),
        json!({
            "branchId": branch_id,
            "startYear": 2024,
            "endYear": 2027,
            "type": "regular"
        }),
    );
    let batch_id = created
        .get("batchId")
        .and_then(|v| v.as_str())
        .expect("batchId")
        .to_string();
    assert_eq!(
        created
            .get("semesterIds")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(6)
    );

    let got = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "batches.get",
        None,
        json!({ "batchId": batch_id }),
    );
    let titles: Vec<&str> = got
        .get("semesters")
        .and_then(|v| v.as_array())
        .expect("semesters")
        .iter()
        .filter_map(|s| s.get("title").and_then(|v| v.as_str()))
        .collect();
    assert_eq!(titles, vec!["1", "2", "3", "4", "5", "6"]);
    assert_eq!(got.get("type").and_then(|v| v.as_str()), Some("regular"));
    assert_eq!(
        got.get("branch").and_then(|v| v.as_str()),
        Some("Computer Science")
    );

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn ptd_batch_provisions_eight_semesters() {
    let workspace = temp_dir("registrar-batch-ptd");
    let (_child, mut stdin, mut reader) = spawn_daemon();
    let token = bootstrap_admin(&mut stdin, &mut reader, &workspace);

    let branch = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "branches.create",
        Some(&token),
        json!({ "title": "Electronics" }),
    );
    let branch_id = branch
        .get("branchId")
        .and_then(|v| v.as_str())
        .expect("branchId")
        .to_string();

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "batches.create",
        Some(&token),
        json!({
            "branchId": branch_id,
            "startYear": 2024,
            "endYear": 2028,
            "type": "ptd"
        }),
    );
    assert_eq!(
        created
            .get("semesterIds")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(8)
    );

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn batch_create_rejects_bad_input_without_partial_writes() {
    let workspace = temp_dir("registrar-batch-invalid");
    let (_child, mut stdin, mut reader) = spawn_daemon();
    let token = bootstrap_admin(&mut stdin, &mut reader, &workspace);

    let missing_branch = request(
        &mut stdin,
        &mut reader,
        "1",
        "batches.create",
        Some(&token),
        json!({
            "branchId": "no-such-branch",
            "startYear": 2024,
            "endYear": 2027
        }),
    );
    assert_eq!(error_code(&missing_branch), "branch_not_found");

    let branch = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "branches.create",
        Some(&token),
        json!({ "title": "Mechanical" }),
    );
    let branch_id = branch
        .get("branchId")
        .and_then(|v| v.as_str())
        .expect("branchId")
        .to_string();

    let bad_type = request(
        &mut stdin,
        &mut reader,
        "3",
        "batches.create",
        Some(&token),
        json!({
            "branchId": branch_id,
            "startYear": 2024,
            "endYear": 2027,
            "type": "evening"
        }),
    );
    assert_eq!(error_code(&bad_type), "bad_params");

    let inverted_years = request(
        &mut stdin,
        &mut reader,
        "4",
        "batches.create",
        Some(&token),
        json!({
            "branchId": branch_id,
            "startYear": 2027,
            "endYear": 2024
        }),
    );
    assert_eq!(error_code(&inverted_years), "bad_params");

    // None of the rejected calls left a batch or orphan semesters behind.
    let listed = request_ok(&mut stdin, &mut reader, "5", "batches.list", None, json!({}));
    assert_eq!(
        listed.get("batches").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0)
    );
    let conn = rusqlite::Connection::open(workspace.join("registrar.sqlite3"))
        .expect("open workspace db");
    let semesters: i64 = conn
        .query_row("SELECT COUNT(*) FROM semesters", [], |r| r.get(0))
        .expect("count semesters");
    assert_eq!(semesters, 0);

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn omitted_type_defaults_to_regular() {
    let workspace = temp_dir("registrar-batch-default");
    let (_child, mut stdin, mut reader) = spawn_daemon();
    let token = bootstrap_admin(&mut stdin, &mut reader, &workspace);

    let branch = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "branches.create",
        Some(&token),
        json!({ "title": "Civil" }),
    );
    let branch_id = branch
        .get("branchId")
        .and_then(|v| v.as_str())
        .expect("branchId")
        .to_string();

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "batches.create",
        Some(&token),
        json!({ "branchId": branch_id, "startYear": 2025, "endYear": 2028 }),
    );
    assert_eq!(
        created
            .get("semesterIds")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(6)
    );

    let _ = std::fs::remove_dir_all(workspace);
}
