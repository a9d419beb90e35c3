use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("registrar.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            first_name TEXT NOT NULL,
            middle_name TEXT,
            last_name TEXT,
            email TEXT NOT NULL UNIQUE,
            phone TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            role TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_users_role ON users(role)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS branches(
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL UNIQUE,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS admins(
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL UNIQUE,
            designation TEXT NOT NULL,
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS faculty(
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL UNIQUE,
            designation TEXT NOT NULL,
            branch_id TEXT NOT NULL,
            FOREIGN KEY(user_id) REFERENCES users(id),
            FOREIGN KEY(branch_id) REFERENCES branches(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_faculty_branch ON faculty(branch_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS batches(
            id TEXT PRIMARY KEY,
            branch_id TEXT NOT NULL,
            start_year INTEGER NOT NULL,
            end_year INTEGER NOT NULL,
            type TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(branch_id) REFERENCES branches(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_batches_branch ON batches(branch_id)",
        [],
    )?;

    // One authoritative Batch<->Semester model: a semester optionally
    // belongs to a batch. Standalone semesters keep batch_id NULL.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS semesters(
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            start_date TEXT,
            end_date TEXT,
            batch_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(batch_id) REFERENCES batches(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_semesters_batch ON semesters(batch_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            code TEXT NOT NULL UNIQUE,
            internal_max INTEGER NOT NULL DEFAULT 50,
            external_max INTEGER NOT NULL DEFAULT 50,
            internal_passing INTEGER NOT NULL DEFAULT 20,
            external_passing INTEGER NOT NULL DEFAULT 20,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL UNIQUE,
            batch_id TEXT NOT NULL,
            registration_number INTEGER NOT NULL UNIQUE,
            father_name TEXT NOT NULL,
            mother_name TEXT NOT NULL,
            category TEXT NOT NULL,
            current_semester_id TEXT NOT NULL,
            FOREIGN KEY(user_id) REFERENCES users(id),
            FOREIGN KEY(batch_id) REFERENCES batches(id),
            FOREIGN KEY(current_semester_id) REFERENCES semesters(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_batch ON students(batch_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS semester_branches(
            semester_id TEXT NOT NULL,
            branch_id TEXT NOT NULL,
            PRIMARY KEY(semester_id, branch_id),
            FOREIGN KEY(semester_id) REFERENCES semesters(id),
            FOREIGN KEY(branch_id) REFERENCES branches(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subject_semester_branches(
            id TEXT PRIMARY KEY,
            subject_id TEXT NOT NULL,
            semester_id TEXT NOT NULL,
            branch_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE(subject_id, semester_id, branch_id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(semester_id) REFERENCES semesters(id),
            FOREIGN KEY(branch_id) REFERENCES branches(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_ssb_semester ON subject_semester_branches(semester_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_semesters(
            student_id TEXT NOT NULL,
            semester_id TEXT NOT NULL,
            PRIMARY KEY(student_id, semester_id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(semester_id) REFERENCES semesters(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_marks(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            semester_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            internal_marks INTEGER NOT NULL,
            external_marks INTEGER NOT NULL,
            total_marks INTEGER NOT NULL,
            is_pass INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE(student_id, semester_id, subject_id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(semester_id) REFERENCES semesters(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_marks_student ON student_marks(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_marks_semester ON student_marks(semester_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sessions(
            id TEXT PRIMARY KEY,
            token_hash TEXT NOT NULL UNIQUE,
            user_id TEXT NOT NULL,
            expires_at TEXT NOT NULL,
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id)",
        [],
    )?;

    Ok(conn)
}

/// True when `e` is a UNIQUE constraint failure mentioning `column`
/// (e.g. "users.email"). Used to map insert races onto conflict codes.
pub fn is_unique_violation(e: &rusqlite::Error, column: &str) -> bool {
    match e {
        rusqlite::Error::SqliteFailure(f, msg) => {
            f.code == rusqlite::ErrorCode::ConstraintViolation
                && msg.as_deref().map(|m| m.contains(column)).unwrap_or(false)
        }
        _ => false,
    }
}
