mod auth;
mod certificate;
mod config;
mod db;
mod directory;
mod grading;
mod ipc;

use std::io::{self, BufRead, Write};
use std::path::Path;

use anyhow::{bail, Context};
use tracing::info;
use uuid::Uuid;

use crate::directory::{AdminDesignation, NewUser};

fn main() -> anyhow::Result<()> {
    // All logging goes to stderr; stdout carries only protocol frames.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.first().map(String::as_str) == Some("create-admin") {
        return create_admin(&args[1..]);
    }
    if !args.is_empty() {
        bail!("unknown argument: {} (usage: registrard [create-admin <workspace> <email> <phone> <password> [first_name]])", args[0]);
    }

    serve()
}

fn serve() -> anyhow::Result<()> {
    let mut state = ipc::AppState {
        workspace: None,
        db: None,
        config: config::Config::load(),
    };

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // Can't reply with an id we never parsed.
                let frame = serde_json::json!({
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() }
                });
                let _ = writeln!(stdout, "{frame}");
                let _ = stdout.flush();
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
    Ok(())
}

/// Out-of-band bootstrap for a fresh workspace, so the first admin can be
/// provisioned without a session.
fn create_admin(args: &[String]) -> anyhow::Result<()> {
    let [workspace, email, phone, password, rest @ ..] = args else {
        bail!("usage: registrard create-admin <workspace> <email> <phone> <password> [first_name]");
    };
    let first_name = rest.first().map(String::as_str).unwrap_or("Admin");

    let cfg = config::Config::load();
    let conn = db::open_db(Path::new(workspace)).context("open workspace database")?;

    let tx = conn.unchecked_transaction()?;
    let user_id = directory::insert_user(
        &tx,
        &NewUser {
            first_name,
            middle_name: None,
            last_name: None,
            email,
            phone,
            password,
            role: auth::Role::Admin,
        },
        cfg.institute_domain.as_deref(),
    )
    .map_err(|e| anyhow::anyhow!("{e}"))?;
    tx.execute(
        "INSERT INTO admins(id, user_id, designation) VALUES(?, ?, ?)",
        (
            Uuid::new_v4().to_string(),
            &user_id,
            AdminDesignation::Principal.as_str(),
        ),
    )?;
    tx.commit()?;

    info!(user_id = %user_id, email = %email, "admin created");
    println!("{user_id}");
    Ok(())
}
