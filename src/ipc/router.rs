use super::handlers;
use super::types::{AppState, Request};
use crate::auth::{self, Role};
use crate::ipc::error::err;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Open,
    Session,
    Admin,
}

/// Access policy per method. Hierarchy reads are open, every write and the
/// whole identity surface needs an admin; unknown methods default to Admin
/// so nothing new ships ungated by accident.
fn required_access(method: &str) -> Access {
    match method {
        "health" | "workspace.select" | "auth.signup" | "auth.login" => Access::Open,
        "branches.list" | "branches.get" | "subjects.list" | "subjects.get"
        | "semesters.list" | "semesters.get" | "batches.list" | "batches.get" => Access::Open,
        "auth.me" | "auth.logout" => Access::Session,
        "faculty.list" | "faculty.get" => Access::Session,
        "students.semesters" => Access::Session,
        "marks.record" | "marks.bulkRecord" | "marks.update" | "marks.forSemester" => {
            Access::Session
        }
        "certificates.provisional" => Access::Session,
        _ => Access::Admin,
    }
}

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    let access = required_access(&req.method);
    if access != Access::Open {
        let Some(conn) = state.db.as_ref() else {
            return err(&req.id, "no_workspace", "select a workspace first", None);
        };
        let Some(token) = req.token.as_deref() else {
            return err(&req.id, "unauthenticated", "missing session token", None);
        };
        match auth::authenticate(conn, token, &state.config) {
            Ok(Some(user)) => {
                if access == Access::Admin && user.role != Role::Admin {
                    return err(&req.id, "forbidden", "admin role required", None);
                }
            }
            Ok(None) => {
                return err(&req.id, "unauthenticated", "invalid or expired session", None)
            }
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }

    if let Some(resp) = handlers::core::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::auth::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::admins::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::faculty::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::students::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::branches::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::subjects::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::semesters::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::batches::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::marks::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::certificates::try_handle(state, &req) {
        return resp;
    }

    err(
        &req.id,
        "not_implemented",
        format!("unknown method: {}", req.method),
        None,
    )
}
