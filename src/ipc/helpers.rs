use chrono::Utc;
use serde_json::json;

use crate::directory::DirectoryError;
use crate::ipc::error::err;

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(
        code: &'static str,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn db_query(e: rusqlite::Error) -> Self {
        Self::new("db_query_failed", e.to_string())
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

impl From<DirectoryError> for HandlerErr {
    fn from(e: DirectoryError) -> Self {
        match e {
            DirectoryError::EmailConflict => HandlerErr::new("email_conflict", e.to_string()),
            DirectoryError::PhoneConflict => HandlerErr::new("phone_conflict", e.to_string()),
            DirectoryError::EmailDomainNotAllowed => {
                HandlerErr::new("email_domain_not_allowed", e.to_string())
            }
            DirectoryError::Db(inner) => HandlerErr::new("db_query_failed", inner.to_string()),
            DirectoryError::Hash(m) => HandlerErr::new("internal_error", m),
        }
    }
}

pub fn req_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    match params.get(key).and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(HandlerErr::with_details(
            "bad_params",
            format!("missing {key}"),
            json!({ "field": key }),
        )),
    }
}

pub fn opt_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn req_i64(params: &serde_json::Value, key: &str) -> Result<i64, HandlerErr> {
    match params.get(key).and_then(|v| v.as_i64()) {
        Some(v) => Ok(v),
        None => Err(HandlerErr::with_details(
            "bad_params",
            format!("missing/invalid {key}"),
            json!({ "field": key }),
        )),
    }
}

pub fn opt_i64(params: &serde_json::Value, key: &str) -> Option<i64> {
    params.get(key).and_then(|v| v.as_i64())
}

pub fn now() -> String {
    Utc::now().to_rfc3339()
}
