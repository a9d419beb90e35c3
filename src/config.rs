use std::{env, fmt::Display, str::FromStr};

use tracing::warn;

/// Environment-driven daemon configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// When set, signup/creation emails must belong to this domain.
    pub institute_domain: Option<String>,
    pub session_ttl_days: i64,
    pub session_renew_days: i64,
}

impl Config {
    pub fn load() -> Self {
        Self {
            institute_domain: env::var("INSTITUTE_DOMAIN")
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
            session_ttl_days: try_load("SESSION_TTL_DAYS", "30"),
            session_renew_days: try_load("SESSION_RENEW_DAYS", "15"),
        }
    }
}

fn try_load<T: FromStr>(key: &str, default: &str) -> T
where
    T::Err: Display,
{
    let raw = env::var(key).unwrap_or_else(|_| default.to_string());
    match raw.parse() {
        Ok(v) => v,
        Err(e) => {
            warn!("invalid {key} value ({e}), using default {default}");
            default
                .parse()
                .unwrap_or_else(|_| panic!("default for {key} must parse"))
        }
    }
}
