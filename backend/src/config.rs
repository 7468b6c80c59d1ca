use std::env;

use anyhow::{Context, Result};

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8081;
pub const DEFAULT_BUSY_TIMEOUT_MS: u32 = 5000;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: String,
    pub port: u16,
    /// Allowed browser origin. Any origin when unset.
    pub cors_origin: Option<String>,
    pub busy_timeout_ms: u32,
}

impl Config {
    /// Reads `.env` (if present) and the process environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let database_url = get("DATABASE_URL").context("DATABASE_URL must be set")?;

        let port = match get("PORT") {
            Some(port) => port
                .parse()
                .with_context(|| format!("invalid PORT: {port}"))?,
            None => DEFAULT_PORT,
        };
        let busy_timeout_ms = match get("BUSY_TIMEOUT_MS") {
            Some(ms) => ms
                .parse()
                .with_context(|| format!("invalid BUSY_TIMEOUT_MS: {ms}"))?,
            None => DEFAULT_BUSY_TIMEOUT_MS,
        };

        Ok(Self {
            database_url,
            bind_addr: get("BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_owned()),
            port,
            cors_origin: get("CORS_ORIGIN").filter(|o| !o.trim().is_empty()),
            busy_timeout_ms,
        })
    }
}
