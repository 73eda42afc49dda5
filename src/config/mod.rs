//! Typed configuration from environment variables.
//!
//! Loaded once at startup; fails fast when `DATABASE_URL` is missing or a
//! numeric setting does not parse. The database URL may carry a password,
//! so it is held as a `SecretString`.

use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::engine::DEFAULT_LOCK_CAPACITY;
use crate::error::{Error, Result};

pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

#[derive(Debug)]
pub struct Config {
    /// `postgres://...` selects the Postgres store; anything else is a
    /// SQLite URL or path.
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub sweep_interval: Duration,
    pub max_connections: u32,
    pub lock_table_capacity: usize,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let sweep_secs: u64 =
            parsed_var("TXQ_SWEEP_INTERVAL_SECS", DEFAULT_SWEEP_INTERVAL_SECS)?;
        if sweep_secs == 0 {
            return Err(Error::Config(
                "TXQ_SWEEP_INTERVAL_SECS must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            sweep_interval: Duration::from_secs(sweep_secs),
            max_connections: parsed_var("TXQ_MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS)?,
            lock_table_capacity: parsed_var("TXQ_LOCK_TABLE_CAPACITY", DEFAULT_LOCK_CAPACITY)?,
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{name}={raw:?} is not valid: {e}"))),
        Err(_) => Ok(default),
    }
}
