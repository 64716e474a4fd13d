//! Environment configuration.
//!
//! Loaded once at startup; a `.env` file is honored when present.

use dotenvy::dotenv;
use std::env::var;

/// Runtime configuration with environment variable overrides.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen port.
    /// Env: PORT (default: 8080)
    pub port: u16,

    /// Connection string for the persistence collaborator.
    /// Env: DATABASE_URL (optional; unset disables the store)
    pub database_url: Option<String>,
}

impl Config {
    /// Load configuration from environment variables with defaults.
    pub fn from_env() -> Self {
        let _ = dotenv();
        Self {
            port: env_or_default("PORT", 8080),
            database_url: var("DATABASE_URL").ok().filter(|url| !url.is_empty()),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            database_url: None,
        }
    }
}

/// Parse environment variable or return default value.
fn env_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    var(key)
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(default)
}
