use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration, as read from `sqlshift.yml` / `sqlshift.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub environment: Environment,
    pub database: DatabaseConfig,
    pub migrations: MigrationsConfig,
}

/// Deployment environment. Decides whether a failed startup migration
/// terminates the process or is handed back to the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Production,
    Staging,
    #[default]
    Development,
    Test,
}

impl Environment {
    pub fn is_production(self) -> bool {
        matches!(self, Environment::Production)
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Environment::Production => "production",
            Environment::Staging => "staging",
            Environment::Development => "development",
            Environment::Test => "test",
        };
        f.write_str(s)
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Environment::Production),
            "staging" | "stage" => Ok(Environment::Staging),
            "development" | "dev" => Ok(Environment::Development),
            "test" => Ok(Environment::Test),
            other => Err(format!("unknown environment: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file, or `:memory:`.
    pub path: PathBuf,
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/app.db"),
            busy_timeout_ms: 5_000,
        }
    }
}

impl DatabaseConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationsConfig {
    pub dir: PathBuf,
    pub extension: String,
    /// Ledger table name. The lock table is `<table>_lock`.
    pub table: String,
    pub auto_run: bool,
    pub verify_checksums: bool,
    pub lock_timeout_secs: u64,
    pub stale_lock_secs: u64,
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("migrations"),
            extension: "sql".to_string(),
            table: "schema_migrations".to_string(),
            auto_run: false,
            verify_checksums: true,
            lock_timeout_secs: 30,
            stale_lock_secs: 900,
        }
    }
}

impl MigrationsConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn stale_lock_after(&self) -> Duration {
        Duration::from_secs(self.stale_lock_secs)
    }
}
