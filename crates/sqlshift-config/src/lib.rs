pub mod loader;
pub mod model;

pub use loader::{ConfigLoader, apply_env_overrides, parse_bool};
pub use model::{AppConfig, DatabaseConfig, Environment, MigrationsConfig};
