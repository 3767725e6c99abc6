use std::path::{Path, PathBuf};

use sqlshift_common::{Error, Result};
use tracing::{debug, info};

use crate::model::{AppConfig, Environment};

pub const ENV_ENVIRONMENT: &str = "SQLSHIFT_ENV";
pub const ENV_DATABASE_PATH: &str = "SQLSHIFT_DATABASE_PATH";
pub const ENV_MIGRATIONS_DIR: &str = "SQLSHIFT_MIGRATIONS_DIR";
pub const ENV_AUTO_MIGRATE: &str = "SQLSHIFT_AUTO_MIGRATE";

const LOCAL_CONFIG_FILES: &[&str] = &["sqlshift.yml", "sqlshift.yaml", "sqlshift.toml"];

/// Locates and parses the config file, then layers environment overrides on top.
pub struct ConfigLoader {
    explicit_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new(explicit_path: Option<PathBuf>) -> Self {
        Self { explicit_path }
    }

    /// The file that `load` will read, if any.
    ///
    /// An explicit path wins even when it does not exist (so that `load`
    /// reports it); otherwise the working directory is searched, then the
    /// user config directory.
    pub fn resolve_path(&self) -> Option<PathBuf> {
        if let Some(path) = &self.explicit_path {
            return Some(path.clone());
        }

        if let Some(found) = LOCAL_CONFIG_FILES
            .iter()
            .map(PathBuf::from)
            .find(|p| p.is_file())
        {
            return Some(found);
        }

        dirs::config_dir()
            .map(|dir| dir.join("sqlshift").join("config.yml"))
            .filter(|p| p.is_file())
    }

    pub fn load(&self) -> Result<AppConfig> {
        let mut config = match self.resolve_path() {
            Some(path) => {
                let config = Self::load_file(&path)?;
                info!("loaded config from {}", path.display());
                config
            }
            None => {
                debug!("no config file found, using defaults");
                AppConfig::default()
            }
        };

        apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn load_file(path: &Path) -> Result<AppConfig> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {e}", path.display()))
        })?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        match ext {
            "yml" | "yaml" => serde_yaml::from_str(&contents)
                .map_err(|e| Error::Config(format!("YAML parse error in {}: {e}", path.display()))),
            "toml" => toml::from_str(&contents)
                .map_err(|e| Error::Config(format!("TOML parse error in {}: {e}", path.display()))),
            other => Err(Error::Config(format!(
                "unsupported config extension: {other}"
            ))),
        }
    }
}

/// Apply `SQLSHIFT_*` overrides. `lookup` is `std::env::var` in production and
/// a map in tests.
pub fn apply_env_overrides<F>(config: &mut AppConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = lookup(ENV_ENVIRONMENT) {
        config.environment = value
            .parse::<Environment>()
            .map_err(|e| Error::Config(format!("{ENV_ENVIRONMENT}: {e}")))?;
    }
    if let Some(value) = lookup(ENV_DATABASE_PATH) {
        config.database.path = PathBuf::from(value);
    }
    if let Some(value) = lookup(ENV_MIGRATIONS_DIR) {
        config.migrations.dir = PathBuf::from(value);
    }
    if let Some(value) = lookup(ENV_AUTO_MIGRATE) {
        config.migrations.auto_run = parse_bool(&value)
            .ok_or_else(|| Error::Config(format!("{ENV_AUTO_MIGRATE}: not a boolean: {value}")))?;
    }
    Ok(())
}

/// Parse a boolean-like flag (`1/true/yes/on`, `0/false/no/off`).
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn parse_bool_accepts_common_spellings() {
        for v in ["1", "true", "TRUE", "yes", " on "] {
            assert_eq!(parse_bool(v), Some(true), "{v}");
        }
        for v in ["0", "false", "No", "off", ""] {
            assert_eq!(parse_bool(v), Some(false), "{v}");
        }
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn loads_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sqlshift.yml");
        std::fs::write(
            &path,
            "environment: production\n\
             database:\n  path: /var/lib/app/app.db\n\
             migrations:\n  dir: /srv/migrations\n  auto_run: true\n",
        )
        .unwrap();

        let config = ConfigLoader::load_file(&path).unwrap();
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.database.path, PathBuf::from("/var/lib/app/app.db"));
        assert_eq!(config.migrations.dir, PathBuf::from("/srv/migrations"));
        assert!(config.migrations.auto_run);
        // Unspecified fields keep their defaults.
        assert_eq!(config.migrations.table, "schema_migrations");
        assert_eq!(config.database.busy_timeout_ms, 5_000);
    }

    #[test]
    fn loads_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sqlshift.toml");
        std::fs::write(
            &path,
            "environment = \"test\"\n\n[migrations]\ntable = \"ledger\"\nverify_checksums = false\n",
        )
        .unwrap();

        let config = ConfigLoader::load_file(&path).unwrap();
        assert_eq!(config.environment, Environment::Test);
        assert_eq!(config.migrations.table, "ledger");
        assert!(!config.migrations.verify_checksums);
    }

    #[test]
    fn rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sqlshift.ini");
        std::fs::write(&path, "x=1").unwrap();

        let err = ConfigLoader::load_file(&path).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let loader = ConfigLoader::new(Some(PathBuf::from("/nonexistent/sqlshift.yml")));
        assert!(matches!(loader.load(), Err(Error::Config(_))));
    }

    #[test]
    fn env_overrides_take_precedence() {
        let mut config = AppConfig::default();
        let lookup = lookup_from(&[
            (ENV_ENVIRONMENT, "production"),
            (ENV_DATABASE_PATH, "/tmp/override.db"),
            (ENV_MIGRATIONS_DIR, "/tmp/migrations"),
            (ENV_AUTO_MIGRATE, "yes"),
        ]);

        apply_env_overrides(&mut config, lookup).unwrap();
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.database.path, PathBuf::from("/tmp/override.db"));
        assert_eq!(config.migrations.dir, PathBuf::from("/tmp/migrations"));
        assert!(config.migrations.auto_run);
    }

    #[test]
    fn invalid_auto_migrate_flag_is_rejected() {
        let mut config = AppConfig::default();
        let err = apply_env_overrides(&mut config, lookup_from(&[(ENV_AUTO_MIGRATE, "sometimes")]))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_AUTO_MIGRATE));
    }
}
