use std::path::{Path, PathBuf};

use ring::digest::{SHA256, digest};
use serde::Serialize;
use sqlshift_common::{Error, Result};
use tracing::debug;

/// One versioned SQL script discovered on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationScript {
    pub filename: String,
    #[serde(skip)]
    pub sql: String,
    pub checksum: String,
}

impl MigrationScript {
    pub fn new(filename: impl Into<String>, sql: impl Into<String>) -> Self {
        let sql = sql.into();
        let checksum = checksum(&sql);
        Self {
            filename: filename.into(),
            sql,
            checksum,
        }
    }
}

/// Lowercase hex SHA-256 of the script text.
pub fn checksum(sql: &str) -> String {
    hex::encode(digest(&SHA256, sql.as_bytes()))
}

/// Reads migration scripts from a directory in filename order.
///
/// Ordering is plain lexicographic, so scripts should carry a fixed-width
/// numeric prefix (`001_`, `002_`, ... `010_`).
#[derive(Debug, Clone)]
pub struct ScriptStore {
    dir: PathBuf,
    extension: String,
}

impl ScriptStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            extension: "sql".to_string(),
        }
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into().trim_start_matches('.').to_string();
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn list_all(&self) -> Result<Vec<MigrationScript>> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| self.discovery_error(&self.dir, e))?;

        let mut scripts = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| self.discovery_error(&self.dir, e))?;
            let path = entry.path();
            if !path.is_file() || !self.matches_extension(&path) {
                continue;
            }

            let filename = entry.file_name().into_string().map_err(|name| Error::Discovery {
                path: self.dir.display().to_string(),
                message: format!("file name is not valid UTF-8: {}", name.to_string_lossy()),
            })?;

            let sql = std::fs::read_to_string(&path).map_err(|e| self.discovery_error(&path, e))?;
            scripts.push(MigrationScript::new(filename, sql));
        }

        scripts.sort_by(|a, b| a.filename.cmp(&b.filename));
        debug!(
            "discovered {} migration script(s) in {}",
            scripts.len(),
            self.dir.display()
        );
        Ok(scripts)
    }

    fn matches_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(&self.extension))
    }

    fn discovery_error(&self, path: &Path, e: std::io::Error) -> Error {
        Error::Discovery {
            path: path.display().to_string(),
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, contents: &str) {
        std::fs::write(dir.join(name), contents).unwrap();
    }

    #[test]
    fn lists_scripts_in_filename_order() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "010_c.sql", "SELECT 3;");
        write(dir.path(), "001_a.sql", "SELECT 1;");
        write(dir.path(), "002_b.sql", "SELECT 2;");

        let scripts = ScriptStore::new(dir.path()).list_all().unwrap();
        let names: Vec<_> = scripts.iter().map(|s| s.filename.as_str()).collect();
        assert_eq!(names, ["001_a.sql", "002_b.sql", "010_c.sql"]);
        assert_eq!(scripts[0].sql, "SELECT 1;");
    }

    #[test]
    fn unpadded_prefixes_sort_lexicographically() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "9_late.sql", "");
        write(dir.path(), "10_later.sql", "");

        let scripts = ScriptStore::new(dir.path()).list_all().unwrap();
        assert_eq!(scripts[0].filename, "10_later.sql");
        assert_eq!(scripts[1].filename, "9_late.sql");
    }

    #[test]
    fn skips_other_extensions_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "001_a.sql", "SELECT 1;");
        write(dir.path(), "002_b.SQL", "SELECT 2;");
        write(dir.path(), "README.md", "# notes");
        write(dir.path(), "003_c.sql.bak", "SELECT 3;");
        std::fs::create_dir(dir.path().join("004_dir.sql")).unwrap();

        let scripts = ScriptStore::new(dir.path()).list_all().unwrap();
        let names: Vec<_> = scripts.iter().map(|s| s.filename.as_str()).collect();
        assert_eq!(names, ["001_a.sql", "002_b.SQL"]);
    }

    #[test]
    fn custom_extension() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "001_a.sql", "SELECT 1;");
        write(dir.path(), "001_a.up", "SELECT 1;");

        let scripts = ScriptStore::new(dir.path())
            .with_extension(".up")
            .list_all()
            .unwrap();
        assert_eq!(scripts.len(), 1);
        assert_eq!(scripts[0].filename, "001_a.up");
    }

    #[test]
    fn empty_directory_yields_no_scripts() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ScriptStore::new(dir.path()).list_all().unwrap().is_empty());
    }

    #[test]
    fn missing_directory_is_a_discovery_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ScriptStore::new(dir.path().join("nope"))
            .list_all()
            .unwrap_err();
        assert!(matches!(err, Error::Discovery { .. }));
    }

    #[test]
    fn checksum_is_sha256_hex() {
        assert_eq!(
            checksum(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            checksum("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn checksum_is_deterministic_and_content_sensitive() {
        let a = MigrationScript::new("001_a.sql", "CREATE TABLE users(id INTEGER);");
        let b = MigrationScript::new("001_a.sql", "CREATE TABLE users(id INTEGER);");
        let c = MigrationScript::new("001_a.sql", "CREATE TABLE users(id INTEGER, name TEXT);");
        assert_eq!(a.checksum, b.checksum);
        assert_ne!(a.checksum, c.checksum);
    }
}
