use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to discover migrations in {path}: {message}")]
    Discovery { path: String, message: String },

    #[error("migration {filename} failed: {message}")]
    Apply { filename: String, message: String },

    #[error("migration {filename} ran but could not be recorded in the ledger: {message}")]
    LedgerWrite { filename: String, message: String },

    #[error("ledger already contains {0}")]
    ConstraintViolation(String),

    #[error(
        "migration {filename} changed after it was applied (recorded checksum {recorded}, on disk {current})"
    )]
    Drift {
        filename: String,
        recorded: String,
        current: String,
    },

    #[error("migration lock is held by {0}")]
    Locked(String),

    #[error("{}", cancelled_message(.filename))]
    Cancelled { filename: Option<String> },

    #[error("reset failed on {object}: {message}")]
    Reset { object: String, message: String },

    #[error("database error: {0}")]
    Database(String),
}

impl Error {
    /// The migration file this error is attributed to, if any.
    pub fn filename(&self) -> Option<&str> {
        match self {
            Error::Apply { filename, .. }
            | Error::LedgerWrite { filename, .. }
            | Error::Drift { filename, .. }
            | Error::ConstraintViolation(filename) => Some(filename),
            Error::Cancelled { filename } => filename.as_deref(),
            _ => None,
        }
    }
}

fn cancelled_message(filename: &Option<String>) -> String {
    match filename {
        Some(f) => format!("migration run cancelled while applying {f}"),
        None => "migration run cancelled".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn error_display_includes_context() {
        let e = Error::Config("bad yaml".into());
        assert_eq!(e.to_string(), "configuration error: bad yaml");

        let e = Error::Apply {
            filename: "002_bad.sql".into(),
            message: "near \"CREAT\": syntax error".into(),
        };
        assert_eq!(
            e.to_string(),
            "migration 002_bad.sql failed: near \"CREAT\": syntax error"
        );

        let e = Error::Locked("3f1c".into());
        assert_eq!(e.to_string(), "migration lock is held by 3f1c");

        let e = Error::Drift {
            filename: "001_a.sql".into(),
            recorded: "aa".into(),
            current: "bb".into(),
        };
        assert_eq!(
            e.to_string(),
            "migration 001_a.sql changed after it was applied (recorded checksum aa, on disk bb)"
        );
    }

    #[test]
    fn cancelled_message_names_file_when_known() {
        let e = Error::Cancelled {
            filename: Some("001_a.sql".into()),
        };
        assert_eq!(
            e.to_string(),
            "migration run cancelled while applying 001_a.sql"
        );
        assert_eq!(
            Error::Cancelled { filename: None }.to_string(),
            "migration run cancelled"
        );
    }

    #[test]
    fn filename_is_exposed_for_migration_errors() {
        let e = Error::LedgerWrite {
            filename: "001_a.sql".into(),
            message: "UNIQUE constraint failed".into(),
        };
        assert_eq!(e.filename(), Some("001_a.sql"));
        assert_eq!(Error::Database("x".into()).filename(), None);
    }
}
