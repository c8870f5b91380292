//! Error types for the reconciliation engine.
//!
//! Library modules return [`Result`]; the binaries wrap these in `anyhow`
//! with context. Low-confidence cleanups and ambiguous dash splits are not
//! errors: they surface as report counters and log tags instead.

/// Engine-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Connectivity or constraint failure in the store. Aborts the
    /// current stage transaction.
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// A single row carried metadata that could not be decoded.
    /// Batch drivers skip the row and count it as malformed.
    #[error("Malformed row {row} in {table}: {message}")]
    Parse {
        table: &'static str,
        row: String,
        message: String,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Cancellation was observed; the stage transaction was not committed.
    #[error("{stage} cancelled")]
    Cancelled { stage: &'static str },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn parse(table: &'static str, row: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Parse {
            table,
            row: row.into(),
            message: message.into(),
        }
    }

    /// True for errors that only affect one row and should not abort a batch.
    pub fn is_row_local(&self) -> bool {
        matches!(self, Error::Parse { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_is_row_local() {
        let err = Error::parse("dj_tracks", "42", "bad duration");
        assert!(err.is_row_local());
        assert_eq!(err.to_string(), "Malformed row 42 in dj_tracks: bad duration");
    }

    #[test]
    fn test_storage_is_not_row_local() {
        let err: Error = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(!err.is_row_local());
        assert!(err.to_string().starts_with("Storage error"));
    }
}
