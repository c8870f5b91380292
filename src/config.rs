//! Pipeline configuration.
//!
//! The store lives in the OS-standard local data directory unless a path
//! is given:
//! - Windows: %LOCALAPPDATA%\discoteka\discoteka.db
//! - macOS: ~/Library/Application Support/discoteka/discoteka.db
//! - Linux: ~/.local/share/discoteka/discoteka.db

use crate::cleanup::CleanupOptions;
use crate::error::{Error, Result};
use crate::matcher::MatchOptions;
use std::path::PathBuf;

pub const APP_DIR: &str = "discoteka";
pub const DB_FILE: &str = "discoteka.db";

/// Default location of the store.
pub fn default_db_path() -> Option<PathBuf> {
    dirs::data_local_dir().map(|d| d.join(APP_DIR).join(DB_FILE))
}

/// Parse a threshold given either as a fraction or a percentage.
///
/// Values above 1 are read as percentages (`70` → `0.70`); the result is
/// clamped to `[0, 1]`.
pub fn parse_threshold(raw: &str) -> Result<f64> {
    let value: f64 = raw
        .trim()
        .trim_end_matches('%')
        .parse()
        .map_err(|_| Error::Config(format!("invalid threshold '{}'", raw)))?;
    if !value.is_finite() {
        return Err(Error::Config(format!("invalid threshold '{}'", raw)));
    }
    Ok(clamp_threshold(value))
}

pub fn clamp_threshold(value: f64) -> f64 {
    let value = if value > 1.0 { value / 100.0 } else { value };
    value.clamp(0.0, 1.0)
}

/// Options for a full clean → match → index run.
#[derive(Clone, Copy, Debug, Default)]
pub struct PipelineOptions {
    pub cleanup: CleanupOptions,
    pub matching: MatchOptions,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_threshold() {
        assert_eq!(parse_threshold("0.7").unwrap(), 0.7);
        assert_eq!(parse_threshold("70").unwrap(), 0.7);
        assert_eq!(parse_threshold("92%").unwrap(), 0.92);
        assert_eq!(parse_threshold("-3").unwrap(), 0.0);
        assert_eq!(parse_threshold("250").unwrap(), 1.0);
        assert_eq!(parse_threshold("1").unwrap(), 1.0);
        assert!(parse_threshold("high").is_err());
        assert!(parse_threshold("NaN").is_err());
    }

    #[test]
    fn test_default_db_path_shape() {
        if let Some(path) = default_db_path() {
            assert!(path.ends_with("discoteka/discoteka.db"));
        }
    }
}
