//! Guards against pointing the store at the wrong file.
//!
//! The store is opened read-write and gets WAL files next to it, so a
//! mistyped `--db` that names an import file would mangle that file.

use crate::error::{Error, Result};
use std::path::Path;

/// Extensions of files that are inputs, never the store.
const INPUT_EXTENSIONS: [&str; 4] = ["jsonl", "json", "xml", "txt"];

/// Check that `db` is usable as the store for a run reading `inputs`.
///
/// Fails when `db` has an input-file extension, is the same file as any
/// input, or exists but is not a SQLite database.
pub fn validate_db_path(db: &Path, inputs: &[&Path]) -> Result<()> {
    let ext = db
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    if INPUT_EXTENSIONS.contains(&ext.as_str()) {
        return Err(Error::Config(format!(
            "Safety check failed: database '{}' looks like an input file",
            db.display()
        )));
    }

    for input in inputs {
        if same_file(db, input) {
            return Err(Error::Config(format!(
                "Safety check failed: database '{}' cannot be the same as input '{}'",
                db.display(),
                input.display()
            )));
        }
    }

    if db.is_file() && !has_sqlite_header(db)? {
        return Err(Error::Config(format!(
            "Safety check failed: '{}' exists and is not a SQLite database",
            db.display()
        )));
    }

    Ok(())
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

fn has_sqlite_header(path: &Path) -> Result<bool> {
    use std::io::Read;
    let mut header = [0u8; 16];
    let mut file = std::fs::File::open(path)?;
    let read = file.read(&mut header)?;
    // Empty files are valid: SQLite initializes them.
    Ok(read == 0 || header.starts_with(b"SQLite format 3\0"))
}
