//! SQLite store access.
//!
//! Thin typed wrappers over the statements in [`crate::schema`]. Callers
//! own transactions: every function takes a `&Connection`, which a
//! `Transaction` derefs to.

use crate::error::{Error, Result};
use crate::models::{CanonicalTrack, Source, SourceRecord};
use crate::schema::{self, statements};
use rusqlite::types::{Value, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;

/// Open (creating if needed) the store at `path` and ensure the schema.
pub fn open(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA cache_size = -64000;
         PRAGMA temp_store = MEMORY;
         PRAGMA foreign_keys = ON;",
    )?;
    init_schema(&conn)?;
    Ok(conn)
}

/// In-memory store with the schema applied.
pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    init_schema(&conn)?;
    Ok(conn)
}

/// Create every table and record the schema version, all or nothing.
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch("BEGIN;")?;
    let created = (|| -> Result<()> {
        conn.execute_batch(schema::CREATE_META)?;
        conn.execute_batch(schema::CREATE_CANONICAL)?;
        for source in Source::ALL {
            conn.execute_batch(statements(source).create)?;
        }
        conn.execute_batch(schema::CREATE_INDEX_TABLES)?;
        conn.execute(schema::UPSERT_META, params![schema::SCHEMA_VERSION])?;
        Ok(())
    })();
    match created {
        Ok(()) => conn.execute_batch("COMMIT;")?,
        Err(e) => {
            conn.execute_batch("ROLLBACK;")?;
            return Err(e);
        }
    }
    Ok(())
}

/// Version recorded in `schema_meta`, if the store was initialized.
pub fn schema_version(conn: &Connection) -> Result<Option<i64>> {
    Ok(conn
        .query_row("SELECT version FROM schema_meta WHERE id = 1", [], |row| row.get(0))
        .optional()?)
}

/// Row count of one known table.
pub fn count_rows(conn: &Connection, table: &'static str) -> Result<i64> {
    let sql = match table {
        "streaming_tracks" => "SELECT COUNT(*) FROM streaming_tracks",
        "dj_tracks" => "SELECT COUNT(*) FROM dj_tracks",
        "file_tracks" => "SELECT COUNT(*) FROM file_tracks",
        "streaming_links" => "SELECT COUNT(*) FROM streaming_links",
        "dj_links" => "SELECT COUNT(*) FROM dj_links",
        "file_links" => "SELECT COUNT(*) FROM file_links",
        "canonical_tracks" => "SELECT COUNT(*) FROM canonical_tracks",
        "index_artists" => "SELECT COUNT(*) FROM index_artists",
        "index_albums" => "SELECT COUNT(*) FROM index_albums",
        "index_album_tracks" => "SELECT COUNT(*) FROM index_album_tracks",
        other => return Err(Error::Config(format!("unknown table '{}'", other))),
    };
    Ok(conn.query_row(sql, [], |row| row.get(0))?)
}

// ============================================================================
// JSON sets
// ============================================================================

/// Empty sets are stored as NULL so coalescing updates can fill them.
pub fn encode_set(values: &[String]) -> Result<Option<String>> {
    if values.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::to_string(values)?))
}

/// Malformed or missing JSON decodes to the empty set.
pub fn decode_set(raw: Option<&str>) -> Vec<String> {
    let Some(raw) = raw.filter(|r| !r.trim().is_empty()) else {
        return Vec::new();
    };
    match serde_json::from_str::<Vec<String>>(raw) {
        Ok(values) => values,
        Err(e) => {
            tracing::debug!("Treating malformed set {:?} as empty: {}", raw, e);
            Vec::new()
        }
    }
}

/// Map column decoding failures to a row-local parse error.
fn row_error(table: &'static str, row: &str, err: rusqlite::Error) -> Error {
    match err {
        e @ (rusqlite::Error::FromSqlConversionFailure(..)
        | rusqlite::Error::InvalidColumnType(..)
        | rusqlite::Error::IntegralValueOutOfRange(..)) => Error::parse(table, row, e.to_string()),
        other => Error::Storage(other),
    }
}

fn row_id(row: &Row<'_>) -> String {
    match row.get_ref(0) {
        Ok(ValueRef::Text(t)) => String::from_utf8_lossy(t).into_owned(),
        Ok(ValueRef::Integer(i)) => i.to_string(),
        _ => "?".to_string(),
    }
}

// ============================================================================
// Source records
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// Insert a record by natural id or refresh the existing row.
///
/// Raw and descriptive columns are refreshed; the cleaned title/artist are
/// kept unless the matching raw value changed; key, BPM, features and DJ
/// tags are only filled when still empty. A refresh that would change
/// nothing is not written.
pub fn upsert_source_record(conn: &Connection, record: &SourceRecord) -> Result<UpsertOutcome> {
    let stmts = statements(record.source);
    let existed = conn
        .prepare_cached(stmts.exists)?
        .query_row(params![record.natural_id], |_| Ok(()))
        .optional()?
        .is_some();

    let changed = conn.prepare_cached(stmts.upsert)?.execute(params![
        record.natural_id,
        record.title,
        record.artist,
        record.title_raw,
        record.artist_raw,
        record.album,
        record.album_artist,
        record.genre,
        record.track_number,
        record.duration_ms,
        record.bpm,
        record.musical_key,
        encode_set(&record.features)?,
        encode_set(&record.dj_tags)?,
        record.path,
        record.play_count,
        record.clean_confidence,
        encode_set(&record.clean_log)?,
    ])?;

    Ok(match (existed, changed) {
        (false, _) => UpsertOutcome::Inserted,
        (true, 0) => UpsertOutcome::Unchanged,
        (true, _) => UpsertOutcome::Updated,
    })
}

fn read_source_record(source: Source, row: &Row<'_>) -> rusqlite::Result<SourceRecord> {
    let features: Option<String> = row.get(12)?;
    let dj_tags: Option<String> = row.get(13)?;
    let clean_log: Option<String> = row.get(17)?;
    Ok(SourceRecord {
        source,
        natural_id: row.get(0)?,
        title: row.get(1)?,
        artist: row.get(2)?,
        title_raw: row.get(3)?,
        artist_raw: row.get(4)?,
        album: row.get(5)?,
        album_artist: row.get(6)?,
        genre: row.get(7)?,
        track_number: row.get(8)?,
        duration_ms: row.get(9)?,
        bpm: row.get(10)?,
        musical_key: row.get(11)?,
        features: decode_set(features.as_deref()),
        dj_tags: decode_set(dj_tags.as_deref()),
        path: row.get(14)?,
        play_count: row.get(15)?,
        clean_confidence: row.get(16)?,
        clean_log: decode_set(clean_log.as_deref()),
    })
}

/// All rows of one source table ordered by natural id. Rows that fail to
/// decode come back as row-local [`Error::Parse`] entries.
pub fn load_source_records(conn: &Connection, source: Source) -> Result<Vec<Result<SourceRecord>>> {
    let stmts = statements(source);
    let mut stmt = conn.prepare_cached(stmts.select_all)?;
    let mut rows = stmt.query([])?;
    let mut records = Vec::new();
    while let Some(row) = rows.next()? {
        records.push(read_source_record(source, row).map_err(|e| row_error(stmts.table, &row_id(row), e)));
    }
    Ok(records)
}

// ============================================================================
// Cleanup rows
// ============================================================================

/// A table the cleanup pass walks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CleanTable {
    Source(Source),
    Canonical,
}

impl CleanTable {
    pub const ALL: [CleanTable; 4] = [
        CleanTable::Source(Source::Streaming),
        CleanTable::Source(Source::DjSoftware),
        CleanTable::Source(Source::Filesystem),
        CleanTable::Canonical,
    ];

    pub fn name(self) -> &'static str {
        match self {
            CleanTable::Source(source) => statements(source).table,
            CleanTable::Canonical => schema::CANONICAL_TABLE,
        }
    }

    fn select_sql(self) -> &'static str {
        match self {
            CleanTable::Source(source) => statements(source).select_clean,
            CleanTable::Canonical => schema::SELECT_CANONICAL_CLEAN,
        }
    }

    fn update_sql(self) -> &'static str {
        match self {
            CleanTable::Source(source) => statements(source).update_clean,
            CleanTable::Canonical => schema::UPDATE_CANONICAL_CLEAN,
        }
    }
}

/// Primary key of a cleanup row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RowKey {
    Natural(String),
    Canonical(i64),
}

/// The columns the cleanup pass reads and rewrites.
#[derive(Clone, Debug, PartialEq)]
pub struct CleanRow {
    pub key: RowKey,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub title_raw: Option<String>,
    pub artist_raw: Option<String>,
    pub musical_key: Option<String>,
    pub bpm: Option<f64>,
    pub features: Vec<String>,
    pub dj_tags: Vec<String>,
}

fn read_clean_row(table: CleanTable, row: &Row<'_>) -> rusqlite::Result<CleanRow> {
    let key = match table {
        CleanTable::Source(_) => RowKey::Natural(row.get(0)?),
        CleanTable::Canonical => RowKey::Canonical(row.get(0)?),
    };
    let features: Option<String> = row.get(7)?;
    let dj_tags: Option<String> = row.get(8)?;
    Ok(CleanRow {
        key,
        title: row.get(1)?,
        artist: row.get(2)?,
        title_raw: row.get(3)?,
        artist_raw: row.get(4)?,
        musical_key: row.get(5)?,
        bpm: row.get(6)?,
        features: decode_set(features.as_deref()),
        dj_tags: decode_set(dj_tags.as_deref()),
    })
}

/// Cleanup view of every row in `table`; undecodable rows come back as errors.
pub fn load_clean_rows(conn: &Connection, table: CleanTable) -> Result<Vec<Result<CleanRow>>> {
    let mut stmt = conn.prepare_cached(table.select_sql())?;
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(read_clean_row(table, row).map_err(|e| row_error(table.name(), &row_id(row), e)));
    }
    Ok(out)
}

pub fn update_clean_row(
    conn: &Connection,
    table: CleanTable,
    row: &CleanRow,
    confidence: f64,
    log: &[&str],
) -> Result<()> {
    let key: Value = match &row.key {
        RowKey::Natural(id) => Value::from(id.clone()),
        RowKey::Canonical(id) => Value::from(*id),
    };
    let log: Vec<String> = log.iter().map(|tag| tag.to_string()).collect();
    let features = encode_set(&row.features)?;
    let dj_tags = encode_set(&row.dj_tags)?;
    let clean_log = encode_set(&log)?;
    conn.prepare_cached(table.update_sql())?.execute(params![
        key,
        row.title,
        row.artist,
        row.musical_key,
        row.bpm,
        features,
        dj_tags,
        confidence,
        clean_log,
    ])?;
    Ok(())
}

// ============================================================================
// Canonical tracks and links
// ============================================================================

fn read_canonical(row: &Row<'_>) -> rusqlite::Result<CanonicalTrack> {
    let features: Option<String> = row.get(17)?;
    let dj_tags: Option<String> = row.get(18)?;
    let clean_log: Option<String> = row.get(20)?;
    Ok(CanonicalTrack {
        id: row.get(0)?,
        title: row.get(1)?,
        artist: row.get(2)?,
        title_raw: row.get(3)?,
        artist_raw: row.get(4)?,
        album: row.get(5)?,
        album_artist: row.get(6)?,
        genre: row.get(7)?,
        track_number: row.get(8)?,
        duration_sec: row.get(9)?,
        play_count: row.get(10)?,
        streaming_id: row.get(11)?,
        dj_id: row.get(12)?,
        file_id: row.get(13)?,
        local_path: row.get(14)?,
        musical_key: row.get(15)?,
        bpm: row.get(16)?,
        features: decode_set(features.as_deref()),
        dj_tags: decode_set(dj_tags.as_deref()),
        clean_confidence: row.get(19)?,
        clean_log: decode_set(clean_log.as_deref()),
    })
}

/// Insert and update share one positional layout with `id` as `?1`.
fn write_canonical(conn: &Connection, sql: &str, track: &CanonicalTrack) -> Result<()> {
    let features = encode_set(&track.features)?;
    let dj_tags = encode_set(&track.dj_tags)?;
    let clean_log = encode_set(&track.clean_log)?;
    conn.prepare_cached(sql)?.execute(params![
        track.id,
        track.title,
        track.artist,
        track.title_raw,
        track.artist_raw,
        track.album,
        track.album_artist,
        track.genre,
        track.track_number,
        track.duration_sec,
        track.play_count,
        track.streaming_id,
        track.dj_id,
        track.file_id,
        track.local_path,
        track.musical_key,
        track.bpm,
        features,
        dj_tags,
        track.clean_confidence,
        clean_log,
    ])?;
    Ok(())
}

pub fn insert_canonical(conn: &Connection, track: &CanonicalTrack) -> Result<()> {
    write_canonical(conn, schema::INSERT_CANONICAL, track)
}

pub fn update_canonical(conn: &Connection, track: &CanonicalTrack) -> Result<()> {
    write_canonical(conn, schema::UPDATE_CANONICAL, track)
}

pub fn fetch_canonical(conn: &Connection, id: i64) -> Result<Option<CanonicalTrack>> {
    Ok(conn
        .prepare_cached(schema::SELECT_CANONICAL_BY_ID)?
        .query_row(params![id], read_canonical)
        .optional()?)
}

/// All canonical tracks ordered by id.
pub fn load_canonical_tracks(conn: &Connection) -> Result<Vec<CanonicalTrack>> {
    let mut stmt = conn.prepare_cached(schema::SELECT_CANONICAL)?;
    let tracks = stmt
        .query_map([], read_canonical)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(tracks)
}

/// Highest canonical id in use, 0 for an empty table.
pub fn max_canonical_id(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row(schema::MAX_CANONICAL_ID, [], |row| row.get(0))?)
}

pub fn load_canonical_paths(conn: &Connection) -> Result<Vec<(i64, String)>> {
    let mut stmt = conn.prepare_cached(schema::SELECT_CANONICAL_PATHS)?;
    let paths = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(paths)
}

/// `(canonical_id, natural_id)` for every link of one source.
pub fn load_links(conn: &Connection, source: Source) -> Result<Vec<(i64, String)>> {
    let mut stmt = conn.prepare_cached(statements(source).select_links)?;
    let links = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(links)
}

/// Returns whether a new link row was written.
pub fn insert_link(conn: &Connection, source: Source, canonical_id: i64, natural_id: &str) -> Result<bool> {
    let written = conn
        .prepare_cached(statements(source).insert_link)?
        .execute(params![canonical_id, natural_id])?;
    Ok(written > 0)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub(crate) fn record(source: Source, id: &str, title: &str, artist: &str) -> SourceRecord {
        let mut record = SourceRecord::new(source, id);
        record.title_raw = Some(title.to_string());
        record.artist_raw = Some(artist.to_string());
        record
    }

    pub(crate) fn store_with(records: &[SourceRecord]) -> Connection {
        let conn = open_in_memory().unwrap();
        for record in records {
            upsert_source_record(&conn, record).unwrap();
        }
        conn
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_open_creates_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("library.db");
        let conn = open(&path).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), Some(schema::SCHEMA_VERSION));
        drop(conn);

        // Re-opening an existing store is a no-op.
        let conn = open(&path).unwrap();
        assert_eq!(count_rows(&conn, "canonical_tracks").unwrap(), 0);
    }

    #[test]
    fn test_upsert_outcomes() {
        let conn = open_in_memory().unwrap();
        let mut rec = record(Source::DjSoftware, "7", "Song", "Artist");
        rec.duration_ms = Some(180_000);

        assert_eq!(upsert_source_record(&conn, &rec).unwrap(), UpsertOutcome::Inserted);
        assert_eq!(upsert_source_record(&conn, &rec).unwrap(), UpsertOutcome::Unchanged);

        rec.duration_ms = Some(181_000);
        assert_eq!(upsert_source_record(&conn, &rec).unwrap(), UpsertOutcome::Updated);
        assert_eq!(count_rows(&conn, "dj_tracks").unwrap(), 1);
    }

    #[test]
    fn test_upsert_keeps_cleaned_fields() {
        let conn = open_in_memory().unwrap();
        let rec = record(Source::Streaming, "s1", "03. Song (Clean)", "Artist");
        upsert_source_record(&conn, &rec).unwrap();
        conn.execute(
            "UPDATE streaming_tracks SET title = 'Song', musical_key = '9A' WHERE natural_id = 's1'",
            [],
        )
        .unwrap();

        // Same raw title: cleaned value and key survive, nothing is written.
        let mut again = rec.clone();
        again.musical_key = Some("4B".to_string());
        assert_eq!(upsert_source_record(&conn, &again).unwrap(), UpsertOutcome::Unchanged);

        // New raw title: the cleaned title is reset, the key stays.
        again.title_raw = Some("Other Song".to_string());
        assert_eq!(upsert_source_record(&conn, &again).unwrap(), UpsertOutcome::Updated);
        let loaded = load_source_records(&conn, Source::Streaming).unwrap().remove(0).unwrap();
        assert_eq!(loaded.title, None);
        assert_eq!(loaded.musical_key.as_deref(), Some("9A"));
    }

    #[test]
    fn test_malformed_rows_are_row_local() {
        let conn = store_with(&[
            record(Source::Filesystem, "a", "One", "X"),
            record(Source::Filesystem, "b", "Two", "Y"),
        ]);
        conn.execute("UPDATE file_tracks SET duration_ms = 'long' WHERE natural_id = 'b'", [])
            .unwrap();
        conn.execute("UPDATE file_tracks SET features = '{oops' WHERE natural_id = 'a'", [])
            .unwrap();

        let rows = load_source_records(&conn, Source::Filesystem).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].as_ref().unwrap().features.is_empty());
        let err = rows[1].as_ref().unwrap_err();
        assert!(err.is_row_local());
        assert!(err.to_string().contains("file_tracks"));
    }

    #[test]
    fn test_set_codec() {
        assert_eq!(encode_set(&[]).unwrap(), None);
        let encoded = encode_set(&["A".to_string(), "B".to_string()]).unwrap();
        assert_eq!(decode_set(encoded.as_deref()), vec!["A", "B"]);
        assert!(decode_set(Some("not json")).is_empty());
        assert!(decode_set(Some("  ")).is_empty());
    }

    #[test]
    fn test_canonical_round_trip_and_links() {
        let conn = open_in_memory().unwrap();
        let mut track = CanonicalTrack {
            id: 1,
            title: Some("Song".to_string()),
            features: vec!["Guest".to_string()],
            ..Default::default()
        };
        insert_canonical(&conn, &track).unwrap();
        track.genre = Some("House".to_string());
        update_canonical(&conn, &track).unwrap();
        assert_eq!(fetch_canonical(&conn, 1).unwrap(), Some(track));
        assert_eq!(max_canonical_id(&conn).unwrap(), 1);

        assert!(insert_link(&conn, Source::DjSoftware, 1, "7").unwrap());
        assert!(!insert_link(&conn, Source::DjSoftware, 1, "7").unwrap());
        assert_eq!(load_links(&conn, Source::DjSoftware).unwrap(), vec![(1, "7".to_string())]);
        // A natural id may only ever point at one canonical track.
        insert_canonical(&conn, &CanonicalTrack { id: 2, ..Default::default() }).unwrap();
        assert!(!insert_link(&conn, Source::DjSoftware, 2, "7").unwrap());
    }
}
