//! Explicit per-table schema.
//!
//! Every statement is assembled at compile time from the column lists
//! below, so table and column names never pass through runtime string
//! formatting.

use crate::models::Source;

/// Bumped whenever a table layout changes.
pub const SCHEMA_VERSION: i64 = 1;

macro_rules! source_columns {
    () => {
        "natural_id, title, artist, title_raw, artist_raw, album, album_artist, genre, \
         track_number, duration_ms, bpm, musical_key, features, dj_tags, path, play_count, \
         clean_confidence, clean_log"
    };
}

macro_rules! canonical_columns {
    () => {
        "id, title, artist, title_raw, artist_raw, album, album_artist, genre, track_number, \
         duration_sec, play_count, streaming_id, dj_id, file_id, local_path, musical_key, bpm, \
         features, dj_tags, clean_confidence, clean_log"
    };
}

/// Columns read and written by the cleanup pass, identical across tables
/// apart from the key column in front.
macro_rules! clean_columns {
    () => {
        "title, artist, title_raw, artist_raw, musical_key, bpm, features, dj_tags"
    };
}

macro_rules! source_statements {
    ($source:expr, $table:literal, $links:literal) => {
        SourceStatements {
            source: $source,
            table: $table,
            links: $links,
            create: concat!(
                "CREATE TABLE IF NOT EXISTS ", $table, " (
                    natural_id TEXT PRIMARY KEY NOT NULL,
                    title TEXT,
                    artist TEXT,
                    title_raw TEXT,
                    artist_raw TEXT,
                    album TEXT,
                    album_artist TEXT,
                    genre TEXT,
                    track_number INTEGER,
                    duration_ms INTEGER,
                    bpm REAL,
                    musical_key TEXT,
                    features TEXT,
                    dj_tags TEXT,
                    path TEXT,
                    play_count INTEGER,
                    clean_confidence REAL,
                    clean_log TEXT
                );
                CREATE TABLE IF NOT EXISTS ", $links, " (
                    canonical_id INTEGER NOT NULL REFERENCES canonical_tracks(id),
                    natural_id TEXT NOT NULL UNIQUE,
                    PRIMARY KEY (canonical_id, natural_id)
                );"
            ),
            exists: concat!("SELECT 1 FROM ", $table, " WHERE natural_id = ?1"),
            select_all: concat!("SELECT ", source_columns!(), " FROM ", $table, " ORDER BY natural_id"),
            upsert: concat!(
                "INSERT INTO ", $table, " (", source_columns!(), ")
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
                 ON CONFLICT(natural_id) DO UPDATE SET
                    title = CASE WHEN ", $table, ".title_raw IS excluded.title_raw
                                 THEN COALESCE(", $table, ".title, excluded.title)
                                 ELSE excluded.title END,
                    artist = CASE WHEN ", $table, ".artist_raw IS excluded.artist_raw
                                  THEN COALESCE(", $table, ".artist, excluded.artist)
                                  ELSE excluded.artist END,
                    title_raw = excluded.title_raw,
                    artist_raw = excluded.artist_raw,
                    album = excluded.album,
                    album_artist = excluded.album_artist,
                    genre = excluded.genre,
                    track_number = excluded.track_number,
                    duration_ms = excluded.duration_ms,
                    bpm = COALESCE(", $table, ".bpm, excluded.bpm),
                    musical_key = COALESCE(", $table, ".musical_key, excluded.musical_key),
                    features = COALESCE(", $table, ".features, excluded.features),
                    dj_tags = COALESCE(", $table, ".dj_tags, excluded.dj_tags),
                    path = excluded.path,
                    play_count = excluded.play_count
                 WHERE ", $table, ".title_raw IS NOT excluded.title_raw
                    OR ", $table, ".artist_raw IS NOT excluded.artist_raw
                    OR (", $table, ".title IS NULL AND excluded.title IS NOT NULL)
                    OR (", $table, ".artist IS NULL AND excluded.artist IS NOT NULL)
                    OR ", $table, ".album IS NOT excluded.album
                    OR ", $table, ".album_artist IS NOT excluded.album_artist
                    OR ", $table, ".genre IS NOT excluded.genre
                    OR ", $table, ".track_number IS NOT excluded.track_number
                    OR ", $table, ".duration_ms IS NOT excluded.duration_ms
                    OR ", $table, ".path IS NOT excluded.path
                    OR ", $table, ".play_count IS NOT excluded.play_count
                    OR (", $table, ".bpm IS NULL AND excluded.bpm IS NOT NULL)
                    OR (", $table, ".musical_key IS NULL AND excluded.musical_key IS NOT NULL)
                    OR (", $table, ".features IS NULL AND excluded.features IS NOT NULL)
                    OR (", $table, ".dj_tags IS NULL AND excluded.dj_tags IS NOT NULL)"
            ),
            select_clean: concat!(
                "SELECT natural_id, ", clean_columns!(), " FROM ", $table, " ORDER BY natural_id"
            ),
            update_clean: concat!(
                "UPDATE ", $table, "
                 SET title = ?2, artist = ?3, musical_key = ?4, bpm = ?5, features = ?6,
                     dj_tags = ?7, clean_confidence = ?8, clean_log = ?9
                 WHERE natural_id = ?1"
            ),
            select_links: concat!("SELECT canonical_id, natural_id FROM ", $links, " ORDER BY natural_id"),
            insert_link: concat!("INSERT OR IGNORE INTO ", $links, " (canonical_id, natural_id) VALUES (?1, ?2)"),
        }
    };
}

/// Every statement touching one source table and its link table.
#[derive(Debug)]
pub struct SourceStatements {
    pub source: Source,
    pub table: &'static str,
    pub links: &'static str,
    pub create: &'static str,
    pub exists: &'static str,
    pub select_all: &'static str,
    pub upsert: &'static str,
    pub select_clean: &'static str,
    pub update_clean: &'static str,
    pub select_links: &'static str,
    pub insert_link: &'static str,
}

pub static STREAMING: SourceStatements =
    source_statements!(Source::Streaming, "streaming_tracks", "streaming_links");
pub static DJ: SourceStatements = source_statements!(Source::DjSoftware, "dj_tracks", "dj_links");
pub static FILE: SourceStatements = source_statements!(Source::Filesystem, "file_tracks", "file_links");

pub fn statements(source: Source) -> &'static SourceStatements {
    match source {
        Source::Streaming => &STREAMING,
        Source::DjSoftware => &DJ,
        Source::Filesystem => &FILE,
    }
}

// ============================================================================
// Canonical and derived tables
// ============================================================================

pub const CANONICAL_TABLE: &str = "canonical_tracks";

pub const CREATE_CANONICAL: &str = "
CREATE TABLE IF NOT EXISTS canonical_tracks (
    id INTEGER PRIMARY KEY,
    title TEXT,
    artist TEXT,
    title_raw TEXT,
    artist_raw TEXT,
    album TEXT,
    album_artist TEXT,
    genre TEXT,
    track_number INTEGER,
    duration_sec INTEGER,
    play_count INTEGER,
    streaming_id TEXT,
    dj_id TEXT,
    file_id TEXT,
    local_path TEXT,
    musical_key TEXT,
    bpm REAL,
    features TEXT,
    dj_tags TEXT,
    clean_confidence REAL,
    clean_log TEXT
);";

pub const SELECT_CANONICAL: &str = concat!("SELECT ", canonical_columns!(), " FROM canonical_tracks ORDER BY id");
pub const SELECT_CANONICAL_BY_ID: &str = concat!("SELECT ", canonical_columns!(), " FROM canonical_tracks WHERE id = ?1");
pub const INSERT_CANONICAL: &str = concat!(
    "INSERT INTO canonical_tracks (", canonical_columns!(), ")
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)"
);
pub const UPDATE_CANONICAL: &str = "
UPDATE canonical_tracks
SET title = ?2, artist = ?3, title_raw = ?4, artist_raw = ?5, album = ?6, album_artist = ?7,
    genre = ?8, track_number = ?9, duration_sec = ?10, play_count = ?11, streaming_id = ?12,
    dj_id = ?13, file_id = ?14, local_path = ?15, musical_key = ?16, bpm = ?17, features = ?18,
    dj_tags = ?19, clean_confidence = ?20, clean_log = ?21
WHERE id = ?1";
pub const MAX_CANONICAL_ID: &str = "SELECT COALESCE(MAX(id), 0) FROM canonical_tracks";
pub const SELECT_CANONICAL_PATHS: &str =
    "SELECT id, local_path FROM canonical_tracks WHERE local_path IS NOT NULL ORDER BY id";

pub const SELECT_CANONICAL_CLEAN: &str =
    concat!("SELECT id, ", clean_columns!(), " FROM canonical_tracks ORDER BY id");
pub const UPDATE_CANONICAL_CLEAN: &str = "
UPDATE canonical_tracks
SET title = ?2, artist = ?3, musical_key = ?4, bpm = ?5, features = ?6,
    dj_tags = ?7, clean_confidence = ?8, clean_log = ?9
WHERE id = ?1";

pub const CREATE_INDEX_TABLES: &str = "
CREATE TABLE IF NOT EXISTS index_artists (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    artist_key TEXT NOT NULL UNIQUE,
    album_count INTEGER NOT NULL,
    track_count INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS index_albums (
    id INTEGER PRIMARY KEY,
    title TEXT NOT NULL,
    album_artist TEXT NOT NULL,
    album_key TEXT NOT NULL UNIQUE,
    track_count INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS index_artist_albums (
    artist_id INTEGER NOT NULL REFERENCES index_artists(id),
    album_id INTEGER NOT NULL REFERENCES index_albums(id),
    PRIMARY KEY (artist_id, album_id)
);
CREATE TABLE IF NOT EXISTS index_album_tracks (
    album_id INTEGER NOT NULL REFERENCES index_albums(id),
    canonical_id INTEGER NOT NULL REFERENCES canonical_tracks(id),
    sort_order INTEGER NOT NULL,
    track_number INTEGER,
    PRIMARY KEY (album_id, canonical_id)
);";

/// Junctions first so foreign keys never dangle mid-delete.
pub const CLEAR_INDEX_TABLES: &str = "
DELETE FROM index_artist_albums;
DELETE FROM index_album_tracks;
DELETE FROM index_artists;
DELETE FROM index_albums;";

pub const INSERT_INDEX_ARTIST: &str =
    "INSERT INTO index_artists (id, name, artist_key, album_count, track_count) VALUES (?1, ?2, ?3, ?4, ?5)";
pub const INSERT_INDEX_ALBUM: &str =
    "INSERT INTO index_albums (id, title, album_artist, album_key, track_count) VALUES (?1, ?2, ?3, ?4, ?5)";
pub const INSERT_INDEX_ARTIST_ALBUM: &str =
    "INSERT INTO index_artist_albums (artist_id, album_id) VALUES (?1, ?2)";
pub const INSERT_INDEX_ALBUM_TRACK: &str =
    "INSERT INTO index_album_tracks (album_id, canonical_id, sort_order, track_number) VALUES (?1, ?2, ?3, ?4)";

pub const CREATE_META: &str = "
CREATE TABLE IF NOT EXISTS schema_meta (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    version INTEGER NOT NULL
);";
pub const UPSERT_META: &str =
    "INSERT INTO schema_meta (id, version) VALUES (1, ?1) ON CONFLICT(id) DO UPDATE SET version = excluded.version";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statements_target_their_tables() {
        for source in Source::ALL {
            let stmts = statements(source);
            assert_eq!(stmts.source, source);
            assert!(stmts.upsert.starts_with(&format!("INSERT INTO {} ", stmts.table)));
            assert!(stmts.insert_link.contains(stmts.links));
            assert!(!stmts.select_all.contains(CANONICAL_TABLE));
        }
    }

    #[test]
    fn test_placeholder_counts_match_columns() {
        let source_cols = source_columns!().split(',').count();
        assert_eq!(source_cols, 18);
        assert!(STREAMING.upsert.contains("?18)"));

        let canonical_cols = canonical_columns!().split(',').count();
        assert_eq!(canonical_cols, 21);
        assert!(INSERT_CANONICAL.contains("?21)"));
    }
}
