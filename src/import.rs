//! JSON-Lines importer.
//!
//! One JSON object per line, upserted by natural id into the table of the
//! given source. Parsing of the native library exports happens upstream;
//! this is the seam where their output enters the store.

use crate::cancel::CancelToken;
use crate::db::{self, UpsertOutcome};
use crate::error::Result;
use crate::models::{Source, SourceRecord, StageReport};
use crate::progress;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::io::BufRead;
use std::time::Instant;
use tracing::{info, warn};

/// A line of an import file. Title and artist land in the raw columns;
/// the cleanup pass fills the cleaned ones.
#[derive(Debug, Deserialize)]
pub struct ImportLine {
    #[serde(alias = "natural_id", alias = "track_id")]
    pub id: String,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub album_artist: Option<String>,
    pub genre: Option<String>,
    pub track_number: Option<i64>,
    pub duration_ms: Option<i64>,
    pub bpm: Option<f64>,
    #[serde(alias = "musical_key")]
    pub key: Option<String>,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub dj_tags: Vec<String>,
    #[serde(alias = "location")]
    pub path: Option<String>,
    pub play_count: Option<i64>,
}

impl ImportLine {
    pub fn into_record(self, source: Source) -> SourceRecord {
        let mut record = SourceRecord::new(source, self.id);
        record.title_raw = self.title;
        record.artist_raw = self.artist;
        record.album = self.album;
        record.album_artist = self.album_artist;
        record.genre = self.genre;
        record.track_number = self.track_number;
        record.duration_ms = self.duration_ms.filter(|ms| *ms > 0);
        record.bpm = self.bpm.filter(|bpm| *bpm > 0.0);
        record.musical_key = self.key;
        record.features = self.features;
        record.dj_tags = self.dj_tags;
        record.path = if source.has_paths() { self.path } else { None };
        record.play_count = self.play_count;
        record
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ImportReport {
    pub source: Option<Source>,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Lines that were not valid JSON records
    pub malformed: usize,
    pub elapsed_seconds: f64,
}

impl StageReport for ImportReport {}

/// Upsert every line of `reader` into the `source` table in one
/// transaction.
pub fn import_lines(
    conn: &mut Connection,
    source: Source,
    reader: impl BufRead,
    cancel: &CancelToken,
) -> Result<ImportReport> {
    let start = Instant::now();
    let mut report = ImportReport {
        source: Some(source),
        ..Default::default()
    };
    let tx = conn.transaction()?;
    let pb = progress::create_progress_bar(0, &format!("Importing {}", source));

    for (number, line) in reader.lines().enumerate() {
        cancel.check("import")?;
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let parsed: ImportLine = match serde_json::from_str(&line) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Skipping line {}: {}", number + 1, e);
                report.malformed += 1;
                continue;
            }
        };
        match db::upsert_source_record(&tx, &parsed.into_record(source))? {
            UpsertOutcome::Inserted => report.inserted += 1,
            UpsertOutcome::Updated => report.updated += 1,
            UpsertOutcome::Unchanged => report.unchanged += 1,
        }
        pb.inc(1);
    }

    tx.commit()?;
    pb.finish_and_clear();
    report.elapsed_seconds = start.elapsed().as_secs_f64();
    report.log_phase("import");
    info!(
        "Imported {}: {} new, {} updated, {} unchanged, {} malformed",
        source, report.inserted, report.updated, report.unchanged, report.malformed
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const LINES: &str = r#"{"id": "1", "title": "Song", "artist": "Artist", "duration_ms": 180000, "path": "/m/Song.mp3"}
not json
{"track_id": "2", "title": "Other", "bpm": 0, "musical_key": "8A"}

"#;

    #[test]
    fn test_import_counts_and_upserts() {
        let mut conn = db::open_in_memory().unwrap();
        let report = import_lines(&mut conn, Source::Streaming, Cursor::new(LINES), &CancelToken::new()).unwrap();
        assert_eq!(report.inserted, 2);
        assert_eq!(report.malformed, 1);

        let records: Vec<SourceRecord> = db::load_source_records(&conn, Source::Streaming)
            .unwrap()
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(records[0].title_raw.as_deref(), Some("Song"));
        assert_eq!(records[0].title, None);
        // Streaming rows carry no locations.
        assert_eq!(records[0].path, None);
        assert_eq!(records[1].bpm, None);
        assert_eq!(records[1].musical_key.as_deref(), Some("8A"));

        let again = import_lines(&mut conn, Source::Streaming, Cursor::new(LINES), &CancelToken::new()).unwrap();
        assert_eq!(again.inserted, 0);
        assert_eq!(again.unchanged, 2);
    }

    #[test]
    fn test_file_source_keeps_paths() {
        let line = ImportLine {
            id: "f".to_string(),
            title: None,
            artist: None,
            album: None,
            album_artist: None,
            genre: None,
            track_number: None,
            duration_ms: Some(-1),
            bpm: None,
            key: None,
            features: Vec::new(),
            dj_tags: Vec::new(),
            path: Some("C:\\a.mp3".to_string()),
            play_count: None,
        };
        let record = line.into_record(Source::Filesystem);
        assert_eq!(record.path.as_deref(), Some("C:\\a.mp3"));
        assert_eq!(record.duration_ms, None);
    }
}
