//! Core data models for library reconciliation.
//!
//! Source records, canonical tracks and the per-stage reports returned by
//! the batch operations.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Sources
// ============================================================================

/// One of the three catalogs being reconciled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// Streaming-service library export
    Streaming,
    /// DJ-software collection export
    DjSoftware,
    /// Filesystem scan of audio files
    Filesystem,
}

impl Source {
    pub const ALL: [Source; 3] = [Source::Streaming, Source::DjSoftware, Source::Filesystem];

    pub fn as_str(self) -> &'static str {
        match self {
            Source::Streaming => "streaming",
            Source::DjSoftware => "dj",
            Source::Filesystem => "file",
        }
    }

    /// Whether records from this source carry file locations.
    pub fn has_paths(self) -> bool {
        !matches!(self, Source::Streaming)
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "streaming" | "stream" => Ok(Source::Streaming),
            "dj" | "dj_software" | "djsoftware" => Ok(Source::DjSoftware),
            "file" | "files" | "filesystem" => Ok(Source::Filesystem),
            other => Err(Error::Config(format!(
                "unknown source '{}' (expected streaming, dj or file)",
                other
            ))),
        }
    }
}

// ============================================================================
// Records
// ============================================================================

/// One row from a per-source library, keyed by `(source, natural_id)`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SourceRecord {
    pub source: Source,
    pub natural_id: String,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub title_raw: Option<String>,
    pub artist_raw: Option<String>,
    pub album: Option<String>,
    pub album_artist: Option<String>,
    pub genre: Option<String>,
    pub track_number: Option<i64>,
    pub duration_ms: Option<i64>,
    pub bpm: Option<f64>,
    pub musical_key: Option<String>,
    pub features: Vec<String>,
    pub dj_tags: Vec<String>,
    pub path: Option<String>,
    pub play_count: Option<i64>,
    pub clean_confidence: Option<f64>,
    pub clean_log: Vec<String>,
}

impl SourceRecord {
    pub fn new(source: Source, natural_id: impl Into<String>) -> Self {
        Self {
            source,
            natural_id: natural_id.into(),
            title: None,
            artist: None,
            title_raw: None,
            artist_raw: None,
            album: None,
            album_artist: None,
            genre: None,
            track_number: None,
            duration_ms: None,
            bpm: None,
            musical_key: None,
            features: Vec::new(),
            dj_tags: Vec::new(),
            path: None,
            play_count: None,
            clean_confidence: None,
            clean_log: Vec::new(),
        }
    }

    /// Cleaned title, falling back to the raw import value.
    pub fn display_title(&self) -> Option<&str> {
        non_blank(self.title.as_deref()).or_else(|| non_blank(self.title_raw.as_deref()))
    }

    /// Cleaned artist, falling back to the raw import value.
    pub fn display_artist(&self) -> Option<&str> {
        non_blank(self.artist.as_deref()).or_else(|| non_blank(self.artist_raw.as_deref()))
    }

    pub fn key(&self) -> RecordKey {
        RecordKey {
            source: self.source,
            natural_id: self.natural_id.clone(),
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

/// `(source, natural_id)` identity of a source record.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RecordKey {
    pub source: Source,
    pub natural_id: String,
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.natural_id)
    }
}

/// Merged identity across sources.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CanonicalTrack {
    pub id: i64,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub title_raw: Option<String>,
    pub artist_raw: Option<String>,
    pub album: Option<String>,
    pub album_artist: Option<String>,
    pub genre: Option<String>,
    pub track_number: Option<i64>,
    pub duration_sec: Option<i64>,
    pub play_count: Option<i64>,
    pub streaming_id: Option<String>,
    pub dj_id: Option<String>,
    pub file_id: Option<String>,
    pub local_path: Option<String>,
    pub musical_key: Option<String>,
    pub bpm: Option<f64>,
    pub features: Vec<String>,
    pub dj_tags: Vec<String>,
    pub clean_confidence: Option<f64>,
    pub clean_log: Vec<String>,
}

impl CanonicalTrack {
    pub fn source_id(&self, source: Source) -> Option<&str> {
        match source {
            Source::Streaming => self.streaming_id.as_deref(),
            Source::DjSoftware => self.dj_id.as_deref(),
            Source::Filesystem => self.file_id.as_deref(),
        }
    }

    pub fn set_source_id(&mut self, source: Source, id: String) {
        match source {
            Source::Streaming => self.streaming_id = Some(id),
            Source::DjSoftware => self.dj_id = Some(id),
            Source::Filesystem => self.file_id = Some(id),
        }
    }
}

// ============================================================================
// Statistics (Instrumentation)
// ============================================================================

/// Stage reports share logging and file output.
pub trait StageReport: Serialize {
    /// Log the report as pretty JSON.
    fn log_phase(&self, phase: &str) {
        if let Ok(json) = serde_json::to_string_pretty(self) {
            tracing::info!(target: "discoteka::stats", "[STATS:{}]\n{}", phase, json);
        }
    }

    /// Write the report to a JSON file.
    fn write_to_file(&self, path: &std::path::Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Result of a cleanup run.
#[derive(Default, Debug, Clone, Serialize)]
pub struct CleanupReport {
    pub updated: usize,
    pub unchanged: usize,
    /// Below the caller's minimum confidence
    pub skipped: usize,
    /// Rows that could not be decoded and were left untouched
    pub malformed: usize,
    /// How often each normalization heuristic fired on rows that were
    /// (or in a dry run, would have been) written.
    pub tag_histogram: BTreeMap<String, usize>,
    pub dry_run: bool,
    pub elapsed_seconds: f64,
}

impl CleanupReport {
    pub fn record_tags<'a>(&mut self, tags: impl IntoIterator<Item = &'a str>) {
        for tag in tags {
            *self.tag_histogram.entry(tag.to_string()).or_default() += 1;
        }
    }

    /// Fold a per-table report into the run total.
    pub fn absorb(&mut self, other: CleanupReport) {
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.skipped += other.skipped;
        self.malformed += other.malformed;
        for (tag, count) in other.tag_histogram {
            *self.tag_histogram.entry(tag).or_default() += count;
        }
    }

    /// Most frequent tags, highest count first, ties by name.
    pub fn top_tags(&self, limit: usize) -> Vec<(&str, usize)> {
        let mut tags: Vec<(&str, usize)> = self
            .tag_histogram
            .iter()
            .map(|(tag, count)| (tag.as_str(), *count))
            .collect();
        tags.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        tags.truncate(limit);
        tags
    }
}

impl StageReport for CleanupReport {}

/// A candidate in the review band, surfaced but never auto-applied.
#[derive(Debug, Clone, Serialize)]
pub struct ReviewCandidate {
    pub left: RecordKey,
    pub right: RecordKey,
    pub score: f64,
    pub reasons: Vec<&'static str>,
}

/// Result of a matching run.
#[derive(Default, Debug, Clone, Serialize)]
pub struct MatchReport {
    /// Candidate pairs produced by the blocking index
    pub pairs_considered: usize,
    /// Pairs that survived the raw-score floor
    pub pairs_scored: usize,
    /// Auto-link candidates accepted by the greedy assignment
    pub auto_linked: usize,
    /// Candidates in the review band
    pub review: usize,
    /// Accepted pairs skipped because the two sides already resolve to
    /// different canonical tracks
    pub conflicts: usize,
    pub new_canonical: usize,
    /// Existing canonical tracks that had empty fields filled
    pub updated_canonical: usize,
    pub new_links: usize,
    /// Unlinked rows given their own canonical track
    pub swept: usize,
    /// Source rows that could not be decoded and were left out
    pub malformed: usize,
    pub dry_run: bool,
    pub elapsed_seconds: f64,
    #[serde(skip)]
    pub review_candidates: Vec<ReviewCandidate>,
}

impl StageReport for MatchReport {}

/// Result of an index rebuild.
#[derive(Default, Debug, Clone, Serialize)]
pub struct IndexReport {
    pub artists: usize,
    pub albums: usize,
    pub tracks: usize,
    pub elapsed_seconds: f64,
}

impl StageReport for IndexReport {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_from_str() {
        assert_eq!("Streaming".parse::<Source>().unwrap(), Source::Streaming);
        assert_eq!("dj".parse::<Source>().unwrap(), Source::DjSoftware);
        assert_eq!(" filesystem ".parse::<Source>().unwrap(), Source::Filesystem);
        assert!("vinyl".parse::<Source>().is_err());
    }

    #[test]
    fn test_display_fallbacks() {
        let mut record = SourceRecord::new(Source::DjSoftware, "7");
        record.title_raw = Some("Raw Title".to_string());
        record.title = Some("  ".to_string());
        record.artist = Some("Clean Artist".to_string());
        record.artist_raw = Some("9A - Clean Artist".to_string());
        assert_eq!(record.display_title(), Some("Raw Title"));
        assert_eq!(record.display_artist(), Some("Clean Artist"));
        assert_eq!(record.key().to_string(), "dj:7");
    }

    #[test]
    fn test_cleanup_report_absorb_and_top_tags() {
        let mut total = CleanupReport::default();
        let mut table = CleanupReport {
            updated: 2,
            skipped: 1,
            ..Default::default()
        };
        table.record_tags(["artist_key_bpm", "mix_suffix", "mix_suffix"]);
        total.absorb(table.clone());
        total.absorb(table);

        assert_eq!(total.updated, 4);
        assert_eq!(total.skipped, 2);
        assert_eq!(total.top_tags(1), vec![("mix_suffix", 4)]);
        assert_eq!(total.top_tags(5).len(), 2);
    }

    #[test]
    fn test_report_write_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        let report = IndexReport {
            artists: 3,
            albums: 2,
            tracks: 5,
            elapsed_seconds: 0.0,
        };
        report.write_to_file(&path).unwrap();
        let json: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["artists"], 3);
        assert_eq!(json["tracks"], 5);
    }
}
