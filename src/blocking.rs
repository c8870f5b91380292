//! Blocking index for candidate generation.
//!
//! Rows of one source are indexed by cheap keys so that each row of the
//! opposite source is only scored against a handful of plausible partners:
//!
//! - first 12 chars of the normalized title
//! - (three longest title tokens, 2s duration bucket), looked up at ±1 bucket
//! - normalized absolute path (path-hinted passes only)
//! - last three path segments (path-hinted passes only)

use crate::models::SourceRecord;
use crate::normalize::{
    descriptor_tag_set, feature_set, normalize_artist_tokens, normalize_musical_key, normalize_path,
    normalize_title, path_identity, path_tail_key, title_key, token_key,
};
use rustc_hash::{FxHashMap, FxHashSet};

/// Width of a duration bucket in milliseconds.
pub const DURATION_BUCKET_MS: i64 = 2_000;

// ============================================================================
// Prepared rows
// ============================================================================

/// A source record with every comparison key precomputed.
#[derive(Clone, Debug)]
pub struct MatchRow {
    pub record: SourceRecord,
    pub norm_title: String,
    pub norm_album: String,
    /// First artist token, empty when the artist is unknown
    pub artist_primary: String,
    pub artist_set: FxHashSet<String>,
    pub features: FxHashSet<String>,
    /// Descriptor DJ tags only (remix, vip, ...)
    pub dj_tags: FxHashSet<String>,
    pub musical_key: Option<String>,
    /// Normalized path, original casing
    pub path: Option<String>,
    /// Case-folded normalized path
    pub path_key: Option<String>,
    pub path_tail_key: Option<String>,
    pub title_key: String,
    pub token_key: String,
    pub duration_bucket: Option<i64>,
}

impl MatchRow {
    pub fn from_record(record: SourceRecord) -> Self {
        let norm_title = record.display_title().map(normalize_title).unwrap_or_default();
        let norm_album = record.album.as_deref().map(normalize_title).unwrap_or_default();
        let artist_tokens = record.display_artist().map(normalize_artist_tokens).unwrap_or_default();
        let artist_primary = artist_tokens.first().cloned().unwrap_or_default();
        let path = record.path.as_deref().and_then(normalize_path);

        Self {
            title_key: title_key(&norm_title),
            token_key: token_key(&norm_title),
            duration_bucket: record.duration_ms.map(|ms| ms / DURATION_BUCKET_MS),
            features: feature_set(&record.features),
            dj_tags: descriptor_tag_set(&record.dj_tags),
            musical_key: record.musical_key.as_deref().and_then(normalize_musical_key),
            path_key: path.as_deref().map(path_identity),
            path_tail_key: path.as_deref().and_then(path_tail_key),
            artist_set: artist_tokens.into_iter().collect(),
            artist_primary,
            norm_title,
            norm_album,
            path,
            record,
        }
    }

    /// Whether the raw record names an artist at all.
    pub fn has_artist(&self) -> bool {
        self.record.display_artist().is_some()
    }
}

// ============================================================================
// Index
// ============================================================================

/// Inverted indices over a slice of rows, holding row positions.
#[derive(Default, Debug)]
pub struct BlockingIndex {
    title_key: FxHashMap<String, Vec<usize>>,
    token_buckets: FxHashMap<(String, i64), Vec<usize>>,
    path: FxHashMap<String, Vec<usize>>,
    path_tail: FxHashMap<String, Vec<usize>>,
}

impl BlockingIndex {
    pub fn build(rows: &[MatchRow]) -> Self {
        let mut index = Self::default();
        for (pos, row) in rows.iter().enumerate() {
            if !row.title_key.is_empty() {
                index.title_key.entry(row.title_key.clone()).or_default().push(pos);
            }
            if let (false, Some(bucket)) = (row.token_key.is_empty(), row.duration_bucket) {
                index
                    .token_buckets
                    .entry((row.token_key.clone(), bucket))
                    .or_default()
                    .push(pos);
            }
            if let Some(key) = &row.path_key {
                index.path.entry(key.clone()).or_default().push(pos);
            }
            if let Some(key) = &row.path_tail_key {
                index.path_tail.entry(key.clone()).or_default().push(pos);
            }
        }
        index
    }

    /// Positions of every indexed row sharing at least one key with `row`,
    /// sorted and deduplicated. Path keys are only consulted when `path_hint`.
    pub fn candidates(&self, row: &MatchRow, path_hint: bool) -> Vec<usize> {
        let mut found: Vec<usize> = Vec::new();

        if let (false, Some(bucket)) = (row.token_key.is_empty(), row.duration_bucket) {
            for neighbour in bucket - 1..=bucket + 1 {
                if let Some(list) = self.token_buckets.get(&(row.token_key.clone(), neighbour)) {
                    found.extend_from_slice(list);
                }
            }
        }

        if !row.title_key.is_empty() {
            if let Some(list) = self.title_key.get(&row.title_key) {
                found.extend_from_slice(list);
            }
        }

        if path_hint {
            if let Some(list) = row.path_key.as_ref().and_then(|key| self.path.get(key)) {
                found.extend_from_slice(list);
            }
            if let Some(list) = row.path_tail_key.as_ref().and_then(|key| self.path_tail.get(key)) {
                found.extend_from_slice(list);
            }
        }

        found.sort_unstable();
        found.dedup();
        found
    }
}
