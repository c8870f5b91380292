//! Canonical merge and identity index.
//!
//! Accepted pairs resolve to an existing canonical track through the
//! identity index (built from persisted links) or allocate a new one.
//! New tracks take each field from the preferred source; existing tracks
//! only have their empty fields filled. Rows still unlinked after all
//! pairs are swept into their own canonical track.

use crate::blocking::MatchRow;
use crate::cancel::CancelToken;
use crate::db;
use crate::error::Result;
use crate::models::{CanonicalTrack, Source, SourceRecord};
use crate::normalize::{normalize_path, path_identity};
use rusqlite::Connection;
use rustc_hash::FxHashMap;
use tracing::debug;

/// Title, artist, album and album artist.
const TEXT_PRECEDENCE: [Source; 3] = [Source::Streaming, Source::DjSoftware, Source::Filesystem];
const TRACK_NUMBER_PRECEDENCE: [Source; 3] = [Source::Streaming, Source::Filesystem, Source::DjSoftware];
/// Musical key and BPM.
const HARMONIC_PRECEDENCE: [Source; 3] = [Source::DjSoftware, Source::Filesystem, Source::Streaming];
const PATH_PRECEDENCE: [Source; 2] = [Source::Filesystem, Source::DjSoftware];

// ============================================================================
// Identity index
// ============================================================================

/// How an accepted pair maps onto canonical identities.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    Existing(i64),
    New,
    /// The sides already belong to different tracks, or the track already
    /// holds another record from one of the sides' sources.
    Conflict,
}

/// Bidirectional map between source records and canonical ids.
#[derive(Debug, Default)]
pub struct IdentityIndex {
    by_record: FxHashMap<(Source, String), i64>,
    slots: FxHashMap<(i64, Source), String>,
    by_path: FxHashMap<String, i64>,
    last_id: i64,
}

impl IdentityIndex {
    /// Rebuild from persisted link state and canonical paths.
    pub fn load(conn: &Connection) -> Result<Self> {
        let mut index = IdentityIndex {
            last_id: db::max_canonical_id(conn)?,
            ..Default::default()
        };
        for source in Source::ALL {
            for (canonical_id, natural_id) in db::load_links(conn, source)? {
                index.remember(canonical_id, source, &natural_id);
            }
        }
        for (canonical_id, path) in db::load_canonical_paths(conn)? {
            index.by_path.entry(path_identity(&path)).or_insert(canonical_id);
        }
        Ok(index)
    }

    fn remember(&mut self, canonical_id: i64, source: Source, natural_id: &str) {
        self.by_record.insert((source, natural_id.to_string()), canonical_id);
        self.slots.insert((canonical_id, source), natural_id.to_string());
    }

    /// Canonical id this record is already linked to.
    pub fn linked(&self, source: Source, natural_id: &str) -> Option<i64> {
        self.by_record.get(&(source, natural_id.to_string())).copied()
    }

    fn slot(&self, canonical_id: i64, source: Source) -> Option<&str> {
        self.slots.get(&(canonical_id, source)).map(String::as_str)
    }

    /// Canonical id for a row: its own link first, then a track at the
    /// same location whose slot for the row's source is still free.
    pub fn lookup(&self, row: &MatchRow) -> Option<i64> {
        let record = &row.record;
        if let Some(id) = self.linked(record.source, &record.natural_id) {
            return Some(id);
        }
        let path_key = row.path_key.as_ref()?;
        let id = *self.by_path.get(path_key)?;
        self.slot(id, record.source).is_none().then_some(id)
    }

    /// Where an accepted pair belongs: a new track, the track either side
    /// already resolves to, or a conflict when the sides disagree or the
    /// target already holds a different record of the same source.
    pub fn resolve(&self, a: &MatchRow, b: &MatchRow) -> Resolution {
        let target = match (self.lookup(a), self.lookup(b)) {
            (Some(x), Some(y)) if x != y => return Resolution::Conflict,
            (Some(x), _) | (_, Some(x)) => x,
            (None, None) => return Resolution::New,
        };
        for row in [a, b] {
            let record = &row.record;
            if let Some(held) = self.slot(target, record.source) {
                if held != record.natural_id {
                    return Resolution::Conflict;
                }
            }
        }
        Resolution::Existing(target)
    }

    /// Next unused canonical id.
    fn allocate(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }

    fn remember_path(&mut self, canonical_id: i64, path: Option<&str>) {
        if let Some(path) = path {
            self.by_path.entry(path_identity(path)).or_insert(canonical_id);
        }
    }
}

// ============================================================================
// Merge
// ============================================================================

/// Trimmed owned copy, `None` for blank values.
fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// First value produced by a record of the earliest source in `order`.
fn pick<T>(records: &[&SourceRecord], order: &[Source], field: impl Fn(&SourceRecord) -> Option<T>) -> Option<T> {
    order.iter().find_map(|source| {
        records
            .iter()
            .filter(|r| r.source == *source)
            .find_map(|r| field(*r))
    })
}

/// Case-insensitive union preserving first-seen spelling and order.
fn union(sets: impl IntoIterator<Item = impl IntoIterator<Item = String>>) -> Vec<String> {
    let mut seen = rustc_hash::FxHashSet::default();
    let mut out = Vec::new();
    for set in sets {
        for value in set {
            if seen.insert(value.to_lowercase()) {
                out.push(value);
            }
        }
    }
    out
}

/// Median of whole seconds; the upper middle value for even counts.
pub fn median_duration_sec(durations_ms: impl IntoIterator<Item = i64>) -> Option<i64> {
    let mut seconds: Vec<i64> = durations_ms
        .into_iter()
        .filter(|ms| *ms > 0)
        .map(|ms| (ms + 500) / 1000)
        .collect();
    if seconds.is_empty() {
        return None;
    }
    seconds.sort_unstable();
    Some(seconds[seconds.len() / 2])
}

/// Build canonical fields from the records of one identity.
pub fn merge_records(records: &[&SourceRecord]) -> CanonicalTrack {
    let mut records = records.to_vec();
    records.sort_by_key(|r| r.source);
    let records = records.as_slice();
    let artist = pick(records, &TEXT_PRECEDENCE, |r| non_blank(r.display_artist()));
    let mut track = CanonicalTrack {
        title: pick(records, &TEXT_PRECEDENCE, |r| non_blank(r.display_title())),
        title_raw: pick(records, &TEXT_PRECEDENCE, |r| non_blank(r.title_raw.as_deref())),
        artist_raw: pick(records, &TEXT_PRECEDENCE, |r| non_blank(r.artist_raw.as_deref())),
        album: pick(records, &TEXT_PRECEDENCE, |r| non_blank(r.album.as_deref())),
        album_artist: pick(records, &TEXT_PRECEDENCE, |r| non_blank(r.album_artist.as_deref()))
            .or_else(|| artist.clone()),
        artist,
        genre: pick(records, &[Source::Streaming], |r| non_blank(r.genre.as_deref())),
        track_number: pick(records, &TRACK_NUMBER_PRECEDENCE, |r| r.track_number),
        duration_sec: median_duration_sec(records.iter().filter_map(|r| r.duration_ms)),
        play_count: pick(records, &[Source::Streaming], |r| r.play_count),
        local_path: pick(records, &PATH_PRECEDENCE, |r| r.path.as_deref().and_then(normalize_path)),
        musical_key: pick(records, &HARMONIC_PRECEDENCE, |r| non_blank(r.musical_key.as_deref())),
        bpm: pick(records, &HARMONIC_PRECEDENCE, |r| r.bpm),
        features: union(records.iter().map(|r| r.features.clone())),
        dj_tags: union(records.iter().map(|r| r.dj_tags.clone())),
        clean_confidence: records
            .iter()
            .filter_map(|r| r.clean_confidence)
            .reduce(f64::max),
        clean_log: union(records.iter().map(|r| r.clean_log.clone())),
        ..Default::default()
    };
    for record in records {
        if track.source_id(record.source).is_none() {
            track.set_source_id(record.source, record.natural_id.clone());
        }
    }
    track
}

/// Fill empty fields of `existing` from `merged`. Returns whether anything
/// changed; populated fields are never replaced.
pub fn fill_missing(existing: &mut CanonicalTrack, merged: &CanonicalTrack) -> bool {
    fn fill<T: Clone>(slot: &mut Option<T>, value: &Option<T>) -> bool {
        if slot.is_none() && value.is_some() {
            *slot = value.clone();
            return true;
        }
        false
    }
    fn fill_set(slot: &mut Vec<String>, value: &[String]) -> bool {
        if slot.is_empty() && !value.is_empty() {
            *slot = value.to_vec();
            return true;
        }
        false
    }

    let mut changed = false;
    changed |= fill(&mut existing.title, &merged.title);
    changed |= fill(&mut existing.artist, &merged.artist);
    changed |= fill(&mut existing.title_raw, &merged.title_raw);
    changed |= fill(&mut existing.artist_raw, &merged.artist_raw);
    changed |= fill(&mut existing.album, &merged.album);
    changed |= fill(&mut existing.album_artist, &merged.album_artist);
    changed |= fill(&mut existing.genre, &merged.genre);
    changed |= fill(&mut existing.track_number, &merged.track_number);
    changed |= fill(&mut existing.duration_sec, &merged.duration_sec);
    changed |= fill(&mut existing.play_count, &merged.play_count);
    changed |= fill(&mut existing.streaming_id, &merged.streaming_id);
    changed |= fill(&mut existing.dj_id, &merged.dj_id);
    changed |= fill(&mut existing.file_id, &merged.file_id);
    changed |= fill(&mut existing.local_path, &merged.local_path);
    changed |= fill(&mut existing.musical_key, &merged.musical_key);
    changed |= fill(&mut existing.bpm, &merged.bpm);
    changed |= fill_set(&mut existing.features, &merged.features);
    changed |= fill_set(&mut existing.dj_tags, &merged.dj_tags);
    changed |= fill(&mut existing.clean_confidence, &merged.clean_confidence);
    changed |= fill_set(&mut existing.clean_log, &merged.clean_log);
    changed
}

// ============================================================================
// Apply
// ============================================================================

/// Write counters of one reconciliation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ApplyStats {
    pub new_canonical: usize,
    pub updated_canonical: usize,
    pub new_links: usize,
    pub conflicts: usize,
    pub swept: usize,
}

struct Writer<'c> {
    conn: &'c Connection,
    index: IdentityIndex,
    stats: ApplyStats,
}

impl Writer<'_> {
    fn create(&mut self, rows: &[&MatchRow]) -> Result<i64> {
        let records: Vec<&SourceRecord> = rows.iter().map(|r| &r.record).collect();
        let mut track = merge_records(&records);
        track.id = self.index.allocate();
        db::insert_canonical(self.conn, &track)?;
        self.index.remember_path(track.id, track.local_path.as_deref());
        self.stats.new_canonical += 1;
        for row in rows {
            self.link(track.id, row)?;
        }
        Ok(track.id)
    }

    fn extend(&mut self, canonical_id: i64, rows: &[&MatchRow]) -> Result<()> {
        if let Some(mut existing) = db::fetch_canonical(self.conn, canonical_id)? {
            let records: Vec<&SourceRecord> = rows.iter().map(|r| &r.record).collect();
            let merged = merge_records(&records);
            if fill_missing(&mut existing, &merged) {
                db::update_canonical(self.conn, &existing)?;
                self.index.remember_path(canonical_id, existing.local_path.as_deref());
                self.stats.updated_canonical += 1;
            }
        }
        for row in rows {
            self.link(canonical_id, row)?;
        }
        Ok(())
    }

    fn link(&mut self, canonical_id: i64, row: &MatchRow) -> Result<()> {
        let record = &row.record;
        if self.index.linked(record.source, &record.natural_id).is_some() {
            return Ok(());
        }
        if db::insert_link(self.conn, record.source, canonical_id, &record.natural_id)? {
            self.stats.new_links += 1;
        }
        self.index.remember(canonical_id, record.source, &record.natural_id);
        Ok(())
    }
}

/// Apply accepted pairs in order, then sweep every still-unlinked row.
/// Runs inside the caller's transaction.
pub fn reconcile<'r>(
    conn: &Connection,
    accepted: &[(&MatchRow, &MatchRow)],
    all_rows: impl IntoIterator<Item = &'r MatchRow>,
    cancel: &CancelToken,
) -> Result<ApplyStats> {
    let mut writer = Writer {
        conn,
        index: IdentityIndex::load(conn)?,
        stats: ApplyStats::default(),
    };

    for &(a, b) in accepted {
        cancel.check("match")?;
        match writer.index.resolve(a, b) {
            Resolution::Conflict => {
                debug!("Skipping {} <-> {}: identity conflict", a.record.key(), b.record.key());
                writer.stats.conflicts += 1;
            }
            Resolution::New => {
                let id = writer.create(&[a, b])?;
                debug!("New canonical {} for {} <-> {}", id, a.record.key(), b.record.key());
            }
            Resolution::Existing(id) => writer.extend(id, &[a, b])?,
        }
    }

    for row in all_rows {
        cancel.check("match")?;
        match writer.index.lookup(row) {
            Some(id) if writer.index.linked(row.record.source, &row.record.natural_id).is_none() => {
                debug!("Attaching {} to canonical {} by path", row.record.key(), id);
                writer.extend(id, &[row])?;
            }
            Some(_) => {}
            None => {
                writer.create(&[row])?;
                writer.stats.swept += 1;
            }
        }
    }

    Ok(writer.stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocking::tests::row;
    use crate::db::test_support::record;

    fn track_count(conn: &Connection) -> i64 {
        db::count_rows(conn, "canonical_tracks").unwrap()
    }

    #[test]
    fn test_merge_precedence() {
        let mut streaming = record(Source::Streaming, "s1", "Song", "Artist");
        streaming.genre = Some("House".to_string());
        streaming.duration_ms = Some(180_000);
        streaming.bpm = Some(100.0);
        streaming.play_count = Some(12);
        let mut dj = record(Source::DjSoftware, "d1", "Song (Extended Mix)", "artist");
        dj.genre = Some("Techno".to_string());
        dj.duration_ms = Some(181_400);
        dj.bpm = Some(124.0);
        dj.musical_key = Some("8A".to_string());
        dj.track_number = Some(4);
        dj.path = Some("file:///C:/Music/Song.mp3".to_string());
        dj.dj_tags = vec!["Extended Mix".to_string()];
        let mut file = record(Source::Filesystem, "f1", "Song", "Artist");
        file.duration_ms = Some(200_000);
        file.track_number = Some(2);
        file.path = Some("C:\\Music\\Song.mp3".to_string());
        file.dj_tags = vec!["extended mix".to_string(), "VIP".to_string()];

        let merged = merge_records(&[&file, &dj, &streaming]);
        assert_eq!(merged.title.as_deref(), Some("Song"));
        assert_eq!(merged.genre.as_deref(), Some("House"));
        assert_eq!(merged.bpm, Some(124.0));
        assert_eq!(merged.musical_key.as_deref(), Some("8A"));
        assert_eq!(merged.track_number, Some(2));
        assert_eq!(merged.duration_sec, Some(181));
        assert_eq!(merged.play_count, Some(12));
        assert_eq!(merged.album_artist.as_deref(), Some("Artist"));
        assert_eq!(merged.local_path.as_deref(), Some("C:/Music/Song.mp3"));
        assert_eq!(merged.dj_tags, vec!["Extended Mix", "VIP"]);
        assert_eq!(merged.source_id(Source::DjSoftware), Some("d1"));
    }

    #[test]
    fn test_genre_only_from_streaming() {
        let mut dj = record(Source::DjSoftware, "d1", "Song", "Artist");
        dj.genre = Some("Techno".to_string());
        assert_eq!(merge_records(&[&dj]).genre, None);
    }

    #[test]
    fn test_median_duration() {
        assert_eq!(median_duration_sec([180_000, 240_000, 181_000]), Some(181));
        assert_eq!(median_duration_sec([180_000, 200_000]), Some(200));
        assert_eq!(median_duration_sec(std::iter::empty()), None);
    }

    #[test]
    fn test_fill_missing_never_overwrites() {
        let mut existing = CanonicalTrack {
            id: 3,
            title: Some("Kept".to_string()),
            ..Default::default()
        };
        let merged = CanonicalTrack {
            title: Some("Other".to_string()),
            genre: Some("House".to_string()),
            ..Default::default()
        };
        assert!(fill_missing(&mut existing, &merged));
        assert_eq!(existing.title.as_deref(), Some("Kept"));
        assert_eq!(existing.genre.as_deref(), Some("House"));
        assert!(!fill_missing(&mut existing, &merged));
    }

    #[test]
    fn test_reconcile_links_pairs_and_sweeps() {
        let conn = db::open_in_memory().unwrap();
        let s1 = row(Source::Streaming, "s1", "Song", "Artist", Some(180_000), None);
        let f1 = row(Source::Filesystem, "f1", "Song", "Artist", Some(181_000), Some("/m/Song.mp3"));
        let f2 = row(Source::Filesystem, "f2", "Other", "Artist", None, None);
        let all = [&s1, &f1, &f2];

        let stats = reconcile(&conn, &[(&s1, &f1)], all, &CancelToken::new()).unwrap();
        assert_eq!(stats.new_canonical, 2);
        assert_eq!(stats.new_links, 3);
        assert_eq!(stats.swept, 1);
        assert_eq!(track_count(&conn), 2);

        let merged = db::fetch_canonical(&conn, 1).unwrap().unwrap();
        assert_eq!(merged.streaming_id.as_deref(), Some("s1"));
        assert_eq!(merged.file_id.as_deref(), Some("f1"));

        // Second pass over the same state writes nothing.
        let again = reconcile(&conn, &[(&s1, &f1)], all, &CancelToken::new()).unwrap();
        assert_eq!(again, ApplyStats::default());
        assert_eq!(track_count(&conn), 2);
    }

    #[test]
    fn test_conflicting_identities_are_skipped() {
        let conn = db::open_in_memory().unwrap();
        let s1 = row(Source::Streaming, "s1", "Song", "Artist", None, None);
        let d1 = row(Source::DjSoftware, "d1", "Song", "Artist", None, None);
        let d2 = row(Source::DjSoftware, "d2", "Song", "Artist", None, None);
        let f1 = row(Source::Filesystem, "f1", "Song", "Artist", None, None);
        reconcile(&conn, &[(&s1, &d1), (&d2, &f1)], [], &CancelToken::new()).unwrap();

        // s1 and f1 now live on different tracks.
        let stats = reconcile(&conn, &[(&s1, &f1)], [], &CancelToken::new()).unwrap();
        assert_eq!(stats.conflicts, 1);

        // The track holding s1 already has a DJ record.
        let d3 = row(Source::DjSoftware, "d3", "Song", "Artist", None, None);
        let stats = reconcile(&conn, &[(&s1, &d3)], [], &CancelToken::new()).unwrap();
        assert_eq!(stats.conflicts, 1);
    }

    #[test]
    fn test_sweep_attaches_by_path() {
        let conn = db::open_in_memory().unwrap();
        let s1 = row(Source::Streaming, "s1", "Song", "Artist", None, None);
        let d1 = row(Source::DjSoftware, "d1", "Song", "Artist", None, Some("file:///music/Song.mp3"));
        let f1 = row(Source::Filesystem, "f1", "Untitled", "", None, Some("/Music/song.mp3"));

        let stats = reconcile(&conn, &[(&s1, &d1)], [&s1, &d1, &f1], &CancelToken::new()).unwrap();
        assert_eq!(stats.swept, 0);
        assert_eq!(track_count(&conn), 1);
        let track = db::fetch_canonical(&conn, 1).unwrap().unwrap();
        assert_eq!(track.file_id.as_deref(), Some("f1"));
    }

    #[test]
    fn test_cancelled_reconcile_stops() {
        let conn = db::open_in_memory().unwrap();
        let s1 = row(Source::Streaming, "s1", "Song", "Artist", None, None);
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(reconcile(&conn, &[], [&s1], &cancel).is_err());
    }
}
