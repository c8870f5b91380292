//! Cross-source matching.
//!
//! Three pairwise passes (streaming x DJ, streaming x files, DJ x files)
//! score blocked candidate pairs in parallel. Pairs clearing the auto-link
//! threshold and the minimum-acceptance gate are assigned greedily by
//! descending score; pairs just under the threshold form the review band.
//! Accepted pairs and the sweep of unmatched rows are written in one
//! transaction.

use crate::blocking::{BlockingIndex, MatchRow};
use crate::cancel::CancelToken;
use crate::canonical;
use crate::db;
use crate::error::Result;
use crate::models::{MatchReport, ReviewCandidate, Source, StageReport};
use crate::progress;
use crate::scoring::{score_pair, ScoreBreakdown};
use rayon::prelude::*;
use rusqlite::Connection;
use rustc_hash::FxHashSet;
use std::cmp::Ordering;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Candidates below this raw score are dropped as soon as they are scored.
pub const RAW_SCORE_FLOOR: f64 = 0.80;

/// Width of the review band under the auto-link threshold.
pub const REVIEW_BAND: f64 = 0.06;

pub const DEFAULT_MIN_AUTO_SCORE: f64 = 0.92;

/// `(left, right, path_hint)`; the right side is indexed.
const PASSES: [(Source, Source, bool); 3] = [
    (Source::Streaming, Source::DjSoftware, false),
    (Source::Streaming, Source::Filesystem, true),
    (Source::DjSoftware, Source::Filesystem, true),
];

#[derive(Clone, Copy, Debug)]
pub struct MatchOptions {
    pub min_auto_score: f64,
    /// Compute everything, roll back instead of committing.
    pub dry_run: bool,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            min_auto_score: DEFAULT_MIN_AUTO_SCORE,
            dry_run: false,
        }
    }
}

// ============================================================================
// Rows
// ============================================================================

/// Prepared rows of every source, ordered by natural id.
#[derive(Debug, Default)]
pub struct LibraryRows {
    pub streaming: Vec<MatchRow>,
    pub dj: Vec<MatchRow>,
    pub file: Vec<MatchRow>,
    /// Rows that failed to decode
    pub malformed: usize,
}

impl LibraryRows {
    pub fn load(conn: &Connection) -> Result<Self> {
        let mut rows = LibraryRows::default();
        for source in Source::ALL {
            let mut records = Vec::new();
            for entry in db::load_source_records(conn, source)? {
                match entry {
                    Ok(record) => records.push(record),
                    Err(e) if e.is_row_local() => {
                        warn!("Skipping row: {}", e);
                        rows.malformed += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
            let prepared: Vec<MatchRow> = records.into_par_iter().map(MatchRow::from_record).collect();
            *rows.rows_mut(source) = prepared;
        }
        Ok(rows)
    }

    pub fn from_rows(rows: impl IntoIterator<Item = MatchRow>) -> Self {
        let mut library = LibraryRows::default();
        for row in rows {
            library.rows_mut(row.record.source).push(row);
        }
        library
    }

    pub fn rows(&self, source: Source) -> &[MatchRow] {
        match source {
            Source::Streaming => &self.streaming,
            Source::DjSoftware => &self.dj,
            Source::Filesystem => &self.file,
        }
    }

    fn rows_mut(&mut self, source: Source) -> &mut Vec<MatchRow> {
        match source {
            Source::Streaming => &mut self.streaming,
            Source::DjSoftware => &mut self.dj,
            Source::Filesystem => &mut self.file,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &MatchRow> {
        self.streaming.iter().chain(&self.dj).chain(&self.file)
    }
}

// ============================================================================
// Candidates
// ============================================================================

#[derive(Clone, Debug)]
pub struct Candidate<'a> {
    pub left: &'a MatchRow,
    pub right: &'a MatchRow,
    pub breakdown: ScoreBreakdown,
}

impl Candidate<'_> {
    pub fn score(&self) -> f64 {
        self.breakdown.score
    }

    fn order_key(&self) -> (Source, &str, Source, &str) {
        (
            self.left.record.source,
            self.left.record.natural_id.as_str(),
            self.right.record.source,
            self.right.record.natural_id.as_str(),
        )
    }

    pub fn to_review(&self) -> ReviewCandidate {
        ReviewCandidate {
            left: self.left.record.key(),
            right: self.right.record.key(),
            score: self.breakdown.score,
            reasons: self.breakdown.reasons.clone(),
        }
    }
}

/// Score descending, then record keys for a stable order.
fn sort_candidates(candidates: &mut [Candidate<'_>]) {
    candidates.sort_by(|a, b| {
        b.score()
            .partial_cmp(&a.score())
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.order_key().cmp(&b.order_key()))
    });
}

/// Greedy assignment over candidates sorted by [`sort_candidates`]: a
/// candidate is accepted unless either record was already claimed by a
/// higher-scoring one.
pub fn assign<'a>(candidates: Vec<Candidate<'a>>) -> Vec<Candidate<'a>> {
    let mut claimed: FxHashSet<(Source, &'a str)> = FxHashSet::default();
    let mut accepted = Vec::new();
    for candidate in candidates {
        let (l, r): (&'a MatchRow, &'a MatchRow) = (candidate.left, candidate.right);
        let left = (l.record.source, l.record.natural_id.as_str());
        let right = (r.record.source, r.record.natural_id.as_str());
        if claimed.contains(&left) || claimed.contains(&right) {
            debug!(
                "Skipping {} <-> {} ({:.3}): already claimed",
                l.record.key(),
                r.record.key(),
                candidate.score()
            );
            continue;
        }
        claimed.insert(left);
        claimed.insert(right);
        accepted.push(candidate);
    }
    accepted
}

/// Score every blocked pair of one pass, keeping those above the raw floor.
/// Returns the number of pairs considered alongside the survivors.
fn score_pass<'a>(
    left: &'a [MatchRow],
    right: &'a [MatchRow],
    path_hint: bool,
    label: &str,
    cancel: &CancelToken,
) -> (usize, Vec<Candidate<'a>>) {
    let index = BlockingIndex::build(right);
    let pb = progress::create_progress_bar(left.len() as u64, label);

    let per_row: Vec<(usize, Vec<Candidate<'a>>)> = left
        .par_iter()
        .map(|row| {
            if cancel.is_cancelled() {
                return (0, Vec::new());
            }
            let positions = index.candidates(row, path_hint);
            let considered = positions.len();
            let scored = positions
                .into_iter()
                .filter_map(|pos| {
                    let other = &right[pos];
                    let breakdown = score_pair(row, other, path_hint);
                    (breakdown.score >= RAW_SCORE_FLOOR).then(|| Candidate {
                        left: row,
                        right: other,
                        breakdown,
                    })
                })
                .collect();
            progress::tick(&pb, label, 10_000);
            (considered, scored)
        })
        .collect();

    pb.finish_and_clear();

    let considered = per_row.iter().map(|(n, _)| n).sum();
    let scored = per_row.into_iter().flat_map(|(_, c)| c).collect();
    (considered, scored)
}

/// Everything matching decides before anything is written.
#[derive(Debug, Default)]
pub struct MatchOutcome<'a> {
    pub accepted: Vec<Candidate<'a>>,
    pub review: Vec<Candidate<'a>>,
    /// Auto-link candidates before greedy assignment
    pub auto_candidates: usize,
    pub pairs_considered: usize,
    pub pairs_scored: usize,
}

/// Run the three passes and split the results into accepted links and the
/// review band. Pure with respect to the store.
pub fn find_matches<'a>(rows: &'a LibraryRows, min_auto_score: f64, cancel: &CancelToken) -> Result<MatchOutcome<'a>> {
    let min_auto_score = min_auto_score.clamp(0.0, 1.0);
    let review_floor = (min_auto_score - REVIEW_BAND).clamp(0.0, 1.0);

    let mut outcome = MatchOutcome::default();
    let mut auto = Vec::new();

    for (left_source, right_source, path_hint) in PASSES {
        cancel.check("match")?;
        let (left, right) = (rows.rows(left_source), rows.rows(right_source));
        if left.is_empty() || right.is_empty() {
            continue;
        }

        let label = format!("Matching {} x {}", left_source, right_source);
        let (considered, scored) = score_pass(left, right, path_hint, &label, cancel);
        cancel.check("match")?;
        info!(
            "{}: {} pairs considered, {} above {:.2}",
            label,
            considered,
            scored.len(),
            RAW_SCORE_FLOOR
        );

        outcome.pairs_considered += considered;
        outcome.pairs_scored += scored.len();
        for candidate in scored {
            if !candidate.breakdown.meets_minimums() {
                continue;
            }
            if candidate.score() >= min_auto_score {
                auto.push(candidate);
            } else if candidate.score() >= review_floor {
                outcome.review.push(candidate);
            }
        }
    }

    sort_candidates(&mut auto);
    sort_candidates(&mut outcome.review);
    outcome.auto_candidates = auto.len();
    outcome.accepted = assign(auto);
    Ok(outcome)
}

/// Match all sources, link accepted pairs and sweep the rest into the
/// canonical table. In a dry run the transaction is rolled back, so the
/// report shows what would have been written.
pub fn run_match(conn: &mut Connection, options: &MatchOptions, cancel: &CancelToken) -> Result<MatchReport> {
    let start = Instant::now();
    let tx = conn.transaction()?;

    let rows = LibraryRows::load(&tx)?;
    info!(
        "Loaded {} streaming, {} DJ, {} file rows",
        rows.streaming.len(),
        rows.dj.len(),
        rows.file.len()
    );

    let outcome = find_matches(&rows, options.min_auto_score, cancel)?;
    let pairs: Vec<(&MatchRow, &MatchRow)> = outcome.accepted.iter().map(|c| (c.left, c.right)).collect();
    let applied = canonical::reconcile(&tx, &pairs, rows.iter(), cancel)?;

    if options.dry_run {
        tx.rollback()?;
    } else {
        tx.commit()?;
    }

    let report = MatchReport {
        pairs_considered: outcome.pairs_considered,
        pairs_scored: outcome.pairs_scored,
        auto_linked: outcome.accepted.len(),
        review: outcome.review.len(),
        conflicts: applied.conflicts,
        new_canonical: applied.new_canonical,
        updated_canonical: applied.updated_canonical,
        new_links: applied.new_links,
        swept: applied.swept,
        malformed: rows.malformed,
        dry_run: options.dry_run,
        elapsed_seconds: start.elapsed().as_secs_f64(),
        review_candidates: outcome.review.iter().map(Candidate::to_review).collect(),
    };
    report.log_phase("match");
    info!(
        "Auto-linked: {}, review: {} ({})",
        report.auto_linked,
        report.review,
        progress::format_duration(start.elapsed())
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocking::tests::row;
    use crate::db::test_support::{record, store_with};
    use proptest::prelude::*;

    fn library() -> LibraryRows {
        LibraryRows::from_rows([
            row(Source::Streaming, "s1", "Song", "Artist", Some(180_000), None),
            row(Source::Streaming, "s2", "Another One", "Band", Some(200_000), None),
            row(Source::DjSoftware, "d1", "Song", "Artist", Some(180_500), Some("/music/Artist/Song.mp3")),
            row(Source::Filesystem, "f1", "Song", "Artist", Some(181_000), Some("/music/Artist/Song.mp3")),
            row(Source::Filesystem, "f2", "Unrelated", "Nobody", Some(90_000), None),
        ])
    }

    #[test]
    fn test_find_matches_is_one_to_one() {
        let rows = library();
        let outcome = find_matches(&rows, DEFAULT_MIN_AUTO_SCORE, &CancelToken::new()).unwrap();

        // s1-d1, s1-f1 and d1-f1 all score 1.0. Ties break on record keys,
        // so s1-d1 goes first and claims both of its rows.
        assert_eq!(outcome.auto_candidates, 3);
        assert_eq!(outcome.accepted.len(), 1);
        let best = &outcome.accepted[0];
        assert_eq!(best.left.record.natural_id, "s1");
        assert_eq!(best.right.record.natural_id, "d1");
        assert!(outcome.review.is_empty());
    }

    #[test]
    fn test_review_band() {
        // 6s apart: duration 0.65, no tight-match bonus, score 0.83.
        let rows = LibraryRows::from_rows([
            row(Source::Streaming, "s1", "Song", "Artist", Some(180_000), None),
            row(Source::DjSoftware, "d1", "Song", "Artist", Some(186_000), None),
        ]);

        let strict = find_matches(&rows, 0.85, &CancelToken::new()).unwrap();
        assert!(strict.accepted.is_empty());
        assert_eq!(strict.review.len(), 1);
        assert_eq!(strict.review[0].to_review().left.to_string(), "streaming:s1");

        let lenient = find_matches(&rows, 0.80, &CancelToken::new()).unwrap();
        assert_eq!(lenient.accepted.len(), 1);
        assert!(lenient.review.is_empty());

        // Too far under the default threshold to be surfaced at all.
        let default = find_matches(&rows, DEFAULT_MIN_AUTO_SCORE, &CancelToken::new()).unwrap();
        assert!(default.accepted.is_empty() && default.review.is_empty());
    }

    #[test]
    fn test_cancelled_match_returns_error() {
        let rows = library();
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(find_matches(&rows, DEFAULT_MIN_AUTO_SCORE, &cancel).is_err());
    }

    #[test]
    fn test_run_match_writes_and_is_idempotent() {
        let mut s1 = record(Source::Streaming, "s1", "Song", "Artist");
        s1.duration_ms = Some(180_000);
        let mut f1 = record(Source::Filesystem, "f1", "Song", "Artist");
        f1.duration_ms = Some(181_000);
        f1.path = Some("/music/Artist/Song.mp3".to_string());
        let f2 = record(Source::Filesystem, "f2", "Other", "Someone");
        let mut conn = store_with(&[s1, f1, f2]);

        let report = run_match(&mut conn, &MatchOptions::default(), &CancelToken::new()).unwrap();
        assert_eq!(report.auto_linked, 1);
        assert_eq!(report.new_canonical, 2);
        assert_eq!(report.new_links, 3);
        assert_eq!(report.swept, 1);

        let again = run_match(&mut conn, &MatchOptions::default(), &CancelToken::new()).unwrap();
        assert_eq!(again.auto_linked, 1);
        assert_eq!(again.new_canonical, 0);
        assert_eq!(again.new_links, 0);
        assert_eq!(again.updated_canonical, 0);
        assert_eq!(db::count_rows(&conn, "canonical_tracks").unwrap(), 2);
    }

    #[test]
    fn test_same_path_with_weak_title_joins_through_sweep() {
        let path = "/music/Artist/track01.mp3";
        let breakdown = score_pair(
            &row(Source::DjSoftware, "d1", "Intro Tool", "Artist", Some(180_000), Some(path)),
            &row(Source::Filesystem, "f1", "Something Else Entirely", "Artist", Some(180_000), Some(path)),
            true,
        );
        assert!(breakdown.path_exact);
        assert!(breakdown.title < 0.6);
        assert!(breakdown.score < DEFAULT_MIN_AUTO_SCORE);

        let mut d1 = record(Source::DjSoftware, "d1", "Intro Tool", "Artist");
        d1.duration_ms = Some(180_000);
        d1.path = Some(path.to_string());
        let mut f1 = record(Source::Filesystem, "f1", "Something Else Entirely", "Artist");
        f1.duration_ms = Some(180_000);
        f1.path = Some(path.to_string());
        let mut conn = store_with(&[d1, f1]);

        let report = run_match(&mut conn, &MatchOptions::default(), &CancelToken::new()).unwrap();
        assert_eq!(report.auto_linked, 0);
        assert_eq!(report.new_canonical, 1);
        assert_eq!(report.swept, 1);
        assert_eq!(report.new_links, 2);
        assert_eq!(db::count_rows(&conn, "canonical_tracks").unwrap(), 1);
    }

    #[test]
    fn test_dry_run_writes_nothing() {
        let mut conn = store_with(&[
            record(Source::Streaming, "s1", "Song", "Artist"),
            record(Source::DjSoftware, "d1", "Song", "Artist"),
        ]);
        let options = MatchOptions {
            dry_run: true,
            ..Default::default()
        };
        let report = run_match(&mut conn, &options, &CancelToken::new()).unwrap();
        assert!(report.new_canonical > 0);
        assert_eq!(db::count_rows(&conn, "canonical_tracks").unwrap(), 0);
        assert_eq!(db::count_rows(&conn, "dj_links").unwrap(), 0);
    }

    #[test]
    fn test_malformed_rows_are_counted() {
        let mut conn = store_with(&[record(Source::DjSoftware, "d1", "Song", "Artist")]);
        conn.execute("UPDATE dj_tracks SET bpm = 'fast' WHERE natural_id = 'd1'", [])
            .unwrap();
        let report = run_match(&mut conn, &MatchOptions::default(), &CancelToken::new()).unwrap();
        assert_eq!(report.malformed, 1);
        assert_eq!(report.new_canonical, 0);
    }

    proptest! {
        #[test]
        fn prop_greedy_never_double_assigns(
            titles in prop::collection::vec(prop::sample::select(vec!["Song", "Song!", "Tune", "Tune 2"]), 1..12),
            durations in prop::collection::vec(170_000i64..190_000, 12),
        ) {
            let rows: Vec<MatchRow> = titles
                .iter()
                .enumerate()
                .map(|(i, title)| {
                    let source = Source::ALL[i % 3];
                    row(source, &format!("r{}", i), title, "Artist", Some(durations[i]), None)
                })
                .collect();
            let library = LibraryRows::from_rows(rows);
            let outcome = find_matches(&library, 0.85, &CancelToken::new()).unwrap();

            let mut seen = FxHashSet::default();
            for candidate in &outcome.accepted {
                prop_assert!(seen.insert(candidate.left.record.key()));
                prop_assert!(seen.insert(candidate.right.record.key()));
            }
        }
    }
}
