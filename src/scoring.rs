//! Multi-factor similarity scoring between two prepared rows.
//!
//! Nine component scores in [0, 1] are blended with fixed weights, then
//! contextual bonuses and penalties are applied. A component of 0.5 means
//! "not comparable" (missing on one side), not a negative signal.

use crate::blocking::MatchRow;
use crate::normalize::path_segments;
use rustc_hash::FxHashSet;
use serde::Serialize;
use std::hash::Hash;

// ============================================================================
// Weights and thresholds
// ============================================================================

const W_TITLE: f64 = 0.35;
const W_ARTIST: f64 = 0.25;
const W_DURATION: f64 = 0.20;
const W_ALBUM: f64 = 0.07;
const W_BPM: f64 = 0.05;
const W_KEY: f64 = 0.04;
const W_FEATURE: f64 = 0.03;
const W_DJ_TAG: f64 = 0.01;
const W_PATH_TAIL: f64 = 0.08;

/// Score used when an attribute is missing on either side.
pub const NOT_COMPARABLE: f64 = 0.5;

/// Duration delta (ms) under which the tight-match bonuses apply.
const CLOSE_DURATION_MS: i64 = 2_000;

// ============================================================================
// Breakdown
// ============================================================================

/// Component scores, final score and the reasons that shaped it.
#[derive(Clone, Debug, Serialize)]
pub struct ScoreBreakdown {
    pub score: f64,
    pub title: f64,
    pub artist: f64,
    pub duration: f64,
    pub duration_missing: bool,
    pub album: f64,
    pub bpm: f64,
    pub key: f64,
    pub feature: f64,
    pub dj_tag: f64,
    pub path_tail: f64,
    pub path_exact: bool,
    pub reasons: Vec<&'static str>,
}

impl ScoreBreakdown {
    /// Minimum-acceptance gate, independent of the score threshold.
    /// At least one must hold:
    /// - exact path match
    /// - title >= 0.75
    /// - duration unknown on a side, title >= 0.65 and artist >= 0.55
    /// - title >= 0.65 and duration >= 0.85
    pub fn meets_minimums(&self) -> bool {
        if self.path_exact {
            return true;
        }
        if self.title >= 0.75 {
            return true;
        }
        if self.duration_missing && self.title >= 0.65 && self.artist >= 0.55 {
            return true;
        }
        self.title >= 0.65 && self.duration >= 0.85
    }
}

// ============================================================================
// Pair scoring
// ============================================================================

/// Score `a` against `b`. `path_hint` enables the path-tail component and
/// the path bonuses; it is only set on passes where both sides carry paths.
pub fn score_pair(a: &MatchRow, b: &MatchRow, path_hint: bool) -> ScoreBreakdown {
    let mut reasons = Vec::new();

    let title = title_score(&a.norm_title, &b.norm_title);
    if title >= 1.0 && !a.norm_title.is_empty() {
        reasons.push("title_exact");
    }
    let artist = artist_score(a, b);
    if !a.artist_primary.is_empty() && a.artist_primary == b.artist_primary {
        reasons.push("artist_exact");
    }
    let duration_missing = a.record.duration_ms.is_none() || b.record.duration_ms.is_none();
    let duration = duration_score(a.record.duration_ms, b.record.duration_ms);
    if duration >= 1.0 && !duration_missing {
        reasons.push("duration_exact");
    }
    let album = album_score(&a.norm_album, &b.norm_album);
    let bpm = bpm_score(a.record.bpm, b.record.bpm);
    let key = key_score(a.musical_key.as_deref(), b.musical_key.as_deref());
    let feature = set_score(&a.features, &b.features);
    let dj_tag = set_score(&a.dj_tags, &b.dj_tags);
    let path_exact = path_hint && a.path_key.is_some() && a.path_key == b.path_key;
    let path_tail = if path_hint {
        path_tail_score(a.path.as_deref(), b.path.as_deref())
    } else {
        0.0
    };

    let mut components = vec![
        (title, W_TITLE),
        (artist, W_ARTIST),
        (duration, W_DURATION),
        (album, W_ALBUM),
        (bpm, W_BPM),
        (key, W_KEY),
        (feature, W_FEATURE),
        (dj_tag, W_DJ_TAG),
    ];
    if path_hint && path_tail > 0.0 {
        components.push((path_tail, W_PATH_TAIL));
    }
    let weight_sum: f64 = components.iter().map(|(_, w)| w).sum();
    let total: f64 = components.iter().map(|(s, w)| s * w).sum();
    let mut score = if weight_sum > 0.0 { total / weight_sum } else { 0.0 };

    let close_duration = match (a.record.duration_ms, b.record.duration_ms) {
        (Some(x), Some(y)) => (x - y).abs() <= CLOSE_DURATION_MS,
        _ => false,
    };

    if title >= 0.99 && artist >= 0.99 && close_duration {
        score += 0.15;
        reasons.push("bonus_title_artist_duration");
    } else if close_duration && title >= 0.90 {
        score += 0.10;
        reasons.push("bonus_title_duration");
    }

    if path_exact {
        score += 0.25;
        reasons.push("bonus_path_exact");
    } else if path_hint && path_tail >= 0.99 {
        score += 0.12;
        reasons.push("bonus_path_tail_exact");
    } else if path_hint && path_tail >= 0.75 {
        score += 0.08;
        reasons.push("bonus_path_tail_strong");
    } else if path_hint && path_tail >= 0.50 {
        score += 0.04;
        reasons.push("bonus_path_tail_partial");
    }

    if title < 0.6 {
        score -= 0.20;
        reasons.push("penalty_title_low");
    }
    if duration == 0.0 && !path_exact {
        score -= 0.15;
        reasons.push("penalty_duration_mismatch");
    }
    if artist < 0.3 && a.has_artist() && b.has_artist() {
        score -= 0.10;
        reasons.push("penalty_artist_mismatch");
    }

    ScoreBreakdown {
        score: score.clamp(0.0, 1.0),
        title,
        artist,
        duration,
        duration_missing,
        album,
        bpm,
        key,
        feature,
        dj_tag,
        path_tail,
        path_exact,
        reasons,
    }
}

// ============================================================================
// Components
// ============================================================================

/// 1.0 for identical normalized titles, else the better of token Jaccard
/// and normalized Levenshtein.
pub fn title_score(a: &str, b: &str) -> f64 {
    if a.trim().is_empty() || b.trim().is_empty() {
        return NOT_COMPARABLE;
    }
    if a == b {
        return 1.0;
    }
    jaccard(&tokenize(a), &tokenize(b)).max(levenshtein_ratio(a, b))
}

/// Better of full-token-set Jaccard and primary-artist Levenshtein.
pub fn artist_score(a: &MatchRow, b: &MatchRow) -> f64 {
    if a.artist_set.is_empty() || b.artist_set.is_empty() {
        return NOT_COMPARABLE;
    }
    jaccard(&a.artist_set, &b.artist_set).max(levenshtein_ratio(&a.artist_primary, &b.artist_primary))
}

/// Bucketed closeness of two durations in milliseconds.
///
/// | |Δ|      | score |
/// |----------|-------|
/// | 0        | 1.00  |
/// | ≤ 2s     | 0.95  |
/// | ≤ 5s     | 0.85  |
/// | ≤ 10s    | 0.65  |
/// | ≤ 20s    | 0.35  |
/// | beyond   | 0.00  |
pub fn duration_score(a_ms: Option<i64>, b_ms: Option<i64>) -> f64 {
    let (Some(a), Some(b)) = (a_ms, b_ms) else {
        return NOT_COMPARABLE;
    };
    match (a - b).abs() {
        0 => 1.0,
        1..=2_000 => 0.95,
        2_001..=5_000 => 0.85,
        5_001..=10_000 => 0.65,
        10_001..=20_000 => 0.35,
        _ => 0.0,
    }
}

/// 1.0 for identical normalized albums, else token Jaccard.
pub fn album_score(a: &str, b: &str) -> f64 {
    if a.trim().is_empty() || b.trim().is_empty() {
        return NOT_COMPARABLE;
    }
    if a == b {
        return 1.0;
    }
    jaccard(&tokenize(a), &tokenize(b))
}

/// BPM closeness after rounding each side to 0.1.
pub fn bpm_score(a: Option<f64>, b: Option<f64>) -> f64 {
    let (Some(a), Some(b)) = (a, b) else {
        return NOT_COMPARABLE;
    };
    // Compare in integer tenths to avoid float noise at bucket edges.
    let tenths = ((a * 10.0).round() as i64 - (b * 10.0).round() as i64).abs();
    match tenths {
        0..=2 => 1.0,
        3..=6 => 0.8,
        7..=10 => 0.6,
        11..=20 => 0.3,
        _ => 0.0,
    }
}

/// 1.0 for the same Camelot code, 0.3 for the same wheel number with the
/// other letter, 0.0 otherwise.
pub fn key_score(a: Option<&str>, b: Option<&str>) -> f64 {
    let (Some(a), Some(b)) = (a, b) else {
        return NOT_COMPARABLE;
    };
    if a.eq_ignore_ascii_case(b) {
        return 1.0;
    }
    match (camelot_number(a), camelot_number(b)) {
        (Some(x), Some(y)) if x == y => 0.3,
        _ => 0.0,
    }
}

/// Wheel number (1-12) of a Camelot code such as `8A`.
fn camelot_number(key: &str) -> Option<u8> {
    let mut chars = key.chars();
    let letter = chars.next_back()?;
    if !matches!(letter, 'A' | 'B' | 'a' | 'b') {
        return None;
    }
    chars.as_str().parse::<u8>().ok().filter(|n| (1..=12).contains(n))
}

/// Jaccard of two sets, 0.5 when either side is empty.
pub fn set_score<T: Eq + Hash>(a: &FxHashSet<T>, b: &FxHashSet<T>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return NOT_COMPARABLE;
    }
    jaccard(a, b)
}

/// Suffix continuity × coverage of two normalized paths.
///
/// Segments are compared from the file name backward, the i-th segment
/// from the end weighing i, stopping at the first mismatch. The weighted
/// match ratio is scaled by (segments compared / longer segment count).
pub fn path_tail_score(a: Option<&str>, b: Option<&str>) -> f64 {
    let segments_a = a.map(path_segments).unwrap_or_default();
    let segments_b = b.map(path_segments).unwrap_or_default();
    if segments_a.is_empty() || segments_b.is_empty() {
        return 0.0;
    }

    let max = segments_a.len().max(segments_b.len());
    let min = segments_a.len().min(segments_b.len());

    let mut matched = 0.0;
    let mut compared = 0.0;
    for (i, (x, y)) in segments_a.iter().rev().zip(segments_b.iter().rev()).enumerate() {
        let weight = (i + 1) as f64;
        compared += weight;
        if x.to_lowercase() == y.to_lowercase() {
            matched += weight;
        } else {
            break;
        }
    }

    if compared == 0.0 {
        return 0.0;
    }
    (matched / compared) * (min as f64 / max as f64)
}

// ============================================================================
// Helpers
// ============================================================================

/// Whitespace tokens of at least two chars.
fn tokenize(value: &str) -> FxHashSet<&str> {
    value.split_whitespace().filter(|t| t.chars().count() >= 2).collect()
}

/// Intersection over union; 0.0 when either set is empty.
fn jaccard<T: Eq + Hash>(a: &FxHashSet<T>, b: &FxHashSet<T>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

/// 1 - edit distance / longer length; 0.0 when either side is empty.
fn levenshtein_ratio(a: &str, b: &str) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    strsim::normalized_levenshtein(a, b)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocking::tests::row;
    use crate::models::Source;

    #[test]
    fn test_duration_buckets() {
        assert_eq!(duration_score(Some(180_000), Some(180_000)), 1.0);
        assert_eq!(duration_score(Some(180_000), Some(181_000)), 0.95);
        assert_eq!(duration_score(Some(180_000), Some(182_000)), 0.95);
        assert_eq!(duration_score(Some(180_000), Some(184_000)), 0.85);
        assert_eq!(duration_score(Some(180_000), Some(189_000)), 0.65);
        assert_eq!(duration_score(Some(180_000), Some(200_000)), 0.35);
        assert_eq!(duration_score(Some(180_000), Some(200_001)), 0.0);
        assert_eq!(duration_score(None, Some(200_000)), NOT_COMPARABLE);
    }

    #[test]
    fn test_bpm_buckets() {
        assert_eq!(bpm_score(Some(128.0), Some(128.2)), 1.0);
        assert_eq!(bpm_score(Some(128.0), Some(128.6)), 0.8);
        assert_eq!(bpm_score(Some(128.0), Some(129.0)), 0.6);
        assert_eq!(bpm_score(Some(128.0), Some(130.0)), 0.3);
        assert_eq!(bpm_score(Some(128.0), Some(140.0)), 0.0);
        assert_eq!(bpm_score(Some(128.0), None), NOT_COMPARABLE);
    }

    #[test]
    fn test_key_score() {
        assert_eq!(key_score(Some("9A"), Some("9a")), 1.0);
        assert_eq!(key_score(Some("9A"), Some("9B")), 0.3);
        assert_eq!(key_score(Some("9A"), Some("10A")), 0.0);
        assert_eq!(key_score(Some("Am"), Some("C")), 0.0);
        assert_eq!(key_score(None, Some("9A")), NOT_COMPARABLE);
    }

    #[test]
    fn test_title_score() {
        assert_eq!(title_score("song", "song"), 1.0);
        assert_eq!(title_score("", "song"), NOT_COMPARABLE);
        let close = title_score("hello world", "hello worlds");
        assert!(close > 0.9 && close < 1.0);
        assert!(title_score("abc", "xyz") < 0.1);
    }

    #[test]
    fn test_path_tail_score() {
        assert_eq!(path_tail_score(Some("C:/Music/A/Song.mp3"), Some("/home/u/Music/a/song.mp3")), 0.6);
        assert_eq!(path_tail_score(Some("/x/A/Song.mp3"), Some("/y/A/Song.mp3")), 0.5);
        assert_eq!(path_tail_score(Some("/x/Song.mp3"), Some("/x/Other.mp3")), 0.0);
        assert_eq!(path_tail_score(None, Some("/x/Song.mp3")), 0.0);
    }

    #[test]
    fn test_streaming_to_file_auto_link() {
        let streaming = row(Source::Streaming, "s1", "Song", "Artist", Some(180_000), None);
        let file = row(
            Source::Filesystem,
            "f1",
            "Song",
            "Artist",
            Some(181_000),
            Some("/music/Artist/Song.mp3"),
        );
        let result = score_pair(&streaming, &file, true);
        assert_eq!(result.title, 1.0);
        assert_eq!(result.duration, 0.95);
        assert!(result.score >= 0.92);
        assert!(result.meets_minimums());
        assert!(result.reasons.contains(&"bonus_title_artist_duration"));
    }

    #[test]
    fn test_path_exact_rescues_weak_title() {
        let a = row(
            Source::DjSoftware,
            "d1",
            "Midnight City",
            "M83",
            Some(100_000),
            Some("D:/Sets/2019/midnight.mp3"),
        );
        let b = row(
            Source::Filesystem,
            "f1",
            "Midnight City Reprise",
            "M83",
            Some(300_000),
            Some("d:\\Sets\\2019\\midnight.mp3"),
        );

        let hinted = score_pair(&a, &b, true);
        assert!(hinted.path_exact);
        assert!(hinted.title < 0.75);
        assert_eq!(hinted.duration, 0.0);
        assert!(hinted.reasons.contains(&"bonus_path_exact"));
        assert!(!hinted.reasons.contains(&"penalty_duration_mismatch"));
        assert!(hinted.meets_minimums());
        assert!(hinted.score >= 0.80);

        let unhinted = score_pair(&a, &b, false);
        assert!(!unhinted.meets_minimums());
        assert!(unhinted.score < 0.80);
    }

    #[test]
    fn test_path_bonus_needs_hint() {
        let a = row(Source::DjSoftware, "d1", "Song", "A", Some(1_000), Some("/m/Song.mp3"));
        let b = row(Source::Filesystem, "f1", "Song", "A", Some(1_000), Some("/m/Song.mp3"));
        let result = score_pair(&a, &b, false);
        assert!(!result.path_exact);
        assert_eq!(result.path_tail, 0.0);
    }

    #[test]
    fn test_missing_title_never_accepted_without_path() {
        let a = row(Source::Streaming, "s1", "", "Artist", Some(180_000), None);
        let b = row(Source::DjSoftware, "d1", "Song", "Artist", Some(180_000), None);
        let result = score_pair(&a, &b, false);
        assert_eq!(result.title, NOT_COMPARABLE);
        assert!(!result.meets_minimums());
    }

    #[test]
    fn test_artist_mismatch_penalty() {
        let a = row(Source::Streaming, "s1", "Song", "Alpha", Some(180_000), None);
        let b = row(Source::DjSoftware, "d1", "Song", "Zulu Quartet", Some(180_000), None);
        let result = score_pair(&a, &b, false);
        assert!(result.artist < 0.3);
        assert!(result.reasons.contains(&"penalty_artist_mismatch"));

        let unknown = row(Source::DjSoftware, "d2", "Song", "", Some(180_000), None);
        let result = score_pair(&a, &unknown, false);
        assert_eq!(result.artist, NOT_COMPARABLE);
        assert!(!result.reasons.contains(&"penalty_artist_mismatch"));
    }

    #[test]
    fn test_gate_duration_missing_branch() {
        let breakdown = ScoreBreakdown {
            score: 0.95,
            title: 0.7,
            artist: 0.6,
            duration: NOT_COMPARABLE,
            duration_missing: true,
            album: 0.5,
            bpm: 0.5,
            key: 0.5,
            feature: 0.5,
            dj_tag: 0.5,
            path_tail: 0.0,
            path_exact: false,
            reasons: Vec::new(),
        };
        assert!(breakdown.meets_minimums());
        let no_artist = ScoreBreakdown { artist: 0.5, ..breakdown.clone() };
        assert!(!no_artist.meets_minimums());
        let known_duration = ScoreBreakdown {
            duration_missing: false,
            duration: 0.85,
            ..breakdown
        };
        assert!(known_duration.meets_minimums());
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn duration_score_is_monotonic(base in 0i64..600_000, d1 in 0i64..60_000, d2 in 0i64..60_000) {
            let (near, far) = if d1 <= d2 { (d1, d2) } else { (d2, d1) };
            let near_score = duration_score(Some(base), Some(base + near));
            let far_score = duration_score(Some(base), Some(base + far));
            prop_assert!(near_score >= far_score);
        }

        #[test]
        fn half_title_without_path_is_rejected(
            artist in 0.0f64..=1.0,
            duration in prop::sample::select(vec![0.0, 0.35, 0.5, 0.65, 0.85, 0.95, 1.0]),
            missing in any::<bool>(),
            path_tail in 0.0f64..=1.0,
        ) {
            let breakdown = ScoreBreakdown {
                score: 1.0,
                title: NOT_COMPARABLE,
                artist,
                duration,
                duration_missing: missing,
                album: 1.0,
                bpm: 1.0,
                key: 1.0,
                feature: 1.0,
                dj_tag: 1.0,
                path_tail,
                path_exact: false,
                reasons: Vec::new(),
            };
            prop_assert!(!breakdown.meets_minimums());
        }
    }
}
