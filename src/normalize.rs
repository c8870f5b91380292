//! Match-key normalization shared by the scorer, the blocking index and
//! the canonical merge.
//!
//! These functions never touch stored values; they only derive comparison
//! keys. Display cleanup lives in `clean`.

use once_cell::sync::Lazy;
use regex::Regex;
use rustc_hash::FxHashSet;
use unicode_normalization::UnicodeNormalization;

// ============================================================================
// REGEX PATTERNS
// ============================================================================

/// "feat.", "ft.", "featuring" all compare as "feat".
static FEAT_VARIANTS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\b(?:featuring|feat|ft)\b\.?").unwrap());

/// Any (...), [...] or {...} group.
static BRACKET_GROUP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\((?P<a>[^)]*)\)|\[(?P<b>[^\]]*)\]|\{(?P<c>[^}]*)\}").unwrap());

/// Multi-artist separator for artist token sets.
/// Matches: &, /, ,, ;, +, ×, x, vs, and, with, feat, ft
static ARTIST_SEPARATOR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\s*(?:[&/,;+×]|\b(?:x|vs\.?|and|with|feat\.?|ft\.?)(?:\s|$))\s*").unwrap()
});

static CAMELOT_KEY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\b(?P<key>(?:1[0-2]|[1-9])[ab])\b").unwrap());

static MULTI_SPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

static MULTI_SLASH: Lazy<Regex> = Lazy::new(|| Regex::new(r"/{2,}").unwrap());

/// Bracket groups containing one of these are DJ-pool utility noise.
const DJ_UTILITY_TOKENS: &[&str] = &["clean", "dirty", "intro", "outro", "lyrics", "on screen", "mastering"];

const VERSION_TOKENS: &[&str] = &[
    "original mix",
    "extended mix",
    "radio edit",
    "club mix",
    "original edit",
    "extended edit",
    "club edit",
];

/// DJ tags that describe a different recording rather than a utility edit.
const DJ_DESCRIPTOR_TOKENS: &[&str] = &["remix", "edit", "vip", "flip", "bootleg"];

/// Length of the truncated-title blocking key, in chars.
const TITLE_KEY_CHARS: usize = 12;

/// Number of longest title tokens in the token blocking key.
const TOKEN_KEY_TOKENS: usize = 3;

/// Number of trailing path segments in the path-tail blocking key.
const PATH_TAIL_SEGMENTS: usize = 3;

// ============================================================================
// TEXT
// ============================================================================

/// Normalize a title (or album) for comparison.
///
/// NFKC, lowercase, unify "feat" spellings, drop DJ utility brackets and
/// version phrases, then keep only alphanumerics separated by single spaces.
/// e.g. "Song (Clean) [Extended Mix] feat. X" → "song feat x"
pub fn normalize_title(title: &str) -> String {
    let lowered: String = title.nfkc().collect::<String>().to_lowercase();
    let unified = FEAT_VARIANTS.replace_all(lowered.trim(), "feat");
    let unbracketed = BRACKET_GROUP.replace_all(&unified, |caps: &regex::Captures| {
        let content = caps
            .name("a")
            .or_else(|| caps.name("b"))
            .or_else(|| caps.name("c"))
            .map_or("", |m| m.as_str());
        if DJ_UTILITY_TOKENS.iter().any(|token| content.contains(token)) {
            String::new()
        } else {
            caps[0].to_string()
        }
    });

    let mut result = unbracketed.into_owned();
    for token in VERSION_TOKENS {
        result = result.replace(token, " ");
    }

    let mut out = String::with_capacity(result.len());
    let mut last_was_space = true;
    for c in result.chars() {
        if c.is_alphanumeric() {
            out.push(c);
            last_was_space = false;
        } else if !last_was_space {
            out.push(' ');
            last_was_space = true;
        }
    }
    out.trim_end().to_string()
}

/// Split an artist credit into normalized artist tokens, primary first.
/// e.g. "DJ Foo & The Bar x Baz" → ["foo", "bar", "baz"]
pub fn normalize_artist_tokens(artist: &str) -> Vec<String> {
    let lowered: String = artist.nfkc().collect::<String>().to_lowercase();
    let collapsed = MULTI_SPACE.replace_all(lowered.trim(), " ");
    ARTIST_SEPARATOR
        .split(&collapsed)
        .map(str::trim)
        .map(|part| part.strip_prefix("dj ").unwrap_or(part))
        .map(|part| part.strip_prefix("the ").unwrap_or(part))
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

/// NFKC, lowercase, collapsed whitespace. Used for feature names.
pub fn normalize_name(value: &str) -> String {
    let lowered: String = value.nfkc().collect::<String>().to_lowercase();
    MULTI_SPACE.replace_all(lowered.trim(), " ").into_owned()
}

/// Case- and whitespace-insensitive key used by the derived index.
/// e.g. "  The   Band " → "the band"
pub fn fold_key(value: &str) -> String {
    MULTI_SPACE.replace_all(value.trim(), " ").to_lowercase()
}

/// Normalized feature-name set.
pub fn feature_set(features: &[String]) -> FxHashSet<String> {
    features
        .iter()
        .map(|f| normalize_name(f))
        .filter(|f| !f.is_empty())
        .collect()
}

/// DJ tags that name a distinct recording (remix, VIP, ...), lowercased.
/// Utility tags such as "clean" or "intro" are ignored for matching.
pub fn descriptor_tag_set(tags: &[String]) -> FxHashSet<String> {
    tags.iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| DJ_DESCRIPTOR_TOKENS.iter().any(|token| t.contains(token)))
        .collect()
}

/// Upper-cased Camelot code when one is present, otherwise the trimmed value.
pub fn normalize_musical_key(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(
        CAMELOT_KEY
            .captures(trimmed)
            .map(|caps| caps["key"].to_uppercase())
            .unwrap_or_else(|| trimmed.to_string()),
    )
}

// ============================================================================
// BLOCKING KEYS
// ============================================================================

/// First 12 chars of a normalized title.
pub fn title_key(normalized_title: &str) -> String {
    normalized_title.chars().take(TITLE_KEY_CHARS).collect()
}

/// The three longest tokens of a normalized title, longest first, joined
/// with `|`. Ties keep their original order.
pub fn token_key(normalized_title: &str) -> String {
    let mut tokens: Vec<&str> = normalized_title.split_whitespace().collect();
    tokens.sort_by(|a, b| b.chars().count().cmp(&a.chars().count()));
    tokens.truncate(TOKEN_KEY_TOKENS);
    tokens.join("|")
}

// ============================================================================
// PATHS
// ============================================================================

/// Normalize a file location for comparison.
///
/// Decodes `file://` URIs, converts backslashes, collapses repeated
/// slashes, trims a trailing slash and upper-cases a Windows drive letter.
/// e.g. "file://localhost/c:/Music/A%20B.mp3" → "C:/Music/A B.mp3"
pub fn normalize_path(path: &str) -> Option<String> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return None;
    }

    let mut result = match file_uri_path(trimmed) {
        Some(decoded) => decoded,
        None => trimmed.to_string(),
    };

    result = result.replace('\\', "/");
    result = MULTI_SLASH.replace_all(&result, "/").into_owned();
    if result.len() > 1 && result.ends_with('/') {
        result = result.trim_end_matches('/').to_string();
    }

    // "/C:/..." from a URI becomes "C:/..."
    let bytes = result.as_bytes();
    if bytes.len() >= 3 && bytes[0] == b'/' && bytes[1].is_ascii_alphabetic() && bytes[2] == b':' {
        result.remove(0);
    }

    let bytes = result.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        let drive = result[..1].to_ascii_uppercase();
        result.replace_range(..1, &drive);
    }

    Some(result)
}

/// Local path of a `file://` URI, percent-decoded. `None` for other inputs.
fn file_uri_path(value: &str) -> Option<String> {
    let lower = value.get(..7)?.to_ascii_lowercase();
    if lower != "file://" {
        return None;
    }
    let rest = &value[7..];
    let rest = rest.strip_prefix("localhost").unwrap_or(rest);
    let decoded = urlencoding::decode(rest).map(|s| s.into_owned()).unwrap_or_else(|_| rest.to_string());
    Some(decoded)
}

/// Path segments of a normalized path, without a leading Windows drive root.
pub fn path_segments(normalized_path: &str) -> Vec<&str> {
    let mut segments: Vec<&str> = normalized_path
        .split('/')
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .collect();

    if let Some(first) = segments.first() {
        let bytes = first.as_bytes();
        if bytes.len() == 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
            segments.remove(0);
        }
    }
    segments
}

/// Last three path segments, lowercased, joined with `/`.
pub fn path_tail_key(normalized_path: &str) -> Option<String> {
    let segments = path_segments(normalized_path);
    if segments.is_empty() {
        return None;
    }
    let take = segments.len().min(PATH_TAIL_SEGMENTS);
    Some(segments[segments.len() - take..].join("/").to_lowercase())
}

/// Case-insensitive identity of a normalized path.
pub fn path_identity(normalized_path: &str) -> String {
    normalized_path.to_lowercase()
}

// ============================================================================
// TESTS
// ============================================================================
