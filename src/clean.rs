//! Text normalizer for raw (title, artist) pairs.
//!
//! `clean` is pure: it pulls the musical key, BPM, featured artists and DJ
//! tags out of noisy titles and artist strings, and scores how much it
//! trusts the result. Every heuristic that fires leaves a tag in the log so
//! the batch cleaner can aggregate a histogram.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use unicode_normalization::UnicodeNormalization;

// ============================================================================
// Patterns
// ============================================================================

static MULTI_SPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

static DASH_VARIANTS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\u{2013}\u{2014}\u{2212}]").unwrap());

static FILE_EXTENSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\.(?:mp3|wav|flac|m4a|aiff|mov|mp4)$").unwrap());

static AUDIO_VISUALIZER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\([^)]*audio\s*visualizer[^)]*\)").unwrap());

/// "9A - 128 - Artist"
static ARTIST_KEY_BPM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<key>(?:1[0-2]|[1-9])[AB])\s*-\s*(?P<bpm>\d{2,3}(?:\.\d)?)\s*-\s*(?P<artist>.+)$")
        .unwrap()
});

/// "9A - Artist"
static ARTIST_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<key>(?:1[0-2]|[1-9])[AB])\s*-\s*(?P<artist>.+)$").unwrap());

/// "03. " track-number prefix
static NUMBER_DOT_PREFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*\d{1,3}\.\s+").unwrap());

/// "123456_" download-site id prefix
static SOURCE_ID_PREFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*\d{4,}_").unwrap());

static BRACKET_PERFORMER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^〔(?P<name>[^〕]+)〕").unwrap());

static BRACKET_FEAT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)〔\s*feat\.?\s+(?P<names>[^〕]+)〕").unwrap());

static ARTIST_TITLE_SEPARATOR: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s-\s").unwrap());

static ARTIST_TOKENS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)&|×|\bx\b|\b(?:feat|ft)\b").unwrap());

static BPM_EXPLICIT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?P<before>\d{2,3}(?:\.\d)?)\s*bpm\b|\bbpm\s*(?P<after>\d{2,3}(?:\.\d)?)\b").unwrap()
});

static BPM_BRACKET: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[(?P<bpm>\d{2,3})\]").unwrap());

static KEY_EXPLICIT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bkey\s*(?P<key>(?:1[0-2]|[1-9])[ab])\b").unwrap());

static CAMELOT_TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(?:1[0-2]|[1-9])[AB]\b").unwrap());

static FIRST_BRACKET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\((?P<paren>[^)]*)\)|\[(?P<square>[^\]]*)\]").unwrap());

static TRAILING_PAREN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\((?P<content>[^)]*)\)$").unwrap());

static TRAILING_SQUARE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[(?P<content>[^\]]*)\]$").unwrap());

/// Mix and DJ vocabulary that marks a bracket as release/edit information.
static MIX_VOCABULARY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:remix|edit|vip|flip|bootleg|version|mix|clean|dirty|intro|outro|transition|quick hit)\b")
        .unwrap()
});

static LEADING_FEAT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^(?:feat|ft)\b").unwrap());

static FEATURE_PAREN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\((?:feat\.?|ft\.?)\s+(?P<names>[^)]+)\)").unwrap());

static FEATURE_INLINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:feat\.?|ft\.?)\s+(?P<names>[^-]+)$").unwrap());

static FEATURE_SPLIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\s*(?:[,&＆×]|\bx\b)\s*").unwrap());

static DOUBLED_DASH: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*-\s*-+\s*").unwrap());

static DOUBLED_PIPE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\|\|+").unwrap());

const DJ_TAG_TOKENS: &[&str] = &["clean", "dirty", "intro", "outro", "transition", "quick hit"];

const VERSION_SUFFIXES: &[&str] = &[
    "original mix",
    "extended mix",
    "club mix",
    "radio edit",
    "original edit",
    "extended edit",
    "club edit",
];

const JUNK_SUFFIX_TOKENS: &[&str] = &["lyrics", "lyric video", "official video", "on screen", "audio"];

const COVER_MARKER: &str = "歌ってみた";

const BPM_RANGE: std::ops::RangeInclusive<f64> = 60.0..=220.0;

// ============================================================================
// Result
// ============================================================================

/// Output of [`clean`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CleanResult {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub musical_key: Option<String>,
    pub bpm: Option<f64>,
    pub features: Vec<String>,
    pub dj_tags: Vec<String>,
    /// Tags of the heuristics that fired, in order.
    pub log: Vec<&'static str>,
    pub confidence: f64,
}

/// Which confidence-relevant heuristics fired.
#[derive(Clone, Copy, Debug, Default)]
struct Signals {
    key_bpm_prefix: bool,
    bracket_performer: bool,
    artist_title_split: bool,
    explicit_token: bool,
    ambiguous_dash: bool,
    overwrite_refused: bool,
}

impl Signals {
    fn confidence(self) -> f64 {
        let mut confidence: f64 = 0.50;
        if self.key_bpm_prefix {
            confidence += 0.40;
        }
        if self.bracket_performer {
            confidence += 0.30;
        }
        if self.artist_title_split {
            confidence += 0.25;
        }
        if self.explicit_token {
            confidence += 0.15;
        }
        if self.ambiguous_dash {
            confidence -= 0.20;
        }
        if self.overwrite_refused {
            confidence -= 0.30;
        }
        confidence.clamp(0.0, 1.0)
    }
}

// ============================================================================
// Entry point
// ============================================================================

/// Clean a raw (title, artist) pair.
///
/// Deterministic: identical inputs always produce identical output.
pub fn clean(title: Option<&str>, artist: Option<&str>) -> CleanResult {
    let mut pass = Pass::default();
    pass.title = canonicalize(title, &mut pass.log);
    pass.artist = canonicalize(artist, &mut pass.log);

    pass.strip_artist_prefixes();
    pass.with_title(Pass::strip_title_prefixes);
    pass.with_title(Pass::split_artist_title);
    pass.with_title(Pass::strip_junk_suffix);
    pass.with_title(Pass::extract_explicit_tokens);
    pass.with_title(Pass::extract_mix_tags);
    pass.with_title(Pass::extract_features);
    pass.with_title(|_, title| cleanup_separators(&title));

    pass.finish()
}

#[derive(Default)]
struct Pass {
    title: Option<String>,
    artist: Option<String>,
    musical_key: Option<String>,
    bpm: Option<f64>,
    features: Vec<String>,
    dj_tags: Vec<String>,
    log: Vec<&'static str>,
    signals: Signals,
}

impl Pass {
    /// Run a title step only while the title is non-blank.
    fn with_title(&mut self, step: impl FnOnce(&mut Self, String) -> String) {
        match self.title.take() {
            Some(title) if !title.trim().is_empty() => {
                let title = step(self, title);
                self.title = Some(title);
            }
            other => self.title = other,
        }
    }

    fn artist_is_blank(&self) -> bool {
        self.artist.as_deref().map_or(true, |a| a.trim().is_empty())
    }

    fn strip_artist_prefixes(&mut self) {
        let Some(mut artist) = self.artist.take() else {
            return;
        };

        if let Some(m) = NUMBER_DOT_PREFIX.find(&artist) {
            artist = artist[m.end()..].trim_start().to_string();
            self.log.push("artist_number_prefix");
        }

        let key_bpm = ARTIST_KEY_BPM.captures(&artist).and_then(|caps| {
            parse_bpm(&caps["bpm"]).map(|bpm| (caps["key"].to_string(), bpm, caps["artist"].trim().to_string()))
        });
        if let Some((key, bpm, rest)) = key_bpm {
            self.musical_key = Some(key);
            self.bpm = Some(bpm);
            artist = rest;
            self.signals.key_bpm_prefix = true;
            self.signals.explicit_token = true;
            self.log.push("artist_key_bpm");
        } else if let Some((key, rest)) = ARTIST_KEY
            .captures(&artist)
            .map(|caps| (caps["key"].to_string(), caps["artist"].trim().to_string()))
        {
            self.musical_key = Some(key);
            artist = rest;
            self.signals.key_bpm_prefix = true;
            self.signals.explicit_token = true;
            self.log.push("artist_key");
        }

        self.artist = Some(artist);
    }

    fn strip_title_prefixes(&mut self, mut title: String) -> String {
        let stripped = FILE_EXTENSION.replace(&title, "").trim().to_string();
        if stripped != title {
            self.log.push("title_strip_extension");
            title = stripped;
        }

        let stripped = AUDIO_VISUALIZER.replace_all(&title, "").trim().to_string();
        if stripped != title {
            self.log.push("title_strip_visualizer");
            title = stripped;
        }

        loop {
            let bracket = BRACKET_PERFORMER.captures(&title).map(|caps| {
                let end = caps.get(0).map_or(0, |m| m.end());
                let feat = BRACKET_FEAT.captures(&title[..end]).map(|f| f["names"].to_string());
                (end, caps["name"].trim().to_string(), feat)
            });
            let Some((end, performer, feat_names)) = bracket else {
                break;
            };
            if performer == COVER_MARKER {
                self.dj_tags.push("cover".to_string());
                self.log.push("jp_cover_tag");
            } else if performer.to_lowercase().starts_with("feat") {
                if let Some(names) = feat_names {
                    self.push_features(&names, "jp_feat");
                }
            } else if self.artist_is_blank() || self.artist.as_deref().is_some_and(|a| equals_loose(a, &performer)) {
                self.artist = Some(performer);
                self.signals.bracket_performer = true;
                self.log.push("jp_performer_prefix");
            }
            title = title[end..].trim_start().to_string();
        }

        if let Some(m) = NUMBER_DOT_PREFIX.find(&title) {
            title = title[m.end()..].trim_start().to_string();
            self.log.push("source_id_dot_prefix");
        }

        if let Some(m) = SOURCE_ID_PREFIX.find(&title) {
            title = title[m.end()..].replace('_', " ").trim_start().to_string();
            self.log.push("source_id_underscore_prefix");
        }

        title
    }

    fn split_artist_title(&mut self, title: String) -> String {
        let separators = ARTIST_TITLE_SEPARATOR.find_iter(&title).count();
        if separators > 1 {
            self.signals.ambiguous_dash = true;
            self.log.push("ambiguous_dash");
            return title;
        }
        if separators == 0 {
            return title;
        }

        let Some(sep) = ARTIST_TITLE_SEPARATOR.find(&title) else {
            return title;
        };
        let left = title[..sep.start()].trim().to_string();
        let right = title[sep.end()..].trim().to_string();

        if !self.artist_is_blank() && !ARTIST_TOKENS.is_match(&left) {
            return title;
        }

        match self.artist.as_deref() {
            Some(known) if !known.trim().is_empty() && !equals_loose(known, &left) => {
                self.signals.overwrite_refused = true;
                self.log.push("artist_overwrite_refused");
                title
            }
            _ => {
                self.artist = Some(left);
                self.signals.artist_title_split = true;
                self.log.push("artist_title_split");
                right
            }
        }
    }

    fn strip_junk_suffix(&mut self, title: String) -> String {
        let Some(idx) = title.rfind(" - ") else {
            return title;
        };

        let last = title[idx + 3..].trim().to_string();
        let lower = last.to_lowercase();
        if JUNK_SUFFIX_TOKENS.iter().any(|token| lower.contains(token)) {
            let head = title[..idx].trim().to_string();
            self.dj_tags.push(last);
            self.log.push("title_junk_suffix");
            return head;
        }
        title
    }

    fn extract_explicit_tokens(&mut self, mut title: String) -> String {
        if let Some((cleaned, key)) = bracket_key(&title) {
            title = cleaned;
            self.musical_key.get_or_insert(key);
            self.signals.explicit_token = true;
            self.log.push("title_key_bracket");
        }

        let explicit_bpm = BPM_EXPLICIT.captures(&title).and_then(|caps| {
            caps.name("before")
                .or_else(|| caps.name("after"))
                .and_then(|m| parse_bpm(m.as_str()))
        });
        if let Some(bpm) = explicit_bpm {
            self.bpm.get_or_insert(bpm);
            title = BPM_EXPLICIT.replace_all(&title, "").trim().to_string();
            self.signals.explicit_token = true;
            self.log.push("title_bpm_explicit");
        }

        let bracket_bpm = BPM_BRACKET.captures(&title).and_then(|caps| parse_bpm(&caps["bpm"]));
        if let Some(bpm) = bracket_bpm {
            self.bpm.get_or_insert(bpm);
            title = BPM_BRACKET.replace_all(&title, "").trim().to_string();
            self.signals.explicit_token = true;
            self.log.push("title_bpm_bracket");
        }

        let explicit_key = KEY_EXPLICIT.captures(&title).map(|caps| caps["key"].to_uppercase());
        if let Some(key) = explicit_key {
            self.musical_key.get_or_insert(key);
            title = KEY_EXPLICIT.replace_all(&title, "").trim().to_string();
            self.signals.explicit_token = true;
            self.log.push("title_key_explicit");
        }

        title
    }

    fn extract_mix_tags(&mut self, mut title: String) -> String {
        for (pattern, tag) in [(&*TRAILING_PAREN, "mix_suffix_paren"), (&*TRAILING_SQUARE, "mix_suffix_bracket")] {
            let found = pattern.captures(&title).and_then(|caps| {
                let content = caps["content"].trim();
                let start = caps.get(0).map_or(title.len(), |m| m.start());
                (MIX_VOCABULARY.is_match(content) && !LEADING_FEAT.is_match(content))
                    .then(|| (start, content.to_string()))
            });
            if let Some((start, content)) = found {
                self.dj_tags.push(content);
                self.log.push(tag);
                title = title[..start].trim().to_string();
            }
        }

        if let Some((token, rest)) = DJ_TAG_TOKENS
            .iter()
            .find_map(|token| strip_word_suffix(&title, token).map(|rest| (*token, rest.to_string())))
        {
            self.dj_tags.push(token.to_string());
            self.log.push("dj_tag_suffix");
            title = rest;
        }

        if let Some((suffix, rest)) = VERSION_SUFFIXES
            .iter()
            .find_map(|suffix| strip_word_suffix(&title, suffix).map(|rest| (*suffix, rest.to_string())))
        {
            self.dj_tags.push(suffix.to_string());
            self.log.push("mix_suffix");
            title = rest;
        }

        title
    }

    fn extract_features(&mut self, mut title: String) -> String {
        loop {
            let found = FEATURE_PAREN
                .captures(&title)
                .and_then(|caps| caps.get(0).map(|m| (m.range(), caps["names"].to_string())));
            let Some((range, names)) = found else {
                break;
            };
            self.push_features(&names, "feature_paren");
            title.replace_range(range, "");
            title = title.trim().to_string();
        }

        let inline = FEATURE_INLINE
            .captures(&title)
            .and_then(|caps| caps.get(0).map(|m| (m.start(), caps["names"].to_string())));
        if let Some((start, names)) = inline {
            self.push_features(&names, "feature_inline");
            title = title[..start].trim().to_string();
        }

        title
    }

    fn push_features(&mut self, names: &str, tag: &'static str) {
        self.features.extend(
            FEATURE_SPLIT
                .split(names)
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string),
        );
        self.log.push(tag);
    }

    fn finish(self) -> CleanResult {
        CleanResult {
            title: self.title.filter(|t| !t.is_empty()),
            artist: self.artist.filter(|a| !a.trim().is_empty()),
            musical_key: self.musical_key,
            bpm: self.bpm,
            features: dedupe_case_insensitive(self.features),
            dj_tags: dedupe_case_insensitive(self.dj_tags),
            log: self.log,
            confidence: self.signals.confidence(),
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// NFKC, unify dash variants, collapse whitespace. Blank input is `None`.
fn canonicalize(value: Option<&str>, log: &mut Vec<&'static str>) -> Option<String> {
    let value = value.filter(|v| !v.trim().is_empty())?;
    let composed: String = value.nfkc().collect();
    let dashed = DASH_VARIANTS.replace_all(&composed, "-");
    let collapsed = MULTI_SPACE.replace_all(dashed.trim(), " ").into_owned();
    if collapsed != value {
        log.push("normalized_text");
    }
    Some(collapsed)
}

fn parse_bpm(value: &str) -> Option<f64> {
    value.parse::<f64>().ok().filter(|bpm| BPM_RANGE.contains(bpm))
}

fn equals_loose(a: &str, b: &str) -> bool {
    let a = MULTI_SPACE.replace_all(a.trim(), " ").to_lowercase();
    let b = MULTI_SPACE.replace_all(b.trim(), " ").to_lowercase();
    a == b
}

/// Pull a Camelot key out of the first bracket group, but only when that
/// bracket also talks about BPM or mixing. The key token is removed and the
/// rest of the bracket is left for the later tag steps.
fn bracket_key(title: &str) -> Option<(String, String)> {
    let caps = FIRST_BRACKET.captures(title)?;
    let whole = caps.get(0)?;
    let (content, open, close) = match (caps.name("paren"), caps.name("square")) {
        (Some(m), _) => (m.as_str(), '(', ')'),
        (None, Some(m)) => (m.as_str(), '[', ']'),
        (None, None) => return None,
    };

    let key = CAMELOT_TOKEN.find(content)?;
    let has_context = content.to_lowercase().contains("bpm") || MIX_VOCABULARY.is_match(content);
    if !has_context {
        return None;
    }

    let remainder = format!("{}{}", &content[..key.start()], &content[key.end()..]);
    let remainder = MULTI_SPACE.replace_all(remainder.trim(), " ");
    let cleaned = format!(
        "{}{}{}{}{}",
        &title[..whole.start()],
        open,
        remainder,
        close,
        &title[whole.end()..]
    );
    Some((cleaned.trim().to_string(), key.as_str().to_string()))
}

/// Strip `" <suffix>"` from the end of `title`, ASCII case-insensitively.
fn strip_word_suffix<'a>(title: &'a str, suffix: &str) -> Option<&'a str> {
    let needed = suffix.len() + 1;
    if title.len() <= needed {
        return None;
    }
    let cut = title.len() - needed;
    if !title.is_char_boundary(cut) {
        return None;
    }
    let (rest, tail) = title.split_at(cut);
    (tail.starts_with(' ') && tail[1..].eq_ignore_ascii_case(suffix)).then(|| rest.trim())
}

fn cleanup_separators(value: &str) -> String {
    let cleaned = value.replace("()", "").replace("[]", "").replace("〔〕", "");
    let cleaned = DOUBLED_DASH.replace_all(&cleaned, " - ");
    let cleaned = DOUBLED_PIPE.replace_all(&cleaned, "|");
    let cleaned = MULTI_SPACE.replace_all(&cleaned, " ");
    cleaned
        .trim_matches(|c: char| matches!(c, ' ' | '-' | '|' | '_' | '.'))
        .trim()
        .to_string()
}

fn dedupe_case_insensitive(values: Vec<String>) -> Vec<String> {
    let mut seen = Vec::with_capacity(values.len());
    let mut out = Vec::with_capacity(values.len());
    for value in values {
        let folded = value.to_lowercase();
        if !seen.contains(&folded) {
            seen.push(folded);
            out.push(value);
        }
    }
    out
}
