//! Show the review band of a matching run with per-signal breakdowns.
//!
//! Read-only: the store is opened but nothing is linked or written.
//!
//! Usage: review-candidates <store.db> [--min-auto-score 0.92] [--limit N]

use anyhow::{Context, Result};
use discoteka::config::parse_threshold;
use discoteka::matcher::{find_matches, LibraryRows, DEFAULT_MIN_AUTO_SCORE};
use discoteka::{db, progress, CancelToken};
use std::path::PathBuf;
use std::time::Instant;

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: review-candidates <store.db> [--min-auto-score 0.92] [--limit N]");
        std::process::exit(1);
    }

    let db_path = PathBuf::from(&args[1]);
    let min_auto_score = match flag(&args, "--min-auto-score") {
        Some(raw) => parse_threshold(raw)?,
        None => DEFAULT_MIN_AUTO_SCORE,
    };
    let limit: usize = flag(&args, "--limit").and_then(|s| s.parse().ok()).unwrap_or(50);

    tracing_subscriber::fmt().with_target(false).init();
    progress::set_log_only(true);

    let start = Instant::now();
    if !db_path.is_file() {
        anyhow::bail!("Store not found: {}", db_path.display());
    }
    let conn = db::open(&db_path).context("Failed to open store")?;
    let rows = LibraryRows::load(&conn)?;
    println!(
        "Loaded {} streaming, {} DJ, {} file rows ({} malformed)",
        rows.streaming.len(),
        rows.dj.len(),
        rows.file.len(),
        rows.malformed
    );

    let outcome = find_matches(&rows, min_auto_score, &CancelToken::new())?;

    println!("\n{:=<60}", "");
    println!("REVIEW BAND (threshold {:.2})", min_auto_score);
    println!("{:=<60}", "");
    println!(
        "Pairs considered: {}, scored: {}, auto-linked: {}, review: {}",
        outcome.pairs_considered,
        outcome.pairs_scored,
        outcome.accepted.len(),
        outcome.review.len()
    );

    for candidate in outcome.review.iter().take(limit) {
        let b = &candidate.breakdown;
        println!(
            "\n{:.3}  {} <-> {}",
            b.score,
            candidate.left.record.key(),
            candidate.right.record.key()
        );
        println!(
            "  \"{}\" / \"{}\"",
            candidate.left.record.display_title().unwrap_or("?"),
            candidate.left.record.display_artist().unwrap_or("?")
        );
        println!(
            "  \"{}\" / \"{}\"",
            candidate.right.record.display_title().unwrap_or("?"),
            candidate.right.record.display_artist().unwrap_or("?")
        );
        println!(
            "  title {:.2} artist {:.2} duration {:.2} album {:.2} bpm {:.2} key {:.2} path {:.2}",
            b.title, b.artist, b.duration, b.album, b.bpm, b.key, b.path_tail
        );
        if !b.reasons.is_empty() {
            println!("  reasons: {}", b.reasons.join(", "));
        }
    }

    println!("\nDone in {}", progress::format_duration(start.elapsed()));
    Ok(())
}

fn flag<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}
