//! Metadata cleanup over the stored libraries.
//!
//! Runs [`clean`] over every row of the three source tables and the
//! canonical table. Rows below the confidence threshold are skipped.
//! Cleaned title and artist replace the stored values; key, BPM, features
//! and DJ tags are only filled when still empty. One transaction per table.

use crate::cancel::CancelToken;
use crate::clean::{clean, CleanResult};
use crate::db::{self, CleanRow, CleanTable};
use crate::error::Result;
use crate::models::{CleanupReport, StageReport};
use crate::progress;
use rusqlite::Connection;
use std::time::Instant;
use tracing::{debug, info, warn};

pub const DEFAULT_MIN_CONFIDENCE: f64 = 0.7;

#[derive(Clone, Copy, Debug)]
pub struct CleanupOptions {
    pub min_confidence: f64,
    /// Count and log what would change without writing.
    pub dry_run: bool,
}

impl Default for CleanupOptions {
    fn default() -> Self {
        Self {
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            dry_run: false,
        }
    }
}

/// The row as it should be stored after cleaning, or `None` when nothing
/// in it would change.
fn cleaned_row(row: &CleanRow, result: &CleanResult) -> Option<CleanRow> {
    let mut next = row.clone();
    if result.title.is_some() {
        next.title = result.title.clone();
    }
    if result.artist.is_some() {
        next.artist = result.artist.clone();
    }
    if next.musical_key.is_none() {
        next.musical_key = result.musical_key.clone();
    }
    if next.bpm.is_none() {
        next.bpm = result.bpm;
    }
    if next.features.is_empty() {
        next.features = result.features.clone();
    }
    if next.dj_tags.is_empty() {
        next.dj_tags = result.dj_tags.clone();
    }
    (next != *row).then_some(next)
}

/// Raw imported text is the input; the stored value covers rows that were
/// imported without one.
fn input<'r>(raw: &'r Option<String>, stored: &'r Option<String>) -> Option<&'r str> {
    raw.as_deref()
        .filter(|v| !v.trim().is_empty())
        .or_else(|| stored.as_deref().filter(|v| !v.trim().is_empty()))
}

fn clean_table(
    conn: &mut Connection,
    table: CleanTable,
    options: &CleanupOptions,
    cancel: &CancelToken,
) -> Result<CleanupReport> {
    cancel.check("cleanup")?;
    let mut report = CleanupReport::default();
    let tx = conn.transaction()?;
    let rows = db::load_clean_rows(&tx, table)?;
    let label = format!("Cleaning {}", table.name());
    let pb = progress::create_progress_bar(rows.len() as u64, &label);

    for entry in rows {
        cancel.check("cleanup")?;
        progress::tick(&pb, &label, 10_000);

        let row = match entry {
            Ok(row) => row,
            Err(e) if e.is_row_local() => {
                warn!("Skipping row: {}", e);
                report.malformed += 1;
                continue;
            }
            Err(e) => return Err(e),
        };

        let result = clean(
            input(&row.title_raw, &row.title),
            input(&row.artist_raw, &row.artist),
        );
        if result.confidence < options.min_confidence {
            report.skipped += 1;
            continue;
        }
        let Some(next) = cleaned_row(&row, &result) else {
            report.unchanged += 1;
            continue;
        };

        debug!(
            "{} {:?}: {:?} -> {:?}, {:?} -> {:?} (confidence {:.2})",
            table.name(),
            row.key,
            row.title,
            next.title,
            row.artist,
            next.artist,
            result.confidence
        );
        report.record_tags(result.log.iter().copied());
        report.updated += 1;
        if !options.dry_run {
            db::update_clean_row(&tx, table, &next, result.confidence, &result.log)?;
        }
    }

    pb.finish_and_clear();
    if options.dry_run {
        tx.rollback()?;
    } else {
        tx.commit()?;
    }
    Ok(report)
}

/// Clean every table. Tables are independent: each commits on its own, so
/// a failure leaves earlier tables cleaned and the failing one untouched.
pub fn run_cleanup(conn: &mut Connection, options: &CleanupOptions, cancel: &CancelToken) -> Result<CleanupReport> {
    let start = Instant::now();
    let mut report = CleanupReport {
        dry_run: options.dry_run,
        ..Default::default()
    };

    for table in CleanTable::ALL {
        let table_report = clean_table(conn, table, options, cancel)?;
        info!(
            "{}: updated {}, unchanged {}, skipped {}, malformed {}",
            table.name(),
            table_report.updated,
            table_report.unchanged,
            table_report.skipped,
            table_report.malformed
        );
        report.absorb(table_report);
    }

    report.elapsed_seconds = start.elapsed().as_secs_f64();
    report.log_phase("cleanup");
    Ok(report)
}
