//! Progress reporting for the batch stages.
//!
//! Stages draw `indicatif` bars on a terminal. In log-only mode the bars
//! are hidden and progress goes through `tracing` at fixed intervals so the
//! output stays tail-friendly.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Set once from the command line before any stage runs.
static LOG_ONLY: AtomicBool = AtomicBool::new(false);

pub fn set_log_only(value: bool) {
    LOG_ONLY.store(value, Ordering::Relaxed);
}

pub fn is_log_only() -> bool {
    LOG_ONLY.load(Ordering::Relaxed)
}

/// `12.3s` below a minute, `4.1m` above.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs_f64();
    if secs < 60.0 {
        format!("{:.1}s", secs)
    } else {
        format!("{:.1}m", secs / 60.0)
    }
}

/// A bar with the shared style, hidden in log-only mode.
pub fn create_progress_bar(len: u64, msg: &str) -> ProgressBar {
    let pb = ProgressBar::new(len);
    if is_log_only() {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    } else {
        let style = ProgressStyle::default_bar()
            .template("{msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec}, ETA: {eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");
        pb.set_style(style);
    }
    pb.set_message(msg.to_string());
    pb
}

/// Emit a progress line every `interval` items, and at the end.
/// Only active in log-only mode.
pub fn log_progress(phase: &str, current: u64, total: u64, interval: u64) {
    if !is_log_only() || total == 0 || interval == 0 {
        return;
    }
    if current % interval == 0 || current == total {
        let pct = 100.0 * current as f64 / total as f64;
        tracing::info!("[{}] {}/{} ({:.1}%)", phase, current, total, pct);
    }
}

/// Advance `pb` by one and forward to [`log_progress`].
pub fn tick(pb: &ProgressBar, phase: &str, interval: u64) {
    pb.inc(1);
    log_progress(phase, pb.position(), pb.length().unwrap_or(0), interval);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(12_340)), "12.3s");
        assert_eq!(format_duration(Duration::from_secs(246)), "4.1m");
    }

    #[test]
    fn test_tick_advances_hidden_bar() {
        let pb = ProgressBar::hidden();
        pb.set_length(3);
        tick(&pb, "test", 1);
        tick(&pb, "test", 1);
        assert_eq!(pb.position(), 2);
    }
}
