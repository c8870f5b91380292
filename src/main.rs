use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use discoteka::config::{self, parse_threshold, PipelineOptions};
use discoteka::models::StageReport;
use discoteka::{
    clean, db, import, progress, rebuild_index, run_cleanup, run_match, safety, CancelToken, CleanupOptions,
    MatchOptions, Source,
};
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::time::Instant;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Tags printed after a cleanup run.
const TOP_TAGS: usize = 20;

#[derive(Parser)]
#[command(name = "discoteka")]
#[command(about = "Reconcile streaming, DJ-software and filesystem music libraries")]
struct Args {
    /// SQLite store (defaults to the local data directory)
    #[arg(long, env = "DISCOTEKA_DB", global = true)]
    db: Option<PathBuf>,

    /// Hide progress bars and log progress lines instead
    #[arg(long, global = true)]
    log_only: bool,

    /// Worker threads for matching (0 = one per core)
    #[arg(long, default_value = "0", global = true)]
    workers: usize,

    /// Write the stage report as JSON to this file
    #[arg(long, global = true)]
    report: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create or upgrade the store schema
    Init,
    /// Upsert JSON-Lines records into one source table
    Import {
        /// streaming, dj or file
        source: Source,
        file: PathBuf,
    },
    /// Clean titles and artists in place
    Clean {
        /// Minimum confidence, as a fraction or a percentage
        #[arg(long, default_value = "0.7", value_parser = threshold)]
        confidence: f64,
        #[arg(long)]
        dry_run: bool,
    },
    /// Link records across sources into canonical tracks
    Match {
        /// Minimum score for automatic links, as a fraction or a percentage
        #[arg(long, default_value = "0.92", value_parser = threshold)]
        min_auto_score: f64,
        #[arg(long)]
        dry_run: bool,
    },
    /// Rebuild the artist/album index
    Index,
    /// Clean, match and index in order
    Run {
        #[arg(long, default_value = "0.7", value_parser = threshold)]
        confidence: f64,
        #[arg(long, default_value = "0.92", value_parser = threshold)]
        min_auto_score: f64,
    },
    /// Print the cleaning result for one title as JSON
    Text {
        title: String,
        #[arg(long)]
        artist: Option<String>,
    },
}

fn threshold(raw: &str) -> std::result::Result<f64, String> {
    parse_threshold(raw).map_err(|e| e.to_string())
}

fn resolve_db_path(args: &Args) -> Result<PathBuf> {
    match &args.db {
        Some(path) => Ok(path.clone()),
        None => config::default_db_path().context("Could not determine the local data directory; pass --db"),
    }
}

fn save_report(report: &impl StageReport, path: Option<&PathBuf>) -> Result<()> {
    if let Some(path) = path {
        report
            .write_to_file(path)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(EnvFilter::from_default_env().add_directive("discoteka=info".parse::<Directive>()?))
        .init();

    progress::set_log_only(args.log_only);

    if args.workers > 0 {
        rayon::ThreadPoolBuilder::new()
            .num_threads(args.workers)
            .build_global()
            .context("Failed to set thread pool size")?;
    }

    if let Command::Text { title, artist } = &args.command {
        let result = clean(Some(title.as_str()), artist.as_deref());
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    let start = Instant::now();
    let db_path = resolve_db_path(&args)?;
    let inputs: Vec<&std::path::Path> = match &args.command {
        Command::Import { file, .. } => vec![file.as_path()],
        _ => Vec::new(),
    };
    safety::validate_db_path(&db_path, &inputs)?;

    tracing::info!("Opening store: {:?}", db_path);
    let mut conn = db::open(&db_path).context("Failed to open store")?;
    let cancel = CancelToken::new();

    match &args.command {
        Command::Init => {
            let version = db::schema_version(&conn)?.context("Schema version missing after init")?;
            println!("Schema version {} ready at {}", version, db_path.display());
        }
        Command::Import { source, file } => {
            let reader = BufReader::new(File::open(file).with_context(|| format!("Failed to open {}", file.display()))?);
            let report = import::import_lines(&mut conn, *source, reader, &cancel)?;
            println!(
                "Inserted: {}, Updated: {}, Unchanged: {}, Malformed: {}",
                report.inserted, report.updated, report.unchanged, report.malformed
            );
            save_report(&report, args.report.as_ref())?;
        }
        Command::Clean { confidence, dry_run } => {
            let options = CleanupOptions {
                min_confidence: *confidence,
                dry_run: *dry_run,
            };
            let report = run_cleanup(&mut conn, &options, &cancel)?;
            print_cleanup(&report);
            save_report(&report, args.report.as_ref())?;
        }
        Command::Match { min_auto_score, dry_run } => {
            let options = MatchOptions {
                min_auto_score: *min_auto_score,
                dry_run: *dry_run,
            };
            let report = run_match(&mut conn, &options, &cancel)?;
            print_match(&report);
            save_report(&report, args.report.as_ref())?;
        }
        Command::Index => {
            let report = rebuild_index(&mut conn, &cancel)?;
            println!(
                "Artists: {}, Albums: {}, Tracks: {}",
                report.artists, report.albums, report.tracks
            );
            save_report(&report, args.report.as_ref())?;
        }
        Command::Run {
            confidence,
            min_auto_score,
        } => {
            let options = PipelineOptions {
                cleanup: CleanupOptions {
                    min_confidence: *confidence,
                    dry_run: false,
                },
                matching: MatchOptions {
                    min_auto_score: *min_auto_score,
                    dry_run: false,
                },
            };
            print_cleanup(&run_cleanup(&mut conn, &options.cleanup, &cancel)?);
            print_match(&run_match(&mut conn, &options.matching, &cancel)?);
            let index = rebuild_index(&mut conn, &cancel)?;
            println!(
                "Artists: {}, Albums: {}, Tracks: {}",
                index.artists, index.albums, index.tracks
            );
        }
        Command::Text { .. } => {}
    }

    println!("\n{:=<60}", "");
    println!("Done in {}", progress::format_duration(start.elapsed()));
    println!("{:=<60}", "");
    Ok(())
}

fn print_cleanup(report: &discoteka::CleanupReport) {
    if report.dry_run {
        println!("Dry run: nothing written");
    }
    println!("Updated: {}", report.updated);
    println!("Unchanged: {}", report.unchanged);
    println!("Skipped (low confidence): {}", report.skipped);
    if report.malformed > 0 {
        println!("Malformed: {}", report.malformed);
    }
    let top = report.top_tags(TOP_TAGS);
    if !top.is_empty() {
        println!("Top log tags:");
        for (tag, count) in top {
            println!("  {}: {}", tag, count);
        }
    }
}

fn print_match(report: &discoteka::MatchReport) {
    if report.dry_run {
        println!("Dry run: nothing written");
    }
    println!("Auto-linked: {}", report.auto_linked);
    println!("Review: {}", report.review);
    println!(
        "New canonical: {}, New links: {}, Swept: {}, Conflicts: {}",
        report.new_canonical, report.new_links, report.swept, report.conflicts
    );
    for candidate in report.review_candidates.iter().take(TOP_TAGS) {
        println!(
            "  review {:.3}  {} <-> {}  [{}]",
            candidate.score,
            candidate.left,
            candidate.right,
            candidate.reasons.join(", ")
        );
    }
}
