//! Music library reconciliation engine - shared modules for all binaries.
//!
//! Cleans noisy track metadata from a streaming export, a DJ-software
//! export and a filesystem scan, links records across the three sources
//! into canonical tracks, and derives an artist/album browse index.

pub mod blocking;
pub mod cancel;
pub mod canonical;
pub mod clean;
pub mod cleanup;
pub mod config;
pub mod db;
pub mod error;
pub mod import;
pub mod index_builder;
pub mod matcher;
pub mod models;
pub mod normalize;
pub mod progress;
pub mod safety;
pub mod schema;
pub mod scoring;

pub use cancel::CancelToken;
pub use clean::{clean, CleanResult};
pub use cleanup::{run_cleanup, CleanupOptions};
pub use error::{Error, Result};
pub use index_builder::rebuild_index;
pub use matcher::{run_match, MatchOptions};
pub use models::{CleanupReport, IndexReport, MatchReport, Source, SourceRecord};
