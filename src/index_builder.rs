//! Derived artist/album browse index.
//!
//! Recomputed from the canonical table as a full replace in one
//! transaction. Artists are keyed by their folded name, albums by folded
//! (album artist, album title). Synthetic ids are assigned after sorting by
//! display name, so the same catalog always yields the same ids.

use crate::cancel::CancelToken;
use crate::db;
use crate::error::Result;
use crate::models::{CanonicalTrack, IndexReport, StageReport};
use crate::normalize::fold_key;
use crate::progress;
use crate::schema;
use rusqlite::{params, Connection};
use rustc_hash::FxHashMap;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::time::Instant;
use tracing::info;

const UNKNOWN_ARTIST: &str = "Unknown Artist";
const UNKNOWN_ALBUM: &str = "Unknown Album";
const UNTITLED: &str = "Untitled";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexedArtist {
    pub id: i64,
    pub name: String,
    pub key: String,
    pub album_count: usize,
    pub track_count: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexedAlbum {
    pub id: i64,
    pub title: String,
    pub album_artist: String,
    pub key: String,
    pub track_count: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AlbumTrack {
    pub album_id: i64,
    pub canonical_id: i64,
    pub sort_order: usize,
    pub track_number: Option<i64>,
}

/// Everything the derived tables hold.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct LibraryIndex {
    pub artists: Vec<IndexedArtist>,
    pub albums: Vec<IndexedAlbum>,
    /// `(artist_id, album_id)`
    pub artist_albums: Vec<(i64, i64)>,
    pub album_tracks: Vec<AlbumTrack>,
}

/// A canonical track with display fallbacks applied.
struct IndexRow {
    id: i64,
    artist: String,
    album: String,
    album_artist: String,
    track_number: Option<i64>,
    title: String,
}

fn display(values: [Option<&str>; 2]) -> Option<String> {
    values
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|v| !v.is_empty())
        .map(str::to_string)
}

impl IndexRow {
    fn from_track(track: &CanonicalTrack) -> Self {
        let artist = display([track.artist.as_deref(), track.artist_raw.as_deref()]);
        Self {
            id: track.id,
            album: display([track.album.as_deref(), None]).unwrap_or_else(|| UNKNOWN_ALBUM.to_string()),
            album_artist: display([track.album_artist.as_deref(), artist.as_deref()])
                .unwrap_or_else(|| UNKNOWN_ARTIST.to_string()),
            artist: artist.unwrap_or_else(|| UNKNOWN_ARTIST.to_string()),
            track_number: track.track_number,
            title: display([track.title.as_deref(), track.title_raw.as_deref()])
                .unwrap_or_else(|| UNTITLED.to_string()),
        }
    }
}

fn cmp_folded(a: &str, b: &str) -> Ordering {
    a.to_lowercase().cmp(&b.to_lowercase())
}

/// Tracks without a number sort after numbered ones.
fn cmp_track_number(a: Option<i64>, b: Option<i64>) -> Ordering {
    a.unwrap_or(i64::MAX).cmp(&b.unwrap_or(i64::MAX))
}

#[derive(Default)]
struct ArtistAcc {
    name: String,
    albums: BTreeSet<String>,
    track_count: usize,
}

#[derive(Default)]
struct AlbumAcc {
    title: String,
    album_artist: String,
    artists: BTreeSet<String>,
    /// `(canonical_id, track_number, title)`
    tracks: Vec<(i64, Option<i64>, String)>,
}

/// Group canonical tracks into artists and albums. Pure; ids depend only on
/// the catalog contents.
pub fn build_index(tracks: &[CanonicalTrack], cancel: &CancelToken) -> Result<LibraryIndex> {
    let mut rows: Vec<IndexRow> = tracks.iter().map(IndexRow::from_track).collect();
    rows.sort_by(|a, b| {
        cmp_folded(&a.artist, &b.artist)
            .then_with(|| cmp_folded(&a.album, &b.album))
            .then_with(|| cmp_track_number(a.track_number, b.track_number))
            .then_with(|| cmp_folded(&a.title, &b.title))
            .then_with(|| a.id.cmp(&b.id))
    });

    let mut artists: FxHashMap<String, ArtistAcc> = FxHashMap::default();
    let mut albums: FxHashMap<String, AlbumAcc> = FxHashMap::default();

    for row in rows {
        cancel.check("index")?;
        let artist_key = fold_key(&row.artist);
        let album_key = format!("{}|{}", fold_key(&row.album_artist), fold_key(&row.album));

        let artist = artists.entry(artist_key.clone()).or_insert_with(|| ArtistAcc {
            name: row.artist.clone(),
            ..Default::default()
        });
        artist.track_count += 1;
        artist.albums.insert(album_key.clone());

        let album = albums.entry(album_key).or_insert_with(|| AlbumAcc {
            title: row.album.clone(),
            album_artist: row.album_artist.clone(),
            ..Default::default()
        });
        album.artists.insert(artist_key);
        album.tracks.push((row.id, row.track_number, row.title));
    }

    // Flush: ids follow display-name order.
    let mut artist_list: Vec<(String, ArtistAcc)> = artists.into_iter().collect();
    artist_list.sort_by(|(ka, a), (kb, b)| cmp_folded(&a.name, &b.name).then_with(|| ka.cmp(kb)));
    let mut album_list: Vec<(String, AlbumAcc)> = albums.into_iter().collect();
    album_list.sort_by(|(ka, a), (kb, b)| {
        cmp_folded(&a.album_artist, &b.album_artist)
            .then_with(|| cmp_folded(&a.title, &b.title))
            .then_with(|| ka.cmp(kb))
    });

    let album_ids: FxHashMap<&str, i64> = album_list
        .iter()
        .enumerate()
        .map(|(i, (key, _))| (key.as_str(), i as i64 + 1))
        .collect();
    let artist_ids: FxHashMap<&str, i64> = artist_list
        .iter()
        .enumerate()
        .map(|(i, (key, _))| (key.as_str(), i as i64 + 1))
        .collect();

    let mut index = LibraryIndex::default();
    for (key, acc) in &artist_list {
        index.artists.push(IndexedArtist {
            id: artist_ids[key.as_str()],
            name: acc.name.clone(),
            key: key.clone(),
            album_count: acc.albums.len(),
            track_count: acc.track_count,
        });
    }
    for (key, acc) in &album_list {
        let album_id = album_ids[key.as_str()];
        index.albums.push(IndexedAlbum {
            id: album_id,
            title: acc.title.clone(),
            album_artist: acc.album_artist.clone(),
            key: key.clone(),
            track_count: acc.tracks.len(),
        });
        for artist_key in &acc.artists {
            index.artist_albums.push((artist_ids[artist_key.as_str()], album_id));
        }

        let mut tracks = acc.tracks.clone();
        tracks.sort_by(|a, b| {
            cmp_track_number(a.1, b.1)
                .then_with(|| cmp_folded(&a.2, &b.2))
                .then_with(|| a.0.cmp(&b.0))
        });
        for (sort_order, (canonical_id, track_number, _)) in tracks.into_iter().enumerate() {
            index.album_tracks.push(AlbumTrack {
                album_id,
                canonical_id,
                sort_order,
                track_number,
            });
        }
    }
    index.artist_albums.sort_unstable();
    Ok(index)
}

fn write_index(conn: &Connection, index: &LibraryIndex) -> Result<()> {
    conn.execute_batch(schema::CLEAR_INDEX_TABLES)?;

    let mut insert_artist = conn.prepare_cached(schema::INSERT_INDEX_ARTIST)?;
    for artist in &index.artists {
        insert_artist.execute(params![
            artist.id,
            artist.name,
            artist.key,
            artist.album_count as i64,
            artist.track_count as i64,
        ])?;
    }

    let mut insert_album = conn.prepare_cached(schema::INSERT_INDEX_ALBUM)?;
    for album in &index.albums {
        insert_album.execute(params![
            album.id,
            album.title,
            album.album_artist,
            album.key,
            album.track_count as i64,
        ])?;
    }

    let mut insert_link = conn.prepare_cached(schema::INSERT_INDEX_ARTIST_ALBUM)?;
    for (artist_id, album_id) in &index.artist_albums {
        insert_link.execute(params![artist_id, album_id])?;
    }

    let mut insert_track = conn.prepare_cached(schema::INSERT_INDEX_ALBUM_TRACK)?;
    let pb = progress::create_progress_bar(index.album_tracks.len() as u64, "Writing album tracks");
    for track in &index.album_tracks {
        insert_track.execute(params![
            track.album_id,
            track.canonical_id,
            track.sort_order as i64,
            track.track_number,
        ])?;
        progress::tick(&pb, "Writing album tracks", 10_000);
    }
    pb.finish_and_clear();
    Ok(())
}

/// Replace the derived index with one computed from the canonical table.
pub fn rebuild_index(conn: &mut Connection, cancel: &CancelToken) -> Result<IndexReport> {
    let start = Instant::now();
    info!("Rebuilding artist/album index...");

    let tx = conn.transaction()?;
    let tracks = db::load_canonical_tracks(&tx)?;
    let index = build_index(&tracks, cancel)?;
    cancel.check("index")?;
    write_index(&tx, &index)?;
    tx.commit()?;

    let report = IndexReport {
        artists: index.artists.len(),
        albums: index.albums.len(),
        tracks: tracks.len(),
        elapsed_seconds: start.elapsed().as_secs_f64(),
    };
    report.log_phase("index");
    info!(
        "Rebuild complete. Artists={}, Albums={}, Tracks={}",
        report.artists, report.albums, report.tracks
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(id: i64, title: &str, artist: &str, album: &str, number: Option<i64>) -> CanonicalTrack {
        CanonicalTrack {
            id,
            title: Some(title.to_string()).filter(|t| !t.is_empty()),
            artist: Some(artist.to_string()).filter(|a| !a.is_empty()),
            album: Some(album.to_string()).filter(|a| !a.is_empty()),
            track_number: number,
            ..Default::default()
        }
    }

    #[test]
    fn test_one_artist_two_albums() {
        let tracks = vec![
            track(1, "Intro", "The Band", "First", Some(1)),
            track(2, "Outro", "the  band ", "Second", Some(1)),
        ];
        let index = build_index(&tracks, &CancelToken::new()).unwrap();
        assert_eq!(index.artists.len(), 1);
        assert_eq!(index.artists[0].album_count, 2);
        assert_eq!(index.artists[0].track_count, 2);
        assert_eq!(index.albums.len(), 2);
        assert_eq!(index.artist_albums, vec![(1, 1), (1, 2)]);
    }

    #[test]
    fn test_fallbacks_and_track_order() {
        let tracks = vec![
            track(5, "", "", "", None),
            track(3, "Zeta", "Solo", "Record", None),
            track(4, "Beta", "Solo", "Record", Some(2)),
            track(2, "Alpha", "Solo", "Record", None),
        ];
        let index = build_index(&tracks, &CancelToken::new()).unwrap();

        let names: Vec<&str> = index.artists.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["Solo", "Unknown Artist"]);
        let unknown = index.albums.iter().find(|a| a.title == "Unknown Album").unwrap();
        assert_eq!(unknown.album_artist, "Unknown Artist");

        let record = index.albums.iter().find(|a| a.title == "Record").unwrap();
        let order: Vec<i64> = index
            .album_tracks
            .iter()
            .filter(|t| t.album_id == record.id)
            .map(|t| t.canonical_id)
            .collect();
        assert_eq!(order, vec![4, 2, 3]);
    }

    #[test]
    fn test_ids_are_stable_across_input_order() {
        let mut tracks = vec![
            track(1, "A", "Zed", "Z", None),
            track(2, "B", "Amy", "Y", None),
            track(3, "C", "Mo", "X", None),
        ];
        let first = build_index(&tracks, &CancelToken::new()).unwrap();
        tracks.reverse();
        assert_eq!(build_index(&tracks, &CancelToken::new()).unwrap(), first);
        assert_eq!(first.artists[0].name, "Amy");
        assert_eq!(first.artists[0].id, 1);
    }

    #[test]
    fn test_rebuild_replaces_previous_index() {
        let mut conn = db::open_in_memory().unwrap();
        db::insert_canonical(&conn, &track(1, "Song", "Artist", "Album", Some(1))).unwrap();
        db::insert_canonical(&conn, &track(2, "Other", "Artist", "Album", Some(2))).unwrap();

        let report = rebuild_index(&mut conn, &CancelToken::new()).unwrap();
        assert_eq!((report.artists, report.albums, report.tracks), (1, 1, 2));

        let again = rebuild_index(&mut conn, &CancelToken::new()).unwrap();
        assert_eq!((again.artists, again.albums, again.tracks), (1, 1, 2));
        assert_eq!(db::count_rows(&conn, "index_artists").unwrap(), 1);
        assert_eq!(db::count_rows(&conn, "index_album_tracks").unwrap(), 2);

        let count: i64 = conn
            .query_row("SELECT album_count FROM index_artists WHERE artist_key = 'artist'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
