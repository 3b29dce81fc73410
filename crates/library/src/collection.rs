use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::time::Instant;

use common::{FileType, Song};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::LibraryRead;

pub const ROOT_COLLECTION_NAME: &str = "ArtistAlbumDate";

/// A named, recursively organised grouping of songs. Songs are referenced by
/// metadata file name and resolved through a `LibraryRead` when needed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Collection>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub song_files: Vec<String>,
    /// Public file name of the first song reached depth first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_song: Option<String>,
}

impl Collection {
    pub fn song_count(&self) -> usize {
        self.song_files.len()
            + self
                .children
                .iter()
                .map(Collection::song_count)
                .sum::<usize>()
    }

    pub fn type_count<L: LibraryRead>(&self, library: &L) -> BTreeMap<FileType, usize> {
        let mut counts = BTreeMap::new();
        self.count_types(library, &mut counts);
        counts
    }

    fn count_types<L: LibraryRead>(&self, library: &L, counts: &mut BTreeMap<FileType, usize>) {
        self.songs(library, |song| {
            *counts.entry(song.file_type).or_insert(0) += 1;
        });
        for child in &self.children {
            child.count_types(library, counts);
        }
    }

    /// Visits this collection's own songs, skipping names the library no
    /// longer knows.
    pub fn songs<'a, L, F>(&self, library: &'a L, mut visit: F)
    where
        L: LibraryRead,
        F: FnMut(&'a Song),
    {
        for name in &self.song_files {
            if let Some(song) = library.find_song_file(name) {
                visit(song);
            }
        }
    }
}

type AlbumGroups<'a> = BTreeMap<String, Vec<&'a Song>>;
type ArtistGroups<'a> = BTreeMap<String, AlbumGroups<'a>>;

/// Groups songs by artist then album, orders albums by the date of their
/// first track and tracks by disc and number.
pub fn artist_album_date<L: LibraryRead>(library: &L) -> Collection {
    let start = Instant::now();
    let groups = group_by_artist_album(library);

    let mut root = Collection {
        name: ROOT_COLLECTION_NAME.to_string(),
        ..Collection::default()
    };
    for albums in groups.into_values() {
        let sorted = sort_albums_by_date(albums);
        let Some(first) = sorted.first().and_then(|songs| songs.first()) else {
            continue;
        };
        let mut discography = Collection {
            name: first.display_artist().to_string(),
            first_song: Some(first.file.clone()),
            ..Collection::default()
        };
        for songs in sorted {
            discography.children.push(Collection {
                name: songs[0].album.clone(),
                children: Vec::new(),
                song_files: songs.iter().map(|song| song.meta_file.clone()).collect(),
                first_song: Some(songs[0].file.clone()),
            });
        }
        if root.first_song.is_none() {
            root.first_song = discography.first_song.clone();
        }
        root.children.push(discography);
    }

    info!(
        "Organized library into {} collection in {:?}",
        ROOT_COLLECTION_NAME,
        start.elapsed()
    );
    info!("  Song count: {}", root.song_count());
    info!("  Type count: {:?}", root.type_count(library));
    root
}

fn group_by_artist_album<L: LibraryRead>(library: &L) -> ArtistGroups<'_> {
    let mut groups = ArtistGroups::new();
    let visited = library.songs(|song| {
        let artist_key = song.display_artist().to_lowercase();
        let album_key = song.album.to_lowercase();
        let albums = groups.entry(artist_key).or_insert_with(AlbumGroups::new);
        albums.entry(album_key).or_insert_with(Vec::new).push(song);
        Ok::<(), Infallible>(())
    });
    match visited {
        Ok(()) => groups,
        Err(never) => match never {},
    }
}

// Date buckets compare as plain strings, so "9" sorts after "1999-01-01".
// Albums sharing a date keep album key order.
fn sort_albums_by_date(albums: AlbumGroups<'_>) -> Vec<Vec<&Song>> {
    let mut by_date: BTreeMap<String, Vec<Vec<&Song>>> = BTreeMap::new();
    for (_, mut songs) in albums {
        if songs.is_empty() {
            continue;
        }
        songs.sort_by(|a, b| compare_tracks(a, b));
        let date = songs[0].date.clone();
        by_date.entry(date).or_default().push(songs);
    }
    by_date.into_values().flatten().collect()
}

/// Disc first, then track number. Untagged tracks (0) follow numbered ones
/// and fall back to their filesystem path.
fn compare_tracks(a: &Song, b: &Song) -> Ordering {
    a.disc
        .cmp(&b.disc)
        .then_with(|| (a.track == 0).cmp(&(b.track == 0)))
        .then_with(|| a.track.cmp(&b.track))
        .then_with(|| a.path.cmp(&b.path))
}
