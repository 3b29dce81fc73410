mod collection;
mod hash;
mod scan;

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use bincode::Options;
use common::{Artwork, ContentHash, PictureHash, Song};
use metadata::MetadataError;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub use collection::{artist_album_date, Collection, ROOT_COLLECTION_NAME};
pub use hash::{content_hash, flac_checksum_hash, stream_hash, HashError, FLAC_SIGNATURE};
pub use scan::{start_scan, ScanHandle, ScanOptions, ScannedSong};

const SNAPSHOT_MAGIC: [u8; 4] = *b"LIBS";
const SNAPSHOT_VERSION: u32 = 1;
const MEGABYTE: f64 = 1024.0 * 1024.0;

/// Read side of the store. Everything downstream of ingestion (collections,
/// mirror sync, lookups by public file name) goes through this.
pub trait LibraryRead {
    fn find_song(&self, hash: &ContentHash) -> Option<&Song>;

    fn find_art(&self, hash: &PictureHash) -> Option<&Artwork>;

    /// Visits every song in no particular order, stopping at the first error.
    fn songs<'a, E, F>(&'a self, visit: F) -> Result<(), E>
    where
        F: FnMut(&'a Song) -> Result<(), E>;

    fn song_count(&self) -> usize;

    fn art_count(&self) -> usize;

    /// Looks a song up by `hash.ext` or `hash.json`; undecodable names are
    /// simply not found.
    fn find_song_file(&self, name: &str) -> Option<&Song> {
        ContentHash::from_file_name(name).and_then(|hash| self.find_song(&hash))
    }

    fn find_art_file(&self, name: &str) -> Option<&Artwork> {
        PictureHash::from_file_name(name).and_then(|hash| self.find_art(&hash))
    }
}

/// Songs keyed by content hash and artwork keyed by picture hash.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Library {
    songs: HashMap<ContentHash, Song>,
    art: HashMap<PictureHash, Artwork>,
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    songs: &'a HashMap<ContentHash, Song>,
    art: &'a HashMap<PictureHash, Artwork>,
}

#[derive(Clone, Debug)]
pub struct LoadOptions {
    pub root: PathBuf,
    pub workers: usize,
    pub snapshot: Option<PathBuf>,
    pub rescan: bool,
    pub strict_checksums: bool,
}

impl LoadOptions {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            workers: 1,
            snapshot: None,
            rescan: false,
            strict_checksums: false,
        }
    }
}

impl Library {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a scanned song. Artwork is kept once per picture hash; the song
    /// always ends up pointing at the stored artwork's file name, or at
    /// nothing. A song with an already known content hash replaces the old
    /// entry.
    pub fn put(&mut self, mut song: Song, art: Option<Artwork>) {
        match art {
            Some(art) => {
                let hash = art.hash();
                song.art = common::art_file_name(&hash, &art.ext);
                self.art.entry(hash).or_insert(art);
            }
            None => {
                debug!("No art found for song at {:?}", song.path);
                song.art = String::new();
            }
        }
        self.songs.insert(song.hash, song);
    }

    pub fn persist(&self, path: &Path) -> Result<(), LibraryError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp_path = path.with_extension("tmp");
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        writer.write_all(&SNAPSHOT_MAGIC)?;
        encode_into(&mut writer, &SNAPSHOT_VERSION)?;
        encode_into(
            &mut writer,
            &SnapshotRef {
                songs: &self.songs,
                art: &self.art,
            },
        )?;
        let file = writer.into_inner().map_err(|err| err.into_error())?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Replaces the whole in-memory state with the snapshot at `path`. On
    /// error the current state is left untouched.
    pub fn restore(&mut self, path: &Path) -> Result<(), LibraryError> {
        *self = Self::from_snapshot(path)?;
        Ok(())
    }

    pub fn from_snapshot(path: &Path) -> Result<Self, LibraryError> {
        let file = File::open(path)?;
        // Declared lengths can never exceed what is on disk.
        let limit = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut magic = [0u8; 4];
        std::io::Read::read_exact(&mut reader, &mut magic)?;
        if magic != SNAPSHOT_MAGIC {
            return Err(LibraryError::SnapshotFormat(path.to_path_buf()));
        }
        let version: u32 = decode_from(&mut reader, limit)?;
        if version != SNAPSHOT_VERSION {
            return Err(LibraryError::SnapshotVersion(version));
        }
        decode_from(&mut reader, limit)
    }

    /// Restores from the configured snapshot when there is one and a rescan
    /// was not asked for; otherwise scans `root` and, if a snapshot path is
    /// configured, stores the result there.
    pub fn load_or_scan(options: &LoadOptions) -> Result<Self, LibraryError> {
        if let Some(snapshot) = options.snapshot.as_deref() {
            if !options.rescan && snapshot.exists() {
                info!("Will load library from snapshot at {:?}", snapshot);
                let start = Instant::now();
                let library = Self::from_snapshot(snapshot)?;
                info!(
                    "Loaded library from snapshot at {:?} with {} songs and {} pics in {:?}",
                    snapshot,
                    library.song_count(),
                    library.art_count(),
                    start.elapsed()
                );
                return Ok(library);
            }
        }

        let start = Instant::now();
        let mut library = Self::new();
        let mut total_bytes = 0u64;
        let scan_options = ScanOptions {
            workers: options.workers,
            strict_checksums: options.strict_checksums,
        };
        let mut handle = start_scan(&options.root, &scan_options)?;
        for scanned in handle.by_ref() {
            debug!("Found song, path={:?}", scanned.song.path);
            total_bytes += scanned.song.size;
            library.put(scanned.song, scanned.art);
        }
        handle.finish()?;

        let elapsed = start.elapsed();
        let speed = total_bytes as f64 / (elapsed.as_secs_f64().max(1e-9) * MEGABYTE);
        info!(
            "Loaded library with {} songs and {} pics in {:?} ({:.0} MB/s)",
            library.song_count(),
            library.art_count(),
            elapsed,
            speed
        );

        if let Some(snapshot) = options.snapshot.as_deref() {
            info!("Will store library to snapshot at {:?}", snapshot);
            let start = Instant::now();
            match library.persist(snapshot) {
                Ok(()) => info!(
                    "Stored library to snapshot at {:?} with {} songs and {} pics in {:?}",
                    snapshot,
                    library.song_count(),
                    library.art_count(),
                    start.elapsed()
                ),
                Err(err) => warn!("Failed to store library to snapshot at {:?}: {}", snapshot, err),
            }
        }

        Ok(library)
    }
}

impl LibraryRead for Library {
    fn find_song(&self, hash: &ContentHash) -> Option<&Song> {
        self.songs.get(hash)
    }

    fn find_art(&self, hash: &PictureHash) -> Option<&Artwork> {
        self.art.get(hash)
    }

    fn songs<'a, E, F>(&'a self, mut visit: F) -> Result<(), E>
    where
        F: FnMut(&'a Song) -> Result<(), E>,
    {
        for song in self.songs.values() {
            visit(song)?;
        }
        Ok(())
    }

    fn song_count(&self) -> usize {
        self.songs.len()
    }

    fn art_count(&self) -> usize {
        self.art.len()
    }
}

#[derive(Debug)]
pub enum LibraryError {
    Io(std::io::Error),
    Metadata(MetadataError),
    Hash(HashError),
    Bincode(Box<bincode::ErrorKind>),
    Walk(walkdir::Error),
    File(PathBuf, Box<LibraryError>),
    SnapshotFormat(PathBuf),
    SnapshotVersion(u32),
    WorkerPanic,
}

impl std::fmt::Display for LibraryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LibraryError::Io(err) => write!(f, "io error: {}", err),
            LibraryError::Metadata(err) => write!(f, "metadata error: {}", err),
            LibraryError::Hash(err) => write!(f, "hash error: {}", err),
            LibraryError::Bincode(err) => write!(f, "bincode error: {}", err),
            LibraryError::Walk(err) => write!(f, "walk error: {}", err),
            LibraryError::File(path, err) => write!(f, "{:?}: {}", path, err),
            LibraryError::SnapshotFormat(path) => {
                write!(f, "{:?} is not a library snapshot", path)
            }
            LibraryError::SnapshotVersion(version) => {
                write!(f, "snapshot version mismatch: {}", version)
            }
            LibraryError::WorkerPanic => write!(f, "scan worker panicked"),
        }
    }
}

impl std::error::Error for LibraryError {}

impl From<std::io::Error> for LibraryError {
    fn from(err: std::io::Error) -> Self {
        LibraryError::Io(err)
    }
}

impl From<MetadataError> for LibraryError {
    fn from(err: MetadataError) -> Self {
        LibraryError::Metadata(err)
    }
}

impl From<HashError> for LibraryError {
    fn from(err: HashError) -> Self {
        LibraryError::Hash(err)
    }
}

impl From<Box<bincode::ErrorKind>> for LibraryError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        LibraryError::Bincode(err)
    }
}

impl From<walkdir::Error> for LibraryError {
    fn from(err: walkdir::Error) -> Self {
        LibraryError::Walk(err)
    }
}

fn encode_into<W: Write, T: Serialize>(writer: &mut W, value: &T) -> Result<(), LibraryError> {
    Ok(bincode::serialize_into(writer, value)?)
}

fn decode_from<R: std::io::Read, T: for<'de> Deserialize<'de>>(
    reader: &mut R,
    limit: u64,
) -> Result<T, LibraryError> {
    Ok(bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes()
        .with_limit(limit)
        .deserialize_from(reader)?)
}
