use std::fs::{self, File};
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::UNIX_EPOCH;

use common::{meta_file_name, song_file_name, Artwork, Song};
use crossbeam_channel::{bounded, Receiver, Sender};
use metadata::read_audio;
use parking_lot::Mutex;
use tracing::warn;
use walkdir::WalkDir;

use crate::hash::{content_hash, stream_hash, HashError};
use crate::LibraryError;

const WORK_QUEUE_PER_WORKER: usize = 16;
const OUTPUT_QUEUE_PER_WORKER: usize = 2;

#[derive(Clone, Debug)]
pub struct ScanOptions {
    pub workers: usize,
    /// Fail a FLAC file whose STREAMINFO MD5 is unset instead of digesting
    /// its audio stream.
    pub strict_checksums: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            workers: 1,
            strict_checksums: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ScannedSong {
    pub song: Song,
    pub art: Option<Artwork>,
}

struct WalkEntry {
    path: PathBuf,
    size: u64,
    modified_secs: u64,
}

type FirstError = Arc<Mutex<Option<LibraryError>>>;

/// A running scan. Iterating yields songs in completion order until the
/// tree is exhausted; `finish` then reports the first error any stage hit.
pub struct ScanHandle {
    songs: Receiver<ScannedSong>,
    threads: Vec<JoinHandle<()>>,
    first_error: FirstError,
}

impl Iterator for ScanHandle {
    type Item = ScannedSong;

    fn next(&mut self) -> Option<ScannedSong> {
        self.songs.recv().ok()
    }
}

impl ScanHandle {
    /// Waits for the walker and every worker. Records not yet received are
    /// dropped.
    pub fn finish(self) -> Result<(), LibraryError> {
        let ScanHandle {
            songs,
            threads,
            first_error,
        } = self;
        drop(songs);

        let mut panicked = false;
        for handle in threads {
            if handle.join().is_err() {
                panicked = true;
            }
        }

        if let Some(err) = first_error.lock().take() {
            return Err(err);
        }
        if panicked {
            return Err(LibraryError::WorkerPanic);
        }
        Ok(())
    }
}

/// Walks `root` on one thread and reads every regular file on
/// `options.workers` threads. Files that are not audio are skipped. A worker
/// that fails stops taking work; its siblings keep draining the queue.
pub fn start_scan(root: &Path, options: &ScanOptions) -> Result<ScanHandle, LibraryError> {
    let workers = options.workers.max(1);
    let (work_tx, work_rx) = bounded::<WalkEntry>(workers * WORK_QUEUE_PER_WORKER);
    let (song_tx, song_rx) = bounded::<ScannedSong>(workers * OUTPUT_QUEUE_PER_WORKER);
    let first_error: FirstError = Arc::new(Mutex::new(None));
    let mut threads = Vec::with_capacity(workers + 1);

    {
        let root = root.to_path_buf();
        let first_error = Arc::clone(&first_error);
        threads.push(
            thread::Builder::new()
                .name("scan-walker".to_string())
                .spawn(move || walk(&root, work_tx, &first_error))?,
        );
    }

    for idx in 0..workers {
        let work_rx = work_rx.clone();
        let song_tx = song_tx.clone();
        let first_error = Arc::clone(&first_error);
        let strict = options.strict_checksums;
        threads.push(
            thread::Builder::new()
                .name(format!("scan-worker-{}", idx))
                .spawn(move || read_songs(work_rx, song_tx, strict, &first_error))?,
        );
    }

    Ok(ScanHandle {
        songs: song_rx,
        threads,
        first_error,
    })
}

fn record_error(first_error: &Mutex<Option<LibraryError>>, err: LibraryError) {
    let mut slot = first_error.lock();
    if slot.is_none() {
        *slot = Some(err);
    } else {
        warn!("Additional scan error: {}", err);
    }
}

fn walk(root: &Path, work: Sender<WalkEntry>, first_error: &Mutex<Option<LibraryError>>) {
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                record_error(first_error, err.into());
                return;
            }
        };
        if entry.file_type().is_dir() {
            continue;
        }
        let meta = if entry.path_is_symlink() {
            match fs::metadata(entry.path()) {
                Ok(meta) => meta,
                Err(err) => {
                    warn!("Skipping broken link {:?}: {}", entry.path(), err);
                    continue;
                }
            }
        } else {
            match entry.metadata() {
                Ok(meta) => meta,
                Err(err) => {
                    record_error(first_error, err.into());
                    return;
                }
            }
        };
        if !meta.is_file() {
            continue;
        }
        let modified_secs = meta
            .modified()
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map(|since| since.as_secs())
            .unwrap_or(0);
        let walked = WalkEntry {
            path: entry.into_path(),
            size: meta.len(),
            modified_secs,
        };
        // Every worker has quit.
        if work.send(walked).is_err() {
            return;
        }
    }
}

fn read_songs(
    work: Receiver<WalkEntry>,
    songs: Sender<ScannedSong>,
    strict_checksums: bool,
    first_error: &Mutex<Option<LibraryError>>,
) {
    for entry in work.iter() {
        let path = entry.path.clone();
        match read_song(entry, strict_checksums) {
            Ok(Some(scanned)) => {
                if songs.send(scanned).is_err() {
                    return;
                }
            }
            Ok(None) => {}
            Err(err) => {
                warn!("Failed to read {:?}: {}", path, err);
                record_error(first_error, LibraryError::File(path, Box::new(err)));
                return;
            }
        }
    }
}

fn read_song(entry: WalkEntry, strict_checksums: bool) -> Result<Option<ScannedSong>, LibraryError> {
    let mut file = File::open(&entry.path)?;
    let extension = entry.path.extension().and_then(|ext| ext.to_str());
    let info = match read_audio(&file, extension)? {
        Some(info) => info,
        None => return Ok(None),
    };
    file.seek(SeekFrom::Start(0))?;

    let hash = match content_hash(&mut file, info.file_type, extension) {
        Ok(hash) => hash,
        Err(HashError::MissingChecksum) if !strict_checksums => {
            warn!(
                "FLAC file {:?} has no MD5 checksum in its STREAMINFO block; hashing the audio stream",
                entry.path
            );
            stream_hash(&mut file, extension)?
        }
        Err(err) => return Err(err.into()),
    };

    let tags = info.tags;
    let song = Song {
        file: song_file_name(&hash, &entry.path),
        meta_file: meta_file_name(&hash),
        size: entry.size,
        modified_secs: entry.modified_secs,
        album: tags.album.unwrap_or_default(),
        artist: tags.artist.unwrap_or_default(),
        album_artist: tags.album_artist.unwrap_or_default(),
        composer: tags.composer.unwrap_or_default(),
        title: tags.title.unwrap_or_default(),
        track: tags.track_no.unwrap_or(0),
        disc: tags.disc_no.unwrap_or(0),
        art: String::new(),
        comment: tags.comment.unwrap_or_default(),
        file_type: info.file_type,
        date: tags.date.unwrap_or_default(),
        path: entry.path,
        hash,
        tag_format: info.tag_format,
    };
    let art = info.cover.map(|cover| Artwork {
        data: cover.data,
        ext: cover.ext.unwrap_or_default(),
        mime_type: cover.mime.unwrap_or_default(),
    });

    Ok(Some(ScannedSong { song, art }))
}
