mod encoder;

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Instant;

use common::{join_relpath, relpath_from, FileType, Song};
use crossbeam_channel::{bounded, Receiver};
use library::LibraryRead;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub use encoder::{
    ExternalEncoder, Transcoder, DEFAULT_BITRATE_KBPS, DEFAULT_ENCODER, TRANSCODED_EXTENSION,
};

const TRANSCODE_QUEUE: usize = 64;
const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

const SYNC_WARNING: [&str; 3] = [
    "Only audio, jpg/jpeg, and png files are synced to the mirror.",
    "ALL EXISTING FILES in the mirror that are not audio, jpg, or png WILL BE ERASED.",
    "ALL EXISTING FILES in the mirror that do not have a related file in the library root WILL BE ERASED.",
];

/// What an expected destination entry is made from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    Audio(FileType),
    Image,
}

impl SourceKind {
    fn transcodes(self) -> bool {
        self == SourceKind::Audio(FileType::Flac)
    }
}

#[derive(Clone, Debug)]
pub struct MirrorOptions {
    pub workers: usize,
}

impl Default for MirrorOptions {
    fn default() -> Self {
        let workers = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self { workers }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub deleted_files: usize,
    pub deleted_dirs: usize,
    pub copied: usize,
    pub transcoded: usize,
    pub skipped: usize,
}

#[derive(Debug)]
pub enum MirrorError {
    Io(io::Error),
    Walk(walkdir::Error),
    Encoder {
        program: String,
        status: Option<i32>,
        stderr: String,
    },
    WorkerPanic,
}

impl std::fmt::Display for MirrorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MirrorError::Io(err) => write!(f, "io error: {}", err),
            MirrorError::Walk(err) => write!(f, "walk error: {}", err),
            MirrorError::Encoder {
                program,
                status,
                stderr,
            } => match status {
                Some(code) => write!(f, "{} exited with status {}: {}", program, code, stderr),
                None => write!(f, "{} was terminated by a signal: {}", program, stderr),
            },
            MirrorError::WorkerPanic => write!(f, "transcode worker panicked"),
        }
    }
}

impl std::error::Error for MirrorError {}

impl From<io::Error> for MirrorError {
    fn from(err: io::Error) -> Self {
        MirrorError::Io(err)
    }
}

impl From<walkdir::Error> for MirrorError {
    fn from(err: walkdir::Error) -> Self {
        MirrorError::Walk(err)
    }
}

struct TranscodeTask {
    input: PathBuf,
    output: PathBuf,
}

/// Makes `dest` hold the library's audio and the root's cover images, with
/// FLAC replaced by transcoded copies. Anything else under `dest` is
/// removed. Existing destination files are trusted as already synced.
///
/// Not transactional: a failed transcode leaves earlier deletions and copies
/// in place.
pub fn sync_mirror<L, T>(
    root: &Path,
    library: &L,
    dest: &Path,
    transcoder: &T,
    options: &MirrorOptions,
) -> Result<SyncReport, MirrorError>
where
    L: LibraryRead,
    T: Transcoder,
{
    for line in SYNC_WARNING {
        warn!("{}", line);
    }
    let start = Instant::now();
    let mut report = SyncReport::default();

    let expected = expected_files(root, library)?;
    let mut existing = existing_files(dest)?;

    info!("Deleting unknown files from {:?}", dest);
    delete_unknown(dest, &expected, &mut existing, &mut report);
    info!("Deleting empty directories from {:?}", dest);
    report.deleted_dirs = prune_empty_dirs(dest)?;

    materialize(root, dest, &expected, &existing, transcoder, options, &mut report)?;

    info!("Synced {:?} to {:?} in {:?}: {:?}", root, dest, start.elapsed(), report);
    Ok(report)
}

/// Root-relative paths of every library song plus any cover images found
/// under `root`.
pub fn expected_files<L: LibraryRead>(
    root: &Path,
    library: &L,
) -> Result<BTreeMap<String, SourceKind>, MirrorError> {
    let mut expected = BTreeMap::new();
    let visited = library.songs(|song: &Song| {
        match relpath_from(root, &song.path) {
            Some(rel) => {
                expected.insert(rel, SourceKind::Audio(song.file_type));
            }
            None => warn!("Song {:?} is outside of {:?}", song.path, root),
        }
        Ok::<(), MirrorError>(())
    });
    visited?;

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry?;
        if !entry.file_type().is_file() || !is_image(entry.path()) {
            continue;
        }
        if let Some(rel) = relpath_from(root, entry.path()) {
            expected.entry(rel).or_insert(SourceKind::Image);
        }
    }
    Ok(expected)
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

fn existing_files(dest: &Path) -> Result<BTreeSet<String>, MirrorError> {
    if !dest.exists() {
        info!("Creating mirror root {:?}", dest);
        fs::create_dir_all(dest)?;
    }
    let mut existing = BTreeSet::new();
    for entry in WalkDir::new(dest).follow_links(false) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(rel) = relpath_from(dest, entry.path()) {
            existing.insert(rel);
        }
    }
    Ok(existing)
}

/// Destination path of the transcoded copy of `relpath`.
pub fn transcode_target(relpath: &str) -> String {
    let name_start = relpath.rfind('/').map(|idx| idx + 1).unwrap_or(0);
    let stem = match relpath[name_start..].rfind('.') {
        Some(idx) => &relpath[..name_start + idx],
        None => relpath,
    };
    format!("{}.{}", stem, TRANSCODED_EXTENSION)
}

fn delete_unknown(
    dest: &Path,
    expected: &BTreeMap<String, SourceKind>,
    existing: &mut BTreeSet<String>,
    report: &mut SyncReport,
) {
    let targets: BTreeSet<String> = expected
        .iter()
        .filter(|(_, kind)| kind.transcodes())
        .map(|(rel, _)| transcode_target(rel))
        .collect();

    let mut deleted = Vec::new();
    for rel in existing.iter() {
        if expected.contains_key(rel) || targets.contains(rel) {
            continue;
        }
        let path = join_relpath(dest, rel);
        match fs::remove_file(&path) {
            Ok(()) => {
                info!("Deleted {:?}", path);
                deleted.push(rel.clone());
            }
            Err(err) => warn!("Failed to delete {:?}: {}", path, err),
        }
    }
    for rel in &deleted {
        existing.remove(rel);
    }
    report.deleted_files = deleted.len();
}

// Children are visited before their parent, so directories emptied here are
// removed in the same pass.
fn prune_empty_dirs(dest: &Path) -> Result<usize, MirrorError> {
    let mut removed = 0;
    for entry in WalkDir::new(dest).min_depth(1).contents_first(true) {
        let entry = entry?;
        if !entry.file_type().is_dir() {
            continue;
        }
        if fs::read_dir(entry.path())?.next().is_some() {
            continue;
        }
        fs::remove_dir(entry.path())?;
        info!("Removed empty directory {:?}", entry.path());
        removed += 1;
    }
    Ok(removed)
}

fn materialize<T: Transcoder>(
    root: &Path,
    dest: &Path,
    expected: &BTreeMap<String, SourceKind>,
    existing: &BTreeSet<String>,
    transcoder: &T,
    options: &MirrorOptions,
    report: &mut SyncReport,
) -> Result<(), MirrorError> {
    let workers = options.workers.max(1);
    let (task_tx, task_rx) = bounded::<TranscodeTask>(TRANSCODE_QUEUE);

    thread::scope(|scope| {
        let handles: Vec<_> = (0..workers)
            .map(|_| {
                let task_rx = task_rx.clone();
                scope.spawn(move || transcode_tasks(task_rx, transcoder))
            })
            .collect();
        drop(task_rx);

        let mut produced = Ok(());
        for (rel, kind) in expected {
            if kind.transcodes() {
                let target = transcode_target(rel);
                if existing.contains(&target) {
                    debug!("Already exists: {:?}", join_relpath(dest, &target));
                    report.skipped += 1;
                    continue;
                }
                let task = TranscodeTask {
                    input: join_relpath(root, rel),
                    output: join_relpath(dest, &target),
                };
                // Every worker has failed; their errors are collected below.
                if task_tx.send(task).is_err() {
                    break;
                }
                continue;
            }

            if existing.contains(rel) {
                debug!("Already exists: {:?}", join_relpath(dest, rel));
                report.skipped += 1;
                continue;
            }
            if let Err(err) = copy_file(&join_relpath(root, rel), &join_relpath(dest, rel)) {
                produced = Err(err);
                break;
            }
            report.copied += 1;
        }
        drop(task_tx);

        let mut first_error = produced.err();
        for handle in handles {
            let outcome = match handle.join() {
                Ok(outcome) => outcome,
                Err(_) => Err(MirrorError::WorkerPanic),
            };
            match outcome {
                Ok(count) => report.transcoded += count,
                Err(err) => {
                    warn!("Transcoding failed: {}", err);
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => {
                info!("Transcoding complete");
                Ok(())
            }
        }
    })
}

fn transcode_tasks<T: Transcoder>(
    tasks: Receiver<TranscodeTask>,
    transcoder: &T,
) -> Result<usize, MirrorError> {
    let mut done = 0;
    for task in tasks.iter() {
        let data = transcoder.transcode(&task.input)?;
        write_file(&data, &task.output)?;
        done += 1;
    }
    Ok(done)
}

fn ensure_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) => fs::create_dir_all(parent),
        None => Ok(()),
    }
}

fn write_file(data: &[u8], output: &Path) -> Result<(), MirrorError> {
    let start = Instant::now();
    ensure_parent(output)?;
    let mut file = File::create(output)?;
    file.write_all(data)?;
    file.sync_all()?;
    info!(
        "Wrote new file (size {}) to {:?} in {:?}",
        data.len(),
        output,
        start.elapsed()
    );
    Ok(())
}

fn copy_file(input: &Path, output: &Path) -> Result<(), MirrorError> {
    let start = Instant::now();
    ensure_parent(output)?;
    let mut source = File::open(input)?;
    let mut target = File::create(output)?;
    let size = io::copy(&mut source, &mut target)?;
    target.sync_all()?;
    info!(
        "Copied file (size {}) from {:?} to {:?} in {:?}",
        size,
        input,
        output,
        start.elapsed()
    );
    Ok(())
}
