use std::fs;
use std::path::Path;

use common::{FileType, TagFormat};
use library::{start_scan, Library, LibraryError, LibraryRead, LoadOptions, ScanOptions, FLAC_SIGNATURE};

const PNG_COVER: &[u8] = b"\x89PNG\r\n\x1a\n\x00\x00\x00\x0dIHDRcover";

struct Fixture<'a> {
    md5: [u8; 16],
    tags: &'a [(&'a str, &'a str)],
    picture: Option<&'a [u8]>,
}

// Audio frames appended after the metadata blocks; constant subframes keep
// them tiny.
struct Frames {
    count: u8,
    level: i16,
}

fn block_header(kind: u8, last: bool, len: usize) -> [u8; 4] {
    let kind = if last { kind | 0x80 } else { kind };
    [kind, (len >> 16) as u8, (len >> 8) as u8, len as u8]
}

fn stream_info(md5: [u8; 16]) -> Vec<u8> {
    let mut body = Vec::with_capacity(34);
    body.extend_from_slice(&4096u16.to_be_bytes());
    body.extend_from_slice(&4096u16.to_be_bytes());
    body.extend_from_slice(&[0u8; 6]);
    // 44100 Hz, 2 channels, 16 bits, no sample count.
    body.extend_from_slice(&[0x0A, 0xC4, 0x42, 0xF0, 0x00, 0x00, 0x00, 0x00]);
    body.extend_from_slice(&md5);
    body
}

fn vorbis_comment(tags: &[(&str, &str)]) -> Vec<u8> {
    let vendor = b"fixture";
    let mut body = Vec::new();
    body.extend_from_slice(&(vendor.len() as u32).to_le_bytes());
    body.extend_from_slice(vendor);
    body.extend_from_slice(&(tags.len() as u32).to_le_bytes());
    for (key, value) in tags {
        let entry = format!("{}={}", key, value);
        body.extend_from_slice(&(entry.len() as u32).to_le_bytes());
        body.extend_from_slice(entry.as_bytes());
    }
    body
}

fn picture(data: &[u8]) -> Vec<u8> {
    let mime = b"image/png";
    let mut body = Vec::new();
    body.extend_from_slice(&3u32.to_be_bytes());
    body.extend_from_slice(&(mime.len() as u32).to_be_bytes());
    body.extend_from_slice(mime);
    body.extend_from_slice(&0u32.to_be_bytes());
    for _ in 0..4 {
        body.extend_from_slice(&0u32.to_be_bytes());
    }
    body.extend_from_slice(&(data.len() as u32).to_be_bytes());
    body.extend_from_slice(data);
    body
}

fn crc8(bytes: &[u8]) -> u8 {
    let mut crc = 0u8;
    for byte in bytes {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 { (crc << 1) ^ 0x07 } else { crc << 1 };
        }
    }
    crc
}

fn crc16(bytes: &[u8]) -> u16 {
    let mut crc = 0u16;
    for byte in bytes {
        crc ^= (*byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 { (crc << 1) ^ 0x8005 } else { crc << 1 };
        }
    }
    crc
}

/// Fixed block size frames of 4096 stereo 16 bit samples at 44.1 kHz.
fn audio_frames(frames: &Frames) -> Vec<u8> {
    let mut out = Vec::new();
    for number in 0..frames.count {
        let mut frame = vec![0xFF, 0xF8, 0xC9, 0x18, number];
        frame.push(crc8(&frame));
        for _ in 0..2 {
            frame.push(0x00);
            frame.extend_from_slice(&frames.level.to_be_bytes());
        }
        let crc = crc16(&frame);
        frame.extend_from_slice(&crc.to_be_bytes());
        out.extend_from_slice(&frame);
    }
    out
}

fn flac_bytes(fixture: &Fixture<'_>) -> Vec<u8> {
    let mut bytes = FLAC_SIGNATURE.to_vec();
    let info = stream_info(fixture.md5);
    bytes.extend_from_slice(&block_header(0, false, info.len()));
    bytes.extend_from_slice(&info);

    let comments = vorbis_comment(fixture.tags);
    bytes.extend_from_slice(&block_header(4, fixture.picture.is_none(), comments.len()));
    bytes.extend_from_slice(&comments);

    if let Some(data) = fixture.picture {
        let block = picture(data);
        bytes.extend_from_slice(&block_header(6, true, block.len()));
        bytes.extend_from_slice(&block);
    }
    bytes
}

fn write_flac(path: &Path, fixture: &Fixture<'_>) {
    write_file(path, &flac_bytes(fixture));
}

fn write_flac_with_audio(path: &Path, fixture: &Fixture<'_>, frames: &Frames) {
    let mut bytes = flac_bytes(fixture);
    bytes.extend_from_slice(&audio_frames(frames));
    write_file(path, &bytes);
}

fn write_file(path: &Path, bytes: &[u8]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, bytes).unwrap();
}

fn riff_chunk(id: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let mut chunk = id.to_vec();
    chunk.extend_from_slice(&(body.len() as u32).to_le_bytes());
    chunk.extend_from_slice(body);
    if body.len() % 2 == 1 {
        chunk.push(0);
    }
    chunk
}

/// 16 bit stereo PCM at 44.1 kHz with a RIFF INFO title.
fn wav_bytes(title: &str, pcm: &[u8]) -> Vec<u8> {
    let mut format = Vec::new();
    format.extend_from_slice(&1u16.to_le_bytes());
    format.extend_from_slice(&2u16.to_le_bytes());
    format.extend_from_slice(&44_100u32.to_le_bytes());
    format.extend_from_slice(&176_400u32.to_le_bytes());
    format.extend_from_slice(&4u16.to_le_bytes());
    format.extend_from_slice(&16u16.to_le_bytes());

    let mut name = title.as_bytes().to_vec();
    name.push(0);
    let mut info = b"INFO".to_vec();
    info.extend_from_slice(&riff_chunk(b"INAM", &name));

    let mut body = b"WAVE".to_vec();
    body.extend_from_slice(&riff_chunk(b"fmt ", &format));
    body.extend_from_slice(&riff_chunk(b"LIST", &info));
    body.extend_from_slice(&riff_chunk(b"data", pcm));
    riff_chunk(b"RIFF", &body)
}

fn jfif_bytes() -> Vec<u8> {
    let mut bytes = vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10];
    bytes.extend_from_slice(b"JFIF\0");
    bytes.extend_from_slice(&[0x01, 0x01, 0x00, 0x00, 0x48, 0x00, 0x48, 0x00, 0x00]);
    bytes.extend_from_slice(&[0xFF, 0xDB, 0x00, 0x43, 0x00]);
    bytes.extend(std::iter::repeat(0x10).take(64));
    bytes.extend_from_slice(&[0xFF, 0xD9]);
    bytes
}

fn all_songs(library: &Library) -> Vec<common::Song> {
    let mut songs = Vec::new();
    library
        .songs(|song| {
            songs.push(song.clone());
            Ok::<(), ()>(())
        })
        .unwrap();
    songs
}

fn scan(root: &Path, options: ScanOptions) -> Result<Library, LibraryError> {
    let mut library = Library::new();
    let mut handle = start_scan(root, &options)?;
    for scanned in handle.by_ref() {
        library.put(scanned.song, scanned.art);
    }
    handle.finish()?;
    Ok(library)
}

fn workers(count: usize) -> ScanOptions {
    ScanOptions {
        workers: count,
        ..ScanOptions::default()
    }
}

#[test]
fn flac_tags_and_checksum_become_a_song() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("Artist").join("Album").join("01.flac");
    write_flac(
        &path,
        &Fixture {
            md5: [0x42; 16],
            tags: &[
                ("TITLE", "Opening"),
                ("ARTIST", "Artist"),
                ("ALBUM", "Album"),
                ("TRACKNUMBER", "1/10"),
                ("DISCNUMBER", "2"),
                ("DATE", "1999-04-01"),
            ],
            picture: None,
        },
    );

    let library = scan(dir.path(), workers(2)).unwrap();
    assert_eq!(library.song_count(), 1);

    let mut found = Vec::new();
    library
        .songs(|song| {
            found.push(song.clone());
            Ok::<(), ()>(())
        })
        .unwrap();
    let song = &found[0];
    assert_eq!(&song.hash.0[..16], &[0x42; 16]);
    assert_eq!(&song.hash.0[16..], FLAC_SIGNATURE);
    assert_eq!(song.title, "Opening");
    assert_eq!(song.album, "Album");
    assert_eq!(song.track, 1);
    assert_eq!(song.disc, 2);
    assert_eq!(song.date, "1999-04-01");
    assert_eq!(song.file_type, FileType::Flac);
    assert_eq!(song.tag_format, TagFormat::Vorbis);
    assert_eq!(song.path, path);
    assert!(song.file.ends_with(".flac"));
    assert!(song.meta_file.ends_with(".json"));
    assert_eq!(song.art, "");
    assert_eq!(song.size, fs::metadata(&path).unwrap().len());
}

#[test]
fn retagged_copies_collapse_into_one_song() {
    let dir = tempfile::tempdir().unwrap();
    let md5 = [0x11; 16];
    write_flac(
        &dir.path().join("a.flac"),
        &Fixture { md5, tags: &[("TITLE", "First")], picture: None },
    );
    write_flac(
        &dir.path().join("copy").join("b.flac"),
        &Fixture { md5, tags: &[("TITLE", "Second"), ("ARTIST", "Someone")], picture: None },
    );

    let library = scan(dir.path(), workers(3)).unwrap();
    assert_eq!(library.song_count(), 1);
}

#[test]
fn non_audio_files_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("notes.txt"), b"liner notes").unwrap();
    fs::write(dir.path().join("cover.jpg"), jfif_bytes()).unwrap();
    fs::write(dir.path().join("folder"), jfif_bytes()).unwrap();
    write_flac(
        &dir.path().join("song.flac"),
        &Fixture { md5: [0x22; 16], tags: &[("TITLE", "Only")], picture: None },
    );

    let library = scan(dir.path(), workers(1)).unwrap();
    assert_eq!(library.song_count(), 1);
    assert_eq!(library.art_count(), 0);
}

#[test]
fn shared_cover_art_is_stored_once() {
    let dir = tempfile::tempdir().unwrap();
    for (idx, name) in ["one.flac", "two.flac", "three.flac"].iter().enumerate() {
        write_flac(
            &dir.path().join(name),
            &Fixture { md5: [idx as u8 + 1; 16], tags: &[("ALBUM", "Shared")], picture: Some(PNG_COVER) },
        );
    }

    let library = scan(dir.path(), workers(2)).unwrap();
    assert_eq!(library.song_count(), 3);
    assert_eq!(library.art_count(), 1);

    let mut names = Vec::new();
    library
        .songs(|song| {
            names.push(song.art.clone());
            Ok::<(), ()>(())
        })
        .unwrap();
    assert!(names.iter().all(|name| name == &names[0]));
    assert!(names[0].ends_with(".png"));
    let art = library.find_art_file(&names[0]).unwrap();
    assert_eq!(art.data, PNG_COVER);
    assert_eq!(art.mime_type, "image/png");
}

#[test]
fn strict_checksums_reject_unset_md5() {
    let dir = tempfile::tempdir().unwrap();
    write_flac(
        &dir.path().join("unset.flac"),
        &Fixture { md5: [0; 16], tags: &[("TITLE", "Unset")], picture: None },
    );

    let result = scan(
        dir.path(),
        ScanOptions {
            workers: 1,
            strict_checksums: true,
        },
    );
    match result {
        Err(LibraryError::File(path, _)) => assert!(path.ends_with("unset.flac")),
        other => panic!("expected a file error, got {:?}", other.map(|l| l.song_count())),
    }
}

#[test]
fn missing_root_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let result = scan(&dir.path().join("nowhere"), workers(2));
    assert!(matches!(result, Err(LibraryError::Walk(_))));
}

#[test]
fn empty_root_scans_to_an_empty_library() {
    let dir = tempfile::tempdir().unwrap();
    let library = scan(dir.path(), workers(4)).unwrap();
    assert_eq!(library.song_count(), 0);
}

#[test]
fn load_or_scan_reuses_its_snapshot() {
    let music = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    write_flac(
        &music.path().join("kept.flac"),
        &Fixture { md5: [0x33; 16], tags: &[("TITLE", "Kept")], picture: Some(PNG_COVER) },
    );

    let mut options = LoadOptions::new(music.path().to_path_buf());
    options.workers = 2;
    options.snapshot = Some(state.path().join("library.snapshot"));
    let scanned = Library::load_or_scan(&options).unwrap();
    assert_eq!(scanned.song_count(), 1);
    assert!(state.path().join("library.snapshot").exists());

    // The tree is gone; only the snapshot can supply the song now.
    fs::remove_file(music.path().join("kept.flac")).unwrap();
    let restored = Library::load_or_scan(&options).unwrap();
    assert_eq!(restored, scanned);

    options.rescan = true;
    let rescanned = Library::load_or_scan(&options).unwrap();
    assert_eq!(rescanned.song_count(), 0);
}

#[test]
fn unset_md5_falls_back_to_the_audio_stream() {
    let dir = tempfile::tempdir().unwrap();
    let quiet = Frames { count: 3, level: 100 };
    let loud = Frames { count: 3, level: 9000 };
    write_flac_with_audio(
        &dir.path().join("a.flac"),
        &Fixture { md5: [0; 16], tags: &[("TITLE", "Take one")], picture: None },
        &quiet,
    );
    write_flac_with_audio(
        &dir.path().join("b.flac"),
        &Fixture { md5: [0; 16], tags: &[("TITLE", "Take two"), ("ARTIST", "Other")], picture: None },
        &quiet,
    );
    write_flac_with_audio(
        &dir.path().join("c.flac"),
        &Fixture { md5: [0; 16], tags: &[("TITLE", "Louder")], picture: None },
        &loud,
    );

    let library = scan(dir.path(), workers(2)).unwrap();
    assert_eq!(library.song_count(), 2);
    for song in all_songs(&library) {
        assert_eq!(song.file_type, FileType::Flac);
        assert_ne!(&song.hash.0[16..], FLAC_SIGNATURE);
    }
}

#[test]
fn retagged_wav_copies_collapse_into_one_song() {
    let dir = tempfile::tempdir().unwrap();
    let pcm: Vec<u8> = (0..17_640u32).map(|i| (i * 7 % 251) as u8).collect();
    write_file(&dir.path().join("take.wav"), &wav_bytes("Take", &pcm));
    write_file(&dir.path().join("copy").join("take.wav"), &wav_bytes("Retitled copy", &pcm));

    let library = scan(dir.path(), workers(2)).unwrap();
    assert_eq!(library.song_count(), 1);
    let song = &all_songs(&library)[0];
    assert_eq!(song.file_type, FileType::Wav);
    assert!(song.file.ends_with(".wav"));
}

#[cfg(unix)]
#[test]
fn symlinked_tracks_are_indexed() {
    let root = tempfile::tempdir().unwrap();
    let elsewhere = tempfile::tempdir().unwrap();
    let target = elsewhere.path().join("real.flac");
    write_flac(
        &target,
        &Fixture { md5: [0x44; 16], tags: &[("TITLE", "Linked")], picture: None },
    );
    let link = root.path().join("Album").join("linked.flac");
    fs::create_dir_all(link.parent().unwrap()).unwrap();
    std::os::unix::fs::symlink(&target, &link).unwrap();
    std::os::unix::fs::symlink(elsewhere.path().join("gone.flac"), root.path().join("dangling.flac")).unwrap();

    let library = scan(root.path(), workers(1)).unwrap();
    assert_eq!(library.song_count(), 1);
    let song = &all_songs(&library)[0];
    assert_eq!(song.path, link);
    assert_eq!(song.size, fs::metadata(&target).unwrap().len());
}
