use std::fmt;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512_256};

/// Length of a song identity: a 20 byte stream digest, or a 16 byte FLAC MD5
/// followed by the 4 byte `fLaC` marker.
pub const CONTENT_HASH_LEN: usize = 20;
pub const PICTURE_HASH_LEN: usize = 32;

/// Metadata agnostic identity of a song's audio content.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentHash(pub [u8; CONTENT_HASH_LEN]);

impl ContentHash {
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; CONTENT_HASH_LEN]>::try_from(bytes).ok().map(Self)
    }

    /// Reverses `song_file_name` / `meta_file_name`.
    pub fn from_file_name(name: &str) -> Option<Self> {
        extract_hash(name).and_then(|bytes| Self::from_slice(&bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn encoded(&self) -> String {
        encode_hash(&self.0)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.encoded())
    }
}

/// SHA-512/256 of raw artwork bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PictureHash(pub [u8; PICTURE_HASH_LEN]);

impl PictureHash {
    pub fn of(data: &[u8]) -> Self {
        Self(Sha512_256::digest(data).into())
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; PICTURE_HASH_LEN]>::try_from(bytes).ok().map(Self)
    }

    pub fn from_file_name(name: &str) -> Option<Self> {
        extract_hash(name).and_then(|bytes| Self::from_slice(&bytes))
    }

    pub fn encoded(&self) -> String {
        encode_hash(&self.0)
    }
}

impl fmt::Display for PictureHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded())
    }
}

impl fmt::Debug for PictureHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PictureHash({})", self.encoded())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FileType {
    Flac,
    Mp3,
    M4a,
    Ogg,
    Opus,
    Aac,
    Wav,
    Aiff,
    Ape,
    WavPack,
    Mpc,
    Speex,
    Unknown,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Flac => "FLAC",
            FileType::Mp3 => "MP3",
            FileType::M4a => "M4A",
            FileType::Ogg => "OGG",
            FileType::Opus => "OPUS",
            FileType::Aac => "AAC",
            FileType::Wav => "WAV",
            FileType::Aiff => "AIFF",
            FileType::Ape => "APE",
            FileType::WavPack => "WAVPACK",
            FileType::Mpc => "MPC",
            FileType::Speex => "SPEEX",
            FileType::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The tag container the metadata was read from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagFormat {
    Id3v1,
    Id3v2,
    Vorbis,
    Mp4,
    Ape,
    RiffInfo,
    AiffText,
    None,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Song {
    /// Public audio file name, `hash.ext`.
    pub file: String,
    /// Public metadata file name, `hash.json`.
    pub meta_file: String,
    pub size: u64,
    pub modified_secs: u64,
    pub album: String,
    pub artist: String,
    pub album_artist: String,
    pub composer: String,
    pub title: String,
    /// 0 when untagged.
    pub track: u16,
    /// 0 when untagged.
    pub disc: u16,
    /// Artwork file name, empty when the song has none.
    pub art: String,
    pub comment: String,
    pub file_type: FileType,
    /// One hopes this is ISO-8601; albums are ordered by it.
    pub date: String,
    pub path: PathBuf,
    pub hash: ContentHash,
    pub tag_format: TagFormat,
}

#[derive(Serialize)]
struct PublicSong<'a> {
    file: &'a str,
    meta_file: &'a str,
    size: u64,
    mod_time: u64,
    album: &'a str,
    artist: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    album_artist: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    composer: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    title: &'a str,
    track: u16,
    #[serde(skip_serializing_if = "is_zero")]
    disc: u16,
    #[serde(skip_serializing_if = "str::is_empty")]
    art: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    comment: &'a str,
    file_type: FileType,
    #[serde(skip_serializing_if = "str::is_empty")]
    date: &'a str,
}

fn is_zero(value: &u16) -> bool {
    *value == 0
}

impl Song {
    /// The document served as `meta_file`. Filesystem path, hash and tag
    /// format stay private.
    pub fn public_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&PublicSong {
            file: &self.file,
            meta_file: &self.meta_file,
            size: self.size,
            mod_time: self.modified_secs,
            album: &self.album,
            artist: &self.artist,
            album_artist: &self.album_artist,
            composer: &self.composer,
            title: &self.title,
            track: self.track,
            disc: self.disc,
            art: &self.art,
            comment: &self.comment,
            file_type: self.file_type,
            date: &self.date,
        })
    }

    /// Album artist when tagged, track artist otherwise.
    pub fn display_artist(&self) -> &str {
        if self.album_artist.is_empty() {
            &self.artist
        } else {
            &self.album_artist
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artwork {
    pub data: Vec<u8>,
    /// Without the leading dot; may be empty.
    pub ext: String,
    pub mime_type: String,
}

impl Artwork {
    pub fn hash(&self) -> PictureHash {
        PictureHash::of(&self.data)
    }

    pub fn file_name(&self) -> String {
        art_file_name(&self.hash(), &self.ext)
    }
}

pub fn encode_hash(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn song_file_name(hash: &ContentHash, path: &Path) -> String {
    let mut name = hash.encoded();
    if let Some(ext) = path.extension() {
        name.push('.');
        name.push_str(&ext.to_string_lossy());
    }
    name
}

pub fn meta_file_name(hash: &ContentHash) -> String {
    format!("{}.json", hash.encoded())
}

pub fn art_file_name(hash: &PictureHash, ext: &str) -> String {
    if ext.is_empty() {
        hash.encoded()
    } else {
        format!("{}.{}", hash.encoded(), ext)
    }
}

/// Strips a trailing extension and decodes the unpadded url-safe base64
/// remainder. `None` means "not found" to every caller.
pub fn extract_hash(file_name: &str) -> Option<Vec<u8>> {
    let encoded = match file_name.rfind('.') {
        Some(idx) => &file_name[..idx],
        None => file_name,
    };
    if encoded.is_empty() {
        return None;
    }
    URL_SAFE_NO_PAD.decode(encoded.trim_end_matches('=')).ok()
}

pub fn relpath_from(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    Some(path_to_slash_string(rel))
}

pub fn join_relpath(root: &Path, relpath: &str) -> PathBuf {
    let mut out = PathBuf::from(root);
    for part in relpath.split('/') {
        if part.is_empty() {
            continue;
        }
        out.push(part);
    }
    out
}

fn path_to_slash_string(path: &Path) -> String {
    let parts: Vec<String> = path
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    parts.join("/")
}
