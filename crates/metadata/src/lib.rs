mod digest;

use std::fs::File;
use std::io::{BufReader, ErrorKind as IoErrorKind};

use common::{FileType, TagFormat};
use lofty::error::{ErrorKind, LoftyError};
use lofty::file::FileType as LoftyFileType;
use lofty::picture::{Picture, PictureType};
use lofty::prelude::{ItemKey, TaggedFileExt};
use lofty::probe::Probe;
use lofty::tag::TagType;

pub use digest::stream_digest;

#[derive(Debug, Default, Clone)]
pub struct TagInfo {
    pub artist: Option<String>,
    pub album_artist: Option<String>,
    pub album: Option<String>,
    pub composer: Option<String>,
    pub title: Option<String>,
    pub comment: Option<String>,
    pub track_no: Option<u16>,
    pub disc_no: Option<u16>,
    pub date: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CoverArt {
    pub data: Vec<u8>,
    pub mime: Option<String>,
    pub ext: Option<String>,
}

/// What the tag reader reports for a recognised audio file.
#[derive(Debug, Clone)]
pub struct AudioInfo {
    pub tags: TagInfo,
    pub file_type: FileType,
    pub tag_format: TagFormat,
    pub cover: Option<CoverArt>,
}

#[derive(Debug)]
pub enum MetadataError {
    Io(std::io::Error),
    Lofty(LoftyError),
    Symphonia(symphonia::core::errors::Error),
    Unsupported(&'static str),
}

impl std::fmt::Display for MetadataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetadataError::Io(err) => write!(f, "io error: {}", err),
            MetadataError::Lofty(err) => write!(f, "tag error: {}", err),
            MetadataError::Symphonia(err) => write!(f, "decode error: {}", err),
            MetadataError::Unsupported(what) => write!(f, "unsupported stream: {}", what),
        }
    }
}

impl std::error::Error for MetadataError {}

impl From<std::io::Error> for MetadataError {
    fn from(err: std::io::Error) -> Self {
        MetadataError::Io(err)
    }
}

impl From<LoftyError> for MetadataError {
    fn from(err: LoftyError) -> Self {
        MetadataError::Lofty(err)
    }
}

impl From<symphonia::core::errors::Error> for MetadataError {
    fn from(err: symphonia::core::errors::Error) -> Self {
        MetadataError::Symphonia(err)
    }
}

/// Reads tags from an open file. `Ok(None)` means the content is not a
/// recognised audio format, which callers skip silently. A known audio
/// extension picks the format; anything else is sniffed from the content.
pub fn read_audio(file: &File, extension: Option<&str>) -> Result<Option<AudioInfo>, MetadataError> {
    let probe = Probe::new(BufReader::new(file));
    let probe = match extension.and_then(LoftyFileType::from_ext) {
        Some(file_type) => probe.set_file_type(file_type),
        None => probe.guess_file_type()?,
    };
    if probe.file_type().is_none() {
        return Ok(None);
    }
    let tagged_file = match probe.read() {
        Ok(tagged_file) => tagged_file,
        Err(err) if is_not_audio(&err) => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    let file_type = map_file_type(&tagged_file.file_type());
    let mut info = AudioInfo {
        tags: TagInfo::default(),
        file_type,
        tag_format: TagFormat::None,
        cover: None,
    };

    if let Some(tag) = tagged_file.primary_tag().or_else(|| tagged_file.first_tag()) {
        info.tag_format = map_tag_format(tag.tag_type());
        let tags = &mut info.tags;
        tags.title = tag.get_string(&ItemKey::TrackTitle).map(|v| v.to_string());
        tags.album = tag.get_string(&ItemKey::AlbumTitle).map(|v| v.to_string());
        tags.artist = tag.get_string(&ItemKey::TrackArtist).map(|v| v.to_string());
        tags.album_artist = tag.get_string(&ItemKey::AlbumArtist).map(|v| v.to_string());
        tags.composer = tag.get_string(&ItemKey::Composer).map(|v| v.to_string());
        tags.comment = tag.get_string(&ItemKey::Comment).map(|v| v.to_string());
        tags.track_no = tag.get_string(&ItemKey::TrackNumber).and_then(parse_u16);
        tags.disc_no = tag.get_string(&ItemKey::DiscNumber).and_then(parse_u16);
        tags.date = pick_date(
            tag.get_string(&ItemKey::RecordingDate),
            tag.get_string(&ItemKey::Year),
        );
        info.cover = pick_picture(tag.pictures()).map(cover_from_picture);
    }

    Ok(Some(info))
}

// Content that fails to parse as the probed format is not audio. Only
// genuine read failures are errors.
fn is_not_audio(err: &LoftyError) -> bool {
    match err.kind() {
        ErrorKind::Io(io) => matches!(
            io.kind(),
            IoErrorKind::InvalidInput | IoErrorKind::InvalidData | IoErrorKind::UnexpectedEof
        ),
        _ => true,
    }
}

fn map_file_type(file_type: &LoftyFileType) -> FileType {
    match file_type {
        LoftyFileType::Flac => FileType::Flac,
        LoftyFileType::Mpeg => FileType::Mp3,
        LoftyFileType::Mp4 => FileType::M4a,
        LoftyFileType::Vorbis => FileType::Ogg,
        LoftyFileType::Opus => FileType::Opus,
        LoftyFileType::Aac => FileType::Aac,
        LoftyFileType::Wav => FileType::Wav,
        LoftyFileType::Aiff => FileType::Aiff,
        LoftyFileType::Ape => FileType::Ape,
        LoftyFileType::WavPack => FileType::WavPack,
        LoftyFileType::Mpc => FileType::Mpc,
        LoftyFileType::Speex => FileType::Speex,
        _ => FileType::Unknown,
    }
}

fn map_tag_format(tag_type: TagType) -> TagFormat {
    match tag_type {
        TagType::Id3v1 => TagFormat::Id3v1,
        TagType::Id3v2 => TagFormat::Id3v2,
        TagType::VorbisComments => TagFormat::Vorbis,
        TagType::Mp4Ilst => TagFormat::Mp4,
        TagType::Ape => TagFormat::Ape,
        TagType::RiffInfo => TagFormat::RiffInfo,
        TagType::AiffText => TagFormat::AiffText,
        _ => TagFormat::None,
    }
}

fn parse_u16(text: &str) -> Option<u16> {
    let head = text.split('/').next().unwrap_or(text).trim();
    head.parse().ok()
}

fn parse_year(text: &str) -> Option<i32> {
    let mut digits = String::new();
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            if digits.len() == 4 {
                break;
            }
        } else if !digits.is_empty() {
            break;
        }
    }
    if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    }
}

// Full dates win; a bare positive year is the fallback.
fn pick_date(recording_date: Option<&str>, year: Option<&str>) -> Option<String> {
    if let Some(date) = recording_date.map(str::trim) {
        if date.len() >= 4 {
            return Some(date.to_string());
        }
    }
    year.and_then(parse_year)
        .filter(|year| *year > 0)
        .map(|year| year.to_string())
}

fn pick_picture(pictures: &[Picture]) -> Option<&Picture> {
    for picture in pictures {
        if picture.pic_type() == PictureType::CoverFront {
            return Some(picture);
        }
    }
    pictures.first()
}

fn cover_from_picture(picture: &Picture) -> CoverArt {
    let data = picture.data().to_vec();
    let mime = guess_mime(&data);
    let ext = mime.as_deref().and_then(ext_for_mime);
    CoverArt { data, mime, ext }
}

fn guess_mime(bytes: &[u8]) -> Option<String> {
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg".to_string())
    } else if bytes.starts_with(&[0x89, 0x50, 0x4E, 0x47]) {
        Some("image/png".to_string())
    } else if bytes.starts_with(b"GIF8") {
        Some("image/gif".to_string())
    } else if bytes.starts_with(b"BM") {
        Some("image/bmp".to_string())
    } else {
        None
    }
}

fn ext_for_mime(mime: &str) -> Option<String> {
    let ext = match mime {
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/gif" => "gif",
        "image/bmp" => "bmp",
        _ => return None,
    };
    Some(ext.to_string())
}
