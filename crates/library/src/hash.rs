use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use common::{ContentHash, FileType, CONTENT_HASH_LEN};
use metadata::{stream_digest, MetadataError};

/// First four bytes of every FLAC file. Doubles as the suffix that pads a
/// STREAMINFO MD5 out to `CONTENT_HASH_LEN`.
pub const FLAC_SIGNATURE: &[u8; 4] = b"fLaC";

// Signature (4) + metadata block header (4) + STREAMINFO fields before the
// MD5 (18).
const FLAC_MD5_OFFSET: u64 = 26;
const FLAC_MD5_LEN: usize = 16;

#[derive(Debug)]
pub enum HashError {
    Io(std::io::Error),
    NotFlac,
    /// STREAMINFO carries an all zero MD5, which some encoders write when
    /// they never computed one.
    MissingChecksum,
    Digest(MetadataError),
}

impl std::fmt::Display for HashError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HashError::Io(err) => write!(f, "io error: {}", err),
            HashError::NotFlac => write!(f, "not a flac file"),
            HashError::MissingChecksum => {
                write!(f, "flac file has no MD5 checksum in its STREAMINFO block")
            }
            HashError::Digest(err) => write!(f, "digest error: {}", err),
        }
    }
}

impl std::error::Error for HashError {}

impl From<std::io::Error> for HashError {
    fn from(err: std::io::Error) -> Self {
        HashError::Io(err)
    }
}

impl From<MetadataError> for HashError {
    fn from(err: MetadataError) -> Self {
        HashError::Digest(err)
    }
}

/// Identity of the audio in `file`. FLAC reuses the encoder's STREAMINFO MD5;
/// everything else is digested in full. The file is rewound before
/// returning.
pub fn content_hash(
    file: &mut File,
    file_type: FileType,
    extension: Option<&str>,
) -> Result<ContentHash, HashError> {
    match file_type {
        FileType::Flac => flac_checksum_hash(file),
        _ => stream_hash(file, extension),
    }
}

pub fn stream_hash(file: &mut File, extension: Option<&str>) -> Result<ContentHash, HashError> {
    let result = digest_from_start(file, extension);
    let _ = file.seek(SeekFrom::Start(0));
    result
}

fn digest_from_start(file: &mut File, extension: Option<&str>) -> Result<ContentHash, HashError> {
    file.seek(SeekFrom::Start(0))?;
    Ok(ContentHash(stream_digest(file, extension)?))
}

pub fn flac_checksum_hash<R: Read + Seek>(reader: &mut R) -> Result<ContentHash, HashError> {
    let result = read_flac_md5(reader);
    let _ = reader.seek(SeekFrom::Start(0));
    result
}

fn read_flac_md5<R: Read + Seek>(reader: &mut R) -> Result<ContentHash, HashError> {
    let mut buffer = [0u8; CONTENT_HASH_LEN];

    reader.seek(SeekFrom::Start(0))?;
    reader.read_exact(&mut buffer[..FLAC_SIGNATURE.len()])?;
    if &buffer[..FLAC_SIGNATURE.len()] != FLAC_SIGNATURE {
        return Err(HashError::NotFlac);
    }

    reader.seek(SeekFrom::Start(FLAC_MD5_OFFSET))?;
    reader.read_exact(&mut buffer[..FLAC_MD5_LEN])?;
    if buffer[..FLAC_MD5_LEN].iter().all(|b| *b == 0) {
        return Err(HashError::MissingChecksum);
    }

    buffer[FLAC_MD5_LEN..].copy_from_slice(FLAC_SIGNATURE);
    Ok(ContentHash(buffer))
}
