use std::fs::File;
use std::io::ErrorKind as IoErrorKind;

use common::CONTENT_HASH_LEN;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::MetadataError;

/// Hashes the demuxed packets of the default audio track. Tag blocks never
/// reach the packet stream, so retagging a file leaves the digest unchanged.
///
/// Reads through a cloned handle, which shares the caller's cursor; callers
/// rewind afterwards.
pub fn stream_digest(
    file: &File,
    extension: Option<&str>,
) -> Result<[u8; CONTENT_HASH_LEN], MetadataError> {
    let source = file.try_clone()?;
    let mss = MediaSourceStream::new(Box::new(source), Default::default());
    let mut hint = Hint::new();
    if let Some(ext) = extension {
        hint.with_extension(ext);
    }
    let probed = symphonia::default::get_probe().format(
        &hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;
    let mut format = probed.format;
    let track_id = format
        .default_track()
        .map(|track| track.id)
        .ok_or(MetadataError::Unsupported("no default audio track"))?;

    let mut hasher = blake3::Hasher::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(err)) if err.kind() == IoErrorKind::UnexpectedEof => break,
            Err(SymphoniaError::ResetRequired) => {
                return Err(MetadataError::Unsupported("stream reset required"));
            }
            Err(err) => return Err(err.into()),
        };
        if packet.track_id() != track_id {
            continue;
        }
        hasher.update(packet.buf());
    }

    let mut digest = [0u8; CONTENT_HASH_LEN];
    hasher.finalize_xof().fill(&mut digest);
    Ok(digest)
}
