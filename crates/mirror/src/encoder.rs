use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Instant;

use tracing::info;

use crate::MirrorError;

pub const DEFAULT_ENCODER: &str = "opusenc";
pub const DEFAULT_BITRATE_KBPS: u32 = 256;

/// Extension given to transcoded copies on the destination.
pub const TRANSCODED_EXTENSION: &str = "opus";

/// Turns one source file into the bytes written to the destination. Called
/// from several sync workers at once.
pub trait Transcoder: Sync {
    fn transcode(&self, input: &Path) -> Result<Vec<u8>, MirrorError>;
}

/// Runs `<program> --bitrate <kbps> <input> -` and keeps its stdout.
#[derive(Clone, Debug)]
pub struct ExternalEncoder {
    pub program: String,
    pub bitrate_kbps: u32,
}

impl Default for ExternalEncoder {
    fn default() -> Self {
        Self {
            program: DEFAULT_ENCODER.to_string(),
            bitrate_kbps: DEFAULT_BITRATE_KBPS,
        }
    }
}

impl Transcoder for ExternalEncoder {
    fn transcode(&self, input: &Path) -> Result<Vec<u8>, MirrorError> {
        let start = Instant::now();
        let output = Command::new(&self.program)
            .arg("--bitrate")
            .arg(self.bitrate_kbps.to_string())
            .arg(input)
            .arg("-")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()?;
        if !output.status.success() {
            return Err(MirrorError::Encoder {
                program: self.program.clone(),
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        info!(
            "Encoded {} bytes from {:?} in {:?}",
            output.stdout.len(),
            input,
            start.elapsed()
        );
        Ok(output.stdout)
    }
}
