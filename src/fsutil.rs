//! Small-file persistence helpers
//!
//! Catalog and manifest files are rewritten whole on every change. They use
//! a common frame and are replaced atomically through a temp file + rename.
//!
//! ## Frame
//! ```text
//! ┌──────────┬────────────┬─────────┬─────────┬──────────────┐
//! │Magic (4) │ Version(2) │ CRC (4) │ Len (4) │ bincode body │
//! └──────────┴────────────┴─────────┴─────────┴──────────────┘
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

const FRAME_HEADER: usize = 14;

/// Why a framed file could not be decoded
#[derive(Debug)]
pub(crate) enum FrameError {
    BadMagic,
    UnsupportedVersion(u16),
    Truncated,
    ChecksumMismatch,
    Body(String),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::BadMagic => write!(f, "bad magic"),
            FrameError::UnsupportedVersion(v) => write!(f, "unsupported version {}", v),
            FrameError::Truncated => write!(f, "truncated file"),
            FrameError::ChecksumMismatch => write!(f, "checksum mismatch"),
            FrameError::Body(e) => write!(f, "undecodable body: {}", e),
        }
    }
}

/// Atomically replace `path` with a framed encoding of `value`
pub(crate) fn write_framed<T: Serialize>(path: &Path, magic: &[u8; 4], version: u16, value: &T) -> Result<()> {
    let body = bincode::serialize(value)?;
    let mut buf = Vec::with_capacity(FRAME_HEADER + body.len());
    buf.extend_from_slice(magic);
    buf.extend_from_slice(&version.to_le_bytes());
    buf.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
    buf.extend_from_slice(&body);

    let tmp = path.with_extension("tmp");
    {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(&buf)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        sync_dir(parent)?;
    }
    Ok(())
}

/// Read a framed file; `Ok(None)` when it does not exist
pub(crate) fn read_framed<T: DeserializeOwned>(
    path: &Path,
    magic: &[u8; 4],
    version: u16,
) -> Result<Option<std::result::Result<T, FrameError>>> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(path)?;
    Ok(Some(decode_frame(&bytes, magic, version)))
}

fn decode_frame<T: DeserializeOwned>(bytes: &[u8], magic: &[u8; 4], version: u16) -> std::result::Result<T, FrameError> {
    if bytes.len() < FRAME_HEADER {
        return Err(FrameError::Truncated);
    }
    if &bytes[0..4] != magic {
        return Err(FrameError::BadMagic);
    }
    let found_version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if found_version != version {
        return Err(FrameError::UnsupportedVersion(found_version));
    }
    let crc = u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]);
    let len = u32::from_le_bytes([bytes[10], bytes[11], bytes[12], bytes[13]]) as usize;

    let body = &bytes[FRAME_HEADER..];
    if body.len() != len {
        return Err(FrameError::Truncated);
    }
    if crc32fast::hash(body) != crc {
        return Err(FrameError::ChecksumMismatch);
    }
    bincode::deserialize(body).map_err(|e| FrameError::Body(e.to_string()))
}

/// fsync a directory so renames and unlinks inside it are durable
pub(crate) fn sync_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        File::open(dir)?.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}
