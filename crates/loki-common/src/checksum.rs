//! Streaming digests and file fingerprints

use crate::error::Result;
use crate::types::{ChecksumAlgorithm, FileFingerprint};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;
use std::time::UNIX_EPOCH;

const BUFFER_SIZE: usize = 64 * 1024;

/// Digest any readable source without loading it into memory
pub fn compute_checksum<R: Read>(reader: &mut R, algorithm: ChecksumAlgorithm) -> Result<String> {
    let mut buffer = vec![0u8; BUFFER_SIZE];
    match algorithm {
        ChecksumAlgorithm::Md5 => {
            let mut ctx = md5::Context::new();
            loop {
                let n = reader.read(&mut buffer)?;
                if n == 0 {
                    break;
                }
                ctx.consume(&buffer[..n]);
            }
            Ok(format!("{:x}", ctx.compute()))
        },
        ChecksumAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            loop {
                let n = reader.read(&mut buffer)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buffer[..n]);
            }
            Ok(hex::encode(hasher.finalize()))
        },
    }
}

pub fn compute_file_checksum(
    path: impl AsRef<Path>,
    algorithm: ChecksumAlgorithm,
) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    compute_checksum(&mut file, algorithm)
}

/// Digest of an in-memory byte string (used for composite content hashes)
pub fn digest_bytes(data: &[u8], algorithm: ChecksumAlgorithm) -> String {
    match algorithm {
        ChecksumAlgorithm::Md5 => format!("{:x}", md5::compute(data)),
        ChecksumAlgorithm::Sha256 => hex::encode(Sha256::digest(data)),
    }
}

/// Fingerprint a file: size, mtime (unix seconds) and md5.
///
/// `filename` is the name recorded in the fingerprint, normally the path
/// relative to the download directory.
pub fn fingerprint_file(path: impl AsRef<Path>, filename: &str) -> Result<FileFingerprint> {
    let path = path.as_ref();
    let metadata = std::fs::metadata(path)?;
    let modified = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    Ok(FileFingerprint {
        filename: filename.to_string(),
        size: metadata.len() as i64,
        modified,
        md5: compute_file_checksum(path, ChecksumAlgorithm::Md5)?,
    })
}
