//! Checksum computation for integrity verification.
//!
//! This module provides:
//! - Multiple checksum algorithms (CRC32, MD5, SHA-256, BLAKE3)
//! - A rolling digest fed block by block while a file is transferred
//! - File-level digests used to re-read and compare a destination

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::Digest;

/// Supported checksum algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumAlgorithm {
    /// CRC32 (fast, 32-bit)
    Crc32,
    /// MD5 (deprecated, but included for compatibility)
    Md5,
    /// SHA-256 (cryptographic, 256-bit)
    Sha256,
    /// BLAKE3 (modern, fast, 256-bit)
    Blake3,
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Crc32 => write!(f, "crc32"),
            Self::Md5 => write!(f, "md5"),
            Self::Sha256 => write!(f, "sha256"),
            Self::Blake3 => write!(f, "blake3"),
        }
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "crc32" => Ok(Self::Crc32),
            "md5" => Ok(Self::Md5),
            "sha256" => Ok(Self::Sha256),
            "blake3" => Ok(Self::Blake3),
            other => Err(format!(
                "unknown checksum algorithm '{}', expected crc32, md5, sha256 or blake3",
                other
            )),
        }
    }
}

/// A computed checksum value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumValue {
    algorithm: ChecksumAlgorithm,
    hex: String,
}

impl ChecksumValue {
    pub fn new(algorithm: ChecksumAlgorithm, hex: String) -> Self {
        ChecksumValue { algorithm, hex }
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }
}

impl fmt::Display for ChecksumValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

/// Digest state fed incrementally with the bytes of one file.
pub enum RollingDigest {
    Crc32(u32),
    Md5(md5::Context),
    Sha256(sha2::Sha256),
    Blake3(Box<blake3::Hasher>),
}

impl RollingDigest {
    pub fn new(algorithm: ChecksumAlgorithm) -> Self {
        match algorithm {
            ChecksumAlgorithm::Crc32 => RollingDigest::Crc32(0xffff_ffff),
            ChecksumAlgorithm::Md5 => RollingDigest::Md5(md5::Context::new()),
            ChecksumAlgorithm::Sha256 => RollingDigest::Sha256(sha2::Sha256::new()),
            ChecksumAlgorithm::Blake3 => RollingDigest::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        match self {
            RollingDigest::Crc32(_) => ChecksumAlgorithm::Crc32,
            RollingDigest::Md5(_) => ChecksumAlgorithm::Md5,
            RollingDigest::Sha256(_) => ChecksumAlgorithm::Sha256,
            RollingDigest::Blake3(_) => ChecksumAlgorithm::Blake3,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            RollingDigest::Crc32(crc) => *crc = crc32_update(*crc, data),
            RollingDigest::Md5(context) => context.consume(data),
            RollingDigest::Sha256(hasher) => hasher.update(data),
            RollingDigest::Blake3(hasher) => {
                hasher.update(data);
            }
        }
    }

    pub fn finalize(self) -> ChecksumValue {
        let algorithm = self.algorithm();
        let hex = match self {
            RollingDigest::Crc32(crc) => format!("{:08x}", crc ^ 0xffff_ffff),
            RollingDigest::Md5(context) => format!("{:x}", context.compute()),
            RollingDigest::Sha256(hasher) => format!("{:x}", hasher.finalize()),
            RollingDigest::Blake3(hasher) => hasher.finalize().to_hex().to_string(),
        };
        ChecksumValue::new(algorithm, hex)
    }
}

// Reflected CRC-32 (IEEE), bitwise.
fn crc32_update(mut crc: u32, data: &[u8]) -> u32 {
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            crc = if crc & 1 == 1 {
                (crc >> 1) ^ 0xedb8_8320
            } else {
                crc >> 1
            };
        }
    }
    crc
}

const READ_BLOCK: usize = 64 * 1024;

/// Feed `digest` with the first `len` bytes of `reader`.
///
/// Returns the number of bytes actually fed (less than `len` at end of file).
pub fn feed_prefix<R: Read>(reader: &mut R, len: u64, digest: &mut RollingDigest) -> io::Result<u64> {
    let mut buffer = vec![0u8; READ_BLOCK];
    let mut fed = 0u64;
    while fed < len {
        let want = (len - fed).min(READ_BLOCK as u64) as usize;
        let n = reader.read(&mut buffer[..want])?;
        if n == 0 {
            break;
        }
        digest.update(&buffer[..n]);
        fed += n as u64;
    }
    Ok(fed)
}

/// Compute the checksum of a whole file.
pub fn compute_file_checksum(path: &Path, algorithm: ChecksumAlgorithm) -> io::Result<ChecksumValue> {
    let mut file = File::open(path)?;
    let mut digest = RollingDigest::new(algorithm);
    feed_prefix(&mut file, u64::MAX, &mut digest)?;
    Ok(digest.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn digest_of(algorithm: ChecksumAlgorithm, data: &[u8]) -> ChecksumValue {
        let mut digest = RollingDigest::new(algorithm);
        digest.update(data);
        digest.finalize()
    }

    #[test]
    fn test_algorithm_display() {
        assert_eq!(ChecksumAlgorithm::Crc32.to_string(), "crc32");
        assert_eq!(ChecksumAlgorithm::Md5.to_string(), "md5");
        assert_eq!(ChecksumAlgorithm::Sha256.to_string(), "sha256");
        assert_eq!(ChecksumAlgorithm::Blake3.to_string(), "blake3");
    }

    #[test]
    fn test_algorithm_from_str() {
        assert_eq!("crc32".parse(), Ok(ChecksumAlgorithm::Crc32));
        assert_eq!("MD5".parse(), Ok(ChecksumAlgorithm::Md5));
        assert_eq!("sha256".parse(), Ok(ChecksumAlgorithm::Sha256));
        assert_eq!("blake3".parse(), Ok(ChecksumAlgorithm::Blake3));
        assert!("invalid".parse::<ChecksumAlgorithm>().is_err());
    }

    #[test]
    fn test_known_digests() {
        assert_eq!(digest_of(ChecksumAlgorithm::Crc32, b"hello").hex(), "3610a686");
        assert_eq!(
            digest_of(ChecksumAlgorithm::Md5, b"hello").hex(),
            "5d41402abc4b2a76b9719d911017c592"
        );
        assert_eq!(
            digest_of(ChecksumAlgorithm::Sha256, b"hello").hex(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_rolling_digest_matches_one_shot() {
        let mut rolling = RollingDigest::new(ChecksumAlgorithm::Blake3);
        rolling.update(b"hel");
        rolling.update(b"lo");
        assert_eq!(rolling.finalize(), digest_of(ChecksumAlgorithm::Blake3, b"hello"));
    }

    #[test]
    fn test_feed_prefix_stops_at_len() {
        let data = b"0123456789";
        let mut digest = RollingDigest::new(ChecksumAlgorithm::Sha256);
        let fed = feed_prefix(&mut &data[..], 4, &mut digest).expect("read from slice");
        assert_eq!(fed, 4);
        assert_eq!(digest.finalize(), digest_of(ChecksumAlgorithm::Sha256, b"0123"));
    }

    #[test]
    fn test_compute_file_checksum() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("file.bin");
        let mut file = File::create(&path).expect("Failed to create file");
        file.write_all(b"hello").expect("Failed to write file");
        drop(file);

        let value = compute_file_checksum(&path, ChecksumAlgorithm::Md5).expect("checksum");
        assert_eq!(value.algorithm(), ChecksumAlgorithm::Md5);
        assert_eq!(value.hex(), "5d41402abc4b2a76b9719d911017c592");
        assert_eq!(value.to_string(), "md5:5d41402abc4b2a76b9719d911017c592");
    }

    #[test]
    fn test_compute_checksum_of_missing_file_fails() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let result = compute_file_checksum(&temp_dir.path().join("missing"), ChecksumAlgorithm::Crc32);
        assert!(result.is_err());
    }
}
