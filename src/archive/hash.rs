//! SHA-256 hashing for archive payloads and files.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::Result;

/// Hex SHA-256 of a byte slice.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Hex SHA-256 of a file, streamed.
///
/// # Errors
///
/// Returns an I/O error if the file cannot be read.
pub fn file_sha256(path: &Path) -> Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sha256_hex_deterministic() {
        let hash1 = sha256_hex(b"decks");
        let hash2 = sha256_hex(b"decks");

        assert_eq!(hash1, hash2);
        assert_eq!(hash1.len(), 64); // SHA256 produces 64 hex chars
        assert_ne!(hash1, sha256_hex(b"matches"));
    }

    #[test]
    fn test_file_hash_matches_bytes() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("payload.bin");
        let bytes = vec![7u8; 20_000];
        std::fs::write(&path, &bytes).unwrap();

        assert_eq!(file_sha256(&path).unwrap(), sha256_hex(&bytes));
    }
}
