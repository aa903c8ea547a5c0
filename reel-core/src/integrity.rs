//! Integrity: SHA-256 content hashes as lowercase hex, for chunks and assembled files.

use std::io::{self, Read};

use sha2::{Digest, Sha256};

/// Read buffer used when hashing streams.
pub const HASH_BUF_SIZE: usize = 8 * 1024;

/// Hash a byte slice. Returns the lowercase hex digest (64 chars).
pub fn hash_bytes(payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hex::encode(hasher.finalize())
}

/// Hash everything readable from `reader` in fixed-size steps.
pub fn hash_reader<R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; HASH_BUF_SIZE];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Compare a payload against an expected hex digest. Case-insensitive on the expectation.
pub fn verify_hex(payload: &[u8], expected: &str) -> bool {
    hash_bytes(payload).eq_ignore_ascii_case(expected.trim())
}
