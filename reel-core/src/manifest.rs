//! Manifest model: a title's chunk decomposition and hashes, plus the JSON and hash-listing codecs.

use serde::{Deserialize, Serialize};

/// One on-disk chunk file. `name` is unique within a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    pub name: String,
    pub size: u64,
    /// Lowercase hex SHA-256 of the chunk bytes.
    pub sha256: String,
}

impl ChunkDescriptor {
    pub fn new(name: impl Into<String>, size: u64, sha256: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size,
            sha256: sha256.into(),
        }
    }
}

/// Chunk listing for one title. Chunks are kept sorted by name; assembly order is this order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub file_name: String,
    pub file_size: u64,
    /// Hash of the assembled file; `None` while the seeder has no assembled copy.
    pub file_sha256: Option<String>,
    pub chunks: Vec<ChunkDescriptor>,
}

/// Error decoding or encoding a manifest.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("manifest json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("duplicate chunk name {0:?}")]
    DuplicateChunk(String),
}

impl Manifest {
    /// Build a manifest; chunks are re-sorted by name.
    pub fn new(
        file_name: impl Into<String>,
        file_size: u64,
        file_sha256: Option<String>,
        mut chunks: Vec<ChunkDescriptor>,
    ) -> Self {
        chunks.sort_by(|a, b| a.name.cmp(&b.name));
        Self {
            file_name: file_name.into(),
            file_size,
            file_sha256,
            chunks,
        }
    }

    /// Manifest for a title with no assembled copy: size is the sum of chunk sizes, no whole-file hash.
    pub fn from_chunks(file_name: impl Into<String>, chunks: Vec<ChunkDescriptor>) -> Self {
        let size = chunks.iter().map(|c| c.size).sum();
        Self::new(file_name, size, None, chunks)
    }

    pub fn chunk_bytes(&self) -> u64 {
        self.chunks.iter().map(|c| c.size).sum()
    }

    pub fn chunk(&self, name: &str) -> Option<&ChunkDescriptor> {
        self.chunks
            .binary_search_by(|c| c.name.as_str().cmp(name))
            .ok()
            .map(|i| &self.chunks[i])
    }

    /// Decode the wire form. Chunk order in the input does not matter.
    pub fn from_json(bytes: &[u8]) -> Result<Self, ManifestError> {
        let raw: Manifest = serde_json::from_slice(bytes)?;
        let m = Self::new(raw.file_name, raw.file_size, raw.file_sha256, raw.chunks);
        if let Some(dup) = m.chunks.windows(2).find(|w| w[0].name == w[1].name) {
            return Err(ManifestError::DuplicateChunk(dup[0].name.clone()));
        }
        Ok(m)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, ManifestError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Sidecar listing for this manifest's chunks (`hash  name` per line).
    pub fn to_hash_listing(&self) -> String {
        format_hash_listing(&self.chunks)
    }
}

/// One record of a hash-listing sidecar file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEntry {
    pub sha256: String,
    pub name: String,
}

/// Parse a `sha256sum`-style listing: `<hex>  <name>` per line. Malformed lines are skipped.
pub fn parse_hash_listing(text: &str) -> Vec<ListingEntry> {
    text.lines()
        .filter_map(|line| {
            let (hash, name) = line.split_once("  ")?;
            let hash = hash.trim();
            // sha256sum marks binary mode with a leading '*'
            let name = name.trim().trim_start_matches('*');
            if hash.is_empty() || name.is_empty() {
                return None;
            }
            Some(ListingEntry {
                sha256: hash.to_ascii_lowercase(),
                name: name.to_string(),
            })
        })
        .collect()
}

pub fn format_hash_listing(chunks: &[ChunkDescriptor]) -> String {
    let mut out = String::new();
    for c in chunks {
        out.push_str(&c.sha256);
        out.push_str("  ");
        out.push_str(&c.name);
        out.push('\n');
    }
    out
}
