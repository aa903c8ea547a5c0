//! Chunk diffing: decide which manifest chunks are already satisfied locally and batch the rest.

use crate::manifest::{ChunkDescriptor, Manifest};

/// Default number of concurrent chunk downloads per batch.
pub const DEFAULT_PARALLELISM: usize = 3;

/// What is on disk in a chunk slot: byte length and content hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalChunk {
    pub len: u64,
    pub sha256: String,
}

/// A chunk is satisfied iff the slot exists, its length matches, and its hash matches.
pub fn is_satisfied(desc: &ChunkDescriptor, local: Option<&LocalChunk>) -> bool {
    match local {
        Some(l) => l.len == desc.size && l.sha256.eq_ignore_ascii_case(&desc.sha256),
        None => false,
    }
}

/// Chunks of `manifest` that are not satisfied, in manifest (name) order.
/// `inspect` reports the local slot for a descriptor, or `None` when absent.
pub fn missing_chunks<'a, F>(manifest: &'a Manifest, mut inspect: F) -> Vec<&'a ChunkDescriptor>
where
    F: FnMut(&ChunkDescriptor) -> Option<LocalChunk>,
{
    manifest
        .chunks
        .iter()
        .filter(|desc| !is_satisfied(desc, inspect(desc).as_ref()))
        .collect()
}

/// Split missing chunks into batches of `parallelism` (0 is treated as 1).
pub fn plan_batches<T: Clone>(missing: &[T], parallelism: usize) -> Vec<Vec<T>> {
    missing
        .chunks(parallelism.max(1))
        .map(|b| b.to_vec())
        .collect()
}

/// The part of one chunk covered by a byte range over the name-ordered concatenation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
    pub index: usize,
    pub offset: u64,
    pub len: u64,
}

/// Map `len` bytes starting at `start` of the concatenated chunks onto per-chunk spans.
pub fn chunk_spans(sizes: &[u64], start: u64, len: u64) -> Vec<ChunkSpan> {
    let end = start.saturating_add(len);
    let mut spans = Vec::new();
    let mut base = 0u64;
    for (index, &size) in sizes.iter().enumerate() {
        let chunk_end = base + size;
        if chunk_end > start && base < end {
            let from = start.max(base);
            let to = end.min(chunk_end);
            spans.push(ChunkSpan {
                index,
                offset: from - base,
                len: to - from,
            });
        }
        if chunk_end >= end {
            break;
        }
        base = chunk_end;
    }
    spans
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::hash_bytes;

    fn desc() -> ChunkDescriptor {
        ChunkDescriptor::new("part0", 5, hash_bytes(b"hello"))
    }

    #[test]
    fn satisfied_requires_all_three() {
        let d = desc();
        let good = LocalChunk { len: 5, sha256: hash_bytes(b"hello") };
        assert!(is_satisfied(&d, Some(&good)));
        // exists flipped
        assert!(!is_satisfied(&d, None));
        // length flipped
        let short = LocalChunk { len: 4, ..good.clone() };
        assert!(!is_satisfied(&d, Some(&short)));
        // hash flipped
        let wrong = LocalChunk { len: 5, sha256: hash_bytes(b"world") };
        assert!(!is_satisfied(&d, Some(&wrong)));
    }

    #[test]
    fn satisfied_ignores_hash_case() {
        let d = desc();
        let upper = LocalChunk { len: 5, sha256: hash_bytes(b"hello").to_uppercase() };
        assert!(is_satisfied(&d, Some(&upper)));
    }

    #[test]
    fn missing_in_name_order() {
        let m = Manifest::from_chunks(
            "t",
            vec![
                ChunkDescriptor::new("c", 1, hash_bytes(b"c")),
                ChunkDescriptor::new("a", 1, hash_bytes(b"a")),
                ChunkDescriptor::new("b", 1, hash_bytes(b"b")),
            ],
        );
        let missing = missing_chunks(&m, |d| {
            (d.name == "b").then(|| LocalChunk { len: 1, sha256: hash_bytes(b"b") })
        });
        let names: Vec<_> = missing.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["a", "c"]);
    }

    #[test]
    fn batches_are_bounded() {
        let items: Vec<u32> = (0..7).collect();
        let b = plan_batches(&items, 3);
        assert_eq!(b, vec![vec![0, 1, 2], vec![3, 4, 5], vec![6]]);
        assert_eq!(plan_batches(&items, 0).len(), 7);
        assert!(plan_batches::<u32>(&[], 3).is_empty());
    }

    #[test]
    fn spans_cross_chunk_boundaries() {
        let span = |index, offset, len| ChunkSpan { index, offset, len };
        let sizes = [5, 5, 5];
        assert_eq!(chunk_spans(&sizes, 3, 9), [span(0, 3, 2), span(1, 0, 5), span(2, 0, 2)]);
        assert_eq!(chunk_spans(&sizes, 5, 5), [span(1, 0, 5)]);
        assert_eq!(chunk_spans(&sizes, 0, 15).len(), 3);
        assert_eq!(chunk_spans(&[0, 4], 0, 4), [span(1, 0, 4)]);
        assert!(chunk_spans(&sizes, 0, 0).is_empty());
    }
}
