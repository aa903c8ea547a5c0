//! On-disk chunk store: `{base}/{title}` (assembled), `{base}/{title}.tmp` (in progress),
//! `{base}/{title}_chunks/` (chunk files plus hash-listing and JSON manifest sidecars).

use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use reel_core::manifest::parse_hash_listing;
use reel_core::{hash_reader, ChunkDescriptor, LocalChunk, Manifest};
use tracing::{debug, warn};

pub const CHUNKS_DIR_SUFFIX: &str = "_chunks";
pub const LISTING_SUFFIX: &str = "_manifest.sha256";
pub const JSON_MANIFEST_SUFFIX: &str = "_manifest.json";
pub const ASSEMBLY_SUFFIX: &str = ".assembly_tmp";
const PARTIAL_CHUNK_SUFFIX: &str = ".partial";

/// Reject names that could escape the media directory.
pub fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}

/// Hash a file in 8 KiB steps.
pub fn hash_file(path: &Path) -> io::Result<String> {
    hash_reader(File::open(path)?)
}

/// Assembled-file hashes keyed by path, invalidated when length or mtime changes.
#[derive(Default)]
pub struct FileHashCache {
    entries: Mutex<HashMap<PathBuf, (u64, SystemTime, String)>>,
}

impl FileHashCache {
    pub fn hash(&self, path: &Path) -> io::Result<String> {
        let meta = fs::metadata(path)?;
        let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        if let Ok(entries) = self.entries.lock() {
            if let Some((len, t, h)) = entries.get(path) {
                if *len == meta.len() && *t == mtime {
                    return Ok(h.clone());
                }
            }
        }
        let h = hash_file(path)?;
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(path.to_path_buf(), (meta.len(), mtime, h.clone()));
        }
        Ok(h)
    }
}

/// Filesystem layout for one media directory. Methods block; async callers use `spawn_blocking`.
#[derive(Debug, Clone)]
pub struct ChunkStore {
    base: PathBuf,
}

impl ChunkStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base
    }

    pub fn chunks_dir(&self, title: &str) -> PathBuf {
        self.base.join(format!("{title}{CHUNKS_DIR_SUFFIX}"))
    }

    pub fn chunk_path(&self, title: &str, chunk: &str) -> PathBuf {
        self.chunks_dir(title).join(chunk)
    }

    pub fn listing_path(&self, title: &str) -> PathBuf {
        self.chunks_dir(title).join(format!("{title}{LISTING_SUFFIX}"))
    }

    pub fn json_manifest_path(&self, title: &str) -> PathBuf {
        self.chunks_dir(title).join(format!("{title}{JSON_MANIFEST_SUFFIX}"))
    }

    pub fn assembled_path(&self, title: &str) -> PathBuf {
        self.base.join(title)
    }

    fn assembly_tmp_path(&self, title: &str) -> PathBuf {
        self.base.join(format!("{title}{ASSEMBLY_SUFFIX}"))
    }

    /// Length and hash of a chunk slot, or `None` if absent. The hash is only computed when
    /// the length matches the descriptor; otherwise it is left empty (the slot is unsatisfied anyway).
    pub fn inspect_chunk(&self, title: &str, desc: &ChunkDescriptor) -> io::Result<Option<LocalChunk>> {
        let path = self.chunk_path(title, &desc.name);
        let meta = match fs::metadata(&path) {
            Ok(m) if m.is_file() => m,
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let sha256 = if meta.len() == desc.size {
            hash_file(&path)?
        } else {
            String::new()
        };
        Ok(Some(LocalChunk { len: meta.len(), sha256 }))
    }

    /// Write verified chunk bytes into the slot via a temporary sibling and rename.
    pub fn write_chunk(&self, title: &str, chunk: &str, bytes: &[u8]) -> io::Result<()> {
        let dir = self.chunks_dir(title);
        fs::create_dir_all(&dir)?;
        let tmp = dir.join(format!(".{chunk}{PARTIAL_CHUNK_SUFFIX}"));
        {
            let mut f = File::create(&tmp)?;
            f.write_all(bytes)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, dir.join(chunk))
    }

    /// Persist a fetched manifest as both sidecars so this node can seed the title.
    pub fn save_manifest(&self, title: &str, manifest: &Manifest) -> io::Result<()> {
        fs::create_dir_all(self.chunks_dir(title))?;
        fs::write(self.listing_path(title), manifest.to_hash_listing())?;
        let json = manifest
            .to_json()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(self.json_manifest_path(title), json)
    }

    /// True when either sidecar exists for `title`.
    pub fn has_manifest(&self, title: &str) -> bool {
        self.json_manifest_path(title).is_file() || self.listing_path(title).is_file()
    }

    /// The chunk layout recorded for `title`, whether or not the chunks are stored yet.
    /// Prefers the JSON sidecar; a hash listing carries no sizes, so its absent chunks are dropped.
    pub fn planned_manifest(&self, title: &str) -> io::Result<Option<Manifest>> {
        if !is_safe_name(title) || !self.chunks_dir(title).is_dir() {
            return Ok(None);
        }
        let json_path = self.json_manifest_path(title);
        if json_path.is_file() {
            match fs::read(&json_path).map(|b| Manifest::from_json(&b)) {
                Ok(Ok(m)) if m.chunks.iter().all(|c| is_safe_name(&c.name)) => return Ok(Some(m)),
                Ok(Ok(_)) => warn!(title, "unsafe chunk name in json manifest"),
                Ok(Err(e)) => warn!(title, error = %e, "ignoring unreadable json manifest"),
                Err(e) => warn!(title, error = %e, "ignoring unreadable json manifest"),
            }
        }
        let listing = match fs::read_to_string(self.listing_path(title)) {
            Ok(s) => s,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let mut chunks = Vec::new();
        for entry in parse_hash_listing(&listing) {
            if !is_safe_name(&entry.name) {
                warn!(title, chunk = %entry.name, "unsafe chunk name in listing");
                continue;
            }
            match fs::metadata(self.chunk_path(title, &entry.name)) {
                Ok(m) if m.is_file() => {
                    chunks.push(ChunkDescriptor::new(entry.name, m.len(), entry.sha256));
                }
                _ => warn!(title, chunk = %entry.name, "listed chunk missing on disk, omitted"),
            }
        }
        Ok(Some(Manifest::from_chunks(title, chunks)))
    }

    /// The manifest this node can actually serve for `title`: only chunks stored at their
    /// recorded size, and a whole-file hash only when the assembled file exists.
    /// `None` when no sidecar exists or nothing of the title is stored.
    pub fn build_manifest(&self, title: &str, hashes: &FileHashCache) -> io::Result<Option<Manifest>> {
        let Some(planned) = self.planned_manifest(title)? else {
            return Ok(None);
        };
        let chunks: Vec<ChunkDescriptor> = planned
            .chunks
            .into_iter()
            .filter(|c| match fs::metadata(self.chunk_path(title, &c.name)) {
                Ok(m) => m.is_file() && m.len() == c.size,
                Err(_) => false,
            })
            .collect();
        let assembled = self.assembled_path(title);
        if assembled.is_file() {
            let size = fs::metadata(&assembled)?.len();
            let hash = hashes.hash(&assembled)?;
            return Ok(Some(Manifest::new(title, size, Some(hash), chunks)));
        }
        if chunks.is_empty() {
            debug!(title, "no stored chunks to advertise");
            return Ok(None);
        }
        Ok(Some(Manifest::from_chunks(title, chunks)))
    }

    /// Paths and recorded sizes of every planned chunk, in name order, present or not.
    pub fn planned_chunks(&self, title: &str) -> io::Result<Option<Vec<(PathBuf, u64)>>> {
        Ok(self.planned_manifest(title)?.and_then(|m| {
            let chunks: Vec<_> = m
                .chunks
                .iter()
                .map(|c| (self.chunk_path(title, &c.name), c.size))
                .collect();
            (!chunks.is_empty()).then_some(chunks)
        }))
    }

    /// Concatenate chunk files in name order into the assembled file, unless it already exists.
    pub fn assemble(&self, title: &str, manifest: &Manifest) -> io::Result<PathBuf> {
        let out = self.assembled_path(title);
        if out.exists() {
            debug!(title, "assembled file already present");
            return Ok(out);
        }
        let tmp = self.assembly_tmp_path(title);
        let result = (|| -> io::Result<()> {
            let mut w = BufWriter::new(File::create(&tmp)?);
            for c in &manifest.chunks {
                let mut r = File::open(self.chunk_path(title, &c.name))?;
                io::copy(&mut r, &mut w)?;
            }
            let f = w.into_inner().map_err(|e| e.into_error())?;
            f.sync_all()?;
            let len = f.metadata()?.len();
            if manifest.file_size > 0 && len != manifest.file_size {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("assembled {len} bytes, manifest says {}", manifest.file_size),
                ));
            }
            fs::rename(&tmp, &out)
        })();
        if let Err(e) = result {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        Ok(out)
    }

    /// File ids available locally: assembled and in-progress files, suffixes `.tmp`/`.mp4` stripped.
    pub fn inventory(&self) -> BTreeSet<String> {
        let rd = match fs::read_dir(&self.base) {
            Ok(rd) => rd,
            Err(_) => return BTreeSet::new(),
        };
        rd.filter_map(Result::ok)
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|n| !n.starts_with('.') && !is_sidecar(n))
            .map(|n| {
                let n = n.strip_suffix(".tmp").unwrap_or(&n);
                n.strip_suffix(".mp4").unwrap_or(n).to_string()
            })
            .filter(|n| !n.is_empty())
            .collect()
    }
}

fn is_sidecar(name: &str) -> bool {
    [ASSEMBLY_SUFFIX, LISTING_SUFFIX, JSON_MANIFEST_SUFFIX, PARTIAL_CHUNK_SUFFIX]
        .iter()
        .any(|s| name.ends_with(s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reel_core::hash_bytes;

    fn seed(store: &ChunkStore, title: &str, parts: &[(&str, &[u8])]) {
        let dir = store.chunks_dir(title);
        fs::create_dir_all(&dir).unwrap();
        let mut listing = String::new();
        for (name, data) in parts {
            fs::write(dir.join(name), data).unwrap();
            listing.push_str(&format!("{}  {}\n", hash_bytes(data), name));
        }
        fs::write(store.listing_path(title), listing).unwrap();
    }

    #[test]
    fn manifest_from_listing_without_assembled_file() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ChunkStore::new(tmp.path());
        seed(&store, "movie", &[("c2", b"world"), ("c1", b"hello")]);
        let m = store.build_manifest("movie", &FileHashCache::default()).unwrap().unwrap();
        assert_eq!(m.file_name, "movie");
        assert_eq!(m.file_size, 10);
        assert_eq!(m.file_sha256, None);
        assert_eq!(m.chunks[0].name, "c1");
        assert_eq!(m.chunks[0].sha256, hash_bytes(b"hello"));
    }

    #[test]
    fn manifest_includes_assembled_hash() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ChunkStore::new(tmp.path());
        seed(&store, "movie", &[("c1", b"hello"), ("c2", b"world")]);
        fs::write(store.assembled_path("movie"), b"helloworld").unwrap();
        let cache = FileHashCache::default();
        let m = store.build_manifest("movie", &cache).unwrap().unwrap();
        assert_eq!(m.file_sha256.as_deref(), Some(hash_bytes(b"helloworld").as_str()));
        // second call served from cache, same answer
        let again = store.build_manifest("movie", &cache).unwrap().unwrap();
        assert_eq!(again, m);
    }

    #[test]
    fn missing_listed_chunk_is_omitted() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ChunkStore::new(tmp.path());
        seed(&store, "movie", &[("c1", b"hello"), ("c2", b"world")]);
        fs::remove_file(store.chunk_path("movie", "c2")).unwrap();
        let m = store.build_manifest("movie", &FileHashCache::default()).unwrap().unwrap();
        assert_eq!(m.chunks.len(), 1);
        assert_eq!(m.file_size, 5);
    }

    #[test]
    fn no_manifest_without_dir_or_listing() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ChunkStore::new(tmp.path());
        let cache = FileHashCache::default();
        assert!(store.build_manifest("movie", &cache).unwrap().is_none());
        fs::create_dir_all(store.chunks_dir("movie")).unwrap();
        assert!(store.build_manifest("movie", &cache).unwrap().is_none());
        assert!(store.build_manifest("../etc", &cache).unwrap().is_none());
    }

    fn two_chunk_manifest() -> Manifest {
        Manifest::new(
            "movie",
            10,
            Some(hash_bytes(b"helloworld")),
            vec![
                ChunkDescriptor::new("c1", 5, hash_bytes(b"hello")),
                ChunkDescriptor::new("c2", 5, hash_bytes(b"world")),
            ],
        )
    }

    #[test]
    fn saved_manifest_is_served_back() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ChunkStore::new(tmp.path());
        let m = two_chunk_manifest();
        store.save_manifest("movie", &m).unwrap();
        let listing = fs::read_to_string(store.listing_path("movie")).unwrap();
        assert_eq!(parse_hash_listing(&listing).len(), 2);
        store.write_chunk("movie", "c1", b"hello").unwrap();
        store.write_chunk("movie", "c2", b"world").unwrap();
        fs::write(store.assembled_path("movie"), b"helloworld").unwrap();
        let served = store.build_manifest("movie", &FileHashCache::default()).unwrap().unwrap();
        assert_eq!(served, m);
    }

    #[test]
    fn json_sidecar_advertises_only_stored_chunks() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ChunkStore::new(tmp.path());
        let cache = FileHashCache::default();
        store.save_manifest("movie", &two_chunk_manifest()).unwrap();
        assert!(store.has_manifest("movie"));
        assert!(store.build_manifest("movie", &cache).unwrap().is_none());

        store.write_chunk("movie", "c1", b"hello").unwrap();
        store.write_chunk("movie", "c2", b"wor").unwrap();
        let served = store.build_manifest("movie", &cache).unwrap().unwrap();
        assert_eq!(served.file_sha256, None);
        assert_eq!(served.file_size, 5);
        assert_eq!(served.chunks.len(), 1);
        assert_eq!(served.chunks[0].name, "c1");

        // the plan still lists both slots
        let planned = store.planned_chunks("movie").unwrap().unwrap();
        assert_eq!(planned.len(), 2);
        assert_eq!(planned[1], (store.chunk_path("movie", "c2"), 5));
    }

    #[test]
    fn inspect_and_write_chunk() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ChunkStore::new(tmp.path());
        let desc = ChunkDescriptor::new("c1", 5, hash_bytes(b"hello"));
        assert_eq!(store.inspect_chunk("movie", &desc).unwrap(), None);
        store.write_chunk("movie", "c1", b"hello").unwrap();
        let local = store.inspect_chunk("movie", &desc).unwrap().unwrap();
        assert!(reel_core::is_satisfied(&desc, Some(&local)));
        store.write_chunk("movie", "c1", b"hell").unwrap();
        let short = store.inspect_chunk("movie", &desc).unwrap().unwrap();
        assert_eq!(short.len, 4);
        assert!(!reel_core::is_satisfied(&desc, Some(&short)));
    }

    #[test]
    fn assemble_in_name_order_once() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ChunkStore::new(tmp.path());
        seed(&store, "movie", &[("b", b"world"), ("a", b"hello")]);
        let m = store.build_manifest("movie", &FileHashCache::default()).unwrap().unwrap();
        let out = store.assemble("movie", &m).unwrap();
        assert_eq!(fs::read(&out).unwrap(), b"helloworld");
        assert!(!tmp.path().join("movie.assembly_tmp").exists());
        fs::write(store.chunk_path("movie", "a"), b"HELLO").unwrap();
        store.assemble("movie", &m).unwrap();
        assert_eq!(fs::read(&out).unwrap(), b"helloworld");
    }

    #[test]
    fn assemble_missing_chunk_cleans_up() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ChunkStore::new(tmp.path());
        let m = Manifest::from_chunks("movie", vec![ChunkDescriptor::new("a", 1, "00")]);
        fs::create_dir_all(store.chunks_dir("movie")).unwrap();
        assert!(store.assemble("movie", &m).is_err());
        assert!(!store.assembled_path("movie").exists());
        assert!(!tmp.path().join("movie.assembly_tmp").exists());
    }

    #[test]
    fn assemble_rejects_size_mismatch() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ChunkStore::new(tmp.path());
        seed(&store, "movie", &[("a", b"hello")]);
        let m = Manifest::new("movie", 99, None, vec![ChunkDescriptor::new("a", 5, hash_bytes(b"hello"))]);
        assert!(store.assemble("movie", &m).is_err());
        assert!(!store.assembled_path("movie").exists());
    }

    #[test]
    fn inventory_strips_suffixes() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ChunkStore::new(tmp.path());
        for n in ["movie", "clip.mp4", "partial.mp4.tmp", "other.tmp", ".hidden", "x.assembly_tmp", "movie_manifest.sha256", "movie_manifest.json"] {
            fs::write(tmp.path().join(n), b"x").unwrap();
        }
        fs::create_dir_all(store.chunks_dir("movie")).unwrap();
        let inv: Vec<_> = store.inventory().into_iter().collect();
        assert_eq!(inv, ["clip", "movie", "other", "partial"]);
    }

    #[test]
    fn unsafe_names() {
        assert!(is_safe_name("movie.mp4"));
        assert!(is_safe_name("a..b"));
        for n in ["", ".", "..", "a/b", "a\\b", "nul\0"] {
            assert!(!is_safe_name(n), "{n:?}");
        }
    }
}
