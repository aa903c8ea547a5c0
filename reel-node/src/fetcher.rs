//! Content fetcher: manifest → diff against local chunks → bounded-parallel verified batch
//! downloads → assembly → whole-file verification. Linear; any failure aborts the fetch.

use std::collections::HashSet;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reel_core::chunk::{plan_batches, DEFAULT_PARALLELISM};
use reel_core::{hash_bytes, missing_chunks, ChunkDescriptor, Manifest, ManifestError};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::store::{hash_file, is_safe_name, ChunkStore};

/// One fetch operation: which title, from which peer, how many chunks at once.
#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub title: String,
    pub host: String,
    pub port: u16,
    pub parallelism: usize,
}

impl DownloadJob {
    pub fn new(title: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            title: title.into(),
            host: host.into(),
            port,
            parallelism: DEFAULT_PARALLELISM,
        }
    }

    pub fn with_parallelism(mut self, n: usize) -> Self {
        self.parallelism = n.max(1);
        self
    }

    fn base_url(&self) -> String {
        if self.host.contains(':') {
            format!("http://[{}]:{}", self.host, self.port)
        } else {
            format!("http://{}:{}", self.host, self.port)
        }
    }

    fn manifest_url(&self) -> String {
        format!("{}/manifest/{}", self.base_url(), urlencoding::encode(&self.title))
    }

    fn chunk_url(&self, chunk: &str) -> String {
        format!(
            "{}/chunk/{}/{}",
            self.base_url(),
            urlencoding::encode(&self.title),
            urlencoding::encode(chunk)
        )
    }
}

/// Outcome of a successful fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchReport {
    pub path: PathBuf,
    /// Chunks downloaded in this run.
    pub downloaded: usize,
    /// Chunks already satisfied on disk.
    pub skipped: usize,
    /// True when the manifest carried a whole-file hash and it matched.
    pub verified: bool,
}

/// Why a fetch failed. Any of these aborts the whole operation.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("transport error for {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unexpected status {status} for {url}")]
    Status { url: String, status: u16 },
    #[error("integrity check failed for {what}: expected {expected}, got {actual}")]
    Integrity {
        what: String,
        expected: String,
        actual: String,
    },
    #[error("manifest: {0}")]
    Manifest(#[from] ManifestError),
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("invalid name {0:?}")]
    InvalidName(String),
    #[error("fetch of {0:?} already in progress")]
    AlreadyFetching(String),
}

/// Removes the title from the in-flight set when the fetch ends, however it ends.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<String>>,
    title: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Ok(mut s) = self.set.lock() {
            s.remove(&self.title);
        }
    }
}

pub struct Fetcher {
    client: reqwest::Client,
    store: ChunkStore,
    in_flight: Mutex<HashSet<String>>,
}

impl Fetcher {
    pub fn new(store: ChunkStore, connect_timeout: Duration, read_timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .read_timeout(read_timeout)
            .build()
            .map_err(|source| FetchError::Transport {
                url: String::new(),
                source,
            })?;
        Ok(Self {
            client,
            store,
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    fn claim(&self, title: &str) -> Result<InFlight<'_>, FetchError> {
        let mut set = self
            .in_flight
            .lock()
            .map_err(|_| io::Error::other("in-flight set poisoned"))?;
        if !set.insert(title.to_string()) {
            return Err(FetchError::AlreadyFetching(title.to_string()));
        }
        Ok(InFlight {
            set: &self.in_flight,
            title: title.to_string(),
        })
    }

    /// Run one fetch to completion or failure.
    pub async fn fetch(&self, job: &DownloadJob) -> Result<FetchReport, FetchError> {
        if !is_safe_name(&job.title) {
            return Err(FetchError::InvalidName(job.title.clone()));
        }
        let _guard = self.claim(&job.title)?;
        info!(title = %job.title, host = %job.host, port = job.port, "fetch started");

        let manifest = self.fetch_manifest(job).await?;
        if let Some(bad) = manifest.chunks.iter().find(|c| !is_safe_name(&c.name)) {
            return Err(FetchError::InvalidName(bad.name.clone()));
        }
        let manifest = Arc::new(manifest);
        // An earlier plan stays until this fetch verifies; a fresh one lets partial chunks be seeded.
        self.persist_manifest(&job.title, &manifest, false).await;

        let missing = self.diff(&job.title, &manifest).await?;
        let skipped = manifest.chunks.len() - missing.len();
        if missing.is_empty() {
            debug!(title = %job.title, "all chunks already present");
        } else {
            info!(title = %job.title, missing = missing.len(), skipped, "downloading chunks");
        }

        for batch in plan_batches(&missing, job.parallelism) {
            self.download_batch(job, batch).await?;
        }

        let path = self.assemble(&job.title, &manifest).await?;
        let verified = self.verify_whole(&path, &manifest).await?;
        self.persist_manifest(&job.title, &manifest, true).await;
        info!(title = %job.title, downloaded = missing.len(), skipped, verified, "fetch complete");
        Ok(FetchReport {
            path,
            downloaded: missing.len(),
            skipped,
            verified,
        })
    }

    /// Request and decode the peer's manifest for `job.title`.
    pub async fn fetch_manifest(&self, job: &DownloadJob) -> Result<Manifest, FetchError> {
        let url = job.manifest_url();
        let bytes = get_bytes(&self.client, &url).await?;
        Ok(Manifest::from_json(&bytes)?)
    }

    /// Write both sidecars. Without `replace`, existing sidecars are left alone.
    async fn persist_manifest(&self, title: &str, manifest: &Arc<Manifest>, replace: bool) {
        let store = self.store.clone();
        let (t, m) = (title.to_string(), manifest.clone());
        let saved = tokio::task::spawn_blocking(move || {
            if !replace && store.has_manifest(&t) {
                return Ok(());
            }
            store.save_manifest(&t, &m)
        })
        .await;
        match saved {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(title, error = %e, "could not persist manifest sidecars"),
            Err(e) => warn!(title, error = %e, "could not persist manifest sidecars"),
        }
    }

    async fn diff(&self, title: &str, manifest: &Arc<Manifest>) -> Result<Vec<ChunkDescriptor>, FetchError> {
        let store = self.store.clone();
        let (t, m) = (title.to_string(), manifest.clone());
        let missing = tokio::task::spawn_blocking(move || {
            missing_chunks(&m, |desc| match store.inspect_chunk(&t, desc) {
                Ok(local) => local,
                Err(e) => {
                    warn!(chunk = %desc.name, error = %e, "cannot inspect chunk, refetching");
                    None
                }
            })
            .into_iter()
            .cloned()
            .collect::<Vec<_>>()
        })
        .await
        .map_err(io::Error::other)?;
        Ok(missing)
    }

    /// All downloads in a batch run concurrently; the first failure aborts the rest.
    async fn download_batch(&self, job: &DownloadJob, batch: Vec<ChunkDescriptor>) -> Result<(), FetchError> {
        let mut set = JoinSet::new();
        for desc in batch {
            let client = self.client.clone();
            let store = self.store.clone();
            let url = job.chunk_url(&desc.name);
            let title = job.title.clone();
            set.spawn(async move { download_chunk(&client, &store, &title, &url, &desc).await });
        }
        while let Some(joined) = set.join_next().await {
            let outcome = joined.map_err(|e| FetchError::Io(io::Error::other(e)));
            if let Err(e) = outcome.and_then(|r| r) {
                set.abort_all();
                warn!(title = %job.title, error = %e, "chunk failed, aborting fetch");
                return Err(e);
            }
        }
        Ok(())
    }

    async fn assemble(&self, title: &str, manifest: &Arc<Manifest>) -> Result<PathBuf, FetchError> {
        let store = self.store.clone();
        let (t, m) = (title.to_string(), manifest.clone());
        let path = tokio::task::spawn_blocking(move || store.assemble(&t, &m))
            .await
            .map_err(io::Error::other)??;
        Ok(path)
    }

    /// Check size and, when present, whole-file hash. The assembled file is deleted on mismatch.
    async fn verify_whole(&self, path: &PathBuf, manifest: &Arc<Manifest>) -> Result<bool, FetchError> {
        let (p, m) = (path.clone(), manifest.clone());
        let checked = tokio::task::spawn_blocking(move || -> Result<bool, FetchError> {
            let len = std::fs::metadata(&p)?.len();
            if m.file_size > 0 && len != m.file_size {
                return Err(FetchError::Integrity {
                    what: format!("{} size", m.file_name),
                    expected: m.file_size.to_string(),
                    actual: len.to_string(),
                });
            }
            let Some(expected) = &m.file_sha256 else {
                return Ok(false);
            };
            let actual = hash_file(&p)?;
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(FetchError::Integrity {
                    what: m.file_name.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
            Ok(true)
        })
        .await
        .map_err(io::Error::other)?;
        if let Err(FetchError::Integrity { .. }) = &checked {
            warn!(file = %path.display(), "assembled file failed verification, deleting");
            let _ = tokio::fs::remove_file(path).await;
        }
        checked
    }
}

async fn get_bytes(client: &reqwest::Client, url: &str) -> Result<Vec<u8>, FetchError> {
    let transport = |source| FetchError::Transport {
        url: url.to_string(),
        source,
    };
    let resp = client.get(url).send().await.map_err(transport)?;
    let status = resp.status();
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(FetchError::NotFound(url.to_string()));
    }
    if !status.is_success() {
        return Err(FetchError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }
    let body = resp.bytes().await.map_err(transport)?;
    Ok(body.to_vec())
}

/// Download one chunk, verify it, and only then write it into its slot.
async fn download_chunk(
    client: &reqwest::Client,
    store: &ChunkStore,
    title: &str,
    url: &str,
    desc: &ChunkDescriptor,
) -> Result<(), FetchError> {
    let bytes = get_bytes(client, url).await?;
    let store = store.clone();
    let (t, d) = (title.to_string(), desc.clone());
    tokio::task::spawn_blocking(move || -> Result<(), FetchError> {
        let actual = hash_bytes(&bytes);
        if bytes.len() as u64 != d.size || !actual.eq_ignore_ascii_case(&d.sha256) {
            warn!(chunk = %d.name, expected = %d.sha256, %actual, len = bytes.len(), "chunk hash mismatch, discarding");
            return Err(FetchError::Integrity {
                what: d.name.clone(),
                expected: d.sha256.clone(),
                actual,
            });
        }
        store.write_chunk(&t, &d.name, &bytes)?;
        debug!(chunk = %d.name, len = bytes.len(), "chunk stored");
        Ok(())
    })
    .await
    .map_err(io::Error::other)?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_are_encoded() {
        let job = DownloadJob::new("my movie", "10.0.0.2", 8890);
        assert_eq!(job.manifest_url(), "http://10.0.0.2:8890/manifest/my%20movie");
        assert_eq!(job.chunk_url("part 1"), "http://10.0.0.2:8890/chunk/my%20movie/part%201");
        let v6 = DownloadJob::new("m", "fe80::1", 1);
        assert_eq!(v6.manifest_url(), "http://[fe80::1]:1/manifest/m");
    }

    #[test]
    fn parallelism_floor() {
        assert_eq!(DownloadJob::new("m", "h", 1).parallelism, 3);
        assert_eq!(DownloadJob::new("m", "h", 1).with_parallelism(0).parallelism, 1);
    }

    #[tokio::test]
    async fn single_flight_per_title() {
        let dir = tempfile::tempdir().unwrap();
        let f = Fetcher::new(ChunkStore::new(dir.path()), Duration::from_secs(1), Duration::from_secs(1)).unwrap();
        let g = f.claim("movie").unwrap();
        assert!(matches!(f.claim("movie"), Err(FetchError::AlreadyFetching(_))));
        assert!(f.claim("other").is_ok());
        drop(g);
        assert!(f.claim("movie").is_ok());
    }

    #[tokio::test]
    async fn rejects_unsafe_title() {
        let dir = tempfile::tempdir().unwrap();
        let f = Fetcher::new(ChunkStore::new(dir.path()), Duration::from_secs(1), Duration::from_secs(1)).unwrap();
        let err = f.fetch(&DownloadJob::new("../x", "127.0.0.1", 1)).await.unwrap_err();
        assert!(matches!(err, FetchError::InvalidName(_)));
    }
}
