//! Content seeder: serves `/manifest/{title}` and `/chunk/{title}/{chunk}` from the chunk store,
//! plus `/stream/{title}` from the assembled file or, while a fetch is still running, from the
//! planned chunks in order. One task per accepted connection; every response closes the connection.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::http::{self, Method};
use crate::store::{is_safe_name, ChunkStore, FileHashCache};

pub const MANIFEST_CONTENT_TYPE: &str = "application/json";
pub const CHUNK_CONTENT_TYPE: &str = "application/octet-stream";
pub const STREAM_CONTENT_TYPE: &str = "video/mp4";

struct SeederState {
    store: ChunkStore,
    hashes: FileHashCache,
    chunk_wait: Duration,
}

/// Bound seeder. `run` accepts until the listener fails.
pub struct Seeder {
    listener: TcpListener,
    state: Arc<SeederState>,
}

impl Seeder {
    pub async fn bind(addr: SocketAddr, store: ChunkStore) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            state: Arc::new(SeederState {
                store,
                hashes: FileHashCache::default(),
                chunk_wait: http::CHUNK_WAIT,
            }),
        })
    }

    /// How long `/stream` waits for a chunk that is still downloading.
    pub fn with_chunk_wait(mut self, wait: Duration) -> Self {
        if let Some(state) = Arc::get_mut(&mut self.state) {
            state.chunk_wait = wait;
        }
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> io::Result<()> {
        info!(addr = %self.local_addr()?, dir = %self.state.store.base_dir().display(), "seeder listening");
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = %e, "seeder accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            let state = self.state.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_client(stream, &state).await {
                    debug!(%peer, error = %e, "seeder connection ended with error");
                }
            });
        }
    }
}

async fn handle_client(mut stream: TcpStream, state: &Arc<SeederState>) -> io::Result<()> {
    let result = respond(&mut stream, state).await;
    let _ = stream.shutdown().await;
    result
}

async fn respond(stream: &mut TcpStream, state: &Arc<SeederState>) -> io::Result<()> {
    let Some(req) = http::read_request(stream).await? else {
        return Ok(());
    };
    if let Method::Other(m) = &req.method {
        debug!(method = %m, "seeder rejecting method");
        return http::write_status(stream, 405).await;
    }
    let Some(segments) = req.segments() else {
        return http::write_status(stream, 404).await;
    };
    let route: Vec<&str> = segments.iter().map(String::as_str).collect();
    match route.as_slice() {
        [kind, title] if kind.eq_ignore_ascii_case("manifest") => {
            send_manifest(stream, state, title, req.is_head()).await
        }
        [kind, title, chunk] if kind.eq_ignore_ascii_case("chunk") => {
            if !is_safe_name(title) || !is_safe_name(chunk) {
                return http::write_status(stream, 404).await;
            }
            let path = state.store.chunk_path(title, chunk);
            if !path.is_file() {
                debug!(title, chunk, "chunk not found");
                return http::write_status(stream, 404).await;
            }
            http::serve_file(stream, &path, req.is_head(), req.range.as_deref(), CHUNK_CONTENT_TYPE).await
        }
        [kind, title] if kind.eq_ignore_ascii_case("stream") => {
            if !is_safe_name(title) {
                return http::write_status(stream, 404).await;
            }
            send_stream(stream, state, title, req.is_head(), req.range.as_deref()).await
        }
        _ => http::write_status(stream, 404).await,
    }
}

async fn send_stream(
    stream: &mut TcpStream,
    state: &Arc<SeederState>,
    title: &str,
    head_only: bool,
    range: Option<&str>,
) -> io::Result<()> {
    let path = state.store.assembled_path(title);
    if let Ok(m) = tokio::fs::metadata(&path).await {
        if m.is_file() && m.len() > 0 {
            return http::serve_file(stream, &path, head_only, range, STREAM_CONTENT_TYPE).await;
        }
    }
    let store = state.store.clone();
    let owned = title.to_string();
    let planned = tokio::task::spawn_blocking(move || store.planned_chunks(&owned))
        .await
        .map_err(io::Error::other)?;
    match planned {
        Ok(Some(chunks)) => {
            debug!(title, chunks = chunks.len(), "streaming from chunks");
            http::serve_chunks(stream, &chunks, head_only, range, STREAM_CONTENT_TYPE, state.chunk_wait).await
        }
        Ok(None) => http::write_status(stream, 404).await,
        Err(e) => {
            warn!(title, error = %e, "chunk plan unreadable");
            http::write_status(stream, 500).await
        }
    }
}

async fn send_manifest(
    stream: &mut TcpStream,
    state: &Arc<SeederState>,
    title: &str,
    head_only: bool,
) -> io::Result<()> {
    let task_state = state.clone();
    let owned = title.to_string();
    let built = tokio::task::spawn_blocking(move || {
        task_state.store.build_manifest(&owned, &task_state.hashes)
    })
    .await
    .map_err(io::Error::other)?;
    match built {
        Ok(Some(manifest)) => {
            let body = manifest
                .to_json()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            debug!(title, chunks = manifest.chunks.len(), "serving manifest");
            http::write_body(stream, MANIFEST_CONTENT_TYPE, &body, head_only).await
        }
        Ok(None) => {
            debug!(title, "manifest not found");
            http::write_status(stream, 404).await
        }
        Err(e) => {
            warn!(title, error = %e, "manifest build failed");
            http::write_status(stream, 500).await
        }
    }
}
