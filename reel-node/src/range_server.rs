//! Range file server: `GET|HEAD /{name}` serving a whole media file (or its in-progress
//! temporary copy) with byte-range support, for progressive playback straight from a peer.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::http::{self, Method};
use crate::store::is_safe_name;

pub const MEDIA_CONTENT_TYPE: &str = "video/mp4";

/// Find the file to serve for a requested name: exact, `.mp4`, `.mp4.tmp`, then `.tmp`.
pub fn resolve_file(dir: &Path, name: &str) -> Option<PathBuf> {
    let has_mp4 = name.ends_with(".mp4");
    let mut candidates = vec![name.to_string()];
    if !has_mp4 {
        candidates.push(format!("{name}.mp4"));
        candidates.push(format!("{name}.mp4.tmp"));
    }
    candidates.push(format!("{name}.tmp"));
    candidates
        .into_iter()
        .map(|c| dir.join(c))
        .find(|p| p.is_file())
}

pub struct RangeServer {
    listener: TcpListener,
    dir: Arc<PathBuf>,
}

impl RangeServer {
    pub async fn bind(addr: SocketAddr, dir: impl Into<PathBuf>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            dir: Arc::new(dir.into()),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> io::Result<()> {
        info!(addr = %self.local_addr()?, dir = %self.dir.display(), "range server listening");
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = %e, "range server accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            let dir = self.dir.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_client(stream, &dir).await {
                    // client hung up mid-stream
                    debug!(%peer, error = %e, "range connection ended with error");
                }
            });
        }
    }
}

async fn handle_client(mut stream: TcpStream, dir: &Path) -> io::Result<()> {
    let result = respond(&mut stream, dir).await;
    let _ = stream.shutdown().await;
    result
}

async fn respond(stream: &mut TcpStream, dir: &Path) -> io::Result<()> {
    let Some(req) = http::read_request(stream).await? else {
        return Ok(());
    };
    if let Method::Other(_) = req.method {
        return http::write_status(stream, 405).await;
    }
    let name = match req.decoded_path() {
        Some(n) if is_safe_name(&n) => n,
        _ => return http::write_status(stream, 404).await,
    };
    match resolve_file(dir, &name) {
        Some(path) => {
            debug!(file = %path.display(), range = ?req.range, head = req.is_head(), "serving");
            http::serve_file(stream, &path, req.is_head(), req.range.as_deref(), MEDIA_CONTENT_TYPE).await
        }
        None => {
            debug!(name = %name, "not found");
            http::write_status(stream, 404).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_order() {
        let dir = tempfile::tempdir().unwrap();
        let d = dir.path();
        assert_eq!(resolve_file(d, "movie"), None);

        std::fs::write(d.join("movie.tmp"), b"t").unwrap();
        assert_eq!(resolve_file(d, "movie"), Some(d.join("movie.tmp")));

        std::fs::write(d.join("movie.mp4.tmp"), b"t").unwrap();
        assert_eq!(resolve_file(d, "movie"), Some(d.join("movie.mp4.tmp")));

        std::fs::write(d.join("movie.mp4"), b"t").unwrap();
        assert_eq!(resolve_file(d, "movie"), Some(d.join("movie.mp4")));

        std::fs::write(d.join("movie"), b"t").unwrap();
        assert_eq!(resolve_file(d, "movie"), Some(d.join("movie")));
    }

    #[test]
    fn mp4_name_falls_back_to_tmp() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("clip.mp4.tmp"), b"t").unwrap();
        assert_eq!(
            resolve_file(dir.path(), "clip.mp4"),
            Some(dir.path().join("clip.mp4.tmp"))
        );
    }

    #[test]
    fn directories_are_not_served() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("movie_chunks")).unwrap();
        assert_eq!(resolve_file(dir.path(), "movie_chunks"), None);
    }
}
