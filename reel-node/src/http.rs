//! Minimal HTTP/1.1 plumbing shared by the seeder and the range server: request head parsing
//! (httparse), status/body responses, and bounded-buffer ranged file streaming.

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use reel_core::{chunk_spans, ByteRange, RangeRequest};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Largest request head we accept before giving up on a connection.
pub const MAX_HEAD_LEN: usize = 16 * 1024;
/// Body streaming buffer; memory per connection is independent of file size.
pub const STREAM_BUF_SIZE: usize = 8 * 1024;
/// How long a client gets to send its request head.
pub const HEAD_TIMEOUT: Duration = Duration::from_secs(10);
/// How long a chunk-backed stream waits for a slot still being downloaded.
pub const CHUNK_WAIT: Duration = Duration::from_secs(60);
const CHUNK_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Other(String),
}

/// The parts of a request the servers look at.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    /// Raw request target, still percent-encoded.
    pub target: String,
    pub range: Option<String>,
}

impl Request {
    pub fn is_head(&self) -> bool {
        self.method == Method::Head
    }

    /// Path segments, percent-decoded, query string dropped. `None` if a segment is not valid UTF-8.
    pub fn segments(&self) -> Option<Vec<String>> {
        let path = self.target.split(['?', '#']).next().unwrap_or("");
        path.split('/')
            .filter(|s| !s.is_empty())
            .map(|s| urlencoding::decode(s).ok().map(|c| c.into_owned()))
            .collect()
    }

    /// Whole path after the leading slash, percent-decoded.
    pub fn decoded_path(&self) -> Option<String> {
        let path = self.target.split(['?', '#']).next().unwrap_or("");
        let raw = path.strip_prefix('/').unwrap_or(path);
        urlencoding::decode(raw).ok().map(|c| c.into_owned())
    }
}

/// Read and parse one request head within [`HEAD_TIMEOUT`]. `Ok(None)` for a closed, stalled,
/// oversized or malformed request.
pub async fn read_request<S: AsyncRead + Unpin>(stream: &mut S) -> io::Result<Option<Request>> {
    read_request_within(stream, HEAD_TIMEOUT).await
}

pub async fn read_request_within<S: AsyncRead + Unpin>(
    stream: &mut S,
    limit: Duration,
) -> io::Result<Option<Request>> {
    match tokio::time::timeout(limit, read_head(stream)).await {
        Ok(r) => r,
        Err(_) => {
            debug!(?limit, "request head timed out");
            Ok(None)
        }
    }
}

async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> io::Result<Option<Request>> {
    let mut buf = Vec::with_capacity(2048);
    let mut chunk = [0u8; 2048];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(&buf) {
            Ok(status) if status.is_complete() => {
                let method = match req.method {
                    Some(m) if m.eq_ignore_ascii_case("GET") => Method::Get,
                    Some(m) if m.eq_ignore_ascii_case("HEAD") => Method::Head,
                    Some(m) => Method::Other(m.to_string()),
                    None => return Ok(None),
                };
                let Some(target) = req.path.map(str::to_string) else {
                    return Ok(None);
                };
                let range = req
                    .headers
                    .iter()
                    .find(|h| h.name.eq_ignore_ascii_case("Range"))
                    .and_then(|h| std::str::from_utf8(h.value).ok())
                    .map(|v| v.trim().to_string());
                return Ok(Some(Request { method, target, range }));
            }
            Ok(_) if buf.len() < MAX_HEAD_LEN => continue,
            _ => return Ok(None),
        }
    }
}

fn reason(code: u16) -> &'static str {
    match code {
        200 => "OK",
        206 => "Partial Content",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        416 => "Range Not Satisfiable",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

/// Status-only response with an empty body.
pub async fn write_status<W: AsyncWrite + Unpin>(w: &mut W, code: u16) -> io::Result<()> {
    let head = format!(
        "HTTP/1.1 {code} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        reason(code)
    );
    w.write_all(head.as_bytes()).await?;
    w.flush().await
}

/// 200 response carrying an in-memory body (omitted for HEAD).
pub async fn write_body<W: AsyncWrite + Unpin>(
    w: &mut W,
    content_type: &str,
    body: &[u8],
    head_only: bool,
) -> io::Result<()> {
    let head = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    w.write_all(head.as_bytes()).await?;
    if !head_only {
        w.write_all(body).await?;
    }
    w.flush().await
}

/// Ranged file response: 200 for whole-file requests, 206 with `Content-Range` for ranges,
/// 416 with `Content-Range: bytes */{total}` when the range cannot be satisfied.
pub async fn serve_file<W: AsyncWrite + Unpin>(
    w: &mut W,
    path: &Path,
    head_only: bool,
    range: Option<&str>,
    content_type: &str,
) -> io::Result<()> {
    let mut file = tokio::fs::File::open(path).await?;
    let total = file.metadata().await?.len();
    let Some(r) = write_range_head(w, range, total, content_type).await? else {
        return Ok(());
    };
    if !head_only && r.len > 0 {
        file.seek(SeekFrom::Start(r.start)).await?;
        let mut buf = vec![0u8; STREAM_BUF_SIZE];
        copy_len(&mut file, w, r.len, &mut buf).await?;
    }
    w.flush().await
}

/// Ranged response over chunk files concatenated in order, for titles not yet assembled.
/// `chunks` holds each slot's path and recorded size. A slot that does not exist yet is polled
/// for up to `wait` before the response is cut short with `TimedOut`.
pub async fn serve_chunks<W: AsyncWrite + Unpin>(
    w: &mut W,
    chunks: &[(PathBuf, u64)],
    head_only: bool,
    range: Option<&str>,
    content_type: &str,
    wait: Duration,
) -> io::Result<()> {
    let sizes: Vec<u64> = chunks.iter().map(|(_, size)| *size).collect();
    let total = sizes.iter().sum();
    let Some(r) = write_range_head(w, range, total, content_type).await? else {
        return Ok(());
    };
    if head_only || r.len == 0 {
        return w.flush().await;
    }
    let mut buf = vec![0u8; STREAM_BUF_SIZE];
    for span in chunk_spans(&sizes, r.start, r.len) {
        let path = &chunks[span.index].0;
        let mut file = open_when_present(path, wait).await?;
        file.seek(SeekFrom::Start(span.offset)).await?;
        let copied = copy_len(&mut file, w, span.len, &mut buf).await?;
        if copied < span.len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{} shorter than recorded", path.display()),
            ));
        }
    }
    w.flush().await
}

/// Resolve `range` against `total` and write the response head. `None` after a 416.
async fn write_range_head<W: AsyncWrite + Unpin>(
    w: &mut W,
    range: Option<&str>,
    total: u64,
    content_type: &str,
) -> io::Result<Option<ByteRange>> {
    let r = match RangeRequest::parse(range).resolve(total) {
        Ok(r) => r,
        Err(_) => {
            let head = format!(
                "HTTP/1.1 416 {}\r\nContent-Range: bytes */{total}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                reason(416)
            );
            w.write_all(head.as_bytes()).await?;
            w.flush().await?;
            return Ok(None);
        }
    };
    let status = if r.partial { 206 } else { 200 };
    let mut head = format!(
        "HTTP/1.1 {status} {}\r\nContent-Length: {}\r\nContent-Type: {content_type}\r\nAccept-Ranges: bytes\r\n",
        reason(status),
        r.len
    );
    if r.partial {
        head.push_str(&format!("Content-Range: {}\r\n", r.content_range()));
    }
    head.push_str("Connection: close\r\n\r\n");
    w.write_all(head.as_bytes()).await?;
    Ok(Some(r))
}

/// Copy up to `len` bytes through `buf`. Returns the count copied, short only at EOF.
async fn copy_len<R, W>(r: &mut R, w: &mut W, len: u64, buf: &mut [u8]) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut remaining = len;
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = r.read(&mut buf[..want]).await?;
        if n == 0 {
            break;
        }
        w.write_all(&buf[..n]).await?;
        remaining -= n as u64;
    }
    Ok(len - remaining)
}

async fn open_when_present(path: &Path, wait: Duration) -> io::Result<tokio::fs::File> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        match tokio::fs::File::open(path).await {
            Ok(f) => return Ok(f),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("{} did not arrive", path.display()),
            ));
        }
        debug!(chunk = %path.display(), "waiting for chunk");
        tokio::time::sleep(CHUNK_POLL).await;
    }
}
