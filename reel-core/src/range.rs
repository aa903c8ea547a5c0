//! HTTP byte ranges: parse `Range: bytes=start[-end]` and resolve it against a file length.

/// What the client asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeRequest {
    /// No header, or a header we could not parse: serve the whole file.
    Full,
    /// `bytes=start-` or `bytes=start-end` (end inclusive).
    Partial { start: u64, end: Option<u64> },
}

/// A resolved span of a file: `len` bytes from `start`, out of `total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub len: u64,
    pub total: u64,
    /// True when the response should be 206 with Content-Range.
    pub partial: bool,
}

/// The requested start lies beyond the end of the file (or after the requested end).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("range not satisfiable for length {total}")]
pub struct Unsatisfiable {
    pub total: u64,
}

impl RangeRequest {
    /// Parse the value of a Range header. Anything but a single `start[-end]` range is `Full`.
    pub fn parse(header: Option<&str>) -> Self {
        header.and_then(parse_range_header).unwrap_or(RangeRequest::Full)
    }

    pub fn resolve(&self, total: u64) -> Result<ByteRange, Unsatisfiable> {
        match *self {
            RangeRequest::Full => Ok(ByteRange {
                start: 0,
                len: total,
                total,
                partial: false,
            }),
            RangeRequest::Partial { start, end } => {
                if start >= total {
                    return Err(Unsatisfiable { total });
                }
                let last = end.unwrap_or(total - 1).min(total - 1);
                if last < start {
                    return Err(Unsatisfiable { total });
                }
                Ok(ByteRange {
                    start,
                    len: last - start + 1,
                    total,
                    partial: true,
                })
            }
        }
    }
}

impl ByteRange {
    /// Inclusive last byte offset. Only meaningful when `len > 0`.
    pub fn last(&self) -> u64 {
        self.start + self.len.saturating_sub(1)
    }

    /// `bytes start-end/total`
    pub fn content_range(&self) -> String {
        format!("bytes {}-{}/{}", self.start, self.last(), self.total)
    }
}

fn parse_range_header(s: &str) -> Option<RangeRequest> {
    let s = s.trim().strip_prefix("bytes=")?;
    let (a, b) = s.split_once('-')?;
    let start: u64 = a.trim().parse().ok()?;
    let b = b.trim();
    let end = if b.is_empty() {
        None
    } else {
        Some(b.parse::<u64>().ok()?)
    };
    Some(RangeRequest::Partial { start, end })
}
