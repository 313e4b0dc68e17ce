//! Lazily fetched remote files.

use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use super::union::slice_range;
use super::{FsError, FsResult};

/// Chunk size used for range requests.
pub const LAZY_CHUNK_SIZE: u64 = 1024 * 1024;

/// Fetches byte ranges of remote files.
///
/// Called synchronously from inside a running program, so implementations
/// block until the bytes are available.
pub trait RangeFetcher: Send + Sync + std::fmt::Debug {
    /// Total size of the resource at `url`.
    fn content_length(&self, url: &str) -> FsResult<u64>;

    /// Fetch bytes `start..=end` of the resource at `url`.
    fn fetch_range(&self, url: &str, start: u64, end: u64) -> FsResult<Vec<u8>>;
}

/// [`RangeFetcher`] using HTTP `HEAD` and `Range` requests.
#[derive(Debug, Clone)]
pub struct HttpRangeFetcher {
    agent: ureq::Agent,
}

impl Default for HttpRangeFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpRangeFetcher {
    /// Create a fetcher with a fresh HTTP agent.
    pub fn new() -> Self {
        Self {
            agent: ureq::AgentBuilder::new().build(),
        }
    }
}

fn remote_error(url: &str, err: impl std::fmt::Display) -> FsError {
    FsError::Remote(format!("{url}: {err}"))
}

impl RangeFetcher for HttpRangeFetcher {
    fn content_length(&self, url: &str) -> FsResult<u64> {
        let response = self
            .agent
            .head(url)
            .call()
            .map_err(|e| remote_error(url, e))?;
        response
            .header("Content-Length")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| remote_error(url, "missing Content-Length"))
    }

    fn fetch_range(&self, url: &str, start: u64, end: u64) -> FsResult<Vec<u8>> {
        let response = self
            .agent
            .get(url)
            .set("Range", &format!("bytes={start}-{end}"))
            .call()
            .map_err(|e| remote_error(url, e))?;
        let partial = response.status() == 206;
        let mut body = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut body)
            .map_err(|e| remote_error(url, e))?;
        if partial {
            Ok(body)
        } else {
            // Server ignored the range header and sent the whole resource.
            Ok(slice_range(&body, start, end - start + 1))
        }
    }
}

/// A file whose bytes live at a remote URL and are fetched chunk by chunk.
pub(crate) struct LazyFile {
    url: String,
    fetcher: Arc<dyn RangeFetcher>,
    length: OnceLock<u64>,
    chunks: Mutex<HashMap<u64, Arc<Vec<u8>>>>,
}

impl std::fmt::Debug for LazyFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyFile")
            .field("url", &self.url)
            .field("length", &self.length.get())
            .finish_non_exhaustive()
    }
}

impl LazyFile {
    pub(crate) fn new(url: impl Into<String>, fetcher: Arc<dyn RangeFetcher>) -> Self {
        Self {
            url: url.into(),
            fetcher,
            length: OnceLock::new(),
            chunks: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn len(&self) -> FsResult<u64> {
        if let Some(len) = self.length.get() {
            return Ok(*len);
        }
        let len = self.fetcher.content_length(&self.url)?;
        let _ = self.length.set(len);
        Ok(len)
    }

    fn chunk(&self, index: u64, total: u64) -> FsResult<Arc<Vec<u8>>> {
        if let Some(chunk) = self
            .chunks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&index)
        {
            return Ok(Arc::clone(chunk));
        }
        let start = index * LAZY_CHUNK_SIZE;
        let end = (start + LAZY_CHUNK_SIZE).min(total) - 1;
        tracing::debug!(url = %self.url, start, end, "fetching lazy file chunk");
        let bytes = Arc::new(self.fetcher.fetch_range(&self.url, start, end)?);
        self.chunks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(index, Arc::clone(&bytes));
        Ok(bytes)
    }

    pub(crate) fn read_at(&self, offset: u64, len: u64) -> FsResult<Vec<u8>> {
        let total = self.len()?;
        if offset >= total || len == 0 {
            return Ok(Vec::new());
        }
        let end = offset.saturating_add(len).min(total);
        let mut out = Vec::with_capacity((end - offset) as usize);
        let mut pos = offset;
        while pos < end {
            let index = pos / LAZY_CHUNK_SIZE;
            let chunk = self.chunk(index, total)?;
            let within = pos - index * LAZY_CHUNK_SIZE;
            let take = (end - pos).min(LAZY_CHUNK_SIZE - within);
            let piece = slice_range(&chunk, within, take);
            if piece.is_empty() {
                return Err(FsError::Remote(format!(
                    "{}: short read at offset {pos}",
                    self.url
                )));
            }
            pos += piece.len() as u64;
            out.extend_from_slice(&piece);
        }
        Ok(out)
    }

    pub(crate) fn read_all(&self) -> FsResult<Vec<u8>> {
        self.read_at(0, self.len()?)
    }
}
