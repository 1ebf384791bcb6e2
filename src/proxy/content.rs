//! FileContent: the per-key chunk cache backing sequential reads (spec §4.7.4). Bit-faithful
//! port of `examples/original_source/pkg/webdavproxy/file_content.go`.

use std::time::Instant;

use hyper::{Body, Request};
use log::debug;
use tokio::sync::Mutex;

use super::backend::ObjectInfo;
use super::{CHUNK_SIZE, MAX_CACHED_CHUNKS, MAX_CACHED_CHUNKS_CLEAN_LIMIT, PREFETCH_THRESHOLD, SUPER_CHUNK};
use crate::error::Error;
use crate::tools::http::SimpleHttp;

struct Chunk {
    buf: Vec<u8>,
    last_read_at: Instant,
}

struct Inner {
    chunks: Vec<Option<Chunk>>,
    filled_count: usize,
    last_fill_end: Option<i64>,
    cnt: i32,
    last_used: Instant,
}

/// Cached content of one object, shared across concurrent readers of the same key (spec
/// §4.7.9: `Idle -> Reading <-> Idle`, multiple readers share this object).
pub struct FileContent {
    http: SimpleHttp,
    object: ObjectInfo,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for FileContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileContent").field("key", &self.object.key).finish()
    }
}

impl FileContent {
    pub fn new(http: SimpleHttp, object: ObjectInfo) -> Self {
        let num_chunks = ((object.size as usize) + CHUNK_SIZE - 1) / CHUNK_SIZE;
        Self {
            http,
            object,
            inner: Mutex::new(Inner {
                chunks: (0..num_chunks).map(|_| None).collect(),
                filled_count: 0,
                last_fill_end: None,
                cnt: 0,
                last_used: Instant::now(),
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.object.key
    }

    pub fn size(&self) -> u64 {
        self.object.size
    }

    pub async fn last_used(&self) -> Instant {
        self.inner.lock().await.last_used
    }

    /// Read `buf.len()` bytes starting at `offset`. The mutex is held across the HTTP range
    /// fetch, intentionally: it serves as a single-flight for overlapping prefetch (spec §5).
    pub async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, Error> {
        let mut inner = self.inner.lock().await;
        inner.last_used = Instant::now();

        self.ensure_chunks(&mut inner, offset, buf.len()).await?;

        let mut pos = 0usize;
        let mut cur = offset;
        while pos < buf.len() {
            let idx = (cur / CHUNK_SIZE as u64) as usize;
            let chunk_offset = (cur % CHUNK_SIZE as u64) as usize;
            let chunk = inner.chunks[idx]
                .as_mut()
                .expect("chunk must be filled by ensure_chunks before being read");
            let available = &chunk.buf[chunk_offset..];
            let n = available.len().min(buf.len() - pos);
            buf[pos..pos + n].copy_from_slice(&available[..n]);
            chunk.last_read_at = Instant::now();
            pos += n;
            cur += n as u64;
        }

        self.forget_old_chunks(&mut inner);
        Ok(pos)
    }

    /// Spec §4.7.4 steps 2-4: shrink the range by already-filled chunks, apply the prefetch
    /// extension, then fetch whatever remains.
    async fn ensure_chunks(&self, inner: &mut Inner, offset: u64, count: usize) -> Result<(), Error> {
        let total_chunks = inner.chunks.len() as i64;
        if total_chunks == 0 {
            return Ok(());
        }
        let mut first_chunk = (offset / CHUNK_SIZE as u64) as i64;
        let mut last_chunk = ((offset + count as u64) / CHUNK_SIZE as u64) as i64;
        // Reads that consume exactly up to EOF land on `total_chunks` when `size` is a multiple
        // of CHUNK_SIZE; there is no such chunk, so cap the fetch range at the last real one.
        last_chunk = last_chunk.min(total_chunks - 1);

        while first_chunk < total_chunks && inner.chunks[first_chunk as usize].is_some() {
            first_chunk += 1;
        }
        if first_chunk > last_chunk {
            return Ok(());
        }
        while last_chunk >= 0 && inner.chunks[last_chunk as usize].is_some() {
            last_chunk -= 1;
        }
        if last_chunk < first_chunk {
            return Ok(());
        }

        if inner.last_fill_end == Some(first_chunk - 1) {
            inner.cnt += 1;
        } else {
            inner.cnt = 0;
        }

        if inner.cnt >= PREFETCH_THRESHOLD {
            let super_chunk_len = (SUPER_CHUNK / CHUNK_SIZE) as i64;
            while last_chunk - first_chunk + 1 < super_chunk_len
                && last_chunk + 1 < total_chunks
                && inner.chunks[(last_chunk + 1) as usize].is_none()
            {
                last_chunk += 1;
            }
        }
        inner.last_fill_end = Some(last_chunk);

        self.fill_chunks(inner, first_chunk as usize, last_chunk as usize).await
    }

    /// Spec §4.7.4 step 4: one `Range` GET against the presigned URL, filling chunks in order. A
    /// 404 propagates as `NotFound` (the presigned URL's object was deleted/renamed underneath
    /// us).
    async fn fill_chunks(&self, inner: &mut Inner, first_chunk: usize, last_chunk: usize) -> Result<(), Error> {
        let first_byte = first_chunk * CHUNK_SIZE;
        let last_byte = last_chunk * CHUNK_SIZE + CHUNK_SIZE - 1;
        let range = format!("bytes={}-{}", first_byte, last_byte);

        debug!(
            "fillChunks key={} chunks={}-{} bytes={}-{}",
            self.object.key, first_chunk, last_chunk, first_byte, last_byte
        );

        let request = Request::builder()
            .method("GET")
            .uri(&self.object.presigned_get_url)
            .header("range", range)
            .body(Body::empty())
            .map_err(|err| Error::with_source(crate::error::ErrorKind::Fatal, "failed to build range request", err.into()))?;

        let response = self.http.request(request).await?;
        let status = response.status();
        if status.as_u16() == 404 {
            return Err(Error::not_found(format!("object '{}' no longer exists", self.object.key)));
        }
        if !status.is_success() {
            return Err(Error::upstream(format!("range fetch returned http status {}", status)));
        }

        let body = hyper::body::to_bytes(response.into_body()).await?;

        let mut pos = 0usize;
        for i in first_chunk..=last_chunk {
            let end = (pos + CHUNK_SIZE).min(body.len());
            let buf = body[pos..end].to_vec();
            pos = end;
            inner.chunks[i] = Some(Chunk {
                buf,
                last_read_at: Instant::now(),
            });
        }
        inner.filled_count += last_chunk - first_chunk + 1;
        Ok(())
    }

    /// Spec §4.7.4 step 6: evict all but the top [`MAX_CACHED_CHUNKS`] (by `last_read_at`) once
    /// `filled_count` passes [`MAX_CACHED_CHUNKS_CLEAN_LIMIT`].
    fn forget_old_chunks(&self, inner: &mut Inner) {
        if inner.filled_count < MAX_CACHED_CHUNKS_CLEAN_LIMIT {
            return;
        }

        let mut filled: Vec<usize> = inner
            .chunks
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.as_ref().map(|_| i))
            .collect();
        filled.sort_by_key(|&i| std::cmp::Reverse(inner.chunks[i].as_ref().unwrap().last_read_at));

        for &i in filled.iter().skip(MAX_CACHED_CHUNKS) {
            inner.chunks[i] = None;
            inner.filled_count -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn test_object(size: u64) -> ObjectInfo {
        ObjectInfo {
            key: "k".to_string(),
            size,
            last_modified: None,
            etag: String::new(),
            presigned_get_url: "http://example.invalid/k".to_string(),
            presigned_get_expires_at: Utc::now(),
        }
    }

    #[test]
    fn chunk_count_rounds_up() {
        let fc = FileContent::new(SimpleHttp::new(), test_object(CHUNK_SIZE as u64 + 1));
        // Constructed synchronously; inner state only observable via async lock in real use, but
        // the chunk-count math itself is what this test is pinning down.
        let num_chunks = ((fc.size() as usize) + CHUNK_SIZE - 1) / CHUNK_SIZE;
        assert_eq!(num_chunks, 2);
    }

    #[tokio::test]
    async fn ensure_chunks_clamps_read_to_eof_on_aligned_size() {
        // size is an exact multiple of CHUNK_SIZE: a read of the whole object has
        // `offset + count == size`, so the unclamped last_chunk would equal total_chunks (2),
        // one past the last valid index.
        let fc = FileContent::new(SimpleHttp::new(), test_object(CHUNK_SIZE as u64 * 2));
        let mut inner = fc.inner.lock().await;
        // The range fetch itself fails against the fake presigned URL, but reaching that point
        // at all (rather than panicking on an out-of-bounds chunk index first) is what matters.
        let result = fc.ensure_chunks(&mut inner, 0, CHUNK_SIZE * 2).await;
        assert!(result.is_err());
    }
}
