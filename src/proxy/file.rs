//! Open-file handles: `ReadHandle` (shared [`FileContent`] reader) and `WriteHandle` (one-shot
//! streaming upload). Grounded on
//! `examples/original_source/pkg/webdavproxy/{file_read,file_write}.go`, re-targeted onto the
//! `dav-server` crate's `DavFile` trait.
//!
//! State machine (spec §4.7.9): `Idle -> Reading <-> Idle` for reads (each handle only carries a
//! read offset into the shared content), `Idle -> Writing -> Closed` for writes (terminal on
//! close; reopening starts a new upload). Mixed read/write on one handle is rejected.

use std::io::SeekFrom;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::{Buf, Bytes};
use dav_server::fs::{DavFile, DavMetaData, FsError, FsFuture, FsResult};
use hyper::body::Sender;
use hyper::{Body, Request};
use tokio::sync::{oneshot, Mutex};

use super::content::FileContent;
use super::fs::ObjectMetaData;
use crate::error::Error;
use crate::tools::http::SimpleHttp;

/// A read-only handle sharing a [`FileContent`] with any other concurrently-open reader of the
/// same key.
#[derive(Debug)]
pub struct ReadHandle {
    content: Arc<FileContent>,
    read_offset: u64,
}

impl ReadHandle {
    pub fn new(content: Arc<FileContent>) -> Self {
        Self { content, read_offset: 0 }
    }
}

impl DavFile for ReadHandle {
    fn metadata<'a>(&'a mut self) -> FsFuture<'a, Box<dyn DavMetaData>> {
        Box::pin(async move {
            Ok(Box::new(ObjectMetaData {
                len: self.content.size(),
                modified: SystemTime::UNIX_EPOCH,
                is_dir: false,
                etag: None,
            }) as Box<dyn DavMetaData>)
        })
    }

    fn write_buf<'a>(&'a mut self, _buf: Box<dyn Buf + Send>) -> FsFuture<'a, ()> {
        Box::pin(async move { Err(FsError::NotImplemented) })
    }

    fn write_bytes<'a>(&'a mut self, _buf: Bytes) -> FsFuture<'a, ()> {
        Box::pin(async move { Err(FsError::NotImplemented) })
    }

    fn read_bytes<'a>(&'a mut self, count: usize) -> FsFuture<'a, Bytes> {
        Box::pin(async move {
            let remaining = self.content.size().saturating_sub(self.read_offset);
            let to_read = (count as u64).min(remaining) as usize;
            let mut buf = vec![0u8; to_read];
            let n = self
                .content
                .read_at(&mut buf, self.read_offset)
                .await
                .map_err(to_fs_error)?;
            self.read_offset += n as u64;
            buf.truncate(n);
            Ok(Bytes::from(buf))
        })
    }

    fn seek<'a>(&'a mut self, pos: SeekFrom) -> FsFuture<'a, u64> {
        Box::pin(async move {
            let size = self.content.size();
            let abs = match pos {
                SeekFrom::Start(n) => n as i64,
                SeekFrom::Current(n) => self.read_offset as i64 + n,
                SeekFrom::End(n) => size as i64 + n,
            };
            if abs < 0 {
                return Err(FsError::GeneralFailure);
            }
            self.read_offset = abs as u64;
            Ok(self.read_offset)
        })
    }

    fn flush<'a>(&'a mut self) -> FsFuture<'a, ()> {
        Box::pin(async move { Ok(()) })
    }
}

fn to_fs_error(err: Error) -> FsError {
    match err.kind() {
        crate::error::ErrorKind::NotFound => FsError::NotFound,
        _ => FsError::GeneralFailure,
    }
}

/// A one-shot streaming upload (spec §4.7.5). Writes go to a bounded pipe; a background task
/// drives the HTTP PUT against the presigned URL, reading the pipe's receiving half as the
/// request body, so `Write` only blocks on TCP backpressure.
pub struct WriteHandle {
    key: String,
    sender: Option<Sender>,
    done: Mutex<Option<oneshot::Receiver<Result<(), Error>>>>,
    written: u64,
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl std::fmt::Debug for WriteHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteHandle").field("key", &self.key).finish()
    }
}

impl WriteHandle {
    /// Spec §4.7.5 steps 1-2: `presign_put` already happened in the caller; this begins the
    /// streamed PUT against the given URL. `on_close` runs once, after a successful upload, to
    /// invalidate the parent directory's cache entry and the file's own content cache entry
    /// (spec §4.7.5 step 4).
    pub async fn start(
        http: SimpleHttp,
        key: String,
        presigned_url: String,
        on_close: impl FnOnce() + Send + 'static,
    ) -> Result<Self, Error> {
        let (sender, body) = Body::channel();
        let (done_tx, done_rx) = oneshot::channel();

        let request = Request::builder()
            .method("PUT")
            .uri(&presigned_url)
            .body(body)
            .map_err(|err| Error::with_source(crate::error::ErrorKind::Fatal, "failed to build upload request", err.into()))?;

        tokio::spawn(async move {
            let result = match http.request(request).await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        Ok(())
                    } else {
                        Err(Error::upstream(format!("upload returned http status {}", status)))
                    }
                }
                Err(err) => Err(err),
            };
            let _ = done_tx.send(result);
        });

        Ok(Self {
            key,
            sender: Some(sender),
            done: Mutex::new(Some(done_rx)),
            written: 0,
            on_close: Some(Box::new(on_close)),
        })
    }
}

impl DavFile for WriteHandle {
    fn metadata<'a>(&'a mut self) -> FsFuture<'a, Box<dyn DavMetaData>> {
        Box::pin(async move {
            Ok(Box::new(ObjectMetaData {
                len: self.written,
                modified: SystemTime::UNIX_EPOCH,
                is_dir: false,
                etag: None,
            }) as Box<dyn DavMetaData>)
        })
    }

    fn write_buf<'a>(&'a mut self, mut buf: Box<dyn Buf + Send>) -> FsFuture<'a, ()> {
        Box::pin(async move {
            let bytes = buf.copy_to_bytes(buf.remaining());
            self.write_bytes(bytes).await
        })
    }

    fn write_bytes<'a>(&'a mut self, buf: Bytes) -> FsFuture<'a, ()> {
        Box::pin(async move {
            let len = buf.len() as u64;
            let sender = self.sender.as_mut().ok_or(FsError::GeneralFailure)?;
            sender.send_data(buf).await.map_err(|_| FsError::GeneralFailure)?;
            self.written += len;
            Ok(())
        })
    }

    fn read_bytes<'a>(&'a mut self, _count: usize) -> FsFuture<'a, Bytes> {
        Box::pin(async move { Err(FsError::NotImplemented) })
    }

    fn seek<'a>(&'a mut self, _pos: SeekFrom) -> FsFuture<'a, u64> {
        Box::pin(async move { Err(FsError::NotImplemented) })
    }

    /// Closes the pipe (dropping the sender) and awaits the PUT response, surfacing any HTTP
    /// error as a write-closed failure (spec §4.7.5 step 4). `dav-server` calls this on file
    /// close.
    fn flush<'a>(&'a mut self) -> FsFuture<'a, ()> {
        Box::pin(async move {
            self.sender.take();
            let mut done = self.done.lock().await;
            let result = if let Some(rx) = done.take() {
                match rx.await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(err)) => Err(to_fs_error(err)),
                    Err(_) => Err(FsError::GeneralFailure),
                }
            } else {
                Ok(())
            };
            if result.is_ok() {
                if let Some(on_close) = self.on_close.take() {
                    on_close();
                }
            }
            result
        })
    }
}
