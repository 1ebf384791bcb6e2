//! VolumeProxyFs: the `dav-server` filesystem backing FileProxy (spec §4.7).
//!
//! Grounded on `examples/original_source/pkg/webdavproxy/fs.go`'s `FileSystem`, re-targeted from
//! `golang.org/x/net/webdav`'s `webdav.FileSystem` onto the Rust `dav-server` crate's
//! `DavFileSystem` trait (the nearest idiomatic equivalent in the corpus — no pack repo hand-rolls
//! its own PROPFIND/LOCK parsing, so we lean on the ecosystem crate rather than reinventing it).

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime};

use dav_server::davpath::DavPath;
use dav_server::fs::{DavDirEntry, DavFile, DavFileSystem, DavMetaData, FsError, FsFuture, FsResult, FsStream, OpenOptions, ReadDirMeta};
use futures::stream;
use log::info;

use super::backend::ObjectBackend;
use super::content::FileContent;
use super::dircache::{entry_by_name, DirCache, DirEntry};
use super::file::{ReadHandle, WriteHandle};
use super::{join_key, normalize_key, split_parent_base, CONTENT_CACHE_IDLE_SECS};
use crate::error::ErrorKind;
use crate::tools::http::SimpleHttp;

/// One entry's worth of metadata, handed back from `metadata`/`read_dir` (spec §4.7.7).
#[derive(Clone)]
pub struct ObjectMetaData {
    pub len: u64,
    pub modified: SystemTime,
    pub is_dir: bool,
    pub etag: Option<String>,
}

impl DavMetaData for ObjectMetaData {
    fn len(&self) -> u64 {
        self.len
    }
    fn modified(&self) -> FsResult<SystemTime> {
        Ok(self.modified)
    }
    fn is_dir(&self) -> bool {
        self.is_dir
    }
    fn etag(&self) -> Option<String> {
        self.etag.clone()
    }
}

struct NamedEntry {
    name: String,
    meta: ObjectMetaData,
}

impl DavDirEntry for NamedEntry {
    fn name(&self) -> Vec<u8> {
        self.name.clone().into_bytes()
    }
    fn metadata<'a>(&'a self) -> FsFuture<'a, Box<dyn DavMetaData>> {
        let meta = self.meta.clone();
        Box::pin(async move { Ok(Box::new(meta) as Box<dyn DavMetaData>) })
    }
}

fn dir_entry_to_meta(entry: &DirEntry) -> ObjectMetaData {
    match entry {
        DirEntry::File(oi) => ObjectMetaData {
            len: oi.size,
            modified: oi.last_modified.map(|t| t.into()).unwrap_or(SystemTime::UNIX_EPOCH),
            is_dir: false,
            etag: Some(oi.etag.clone()),
        },
        DirEntry::Dir { .. } => ObjectMetaData {
            len: 0,
            modified: SystemTime::UNIX_EPOCH,
            is_dir: true,
            etag: None,
        },
    }
}

/// Filesystem exposing one repository's object-store contents over WebDAV (spec §4.7).
pub struct VolumeProxyFs {
    repository_uuid: String,
    backend: Arc<dyn ObjectBackend>,
    http: SimpleHttp,
    dir_cache: Arc<DirCache>,
    content_cache: Arc<StdMutex<HashMap<String, Arc<FileContent>>>>,
}

impl std::fmt::Debug for VolumeProxyFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeProxyFs").field("repository_uuid", &self.repository_uuid).finish()
    }
}

impl VolumeProxyFs {
    pub fn new(repository_uuid: String, backend: Arc<dyn ObjectBackend>) -> Self {
        Self {
            repository_uuid,
            backend,
            http: SimpleHttp::new(),
            dir_cache: Arc::new(DirCache::new()),
            content_cache: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    pub fn repository_uuid(&self) -> &str {
        &self.repository_uuid
    }

    fn dir_cache_handle(&self) -> Arc<DirCache> {
        self.dir_cache.clone()
    }

    fn content_cache_handle(&self) -> Arc<StdMutex<HashMap<String, Arc<FileContent>>>> {
        self.content_cache.clone()
    }

    /// Invalidate everything cached under `key`, then walk upward invalidating ancestor
    /// directory listings (spec §4.7.6; `fs.go`'s `forgetCache`).
    fn forget_cache(&self, key: &str) {
        let key = normalize_key(key);
        self.content_cache.lock().unwrap().remove(&key);
        self.dir_cache.invalidate(&key);
    }

    /// Periodic sweep: drop dir-cache entries nearing presigned-URL expiry, and content-cache
    /// entries idle past [`CONTENT_CACHE_IDLE_SECS`] (spec §4.7.6, `cleanupCache`).
    pub async fn cleanup_cache(&self) {
        self.dir_cache.sweep_stale(chrono::Utc::now()).await;

        let idle = Duration::from_secs(CONTENT_CACHE_IDLE_SECS);
        let mut stale_keys = Vec::new();
        let snapshot: Vec<(String, Arc<FileContent>)> = {
            let map = self.content_cache.lock().unwrap();
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        for (key, content) in snapshot {
            if content.last_used().await.elapsed() >= idle {
                stale_keys.push(key);
            }
        }
        if !stale_keys.is_empty() {
            let mut map = self.content_cache.lock().unwrap();
            for key in stale_keys {
                info!("removing content cache entry '{}'", key);
                map.remove(&key);
            }
        }
    }

    async fn stat_entry(&self, name: &str) -> FsResult<ObjectMetaData> {
        let key = normalize_key(name);
        if key.is_empty() {
            return Ok(ObjectMetaData {
                len: 0,
                modified: SystemTime::UNIX_EPOCH,
                is_dir: true,
                etag: None,
            });
        }

        let (parent, base) = split_parent_base(&key);
        let entries = self.dir_cache.list(self.backend.as_ref(), &parent).await.map_err(to_fs_error)?;
        entry_by_name(&entries, &base).map(|e| dir_entry_to_meta(&e)).ok_or(FsError::NotFound)
    }
}

fn to_fs_error(err: crate::error::Error) -> FsError {
    match err.kind() {
        ErrorKind::NotFound => FsError::NotFound,
        ErrorKind::AlreadyExists => FsError::Exists,
        ErrorKind::InvalidArgument => FsError::GeneralFailure,
        _ => FsError::GeneralFailure,
    }
}

impl DavFileSystem for VolumeProxyFs {
    fn open<'a>(&'a self, path: &'a DavPath, options: OpenOptions) -> FsFuture<'a, Box<dyn DavFile>> {
        Box::pin(async move {
            self.cleanup_cache().await;

            let name = path.as_url_string();
            let key = normalize_key(&name);

            if options.write && options.create {
                let presigned = self.backend.presign_put(&key).await.map_err(to_fs_error)?;
                let close_key = key.clone();
                let dir_cache = self.dir_cache_handle();
                let content_cache = self.content_cache_handle();
                let handle = WriteHandle::start(self.http.clone(), key, presigned.url, move || {
                    content_cache.lock().unwrap().remove(&close_key);
                    dir_cache.invalidate(&close_key);
                })
                .await
                .map_err(to_fs_error)?;
                return Ok(Box::new(handle) as Box<dyn DavFile>);
            }

            let meta = self.stat_entry(&name).await?;
            if meta.is_dir {
                return Err(FsError::Forbidden);
            }

            let content = {
                let mut map = self.content_cache.lock().unwrap();
                map.get(&key).cloned()
            };
            let content = match content {
                Some(c) => c,
                None => {
                    let (parent, base) = split_parent_base(&key);
                    let entries = self.dir_cache.list(self.backend.as_ref(), &parent).await.map_err(to_fs_error)?;
                    let object = match entry_by_name(&entries, &base) {
                        Some(DirEntry::File(oi)) => oi,
                        _ => return Err(FsError::NotFound),
                    };
                    let c = Arc::new(FileContent::new(self.http.clone(), object));
                    self.content_cache.lock().unwrap().insert(key.clone(), c.clone());
                    c
                }
            };

            Ok(Box::new(ReadHandle::new(content)) as Box<dyn DavFile>)
        })
    }

    fn read_dir<'a>(&'a self, path: &'a DavPath, _meta: ReadDirMeta) -> FsFuture<'a, FsStream<Box<dyn DavDirEntry>>> {
        Box::pin(async move {
            let key = normalize_key(&path.as_url_string());
            let entries = self.dir_cache.list(self.backend.as_ref(), &key).await.map_err(to_fs_error)?;
            let named: Vec<Box<dyn DavDirEntry>> = entries
                .into_iter()
                .map(|e| {
                    let meta = dir_entry_to_meta(&e);
                    Box::new(NamedEntry {
                        name: e.name().to_string(),
                        meta,
                    }) as Box<dyn DavDirEntry>
                })
                .collect();
            Ok(Box::pin(stream::iter(named)) as FsStream<Box<dyn DavDirEntry>>)
        })
    }

    fn metadata<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, Box<dyn DavMetaData>> {
        Box::pin(async move {
            let meta = self.stat_entry(&path.as_url_string()).await?;
            Ok(Box::new(meta) as Box<dyn DavMetaData>)
        })
    }

    /// `MKCOL` is always a no-op success (spec §4.7.1): the object store has no real
    /// directories, so there's nothing to create.
    fn create_dir<'a>(&'a self, _path: &'a DavPath) -> FsFuture<'a, ()> {
        Box::pin(async move { Ok(()) })
    }

    fn remove_dir<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, ()> {
        self.remove_all(path)
    }

    fn remove_file<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, ()> {
        Box::pin(async move {
            let key = normalize_key(&path.as_url_string());
            self.backend.delete(&key).await.map_err(to_fs_error)?;
            self.forget_cache(&key);
            Ok(())
        })
    }

    fn rename<'a>(&'a self, from: &'a DavPath, to: &'a DavPath) -> FsFuture<'a, ()> {
        Box::pin(async move {
            let old_key = normalize_key(&from.as_url_string());
            let new_key = normalize_key(&to.as_url_string());

            let meta = self.stat_entry(&from.as_url_string()).await?;
            if meta.is_dir {
                return Err(FsError::Forbidden);
            }

            self.backend.rename(&old_key, &new_key).await.map_err(to_fs_error)?;
            self.forget_cache(&old_key);
            self.forget_cache(&new_key);
            Ok(())
        })
    }
}

impl VolumeProxyFs {
    /// Recursive delete (spec §4.7.8 `remove_all`): walk via the same list path used by
    /// directory reads, delete every leaf, invalidating caches as we go. Unlike
    /// `fs.go`'s `delete()` (which forgets the cache *before* the RPC call), this invalidates
    /// *after* the backend confirms the delete, closing the window where a concurrent reader
    /// could repopulate the cache with soon-to-be-stale data.
    fn remove_all<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, ()> {
        Box::pin(async move {
            let key = normalize_key(&path.as_url_string());
            let mut stack = vec![key];
            let mut leaves = Vec::new();

            while let Some(current) = stack.pop() {
                let meta = self.stat_entry(&format!("/{}", current)).await?;
                if !meta.is_dir {
                    leaves.push(current);
                    continue;
                }
                let entries = self.dir_cache.list(self.backend.as_ref(), &current).await.map_err(to_fs_error)?;
                for entry in entries {
                    stack.push(join_key(&current, entry.name()));
                }
            }

            for leaf in leaves {
                self.backend.delete(&leaf).await.map_err(to_fs_error)?;
                self.forget_cache(&leaf);
            }
            Ok(())
        })
    }
}
