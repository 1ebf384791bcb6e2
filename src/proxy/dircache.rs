//! DirCache: memoized directory listings with upward-walking invalidation (spec §4.7.6).
//! Grounded on `examples/original_source/pkg/webdavproxy/{dir,fs}.go`'s `dirCache` map,
//! `dir.Readdir`, and `FileSystem.forgetCache`/`cleanupCache`.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::backend::{ObjectBackend, ObjectInfo};
use super::{list_prefix, split_parent_base, DIRCACHE_EXPIRY_BUFFER_SECS};
use crate::error::Error;

#[derive(Clone)]
pub enum DirEntry {
    File(ObjectInfo),
    Dir { name: String },
}

impl DirEntry {
    pub fn name(&self) -> &str {
        match self {
            DirEntry::File(oi) => oi.key.rsplit('/').next().unwrap_or(&oi.key),
            DirEntry::Dir { name } => name,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, DirEntry::Dir { .. })
    }
}

struct Listing {
    entries: Mutex<Option<Vec<DirEntry>>>,
    last_used: StdMutex<Instant>,
}

/// Per-(repository) directory cache. Entries are keyed by normalized prefix (`""` = root).
pub struct DirCache {
    entries: StdMutex<HashMap<String, std::sync::Arc<Listing>>>,
}

impl DirCache {
    pub fn new() -> Self {
        Self {
            entries: StdMutex::new(HashMap::new()),
        }
    }

    /// Fetch (or return cached) listing for `prefix`, populating the cache on first access
    /// (spec §4.7.6, `dir.go`'s `Readdir`).
    pub async fn list(&self, backend: &dyn ObjectBackend, prefix: &str) -> Result<Vec<DirEntry>, Error> {
        let listing = {
            let mut map = self.entries.lock().unwrap();
            map.entry(prefix.to_string())
                .or_insert_with(|| {
                    std::sync::Arc::new(Listing {
                        entries: Mutex::new(None),
                        last_used: StdMutex::new(Instant::now()),
                    })
                })
                .clone()
        };

        *listing.last_used.lock().unwrap() = Instant::now();

        let mut guard = listing.entries.lock().await;
        if let Some(entries) = guard.as_ref() {
            return Ok(entries.clone());
        }

        let result = backend.list(&list_prefix(prefix)).await?;
        let mut entries = Vec::with_capacity(result.objects.len() + result.common_prefixes.len());
        for oi in result.objects {
            entries.push(DirEntry::File(oi));
        }
        for cp in result.common_prefixes {
            entries.push(DirEntry::Dir {
                name: cp.trim_end_matches('/').rsplit('/').next().unwrap_or(&cp).to_string(),
            });
        }
        *guard = Some(entries.clone());
        Ok(entries)
    }

    /// Invalidate `key`'s parent directory listing and walk upward invalidating each ancestor,
    /// stopping at the root or at an ancestor not present in cache (spec §4.7.6). `key` is the
    /// full object key that was mutated (never itself a cached directory entry); the walk starts
    /// one level up, at its parent.
    pub fn invalidate(&self, key: &str) {
        let mut map = self.entries.lock().unwrap();
        let (parent, _) = split_parent_base(key);
        self.invalidate_locked(&mut map, &parent);
    }

    fn invalidate_locked(&self, map: &mut HashMap<String, std::sync::Arc<Listing>>, key: &str) {
        if map.remove(key).is_none() {
            return;
        }
        if key.is_empty() {
            return;
        }
        let (parent, _) = split_parent_base(key);
        self.invalidate_locked(map, &parent);
    }

    /// Staleness sweep (spec §4.7.6): drop any entry whose minimum `presigned_get_expires_at`
    /// across its file entries is within [`DIRCACHE_EXPIRY_BUFFER_SECS`] of now.
    pub async fn sweep_stale(&self, now: DateTime<Utc>) {
        let buffer = chrono::Duration::seconds(DIRCACHE_EXPIRY_BUFFER_SECS);
        let candidates: Vec<(String, std::sync::Arc<Listing>)> = {
            let map = self.entries.lock().unwrap();
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        let mut to_remove = Vec::new();
        for (key, listing) in candidates {
            let guard = listing.entries.lock().await;
            if let Some(entries) = guard.as_ref() {
                let any_expiring = entries.iter().any(|e| match e {
                    DirEntry::File(oi) => oi.presigned_get_expires_at - buffer <= now,
                    DirEntry::Dir { .. } => false,
                });
                if any_expiring {
                    to_remove.push(key);
                }
            }
        }

        if !to_remove.is_empty() {
            let mut map = self.entries.lock().unwrap();
            for key in to_remove {
                map.remove(&key);
            }
        }
    }
}

impl Default for DirCache {
    fn default() -> Self {
        Self::new()
    }
}

pub fn entry_by_name(entries: &[DirEntry], base: &str) -> Option<DirEntry> {
    entries.iter().find(|e| e.name() == base).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalidate_walks_up_to_root() {
        let cache = DirCache::new();
        {
            let mut map = cache.entries.lock().unwrap();
            for k in ["", "a", "a/b"] {
                map.insert(
                    k.to_string(),
                    std::sync::Arc::new(Listing {
                        entries: Mutex::new(Some(vec![])),
                        last_used: StdMutex::new(Instant::now()),
                    }),
                );
            }
        }
        cache.invalidate("a/b/c.txt");
        let map = cache.entries.lock().unwrap();
        assert!(!map.contains_key("a/b"));
        assert!(!map.contains_key("a"));
        assert!(!map.contains_key(""));
    }

    #[test]
    fn invalidate_stops_at_uncached_ancestor() {
        let cache = DirCache::new();
        {
            let mut map = cache.entries.lock().unwrap();
            map.insert(
                "a/b".to_string(),
                std::sync::Arc::new(Listing {
                    entries: Mutex::new(Some(vec![])),
                    last_used: StdMutex::new(Instant::now()),
                }),
            );
            map.insert(
                "".to_string(),
                std::sync::Arc::new(Listing {
                    entries: Mutex::new(Some(vec![])),
                    last_used: StdMutex::new(Instant::now()),
                }),
            );
        }
        cache.invalidate("a/b/c.txt");
        let map = cache.entries.lock().unwrap();
        // "a" was never cached, so the walk stops there and the root survives.
        assert!(!map.contains_key("a/b"));
        assert!(map.contains_key(""));
    }
}
