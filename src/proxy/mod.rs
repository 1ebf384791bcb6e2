//! C7 — FileProxy: a file-tree-over-HTTP server exposing an object-store backend.
//!
//! Grounded on `examples/original_source/pkg/webdavproxy/*.go` throughout; module split mirrors
//! the Go package's file split (`fs.go` -> [`fs`], `dir.go`/cache bookkeeping -> [`dircache`],
//! `file_content.go` -> [`content`], `file_read.go`/`file_write.go` -> [`file`], `proxy.go` ->
//! [`server`]), adapted onto the `dav-server` crate (the Rust counterpart of
//! `golang.org/x/net/webdav`) instead of hand-rolling PROPFIND/LOCK parsing.

pub mod backend;
pub mod content;
pub mod dircache;
pub mod fs;
pub mod file;
pub mod server;

pub const CHUNK_SIZE: usize = 4096;
pub const SUPER_CHUNK: usize = 1024 * 1024;
pub const MAX_CACHED_BYTES: usize = 2 * 1024 * 1024;
pub const MAX_CACHED_CHUNKS: usize = MAX_CACHED_BYTES / CHUNK_SIZE;
pub const MAX_CACHED_CHUNKS_CLEAN_LIMIT: usize = MAX_CACHED_CHUNKS * 2;
pub const PREFETCH_THRESHOLD: i32 = 4;

/// Dir-cache staleness sweep window (spec §4.7.6).
pub const DIRCACHE_EXPIRY_BUFFER_SECS: i64 = 15;
/// Content-cache idle eviction window (spec §4.7, `cleanupCache`'s `contentCache` sweep).
pub const CONTENT_CACHE_IDLE_SECS: u64 = 60;

/// Normalize a path into an object-store key: strip leading/trailing `/` (spec §4.7.2). The
/// empty string denotes the repository root.
pub fn normalize_key(name: &str) -> String {
    name.trim_start_matches('/').trim_end_matches('/').to_string()
}

/// Split a normalized key into `(parent, base)`, matching `path.Dir`/`path.Base` semantics used
/// by `fs.go`'s `Stat` (a key with no `/` has parent `""`).
pub fn split_parent_base(key: &str) -> (String, String) {
    match key.rfind('/') {
        Some(idx) => (key[..idx].to_string(), key[idx + 1..].to_string()),
        None => (String::new(), key.to_string()),
    }
}

/// Join a directory prefix and a child name into a key (object-store style, `/` separator).
pub fn join_key(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix, name)
    }
}

/// The backend's `list` always wants a prefix ending in `/`, the root included (spec §4.7.2;
/// `dir.go`'s `Readdir` does the same `prefix += "/"` unconditionally).
pub fn list_prefix(prefix: &str) -> String {
    if prefix.ends_with('/') {
        prefix.to_string()
    } else {
        format!("{}/", prefix)
    }
}
