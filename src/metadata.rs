//! MetadataProvider: the "relational database" / "HTTP/REST surface" external collaborator
//! (spec §1, out of scope) that [`crate::controller::BackupController`] resolves repository and
//! volume metadata through. Grounded on `examples/original_source/pkg/client/client.go`'s
//! `GetRepositoryById`/`GetVolumeById` calls.

use futures::future::BoxFuture;
use hyper::{Body, Request};
use serde::Deserialize;

use crate::error::{Error, ErrorKind};
use crate::tools::http::SimpleHttp;

/// Repository metadata (spec §3): object-store location plus the secret handed to the external
/// backup program.
#[derive(Debug, Clone, Deserialize)]
pub struct Repository {
    pub uuid: String,
    pub name: String,
    pub s3: S3Config,
    pub backup_secret: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    pub endpoint: String,
    #[serde(default)]
    pub region: Option<String>,
    pub bucket: String,
    pub prefix: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

/// Volume metadata (spec §3). `lock` mirrors the server-held lease, if any.
#[derive(Debug, Clone, Deserialize)]
pub struct VolumeMeta {
    pub uuid: String,
    pub name: String,
    pub repository_uuid: String,
    pub fs_size: u64,
    pub fs_type: String,
    #[serde(default)]
    pub lock: Option<VolumeLock>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VolumeLock {
    pub uuid: String,
    pub lock_time: i64,
}

/// External collaborator contract standing in for the DB/REST surface (spec §1).
pub trait MetadataProvider: Send + Sync {
    fn resolve_repository<'a>(&'a self, repository_uuid: &'a str) -> BoxFuture<'a, Result<Repository, Error>>;
    fn resolve_volume<'a>(&'a self, volume_uuid: &'a str) -> BoxFuture<'a, Result<VolumeMeta, Error>>;
}

/// JSON-RPC-backed implementation, calling the same endpoints
/// `original_source/pkg/client/client.go` does.
pub struct ApiMetadataProvider {
    http: SimpleHttp,
    base_url: String,
    token: Option<String>,
}

impl ApiMetadataProvider {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            http: SimpleHttp::new(),
            base_url: base_url.into(),
            token,
        }
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T, Error> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), path.trim_start_matches('/'));
        let mut builder = Request::builder().method("GET").uri(&url);
        if let Some(token) = &self.token {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        let request = builder
            .body(Body::empty())
            .map_err(|err| Error::with_source(ErrorKind::Fatal, "failed to build metadata request", err.into()))?;

        let response = self.http.request(request).await?;
        let status = response.status();
        let body = hyper::body::to_bytes(response.into_body()).await?;
        if status.as_u16() == 404 {
            return Err(Error::not_found(format!("'{}' not found", path)));
        }
        if !status.is_success() {
            return Err(Error::upstream(format!("'{}' returned http status {}", path, status)));
        }
        serde_json::from_slice(&body).map_err(|err| Error::with_source(ErrorKind::Upstream, "failed to parse metadata reply", err.into()))
    }
}

impl MetadataProvider for ApiMetadataProvider {
    fn resolve_repository<'a>(&'a self, repository_uuid: &'a str) -> BoxFuture<'a, Result<Repository, Error>> {
        Box::pin(async move { self.get_json(&format!("v1/repositories/{}", repository_uuid)).await })
    }

    fn resolve_volume<'a>(&'a self, volume_uuid: &'a str) -> BoxFuture<'a, Result<VolumeMeta, Error>> {
        Box::pin(async move { self.get_json(&format!("v1/volumes/{}", volume_uuid)).await })
    }
}
