//! C6 — BackupRunner: one backup cycle (snapshot, mount, serve, invoke external program).
//!
//! Grounded on `examples/original_source/pkg/volume_backup/{backup,rustic_config}.go`: same
//! snapshot/mount/proxy/config/invoke/cleanup shape, ported from Go's `defer`-stack to explicit
//! reverse-order cleanup (see `Volume::create` in [`crate::volume`] for the same pattern). The
//! external program name and scratch config are per spec §4.6/§6.4, not the original's `rustic`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use log::{error, info, warn};
use serde::Serialize;
use uuid::Uuid;

use crate::error::Error;
use crate::proxy::backend::ObjectBackend;
use crate::proxy::fs::VolumeProxyFs;
use crate::proxy::server::ProxyServer;
use crate::tools::command::{self, Command};
use crate::volume::{Volume, BACKUP_SNAPSHOT_NAME};

const BACKUP_PROGRAM: &str = "backup";

#[derive(Serialize)]
struct RusticConfig {
    repository: RusticConfigRepository,
}

#[derive(Serialize)]
struct RusticConfigRepository {
    repository: String,
    password: String,
    options: RusticConfigRepositoryOptions,
}

#[derive(Serialize)]
struct RusticConfigRepositoryOptions {
    endpoint: String,
}

/// Runs one backup cycle against an opened, mounted [`Volume`] (spec §4.6).
pub struct BackupRunner {
    repository_uuid: String,
    snapshot_mount: String,
    proxy_listen_addr: SocketAddr,
    backup_secret: String,
    backend: Arc<dyn ObjectBackend>,
    /// Marker file recording whether the first-ever cycle for this image has already run
    /// (spec §6.4: `backup --init` only on the first cycle per image, which must survive a
    /// controller restart).
    init_marker_path: PathBuf,
}

impl BackupRunner {
    pub fn new(
        image_path: &str,
        repository_uuid: impl Into<String>,
        snapshot_mount: impl Into<String>,
        proxy_listen_addr: SocketAddr,
        backup_secret: impl Into<String>,
        backend: Arc<dyn ObjectBackend>,
    ) -> Self {
        Self {
            repository_uuid: repository_uuid.into(),
            snapshot_mount: snapshot_mount.into(),
            proxy_listen_addr,
            backup_secret: backup_secret.into(),
            backend,
            init_marker_path: PathBuf::from(format!("{}.backup-initialized", image_path)),
        }
    }

    /// Run one cycle (spec §4.6). Snapshot-creation failure aborts the cycle with no snapshot
    /// left behind; external-backup-program failure is surfaced to the caller, which logs and
    /// continues on the next tick (no retry within a cycle).
    pub async fn run_cycle(&self, volume: &Volume) -> Result<(), Error> {
        command::sync();
        volume.unmount_snapshot(BACKUP_SNAPSHOT_NAME).await?;
        volume.create_snapshot(BACKUP_SNAPSHOT_NAME, true).await?;

        let result = self.run_cycle_with_snapshot(volume).await;

        if let Err(err) = volume.delete_snapshot(BACKUP_SNAPSHOT_NAME).await {
            warn!("backup snapshot deletion failed: {}", err);
        }

        result
    }

    async fn run_cycle_with_snapshot(&self, volume: &Volume) -> Result<(), Error> {
        volume.mount_snapshot(BACKUP_SNAPSHOT_NAME, &self.snapshot_mount).await?;
        let mount_result = self.run_cycle_with_mount().await;
        if let Err(err) = volume.unmount_snapshot(BACKUP_SNAPSHOT_NAME).await {
            warn!("deferred unmounting of backup snapshot failed: {}", err);
        }
        mount_result
    }

    async fn run_cycle_with_mount(&self) -> Result<(), Error> {
        let fs = VolumeProxyFs::new(self.repository_uuid.clone(), self.backend.clone());
        let proxy = ProxyServer::start(self.proxy_listen_addr, fs).await?;
        let proxy_addr = proxy.local_addr();

        let proxy_result = self.run_cycle_with_proxy(proxy_addr).await;

        if let Err(err) = proxy.stop().await {
            warn!("webdav proxy shutdown failed: {}", err);
        }

        proxy_result
    }

    async fn run_cycle_with_proxy(&self, proxy_addr: SocketAddr) -> Result<(), Error> {
        let scratch_dir = std::env::temp_dir().join(format!("syncvol-backup-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&scratch_dir).await?;

        let config_result = self.write_rustic_config(&scratch_dir, proxy_addr).await;

        let result = match config_result {
            Ok(()) => self.invoke_backup_program(&scratch_dir).await,
            Err(err) => Err(err),
        };

        if let Err(err) = tokio::fs::remove_dir_all(&scratch_dir).await {
            warn!("failed to remove backup scratch dir '{}': {}", scratch_dir.display(), err);
        }

        result
    }

    async fn write_rustic_config(&self, scratch_dir: &std::path::Path, proxy_addr: SocketAddr) -> Result<(), Error> {
        let config = RusticConfig {
            repository: RusticConfigRepository {
                repository: "opendal:webdav".to_string(),
                password: self.backup_secret.clone(),
                options: RusticConfigRepositoryOptions {
                    endpoint: format!("http://{}", proxy_addr),
                },
            },
        };
        let toml_string = toml::to_string(&config)
            .map_err(|err| Error::with_source(crate::error::ErrorKind::Fatal, "failed to encode backup config", err.into()))?;
        tokio::fs::write(scratch_dir.join("config.toml"), toml_string).await?;
        Ok(())
    }

    async fn invoke_backup_program(&self, scratch_dir: &std::path::Path) -> Result<(), Error> {
        let first_cycle = tokio::fs::metadata(&self.init_marker_path).await.is_err();

        let mut cmd = Command::new(BACKUP_PROGRAM)
            .cwd(scratch_dir.to_path_buf())
            .inherit_stdout()
            .inherit_stderr();
        if first_cycle {
            cmd = cmd.args(["--init", &self.snapshot_mount]);
        } else {
            cmd = cmd.arg(&self.snapshot_mount);
        }

        cmd.run().await?;

        if first_cycle {
            tokio::fs::write(&self.init_marker_path, b"").await?;
            info!("first backup cycle for this image completed, recorded init marker");
        }
        Ok(())
    }
}
