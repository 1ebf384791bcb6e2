//! C8 — BackupController: the top-level state machine driving one volume's whole lifecycle
//! (lock -> ensure local image -> mount -> periodic backup -> lock-refresh loop -> graceful
//! shutdown). Grounded on `examples/original_source/pkg/volume_serve/volume_serve.go`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::backup_runner::BackupRunner;
use crate::error::Error;
use crate::lock::LockClient;
use crate::metadata::MetadataProvider;
use crate::proxy::backend::RpcBackend;
use crate::volume::{CreateOptions, Volume};

/// Everything [`BackupController::run`] needs, gathered up front (spec §4.8).
pub struct ControllerConfig {
    pub api_base_url: String,
    pub api_token: Option<String>,
    pub repository_uuid: String,
    pub volume_uuid: String,
    pub image_path: String,
    pub mount_path: String,
    pub snapshot_mount: String,
    pub backup_interval: Duration,
    pub proxy_listen_addr: SocketAddr,
    pub prev_lock_uuid: Option<String>,
}

pub struct BackupController<M: MetadataProvider> {
    config: ControllerConfig,
    metadata: M,
}

impl<M: MetadataProvider> BackupController<M> {
    pub fn new(config: ControllerConfig, metadata: M) -> Self {
        Self { config, metadata }
    }

    /// Run until `cancel` fires (spec §4.8). Returns once every owned background task has
    /// exited and the volume is closed.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), Error> {
        let repository = self.metadata.resolve_repository(&self.config.repository_uuid).await?;
        let volume_meta = self.metadata.resolve_volume(&self.config.volume_uuid).await?;

        let lock_client = Arc::new(LockClient::new(
            self.config.api_base_url.clone(),
            self.config.api_token.clone(),
            self.config.repository_uuid.clone(),
            self.config.volume_uuid.clone(),
        ));
        lock_client.acquire(self.config.prev_lock_uuid.as_deref()).await?;
        let refresh_handle = lock_client.clone().spawn_refresh_loop(cancel.clone());

        let mut volume = self.ensure_volume_open(&volume_meta).await?;
        volume.mount(&self.config.mount_path).await?;

        let backend: Arc<dyn crate::proxy::backend::ObjectBackend> = Arc::new(RpcBackend::new(
            self.config.api_base_url.clone(),
            self.config.api_token.clone(),
            self.config.repository_uuid.clone(),
        ));
        let runner = BackupRunner::new(
            &self.config.image_path,
            self.config.repository_uuid.clone(),
            self.config.snapshot_mount.clone(),
            self.config.proxy_listen_addr,
            repository.backup_secret.clone(),
            backend,
        );

        self.backup_loop(&runner, &volume, cancel.clone()).await;

        cancel.cancel();
        if let Err(err) = refresh_handle.await {
            warn!("lock refresh task panicked: {}", err);
        }

        volume.close(true).await?;
        info!("volume '{}' closed, lease will expire naturally", self.config.volume_uuid);
        Ok(())
    }

    async fn ensure_volume_open(&self, volume_meta: &crate::metadata::VolumeMeta) -> Result<Volume, Error> {
        if tokio::fs::metadata(&self.config.image_path).await.is_err() {
            info!("image '{}' does not exist yet, creating it", self.config.image_path);
            Volume::create(CreateOptions {
                image_path: self.config.image_path.clone(),
                image_size: volume_meta.fs_size * 2,
                fs_size: volume_meta.fs_size,
                fs_type: volume_meta.fs_type.clone(),
                force: false,
                vg_name: None,
            })
            .await?;
        }
        Volume::open(&self.config.image_path).await
    }

    /// Spec §4.8 step 5/§5: every `backup_interval`, run one [`BackupRunner`] cycle; on error,
    /// log and continue. Exits (without returning an error) once `cancel` fires.
    async fn backup_loop(&self, runner: &BackupRunner, volume: &Volume, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.backup_interval);
        ticker.tick().await; // first tick fires immediately; skip it, the caller just mounted.
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = runner.run_cycle(volume).await {
                        error!("backup cycle failed, will retry next tick: {}", err);
                    }
                }
            }
        }
    }
}
