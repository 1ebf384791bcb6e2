//! C4 — Volume: lifecycle of a single backing image (create, open, mount, snapshot, close).
//!
//! State machine: `Created -> Opened -> Mounted -> (SnapshotHeld)* -> Opened -> Closed`
//! (spec §4.4). Grounded on
//! `examples/original_source/pkg/volume/{volume,create,mount,snapshot}.go`.

use log::{info, warn};
use uuid::Uuid;

use crate::error::Error;
use crate::fsops;
use crate::loopdev;
use crate::lvm::{self, LvEntry};
use crate::size::is_sector_aligned;
use crate::tools::command;

/// Name of the ephemeral snapshot the backup cycle uses (spec §4.4 invariant: at most one
/// `_backup` snapshot exists at a time).
pub const BACKUP_SNAPSHOT_NAME: &str = "_backup";
const THIN_POOL_NAME: &str = "thin_pool";
const FS_LV_NAME: &str = "fs";

#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub image_path: String,
    pub image_size: u64,
    pub fs_size: u64,
    pub fs_type: String,
    pub force: bool,
    pub vg_name: Option<String>,
}

/// An opened volume: a backing image attached to a loop device, with its `fs`/`tp`-tagged LVs
/// resolved.
pub struct Volume {
    image: String,
    loop_device: String,
    attached_by_us: bool,
    fs_lv: LvEntry,
    tp_lv: LvEntry,
}

impl Volume {
    pub fn image_path(&self) -> &str {
        &self.image
    }

    pub fn vg_name(&self) -> &str {
        &self.fs_lv.vg_name
    }

    pub fn fs_device_node(&self) -> String {
        lvm::device_node(&self.fs_lv.vg_name, &self.fs_lv.lv_name)
    }

    pub fn snapshot_device_node(&self, snapshot_name: &str) -> String {
        lvm::device_node(&self.fs_lv.vg_name, snapshot_name)
    }

    /// Create a new backing image and format it (spec §4.4 `Create`).
    pub async fn create(opts: CreateOptions) -> Result<(), Error> {
        if tokio::fs::metadata(&opts.image_path).await.is_ok() && !opts.force {
            return Err(Error::already_exists(format!(
                "image '{}' already exists, refusing to overwrite it",
                opts.image_path
            )));
        }
        if !fsops::is_allowed_fs_type(&opts.fs_type) {
            return Err(Error::invalid_argument(format!(
                "invalid fs-type '{}', must be one of {}",
                opts.fs_type,
                fsops::ALLOWED_FS_TYPES.join(", ")
            )));
        }
        if !is_sector_aligned(opts.image_size) {
            return Err(Error::invalid_argument("image_size must be a positive multiple of 512"));
        }
        if !is_sector_aligned(opts.fs_size) {
            return Err(Error::invalid_argument("fs_size must be a positive multiple of 512"));
        }

        let existing = loopdev::list().await?;
        if existing.iter().any(|e| e.back_file == opts.image_path) {
            return Err(Error::already_exists(format!(
                "file '{}' is already attached to a loop device",
                opts.image_path
            )));
        }

        let vg_name = opts.vg_name.clone().unwrap_or_else(|| Uuid::new_v4().to_string());

        create_preallocated_file(&opts.image_path, opts.image_size).await?;

        let loop_dev = loopdev::attach(&opts.image_path).await?;
        let result = Self::create_lvm_stack(&loop_dev, &vg_name, opts.fs_size, &opts.fs_type).await;

        // Reverse-order teardown regardless of success: deactivate the VG so a subsequent
        // `open` starts from a clean, inactive state (spec §4.4 step 8), and always detach the
        // loop device we attached for creation.
        if let Err(err) = lvm::vg_deactivate(&vg_name).await {
            warn!("failed to deactivate volume group '{}' after create: {}", vg_name, err);
        }
        if let Err(err) = loopdev::detach(&loop_dev).await {
            warn!("failed to detach loop device '{}' after create: {}", loop_dev, err);
        }

        result
    }

    async fn create_lvm_stack(loop_dev: &str, vg_name: &str, fs_size: u64, fs_type: &str) -> Result<(), Error> {
        lvm::pv_create(loop_dev).await?;
        lvm::vg_create(vg_name, &[loop_dev]).await?;
        lvm::thin_pool_create(vg_name, THIN_POOL_NAME, &["tp"]).await?;
        lvm::thin_lv_create(vg_name, THIN_POOL_NAME, FS_LV_NAME, fs_size, &["fs"]).await?;
        let fs_device = lvm::device_node(vg_name, FS_LV_NAME);
        fsops::mkfs(fs_type, &fs_device).await?;
        Ok(())
    }

    /// Open an existing image: attach its loop device (if not already attached) and resolve the
    /// `fs`/`tp`-tagged LVs (spec §4.4 `Open`).
    pub async fn open(image_path: &str) -> Result<Self, Error> {
        let (loop_device, attached_by_us) = loopdev::get_or_attach(image_path, true).await?;

        match Self::resolve_lvs(&loop_device).await {
            Ok((fs_lv, tp_lv)) => Ok(Self {
                image: image_path.to_string(),
                loop_device,
                attached_by_us,
                fs_lv,
                tp_lv,
            }),
            Err(err) => {
                if attached_by_us {
                    if let Err(detach_err) = loopdev::detach(&loop_device).await {
                        warn!("failed to detach loop device after failed open: {}", detach_err);
                    }
                }
                Err(err)
            }
        }
    }

    async fn resolve_lvs(loop_device: &str) -> Result<(LvEntry, LvEntry), Error> {
        let lvs = lvm::find_pv_lvs(loop_device).await?;

        let mut fs_lv = None;
        let mut tp_lv = None;
        for lv in lvs {
            match lv.lv_tags.as_str() {
                "fs" => fs_lv = Some(lv),
                "tp" => tp_lv = Some(lv),
                _ => {}
            }
        }

        let fs_lv = fs_lv.ok_or_else(|| Error::upstream("logical volume tagged 'fs' not found"))?;
        let tp_lv = tp_lv.ok_or_else(|| Error::upstream("logical volume tagged 'tp' not found"))?;
        Ok((fs_lv, tp_lv))
    }

    /// Mount the primary filesystem LV at `target` (spec §4.4 `Mount`).
    pub async fn mount(&self, target: &str) -> Result<(), Error> {
        fsops::mount(&self.fs_device_node(), target, false).await
    }

    /// Create (or recreate) the named snapshot (spec §4.4 `CreateSnapshot`).
    pub async fn create_snapshot(&self, name: &str, overwrite: bool) -> Result<(), Error> {
        if let Some(_existing) = lvm::lv_get(&self.fs_lv.vg_name, name).await? {
            if !overwrite {
                return Err(Error::already_exists(format!("snapshot '{}' already exists", name)));
            }
            info!("snapshot '{}' already exists, removing it before recreating", name);
            lvm::lv_remove(&self.fs_lv.vg_name, name).await?;
        }

        command::sync();

        lvm::thin_snapshot_create(&self.fs_lv.vg_name, &self.fs_lv.lv_name, &self.tp_lv.lv_name, name).await?;

        if let Err(err) = lvm::lv_activate(&self.fs_lv.vg_name, name, true).await {
            if let Err(cleanup_err) = lvm::lv_remove(&self.fs_lv.vg_name, name).await {
                warn!("failed to remove snapshot '{}' after failed activation: {}", name, cleanup_err);
            }
            return Err(err);
        }

        Ok(())
    }

    /// Mount a snapshot read-only (spec §4.4 `MountSnapshot`).
    pub async fn mount_snapshot(&self, name: &str, target: &str) -> Result<(), Error> {
        fsops::mount(&self.snapshot_device_node(name), target, true).await
    }

    /// Unmount a snapshot if currently mounted; idempotent (spec §4.4 `UnmountSnapshot`).
    pub async fn unmount_snapshot(&self, name: &str) -> Result<(), Error> {
        let device = self.snapshot_device_node(name);
        let mounts = fsops::list_mounts().await?;
        if !mounts.iter().any(|m| m.source == device) {
            return Ok(());
        }
        fsops::umount(&device).await
    }

    /// Remove a snapshot LV; idempotent on an absent name (spec §4.4 `DeleteSnapshot`).
    pub async fn delete_snapshot(&self, name: &str) -> Result<(), Error> {
        match lvm::lv_get(&self.fs_lv.vg_name, name).await? {
            Some(_) => lvm::lv_remove(&self.fs_lv.vg_name, name).await,
            None => Ok(()),
        }
    }

    /// Detach the loop device if we attached it and `detach` is requested; idempotent (spec
    /// §4.4 `Close`).
    pub async fn close(&mut self, detach: bool) -> Result<(), Error> {
        if self.attached_by_us && detach {
            loopdev::detach(&self.loop_device).await?;
            self.attached_by_us = false;
        }
        Ok(())
    }
}

async fn create_preallocated_file(path: &str, size: u64) -> Result<(), Error> {
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .await?;
    fallocate(&file, size).await?;
    Ok(())
}

/// `fallocate(2)` the file to `size` bytes (preallocate; no sparse file), spec §4.4 step 5.
async fn fallocate(file: &tokio::fs::File, size: u64) -> Result<(), Error> {
    use std::os::unix::io::AsRawFd;
    let fd = file.as_raw_fd();
    let ret = unsafe { libc::fallocate(fd, 0, 0, size as libc::off_t) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backup_snapshot_name_is_stable() {
        assert_eq!(BACKUP_SNAPSHOT_NAME, "_backup");
    }
}
