//! C3 — FsOps: format, mount, unmount a fixed whitelist of filesystems.
//!
//! `mkfs`/`mount`/`umount` are shelled out to, matching the restore daemon's own approach to
//! filesystem handling (`wofferl-proxmox-backup/src/bin/proxmox_restore_daemon/disk.rs`'s
//! `Filesystems::try_mount`). `list_mounts` parses `/proc/self/mountinfo` by hand rather than
//! pulling in a crate whose only job is that one parse (the teacher's own `tools/disks.rs`
//! leans on `proxmox::sys::linux::procfs::MountInfo` for the same purpose, which isn't
//! reachable outside the Proxmox workspace).

use crate::error::Error;
use crate::tools::command::Command;

pub const ALLOWED_FS_TYPES: &[&str] = &["ext2", "ext3", "ext4", "xfs", "btrfs"];

pub fn is_allowed_fs_type(fs_type: &str) -> bool {
    ALLOWED_FS_TYPES.contains(&fs_type)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub mountpoint: String,
}

/// Format `device` with `fs_type` (must be in [`ALLOWED_FS_TYPES`]).
pub async fn mkfs(fs_type: &str, device: &str) -> Result<(), Error> {
    if !is_allowed_fs_type(fs_type) {
        return Err(Error::invalid_argument(format!(
            "unsupported fs type '{}', must be one of {}",
            fs_type,
            ALLOWED_FS_TYPES.join(", ")
        )));
    }
    Command::new(format!("mkfs.{}", fs_type)).arg(device).run().await
}

/// Mount `device` at `target`. Idempotent: if `device`/`target` are already mounted together,
/// succeeds without re-mounting (spec §4.3).
pub async fn mount(device: &str, target: &str, ro: bool) -> Result<(), Error> {
    let mounts = list_mounts().await?;
    if mounts
        .iter()
        .any(|m| m.source == device && m.mountpoint == target)
    {
        return Ok(());
    }

    tokio::fs::create_dir_all(target).await?;

    let mut cmd = Command::new("mount");
    if ro {
        cmd = cmd.arg("-oro");
    }
    cmd.args([device, target]).run().await
}

/// Unmount by device path or mountpoint.
pub async fn umount(target_or_device: &str) -> Result<(), Error> {
    Command::new("umount").arg(target_or_device).run().await
}

/// Parse `/proc/self/mountinfo`: `source mountpoint` pairs (fields 10/5 of the mountinfo format:
/// `... - fstype source superopts`, mountpoint is field 5).
pub async fn list_mounts() -> Result<Vec<MountEntry>, Error> {
    let contents = tokio::fs::read_to_string("/proc/self/mountinfo").await?;
    Ok(parse_mountinfo(&contents))
}

fn parse_mountinfo(contents: &str) -> Vec<MountEntry> {
    let mut entries = Vec::new();
    for line in contents.lines() {
        let Some(sep) = line.find(" - ") else { continue };
        let (left, right) = line.split_at(sep);
        let right = &right[" - ".len()..];

        let left_fields: Vec<&str> = left.split_whitespace().collect();
        let right_fields: Vec<&str> = right.split_whitespace().collect();
        if left_fields.len() < 5 || right_fields.len() < 2 {
            continue;
        }
        let mountpoint = left_fields[4].to_string();
        let source = right_fields[1].to_string();
        entries.push(MountEntry { source, mountpoint });
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unsupported_fs_type() {
        assert!(!is_allowed_fs_type("vfat"));
        assert!(is_allowed_fs_type("ext4"));
    }

    #[test]
    fn parses_mountinfo_lines() {
        let sample = "36 35 98:0 / / rw,noatime master:1 - ext4 /dev/mapper/vg-fs rw,errors=remount-ro\n\
                       60 36 0:25 / /proc rw,nosuid,nodev - proc proc rw\n";
        let entries = parse_mountinfo(sample);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].source, "/dev/mapper/vg-fs");
        assert_eq!(entries[0].mountpoint, "/");
    }
}
