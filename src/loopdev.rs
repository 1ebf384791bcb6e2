//! C1 — LoopDev: bind a regular file to a kernel loop block device.
//!
//! Grounded on `examples/original_source/pkg/losetup/losetup.go`: every operation shells out to
//! `losetup`, exactly as the teacher's own disk tooling shells out to `lsblk`/`zpool`/etc.
//! rather than talking to the kernel loop ioctls directly (see
//! `wofferl-proxmox-backup/src/tools/disks.rs`).

use serde::Deserialize;

use crate::error::{Error, ErrorKind};
use crate::tools::command::Command;

/// One entry of `losetup -J` (field names mirror the Go struct tags 1:1).
#[derive(Debug, Clone, Deserialize)]
pub struct Entry {
    pub name: String,
    #[serde(default)]
    pub sizelimit: i64,
    #[serde(default)]
    pub offset: i64,
    #[serde(default)]
    pub autoclear: bool,
    #[serde(default)]
    pub ro: bool,
    #[serde(rename = "back-file")]
    pub back_file: String,
    #[serde(default)]
    pub dio: bool,
    #[serde(rename = "log-sec", default)]
    pub log_sec: i64,
}

#[derive(Debug, Deserialize)]
struct Holder {
    loopdevices: Vec<Entry>,
}

/// List current loop-device bindings via `losetup -J`.
pub async fn list() -> Result<Vec<Entry>, Error> {
    let holder: Holder = Command::new("losetup").arg("-J").run_capture_json().await?;
    Ok(holder.loopdevices)
}

/// Attach `path` to the next free loop device, returning its device node.
pub async fn attach(path: &str) -> Result<String, Error> {
    let stdout = Command::new("losetup")
        .args(["-f", "--show", path])
        .run_capture_stdout()
        .await?;
    let dev = String::from_utf8_lossy(&stdout).trim().to_string();
    if dev.is_empty() {
        return Err(Error::upstream("losetup did not return a device path"));
    }
    Ok(dev)
}

/// If `path` is already bound to a loop device, return it (`newly_attached = false`). Otherwise,
/// if `allow_attach`, attach a new one; else fail with `NotFound`.
pub async fn get_or_attach(path: &str, allow_attach: bool) -> Result<(String, bool), Error> {
    let entries = list().await?;
    for e in &entries {
        if e.back_file == path {
            return Ok((e.name.clone(), false));
        }
    }

    if !allow_attach {
        return Err(Error::new(ErrorKind::NotFound, format!("no loop device bound to '{}'", path)));
    }

    let dev = attach(path).await?;
    Ok((dev, true))
}

/// Detach a loop device.
pub async fn detach(dev: &str) -> Result<(), Error> {
    Command::new("losetup").args(["-d", dev]).run().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_losetup_json() {
        let raw = r#"{"loopdevices": [{"name":"/dev/loop0","sizelimit":0,"offset":0,"autoclear":false,"ro":false,"back-file":"/tmp/v.img","dio":false,"log-sec":512}]}"#;
        let holder: Holder = serde_json::from_str(raw).unwrap();
        assert_eq!(holder.loopdevices.len(), 1);
        assert_eq!(holder.loopdevices[0].back_file, "/tmp/v.img");
        assert_eq!(holder.loopdevices[0].name, "/dev/loop0");
    }
}
