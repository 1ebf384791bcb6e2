//! C2 — LvmOps: physical volumes, volume groups, thin pools, thin logical volumes, snapshots.
//!
//! Grounded on `examples/original_source/pkg/lvm/lvm.go`, reporting through `--reportformat
//! json` exactly as the Go code does (parsed into the same `{"report":[{"pv":[...]}]}`
//! envelope), and on the device-node naming rule in spec §4.2.

use serde::Deserialize;

use crate::error::{Error, ErrorKind};
use crate::tools::command::Command;

#[derive(Debug, Clone, Deserialize)]
pub struct PvEntry {
    pub pv_name: String,
    pub vg_name: String,
    #[serde(default)]
    pub pv_fmt: String,
    #[serde(default)]
    pub pv_attr: String,
    #[serde(default)]
    pub pv_size: String,
    #[serde(default)]
    pub pv_free: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VgEntry {
    pub vg_name: String,
    #[serde(default)]
    pub pv_count: String,
    #[serde(default)]
    pub lv_count: String,
    #[serde(default)]
    pub snap_count: String,
    #[serde(default)]
    pub vg_attr: String,
    #[serde(default)]
    pub vg_size: String,
    #[serde(default)]
    pub vg_free: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LvEntry {
    pub lv_name: String,
    pub vg_name: String,
    #[serde(default)]
    pub lv_attr: String,
    #[serde(default)]
    pub lv_size: String,
    #[serde(default)]
    pub pool_lv: String,
    #[serde(default)]
    pub origin: String,
    #[serde(default)]
    pub data_percent: String,
    #[serde(default)]
    pub lv_tags: String,
}

#[derive(Deserialize)]
struct ReportEnvelope<T> {
    report: Vec<ReportRow<T>>,
}

#[derive(Deserialize)]
struct ReportRow<T> {
    #[serde(flatten)]
    rows: std::collections::HashMap<String, Vec<T>>,
}

fn first_row<T>(envelope: ReportEnvelope<T>, key: &str) -> Result<Vec<T>, Error> {
    envelope
        .report
        .into_iter()
        .next()
        .and_then(|mut row| row.rows.remove(key))
        .ok_or_else(|| Error::upstream(format!("lvm report missing '{}' rows", key)))
}

const PV_COLS: &str = "pv_name,vg_name,pv_fmt,pv_attr,pv_size,pv_free";
const VG_COLS: &str = "vg_name,pv_count,lv_count,snap_count,vg_attr,vg_size,vg_free";
const LV_COLS: &str = "lv_name,vg_name,lv_attr,lv_size,pool_lv,origin,data_percent,lv_tags";

pub async fn list_pvs() -> Result<Vec<PvEntry>, Error> {
    let envelope: ReportEnvelope<PvEntry> = Command::new("pvs")
        .args(["--reportformat=json", "-o", PV_COLS])
        .run_capture_json()
        .await?;
    first_row(envelope, "pv")
}

pub async fn list_vgs() -> Result<Vec<VgEntry>, Error> {
    let envelope: ReportEnvelope<VgEntry> = Command::new("vgs")
        .args(["--reportformat=json", "-o", VG_COLS])
        .run_capture_json()
        .await?;
    first_row(envelope, "vg")
}

pub async fn list_lvs() -> Result<Vec<LvEntry>, Error> {
    let envelope: ReportEnvelope<LvEntry> = Command::new("lvs")
        .args(["--reportformat=json", "-o", LV_COLS])
        .run_capture_json()
        .await?;
    first_row(envelope, "lv")
}

pub async fn pv_create(dev: &str) -> Result<(), Error> {
    Command::new("pvcreate").arg(dev).run().await
}

pub async fn vg_create(vg_name: &str, devs: &[&str]) -> Result<(), Error> {
    Command::new("vgcreate").arg(vg_name).args(devs.to_vec()).run().await
}

pub async fn vg_get(vg_name: &str) -> Result<VgEntry, Error> {
    list_vgs()
        .await?
        .into_iter()
        .find(|vg| vg.vg_name == vg_name)
        .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("volume group '{}' not found", vg_name)))
}

pub async fn vg_deactivate(vg_name: &str) -> Result<(), Error> {
    Command::new("vgchange").args(["-an", vg_name]).run().await
}

/// Create a thin pool sized 100% of the VG's free space (spec §3 `ThinPool`).
pub async fn thin_pool_create(vg_name: &str, tp_name: &str, tags: &[&str]) -> Result<(), Error> {
    let mut cmd = Command::new("lvcreate").args(["-l100%FREE", "--thinpool", tp_name, vg_name]);
    for t in tags {
        cmd = cmd.args(["--addtag", t]);
    }
    cmd.run().await
}

pub async fn lv_get(vg_name: &str, lv_name: &str) -> Result<Option<LvEntry>, Error> {
    Ok(list_lvs()
        .await?
        .into_iter()
        .find(|lv| lv.vg_name == vg_name && lv.lv_name == lv_name))
}

/// Create a thin logical volume of `size_bytes` out of `tp_name` (spec §3 `FsLv`).
pub async fn thin_lv_create(vg_name: &str, tp_name: &str, lv_name: &str, size_bytes: u64, tags: &[&str]) -> Result<(), Error> {
    let size_arg = format!("{}B", size_bytes);
    let vg_tp = format!("{}/{}", vg_name, tp_name);
    let mut cmd = Command::new("lvcreate").args(["--name", lv_name, "--thin", "-V", &size_arg, &vg_tp]);
    for t in tags {
        cmd = cmd.args(["--addtag", t]);
    }
    cmd.run().await
}

/// Create a thin-pool snapshot of `src_lv` (spec §3 `Snapshot`).
pub async fn thin_snapshot_create(vg_name: &str, src_lv: &str, tp_name: &str, snap_name: &str) -> Result<(), Error> {
    let vg_src = format!("{}/{}", vg_name, src_lv);
    Command::new("lvcreate")
        .args(["--name", snap_name, "--type", "thin", "--thinpool", tp_name, &vg_src])
        .run()
        .await
}

pub async fn lv_remove(vg_name: &str, lv_name: &str) -> Result<(), Error> {
    let target = format!("{}/{}", vg_name, lv_name);
    Command::new("lvremove").args([target.as_str(), "-f"]).run().await
}

pub async fn lv_activate(vg_name: &str, lv_name: &str, activate: bool) -> Result<(), Error> {
    let target = format!("{}/{}", vg_name, lv_name);
    let onoff = if activate { "-ay" } else { "-an" };
    Command::new("lvchange").args(["-K", onoff, &target]).run().await
}

/// Find every LV on the volume group that owns `pv_device` (spec §4.2: lookup by backing
/// device). Used by `Volume::open` to locate the `fs`/`tp`-tagged LVs.
pub async fn find_pv_lvs(pv_device: &str) -> Result<Vec<LvEntry>, Error> {
    let pvs = list_pvs().await?;
    let pv = pvs
        .iter()
        .find(|pv| pv.pv_name == pv_device)
        .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("physical volume '{}' not found", pv_device)))?;
    if pv.vg_name.is_empty() {
        return Err(Error::upstream(format!("physical volume '{}' has no volume group", pv_device)));
    }

    let vgs = list_vgs().await?;
    if !vgs.iter().any(|vg| vg.vg_name == pv.vg_name) {
        return Err(Error::new(ErrorKind::NotFound, format!("volume group '{}' not found", pv.vg_name)));
    }

    let lvs = list_lvs().await?;
    Ok(lvs.into_iter().filter(|lv| lv.vg_name == pv.vg_name).collect())
}

/// Device-node naming rule from spec §4.2, bit-exact: `/dev/mapper/<esc(vg)>-<esc(lv)>` where
/// `esc(x)` replaces every `-` with `--`.
pub fn device_node(vg: &str, lv: &str) -> String {
    format!("/dev/mapper/{}-{}", escape(vg), escape(lv))
}

fn escape(x: &str) -> String {
    x.replace('-', "--")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_node_escapes_dashes() {
        assert_eq!(device_node("my-vg", "fs"), "/dev/mapper/my--vg-fs");
        assert_eq!(device_node("vg", "snap-a"), "/dev/mapper/vg-snap--a");
    }

    #[test]
    fn parses_lvs_report_envelope() {
        let raw = r#"{"report":[{"lv":[{"lv_name":"fs","vg_name":"vg0","lv_attr":"Vwi-a-tz--","lv_size":"1g","pool_lv":"thin_pool","origin":"","data_percent":"0.00","lv_tags":"fs"}]}]}"#;
        let envelope: ReportEnvelope<LvEntry> = serde_json::from_str(raw).unwrap();
        let rows = first_row(envelope, "lv").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].lv_tags, "fs");
    }
}
