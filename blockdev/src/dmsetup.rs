//! Thin wrapper around the `dmsetup` tool, one external tool per module as
//! `sysutils` does for `losetup`/`mount`.

use std::process::Command;

use anyhow::{Context, Error};
use sysutils::exe::RunAndCheck;

pub fn create(name: &str, table: &str) -> Result<(), Error> {
    Command::new("dmsetup")
        .args(["create", name, "--table", table, "--verifyudev"])
        .run_and_check()
        .with_context(|| format!("Failed to create device-mapper device '{name}'"))
}

pub fn remove(name: &str) -> Result<(), Error> {
    let out = Command::new("dmsetup").args(["remove", name]).output();
    match out {
        Ok(o) if o.status.success() => Ok(()),
        Ok(o) => {
            let stderr = String::from_utf8_lossy(&o.stderr);
            if stderr.contains("No such device") {
                Ok(())
            } else {
                Err(anyhow::anyhow!("Failed to remove device '{name}': {stderr}"))
            }
        }
        Err(e) => Err(Error::from(e)),
    }
}

/// Best-effort removal used as the fallback path for `deactivate` (spec
/// §4.2): `dmsetup remove --deferred` queues the removal for when the last
/// open reference drops, for devices the hot-plug-synced variant couldn't
/// remove immediately.
pub fn remove_deferred(name: &str) -> Result<(), Error> {
    Command::new("dmsetup")
        .args(["remove", "--deferred", name])
        .run_and_check()
        .with_context(|| format!("Failed to defer-remove device '{name}'"))
}

pub fn message(target: &str, message: &str) -> Result<(), Error> {
    Command::new("dmsetup")
        .args(["message", target, "0", message])
        .run_and_check()
        .with_context(|| format!("Failed to send dmsetup message '{message}' to '{target}'"))
}

pub fn status(name: &str) -> Result<String, Error> {
    Command::new("dmsetup")
        .args(["status", name])
        .output_and_check()
        .with_context(|| format!("Failed to read dmsetup status for '{name}'"))
}

pub fn exists(name: &str) -> bool {
    Command::new("dmsetup")
        .args(["info", name])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Names of every active device-mapper device whose name starts with
/// `prefix`, parsed from `dmsetup ls` (spec §4.7 GC: enumerate thin devices
/// in the pool).
pub fn list_prefixed(prefix: &str) -> Result<Vec<String>, Error> {
    let out = Command::new("dmsetup")
        .arg("ls")
        .output_and_check()
        .context("Failed to list device-mapper devices")?;
    Ok(out
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter(|name| name.starts_with(prefix))
        .map(str::to_string)
        .collect())
}

pub fn device_size_sectors(device_path: &std::path::Path) -> Result<u64, Error> {
    let out = Command::new("blockdev")
        .arg("--getsz")
        .arg(device_path)
        .output_and_check()
        .with_context(|| format!("Failed to read size of '{}'", device_path.display()))?;
    out.trim()
        .parse()
        .with_context(|| format!("Unexpected blockdev output: '{out}'"))
}
