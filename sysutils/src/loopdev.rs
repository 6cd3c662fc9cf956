//! Loopback device attachment for the pool's backing files (spec §4.3,
//! §6). Shells out to `losetup`, following the teacher's convention of
//! wrapping a single external tool per module (c.f. `osutils::sfdisk`,
//! `osutils::mkfs`).

use std::fs::OpenOptions;
use std::path::Path;
use std::process::Command;

use anyhow::{Context, Error};

use crate::exe::RunAndCheck;

/// Create (or truncate) a sparse backing file of `size_bytes` at `path`.
pub fn create_backing_file(path: &Path, size_bytes: u64) -> Result<(), Error> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory '{}'", parent.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("Failed to create backing file '{}'", path.display()))?;
    file.set_len(size_bytes)
        .with_context(|| format!("Failed to size backing file '{}'", path.display()))?;
    Ok(())
}

/// Attach `path` as a loop device, returning e.g. `/dev/loop7`.
pub fn attach(path: &Path) -> Result<String, Error> {
    let out = Command::new("losetup")
        .arg("--find")
        .arg("--show")
        .arg(path)
        .output_and_check()
        .with_context(|| format!("Failed to attach loop device for '{}'", path.display()))?;
    Ok(out.trim().to_string())
}

/// Detach a loop device. Idempotent: "not attached" is treated as success.
pub fn detach(device: &str) -> Result<(), Error> {
    let result = Command::new("losetup").arg("--detach").arg(device).output();
    match result {
        Ok(out) if out.status.success() => Ok(()),
        Ok(out) => {
            let stderr = String::from_utf8_lossy(&out.stderr);
            if stderr.contains("No such device") {
                Ok(())
            } else {
                Err(anyhow::anyhow!("Failed to detach loop device '{device}': {stderr}"))
            }
        }
        Err(e) => Err(Error::from(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_backing_file_sizes_correctly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backing");
        create_backing_file(&path, 4 * 1024 * 1024).unwrap();
        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!(meta.len(), 4 * 1024 * 1024);
    }
}
