//! Mount/unmount helpers used by the Unpack FSM (spec §4.6.2) and the
//! Block-Device Manager's `mount`/`unmount` operations (spec §4.2).
//! Grounded on the teacher's `osutils::mount`, rebased onto the `sys-mount`
//! crate already carried in the dependency stack instead of shelling out.

use std::os::unix::io::AsRawFd;
use std::path::Path;

use anyhow::{Context, Error};
use sys_mount::{Mount, MountFlags, Unmount, UnmountFlags};

/// Mount `device_path` at `mount_point`, creating the mount point directory
/// if needed. Filesystem type is auto-detected by the kernel when `None`.
pub fn mount(device_path: &Path, mount_point: &Path, fstype: Option<&str>) -> Result<(), Error> {
    std::fs::create_dir_all(mount_point)
        .with_context(|| format!("Failed to create mount point '{}'", mount_point.display()))?;

    let mut builder = Mount::builder().flags(MountFlags::empty());
    if let Some(fstype) = fstype {
        builder = builder.fstype(fstype);
    }
    builder
        .mount(device_path, mount_point)
        .with_context(|| {
            format!(
                "Failed to mount '{}' at '{}'",
                device_path.display(),
                mount_point.display()
            )
        })?;
    Ok(())
}

/// Unmount `mount_point`. Idempotent: "not mounted" is treated as success,
/// matching the Block-Device Manager's `unmount` contract (spec §4.2).
pub fn unmount(mount_point: &Path) -> Result<(), Error> {
    match sys_mount::unmount(mount_point, UnmountFlags::empty()) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
            // EINVAL from umount(2) means "not a mount point" - already unmounted.
            Ok(())
        }
        Err(e) => Err(e).with_context(|| {
            format!("Failed to unmount '{}'", mount_point.display())
        }),
    }
}

/// Flushes the filesystem mounted at `mount_point` to its backing device via
/// `syncfs(2)`, so extracted content is durable before the caller unmounts
/// (spec §4.6.2 step 4: "fsync the filesystem; unmount").
pub fn fsync_mount_point(mount_point: &Path) -> Result<(), Error> {
    let dir = std::fs::File::open(mount_point)
        .with_context(|| format!("Failed to open '{}' for syncfs", mount_point.display()))?;
    let rc = unsafe { libc::syncfs(dir.as_raw_fd()) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("syncfs failed for '{}'", mount_point.display()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmount_nonexistent_mountpoint_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let never_mounted = dir.path().join("not-a-mount");
        std::fs::create_dir_all(&never_mounted).unwrap();
        unmount(&never_mounted).unwrap();
    }
}
