//! Atomic exclusive-create file primitive underlying the process lock
//! (spec §4.4). Kept low-level and domain-agnostic here; `safeguard` owns
//! the PID/timestamp record format and stale-lock recovery policy.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::Path;

/// Attempt to atomically create `path`, failing with `ErrorKind::AlreadyExists`
/// if it already exists. This is the O_EXCL semantics the process lock relies
/// on for correctness: only one caller across the host can win the create.
pub fn exclusive_create(path: &Path) -> io::Result<File> {
    OpenOptions::new().write(true).create_new(true).open(path)
}

/// Remove `path` if present; absence is success (idempotent release).
pub fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusive_create_fails_on_second_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");
        exclusive_create(&path).unwrap();
        let err = exclusive_create(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }

    #[test]
    fn remove_if_present_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");
        remove_if_present(&path).unwrap();
        exclusive_create(&path).unwrap();
        remove_if_present(&path).unwrap();
        remove_if_present(&path).unwrap();
    }
}
