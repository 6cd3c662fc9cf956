//! Tarball extractor (consumed, spec §6): a secure `extract(archive, dest)`
//! primitive. Parsing internals are out of scope; this crate only depends
//! on the trait-shaped interface plus the canonical-layout verification
//! that the Unpack FSM's `verify-layout` state owns directly.

use std::path::Path;

use pipeline_api::constants::{MAX_FILE_COUNT, MAX_FILE_SIZE_BYTES, MAX_TOTAL_SIZE_BYTES};
use pipeline_api::error::{ManagerError, PipelineError};

pub struct ExtractOutcome {
    pub file_count: u64,
    pub byte_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ExtractError {
    #[error("path traversal detected")]
    PathTraversal,
    #[error("symlink target escapes destination")]
    SymlinkEscape,
    #[error("a file exceeded the per-file or total size limit")]
    SizeLimit,
    #[error("archive exceeded the maximum file count")]
    CountLimit,
    #[error("archive is corrupt")]
    Corrupt,
    #[error("extraction timed out")]
    Timeout,
}

/// Invoked by the Unpack FSM's `extract` state (spec §4.6.2). Enforced
/// limits per spec §6: ≤1 GiB per file, ≤10 GiB total, ≤100,000 files.
pub trait Extractor: Send + Sync {
    /// Enumerates `archive_path` without writing anything, confirming it
    /// parses cleanly (spec §4.6.1 `validate`).
    fn validate(&self, archive_path: &Path) -> Result<(), ExtractError>;

    fn extract(&self, archive_path: &Path, dest_dir: &Path) -> Result<ExtractOutcome, ExtractError>;
}

/// Verifies the canonical rootfs layout (spec §4.6.2, GLOSSARY): either a
/// `rootfs/` subtree or `{etc, usr, var}` directly at the mount root, with
/// `etc` and `usr` not world-writable.
pub fn verify_canonical_layout(mount_point: &Path) -> Result<(), ManagerError> {
    let root = if mount_point.join("rootfs").is_dir() {
        mount_point.join("rootfs")
    } else {
        mount_point.to_path_buf()
    };

    for required in ["etc", "usr"] {
        let path = root.join(required);
        if !path.is_dir() {
            return Err(ManagerError::new(PipelineError::LayoutInvalid {
                reason: format!("missing required directory '{required}'"),
            }));
        }
        if is_world_writable(&path)? {
            return Err(ManagerError::new(PipelineError::LayoutInvalid {
                reason: format!("'{required}' is world-writable"),
            }));
        }
    }
    if !root.join("var").is_dir() {
        return Err(ManagerError::new(PipelineError::LayoutInvalid {
            reason: "missing required directory 'var'".to_string(),
        }));
    }
    Ok(())
}

#[cfg(unix)]
fn is_world_writable(path: &Path) -> Result<bool, ManagerError> {
    use std::os::unix::fs::PermissionsExt;
    let meta = std::fs::metadata(path).map_err(|e| {
        ManagerError::new(PipelineError::LayoutInvalid {
            reason: format!("failed to stat '{}': {e}", path.display()),
        })
    })?;
    Ok(meta.permissions().mode() & 0o002 != 0)
}

#[cfg(not(unix))]
fn is_world_writable(_path: &Path) -> Result<bool, ManagerError> {
    Ok(false)
}

/// Extracts entries from an in-memory map straight to `dest_dir`, enforcing
/// the same limits a real extractor would; used by Unpack FSM unit tests.
pub struct FakeExtractor {
    pub entries: std::collections::HashMap<String, Vec<u8>>,
}

impl FakeExtractor {
    pub fn new() -> Self {
        FakeExtractor { entries: std::collections::HashMap::new() }
    }

    pub fn with_entry(mut self, path: impl Into<String>, bytes: Vec<u8>) -> Self {
        self.entries.insert(path.into(), bytes);
        self
    }
}

impl Default for FakeExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl Extractor for FakeExtractor {
    fn validate(&self, _archive_path: &Path) -> Result<(), ExtractError> {
        Ok(())
    }

    fn extract(&self, _archive_path: &Path, dest_dir: &Path) -> Result<ExtractOutcome, ExtractError> {
        if self.entries.len() as u64 > MAX_FILE_COUNT {
            return Err(ExtractError::CountLimit);
        }
        let mut byte_count = 0u64;
        for (rel_path, bytes) in &self.entries {
            if rel_path.contains("..") {
                return Err(ExtractError::PathTraversal);
            }
            if bytes.len() as u64 > MAX_FILE_SIZE_BYTES {
                return Err(ExtractError::SizeLimit);
            }
            byte_count += bytes.len() as u64;
            if byte_count > MAX_TOTAL_SIZE_BYTES {
                return Err(ExtractError::SizeLimit);
            }
            let target = dest_dir.join(rel_path);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(|_| ExtractError::Corrupt)?;
            }
            std::fs::write(&target, bytes).map_err(|_| ExtractError::Corrupt)?;
        }
        Ok(ExtractOutcome {
            file_count: self.entries.len() as u64,
            byte_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_path_traversal_entry() {
        let extractor = FakeExtractor::new().with_entry("../../etc/passwd", vec![1, 2, 3]);
        let dir = tempfile::tempdir().unwrap();
        let err = extractor.extract(Path::new("irrelevant.tar"), dir.path()).unwrap_err();
        assert_eq!(err, ExtractError::PathTraversal);
    }

    #[test]
    fn verify_canonical_layout_accepts_direct_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("etc")).unwrap();
        std::fs::create_dir_all(dir.path().join("usr")).unwrap();
        std::fs::create_dir_all(dir.path().join("var")).unwrap();
        verify_canonical_layout(dir.path()).unwrap();
    }

    #[test]
    fn verify_canonical_layout_rejects_missing_usr() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("etc")).unwrap();
        assert!(verify_canonical_layout(dir.path()).is_err());
    }
}
