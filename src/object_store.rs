//! Object store (consumed, spec §6): a streaming GET primitive. The real
//! transport is out of scope; this defines the trait-shaped seam the
//! Download FSM calls through, plus a fake used by tests.

use std::io::Write;
use std::path::Path;

use pipeline_api::error::{ManagerError, PipelineError, ReportError};

pub struct DownloadOutcome {
    pub size_bytes: u64,
    pub checksum: String,
}

/// Object-key validation rules (spec §4.6.1): non-empty, ≤1024 bytes, no
/// `..`, no leading `/`, no NUL.
pub fn validate_object_key(key: &str) -> Result<(), ManagerError> {
    let invalid = key.is_empty()
        || key.len() > 1024
        || key.contains("..")
        || key.starts_with('/')
        || key.contains('\0');
    if invalid {
        return Err(ManagerError::new(PipelineError::InvalidObjectKey { key: key.to_string() }));
    }
    Ok(())
}

/// Streaming GET consumed by the Download FSM. Implementations stream the
/// object's bytes to `dest`, computing a checksum as they go, and enforce
/// `max_size_bytes` by aborting once exceeded.
pub trait ObjectStore: Send + Sync {
    fn download(
        &self,
        object_key: &str,
        dest: &Path,
        max_size_bytes: u64,
    ) -> Result<DownloadOutcome, ManagerError>;
}

/// Streams a fixed byte slice to `dest`, for FSM unit tests: grounded in
/// the same seam-injection the teacher uses to fake subprocess-driven
/// dependencies in its functional tests, applied here to I/O instead.
pub struct FakeObjectStore {
    pub objects: std::collections::HashMap<String, Vec<u8>>,
}

impl FakeObjectStore {
    pub fn new() -> Self {
        FakeObjectStore { objects: std::collections::HashMap::new() }
    }

    pub fn with_object(mut self, key: impl Into<String>, bytes: Vec<u8>) -> Self {
        self.objects.insert(key.into(), bytes);
        self
    }
}

impl Default for FakeObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectStore for FakeObjectStore {
    fn download(
        &self,
        object_key: &str,
        dest: &Path,
        max_size_bytes: u64,
    ) -> Result<DownloadOutcome, ManagerError> {
        let bytes = self
            .objects
            .get(object_key)
            .ok_or_else(|| ManagerError::new(PipelineError::InvalidObjectKey { key: object_key.to_string() }))?;
        if bytes.len() as u64 > max_size_bytes {
            return Err(ManagerError::new(PipelineError::SizeLimitExceeded));
        }
        let mut file = std::fs::File::create(dest).structured(PipelineError::TarValidation {
            reason: "failed to create destination file".to_string(),
        })?;
        file.write_all(bytes).structured(PipelineError::TarValidation {
            reason: "failed to write destination file".to_string(),
        })?;

        use sha2::{Digest, Sha256};
        let checksum = format!("{:x}", Sha256::digest(bytes));
        Ok(DownloadOutcome {
            size_bytes: bytes.len() as u64,
            checksum,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_path_traversal_keys() {
        assert!(validate_object_key("../../etc/passwd").is_err());
        assert!(validate_object_key("/etc/passwd").is_err());
        assert!(validate_object_key("").is_err());
        assert!(validate_object_key("images/node/5.tar").is_ok());
    }

    #[test]
    fn fake_store_enforces_size_limit() {
        let dir = tempfile::tempdir().unwrap();
        let store = FakeObjectStore::new().with_object("k", vec![0u8; 100]);
        let dest = dir.path().join("out.tar");
        assert!(store.download("k", &dest, 10).is_err());
        assert!(store.download("k", &dest, 1000).is_ok());
    }
}
