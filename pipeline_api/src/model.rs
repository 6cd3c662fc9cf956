//! Durable data model (spec §3). These are plain serde structs; the
//! `durable_store` crate owns reading and writing them, these types are the
//! shared currency between it, the pipeline FSMs, and the orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum DownloadStatus {
    Pending,
    Downloading,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ActivationStatus {
    Inactive,
    Active,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub image_id: String,
    pub object_key: String,
    pub local_path: String,
    pub checksum: Option<String>,
    pub size_bytes: u64,
    pub download_status: DownloadStatus,
    pub activation_status: ActivationStatus,
    pub created_at: DateTime<Utc>,
    pub download_started_at: Option<DateTime<Utc>>,
    pub downloaded_at: Option<DateTime<Utc>>,
    pub activated_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Image {
    /// Invariant from spec §3: `download_status = completed` iff checksum
    /// set, size > 0, and the local file exists.
    pub fn is_download_consistent(&self) -> bool {
        match self.download_status {
            DownloadStatus::Completed => {
                self.checksum.is_some()
                    && self.size_bytes > 0
                    && std::path::Path::new(&self.local_path).is_file()
            }
            _ => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnpackedImage {
    pub image_id: String,
    pub device_id: String,
    pub device_name: String,
    pub device_path: String,
    pub size_bytes: u64,
    pub file_count: u64,
    pub layout_verified: bool,
    pub created_at: DateTime<Utc>,
    pub unpacked_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub image_id: String,
    pub snapshot_id: String,
    pub snapshot_name: String,
    pub device_path: String,
    pub origin_device_id: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub deactivated_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageLock {
    pub image_id: String,
    pub locked_at: i64,
    pub locked_by: String,
}

/// Deterministic identity helpers (spec §3/§4.6). Centralised here so every
/// component derives the same names from the same inputs.
pub mod ids {
    use sha2::{Digest, Sha256};

    pub fn image_id(object_key: &str) -> String {
        let digest = Sha256::digest(object_key.as_bytes());
        format!("img-{:x}", digest)
            .chars()
            .take(16)
            .collect()
    }

    pub fn device_id(image_id: &str) -> String {
        format!("dev-{image_id}")
    }

    pub fn device_name(device_id: &str) -> String {
        format!("thin-{device_id}")
    }

    pub fn device_path(device_name: &str) -> String {
        format!("/dev/mapper/{device_name}")
    }

    pub fn snapshot_id(origin_device_id: &str) -> String {
        format!("snap-{origin_device_id}")
    }

    pub fn snapshot_name(image_id: &str) -> String {
        format!("snap-{image_id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_id_is_deterministic() {
        assert_eq!(
            ids::image_id("images/node/5.tar"),
            ids::image_id("images/node/5.tar")
        );
        assert_ne!(
            ids::image_id("images/node/5.tar"),
            ids::image_id("images/node/6.tar")
        );
    }

    #[test]
    fn device_naming_convention() {
        let device_id = ids::device_id("img-node-5");
        let device_name = ids::device_name(&device_id);
        assert_eq!(device_name, format!("thin-{device_id}"));
        assert_eq!(
            ids::device_path(&device_name),
            format!("/dev/mapper/{device_name}")
        );
    }

    #[test]
    fn download_consistency_requires_existing_file() {
        let img = Image {
            image_id: "x".into(),
            object_key: "k".into(),
            local_path: "/nonexistent/path".into(),
            checksum: Some("a".repeat(64)),
            size_bytes: 10,
            download_status: DownloadStatus::Completed,
            activation_status: ActivationStatus::Inactive,
            created_at: Utc::now(),
            download_started_at: None,
            downloaded_at: None,
            activated_at: None,
            updated_at: Utc::now(),
        };
        assert!(!img.is_download_consistent());
    }
}
