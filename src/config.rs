//! Operator-facing configuration (ambient stack addition, SPEC_FULL §B):
//! a `serde_yaml`-loaded `Config` following `trident_api::config`'s pattern
//! of a flat struct with sensible defaults, overridable by environment
//! variables recognised by `from_env`.

use std::path::PathBuf;

use pipeline_api::constants;
use pipeline_api::error::{ConfigError, ManagerError, ReportError};
use serde::{Deserialize, Serialize};

fn default_pool_name() -> String {
    "flyio-images".to_string()
}
fn default_pool_dir() -> PathBuf {
    PathBuf::from("/var/lib/flyio-manager/pool")
}
fn default_datastore_path() -> PathBuf {
    PathBuf::from("/var/lib/flyio-manager/store.db")
}
fn default_fsm_dir() -> PathBuf {
    PathBuf::from("/var/lib/flyio-manager/fsm")
}
fn default_download_dir() -> PathBuf {
    PathBuf::from("/var/lib/flyio-manager/downloads")
}
fn default_mount_root() -> PathBuf {
    PathBuf::from("/var/lib/flyio-manager/mounts")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pool_name: String,
    pub pool_dir: PathBuf,
    pub datastore_path: PathBuf,
    pub fsm_dir: PathBuf,
    pub download_dir: PathBuf,
    pub mount_root: PathBuf,

    pub download_queue_cap: usize,
    pub unpack_queue_cap: usize,
    pub activate_queue_cap: usize,

    /// Single config knob resolving spec §9's open question about the
    /// conflicting 10 GiB / 4 GiB default-device-size comments upstream.
    pub default_device_size_bytes: u64,
    pub download_staleness_secs: i64,

    pub pool_metadata_size_bytes: u64,
    pub pool_data_size_bytes: u64,

    pub health_check_min_available_mem_bytes: u64,
    pub health_check_max_swap_used_pct: f64,
    pub health_check_min_available_mem_fraction: f64,
    pub health_check_max_iowait_pct: f64,

    /// Operator override bypassing only the process-lock precondition on
    /// `gc` (spec §9: "treat it as an explicit operator override").
    pub gc_ignore_lock: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            pool_name: default_pool_name(),
            pool_dir: default_pool_dir(),
            datastore_path: default_datastore_path(),
            fsm_dir: default_fsm_dir(),
            download_dir: default_download_dir(),
            mount_root: default_mount_root(),
            download_queue_cap: constants::queue::DOWNLOAD_CAP,
            unpack_queue_cap: constants::queue::UNPACK_CAP,
            activate_queue_cap: constants::queue::ACTIVATE_CAP,
            default_device_size_bytes: constants::DEFAULT_POOL_DATA_SIZE_BYTES,
            download_staleness_secs: constants::DOWNLOAD_STALENESS_THRESHOLD_SECS,
            pool_metadata_size_bytes: constants::DEFAULT_POOL_METADATA_SIZE_BYTES,
            pool_data_size_bytes: constants::DEFAULT_POOL_DATA_SIZE_BYTES,
            health_check_min_available_mem_bytes: constants::HEALTH_CHECK_MIN_AVAILABLE_MEM_BYTES,
            health_check_max_swap_used_pct: constants::HEALTH_CHECK_MAX_SWAP_USED_PCT,
            health_check_min_available_mem_fraction: constants::HEALTH_CHECK_MIN_AVAILABLE_MEM_FRACTION,
            health_check_max_iowait_pct: constants::HEALTH_CHECK_MAX_IOWAIT_PCT,
            gc_ignore_lock: false,
        }
    }
}

impl Config {
    /// Loads `path` if given (YAML), else starts from defaults; then
    /// applies `FLYIO_*` environment overrides for the handful of knobs an
    /// operator is most likely to need to tweak without a file.
    pub fn load(path: Option<&std::path::Path>) -> Result<Self, ManagerError> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).structured(ConfigError::LoadFile {
                    path: path.display().to_string(),
                })?;
                serde_yaml::from_str(&text).structured(ConfigError::Parse)?
            }
            None => Config::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("FLYIO_POOL_NAME") {
            self.pool_name = v;
        }
        if let Ok(v) = std::env::var("FLYIO_POOL_DIR") {
            self.pool_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("FLYIO_DATASTORE_PATH") {
            self.datastore_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("FLYIO_FSM_DIR") {
            self.fsm_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("FLYIO_GC_IGNORE_LOCK") {
            self.gc_ignore_lock = v == "1" || v.eq_ignore_ascii_case("true");
        }
    }

    fn validate(&self) -> Result<(), ManagerError> {
        if self.pool_name.is_empty() {
            return Err(ManagerError::new(ConfigError::Invalid("pool_name must not be empty".to_string())));
        }
        if self.download_queue_cap == 0 || self.unpack_queue_cap == 0 || self.activate_queue_cap == 0 {
            return Err(ManagerError::new(ConfigError::Invalid(
                "queue caps must be at least 1".to_string(),
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn load_from_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "pool_name: custom-pool\nunpack_queue_cap: 1\n").unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.pool_name, "custom-pool");
    }

    #[test]
    fn rejects_empty_pool_name() {
        let mut config = Config::default();
        config.pool_name = String::new();
        assert!(config.validate().is_err());
    }
}
