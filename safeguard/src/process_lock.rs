//! Process Lock (spec §4.4): at most one orchestrator process per host.
//! Grounded on `sysutils::lockfile`'s exclusive-create primitive, with the
//! PID/timestamp/command record and stale-holder recovery owned here.

use std::path::{Path, PathBuf};

use chrono::Utc;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use pipeline_api::constants::PROCESS_LOCK_FILE_NAME;
use pipeline_api::error::{ManagerError, ReportError, SafeguardError};
use sysutils::exe::process_exists;
use sysutils::lockfile;

#[derive(Debug, Serialize, Deserialize)]
struct LockRecord {
    pid: i32,
    timestamp: i64,
    command: String,
}

/// Held for the lifetime of an orchestrator run; releases on `Drop` so a
/// panic mid-operation still unlinks the file.
pub struct ProcessLock {
    path: PathBuf,
}

impl ProcessLock {
    /// Acquires the lock at `<fsm_db_dir>/flyio-manager.lock`. If an
    /// existing record's PID is no longer alive, removes the stale file and
    /// retries exactly once.
    pub fn acquire(fsm_db_dir: &Path) -> Result<Self, ManagerError> {
        let path = fsm_db_dir.join(PROCESS_LOCK_FILE_NAME);
        match Self::try_create(&path) {
            Ok(()) => {
                info!("Acquired process lock at {}", path.display());
                return Ok(ProcessLock { path });
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => {
                return Err(e).structured(SafeguardError::ProcessLockHeld { pid: -1, acquired_at: 0 });
            }
        }

        let record = std::fs::read_to_string(&path)
            .ok()
            .and_then(|s| serde_json::from_str::<LockRecord>(&s).ok());

        match record {
            Some(record) if !process_exists(record.pid) => {
                warn!(
                    "Process lock at {} held by dead pid {}; removing stale lock",
                    path.display(),
                    record.pid
                );
                lockfile::remove_if_present(&path).structured(SafeguardError::ProcessLockHeld {
                    pid: record.pid,
                    acquired_at: record.timestamp,
                })?;
                Self::try_create(&path).structured(SafeguardError::ProcessLockHeld {
                    pid: record.pid,
                    acquired_at: record.timestamp,
                })?;
                info!("Acquired process lock at {} after stale-holder recovery", path.display());
                Ok(ProcessLock { path })
            }
            Some(record) => Err(ManagerError::new(SafeguardError::ProcessLockHeld {
                pid: record.pid,
                acquired_at: record.timestamp,
            })),
            None => Err(ManagerError::new(SafeguardError::ProcessLockHeld { pid: -1, acquired_at: 0 })),
        }
    }

    fn try_create(path: &Path) -> std::io::Result<()> {
        use std::io::Write;
        let mut file = lockfile::exclusive_create(path)?;
        let record = LockRecord {
            pid: std::process::id() as i32,
            timestamp: Utc::now().timestamp(),
            command: std::env::args().collect::<Vec<_>>().join(" "),
        };
        let json = serde_json::to_string(&record).unwrap_or_default();
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        if let Err(e) = lockfile::remove_if_present(&self.path) {
            warn!("Failed to release process lock at {}: {e}", self.path.display());
        } else {
            info!("Released process lock at {}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_then_release_allows_reacquire() {
        let dir = tempfile::tempdir().unwrap();
        {
            let _lock = ProcessLock::acquire(dir.path()).unwrap();
            assert!(ProcessLock::acquire(dir.path()).is_err());
        }
        let _lock = ProcessLock::acquire(dir.path()).unwrap();
    }

    #[test]
    fn stale_lock_from_dead_pid_is_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PROCESS_LOCK_FILE_NAME);
        let record = LockRecord {
            pid: i32::MAX,
            timestamp: Utc::now().timestamp(),
            command: "flyio-manager run".to_string(),
        };
        std::fs::write(&path, serde_json::to_string(&record).unwrap()).unwrap();

        let _lock = ProcessLock::acquire(dir.path()).unwrap();
    }
}
