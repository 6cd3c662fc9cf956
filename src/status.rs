//! Read-only status summary (SPEC_FULL §C): pool health plus row counts,
//! for an operator to sanity-check the system without mutating anything.

use std::sync::Arc;

use blockdev::{PoolHealth, PoolManager, PoolStatus};
use durable_store::DurableStore;
use pipeline_api::error::ManagerError;

#[derive(Debug, Clone)]
pub struct StatusReport {
    pub pool: PoolStatus,
    pub pool_health: Result<PoolHealth, String>,
    pub image_count: usize,
    pub unpacked_count: usize,
    pub active_snapshot_count: usize,
    pub held_locks: Vec<String>,
}

pub fn run(pool: &Arc<PoolManager>, store: &Arc<DurableStore>) -> Result<StatusReport, ManagerError> {
    let pool_status = pool.status()?;
    let pool_health = pool.validate_health().map_err(|e| e.to_string());

    let images = store.list_images()?;
    let unpacked = store.list_unpacked_images()?;
    let snapshots = store.list_active_snapshots()?;
    let locks = store.list_image_locks()?;

    Ok(StatusReport {
        pool: pool_status,
        pool_health,
        image_count: images.len(),
        unpacked_count: unpacked.len(),
        active_snapshot_count: snapshots.len(),
        held_locks: locks.into_iter().map(|l| format!("{} (held by {})", l.image_id, l.locked_by)).collect(),
    })
}
