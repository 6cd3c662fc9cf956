//! Garbage collection (SPEC_FULL §C): reconciles device-mapper devices
//! actually present in the pool against the Durable Store's record of what
//! should exist, and removes what the store no longer knows about.
//!
//! Orphans are never created by a clean run; they are the visible trace of
//! a prior crash mid-`create-device`/`create-snapshot` (spec §4.2's "fail
//! dumb, not smart"). This is the only place that removes them.

use std::collections::HashSet;
use std::sync::Arc;

use blockdev::{BlockDeviceManager, PoolManager};
use durable_store::DurableStore;
use pipeline_api::error::ManagerError;
use safeguard::{health_check, OperationGuard, ProcessLock};

use crate::config::Config;

const THIN_DEVICE_PREFIX: &str = "thin-dev-";
const SNAPSHOT_DEVICE_PREFIX: &str = "snap-";

#[derive(Debug, Clone, Default)]
pub struct GcReport {
    pub orphaned_devices: Vec<String>,
    pub orphaned_snapshots: Vec<String>,
    pub deleted: Vec<String>,
    pub deletion_errors: Vec<(String, String)>,
    pub dry_run: bool,
}

/// Runs one GC pass (SPEC_FULL §C). `ignore_lock` bypasses the process-lock
/// precondition as an explicit operator override (spec §9); it never
/// bypasses the Health Check.
pub async fn run(
    config: &Config,
    pool: Arc<PoolManager>,
    block_device: Arc<BlockDeviceManager>,
    store: Arc<DurableStore>,
    operation_guard: Arc<OperationGuard>,
    dry_run: bool,
    ignore_lock: bool,
) -> Result<GcReport, ManagerError> {
    let _process_lock = if ignore_lock || config.gc_ignore_lock {
        log::warn!("gc: running with process lock ignored (operator override)");
        None
    } else {
        Some(ProcessLock::acquire(&config.fsm_dir)?)
    };

    health_check::run(&pool)?;

    let known_devices: HashSet<String> =
        store.list_unpacked_images()?.into_iter().map(|u| u.device_name).collect();
    let known_snapshots: HashSet<String> =
        store.list_active_snapshots()?.into_iter().map(|s| s.snapshot_name).collect();

    let actual_devices = block_device.list_device_names(THIN_DEVICE_PREFIX)?;
    let actual_snapshots = block_device.list_device_names(SNAPSHOT_DEVICE_PREFIX)?;

    let orphaned_devices: Vec<String> =
        actual_devices.into_iter().filter(|d| !known_devices.contains(d)).collect();
    let orphaned_snapshots: Vec<String> =
        actual_snapshots.into_iter().filter(|s| !known_snapshots.contains(s)).collect();

    let mut report = GcReport {
        orphaned_devices: orphaned_devices.clone(),
        orphaned_snapshots: orphaned_snapshots.clone(),
        deleted: Vec::new(),
        deletion_errors: Vec::new(),
        dry_run,
    };

    if dry_run {
        log::info!(
            "gc: dry run found {} orphaned device(s), {} orphaned snapshot(s)",
            orphaned_devices.len(),
            orphaned_snapshots.len()
        );
        return Ok(report);
    }

    for name in &orphaned_snapshots {
        match operation_guard.with_operation("gc-delete-snapshot", || block_device.deactivate(name)).await {
            Ok(()) => report.deleted.push(name.clone()),
            Err(e) => report.deletion_errors.push((name.clone(), e.to_string())),
        }
    }

    for name in &orphaned_devices {
        let device_id = name.strip_prefix("thin-").unwrap_or(name).to_string();
        let pool_name = pool.pool_name().to_string();
        let result = operation_guard
            .with_operation("gc-delete-device", || {
                block_device.deactivate(name)?;
                block_device.delete(&pool_name, &device_id)
            })
            .await;
        match result {
            Ok(()) => report.deleted.push(name.clone()),
            Err(e) => report.deletion_errors.push((name.clone(), e.to_string())),
        }
    }

    pool.sync()?;

    log::info!(
        "gc: deleted {} orphan(s), {} failure(s)",
        report.deleted.len(),
        report.deletion_errors.len()
    );
    Ok(report)
}
