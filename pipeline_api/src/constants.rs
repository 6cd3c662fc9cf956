//! Shared constants, grouped the way the teacher's `trident_api::constants`
//! groups theirs: one small module per concern rather than one flat list.

/// Staleness threshold (spec §4.1) after which a `downloading` row is
/// considered abandoned and eligible for takeover by `reserve_download`.
pub const DOWNLOAD_STALENESS_THRESHOLD_SECS: i64 = 60 * 60;

/// Maximum object size accepted by the Download FSM (spec §4.6.1, §8).
pub const MAX_DOWNLOAD_SIZE_BYTES: u64 = 10 * 1024 * 1024 * 1024;

/// Download transition timeout budget (spec §4.6.1).
pub const DOWNLOAD_TIMEOUT_SECS: u64 = 5 * 60;

/// Extraction transition timeout budget (spec §4.6.2).
pub const EXTRACT_TIMEOUT_SECS: u64 = 30 * 60;

/// Extractor limits (spec §6).
pub const MAX_FILE_SIZE_BYTES: u64 = 1024 * 1024 * 1024;
pub const MAX_TOTAL_SIZE_BYTES: u64 = 10 * 1024 * 1024 * 1024;
pub const MAX_FILE_COUNT: u64 = 100_000;

/// Default thin-pool backing file sizes (spec §6).
pub const DEFAULT_POOL_METADATA_SIZE_BYTES: u64 = 4 * 1024 * 1024;
pub const DEFAULT_POOL_DATA_SIZE_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Mandatory pool block size: 256 512-byte sectors = 128 KiB (spec §6, §9).
/// A 1 MiB block size is a documented misconfiguration and must never be used.
pub const POOL_BLOCK_SIZE_SECTORS: u64 = 256;
pub const POOL_LOW_WATER_MARK_SECTORS: u64 = 65536;

/// Health check deadline (spec §4.4).
pub const HEALTH_CHECK_DEADLINE_SECS: u64 = 10;
pub const HEALTH_CHECK_MIN_AVAILABLE_MEM_BYTES: u64 = 256 * 1024 * 1024;
pub const HEALTH_CHECK_MAX_SWAP_USED_PCT: f64 = 80.0;
pub const HEALTH_CHECK_MIN_AVAILABLE_MEM_FRACTION: f64 = 0.05;
pub const HEALTH_CHECK_MAX_IOWAIT_PCT: f64 = 50.0;
pub const KERNEL_LOG_TAIL_LINES: usize = 50;

pub const KERNEL_CRITICAL_PATTERNS: &[&str] =
    &["BUG:", "kernel panic", "Out of memory", "oom-killer"];
pub const DM_THIN_INFORMATIONAL_PATTERN: &str = "dm-thin";

/// D-state process command patterns that block the health check (spec §4.4).
pub const D_STATE_BLOCKING_PATTERNS: &[&str] = &["dm-thin", "thin", "loop", "kworker"];

pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const GENERIC_FAILURE: i32 = 1;
    pub const HEALTH_CHECK_BLOCKED: i32 = 2;
}

pub mod queue {
    pub const DOWNLOAD: &str = "download";
    pub const UNPACK: &str = "unpack";
    pub const ACTIVATE: &str = "activate";

    pub const DOWNLOAD_CAP: usize = 5;
    pub const UNPACK_CAP: usize = 1;
    pub const ACTIVATE_CAP: usize = 1;
}

pub mod action {
    pub const DOWNLOAD_IMAGE: &str = "download-image";
    pub const UNPACK_IMAGE: &str = "unpack-image";
    pub const ACTIVATE_IMAGE: &str = "activate-image";
}

pub const PROCESS_LOCK_FILE_NAME: &str = "flyio-manager.lock";
pub const UNPACK_LOCK_HOLDER: &str = "unpack-fsm";
pub const OPERATION_GUARD_DEFAULT_PERMITS: usize = 1;
