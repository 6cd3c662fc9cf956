//! Pre-operation Health Check (spec §4.4): five conditions sampled under a
//! 10-second deadline. Any one of them failing blocks the operation.

use std::time::{Duration, Instant};

use log::info;

use blockdev::PoolManager;
use pipeline_api::constants::{
    D_STATE_BLOCKING_PATTERNS, DM_THIN_INFORMATIONAL_PATTERN, HEALTH_CHECK_DEADLINE_SECS,
    HEALTH_CHECK_MAX_IOWAIT_PCT, HEALTH_CHECK_MAX_SWAP_USED_PCT, HEALTH_CHECK_MIN_AVAILABLE_MEM_BYTES,
    HEALTH_CHECK_MIN_AVAILABLE_MEM_FRACTION, KERNEL_CRITICAL_PATTERNS, KERNEL_LOG_TAIL_LINES,
};
use pipeline_api::error::{ManagerError, SafeguardError};
use sysutils::health_sample;

/// Runs the five checks in spec §4.4 order, bailing out at the first
/// failure. `pool` is the pool whose `needs_check`/`error`/missing state
/// gates condition 2.
pub fn run(pool: &PoolManager) -> Result<(), ManagerError> {
    let deadline = Instant::now() + Duration::from_secs(HEALTH_CHECK_DEADLINE_SECS);

    let blocked = health_sample::scan_d_state(D_STATE_BLOCKING_PATTERNS)
        .map_err(|e| blocked("failed to scan for D-state processes", e))?;
    if let Some(p) = blocked.first() {
        return Err(fail(format!(
            "process {} ({}) is in uninterruptible sleep",
            p.pid, p.command
        )));
    }

    if let Err(e) = pool.validate_health() {
        return Err(fail(format!("thin pool is unhealthy: {e}")));
    }

    let critical = health_sample::tail_kernel_log_matches(KERNEL_LOG_TAIL_LINES, KERNEL_CRITICAL_PATTERNS);
    if let Some(line) = critical.first() {
        return Err(fail(format!("kernel log contains a critical pattern: {line}")));
    }

    // Dm-thin log lines are informational, never blocking; surface them for
    // an operator watching the logs rather than silently dropping them.
    for line in health_sample::tail_kernel_log_matches(KERNEL_LOG_TAIL_LINES, &[DM_THIN_INFORMATIONAL_PATTERN]) {
        info!("health check: informational dm-thin kernel log line: {line}");
    }

    let mem = health_sample::sample_memory().map_err(|e| blocked("failed to sample memory", e))?;
    if mem.available_bytes < HEALTH_CHECK_MIN_AVAILABLE_MEM_BYTES {
        return Err(fail(format!(
            "available memory {} bytes is below the {} byte floor",
            mem.available_bytes, HEALTH_CHECK_MIN_AVAILABLE_MEM_BYTES
        )));
    }
    if mem.available_fraction() < HEALTH_CHECK_MIN_AVAILABLE_MEM_FRACTION {
        return Err(fail(format!(
            "available memory fraction {:.3} is below the {:.3} floor",
            mem.available_fraction(),
            HEALTH_CHECK_MIN_AVAILABLE_MEM_FRACTION
        )));
    }
    if mem.swap_used_pct() > HEALTH_CHECK_MAX_SWAP_USED_PCT {
        return Err(fail(format!(
            "swap usage {:.1}% exceeds the {:.1}% ceiling",
            mem.swap_used_pct(),
            HEALTH_CHECK_MAX_SWAP_USED_PCT
        )));
    }

    let remaining = deadline.saturating_duration_since(Instant::now());
    let sample_window = remaining.min(Duration::from_millis(200)).max(Duration::from_millis(10));
    let iowait = health_sample::sample_iowait_pct(sample_window)
        .map_err(|e| blocked("failed to sample iowait", e))?;
    if iowait > HEALTH_CHECK_MAX_IOWAIT_PCT {
        return Err(fail(format!(
            "I/O wait {iowait:.1}% exceeds the {HEALTH_CHECK_MAX_IOWAIT_PCT:.1}% ceiling"
        )));
    }

    Ok(())
}

fn fail(reason: String) -> ManagerError {
    ManagerError::new(SafeguardError::HealthCheckFailed { reason })
}

fn blocked(context: &str, e: anyhow::Error) -> ManagerError {
    ManagerError::new(SafeguardError::HealthCheckFailed {
        reason: format!("{context}: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_pool_fails_health_check() {
        let dir = tempfile::tempdir().unwrap();
        let pool = PoolManager::new("health-check-test-pool", dir.path(), 4 * 1024 * 1024, 64 * 1024 * 1024);
        let result = run(&pool);
        assert!(result.is_err());
    }
}
