//! Low-level sampling primitives backing the pre-operation Health Check
//! (spec §4.4). Grounded on the teacher's `procfs`-based `monitor_metrics`
//! module, adapted from CPU/network accounting to memory, swap, iowait and
//! D-state process scanning.

use std::thread;
use std::time::Duration;

use anyhow::{Context, Error};
use procfs::process::{all_processes, ProcState};
use procfs::{CpuTime, KernelStats, Meminfo};

#[derive(Debug, Clone)]
pub struct DStateProcess {
    pub pid: i32,
    pub command: String,
}

/// Scan `/proc` for processes in uninterruptible sleep (D-state) whose
/// command matches one of `patterns` (substring, case-insensitive).
pub fn scan_d_state(patterns: &[&str]) -> Result<Vec<DStateProcess>, Error> {
    let mut found = Vec::new();
    for process in all_processes().context("Failed to enumerate /proc")? {
        let process = match process {
            Ok(p) => p,
            Err(_) => continue, // process exited between listing and stat
        };
        let stat = match process.stat() {
            Ok(s) => s,
            Err(_) => continue,
        };
        if stat.state().unwrap_or(ProcState::Unknown) != ProcState::Waiting {
            continue;
        }
        let command = stat.comm.to_lowercase();
        if patterns
            .iter()
            .any(|p| command.contains(&p.to_lowercase()))
        {
            found.push(DStateProcess {
                pid: stat.pid,
                command: stat.comm,
            });
        }
    }
    Ok(found)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MemorySample {
    pub available_bytes: u64,
    pub total_bytes: u64,
    pub swap_total_bytes: u64,
    pub swap_free_bytes: u64,
}

impl MemorySample {
    pub fn available_fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            return 1.0;
        }
        self.available_bytes as f64 / self.total_bytes as f64
    }

    pub fn swap_used_pct(&self) -> f64 {
        if self.swap_total_bytes == 0 {
            return 0.0;
        }
        let used = self.swap_total_bytes.saturating_sub(self.swap_free_bytes);
        100.0 * used as f64 / self.swap_total_bytes as f64
    }
}

pub fn sample_memory() -> Result<MemorySample, Error> {
    let info = Meminfo::new().context("Failed to read /proc/meminfo")?;
    Ok(MemorySample {
        available_bytes: info.mem_available.unwrap_or(info.mem_free),
        total_bytes: info.mem_total,
        swap_total_bytes: info.swap_total,
        swap_free_bytes: info.swap_free,
    })
}

/// Sample I/O-wait percentage over a short window by diffing two
/// `/proc/stat` reads `interval` apart.
pub fn sample_iowait_pct(interval: Duration) -> Result<f64, Error> {
    let before = KernelStats::new().context("Failed to read /proc/stat")?;
    thread::sleep(interval);
    let after = KernelStats::new().context("Failed to read /proc/stat")?;

    let total_before = cpu_total_ticks(&before.total);
    let total_after = cpu_total_ticks(&after.total);
    let iowait_before = before.total.iowait.unwrap_or(0);
    let iowait_after = after.total.iowait.unwrap_or(0);

    let total_delta = total_after.saturating_sub(total_before);
    if total_delta == 0 {
        return Ok(0.0);
    }
    let iowait_delta = iowait_after.saturating_sub(iowait_before);
    Ok(100.0 * iowait_delta as f64 / total_delta as f64)
}

fn cpu_total_ticks(cpu: &CpuTime) -> u64 {
    cpu.user
        + cpu.nice
        + cpu.system
        + cpu.idle
        + cpu.iowait.unwrap_or(0)
        + cpu.irq.unwrap_or(0)
        + cpu.softirq.unwrap_or(0)
        + cpu.steal.unwrap_or(0)
}

/// Tail the last `lines` of the kernel ring buffer (`dmesg`), returning
/// whichever lines matched `patterns`. Soft-fails to an empty vec if dmesg
/// is unavailable (e.g. no CAP_SYSLOG) rather than blocking the health
/// check on an unrelated permissions issue.
pub fn tail_kernel_log_matches(lines: usize, patterns: &[&str]) -> Vec<String> {
    let output = match std::process::Command::new("dmesg").arg("--ctime").output() {
        Ok(o) if o.status.success() => o,
        _ => return Vec::new(),
    };
    let text = String::from_utf8_lossy(&output.stdout);
    text.lines()
        .rev()
        .take(lines)
        .filter(|line| patterns.iter().any(|p| line.contains(p)))
        .map(|s| s.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sample_is_plausible() {
        let sample = sample_memory().unwrap();
        assert!(sample.total_bytes > 0);
        assert!(sample.available_fraction() <= 1.0);
    }

    #[test]
    fn iowait_sample_is_bounded() {
        let pct = sample_iowait_pct(Duration::from_millis(10)).unwrap();
        assert!((0.0..=100.0).contains(&pct));
    }

    #[test]
    fn d_state_scan_does_not_error() {
        scan_d_state(&["dm-thin", "loop"]).unwrap();
    }
}
