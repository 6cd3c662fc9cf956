//! Progress sink (spec §6): the orchestrator reports phase-level progress
//! through this trait rather than writing to stdout directly, so a caller
//! embedding this crate can redirect it (a CLI progress bar, a background
//! log, or nothing at all).

use std::time::Duration;

use crate::logging::BackgroundLog;

#[derive(Debug, Clone)]
pub enum ProgressEvent<'a> {
    PhaseStarted {
        phase: &'a str,
        total: Option<u64>,
    },
    PhaseProgress {
        phase: &'a str,
        current: u64,
        total: Option<u64>,
        speed: Option<f64>,
    },
    PhaseCompleted {
        phase: &'a str,
    },
    Error {
        phase: &'a str,
        err: &'a str,
    },
    AllDone {
        image_id: &'a str,
        snapshot_id: &'a str,
        snapshot_name: &'a str,
        device_path: &'a str,
        duration: Duration,
        err: Option<&'a str>,
    },
}

pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent<'_>);
}

/// Discards every event; the default when no caller-supplied sink is given.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit(&self, _event: ProgressEvent<'_>) {}
}

/// Renders each event as a structured line in a `BackgroundLog`, matching
/// the teacher's pattern of routing operational narration through its
/// background-log file rather than stdout.
pub struct BackgroundLogSink {
    log: BackgroundLog,
}

impl BackgroundLogSink {
    pub fn new(log: BackgroundLog) -> Self {
        BackgroundLogSink { log }
    }
}

impl ProgressSink for BackgroundLogSink {
    fn emit(&self, event: ProgressEvent<'_>) {
        match event {
            ProgressEvent::PhaseStarted { phase, total } => {
                self.log.record("info", phase, &format!("started (total={total:?})"));
            }
            ProgressEvent::PhaseProgress { phase, current, total, speed } => {
                self.log.record(
                    "info",
                    phase,
                    &format!("progress current={current} total={total:?} speed={speed:?}"),
                );
            }
            ProgressEvent::PhaseCompleted { phase } => {
                self.log.record("info", phase, "completed");
            }
            ProgressEvent::Error { phase, err } => {
                self.log.record("error", phase, err);
            }
            ProgressEvent::AllDone { image_id, snapshot_id, snapshot_name, device_path, duration, err } => {
                self.log.record(
                    "info",
                    "all-done",
                    &format!(
                        "image_id={image_id} snapshot_id={snapshot_id} snapshot_name={snapshot_name} \
                         device_path={device_path} duration={duration:?} err={err:?}"
                    ),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_sink_accepts_all_events() {
        let sink = NullSink;
        sink.emit(ProgressEvent::PhaseStarted { phase: "download", total: Some(100) });
        sink.emit(ProgressEvent::PhaseCompleted { phase: "download" });
    }

    #[test]
    fn background_log_sink_records_events() {
        let dir = tempfile::tempdir().unwrap();
        let log = BackgroundLog::open(&dir.path().join("progress.log")).unwrap();
        let sink = BackgroundLogSink::new(log);
        sink.emit(ProgressEvent::PhaseStarted { phase: "unpack", total: None });
        sink.emit(ProgressEvent::Error { phase: "unpack", err: "boom" });

        let contents = std::fs::read_to_string(dir.path().join("progress.log")).unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.contains("boom"));
    }
}
