//! Logging setup: `env_logger` for human-readable stderr output, plus a
//! lightweight structured JSON-lines sink for the events a log-shipping
//! agent (out of scope here) would later tail.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde::Serialize;

pub fn init() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

#[derive(Debug, Serialize)]
struct BackgroundLogLine<'a> {
    ts: String,
    level: &'a str,
    phase: &'a str,
    message: &'a str,
}

/// Structured sink appending one JSON object per line to `path`. Kept
/// separate from `log`'s human-readable output so an external shipper can
/// tail a stable machine-readable file.
pub struct BackgroundLog {
    path: PathBuf,
    file: Mutex<std::fs::File>,
}

impl BackgroundLog {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(BackgroundLog {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn record(&self, level: &str, phase: &str, message: &str) {
        let line = BackgroundLogLine {
            ts: Utc::now().to_rfc3339(),
            level,
            phase,
            message,
        };
        let Ok(json) = serde_json::to_string(&line) else {
            return;
        };
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(file, "{json}");
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("background.log");
        let sink = BackgroundLog::open(&path).unwrap();
        sink.record("info", "download", "started");
        sink.record("info", "download", "completed");

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.contains("\"phase\":\"download\""));
    }
}
