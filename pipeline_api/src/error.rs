//! Structured error type shared by every component, modeled on the
//! teacher's `trident_api::error` aggregate-error design: a small
//! `ErrorKind` enum-of-enums, one `thiserror` enum per component, wrapped
//! in a box that also captures call-site location and a source chain.

use std::borrow::Cow;
use std::fmt::{Debug, Write};
use std::panic::Location;

use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize};
use strum_macros::IntoStaticStr;

#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum ConfigError {
    #[error("Failed to load configuration file from '{path}'")]
    LoadFile { path: String },
    #[error("Failed to parse configuration")]
    Parse,
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum StoreError {
    #[error("Failed to open durable store at '{path}'")]
    Open { path: String },
    #[error("Failed to run schema migration {version}")]
    Migration { version: u32 },
    #[error("Durable store query failed")]
    Query,
    #[error("Durable store write failed")]
    Write,
    #[error("Durable store busy, exceeded busy-timeout")]
    Busy,
}

#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum PoolError {
    #[error("Thin pool does not exist and auto-create is disabled")]
    Missing,
    #[error("Thin pool requires manual check (needs_check flag set)")]
    NeedsCheck,
    #[error("Thin pool is read-only")]
    ReadOnly,
    #[error("Thin pool data or metadata space is full")]
    Full,
    #[error("Failed to create backing files or attach loop devices for pool")]
    Create,
    #[error("Failed to parse pool status output")]
    StatusParse,
}

#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum BlockDeviceError {
    #[error("Device '{name}' already exists")]
    DeviceExists { name: String },
    #[error("Device '{name}' not found")]
    DeviceNotFound { name: String },
    #[error("Operation on device '{name}' timed out")]
    Timeout { name: String },
    #[error("Device '{name}' was partially created and must be left for garbage collection")]
    Orphaned { name: String },
    #[error("I/O error operating device '{name}'")]
    Io { name: String },
}

#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum SafeguardError {
    #[error("Process lock held by pid {pid} since {acquired_at}")]
    ProcessLockHeld { pid: i32, acquired_at: i64 },
    #[error("Image '{image_id}' already locked by '{holder}' since {acquired_at}")]
    ImageLocked {
        image_id: String,
        holder: String,
        acquired_at: i64,
    },
    #[error("System health check failed: {reason}")]
    HealthCheckFailed { reason: String },
    #[error("Timed out waiting for operation permit")]
    PermitTimeout,
}

#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum PipelineError {
    #[error("Object key '{key}' failed validation")]
    InvalidObjectKey { key: String },
    #[error("Download exceeded the maximum object size")]
    SizeLimitExceeded,
    #[error("Downloaded checksum did not match expected value")]
    ChecksumMismatch,
    #[error("Tarball failed validation: {reason}")]
    TarValidation { reason: String },
    #[error("Unpacked layout failed verification: {reason}")]
    LayoutInvalid { reason: String },
    #[error("Snapshot '{name}' could not be activated")]
    ActivationFailed { name: String },
}

#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum FsmError {
    #[error("Unknown action '{action}'")]
    UnknownAction { action: String },
    #[error("Failed to create a run for action '{action}'")]
    RunCreateFailed { action: String },
    #[error("Run '{run_id}' not found")]
    RunNotFound { run_id: i64 },
    #[error("Transition '{state}' timed out")]
    TransitionTimeout { state: String },
    #[error("Retry budget exhausted for transition '{state}'")]
    RetryBudgetExhausted { state: String },
}

#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum InternalError {
    #[error("Internal error: {0}")]
    Internal(String),
    #[error("An uncategorized error occurred: {0}")]
    Todo(String),
}

/// Each variant corresponds to a user-meaningful error category, used to route
/// diagnostics and to pick the process exit code (see `constants::exit_code`).
#[derive(Debug, thiserror::Error, IntoStaticStr, PartialEq)]
#[strum(serialize_all = "kebab-case")]
pub enum ErrorKind {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    BlockDevice(#[from] BlockDeviceError),
    #[error(transparent)]
    Safeguard(#[from] SafeguardError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Fsm(#[from] FsmError),
    #[error(transparent)]
    Internal(#[from] InternalError),
}

#[derive(Debug)]
struct PipelineErrorInner {
    kind: ErrorKind,
    location: &'static Location<'static>,
    source: Option<anyhow::Error>,
    context: Vec<(Cow<'static, str>, &'static Location<'static>)>,
}

/// The crate-wide error type. Boxed so that `Result<T, ManagerError>` stays
/// small on the stack regardless of which component's error it wraps.
pub struct ManagerError(Box<PipelineErrorInner>);

impl ManagerError {
    #[track_caller]
    pub fn new(kind: impl Into<ErrorKind>) -> Self {
        ManagerError(Box::new(PipelineErrorInner {
            kind: kind.into(),
            location: Location::caller(),
            source: None,
            context: Vec::new(),
        }))
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.0.kind
    }

    pub fn unstructured(self, context: impl Into<Cow<'static, str>>) -> anyhow::Error {
        match self.0.source {
            Some(source) => source.context(self.0.kind).context(context.into()),
            None => anyhow::Error::msg(self.0.kind.to_string()).context(context.into()),
        }
    }
}

pub trait ReportError<T, K> {
    /// Convert a fallible or optional value into a structured `ManagerError`.
    fn structured(self, kind: K) -> Result<T, ManagerError>;
}

impl<T, K> ReportError<T, K> for Option<T>
where
    K: Into<ErrorKind>,
{
    #[track_caller]
    fn structured(self, kind: K) -> Result<T, ManagerError> {
        match self {
            Some(t) => Ok(t),
            None => Err(ManagerError(Box::new(PipelineErrorInner {
                kind: kind.into(),
                location: Location::caller(),
                source: None,
                context: Vec::new(),
            }))),
        }
    }
}

impl<T, E, K> ReportError<T, K> for Result<T, E>
where
    E: Into<anyhow::Error>,
    K: Into<ErrorKind>,
{
    #[track_caller]
    fn structured(self, kind: K) -> Result<T, ManagerError> {
        match self {
            Ok(o) => Ok(o),
            Err(e) => Err(ManagerError(Box::new(PipelineErrorInner {
                kind: kind.into(),
                location: Location::caller(),
                source: Some(e.into()),
                context: Vec::new(),
            }))),
        }
    }
}

pub trait PipelineResultExt<T> {
    fn message(self, context: impl Into<Cow<'static, str>>) -> Result<T, ManagerError>;
}

impl<T> PipelineResultExt<T> for Result<T, ManagerError> {
    #[track_caller]
    fn message(mut self, context: impl Into<Cow<'static, str>>) -> Result<T, ManagerError> {
        if let Err(ref mut e) = self {
            e.0.context.push((context.into(), Location::caller()));
        }
        self
    }
}

impl Serialize for ManagerError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("manager-error", 3)?;
        state.serialize_field("message", &self.0.kind.to_string())?;
        state.serialize_field("category", <&str>::from(&self.0.kind))?;
        state.serialize_field(
            "location",
            &format!("{}:{}", self.0.location.file(), self.0.location.line()),
        )?;
        state.end()
    }
}

impl Debug for ManagerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} at {}:{}",
            self.0.kind,
            self.0.location.file(),
            self.0.location.line()
        )?;
        if !self.0.context.is_empty() {
            writeln!(f, "\n\nContext:")?;
            for (i, (context, location)) in self.0.context.iter().enumerate() {
                write!(f, "{: >5}: {}", i, context)?;
                writeln!(f, " at {}:{}", location.file(), location.line())?;
            }
        }
        if let Some(ref source) = self.0.source {
            let mut w = String::new();
            writeln!(w, "\n\nCaused by:\n{source:?}")?;
            f.write_str(&w)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for ManagerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.kind)
    }
}

impl std::error::Error for ManagerError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structured_preserves_category() {
        let err: Result<(), ManagerError> = Err(anyhow::anyhow!("boom"))
            .structured(PoolError::Full)
            .message("while creating snapshot");
        let err = err.unwrap_err();
        assert_eq!(<&str>::from(err.kind()), "pool");
        let rendered = format!("{err:?}");
        assert!(rendered.contains("while creating snapshot"));
        assert!(rendered.contains("boom"));
    }

    #[test]
    fn option_structured_none_becomes_error() {
        let v: Option<i32> = None;
        let err = v.structured(StoreError::Query).unwrap_err();
        assert_eq!(<&str>::from(err.kind()), "store");
    }
}
