//! `Command`/`Output` extension traits, grounded on the teacher's
//! `osutils::exe` module: a sealed `OutputChecker` trait on `Output` plus a
//! `RunAndCheck` trait on `Command` that logs the rendered command at trace
//! level and turns a non-zero exit into a contextualized `anyhow::Error`.

use std::os::unix::process::ExitStatusExt;
use std::process::{Command, ExitStatus, Output};

use anyhow::{anyhow, Context, Error};
use log::trace;

use crate::crate_private::Sealed;

pub trait OutputChecker: Sealed {
    fn is_success(&self) -> bool;
    fn exit_code(&self) -> Option<i32>;
    fn end_signal(&self) -> Option<i32>;

    fn output(&self) -> String {
        String::new()
    }

    fn error_output(&self) -> String {
        String::new()
    }

    fn output_report(&self) -> String {
        let stdout = self.output();
        let stderr = self.error_output();
        let mut res = String::with_capacity(stdout.len() + stderr.len() + 20);
        if !stdout.is_empty() {
            res += &format!("stdout:\n{stdout}\n");
        }
        if !stderr.is_empty() {
            if !res.is_empty() {
                res += "\n";
            }
            res += &format!("stderr:\n{stderr}\n");
        }
        res
    }

    fn explain_exit(&self) -> String {
        if let Some(code) = self.exit_code() {
            format!("process exited with status: {code}")
        } else if let Some(signal) = self.end_signal() {
            format!("process was terminated by signal: {signal}")
        } else {
            "process exited with unknown status".to_string()
        }
    }

    fn check(&self) -> Result<(), Error> {
        if self.is_success() {
            return Ok(());
        }
        let report = self.output_report();
        if report.is_empty() {
            Err(anyhow!("(no output captured)").context(self.explain_exit()))
        } else {
            Err(anyhow!("Process output:\n{report}").context(self.explain_exit()))
        }
    }

    fn check_output(&self) -> Result<String, Error> {
        self.check()?;
        Ok(self.output())
    }
}

impl Sealed for Output {}

impl OutputChecker for Output {
    fn is_success(&self) -> bool {
        self.status.success()
    }

    fn exit_code(&self) -> Option<i32> {
        self.status.code()
    }

    fn end_signal(&self) -> Option<i32> {
        self.status.signal()
    }

    fn output(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    fn error_output(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

pub trait RunAndCheck: Sealed {
    fn run_and_check(&mut self) -> Result<(), Error>;
    fn output_and_check(&mut self) -> Result<String, Error>;
    fn raw_output_and_check(&mut self) -> Result<Output, Error>;
    fn render_command(&self) -> String;
}

impl Sealed for Command {}

impl RunAndCheck for Command {
    fn run_and_check(&mut self) -> Result<(), Error> {
        let rendered = self.render_command();
        trace!("Executing '{rendered}'");
        let result = self.output().context("Failed to spawn process")?;
        trace!(
            "Executed '{rendered}': {}.\n{}",
            result.explain_exit(),
            result.output_report(),
        );
        result
            .check()
            .with_context(|| format!("Error when running: {rendered}"))
    }

    fn output_and_check(&mut self) -> Result<String, Error> {
        let rendered = self.render_command();
        trace!("Executing '{rendered}'");
        let result = self.output().context("Failed to spawn process")?;
        trace!(
            "Executed '{rendered}': {}.\n{}",
            result.explain_exit(),
            result.output_report(),
        );
        result
            .check_output()
            .with_context(|| format!("Error when running: {rendered}"))
    }

    fn raw_output_and_check(&mut self) -> Result<Output, Error> {
        let rendered = self.render_command();
        let result = self.output().context("Failed to spawn process")?;
        result
            .check()
            .with_context(|| format!("Error when running: {rendered}"))?;
        Ok(result)
    }

    fn render_command(&self) -> String {
        let mut s = self.get_program().to_string_lossy().into_owned();
        for arg in self.get_args() {
            s.push(' ');
            s.push_str(&arg.to_string_lossy());
        }
        s
    }
}

/// Returns true if a process with this pid exists, by sending the null
/// signal (spec §4.4 process-lock stale detection).
pub fn process_exists(pid: i32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

/// Whether an `ExitStatus` indicates a "not found"-style failure that the
/// caller should treat as a no-op, independent of the exact tool's exit code
/// convention.
pub fn exit_status_ok(status: &ExitStatus) -> bool {
    status.success()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_and_check_succeeds_for_true() {
        Command::new("true").run_and_check().unwrap();
    }

    #[test]
    fn run_and_check_fails_for_false() {
        assert!(Command::new("false").run_and_check().is_err());
    }

    #[test]
    fn output_and_check_captures_stdout() {
        let out = Command::new("echo")
            .arg("hello")
            .output_and_check()
            .unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[test]
    fn nonexistent_pid_is_absent() {
        assert!(!process_exists(i32::MAX));
    }

    #[test]
    fn current_process_exists() {
        assert!(process_exists(std::process::id() as i32));
    }
}
