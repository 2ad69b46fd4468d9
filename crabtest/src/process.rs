//! External tool invocation.
//!
//! The programmer (`ecpprog`) and the DFU utility (`dfu-util`) are opaque
//! external processes: only their exit status and captured output text
//! matter to the harness. The [`ProcessRunner`] trait is the seam that lets
//! the orchestrator run against scripted outputs in tests.

use std::process::{Command, Stdio};

use log::{debug, trace};

use crate::error::{Error, Result};

/// Captured result of one external tool invocation.
#[derive(Debug, Clone)]
pub struct RunOutput {
    /// Whether the process exited with status 0.
    pub success: bool,
    /// Combined stdout and stderr, lossily decoded.
    pub text: String,
}

impl RunOutput {
    /// Whether the captured text contains the given token.
    #[must_use]
    pub fn contains(&self, token: &str) -> bool {
        self.text.contains(token)
    }
}

/// Runs external tools and captures their output.
pub trait ProcessRunner {
    /// Run `program` with `args`, blocking until it exits.
    ///
    /// A non-zero exit is not an error at this level; the caller judges
    /// `success` together with the output text.
    fn run(&mut self, program: &str, args: &[&str]) -> Result<RunOutput>;
}

/// [`ProcessRunner`] over the host system.
#[derive(Debug, Default)]
pub struct SystemRunner;

impl ProcessRunner for SystemRunner {
    fn run(&mut self, program: &str, args: &[&str]) -> Result<RunOutput> {
        debug!("running: {program} {}", args.join(" "));

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| Error::Programmer(format!("failed to launch {program}: {e}")))?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        trace!("{program} exited {:?}, {} bytes captured", output.status.code(), text.len());

        Ok(RunOutput { success: output.status.success(), text })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_output_contains() {
        let out = RunOutput { success: true, text: "IDCODE: 0x41113043\nBye.\n".to_string() };
        assert!(out.contains("IDCODE: 0x41113043"));
        assert!(!out.contains("IDCODE: 0x41111043"));
    }

    #[cfg(unix)]
    #[test]
    fn test_system_runner_captures_exit_and_text() {
        let mut runner = SystemRunner;
        let out = runner.run("sh", &["-c", "echo hello; echo oops >&2"]).unwrap();
        assert!(out.success);
        assert!(out.contains("hello"));
        assert!(out.contains("oops"));

        let out = runner.run("sh", &["-c", "exit 3"]).unwrap();
        assert!(!out.success);
    }

    #[test]
    fn test_missing_program_is_programmer_error() {
        let mut runner = SystemRunner;
        let err = runner.run("definitely-not-a-real-binary-xyzzy", &[]).unwrap_err();
        assert!(matches!(err, Error::Programmer(_)));
    }
}
