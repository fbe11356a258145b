//! External process execution.
//!
//! Every call to `ssh-keygen` and `vault` goes through [`CommandRunner`] so
//! the lifecycle can be driven by scripted fakes in tests.

use std::ffi::OsString;
use std::io;
use std::process::{Command, Stdio};

use tracing::trace;

/// Captured result of a finished external command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when terminated by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given exit code and stderr
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs external programs to completion.
///
/// An `Err` means the program could not be started at all; a program that
/// ran and failed is an `Ok` with a non-zero code.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[OsString]) -> io::Result<CommandOutput>;
}

impl<F> CommandRunner for F
where
    F: Fn(&str, &[OsString]) -> io::Result<CommandOutput> + Send + Sync,
{
    fn run(&self, program: &str, args: &[OsString]) -> io::Result<CommandOutput> {
        self(program, args)
    }
}

/// Runs commands as child processes, inheriting the caller's environment
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[OsString]) -> io::Result<CommandOutput> {
        trace!(program = %program, args = ?args, "Running external command");

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Lossy string form of an argument list, for logs and assertions
pub fn display_args(args: &[OsString]) -> Vec<String> {
    args.iter()
        .map(|a| a.to_string_lossy().into_owned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_runner() {
        let runner = |program: &str, args: &[OsString]| -> io::Result<CommandOutput> {
            Ok(CommandOutput::ok(format!("{program} {}", display_args(args).join(" "))))
        };
        let out = runner
            .run("echo", &[OsString::from("a"), OsString::from("b")])
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, "echo a b");
    }

    #[test]
    fn test_failed_output() {
        let out = CommandOutput::failed(2, "boom");
        assert!(!out.success());
        assert_eq!(out.stderr, "boom");
    }

    #[cfg(unix)]
    #[test]
    fn test_system_runner_missing_program() {
        let err = SystemRunner
            .run("vaultsign-definitely-missing-binary", &[])
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[cfg(unix)]
    #[test]
    fn test_system_runner_captures_exit_code() {
        let out = SystemRunner
            .run("sh", &[OsString::from("-c"), OsString::from("echo out; echo err >&2; exit 3")])
            .unwrap();
        assert_eq!(out.code, Some(3));
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
    }
}
