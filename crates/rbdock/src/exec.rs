//! External executables.
//!
//! Every tool the driver shells out to is resolved once on `PATH` and run
//! to completion with captured output.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Command;

use rbdock_common::{RbdError, RbdResult};

/// A resolved external executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tool {
    name: String,
    path: PathBuf,
}

/// Captured result of a finished process.
#[derive(Debug, Clone)]
pub struct Captured {
    /// Exit code, `None` when killed by a signal.
    pub code: Option<i32>,
    /// Standard output.
    pub stdout: String,
    /// Standard error, trimmed.
    pub stderr: String,
    args: String,
}

impl Tool {
    /// Resolve `name` on `PATH`.
    ///
    /// # Errors
    ///
    /// Returns [`RbdError::ExecutableNotFound`] if it is missing.
    pub fn locate(name: &str) -> RbdResult<Self> {
        let path = which::which(name).map_err(|_| RbdError::ExecutableNotFound {
            name: name.to_string(),
        })?;
        tracing::debug!(tool = name, path = %path.display(), "Resolved executable");
        Ok(Self {
            name: name.to_string(),
            path,
        })
    }

    /// Use an explicit path without resolving it.
    #[must_use]
    pub fn at(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }

    /// Program name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolved path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run to completion, whatever the exit status.
    ///
    /// # Errors
    ///
    /// Returns an I/O error only if the process cannot be spawned.
    pub fn run<I, S>(&self, args: I) -> RbdResult<Captured>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<S> = args.into_iter().collect();
        let joined = args
            .iter()
            .map(|a| a.as_ref().to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ");

        tracing::debug!(program = %self.name, args = %joined, "Running command");

        let output = Command::new(&self.path).args(&args).output()?;
        let captured = Captured {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            args: joined,
        };

        if !captured.success() {
            tracing::debug!(
                program = %self.name,
                code = ?captured.code,
                stderr = %captured.stderr,
                "Command failed"
            );
        }

        Ok(captured)
    }

    /// Run and return stdout, failing on a non-zero exit.
    ///
    /// # Errors
    ///
    /// Returns [`RbdError::Command`] on a non-zero exit.
    pub fn output<I, S>(&self, args: I) -> RbdResult<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let captured = self.run(args)?;
        if captured.success() {
            Ok(captured.stdout)
        } else {
            Err(captured.into_error(self))
        }
    }
}

impl Captured {
    /// True on exit code 0.
    #[must_use]
    pub const fn success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// True if the process exited with `code` and stderr mentions `needle`.
    #[must_use]
    pub fn failed_with(&self, code: i32, needle: &str) -> bool {
        self.code == Some(code) && self.stderr.contains(needle)
    }

    /// Convert a failure into a generic command error.
    #[must_use]
    pub fn into_error(self, tool: &Tool) -> RbdError {
        RbdError::Command {
            program: tool.name.clone(),
            args: self.args,
            code: self.code,
            stderr: self.stderr,
        }
    }
}
