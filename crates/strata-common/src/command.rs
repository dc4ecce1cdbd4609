//! External command execution.
//!
//! Formatting backing stores, loop mounting and tree copies shell out to
//! system tools. They do so through [`CommandRunner`] so tests can observe
//! and script the calls.

use std::process::Command;

use crate::error::{StrataError, StrataResult};

/// Runs external programs.
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`, returning its combined stdout and stderr.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::Command`] if the program cannot be started or
    /// exits unsuccessfully.
    fn run(&self, program: &str, args: &[&str]) -> StrataResult<String>;
}

/// Runs commands on the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str]) -> StrataResult<String> {
        tracing::debug!(program, ?args, "Running command");

        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| StrataError::Command {
                program: program.to_string(),
                message: e.to_string(),
            })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            return Err(StrataError::Command {
                program: program.to_string(),
                message: format!("{}: {}", output.status, combined.trim()),
            });
        }

        Ok(combined)
    }
}
