//! Shell command execution for command triggers.

use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

use crate::error::TriggerError;

/// Shells tried, in order, when `$SHELL` is unset.
const COMMON_SHELLS: &[&str] = &["/bin/sh", "/bin/bash", "/bin/zsh", "/bin/fish"];

/// Executes a rendered command line.
///
/// Returns the captured output on success.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command line to completion.
    async fn run(&self, command: &str) -> Result<String, TriggerError>;
}

/// Runs command lines through `<shell> -c`.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: Option<PathBuf>,
}

impl ShellRunner {
    /// Resolve the shell from `$SHELL`, falling back to common shell paths.
    pub fn detect() -> Self {
        let shell = resolve_shell(std::env::var_os("SHELL"), COMMON_SHELLS);
        match &shell {
            Some(path) => debug!(shell = %path.display(), "Resolved shell"),
            None => debug!("No shell found, command triggers will fail"),
        }
        Self { shell }
    }

    /// Use an explicit shell, or none.
    pub fn with_shell(shell: Option<PathBuf>) -> Self {
        Self { shell }
    }

    /// The resolved shell, if any.
    pub fn shell(&self) -> Option<&Path> {
        self.shell.as_deref()
    }
}

fn resolve_shell(env_shell: Option<OsString>, candidates: &[&str]) -> Option<PathBuf> {
    if let Some(shell) = env_shell.filter(|s| !s.is_empty()) {
        return Some(PathBuf::from(shell));
    }

    candidates
        .iter()
        .map(PathBuf::from)
        .find(|path| path.is_file())
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, command: &str) -> Result<String, TriggerError> {
        let shell = self.shell.as_ref().ok_or(TriggerError::NoShell)?;

        let output = Command::new(shell).arg("-c").arg(command).output().await?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            return Err(TriggerError::CommandFailed {
                status: output.status,
                output: combined,
            });
        }

        Ok(combined)
    }
}
