//! # Error Taxonomy
//!
//! Every way the build pipeline can stop early. All variants here are fatal:
//! the orchestrator halts at the step that raised them and the operator gets a
//! failure banner with the guidance from [`BuildError::guidance`].
//!
//! A packaging tool that exits non-zero is *not* an error value. Its captured
//! [`CommandOutcome`] is attached to the `BuildResult` instead, and the artifact
//! check decides the outcome.

use std::path::PathBuf;
use thiserror::Error;

use crate::discovery::{InterpreterVersion, MIN_PYTHON};
use crate::system::CommandOutcome;

/// Where operators should fetch the interpreter from.
pub const PYTHON_DOWNLOAD_URL: &str = "https://www.python.org/downloads/";

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("Python was not found on PATH")]
    ToolchainMissing,

    #[error("Python {found} is too old (need {required} or newer)")]
    ToolchainTooOld {
        found: InterpreterVersion,
        required: InterpreterVersion,
    },

    #[error("Entry point not found: {}", .path.display())]
    EntryPointMissing { path: PathBuf },

    #[error("Invalid output name '{name}': {reason}")]
    InvalidOutputName { name: String, reason: String },

    #[error("Invalid {field} '{}': {reason}", .path.display())]
    InvalidPath {
        field: String,
        path: PathBuf,
        reason: String,
    },

    #[error("Could not create the build environment ({})", .outcome.status_text())]
    EnvironmentSetupFailure { outcome: CommandOutcome },

    #[error("Installing the packaging tool failed after {attempts} attempt(s) ({})", .outcome.status_text())]
    DependencyInstallFailure {
        attempts: u32,
        outcome: CommandOutcome,
    },

    #[error("Could not remove the previous artifact at {}", .path.display())]
    StaleArtifact {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to start '{program}'")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration in {}: {reason}", .path.display())]
    Config { path: PathBuf, reason: String },
}

impl BuildError {
    /// Operator-facing advice printed under the failure banner.
    pub fn guidance(&self) -> Option<String> {
        match self {
            BuildError::ToolchainMissing | BuildError::ToolchainTooOld { .. } => Some(format!(
                "Install Python {MIN_PYTHON} or newer from {PYTHON_DOWNLOAD_URL}\n\
                 During setup, tick \"Add Python to PATH\", then open a new terminal and retry."
            )),
            BuildError::EntryPointMissing { .. } => Some(
                "Run the build from the project folder that contains the application script."
                    .to_string(),
            ),
            BuildError::InvalidOutputName { .. } => Some(
                "Pick a name made of letters, digits, '-', '_' or '.' that is not a reserved device name."
                    .to_string(),
            ),
            BuildError::InvalidPath { .. } => Some(
                "Use a relative folder name inside the project, such as \"dist\" or \".build-env\"."
                    .to_string(),
            ),
            BuildError::EnvironmentSetupFailure { outcome }
            | BuildError::DependencyInstallFailure { outcome, .. } => {
                let mut advice = String::from(
                    "Check your network connection and permissions, then retry.",
                );
                if !outcome.stderr_tail.is_empty() {
                    advice.push_str("\nLast lines of error output:\n");
                    advice.push_str(&outcome.stderr_tail);
                }
                Some(advice)
            }
            BuildError::StaleArtifact { .. } => Some(
                "Close any running copy of the application and retry.".to_string(),
            ),
            BuildError::Spawn { source, .. } => Some(format!("The operating system said: {source}")),
            BuildError::Config { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn failed_outcome(stderr: &str) -> CommandOutcome {
        CommandOutcome {
            program: "python".to_string(),
            args: vec!["-m".into(), "pip".into()],
            exit_code: Some(1),
            stderr_tail: stderr.to_string(),
            duration: Duration::ZERO,
        }
    }

    #[test]
    fn missing_toolchain_guidance_names_source_and_path() {
        let advice = BuildError::ToolchainMissing.guidance().unwrap();
        assert!(advice.contains(PYTHON_DOWNLOAD_URL));
        assert!(advice.contains("PATH"));
        assert!(advice.contains("3.8"));
    }

    #[test]
    fn install_failure_passes_stderr_through() {
        let err = BuildError::DependencyInstallFailure {
            attempts: 3,
            outcome: failed_outcome("ERROR: Could not find a version that satisfies"),
        };
        assert!(err.to_string().contains("3 attempt(s)"));
        assert!(err.to_string().contains("exit code 1"));
        assert!(err.guidance().unwrap().contains("Could not find a version"));
    }
}
