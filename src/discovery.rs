//! # Discovery Module
//!
//! Finds a usable Python interpreter before anything else happens.
//!
//! ## Strategy
//!
//! 1.  **Search PATH**: Every directory of the search path is checked, in order,
//!     for `python`, `python3` and the `py` launcher (with the platform executable suffix).
//! 2.  **Version query**: Each candidate is asked for `--version`. The first one that
//!     answers with a parseable version wins. This skips the Microsoft Store alias
//!     stubs that exist on disk but cannot actually run.
//!
//! The version query itself lives behind `ToolchainOps` so tests never spawn processes.

use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};
use log::debug;
use serde::Serialize;

/// Interpreter executable names, in preference order.
const INTERPRETER_NAMES: [&str; 3] = ["python", "python3", "py"];

/// Oldest interpreter the packaging tool still supports.
pub const MIN_PYTHON: InterpreterVersion = InterpreterVersion { major: 3, minor: 8, patch: 0 };

/// A `major.minor.patch` interpreter version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct InterpreterVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl InterpreterVersion {
    pub fn meets_floor(&self) -> bool {
        *self >= MIN_PYTHON
    }
}

impl fmt::Display for InterpreterVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Result of looking for the interpreter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolchainProbe {
    pub found: bool,
    pub interpreter: Option<PathBuf>,
    pub version: Option<InterpreterVersion>,
}

impl ToolchainProbe {
    pub fn missing() -> Self {
        Self { found: false, interpreter: None, version: None }
    }

    pub fn found(interpreter: PathBuf, version: InterpreterVersion) -> Self {
        Self { found: true, interpreter: Some(interpreter), version: Some(version) }
    }
}

/// Lists every interpreter executable present on the search path, in lookup order.
///
/// Directories come first (like a shell would resolve them), names second.
pub fn candidate_interpreters(search_path: &OsStr) -> Vec<PathBuf> {
    let mut found = Vec::new();
    for dir in std::env::split_paths(search_path) {
        if dir.as_os_str().is_empty() {
            continue;
        }
        for name in INTERPRETER_NAMES {
            let candidate = dir.join(format!("{name}{}", std::env::consts::EXE_SUFFIX));
            if candidate.is_file() {
                debug!("Interpreter candidate: {:?}", candidate);
                found.push(candidate);
            }
        }
    }
    found
}

/// Parses the output of `python --version`.
///
/// Accepts `Python 3.11.4`, `Python 3.12` and pre-releases like `Python 3.13.0rc1`.
pub fn parse_version(output: &str) -> Option<InterpreterVersion> {
    let line = output.lines().find(|l| l.trim_start().starts_with("Python"))?;
    let raw = line.trim().strip_prefix("Python")?.trim();

    let mut parts = raw.splitn(3, '.');
    let major = parts.next()?.parse().ok()?;
    let minor = leading_number(parts.next()?)?;
    let patch = parts.next().and_then(leading_number).unwrap_or(0);

    Some(InterpreterVersion { major, minor, patch })
}

fn leading_number(s: &str) -> Option<u32> {
    let digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// The interpreter inside a virtual environment created with `python -m venv`.
pub fn environment_interpreter(env_dir: &Path) -> PathBuf {
    if cfg!(windows) {
        env_dir.join("Scripts").join("python.exe")
    } else {
        env_dir.join("bin").join("python")
    }
}
