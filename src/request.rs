//! # Build Request & Configuration
//!
//! The packaging invocation is fixed: one entry script, one output name, single-file
//! windowed mode. An optional JSON config file can move paths around, pin the
//! packaging tool version and tune the install retry policy. It cannot change the mode flags.
//!
//! Config lookup order:
//! 1. `--config <path>` (must exist)
//! 2. `./mlm-build.json` in the working directory
//! 3. `<user config dir>/mlm-build/config.json`
//! 4. Built-in defaults

use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use log::debug;
use serde::Deserialize;

use crate::error::BuildError;

pub const DEFAULT_ENTRY_POINT: &str = "mlm_window_manager.py";
pub const DEFAULT_OUTPUT_NAME: &str = "MLM_Window_Manager";
pub const DEFAULT_DIST_DIR: &str = "dist";
pub const DEFAULT_PACKAGE: &str = "pyinstaller";
pub const DEFAULT_ENV_DIR: &str = ".build-env";
pub const DEFAULT_INSTALL_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 5;
/// Longest base delay accepted from config.
pub const MAX_RETRY_DELAY_SECS: u64 = 300;
pub const CONFIG_FILE_NAME: &str = "mlm-build.json";

/// Names Windows refuses to use as file names, whatever the extension.
const RESERVED_NAMES: [&str; 22] = [
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Packaging mode. Both flags are always on for this application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildMode {
    pub single_file: bool,
    pub windowed: bool,
}

impl BuildMode {
    pub const FIXED: BuildMode = BuildMode { single_file: true, windowed: true };
}

/// Everything the packaging step needs. Built once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    pub entry_point: PathBuf,
    pub output_name: String,
    pub mode: BuildMode,
    pub dist_dir: PathBuf,
    pub icon: Option<PathBuf>,
}

impl BuildRequest {
    pub fn new(
        entry_point: PathBuf,
        output_name: String,
        dist_dir: PathBuf,
        icon: Option<PathBuf>,
    ) -> Result<Self, BuildError> {
        validate_output_name(&output_name)?;
        validate_project_dir("dist_dir", &dist_dir)?;
        Ok(Self { entry_point, output_name, mode: BuildMode::FIXED, dist_dir, icon })
    }

    /// The request compiled into the tool.
    pub fn fixed() -> Self {
        Self {
            entry_point: PathBuf::from(DEFAULT_ENTRY_POINT),
            output_name: DEFAULT_OUTPUT_NAME.to_string(),
            mode: BuildMode::FIXED,
            dist_dir: PathBuf::from(DEFAULT_DIST_DIR),
            icon: None,
        }
    }

    /// `<dist>/<name><platform executable suffix>`, relative to the working directory.
    pub fn artifact_path(&self) -> PathBuf {
        self.dist_dir
            .join(format!("{}{}", self.output_name, std::env::consts::EXE_SUFFIX))
    }

    /// The `.spec` file PyInstaller leaves next to the entry point.
    pub fn spec_file(&self) -> PathBuf {
        PathBuf::from(format!("{}.spec", self.output_name))
    }

    /// Arguments handed to the interpreter to run the packaging tool.
    pub fn packager_args(&self) -> Vec<String> {
        let mut args = vec!["-m".to_string(), "PyInstaller".to_string()];
        if self.mode.single_file {
            args.push("--onefile".to_string());
        }
        if self.mode.windowed {
            args.push("--windowed".to_string());
        }
        args.push("--name".to_string());
        args.push(self.output_name.clone());
        args.push("--distpath".to_string());
        args.push(self.dist_dir.to_string_lossy().into_owned());
        if let Some(icon) = &self.icon {
            args.push("--icon".to_string());
            args.push(icon.to_string_lossy().into_owned());
        }
        args.push(self.entry_point.to_string_lossy().into_owned());
        args
    }
}

/// Rejects names that are not a valid file name on Windows (and therefore anywhere).
pub fn validate_output_name(name: &str) -> Result<(), BuildError> {
    let invalid = |reason: &str| {
        Err(BuildError::InvalidOutputName { name: name.to_string(), reason: reason.to_string() })
    };

    if name.trim().is_empty() {
        return invalid("name is empty");
    }
    if name == "." || name == ".." {
        return invalid("name is a relative directory");
    }
    if let Some(c) = name.chars().find(|c| "<>:\"/\\|?*".contains(*c) || c.is_control()) {
        return invalid(&format!("contains forbidden character {c:?}"));
    }
    if name.ends_with('.') || name.ends_with(' ') {
        return invalid("ends with a dot or a space");
    }
    let stem = name.split('.').next().unwrap_or(name).trim_end();
    if RESERVED_NAMES.iter().any(|r| r.eq_ignore_ascii_case(stem)) {
        return invalid("is a reserved device name");
    }
    Ok(())
}

/// Directories the tool creates and later deletes must sit strictly inside the
/// working directory: relative, and made of plain names only.
pub fn validate_project_dir(field: &str, path: &Path) -> Result<(), BuildError> {
    let invalid = |reason: &str| {
        Err(BuildError::InvalidPath {
            field: field.to_string(),
            path: path.to_path_buf(),
            reason: reason.to_string(),
        })
    };

    if path.as_os_str().is_empty() {
        return invalid("path is empty");
    }
    let mut names = 0;
    for component in path.components() {
        match component {
            Component::Normal(_) => names += 1,
            Component::CurDir => {}
            Component::ParentDir => return invalid("must not contain '..'"),
            Component::RootDir | Component::Prefix(_) => {
                return invalid("must be relative to the project folder");
            }
        }
    }
    if names == 0 {
        return invalid("points at the project folder itself");
    }
    Ok(())
}

/// How the install step retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    /// Base delay. Attempt `n` waits `n * delay` before the next try.
    pub delay: Duration,
}

/// Where the packaging tool gets installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildEnvironment {
    /// Whatever environment the discovered interpreter belongs to.
    Active,
    /// A project-scoped virtual environment at this path (relative to the working directory).
    Isolated(PathBuf),
}

/// Pipeline knobs that are not part of the packaging request itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    pub package: String,
    pub retry: RetryPolicy,
    pub environment: BuildEnvironment,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            package: DEFAULT_PACKAGE.to_string(),
            retry: RetryPolicy {
                attempts: DEFAULT_INSTALL_ATTEMPTS,
                delay: Duration::from_secs(DEFAULT_RETRY_DELAY_SECS),
            },
            environment: BuildEnvironment::Isolated(PathBuf::from(DEFAULT_ENV_DIR)),
        }
    }
}

/// On-disk configuration. Every field is optional.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildConfig {
    pub entry_point: Option<PathBuf>,
    pub output_name: Option<String>,
    pub dist_dir: Option<PathBuf>,
    pub icon: Option<PathBuf>,
    /// Package spec handed to pip, e.g. `pyinstaller==6.3.0`.
    pub package: Option<String>,
    pub install_attempts: Option<u32>,
    pub retry_delay_secs: Option<u64>,
    pub isolated: Option<bool>,
    pub env_dir: Option<PathBuf>,
}

impl BuildConfig {
    /// Finds and parses the config file, falling back to defaults when there is none.
    pub fn load(explicit: Option<&Path>, workdir: &Path) -> Result<Self, BuildError> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        let local = workdir.join(CONFIG_FILE_NAME);
        if local.is_file() {
            return Self::from_file(&local);
        }

        if let Some(dirs) = directories::ProjectDirs::from("", "", "mlm-build") {
            let user = dirs.config_dir().join("config.json");
            if user.is_file() {
                return Self::from_file(&user);
            }
        }

        debug!("No config file found, using built-in defaults");
        Ok(Self::default())
    }

    pub fn from_file(path: &Path) -> Result<Self, BuildError> {
        debug!("Loading config from {:?}", path);
        let text = std::fs::read_to_string(path)
            .map_err(|e| BuildError::Config { path: path.to_path_buf(), reason: e.to_string() })?;
        serde_json::from_str(&text)
            .map_err(|e| BuildError::Config { path: path.to_path_buf(), reason: e.to_string() })
    }

    /// Merges the config over the fixed defaults.
    pub fn resolve(self) -> Result<(BuildRequest, PipelineSettings), BuildError> {
        let fixed = BuildRequest::fixed();
        let request = BuildRequest::new(
            self.entry_point.unwrap_or(fixed.entry_point),
            self.output_name.unwrap_or(fixed.output_name),
            self.dist_dir.unwrap_or(fixed.dist_dir),
            self.icon,
        )?;

        let defaults = PipelineSettings::default();
        let environment = match self.isolated {
            Some(false) => BuildEnvironment::Active,
            _ => {
                let env_dir = self.env_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_ENV_DIR));
                validate_project_dir("env_dir", &env_dir)?;
                BuildEnvironment::Isolated(env_dir)
            }
        };
        let settings = PipelineSettings {
            package: self.package.unwrap_or(defaults.package),
            retry: RetryPolicy {
                attempts: self.install_attempts.unwrap_or(defaults.retry.attempts).max(1),
                delay: self
                    .retry_delay_secs
                    .map(|secs| Duration::from_secs(secs.min(MAX_RETRY_DELAY_SECS)))
                    .unwrap_or(defaults.retry.delay),
            },
            environment,
        };

        Ok((request, settings))
    }
}
