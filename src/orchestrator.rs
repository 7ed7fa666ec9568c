//! # Build Orchestrator
//!
//! This module contains the core pipeline. It is responsible for:
//! 1. Confirming a usable interpreter exists (`probe_toolchain`).
//! 2. Installing the packaging tool, with retries (`install_packaging_dependency`).
//! 3. Removing the previous artifact and running the packaging tool (`run_packaging_step`).
//! 4. Deciding the outcome from the filesystem alone (`verify_artifact`).
//! 5. Printing the final banner (`report`).
//!
//! The flow is strictly linear and runs once per invocation:
//! `Start → ToolchainChecked → DependencyInstalled → PackagingInvoked → Verified → Reported*`.
//!
//! Only one orchestration may run per working directory at a time. PyInstaller's
//! intermediates under `build/` are not safe to share.
//!
//! It also carries the `doctor` and `clean` maintenance commands.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use log::{debug, info, warn};
use serde::Serialize;
use walkdir::WalkDir;

use crate::discovery::{self, ToolchainProbe, MIN_PYTHON};
use crate::error::BuildError;
use crate::invariant_ppt::*;
use crate::request::{BuildEnvironment, BuildRequest, PipelineSettings};
use crate::system::{self, CommandOutcome, ToolchainOps};

/// Coarse filesystems (FAT, some network shares) round timestamps down this far.
const MTIME_TOLERANCE: Duration = Duration::from_secs(2);

/// PyInstaller's default work directory.
const WORK_DIR: &str = "build";

const RULE: &str = "═══════════════════════════════════════════════════════════════";
const THIN_RULE: &str = "───────────────────────────────────────────────────────────────";

/// Where the pipeline currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Start,
    ToolchainChecked,
    DependencyInstalled,
    PackagingInvoked,
    Verified,
    ReportedSuccess,
    ReportedFailure,
}

/// Outcome of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildResult {
    /// Absolute path the artifact was expected at.
    pub artifact_path: PathBuf,
    /// Exactly "the artifact exists". Any previous artifact was deleted before packaging.
    pub succeeded: bool,
    pub exists: bool,
    /// Modification time is not older than the run start. Diagnostic only.
    pub fresh: bool,
    /// What the packaging tool itself reported. Diagnostic only.
    pub packaging: Option<CommandOutcome>,
}

impl BuildResult {
    pub fn exit_code(&self) -> i32 {
        if self.succeeded { 0 } else { 1 }
    }
}

pub struct Orchestrator<'a, T: ToolchainOps> {
    toolchain: &'a T,
    request: &'a BuildRequest,
    settings: &'a PipelineSettings,
    workdir: PathBuf,
    started_at: SystemTime,
    stage: Stage,
}

impl<'a, T: ToolchainOps> Orchestrator<'a, T> {
    pub fn new(
        toolchain: &'a T,
        request: &'a BuildRequest,
        settings: &'a PipelineSettings,
        workdir: &Path,
    ) -> Self {
        Self {
            toolchain,
            request,
            settings,
            workdir: workdir.to_path_buf(),
            started_at: SystemTime::now(),
            stage: Stage::Start,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Runs the whole pipeline up to (not including) the report.
    ///
    /// Any `Err` is fatal and stops the pipeline where it happened.
    /// A missing artifact is an `Ok` result with `succeeded == false`.
    pub fn run(&mut self) -> Result<BuildResult, BuildError> {
        let probe = self.probe_toolchain()?;
        let interpreter = probe.interpreter.ok_or(BuildError::ToolchainMissing)?;

        self.check_entry_point()?;
        let build_python = self.install_packaging_dependency(&interpreter)?;
        let packaging = self.run_packaging_step(&build_python)?;
        Ok(self.verify_artifact(Some(packaging)))
    }

    /// Looks for the interpreter. Missing or too old is fatal.
    pub fn probe_toolchain(&mut self) -> Result<ToolchainProbe, BuildError> {
        info!("Checking for Python...");
        let probe = self.toolchain.probe_interpreter();

        let version = match (&probe.interpreter, probe.version) {
            (Some(path), Some(version)) if probe.found => {
                info!("Found Python {} at {:?}", version, path);
                version
            }
            _ => return Err(BuildError::ToolchainMissing),
        };
        if !version.meets_floor() {
            return Err(BuildError::ToolchainTooOld { found: version, required: MIN_PYTHON });
        }

        self.stage = Stage::ToolchainChecked;
        Ok(probe)
    }

    fn check_entry_point(&self) -> Result<(), BuildError> {
        let entry = self.workdir.join(&self.request.entry_point);
        if !entry.is_file() {
            return Err(BuildError::EntryPointMissing { path: entry });
        }
        Ok(())
    }

    /// Installs the packaging tool and returns the interpreter later steps must use.
    ///
    /// In isolated mode this is the virtual environment's interpreter, created on first use.
    pub fn install_packaging_dependency(&mut self, interpreter: &Path) -> Result<PathBuf, BuildError> {
        assert_invariant(
            self.stage == Stage::ToolchainChecked,
            PROBE_BEFORE_SIDE_EFFECTS,
            "install",
        );

        let build_python = match &self.settings.environment {
            BuildEnvironment::Active => {
                warn!("Installing into the active Python environment (shared with other projects)");
                interpreter.to_path_buf()
            }
            BuildEnvironment::Isolated(env_dir) => {
                let env_dir = self.workdir.join(env_dir);
                let env_python = discovery::environment_interpreter(&env_dir);
                if env_python.is_file() {
                    debug!("Reusing build environment at {:?}", env_dir);
                } else {
                    info!("Creating build environment at {:?}...", env_dir);
                    let outcome = self.toolchain.create_environment(interpreter, &env_dir)?;
                    if !outcome.success() {
                        return Err(BuildError::EnvironmentSetupFailure { outcome });
                    }
                }
                env_python
            }
        };

        self.install_with_retry(&build_python)?;
        self.stage = Stage::DependencyInstalled;
        Ok(build_python)
    }

    fn install_with_retry(&self, interpreter: &Path) -> Result<CommandOutcome, BuildError> {
        let policy = self.settings.retry;
        let attempts = policy.attempts.max(1);
        let mut attempt = 1;

        loop {
            info!("Installing {} (attempt {}/{})...", self.settings.package, attempt, attempts);
            let outcome = self.toolchain.install_package(interpreter, &self.settings.package)?;
            if outcome.success() {
                return Ok(outcome);
            }
            if attempt >= attempts {
                return Err(BuildError::DependencyInstallFailure { attempts, outcome });
            }

            let wait = backoff_delay(policy.delay, attempt);
            warn!("Install failed ({}). Retrying in {:?}...", outcome.status_text(), wait);
            std::thread::sleep(wait);
            attempt += 1;
        }
    }

    /// Deletes any previous artifact, then runs the packaging tool.
    ///
    /// The tool's exit code is captured but not acted on: `verify_artifact` decides.
    pub fn run_packaging_step(&mut self, interpreter: &Path) -> Result<CommandOutcome, BuildError> {
        assert_invariant(
            self.stage == Stage::DependencyInstalled,
            PROBE_BEFORE_SIDE_EFFECTS,
            "package",
        );

        let artifact = self.workdir.join(self.request.artifact_path());
        if artifact.exists() {
            info!("Removing previous artifact {:?}", artifact);
            std::fs::remove_file(&artifact)
                .map_err(|source| BuildError::StaleArtifact { path: artifact.clone(), source })?;
        }
        assert_invariant(!artifact.exists(), NO_STALE_ARTIFACT, "package");

        info!("Building {}...", self.request.output_name);
        let outcome = self.toolchain.run_packager(interpreter, &self.request.packager_args())?;
        if outcome.success() {
            debug!("Packaging tool finished in {:?}", outcome.duration);
        } else {
            warn!("Packaging tool reported failure ({})", outcome.status_text());
        }

        self.stage = Stage::PackagingInvoked;
        Ok(outcome)
    }

    /// Checks the filesystem for the artifact.
    ///
    /// Freshness is only reported: filesystems with coarse or skewed clocks can
    /// stamp a brand-new file with an older time.
    pub fn verify_artifact(&mut self, packaging: Option<CommandOutcome>) -> BuildResult {
        let artifact_path = self.workdir.join(self.request.artifact_path());
        let metadata = std::fs::metadata(&artifact_path).ok().filter(|m| m.is_file());
        let exists = metadata.is_some();
        let fresh = metadata
            .and_then(|m| m.modified().ok())
            .map(|modified| modified + MTIME_TOLERANCE >= self.started_at)
            .unwrap_or(exists);

        let succeeded = exists;
        assert_invariant(!succeeded || artifact_path.is_file(), SUCCESS_MEANS_ARTIFACT, "verify");

        if exists && !fresh {
            warn!("{:?} has a timestamp older than this build", artifact_path);
        }

        self.stage = Stage::Verified;
        BuildResult { artifact_path, succeeded, exists, fresh, packaging }
    }

    /// Prints the final banner.
    pub fn report(&mut self, out: &mut impl Write, result: &BuildResult) -> io::Result<()> {
        write_report(out, result, &self.workdir)?;
        self.stage = if result.succeeded { Stage::ReportedSuccess } else { Stage::ReportedFailure };
        Ok(())
    }

    /// The commands a real run would execute, for `--dry-run`.
    pub fn plan(&self, interpreter: &Path) -> Vec<String> {
        let mut steps = Vec::new();
        let build_python = match &self.settings.environment {
            BuildEnvironment::Active => interpreter.to_path_buf(),
            BuildEnvironment::Isolated(env_dir) => {
                let env_dir = self.workdir.join(env_dir);
                let env_python = discovery::environment_interpreter(&env_dir);
                if !env_python.is_file() {
                    steps.push(system::render_command_line(
                        &interpreter.to_string_lossy(),
                        &system::venv_args(&env_dir),
                    ));
                }
                env_python
            }
        };
        let python = build_python.to_string_lossy();

        steps.push(system::render_command_line(&python, &system::install_args(&self.settings.package)));
        let artifact = self.workdir.join(self.request.artifact_path());
        if artifact.exists() {
            steps.push(format!("delete {}", artifact.display()));
        }
        steps.push(system::render_command_line(&python, &self.request.packager_args()));
        steps.push(format!("verify {}", artifact.display()));
        steps
    }
}

/// Linear back-off for the `attempt`-th retry, saturating instead of overflowing.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.checked_mul(attempt).unwrap_or(Duration::MAX)
}

fn display_relative(path: &Path, workdir: &Path) -> String {
    path.strip_prefix(workdir).unwrap_or(path).display().to_string()
}

/// Writes the success or failure banner for a finished run.
pub fn write_report(out: &mut impl Write, result: &BuildResult, workdir: &Path) -> io::Result<()> {
    writeln!(out)?;
    writeln!(out, "{RULE}")?;
    if result.succeeded {
        writeln!(out, "                      BUILD SUCCESSFUL!")?;
        writeln!(out, "{RULE}")?;
        writeln!(out)?;
        writeln!(out, "  Executable: {}", display_relative(&result.artifact_path, workdir))?;
        if !result.fresh {
            writeln!(out)?;
            writeln!(out, "  ⚠ Its timestamp is older than this build. Check the system clock.")?;
        }
        if let Some(outcome) = result.packaging.as_ref().filter(|o| !o.success()) {
            writeln!(out)?;
            writeln!(out, "  ⚠ The packaging tool reported {} but the executable was produced.", outcome.status_text())?;
        }
    } else {
        writeln!(out, "                        BUILD FAILED!")?;
        writeln!(out, "{RULE}")?;
        writeln!(out)?;
        writeln!(out, "  The executable was not produced:")?;
        writeln!(out, "    ✕ {}", display_relative(&result.artifact_path, workdir))?;

        if let Some(outcome) = &result.packaging {
            writeln!(out)?;
            writeln!(out, "  Packaging tool: {}", outcome.status_text())?;
            writeln!(out, "    {}", outcome.command_line())?;
            if !outcome.stderr_tail.is_empty() {
                writeln!(out, "  Last lines of its error output:")?;
                for line in outcome.stderr_tail.lines() {
                    writeln!(out, "    {line}")?;
                }
            }
        }

        if let Some(dir) = result.artifact_path.parent().filter(|d| d.is_dir()) {
            let produced: Vec<String> = WalkDir::new(dir)
                .min_depth(1)
                .max_depth(1)
                .into_iter()
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect();
            if !produced.is_empty() {
                writeln!(out)?;
                writeln!(out, "  Found in {} instead:", display_relative(dir, workdir))?;
                for name in produced {
                    writeln!(out, "    - {name}")?;
                }
            }
        }

        writeln!(out)?;
        writeln!(out, "  Check the output above for errors.")?;
    }
    writeln!(out)?;
    Ok(())
}

/// Writes the failure banner for an error that stopped the pipeline early.
pub fn write_fatal(out: &mut impl Write, err: &BuildError) -> io::Result<()> {
    writeln!(out)?;
    writeln!(out, "{RULE}")?;
    writeln!(out, "                        BUILD FAILED!")?;
    writeln!(out, "{RULE}")?;
    writeln!(out)?;
    writeln!(out, "  ERROR: {err}")?;
    if let Some(advice) = err.guidance() {
        writeln!(out)?;
        for line in advice.lines() {
            writeln!(out, "  {line}")?;
        }
    }
    writeln!(out)?;
    Ok(())
}

/// Snapshot of the build prerequisites. Never installs or builds anything.
#[derive(Debug, Clone, Serialize)]
pub struct DoctorReport {
    pub probe: ToolchainProbe,
    pub meets_floor: bool,
    pub entry_point: PathBuf,
    pub entry_point_present: bool,
    pub environment: Option<PathBuf>,
    pub environment_ready: bool,
    pub artifact: PathBuf,
    pub artifact_present: bool,
}

impl DoctorReport {
    pub fn healthy(&self) -> bool {
        self.probe.found && self.meets_floor && self.entry_point_present
    }
}

pub fn doctor(
    toolchain: &impl ToolchainOps,
    request: &BuildRequest,
    settings: &PipelineSettings,
    workdir: &Path,
) -> DoctorReport {
    let probe = toolchain.probe_interpreter();
    let meets_floor = probe.version.is_some_and(|v| v.meets_floor());
    let entry_point = workdir.join(&request.entry_point);
    let artifact = workdir.join(request.artifact_path());
    let environment = match &settings.environment {
        BuildEnvironment::Active => None,
        BuildEnvironment::Isolated(dir) => Some(workdir.join(dir)),
    };
    let environment_ready = environment
        .as_deref()
        .is_some_and(|dir| discovery::environment_interpreter(dir).is_file());

    DoctorReport {
        meets_floor,
        entry_point_present: entry_point.is_file(),
        artifact_present: artifact.is_file(),
        probe,
        entry_point,
        environment,
        environment_ready,
        artifact,
    }
}

pub fn write_doctor(out: &mut impl Write, report: &DoctorReport, workdir: &Path) -> io::Result<()> {
    writeln!(out)?;
    writeln!(out, "{RULE}")?;
    writeln!(out, "                      Build Health Report")?;
    writeln!(out, "{RULE}")?;
    writeln!(out)?;

    writeln!(out, "1. PYTHON")?;
    match (&report.probe.interpreter, report.probe.version) {
        (Some(path), Some(version)) if report.meets_floor => {
            writeln!(out, "   ✓ Python {version} at {}", path.display())?;
        }
        (Some(path), Some(version)) => {
            writeln!(out, "   ⚠ Python {version} at {} is older than {MIN_PYTHON}", path.display())?;
        }
        _ => writeln!(out, "   ✕ Not found on PATH")?,
    }

    writeln!(out)?;
    writeln!(out, "2. APPLICATION SCRIPT")?;
    let entry = display_relative(&report.entry_point, workdir);
    if report.entry_point_present {
        writeln!(out, "   ✓ {entry}")?;
    } else {
        writeln!(out, "   ✕ {entry} is missing")?;
    }

    writeln!(out)?;
    writeln!(out, "3. BUILD ENVIRONMENT")?;
    match &report.environment {
        None => writeln!(out, "   Active Python environment (not isolated)")?,
        Some(dir) if report.environment_ready => {
            writeln!(out, "   ✓ {} is ready", display_relative(dir, workdir))?
        }
        Some(dir) => writeln!(out, "   {} will be created on first build", display_relative(dir, workdir))?,
    }

    writeln!(out)?;
    writeln!(out, "4. EXECUTABLE")?;
    let artifact = display_relative(&report.artifact, workdir);
    if report.artifact_present {
        writeln!(out, "   ✓ {artifact} exists")?;
    } else {
        writeln!(out, "   {artifact} has not been built yet")?;
    }

    writeln!(out)?;
    writeln!(out, "{THIN_RULE}")?;
    writeln!(out)?;
    if report.healthy() {
        writeln!(out, "✓ Ready to build. Run 'mlm-build' to package the application.")?;
    } else {
        writeln!(out, "Fix the issues above before building.")?;
    }
    writeln!(out)?;
    Ok(())
}

/// What `clean` removed.
#[derive(Debug, Default)]
pub struct CleanSummary {
    pub removed: Vec<PathBuf>,
    pub files: usize,
}

/// Removes build intermediates, the artifact and the isolated environment.
pub fn clean(request: &BuildRequest, settings: &PipelineSettings, workdir: &Path) -> io::Result<CleanSummary> {
    let mut targets = vec![
        workdir.join(WORK_DIR),
        workdir.join(request.spec_file()),
        workdir.join(request.artifact_path()),
    ];
    if let BuildEnvironment::Isolated(dir) = &settings.environment {
        targets.push(workdir.join(dir));
    }

    let mut summary = CleanSummary::default();
    for target in targets {
        if !target.exists() {
            continue;
        }
        if workdir.starts_with(&target) {
            warn!("Refusing to remove {:?}: it contains the project folder", target);
            continue;
        }
        let files = WalkDir::new(&target)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .count();

        if target.is_dir() {
            std::fs::remove_dir_all(&target)?;
        } else {
            std::fs::remove_file(&target)?;
        }
        info!("Removed {:?} ({} files)", target, files);
        summary.files += files;
        summary.removed.push(target);
    }

    // Only drops the output directory when nothing else lives there.
    let dist = workdir.join(&request.dist_dir);
    if dist.is_dir() && std::fs::remove_dir(&dist).is_ok() {
        summary.removed.push(dist);
    }

    Ok(summary)
}
