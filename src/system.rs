use std::collections::VecDeque;
use std::ffi::OsString;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use log::debug;

use crate::discovery::{self, ToolchainProbe};
use crate::error::BuildError;

/// How many trailing lines of a tool's error stream are kept for the report.
const STDERR_TAIL_LINES: usize = 20;

/// Structured result of one external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub program: String,
    pub args: Vec<String>,
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stderr_tail: String,
    pub duration: Duration,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn status_text(&self) -> String {
        match self.exit_code {
            Some(code) => format!("exit code {code}"),
            None => "terminated by signal".to_string(),
        }
    }

    pub fn command_line(&self) -> String {
        render_command_line(&self.program, &self.args)
    }
}

/// Renders a command the way an operator would type it.
pub fn render_command_line(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .map(|part| {
            if part.contains(' ') {
                format!("\"{part}\"")
            } else {
                part.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Arguments that create a virtual environment.
pub fn venv_args(env_dir: &Path) -> Vec<String> {
    vec!["-m".into(), "venv".into(), env_dir.to_string_lossy().into_owned()]
}

/// Arguments that install (or upgrade) the packaging tool.
pub fn install_args(package: &str) -> Vec<String> {
    vec![
        "-m".into(),
        "pip".into(),
        "install".into(),
        "--upgrade".into(),
        "--disable-pip-version-check".into(),
        package.to_string(),
    ]
}

/// Abstraction over the external collaborators (interpreter, installer, packager).
/// This lets the pipeline be tested without spawning Python.
pub trait ToolchainOps {
    /// Look for an interpreter on the search path and query its version.
    fn probe_interpreter(&self) -> ToolchainProbe;

    /// Create a project-scoped virtual environment.
    fn create_environment(&self, interpreter: &Path, env_dir: &Path) -> Result<CommandOutcome, BuildError>;

    /// Install the packaging tool into whatever environment `interpreter` belongs to.
    fn install_package(&self, interpreter: &Path, package: &str) -> Result<CommandOutcome, BuildError>;

    /// Run the packaging tool with the given arguments.
    fn run_packager(&self, interpreter: &Path, args: &[String]) -> Result<CommandOutcome, BuildError>;
}

/// The real toolchain (Production). Every command runs inside `workdir`.
pub struct HostToolchain {
    pub workdir: PathBuf,
    pub search_path: OsString,
}

impl HostToolchain {
    pub fn new(workdir: PathBuf) -> Self {
        Self {
            workdir,
            search_path: std::env::var_os("PATH").unwrap_or_default(),
        }
    }

    fn query_version(&self, candidate: &Path) -> Option<discovery::InterpreterVersion> {
        let output = Command::new(candidate)
            .arg("--version")
            .current_dir(&self.workdir)
            .output()
            .ok()?;
        if !output.status.success() {
            debug!("{:?} --version exited with {:?}", candidate, output.status.code());
            return None;
        }
        // Python 2 prints its version to stderr.
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        discovery::parse_version(&stdout).or_else(|| discovery::parse_version(&stderr))
    }

    /// Runs a command with stdout passed straight to the console, and stderr
    /// echoed line by line while its tail is kept for the report.
    fn run_streaming(&self, program: &Path, args: &[String]) -> Result<CommandOutcome, BuildError> {
        let program_str = program.to_string_lossy().into_owned();
        debug!("Running: {}", render_command_line(&program_str, args));

        let started = Instant::now();
        let mut child = Command::new(program)
            .args(args)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| BuildError::Spawn { program: program_str.clone(), source })?;

        let stderr_tail = match child.stderr.take() {
            Some(stderr) => drain_stderr(BufReader::new(stderr)),
            None => String::new(),
        };

        let status = child
            .wait()
            .map_err(|source| BuildError::Spawn { program: program_str.clone(), source })?;

        Ok(CommandOutcome {
            program: program_str,
            args: args.to_vec(),
            exit_code: status.code(),
            stderr_tail,
            duration: started.elapsed(),
        })
    }
}

/// Echoes a child's stderr until EOF and returns its last lines.
///
/// Lines are decoded lossily: tools on Windows write the ANSI code page, and
/// stopping at the first undecodable line would close the pipe under the child.
fn drain_stderr(mut reader: impl BufRead) -> String {
    let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("Stopped reading stderr: {}", e);
                break;
            }
        }
        let line = String::from_utf8_lossy(&buf).trim_end_matches(['\r', '\n']).to_string();
        eprintln!("{line}");
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    Vec::from(tail).join("\n")
}

impl ToolchainOps for HostToolchain {
    fn probe_interpreter(&self) -> ToolchainProbe {
        for candidate in discovery::candidate_interpreters(&self.search_path) {
            if let Some(version) = self.query_version(&candidate) {
                return ToolchainProbe::found(candidate, version);
            }
        }
        ToolchainProbe::missing()
    }

    fn create_environment(&self, interpreter: &Path, env_dir: &Path) -> Result<CommandOutcome, BuildError> {
        self.run_streaming(interpreter, &venv_args(env_dir))
    }

    fn install_package(&self, interpreter: &Path, package: &str) -> Result<CommandOutcome, BuildError> {
        self.run_streaming(interpreter, &install_args(package))
    }

    fn run_packager(&self, interpreter: &Path, args: &[String]) -> Result<CommandOutcome, BuildError> {
        self.run_streaming(interpreter, args)
    }
}

/// A Mock Toolchain for Testing.
///
/// Records every call. The packager "builds" by writing `produces` to disk.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MockToolchain {
    pub probe: Option<ToolchainProbe>,
    /// Number of install attempts that fail before one succeeds.
    pub install_failures: std::sync::Mutex<u32>,
    pub venv_exit: i32,
    pub packager_exit: i32,
    pub produces: Option<PathBuf>,
    pub calls: std::sync::Mutex<Vec<String>>,
    pub packager_args: std::sync::Mutex<Vec<Vec<String>>>,
}

#[cfg(test)]
impl MockToolchain {
    /// A toolchain that finds Python 3.11 and builds `artifact` successfully.
    pub fn healthy(artifact: PathBuf) -> Self {
        Self {
            probe: Some(ToolchainProbe::found(
                PathBuf::from("python"),
                discovery::InterpreterVersion { major: 3, minor: 11, patch: 4 },
            )),
            produces: Some(artifact),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn outcome(program: &Path, args: Vec<String>, exit_code: i32, stderr: &str) -> CommandOutcome {
        CommandOutcome {
            program: program.to_string_lossy().into_owned(),
            args,
            exit_code: Some(exit_code),
            stderr_tail: stderr.to_string(),
            duration: Duration::ZERO,
        }
    }
}

#[cfg(test)]
impl ToolchainOps for MockToolchain {
    fn probe_interpreter(&self) -> ToolchainProbe {
        self.calls.lock().unwrap().push("probe".to_string());
        self.probe.clone().unwrap_or_else(ToolchainProbe::missing)
    }

    fn create_environment(&self, interpreter: &Path, env_dir: &Path) -> Result<CommandOutcome, BuildError> {
        self.calls.lock().unwrap().push("venv".to_string());
        Ok(Self::outcome(interpreter, venv_args(env_dir), self.venv_exit, "venv: permission denied"))
    }

    fn install_package(&self, interpreter: &Path, package: &str) -> Result<CommandOutcome, BuildError> {
        self.calls.lock().unwrap().push("install".to_string());
        let mut remaining = self.install_failures.lock().unwrap();
        if *remaining > 0 {
            *remaining -= 1;
            return Ok(Self::outcome(interpreter, install_args(package), 1, "ERROR: network unreachable"));
        }
        Ok(Self::outcome(interpreter, install_args(package), 0, ""))
    }

    fn run_packager(&self, interpreter: &Path, args: &[String]) -> Result<CommandOutcome, BuildError> {
        self.calls.lock().unwrap().push("package".to_string());
        self.packager_args.lock().unwrap().push(args.to_vec());
        if let Some(artifact) = &self.produces {
            if let Some(parent) = artifact.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(artifact, b"MZ").unwrap();
        }
        let stderr = if self.packager_exit == 0 { "" } else { "PyInstaller: error: script not found" };
        Ok(Self::outcome(interpreter, args.to_vec(), self.packager_exit, stderr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_quotes_spaces() {
        let args = vec!["-m".to_string(), "venv".to_string(), "C:\\My Project\\.build-env".to_string()];
        assert_eq!(
            render_command_line("python", &args),
            "python -m venv \"C:\\My Project\\.build-env\""
        );
    }

    #[test]
    fn install_arguments_keep_package_pin() {
        let args = install_args("pyinstaller==6.3.0");
        assert_eq!(args[..3], ["-m", "pip", "install"]);
        assert_eq!(args.last().map(String::as_str), Some("pyinstaller==6.3.0"));
    }

    #[test]
    fn outcome_status_text() {
        let mut outcome = MockToolchain::outcome(Path::new("python"), vec![], 2, "");
        assert!(!outcome.success());
        assert_eq!(outcome.status_text(), "exit code 2");
        outcome.exit_code = None;
        assert_eq!(outcome.status_text(), "terminated by signal");
    }

    #[test]
    fn mock_install_recovers_after_failures() {
        let mock = MockToolchain { install_failures: std::sync::Mutex::new(1), ..Default::default() };
        let python = Path::new("python");
        assert!(!mock.install_package(python, "pyinstaller").unwrap().success());
        assert!(mock.install_package(python, "pyinstaller").unwrap().success());
        assert_eq!(mock.calls(), vec!["install", "install"]);
    }

    #[test]
    fn drain_decodes_past_invalid_utf8() {
        let stderr: &[u8] = b"bad \xe9\r\nERROR: real cause\n";
        assert_eq!(drain_stderr(stderr), "bad \u{FFFD}\nERROR: real cause");
    }

    #[test]
    fn drain_keeps_only_the_last_lines() {
        let text: String = (1..=30).map(|i| format!("line {i}\n")).collect();
        let tail = drain_stderr(text.as_bytes());
        let lines: Vec<&str> = tail.lines().collect();
        assert_eq!(lines.len(), STDERR_TAIL_LINES);
        assert_eq!(lines.first(), Some(&"line 11"));
        assert_eq!(lines.last(), Some(&"line 30"));
    }

    #[cfg(unix)]
    mod host {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        fn host_in(dir: &Path) -> HostToolchain {
            HostToolchain { workdir: dir.to_path_buf(), search_path: OsString::new() }
        }

        fn sh(host: &HostToolchain, script: &str) -> CommandOutcome {
            host.run_streaming(Path::new("sh"), &["-c".to_string(), script.to_string()])
                .unwrap()
        }

        fn fake_interpreter(dir: &Path, name: &str, body: &str) -> PathBuf {
            let path = dir.join(name);
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        #[test]
        fn stderr_after_undecodable_line_reaches_the_tail() {
            let dir = tempfile::tempdir().unwrap();
            let outcome = sh(
                &host_in(dir.path()),
                "printf 'bad \\351\\n' >&2; echo 'ERROR: real cause' >&2; exit 1",
            );
            assert_eq!(outcome.exit_code, Some(1));
            assert!(outcome.stderr_tail.contains("ERROR: real cause"), "{:?}", outcome.stderr_tail);
        }

        #[test]
        fn child_is_drained_to_eof_after_undecodable_line() {
            let dir = tempfile::tempdir().unwrap();
            let outcome = sh(
                &host_in(dir.path()),
                "printf 'bad \\351\\n' >&2; head -c 1000000 /dev/zero | tr '\\000' 'x' >&2; \
                 echo >&2; echo 'finished' >&2; exit 3",
            );
            assert_eq!(outcome.exit_code, Some(3));
            assert!(outcome.stderr_tail.ends_with("finished"));
        }

        #[test]
        fn tail_is_capped_and_exit_code_kept() {
            let dir = tempfile::tempdir().unwrap();
            let outcome = sh(
                &host_in(dir.path()),
                "i=1; while [ $i -le 30 ]; do echo \"line $i\" >&2; i=$((i+1)); done; exit 2",
            );
            assert_eq!(outcome.exit_code, Some(2));
            assert_eq!(outcome.stderr_tail.lines().count(), STDERR_TAIL_LINES);
            assert!(outcome.stderr_tail.starts_with("line 11"));
        }

        #[test]
        fn killed_child_has_no_exit_code() {
            let dir = tempfile::tempdir().unwrap();
            let outcome = sh(&host_in(dir.path()), "kill -9 $$");
            assert_eq!(outcome.exit_code, None);
            assert_eq!(outcome.status_text(), "terminated by signal");
        }

        #[test]
        fn missing_program_is_a_spawn_error() {
            let dir = tempfile::tempdir().unwrap();
            let err = host_in(dir.path())
                .run_streaming(&dir.path().join("no-such-tool"), &[])
                .unwrap_err();
            assert!(matches!(err, BuildError::Spawn { .. }));
        }

        #[test]
        fn interpreter_version_read_from_stdout() {
            let dir = tempfile::tempdir().unwrap();
            let python = fake_interpreter(dir.path(), "python", "echo 'Python 3.11.4'");
            let mut host = host_in(dir.path());
            host.search_path = dir.path().as_os_str().to_os_string();

            let lookup = host.probe_interpreter();
            assert!(lookup.found);
            assert_eq!(lookup.interpreter, Some(python));
            assert_eq!(lookup.version.map(|v| v.to_string()), Some("3.11.4".to_string()));
        }

        #[test]
        fn interpreter_version_read_from_stderr() {
            let dir = tempfile::tempdir().unwrap();
            fake_interpreter(dir.path(), "python", "echo 'Python 2.7.18' >&2");
            let mut host = host_in(dir.path());
            host.search_path = dir.path().as_os_str().to_os_string();

            let version = host.probe_interpreter().version.unwrap();
            assert_eq!(version.to_string(), "2.7.18");
            assert!(!version.meets_floor());
        }

        #[test]
        fn candidates_that_cannot_run_are_skipped() {
            let broken = tempfile::tempdir().unwrap();
            let working = tempfile::tempdir().unwrap();
            fake_interpreter(broken.path(), "python", "exit 9");
            let python3 = fake_interpreter(working.path(), "python3", "echo 'Python 3.12.1'");

            let mut host = host_in(working.path());
            host.search_path = std::env::join_paths([broken.path(), working.path()]).unwrap();

            assert_eq!(host.probe_interpreter().interpreter, Some(python3));
        }

        #[test]
        fn no_interpreters_on_path_means_missing() {
            let dir = tempfile::tempdir().unwrap();
            let mut host = host_in(dir.path());
            host.search_path = dir.path().as_os_str().to_os_string();
            assert_eq!(host.probe_interpreter(), ToolchainProbe::missing());
        }
    }
}
