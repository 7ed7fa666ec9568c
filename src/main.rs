//! # mlm-build: The Main Entry Point
//!
//! This module handles Command Line Interface (CLI) parsing, logging initialization,
//! and dispatching commands to the orchestrator. Running it with no arguments builds
//! the Multilogin Window Manager executable, which is what a double-click does.
//!
//! Only run one build per project folder at a time.

use std::io;
use std::path::PathBuf;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info, LevelFilter};
use simplelog::{Config, SimpleLogger};

mod console;
mod discovery;
mod error;
mod invariant_ppt;
mod orchestrator;
mod request;
mod system;

use console::PausePolicy;
use error::BuildError;
use orchestrator::Orchestrator;
use request::{BuildConfig, BuildEnvironment};
use system::HostToolchain;

/// The primary Command Line Interface (CLI) configuration.
#[derive(Parser)]
#[command(name = "mlm-build")]
#[command(about = "Packages the Multilogin Window Manager into a single windowed executable", long_about = None)]
struct Cli {
    /// The sub-command to execute. Defaults to `build`.
    #[command(subcommand)]
    command: Option<Commands>,

    /// Turn on verbose logging.
    ///
    /// - `-v`: Debug
    /// - `-vv`: Trace
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Read settings from this JSON file instead of `mlm-build.json`.
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// When to wait for Enter after the final banner.
    ///
    /// Defaults to `auto` on Windows and `always` elsewhere.
    #[arg(long, value_enum, default_value_t = PausePolicy::platform_default(), global = true)]
    pause: PausePolicy,

    /// Shorthand for `--pause never`.
    #[arg(long, global = true)]
    no_pause: bool,
}

#[derive(Subcommand, Clone)]
enum Commands {
    /// Install the packaging tool and build the executable.
    ///
    /// This command will:
    /// 1. Check that Python 3.8+ is on PATH.
    /// 2. Install PyInstaller into `.build-env` (retrying on failure).
    /// 3. Delete the previous executable and run PyInstaller.
    /// 4. Report success only if the executable exists.
    Build {
        /// Print the commands that would run, without running them.
        #[arg(long)]
        dry_run: bool,

        /// Install into the active Python environment instead of `.build-env`.
        #[arg(long)]
        system_env: bool,
    },
    /// Check the build prerequisites without changing anything.
    Doctor {
        /// Emit the report as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Remove PyInstaller intermediates, the executable and the build environment.
    Clean,
}

fn main() {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    let _ = SimpleLogger::init(log_level, Config::default());

    let command = cli
        .command
        .clone()
        .unwrap_or(Commands::Build { dry_run: false, system_env: false });
    let is_build = matches!(command, Commands::Build { dry_run: false, .. });

    let code = match run(&cli, command) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            if let Some(build_err) = e.downcast_ref::<BuildError>() {
                let _ = orchestrator::write_fatal(&mut io::stdout(), build_err);
            }
            1
        }
    };

    let policy = if cli.no_pause { PausePolicy::Never } else { cli.pause };
    if is_build && policy.should_pause() {
        console::wait_for_acknowledgment();
    }
    std::process::exit(code);
}

fn run(cli: &Cli, command: Commands) -> Result<i32> {
    let workdir = std::env::current_dir().context("Cannot determine the working directory")?;
    let config = BuildConfig::load(cli.config.as_deref(), &workdir)?;
    let (request, mut settings) = config.resolve()?;
    let toolchain = HostToolchain::new(workdir.clone());

    match command {
        Commands::Build { dry_run, system_env } => {
            if system_env {
                settings.environment = BuildEnvironment::Active;
            }
            let mut orch = Orchestrator::new(&toolchain, &request, &settings, &workdir);

            if dry_run {
                let probe = orch.probe_toolchain()?;
                let interpreter = probe.interpreter.ok_or(BuildError::ToolchainMissing)?;
                println!("--- DRY RUN: nothing will be installed or built ---");
                for step in orch.plan(&interpreter) {
                    println!("  {step}");
                }
                return Ok(0);
            }

            info!("Packaging {:?} as {}", request.entry_point, request.output_name);
            let result = orch.run()?;
            orch.report(&mut io::stdout(), &result)?;
            Ok(result.exit_code())
        }
        Commands::Doctor { json } => {
            let report = orchestrator::doctor(&toolchain, &request, &settings, &workdir);
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                orchestrator::write_doctor(&mut io::stdout(), &report, &workdir)?;
            }
            Ok(if report.healthy() { 0 } else { 1 })
        }
        Commands::Clean => {
            let summary = orchestrator::clean(&request, &settings, &workdir)
                .context("Failed to clean build outputs")?;
            if summary.removed.is_empty() {
                info!("Nothing to clean");
            }
            for path in &summary.removed {
                println!("  ✕ {}", path.display());
            }
            println!("Removed {} path(s), {} file(s).", summary.removed.len(), summary.files);
            Ok(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn no_arguments_means_build() {
        let cli = Cli::try_parse_from(["mlm-build"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.pause, PausePolicy::platform_default());
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["mlm-build", "build", "--dry-run", "--no-pause", "-vv"]).unwrap();
        assert!(cli.no_pause);
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Some(Commands::Build { dry_run: true, system_env: false })));
    }
}
