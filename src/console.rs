//! # Console Module
//!
//! Operators usually start the build by double-clicking it in Explorer. The console
//! window then closes as soon as the process exits, taking the final banner with it.
//! This module holds the window open until the operator acknowledges the result.
//!
//! On Windows, `auto` mode asks the console how many processes are attached to it:
//! if we are the only one, nobody else will keep the window alive, so we pause.

use std::io::{self, BufRead, IsTerminal, Write};
use clap::ValueEnum;
use log::debug;

/// When to wait for the operator before exiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PausePolicy {
    /// Always wait (when stdin is interactive).
    Always,
    /// Never wait.
    Never,
    /// Wait only when the console window belongs to this process alone.
    Auto,
}

impl PausePolicy {
    /// `auto` on Windows, so a build started from an open shell exits straight away.
    pub const fn platform_default() -> Self {
        if cfg!(windows) { PausePolicy::Auto } else { PausePolicy::Always }
    }

    pub fn should_pause(self) -> bool {
        if !io::stdin().is_terminal() {
            return false;
        }
        match self {
            PausePolicy::Always => true,
            PausePolicy::Never => false,
            PausePolicy::Auto => owns_console(),
        }
    }
}

/// Returns `true` when no parent shell shares our console.
#[cfg(windows)]
fn owns_console() -> bool {
    use windows::Win32::System::Console::GetConsoleProcessList;

    let mut processes = [0u32; 4];
    // SAFETY: the buffer is valid for its whole length for the duration of the call.
    let attached = unsafe { GetConsoleProcessList(&mut processes) };
    debug!("Processes attached to console: {}", attached);
    attached == 1
}

#[cfg(not(windows))]
fn owns_console() -> bool {
    // Terminal emulators on other platforms keep the window open after exit.
    debug!("Console ownership check skipped on this platform");
    false
}

/// Blocks until the operator presses Enter.
pub fn wait_for_acknowledgment() {
    print!("Press Enter to exit...");
    let _ = io::stdout().flush();
    let mut line = String::new();
    let _ = io::stdin().lock().read_line(&mut line);
}
