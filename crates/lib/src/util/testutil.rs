//! Test helpers for exercising the engine with real processes.

use caisson_core::{Command, prog};

/// A command that runs a shell script inside the sandbox.
#[cfg(unix)]
pub fn shell(script: &str) -> Command {
  prog("sh", ["-c", script])
}

#[cfg(windows)]
pub fn shell(script: &str) -> Command {
  prog("cmd.exe", ["/C", script])
}
