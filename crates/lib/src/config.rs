//! Engine configuration.
//!
//! Everything the runtime needs to know is injected here at construction
//! time; there are no environment variables and no process-wide mutables.

use std::path::PathBuf;

/// What to do with per-command temp directories once a build finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandleTemps {
  /// Keep sandboxes on disk for post-mortem inspection.
  Keep,
  /// Remove sandboxes after each build and sweep leftovers at startup.
  #[default]
  Delete,
}

/// How much the engine tells the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Verbosity {
  Quiet,
  #[default]
  Normal,
  /// Full command dumps on failure: program, working dir, exit code, and
  /// captured stderr. Below this only stderr is reported.
  Loud,
}

/// Configuration injected at engine construction.
#[derive(Debug, Clone)]
pub struct EngineConfig {
  /// Directory the store (`_pier/`) lives under; external artifacts with
  /// relative paths resolve against it.
  pub project_root: PathBuf,

  /// Optional read-through cache of frozen `<hash>` trees shared between
  /// machines or checkouts.
  pub shared_cache: Option<PathBuf>,

  /// Whether local builds also populate the shared cache.
  pub shared_cache_writable: bool,

  pub handle_temps: HandleTemps,

  pub verbosity: Verbosity,
}

impl EngineConfig {
  pub fn new(project_root: impl Into<PathBuf>) -> EngineConfig {
    EngineConfig {
      project_root: project_root.into(),
      shared_cache: None,
      shared_cache_writable: false,
      handle_temps: HandleTemps::default(),
      verbosity: Verbosity::default(),
    }
  }

  pub fn with_shared_cache(mut self, dir: impl Into<PathBuf>) -> EngineConfig {
    self.shared_cache = Some(dir.into());
    self
  }

  pub fn keep_temps(mut self) -> EngineConfig {
    self.handle_temps = HandleTemps::Keep;
    self
  }

  pub fn with_verbosity(mut self, verbosity: Verbosity) -> EngineConfig {
    self.verbosity = verbosity;
    self
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_delete_temps_at_normal_verbosity() {
    let config = EngineConfig::new("/tmp/project");
    assert_eq!(config.handle_temps, HandleTemps::Delete);
    assert_eq!(config.verbosity, Verbosity::Normal);
    assert!(config.shared_cache.is_none());
  }

  #[test]
  fn verbosity_orders_quiet_below_loud() {
    assert!(Verbosity::Quiet < Verbosity::Normal);
    assert!(Verbosity::Normal < Verbosity::Loud);
  }
}
