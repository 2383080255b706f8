//! Error surface of the engine runtime.

use std::path::PathBuf;

use thiserror::Error;

use caisson_core::{PathError, RelPath};

/// Errors raised while building, materializing, or reading artifacts.
///
/// Validation failures surface before anything runs; the remaining
/// variants abort the command they belong to and leave the store
/// untouched. Nothing is retried.
#[derive(Debug, Error)]
pub enum EngineError {
  /// A path failed validation at command construction.
  #[error(transparent)]
  Validation(#[from] PathError),

  /// Two distinct inputs materialize at the same sandbox path.
  #[error("input collision: two inputs materialize at {path}")]
  InputCollision { path: PathBuf },

  /// An input artifact's real path does not exist.
  #[error("missing input source: {path}")]
  MissingSource { path: PathBuf },

  /// A declared output was not produced by the command.
  #[error("command did not produce declared output {path} in {tmp}")]
  MissingOutput { path: RelPath, tmp: PathBuf },

  /// A program step exited non-zero.
  #[error("command `{program}` failed in {cwd} with exit code {code:?}")]
  ProcessFailed {
    program: String,
    cwd: PathBuf,
    code: Option<i32>,
    stderr: String,
  },

  /// A shadow destination already exists.
  #[error("shadow destination already exists: {path}")]
  ShadowExists { path: PathBuf },

  /// A persisted cache entry could not be decoded.
  #[error("corrupt cache entry for rule `{rule}`")]
  CorruptCache {
    rule: &'static str,
    #[source]
    source: serde_json::Error,
  },

  /// A glob pattern failed to parse.
  #[error("invalid glob pattern `{pattern}`")]
  Glob {
    pattern: String,
    #[source]
    source: globset::Error,
  },

  /// Serialization failed while hashing or persisting a value.
  #[error("serialization failed: {0}")]
  Serialize(#[from] serde_json::Error),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}
