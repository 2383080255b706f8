//! Output descriptors: declared result paths plus a typed reconstructor.
//!
//! An [`Output<T>`] pairs the list of paths a command promises to produce
//! with a pure function from the resulting hash to a typed value.
//! Descriptors compose applicatively: [`Output::zip`] concatenates the
//! path lists and pairs the results, [`Output::map`] rewrites the result
//! type, and [`Output::unit`] declares nothing.

use std::sync::Arc;

use crate::artifact::Artifact;
use crate::hash::ObjectHash;
use crate::path::{PathError, RelPath};

/// Declared output file always written by the engine: the concatenated
/// stdout of every program step.
pub const STDOUT_NAME: &str = "_stdout";

/// Declared outputs of a command and how to view them once built.
pub struct Output<T> {
  paths: Vec<RelPath>,
  reconstruct: Arc<dyn Fn(&ObjectHash) -> T + Send + Sync>,
}

impl<T> Clone for Output<T> {
  fn clone(&self) -> Self {
    Output {
      paths: self.paths.clone(),
      reconstruct: Arc::clone(&self.reconstruct),
    }
  }
}

impl<T> std::fmt::Debug for Output<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Output").field("paths", &self.paths).finish_non_exhaustive()
  }
}

impl<T: 'static> Output<T> {
  pub fn paths(&self) -> &[RelPath] {
    &self.paths
  }

  /// Apply the reconstructor to a finished build.
  pub fn reconstruct(&self, hash: &ObjectHash) -> T {
    (self.reconstruct)(hash)
  }

  /// Rewrite the result type without touching the declared paths.
  pub fn map<U: 'static>(self, f: impl Fn(T) -> U + Send + Sync + 'static) -> Output<U> {
    let inner = self.reconstruct;
    Output {
      paths: self.paths,
      reconstruct: Arc::new(move |hash| f(inner(hash))),
    }
  }

  /// Combine two descriptors: paths concatenate, results pair up.
  pub fn zip<U: 'static>(self, other: Output<U>) -> Output<(T, U)> {
    let mut paths = self.paths;
    paths.extend(other.paths.iter().cloned());
    let left = self.reconstruct;
    let right = other.reconstruct;
    Output {
      paths,
      reconstruct: Arc::new(move |hash| (left(hash), right(hash))),
    }
  }
}

impl Output<()> {
  /// Declare no outputs.
  pub fn unit() -> Output<()> {
    Output {
      paths: Vec::new(),
      reconstruct: Arc::new(|_| ()),
    }
  }
}

/// Declare a single output path, reconstructed as the built artifact at
/// that path.
pub fn output(path: &str) -> Result<Output<Artifact>, PathError> {
  let path = RelPath::parse_non_empty(path)?;
  Ok(Output {
    paths: vec![path.clone()],
    reconstruct: Arc::new(move |hash| Artifact::built(hash.clone(), path.clone())),
  })
}

/// Declare the implicit stdout capture file as an output.
pub fn stdout_output() -> Output<Artifact> {
  output(STDOUT_NAME).expect("stdout name is a valid path")
}
