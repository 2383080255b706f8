//! External-file dependency tracking.
//!
//! Every read of an external artifact (content, existence, or a glob
//! listing) registers what was observed before the filesystem is
//! touched. Command hashes fold these observations in, so a changed
//! external file changes the hash and invalidates the memoized result on
//! the next run.
//!
//! Content hashes are memoized per engine instance; within one run a file
//! is hashed once and every command referencing it sees the same
//! observation.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use caisson_core::{ObjectHash, RelPath};

use crate::error::EngineError;

/// What was observed about an external path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
  /// Content hash of a regular file.
  Content(ObjectHash),
  /// Existence of a path.
  Exists(bool),
  /// Hash of a sorted glob listing under a directory.
  Listing { pattern: String, digest: ObjectHash },
}

/// Registry of external observations made during this run.
#[derive(Debug, Default)]
pub struct DepTracker {
  observed: Mutex<BTreeMap<RelPath, Observation>>,
}

impl DepTracker {
  pub fn new() -> DepTracker {
    DepTracker::default()
  }

  /// Register an external file and return its content hash.
  pub fn record_file(&self, project_root: &Path, path: &RelPath) -> Result<ObjectHash, EngineError> {
    {
      let observed = self.observed.lock().expect("dep tracker poisoned");
      if let Some(Observation::Content(hash)) = observed.get(path) {
        return Ok(hash.clone());
      }
    }

    let bytes = std::fs::read(path.under(project_root))?;
    let hash = ObjectHash::of_bytes(&bytes);
    self
      .observed
      .lock()
      .expect("dep tracker poisoned")
      .insert(path.clone(), Observation::Content(hash.clone()));
    Ok(hash)
  }

  /// Register an existence check.
  pub fn record_existence(&self, project_root: &Path, path: &RelPath) -> bool {
    let exists = path.under(project_root).exists();
    self
      .observed
      .lock()
      .expect("dep tracker poisoned")
      .insert(path.clone(), Observation::Exists(exists));
    exists
  }

  /// Register a glob listing under an external directory.
  pub fn record_listing(&self, path: &RelPath, pattern: &str, matches: &[RelPath]) {
    let joined: Vec<&str> = matches.iter().map(|m| m.as_str()).collect();
    let digest = ObjectHash::of_bytes(joined.join("\n").as_bytes());
    self.observed.lock().expect("dep tracker poisoned").insert(
      path.clone(),
      Observation::Listing {
        pattern: pattern.to_string(),
        digest,
      },
    );
  }

  /// Snapshot of everything observed so far.
  pub fn snapshot(&self) -> BTreeMap<RelPath, Observation> {
    self.observed.lock().expect("dep tracker poisoned").clone()
  }
}
