//! Sandbox materialization: laying out command inputs in a temp
//! directory via symlinks.
//!
//! A sandbox mirrors the store's naming scheme: every input appears under
//! `artifact/<hash>/…`, and `artifact/external` links back to the project
//! root so relative external inputs resolve without per-file links. Built
//! inputs get one link each, pointing at the frozen store tree.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use tracing::debug;

use caisson_core::{ARTIFACT_DIR, Artifact, RelPath, Source};

use crate::error::EngineError;
use crate::platform::link;
use crate::store::StoreLayout;

/// Order inputs and drop artifacts covered by an ancestor.
///
/// The result is in ascending lexicographic order. When two consecutive
/// artifacts share a source and one's subpath covers the other's
/// (`a` covers `a/**`), the descendant is dropped: materializing the
/// parent directory already exposes the child.
///
/// The scan only compares consecutive entries of the raw-string sort, so
/// siblings such as `Picture.hs` can sort between `Picture` and
/// `Picture/Foo` and hide a covered pair. Kept for hash and ordering
/// compatibility; sorting by split components would change behavior for
/// existing callers.
pub fn dedup_artifacts(inputs: &BTreeSet<Artifact>) -> Vec<Artifact> {
  let mut kept: Vec<Artifact> = Vec::with_capacity(inputs.len());
  for artifact in inputs {
    if let Some(prev) = kept.last()
      && prev.source() == artifact.source()
      && let (Some(parent), Some(child)) = (prev.rel_path(), artifact.rel_path())
      && parent.is_prefix_of(child)
    {
      debug!(parent = %parent, child = %child, "dropping input covered by ancestor");
      continue;
    }
    kept.push(artifact.clone());
  }
  kept
}

/// Reject the command before materialization if two inputs would land on
/// the same sandbox path.
pub fn check_all_distinct_paths(artifacts: &[Artifact]) -> Result<(), EngineError> {
  let mut seen: HashSet<PathBuf> = HashSet::with_capacity(artifacts.len());
  for artifact in artifacts {
    let path = artifact.path_in();
    if !seen.insert(path.clone()) {
      return Err(EngineError::InputCollision { path });
    }
  }
  Ok(())
}

/// Lay out inputs inside the sandbox.
///
/// Creates the `artifact/external` link back to the project root, then
/// one symlink per built input pointing at its frozen store tree.
/// Relative externals need no link of their own; absolute externals are
/// referenced in place and skipped entirely.
pub fn materialize(layout: &StoreLayout, tmp: &Path, artifacts: &[Artifact]) -> Result<(), EngineError> {
  let artifact_dir = tmp.join(ARTIFACT_DIR);
  std::fs::create_dir_all(&artifact_dir)?;

  let external = artifact_dir.join(caisson_core::EXTERNAL_DIR);
  if !link::lexists(&external) {
    link::symlink(layout.project_root(), &external, layout.project_root())?;
  }

  for artifact in artifacts {
    if artifact.is_absolute_external() {
      continue;
    }

    let real = layout.resolve(artifact);
    if !real.exists() {
      return Err(EngineError::MissingSource { path: real });
    }

    if matches!(artifact.source(), Source::Built(_)) {
      let dest = tmp.join(artifact.path_in());
      if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
      }
      if !link::lexists(&dest) {
        link::symlink(&real, &dest, &real)?;
      }
    }
  }

  Ok(())
}

/// Create the parent directory of every declared output inside the
/// sandbox, so programs can write outputs without their own `mkdir`s.
pub fn ensure_output_parents(tmp: &Path, outputs: &[RelPath]) -> Result<(), EngineError> {
  for output in outputs {
    std::fs::create_dir_all(output.parent().under(tmp))?;
  }
  Ok(())
}
