//! The shadow engine: recursive symlink replication of artifact trees.
//!
//! A shadow places an artifact at an arbitrary sandbox path, typically to
//! merge several artifacts into one directory tree. Directories are
//! replicated as real directories so multiple shadows can interleave;
//! files become symlinks.
//!
//! File link targets are computed *relative* to the destination's parent:
//! ascend one level per parent component, then descend through
//! `artifact/<external|hash>/<subpath>`. Relative targets keep the
//! sandbox relocatable. Absolute externals are the exception; they link
//! to their absolute path directly.

use std::path::{Path, PathBuf};

use tracing::debug;

use caisson_core::{Artifact, RelPath};

use crate::error::EngineError;
use crate::platform::link;
use crate::store::StoreLayout;

/// Replicate `artifact` at `dest` inside the sandbox rooted at `tmp`.
///
/// Refuses to overwrite an existing destination and errors if the source
/// is missing.
pub fn link_shadow(layout: &StoreLayout, tmp: &Path, artifact: &Artifact, dest: &RelPath) -> Result<(), EngineError> {
  let real = layout.resolve(artifact);
  if !real.exists() {
    return Err(EngineError::MissingSource { path: real });
  }

  let dest_abs = dest.under(tmp);
  if link::lexists(&dest_abs) {
    return Err(EngineError::ShadowExists { path: dest_abs });
  }

  if real.is_dir() {
    debug!(artifact = ?artifact.path_in(), dest = %dest, "shadowing directory");
    std::fs::create_dir_all(&dest_abs)?;
    for entry in std::fs::read_dir(&real)? {
      let entry = entry?;
      let name = entry.file_name();
      let name = name.to_string_lossy();
      let child = artifact.join(&name).map_err(EngineError::Validation)?;
      link_shadow(layout, tmp, &child, &dest.join(&name.parse()?))?;
    }
  } else {
    if let Some(parent) = dest_abs.parent() {
      std::fs::create_dir_all(parent)?;
    }
    let target = relative_target(artifact, dest);
    link::symlink(&target, &dest_abs, &real)?;
  }

  Ok(())
}

/// The symlink target for a file shadow at `dest`: up one level per
/// component of `dest`'s parent, then down through the artifact's
/// sandbox path.
fn relative_target(artifact: &Artifact, dest: &RelPath) -> PathBuf {
  let path_in = artifact.path_in();
  if path_in.is_absolute() {
    return path_in;
  }
  let mut target = PathBuf::new();
  for _ in 0..dest.parent().depth() {
    target.push("..");
  }
  target.join(path_in)
}

#[cfg(test)]
mod tests {
  use super::*;
  use caisson_core::ObjectHash;
  use tempfile::TempDir;

  use crate::sandbox::materialize;

  fn store() -> (TempDir, StoreLayout) {
    let temp = TempDir::new().unwrap();
    let layout = StoreLayout::new(temp.path());
    layout.init().unwrap();
    (temp, layout)
  }

  fn sandbox(temp: &TempDir) -> PathBuf {
    let tmp = temp.path().join("_pier/tmp/sandbox");
    std::fs::create_dir_all(&tmp).unwrap();
    tmp
  }

  fn seed_built(layout: &StoreLayout, tag: &[u8], files: &[(&str, &str)]) -> ObjectHash {
    let hash = ObjectHash::of_bytes(tag);
    for (path, contents) in files {
      let full = layout.artifact_dir(&hash).join(path);
      std::fs::create_dir_all(full.parent().unwrap()).unwrap();
      std::fs::write(full, contents).unwrap();
    }
    hash
  }

  #[test]
  fn file_shadow_uses_relative_target() {
    let (temp, layout) = store();
    let hash = seed_built(&layout, b"src", &[("lib/util.h", "#pragma once")]);
    let tmp = sandbox(&temp);

    let artifact = Artifact::built(hash.clone(), "lib/util.h".parse().unwrap());
    materialize(&layout, &tmp, &[artifact.clone()]).unwrap();
    link_shadow(&layout, &tmp, &artifact, &"include/sub/util.h".parse().unwrap()).unwrap();

    let link_path = tmp.join("include/sub/util.h");
    let target = std::fs::read_link(&link_path).unwrap();
    assert_eq!(target, PathBuf::from(format!("../../artifact/{hash}/lib/util.h")));

    // The relative target resolves through the materialized input link.
    assert_eq!(std::fs::read_to_string(&link_path).unwrap(), "#pragma once");
  }

  #[test]
  fn directory_shadow_recurses_with_real_directories() {
    let (temp, layout) = store();
    let hash = seed_built(&layout, b"tree", &[("pkg/a.txt", "A"), ("pkg/sub/b.txt", "B")]);
    let tmp = sandbox(&temp);

    let artifact = Artifact::built(hash, "pkg".parse().unwrap());
    materialize(&layout, &tmp, &[artifact.clone()]).unwrap();
    link_shadow(&layout, &tmp, &artifact, &"merged".parse().unwrap()).unwrap();

    // Directories are real, files are links.
    assert!(!std::fs::symlink_metadata(tmp.join("merged")).unwrap().is_symlink());
    assert!(!std::fs::symlink_metadata(tmp.join("merged/sub")).unwrap().is_symlink());
    assert!(std::fs::symlink_metadata(tmp.join("merged/a.txt")).unwrap().is_symlink());
    assert_eq!(std::fs::read_to_string(tmp.join("merged/a.txt")).unwrap(), "A");
    assert_eq!(std::fs::read_to_string(tmp.join("merged/sub/b.txt")).unwrap(), "B");
  }

  #[test]
  fn two_shadows_merge_into_one_tree() {
    let (temp, layout) = store();
    let one = seed_built(&layout, b"one", &[("pkg/one.txt", "1")]);
    let two = seed_built(&layout, b"two", &[("pkg/two.txt", "2")]);
    let tmp = sandbox(&temp);

    let first = Artifact::built(one, "pkg".parse().unwrap());
    let second = Artifact::built(two, "pkg".parse().unwrap());
    materialize(&layout, &tmp, &[first.clone(), second.clone()]).unwrap();

    link_shadow(&layout, &tmp, &first, &"merged/a".parse().unwrap()).unwrap();
    link_shadow(&layout, &tmp, &second, &"merged/b".parse().unwrap()).unwrap();

    assert_eq!(std::fs::read_to_string(tmp.join("merged/a/one.txt")).unwrap(), "1");
    assert_eq!(std::fs::read_to_string(tmp.join("merged/b/two.txt")).unwrap(), "2");
  }

  #[test]
  fn refuses_to_overwrite_destination() {
    let (temp, layout) = store();
    let hash = seed_built(&layout, b"clash", &[("f.txt", "x")]);
    let tmp = sandbox(&temp);

    let artifact = Artifact::built(hash, "f.txt".parse().unwrap());
    materialize(&layout, &tmp, &[artifact.clone()]).unwrap();
    std::fs::write(tmp.join("taken"), "occupied").unwrap();

    let err = link_shadow(&layout, &tmp, &artifact, &"taken".parse().unwrap()).unwrap_err();
    assert!(matches!(err, EngineError::ShadowExists { .. }));
  }

  #[test]
  fn missing_source_is_an_error() {
    let (temp, layout) = store();
    let tmp = sandbox(&temp);

    let artifact = Artifact::built(ObjectHash::of_bytes(b"ghost"), "f".parse().unwrap());
    let err = link_shadow(&layout, &tmp, &artifact, &"dest".parse().unwrap()).unwrap_err();
    assert!(matches!(err, EngineError::MissingSource { .. }));
  }

  #[test]
  fn external_file_shadow_resolves_through_external_link() {
    let (temp, layout) = store();
    std::fs::write(temp.path().join("notes.txt"), "external").unwrap();
    let tmp = sandbox(&temp);

    let artifact = Artifact::external("notes.txt").unwrap();
    materialize(&layout, &tmp, &[artifact.clone()]).unwrap();
    link_shadow(&layout, &tmp, &artifact, &"copy.txt".parse().unwrap()).unwrap();

    let target = std::fs::read_link(tmp.join("copy.txt")).unwrap();
    assert_eq!(target, PathBuf::from("artifact/external/notes.txt"));
    assert_eq!(std::fs::read_to_string(tmp.join("copy.txt")).unwrap(), "external");
  }
}
