//! Artifacts: values naming files and directories by origin.
//!
//! An [`Artifact`] does not own filesystem state; it names a file or
//! directory either outside the store (`External`, addressed relative to
//! the project root) or inside it (`Built`, addressed relative to the
//! frozen output tree of the command whose key hashed to the given
//! [`ObjectHash`]). Equality and hashing are structural.
//!
//! Two path views exist:
//!
//! - [`Artifact::path_in`]: where the artifact appears inside a sandbox
//!   (`artifact/external/<p>` or `artifact/<hash>/<p>`).
//! - [`Artifact::real_path_in`]: where it really lives, relative to the
//!   project root for externals (`<p>`) and relative to the store root
//!   for built artifacts (`artifact/<hash>/<p>`).
//!
//! External artifacts may carry an absolute path; those are referenced in
//! place and never materialized.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::hash::ObjectHash;
use crate::path::{PathError, RelPath};

/// Sandbox directory under which every input appears.
pub const ARTIFACT_DIR: &str = "artifact";

/// Name of the store symlink that stands in for the project root.
pub const EXTERNAL_DIR: &str = "external";

/// Where an artifact comes from.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Source {
  /// A file under the project root (or an absolute path outside it),
  /// not produced by the engine.
  External,
  /// The frozen output tree of the command with this hash.
  Built(ObjectHash),
}

/// The path component of an artifact.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ArtifactPath {
  /// Relative to the project root (external) or the result directory
  /// (built).
  Rel(RelPath),
  /// Absolute; only legal for external artifacts, referenced in place.
  Abs(PathBuf),
}

/// A value naming a file or directory by origin and subpath.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Artifact {
  source: Source,
  path: ArtifactPath,
}

impl Artifact {
  /// Name a file outside the store.
  ///
  /// Relative inputs are normalized; absolute inputs are kept verbatim
  /// and later referenced in place rather than materialized.
  pub fn external(path: &str) -> Result<Artifact, PathError> {
    let path = if Path::new(path).is_absolute() {
      ArtifactPath::Abs(PathBuf::from(path))
    } else {
      ArtifactPath::Rel(RelPath::parse_non_empty(path)?)
    };
    Ok(Artifact {
      source: Source::External,
      path,
    })
  }

  /// Name an output of the command whose key hashed to `hash`.
  pub fn built(hash: ObjectHash, subpath: RelPath) -> Artifact {
    Artifact {
      source: Source::Built(hash),
      path: ArtifactPath::Rel(subpath),
    }
  }

  pub fn source(&self) -> &Source {
    &self.source
  }

  /// The subpath for relative artifacts; `None` for absolute externals.
  pub fn rel_path(&self) -> Option<&RelPath> {
    match &self.path {
      ArtifactPath::Rel(p) => Some(p),
      ArtifactPath::Abs(_) => None,
    }
  }

  pub fn is_absolute_external(&self) -> bool {
    matches!(self.path, ArtifactPath::Abs(_))
  }

  /// Extend the subpath. Rejects absolute extensions.
  pub fn join(&self, sub: &str) -> Result<Artifact, PathError> {
    if Path::new(sub).is_absolute() {
      return Err(PathError::Absolute(sub.to_string()));
    }
    let sub = RelPath::parse_non_empty(sub)?;
    let path = match &self.path {
      ArtifactPath::Rel(p) => ArtifactPath::Rel(p.join(&sub)),
      ArtifactPath::Abs(p) => ArtifactPath::Abs(p.join(sub.as_str())),
    };
    Ok(Artifact {
      source: self.source.clone(),
      path,
    })
  }

  /// Rewrite the extension of the final path component.
  pub fn replace_extension(&self, ext: &str) -> Artifact {
    let path = match &self.path {
      ArtifactPath::Rel(p) => ArtifactPath::Rel(p.replace_extension(ext)),
      ArtifactPath::Abs(p) => {
        let mut p = p.clone();
        p.set_extension(ext);
        ArtifactPath::Abs(p)
      }
    };
    Artifact {
      source: self.source.clone(),
      path,
    }
  }

  /// The sandbox-relative location of this artifact once materialized.
  ///
  /// Absolute externals return their absolute path unchanged.
  pub fn path_in(&self) -> PathBuf {
    match (&self.source, &self.path) {
      (_, ArtifactPath::Abs(p)) => p.clone(),
      (Source::External, ArtifactPath::Rel(p)) => Path::new(ARTIFACT_DIR).join(EXTERNAL_DIR).join(p.as_str()),
      (Source::Built(hash), ArtifactPath::Rel(p)) => Path::new(ARTIFACT_DIR).join(hash.as_str()).join(p.as_str()),
    }
  }

  /// The real location relative to the project root (externals) or the
  /// store root (built artifacts); absolute externals stay absolute.
  pub fn real_path_in(&self) -> PathBuf {
    match (&self.source, &self.path) {
      (_, ArtifactPath::Abs(p)) => p.clone(),
      (Source::External, ArtifactPath::Rel(p)) => PathBuf::from(p.as_str()),
      (Source::Built(hash), ArtifactPath::Rel(p)) => Path::new(ARTIFACT_DIR).join(hash.as_str()).join(p.as_str()),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn built(hash_of: &[u8], sub: &str) -> Artifact {
    Artifact::built(ObjectHash::of_bytes(hash_of), RelPath::parse_non_empty(sub).unwrap())
  }

  #[test]
  fn external_path_in_lives_under_external_dir() {
    let a = Artifact::external("src/main.c").unwrap();
    assert_eq!(a.path_in(), PathBuf::from("artifact/external/src/main.c"));
    assert_eq!(a.real_path_in(), PathBuf::from("src/main.c"));
  }

  #[test]
  fn built_path_in_lives_under_hash_dir() {
    let hash = ObjectHash::of_bytes(b"cmd");
    let a = built(b"cmd", "out/lib.a");
    assert_eq!(a.path_in(), PathBuf::from(format!("artifact/{hash}/out/lib.a")));
    assert_eq!(a.real_path_in(), PathBuf::from(format!("artifact/{hash}/out/lib.a")));
  }

  #[test]
  fn absolute_external_is_referenced_in_place() {
    let a = Artifact::external("/usr/lib/libc.so").unwrap();
    assert!(a.is_absolute_external());
    assert_eq!(a.path_in(), PathBuf::from("/usr/lib/libc.so"));
    assert_eq!(a.real_path_in(), PathBuf::from("/usr/lib/libc.so"));
  }

  #[test]
  fn join_extends_the_subpath() {
    let a = Artifact::external("vendor").unwrap().join("pkg/lib.rs").unwrap();
    assert_eq!(a.path_in(), PathBuf::from("artifact/external/vendor/pkg/lib.rs"));
  }

  #[test]
  fn join_rejects_absolute_extension() {
    let a = Artifact::external("vendor").unwrap();
    assert!(matches!(a.join("/etc"), Err(PathError::Absolute(_))));
  }

  #[test]
  fn join_commutes_with_path_in() {
    // path_in(external(p) / q) == "artifact/external/" + normalize(p/q)
    let joined = Artifact::external("a/b").unwrap().join("c/./d").unwrap();
    assert_eq!(joined.path_in(), PathBuf::from("artifact/external/a/b/c/d"));
  }

  #[test]
  fn replace_extension_commutes_with_path_in() {
    let a = built(b"cmd", "src/Picture.hs");
    let rewritten = a.replace_extension("o");
    let mut expected = a.path_in();
    expected.set_extension("o");
    assert_eq!(rewritten.path_in(), expected);
  }

  #[test]
  fn artifacts_are_structural_values() {
    let a = Artifact::external("x").unwrap();
    let b = Artifact::external("./x/").unwrap();
    assert_eq!(a, b);

    let c = built(b"one", "x");
    let d = built(b"two", "x");
    assert_ne!(c, d);
  }
}
