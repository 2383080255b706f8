//! Relative path discipline for sandbox and store paths.
//!
//! Every path that names something inside a sandbox or a store entry is a
//! [`RelPath`]: normalized, `/`-separated, relative, and free of `..`
//! components. Normalization collapses `.` segments and duplicate
//! separators but never collapses `..`; a path like `foo/../bar` is
//! rejected outright so that two distinct spellings can never alias the
//! same sandbox entry.
//!
//! The empty path is representable and denotes the sandbox root. It is
//! only legal where a working directory is expected; output paths and
//! artifact subpaths must be non-empty.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Errors raised while validating a sandbox-relative path.
///
/// These surface synchronously at command construction, never at
/// execution time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
  #[error("path must be relative: {0}")]
  Absolute(String),

  #[error("path must not be empty or `.`: {0:?}")]
  Empty(String),

  #[error("path must not contain `..`: {0}")]
  ParentTraversal(String),
}

/// A normalized relative path with `/` separators.
///
/// `Ord` compares the raw string. Callers that sort artifacts rely on this
/// ordering staying byte-lexicographic; changing it changes command hashes.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct RelPath(String);

impl RelPath {
  /// The sandbox root.
  pub const ROOT: RelPath = RelPath(String::new());

  /// Parse a path, allowing the empty result (sandbox root).
  ///
  /// Accepts `""`, `"."` and `"./"` as the root. Rejects absolute paths
  /// and any `..` component.
  pub fn parse(input: &str) -> Result<RelPath, PathError> {
    if Path::new(input).is_absolute() || input.starts_with('/') {
      return Err(PathError::Absolute(input.to_string()));
    }

    let mut parts = Vec::new();
    for part in input.split('/') {
      match part {
        "" | "." => continue,
        ".." => return Err(PathError::ParentTraversal(input.to_string())),
        other => parts.push(other),
      }
    }

    Ok(RelPath(parts.join("/")))
  }

  /// Parse a path that must name an entry, not the root.
  ///
  /// This is the validation applied to declared outputs, shadow
  /// destinations, and artifact subpaths.
  pub fn parse_non_empty(input: &str) -> Result<RelPath, PathError> {
    let path = Self::parse(input)?;
    if path.is_root() {
      return Err(PathError::Empty(input.to_string()));
    }
    Ok(path)
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  pub fn is_root(&self) -> bool {
    self.0.is_empty()
  }

  pub fn components(&self) -> impl Iterator<Item = &str> {
    self.0.split('/').filter(|c| !c.is_empty())
  }

  /// Number of components.
  pub fn depth(&self) -> usize {
    self.components().count()
  }

  /// Append another relative path. Both sides are already normalized, so
  /// this is pure concatenation.
  pub fn join(&self, other: &RelPath) -> RelPath {
    match (self.is_root(), other.is_root()) {
      (true, _) => other.clone(),
      (_, true) => self.clone(),
      _ => RelPath(format!("{}/{}", self.0, other.0)),
    }
  }

  /// The path with its final component removed; root if there is none.
  pub fn parent(&self) -> RelPath {
    match self.0.rsplit_once('/') {
      Some((parent, _)) => RelPath(parent.to_string()),
      None => RelPath::ROOT,
    }
  }

  /// The final component, if any.
  pub fn file_name(&self) -> Option<&str> {
    if self.is_root() {
      return None;
    }
    Some(match self.0.rsplit_once('/') {
      Some((_, name)) => name,
      None => &self.0,
    })
  }

  /// Replace the extension of the final component.
  ///
  /// `ext` is taken without a leading dot. A component without an
  /// extension gains one.
  pub fn replace_extension(&self, ext: &str) -> RelPath {
    let Some(name) = self.file_name() else {
      return self.clone();
    };
    let stem = match name.rsplit_once('.') {
      Some((stem, _)) if !stem.is_empty() => stem,
      _ => name,
    };
    self.parent().join(&RelPath(format!("{stem}.{ext}")))
  }

  /// Whether `self` is a component-wise prefix of `other` (`a` covers
  /// `a/b/c` but not `ab`).
  pub fn is_prefix_of(&self, other: &RelPath) -> bool {
    if self.is_root() {
      return true;
    }
    match other.0.strip_prefix(&self.0) {
      Some(rest) => rest.is_empty() || rest.starts_with('/'),
      None => false,
    }
  }

  /// Resolve against a base directory as a native path.
  pub fn under(&self, base: &Path) -> PathBuf {
    if self.is_root() {
      base.to_path_buf()
    } else {
      base.join(&self.0)
    }
  }
}

impl fmt::Display for RelPath {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.is_root() { write!(f, ".") } else { write!(f, "{}", self.0) }
  }
}

impl TryFrom<&str> for RelPath {
  type Error = PathError;

  fn try_from(value: &str) -> Result<Self, Self::Error> {
    RelPath::parse(value)
  }
}

impl std::str::FromStr for RelPath {
  type Err = PathError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    RelPath::parse(s)
  }
}

impl<'de> Deserialize<'de> for RelPath {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let raw = String::deserialize(deserializer)?;
    RelPath::parse(&raw).map_err(serde::de::Error::custom)
  }
}
