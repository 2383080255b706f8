//! Write protection for published store trees.
//!
//! Once a result directory is published, every later command must be
//! unable to mutate it; freezing clears the write bits across the whole
//! tree. Directories keep traversal, executables keep their execute bit.
//!
//! ## Platform behavior
//!
//! - **Unix**: files become 0444 (0555 if executable), directories 0555.
//! - **Windows**: the read-only attribute is set per entry; directories
//!   are left as-is since the attribute does not restrict them.

use std::path::Path;

use tracing::{debug, warn};
use walkdir::WalkDir;

/// Errors while changing a tree's write protection.
#[derive(Debug, thiserror::Error)]
pub enum ImmutableError {
  #[error("failed to set permissions on {path}: {source}")]
  SetPermissions {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to read metadata for {path}: {source}")]
  Metadata {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to traverse directory {path}: {source}")]
  WalkDir {
    path: String,
    #[source]
    source: walkdir::Error,
  },
}

/// Clear write bits across a tree.
///
/// Processes deepest entries first so directories are locked after their
/// contents. Per-entry failures are logged and skipped; traversal
/// failures abort.
pub fn freeze_tree(path: &Path) -> Result<(), ImmutableError> {
  if !path.exists() {
    return Ok(());
  }

  debug!(path = ?path, "freezing store tree");

  for entry in WalkDir::new(path).contents_first(true) {
    let entry = entry.map_err(|e| ImmutableError::WalkDir {
      path: path.display().to_string(),
      source: e,
    })?;
    if entry.path_is_symlink() {
      continue;
    }
    if let Err(e) = set_writable(entry.path(), false) {
      warn!(path = ?entry.path(), error = %e, "failed to freeze entry, continuing");
    }
  }

  Ok(())
}

/// Restore write bits across a tree.
///
/// Used only by callers performing intentional destructive operations
/// outside the memoizer (discarding a lost publish race, garbage
/// collection). Processes directories before contents so they can be
/// entered.
pub fn unfreeze_tree(path: &Path) -> Result<(), ImmutableError> {
  if !path.exists() {
    return Ok(());
  }

  debug!(path = ?path, "unfreezing store tree");

  for entry in WalkDir::new(path) {
    let entry = entry.map_err(|e| ImmutableError::WalkDir {
      path: path.display().to_string(),
      source: e,
    })?;
    if entry.path_is_symlink() {
      continue;
    }
    if let Err(e) = set_writable(entry.path(), true) {
      warn!(path = ?entry.path(), error = %e, "failed to unfreeze entry, continuing");
    }
  }

  Ok(())
}

#[cfg(unix)]
fn set_writable(path: &Path, writable: bool) -> Result<(), ImmutableError> {
  use std::os::unix::fs::PermissionsExt;

  let metadata = std::fs::metadata(path).map_err(|e| ImmutableError::Metadata {
    path: path.display().to_string(),
    source: e,
  })?;

  let current = metadata.permissions().mode();
  let executable = metadata.is_dir() || (current & 0o111 != 0);
  let mode = match (writable, executable) {
    (false, true) => 0o555,
    (false, false) => 0o444,
    (true, true) => 0o755,
    (true, false) => 0o644,
  };

  let mut perms = metadata.permissions();
  perms.set_mode(mode);
  std::fs::set_permissions(path, perms).map_err(|e| ImmutableError::SetPermissions {
    path: path.display().to_string(),
    source: e,
  })
}

#[cfg(windows)]
fn set_writable(path: &Path, writable: bool) -> Result<(), ImmutableError> {
  let metadata = std::fs::metadata(path).map_err(|e| ImmutableError::Metadata {
    path: path.display().to_string(),
    source: e,
  })?;

  if metadata.is_dir() {
    return Ok(());
  }

  let mut perms = metadata.permissions();
  perms.set_readonly(!writable);
  std::fs::set_permissions(path, perms).map_err(|e| ImmutableError::SetPermissions {
    path: path.display().to_string(),
    source: e,
  })
}

#[cfg(test)]
mod tests {
  use std::fs;

  use tempfile::TempDir;

  use super::*;

  #[test]
  fn freeze_nonexistent_path_succeeds() {
    let temp = TempDir::new().unwrap();
    assert!(freeze_tree(&temp.path().join("missing")).is_ok());
    assert!(unfreeze_tree(&temp.path().join("missing")).is_ok());
  }

  #[test]
  fn freeze_prevents_write() {
    let temp = TempDir::new().unwrap();
    let file = temp.path().join("out.txt");
    fs::write(&file, "built").unwrap();

    freeze_tree(temp.path()).unwrap();

    assert!(fs::metadata(&file).unwrap().permissions().readonly());
    assert!(fs::write(&file, "mutated").is_err());

    unfreeze_tree(temp.path()).unwrap();
  }

  #[test]
  fn unfreeze_restores_write() {
    let temp = TempDir::new().unwrap();
    let file = temp.path().join("out.txt");
    fs::write(&file, "built").unwrap();

    freeze_tree(temp.path()).unwrap();
    unfreeze_tree(temp.path()).unwrap();

    fs::write(&file, "mutated").unwrap();
    assert_eq!(fs::read_to_string(&file).unwrap(), "mutated");
  }

  #[test]
  fn freeze_covers_nested_directories() {
    let temp = TempDir::new().unwrap();
    let sub = temp.path().join("bin");
    fs::create_dir(&sub).unwrap();
    let file = sub.join("tool");
    fs::write(&file, "#!/bin/sh\n").unwrap();

    freeze_tree(temp.path()).unwrap();

    assert!(fs::metadata(&file).unwrap().permissions().readonly());

    unfreeze_tree(temp.path()).unwrap();
  }

  #[test]
  #[cfg(unix)]
  fn freeze_preserves_executable_bit() {
    use std::os::unix::fs::PermissionsExt;

    let temp = TempDir::new().unwrap();
    let file = temp.path().join("run.sh");
    fs::write(&file, "#!/bin/sh\n").unwrap();
    let mut perms = fs::metadata(&file).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&file, perms).unwrap();

    freeze_tree(temp.path()).unwrap();

    let mode = fs::metadata(&file).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o555);

    let dir_mode = fs::metadata(temp.path()).unwrap().permissions().mode();
    assert_eq!(dir_mode & 0o777, 0o555);

    unfreeze_tree(temp.path()).unwrap();
  }
}
