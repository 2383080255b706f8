//! Link creation for sandbox materialization and the shadow engine.
//!
//! On Unix a single `symlink` covers files and directories. Windows
//! distinguishes the two, and symlink creation may require privileges, so
//! the fallback there is a hard link for files and a recursive copy for
//! directories; either way the observable sandbox contents match.

use std::io;
use std::path::Path;

/// Create a link at `dst` whose target is the (possibly relative) path
/// `target`. `kind_hint` is the resolved source the link will point at,
/// used where the platform needs to know file vs directory.
#[cfg(unix)]
pub fn symlink(target: &Path, dst: &Path, _kind_hint: &Path) -> io::Result<()> {
  std::os::unix::fs::symlink(target, dst)
}

#[cfg(windows)]
pub fn symlink(target: &Path, dst: &Path, kind_hint: &Path) -> io::Result<()> {
  if kind_hint.is_dir() {
    match std::os::windows::fs::symlink_dir(target, dst) {
      Ok(()) => Ok(()),
      // Developer mode off: fall back to a recursive copy.
      Err(_) => copy_dir_recursive(kind_hint, dst),
    }
  } else {
    match std::os::windows::fs::symlink_file(target, dst) {
      Ok(()) => Ok(()),
      Err(_) => std::fs::hard_link(kind_hint, dst),
    }
  }
}

#[cfg(windows)]
fn copy_dir_recursive(src: &Path, dst: &Path) -> io::Result<()> {
  std::fs::create_dir_all(dst)?;
  for entry in std::fs::read_dir(src)? {
    let entry = entry?;
    let target = dst.join(entry.file_name());
    if entry.file_type()?.is_dir() {
      copy_dir_recursive(&entry.path(), &target)?;
    } else {
      std::fs::copy(entry.path(), &target)?;
    }
  }
  Ok(())
}

/// Whether anything (including a dangling link) exists at `path`.
pub fn lexists(path: &Path) -> bool {
  std::fs::symlink_metadata(path).is_ok()
}
