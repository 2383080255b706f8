//! Persistent memoization entries.
//!
//! The engine consumes a small key/value interface: rule-scoped entries
//! keyed by a hash, holding serialized results. [`CacheDir`] is the
//! default file-backed implementation, one JSON file per entry under
//! `_pier/cache/<rule>/<key>`, written via a temp file and an atomic
//! rename so a crash can never leave a half-written entry behind.
//!
//! Crash safety of the cache as a whole is a commit-ordering property:
//! the engine writes an entry only after the artifact directory it points
//! at has been published, so an entry always names a complete tree.

use std::io;
use std::path::PathBuf;

use tracing::debug;

use caisson_core::ObjectHash;

/// Rule namespace for memoized command hashes.
pub const COMMAND_RULE: &str = "command";

/// Rule namespace for memoized literal file writes.
pub const WRITE_RULE: &str = "write-artifact";

/// A rule-scoped persistent key/value map.
///
/// Results are cached across process invocations; the engine layers
/// in-memory in-flight tracking on top, so implementations only need
/// plain reads and atomic writes.
pub trait Persist: Send + Sync {
  /// Fetch a previously persisted result.
  fn get(&self, rule: &str, key: &ObjectHash) -> io::Result<Option<Vec<u8>>>;

  /// Persist a result. Must be atomic: concurrent readers see either the
  /// old entry or the new one, never a torn write.
  fn put(&self, rule: &str, key: &ObjectHash, value: &[u8]) -> io::Result<()>;
}

/// File-backed [`Persist`] implementation.
#[derive(Debug, Clone)]
pub struct CacheDir {
  root: PathBuf,
}

impl CacheDir {
  pub fn new(root: impl Into<PathBuf>) -> CacheDir {
    CacheDir { root: root.into() }
  }

  fn entry_path(&self, rule: &str, key: &ObjectHash) -> PathBuf {
    self.root.join(rule).join(key.as_str())
  }
}

impl Persist for CacheDir {
  fn get(&self, rule: &str, key: &ObjectHash) -> io::Result<Option<Vec<u8>>> {
    match std::fs::read(self.entry_path(rule, key)) {
      Ok(bytes) => Ok(Some(bytes)),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
      Err(e) => Err(e),
    }
  }

  fn put(&self, rule: &str, key: &ObjectHash, value: &[u8]) -> io::Result<()> {
    let path = self.entry_path(rule, key);
    let dir = path.parent().expect("cache entries live under a rule directory");
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    io::Write::write_all(&mut tmp, value)?;
    tmp.persist(&path).map_err(|e| e.error)?;

    debug!(rule, key = %key, "cache entry committed");
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn get_of_missing_entry_is_none() {
    let temp = TempDir::new().unwrap();
    let cache = CacheDir::new(temp.path());
    let key = ObjectHash::of_bytes(b"missing");
    assert!(cache.get(COMMAND_RULE, &key).unwrap().is_none());
  }

  #[test]
  fn put_then_get_roundtrips() {
    let temp = TempDir::new().unwrap();
    let cache = CacheDir::new(temp.path());
    let key = ObjectHash::of_bytes(b"key");

    cache.put(COMMAND_RULE, &key, b"value").unwrap();
    assert_eq!(cache.get(COMMAND_RULE, &key).unwrap().unwrap(), b"value");
  }

  #[test]
  fn rules_are_separate_namespaces() {
    let temp = TempDir::new().unwrap();
    let cache = CacheDir::new(temp.path());
    let key = ObjectHash::of_bytes(b"key");

    cache.put(COMMAND_RULE, &key, b"cmd").unwrap();
    assert!(cache.get(WRITE_RULE, &key).unwrap().is_none());
  }

  #[test]
  fn put_overwrites_atomically() {
    let temp = TempDir::new().unwrap();
    let cache = CacheDir::new(temp.path());
    let key = ObjectHash::of_bytes(b"key");

    cache.put(COMMAND_RULE, &key, b"old").unwrap();
    cache.put(COMMAND_RULE, &key, b"new").unwrap();
    assert_eq!(cache.get(COMMAND_RULE, &key).unwrap().unwrap(), b"new");
  }
}
