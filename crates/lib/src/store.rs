//! The content-addressed store: layout, acquisition, and atomic publish.
//!
//! Everything the engine produces lives under `_pier/` in the project
//! root:
//!
//! ```text
//! _pier/artifact/<hash>/…   frozen output tree of one command
//! _pier/artifact/external   symlink to ../.. (the project root)
//! _pier/tmp/…               per-build sandboxes and staging dirs
//! _pier/cache/…             persistent memoization entries
//! ```
//!
//! The store is append-only: a result directory appears only through an
//! atomic rename of a complete, frozen tree, so readers of a published
//! hash never need locks. Concurrent builders racing on one hash end with
//! exactly one published directory; losers discard their work.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use caisson_core::{ARTIFACT_DIR, Artifact, EXTERNAL_DIR, ObjectHash, RelPath, Source};

use crate::error::EngineError;
use crate::platform::immutable::{freeze_tree, unfreeze_tree};
use crate::platform::link;

/// Name of the store directory under the project root.
pub const STORE_DIR: &str = "_pier";

const TMP_DIR: &str = "tmp";
const CACHE_DIR: &str = "cache";

/// How a result directory was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
  /// Already present locally.
  Cached,
  /// Copied in from the shared cache.
  Shared,
  /// Built by the supplied closure.
  Built,
}

/// Resolved store paths for one project root.
#[derive(Debug, Clone)]
pub struct StoreLayout {
  project_root: PathBuf,
}

impl StoreLayout {
  pub fn new(project_root: impl Into<PathBuf>) -> StoreLayout {
    StoreLayout {
      project_root: project_root.into(),
    }
  }

  pub fn project_root(&self) -> &Path {
    &self.project_root
  }

  pub fn store_dir(&self) -> PathBuf {
    self.project_root.join(STORE_DIR)
  }

  pub fn artifact_root(&self) -> PathBuf {
    self.store_dir().join(ARTIFACT_DIR)
  }

  pub fn artifact_dir(&self, hash: &ObjectHash) -> PathBuf {
    self.artifact_root().join(hash.as_str())
  }

  pub fn external_link(&self) -> PathBuf {
    self.artifact_root().join(EXTERNAL_DIR)
  }

  pub fn tmp_root(&self) -> PathBuf {
    self.store_dir().join(TMP_DIR)
  }

  pub fn cache_root(&self) -> PathBuf {
    self.store_dir().join(CACHE_DIR)
  }

  /// The absolute real location of an artifact.
  pub fn resolve(&self, artifact: &Artifact) -> PathBuf {
    match artifact.source() {
      Source::External => match artifact.rel_path() {
        Some(rel) => rel.under(&self.project_root),
        None => artifact.real_path_in(),
      },
      Source::Built(_) => self.store_dir().join(artifact.real_path_in()),
    }
  }

  /// Create the store skeleton and the `artifact/external` symlink.
  ///
  /// Idempotent; called at engine construction.
  pub fn init(&self) -> Result<(), EngineError> {
    std::fs::create_dir_all(self.artifact_root())?;
    std::fs::create_dir_all(self.tmp_root())?;
    std::fs::create_dir_all(self.cache_root())?;

    let external = self.external_link();
    if !link::lexists(&external) {
      // Relative target: the store stays valid if the project moves.
      link::symlink(Path::new("../.."), &external, &self.project_root)?;
    }
    Ok(())
  }

  /// Stage a fresh uniquely-named directory under `_pier/tmp/`.
  pub fn stage_dir(&self, label: &str) -> Result<PathBuf, EngineError> {
    let dir = tempfile::Builder::new()
      .prefix(&format!("{label}-"))
      .tempdir_in(self.tmp_root())?;
    Ok(dir.keep())
  }
}

/// Acquire the result directory for `hash`.
///
/// Order of preference: an already-published local tree, a shared-cache
/// copy, a fresh build. `build` runs against a staging directory and only
/// when nothing cached is usable. Whatever the path, a published
/// directory is complete and frozen.
pub async fn create_artifacts<F, Fut>(
  layout: &StoreLayout,
  shared_cache: Option<&Path>,
  hash: &ObjectHash,
  build: F,
) -> Result<Acquired, EngineError>
where
  F: FnOnce(PathBuf) -> Fut,
  Fut: Future<Output = Result<(), EngineError>>,
{
  let final_dir = layout.artifact_dir(hash);
  if final_dir.exists() {
    debug!(hash = %hash, "artifact already in store");
    return Ok(Acquired::Cached);
  }

  if let Some(cache) = shared_cache {
    let cached = cache.join(hash.as_str());
    if cached.exists() {
      debug!(hash = %hash, cache = ?cache, "fetching artifact from shared cache");
      let staging = layout.stage_dir(&format!("{hash}-shared"))?;
      copy_tree(&cached, &staging)?;
      publish(&staging, &final_dir)?;
      return Ok(Acquired::Shared);
    }
  }

  let staging = layout.stage_dir(&format!("{hash}-result"))?;
  match build(staging.clone()).await {
    Ok(()) => {}
    Err(e) => {
      discard_staging(&staging);
      return Err(e);
    }
  }
  publish(&staging, &final_dir)?;
  debug!(hash = %hash, "artifact published");
  Ok(Acquired::Built)
}

/// Ensure the result directory for `hash` contains `path` with
/// `contents`, building the directory if it is absent.
///
/// Literal writes name their directory by contents alone, so distinct
/// destination paths with equal contents share one directory. A bare
/// directory-exists check is not enough for them: the directory may have
/// been published for another path. When the directory exists but lacks
/// this path, the tree is thawed, the file added, and the tree frozen
/// again.
pub async fn ensure_file_artifact(
  layout: &StoreLayout,
  shared_cache: Option<&Path>,
  hash: &ObjectHash,
  path: &RelPath,
  contents: &str,
) -> Result<(), EngineError> {
  let final_dir = layout.artifact_dir(hash);
  let target = path.under(&final_dir);
  if target.exists() {
    debug!(hash = %hash, path = %path, "file already in store");
    return Ok(());
  }

  if !final_dir.exists() {
    let staged_path = path.clone();
    let staged_contents = contents.to_string();
    create_artifacts(layout, shared_cache, hash, |dir| async move {
      let file = staged_path.under(&dir);
      if let Some(parent) = file.parent() {
        std::fs::create_dir_all(parent)?;
      }
      std::fs::write(file, staged_contents.as_bytes())?;
      Ok(())
    })
    .await?;
  }

  // The directory can predate this path: same contents written
  // elsewhere, a shared-cache import, or a lost publish race.
  if !target.exists() {
    debug!(hash = %hash, path = %path, "adding path to published write directory");
    unfreeze_tree(&final_dir).map_err(|e| EngineError::Io(std::io::Error::other(e)))?;
    if let Some(parent) = target.parent() {
      std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&target, contents.as_bytes())?;
    freeze_tree(&final_dir).map_err(|e| EngineError::Io(std::io::Error::other(e)))?;
  }

  Ok(())
}

/// Restore write permissions on a published result directory.
///
/// Only for callers performing intentional destructive operations outside
/// the memoizer; the engine itself never mutates a published tree.
pub fn unfreeze_artifacts(layout: &StoreLayout, hash: &ObjectHash) -> Result<(), EngineError> {
  unfreeze_tree(&layout.artifact_dir(hash)).map_err(|e| EngineError::Io(std::io::Error::other(e)))
}

/// Freeze a staged tree and move it into place in one atomic step.
///
/// Losing a publish race is not an error: the winner's tree is
/// structurally identical, so the loser's staging copy is discarded.
fn publish(staging: &Path, final_dir: &Path) -> Result<(), EngineError> {
  if let Err(e) = freeze_tree(staging) {
    warn!(path = ?staging, error = %e, "freeze incomplete before publish");
  }

  match std::fs::rename(staging, final_dir) {
    Ok(()) => Ok(()),
    Err(_) if final_dir.exists() => {
      debug!(path = ?final_dir, "lost publish race, discarding staging tree");
      discard_staging(staging);
      Ok(())
    }
    Err(e) => Err(EngineError::Io(e)),
  }
}

fn discard_staging(staging: &Path) {
  if let Err(e) = unfreeze_tree(staging) {
    warn!(path = ?staging, error = %e, "failed to unfreeze staging tree");
  }
  if let Err(e) = std::fs::remove_dir_all(staging) {
    warn!(path = ?staging, error = %e, "failed to remove staging tree");
  }
}

/// Copy a published result into the shared cache.
///
/// Staged inside the cache directory and renamed into place, so other
/// readers never observe a partial tree. Losing a race against another
/// publisher is fine; the trees are structurally identical.
pub fn export_to_shared(layout: &StoreLayout, shared: &Path, hash: &ObjectHash) -> Result<(), EngineError> {
  let target = shared.join(hash.as_str());
  if target.exists() {
    return Ok(());
  }

  std::fs::create_dir_all(shared)?;
  let staging = tempfile::Builder::new()
    .prefix(&format!(".{}-export-", hash.as_str()))
    .tempdir_in(shared)?
    .keep();
  copy_tree(&layout.artifact_dir(hash), &staging)?;

  match std::fs::rename(&staging, &target) {
    Ok(()) => {
      debug!(hash = %hash, cache = ?shared, "exported artifact to shared cache");
      Ok(())
    }
    Err(_) if target.exists() => {
      discard_staging(&staging);
      Ok(())
    }
    Err(e) => {
      discard_staging(&staging);
      Err(EngineError::Io(e))
    }
  }
}

/// Recursively copy a tree, preserving symlinks as symlinks.
fn copy_tree(src: &Path, dst: &Path) -> Result<(), EngineError> {
  for entry in std::fs::read_dir(src)? {
    let entry = entry?;
    let target = dst.join(entry.file_name());
    let file_type = entry.file_type()?;
    if file_type.is_symlink() {
      let link_target = std::fs::read_link(entry.path())?;
      link::symlink(&link_target, &target, &entry.path())?;
    } else if file_type.is_dir() {
      std::fs::create_dir(&target)?;
      copy_tree(&entry.path(), &target)?;
    } else {
      std::fs::copy(entry.path(), &target)?;
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  fn layout() -> (TempDir, StoreLayout) {
    let temp = TempDir::new().unwrap();
    let layout = StoreLayout::new(temp.path());
    layout.init().unwrap();
    (temp, layout)
  }

  fn hash(tag: &[u8]) -> ObjectHash {
    ObjectHash::of_bytes(tag)
  }

  #[test]
  fn init_is_idempotent_and_links_external() {
    let (_temp, layout) = layout();
    layout.init().unwrap();

    let external = layout.external_link();
    assert!(link::lexists(&external));
    // The link resolves back to the project root.
    assert_eq!(
      std::fs::canonicalize(&external).unwrap(),
      std::fs::canonicalize(layout.project_root()).unwrap()
    );
  }

  #[test]
  fn resolve_external_and_built() {
    let (_temp, layout) = layout();
    let h = hash(b"x");

    let external = Artifact::external("src/lib.c").unwrap();
    assert_eq!(layout.resolve(&external), layout.project_root().join("src/lib.c"));

    let built = Artifact::built(h.clone(), "out".parse().unwrap());
    assert_eq!(layout.resolve(&built), layout.artifact_dir(&h).join("out"));

    let absolute = Artifact::external("/bin/sh").unwrap();
    assert_eq!(layout.resolve(&absolute), PathBuf::from("/bin/sh"));
  }

  #[tokio::test]
  async fn build_publishes_frozen_tree() {
    let (_temp, layout) = layout();
    let h = hash(b"one");

    let acquired = create_artifacts(&layout, None, &h, |dir| async move {
      std::fs::write(dir.join("out.txt"), "built")?;
      Ok(())
    })
    .await
    .unwrap();
    assert_eq!(acquired, Acquired::Built);

    let out = layout.artifact_dir(&h).join("out.txt");
    assert_eq!(std::fs::read_to_string(&out).unwrap(), "built");
    assert!(std::fs::metadata(&out).unwrap().permissions().readonly());
  }

  #[tokio::test]
  async fn existing_tree_short_circuits_build() {
    let (_temp, layout) = layout();
    let h = hash(b"two");

    create_artifacts(&layout, None, &h, |dir| async move {
      std::fs::write(dir.join("out.txt"), "first")?;
      Ok(())
    })
    .await
    .unwrap();

    let acquired = create_artifacts(&layout, None, &h, |_| async move {
      panic!("build must not run on cache hit")
    })
    .await
    .unwrap();
    assert_eq!(acquired, Acquired::Cached);
  }

  #[tokio::test]
  async fn failed_build_leaves_store_unchanged() {
    let (_temp, layout) = layout();
    let h = hash(b"three");

    let result = create_artifacts(&layout, None, &h, |dir| async move {
      std::fs::write(dir.join("partial"), "half")?;
      Err(EngineError::MissingOutput {
        path: "out".parse::<caisson_core::RelPath>().unwrap(),
        tmp: dir,
      })
    })
    .await;

    assert!(result.is_err());
    assert!(!layout.artifact_dir(&h).exists());
  }

  #[tokio::test]
  async fn shared_cache_is_read_through() {
    let (_temp, layout) = layout();
    let shared = TempDir::new().unwrap();
    let h = hash(b"four");

    let tree = shared.path().join(h.as_str()).join("sub");
    std::fs::create_dir_all(&tree).unwrap();
    std::fs::write(tree.join("file"), "from-cache").unwrap();

    let acquired = create_artifacts(&layout, Some(shared.path()), &h, |_| async move {
      panic!("build must not run when the shared cache has the tree")
    })
    .await
    .unwrap();
    assert_eq!(acquired, Acquired::Shared);

    let copied = layout.artifact_dir(&h).join("sub/file");
    assert_eq!(std::fs::read_to_string(&copied).unwrap(), "from-cache");
    assert!(std::fs::metadata(&copied).unwrap().permissions().readonly());
  }

  #[tokio::test]
  async fn ensure_file_adds_paths_to_an_existing_directory() {
    let (_temp, layout) = layout();
    let h = hash(b"text");
    let first: RelPath = "a.txt".parse().unwrap();
    let second: RelPath = "sub/b.txt".parse().unwrap();

    ensure_file_artifact(&layout, None, &h, &first, "same").await.unwrap();
    // Same directory, different declared path: the tree gains the file.
    ensure_file_artifact(&layout, None, &h, &second, "same").await.unwrap();
    // Idempotent once the path is present.
    ensure_file_artifact(&layout, None, &h, &second, "same").await.unwrap();

    let dir = layout.artifact_dir(&h);
    assert_eq!(std::fs::read_to_string(dir.join("a.txt")).unwrap(), "same");
    assert_eq!(std::fs::read_to_string(dir.join("sub/b.txt")).unwrap(), "same");
    for file in ["a.txt", "sub/b.txt"] {
      assert!(std::fs::metadata(dir.join(file)).unwrap().permissions().readonly());
    }
  }

  #[tokio::test]
  async fn unfreeze_restores_write_access() {
    let (_temp, layout) = layout();
    let h = hash(b"five");

    create_artifacts(&layout, None, &h, |dir| async move {
      std::fs::write(dir.join("out.txt"), "frozen")?;
      Ok(())
    })
    .await
    .unwrap();

    unfreeze_artifacts(&layout, &h).unwrap();
    std::fs::write(layout.artifact_dir(&h).join("out.txt"), "thawed").unwrap();
  }
}
