//! The memoizing rule runtime.
//!
//! [`Engine`] owns the store, the persistent memo layer, and the
//! dependency tracker. It exposes the two persisted rules, commands and
//! literal file writes, plus the read-side artifact operations.
//!
//! Memoization works in two layers. The persistent layer maps a rule key
//! hash to a serialized result and survives across processes; an entry is
//! committed only after the artifact directory it names has been
//! published, so a crash can never leave the cache pointing at an
//! incomplete tree. The in-memory layer is a table of per-key async
//! locks guaranteeing at most one concurrent build per key; latecomers
//! block, then observe the published result.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use globset::GlobBuilder;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use caisson_core::{
  Artifact, Command, CommandQ, ObjectHash, Output, RelPath, Source, WriteArtifactQ, command_hash, output, shadow,
  stdout_output, write_artifact_hash,
};

use crate::config::{EngineConfig, HandleTemps};
use crate::deps::{DepTracker, Observation};
use crate::error::EngineError;
use crate::exec::run_steps;
use crate::persist::{COMMAND_RULE, CacheDir, Persist, WRITE_RULE};
use crate::platform::link;
use crate::sandbox::{check_all_distinct_paths, dedup_artifacts, ensure_output_parents, materialize};
use crate::store::{Acquired, StoreLayout, create_artifacts, ensure_file_artifact, export_to_shared};

/// Domain tag for write-artifact memo keys.
const WRITE_QUERY_TAG: &str = "writeArtifactQ";

/// The artifact engine.
///
/// Cheap to clone; clones share the store, the memo layers, and the
/// dependency tracker.
#[derive(Clone)]
pub struct Engine {
  inner: Arc<Inner>,
}

struct Inner {
  layout: StoreLayout,
  config: EngineConfig,
  persist: Box<dyn Persist>,
  deps: DepTracker,
  in_flight: StdMutex<HashMap<ObjectHash, Arc<AsyncMutex<()>>>>,
}

impl Engine {
  /// Open (or create) the store under the configured project root, using
  /// the default file-backed memo layer at `_pier/cache/`.
  pub fn new(config: EngineConfig) -> Result<Engine, EngineError> {
    let layout = Self::prepare(&config)?;
    let persist = Box::new(CacheDir::new(layout.cache_root()));
    Self::assemble(config, layout, persist)
  }

  /// Open the store with a caller-supplied memo layer.
  pub fn with_persist(config: EngineConfig, persist: Box<dyn Persist>) -> Result<Engine, EngineError> {
    let layout = Self::prepare(&config)?;
    Self::assemble(config, layout, persist)
  }

  fn prepare(config: &EngineConfig) -> Result<StoreLayout, EngineError> {
    std::fs::create_dir_all(&config.project_root)?;
    let root = std::fs::canonicalize(&config.project_root)?;
    let layout = StoreLayout::new(root);
    layout.init()?;
    Ok(layout)
  }

  fn assemble(config: EngineConfig, layout: StoreLayout, persist: Box<dyn Persist>) -> Result<Engine, EngineError> {
    let engine = Engine {
      inner: Arc::new(Inner {
        layout,
        config,
        persist,
        deps: DepTracker::new(),
        in_flight: StdMutex::new(HashMap::new()),
      }),
    };
    if engine.inner.config.handle_temps == HandleTemps::Delete {
      engine.sweep_temps();
    }
    Ok(engine)
  }

  pub fn layout(&self) -> &StoreLayout {
    &self.inner.layout
  }

  /// Everything observed about external files during this run.
  pub fn dependencies(&self) -> BTreeMap<RelPath, Observation> {
    self.inner.deps.snapshot()
  }

  /// Remove sandboxes leaked by a previous hard abort.
  fn sweep_temps(&self) {
    let tmp_root = self.inner.layout.tmp_root();
    let Ok(entries) = std::fs::read_dir(&tmp_root) else {
      return;
    };
    for entry in entries.flatten() {
      debug!(path = ?entry.path(), "sweeping leftover temp directory");
      if let Err(e) = remove_tree(&entry.path()) {
        warn!(path = ?entry.path(), error = %e, "failed to sweep temp directory");
      }
    }
  }

  // ==========================================================================
  // Command rule
  // ==========================================================================

  /// Run a command, memoized.
  ///
  /// On a hit the declared outputs already sit frozen in the store and
  /// no process is spawned; either way the output descriptor's
  /// reconstructor is applied to the resulting hash.
  pub async fn run_command<T: 'static>(&self, out: &Output<T>, command: Command) -> Result<T, EngineError> {
    let query = CommandQ {
      command,
      outputs: out.paths().to_vec(),
    };
    let externals = self.external_hashes(&query.command)?;
    let hash = command_hash(&query, &externals)?;

    if self.lookup_command(&hash)? {
      return Ok(out.reconstruct(&hash));
    }

    let lock = self.key_lock(&hash);
    let _guard = lock.lock().await;

    if !self.lookup_command(&hash)? {
      self.build_command(&query, &hash).await?;
      self
        .inner
        .persist
        .put(COMMAND_RULE, &hash, &serde_json::to_vec(hash.as_str())?)?;
    }

    Ok(out.reconstruct(&hash))
  }

  /// Run a command declaring a single output path.
  pub async fn run_command_output(&self, path: &str, command: Command) -> Result<Artifact, EngineError> {
    self.run_command(&output(path)?, command).await
  }

  /// Run a command and return its captured stdout.
  pub async fn run_command_stdout(&self, command: Command) -> Result<String, EngineError> {
    let captured = self.run_command(&stdout_output(), command).await?;
    self.read_artifact(&captured).await
  }

  /// Run a command for its declared outputs only.
  pub async fn run_command_unit(&self, command: Command) -> Result<(), EngineError> {
    self.run_command(&Output::unit(), command).await
  }

  fn lookup_command(&self, hash: &ObjectHash) -> Result<bool, EngineError> {
    let Some(bytes) = self.inner.persist.get(COMMAND_RULE, hash)? else {
      return Ok(false);
    };
    let stored: String = serde_json::from_slice(&bytes).map_err(|source| EngineError::CorruptCache {
      rule: COMMAND_RULE,
      source,
    })?;
    if stored != hash.as_str() {
      warn!(key = %hash, "cache entry names a different hash, rebuilding");
      return Ok(false);
    }
    if !self.inner.layout.artifact_dir(hash).exists() {
      warn!(key = %hash, "cache entry without artifact directory, rebuilding");
      return Ok(false);
    }
    debug!(hash = %hash, "command memo hit");
    Ok(true)
  }

  async fn build_command(&self, query: &CommandQ, hash: &ObjectHash) -> Result<(), EngineError> {
    let acquired = create_artifacts(&self.inner.layout, self.inner.config.shared_cache.as_deref(), hash, |dir| {
      self.execute_sandboxed(query, hash, dir)
    })
    .await?;

    if acquired == Acquired::Built
      && self.inner.config.shared_cache_writable
      && let Some(shared) = self.inner.config.shared_cache.as_deref()
      && let Err(e) = export_to_shared(&self.inner.layout, shared, hash)
    {
      warn!(hash = %hash, error = %e, "failed to populate shared cache");
    }
    Ok(())
  }

  /// The sandboxed portion of the pipeline: materialize, run, capture,
  /// extract.
  async fn execute_sandboxed(&self, query: &CommandQ, hash: &ObjectHash, result_dir: PathBuf) -> Result<(), EngineError> {
    let tmp = self.inner.layout.stage_dir(hash.as_str())?;
    let result = self.execute_in(&tmp, query, &result_dir).await;

    match self.inner.config.handle_temps {
      HandleTemps::Delete => {
        if let Err(e) = remove_tree(&tmp) {
          warn!(path = ?tmp, error = %e, "failed to remove sandbox");
        }
      }
      HandleTemps::Keep => info!(path = ?tmp, "keeping sandbox"),
    }
    result
  }

  async fn execute_in(&self, tmp: &Path, query: &CommandQ, result_dir: &Path) -> Result<(), EngineError> {
    let layout = &self.inner.layout;

    let artifacts = dedup_artifacts(query.command.inputs());
    check_all_distinct_paths(&artifacts)?;
    materialize(layout, tmp, &artifacts)?;
    ensure_output_parents(tmp, &query.outputs)?;

    let captured = run_steps(layout, tmp, query.command.progs(), self.inner.config.verbosity).await?;

    let stdout_path = tmp.join(caisson_core::STDOUT_NAME);
    std::fs::write(&stdout_path, &captured)?;

    for declared in &query.outputs {
      let produced = declared.under(tmp);
      if !link::lexists(&produced) {
        return Err(EngineError::MissingOutput {
          path: declared.clone(),
          tmp: tmp.to_path_buf(),
        });
      }
      let target = declared.under(result_dir);
      if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
      }
      std::fs::rename(&produced, &target)?;
    }

    Ok(())
  }

  /// Content hashes of every relative external input, sorted by path,
  /// registered as dependencies of the current action.
  fn external_hashes(&self, command: &Command) -> Result<Vec<(RelPath, ObjectHash)>, EngineError> {
    let mut hashes = Vec::new();
    for artifact in command.inputs() {
      if *artifact.source() == Source::External
        && let Some(rel) = artifact.rel_path()
      {
        let hash = self
          .inner
          .deps
          .record_file(self.inner.layout.project_root(), rel)
          .map_err(|e| match e {
            EngineError::Io(io) if io.kind() == std::io::ErrorKind::NotFound => EngineError::MissingSource {
              path: rel.under(self.inner.layout.project_root()),
            },
            other => other,
          })?;
        hashes.push((rel.clone(), hash));
      }
    }
    Ok(hashes)
  }

  fn key_lock(&self, hash: &ObjectHash) -> Arc<AsyncMutex<()>> {
    let mut table = self.inner.in_flight.lock().expect("in-flight table poisoned");
    Arc::clone(table.entry(hash.clone()).or_default())
  }

  // ==========================================================================
  // Write-artifact rule
  // ==========================================================================

  /// Write a literal file into the store, memoized.
  ///
  /// The store directory is named by a hash of the contents alone; the
  /// destination path participates only in the memo key. Writes of equal
  /// contents to different paths therefore share one directory, each
  /// adding its own file to the tree.
  pub async fn write_artifact(&self, path: &str, contents: &str) -> Result<Artifact, EngineError> {
    let query = WriteArtifactQ {
      path: RelPath::parse_non_empty(path)?,
      contents: contents.to_string(),
    };
    let key = ObjectHash::of_value(WRITE_QUERY_TAG, &query)?;

    if let Some(artifact) = self.lookup_write(&key)? {
      return Ok(artifact);
    }

    // Lock on the directory hash, not the memo key: concurrent writes of
    // the same contents to different paths amend the same tree.
    let hash = write_artifact_hash(&query.contents);
    let lock = self.key_lock(&hash);
    let _guard = lock.lock().await;

    if let Some(artifact) = self.lookup_write(&key)? {
      return Ok(artifact);
    }

    let artifact = Artifact::built(hash.clone(), query.path.clone());
    ensure_file_artifact(
      &self.inner.layout,
      self.inner.config.shared_cache.as_deref(),
      &hash,
      &query.path,
      &query.contents,
    )
    .await?;

    self.inner.persist.put(WRITE_RULE, &key, &serde_json::to_vec(&artifact)?)?;
    Ok(artifact)
  }

  fn lookup_write(&self, key: &ObjectHash) -> Result<Option<Artifact>, EngineError> {
    let Some(bytes) = self.inner.persist.get(WRITE_RULE, key)? else {
      return Ok(None);
    };
    let artifact: Artifact = serde_json::from_slice(&bytes).map_err(|source| EngineError::CorruptCache {
      rule: WRITE_RULE,
      source,
    })?;
    // The hash directory can exist while this entry's file does not
    // (equal contents written under another path), so check the file.
    let stored = matches!(artifact.source(), Source::Built(_)) && self.inner.layout.resolve(&artifact).exists();
    if stored {
      debug!(key = %key, "write memo hit");
      Ok(Some(artifact))
    } else {
      warn!(key = %key, "write entry without stored file, rebuilding");
      Ok(None)
    }
  }

  // ==========================================================================
  // Artifact reads
  // ==========================================================================

  /// Read an artifact's contents as UTF-8.
  ///
  /// External reads register the file as a dependency first; built
  /// artifacts are frozen, so they are read directly.
  pub async fn read_artifact(&self, artifact: &Artifact) -> Result<String, EngineError> {
    self.register_read(artifact)?;
    Ok(tokio::fs::read_to_string(self.inner.layout.resolve(artifact)).await?)
  }

  /// Read an artifact's contents as raw bytes.
  pub async fn read_artifact_bytes(&self, artifact: &Artifact) -> Result<Vec<u8>, EngineError> {
    self.register_read(artifact)?;
    Ok(tokio::fs::read(self.inner.layout.resolve(artifact)).await?)
  }

  fn register_read(&self, artifact: &Artifact) -> Result<(), EngineError> {
    if *artifact.source() == Source::External
      && let Some(rel) = artifact.rel_path()
    {
      self.inner.deps.record_file(self.inner.layout.project_root(), rel)?;
    }
    Ok(())
  }

  /// Whether an artifact's real path exists. External checks go through
  /// the dependency-tracked existence query.
  pub async fn does_artifact_exist(&self, artifact: &Artifact) -> Result<bool, EngineError> {
    if *artifact.source() == Source::External
      && let Some(rel) = artifact.rel_path()
    {
      return Ok(self.inner.deps.record_existence(self.inner.layout.project_root(), rel));
    }
    Ok(self.inner.layout.resolve(artifact).exists())
  }

  /// Subpaths under an artifact directory matching `pattern`, sorted.
  pub async fn match_artifact_glob(&self, artifact: &Artifact, pattern: &str) -> Result<Vec<RelPath>, EngineError> {
    let base = self.inner.layout.resolve(artifact);
    if !base.exists() {
      return Err(EngineError::MissingSource { path: base });
    }

    let matcher = GlobBuilder::new(pattern)
      .literal_separator(true)
      .build()
      .map_err(|source| EngineError::Glob {
        pattern: pattern.to_string(),
        source,
      })?
      .compile_matcher();

    let mut matches = Vec::new();
    for entry in walkdir::WalkDir::new(&base).min_depth(1) {
      let entry = entry.map_err(|e| EngineError::Io(std::io::Error::other(e)))?;
      if !entry.file_type().is_file() {
        continue;
      }
      let rel = entry.path().strip_prefix(&base).expect("walkdir stays under its root");
      if matcher.is_match(rel) {
        matches.push(RelPath::parse(&rel.to_string_lossy())?);
      }
    }
    matches.sort();

    if *artifact.source() == Source::External
      && let Some(rel) = artifact.rel_path()
    {
      self.inner.deps.record_listing(rel, pattern, &matches);
    }
    Ok(matches)
  }

  // ==========================================================================
  // Outside the memoizer
  // ==========================================================================

  /// Execute a built binary with the given inputs in a one-shot sandbox.
  ///
  /// Not memoized: stdout and stderr pass through to the caller, and the
  /// sandbox is discarded per the temp-retention policy.
  pub async fn call_artifact(
    &self,
    inputs: impl IntoIterator<Item = Artifact>,
    bin: Artifact,
    args: Vec<String>,
  ) -> Result<(), EngineError> {
    let mut set: BTreeSet<Artifact> = inputs.into_iter().collect();
    set.insert(bin.clone());

    let tmp = self.inner.layout.stage_dir("call")?;
    let result = self.call_in(&tmp, &set, &bin, &args).await;

    if self.inner.config.handle_temps == HandleTemps::Delete
      && let Err(e) = remove_tree(&tmp)
    {
      warn!(path = ?tmp, error = %e, "failed to remove call sandbox");
    }
    result
  }

  async fn call_in(
    &self,
    tmp: &Path,
    inputs: &BTreeSet<Artifact>,
    bin: &Artifact,
    args: &[String],
  ) -> Result<(), EngineError> {
    let artifacts = dedup_artifacts(inputs);
    check_all_distinct_paths(&artifacts)?;
    materialize(&self.inner.layout, tmp, &artifacts)?;

    let program = tmp.join(bin.path_in());
    debug!(program = %program.display(), "calling artifact");

    let status = tokio::process::Command::new(&program)
      .args(args)
      .current_dir(tmp)
      .env_clear()
      .env("PATH", "/usr/bin:/bin")
      .env("LANG", "en_US.UTF-8")
      .status()
      .await?;

    if !status.success() {
      return Err(EngineError::ProcessFailed {
        program: program.display().to_string(),
        cwd: tmp.to_path_buf(),
        code: status.code(),
        stderr: String::new(),
      });
    }
    Ok(())
  }

  /// Merge files drawn from one artifact directory into a fresh artifact
  /// tree of symlinks.
  ///
  /// Each `(src, dest)` pair replicates `dir/src` at `dest` inside the
  /// produced directory.
  pub async fn group_files(&self, dir: &Artifact, files: &[(&str, &str)]) -> Result<Artifact, EngineError> {
    const GROUP_DIR: &str = "group";

    let mut command = Command::empty();
    for (src, dest) in files {
      let source = dir.join(src)?;
      command = command + shadow(source, &format!("{GROUP_DIR}/{dest}"))?;
    }
    self.run_command_output(GROUP_DIR, command).await
  }
}


/// Remove a temp entry, tolerating read-only contents left behind by a
/// frozen-and-discarded tree.
fn remove_tree(path: &Path) -> std::io::Result<()> {
  let Ok(metadata) = std::fs::symlink_metadata(path) else {
    return Ok(());
  };
  if !metadata.is_dir() {
    return std::fs::remove_file(path);
  }
  if let Err(first) = std::fs::remove_dir_all(path) {
    let _ = crate::platform::immutable::unfreeze_tree(path);
    return std::fs::remove_dir_all(path).map_err(|_| first);
  }
  Ok(())
}
