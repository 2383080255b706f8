//! Memoization keys and their hashes.
//!
//! A [`CommandQ`] pairs a command with its declared output paths; its hash
//! is the identity of the resulting `Built` artifacts and the store
//! directory name. The hash covers the structural content of the query
//! plus the content hashes of every relative-path external input, and
//! nothing else: not the absolute store location, not the clock.

use serde::{Deserialize, Serialize};

use crate::command::Command;
use crate::hash::ObjectHash;
use crate::path::RelPath;

/// Domain tag for command hashes.
const COMMAND_TAG: &str = "commandHash";

/// Prefix for write-artifact content hashes.
const WRITE_PREFIX: &str = "writeArtifact: ";

/// The memoization key of `run_command`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandQ {
  pub command: Command,
  pub outputs: Vec<RelPath>,
}

/// The memoization key of `write_artifact`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteArtifactQ {
  pub path: RelPath,
  pub contents: String,
}

/// Hash a command query together with the content hashes of its external
/// inputs.
///
/// `external_hashes` must cover exactly the relative-path `External`
/// inputs of the command, in ascending path order; the engine collects
/// and sorts them before calling this.
pub fn command_hash(
  query: &CommandQ,
  external_hashes: &[(RelPath, ObjectHash)],
) -> Result<ObjectHash, serde_json::Error> {
  ObjectHash::of_value(COMMAND_TAG, &(query, external_hashes))
}

/// The store directory hash of a written literal file.
///
/// Deliberately covers only the contents, not the destination path; the
/// path participates in the memo key, not in the directory name.
pub fn write_artifact_hash(contents: &str) -> ObjectHash {
  let mut bytes = Vec::with_capacity(WRITE_PREFIX.len() + contents.len());
  bytes.extend_from_slice(WRITE_PREFIX.as_bytes());
  bytes.extend_from_slice(contents.as_bytes());
  ObjectHash::of_bytes(&bytes)
}
