//! caisson-core: value types and hashing for the caisson artifact engine.
//!
//! This crate holds everything the engine treats as a value:
//! - `Artifact`: a file or directory named by origin and relative subpath
//! - `Command`: a composable description of a sandboxed invocation
//! - `Output`: declared result paths plus a typed reconstructor
//! - `CommandQ` / `WriteArtifactQ`: memoization keys and their hashes
//!
//! Nothing here touches the filesystem. The `caisson-lib` crate supplies
//! the runtime: sandboxes, execution, the store, and memoization.

pub mod artifact;
pub mod command;
pub mod hash;
pub mod output;
pub mod path;
pub mod query;

pub use artifact::{ARTIFACT_DIR, Artifact, ArtifactPath, EXTERNAL_DIR, Source};
pub use command::{
  Call, Command, Prog, TMPDIR_TOKEN, create_directory, input, inputs, message, prog, prog_artifact, prog_temp, shadow,
  with_cwd,
};
pub use hash::{HASH_LEN, ObjectHash};
pub use output::{Output, STDOUT_NAME, output, stdout_output};
pub use path::{PathError, RelPath};
pub use query::{CommandQ, WriteArtifactQ, command_hash, write_artifact_hash};
