//! caisson-lib: the content-addressed artifact engine.
//!
//! Commands are values describing sandboxed invocations; their outputs
//! live at `_pier/artifact/<hash>/…`, where the hash covers the command,
//! its declared outputs, and the content of every external input. The
//! engine memoizes command results through a persistent key/value layer,
//! so an unchanged command never re-executes, and freezes published
//! trees so later commands cannot mutate earlier outputs.
//!
//! The value types live in `caisson-core`; this crate supplies the
//! runtime:
//! - `engine`: the memoizing rule runtime and artifact read operations
//! - `exec`: process execution with a scrubbed environment
//! - `sandbox`: input layout via symlinks, dedup, collision checks
//! - `shadow`: recursive symlink replication of artifact trees
//! - `store`: store layout, atomic publish, shared-cache read-through
//! - `persist`: the persistent memo interface and its file-backed default

pub mod config;
pub mod deps;
pub mod engine;
pub mod error;
pub mod exec;
pub mod persist;
pub mod platform;
pub mod sandbox;
pub mod shadow;
pub mod store;
mod util;

pub use config::{EngineConfig, HandleTemps, Verbosity};
pub use engine::Engine;
pub use error::EngineError;
pub use persist::{CacheDir, Persist};
pub use store::{StoreLayout, unfreeze_artifacts};
