//! Commands: composable descriptions of sandboxed invocations.
//!
//! A [`Command`] is a value: an ordered sequence of program steps plus an
//! unordered set of input artifacts. Commands form a monoid: composition
//! concatenates the step sequences and unions the input sets, and the
//! empty command is the identity. Because the input set is a `BTreeSet`,
//! the hash of a command is independent of the order inputs were added.
//!
//! Constructors that take sandbox paths validate them synchronously and
//! return `Err` instead of deferring the failure to execution time.

use std::collections::BTreeSet;
use std::ops::Add;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::artifact::Artifact;
use crate::path::{PathError, RelPath};

/// Literal token spliced with the absolute sandbox path in every program
/// argument before invocation.
pub const TMPDIR_TOKEN: &str = "${TMPDIR}";

/// What a program step invokes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Call {
  /// A name resolved through the sanitized `PATH`.
  Env(String),
  /// An executable input artifact.
  Artifact(Artifact),
  /// A file produced by an earlier step within the same sandbox.
  Temp(RelPath),
}

impl std::fmt::Display for Call {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Call::Env(name) => write!(f, "{name}"),
      Call::Artifact(a) => write!(f, "{}", a.path_in().display()),
      Call::Temp(path) => write!(f, "{path}"),
    }
  }
}

/// One step of a command.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Prog {
  /// Run a program with arguments in a working directory inside the
  /// sandbox.
  Call {
    callee: Call,
    args: Vec<String>,
    cwd: RelPath,
  },
  /// A user-visible status line; no filesystem effect.
  Message(String),
  /// Replicate an artifact at `cwd/dest` inside the sandbox by
  /// symlinking.
  Shadow {
    artifact: Artifact,
    dest: RelPath,
    cwd: RelPath,
  },
}

/// A sandboxed invocation described as a value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
  progs: Vec<Prog>,
  inputs: BTreeSet<Artifact>,
}

impl Command {
  /// The identity element of command composition.
  pub fn empty() -> Command {
    Command::default()
  }

  pub fn progs(&self) -> &[Prog] {
    &self.progs
  }

  pub fn inputs(&self) -> &BTreeSet<Artifact> {
    &self.inputs
  }

  /// The texts of every `Message` step, in order.
  pub fn messages(&self) -> Vec<&str> {
    self
      .progs
      .iter()
      .filter_map(|p| match p {
        Prog::Message(text) => Some(text.as_str()),
        _ => None,
      })
      .collect()
  }

  fn from_prog(prog: Prog) -> Command {
    Command {
      progs: vec![prog],
      inputs: BTreeSet::new(),
    }
  }
}

impl Add for Command {
  type Output = Command;

  fn add(mut self, mut rhs: Command) -> Command {
    self.progs.append(&mut rhs.progs);
    self.inputs.append(&mut rhs.inputs);
    self
  }
}

impl std::iter::Sum for Command {
  fn sum<I: Iterator<Item = Command>>(iter: I) -> Command {
    iter.fold(Command::empty(), Add::add)
  }
}

/// Run a program resolved through the sanitized `PATH`.
pub fn prog<S: Into<String>>(name: &str, args: impl IntoIterator<Item = S>) -> Command {
  Command::from_prog(Prog::Call {
    callee: Call::Env(name.to_string()),
    args: args.into_iter().map(Into::into).collect(),
    cwd: RelPath::ROOT,
  })
}

/// Run an executable input artifact. The artifact joins the input set.
pub fn prog_artifact<S: Into<String>>(bin: Artifact, args: impl IntoIterator<Item = S>) -> Command {
  Command {
    progs: vec![Prog::Call {
      callee: Call::Artifact(bin.clone()),
      args: args.into_iter().map(Into::into).collect(),
      cwd: RelPath::ROOT,
    }],
    inputs: BTreeSet::from([bin]),
  }
}

/// Run a file produced by an earlier step within the same sandbox.
pub fn prog_temp<S: Into<String>>(path: &str, args: impl IntoIterator<Item = S>) -> Result<Command, PathError> {
  Ok(Command::from_prog(Prog::Call {
    callee: Call::Temp(RelPath::parse_non_empty(path)?),
    args: args.into_iter().map(Into::into).collect(),
    cwd: RelPath::ROOT,
  }))
}

/// Emit a user-visible status line.
pub fn message(text: &str) -> Command {
  Command::from_prog(Prog::Message(text.to_string()))
}

/// Replicate `artifact` at `dest` inside the sandbox. The artifact joins
/// the input set so its tree is reachable from the sandbox.
pub fn shadow(artifact: Artifact, dest: &str) -> Result<Command, PathError> {
  let dest = RelPath::parse_non_empty(dest)?;
  Ok(Command {
    progs: vec![Prog::Shadow {
      artifact: artifact.clone(),
      dest,
      cwd: RelPath::ROOT,
    }],
    inputs: BTreeSet::from([artifact]),
  })
}

/// Declare a single input artifact.
pub fn input(artifact: Artifact) -> Command {
  Command {
    progs: Vec::new(),
    inputs: BTreeSet::from([artifact]),
  }
}

/// Declare a set of input artifacts.
pub fn inputs(artifacts: impl IntoIterator<Item = Artifact>) -> Command {
  Command {
    progs: Vec::new(),
    inputs: artifacts.into_iter().collect(),
  }
}

/// Create a directory (and parents) inside the sandbox.
pub fn create_directory(path: &str) -> Result<Command, PathError> {
  let path = RelPath::parse_non_empty(path)?;
  Ok(prog("mkdir", ["-p", path.as_str()]))
}

/// Rewrite the working directory of every `Call` and `Shadow` step to
/// `dir`. `Message` steps are unaffected. Rejects absolute paths.
pub fn with_cwd(dir: &str, command: Command) -> Result<Command, PathError> {
  if Path::new(dir).is_absolute() {
    return Err(PathError::Absolute(dir.to_string()));
  }
  let cwd = RelPath::parse(dir)?;
  let progs = command
    .progs
    .into_iter()
    .map(|p| match p {
      Prog::Call { callee, args, .. } => Prog::Call {
        callee,
        args,
        cwd: cwd.clone(),
      },
      Prog::Shadow { artifact, dest, .. } => Prog::Shadow {
        artifact,
        dest,
        cwd: cwd.clone(),
      },
      msg @ Prog::Message(_) => msg,
    })
    .collect();
  Ok(Command {
    progs,
    inputs: command.inputs,
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  fn art(name: &str) -> Artifact {
    Artifact::external(name).unwrap()
  }

  #[test]
  fn empty_is_identity() {
    let cmd = prog("echo", ["hi"]) + input(art("a"));
    assert_eq!(cmd.clone() + Command::empty(), cmd);
    assert_eq!(Command::empty() + cmd.clone(), cmd);
  }

  #[test]
  fn composition_is_associative() {
    let a = prog("a", Vec::<String>::new());
    let b = input(art("b"));
    let c = message("c");
    assert_eq!(
      (a.clone() + b.clone()) + c.clone(),
      a.clone() + (b.clone() + c.clone())
    );
  }

  #[test]
  fn program_order_is_preserved_and_significant() {
    let ab = prog("a", Vec::<String>::new()) + prog("b", Vec::<String>::new());
    let ba = prog("b", Vec::<String>::new()) + prog("a", Vec::<String>::new());
    assert_ne!(ab, ba);
    assert_eq!(ab.progs().len(), 2);
  }

  #[test]
  fn input_set_ignores_order_and_duplicates() {
    let one = input(art("x")) + input(art("y")) + input(art("x"));
    let other = inputs([art("y"), art("x")]);
    assert_eq!(one, other);
    assert_eq!(one.inputs().len(), 2);
  }

  #[test]
  fn prog_artifact_and_shadow_register_inputs() {
    let bin = art("tools/cc");
    assert!(prog_artifact(bin.clone(), ["-c"]).inputs().contains(&bin));

    let shadowed = shadow(art("include"), "inc").unwrap();
    assert!(shadowed.inputs().contains(&art("include")));
  }

  #[test]
  fn with_cwd_rewrites_calls_and_shadows_only() {
    let cmd = prog("make", Vec::<String>::new()) + message("building") + shadow(art("hdr"), "include").unwrap();
    let cmd = with_cwd("build", cmd).unwrap();

    let cwds: Vec<_> = cmd
      .progs()
      .iter()
      .filter_map(|p| match p {
        Prog::Call { cwd, .. } | Prog::Shadow { cwd, .. } => Some(cwd.as_str()),
        Prog::Message(_) => None,
      })
      .collect();
    assert_eq!(cwds, vec!["build", "build"]);
  }

  #[test]
  fn with_cwd_rejects_absolute() {
    assert!(matches!(
      with_cwd("/abs", prog("true", Vec::<String>::new())),
      Err(PathError::Absolute(_))
    ));
  }

  #[test]
  fn messages_are_collected_in_order() {
    let cmd = message("one") + prog("true", Vec::<String>::new()) + message("two");
    assert_eq!(cmd.messages(), vec!["one", "two"]);
  }

  #[test]
  fn create_directory_rejects_invalid_paths() {
    assert!(create_directory("a/b").is_ok());
    assert!(create_directory("..").is_err());
    assert!(create_directory(".").is_err());
  }
}
