//! Program step execution inside a sandbox.
//!
//! Steps run sequentially in declared order. Each `Call` spawns an OS
//! process with a scrubbed environment (`PATH=/usr/bin:/bin` and
//! `LANG=en_US.UTF-8`, nothing else), with stdout captured to memory and
//! stderr captured separately. The concatenated stdout of all steps is
//! the command's capture buffer, later written to `_stdout`.

use std::path::{Path, PathBuf};

use tokio::process::Command as OsCommand;
use tracing::{debug, info, warn};

use caisson_core::{Call, Prog, RelPath, TMPDIR_TOKEN};

use crate::config::Verbosity;
use crate::error::EngineError;
use crate::shadow::link_shadow;
use crate::store::StoreLayout;

/// Environment handed to every spawned program.
const SANDBOX_PATH: &str = "/usr/bin:/bin";
const SANDBOX_LANG: &str = "en_US.UTF-8";

/// Run every step of a command inside the sandbox at `tmp`, returning the
/// concatenated stdout bytes.
pub async fn run_steps(
  layout: &StoreLayout,
  tmp: &Path,
  progs: &[Prog],
  verbosity: Verbosity,
) -> Result<Vec<u8>, EngineError> {
  let mut captured = Vec::new();

  for prog in progs {
    match prog {
      Prog::Message(text) => {
        // Progress feedback at its place in the sequence; cache hits run
        // no steps, so they stay silent.
        if verbosity >= Verbosity::Normal {
          info!("{text}");
        }
      }
      Prog::Shadow { artifact, dest, cwd } => {
        link_shadow(layout, tmp, artifact, &cwd.join(dest))?;
      }
      Prog::Call { callee, args, cwd } => {
        let stdout = run_call(tmp, callee, args, cwd, verbosity).await?;
        captured.extend_from_slice(&stdout);
      }
    }
  }

  Ok(captured)
}

async fn run_call(
  tmp: &Path,
  callee: &Call,
  args: &[String],
  cwd: &RelPath,
  verbosity: Verbosity,
) -> Result<Vec<u8>, EngineError> {
  let program = resolve_callee(tmp, callee);
  let tmp_str = tmp.to_string_lossy();
  let spliced: Vec<String> = args.iter().map(|a| a.replace(TMPDIR_TOKEN, &tmp_str)).collect();

  let working_dir = cwd.under(tmp);
  std::fs::create_dir_all(&working_dir)?;

  debug!(program = %program.display(), cwd = %cwd, "spawning");

  let output = OsCommand::new(&program)
    .args(&spliced)
    .current_dir(&working_dir)
    .env_clear()
    .env("PATH", SANDBOX_PATH)
    .env("LANG", SANDBOX_LANG)
    .output()
    .await?;

  if !output.status.success() {
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    report_failure(&program, &working_dir, output.status.code(), &stderr, verbosity);
    return Err(EngineError::ProcessFailed {
      program: callee.to_string(),
      cwd: working_dir,
      code: output.status.code(),
      stderr,
    });
  }

  Ok(output.stdout)
}

/// Where the executable for a call lives.
///
/// `Env` names stay bare so the OS resolves them against the sandbox
/// `PATH`; artifact and temp callees become absolute sandbox paths.
fn resolve_callee(tmp: &Path, callee: &Call) -> PathBuf {
  match callee {
    Call::Env(name) => PathBuf::from(name),
    Call::Artifact(artifact) => tmp.join(artifact.path_in()),
    Call::Temp(path) => path.under(tmp),
  }
}

fn report_failure(program: &Path, cwd: &Path, code: Option<i32>, stderr: &str, verbosity: Verbosity) {
  if verbosity >= Verbosity::Loud {
    warn!(
      program = %program.display(),
      cwd = %cwd.display(),
      code = ?code,
      stderr = %stderr,
      "command failed"
    );
  } else if !stderr.is_empty() {
    warn!("{stderr}");
  }
}
