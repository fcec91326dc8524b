//! Phase runners.
//!
//! A [`PhaseRunner`] executes one phase and reports its exit status. The
//! orchestrator treats it as an opaque external step: it never looks at what
//! the phase does, only at whether it succeeded.
//!
//! [`ShellRunner`] runs command phases in an isolated environment:
//! - Clears all environment variables
//! - Sets PATH to the `bin` directories of the derivation's inputs
//!   (`/path-not-set` when there are none, to fail fast)
//! - Sets HOME to /homeless-shelter
//! - Sets TMPDIR/TMP/TEMP/TEMPDIR to the entry's scratch directory
//! - Sets `out` and one variable per declared output
//! - Merges the phase's own environment variables

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::debug;

use crate::consts::DEFAULT_OUTPUT;
use crate::derivation::{Derivation, Phase, PhaseAction};

use super::types::{BuildError, BuildOutputs, ExecuteConfig, PhaseExit};

/// Everything a runner gets to execute one phase.
pub struct PhaseContext<'a> {
  pub derivation: &'a Derivation,
  pub phase: &'a Phase,
  /// This derivation's store entry and output paths.
  pub outputs: &'a BuildOutputs,
  /// Default working directory.
  pub work_dir: &'a Path,
  pub tmp_dir: &'a Path,
  /// Outputs of the direct inputs, in declared order.
  pub inputs: &'a [BuildOutputs],
}

/// Executes a single phase.
///
/// Returning `Ok` with a non-zero exit is an ordinary phase failure. `Err` is
/// reserved for not being able to run the phase at all.
///
/// The orchestrator drops the returned future when the build is cancelled;
/// runners should release what they started when that happens.
pub trait PhaseRunner: Send + Sync + 'static {
  fn run(&self, ctx: &PhaseContext<'_>) -> impl Future<Output = Result<PhaseExit, BuildError>> + Send;
}

/// Runs command phases through a shell.
#[derive(Debug, Clone, Default)]
pub struct ShellRunner {
  shell: Option<String>,
}

impl ShellRunner {
  pub fn new() -> Self {
    Self::default()
  }

  /// Use a specific shell instead of the platform default.
  pub fn with_shell(shell: Option<String>) -> Self {
    Self { shell }
  }

  /// Runner using the shell named in `config`, if any.
  pub fn from_config(config: &ExecuteConfig) -> Self {
    Self::with_shell(config.shell.clone())
  }
}

impl PhaseRunner for ShellRunner {
  async fn run(&self, ctx: &PhaseContext<'_>) -> Result<PhaseExit, BuildError> {
    let PhaseAction::Cmd { cmd, env, cwd } = &ctx.phase.action;
    let name = ctx.derivation.name();
    let io_error = |e: std::io::Error| BuildError::Io {
      name: name.to_string(),
      message: e.to_string(),
    };

    let (shell_cmd, shell_args) = get_shell(self.shell.as_deref());
    let working_dir = match cwd {
      Some(dir) => ctx.work_dir.join(dir),
      None => ctx.work_dir.to_path_buf(),
    };
    tokio::fs::create_dir_all(&working_dir).await.map_err(io_error)?;

    let mut command = Command::new(&shell_cmd);
    command
      .args(&shell_args)
      .arg(cmd)
      .current_dir(&working_dir)
      .kill_on_drop(true)
      // Clear all environment variables
      .env_clear()
      // Set isolated environment
      .env("PATH", search_path(ctx.inputs))
      .env("HOME", "/homeless-shelter")
      .env("TMPDIR", ctx.tmp_dir)
      .env("TMP", ctx.tmp_dir)
      .env("TEMP", ctx.tmp_dir)
      .env("TEMPDIR", ctx.tmp_dir)
      .env("name", name)
      // Set a minimal locale
      .env("LANG", "C")
      .env("LC_ALL", "C")
      // 315532800 = January 1, 1980 00:00:00 UTC (ZIP epoch)
      .env("SOURCE_DATE_EPOCH", "315532800");

    for (output, path) in &ctx.outputs.outputs {
      command.env(output, path);
    }
    if let Some(user_env) = env {
      for (key, value) in user_env {
        command.env(key, value);
      }
    }

    debug!(name = %name, phase = %ctx.phase.name, shell = %shell_cmd, working_dir = ?working_dir, "spawning phase");

    let output = command.output().await.map_err(io_error)?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stdout.trim().is_empty() {
      debug!(name = %name, phase = %ctx.phase.name, stdout = %stdout.trim(), "phase stdout");
    }
    if !stderr.trim().is_empty() {
      debug!(name = %name, phase = %ctx.phase.name, stderr = %stderr.trim(), "phase stderr");
    }

    Ok(PhaseExit {
      code: output.status.code(),
    })
  }
}

/// `bin` directories of the inputs' default outputs.
fn search_path(inputs: &[BuildOutputs]) -> String {
  let dirs: Vec<PathBuf> = inputs
    .iter()
    .filter_map(|i| i.get(DEFAULT_OUTPUT))
    .map(|out| out.join("bin"))
    .collect();
  if dirs.is_empty() {
    return "/path-not-set".to_string();
  }
  std::env::join_paths(dirs)
    .map(|p| p.to_string_lossy().into_owned())
    .unwrap_or_else(|_| "/path-not-set".to_string())
}

/// Get the shell command and arguments for the current platform.
///
/// The default is `/bin/sh` (Unix) or `powershell.exe` (Windows) rather than
/// the user's `$SHELL`, which may source profile files.
fn get_shell(override_shell: Option<&str>) -> (String, Vec<String>) {
  if let Some(shell) = override_shell {
    let args = if shell.contains("powershell") || shell.contains("pwsh") {
      vec![
        "-NoProfile".to_string(),
        "-ExecutionPolicy".to_string(),
        "Bypass".to_string(),
        "-Command".to_string(),
      ]
    } else if shell.contains("cmd") {
      vec!["/C".to_string()]
    } else {
      vec!["-c".to_string()]
    };
    return (shell.to_string(), args);
  }

  #[cfg(unix)]
  {
    ("/bin/sh".to_string(), vec!["-c".to_string()])
  }

  #[cfg(windows)]
  {
    (
      "powershell.exe".to_string(),
      vec![
        "-NoProfile".to_string(),
        "-ExecutionPolicy".to_string(),
        "Bypass".to_string(),
        "-Command".to_string(),
      ],
    )
  }
}
