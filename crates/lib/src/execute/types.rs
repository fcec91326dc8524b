//! Types for derivation builds.
//!
//! Errors, per-derivation statuses, the build report and the orchestrator's
//! configuration.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::derivation::PhaseName;
use crate::platform::paths::store_dir;
use crate::util::hash::Fingerprint;

/// Environment variables read by [`ExecuteConfig::from_env`].
pub const MAX_JOBS_ENV: &str = "PKGFIX_MAX_JOBS";
pub const CHECK_ENV: &str = "PKGFIX_CHECK";
pub const RETRIES_ENV: &str = "PKGFIX_RETRIES";
pub const KEEP_GOING_ENV: &str = "PKGFIX_KEEP_GOING";

/// Why a derivation did not produce outputs.
///
/// Errors are recorded per derivation and copied into the failure of every
/// dependent, so the type is `Clone`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
  #[error("phase '{phase}' of '{name}' failed with {}", exit_status(.code))]
  PhaseFailure {
    name: String,
    phase: PhaseName,
    code: Option<i32>,
  },

  #[error("'{name}' was not built because its input '{dependency}' failed")]
  DependencyFailed {
    name: String,
    dependency: String,
    cause: Arc<BuildError>,
  },

  #[error("build of '{name}' was cancelled")]
  Cancelled { name: String },

  #[error("i/o error while building '{name}': {message}")]
  Io { name: String, message: String },

  #[error("store error at {path}: {message}")]
  Store { path: String, message: String },

  #[error("dependency cycle detected")]
  Cycle,
}

impl BuildError {
  /// The failure at the end of a `DependencyFailed` chain.
  pub fn root_cause(&self) -> &BuildError {
    let mut current = self;
    while let BuildError::DependencyFailed { cause, .. } = current {
      current = cause;
    }
    current
  }

  /// Names from this derivation down to the one that actually failed.
  pub fn chain(&self) -> Vec<&str> {
    let mut names = Vec::new();
    let mut current = self;
    loop {
      match current {
        BuildError::DependencyFailed { name, cause, .. } => {
          names.push(name.as_str());
          current = cause;
        }
        BuildError::PhaseFailure { name, .. } | BuildError::Cancelled { name } | BuildError::Io { name, .. } => {
          names.push(name.as_str());
          return names;
        }
        BuildError::Store { .. } | BuildError::Cycle => return names,
      }
    }
  }
}

fn exit_status(code: &Option<i32>) -> String {
  match code {
    Some(code) => format!("exit code {}", code),
    None => "no exit code (terminated by signal)".to_string(),
  }
}

/// Invalid configuration value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid value for {var}: '{value}' ({reason})")]
pub struct ConfigError {
  pub var: String,
  pub value: String,
  pub reason: String,
}

/// Exit status reported by a phase runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseExit {
  pub code: Option<i32>,
}

impl PhaseExit {
  pub fn success() -> Self {
    Self { code: Some(0) }
  }

  pub fn failure(code: i32) -> Self {
    Self { code: Some(code) }
  }

  pub fn is_success(&self) -> bool {
    self.code == Some(0)
  }
}

/// Where a derivation's outputs live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildOutputs {
  /// The store entry holding every output.
  pub store_path: PathBuf,

  /// Output name to path.
  pub outputs: BTreeMap<String, PathBuf>,
}

impl BuildOutputs {
  pub fn get(&self, output: &str) -> Option<&PathBuf> {
    self.outputs.get(output)
  }
}

/// Terminal state of one derivation in a build request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DerivationStatus {
  /// Outputs are available. `cached` is true when no phase ran.
  Succeeded { outputs: BuildOutputs, cached: bool },
  Failed(BuildError),
  Cancelled,
}

impl DerivationStatus {
  pub fn is_succeeded(&self) -> bool {
    matches!(self, DerivationStatus::Succeeded { .. })
  }

  pub fn outputs(&self) -> Option<&BuildOutputs> {
    match self {
      DerivationStatus::Succeeded { outputs, .. } => Some(outputs),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&BuildError> {
    match self {
      DerivationStatus::Failed(e) => Some(e),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRecord {
  pub name: String,
  pub status: DerivationStatus,
}

/// Result of one build request: a terminal status for every derivation in
/// the closure of the requested roots.
#[derive(Debug, Clone, Default)]
pub struct BuildReport {
  pub records: BTreeMap<Fingerprint, BuildRecord>,
  pub roots: Vec<Fingerprint>,
}

impl BuildReport {
  pub fn get(&self, fingerprint: &Fingerprint) -> Option<&BuildRecord> {
    self.records.get(fingerprint)
  }

  /// Status of the first derivation with the given name, by fingerprint
  /// order.
  pub fn status(&self, name: &str) -> Option<&DerivationStatus> {
    self.records.values().find(|r| r.name == name).map(|r| &r.status)
  }

  pub fn outputs(&self, name: &str) -> Option<&BuildOutputs> {
    self.status(name).and_then(DerivationStatus::outputs)
  }

  /// Returns true if every derivation succeeded.
  pub fn is_success(&self) -> bool {
    self.records.values().all(|r| r.status.is_succeeded())
  }

  pub fn len(&self) -> usize {
    self.records.len()
  }

  pub fn is_empty(&self) -> bool {
    self.records.is_empty()
  }

  /// Derivations whose phases ran in this request.
  pub fn built(&self) -> usize {
    self.count(|s| matches!(s, DerivationStatus::Succeeded { cached: false, .. }))
  }

  /// Derivations served from the cache.
  pub fn cached(&self) -> usize {
    self.count(|s| matches!(s, DerivationStatus::Succeeded { cached: true, .. }))
  }

  pub fn failed(&self) -> usize {
    self.count(|s| matches!(s, DerivationStatus::Failed(_)))
  }

  pub fn cancelled(&self) -> usize {
    self.count(|s| matches!(s, DerivationStatus::Cancelled))
  }

  fn count(&self, pred: impl Fn(&DerivationStatus) -> bool) -> usize {
    self.records.values().filter(|r| pred(&r.status)).count()
  }
}

/// One derivation in a dry-run plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedDerivation {
  pub name: String,
  pub fingerprint: Fingerprint,
  /// Outputs are already available; nothing would run.
  pub cached: bool,
}

/// Execution waves: every derivation's inputs are in earlier waves.
pub type BuildPlan = Vec<Vec<PlannedDerivation>>;

/// When the `check` phase (and its pre/post hooks) runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckPolicy {
  Always,
  Never,
  /// Only when the derivation's results can run on the build machine.
  #[default]
  NativeOnly,
}

impl FromStr for CheckPolicy {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "always" => Ok(CheckPolicy::Always),
      "never" => Ok(CheckPolicy::Never),
      "native-only" | "native" => Ok(CheckPolicy::NativeOnly),
      _ => Err("expected always, never or native-only".to_string()),
    }
  }
}

impl fmt::Display for CheckPolicy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      CheckPolicy::Always => "always",
      CheckPolicy::Never => "never",
      CheckPolicy::NativeOnly => "native-only",
    };
    write!(f, "{}", s)
  }
}

/// Configuration for derivation builds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecuteConfig {
  /// Maximum number of derivations building at once.
  pub max_jobs: usize,

  pub check_policy: CheckPolicy,

  /// Extra attempts for phases marked retryable.
  pub retry_attempts: u32,

  /// Keep building independent derivations after a failure. When false,
  /// work that has not started yet is cancelled.
  pub keep_going: bool,

  /// Root of the output store.
  pub store_root: PathBuf,

  /// Shell for phase commands.
  /// If None, uses /bin/sh (Unix) or powershell.exe (Windows).
  pub shell: Option<String>,
}

impl Default for ExecuteConfig {
  fn default() -> Self {
    Self {
      max_jobs: num_cpus(),
      check_policy: CheckPolicy::default(),
      retry_attempts: 0,
      keep_going: true,
      store_root: store_dir(),
      shell: None,
    }
  }
}

impl ExecuteConfig {
  /// Defaults overridden by `PKGFIX_*` environment variables.
  ///
  /// The store root follows `PKGFIX_STORE` through [`store_dir`].
  pub fn from_env() -> Result<Self, ConfigError> {
    let mut config = Self::default();

    if let Some(value) = env_var(MAX_JOBS_ENV) {
      config.max_jobs = match value.parse::<usize>() {
        Ok(n) if n > 0 => n,
        _ => return Err(invalid(MAX_JOBS_ENV, &value, "expected a positive integer")),
      };
    }
    if let Some(value) = env_var(CHECK_ENV) {
      config.check_policy = value.parse().map_err(|reason: String| invalid(CHECK_ENV, &value, &reason))?;
    }
    if let Some(value) = env_var(RETRIES_ENV) {
      config.retry_attempts = value
        .parse()
        .map_err(|_| invalid(RETRIES_ENV, &value, "expected a non-negative integer"))?;
    }
    if let Some(value) = env_var(KEEP_GOING_ENV) {
      config.keep_going = parse_bool(&value).ok_or_else(|| invalid(KEEP_GOING_ENV, &value, "expected a boolean"))?;
    }

    Ok(config)
  }

  pub fn with_store_root(mut self, root: impl Into<PathBuf>) -> Self {
    self.store_root = root.into();
    self
  }

  pub fn with_max_jobs(mut self, max_jobs: usize) -> Self {
    self.max_jobs = max_jobs;
    self
  }
}

fn env_var(name: &str) -> Option<String> {
  std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_bool(value: &str) -> Option<bool> {
  match value.trim().to_ascii_lowercase().as_str() {
    "1" | "true" | "yes" | "on" => Some(true),
    "0" | "false" | "no" | "off" => Some(false),
    _ => None,
  }
}

fn invalid(var: &str, value: &str, reason: &str) -> ConfigError {
  ConfigError {
    var: var.to_string(),
    value: value.to_string(),
    reason: reason.to_string(),
  }
}

/// Get the number of CPUs for default parallelism.
fn num_cpus() -> usize {
  std::thread::available_parallelism().map(|p| p.get()).unwrap_or(4)
}
