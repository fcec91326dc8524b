use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Standard build steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StdPhase {
  Unpack,
  Patch,
  Configure,
  Build,
  Check,
  Install,
  Fixup,
}

impl StdPhase {
  pub const ALL: [StdPhase; 7] = [
    StdPhase::Unpack,
    StdPhase::Patch,
    StdPhase::Configure,
    StdPhase::Build,
    StdPhase::Check,
    StdPhase::Install,
    StdPhase::Fixup,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      StdPhase::Unpack => "unpack",
      StdPhase::Patch => "patch",
      StdPhase::Configure => "configure",
      StdPhase::Build => "build",
      StdPhase::Check => "check",
      StdPhase::Install => "install",
      StdPhase::Fixup => "fixup",
    }
  }
}

impl fmt::Display for StdPhase {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.as_str())
  }
}

/// Position of a step relative to its standard phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseSlot {
  Pre,
  Main,
  Post,
}

/// A standard phase plus a slot, e.g. `preConfigure` or `install`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PhaseName {
  pub phase: StdPhase,
  pub slot: PhaseSlot,
}

impl PhaseName {
  pub fn new(phase: StdPhase, slot: PhaseSlot) -> Self {
    Self { phase, slot }
  }

  pub fn main(phase: StdPhase) -> Self {
    Self::new(phase, PhaseSlot::Main)
  }
}

impl fmt::Display for PhaseName {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let base = self.phase.as_str();
    let prefix = match self.slot {
      PhaseSlot::Main => return write!(f, "{}", base),
      PhaseSlot::Pre => "pre",
      PhaseSlot::Post => "post",
    };
    let mut chars = base.chars();
    match chars.next() {
      Some(first) => write!(f, "{}{}{}", prefix, first.to_ascii_uppercase(), chars.as_str()),
      None => write!(f, "{}", prefix),
    }
  }
}

/// What a phase does. The orchestrator never looks inside; it hands the
/// action to a phase runner and only sees the exit status.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PhaseAction {
  Cmd {
    cmd: String,
    env: Option<BTreeMap<String, String>>,
    cwd: Option<String>,
  },
}

impl PhaseAction {
  pub fn cmd(cmd: impl Into<String>) -> Self {
    PhaseAction::Cmd {
      cmd: cmd.into(),
      env: None,
      cwd: None,
    }
  }

  pub fn with_env(self, vars: BTreeMap<String, String>) -> Self {
    match self {
      PhaseAction::Cmd { cmd, cwd, .. } => PhaseAction::Cmd {
        cmd,
        env: Some(vars),
        cwd,
      },
    }
  }

  pub fn with_cwd(self, dir: impl Into<String>) -> Self {
    match self {
      PhaseAction::Cmd { cmd, env, .. } => PhaseAction::Cmd {
        cmd,
        env,
        cwd: Some(dir.into()),
      },
    }
  }
}

impl From<&str> for PhaseAction {
  fn from(cmd: &str) -> Self {
    PhaseAction::cmd(cmd)
  }
}

impl From<String> for PhaseAction {
  fn from(cmd: String) -> Self {
    PhaseAction::cmd(cmd)
  }
}

/// One named step of a derivation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Phase {
  pub name: PhaseName,
  pub action: PhaseAction,
  /// Safe to run again after a failure.
  pub retryable: bool,
}

impl Phase {
  pub fn new(name: PhaseName, action: impl Into<PhaseAction>) -> Self {
    Self {
      name,
      action: action.into(),
      retryable: false,
    }
  }

  pub fn pre(phase: StdPhase, action: impl Into<PhaseAction>) -> Self {
    Self::new(PhaseName::new(phase, PhaseSlot::Pre), action)
  }

  pub fn main(phase: StdPhase, action: impl Into<PhaseAction>) -> Self {
    Self::new(PhaseName::main(phase), action)
  }

  pub fn post(phase: StdPhase, action: impl Into<PhaseAction>) -> Self {
    Self::new(PhaseName::new(phase, PhaseSlot::Post), action)
  }

  pub fn retryable(mut self) -> Self {
    self.retryable = true;
    self
  }
}
