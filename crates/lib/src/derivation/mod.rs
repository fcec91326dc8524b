//! Derivations: buildable units with declared inputs, ordered phases and
//! named outputs.
//!
//! A derivation is immutable once built. Its [`Fingerprint`] is computed at
//! construction from its name, the fingerprints of its inputs (in declared
//! order), its phases, its output names and its platforms, so identical
//! recipes built in different environments share one identity and one cached
//! result.

mod types;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

pub use types::*;

use crate::compose::ComposeError;
use crate::consts::DEFAULT_OUTPUT;
use crate::platform::PlatformTriple;
use crate::util::hash::{Fingerprint, Fingerprintable};

pub struct Derivation {
  name: String,
  platforms: Option<PlatformTriple>,
  inputs: Vec<Arc<Derivation>>,
  phases: Vec<Phase>,
  outputs: BTreeSet<String>,
  fingerprint: Fingerprint,
}

impl Derivation {
  pub fn builder(name: impl Into<String>) -> DerivationBuilder {
    DerivationBuilder {
      name: name.into(),
      platforms: None,
      inputs: Vec::new(),
      phases: Vec::new(),
      outputs: BTreeSet::new(),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn platforms(&self) -> Option<&PlatformTriple> {
    self.platforms.as_ref()
  }

  /// Direct inputs in declared order.
  pub fn inputs(&self) -> &[Arc<Derivation>] {
    &self.inputs
  }

  /// Phases in execution order.
  pub fn phases(&self) -> &[Phase] {
    &self.phases
  }

  pub fn outputs(&self) -> &BTreeSet<String> {
    &self.outputs
  }

  pub fn fingerprint(&self) -> &Fingerprint {
    &self.fingerprint
  }

  /// True when the derivation's host can run what it builds, i.e. it is not
  /// cross-compiled. Derivations without platforms count as native.
  pub fn is_native(&self) -> bool {
    self.platforms.is_none_or(|p| p.is_native())
  }

  pub fn has_phase(&self, phase: StdPhase) -> bool {
    self.phases.iter().any(|p| p.name.phase == phase)
  }
}

impl PartialEq for Derivation {
  fn eq(&self, other: &Self) -> bool {
    self.fingerprint == other.fingerprint
  }
}

impl Eq for Derivation {}

impl fmt::Debug for Derivation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Derivation")
      .field("name", &self.name)
      .field("fingerprint", &self.fingerprint.short())
      .field("inputs", &self.inputs.iter().map(|d| d.name()).collect::<Vec<_>>())
      .field("phases", &self.phases.iter().map(|p| p.name.to_string()).collect::<Vec<_>>())
      .field("outputs", &self.outputs)
      .finish()
  }
}

/// Everything that determines a derivation's identity.
#[derive(Serialize)]
struct FingerprintSource<'a> {
  name: &'a str,
  inputs: Vec<&'a Fingerprint>,
  phases: &'a [Phase],
  outputs: &'a BTreeSet<String>,
  platforms: Option<&'a PlatformTriple>,
}

impl Fingerprintable for FingerprintSource<'_> {}

pub struct DerivationBuilder {
  name: String,
  platforms: Option<PlatformTriple>,
  inputs: Vec<Arc<Derivation>>,
  phases: Vec<Phase>,
  outputs: BTreeSet<String>,
}

impl DerivationBuilder {
  pub fn platforms(mut self, triple: PlatformTriple) -> Self {
    self.platforms = Some(triple);
    self
  }

  pub fn input(mut self, input: Arc<Derivation>) -> Self {
    self.inputs.push(input);
    self
  }

  pub fn inputs(mut self, inputs: impl IntoIterator<Item = Arc<Derivation>>) -> Self {
    self.inputs.extend(inputs);
    self
  }

  pub fn phase(mut self, phase: Phase) -> Self {
    self.phases.push(phase);
    self
  }

  /// Main step of a standard phase.
  pub fn run(self, phase: StdPhase, action: impl Into<PhaseAction>) -> Self {
    self.phase(Phase::main(phase, action))
  }

  pub fn pre(self, phase: StdPhase, action: impl Into<PhaseAction>) -> Self {
    self.phase(Phase::pre(phase, action))
  }

  pub fn post(self, phase: StdPhase, action: impl Into<PhaseAction>) -> Self {
    self.phase(Phase::post(phase, action))
  }

  /// Declare a named output. Without any, the derivation has just `out`.
  pub fn output(mut self, name: impl Into<String>) -> Self {
    self.outputs.insert(name.into());
    self
  }

  /// Order phases by standard phase and slot, keeping declaration order
  /// within a slot, and compute the fingerprint.
  pub fn build(mut self) -> Result<Derivation, ComposeError> {
    self.phases.sort_by_key(|p| p.name);
    if self.outputs.is_empty() {
      self.outputs.insert(DEFAULT_OUTPUT.to_string());
    }

    let fingerprint = FingerprintSource {
      name: &self.name,
      inputs: self.inputs.iter().map(|d| d.fingerprint()).collect(),
      phases: &self.phases,
      outputs: &self.outputs,
      platforms: self.platforms.as_ref(),
    }
    .fingerprint()
    .map_err(|e| ComposeError::constructor(&self.name, format!("cannot fingerprint derivation: {}", e)))?;

    Ok(Derivation {
      name: self.name,
      platforms: self.platforms,
      inputs: self.inputs,
      phases: self.phases,
      outputs: self.outputs,
      fingerprint,
    })
  }
}
