//! Stage graph for bootstrapping and cross-compilation.
//!
//! Stages form a chain. Each stage is one fixed-point environment scoped to a
//! [`PlatformTriple`]; its base layer is the registry plus the distinguished
//! entries `buildPlatform`, `hostPlatform`, `targetPlatform` and, after the
//! first stage, `buildPackages`: the previous stage's environment filtered to
//! its [`Role::Tool`] entries. Because a stage can only see the stage before
//! it, the chain is acyclic across stages; cycles inside a stage follow the
//! usual composition rules.
//!
//! The chain is a plain value built from (registry, stage specs). Nothing
//! about it is global.

use tracing::{debug, info};

use crate::compose::{Component, ComposeError, Definition, Env, EnvBuilder};
use crate::consts::{BUILD_PACKAGES, BUILD_PLATFORM, HOST_PLATFORM, TARGET_PLATFORM};
use crate::overlay::{self, Overlay};
use crate::platform::{Platform, PlatformTriple};
use crate::registry::{Registry, Role};

/// Configuration of one stage: its platforms and the overlays applied to it,
/// in order.
#[derive(Debug, Clone)]
pub struct StageSpec {
  pub label: String,
  pub triple: PlatformTriple,
  pub overlays: Vec<Overlay>,
}

impl StageSpec {
  pub fn new(label: impl Into<String>, triple: PlatformTriple) -> Self {
    Self {
      label: label.into(),
      triple,
      overlays: Vec::new(),
    }
  }

  pub fn native(label: impl Into<String>, platform: Platform) -> Self {
    Self::new(label, PlatformTriple::native(platform))
  }

  pub fn overlay(mut self, overlay: Overlay) -> Self {
    self.overlays.push(overlay);
    self
  }
}

/// One composed stage.
#[derive(Debug, Clone)]
pub struct Stage {
  index: usize,
  label: String,
  triple: PlatformTriple,
  env: Env,
  build_tools: Env,
}

impl Stage {
  pub fn index(&self) -> usize {
    self.index
  }

  pub fn label(&self) -> &str {
    &self.label
  }

  pub fn triple(&self) -> &PlatformTriple {
    &self.triple
  }

  /// The stage's full environment.
  pub fn env(&self) -> &Env {
    &self.env
  }

  /// Tools that run on this stage's build platform.
  ///
  /// This is the previous stage's tool view; the first stage has nothing
  /// before it and uses its own.
  pub fn build_tools(&self) -> &Env {
    &self.build_tools
  }

  /// Entries linked for or run on this stage's host platform.
  pub fn host_libraries(&self) -> Env {
    self.env.view(Role::Library)
  }

  /// Entries produced for this stage's target platform.
  pub fn target_artifacts(&self) -> Env {
    self.env.view(Role::Artifact)
  }

  /// Index of the stage this one takes its build tools from.
  pub fn depends_on(&self) -> Option<usize> {
    self.index.checked_sub(1)
  }
}

/// An ordered, non-empty chain of stages.
#[derive(Debug, Clone)]
pub struct StageGraph {
  stages: Vec<Stage>,
}

impl StageGraph {
  /// Compose every stage in order.
  ///
  /// # Errors
  ///
  /// - `EmptyStageList` for an empty spec list
  /// - `DuplicateStage` if two specs share a label
  /// - `PlatformMismatch` if a stage's build platform is not the previous
  ///   stage's host platform
  pub fn build(registry: &Registry, specs: Vec<StageSpec>) -> Result<Self, ComposeError> {
    if specs.is_empty() {
      return Err(ComposeError::EmptyStageList);
    }

    let mut stages: Vec<Stage> = Vec::with_capacity(specs.len());
    for (index, spec) in specs.into_iter().enumerate() {
      if stages.iter().any(|s| s.label == spec.label) {
        return Err(ComposeError::DuplicateStage { label: spec.label });
      }

      let mut builder = EnvBuilder::from_registry(spec.label.clone(), registry)
        .base(BUILD_PLATFORM, Role::Library, platform_value(&spec.triple.build))
        .base(HOST_PLATFORM, Role::Library, platform_value(&spec.triple.host))
        .base(TARGET_PLATFORM, Role::Library, platform_value(&spec.triple.target));

      let previous_tools = match stages.last() {
        Some(previous) => {
          if previous.triple.host != spec.triple.build {
            return Err(ComposeError::PlatformMismatch {
              stage: spec.label,
              expected: previous.triple.host,
              found: spec.triple.build,
            });
          }
          let tools = previous.env.view(Role::Tool);
          builder = builder.base(
            BUILD_PACKAGES,
            Role::Library,
            Definition::Value(Component::Scope(tools.clone())),
          );
          Some(tools)
        }
        None => None,
      };

      debug!(stage = %spec.label, overlays = spec.overlays.len(), "composing stage");
      let env = overlay::apply(&spec.overlays, builder);
      let build_tools = previous_tools.unwrap_or_else(|| env.view(Role::Tool));

      info!(stage = %spec.label, index, triple = %spec.triple, "stage ready");
      stages.push(Stage {
        index,
        label: spec.label,
        triple: spec.triple,
        env,
        build_tools,
      });
    }

    Ok(Self { stages })
  }

  pub fn stages(&self) -> &[Stage] {
    &self.stages
  }

  /// The stage exposed to users.
  pub fn final_stage(&self) -> &Stage {
    &self.stages[self.stages.len() - 1]
  }

  pub fn stage(&self, label: &str) -> Option<&Stage> {
    self.stages.iter().find(|s| s.label == label)
  }

  pub fn len(&self) -> usize {
    self.stages.len()
  }

  /// Pairs with [`StageGraph::len`] (clippy `len_without_is_empty`); always
  /// false, since `build` rejects an empty spec list.
  pub fn is_empty(&self) -> bool {
    self.stages.is_empty()
  }

  /// Check every stage's declared inputs without forcing anything.
  pub fn validate(&self) -> Result<(), ComposeError> {
    self.stages.iter().try_for_each(|stage| stage.env.check_inputs())
  }
}

fn platform_value(platform: &Platform) -> Definition {
  Definition::Value(Component::from(platform.system()))
}
