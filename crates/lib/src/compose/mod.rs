//! Fixed-point composition.
//!
//! An environment is built lazily in terms of itself: every entry is a
//! deferred computation whose injected inputs come from the very environment
//! being defined. Entries are memoized per environment instance, and an
//! entry that is re-entered while still being computed on the same thread is
//! reported as an [`ComposeError::EvaluationCycle`] instead of recursing.
//!
//! # Submodules
//!
//! - [`env`] - slots, layers and the [`Env`] handle
//! - [`inject`] - name-based input resolution

pub mod env;
pub mod inject;
mod types;

use tracing::debug;

pub use env::{Definition, Env, EnvBuilder, Scope, Thunk};
pub use inject::{CallSite, Injector, Inputs, LazyRef, Pin};
pub use types::*;

use crate::overlay::{self, Overlay};
use crate::registry::Registry;

/// Builds environments from a registry and an overlay list.
pub struct Composer;

impl Composer {
  /// Compose the registry alone.
  pub fn compose(label: impl Into<String>, registry: &Registry) -> Env {
    Self::compose_with(label, registry, &[])
  }

  /// Compose the registry with overlays applied in the given order.
  pub fn compose_with(label: impl Into<String>, registry: &Registry, overlays: &[Overlay]) -> Env {
    let label = label.into();
    debug!(env = %label, descriptors = registry.len(), overlays = overlays.len(), "composing environment");
    overlay::apply(overlays, EnvBuilder::from_registry(label, registry))
  }
}
