//! Overlay stack.
//!
//! An [`Overlay`] is an ordered set of entry definitions, each a function of
//! two views: `prev`, the environment as left by every earlier overlay, and
//! `final`, the environment after all overlays. Applying a list of overlays
//! stacks one layer per overlay on top of the base layer and seals the
//! result into a single fixed point, so `final` is the same environment the
//! caller gets back.
//!
//! Conflicts are resolved by position: the last overlay defining a name
//! wins. The caller's order is kept exactly as given.

use tracing::debug;

use crate::compose::{CallSite, Component, ComposeError, Definition, Env, EnvBuilder, Scope};
use crate::registry::Role;

/// One layer of entry definitions.
#[derive(Debug, Clone)]
pub struct Overlay {
  name: String,
  entries: Vec<(String, Option<Role>, Definition)>,
}

impl Overlay {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      entries: Vec::new(),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// Names this overlay defines, in definition order.
  pub fn names(&self) -> impl Iterator<Item = &str> {
    self.entries.iter().map(|(name, _, _)| name.as_str())
  }

  /// Define `name` from the `prev` and final views.
  ///
  /// The entry keeps the role of the definition it replaces.
  pub fn define<F>(self, name: impl Into<String>, f: F) -> Self
  where
    F: Fn(&Scope<'_>) -> Result<Component, ComposeError> + Send + Sync + 'static,
  {
    self.push(name.into(), None, Definition::thunk(f))
  }

  /// Like [`Overlay::define`] with an explicit role.
  pub fn define_with_role<F>(self, name: impl Into<String>, role: Role, f: F) -> Self
  where
    F: Fn(&Scope<'_>) -> Result<Component, ComposeError> + Send + Sync + 'static,
  {
    self.push(name.into(), Some(role), Definition::thunk(f))
  }

  /// Define an entry by injecting a descriptor from the final environment.
  /// The entry takes the descriptor's name and role.
  pub fn descriptor(self, site: impl Into<CallSite>) -> Self {
    let site = site.into();
    let name = site.descriptor().name().to_string();
    let role = site.descriptor().role();
    self.push(name, Some(role), Definition::Call(site))
  }

  /// Define `name` by injecting a descriptor under a different name.
  pub fn call(self, name: impl Into<String>, site: impl Into<CallSite>) -> Self {
    let site = site.into();
    let role = site.descriptor().role();
    self.push(name.into(), Some(role), Definition::Call(site))
  }

  pub fn value(self, name: impl Into<String>, value: impl Into<Component>) -> Self {
    self.push(name.into(), None, Definition::Value(value.into()))
  }

  /// Make `name` resolve to whatever `target` is in the final environment.
  pub fn alias(self, name: impl Into<String>, target: impl Into<String>) -> Self {
    self.push(name.into(), None, Definition::Alias(target.into()))
  }

  fn push(mut self, name: String, role: Option<Role>, definition: Definition) -> Self {
    self.entries.push((name, role, definition));
    self
  }
}

/// Stack `overlays` on `base` in order and seal the fixed point.
pub fn apply(overlays: &[Overlay], mut base: EnvBuilder) -> Env {
  for overlay in overlays {
    debug!(overlay = %overlay.name, entries = overlay.entries.len(), "applying overlay");
    base.push_layer(overlay.name.clone(), overlay.entries.clone());
  }
  base.seal()
}
