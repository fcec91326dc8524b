//! Descriptor registry.
//!
//! A [`Descriptor`] is the parsed form of one package definition: its name,
//! the inputs it asks for by name, defaults for the optional ones, and the
//! constructor that turns resolved inputs into a [`Component`]. The
//! [`Registry`] is the immutable catalogue the composer starts from.
//!
//! Registration happens once, single-threaded, before any composition. After
//! that the registry is only read and can be shared freely across threads.

mod types;

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::trace;

use crate::compose::ComposeError;

pub use types::*;

/// All known descriptors, keyed by unique name.
#[derive(Debug, Clone, Default)]
pub struct Registry {
  descriptors: BTreeMap<String, Arc<Descriptor>>,
}

impl Registry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Add a descriptor.
  ///
  /// # Errors
  ///
  /// Returns `DuplicateName` if a descriptor with the same name exists; the
  /// registry is left unchanged.
  pub fn register(&mut self, descriptor: Descriptor) -> Result<(), ComposeError> {
    if self.descriptors.contains_key(descriptor.name()) {
      return Err(ComposeError::DuplicateName {
        name: descriptor.name().to_string(),
      });
    }

    trace!(name = %descriptor.name(), inputs = ?descriptor.required_inputs(), "registering descriptor");
    self
      .descriptors
      .insert(descriptor.name().to_string(), Arc::new(descriptor));
    Ok(())
  }

  /// Register several descriptors, stopping at the first duplicate.
  pub fn register_all(&mut self, descriptors: impl IntoIterator<Item = Descriptor>) -> Result<(), ComposeError> {
    descriptors.into_iter().try_for_each(|d| self.register(d))
  }

  pub fn lookup(&self, name: &str) -> Result<Arc<Descriptor>, ComposeError> {
    self
      .descriptors
      .get(name)
      .cloned()
      .ok_or_else(|| ComposeError::NotFound { name: name.to_string() })
  }

  pub fn contains(&self, name: &str) -> bool {
    self.descriptors.contains_key(name)
  }

  /// Descriptor names in sorted order.
  pub fn names(&self) -> impl Iterator<Item = &str> {
    self.descriptors.keys().map(String::as_str)
  }

  pub fn descriptors(&self) -> impl Iterator<Item = &Arc<Descriptor>> {
    self.descriptors.values()
  }

  pub fn len(&self) -> usize {
    self.descriptors.len()
  }

  pub fn is_empty(&self) -> bool {
    self.descriptors.is_empty()
  }
}
