use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use super::{Env, LazyRef};
use crate::derivation::Derivation;
use crate::platform::Platform;

/// A realized environment entry.
///
/// The engine only looks inside derivations (to schedule them) and scopes
/// (to resolve nested lookups). Everything else is carried opaquely.
#[derive(Clone)]
pub enum Component {
  /// Plain data: versions, flags, platform strings.
  Value(serde_json::Value),
  /// A buildable unit.
  Derivation(Arc<Derivation>),
  /// A nested environment, e.g. the previous stage's tools.
  Scope(Env),
  /// A named record of components.
  Attrs(BTreeMap<String, Component>),
  /// An unforced reference to another entry.
  Lazy(LazyRef),
}

impl Component {
  pub fn kind(&self) -> &'static str {
    match self {
      Component::Value(_) => "value",
      Component::Derivation(_) => "derivation",
      Component::Scope(_) => "scope",
      Component::Attrs(_) => "attrs",
      Component::Lazy(_) => "lazy",
    }
  }

  pub fn as_value(&self) -> Option<&serde_json::Value> {
    match self {
      Component::Value(v) => Some(v),
      _ => None,
    }
  }

  pub fn as_derivation(&self) -> Option<&Arc<Derivation>> {
    match self {
      Component::Derivation(d) => Some(d),
      _ => None,
    }
  }

  pub fn as_scope(&self) -> Option<&Env> {
    match self {
      Component::Scope(env) => Some(env),
      _ => None,
    }
  }

  pub fn as_attrs(&self) -> Option<&BTreeMap<String, Component>> {
    match self {
      Component::Attrs(attrs) => Some(attrs),
      _ => None,
    }
  }

  /// Follow `Lazy` references until a concrete component is reached.
  pub fn forced(self) -> Result<Component, ComposeError> {
    let mut current = self;
    while let Component::Lazy(lazy) = current {
      current = lazy.force()?;
    }
    Ok(current)
  }
}

impl PartialEq for Component {
  fn eq(&self, other: &Self) -> bool {
    match (self, other) {
      (Component::Value(a), Component::Value(b)) => a == b,
      (Component::Derivation(a), Component::Derivation(b)) => a.fingerprint() == b.fingerprint(),
      (Component::Scope(a), Component::Scope(b)) => a.same_shape(b),
      (Component::Attrs(a), Component::Attrs(b)) => a == b,
      (Component::Lazy(a), Component::Lazy(b)) => a == b,
      _ => false,
    }
  }
}

impl fmt::Debug for Component {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Component::Value(v) => write!(f, "Value({})", v),
      Component::Derivation(d) => write!(f, "Derivation({} {})", d.name(), d.fingerprint().short()),
      Component::Scope(env) => write!(f, "Scope({:?})", env),
      Component::Attrs(attrs) => f.debug_map().entries(attrs.iter()).finish(),
      Component::Lazy(lazy) => write!(f, "{:?}", lazy),
    }
  }
}

impl From<serde_json::Value> for Component {
  fn from(value: serde_json::Value) -> Self {
    Component::Value(value)
  }
}

impl From<i64> for Component {
  fn from(value: i64) -> Self {
    Component::Value(value.into())
  }
}

impl From<i32> for Component {
  fn from(value: i32) -> Self {
    Component::Value(value.into())
  }
}

impl From<bool> for Component {
  fn from(value: bool) -> Self {
    Component::Value(value.into())
  }
}

impl From<&str> for Component {
  fn from(value: &str) -> Self {
    Component::Value(value.into())
  }
}

impl From<String> for Component {
  fn from(value: String) -> Self {
    Component::Value(value.into())
  }
}

impl From<Derivation> for Component {
  fn from(value: Derivation) -> Self {
    Component::Derivation(Arc::new(value))
  }
}

impl From<Arc<Derivation>> for Component {
  fn from(value: Arc<Derivation>) -> Self {
    Component::Derivation(value)
  }
}

impl From<Env> for Component {
  fn from(value: Env) -> Self {
    Component::Scope(value)
  }
}

impl From<LazyRef> for Component {
  fn from(value: LazyRef) -> Self {
    Component::Lazy(value)
  }
}

/// Errors raised while registering, injecting, composing or staging.
///
/// Every variant names the offending entry. Failures are memoized in the
/// entry that raised them, so the type is `Clone`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ComposeError {
  #[error("descriptor '{name}' is already registered")]
  DuplicateName { name: String },

  #[error("'{name}' not found")]
  NotFound { name: String },

  #[error("'{component}' requires input '{input}' which is not in the environment")]
  MissingInput { component: String, input: String },

  #[error("'{component}' asked for input '{input}' it does not declare")]
  UndeclaredInput { component: String, input: String },

  #[error("evaluation cycle while forcing '{name}': {}", .chain.join(" -> "))]
  EvaluationCycle { name: String, chain: Vec<String> },

  #[error("constructor of '{name}' failed: {message}")]
  Constructor { name: String, message: String },

  #[error("'{name}' is a {found}, expected a {expected}")]
  UnexpectedKind {
    name: String,
    expected: &'static str,
    found: &'static str,
  },

  #[error("environment holding '{name}' was dropped")]
  EnvironmentDropped { name: String },

  #[error("no stages given")]
  EmptyStageList,

  #[error("stage label '{label}' is used twice")]
  DuplicateStage { label: String },

  #[error("stage '{stage}' builds on {found}, but the previous stage hosts {expected}")]
  PlatformMismatch {
    stage: String,
    expected: Platform,
    found: Platform,
  },
}

impl ComposeError {
  /// Failure raised by a component's own build logic.
  pub fn constructor(name: impl Into<String>, message: impl fmt::Display) -> Self {
    ComposeError::Constructor {
      name: name.into(),
      message: message.to_string(),
    }
  }

  pub fn is_cycle(&self) -> bool {
    matches!(self, ComposeError::EvaluationCycle { .. })
  }
}
