//! Name-based dependency injection.
//!
//! A constructor never receives forced values up front. It receives
//! [`Inputs`], whose bindings are checked for presence when resolved but
//! only forced when the constructor asks for them. That keeps resolution
//! from touching entries the constructor never uses, and lets two entries
//! refer to each other as long as neither forces the other while being
//! constructed.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use serde_json::Value;

use super::env::WeakEnv;
use super::{Component, ComposeError, Env};
use crate::derivation::Derivation;
use crate::registry::{DefaultExpr, Descriptor};

/// Where a pinned input comes from instead of the same-named entry.
#[derive(Clone, Debug)]
pub enum Pin {
  /// Another entry of the environment.
  Entry(String),
  /// A fixed component.
  Value(Component),
}

/// A descriptor plus per-call input pins.
#[derive(Clone)]
pub struct CallSite {
  descriptor: Arc<Descriptor>,
  pins: BTreeMap<String, Pin>,
}

impl CallSite {
  pub fn new(descriptor: impl Into<Arc<Descriptor>>) -> Self {
    Self {
      descriptor: descriptor.into(),
      pins: BTreeMap::new(),
    }
  }

  /// Satisfy `input` from the entry named `entry`.
  pub fn rename(mut self, input: impl Into<String>, entry: impl Into<String>) -> Self {
    self.pins.insert(input.into(), Pin::Entry(entry.into()));
    self
  }

  /// Satisfy `input` with a fixed component.
  pub fn pin(mut self, input: impl Into<String>, value: impl Into<Component>) -> Self {
    self.pins.insert(input.into(), Pin::Value(value.into()));
    self
  }

  pub fn descriptor(&self) -> &Arc<Descriptor> {
    &self.descriptor
  }
}

impl From<Descriptor> for CallSite {
  fn from(descriptor: Descriptor) -> Self {
    CallSite::new(descriptor)
  }
}

impl From<Arc<Descriptor>> for CallSite {
  fn from(descriptor: Arc<Descriptor>) -> Self {
    CallSite::new(descriptor)
  }
}

impl fmt::Debug for CallSite {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CallSite")
      .field("descriptor", &self.descriptor.name())
      .field("pins", &self.pins)
      .finish()
  }
}

/// Resolves a descriptor's declared inputs against an environment.
pub struct Injector;

impl Injector {
  /// Bind every declared input of `descriptor`.
  ///
  /// # Errors
  ///
  /// `MissingInput` for the first input, in declaration order, that is
  /// neither in `env` nor has a default.
  pub fn resolve(descriptor: &Arc<Descriptor>, env: &Env) -> Result<Inputs, ComposeError> {
    Self::resolve_call(&CallSite::new(descriptor.clone()), env)
  }

  /// Like [`Injector::resolve`], honoring the call site's pins.
  pub fn resolve_call(site: &CallSite, env: &Env) -> Result<Inputs, ComposeError> {
    let descriptor = &site.descriptor;
    let component = descriptor.name();

    if let Some(input) = site.pins.keys().find(|input| !descriptor.declares(input)) {
      return Err(ComposeError::UndeclaredInput {
        component: component.to_string(),
        input: input.clone(),
      });
    }

    let mut bindings = BTreeMap::new();
    for input in descriptor.required_inputs() {
      let binding = match site.pins.get(input) {
        Some(Pin::Value(value)) => Binding::Ready(value.clone()),
        Some(Pin::Entry(entry)) => Self::bind_entry(descriptor, env, input, entry)?,
        None => Self::bind_entry(descriptor, env, input, input)?,
      };
      bindings.insert(input.clone(), binding);
    }

    Ok(Inputs {
      component: component.to_string(),
      env: env.clone(),
      bindings,
    })
  }

  /// Presence check only; nothing is forced.
  pub fn check(site: &CallSite, env: &Env) -> Result<(), ComposeError> {
    Self::resolve_call(site, env).map(|_| ())
  }

  fn bind_entry(descriptor: &Descriptor, env: &Env, input: &str, entry: &str) -> Result<Binding, ComposeError> {
    if env.contains(entry) {
      return Ok(Binding::Entry(entry.to_string()));
    }
    match descriptor.default_for(input) {
      Some(expr) => Ok(Binding::Default(Arc::new(DefaultCell::new(input, expr.clone(), env)))),
      None => Err(ComposeError::MissingInput {
        component: descriptor.name().to_string(),
        input: entry.to_string(),
      }),
    }
  }
}

enum Binding {
  Entry(String),
  Ready(Component),
  Default(Arc<DefaultCell>),
}

/// A default expression evaluated at most once, on first use.
pub(crate) struct DefaultCell {
  input: String,
  expr: DefaultExpr,
  env: WeakEnv,
  value: OnceLock<Result<Component, ComposeError>>,
}

impl DefaultCell {
  fn new(input: &str, expr: DefaultExpr, env: &Env) -> Self {
    Self {
      input: input.to_string(),
      expr,
      env: env.downgrade(),
      value: OnceLock::new(),
    }
  }

  fn force(&self) -> Result<Component, ComposeError> {
    self
      .value
      .get_or_init(|| {
        let env = self.env.upgrade(&self.input)?;
        (self.expr)(&env)
      })
      .clone()
  }
}

/// Resolved inputs handed to a constructor.
pub struct Inputs {
  component: String,
  env: Env,
  bindings: BTreeMap<String, Binding>,
}

impl Inputs {
  /// Name of the component being constructed.
  pub fn component(&self) -> &str {
    &self.component
  }

  /// The environment the inputs were resolved against.
  pub fn env(&self) -> &Env {
    &self.env
  }

  /// Force one input.
  pub fn get(&self, name: &str) -> Result<Component, ComposeError> {
    match self.binding(name)? {
      Binding::Entry(entry) => self.env.get(entry),
      Binding::Ready(value) => Ok(value.clone()),
      Binding::Default(cell) => cell.force(),
    }
  }

  /// Unforced reference to one input.
  pub fn lazy(&self, name: &str) -> Result<LazyRef, ComposeError> {
    Ok(match self.binding(name)? {
      Binding::Entry(entry) => LazyRef::entry(&self.env, entry),
      Binding::Ready(value) => LazyRef(LazyTarget::Ready(Box::new(value.clone()))),
      Binding::Default(cell) => LazyRef(LazyTarget::Default(cell.clone())),
    })
  }

  pub fn derivation(&self, name: &str) -> Result<Arc<Derivation>, ComposeError> {
    match self.get(name)?.forced()? {
      Component::Derivation(d) => Ok(d),
      other => Err(self.kind_error(name, "derivation", &other)),
    }
  }

  pub fn value(&self, name: &str) -> Result<Value, ComposeError> {
    match self.get(name)?.forced()? {
      Component::Value(v) => Ok(v),
      other => Err(self.kind_error(name, "value", &other)),
    }
  }

  pub fn scope(&self, name: &str) -> Result<Env, ComposeError> {
    match self.get(name)?.forced()? {
      Component::Scope(env) => Ok(env),
      other => Err(self.kind_error(name, "scope", &other)),
    }
  }

  /// Failure raised by the constructor's own logic.
  pub fn fail(&self, message: impl fmt::Display) -> ComposeError {
    ComposeError::constructor(&self.component, message)
  }

  fn binding(&self, name: &str) -> Result<&Binding, ComposeError> {
    self.bindings.get(name).ok_or_else(|| ComposeError::UndeclaredInput {
      component: self.component.clone(),
      input: name.to_string(),
    })
  }

  fn kind_error(&self, name: &str, expected: &'static str, found: &Component) -> ComposeError {
    ComposeError::UnexpectedKind {
      name: name.to_string(),
      expected,
      found: found.kind(),
    }
  }
}

/// A reference that is forced only when asked.
#[derive(Clone)]
pub struct LazyRef(LazyTarget);

#[derive(Clone)]
enum LazyTarget {
  Entry { env: WeakEnv, name: String },
  Ready(Box<Component>),
  Default(Arc<DefaultCell>),
}

impl LazyRef {
  pub(crate) fn entry(env: &Env, name: &str) -> Self {
    LazyRef(LazyTarget::Entry {
      env: env.downgrade(),
      name: name.to_string(),
    })
  }

  pub fn force(&self) -> Result<Component, ComposeError> {
    match &self.0 {
      LazyTarget::Entry { env, name } => env.upgrade(name)?.get(name),
      LazyTarget::Ready(value) => Ok((**value).clone()),
      LazyTarget::Default(cell) => cell.force(),
    }
  }

  /// Entry name this reference points at, if it points at an entry.
  pub fn target(&self) -> Option<&str> {
    match &self.0 {
      LazyTarget::Entry { name, .. } => Some(name),
      LazyTarget::Default(cell) => Some(&cell.input),
      LazyTarget::Ready(_) => None,
    }
  }
}

impl PartialEq for LazyRef {
  fn eq(&self, other: &Self) -> bool {
    match (&self.0, &other.0) {
      (LazyTarget::Entry { env: a, name: x }, LazyTarget::Entry { env: b, name: y }) => a.ptr_eq(b) && x == y,
      (LazyTarget::Ready(a), LazyTarget::Ready(b)) => a == b,
      (LazyTarget::Default(a), LazyTarget::Default(b)) => Arc::ptr_eq(a, b),
      _ => false,
    }
  }
}

impl fmt::Debug for LazyRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.0 {
      LazyTarget::Entry { name, .. } => write!(f, "Lazy({})", name),
      LazyTarget::Ready(value) => write!(f, "Lazy({:?})", value),
      LazyTarget::Default(cell) => write!(f, "Lazy(default {})", cell.input),
    }
  }
}
