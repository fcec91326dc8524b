use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::compose::{Component, ComposeError, Env, Inputs};

/// Which platform a component is relevant to.
///
/// Stages use roles to hand the next stage only the tools that can run on
/// the machine doing the building.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
  /// Runs on the build platform (compilers, code generators).
  Tool,
  /// Linked into or run on the host platform.
  #[default]
  Library,
  /// Produced for the target platform (runtime libraries of a compiler).
  Artifact,
}

impl fmt::Display for Role {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Role::Tool => "tool",
      Role::Library => "library",
      Role::Artifact => "artifact",
    };
    write!(f, "{}", s)
  }
}

/// Turns resolved inputs into a component.
pub type Constructor = Arc<dyn Fn(&Inputs) -> Result<Component, ComposeError> + Send + Sync>;

/// Fallback for an absent input, evaluated against the same environment.
pub type DefaultExpr = Arc<dyn Fn(&Env) -> Result<Component, ComposeError> + Send + Sync>;

/// A registered package definition.
///
/// `required_inputs` lists every parameter the constructor may ask for, in
/// declaration order. A parameter with an entry in `optional_inputs` may be
/// absent from the environment; its default is used instead.
#[derive(Clone)]
pub struct Descriptor {
  name: String,
  role: Role,
  required_inputs: Vec<String>,
  optional_inputs: BTreeMap<String, DefaultExpr>,
  constructor: Constructor,
}

impl Descriptor {
  pub fn builder(name: impl Into<String>) -> DescriptorBuilder {
    DescriptorBuilder {
      name: name.into(),
      role: Role::default(),
      required_inputs: Vec::new(),
      optional_inputs: BTreeMap::new(),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn role(&self) -> Role {
    self.role
  }

  pub fn required_inputs(&self) -> &[String] {
    &self.required_inputs
  }

  pub fn default_for(&self, input: &str) -> Option<&DefaultExpr> {
    self.optional_inputs.get(input)
  }

  pub fn has_default(&self, input: &str) -> bool {
    self.optional_inputs.contains_key(input)
  }

  pub fn declares(&self, input: &str) -> bool {
    self.required_inputs.iter().any(|i| i == input)
  }

  pub(crate) fn construct(&self, inputs: &Inputs) -> Result<Component, ComposeError> {
    (self.constructor)(inputs)
  }

  /// Copy of this descriptor under another name, sharing the constructor.
  pub fn renamed(&self, name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      ..self.clone()
    }
  }

  /// Copy of this descriptor with a different role.
  pub fn with_role(&self, role: Role) -> Self {
    Self { role, ..self.clone() }
  }
}

impl fmt::Debug for Descriptor {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Descriptor")
      .field("name", &self.name)
      .field("role", &self.role)
      .field("required_inputs", &self.required_inputs)
      .field("optional_inputs", &self.optional_inputs.keys().collect::<Vec<_>>())
      .finish_non_exhaustive()
  }
}

pub struct DescriptorBuilder {
  name: String,
  role: Role,
  required_inputs: Vec<String>,
  optional_inputs: BTreeMap<String, DefaultExpr>,
}

impl DescriptorBuilder {
  /// Declare an input that must be present in the environment.
  pub fn requires(mut self, input: impl Into<String>) -> Self {
    self.push_input(input.into());
    self
  }

  /// Declare several required inputs in order.
  pub fn requires_all<I, S>(mut self, inputs: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    for input in inputs {
      self.push_input(input.into());
    }
    self
  }

  /// Declare an input with a default used when the environment lacks it.
  pub fn optional<F>(mut self, input: impl Into<String>, default: F) -> Self
  where
    F: Fn(&Env) -> Result<Component, ComposeError> + Send + Sync + 'static,
  {
    let input = input.into();
    self.push_input(input.clone());
    self.optional_inputs.insert(input, Arc::new(default));
    self
  }

  /// Declare an input with a constant default.
  pub fn optional_value(self, input: impl Into<String>, default: impl Into<Component>) -> Self {
    let default = default.into();
    self.optional(input, move |_| Ok(default.clone()))
  }

  pub fn role(mut self, role: Role) -> Self {
    self.role = role;
    self
  }

  pub fn build<F>(self, constructor: F) -> Descriptor
  where
    F: Fn(&Inputs) -> Result<Component, ComposeError> + Send + Sync + 'static,
  {
    Descriptor {
      name: self.name,
      role: self.role,
      required_inputs: self.required_inputs,
      optional_inputs: self.optional_inputs,
      constructor: Arc::new(constructor),
    }
  }

  fn push_input(&mut self, input: String) {
    if !self.required_inputs.contains(&input) {
      self.required_inputs.push(input);
    }
  }
}
