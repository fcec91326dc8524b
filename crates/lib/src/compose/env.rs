//! The lazy, self-referential environment.
//!
//! Entries live in an arena of [`Slot`]s keyed by name. Each name owns a
//! stack of definitions, one per layer (layer 0 is the registry, layer k is
//! the k-th overlay). Final lookups force the top of the stack; an overlay's
//! `prev` lookups force the top definition strictly below its own layer.
//! Every definition is evaluated against the same final environment, which
//! is what makes the whole thing a fixed point.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, ThreadId};

use tracing::{debug, trace};

use super::inject::{CallSite, Injector};
use super::{Component, ComposeError, LazyRef};
use crate::derivation::Derivation;
use crate::registry::{Registry, Role};

static NEXT_ENV_ID: AtomicU64 = AtomicU64::new(1);

/// Deferred computation of an entry from the layers below it and the final
/// environment.
pub type Thunk = Arc<dyn Fn(&Scope<'_>) -> Result<Component, ComposeError> + Send + Sync>;

/// How one layer defines an entry.
#[derive(Clone)]
pub enum Definition {
  /// Inject the descriptor's inputs from the final environment and construct.
  Call(CallSite),
  /// Compute from `prev`/final views.
  Thunk(Thunk),
  /// A constant.
  Value(Component),
  /// Same value as another entry of the final environment.
  Alias(String),
}

impl Definition {
  pub fn thunk<F>(f: F) -> Self
  where
    F: Fn(&Scope<'_>) -> Result<Component, ComposeError> + Send + Sync + 'static,
  {
    Definition::Thunk(Arc::new(f))
  }

  fn evaluate(&self, env: &Env, slot: &Slot) -> Result<Component, ComposeError> {
    match self {
      Definition::Value(component) => Ok(component.clone()),
      Definition::Alias(target) => env.get(target),
      Definition::Thunk(f) => f(&Scope {
        env,
        layer: slot.layer,
        name: &slot.name,
      }),
      Definition::Call(site) => {
        let inputs = Injector::resolve_call(site, env)?;
        site.descriptor().construct(&inputs)
      }
    }
  }
}

impl fmt::Debug for Definition {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Definition::Call(site) => write!(f, "Call({})", site.descriptor().name()),
      Definition::Thunk(_) => write!(f, "Thunk"),
      Definition::Value(c) => write!(f, "Value({:?})", c),
      Definition::Alias(target) => write!(f, "Alias({})", target),
    }
  }
}

/// What a thunk sees while it is being forced.
pub struct Scope<'a> {
  env: &'a Env,
  layer: usize,
  name: &'a str,
}

impl Scope<'_> {
  /// Name of the entry being computed.
  pub fn name(&self) -> &str {
    self.name
  }

  /// Look up a name in the final environment, after every overlay.
  pub fn get(&self, name: &str) -> Result<Component, ComposeError> {
    self.env.get(name)
  }

  /// Look up a name as defined by the layers below this one.
  pub fn prev(&self, name: &str) -> Result<Component, ComposeError> {
    self.env.get_below(name, self.layer)
  }

  pub fn has_prev(&self, name: &str) -> bool {
    self.env.top_below(name, self.layer).is_some()
  }

  pub fn final_env(&self) -> &Env {
    self.env
  }

  /// Inject a descriptor's inputs from the final environment and construct it.
  pub fn call(&self, site: &CallSite) -> Result<Component, ComposeError> {
    let inputs = Injector::resolve_call(site, self.env)?;
    site.descriptor().construct(&inputs)
  }

  /// Failure raised by this entry's own logic.
  pub fn fail(&self, message: impl fmt::Display) -> ComposeError {
    ComposeError::constructor(self.name, message)
  }
}

enum SlotState {
  Pending,
  InProgress(ThreadId),
  Done(Result<Component, ComposeError>),
}

/// One memoized definition of one name.
pub(crate) struct Slot {
  name: String,
  layer: usize,
  role: Role,
  definition: Definition,
  state: Mutex<SlotState>,
  ready: Condvar,
}

impl Slot {
  fn new(name: String, layer: usize, role: Role, definition: Definition) -> Self {
    Self {
      name,
      layer,
      role,
      definition,
      state: Mutex::new(SlotState::Pending),
      ready: Condvar::new(),
    }
  }

  /// Compute the value at most once.
  ///
  /// Re-entry from the forcing thread is a cycle. Other threads block until
  /// the owner publishes its result, unless the owner is itself (directly or
  /// through other threads) waiting on this thread, which is also a cycle.
  fn force(&self, env: &Env) -> Result<Component, ComposeError> {
    let me = thread::current().id();
    {
      let mut state = lock(&self.state);
      loop {
        let owner = match &*state {
          SlotState::Done(result) => return result.clone(),
          SlotState::InProgress(owner) if *owner == me => {
            return Err(ComposeError::EvaluationCycle {
              name: self.name.clone(),
              chain: forcing::chain_to(env.id(), &self.name),
            });
          }
          SlotState::InProgress(owner) => *owner,
          SlotState::Pending => break,
        };

        let target = waits::Target {
          slot: self.key(),
          env: env.id(),
          name: self.name.clone(),
          owner,
        };
        if let Err(hops) = waits::register(me, target) {
          return Err(ComposeError::EvaluationCycle {
            name: self.name.clone(),
            chain: forcing::across(&hops, &self.name),
          });
        }
        state = self.ready.wait(state).unwrap_or_else(PoisonError::into_inner);
        waits::clear(me);
      }
      *state = SlotState::InProgress(me);
    }

    trace!(env = %env.label(), name = %self.name, layer = self.layer, "forcing entry");

    let completion = Completion { slot: self, done: false };
    let result = {
      let _frame = forcing::Frame::push(env.id(), &self.name);
      self.definition.evaluate(env, self)
    };
    completion.finish(result.clone());
    result
  }

  fn key(&self) -> usize {
    std::ptr::from_ref(self) as usize
  }
}

/// Publishes a slot's result and wakes waiters, also when the definition
/// panics.
struct Completion<'a> {
  slot: &'a Slot,
  done: bool,
}

impl Completion<'_> {
  fn finish(mut self, result: Result<Component, ComposeError>) {
    self.publish(result);
    self.done = true;
  }

  fn publish(&self, result: Result<Component, ComposeError>) {
    let mut state = lock(&self.slot.state);
    *state = SlotState::Done(result);
    waits::release(self.slot.key());
    self.slot.ready.notify_all();
  }
}

impl Drop for Completion<'_> {
  fn drop(&mut self) {
    if !self.done {
      self.publish(Err(ComposeError::constructor(&self.slot.name, "definition panicked")));
    }
  }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-thread stack of entries being forced, for cycle diagnostics.
mod forcing {
  use super::*;

  thread_local! {
    static STACK: RefCell<Vec<(u64, String)>> = const { RefCell::new(Vec::new()) };
  }

  pub(super) struct Frame;

  impl Frame {
    pub(super) fn push(env: u64, name: &str) -> Self {
      STACK.with(|s| s.borrow_mut().push((env, name.to_string())));
      Frame
    }
  }

  impl Drop for Frame {
    fn drop(&mut self) {
      STACK.with(|s| s.borrow_mut().pop());
    }
  }

  /// Names from the in-progress frame for `name` to the top, then `name`.
  pub(super) fn chain_to(env: u64, name: &str) -> Vec<String> {
    let mut chain = since(env, name).unwrap_or_default();
    chain.push(name.to_string());
    chain
  }

  /// Chain of a cycle closed by other threads: the slots held by the
  /// threads along the wait chain, then this thread's own frames from the
  /// slot it holds, then `name` again.
  pub(super) fn across(hops: &[(u64, String)], name: &str) -> Vec<String> {
    let Some(((env, held), others)) = hops.split_last() else {
      return vec![name.to_string(), name.to_string()];
    };
    let mut chain: Vec<String> = others.iter().map(|(_, n)| n.clone()).collect();
    chain.extend(since(*env, held).unwrap_or_else(|| vec![held.clone()]));
    chain.push(name.to_string());
    chain
  }

  fn since(env: u64, name: &str) -> Option<Vec<String>> {
    STACK.with(|s| {
      let stack = s.borrow();
      let start = stack.iter().rposition(|(e, n)| *e == env && n == name)?;
      Some(stack[start..].iter().map(|(_, n)| n.clone()).collect())
    })
  }
}

/// Which in-progress slot each blocked thread waits for.
///
/// A thread about to block walks the chain owner -> slot that owner waits
/// for -> its owner ... and refuses to wait if the chain leads back to
/// itself. Entries are registered under the waited-on slot's state lock and
/// dropped by the publisher under the same lock, so the table never holds a
/// wait on a completed slot.
mod waits {
  use std::collections::HashMap;
  use std::sync::{LazyLock, Mutex, MutexGuard, PoisonError};
  use std::thread::ThreadId;

  pub(super) struct Target {
    pub(super) slot: usize,
    pub(super) env: u64,
    pub(super) name: String,
    pub(super) owner: ThreadId,
  }

  static WAITS: LazyLock<Mutex<HashMap<ThreadId, Target>>> = LazyLock::new(|| Mutex::new(HashMap::new()));

  fn table() -> MutexGuard<'static, HashMap<ThreadId, Target>> {
    WAITS.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Record that `me` waits for `target`.
  ///
  /// Fails with the `(env, name)` of every slot on the chain, starting with
  /// `target` and ending with the slot `me` holds, if waiting would close a
  /// cycle.
  pub(super) fn register(me: ThreadId, target: Target) -> Result<(), Vec<(u64, String)>> {
    let mut waits = table();
    let mut hops = vec![(target.env, target.name.clone())];
    let mut owner = target.owner;
    while let Some(next) = waits.get(&owner) {
      if hops.len() > waits.len() + 1 {
        break;
      }
      hops.push((next.env, next.name.clone()));
      if next.owner == me {
        // `me` holds the slot `owner` waits for
        return Err(hops);
      }
      owner = next.owner;
    }
    waits.insert(me, target);
    Ok(())
  }

  pub(super) fn clear(me: ThreadId) {
    table().remove(&me);
  }

  /// Forget every wait on `slot`; called once it completes.
  pub(super) fn release(slot: usize) {
    table().retain(|_, target| target.slot != slot);
  }
}

struct EnvInner {
  id: u64,
  label: String,
  layers: Vec<String>,
  entries: BTreeMap<String, Vec<Arc<Slot>>>,
}

/// Handle to a composed environment.
///
/// Cloning is cheap and shares memoized entries. A handle may be a
/// role-filtered view; views only change which names are visible, never how
/// entries are computed.
#[derive(Clone)]
pub struct Env {
  inner: Arc<EnvInner>,
  view: Option<Role>,
}

impl Env {
  pub fn id(&self) -> u64 {
    self.inner.id
  }

  pub fn label(&self) -> &str {
    &self.inner.label
  }

  /// Role filter of this handle, `None` for the full environment.
  pub fn view_role(&self) -> Option<Role> {
    self.view
  }

  /// Layer labels, bottom first (`base`, then overlays in application order).
  pub fn layers(&self) -> &[String] {
    &self.inner.layers
  }

  /// Force an entry, constructing it on first use.
  pub fn get(&self, name: &str) -> Result<Component, ComposeError> {
    let slot = self.top(name).ok_or_else(|| ComposeError::NotFound { name: name.to_string() })?;
    slot.force(&self.full())
  }

  /// Force an entry and require it to be a derivation.
  pub fn derivation(&self, name: &str) -> Result<Arc<Derivation>, ComposeError> {
    match self.get(name)?.forced()? {
      Component::Derivation(d) => Ok(d),
      other => Err(ComposeError::UnexpectedKind {
        name: name.to_string(),
        expected: "derivation",
        found: other.kind(),
      }),
    }
  }

  /// Unforced reference to an entry.
  pub fn lazy(&self, name: &str) -> Result<LazyRef, ComposeError> {
    if !self.contains(name) {
      return Err(ComposeError::NotFound { name: name.to_string() });
    }
    Ok(LazyRef::entry(self, name))
  }

  pub fn contains(&self, name: &str) -> bool {
    self.top(name).is_some()
  }

  /// Visible names in sorted order.
  pub fn names(&self) -> Vec<String> {
    self
      .inner
      .entries
      .iter()
      .filter(|(_, stack)| stack.last().is_some_and(|slot| self.admits(slot)))
      .map(|(name, _)| name.clone())
      .collect()
  }

  pub fn role_of(&self, name: &str) -> Option<Role> {
    self.top(name).map(|slot| slot.role)
  }

  /// Label of the layer that currently defines `name`.
  pub fn defined_by(&self, name: &str) -> Option<&str> {
    self
      .top(name)
      .and_then(|slot| self.inner.layers.get(slot.layer))
      .map(String::as_str)
  }

  /// View exposing only entries with the given role.
  pub fn view(&self, role: Role) -> Env {
    Env {
      inner: self.inner.clone(),
      view: Some(role),
    }
  }

  /// Same environment and same view.
  pub fn same_as(&self, other: &Env) -> bool {
    Arc::ptr_eq(&self.inner, &other.inner) && self.view == other.view
  }

  /// Equal label, view and visible names; used to compare independent
  /// compositions of the same inputs.
  pub fn same_shape(&self, other: &Env) -> bool {
    self.same_as(other) || (self.label() == other.label() && self.view == other.view && self.names() == other.names())
  }

  /// Check every visible entry's declared inputs without forcing anything.
  ///
  /// Returns the first failure in name order.
  pub fn check_inputs(&self) -> Result<(), ComposeError> {
    let full = self.full();
    for name in self.names() {
      let Some(slot) = self.top(&name) else {
        continue;
      };
      match &slot.definition {
        Definition::Call(site) => Injector::check(site, &full)?,
        Definition::Alias(target) if !full.contains(target) => {
          return Err(ComposeError::MissingInput {
            component: name.clone(),
            input: target.clone(),
          });
        }
        _ => {}
      }
    }
    Ok(())
  }

  /// Force every visible entry.
  pub fn force_all(&self) -> Result<BTreeMap<String, Component>, ComposeError> {
    self
      .names()
      .into_iter()
      .map(|name| {
        let value = self.get(&name)?;
        Ok((name, value))
      })
      .collect()
  }

  pub(crate) fn downgrade(&self) -> WeakEnv {
    WeakEnv {
      inner: Arc::downgrade(&self.inner),
      view: self.view,
    }
  }

  /// Force the top definition of `name` strictly below `layer`.
  pub(crate) fn get_below(&self, name: &str, layer: usize) -> Result<Component, ComposeError> {
    let slot = self
      .top_below(name, layer)
      .ok_or_else(|| ComposeError::NotFound { name: name.to_string() })?;
    slot.force(&self.full())
  }

  fn top_below(&self, name: &str, layer: usize) -> Option<&Arc<Slot>> {
    self
      .inner
      .entries
      .get(name)?
      .iter()
      .rev()
      .find(|slot| slot.layer < layer)
  }

  fn top(&self, name: &str) -> Option<&Arc<Slot>> {
    self
      .inner
      .entries
      .get(name)
      .and_then(|stack| stack.last())
      .filter(|slot| self.admits(slot))
  }

  fn admits(&self, slot: &Slot) -> bool {
    self.view.is_none_or(|role| slot.role == role)
  }

  fn full(&self) -> Env {
    Env {
      inner: self.inner.clone(),
      view: None,
    }
  }
}

impl fmt::Debug for Env {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.view {
      Some(role) => write!(f, "Env({}#{} [{}])", self.label(), self.id(), role),
      None => write!(f, "Env({}#{})", self.label(), self.id()),
    }
  }
}

/// Non-owning handle used by lazy references, so entries that point back
/// into their own environment do not keep it alive.
#[derive(Clone)]
pub(crate) struct WeakEnv {
  inner: Weak<EnvInner>,
  view: Option<Role>,
}

impl WeakEnv {
  pub(crate) fn upgrade(&self, name: &str) -> Result<Env, ComposeError> {
    let inner = self
      .inner
      .upgrade()
      .ok_or_else(|| ComposeError::EnvironmentDropped { name: name.to_string() })?;
    Ok(Env { inner, view: self.view })
  }

  pub(crate) fn ptr_eq(&self, other: &WeakEnv) -> bool {
    Weak::ptr_eq(&self.inner, &other.inner)
  }
}

struct PendingSlot {
  layer: usize,
  role: Role,
  definition: Definition,
}

/// Collects layers of definitions, then seals them into an [`Env`].
pub struct EnvBuilder {
  label: String,
  layers: Vec<String>,
  entries: BTreeMap<String, Vec<PendingSlot>>,
}

impl EnvBuilder {
  pub fn new(label: impl Into<String>) -> Self {
    Self {
      label: label.into(),
      layers: vec!["base".to_string()],
      entries: BTreeMap::new(),
    }
  }

  /// Base layer holding one call site per registered descriptor.
  pub fn from_registry(label: impl Into<String>, registry: &Registry) -> Self {
    let mut builder = Self::new(label);
    for descriptor in registry.descriptors() {
      builder = builder.base(
        descriptor.name(),
        descriptor.role(),
        Definition::Call(CallSite::new(descriptor.clone())),
      );
    }
    builder
  }

  /// Add or replace a base-layer entry.
  pub fn base(mut self, name: impl Into<String>, role: Role, definition: Definition) -> Self {
    let stack = self.entries.entry(name.into()).or_default();
    stack.retain(|slot| slot.layer != 0);
    stack.insert(0, PendingSlot {
      layer: 0,
      role,
      definition,
    });
    self
  }

  /// Stack a new layer on top. Entries without a role inherit the role of
  /// the definition they shadow (or of an alias target), else `Library`.
  pub fn push_layer(&mut self, label: impl Into<String>, entries: Vec<(String, Option<Role>, Definition)>) {
    let layer = self.layers.len();
    self.layers.push(label.into());

    for (name, role, definition) in entries {
      let role = role
        .or_else(|| self.current_role(&name))
        .or_else(|| match &definition {
          Definition::Alias(target) => self.current_role(target),
          _ => None,
        })
        .unwrap_or_default();

      let stack = self.entries.entry(name).or_default();
      if stack.last().is_some_and(|slot| slot.layer == layer) {
        stack.pop();
      }
      stack.push(PendingSlot {
        layer,
        role,
        definition,
      });
    }
  }

  fn current_role(&self, name: &str) -> Option<Role> {
    self.entries.get(name).and_then(|stack| stack.last()).map(|slot| slot.role)
  }

  pub fn seal(self) -> Env {
    let id = NEXT_ENV_ID.fetch_add(1, Ordering::Relaxed);
    let entries = self
      .entries
      .into_iter()
      .map(|(name, stack)| {
        let slots = stack
          .into_iter()
          .map(|p| Arc::new(Slot::new(name.clone(), p.layer, p.role, p.definition)))
          .collect();
        (name, slots)
      })
      .collect::<BTreeMap<_, _>>();

    debug!(env = %self.label, id, entries = entries.len(), layers = self.layers.len(), "sealed environment");

    Env {
      inner: Arc::new(EnvInner {
        id,
        label: self.label,
        layers: self.layers,
        entries,
      }),
      view: None,
    }
  }
}
