//! Test utilities for pkgfix-lib.
//!
//! [`MockRunner`] stands in for real phase execution: it records every phase
//! it is asked to run and answers with scripted exit codes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::derivation::{Derivation, StdPhase};
use crate::execute::{BuildError, PhaseContext, PhaseExit, PhaseRunner};

#[derive(Default)]
struct Script {
  /// (derivation, phase) -> exit code
  failures: HashMap<(String, String), i32>,
  /// (derivation, phase) -> remaining failing attempts
  flaky: HashMap<(String, String), u32>,
  /// derivation -> time spent in each phase
  delays: HashMap<String, Duration>,
}

/// Phase runner that records calls instead of executing anything.
#[derive(Clone, Default)]
pub struct MockRunner {
  script: Arc<Mutex<Script>>,
  calls: Arc<Mutex<Vec<String>>>,
  active: Arc<AtomicUsize>,
  peak: Arc<AtomicUsize>,
}

impl MockRunner {
  pub fn new() -> Self {
    Self::default()
  }

  /// Make `phase` of `name` exit with `code`.
  pub fn fail(self, name: &str, phase: &str, code: i32) -> Self {
    self
      .script
      .lock()
      .unwrap()
      .failures
      .insert((name.to_string(), phase.to_string()), code);
    self
  }

  /// Make `phase` of `name` fail `times` times, then succeed.
  pub fn flaky(self, name: &str, phase: &str, times: u32) -> Self {
    self
      .script
      .lock()
      .unwrap()
      .flaky
      .insert((name.to_string(), phase.to_string()), times);
    self
  }

  /// Make every phase of `name` take `delay`.
  pub fn delay(self, name: &str, delay: Duration) -> Self {
    self.script.lock().unwrap().delays.insert(name.to_string(), delay);
    self
  }

  /// Recorded calls as `name:phase`, in call order.
  pub fn calls(&self) -> Vec<String> {
    self.calls.lock().unwrap().clone()
  }

  /// Recorded phases of one derivation.
  pub fn calls_for(&self, name: &str) -> Vec<String> {
    let prefix = format!("{}:", name);
    self
      .calls()
      .into_iter()
      .filter_map(|c| c.strip_prefix(&prefix).map(str::to_string))
      .collect()
  }

  /// Highest number of phases that ran at the same time.
  pub fn peak_concurrency(&self) -> usize {
    self.peak.load(Ordering::SeqCst)
  }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
  fn drop(&mut self) {
    self.0.fetch_sub(1, Ordering::SeqCst);
  }
}

impl PhaseRunner for MockRunner {
  async fn run(&self, ctx: &PhaseContext<'_>) -> Result<PhaseExit, BuildError> {
    let key = (ctx.derivation.name().to_string(), ctx.phase.name.to_string());
    self.calls.lock().unwrap().push(format!("{}:{}", key.0, key.1));

    let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
    self.peak.fetch_max(now, Ordering::SeqCst);
    let _guard = ActiveGuard(&self.active);

    let (delay, code) = {
      let mut script = self.script.lock().unwrap();
      let delay = script.delays.get(&key.0).copied();
      let code = match script.flaky.get_mut(&key) {
        Some(remaining) if *remaining > 0 => {
          *remaining -= 1;
          Some(1)
        }
        _ => script.failures.get(&key).copied(),
      };
      (delay, code)
    };

    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }

    Ok(match code {
      Some(code) => PhaseExit::failure(code),
      None => PhaseExit::success(),
    })
  }
}

/// A derivation with `unpack`, `build` and `install` phases.
pub fn simple_drv(name: &str, inputs: &[&Arc<Derivation>]) -> Arc<Derivation> {
  Arc::new(
    Derivation::builder(name)
      .inputs(inputs.iter().map(|d| (*d).clone()))
      .run(StdPhase::Unpack, format!("unpack {}", name))
      .run(StdPhase::Build, format!("build {}", name))
      .run(StdPhase::Install, format!("install {}", name))
      .build()
      .unwrap(),
  )
}
