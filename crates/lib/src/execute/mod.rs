//! Derivation build orchestration.
//!
//! This module provides the entry point for building derivations. It handles:
//! - DAG-based dependency ordering over the input closure
//! - Parallel execution of independent derivations, bounded by `max_jobs`
//! - Failure propagation to every dependent
//! - Fingerprint-keyed reuse of earlier results
//! - Cancellation of pending and running work
//!
//! Every derivation moves through `Pending -> Scheduled -> Running` and ends
//! in exactly one of `Succeeded`, `Failed` or `Cancelled`. A derivation is
//! scheduled only when all of its inputs have succeeded. Once an input fails,
//! its dependents fail with `DependencyFailed` without ever being scheduled.

pub mod cache;
mod cancel;
pub mod dag;
pub mod runner;
pub mod types;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::{Id, JoinSet};
use tracing::{debug, error, info, warn};

use crate::consts::{TMP_DIR, WORK_DIR};
use crate::derivation::{Derivation, StdPhase};
use crate::util::hash::Fingerprint;

pub use cache::{BuildCache, Store, StoreMarker};
pub use cancel::CancelToken;
pub use dag::BuildGraph;
pub use runner::{PhaseContext, PhaseRunner, ShellRunner};
pub use types::{
  BuildError, BuildOutputs, BuildPlan, BuildRecord, BuildReport, CheckPolicy, ConfigError, DerivationStatus,
  ExecuteConfig, PhaseExit, PlannedDerivation,
};

/// Builds derivations with a phase runner and a shared fingerprint cache.
///
/// One orchestrator may serve many build requests, sequentially or
/// concurrently; they all share the same cache, so a fingerprint is built at
/// most once per orchestrator (and once per store, across processes).
pub struct Orchestrator<R> {
  runner: Arc<R>,
  config: Arc<ExecuteConfig>,
  cache: Arc<BuildCache>,
}

impl<R: PhaseRunner> Orchestrator<R> {
  pub fn new(runner: R, config: ExecuteConfig) -> Self {
    let cache = BuildCache::new(Store::new(config.store_root.clone()));
    Self {
      runner: Arc::new(runner),
      config: Arc::new(config),
      cache: Arc::new(cache),
    }
  }

  pub fn config(&self) -> &ExecuteConfig {
    &self.config
  }

  pub fn cache(&self) -> &BuildCache {
    &self.cache
  }

  pub fn runner(&self) -> &R {
    &self.runner
  }

  /// Compute execution waves for `roots` without running anything.
  pub fn plan(&self, roots: &[Arc<Derivation>]) -> Result<BuildPlan, BuildError> {
    let graph = BuildGraph::from_roots(roots)?;
    let waves = graph.waves()?;

    Ok(
      waves
        .into_iter()
        .map(|wave| {
          wave
            .into_iter()
            .filter_map(|fp| graph.derivation(&fp))
            .map(|drv| PlannedDerivation {
              name: drv.name().to_string(),
              fingerprint: drv.fingerprint().clone(),
              cached: self.cache.get(drv).is_some(),
            })
            .collect()
        })
        .collect(),
    )
  }

  /// Build `roots` and everything they depend on.
  ///
  /// Individual derivation failures are reported in the returned
  /// [`BuildReport`]; the call itself only fails if the request cannot be
  /// planned.
  pub async fn build(&self, roots: &[Arc<Derivation>], cancel: &CancelToken) -> Result<BuildReport, BuildError> {
    let graph = BuildGraph::from_roots(roots)?;
    let order = graph.topological()?;

    info!(
      derivations = graph.len(),
      roots = graph.roots().len(),
      max_jobs = self.config.max_jobs,
      "starting build"
    );

    let mut report = BuildReport {
      records: BTreeMap::new(),
      roots: graph.roots().to_vec(),
    };

    // Pending derivations and how many of their inputs have not succeeded yet
    let mut waiting: HashMap<Fingerprint, usize> = HashMap::new();
    let mut ready: VecDeque<Fingerprint> = VecDeque::new();
    for fp in &order {
      let deps = graph.dependencies(fp).len();
      if deps == 0 {
        ready.push_back(fp.clone());
      }
      waiting.insert(fp.clone(), deps);
    }

    let semaphore = Arc::new(Semaphore::new(self.config.max_jobs.max(1)));
    let halt = CancelToken::new();
    let mut tasks = JoinSet::new();
    let mut scheduled: HashMap<Id, Fingerprint> = HashMap::new();

    loop {
      while let Some(fp) = ready.pop_front() {
        if report.records.contains_key(&fp) {
          continue;
        }
        let Some(drv) = graph.derivation(&fp).cloned() else {
          continue;
        };

        if cancel.is_cancelled() || halt.is_cancelled() {
          warn!(name = %drv.name(), "build cancelled before start");
          report.records.insert(fp, record(&drv, DerivationStatus::Cancelled));
          continue;
        }

        if let Some(outputs) = self.cache.fetch(&drv).await {
          debug!(name = %drv.name(), fingerprint = %fp.short(), "using cached outputs");
          report
            .records
            .insert(fp.clone(), record(&drv, DerivationStatus::Succeeded { outputs, cached: true }));
          release_dependents(&graph, &fp, &report, &mut waiting, &mut ready);
          continue;
        }

        let inputs = drv
          .inputs()
          .iter()
          .filter_map(|input| report.get(input.fingerprint()))
          .filter_map(|r| r.status.outputs().cloned())
          .collect();

        debug!(name = %drv.name(), fingerprint = %fp.short(), "scheduled");
        let job = Job {
          runner: self.runner.clone(),
          cache: self.cache.clone(),
          config: self.config.clone(),
          semaphore: semaphore.clone(),
          cancel: cancel.clone(),
          halt: halt.clone(),
          drv,
          inputs,
        };
        let handle = tasks.spawn(job.run());
        scheduled.insert(handle.id(), fp);
      }

      let Some(joined) = tasks.join_next_with_id().await else {
        break;
      };
      let (id, outcome) = match joined {
        Ok((id, result)) => (id, Ok(result)),
        Err(e) => (e.id(), Err(e)),
      };
      let Some(fp) = scheduled.remove(&id) else {
        continue;
      };
      let Some(drv) = graph.derivation(&fp).cloned() else {
        continue;
      };
      let result = outcome.unwrap_or_else(|e| {
        Err(BuildError::Io {
          name: drv.name().to_string(),
          message: format!("build task failed: {}", e),
        })
      });

      match result {
        Ok(Realized { outputs, cached }) => {
          info!(name = %drv.name(), fingerprint = %fp.short(), cached, "derivation succeeded");
          report
            .records
            .insert(fp.clone(), record(&drv, DerivationStatus::Succeeded { outputs, cached }));
          release_dependents(&graph, &fp, &report, &mut waiting, &mut ready);
        }
        Err(BuildError::Cancelled { .. }) => {
          warn!(name = %drv.name(), "derivation cancelled");
          report.records.insert(fp, record(&drv, DerivationStatus::Cancelled));
        }
        Err(err) => {
          error!(name = %drv.name(), error = %err, "derivation failed");
          fail_with_dependents(&graph, &mut report, fp, err);
          if !self.config.keep_going {
            halt.cancel();
          }
        }
      }
    }

    // Whatever is left waited on an input that was cancelled
    for fp in order {
      if !report.records.contains_key(&fp)
        && let Some(drv) = graph.derivation(&fp)
      {
        report.records.insert(fp, record(drv, DerivationStatus::Cancelled));
      }
    }

    info!(
      built = report.built(),
      cached = report.cached(),
      failed = report.failed(),
      cancelled = report.cancelled(),
      "build complete"
    );

    Ok(report)
  }
}

fn record(drv: &Derivation, status: DerivationStatus) -> BuildRecord {
  BuildRecord {
    name: drv.name().to_string(),
    status,
  }
}

/// Count a success against each dependent and queue the ones now ready.
fn release_dependents(
  graph: &BuildGraph,
  fp: &Fingerprint,
  report: &BuildReport,
  waiting: &mut HashMap<Fingerprint, usize>,
  ready: &mut VecDeque<Fingerprint>,
) {
  for dependent in graph.dependents(fp) {
    let Some(count) = waiting.get_mut(&dependent) else {
      continue;
    };
    *count = count.saturating_sub(1);
    if *count == 0 && !report.records.contains_key(&dependent) {
      ready.push_back(dependent);
    }
  }
}

/// Record a failure and fail every transitive dependent that has not
/// finished, each naming the input that failed under it.
fn fail_with_dependents(graph: &BuildGraph, report: &mut BuildReport, fp: Fingerprint, err: BuildError) {
  let mut stack = vec![(fp, err)];
  while let Some((fp, err)) = stack.pop() {
    if report.records.contains_key(&fp) {
      continue;
    }
    let Some(drv) = graph.derivation(&fp) else {
      continue;
    };

    let cause = Arc::new(err.clone());
    for dependent in graph.dependents(&fp) {
      if report.records.contains_key(&dependent) {
        continue;
      }
      let Some(dependent_drv) = graph.derivation(&dependent) else {
        continue;
      };
      warn!(
        name = %dependent_drv.name(),
        dependency = %drv.name(),
        "not scheduling derivation: dependency failed"
      );
      stack.push((
        dependent,
        BuildError::DependencyFailed {
          name: dependent_drv.name().to_string(),
          dependency: drv.name().to_string(),
          cause: cause.clone(),
        },
      ));
    }

    report.records.insert(fp, record(drv, DerivationStatus::Failed(err)));
  }
}

struct Realized {
  outputs: BuildOutputs,
  cached: bool,
}

/// One scheduled derivation, owned by its worker task.
struct Job<R> {
  runner: Arc<R>,
  cache: Arc<BuildCache>,
  config: Arc<ExecuteConfig>,
  semaphore: Arc<Semaphore>,
  cancel: CancelToken,
  /// Set when a failure stops a build that does not keep going.
  halt: CancelToken,
  drv: Arc<Derivation>,
  inputs: Vec<BuildOutputs>,
}

impl<R: PhaseRunner> Job<R> {
  async fn run(self) -> Result<Realized, BuildError> {
    let name = self.drv.name().to_string();

    let _permit = tokio::select! {
      biased;
      _ = self.cancel.cancelled() => return Err(BuildError::Cancelled { name }),
      permit = self.semaphore.acquire() => permit.map_err(|_| BuildError::Cancelled { name: name.clone() })?,
    };
    let _claim = tokio::select! {
      biased;
      _ = self.cancel.cancelled() => return Err(BuildError::Cancelled { name }),
      claim = self.cache.claim(self.drv.fingerprint()) => claim,
    };
    if self.cancel.is_cancelled() || self.halt.is_cancelled() {
      return Err(BuildError::Cancelled { name });
    }

    // Another request may have built the same fingerprint meanwhile
    if let Some(outputs) = self.cache.fetch(&self.drv).await {
      return Ok(Realized { outputs, cached: true });
    }

    debug!(name = %name, fingerprint = %self.drv.fingerprint().short(), "running");
    let outputs = self.cache.store().prepare(&self.drv).await?;
    let work_dir = outputs.store_path.join(WORK_DIR);
    let tmp_dir = outputs.store_path.join(TMP_DIR);

    for phase in self.drv.phases() {
      if phase.name.phase == StdPhase::Check && !self.runs_check() {
        debug!(name = %name, phase = %phase.name, policy = %self.config.check_policy, "skipping check phase");
        continue;
      }

      let attempts = if phase.retryable {
        1 + self.config.retry_attempts
      } else {
        1
      };
      let mut attempt = 1;
      loop {
        let ctx = PhaseContext {
          derivation: &self.drv,
          phase,
          outputs: &outputs,
          work_dir: &work_dir,
          tmp_dir: &tmp_dir,
          inputs: &self.inputs,
        };

        debug!(name = %name, phase = %phase.name, attempt, "running phase");
        let exit = tokio::select! {
          biased;
          _ = self.cancel.cancelled() => return Err(BuildError::Cancelled { name }),
          exit = self.runner.run(&ctx) => exit?,
        };

        if exit.is_success() {
          break;
        }
        if attempt < attempts {
          warn!(name = %name, phase = %phase.name, attempt, code = ?exit.code, "phase failed, retrying");
          attempt += 1;
          continue;
        }
        return Err(BuildError::PhaseFailure {
          name,
          phase: phase.name,
          code: exit.code,
        });
      }
    }

    self.cache.store().commit(&self.drv, &outputs).await?;
    let outputs = self.cache.insert(self.drv.fingerprint().clone(), outputs);

    Ok(Realized { outputs, cached: false })
  }

  fn runs_check(&self) -> bool {
    match self.config.check_policy {
      CheckPolicy::Always => true,
      CheckPolicy::Never => false,
      CheckPolicy::NativeOnly => self.drv.is_native(),
    }
  }
}
