//! Shared test helpers for library integration tests.

use std::path::PathBuf;
use std::sync::Arc;

use pkgfix_lib::execute::{ExecuteConfig, Orchestrator, ShellRunner};
use pkgfix_lib::{Component, Derivation, Descriptor, Platform, StdPhase};
use tempfile::TempDir;

pub fn platform(s: &str) -> Platform {
  s.parse().unwrap()
}

/// Descriptor producing a constant number.
pub fn number(name: &str, n: i64) -> Descriptor {
  Descriptor::builder(name).build(move |_| Ok(Component::from(n)))
}

pub fn int(component: Component) -> i64 {
  component.as_value().and_then(|v| v.as_i64()).unwrap_or(i64::MIN)
}

/// Descriptor producing a derivation that depends on every declared input.
///
/// The install phase writes the package name into `$out/name`.
pub fn package(name: &str, inputs: &[&str]) -> Descriptor {
  let declared: Vec<String> = inputs.iter().map(|s| s.to_string()).collect();
  let pkg = name.to_string();
  Descriptor::builder(name)
    .requires_all(declared.clone())
    .build(move |inputs| {
      let mut builder = Derivation::builder(pkg.clone());
      for input in &declared {
        builder = builder.input(inputs.derivation(input)?);
      }
      let drv = builder
        .run(StdPhase::Build, format!("echo building {}", pkg))
        .run(StdPhase::Install, format!("echo {} > \"$out/name\"", pkg))
        .build()?;
      Ok(Component::from(drv))
    })
}

/// A store in a temporary directory.
pub struct TestStore {
  pub temp: TempDir,
}

impl TestStore {
  pub fn new() -> Self {
    Self {
      temp: TempDir::new().unwrap(),
    }
  }

  pub fn root(&self) -> PathBuf {
    self.temp.path().join("store")
  }

  pub fn config(&self) -> ExecuteConfig {
    ExecuteConfig::default().with_store_root(self.root()).with_max_jobs(4)
  }

  pub fn orchestrator(&self) -> Orchestrator<ShellRunner> {
    let config = self.config();
    Orchestrator::new(ShellRunner::from_config(&config), config)
  }

  /// File outside the store that phases can append to, to count runs.
  pub fn log_path(&self, name: &str) -> PathBuf {
    self.temp.path().join(format!("{}.log", name))
  }

  pub fn log_lines(&self, name: &str) -> usize {
    std::fs::read_to_string(self.log_path(name))
      .map(|s| s.lines().count())
      .unwrap_or(0)
  }
}

pub fn arc(drv: Derivation) -> Arc<Derivation> {
  Arc::new(drv)
}
