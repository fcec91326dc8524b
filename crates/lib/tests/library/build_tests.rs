use std::sync::Arc;

use pkgfix_lib::execute::BuildError;
use pkgfix_lib::{CancelToken, Composer, Derivation, DerivationStatus, PhaseName, Registry, StdPhase};

use super::common::{TestStore, arc, package};

/// Derivation whose build phase appends one line to `log` per run.
fn logged(name: &str, store: &TestStore, inputs: &[&Arc<Derivation>]) -> Arc<Derivation> {
  let log = store.log_path(name);
  let mut builder = Derivation::builder(name);
  for input in inputs {
    builder = builder.input((*input).clone());
  }
  arc(
    builder
      .run(StdPhase::Build, format!("echo {} >> '{}'", name, log.display()))
      .run(StdPhase::Install, format!("echo {} > \"$out/name\"", name))
      .build()
      .unwrap(),
  )
}

#[tokio::test]
async fn failing_input_fails_its_dependents_without_running_them() {
  let store = TestStore::new();
  let bar = arc(Derivation::builder("bar").run(StdPhase::Build, "exit 1").build().unwrap());
  let foo = logged("foo", &store, &[&bar]);

  let report = store
    .orchestrator()
    .build(&[foo.clone()], &CancelToken::new())
    .await
    .unwrap();

  let bar_error = BuildError::PhaseFailure {
    name: "bar".to_string(),
    phase: PhaseName::main(StdPhase::Build),
    code: Some(1),
  };
  assert_eq!(report.status("bar"), Some(&DerivationStatus::Failed(bar_error.clone())));
  assert_eq!(
    report.status("foo"),
    Some(&DerivationStatus::Failed(BuildError::DependencyFailed {
      name: "foo".to_string(),
      dependency: "bar".to_string(),
      cause: Arc::new(bar_error),
    }))
  );
  assert_eq!(store.log_lines("foo"), 0);
  assert!(!report.is_success());
}

#[tokio::test]
async fn identical_fingerprints_build_once() {
  let store = TestStore::new();
  let first = logged("zlib", &store, &[]);
  let second = logged("zlib", &store, &[]);
  assert_eq!(first.fingerprint(), second.fingerprint());

  let orchestrator = store.orchestrator();
  let cancel = CancelToken::new();
  let one = orchestrator.build(&[first], &cancel).await.unwrap();
  let two = orchestrator.build(&[second], &cancel).await.unwrap();

  assert_eq!(store.log_lines("zlib"), 1);
  assert_eq!(one.built(), 1);
  assert_eq!(two.cached(), 1);
  assert_eq!(one.outputs("zlib"), two.outputs("zlib"));
}

#[tokio::test]
async fn concurrent_requests_share_work() {
  let store = TestStore::new();
  let zlib = logged("zlib", &store, &[]);
  let curl = logged("curl", &store, &[&zlib]);
  let git = logged("git", &store, &[&zlib]);

  let orchestrator = store.orchestrator();
  let cancel = CancelToken::new();
  let (curl_roots, git_roots) = ([curl], [git]);
  let (a, b) = tokio::join!(
    orchestrator.build(&curl_roots, &cancel),
    orchestrator.build(&git_roots, &cancel)
  );

  assert!(a.unwrap().is_success());
  assert!(b.unwrap().is_success());
  assert_eq!(store.log_lines("zlib"), 1);
  assert_eq!(store.log_lines("curl"), 1);
  assert_eq!(store.log_lines("git"), 1);
}

#[tokio::test]
async fn store_entries_survive_a_restart() {
  let store = TestStore::new();
  let zlib = logged("zlib", &store, &[]);

  let report = store.orchestrator().build(&[zlib.clone()], &CancelToken::new()).await.unwrap();
  assert_eq!(report.built(), 1);

  let report = store.orchestrator().build(&[zlib], &CancelToken::new()).await.unwrap();
  assert_eq!(report.cached(), 1);
  assert_eq!(store.log_lines("zlib"), 1);
}

#[tokio::test]
async fn composed_packages_build_end_to_end() {
  let mut registry = Registry::new();
  registry
    .register_all([
      package("zlib", &[]),
      package("openssl", &["zlib"]),
      package("curl", &["openssl", "zlib"]),
    ])
    .unwrap();
  let env = Composer::compose("native", &registry);
  let curl = env.derivation("curl").unwrap();

  let store = TestStore::new();
  let orchestrator = store.orchestrator();
  let plan = orchestrator.plan(&[curl.clone()]).unwrap();
  let names: Vec<Vec<&str>> = plan
    .iter()
    .map(|wave| wave.iter().map(|p| p.name.as_str()).collect())
    .collect();
  assert_eq!(names, [vec!["zlib"], vec!["openssl"], vec!["curl"]]);

  let report = orchestrator.build(&[curl], &CancelToken::new()).await.unwrap();

  assert!(report.is_success());
  assert_eq!(report.len(), 3);
  for name in ["zlib", "openssl", "curl"] {
    let out = report.outputs(name).and_then(|o| o.get("out")).unwrap();
    let written = std::fs::read_to_string(out.join("name")).unwrap();
    assert_eq!(written.trim(), name);
  }
}
