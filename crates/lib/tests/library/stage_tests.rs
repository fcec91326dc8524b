use pkgfix_lib::consts::{BUILD_PACKAGES, HOST_PLATFORM, TARGET_PLATFORM};
use pkgfix_lib::{Component, ComposeError, Descriptor, Overlay, PlatformTriple, Registry, Role, StageGraph, StageSpec};

use super::common::platform;

/// A compiler that runs on the stage's host and emits code for its target.
fn gcc() -> Descriptor {
  Descriptor::builder("gcc")
    .role(Role::Tool)
    .requires_all([HOST_PLATFORM, TARGET_PLATFORM])
    .build(|inputs| {
      let host = inputs.value(HOST_PLATFORM)?;
      let target = inputs.value(TARGET_PLATFORM)?;
      Ok(Component::from(format!(
        "gcc {} -> {}",
        host.as_str().unwrap_or("?"),
        target.as_str().unwrap_or("?")
      )))
    })
}

/// A library compiled with whatever compiler the build platform provides.
fn hello() -> Descriptor {
  Descriptor::builder("hello")
    .requires(BUILD_PACKAGES)
    .build(|inputs| {
      let tools = inputs.scope(BUILD_PACKAGES)?;
      let cc = tools.get("gcc")?;
      Ok(Component::from(format!("hello built with {}", cc.as_value().and_then(|v| v.as_str()).unwrap_or("?"))))
    })
}

fn registry() -> Registry {
  let mut registry = Registry::new();
  registry.register_all([gcc(), hello()]).unwrap();
  registry
}

fn cross_chain() -> Vec<StageSpec> {
  let a = platform("x86_64-linux");
  let b = platform("aarch64-linux");
  vec![
    StageSpec::new("stage1", PlatformTriple::new(a, a, a)),
    StageSpec::new("stage2", PlatformTriple::new(a, a, b)),
    StageSpec::new("stage3", PlatformTriple::new(a, b, b)),
  ]
}

#[test]
fn final_stage_builds_with_the_previous_stage_tools() {
  let graph = StageGraph::build(&registry(), cross_chain()).unwrap();
  let stages = graph.stages();
  let last = graph.final_stage();

  assert_eq!(graph.len(), 3);
  assert_eq!(last.label(), "stage3");
  assert_eq!(last.depends_on(), Some(1));
  assert!(last.build_tools().same_as(&stages[1].env().view(Role::Tool)));
  assert!(!last.build_tools().same_as(&stages[0].env().view(Role::Tool)));
  assert!(!last.build_tools().same_as(&last.env().view(Role::Tool)));
}

#[test]
fn cross_compiler_comes_from_the_previous_stage() {
  let graph = StageGraph::build(&registry(), cross_chain()).unwrap();

  let hello = graph.final_stage().env().get("hello").unwrap();
  assert_eq!(hello, Component::from("hello built with gcc x86_64-linux -> aarch64-linux"));

  // The final stage's own compiler runs on the target machine
  let native_gcc = graph.final_stage().env().get("gcc").unwrap();
  assert_eq!(native_gcc, Component::from("gcc aarch64-linux -> aarch64-linux"));

  let stage2_hello = graph.stage("stage2").unwrap().env().get("hello").unwrap();
  assert_eq!(stage2_hello, Component::from("hello built with gcc x86_64-linux -> x86_64-linux"));
}

#[test]
fn first_stage_has_no_build_packages() {
  let graph = StageGraph::build(&registry(), cross_chain()).unwrap();
  let first = &graph.stages()[0];

  assert_eq!(first.depends_on(), None);
  let err = first.env().get("hello").unwrap_err();
  assert!(matches!(err, ComposeError::MissingInput { input, .. } if input == BUILD_PACKAGES));
}

#[test]
fn role_views_partition_a_stage() {
  let graph = StageGraph::build(&registry(), cross_chain()).unwrap();
  let last = graph.final_stage();

  assert_eq!(last.build_tools().names(), ["gcc"]);
  assert!(last.host_libraries().contains("hello"));
  assert!(!last.host_libraries().contains("gcc"));
  assert!(last.target_artifacts().names().is_empty());
}

#[test]
fn stage_overlays_apply_to_that_stage_only() {
  let mut specs = cross_chain();
  specs[1] = specs[1]
    .clone()
    .overlay(Overlay::new("patched-gcc").define("gcc", |scope| {
      let prev = scope.prev("gcc")?;
      Ok(Component::from(format!("{} (patched)", prev.as_value().and_then(|v| v.as_str()).unwrap_or("?"))))
    }));
  let graph = StageGraph::build(&registry(), specs).unwrap();

  let hello = graph.final_stage().env().get("hello").unwrap();
  assert_eq!(
    hello,
    Component::from("hello built with gcc x86_64-linux -> aarch64-linux (patched)")
  );
  assert_eq!(graph.stages()[1].env().role_of("gcc"), Some(Role::Tool));
  assert_eq!(
    graph.stages()[0].env().get("gcc").unwrap(),
    Component::from("gcc x86_64-linux -> x86_64-linux")
  );
}

#[test]
fn mismatched_build_platform_is_rejected() {
  let a = platform("x86_64-linux");
  let b = platform("aarch64-linux");
  let specs = vec![
    StageSpec::new("native", PlatformTriple::native(a)),
    StageSpec::new("broken", PlatformTriple::new(b, b, b)),
  ];

  let err = StageGraph::build(&registry(), specs).unwrap_err();

  assert_eq!(
    err,
    ComposeError::PlatformMismatch {
      stage: "broken".to_string(),
      expected: a,
      found: b,
    }
  );
}
