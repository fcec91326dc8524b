use std::collections::BTreeMap;

use pkgfix_lib::compose::Injector;
use pkgfix_lib::{CallSite, Component, ComposeError, Composer, Descriptor, Overlay, Registry};

use super::common::{int, number, package};

#[test]
fn missing_required_input_is_reported_by_name() {
  let descriptor = std::sync::Arc::new(
    Descriptor::builder("d")
      .requires_all(["a", "b"])
      .build(|inputs| inputs.get("a")),
  );
  let mut registry = Registry::new();
  registry.register(number("a", 1)).unwrap();
  let env = Composer::compose("native", &registry);

  let err = Injector::resolve(&descriptor, &env).err().unwrap();

  assert_eq!(
    err,
    ComposeError::MissingInput {
      component: "d".to_string(),
      input: "b".to_string(),
    }
  );
}

#[test]
fn optional_input_falls_back_to_its_default() {
  let mut registry = Registry::new();
  registry
    .register(
      Descriptor::builder("curl")
        .optional("zlib", |env| Ok(Component::from(int(env.get("fallback")?) + 1)))
        .build(|inputs| inputs.get("zlib")),
    )
    .unwrap();
  registry.register(number("fallback", 41)).unwrap();

  let env = Composer::compose("native", &registry);
  assert_eq!(int(env.get("curl").unwrap()), 42);

  // Providing the input wins over the default
  let env = Composer::compose_with("native", &registry, &[Overlay::new("zlib").value("zlib", 7)]);
  assert_eq!(int(env.get("curl").unwrap()), 7);
}

#[test]
fn composing_twice_yields_equal_results() {
  let mut registry = Registry::new();
  registry
    .register_all([
      package("zlib", &[]),
      package("openssl", &["zlib"]),
      package("curl", &["openssl", "zlib"]),
    ])
    .unwrap();
  let overlays = [Overlay::new("versions").value("version", "8.5.0")];

  let first: BTreeMap<String, Component> = Composer::compose_with("native", &registry, &overlays).force_all().unwrap();
  let second = Composer::compose_with("native", &registry, &overlays).force_all().unwrap();

  assert_eq!(first, second);
  let curl = first["curl"].as_derivation().unwrap();
  assert_eq!(curl.inputs().len(), 2);
}

#[test]
fn overlay_order_decides_the_winner() {
  let registry = Registry::new();
  let x1 = Overlay::new("x=1").value("X", 1);
  let x2 = Overlay::new("x=2").value("X", 2);

  let env = Composer::compose_with("native", &registry, &[x1.clone(), x2.clone()]);
  assert_eq!(int(env.get("X").unwrap()), 2);

  let env = Composer::compose_with("native", &registry, &[x2, x1]);
  assert_eq!(int(env.get("X").unwrap()), 1);
}

#[test]
fn final_view_override_resolves_through_a_structural_cycle() {
  // Y is overridden in terms of the final X; X only keeps a lazy reference to Y
  let mut registry = Registry::new();
  registry
    .register(Descriptor::builder("X").requires("Y").build(|inputs| {
      Ok(Component::Attrs(BTreeMap::from([
        ("value".to_string(), Component::from(10)),
        ("companion".to_string(), Component::Lazy(inputs.lazy("Y")?)),
      ])))
    }))
    .unwrap();
  registry.register(number("Y", 0)).unwrap();

  let overlay = Overlay::new("y-from-x").define("Y", |scope| {
    let x = scope.get("X")?;
    let value = x
      .as_attrs()
      .and_then(|attrs| attrs.get("value"))
      .cloned()
      .ok_or_else(|| scope.fail("X has no value"))?;
    Ok(Component::from(int(value) * 2))
  });
  let env = Composer::compose_with("native", &registry, &[overlay]);

  assert_eq!(int(env.get("Y").unwrap()), 20);
  let companion = env.get("X").unwrap().as_attrs().unwrap()["companion"].clone();
  assert_eq!(int(companion.forced().unwrap()), 20);
}

#[test]
fn final_view_override_fails_when_construction_needs_itself() {
  // X's construction directly requires the overridden Y, which requires final X
  let mut registry = Registry::new();
  registry
    .register(Descriptor::builder("X").requires("Y").build(|inputs| {
      let y = int(inputs.get("Y")?);
      Ok(Component::from(y + 1))
    }))
    .unwrap();
  registry.register(number("Y", 0)).unwrap();

  let overlay = Overlay::new("y-from-x").define("Y", |scope| Ok(Component::from(int(scope.get("X")?) * 2)));
  let env = Composer::compose_with("native", &registry, &[overlay]);

  match env.get("X").unwrap_err() {
    ComposeError::EvaluationCycle { name, chain } => {
      assert_eq!(name, "X");
      assert_eq!(chain, ["X", "Y", "X"]);
    }
    other => panic!("expected an evaluation cycle, got {other}"),
  }
}

#[test]
fn prev_view_extends_the_previous_definition() {
  let mut registry = Registry::new();
  registry.register(number("jobs", 1)).unwrap();

  let overlays = [
    Overlay::new("double").define("jobs", |scope| Ok(Component::from(int(scope.prev("jobs")?) * 2))),
    Overlay::new("plus-three").define("jobs", |scope| Ok(Component::from(int(scope.prev("jobs")?) + 3))),
  ];
  let env = Composer::compose_with("native", &registry, &overlays);

  assert_eq!(int(env.get("jobs").unwrap()), 5);
}

#[test]
fn call_sites_pin_inputs() {
  let mut registry = Registry::new();
  registry.register_all([package("openssl", &[]), package("libressl", &[])]).unwrap();

  let curl = package("curl", &["openssl"]);
  let overlay = Overlay::new("curl-libressl").descriptor(CallSite::new(curl).rename("openssl", "libressl"));
  let env = Composer::compose_with("native", &registry, &[overlay]);

  let drv = env.derivation("curl").unwrap();
  assert_eq!(drv.inputs()[0].name(), "libressl");

  let err = Composer::compose_with(
    "native",
    &registry,
    &[Overlay::new("bad").descriptor(CallSite::new(package("wget", &[])).pin("openssl", 1))],
  )
  .get("wget")
  .unwrap_err();
  assert!(matches!(err, ComposeError::UndeclaredInput { input, .. } if input == "openssl"));
}

#[test]
fn duplicate_registration_is_rejected() {
  let mut registry = Registry::new();
  registry.register(number("zlib", 1)).unwrap();

  let err = registry.register(number("zlib", 2)).unwrap_err();

  assert_eq!(err, ComposeError::DuplicateName { name: "zlib".to_string() });
  assert_eq!(registry.len(), 1);
}
