//! pkgfix-lib: fixed-point package composition and build orchestration.
//!
//! This crate provides the core of a functional package collection:
//! - `Registry`: named package descriptors and the inputs they ask for
//! - `Composer`: lazily builds an environment in terms of itself
//! - `Overlay`: ordered layers that add or override entries
//! - `StageGraph`: chains environments for bootstrapping and cross builds
//! - `Derivation`: buildable units with ordered phases and a fingerprint
//! - `Orchestrator`: builds derivations in dependency order, in parallel

pub mod compose;
pub mod consts;
pub mod derivation;
pub mod execute;
pub mod overlay;
pub mod platform;
pub mod registry;
pub mod stage;
pub mod util;

pub use compose::{CallSite, Component, ComposeError, Composer, Env, Inputs, LazyRef};
pub use derivation::{Derivation, Phase, PhaseAction, PhaseName, PhaseSlot, StdPhase};
pub use execute::{BuildError, BuildReport, CancelToken, DerivationStatus, ExecuteConfig, Orchestrator, ShellRunner};
pub use overlay::Overlay;
pub use platform::{Platform, PlatformTriple};
pub use registry::{Descriptor, Registry, Role};
pub use stage::{Stage, StageGraph, StageSpec};
