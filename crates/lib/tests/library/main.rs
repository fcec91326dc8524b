#[cfg(unix)]
mod build_tests;
mod common;
mod compose_tests;
mod stage_tests;
