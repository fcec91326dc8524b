//! Platforms and platform triples.
//!
//! A [`Platform`] names where code runs (`"aarch64-darwin"`). A
//! [`PlatformTriple`] identifies one stage of a cross-compilation chain:
//! the machine doing the build, the machine the result runs on, and the
//! machine the result produces code for (only meaningful for compilers).

pub mod arch;
pub mod os;
pub mod paths;

use std::fmt;
use std::str::FromStr;

pub use arch::Arch;
pub use os::Os;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformError {
  #[error("unknown architecture: {0}")]
  UnknownArch(String),

  #[error("unknown operating system: {0}")]
  UnknownOs(String),

  #[error("invalid platform '{0}': expected <arch>-<os>")]
  Malformed(String),
}

/// Platform identifier combining architecture and OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Platform {
  pub arch: Arch,
  pub os: Os,
}

impl Platform {
  pub fn new(arch: Arch, os: Os) -> Self {
    Self { arch, os }
  }

  /// Detect the platform this process runs on.
  ///
  /// Returns `None` if the OS or architecture is not supported.
  pub fn current() -> Option<Self> {
    Some(Self {
      arch: Arch::current()?,
      os: Os::current()?,
    })
  }

  /// Returns the platform string (e.g., "aarch64-darwin").
  pub fn system(&self) -> String {
    format!("{}-{}", self.arch, self.os)
  }
}

impl fmt::Display for Platform {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.system())
  }
}

impl FromStr for Platform {
  type Err = PlatformError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    // Arch names never contain '-', OS names never contain '_'
    let (arch, os) = s.split_once('-').ok_or_else(|| PlatformError::Malformed(s.to_string()))?;
    Ok(Self {
      arch: arch.parse()?,
      os: os.parse()?,
    })
  }
}

impl TryFrom<String> for Platform {
  type Error = PlatformError;

  fn try_from(value: String) -> Result<Self, Self::Error> {
    value.parse()
  }
}

impl From<Platform> for String {
  fn from(value: Platform) -> Self {
    value.system()
  }
}

/// Build/host/target platforms of one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PlatformTriple {
  pub build: Platform,
  pub host: Platform,
  pub target: Platform,
}

impl PlatformTriple {
  pub fn new(build: Platform, host: Platform, target: Platform) -> Self {
    Self { build, host, target }
  }

  /// All three platforms equal: an ordinary native stage.
  pub fn native(platform: Platform) -> Self {
    Self::new(platform, platform, platform)
  }

  /// Parse three platform strings in build, host, target order.
  pub fn parse(build: &str, host: &str, target: &str) -> Result<Self, PlatformError> {
    Ok(Self::new(build.parse()?, host.parse()?, target.parse()?))
  }

  /// True when results can run on the machine that builds them.
  pub fn is_native(&self) -> bool {
    self.build == self.host
  }

  pub fn is_cross(&self) -> bool {
    !self.is_native()
  }
}

impl fmt::Display for PlatformTriple {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "({}, {}, {})", self.build, self.host, self.target)
  }
}
