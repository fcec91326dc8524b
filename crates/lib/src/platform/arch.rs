use std::fmt;
use std::str::FromStr;

use super::PlatformError;

/// CPU architectures a platform can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Arch {
  X86_64,
  Aarch64,
  Armv7l,
  I686,
  Riscv64,
  Wasm32,
}

impl Arch {
  /// Detect the architecture this process runs on.
  pub fn current() -> Option<Self> {
    std::env::consts::ARCH.parse().ok()
  }

  /// Returns the lowercase identifier used in platform strings.
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::X86_64 => "x86_64",
      Self::Aarch64 => "aarch64",
      Self::Armv7l => "armv7l",
      Self::I686 => "i686",
      Self::Riscv64 => "riscv64",
      Self::Wasm32 => "wasm32",
    }
  }
}

impl FromStr for Arch {
  type Err = PlatformError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "x86_64" => Ok(Self::X86_64),
      "aarch64" | "arm64" => Ok(Self::Aarch64),
      "armv7l" | "arm" => Ok(Self::Armv7l),
      "i686" | "x86" => Ok(Self::I686),
      "riscv64" => Ok(Self::Riscv64),
      "wasm32" => Ok(Self::Wasm32),
      other => Err(PlatformError::UnknownArch(other.to_string())),
    }
  }
}

impl fmt::Display for Arch {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.as_str())
  }
}
