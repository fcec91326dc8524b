//! Crate-wide names and constants.

pub const APP_NAME: &str = "pkgfix";

/// Number of fingerprint characters used in store directory names.
pub const FINGERPRINT_PREFIX_LEN: usize = 20;

/// Completion marker written into a store entry after a successful build.
pub const COMPLETE_MARKER: &str = ".pkgfix-complete";

/// Environment entry holding the previous stage's build-platform tools.
pub const BUILD_PACKAGES: &str = "buildPackages";

/// Environment entries exposing a stage's platform triple as strings.
pub const BUILD_PLATFORM: &str = "buildPlatform";
pub const HOST_PLATFORM: &str = "hostPlatform";
pub const TARGET_PLATFORM: &str = "targetPlatform";

/// Output name every derivation has unless it declares its own set.
pub const DEFAULT_OUTPUT: &str = "out";

/// Scratch directories inside a store entry, removed once the build commits.
pub const WORK_DIR: &str = ".build";
pub const TMP_DIR: &str = ".tmp";
