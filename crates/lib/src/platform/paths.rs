//! Default filesystem locations.

use std::path::PathBuf;

use crate::consts::APP_NAME;

/// Environment variable overriding the store root.
pub const STORE_ENV: &str = "PKGFIX_STORE";

/// Returns the directory for cache files for the application.
///
/// Follows `XDG_CACHE_HOME`, then `$HOME/.cache`, then the system temp dir.
#[cfg(not(windows))]
pub fn cache_dir() -> PathBuf {
  let base = std::env::var("XDG_CACHE_HOME")
    .map(PathBuf::from)
    .or_else(|_| std::env::var("HOME").map(|home| PathBuf::from(home).join(".cache")))
    .unwrap_or_else(|_| std::env::temp_dir());
  base.join(APP_NAME)
}

/// Returns the directory for cache files for the application
#[cfg(windows)]
pub fn cache_dir() -> PathBuf {
  std::env::var("LOCALAPPDATA")
    .map(PathBuf::from)
    .unwrap_or_else(|_| std::env::temp_dir())
    .join(APP_NAME)
    .join("Cache")
}

/// Root of the content-addressed output store.
pub fn store_dir() -> PathBuf {
  match std::env::var(STORE_ENV) {
    Ok(path) if !path.is_empty() => PathBuf::from(path),
    _ => cache_dir().join("store"),
  }
}
