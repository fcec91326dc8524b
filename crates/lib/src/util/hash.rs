//! Content hashing for derivation fingerprints and store verification.
//!
//! - [`Fingerprint`]: identity of a derivation (name, input fingerprints, phases)
//! - [`Fingerprintable`]: SHA-256 over the canonical JSON encoding of a value
//! - [`hash_tree()`]: deterministic hash of a realized output directory

use std::fs;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::consts::FINGERPRINT_PREFIX_LEN;

/// Content-based identity of a derivation.
///
/// A lowercase 64-character hex SHA-256. Two derivations with the same
/// fingerprint are interchangeable: the orchestrator builds only one of them.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub String);

impl Fingerprint {
  /// Truncated form used in store directory names.
  pub fn short(&self) -> &str {
    let end = self.0.len().min(FINGERPRINT_PREFIX_LEN);
    &self.0[..end]
  }
}

impl std::fmt::Display for Fingerprint {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Anything whose serialized form defines its identity.
///
/// Field order of the serialized struct is significant, so implementors
/// should only contain ordered collections (`Vec`, `BTreeMap`, `BTreeSet`).
pub trait Fingerprintable: Serialize {
  fn fingerprint(&self) -> Result<Fingerprint, serde_json::Error> {
    let serialized = serde_json::to_vec(self)?;
    Ok(Fingerprint(hex::encode(Sha256::digest(&serialized))))
  }
}

/// Error while hashing a directory tree.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TreeHashError {
  #[error("failed to walk {path}: {message}")]
  Walk { path: String, message: String },

  #[error("failed to read {path}: {message}")]
  Read { path: String, message: String },
}

/// Hash the contents of a directory tree.
///
/// Covers relative paths, file contents and symlink targets; ignores
/// timestamps and permissions. Entries whose file name is in `exclude`
/// are skipped along with everything below them.
pub fn hash_tree(root: &Path, exclude: &[&str]) -> Result<String, TreeHashError> {
  let walker = WalkDir::new(root)
    .sort_by_file_name()
    .into_iter()
    .filter_entry(|e| e.file_name().to_str().is_none_or(|name| !exclude.contains(&name)));

  let mut hasher = Sha256::new();

  for entry in walker {
    let entry = entry.map_err(|e| TreeHashError::Walk {
      path: root.display().to_string(),
      message: e.to_string(),
    })?;

    let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
    if rel.as_os_str().is_empty() {
      continue;
    }
    let rel = rel.to_string_lossy();

    let file_type = entry.file_type();
    let line = if file_type.is_file() {
      format!("F:{}:{}", rel, hash_file(entry.path())?)
    } else if file_type.is_dir() {
      format!("D:{}", rel)
    } else if file_type.is_symlink() {
      let target = fs::read_link(entry.path()).map_err(|e| TreeHashError::Read {
        path: entry.path().display().to_string(),
        message: e.to_string(),
      })?;
      format!("L:{}:{}", rel, hash_bytes(target.to_string_lossy().as_bytes()))
    } else {
      continue;
    };

    hasher.update(line.as_bytes());
    hasher.update(b"\n");
  }

  Ok(hex::encode(hasher.finalize()))
}

fn hash_file(path: &Path) -> Result<String, TreeHashError> {
  let read_err = |e: std::io::Error| TreeHashError::Read {
    path: path.display().to_string(),
    message: e.to_string(),
  };

  let mut file = fs::File::open(path).map_err(read_err)?;
  let mut hasher = Sha256::new();
  let mut buffer = [0u8; 8192];

  loop {
    let n = file.read(&mut buffer).map_err(read_err)?;
    if n == 0 {
      break;
    }
    hasher.update(&buffer[..n]);
  }

  Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 of arbitrary bytes as lowercase hex.
pub fn hash_bytes(data: &[u8]) -> String {
  hex::encode(Sha256::digest(data))
}
