//! Output store and fingerprint cache.
//!
//! Every derivation owns one store entry, `<root>/<short fingerprint>-<name>`,
//! with one directory per declared output. A completion marker is written
//! after the last phase succeeds; an entry without a valid marker is treated
//! as an interrupted build and wiped before the next attempt.
//!
//! [`BuildCache`] sits in front of the store and is the one piece of state
//! shared by concurrent workers. Insertion is insert-if-absent keyed by
//! fingerprint: the first result recorded for a fingerprint is the one every
//! later lookup sees. Workers building the same fingerprint serialize on a
//! per-fingerprint claim, so the store entry is only ever written by one.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::consts::{COMPLETE_MARKER, TMP_DIR, WORK_DIR};
use crate::derivation::Derivation;
use crate::util::hash::{Fingerprint, hash_tree};

use super::types::{BuildError, BuildOutputs};

/// Entries skipped when hashing a store entry: the marker itself (written
/// after the hash) and the scratch directories.
const HASH_EXCLUSIONS: &[&str] = &[COMPLETE_MARKER, WORK_DIR, TMP_DIR];

/// Marker file content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreMarker {
  /// Marker format version.
  pub version: u32,
  pub name: String,
  pub fingerprint: Fingerprint,
  pub outputs: Vec<String>,
  /// SHA-256 of the entry's contents, marker and scratch excluded.
  pub output_hash: String,
}

/// Content-addressed output store on disk.
#[derive(Debug, Clone)]
pub struct Store {
  root: PathBuf,
}

impl Store {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  /// Store entry for a derivation.
  pub fn entry_path(&self, drv: &Derivation) -> PathBuf {
    self.root.join(format!("{}-{}", drv.fingerprint().short(), drv.name()))
  }

  /// Output locations for a derivation, whether built or not.
  pub fn outputs_for(&self, drv: &Derivation) -> BuildOutputs {
    let store_path = self.entry_path(drv);
    let outputs = drv
      .outputs()
      .iter()
      .map(|name| (name.clone(), store_path.join(name)))
      .collect::<BTreeMap<_, _>>();
    BuildOutputs { store_path, outputs }
  }

  /// Outputs of a completed, unmodified entry.
  ///
  /// Returns `None` when the entry is missing, incomplete, belongs to another
  /// fingerprint, or its contents no longer match the marker.
  pub fn lookup(&self, drv: &Derivation) -> Option<BuildOutputs> {
    let outputs = self.outputs_for(drv);
    let marker = match read_marker(&outputs.store_path) {
      Ok(Some(marker)) => marker,
      Ok(None) => return None,
      Err(e) => {
        debug!(path = ?outputs.store_path, error = %e, "invalid marker, ignoring entry");
        return None;
      }
    };

    if &marker.fingerprint != drv.fingerprint() {
      warn!(path = ?outputs.store_path, name = %drv.name(), "store entry belongs to another fingerprint");
      return None;
    }

    match hash_tree(&outputs.store_path, HASH_EXCLUSIONS) {
      Ok(hash) if hash == marker.output_hash => Some(outputs),
      Ok(hash) => {
        warn!(
          path = ?outputs.store_path,
          expected = %marker.output_hash,
          actual = %hash,
          "store entry modified, will rebuild"
        );
        None
      }
      Err(e) => {
        warn!(path = ?outputs.store_path, error = %e, "failed to hash store entry, will rebuild");
        None
      }
    }
  }

  /// Create a fresh entry with empty output and scratch directories,
  /// removing anything left by an interrupted build.
  pub async fn prepare(&self, drv: &Derivation) -> Result<BuildOutputs, BuildError> {
    let outputs = self.outputs_for(drv);
    let store_path = &outputs.store_path;

    if fs::try_exists(store_path).await.unwrap_or(false) {
      debug!(path = ?store_path, "removing incomplete store entry");
      fs::remove_dir_all(store_path).await.map_err(|e| store_error(store_path, e))?;
    }

    for dir in outputs.outputs.values() {
      fs::create_dir_all(dir).await.map_err(|e| store_error(dir, e))?;
    }
    for scratch in [WORK_DIR, TMP_DIR] {
      let dir = store_path.join(scratch);
      fs::create_dir_all(&dir).await.map_err(|e| store_error(&dir, e))?;
    }

    Ok(outputs)
  }

  /// Remove scratch directories and write the completion marker.
  pub async fn commit(&self, drv: &Derivation, outputs: &BuildOutputs) -> Result<(), BuildError> {
    let store_path = &outputs.store_path;
    for scratch in [WORK_DIR, TMP_DIR] {
      let dir = store_path.join(scratch);
      if let Err(e) = fs::remove_dir_all(&dir).await {
        debug!(path = ?dir, error = %e, "failed to remove scratch directory");
      }
    }

    let output_hash = hash_tree(store_path, HASH_EXCLUSIONS).map_err(|e| BuildError::Store {
      path: store_path.display().to_string(),
      message: e.to_string(),
    })?;

    let marker = StoreMarker {
      version: 1,
      name: drv.name().to_string(),
      fingerprint: drv.fingerprint().clone(),
      outputs: drv.outputs().iter().cloned().collect(),
      output_hash,
    };
    let content = serde_json::to_string(&marker).map_err(|e| BuildError::Store {
      path: store_path.display().to_string(),
      message: e.to_string(),
    })?;

    let marker_path = store_path.join(COMPLETE_MARKER);
    fs::write(&marker_path, format!("{}\n", content))
      .await
      .map_err(|e| store_error(&marker_path, e))
  }
}

/// Read a store entry's completion marker.
///
/// Returns `None` if the marker doesn't exist.
pub fn read_marker(store_path: &Path) -> Result<Option<StoreMarker>, BuildError> {
  let marker_path = store_path.join(COMPLETE_MARKER);
  if !marker_path.exists() {
    return Ok(None);
  }

  let content = std::fs::read_to_string(&marker_path).map_err(|e| store_error(&marker_path, e))?;
  let marker = serde_json::from_str(&content).map_err(|e| BuildError::Store {
    path: marker_path.display().to_string(),
    message: e.to_string(),
  })?;
  Ok(Some(marker))
}

fn store_error(path: &Path, e: std::io::Error) -> BuildError {
  BuildError::Store {
    path: path.display().to_string(),
    message: e.to_string(),
  }
}

/// Fingerprint-keyed results, shared by every worker of an orchestrator.
#[derive(Debug)]
pub struct BuildCache {
  store: Store,
  entries: Mutex<HashMap<Fingerprint, BuildOutputs>>,
  claims: Mutex<HashMap<Fingerprint, Arc<AsyncMutex<()>>>>,
}

impl BuildCache {
  pub fn new(store: Store) -> Self {
    Self {
      store,
      entries: Mutex::new(HashMap::new()),
      claims: Mutex::new(HashMap::new()),
    }
  }

  pub fn store(&self) -> &Store {
    &self.store
  }

  /// Cached outputs for a derivation, from memory or from a completed store
  /// entry left by an earlier run.
  pub fn get(&self, drv: &Derivation) -> Option<BuildOutputs> {
    if let Some(outputs) = self.lock().get(drv.fingerprint()) {
      return Some(outputs.clone());
    }

    let outputs = self.store.lookup(drv)?;
    debug!(name = %drv.name(), fingerprint = %drv.fingerprint().short(), "reusing store entry");
    Some(self.insert(drv.fingerprint().clone(), outputs))
  }

  /// Like [`BuildCache::get`], with the store entry verified on the blocking
  /// pool. Used from the scheduler, where hashing a large entry inline would
  /// stall other tasks.
  pub async fn fetch(&self, drv: &Arc<Derivation>) -> Option<BuildOutputs> {
    let cached = self.lock().get(drv.fingerprint()).cloned();
    if cached.is_some() {
      return cached;
    }

    let store = self.store.clone();
    let target = drv.clone();
    let outputs = match tokio::task::spawn_blocking(move || store.lookup(&target)).await {
      Ok(found) => found?,
      Err(e) => {
        warn!(name = %drv.name(), error = %e, "store lookup task failed");
        return None;
      }
    };
    debug!(name = %drv.name(), fingerprint = %drv.fingerprint().short(), "reusing store entry");
    Some(self.insert(drv.fingerprint().clone(), outputs))
  }

  /// Record outputs unless the fingerprint already has some. Returns the
  /// outputs now associated with the fingerprint.
  pub fn insert(&self, fingerprint: Fingerprint, outputs: BuildOutputs) -> BuildOutputs {
    self.lock().entry(fingerprint).or_insert(outputs).clone()
  }

  /// Exclusive right to build `fingerprint`, held until the guard drops.
  pub async fn claim(&self, fingerprint: &Fingerprint) -> OwnedMutexGuard<()> {
    let claim = self
      .claims
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .entry(fingerprint.clone())
      .or_default()
      .clone();
    claim.lock_owned().await
  }

  pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
    self.lock().contains_key(fingerprint)
  }

  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.lock().is_empty()
  }

  fn lock(&self) -> MutexGuard<'_, HashMap<Fingerprint, BuildOutputs>> {
    self.entries.lock().unwrap_or_else(PoisonError::into_inner)
  }
}
