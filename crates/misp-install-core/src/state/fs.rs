use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::warn;

use super::{PhaseState, PhaseStateStore, RunManifest};
use crate::error::StateError;
use crate::phase::PhaseId;

const MANIFEST_FILE: &str = "run.json";

/// Filesystem-backed phase state store.
///
/// Layout: `<root>/phases/<phase id>.json` plus `<root>/run.json`, all
/// pretty-printed JSON so operators can inspect them directly.
pub struct FsPhaseStateStore {
    root: PathBuf,
    phases_dir: PathBuf,
}

impl FsPhaseStateStore {
    /// Open a store rooted at `root`, creating its directories.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, StateError> {
        let store = Self::open(root);
        fs::create_dir_all(&store.phases_dir).map_err(|source| StateError::Io {
            path: store.phases_dir.clone(),
            source,
        })?;
        Ok(store)
    }

    /// Open a store without touching the filesystem. A missing directory
    /// reads as empty; directories are created by the first write.
    pub fn open(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        let phases_dir = root.join("phases");
        Self { root, phases_dir }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn phase_path(&self, id: &PhaseId) -> PathBuf {
        self.phases_dir.join(format!("{id}.json"))
    }

    fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    /// Phase ids that have a record file, parsed from file names.
    fn recorded_ids(&self) -> Vec<PhaseId> {
        let entries = match fs::read_dir(&self.phases_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!(dir = %self.phases_dir.display(), error = %e, "Cannot list phase states");
                return Vec::new();
            }
        };

        entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .filter_map(|path| {
                let stem = path.file_stem()?.to_str()?.to_string();
                stem.parse::<PhaseId>().ok()
            })
            .collect()
    }
}

/// Atomic write: write to a temp file in the same directory, then rename.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StateError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let io_err = |source| StateError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut body = serde_json::to_vec_pretty(value)?;
    body.push(b'\n');

    fs::create_dir_all(dir).map_err(io_err)?;
    let mut tmp = NamedTempFile::new_in(dir).map_err(io_err)?;
    tmp.write_all(&body).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}

/// Read a JSON record; anything short of a clean parse is `None`.
fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(
                path = %path.display(),
                error = %e,
                "Unreadable state record; treating as never run"
            );
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(
                path = %path.display(),
                error = %e,
                "Corrupt state record; treating as never run"
            );
            None
        }
    }
}

impl PhaseStateStore for FsPhaseStateStore {
    fn load(&self, id: &PhaseId) -> Option<PhaseState> {
        let path = self.phase_path(id);
        let state: PhaseState = read_json(&path)?;
        if &state.phase_id != id {
            warn!(
                path = %path.display(),
                recorded = %state.phase_id,
                "State record belongs to another phase; treating as never run"
            );
            return None;
        }
        Some(state)
    }

    fn save(&self, state: &PhaseState) -> Result<(), StateError> {
        write_json_atomic(&self.phase_path(&state.phase_id), state)
    }

    fn all(&self) -> BTreeMap<PhaseId, PhaseState> {
        self.recorded_ids()
            .into_iter()
            .filter_map(|id| self.load(&id).map(|state| (id, state)))
            .collect()
    }

    fn reset(&self, id: &PhaseId) -> Result<bool, StateError> {
        let path = self.phase_path(id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StateError::Io { path, source }),
        }
    }

    fn reset_all(&self) -> Result<usize, StateError> {
        let mut removed = 0;
        for id in self.recorded_ids() {
            if self.reset(&id)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn load_manifest(&self) -> Option<RunManifest> {
        read_json(&self.manifest_path())
    }

    fn save_manifest(&self, manifest: &RunManifest) -> Result<(), StateError> {
        write_json_atomic(&self.manifest_path(), manifest)
    }
}
