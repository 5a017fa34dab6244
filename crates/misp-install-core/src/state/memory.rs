//! In-memory phase state store (tests and previews).

use std::collections::BTreeMap;
use std::sync::Mutex;

use super::{PhaseState, PhaseStateStore, PhaseStatus, RunManifest};
use crate::error::StateError;
use crate::phase::PhaseId;

/// [`PhaseStateStore`] backed by a `BTreeMap`, recording every save so
/// tests can assert on transition order.
#[derive(Debug, Default)]
pub struct MemoryPhaseStateStore {
    states: Mutex<BTreeMap<PhaseId, PhaseState>>,
    manifest: Mutex<Option<RunManifest>>,
    history: Mutex<Vec<PhaseState>>,
}

impl MemoryPhaseStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with `(phase id, status)` pairs.
    pub fn with_statuses(entries: &[(&str, PhaseStatus)]) -> Self {
        let store = Self::new();
        {
            let mut states = store.states.lock().expect("state lock poisoned");
            for (raw, status) in entries {
                let id: PhaseId = raw.parse().expect("valid phase id in seed");
                states.insert(id.clone(), PhaseState::new(id, *status, "seed"));
            }
        }
        store
    }

    /// Every state passed to `save`, in call order.
    pub fn history(&self) -> Vec<PhaseState> {
        self.history.lock().expect("state lock poisoned").clone()
    }

    /// Statuses `id` moved through, in order.
    pub fn transitions(&self, id: &PhaseId) -> Vec<PhaseStatus> {
        self.history()
            .into_iter()
            .filter(|s| &s.phase_id == id)
            .map(|s| s.status)
            .collect()
    }
}

impl PhaseStateStore for MemoryPhaseStateStore {
    fn load(&self, id: &PhaseId) -> Option<PhaseState> {
        self.states.lock().expect("state lock poisoned").get(id).cloned()
    }

    fn save(&self, state: &PhaseState) -> Result<(), StateError> {
        self.states
            .lock()
            .expect("state lock poisoned")
            .insert(state.phase_id.clone(), state.clone());
        self.history
            .lock()
            .expect("state lock poisoned")
            .push(state.clone());
        Ok(())
    }

    fn all(&self) -> BTreeMap<PhaseId, PhaseState> {
        self.states.lock().expect("state lock poisoned").clone()
    }

    fn reset(&self, id: &PhaseId) -> Result<bool, StateError> {
        Ok(self
            .states
            .lock()
            .expect("state lock poisoned")
            .remove(id)
            .is_some())
    }

    fn reset_all(&self) -> Result<usize, StateError> {
        let mut states = self.states.lock().expect("state lock poisoned");
        let removed = states.len();
        states.clear();
        Ok(removed)
    }

    fn load_manifest(&self) -> Option<RunManifest> {
        self.manifest.lock().expect("state lock poisoned").clone()
    }

    fn save_manifest(&self, manifest: &RunManifest) -> Result<(), StateError> {
        *self.manifest.lock().expect("state lock poisoned") = Some(manifest.clone());
        Ok(())
    }
}
