//! Phase state persistence.
//!
//! The store is the single source of truth for what already happened.
//! Reads are forgiving: a missing or unreadable record means "never run",
//! so corruption degrades to safe re-execution instead of a stuck
//! installer. Writes are atomic.

pub mod fs;
pub mod memory;

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StateError;
use crate::phase::PhaseId;

pub use fs::FsPhaseStateStore;
pub use memory::MemoryPhaseStateStore;

/// Lifecycle of a phase within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Running,
    Completed,
    Skipped,
    Failed,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::Running => "running",
            PhaseStatus::Completed => "completed",
            PhaseStatus::Skipped => "skipped",
            PhaseStatus::Failed => "failed",
        }
    }

    /// Completed or skipped: never re-entered without an explicit reset.
    pub fn is_settled(&self) -> bool {
        matches!(self, PhaseStatus::Completed | PhaseStatus::Skipped)
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted record of one phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseState {
    pub phase_id: PhaseId,
    pub status: PhaseStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

impl PhaseState {
    pub fn new(phase_id: PhaseId, status: PhaseStatus, run_id: &str) -> Self {
        PhaseState {
            phase_id,
            status,
            timestamp: Utc::now(),
            error: None,
            detail: None,
            run_id: Some(run_id.to_string()),
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_detail(mut self, detail: Option<String>) -> Self {
        self.detail = detail;
        self
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    Failed { phase_id: PhaseId },
    Aborted { reason: String },
}

/// Run-level record stored next to the phase states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Digest of the resolved skip set, see [`crate::exclusion::SkipSet::digest`].
    pub skip_set_digest: String,
    pub excluded_features: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RunOutcome>,
}

/// Durable per-phase status store.
pub trait PhaseStateStore: Send + Sync {
    /// Persisted state of `id`, or `None` if missing or unreadable.
    fn load(&self, id: &PhaseId) -> Option<PhaseState>;

    /// Atomically persist `state`, replacing any previous record.
    fn save(&self, state: &PhaseState) -> Result<(), StateError>;

    /// Every readable record, keyed by phase id.
    fn all(&self) -> BTreeMap<PhaseId, PhaseState>;

    /// Forget one phase. Returns whether a record existed.
    fn reset(&self, id: &PhaseId) -> Result<bool, StateError>;

    /// Forget every phase. Returns how many records were removed.
    fn reset_all(&self) -> Result<usize, StateError>;

    fn load_manifest(&self) -> Option<RunManifest>;

    fn save_manifest(&self, manifest: &RunManifest) -> Result<(), StateError>;

    /// Effective status: missing records are pending.
    fn status(&self, id: &PhaseId) -> PhaseStatus {
        self.load(id)
            .map(|s| s.status)
            .unwrap_or(PhaseStatus::Pending)
    }
}
