//! Error taxonomy for the installer core.
//!
//! Unknown exclusion tokens have no variant here; they are warnings carried
//! in [`crate::exclusion::Resolution`].

use std::path::PathBuf;

use thiserror::Error;

use crate::phase::PhaseId;
use crate::state::PhaseStatus;

/// Errors building a [`crate::registry::FeatureRegistry`].
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("duplicate feature id: {0}")]
    DuplicateFeature(String),

    #[error("invalid feature id {0:?}: ids are non-empty and contain no whitespace or ':'")]
    InvalidFeatureId(String),

    #[error("invalid category {0:?}")]
    InvalidCategory(String),
}

/// Static problems with a phase plan, detected before any phase runs.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("invalid phase id {0:?}: expected dotted numbers such as \"11.8\"")]
    InvalidPhaseId(String),

    #[error("duplicate phase id: {0}")]
    DuplicatePhase(PhaseId),

    #[error("phase {phase} depends on unknown phase {dependency}")]
    UnknownDependency { phase: PhaseId, dependency: PhaseId },

    /// A dependency on a phase that does not precede it: either a cycle or
    /// an out-of-order graph.
    #[error("phase {phase} depends on {dependency}, which does not run before it")]
    ForwardDependency { phase: PhaseId, dependency: PhaseId },

    #[error("phase {phase} requires unknown feature {feature}")]
    UnknownFeature { phase: PhaseId, feature: String },
}

/// Phase state persistence failures. Reads never produce these: an
/// unreadable record degrades to "never run".
#[derive(Debug, Error)]
pub enum StateError {
    #[error("state store io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize state: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors that halt the phase runner itself (as opposed to a phase body
/// failing, which is recorded in the report).
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("invalid phase plan: {0}")]
    Plan(#[from] PlanError),

    #[error("phase {phase} cannot start: dependency {dependency} is {status}")]
    UnsatisfiedDependency {
        phase: PhaseId,
        dependency: PhaseId,
        status: PhaseStatus,
    },

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

/// Configuration document problems. All are fatal before any phase runs.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {detail}")]
    Parse { path: PathBuf, detail: String },

    #[error("unsupported config format for {0}: expected .json or .toml")]
    UnsupportedFormat(PathBuf),

    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}
