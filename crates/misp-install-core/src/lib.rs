//! MISP Install Core
//!
//! Feature exclusion and resumable phase orchestration for the MISP
//! installer: resolve which optional features to leave out, then drive the
//! numbered installation phases to completion, persisting each phase's
//! outcome so an interrupted or failed run picks up where it stopped.

pub mod bodies;
pub mod catalog;
pub mod config;
pub mod error;
pub mod exclusion;
pub mod phase;
pub mod plan;
pub mod registry;
pub mod report;
pub mod runner;
pub mod state;
pub mod telemetry;

pub use catalog::{builtin_registry, default_plan, InstallEnvironment};
pub use config::InstallConfig;
pub use error::{ConfigError, PlanError, RegistryError, RunnerError, StateError};
pub use exclusion::{
    ExclusionResolver, ExclusionSpec, ExclusionToken, ExclusionWarning, Resolution, SkipSet,
};
pub use phase::{Phase, PhaseBody, PhaseId, PhaseOutput, DEFAULT_PHASE_TIMEOUT};
pub use plan::PhasePlan;
pub use registry::{Category, Feature, FeatureId, FeatureRegistry};
pub use report::{
    render_features, render_plan, render_preview, render_status, ExclusionDrift, PhaseFailure,
    PhaseReport, RunReport,
};
pub use runner::{PhaseRunner, PlannedAction, PlannedStep};
pub use state::{
    FsPhaseStateStore, MemoryPhaseStateStore, PhaseState, PhaseStateStore, PhaseStatus,
    RunManifest, RunOutcome,
};

/// Crate version, recorded in run output.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Resolve `spec` against `registry`; shorthand for [`ExclusionResolver`].
pub fn resolve_exclusions(registry: &FeatureRegistry, spec: &ExclusionSpec) -> Resolution {
    ExclusionResolver::new(registry).resolve(spec)
}
