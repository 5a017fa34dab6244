//! Operator-facing run reports and listings.

use std::fmt::Write as _;

use serde::Serialize;

use crate::phase::{Phase, PhaseId};
use crate::plan::PhasePlan;
use crate::registry::FeatureRegistry;
use crate::runner::{PlannedAction, PlannedStep};
use crate::state::{PhaseState, PhaseStateStore, PhaseStatus, RunManifest, RunOutcome};

/// Final status of one phase within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseReport {
    pub phase_id: PhaseId,
    pub name: String,
    pub status: PhaseStatus,
    /// Settled by an earlier run and left untouched by this one.
    pub resumed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PhaseReport {
    pub(crate) fn from_state(phase: &Phase, state: &PhaseState) -> Self {
        PhaseReport {
            phase_id: phase.id.clone(),
            name: phase.name.clone(),
            status: state.status,
            resumed: false,
            detail: state.detail.clone(),
            error: state.error.clone(),
        }
    }

    pub(crate) fn resumed(
        phase: &Phase,
        status: PhaseStatus,
        previous: Option<&PhaseState>,
    ) -> Self {
        PhaseReport {
            phase_id: phase.id.clone(),
            name: phase.name.clone(),
            status,
            resumed: true,
            detail: previous.and_then(|s| s.detail.clone()),
            error: None,
        }
    }
}

/// The phase that halted a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseFailure {
    pub phase_id: PhaseId,
    pub name: String,
    pub error: String,
}

/// Exclusions that differ from the previous run's manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExclusionDrift {
    pub previous_run_id: String,
    pub newly_excluded: Vec<String>,
    pub no_longer_excluded: Vec<String>,
    /// Settled phases gated by a changed feature. They keep their recorded
    /// status until reset.
    pub settled_phases: Vec<PhaseId>,
}

/// Outcome of [`crate::runner::PhaseRunner::run`].
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    /// Phases in the order they were visited; stops at the failure.
    pub entries: Vec<PhaseReport>,
    pub failure: Option<PhaseFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclusion_drift: Option<ExclusionDrift>,
    pub duration_ms: u64,
}

impl RunReport {
    pub fn success(&self) -> bool {
        self.failure.is_none()
    }

    pub fn count(&self, status: PhaseStatus) -> usize {
        self.entries.iter().filter(|e| e.status == status).count()
    }

    pub fn status_of(&self, id: &PhaseId) -> Option<PhaseStatus> {
        self.entries
            .iter()
            .find(|e| &e.phase_id == id)
            .map(|e| e.status)
    }

    /// Summary printed at the end of an installation.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Run ID: {}", self.run_id);
        let _ = writeln!(
            out,
            "Status: {}",
            if self.success() { "✓ SUCCEEDED" } else { "✗ FAILED" }
        );
        let _ = writeln!(out, "Duration: {}ms", self.duration_ms);
        let _ = writeln!(out);

        for entry in &self.entries {
            let mut line = format!(
                "  {} {:<6} {:<24} {}",
                status_marker(entry.status),
                entry.phase_id.to_string(),
                entry.name,
                entry.status
            );
            if entry.resumed {
                line.push_str(" (previous run)");
            }
            if let Some(detail) = &entry.detail {
                let _ = write!(line, " - {detail}");
            }
            let _ = writeln!(out, "{line}");
        }

        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "Summary: {} completed, {} skipped, {} failed",
            self.count(PhaseStatus::Completed),
            self.count(PhaseStatus::Skipped),
            self.count(PhaseStatus::Failed)
        );

        if let Some(drift) = &self.exclusion_drift {
            let _ = writeln!(out);
            let _ = writeln!(
                out,
                "! Exclusions changed since run {}: now excluded [{}], no longer excluded [{}]",
                drift.previous_run_id,
                drift.newly_excluded.join(", "),
                drift.no_longer_excluded.join(", ")
            );
            if !drift.settled_phases.is_empty() {
                let ids: Vec<String> =
                    drift.settled_phases.iter().map(ToString::to_string).collect();
                let _ = writeln!(
                    out,
                    "  Phases {} keep their recorded status; reset them to apply the change.",
                    ids.join(", ")
                );
            }
        }

        if let Some(failure) = &self.failure {
            let _ = writeln!(out);
            let _ = writeln!(
                out,
                "✗ Phase {} ({}) failed: {}",
                failure.phase_id, failure.name, failure.error
            );
            let _ = writeln!(
                out,
                "  Fix the cause and re-run; completed phases will not be repeated."
            );
        }
        out
    }
}

fn status_marker(status: PhaseStatus) -> &'static str {
    match status {
        PhaseStatus::Completed => "✓",
        PhaseStatus::Skipped => "-",
        PhaseStatus::Failed => "✗",
        PhaseStatus::Running => "~",
        PhaseStatus::Pending => " ",
    }
}

/// Registry grouped by category, for `--list-features`.
pub fn render_features(registry: &FeatureRegistry) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Available features ({}):", registry.len());
    for category in registry.categories() {
        let _ = writeln!(out);
        let _ = writeln!(out, "{category}  (exclude all with \"category:{category}\")");
        for feature in registry.features_in_category(category.as_str()) {
            let _ = writeln!(out, "  {:<24} {}", feature.id, feature.description);
        }
    }
    out
}

/// Plan with dependencies and feature gates, for `--list-phases`.
pub fn render_plan(plan: &PhasePlan) -> String {
    let mut out = String::new();
    for phase in plan.phases() {
        let requires = join_or_dash(phase.required_features.iter().map(ToString::to_string));
        let after = join_or_dash(phase.dependencies.iter().map(ToString::to_string));
        let _ = writeln!(
            out,
            "  {:<6} {:<24} requires: {:<36} after: {}",
            phase.id.to_string(),
            phase.name,
            requires,
            after
        );
    }
    out
}

/// Persisted state of every planned phase, for `--status`.
pub fn render_status(plan: &PhasePlan, store: &dyn PhaseStateStore) -> String {
    let mut out = String::new();
    match store.load_manifest() {
        Some(manifest) => render_manifest(&mut out, &manifest),
        None => {
            let _ = writeln!(out, "No installation run recorded yet.");
        }
    }
    let _ = writeln!(out);

    for phase in plan.phases() {
        let state = store.load(&phase.id);
        let status = state.as_ref().map(|s| s.status).unwrap_or(PhaseStatus::Pending);
        let mut line = format!(
            "  {} {:<6} {:<24} {}",
            status_marker(status),
            phase.id.to_string(),
            phase.name,
            status
        );
        if let Some(state) = &state {
            if status != PhaseStatus::Pending {
                let _ = write!(line, " at {}", state.timestamp.format("%Y-%m-%d %H:%M:%S UTC"));
            }
            if let Some(error) = &state.error {
                let _ = write!(line, " - {error}");
            } else if let Some(detail) = &state.detail {
                let _ = write!(line, " - {detail}");
            }
        }
        let _ = writeln!(out, "{line}");
    }
    out
}

fn render_manifest(out: &mut String, manifest: &RunManifest) {
    let _ = writeln!(out, "Last run: {}", manifest.run_id);
    let _ = writeln!(
        out,
        "Started:  {}",
        manifest.started_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    let outcome = match &manifest.outcome {
        Some(RunOutcome::Succeeded) => "succeeded".to_string(),
        Some(RunOutcome::Failed { phase_id }) => format!("failed at phase {phase_id}"),
        Some(RunOutcome::Aborted { reason }) => format!("aborted: {reason}"),
        None => "interrupted".to_string(),
    };
    let _ = writeln!(out, "Outcome:  {outcome}");
    let _ = writeln!(
        out,
        "Excluded: {}",
        join_or_dash(manifest.excluded_features.iter().cloned())
    );
}

/// What `--dry-run` would do.
pub fn render_preview(steps: &[PlannedStep]) -> String {
    let mut out = String::new();
    for step in steps {
        let action = match &step.action {
            PlannedAction::Settled { status } => format!("keep ({status} in a previous run)"),
            PlannedAction::Skip { excluded } => format!(
                "skip (excluded: {})",
                join_or_dash(excluded.iter().map(ToString::to_string))
            ),
            PlannedAction::Run { previous: None } => "run".to_string(),
            PlannedAction::Run {
                previous: Some(status),
            } => format!("re-run (was {status})"),
        };
        let _ = writeln!(out, "  {:<6} {:<24} {}", step.phase_id.to_string(), step.name, action);
    }
    out
}

fn join_or_dash(items: impl Iterator<Item = String>) -> String {
    let items: Vec<String> = items.collect();
    if items.is_empty() {
        "-".to_string()
    } else {
        items.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryPhaseStateStore;

    fn entry(id: &str, name: &str, status: PhaseStatus) -> PhaseReport {
        PhaseReport {
            phase_id: id.parse().unwrap(),
            name: name.to_string(),
            status,
            resumed: false,
            detail: None,
            error: None,
        }
    }

    #[test]
    fn test_render_lists_phases_then_failure() {
        let report = RunReport {
            run_id: "run-1".to_string(),
            entries: vec![
                entry("1", "check-prerequisites", PhaseStatus::Completed),
                entry("7", "generate-api-key", PhaseStatus::Skipped),
                entry("11", "install-widgets", PhaseStatus::Failed),
            ],
            failure: Some(PhaseFailure {
                phase_id: "11".parse().unwrap(),
                name: "install-widgets".to_string(),
                error: "docker compose cp failed".to_string(),
            }),
            exclusion_drift: None,
            duration_ms: 12,
        };

        let text = report.render();
        assert!(text.contains("✗ FAILED"));
        assert!(text.contains("Summary: 1 completed, 1 skipped, 1 failed"));
        let phases = text.find("install-widgets").unwrap();
        let failure = text.find("docker compose cp failed").unwrap();
        assert!(phases < failure);
        assert!(!report.success());
    }

    #[test]
    fn test_render_names_phases_affected_by_exclusion_change() {
        let report = RunReport {
            run_id: "run-2".to_string(),
            entries: vec![entry("7", "generate-api-key", PhaseStatus::Skipped)],
            failure: None,
            exclusion_drift: Some(ExclusionDrift {
                previous_run_id: "run-1".to_string(),
                newly_excluded: vec![],
                no_longer_excluded: vec!["api-key".to_string()],
                settled_phases: vec!["7".parse().unwrap(), "8".parse().unwrap()],
            }),
            duration_ms: 3,
        };

        let text = report.render();
        assert!(text.contains("since run run-1: now excluded [], no longer excluded [api-key]"));
        assert!(text.contains("Phases 7, 8 keep their recorded status"));
    }

    #[test]
    fn test_render_features_groups_by_category() {
        let registry = FeatureRegistry::from_entries(&[
            ("api-key", "integrations", "Generate an API key"),
            ("feed-sync", "automation", "Fetch feeds"),
        ])
        .unwrap();
        let text = render_features(&registry);
        assert!(text.contains("category:integrations"));
        assert!(text.contains("category:automation"));
        assert!(text.contains("feed-sync"));
    }

    #[test]
    fn test_render_status_without_runs() {
        let registry = FeatureRegistry::from_entries(&[]).unwrap();
        let plan = PhasePlan::new(Vec::new(), &registry).unwrap();
        let store = MemoryPhaseStateStore::new();
        assert!(render_status(&plan, &store).contains("No installation run recorded"));
    }
}
