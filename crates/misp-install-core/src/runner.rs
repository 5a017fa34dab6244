//! Phase runner: sequences phases against the state store and skip set.
//!
//! Per phase, in ascending id order:
//! 1. settled (completed/skipped) in the store -> left untouched;
//! 2. requires an excluded feature -> `skipped`;
//! 3. a dependency not settled -> configuration error, halt;
//! 4. otherwise `running` -> body -> `completed` or `failed` (halt).
//!
//! Every transition is persisted before moving on, so a killed run resumes
//! at the first unsettled phase. A persisted `running` is not settled and
//! gets re-attempted.

use std::collections::BTreeSet;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::RunnerError;
use crate::exclusion::SkipSet;
use crate::phase::{Phase, PhaseId, PhaseOutput};
use crate::plan::PhasePlan;
use crate::registry::FeatureId;
use crate::report::{ExclusionDrift, PhaseFailure, PhaseReport, RunReport};
use crate::state::{PhaseState, PhaseStateStore, PhaseStatus, RunManifest, RunOutcome};

/// What the runner would do with a phase right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PlannedAction {
    /// Already completed or skipped; will not be touched.
    Settled { status: PhaseStatus },
    /// Gated by excluded features.
    Skip { excluded: Vec<FeatureId> },
    /// Body will run; `previous` is set when re-attempting a failed or
    /// interrupted phase.
    Run { previous: Option<PhaseStatus> },
}

/// One line of a preview.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedStep {
    pub phase_id: PhaseId,
    pub name: String,
    #[serde(flatten)]
    pub action: PlannedAction,
}

/// Drives a [`PhasePlan`] to completion or first failure.
pub struct PhaseRunner<'a> {
    plan: &'a PhasePlan,
    store: &'a dyn PhaseStateStore,
    skip_set: &'a SkipSet,
    run_id: String,
}

impl<'a> PhaseRunner<'a> {
    pub fn new(plan: &'a PhasePlan, store: &'a dyn PhaseStateStore, skip_set: &'a SkipSet) -> Self {
        Self {
            plan,
            store,
            skip_set,
            run_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    fn action_for(&self, phase: &Phase) -> PlannedAction {
        let previous = self.store.load(&phase.id).map(|s| s.status);
        if let Some(status) = previous.filter(PhaseStatus::is_settled) {
            return PlannedAction::Settled { status };
        }

        let excluded: Vec<FeatureId> = self
            .skip_set
            .intersection(&phase.required_features)
            .into_iter()
            .cloned()
            .collect();
        if !excluded.is_empty() {
            return PlannedAction::Skip { excluded };
        }

        PlannedAction::Run {
            previous: previous.filter(|s| *s != PhaseStatus::Pending),
        }
    }

    /// Side-effect free view of what [`PhaseRunner::run`] would do, assuming
    /// every body succeeds.
    pub fn preview(&self) -> Vec<PlannedStep> {
        self.plan
            .phases()
            .iter()
            .map(|phase| PlannedStep {
                phase_id: phase.id.clone(),
                name: phase.name.clone(),
                action: self.action_for(phase),
            })
            .collect()
    }

    fn manifest(&self) -> RunManifest {
        RunManifest {
            run_id: self.run_id.clone(),
            started_at: Utc::now(),
            finished_at: None,
            skip_set_digest: self.skip_set.digest(),
            excluded_features: self.skip_set.iter().map(ToString::to_string).collect(),
            outcome: None,
        }
    }

    /// Compare the skip set against the one recorded by a previous run.
    fn exclusion_drift(&self, previous: &RunManifest) -> Option<ExclusionDrift> {
        if previous.skip_set_digest == self.skip_set.digest() {
            return None;
        }
        let now: BTreeSet<&str> = self.skip_set.iter().map(FeatureId::as_str).collect();
        let before: BTreeSet<&str> = previous
            .excluded_features
            .iter()
            .map(String::as_str)
            .collect();
        let newly_excluded: Vec<String> =
            now.difference(&before).map(ToString::to_string).collect();
        let no_longer_excluded: Vec<String> =
            before.difference(&now).map(ToString::to_string).collect();
        if newly_excluded.is_empty() && no_longer_excluded.is_empty() {
            return None;
        }

        let changed: BTreeSet<&str> = now.symmetric_difference(&before).copied().collect();
        let settled_phases = self
            .plan
            .phases()
            .iter()
            .filter(|phase| {
                phase
                    .required_features
                    .iter()
                    .any(|f| changed.contains(f.as_str()))
            })
            .filter(|phase| self.store.status(&phase.id).is_settled())
            .map(|phase| phase.id.clone())
            .collect();

        Some(ExclusionDrift {
            previous_run_id: previous.run_id.clone(),
            newly_excluded,
            no_longer_excluded,
            settled_phases,
        })
    }

    fn finish_manifest(
        &self,
        mut manifest: RunManifest,
        outcome: RunOutcome,
    ) -> Result<(), RunnerError> {
        manifest.finished_at = Some(Utc::now());
        manifest.outcome = Some(outcome);
        self.store.save_manifest(&manifest)?;
        Ok(())
    }

    fn persist(&self, state: PhaseState) -> Result<PhaseState, RunnerError> {
        debug!(phase = %state.phase_id, status = %state.status, "Persisting phase state");
        self.store.save(&state)?;
        Ok(state)
    }

    /// Execute the plan.
    ///
    /// Returns `Err` only for problems with the installer itself (unsatisfied
    /// dependency, state store write failure). A failing phase body yields
    /// `Ok` with [`RunReport::failure`] set.
    pub async fn run(&self) -> Result<RunReport, RunnerError> {
        let started = Instant::now();
        let exclusion_drift = self
            .store
            .load_manifest()
            .and_then(|previous| self.exclusion_drift(&previous));
        if let Some(drift) = &exclusion_drift {
            warn!(
                previous_run = %drift.previous_run_id,
                newly_excluded = %drift.newly_excluded.join(", "),
                no_longer_excluded = %drift.no_longer_excluded.join(", "),
                settled_phases = %drift
                    .settled_phases
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", "),
                "Excluded features changed since the previous run; settled phases keep their status"
            );
        }
        let manifest = self.manifest();
        self.store.save_manifest(&manifest)?;

        info!(
            run_id = %self.run_id,
            phases = self.plan.len(),
            excluded = self.skip_set.len(),
            "Starting installation run"
        );

        let mut entries = Vec::with_capacity(self.plan.len());
        let mut failure = None;

        for phase in self.plan.phases() {
            match self.action_for(phase) {
                PlannedAction::Settled { status } => {
                    info!(
                        phase = %phase.id,
                        name = %phase.name,
                        status = %status,
                        "Already settled; not re-running"
                    );
                    let previous = self.store.load(&phase.id);
                    entries.push(PhaseReport::resumed(phase, status, previous.as_ref()));
                }
                PlannedAction::Skip { excluded } => {
                    let detail = format!(
                        "excluded feature(s): {}",
                        excluded
                            .iter()
                            .map(FeatureId::as_str)
                            .collect::<Vec<_>>()
                            .join(", ")
                    );
                    info!(phase = %phase.id, name = %phase.name, %detail, "Skipping phase");
                    let state = self.persist(
                        PhaseState::new(phase.id.clone(), PhaseStatus::Skipped, &self.run_id)
                            .with_detail(Some(detail)),
                    )?;
                    entries.push(PhaseReport::from_state(phase, &state));
                }
                PlannedAction::Run { previous } => {
                    match previous {
                        Some(PhaseStatus::Running) => warn!(
                            phase = %phase.id,
                            "Phase was interrupted during a previous run; re-attempting"
                        ),
                        Some(PhaseStatus::Failed) => {
                            info!(phase = %phase.id, "Phase failed previously; re-attempting")
                        }
                        _ => {}
                    }

                    if let Err(e) = self.check_dependencies(phase) {
                        error!(
                            phase = %phase.id,
                            error = %e,
                            "Phase graph is inconsistent; halting"
                        );
                        self.finish_manifest(
                            manifest,
                            RunOutcome::Aborted {
                                reason: e.to_string(),
                            },
                        )?;
                        return Err(e);
                    }

                    let state = self.execute(phase).await?;
                    let failed = state.status == PhaseStatus::Failed;
                    entries.push(PhaseReport::from_state(phase, &state));
                    if failed {
                        failure = Some(PhaseFailure {
                            phase_id: phase.id.clone(),
                            name: phase.name.clone(),
                            error: state.error.unwrap_or_default(),
                        });
                        break;
                    }
                }
            }
        }

        let outcome = match &failure {
            Some(f) => RunOutcome::Failed {
                phase_id: f.phase_id.clone(),
            },
            None => RunOutcome::Succeeded,
        };
        self.finish_manifest(manifest, outcome)?;

        let report = RunReport {
            run_id: self.run_id.clone(),
            entries,
            failure,
            exclusion_drift,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        if report.success() {
            info!(run_id = %self.run_id, "Installation run completed");
        } else {
            error!(run_id = %self.run_id, "Installation run halted on failure");
        }
        Ok(report)
    }

    fn check_dependencies(&self, phase: &Phase) -> Result<(), RunnerError> {
        for dependency in &phase.dependencies {
            let status = self.store.status(dependency);
            if !status.is_settled() {
                return Err(RunnerError::UnsatisfiedDependency {
                    phase: phase.id.clone(),
                    dependency: dependency.clone(),
                    status,
                });
            }
        }
        Ok(())
    }

    /// running -> body -> completed | failed, persisting each step.
    async fn execute(&self, phase: &Phase) -> Result<PhaseState, RunnerError> {
        self.persist(PhaseState::new(
            phase.id.clone(),
            PhaseStatus::Running,
            &self.run_id,
        ))?;
        info!(phase = %phase.id, name = %phase.name, "Running phase");

        let started = Instant::now();
        let outcome: Result<PhaseOutput, String> =
            match tokio::time::timeout(phase.timeout, phase.body.execute()).await {
                Ok(Ok(output)) => Ok(output),
                Ok(Err(e)) => Err(format!("{e:#}")),
                Err(_) => Err(format!(
                    "phase timed out after {} seconds",
                    phase.timeout.as_secs()
                )),
            };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(output) => {
                info!(phase = %phase.id, elapsed_ms, "Phase completed");
                self.persist(
                    PhaseState::new(phase.id.clone(), PhaseStatus::Completed, &self.run_id)
                        .with_detail(output.detail),
                )
            }
            Err(message) => {
                error!(phase = %phase.id, elapsed_ms, error = %message, "Phase failed");
                self.persist(
                    PhaseState::new(phase.id.clone(), PhaseStatus::Failed, &self.run_id)
                        .with_error(message),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::PhaseBody;
    use crate::registry::FeatureRegistry;
    use crate::state::MemoryPhaseStateStore;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;

    struct Sleepy;

    #[async_trait]
    impl PhaseBody for Sleepy {
        async fn execute(&self) -> anyhow::Result<PhaseOutput> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(PhaseOutput::done())
        }
    }

    struct Fine;

    #[async_trait]
    impl PhaseBody for Fine {
        async fn execute(&self) -> anyhow::Result<PhaseOutput> {
            Ok(PhaseOutput::with_detail("fine"))
        }
    }

    fn registry() -> FeatureRegistry {
        FeatureRegistry::from_entries(&[("a", "x", "")]).unwrap()
    }

    #[tokio::test]
    async fn test_timeout_marks_phase_failed() {
        let plan = PhasePlan::new(
            vec![Phase::new("1", "slow", Arc::new(Sleepy))
                .unwrap()
                .with_timeout(Duration::from_millis(20))],
            &registry(),
        )
        .unwrap();
        let store = MemoryPhaseStateStore::new();
        let skip = SkipSet::default();

        let report = PhaseRunner::new(&plan, &store, &skip).run().await.unwrap();
        let failure = report.failure.expect("timeout should fail the run");
        assert!(failure.error.contains("timed out"));
        assert_eq!(store.status(&"1".parse().unwrap()), PhaseStatus::Failed);
    }

    #[tokio::test]
    async fn test_detail_persisted_on_completion() {
        let plan = PhasePlan::new(
            vec![Phase::new("1", "ok", Arc::new(Fine)).unwrap()],
            &registry(),
        )
        .unwrap();
        let store = MemoryPhaseStateStore::new();
        let skip = SkipSet::default();

        PhaseRunner::new(&plan, &store, &skip)
            .with_run_id("run-42")
            .run()
            .await
            .unwrap();

        let state = store.load(&"1".parse().unwrap()).unwrap();
        assert_eq!(state.detail.as_deref(), Some("fine"));
        assert_eq!(state.run_id.as_deref(), Some("run-42"));
        let manifest = store.load_manifest().unwrap();
        assert_eq!(manifest.run_id, "run-42");
        assert_eq!(manifest.outcome, Some(RunOutcome::Succeeded));
        assert!(manifest.finished_at.is_some());
    }

    #[test]
    fn test_preview_has_no_side_effects() {
        let plan = PhasePlan::new(
            vec![
                Phase::new("1", "done", Arc::new(Fine)).unwrap(),
                Phase::new("2", "gated", Arc::new(Fine)).unwrap().requires("a").unwrap(),
                Phase::new("3", "retry", Arc::new(Fine)).unwrap(),
                Phase::new("4", "fresh", Arc::new(Fine)).unwrap(),
            ],
            &registry(),
        )
        .unwrap();
        let store = MemoryPhaseStateStore::with_statuses(&[
            ("1", PhaseStatus::Completed),
            ("3", PhaseStatus::Running),
        ]);
        let skip: SkipSet = [FeatureId::new("a").unwrap()].into_iter().collect();

        let steps = PhaseRunner::new(&plan, &store, &skip).preview();
        assert_eq!(
            steps.iter().map(|s| s.action.clone()).collect::<Vec<_>>(),
            vec![
                PlannedAction::Settled {
                    status: PhaseStatus::Completed
                },
                PlannedAction::Skip {
                    excluded: vec![FeatureId::new("a").unwrap()]
                },
                PlannedAction::Run {
                    previous: Some(PhaseStatus::Running)
                },
                PlannedAction::Run { previous: None },
            ]
        );
        assert!(store.history().is_empty());
        assert!(store.load_manifest().is_none());
    }
}
