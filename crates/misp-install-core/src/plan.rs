//! Validated, ordered phase plan.
//!
//! Every dependency must name a phase with a smaller id. That single rule
//! rules out cycles and out-of-order graphs, so the runner can walk phases
//! in id order without a topological sort.

use std::collections::HashSet;

use tracing::debug;

use crate::error::PlanError;
use crate::phase::{Phase, PhaseId};
use crate::registry::FeatureRegistry;

/// Phases sorted by id, checked against a feature registry.
#[derive(Debug, Clone)]
pub struct PhasePlan {
    phases: Vec<Phase>,
}

impl PhasePlan {
    /// Sort and validate `phases`.
    pub fn new(mut phases: Vec<Phase>, registry: &FeatureRegistry) -> Result<Self, PlanError> {
        phases.sort_by(|a, b| a.id.cmp(&b.id));

        let mut seen: HashSet<&PhaseId> = HashSet::new();
        for phase in &phases {
            if !seen.insert(&phase.id) {
                return Err(PlanError::DuplicatePhase(phase.id.clone()));
            }
        }
        let known: HashSet<&PhaseId> = phases.iter().map(|p| &p.id).collect();

        for phase in &phases {
            for dependency in &phase.dependencies {
                if !known.contains(dependency) {
                    return Err(PlanError::UnknownDependency {
                        phase: phase.id.clone(),
                        dependency: dependency.clone(),
                    });
                }
                if dependency >= &phase.id {
                    return Err(PlanError::ForwardDependency {
                        phase: phase.id.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
            for feature in &phase.required_features {
                if !registry.contains(feature) {
                    return Err(PlanError::UnknownFeature {
                        phase: phase.id.clone(),
                        feature: feature.to_string(),
                    });
                }
            }
        }

        debug!(phases = phases.len(), "Validated phase plan");
        Ok(PhasePlan { phases })
    }

    /// Phases in ascending id order.
    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn get(&self, id: &PhaseId) -> Option<&Phase> {
        self.phases.iter().find(|p| &p.id == id)
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::{PhaseBody, PhaseOutput};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct Noop;

    #[async_trait]
    impl PhaseBody for Noop {
        async fn execute(&self) -> anyhow::Result<PhaseOutput> {
            Ok(PhaseOutput::done())
        }
    }

    fn phase(id: &str) -> Phase {
        Phase::new(id, &format!("phase-{id}"), Arc::new(Noop)).unwrap()
    }

    fn registry() -> FeatureRegistry {
        FeatureRegistry::from_entries(&[("a", "x", "")]).unwrap()
    }

    #[test]
    fn test_plan_sorts_by_id() {
        let plan =
            PhasePlan::new(vec![phase("11.8"), phase("2"), phase("11")], &registry()).unwrap();
        let ids: Vec<String> = plan.phases().iter().map(|p| p.id.to_string()).collect();
        assert_eq!(ids, vec!["2", "11", "11.8"]);
    }

    #[test]
    fn test_duplicate_phase_rejected() {
        let result = PhasePlan::new(vec![phase("1"), phase("1")], &registry());
        assert!(matches!(result, Err(PlanError::DuplicatePhase(_))));
    }

    #[test]
    fn test_forward_dependency_rejected() {
        let result = PhasePlan::new(
            vec![phase("1").after("2").unwrap(), phase("2")],
            &registry(),
        );
        assert!(matches!(result, Err(PlanError::ForwardDependency { .. })));
    }

    #[test]
    fn test_cycle_rejected() {
        let result = PhasePlan::new(
            vec![phase("1").after("2").unwrap(), phase("2").after("1").unwrap()],
            &registry(),
        );
        assert!(matches!(result, Err(PlanError::ForwardDependency { .. })));
    }

    #[test]
    fn test_self_dependency_rejected() {
        let result = PhasePlan::new(vec![phase("3").after("3").unwrap()], &registry());
        assert!(matches!(result, Err(PlanError::ForwardDependency { .. })));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let result = PhasePlan::new(vec![phase("2").after("1").unwrap()], &registry());
        assert!(matches!(result, Err(PlanError::UnknownDependency { .. })));
    }

    #[test]
    fn test_unknown_required_feature_rejected() {
        let result = PhasePlan::new(vec![phase("1").requires("b").unwrap()], &registry());
        assert!(matches!(result, Err(PlanError::UnknownFeature { feature, .. }) if feature == "b"));
    }
}
