//! Phase definitions.
//!
//! A phase is a numbered installation step. Its body is an opaque
//! collaborator call (container command, REST request, file write); the
//! runner only sees success with optional detail, or an error.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::PlanError;
use crate::registry::FeatureId;

/// Default upper bound for a single phase body.
pub const DEFAULT_PHASE_TIMEOUT: Duration = Duration::from_secs(600);

/// Dotted numeric phase id such as `"6"` or `"11.8"`.
///
/// Ordering is segment-wise numeric, so `11 < 11.5 < 11.8 < 12`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhaseId(Vec<u32>);

impl PhaseId {
    pub fn segments(&self) -> &[u32] {
        &self.0
    }
}

impl FromStr for PhaseId {
    type Err = PlanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(PlanError::InvalidPhaseId(s.to_string()));
        }
        trimmed
            .split('.')
            .map(|part| part.parse::<u32>())
            .collect::<Result<Vec<_>, _>>()
            .map(PhaseId)
            .map_err(|_| PlanError::InvalidPhaseId(s.to_string()))
    }
}

impl fmt::Display for PhaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.0.iter().map(u32::to_string).collect();
        f.write_str(&rendered.join("."))
    }
}

impl Serialize for PhaseId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PhaseId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// What a successful phase body reports back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhaseOutput {
    /// Operator-facing note, persisted with the phase state.
    pub detail: Option<String>,
}

impl PhaseOutput {
    pub fn done() -> Self {
        PhaseOutput::default()
    }

    pub fn with_detail(detail: impl Into<String>) -> Self {
        PhaseOutput {
            detail: Some(detail.into()),
        }
    }
}

/// The work a phase performs.
///
/// Idempotence of an individual body is the body's concern; the runner
/// guarantees it is never invoked again once its phase is completed.
#[async_trait]
pub trait PhaseBody: Send + Sync {
    async fn execute(&self) -> anyhow::Result<PhaseOutput>;
}

/// A numbered step in the installation sequence.
#[derive(Clone)]
pub struct Phase {
    pub id: PhaseId,
    pub name: String,
    /// Features gating this phase; any excluded one skips it.
    pub required_features: Vec<FeatureId>,
    /// Earlier phases that must be completed or skipped first.
    pub dependencies: Vec<PhaseId>,
    pub timeout: Duration,
    pub body: Arc<dyn PhaseBody>,
}

impl Phase {
    pub fn new(id: &str, name: &str, body: Arc<dyn PhaseBody>) -> Result<Self, PlanError> {
        Ok(Phase {
            id: id.parse()?,
            name: name.to_string(),
            required_features: Vec::new(),
            dependencies: Vec::new(),
            timeout: DEFAULT_PHASE_TIMEOUT,
            body,
        })
    }

    /// Gate this phase on `feature`.
    pub fn requires(mut self, feature: &str) -> Result<Self, PlanError> {
        let id = FeatureId::new(feature).map_err(|_| PlanError::UnknownFeature {
            phase: self.id.clone(),
            feature: feature.to_string(),
        })?;
        self.required_features.push(id);
        Ok(self)
    }

    /// Declare a dependency on an earlier phase.
    pub fn after(mut self, dependency: &str) -> Result<Self, PlanError> {
        self.dependencies.push(dependency.parse()?);
        Ok(self)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl fmt::Debug for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Phase")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("required_features", &self.required_features)
            .field("dependencies", &self.dependencies)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
