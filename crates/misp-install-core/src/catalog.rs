//! Built-in feature catalogue and installation plan.

use std::sync::Arc;
use std::time::Duration;

use misp_platform::{ContainerRuntime, PlatformApi};

use crate::bodies::{api, host, platform};
use crate::config::InstallConfig;
use crate::error::PlanError;
use crate::exclusion::SkipSet;
use crate::phase::{Phase, PhaseBody};
use crate::plan::PhasePlan;
use crate::registry::FeatureRegistry;
use crate::state::PhaseStateStore;

const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(10);
/// Headroom between the health deadline and the phase timeout around it.
const HEALTH_PHASE_MARGIN: Duration = Duration::from_secs(30);

const BUILTIN_FEATURES: &[(&str, &str, &str)] = &[
    (
        "api-key",
        "integrations",
        "Generate an automation API key for the admin user",
    ),
    (
        "threat-feeds",
        "integrations",
        "Load and enable MISP's default OSINT feeds",
    ),
    (
        "sector-feeds",
        "integrations",
        "Register utilities/ICS sector feeds",
    ),
    (
        "dashboard-widgets",
        "dashboards",
        "Install custom dashboard widgets",
    ),
    (
        "automated-maintenance",
        "automation",
        "Schedule nightly taxonomy, galaxy and warninglist updates",
    ),
    (
        "backup-automation",
        "automation",
        "Install a backup script and nightly backup schedule",
    ),
    (
        "feed-sync",
        "automation",
        "Fetch all enabled feeds after installation",
    ),
    (
        "security-hardening",
        "security",
        "Apply password, session and audit logging policies",
    ),
    (
        "compliance-records",
        "compliance",
        "Write an installation evidence record for audits",
    ),
];

/// The built-in feature registry.
pub fn builtin_registry() -> FeatureRegistry {
    FeatureRegistry::from_entries(BUILTIN_FEATURES).expect("built-in feature catalogue is valid")
}

/// Collaborators and settings shared by every phase body.
pub struct InstallEnvironment {
    pub config: InstallConfig,
    pub registry: FeatureRegistry,
    pub skip_set: SkipSet,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub api: Arc<dyn PlatformApi>,
    pub store: Arc<dyn PhaseStateStore>,
    pub health_poll: Duration,
}

impl InstallEnvironment {
    pub fn new(
        config: InstallConfig,
        runtime: Arc<dyn ContainerRuntime>,
        api: Arc<dyn PlatformApi>,
        store: Arc<dyn PhaseStateStore>,
    ) -> Self {
        InstallEnvironment {
            config,
            registry: builtin_registry(),
            skip_set: SkipSet::default(),
            runtime,
            api,
            store,
            health_poll: HEALTH_POLL_INTERVAL,
        }
    }

    pub fn with_registry(mut self, registry: FeatureRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_skip_set(mut self, skip_set: SkipSet) -> Self {
        self.skip_set = skip_set;
        self
    }

    pub fn with_health_poll(mut self, poll: Duration) -> Self {
        self.health_poll = poll;
        self
    }
}

/// The standard installation sequence.
pub fn default_plan(env: Arc<InstallEnvironment>) -> Result<PhasePlan, PlanError> {
    let timeout = env.config.phase_timeout();
    let health_timeout = timeout.max(env.config.health_timeout() + HEALTH_PHASE_MARGIN);
    let e = || env.clone();
    let phase = |id: &str, name: &str, body: Arc<dyn PhaseBody>| step(id, name, body, timeout);

    let phases = vec![
        phase("1", "check-prerequisites", body(platform::CheckPrerequisites(e())))?,
        phase("2", "prepare-directories", body(platform::PrepareDirectories(e())))?
            .after("1")?,
        phase("3", "write-environment", body(platform::WriteEnvironment(e())))?
            .after("2")?,
        phase("4", "pull-images", body(platform::PullImages(e())))?.after("3")?,
        phase("5", "start-containers", body(platform::StartContainers(e())))?
            .after("4")?,
        phase("6", "wait-for-misp", body(platform::WaitForMisp(e())))?
            .after("5")?
            .with_timeout(health_timeout),
        phase("7", "generate-api-key", body(api::GenerateApiKey(e())))?
            .requires("api-key")?
            .after("6")?,
        phase("8", "apply-base-settings", body(api::ApplyBaseSettings(e())))?
            .requires("api-key")?
            .after("7")?,
        phase("8.5", "security-hardening", body(api::SecurityHardening(e())))?
            .requires("security-hardening")?
            .requires("api-key")?
            .after("8")?,
        phase("9", "enable-threat-feeds", body(api::EnableThreatFeeds(e())))?
            .requires("threat-feeds")?
            .requires("api-key")?
            .after("7")?,
        phase("9.1", "add-sector-feeds", body(api::AddSectorFeeds(e())))?
            .requires("sector-feeds")?
            .requires("api-key")?
            .after("7")?,
        phase("10", "fetch-feeds", body(api::FetchFeeds(e())))?
            .requires("feed-sync")?
            .requires("api-key")?
            .after("9")?,
        phase("11", "install-widgets", body(host::InstallWidgets(e())))?
            .requires("dashboard-widgets")?
            .after("6")?,
        phase("11.5", "schedule-maintenance", body(host::ScheduleMaintenance(e())))?
            .requires("automated-maintenance")?
            .after("2")?,
        phase("11.8", "schedule-backups", body(host::ScheduleBackups(e())))?
            .requires("backup-automation")?
            .after("2")?,
        phase("12", "compliance-record", body(host::ComplianceRecord(e())))?
            .requires("compliance-records")?
            .after("2")?,
        phase("13", "verify-installation", body(platform::VerifyInstallation(e())))?
            .after("6")?,
    ];

    PhasePlan::new(phases, &env.registry)
}

fn body(phase: impl PhaseBody + 'static) -> Arc<dyn PhaseBody> {
    Arc::new(phase)
}

fn step(
    id: &str,
    name: &str,
    body: Arc<dyn PhaseBody>,
    timeout: Duration,
) -> Result<Phase, PlanError> {
    Ok(Phase::new(id, name, body)?.with_timeout(timeout))
}
