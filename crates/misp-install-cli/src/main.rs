//! MISP Installer CLI
//!
//! The `misp-install` command runs the installation phases in order,
//! skipping phases whose features were excluded and resuming from the first
//! phase that has not completed.
//!
//! ## Modes
//!
//! - default: install (or resume an interrupted install)
//! - `--list-features`: print the feature registry
//! - `--list-phases`: print the installation plan
//! - `--status`: print persisted phase state
//! - `--dry-run`: show what a run would do

use std::io::{BufRead, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{ArgGroup, Parser};
use misp_install_core::{
    builtin_registry, default_plan, render_features, render_plan, render_preview, render_status,
    resolve_exclusions, telemetry, FsPhaseStateStore, InstallConfig, InstallEnvironment,
    MemoryPhaseStateStore, PhaseId, PhasePlan, PhaseRunner, PhaseStateStore, SkipSet,
};
use misp_platform::{ComposeConfig, ComposeRunner, MispClient, MispConfig};
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "misp-install")]
#[command(author = "Stevedores Org")]
#[command(version = misp_install_core::VERSION)]
#[command(about = "Phased, resumable MISP installer with feature exclusion", long_about = None)]
#[command(group(
    ArgGroup::new("mode")
        .multiple(false)
        .args(["list_features", "list_phases", "status", "dry_run"])
))]
struct Cli {
    /// Installer config file (.json or .toml)
    #[arg(short, long, env = "MISP_INSTALL_CONFIG")]
    config: Option<PathBuf>,

    /// List the features that can be excluded, then exit
    #[arg(long)]
    list_features: bool,

    /// List the installation phases, then exit
    #[arg(long)]
    list_phases: bool,

    /// Show persisted phase state, then exit
    #[arg(long)]
    status: bool,

    /// Show what would run, skip or resume without changing anything
    #[arg(long)]
    dry_run: bool,

    /// Forget the recorded state of a phase so it runs again (repeatable)
    #[arg(
        long = "reset-phase",
        value_name = "ID",
        conflicts_with_all = ["list_features", "list_phases", "status"]
    )]
    reset_phase: Vec<String>,

    /// Forget all recorded phase state before running
    #[arg(long, conflicts_with_all = ["list_features", "list_phases", "status"])]
    reset: bool,

    /// Do not ask for confirmation
    #[arg(long)]
    non_interactive: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    telemetry::init_tracing(cli.json, level);

    if cli.list_features {
        print!("{}", render_features(&builtin_registry()));
        return Ok(());
    }

    let mut config = InstallConfig::load_or_default(cli.config.as_deref())
        .context("Failed to load installer config")?;
    config.apply_env_overrides();
    config.validate().context("Invalid installer config")?;

    let registry = builtin_registry();
    let resolution = resolve_exclusions(&registry, &config.exclusion_spec());
    for warning in &resolution.warnings {
        warn!(token = %warning.token(), "{warning}");
    }
    let skip_set = resolution.skip_set;

    let read_only = cli.list_phases || cli.status || cli.dry_run;
    let store = Arc::new(if read_only {
        FsPhaseStateStore::open(config.state_dir())
    } else {
        FsPhaseStateStore::new(config.state_dir()).context("Failed to open phase state")?
    });

    let compose = ComposeConfig::new(config.install_dir.clone(), config.compose_path())
        .with_timeout(config.phase_timeout());
    let runtime = Arc::new(ComposeRunner::new(compose));
    let api = Arc::new(
        MispClient::new(
            MispConfig::new(&config.base_url, config.api_key_source())
                .with_verify_tls(config.verify_tls)
                .with_timeout(config.http_timeout()),
        )
        .context("Failed to build MISP API client")?,
    );

    let env = Arc::new(
        InstallEnvironment::new(config, runtime, api, store.clone())
            .with_registry(registry)
            .with_skip_set(skip_set.clone()),
    );
    let plan = default_plan(env.clone()).context("Failed to build installation plan")?;

    if cli.list_phases {
        print!("{}", render_plan(&plan));
        return Ok(());
    }
    if cli.status {
        print!("{}", render_status(&plan, &*store));
        return Ok(());
    }

    let reset = ResetRequest::parse(&plan, cli.reset, &cli.reset_phase)?;
    if cli.dry_run {
        print!("{}", preview(&plan, &*store, &reset, &skip_set)?);
        return Ok(());
    }

    if !skip_set.is_empty() {
        let excluded: Vec<&str> = skip_set.iter().map(|f| f.as_str()).collect();
        info!(excluded = %excluded.join(", "), "Excluded features");
    }

    let interactive = !cli.non_interactive && std::io::stdin().is_terminal();
    if interactive {
        print!("{}", preview(&plan, &*store, &reset, &skip_set)?);
        if !confirm(&format!(
            "Install MISP into {}?",
            env.config.install_dir.display()
        ))? {
            println!("Aborted.");
            return Ok(());
        }
    }

    reset.apply(&*store)?;
    let runner = PhaseRunner::new(&plan, &*store, &skip_set);
    let report = runner.run().await?;
    print!("{}", report.render());

    if let Some(failure) = &report.failure {
        bail!("phase {} ({}) failed", failure.phase_id, failure.name);
    }
    Ok(())
}

/// Phase state to forget before running, validated against the plan.
#[derive(Debug, Default)]
struct ResetRequest {
    all: bool,
    phases: Vec<PhaseId>,
}

impl ResetRequest {
    fn parse(plan: &PhasePlan, all: bool, raw: &[String]) -> Result<Self> {
        let mut phases = Vec::with_capacity(raw.len());
        for raw in raw {
            let id: PhaseId = raw
                .parse()
                .with_context(|| format!("Invalid phase id {raw:?}"))?;
            if plan.get(&id).is_none() {
                bail!("Unknown phase {id}; see --list-phases");
            }
            phases.push(id);
        }
        Ok(ResetRequest { all, phases })
    }

    fn covers(&self, id: &PhaseId) -> bool {
        self.all || self.phases.contains(id)
    }

    fn describe(&self) -> String {
        if self.all {
            "Resetting all phase state before running.\n".to_string()
        } else if self.phases.is_empty() {
            String::new()
        } else {
            let ids: Vec<String> = self.phases.iter().map(ToString::to_string).collect();
            format!("Resetting phase(s) {} before running.\n", ids.join(", "))
        }
    }

    fn apply(&self, store: &dyn PhaseStateStore) -> Result<()> {
        if self.all {
            let removed = store.reset_all().context("Failed to reset phase state")?;
            info!(removed, "Reset all phase state");
            return Ok(());
        }
        for id in &self.phases {
            if store
                .reset(id)
                .with_context(|| format!("Failed to reset phase {id}"))?
            {
                info!(phase = %id, "Reset phase state");
            }
        }
        Ok(())
    }
}

/// Render what a run would do once `reset` is applied, leaving `store`
/// untouched.
fn preview(
    plan: &PhasePlan,
    store: &dyn PhaseStateStore,
    reset: &ResetRequest,
    skip_set: &SkipSet,
) -> Result<String> {
    let view = MemoryPhaseStateStore::new();
    for (id, state) in store.all() {
        if !reset.covers(&id) {
            view.save(&state)?;
        }
    }
    let steps = PhaseRunner::new(plan, &view, skip_set).preview();
    Ok(format!("{}{}", reset.describe(), render_preview(&steps)))
}

fn confirm(question: &str) -> Result<bool> {
    print!("{question} [y/N] ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use misp_install_core::PhaseStatus;
    use misp_platform::fakes::{FakeApi, FakeRuntime};

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_modes_are_exclusive() {
        assert!(Cli::try_parse_from(["misp-install", "--status", "--dry-run"]).is_err());
        let cli = Cli::try_parse_from([
            "misp-install",
            "--reset-phase",
            "7",
            "--reset-phase",
            "8.5",
            "--non-interactive",
        ])
        .unwrap();
        assert_eq!(cli.reset_phase, vec!["7", "8.5"]);
        assert!(cli.non_interactive);
    }

    #[test]
    fn test_reset_rejected_with_read_only_modes() {
        assert!(Cli::try_parse_from(["misp-install", "--status", "--reset"]).is_err());
        assert!(
            Cli::try_parse_from(["misp-install", "--list-phases", "--reset-phase", "7"]).is_err()
        );
        assert!(Cli::try_parse_from(["misp-install", "--dry-run", "--reset"]).is_ok());
    }

    fn plan() -> PhasePlan {
        let env = InstallEnvironment::new(
            InstallConfig::default(),
            Arc::new(FakeRuntime::new()),
            Arc::new(FakeApi::new()),
            Arc::new(MemoryPhaseStateStore::new()),
        );
        default_plan(Arc::new(env)).unwrap()
    }

    fn completed(ids: &[&str]) -> MemoryPhaseStateStore {
        let entries: Vec<(&str, PhaseStatus)> =
            ids.iter().map(|id| (*id, PhaseStatus::Completed)).collect();
        MemoryPhaseStateStore::with_statuses(&entries)
    }

    #[test]
    fn test_reset_request_rejects_unknown_phase() {
        let plan = plan();
        assert!(ResetRequest::parse(&plan, false, &["42".to_string()]).is_err());
        assert!(ResetRequest::parse(&plan, false, &["seven".to_string()]).is_err());
        let reset = ResetRequest::parse(&plan, false, &["8.5".to_string()]).unwrap();
        assert!(reset.covers(&"8.5".parse().unwrap()));
        assert!(!reset.covers(&"8".parse().unwrap()));
    }

    #[test]
    fn test_preview_applies_reset_without_touching_store() {
        let plan = plan();
        let store = completed(&["1", "2", "3"]);
        let reset = ResetRequest::parse(&plan, false, &["2".to_string()]).unwrap();

        let rendered = preview(&plan, &store, &reset, &SkipSet::default()).unwrap();

        assert!(rendered.starts_with("Resetting phase(s) 2 before running."));
        assert_eq!(store.status(&"2".parse().unwrap()), PhaseStatus::Completed);
        assert!(store.history().is_empty());
    }

    #[test]
    fn test_reset_applies_only_when_asked() {
        let plan = plan();
        let store = completed(&["1", "2", "3"]);

        ResetRequest::parse(&plan, false, &[]).unwrap().apply(&store).unwrap();
        assert_eq!(store.all().len(), 3);

        ResetRequest::parse(&plan, true, &[]).unwrap().apply(&store).unwrap();
        assert!(store.all().is_empty());
    }
}
