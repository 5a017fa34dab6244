//! The standard installation plan run end to end against fake collaborators
//! and the on-disk state store.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use misp_install_core::{
    default_plan, resolve_exclusions, FsPhaseStateStore, InstallConfig,
    InstallEnvironment, PhaseId, PhaseRunner, PhaseStateStore, PhaseStatus, RunReport, SkipSet,
};
use misp_platform::fakes::{FakeApi, FakeRuntime, FAKE_API_KEY};

fn id(s: &str) -> PhaseId {
    s.parse().unwrap()
}

/// Install directory with a compose file and one dashboard widget.
fn install_dir(root: &Path) -> InstallConfig {
    std::fs::write(root.join("docker-compose.yml"), "services: {}\n").unwrap();
    std::fs::create_dir_all(root.join("widgets")).unwrap();
    std::fs::write(root.join("widgets/IcsWidget.php"), "<?php\n").unwrap();
    InstallConfig {
        install_dir: root.to_path_buf(),
        cron_dir: root.join("cron.d"),
        ..InstallConfig::default()
    }
}

struct Install {
    runtime: Arc<FakeRuntime>,
    api: Arc<FakeApi>,
    store: Arc<FsPhaseStateStore>,
    report: RunReport,
}

async fn install(config: InstallConfig, runtime: FakeRuntime, api: FakeApi) -> Install {
    let skip_set = resolve_exclusions(
        &misp_install_core::builtin_registry(),
        &config.exclusion_spec(),
    )
    .skip_set;
    install_with(config, skip_set, runtime, api).await
}

async fn install_with(
    config: InstallConfig,
    skip_set: SkipSet,
    runtime: FakeRuntime,
    api: FakeApi,
) -> Install {
    let runtime = Arc::new(runtime);
    let api = Arc::new(api);
    let store = Arc::new(FsPhaseStateStore::new(config.state_dir()).unwrap());
    let env = Arc::new(
        InstallEnvironment::new(config, runtime.clone(), api.clone(), store.clone())
            .with_skip_set(skip_set.clone())
            .with_health_poll(Duration::from_millis(1)),
    );
    let plan = default_plan(env).unwrap();
    let report = PhaseRunner::new(&plan, &*store, &skip_set)
        .run()
        .await
        .unwrap();
    Install {
        runtime,
        api,
        store,
        report,
    }
}

#[tokio::test]
async fn test_full_install_completes_every_phase() {
    let dir = tempfile::tempdir().unwrap();
    let config = install_dir(dir.path());

    let run = install(config.clone(), FakeRuntime::new(), FakeApi::with_default_feeds()).await;

    assert!(run.report.success(), "{}", run.report.render());
    assert_eq!(run.report.entries.len(), 17);
    assert_eq!(run.report.count(PhaseStatus::Completed), 17);

    let key = std::fs::read_to_string(config.api_key_file()).unwrap();
    assert_eq!(key.trim(), FAKE_API_KEY);
    assert!(dir.path().join(".env").is_file());
    assert!(dir.path().join("cron.d/misp-maintenance").is_file());
    assert!(dir.path().join("cron.d/misp-backup").is_file());
    assert!(dir.path().join("docs/installation-record.json").is_file());

    let enabled: Vec<String> = run
        .api
        .feeds()
        .into_iter()
        .filter(|f| f.enabled)
        .map(|f| f.name)
        .collect();
    assert!(enabled.contains(&"CIRCL OSINT Feed".to_string()));
    assert!(enabled.contains(&"The Botvrij.eu Data".to_string()));
    // The Botvrij sector feed is already one of MISP's stock feeds.
    assert_eq!(run.api.added().len(), config.sector_feeds.len() - 1);
    assert!(run.api.calls().contains(&"fetch_all".to_string()));
    assert_eq!(run.runtime.copied().len(), 1);
}

#[tokio::test]
async fn test_excluding_integrations_skips_api_phases() {
    let dir = tempfile::tempdir().unwrap();
    let config = InstallConfig {
        exclude_features: vec!["category:integrations".to_string()],
        ..install_dir(dir.path())
    };

    let run = install(config, FakeRuntime::new(), FakeApi::new()).await;

    assert!(run.report.success(), "{}", run.report.render());
    for skipped in ["7", "8", "8.5", "9", "9.1", "10"] {
        assert_eq!(
            run.report.status_of(&id(skipped)),
            Some(PhaseStatus::Skipped),
            "phase {skipped}"
        );
        assert_eq!(run.store.status(&id(skipped)), PhaseStatus::Skipped);
    }
    assert_eq!(run.report.count(PhaseStatus::Completed), 11);
    assert!(run.api.calls().is_empty());
    assert!(!run.runtime.calls().iter().any(|c| c.starts_with("exec")));
}

#[tokio::test]
async fn test_rerun_after_success_touches_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let config = install_dir(dir.path());
    let first = install(config.clone(), FakeRuntime::new(), FakeApi::with_default_feeds()).await;
    assert!(first.report.success());

    let second = install(config, FakeRuntime::new(), FakeApi::new()).await;
    assert!(second.report.success());
    assert!(second.report.entries.iter().all(|e| e.resumed));
    assert!(second.runtime.calls().is_empty());
    assert!(second.api.calls().is_empty());
}

#[tokio::test]
async fn test_failed_pull_resumes_from_pull() {
    let dir = tempfile::tempdir().unwrap();
    let config = install_dir(dir.path());

    let failed = install(
        config.clone(),
        FakeRuntime::new().failing_on("pull"),
        FakeApi::with_default_feeds(),
    )
    .await;
    assert!(!failed.report.success());
    assert_eq!(failed.report.failure.as_ref().unwrap().phase_id, id("4"));
    for done in ["1", "2", "3"] {
        assert_eq!(failed.store.status(&id(done)), PhaseStatus::Completed);
    }
    assert_eq!(failed.store.status(&id("4")), PhaseStatus::Failed);
    assert_eq!(failed.store.status(&id("5")), PhaseStatus::Pending);
    assert!(!failed.runtime.calls().contains(&"up".to_string()));

    let resumed = install(config, FakeRuntime::new(), FakeApi::with_default_feeds()).await;
    assert!(resumed.report.success(), "{}", resumed.report.render());
    let calls = resumed.runtime.calls();
    assert_eq!(calls.first().map(String::as_str), Some("pull"));
    assert!(!calls.contains(&"check".to_string()));
}

#[tokio::test]
async fn test_unknown_exclusion_still_installs_everything() {
    let dir = tempfile::tempdir().unwrap();
    let config = InstallConfig {
        exclude_features: vec!["not-a-real-feature".to_string()],
        ..install_dir(dir.path())
    };
    let resolution = resolve_exclusions(
        &misp_install_core::builtin_registry(),
        &config.exclusion_spec(),
    );
    assert_eq!(resolution.warnings.len(), 1);

    let run = install_with(
        config,
        resolution.skip_set,
        FakeRuntime::new(),
        FakeApi::with_default_feeds(),
    )
    .await;
    assert_eq!(run.report.count(PhaseStatus::Completed), 17);
}
