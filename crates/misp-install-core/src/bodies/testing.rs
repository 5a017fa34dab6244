//! Shared setup for phase body tests.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use misp_platform::fakes::{FakeApi, FakeRuntime};

use crate::catalog::InstallEnvironment;
use crate::config::InstallConfig;
use crate::state::MemoryPhaseStateStore;

/// Config rooted in `dir` with a compose file present.
pub(crate) fn config_in(dir: &Path) -> InstallConfig {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join("docker-compose.yml"), "services: {}\n").unwrap();
    InstallConfig {
        install_dir: dir.to_path_buf(),
        cron_dir: dir.join("cron.d"),
        ..InstallConfig::default()
    }
}

pub(crate) struct Harness {
    pub runtime: Arc<FakeRuntime>,
    pub api: Arc<FakeApi>,
    pub store: Arc<MemoryPhaseStateStore>,
    pub env: Arc<InstallEnvironment>,
}

pub(crate) fn harness(config: InstallConfig, runtime: FakeRuntime, api: FakeApi) -> Harness {
    let runtime = Arc::new(runtime);
    let api = Arc::new(api);
    let store = Arc::new(MemoryPhaseStateStore::new());
    let env = Arc::new(
        InstallEnvironment::new(config, runtime.clone(), api.clone(), store.clone())
            .with_health_poll(Duration::from_millis(1)),
    );
    Harness {
        runtime,
        api,
        store,
        env,
    }
}
