//! In-memory fakes for the collaborator traits (testing only)
//!
//! `FakeRuntime` and `FakeApi` record every call and never touch docker or
//! the network.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::compose::{ContainerRuntime, ExecOutput, ServiceHealth};
use crate::error::PlatformError;
use crate::misp::{FeedSummary, NewFeed, PlatformApi};
use crate::Result;

/// Key printed by the default fake `cake user change_authkey` output.
pub const FAKE_API_KEY: &str = "0123456789abcdefABCDEF0123456789abcdefAB";

/// Version reported by [`FakeApi::version`].
pub const FAKE_MISP_VERSION: &str = "2.4.195";

// ---------------------------------------------------------------------------
// FakeRuntime
// ---------------------------------------------------------------------------

/// [`ContainerRuntime`] that records calls instead of running docker.
#[derive(Debug)]
pub struct FakeRuntime {
    calls: Mutex<Vec<String>>,
    copied: Mutex<Vec<(PathBuf, String)>>,
    exec_output: ExecOutput,
    health: ServiceHealth,
    fail_on: Option<String>,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        FakeRuntime {
            calls: Mutex::new(Vec::new()),
            copied: Mutex::new(Vec::new()),
            exec_output: ExecOutput {
                exit_code: 0,
                stdout: format!("Authkey updated: {FAKE_API_KEY}\n"),
                stderr: String::new(),
            },
            health: ServiceHealth::Healthy,
            fail_on: None,
        }
    }
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Output of every `exec`. A non-zero `exit_code` makes `exec` fail with
    /// [`PlatformError::CommandFailed`], as the compose runner does.
    pub fn with_exec_output(mut self, exit_code: i32, stdout: &str) -> Self {
        self.exec_output = ExecOutput {
            exit_code,
            stdout: stdout.to_string(),
            stderr: if exit_code == 0 {
                String::new()
            } else {
                "fake failure".to_string()
            },
        };
        self
    }

    pub fn with_health(mut self, health: ServiceHealth) -> Self {
        self.health = health;
        self
    }

    /// Make the operation named `op` (`pull`, `up`, `exec`, ...) fail.
    pub fn failing_on(mut self, op: &str) -> Self {
        self.fail_on = Some(op.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("fake lock poisoned").clone()
    }

    /// `(host path, container destination)` for every `copy_into`.
    pub fn copied(&self) -> Vec<(PathBuf, String)> {
        self.copied.lock().expect("fake lock poisoned").clone()
    }

    fn record(&self, op: &str, call: String) -> Result<()> {
        self.calls.lock().expect("fake lock poisoned").push(call);
        if self.fail_on.as_deref() == Some(op) {
            return Err(PlatformError::CommandFailed {
                command: format!("docker compose {op}"),
                code: 1,
                stderr: "fake failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn check_available(&self) -> Result<String> {
        self.record("check", "check".to_string())?;
        Ok("Docker Compose version v2.29.1".to_string())
    }

    async fn pull(&self) -> Result<()> {
        self.record("pull", "pull".to_string())
    }

    async fn up(&self) -> Result<()> {
        self.record("up", "up".to_string())
    }

    async fn restart(&self, service: &str) -> Result<()> {
        self.record("restart", format!("restart {service}"))
    }

    async fn exec(&self, service: &str, args: &[String]) -> Result<ExecOutput> {
        let call = format!("exec {service} {}", args.join(" "));
        self.record("exec", call.clone())?;
        if !self.exec_output.success() {
            return Err(PlatformError::CommandFailed {
                command: format!("docker compose {call}"),
                code: self.exec_output.exit_code,
                stderr: self.exec_output.stderr.clone(),
            });
        }
        Ok(self.exec_output.clone())
    }

    async fn copy_into(&self, service: &str, src: &Path, dest: &str) -> Result<()> {
        self.record("cp", format!("cp {service} {dest}"))?;
        self.copied
            .lock()
            .expect("fake lock poisoned")
            .push((src.to_path_buf(), dest.to_string()));
        Ok(())
    }

    async fn health(&self, _service: &str) -> Result<ServiceHealth> {
        Ok(self.health)
    }
}

// ---------------------------------------------------------------------------
// FakeApi
// ---------------------------------------------------------------------------

/// [`PlatformApi`] backed by an in-memory feed list.
#[derive(Debug, Default)]
pub struct FakeApi {
    calls: Mutex<Vec<String>>,
    settings: Mutex<Vec<(String, Value)>>,
    feeds: Mutex<Vec<FeedSummary>>,
    added: Mutex<Vec<NewFeed>>,
    fail_settings: bool,
}

/// Shorthand for a listed feed.
pub fn feed(id: &str, name: &str, url: &str, enabled: bool) -> FeedSummary {
    FeedSummary {
        id: id.to_string(),
        name: name.to_string(),
        url: url.to_string(),
        provider: "fake".to_string(),
        enabled,
    }
}

impl FakeApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_feeds(feeds: Vec<FeedSummary>) -> Self {
        FakeApi {
            feeds: Mutex::new(feeds),
            ..Self::default()
        }
    }

    /// MISP's two stock OSINT feeds, disabled.
    pub fn with_default_feeds() -> Self {
        Self::with_feeds(vec![
            feed(
                "1",
                "CIRCL OSINT Feed",
                "https://www.circl.lu/doc/misp/feed-osint",
                false,
            ),
            feed(
                "2",
                "The Botvrij.eu Data",
                "https://www.botvrij.eu/data/feed-osint",
                false,
            ),
        ])
    }

    /// Every `set_setting` answers 403.
    pub fn failing_settings(mut self) -> Self {
        self.fail_settings = true;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("fake lock poisoned").clone()
    }

    pub fn settings(&self) -> Vec<(String, Value)> {
        self.settings.lock().expect("fake lock poisoned").clone()
    }

    pub fn feeds(&self) -> Vec<FeedSummary> {
        self.feeds.lock().expect("fake lock poisoned").clone()
    }

    pub fn added(&self) -> Vec<NewFeed> {
        self.added.lock().expect("fake lock poisoned").clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().expect("fake lock poisoned").push(call);
    }
}

#[async_trait]
impl PlatformApi for FakeApi {
    async fn version(&self) -> Result<String> {
        self.record("version".to_string());
        Ok(FAKE_MISP_VERSION.to_string())
    }

    async fn set_setting(&self, name: &str, value: &Value) -> Result<()> {
        self.record(format!("setting {name}"));
        if self.fail_settings {
            return Err(PlatformError::Api {
                method: "POST".to_string(),
                path: format!("/servers/serverSettingsEdit/{name}"),
                status: 403,
                body: "forbidden".to_string(),
            });
        }
        self.settings
            .lock()
            .expect("fake lock poisoned")
            .push((name.to_string(), value.clone()));
        Ok(())
    }

    async fn load_default_feeds(&self) -> Result<()> {
        self.record("load_default_feeds".to_string());
        Ok(())
    }

    async fn list_feeds(&self) -> Result<Vec<FeedSummary>> {
        self.record("list_feeds".to_string());
        Ok(self.feeds())
    }

    async fn enable_feed(&self, id: &str) -> Result<()> {
        self.record(format!("enable {id}"));
        let mut feeds = self.feeds.lock().expect("fake lock poisoned");
        match feeds.iter_mut().find(|f| f.id == id) {
            Some(feed) => {
                feed.enabled = true;
                Ok(())
            }
            None => Err(PlatformError::Api {
                method: "POST".to_string(),
                path: format!("/feeds/enable/{id}"),
                status: 404,
                body: "Invalid feed.".to_string(),
            }),
        }
    }

    async fn add_feed(&self, new: &NewFeed) -> Result<String> {
        self.record(format!("add {}", new.url));
        let mut feeds = self.feeds.lock().expect("fake lock poisoned");
        let id = (feeds.len() + 100).to_string();
        feeds.push(feed(&id, &new.name, &new.url, new.enabled));
        self.added
            .lock()
            .expect("fake lock poisoned")
            .push(new.clone());
        Ok(id)
    }

    async fn fetch_all_feeds(&self) -> Result<()> {
        self.record("fetch_all".to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fake_runtime_records_and_fails_on_request() {
        let runtime = FakeRuntime::new().failing_on("pull");
        runtime.up().await.unwrap();
        assert!(matches!(
            runtime.pull().await,
            Err(PlatformError::CommandFailed { .. })
        ));
        assert_eq!(runtime.calls(), vec!["up", "pull"]);
    }

    #[tokio::test]
    async fn test_fake_exec_nonzero_exit_is_command_failure() {
        let runtime = FakeRuntime::new().with_exec_output(2, "");
        let args = vec!["true".to_string()];
        match runtime.exec("misp-core", &args).await {
            Err(PlatformError::CommandFailed { command, code, stderr }) => {
                assert_eq!(command, "docker compose exec misp-core true");
                assert_eq!(code, 2);
                assert_eq!(stderr, "fake failure");
            }
            other => panic!("expected CommandFailed, got {other:?}"),
        }
        assert_eq!(runtime.calls(), vec!["exec misp-core true"]);
    }

    #[tokio::test]
    async fn test_fake_api_feed_lifecycle() {
        let api = FakeApi::with_default_feeds();
        api.enable_feed("1").await.unwrap();
        assert!(api.enable_feed("42").await.is_err());
        let id = api
            .add_feed(&NewFeed {
                name: "x".to_string(),
                provider: "y".to_string(),
                url: "https://example.org".to_string(),
                source_format: "misp".to_string(),
                enabled: true,
            })
            .await
            .unwrap();
        let feeds = api.list_feeds().await.unwrap();
        assert!(feeds.iter().any(|f| f.id == "1" && f.enabled));
        assert!(feeds.iter().any(|f| f.id == id));
    }
}
