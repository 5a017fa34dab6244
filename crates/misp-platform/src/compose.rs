//! Docker Compose command runner
//!
//! Wraps `docker compose -f <file> ...` invocations for the MISP stack.
//! Every command runs under a timeout and has its output captured, so a
//! hung container runtime surfaces as [`PlatformError::Timeout`] rather
//! than a stuck installer.

use crate::error::PlatformError;
use crate::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Health of a compose service as reported by `docker inspect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceHealth {
    /// Healthcheck passing
    Healthy,
    /// Healthcheck still in its start period
    Starting,
    /// Healthcheck failing
    Unhealthy,
    /// Container running without a healthcheck
    Running,
    /// No container for the service
    NotRunning,
}

impl ServiceHealth {
    /// Parse the `<state> <health>` pair printed by the inspect template.
    pub fn parse(inspect_output: &str) -> Self {
        let mut parts = inspect_output.split_whitespace();
        let state = parts.next().unwrap_or("");
        let health = parts.next().unwrap_or("");

        if state != "running" {
            return ServiceHealth::NotRunning;
        }
        match health {
            "healthy" => ServiceHealth::Healthy,
            "starting" => ServiceHealth::Starting,
            "unhealthy" => ServiceHealth::Unhealthy,
            _ => ServiceHealth::Running,
        }
    }

    /// Whether the service can take traffic.
    pub fn is_ready(&self) -> bool {
        matches!(self, ServiceHealth::Healthy | ServiceHealth::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceHealth::Healthy => "healthy",
            ServiceHealth::Starting => "starting",
            ServiceHealth::Unhealthy => "unhealthy",
            ServiceHealth::Running => "running",
            ServiceHealth::NotRunning => "not running",
        }
    }
}

impl std::fmt::Display for ServiceHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Captured output of a command.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Narrow interface to the container orchestration layer.
///
/// Inject [`ComposeRunner`] in production, or a stub for tests.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Confirm docker and the compose plugin are usable; returns the version line.
    async fn check_available(&self) -> Result<String>;

    /// Pull all images of the compose project.
    async fn pull(&self) -> Result<()>;

    /// Start the compose project detached.
    async fn up(&self) -> Result<()>;

    /// Restart a single service.
    async fn restart(&self, service: &str) -> Result<()>;

    /// Run a command inside a running service container (no TTY).
    async fn exec(&self, service: &str, args: &[String]) -> Result<ExecOutput>;

    /// Copy a host path into a service container.
    async fn copy_into(&self, service: &str, src: &Path, dest: &str) -> Result<()>;

    /// Current health of a service.
    async fn health(&self, service: &str) -> Result<ServiceHealth>;

    /// Poll [`ContainerRuntime::health`] until the service is ready or
    /// `deadline` elapses.
    async fn wait_healthy(
        &self,
        service: &str,
        deadline: Duration,
        poll: Duration,
    ) -> Result<ServiceHealth> {
        let started = tokio::time::Instant::now();
        loop {
            let health = self.health(service).await?;
            debug!(service, health = %health, "Polled service health");
            if health.is_ready() {
                return Ok(health);
            }
            if started.elapsed() + poll > deadline {
                return Err(PlatformError::Timeout {
                    operation: format!("waiting for {service} to become healthy (last: {health})"),
                    secs: deadline.as_secs(),
                });
            }
            tokio::time::sleep(poll).await;
        }
    }
}

/// Compose project location and command settings.
#[derive(Debug, Clone)]
pub struct ComposeConfig {
    /// Executable to invoke (normally `docker`)
    pub program: String,
    /// Directory the compose project lives in
    pub project_dir: PathBuf,
    /// Compose file, relative to `project_dir` or absolute
    pub compose_file: PathBuf,
    /// Upper bound for a single command
    pub command_timeout: Duration,
}

impl ComposeConfig {
    pub fn new(project_dir: impl Into<PathBuf>, compose_file: impl Into<PathBuf>) -> Self {
        ComposeConfig {
            program: "docker".to_string(),
            project_dir: project_dir.into(),
            compose_file: compose_file.into(),
            command_timeout: Duration::from_secs(600),
        }
    }

    pub fn with_program(mut self, program: &str) -> Self {
        self.program = program.to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }
}

/// [`ContainerRuntime`] backed by the docker CLI.
pub struct ComposeRunner {
    config: ComposeConfig,
}

impl ComposeRunner {
    pub fn new(config: ComposeConfig) -> Self {
        ComposeRunner { config }
    }

    pub fn config(&self) -> &ComposeConfig {
        &self.config
    }

    fn compose_args(&self) -> Vec<String> {
        vec![
            "compose".to_string(),
            "-f".to_string(),
            self.config.compose_file.to_string_lossy().to_string(),
        ]
    }

    /// Run `program args...` in the project directory and capture output.
    async fn run(&self, args: &[String]) -> Result<ExecOutput> {
        let rendered = format!("{} {}", self.config.program, args.join(" "));
        debug!(command = %rendered, "Running container command");

        let child = Command::new(&self.config.program)
            .args(args)
            .current_dir(&self.config.project_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    PlatformError::DockerNotFound
                } else {
                    PlatformError::Io(e)
                }
            })?;

        let output = tokio::time::timeout(self.config.command_timeout, child.wait_with_output())
            .await
            .map_err(|_| PlatformError::Timeout {
                operation: rendered.clone(),
                secs: self.config.command_timeout.as_secs(),
            })??;

        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    /// Like [`ComposeRunner::run`] but a non-zero exit is an error.
    async fn run_checked(&self, args: &[String]) -> Result<ExecOutput> {
        let output = self.run(args).await?;
        if !output.success() {
            return Err(PlatformError::CommandFailed {
                command: format!("{} {}", self.config.program, args.join(" ")),
                code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }

    async fn compose(&self, extra: &[&str]) -> Result<ExecOutput> {
        let mut args = self.compose_args();
        args.extend(extra.iter().map(|s| s.to_string()));
        self.run_checked(&args).await
    }
}

#[async_trait]
impl ContainerRuntime for ComposeRunner {
    async fn check_available(&self) -> Result<String> {
        let docker = self.run_checked(&["--version".to_string()]).await?;
        let compose = self
            .run_checked(&["compose".to_string(), "version".to_string()])
            .await?;
        let version = format!("{}; {}", docker.stdout.trim(), compose.stdout.trim());
        info!(version = %version, "Container runtime available");
        Ok(version)
    }

    async fn pull(&self) -> Result<()> {
        info!("Pulling compose images");
        self.compose(&["pull", "--quiet"]).await.map(|_| ())
    }

    async fn up(&self) -> Result<()> {
        info!("Starting compose project");
        self.compose(&["up", "-d", "--remove-orphans"]).await.map(|_| ())
    }

    async fn restart(&self, service: &str) -> Result<()> {
        info!(service, "Restarting service");
        self.compose(&["restart", service]).await.map(|_| ())
    }

    async fn exec(&self, service: &str, args: &[String]) -> Result<ExecOutput> {
        let mut full = self.compose_args();
        full.push("exec".to_string());
        full.push("-T".to_string());
        full.push(service.to_string());
        full.extend(args.iter().cloned());
        self.run_checked(&full).await
    }

    async fn copy_into(&self, service: &str, src: &Path, dest: &str) -> Result<()> {
        let target = format!("{service}:{dest}");
        let src = src.to_string_lossy().to_string();
        self.compose(&["cp", &src, &target]).await.map(|_| ())
    }

    async fn health(&self, service: &str) -> Result<ServiceHealth> {
        let ps = self.compose(&["ps", "-q", service]).await?;
        let Some(container_id) = ps.stdout.lines().map(str::trim).find(|l| !l.is_empty()) else {
            return Ok(ServiceHealth::NotRunning);
        };

        let inspect = self
            .run(&[
                "inspect".to_string(),
                "--format".to_string(),
                "{{.State.Status}} {{if .State.Health}}{{.State.Health.Status}}{{end}}"
                    .to_string(),
                container_id.to_string(),
            ])
            .await?;

        if !inspect.success() {
            warn!(service, stderr = %inspect.stderr.trim(), "docker inspect failed");
            return Ok(ServiceHealth::NotRunning);
        }
        Ok(ServiceHealth::parse(&inspect.stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_parse_health_states() {
        assert_eq!(ServiceHealth::parse("running healthy\n"), ServiceHealth::Healthy);
        assert_eq!(ServiceHealth::parse("running starting"), ServiceHealth::Starting);
        assert_eq!(ServiceHealth::parse("running unhealthy"), ServiceHealth::Unhealthy);
        assert_eq!(ServiceHealth::parse("running "), ServiceHealth::Running);
        assert_eq!(ServiceHealth::parse("exited "), ServiceHealth::NotRunning);
        assert_eq!(ServiceHealth::parse(""), ServiceHealth::NotRunning);
    }

    #[test]
    fn test_ready_states() {
        assert!(ServiceHealth::Healthy.is_ready());
        assert!(ServiceHealth::Running.is_ready());
        assert!(!ServiceHealth::Starting.is_ready());
        assert!(!ServiceHealth::Unhealthy.is_ready());
        assert!(!ServiceHealth::NotRunning.is_ready());
    }

    #[tokio::test]
    async fn test_missing_program_reports_docker_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ComposeRunner::new(
            ComposeConfig::new(dir.path(), "docker-compose.yml")
                .with_program("definitely-not-a-docker-binary"),
        );
        match runner.check_available().await {
            Err(PlatformError::DockerNotFound) => {}
            other => panic!("expected DockerNotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failing_command_is_command_failed() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ComposeRunner::new(
            ComposeConfig::new(dir.path(), "docker-compose.yml").with_program("false"),
        );
        match runner.pull().await {
            Err(PlatformError::CommandFailed { code, .. }) => assert_ne!(code, 0),
            other => panic!("expected CommandFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_exec_captures_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ComposeRunner::new(
            ComposeConfig::new(dir.path(), "docker-compose.yml").with_program("echo"),
        );
        let out = runner
            .exec("misp-core", &["hello".to_string()])
            .await
            .unwrap();
        assert!(out.stdout.contains("exec -T misp-core hello"));
    }

    /// Health reports replayed from a script; sticks on the last entry.
    struct ScriptedHealth {
        script: Mutex<Vec<ServiceHealth>>,
    }

    #[async_trait]
    impl ContainerRuntime for ScriptedHealth {
        async fn check_available(&self) -> Result<String> {
            Ok("stub".to_string())
        }
        async fn pull(&self) -> Result<()> {
            Ok(())
        }
        async fn up(&self) -> Result<()> {
            Ok(())
        }
        async fn restart(&self, _service: &str) -> Result<()> {
            Ok(())
        }
        async fn exec(&self, _service: &str, _args: &[String]) -> Result<ExecOutput> {
            Ok(ExecOutput::default())
        }
        async fn copy_into(&self, _service: &str, _src: &Path, _dest: &str) -> Result<()> {
            Ok(())
        }
        async fn health(&self, _service: &str) -> Result<ServiceHealth> {
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                Ok(script.remove(0))
            } else {
                Ok(script[0])
            }
        }
    }

    #[tokio::test]
    async fn test_wait_healthy_polls_until_ready() {
        let runtime = ScriptedHealth {
            script: Mutex::new(vec![
                ServiceHealth::NotRunning,
                ServiceHealth::Starting,
                ServiceHealth::Healthy,
            ]),
        };
        let health = runtime
            .wait_healthy("misp-core", Duration::from_secs(5), Duration::from_millis(5))
            .await
            .unwrap();
        assert_eq!(health, ServiceHealth::Healthy);
    }

    #[tokio::test]
    async fn test_wait_healthy_times_out() {
        let runtime = ScriptedHealth {
            script: Mutex::new(vec![ServiceHealth::Starting]),
        };
        let result = runtime
            .wait_healthy("misp-core", Duration::from_millis(30), Duration::from_millis(10))
            .await;
        assert!(matches!(result, Err(PlatformError::Timeout { .. })));
    }
}
