//! Container lifecycle phases: prerequisites through health, plus final
//! verification.

use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::{debug, info};

use super::write_file_atomic;
use crate::catalog::InstallEnvironment;
use crate::config::InstallConfig;
use crate::phase::{PhaseBody, PhaseOutput};

/// Docker plus the compose file must be present.
pub struct CheckPrerequisites(pub Arc<InstallEnvironment>);

#[async_trait]
impl PhaseBody for CheckPrerequisites {
    async fn execute(&self) -> Result<PhaseOutput> {
        let version = self
            .0
            .runtime
            .check_available()
            .await
            .context("docker compose is not usable")?;

        let compose = self.0.config.compose_path();
        if !compose.is_file() {
            bail!("compose file {} not found", compose.display());
        }
        debug!(compose = %compose.display(), "Found compose file");
        Ok(PhaseOutput::with_detail(version))
    }
}

/// Install, state, docs, backup and log directories.
pub struct PrepareDirectories(pub Arc<InstallEnvironment>);

#[async_trait]
impl PhaseBody for PrepareDirectories {
    async fn execute(&self) -> Result<PhaseOutput> {
        let config = &self.0.config;
        let dirs = [
            config.install_dir.clone(),
            config.state_dir(),
            config.docs_dir(),
            config.install_dir.join("backups"),
            config.install_dir.join("logs"),
        ];
        for dir in &dirs {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(PhaseOutput::with_detail(format!(
            "prepared {} directories",
            dirs.len()
        )))
    }
}

/// Render the compose `.env` file.
pub(crate) fn render_env(config: &InstallConfig) -> String {
    let mut out = String::from("# Generated by misp-install\n");
    let _ = writeln!(out, "BASE_URL={}", config.base_url);
    let _ = writeln!(out, "ADMIN_EMAIL={}", config.admin_email);
    let _ = writeln!(out, "ADMIN_ORG={}", config.organisation);
    for (key, value) in &config.env {
        let _ = writeln!(out, "{key}={value}");
    }
    out
}

/// Write `<install_dir>/.env` for the compose project.
pub struct WriteEnvironment(pub Arc<InstallEnvironment>);

#[async_trait]
impl PhaseBody for WriteEnvironment {
    async fn execute(&self) -> Result<PhaseOutput> {
        let path = self.0.config.install_dir.join(".env");
        write_file_atomic(&path, render_env(&self.0.config).as_bytes(), Some(0o600))?;
        Ok(PhaseOutput::with_detail(format!(
            "wrote {}",
            path.display()
        )))
    }
}

pub struct PullImages(pub Arc<InstallEnvironment>);

#[async_trait]
impl PhaseBody for PullImages {
    async fn execute(&self) -> Result<PhaseOutput> {
        self.0.runtime.pull().await.context("failed to pull images")?;
        Ok(PhaseOutput::done())
    }
}

pub struct StartContainers(pub Arc<InstallEnvironment>);

#[async_trait]
impl PhaseBody for StartContainers {
    async fn execute(&self) -> Result<PhaseOutput> {
        self.0
            .runtime
            .up()
            .await
            .context("failed to start containers")?;
        Ok(PhaseOutput::done())
    }
}

/// Block until the MISP service reports healthy.
pub struct WaitForMisp(pub Arc<InstallEnvironment>);

#[async_trait]
impl PhaseBody for WaitForMisp {
    async fn execute(&self) -> Result<PhaseOutput> {
        let service = &self.0.config.misp_service;
        info!(service = %service, "Waiting for MISP to become healthy");
        let health = self
            .0
            .runtime
            .wait_healthy(service, self.0.config.health_timeout(), self.0.health_poll)
            .await?;
        Ok(PhaseOutput::with_detail(format!("{service} is {health}")))
    }
}

/// Final check: container health, plus the API when a key exists.
pub struct VerifyInstallation(pub Arc<InstallEnvironment>);

#[async_trait]
impl PhaseBody for VerifyInstallation {
    async fn execute(&self) -> Result<PhaseOutput> {
        let config = &self.0.config;
        let service = &config.misp_service;
        let health = self.0.runtime.health(service).await?;
        if !health.is_ready() {
            bail!("{service} is {health}");
        }

        if !config.api_key_source().is_available() {
            return Ok(PhaseOutput::with_detail(format!(
                "{service} is {health}; no API key, API not checked"
            )));
        }
        let version = self
            .0
            .api
            .version()
            .await
            .context("MISP API is not answering")?;
        Ok(PhaseOutput::with_detail(format!(
            "{service} is {health}; MISP {version} answering at {}",
            config.base_url
        )))
    }
}
