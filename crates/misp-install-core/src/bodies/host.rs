//! Host-side phases: widgets, schedules, and the installation record.

use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::write_file_atomic;
use crate::catalog::InstallEnvironment;
use crate::config::InstallConfig;
use crate::phase::{PhaseBody, PhaseId, PhaseOutput};
use crate::state::PhaseStatus;

const CAKE: &str = "/var/www/MISP/app/Console/cake";
const WIDGET_DEST: &str = "/var/www/MISP/app/Lib/Dashboard/Custom";
const MAINTENANCE_CRON: &str = "misp-maintenance";
const BACKUP_CRON: &str = "misp-backup";
const BACKUP_SCRIPT: &str = "scripts/misp-backup.sh";
const BACKUP_RETENTION_DAYS: u32 = 30;
const DB_SERVICE: &str = "db";
pub(crate) const RECORD_FILE: &str = "installation-record.json";

const CRON_HEADER: &str =
    "SHELL=/bin/sh\nPATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin\n";

/// Copy `*.php` widgets from the widgets directory into the container.
pub struct InstallWidgets(pub Arc<InstallEnvironment>);

#[async_trait]
impl PhaseBody for InstallWidgets {
    async fn execute(&self) -> Result<PhaseOutput> {
        let config = &self.0.config;
        let dir = config.widgets_dir();
        if !dir.is_dir() {
            bail!("widgets directory {} not found", dir.display());
        }

        let mut widgets: Vec<PathBuf> = std::fs::read_dir(&dir)
            .with_context(|| format!("failed to list {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "php"))
            .collect();
        widgets.sort();

        for widget in &widgets {
            let Some(name) = widget.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let dest = format!("{WIDGET_DEST}/{name}");
            self.0
                .runtime
                .copy_into(&config.misp_service, widget, &dest)
                .await
                .with_context(|| format!("failed to install widget {name}"))?;
            debug!(widget = %name, "Installed widget");
        }
        // The dashboard only picks up new widget classes after a restart.
        if !widgets.is_empty() {
            self.0
                .runtime
                .restart(&config.misp_service)
                .await
                .context("failed to restart MISP after installing widgets")?;
        }
        Ok(PhaseOutput::with_detail(format!(
            "installed {} widgets",
            widgets.len()
        )))
    }
}

fn compose_prefix(config: &InstallConfig) -> String {
    format!(
        "cd {} && docker compose -f {}",
        config.install_dir.display(),
        config.compose_path().display()
    )
}

pub(crate) fn render_maintenance_cron(config: &InstallConfig) -> String {
    let prefix = compose_prefix(config);
    let log = config.install_dir.join("logs/maintenance.log");
    let mut out = format!("# Generated by misp-install: MISP content updates\n{CRON_HEADER}");
    for (schedule, task) in [
        ("0 2 * * *", "Admin updateGalaxies"),
        ("15 2 * * *", "Admin updateTaxonomies"),
        ("30 2 * * *", "Admin updateWarningLists"),
        ("45 2 * * *", "Admin updateNoticeLists"),
        ("0 3 * * *", "Admin updateObjectTemplates 1"),
    ] {
        let _ = writeln!(
            out,
            "{schedule} root {prefix} exec -T {} {CAKE} {task} >> {} 2>&1",
            config.misp_service,
            log.display()
        );
    }
    out
}

/// Nightly content updates via cron.
pub struct ScheduleMaintenance(pub Arc<InstallEnvironment>);

#[async_trait]
impl PhaseBody for ScheduleMaintenance {
    async fn execute(&self) -> Result<PhaseOutput> {
        let path = self.0.config.cron_dir.join(MAINTENANCE_CRON);
        write_file_atomic(
            &path,
            render_maintenance_cron(&self.0.config).as_bytes(),
            Some(0o644),
        )?;
        info!(path = %path.display(), "Installed maintenance schedule");
        Ok(PhaseOutput::with_detail(format!("wrote {}", path.display())))
    }
}

pub(crate) fn render_backup_script(config: &InstallConfig) -> String {
    let install_dir = config.install_dir.display();
    let backups = config.install_dir.join("backups");
    let compose = config.compose_path();
    format!(
        r#"#!/bin/sh
# Generated by misp-install: database and configuration backup
set -eu

STAMP=$(date +%Y%m%d-%H%M%S)
DEST="{backups}/$STAMP"
mkdir -p "$DEST"
cd "{install_dir}"

docker compose -f "{compose}" exec -T {DB_SERVICE} \
    sh -c 'mysqldump --single-transaction -u"$MYSQL_USER" -p"$MYSQL_PASSWORD" "$MYSQL_DATABASE"' \
    | gzip > "$DEST/misp-db.sql.gz"
tar -czf "$DEST/config.tar.gz" .env "{compose}"

find "{backups}" -mindepth 1 -maxdepth 1 -type d -mtime +{BACKUP_RETENTION_DAYS} -exec rm -rf {{}} +
"#,
        backups = backups.display(),
        compose = compose.display(),
    )
}

/// Backup script plus its nightly schedule.
pub struct ScheduleBackups(pub Arc<InstallEnvironment>);

#[async_trait]
impl PhaseBody for ScheduleBackups {
    async fn execute(&self) -> Result<PhaseOutput> {
        let config = &self.0.config;
        let script = config.install_dir.join(BACKUP_SCRIPT);
        write_file_atomic(&script, render_backup_script(config).as_bytes(), Some(0o755))?;

        let cron = format!(
            "# Generated by misp-install: nightly backup\n{CRON_HEADER}0 1 * * * root {} >> {} 2>&1\n",
            script.display(),
            config.install_dir.join("logs/backup.log").display()
        );
        let cron_path = config.cron_dir.join(BACKUP_CRON);
        write_file_atomic(&cron_path, cron.as_bytes(), Some(0o644))?;

        info!(script = %script.display(), cron = %cron_path.display(), "Installed backup schedule");
        Ok(PhaseOutput::with_detail(format!(
            "backups to {} kept {BACKUP_RETENTION_DAYS} days",
            config.install_dir.join("backups").display()
        )))
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct PhaseEvidence {
    pub phase_id: PhaseId,
    pub status: PhaseStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Evidence of what was installed, for audit files.
#[derive(Debug, Serialize)]
pub(crate) struct InstallationRecord {
    pub generated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub organisation: String,
    pub base_url: String,
    pub admin_email: String,
    pub misp_version: Option<String>,
    pub installed_features: Vec<String>,
    pub excluded_features: Vec<String>,
    pub phases: Vec<PhaseEvidence>,
}

/// Write the installation evidence record plus its SHA-256.
pub struct ComplianceRecord(pub Arc<InstallEnvironment>);

impl ComplianceRecord {
    async fn build(&self) -> InstallationRecord {
        let env = &self.0;
        let misp_version = if env.config.api_key_source().is_available() {
            env.api.version().await.ok()
        } else {
            None
        };

        let (excluded, installed): (Vec<_>, Vec<_>) = env
            .registry
            .list_features()
            .iter()
            .partition(|f| env.skip_set.contains(&f.id));

        InstallationRecord {
            generated_at: Utc::now(),
            run_id: env.store.load_manifest().map(|m| m.run_id),
            organisation: env.config.organisation.clone(),
            base_url: env.config.base_url.clone(),
            admin_email: env.config.admin_email.clone(),
            misp_version,
            installed_features: installed.iter().map(|f| f.id.to_string()).collect(),
            excluded_features: excluded.iter().map(|f| f.id.to_string()).collect(),
            phases: env
                .store
                .all()
                .into_values()
                .map(|state| PhaseEvidence {
                    phase_id: state.phase_id,
                    status: state.status,
                    timestamp: state.timestamp,
                    detail: state.detail,
                })
                .collect(),
        }
    }
}

#[async_trait]
impl PhaseBody for ComplianceRecord {
    async fn execute(&self) -> Result<PhaseOutput> {
        let record = self.build().await;
        let mut body = serde_json::to_vec_pretty(&record)?;
        body.push(b'\n');
        let digest = hex::encode(Sha256::digest(&body));

        let path = self.0.config.docs_dir().join(RECORD_FILE);
        write_file_atomic(&path, &body, Some(0o644))?;
        let sidecar = path.with_extension("json.sha256");
        write_file_atomic(
            &sidecar,
            format!("{digest}  {RECORD_FILE}\n").as_bytes(),
            Some(0o644),
        )?;

        info!(path = %path.display(), digest = %digest, "Wrote installation record");
        Ok(PhaseOutput::with_detail(format!(
            "evidence written to {} (sha256 {})",
            path.display(),
            &digest[..12]
        )))
    }
}
