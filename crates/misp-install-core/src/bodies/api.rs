//! Phases that configure MISP through its API.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use super::write_file_atomic;
use crate::catalog::InstallEnvironment;
use crate::phase::{PhaseBody, PhaseOutput};

const CAKE: &str = "/var/www/MISP/app/Console/cake";
const AUTH_KEY_LEN: usize = 40;

/// Default feeds switched on after `loadDefaultFeeds`.
const DEFAULT_ENABLED_FEEDS: &[&str] = &["CIRCL OSINT Feed", "The Botvrij.eu Data"];

/// First 40-character alphanumeric token in `output`.
pub(crate) fn parse_auth_key(output: &str) -> Option<String> {
    output
        .split(|c: char| !c.is_ascii_alphanumeric())
        .find(|word| word.len() == AUTH_KEY_LEN)
        .map(str::to_string)
}

/// Reset the admin user's auth key and store it in the key file.
pub struct GenerateApiKey(pub Arc<InstallEnvironment>);

#[async_trait]
impl PhaseBody for GenerateApiKey {
    async fn execute(&self) -> Result<PhaseOutput> {
        let config = &self.0.config;
        if config.api_key.as_deref().is_some_and(|k| !k.trim().is_empty()) {
            info!("Using the configured API key; not generating one");
            return Ok(PhaseOutput::with_detail("using the configured API key"));
        }

        let args: Vec<String> = [CAKE, "user", "change_authkey", config.admin_email.as_str()]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let output = self
            .0
            .runtime
            .exec(&config.misp_service, &args)
            .await
            .context("failed to run cake user change_authkey")?;
        let key = parse_auth_key(&output.stdout)
            .context("no API key found in cake user change_authkey output")?;

        let path = config.api_key_file();
        write_file_atomic(&path, format!("{key}\n").as_bytes(), Some(0o600))?;
        info!(path = %path.display(), "Stored API key");
        Ok(PhaseOutput::with_detail(format!(
            "API key for {} stored in {}",
            config.admin_email,
            path.display()
        )))
    }
}

async fn apply_settings(
    env: &InstallEnvironment,
    settings: &BTreeMap<String, Value>,
) -> Result<usize> {
    for (name, value) in settings {
        env.api
            .set_setting(name, value)
            .await
            .with_context(|| format!("failed to set {name}"))?;
    }
    Ok(settings.len())
}

/// Base URL, organisation and the configured settings map.
pub struct ApplyBaseSettings(pub Arc<InstallEnvironment>);

#[async_trait]
impl PhaseBody for ApplyBaseSettings {
    async fn execute(&self) -> Result<PhaseOutput> {
        let config = &self.0.config;
        let mut settings = config.settings.clone();
        settings
            .entry("MISP.baseurl".to_string())
            .or_insert_with(|| Value::from(config.base_url.clone()));
        settings
            .entry("MISP.org".to_string())
            .or_insert_with(|| Value::from(config.organisation.clone()));

        let applied = apply_settings(&self.0, &settings).await?;
        Ok(PhaseOutput::with_detail(format!("applied {applied} settings")))
    }
}

pub(crate) fn hardening_settings() -> BTreeMap<String, Value> {
    [
        ("Security.password_policy_length", Value::from(12)),
        (
            "Security.password_policy_complexity",
            Value::from(r"/^((?=.*\d)|(?=.*\W+))(?![\n])(?=.*[A-Z])(?=.*[a-z]).*$|.{16,}/"),
        ),
        ("Security.require_password_confirmation", Value::from(true)),
        ("Security.sanitise_attribute_on_delete", Value::from(true)),
        ("Security.log_each_individual_auth_fail", Value::from(true)),
        ("Session.timeout", Value::from(60)),
        ("Session.autoRegenerate", Value::from(true)),
        ("MISP.log_user_ips", Value::from(true)),
    ]
    .into_iter()
    .map(|(name, value)| (name.to_string(), value))
    .collect()
}

/// Password, session and audit logging policy.
pub struct SecurityHardening(pub Arc<InstallEnvironment>);

#[async_trait]
impl PhaseBody for SecurityHardening {
    async fn execute(&self) -> Result<PhaseOutput> {
        let applied = apply_settings(&self.0, &hardening_settings()).await?;
        Ok(PhaseOutput::with_detail(format!(
            "applied {applied} hardening settings"
        )))
    }
}

/// Import MISP's default feed list and enable the OSINT feeds.
pub struct EnableThreatFeeds(pub Arc<InstallEnvironment>);

#[async_trait]
impl PhaseBody for EnableThreatFeeds {
    async fn execute(&self) -> Result<PhaseOutput> {
        let api = &self.0.api;
        api.load_default_feeds()
            .await
            .context("failed to load default feeds")?;
        let feeds = api.list_feeds().await.context("failed to list feeds")?;

        let mut matched = 0;
        let mut enabled = 0;
        for wanted in DEFAULT_ENABLED_FEEDS {
            let Some(feed) = feeds.iter().find(|f| f.name.eq_ignore_ascii_case(wanted)) else {
                warn!(feed = %wanted, "Default feed not found");
                continue;
            };
            matched += 1;
            if !feed.enabled {
                api.enable_feed(&feed.id)
                    .await
                    .with_context(|| format!("failed to enable feed {}", feed.name))?;
                enabled += 1;
            }
        }
        if matched == 0 {
            bail!("none of the default feeds were found after loading the default feed list");
        }
        Ok(PhaseOutput::with_detail(format!(
            "{enabled} feeds enabled, {} already enabled",
            matched - enabled
        )))
    }
}

fn normalize_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_ascii_lowercase()
}

/// Register the configured sector feeds that are not present yet.
pub struct AddSectorFeeds(pub Arc<InstallEnvironment>);

#[async_trait]
impl PhaseBody for AddSectorFeeds {
    async fn execute(&self) -> Result<PhaseOutput> {
        let wanted = &self.0.config.sector_feeds;
        if wanted.is_empty() {
            return Ok(PhaseOutput::with_detail("no sector feeds configured"));
        }

        let api = &self.0.api;
        let mut present: HashSet<String> = api
            .list_feeds()
            .await
            .context("failed to list feeds")?
            .iter()
            .map(|f| normalize_url(&f.url))
            .collect();

        let mut added = 0;
        for feed in wanted {
            if !present.insert(normalize_url(&feed.url)) {
                continue;
            }
            let id = api
                .add_feed(feed)
                .await
                .with_context(|| format!("failed to add feed {}", feed.name))?;
            info!(feed = %feed.name, id = %id, "Added sector feed");
            added += 1;
        }
        Ok(PhaseOutput::with_detail(format!(
            "{added} feeds added, {} already present",
            wanted.len() - added
        )))
    }
}

pub struct FetchFeeds(pub Arc<InstallEnvironment>);

#[async_trait]
impl PhaseBody for FetchFeeds {
    async fn execute(&self) -> Result<PhaseOutput> {
        self.0
            .api
            .fetch_all_feeds()
            .await
            .context("failed to queue feed fetch")?;
        Ok(PhaseOutput::with_detail("fetch of all enabled feeds queued"))
    }
}
