//! Installer configuration.
//!
//! Loaded from a `.json` or `.toml` document; every field has a default so
//! an empty document (or no document at all) installs everything into
//! `/opt/misp`. Unknown fields are rejected.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use misp_platform::{ApiKeySource, NewFeed};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::ConfigError;
use crate::exclusion::ExclusionSpec;

pub const ENV_BASE_URL: &str = "MISP_BASE_URL";
pub const ENV_API_KEY: &str = "MISP_API_KEY";
pub const ENV_STATE_DIR: &str = "MISP_INSTALL_STATE_DIR";

/// Everything the installer reads from its configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InstallConfig {
    /// Feature ids and `category:<name>` wildcards to leave out.
    pub exclude_features: Vec<String>,
    pub install_dir: PathBuf,
    /// Defaults to `<install_dir>/.install-state`.
    pub state_dir: Option<PathBuf>,
    pub compose_file: PathBuf,
    pub misp_service: String,
    pub base_url: String,
    pub admin_email: String,
    pub organisation: String,
    /// Pre-provisioned automation key; otherwise the key file is used.
    pub api_key: Option<String>,
    /// Defaults to `<state_dir>/api-key`.
    pub api_key_file: Option<PathBuf>,
    pub verify_tls: bool,
    pub phase_timeout_secs: u64,
    pub health_timeout_secs: u64,
    pub http_timeout_secs: u64,
    /// Relative paths resolve against `install_dir`.
    pub widgets_dir: PathBuf,
    /// Defaults to `<install_dir>/docs`.
    pub docs_dir: Option<PathBuf>,
    /// Where maintenance and backup schedules are installed.
    pub cron_dir: PathBuf,
    pub sector_feeds: Vec<NewFeed>,
    /// Server settings applied by the baseline settings phase.
    pub settings: BTreeMap<String, Value>,
    /// Extra entries appended to the generated `.env` file.
    pub env: BTreeMap<String, String>,
}

impl Default for InstallConfig {
    fn default() -> Self {
        InstallConfig {
            exclude_features: Vec::new(),
            install_dir: PathBuf::from("/opt/misp"),
            state_dir: None,
            compose_file: PathBuf::from("docker-compose.yml"),
            misp_service: "misp-core".to_string(),
            base_url: "https://localhost".to_string(),
            admin_email: "admin@admin.test".to_string(),
            organisation: "ORGNAME".to_string(),
            api_key: None,
            api_key_file: None,
            verify_tls: false,
            phase_timeout_secs: 600,
            health_timeout_secs: 900,
            http_timeout_secs: 60,
            widgets_dir: PathBuf::from("widgets"),
            docs_dir: None,
            cron_dir: PathBuf::from("/etc/cron.d"),
            sector_feeds: default_sector_feeds(),
            settings: default_settings(),
            env: BTreeMap::new(),
        }
    }
}

fn feed(name: &str, provider: &str, url: &str, source_format: &str) -> NewFeed {
    NewFeed {
        name: name.to_string(),
        provider: provider.to_string(),
        url: url.to_string(),
        source_format: source_format.to_string(),
        enabled: true,
    }
}

/// Public feeds relevant to utilities and ICS operators.
pub fn default_sector_feeds() -> Vec<NewFeed> {
    vec![
        feed(
            "CISA Known Exploited Vulnerabilities",
            "CISA",
            "https://www.cisa.gov/sites/default/files/feeds/known_exploited_vulnerabilities.csv",
            "csv",
        ),
        feed(
            "abuse.ch Feodo Tracker IP blocklist",
            "abuse.ch",
            "https://feodotracker.abuse.ch/downloads/ipblocklist.txt",
            "freetext",
        ),
        feed(
            "abuse.ch URLhaus recent URLs",
            "abuse.ch",
            "https://urlhaus.abuse.ch/downloads/text_recent/",
            "freetext",
        ),
        feed(
            "Botvrij.eu OSINT",
            "Botvrij.eu",
            "https://www.botvrij.eu/data/feed-osint",
            "misp",
        ),
    ]
}

/// Baseline server settings.
pub fn default_settings() -> BTreeMap<String, Value> {
    BTreeMap::from([
        ("MISP.default_event_distribution".to_string(), Value::from(0)),
        (
            "MISP.default_attribute_distribution".to_string(),
            Value::from("event"),
        ),
        ("MISP.tagging".to_string(), Value::from(true)),
        ("MISP.log_new_audit".to_string(), Value::from(true)),
        ("Plugin.Enrichment_services_enable".to_string(), Value::from(true)),
    ])
}

impl InstallConfig {
    /// Load from `path`, picking the parser by extension.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        let config = match extension.as_deref() {
            Some("json") => Self::from_json_str(&raw),
            Some("toml") => Self::from_toml_str(&raw),
            _ => return Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
        }
        .map_err(|detail| ConfigError::Parse {
            path: path.to_path_buf(),
            detail,
        })?;

        info!(
            path = %path.display(),
            excluded = config.exclude_features.len(),
            "Loaded installer config"
        );
        Ok(config)
    }

    /// `None` means defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => {
                debug!("No config file given; using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn from_json_str(raw: &str) -> Result<Self, String> {
        serde_json::from_str(raw).map_err(|e| e.to_string())
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, String> {
        toml::from_str(raw).map_err(|e| e.to_string())
    }

    /// Apply `MISP_BASE_URL`, `MISP_API_KEY` and `MISP_INSTALL_STATE_DIR`.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    /// Same as [`InstallConfig::apply_env_overrides`] with an injected lookup.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(url) = non_empty(ENV_BASE_URL) {
            debug!(base_url = %url, "base_url overridden from environment");
            self.base_url = url;
        }
        if let Some(key) = non_empty(ENV_API_KEY) {
            debug!("api_key overridden from environment");
            self.api_key = Some(key);
        }
        if let Some(dir) = non_empty(ENV_STATE_DIR) {
            debug!(state_dir = %dir, "state_dir overridden from environment");
            self.state_dir = Some(PathBuf::from(dir));
        }
    }

    /// Reject values no phase could work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &str, reason: &str| ConfigError::Invalid {
            field: field.to_string(),
            reason: reason.to_string(),
        };

        if !(self.base_url.starts_with("https://") || self.base_url.starts_with("http://")) {
            return Err(invalid("base_url", "must start with http:// or https://"));
        }
        if self.misp_service.trim().is_empty() {
            return Err(invalid("misp_service", "must not be empty"));
        }
        if !self.admin_email.contains('@') {
            return Err(invalid("admin_email", "must be an email address"));
        }
        for (field, value) in [
            ("phase_timeout_secs", self.phase_timeout_secs),
            ("health_timeout_secs", self.health_timeout_secs),
            ("http_timeout_secs", self.http_timeout_secs),
        ] {
            if value == 0 {
                return Err(invalid(field, "must be greater than zero"));
            }
        }
        for feed in &self.sector_feeds {
            if feed.url.trim().is_empty() {
                return Err(invalid("sector_feeds", "every feed needs a url"));
            }
        }
        if let Some(key) = self.env.keys().find(|k| k.is_empty() || k.contains('=')) {
            return Err(ConfigError::Invalid {
                field: "env".to_string(),
                reason: format!("invalid variable name {key:?}"),
            });
        }
        Ok(())
    }

    pub fn exclusion_spec(&self) -> ExclusionSpec {
        ExclusionSpec::new(self.exclude_features.iter().cloned())
    }

    pub fn state_dir(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| self.install_dir.join(".install-state"))
    }

    pub fn api_key_file(&self) -> PathBuf {
        self.api_key_file
            .clone()
            .unwrap_or_else(|| self.state_dir().join("api-key"))
    }

    /// Configured key if any, else the file the key generation phase writes.
    pub fn api_key_source(&self) -> ApiKeySource {
        match &self.api_key {
            Some(key) if !key.trim().is_empty() => ApiKeySource::Static(key.clone()),
            _ => ApiKeySource::File(self.api_key_file()),
        }
    }

    pub fn docs_dir(&self) -> PathBuf {
        self.docs_dir
            .clone()
            .unwrap_or_else(|| self.install_dir.join("docs"))
    }

    pub fn widgets_dir(&self) -> PathBuf {
        self.resolve(&self.widgets_dir)
    }

    pub fn compose_path(&self) -> PathBuf {
        self.resolve(&self.compose_file)
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.install_dir.join(path)
        }
    }

    pub fn phase_timeout(&self) -> Duration {
        Duration::from_secs(self.phase_timeout_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_is_all_defaults() {
        let config = InstallConfig::from_json_str("{}").unwrap();
        assert_eq!(config, InstallConfig::default());
        assert!(config.exclusion_spec().is_empty());
        assert_eq!(config.state_dir(), PathBuf::from("/opt/misp/.install-state"));
        assert_eq!(
            config.api_key_file(),
            PathBuf::from("/opt/misp/.install-state/api-key")
        );
        assert_eq!(config.compose_path(), PathBuf::from("/opt/misp/docker-compose.yml"));
        config.validate().unwrap();
    }

    #[test]
    fn test_json_exclusions() {
        let config = InstallConfig::from_json_str(
            r#"{"exclude_features": ["api-key", "category:automation"], "install_dir": "/srv/misp"}"#,
        )
        .unwrap();
        assert_eq!(
            config.exclusion_spec().tokens().to_vec(),
            vec!["api-key", "category:automation"]
        );
        assert_eq!(config.docs_dir(), PathBuf::from("/srv/misp/docs"));
    }

    #[test]
    fn test_non_string_token_is_parse_error() {
        assert!(InstallConfig::from_json_str(r#"{"exclude_features": [42]}"#).is_err());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = InstallConfig::from_json_str(r#"{"exclude_feature": ["api-key"]}"#).unwrap_err();
        assert!(err.contains("exclude_feature"));
    }

    #[test]
    fn test_toml_document() {
        let config = InstallConfig::from_toml_str(
            r#"
exclude_features = ["dashboard-widgets"]
base_url = "https://misp.example.org"
verify_tls = true

[settings]
"MISP.tagging" = false

[[sector_feeds]]
name = "Local feed"
provider = "SOC"
url = "https://feeds.example.org/misp"
"#,
        )
        .unwrap();
        assert!(config.verify_tls);
        assert_eq!(config.settings["MISP.tagging"], Value::from(false));
        assert_eq!(config.sector_feeds.len(), 1);
        assert_eq!(config.sector_feeds[0].source_format, "misp");
    }

    #[test]
    fn test_load_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let json = dir.path().join("install.json");
        std::fs::write(&json, r#"{"organisation": "Grid Co"}"#).unwrap();
        assert_eq!(InstallConfig::load(&json).unwrap().organisation, "Grid Co");

        let yaml = dir.path().join("install.yaml");
        std::fs::write(&yaml, "organisation: x").unwrap();
        assert!(matches!(
            InstallConfig::load(&yaml),
            Err(ConfigError::UnsupportedFormat(_))
        ));

        let broken = dir.path().join("broken.toml");
        std::fs::write(&broken, "exclude_features = [").unwrap();
        assert!(matches!(
            InstallConfig::load(&broken),
            Err(ConfigError::Parse { .. })
        ));

        assert!(matches!(
            InstallConfig::load(&dir.path().join("missing.json")),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn test_overrides() {
        let mut config = InstallConfig::default();
        config.apply_overrides_from(|name| match name {
            ENV_BASE_URL => Some("https://10.0.0.5".to_string()),
            ENV_API_KEY => Some("  ".to_string()),
            ENV_STATE_DIR => Some("/var/lib/misp-install".to_string()),
            _ => None,
        });
        assert_eq!(config.base_url, "https://10.0.0.5");
        assert_eq!(config.api_key, None);
        assert_eq!(config.state_dir(), PathBuf::from("/var/lib/misp-install"));
        assert_eq!(
            config.api_key_file(),
            PathBuf::from("/var/lib/misp-install/api-key")
        );
    }

    #[test]
    fn test_api_key_source_prefers_configured_key() {
        let mut config = InstallConfig::default();
        assert_eq!(
            config.api_key_source(),
            ApiKeySource::File(PathBuf::from("/opt/misp/.install-state/api-key"))
        );
        config.api_key = Some("abc".to_string());
        assert_eq!(config.api_key_source(), ApiKeySource::Static("abc".to_string()));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = InstallConfig {
            base_url: "localhost".to_string(),
            ..InstallConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field, .. }) if field == "base_url"
        ));

        config.base_url = "https://localhost".to_string();
        config.http_timeout_secs = 0;
        assert!(config.validate().is_err());
    }
}
