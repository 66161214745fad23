//! Run configuration: environment for endpoints and credentials, YAML for reconciliation knobs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use csync_adapters::NormalizeOptions;
use csync_core::{BirthdayMerge, MembershipMarkers, PatchRules, PhonePrefixRule};
use csync_transport::{HttpClientConfig, PacingConfig};
use serde::Deserialize;

/// Per-call record limit of the remote directory, for reads and writes alike.
pub const REMOTE_PAGE_LIMIT: usize = 200;

/// Registry request pacing as written in the settings file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PacingSettings {
    pub burst: u32,
    pub refill_every_ms: u64,
}

impl From<PacingSettings> for PacingConfig {
    fn from(settings: PacingSettings) -> Self {
        Self {
            burst: settings.burst,
            refill_every: Duration::from_millis(settings.refill_every_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReconcileSettings {
    pub read_page_size: usize,
    pub write_page_size: usize,
    pub max_group_members: usize,
    pub identity_tag_type: String,
    pub remote_id_type: String,
    pub deceased_group: String,
    pub starred_group: String,
    pub phone_prefix: PhonePrefixRule,
    pub birthday_merge: BirthdayMerge,
    pub unknown_name: String,
    /// Unset means registry calls go out unpaced.
    pub registry_pacing: Option<PacingSettings>,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        let markers = MembershipMarkers::default();
        Self {
            read_page_size: REMOTE_PAGE_LIMIT,
            write_page_size: REMOTE_PAGE_LIMIT,
            max_group_members: 1000,
            identity_tag_type: "lucos_contacts".to_string(),
            remote_id_type: "googlePeopleId".to_string(),
            deceased_group: markers.deceased,
            starred_group: markers.starred,
            phone_prefix: PhonePrefixRule::default(),
            birthday_merge: BirthdayMerge::default(),
            unknown_name: "Unknown Google Contact".to_string(),
            registry_pacing: None,
        }
    }
}

impl ReconcileSettings {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let settings: Self = serde_yaml::from_str(text).context("parsing reconcile settings")?;
        Ok(settings.clamped())
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// Page sizes must stay within the remote directory's per-call limit.
    pub fn clamped(mut self) -> Self {
        self.read_page_size = self.read_page_size.clamp(1, REMOTE_PAGE_LIMIT);
        self.write_page_size = self.write_page_size.clamp(1, REMOTE_PAGE_LIMIT);
        self.max_group_members = self.max_group_members.max(1);
        self
    }

    pub fn patch_rules(&self) -> PatchRules {
        PatchRules {
            markers: MembershipMarkers {
                deceased: self.deceased_group.clone(),
                starred: self.starred_group.clone(),
            },
            phone_prefix: self.phone_prefix.clone(),
            identity_tag_type: self.identity_tag_type.clone(),
        }
    }

    pub fn normalize_options(&self) -> NormalizeOptions {
        NormalizeOptions {
            unknown_name: self.unknown_name.clone(),
            identity_tag_type: self.identity_tag_type.clone(),
            birthday_merge: self.birthday_merge,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub registry_url: String,
    pub registry_api_key: String,
    pub remote_api_url: String,
    pub remote_access_token: String,
    pub remote_group: String,
    pub tracker_url: String,
    pub system_name: String,
    pub frequency_secs: u64,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub settings_path: Option<PathBuf>,
    pub settings: ReconcileSettings,
}

impl ReconcileConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .with_context(|| format!("{key} environment variable not set"))
        };

        let mut registry_url = required("REGISTRY_URL")?;
        if !registry_url.ends_with('/') {
            registry_url.push('/');
        }

        let settings_path = lookup("CSYNC_SETTINGS").map(PathBuf::from);
        let settings = match &settings_path {
            Some(path) => ReconcileSettings::from_yaml_file(path)?,
            None => ReconcileSettings::default(),
        };

        Ok(Self {
            registry_url,
            registry_api_key: required("REGISTRY_API_KEY")?,
            remote_api_url: lookup("REMOTE_API_URL")
                .unwrap_or_else(|| "https://people.googleapis.com".to_string()),
            remote_access_token: required("REMOTE_ACCESS_TOKEN")?,
            remote_group: required("REMOTE_GROUP")?,
            tracker_url: lookup("SCHEDULE_TRACKER_URL")
                .unwrap_or_else(|| "https://schedule-tracker.l42.eu/report-status".to_string()),
            system_name: lookup("CSYNC_SYSTEM_NAME")
                .unwrap_or_else(|| "lucos_contacts_googlesync_import".to_string()),
            frequency_secs: lookup("CSYNC_FREQUENCY_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(5 * 60),
            user_agent: lookup("CSYNC_USER_AGENT").unwrap_or_else(|| "csync/0.1".to_string()),
            http_timeout_secs: lookup("CSYNC_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            scheduler_enabled: lookup("CSYNC_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: lookup("CSYNC_SYNC_CRON").unwrap_or_else(|| "0 */5 * * * *".to_string()),
            settings_path,
            settings,
        })
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }

    pub fn registry_http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            pacing: self.settings.registry_pacing.map(PacingConfig::from),
            ..self.http_client_config()
        }
    }
}
