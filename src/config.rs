use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use serde::Deserialize;

use crate::processing::DEFAULT_QUALITY;
use crate::store::DEFAULT_KEEP;

pub const APP_DIR_NAME: &str = "album-wallpaper";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    #[default]
    Onedrive,
    GooglePhotos,
    /// Canned albums and a 1x1 image; no network.
    Fixture,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RefreshConfig {
    pub client_id: String,
    pub refresh_token: String,
    pub tenant: String,
    pub authority_host: String,
    pub redirect_uri: Option<String>,
    pub scopes: Vec<String>,
    /// Full token endpoint; overrides `authority-host` and `tenant`.
    pub token_url: Option<String>,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            refresh_token: String::new(),
            tenant: "consumers".into(),
            authority_host: "login.microsoftonline.com".into(),
            redirect_uri: None,
            scopes: vec!["Files.Read".into(), "offline_access".into()],
            token_url: None,
        }
    }
}

impl RefreshConfig {
    pub fn token_endpoint(&self) -> String {
        self.token_url.clone().unwrap_or_else(|| {
            format!(
                "https://{}/{}/oauth2/v2.0/token",
                self.authority_host.trim_end_matches('/'),
                self.tenant
            )
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    /// API root; defaults per provider kind.
    pub base_url: Option<String>,
    /// Static bearer token, used when no refresh settings are given.
    pub access_token: Option<String>,
    pub refresh: Option<RefreshConfig>,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::default(),
            base_url: None,
            access_token: None,
            refresh: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl ProviderConfig {
    pub fn base_url(&self) -> &str {
        match (&self.base_url, self.kind) {
            (Some(url), _) => url.trim_end_matches('/'),
            (None, ProviderKind::GooglePhotos) => "https://photoslibrary.googleapis.com/v1",
            (None, _) => "https://graph.microsoft.com/v1.0",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SchedulingOptions {
    #[serde(with = "humantime_serde")]
    pub minimum_lead_time: Duration,
    #[serde(with = "humantime_serde")]
    pub minimum_retry_delay: Duration,
    /// Candidates tried per run.
    pub standard_attempts: usize,
    /// Candidates tried when one of our files is currently on screen.
    pub extended_attempts: usize,
}

impl Default for SchedulingOptions {
    fn default() -> Self {
        Self {
            minimum_lead_time: Duration::from_secs(60),
            minimum_retry_delay: Duration::from_secs(300),
            standard_attempts: 3,
            extended_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DisplayConfig {
    /// Lists outputs in `wlr-randr` format; disabled when unset.
    pub detect_command: Option<String>,
    /// Run once per output with `@OUTPUT@`, `@FILE@` and `@MODE@` substituted.
    pub apply_command: String,
    /// Output name used when detection finds nothing.
    pub fallback_output: String,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            detect_command: Some("wlr-randr".into()),
            apply_command: "swaymsg output @OUTPUT@ bg @FILE@ @MODE@".into(),
            fallback_output: "*".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Configuration {
    /// Persisted user choices and updater state.
    pub settings_file: Option<PathBuf>,
    /// Normalized wallpapers; defaults to the user data directory.
    pub cache_dir: Option<PathBuf>,
    /// Store files kept after each successful update.
    pub cache_keep: usize,
    /// JPEG quality, 0.0 to 1.0.
    pub jpeg_quality: f32,
    /// Overrides the size derived from attached displays.
    pub max_dimension: Option<u32>,
    /// Used when no display reports its size.
    pub fallback_max_dimension: u32,
    pub scheduling: SchedulingOptions,
    pub provider: ProviderConfig,
    pub display: DisplayConfig,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            settings_file: None,
            cache_dir: None,
            cache_keep: DEFAULT_KEEP,
            jpeg_quality: DEFAULT_QUALITY,
            max_dimension: None,
            fallback_max_dimension: 1920,
            scheduling: SchedulingOptions::default(),
            provider: ProviderConfig::default(),
            display: DisplayConfig::default(),
        }
    }
}

impl Configuration {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes =
            std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        serde_yaml::from_slice(&bytes)
            .with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Validate runtime invariants that cannot be expressed via serde defaults alone.
    pub fn validated(self) -> Result<Self> {
        ensure!(
            (0.0..=1.0).contains(&self.jpeg_quality),
            "jpeg-quality must be between 0.0 and 1.0"
        );
        ensure!(self.cache_keep > 0, "cache-keep must be greater than zero");
        ensure!(
            self.fallback_max_dimension > 0,
            "fallback-max-dimension must be greater than zero"
        );
        if let Some(max) = self.max_dimension {
            ensure!(max > 0, "max-dimension must be greater than zero");
        }
        ensure!(
            self.scheduling.standard_attempts > 0,
            "scheduling.standard-attempts must be greater than zero"
        );
        ensure!(
            self.scheduling.extended_attempts >= self.scheduling.standard_attempts,
            "scheduling.extended-attempts must be at least standard-attempts"
        );
        ensure!(
            !self.display.apply_command.trim().is_empty(),
            "display.apply-command must not be blank"
        );
        ensure!(
            self.display.apply_command.contains("@FILE@"),
            "display.apply-command must contain @FILE@"
        );
        if let Some(cmd) = &self.display.detect_command {
            ensure!(!cmd.trim().is_empty(), "display.detect-command must not be blank");
        }
        if self.provider.kind != ProviderKind::Fixture {
            let has_token = self
                .provider
                .access_token
                .as_deref()
                .is_some_and(|t| !t.trim().is_empty());
            let has_refresh = self.provider.refresh.as_ref().is_some_and(|r| {
                !r.client_id.trim().is_empty() && !r.refresh_token.trim().is_empty()
            });
            ensure!(
                has_token || has_refresh,
                "provider needs access-token or refresh.client-id and refresh.refresh-token"
            );
        }
        Ok(self)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join(APP_DIR_NAME)
        })
    }

    pub fn settings_file(&self) -> PathBuf {
        self.settings_file.clone().unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join(APP_DIR_NAME)
                .join("settings.yaml")
        })
    }
}
