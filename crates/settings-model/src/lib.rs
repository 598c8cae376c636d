//! Persisted user choices and updater state.
//!
//! The store is passive: callers change named fields through
//! [`SettingsStore::update`], which re-reads the stored record first so edits
//! made by other writers survive. Nothing here knows about scheduling or
//! remote providers.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How often the wallpaper rotates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeFrequency {
    Never,
    Hourly,
    SixHours,
    #[default]
    Daily,
}

impl ChangeFrequency {
    pub const ALL: [ChangeFrequency; 4] = [
        ChangeFrequency::Never,
        ChangeFrequency::Hourly,
        ChangeFrequency::SixHours,
        ChangeFrequency::Daily,
    ];

    /// Rotation interval, or `None` when automatic rotation is off.
    pub fn interval(self) -> Option<Duration> {
        match self {
            ChangeFrequency::Never => None,
            ChangeFrequency::Hourly => Some(Duration::from_secs(3_600)),
            ChangeFrequency::SixHours => Some(Duration::from_secs(21_600)),
            ChangeFrequency::Daily => Some(Duration::from_secs(86_400)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChangeFrequency::Never => "never",
            ChangeFrequency::Hourly => "hourly",
            ChangeFrequency::SixHours => "six_hours",
            ChangeFrequency::Daily => "daily",
        }
    }
}

/// Geometric mapping of the wallpaper onto a display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillMode {
    /// Scale to cover the display, clipping the overflow.
    #[default]
    Fill,
    /// Scale to fit inside the display without clipping.
    Fit,
    /// Scale each axis independently.
    Stretch,
    /// Native size, centered.
    Center,
}

impl FillMode {
    pub fn as_str(self) -> &'static str {
        match self {
            FillMode::Fill => "fill",
            FillMode::Fit => "fit",
            FillMode::Stretch => "stretch",
            FillMode::Center => "center",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Settings {
    pub selected_album_id: Option<String>,
    pub selected_album_name: Option<String>,
    pub selected_album_web_url: Option<String>,
    pub change_frequency: ChangeFrequency,
    pub paused: bool,
    pub pick_randomly: bool,
    pub minimum_picture_width: Option<u32>,
    pub horizontal_only: bool,
    pub fill_mode: FillMode,
    pub last_picked_index: Option<usize>,
    pub last_set_item_id: Option<String>,
    pub last_set_item_name: Option<String>,
    pub last_successful_update: Option<DateTime<Utc>>,
    pub album_picture_count: usize,
    pub no_pictures_found: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            selected_album_id: None,
            selected_album_name: None,
            selected_album_web_url: None,
            change_frequency: ChangeFrequency::default(),
            paused: false,
            pick_randomly: true,
            minimum_picture_width: None,
            horizontal_only: false,
            fill_mode: FillMode::default(),
            last_picked_index: None,
            last_set_item_id: None,
            last_set_item_name: None,
            last_successful_update: None,
            album_picture_count: 0,
            no_pictures_found: false,
        }
    }
}

impl Settings {
    /// Selected album id, ignoring blank values left behind by hand edits.
    pub fn album_id(&self) -> Option<&str> {
        self.selected_album_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }

    pub fn has_album(&self) -> bool {
        self.album_id().is_some()
    }

    /// Switches to a new album and forgets everything tied to the previous one.
    pub fn select_album(&mut self, id: String, name: Option<String>, web_url: Option<String>) {
        let changed = self.selected_album_id.as_deref() != Some(id.as_str());
        self.selected_album_id = Some(id);
        self.selected_album_name = name;
        self.selected_album_web_url = web_url;
        if changed {
            self.last_picked_index = None;
            self.album_picture_count = 0;
            self.no_pictures_found = false;
        }
    }

    /// Forgets the last applied item so the next run cannot treat it as current.
    pub fn forget_last_set_item(&mut self) {
        self.last_set_item_id = None;
        self.last_set_item_name = None;
    }
}

/// Backing store for [`Settings`].
pub trait SettingsStore: Send + Sync {
    fn load(&self) -> Result<Settings>;
    fn save(&self, settings: &Settings) -> Result<()>;

    /// Applies `change` to the currently stored record and writes it back.
    fn update(&self, change: &mut dyn FnMut(&mut Settings)) -> Result<Settings> {
        let mut settings = self.load()?;
        change(&mut settings);
        self.save(&settings)?;
        Ok(settings)
    }
}

/// YAML file on disk; a missing file reads as defaults.
#[derive(Debug, Clone)]
pub struct YamlSettingsStore {
    path: PathBuf,
}

impl YamlSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for YamlSettingsStore {
    fn load(&self) -> Result<Settings> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Settings::default()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read settings {}", self.path.display()));
            }
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Settings::default());
        }
        serde_yaml::from_slice(&bytes)
            .with_context(|| format!("failed to parse settings {}", self.path.display()))
    }

    fn save(&self, settings: &Settings) -> Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create settings directory {}", dir.display()))?;
        let yaml = serde_yaml::to_string(settings).context("failed to serialize settings")?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
        tmp.write_all(yaml.as_bytes())
            .context("failed to write settings")?;
        tmp.persist(&self.path)
            .map_err(|err| anyhow!(err.error))
            .with_context(|| format!("failed to replace settings {}", self.path.display()))?;
        Ok(())
    }
}

/// Process-local store used by the fixture provider and tests.
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    inner: Mutex<Settings>,
}

impl MemorySettingsStore {
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: Mutex::new(settings),
        }
    }

    pub fn snapshot(&self) -> Settings {
        match self.inner.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl SettingsStore for MemorySettingsStore {
    fn load(&self) -> Result<Settings> {
        Ok(self.snapshot())
    }

    fn save(&self, settings: &Settings) -> Result<()> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| anyhow!("settings lock poisoned"))?;
        *guard = settings.clone();
        Ok(())
    }

    fn update(&self, change: &mut dyn FnMut(&mut Settings)) -> Result<Settings> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| anyhow!("settings lock poisoned"))?;
        change(&mut *guard);
        Ok(guard.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_first_launch() {
        let settings = Settings::default();
        assert_eq!(settings.change_frequency, ChangeFrequency::Daily);
        assert_eq!(settings.fill_mode, FillMode::Fill);
        assert!(settings.pick_randomly);
        assert!(!settings.has_album());
    }

    #[test]
    fn frequency_intervals() {
        assert_eq!(ChangeFrequency::Never.interval(), None);
        assert_eq!(
            ChangeFrequency::Hourly.interval(),
            Some(Duration::from_secs(3_600))
        );
        assert_eq!(
            ChangeFrequency::SixHours.interval(),
            Some(Duration::from_secs(21_600))
        );
        assert_eq!(
            ChangeFrequency::Daily.interval(),
            Some(Duration::from_secs(86_400))
        );
    }

    #[test]
    fn stored_strings_round_through_yaml() {
        let yaml = "change-frequency: six_hours\nfill-mode: center\n";
        let settings: Settings = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(settings.change_frequency, ChangeFrequency::SixHours);
        assert_eq!(settings.fill_mode, FillMode::Center);
        for freq in ChangeFrequency::ALL {
            let text = serde_yaml::to_string(&freq).unwrap();
            assert_eq!(text.trim(), freq.as_str());
        }
    }

    #[test]
    fn blank_album_id_is_not_selected() {
        let settings = Settings {
            selected_album_id: Some("   ".into()),
            ..Settings::default()
        };
        assert!(!settings.has_album());
    }

    #[test]
    fn selecting_a_new_album_resets_progress() {
        let mut settings = Settings {
            selected_album_id: Some("a".into()),
            last_picked_index: Some(4),
            album_picture_count: 9,
            ..Settings::default()
        };
        settings.select_album("a".into(), Some("Same".into()), None);
        assert_eq!(settings.last_picked_index, Some(4));
        settings.select_album("b".into(), None, None);
        assert_eq!(settings.last_picked_index, None);
        assert_eq!(settings.album_picture_count, 0);
    }

    #[test]
    fn yaml_store_missing_file_is_default_and_saves_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let store = YamlSettingsStore::new(dir.path().join("nested/settings.yaml"));
        assert_eq!(store.load().unwrap(), Settings::default());

        let mut settings = Settings::default();
        settings.select_album("album-1".into(), Some("Trips".into()), None);
        settings.last_successful_update = Some(Utc::now());
        store.save(&settings).unwrap();

        assert_eq!(store.load().unwrap(), settings);
    }

    #[test]
    fn yaml_update_keeps_fields_written_by_others() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.yaml");
        let ours = YamlSettingsStore::new(&path);
        let theirs = YamlSettingsStore::new(&path);
        let stale = ours.load().unwrap();

        let mut edited = theirs.load().unwrap();
        edited.paused = true;
        edited.select_album("album-2".into(), None, None);
        theirs.save(&edited).unwrap();

        let updated = ours
            .update(&mut |s| s.last_set_item_id = Some("item-9".into()))
            .unwrap();
        assert!(!stale.paused);
        assert!(updated.paused);
        assert_eq!(updated.album_id(), Some("album-2"));
        assert_eq!(theirs.load().unwrap(), updated);
    }

    #[test]
    fn memory_update_returns_the_stored_record() {
        let store = MemorySettingsStore::new(Settings {
            horizontal_only: true,
            ..Settings::default()
        });
        let updated = store.update(&mut |s| s.album_picture_count = 7).unwrap();
        assert!(updated.horizontal_only);
        assert_eq!(store.snapshot().album_picture_count, 7);
    }

    #[test]
    fn memory_store_round_trip() {
        let store = MemorySettingsStore::default();
        let mut settings = store.load().unwrap();
        settings.paused = true;
        store.save(&settings).unwrap();
        assert!(store.snapshot().paused);
    }
}
