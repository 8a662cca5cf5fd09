//! Settings storage.
//!
//! Keeps the acquisition settings document in a central directory,
//! ~/.isim_config/ by default.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::settings::{Settings, SettingsFile, SettingsResult};

/// File name of the settings document inside the storage root.
const SETTINGS_FILENAME: &str = "settings.json";

/// Storage manager for the settings document.
#[derive(Debug, Clone)]
pub struct SettingsStorage {
    /// Root directory for all configuration (e.g., ~/.isim_config)
    root_path: PathBuf,
}

impl SettingsStorage {
    /// Create a new storage with the default path (~/.isim_config)
    pub fn new() -> std::io::Result<Self> {
        let home = std::env::var("HOME")
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::NotFound, "HOME not set"))?;
        let root_path = PathBuf::from(home).join(".isim_config");
        Ok(Self { root_path })
    }

    /// Create a new storage with a custom root path
    pub fn with_path(root_path: PathBuf) -> Self {
        Self { root_path }
    }

    /// Get the root configuration path
    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    /// Path of the settings document
    pub fn settings_path(&self) -> PathBuf {
        self.root_path.join(SETTINGS_FILENAME)
    }

    /// Load the stored settings.
    ///
    /// Returns None if nothing has been saved yet.
    /// Returns Some(Err) if the file exists but cannot be read or validated.
    pub fn load(&self) -> Option<SettingsResult<Settings>> {
        let path = self.settings_path();

        if !path.exists() {
            return None;
        }

        Some(load_from_file(&path))
    }

    /// Load the stored settings, falling back to the defaults when none exist.
    pub fn load_or_default(&self) -> SettingsResult<Settings> {
        match self.load() {
            Some(result) => result,
            None => {
                debug!("No settings at {}, using defaults", self.settings_path().display());
                Ok(Settings::default())
            }
        }
    }

    /// Save settings, creating the directory if needed.
    ///
    /// Returns the path where the document was written.
    pub fn save(&self, settings: &Settings) -> SettingsResult<PathBuf> {
        std::fs::create_dir_all(&self.root_path)?;

        let path = self.settings_path();
        save_to_file(settings.file(), &path)?;
        info!("Saved settings to {}", path.display());
        Ok(path)
    }

    /// Delete the stored settings.
    ///
    /// Returns Ok(true) if the file was deleted, Ok(false) if it didn't exist.
    pub fn delete(&self) -> std::io::Result<bool> {
        let path = self.settings_path();

        if !path.exists() {
            return Ok(false);
        }

        std::fs::remove_file(path)?;
        Ok(true)
    }
}

impl Default for SettingsStorage {
    fn default() -> Self {
        Self::new().unwrap_or_else(|_| Self::with_path(PathBuf::from(".isim_config")))
    }
}

/// Read and validate a settings document from any path.
pub fn load_from_file(path: &Path) -> SettingsResult<Settings> {
    let text = std::fs::read_to_string(path)?;
    let file: SettingsFile = serde_json::from_str(&text)?;
    Settings::new(file)
}

/// Write a settings document to any path.
pub fn save_to_file(file: &SettingsFile, path: &Path) -> SettingsResult<()> {
    let text = serde_json::to_string_pretty(file)?;
    std::fs::write(path, text)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::SettingsError;
    use approx::assert_relative_eq;

    fn create_test_storage() -> (tempfile::TempDir, SettingsStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = SettingsStorage::with_path(dir.path().join("config"));
        (dir, storage)
    }

    #[test]
    fn test_settings_path() {
        let (_dir, storage) = create_test_storage();
        assert!(storage
            .settings_path()
            .to_str()
            .unwrap()
            .ends_with("settings.json"));
    }

    #[test]
    fn test_missing_settings() {
        let (_dir, storage) = create_test_storage();
        assert!(storage.load().is_none());
        assert_eq!(storage.load_or_default().unwrap(), Settings::default());
    }

    #[test]
    fn test_save_and_load() {
        let (_dir, storage) = create_test_storage();
        let settings = Settings::default()
            .edited(|file| {
                file.sample_rate = 60066.0;
                file.twitchers = true;
                file.live.channel = "LED".to_string();
            })
            .unwrap();

        let path = storage.save(&settings).unwrap();
        assert!(path.exists());

        let loaded = storage
            .load()
            .expect("Settings should exist")
            .expect("Settings should load successfully");

        assert_relative_eq!(loaded.sample_rate(), 60066.0);
        assert!(loaded.twitchers());
        assert_eq!(loaded.live().channel, "LED");
        assert_eq!(loaded.counts(), settings.counts());
    }

    #[test]
    fn test_invalid_document_reports_error() {
        let (_dir, storage) = create_test_storage();
        std::fs::create_dir_all(storage.root_path()).unwrap();
        std::fs::write(storage.settings_path(), r#"{"sample_rate": -1}"#).unwrap();

        let result = storage.load().expect("File exists");
        assert!(matches!(result, Err(SettingsError::InvalidSampleRate(_))));
    }

    #[test]
    fn test_delete() {
        let (_dir, storage) = create_test_storage();
        storage.save(&Settings::default()).unwrap();

        assert!(storage.delete().unwrap());
        assert!(storage.load().is_none());
        assert!(!storage.delete().unwrap());
    }
}
