//! Preferences storage
//!
//! Persists the selected model and inference overrides as JSON.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::inference::InferenceParams;
use crate::storage::{get_data_dir, StorageError};
use crate::strengthen::{ModelPathSource, DEFAULT_STOP_WORDS};

const PREFERENCES_FILE: &str = "preferences.json";

/// User preferences
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Preferences {
    /// Absolute path of the chosen GGUF model
    pub model_path: Option<PathBuf>,
    /// File name shown to the user
    pub model_file_name: Option<String>,
    /// Overrides applied when loading the model
    pub inference: InferenceParams,
    /// Stop words installed before each generation
    pub stop_words: Vec<String>,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            model_path: None,
            model_file_name: None,
            inference: InferenceParams::default(),
            stop_words: DEFAULT_STOP_WORDS.iter().map(|w| w.to_string()).collect(),
        }
    }
}

impl Preferences {
    /// Validate preference values
    pub fn validate(&mut self) {
        self.inference.validate();

        if self.model_path.as_ref().is_some_and(|p| p.as_os_str().is_empty()) {
            self.model_path = None;
        }
        if self.model_path.is_none() {
            self.model_file_name = None;
        }

        self.stop_words.retain(|w| !w.is_empty());
    }

    /// Records the chosen model. The display name defaults to the file name.
    pub fn set_model(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        self.model_file_name = path.file_name().map(|n| n.to_string_lossy().into_owned());
        self.model_path = Some(path);
    }

    pub fn clear_model(&mut self) {
        self.model_path = None;
        self.model_file_name = None;
    }

    /// Load preferences from a file
    ///
    /// Returns defaults if the file doesn't exist or is corrupted
    pub fn load_from(path: &Path) -> Self {
        match Self::load_internal(path) {
            Ok(prefs) => prefs,
            Err(e) => {
                tracing::warn!("Failed to load preferences, using defaults: {}", e);
                Self::default()
            }
        }
    }

    fn load_internal(path: &Path) -> Result<Self, StorageError> {
        if !path.exists() {
            tracing::info!("Preferences file not found, using defaults");
            return Ok(Self::default());
        }

        let json = fs::read_to_string(path)?;
        let mut prefs: Preferences = serde_json::from_str(&json)?;
        prefs.validate();

        tracing::debug!("Loaded preferences from {}", path.display());
        Ok(prefs)
    }

    /// Save preferences to a file
    pub fn save_to(&self, path: &Path) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;

        tracing::debug!("Saved preferences to {}", path.display());
        Ok(())
    }
}

/// Default preferences file location
pub fn preferences_path() -> Result<PathBuf, StorageError> {
    Ok(get_data_dir()?.join(PREFERENCES_FILE))
}

/// Preferences bound to a file, kept in memory between reads
#[derive(Debug)]
pub struct PreferenceStore {
    path: PathBuf,
    current: Mutex<Preferences>,
}

impl PreferenceStore {
    /// Opens the store at `path`, loading what is there
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let current = Preferences::load_from(&path);
        Self {
            path,
            current: Mutex::new(current),
        }
    }

    /// Opens the store in the platform data directory
    pub fn open_default() -> Result<Self, StorageError> {
        Ok(Self::open(preferences_path()?))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self) -> Preferences {
        self.current.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Applies `f` and persists the result
    pub fn update(&self, f: impl FnOnce(&mut Preferences)) -> Result<Preferences, StorageError> {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = current.clone();
        f(&mut next);
        next.validate();
        next.save_to(&self.path)?;
        *current = next.clone();
        Ok(next)
    }
}

impl ModelPathSource for PreferenceStore {
    fn model_path(&self) -> Option<PathBuf> {
        self.get().model_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_preferences() {
        let prefs = Preferences::default();
        assert!(prefs.model_path.is_none());
        assert_eq!(prefs.stop_words, vec!["<|end|>", "<|user|>", "<|system|>"]);
        assert_eq!(prefs.inference, InferenceParams::default());
    }

    #[test]
    fn test_set_model_records_file_name() {
        let mut prefs = Preferences::default();
        prefs.set_model("/models/SmolLM2-360M-Instruct-Q8_0.gguf");
        assert_eq!(prefs.model_file_name.as_deref(), Some("SmolLM2-360M-Instruct-Q8_0.gguf"));

        prefs.clear_model();
        assert!(prefs.model_path.is_none() && prefs.model_file_name.is_none());
    }

    #[test]
    fn test_validation() {
        let mut prefs = Preferences {
            model_path: Some(PathBuf::new()),
            model_file_name: Some("stale.gguf".into()),
            stop_words: vec!["".into(), "<|end|>".into()],
            ..Default::default()
        };
        prefs.inference.temperature = 9.0;
        prefs.validate();

        assert!(prefs.model_path.is_none());
        assert!(prefs.model_file_name.is_none());
        assert_eq!(prefs.stop_words, vec!["<|end|>"]);
        assert_eq!(prefs.inference.temperature, 2.0);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(Preferences::load_from(&dir.path().join("none.json")), Preferences::default());
    }

    #[test]
    fn test_corrupt_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PREFERENCES_FILE);
        fs::write(&path, "{ not json").unwrap();
        assert_eq!(Preferences::load_from(&path), Preferences::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PREFERENCES_FILE);
        fs::write(&path, r#"{"model_path": "/m/tiny.gguf", "inference": {"num_threads": 2}}"#).unwrap();

        let prefs = Preferences::load_from(&path);
        assert_eq!(prefs.model_path, Some(PathBuf::from("/m/tiny.gguf")));
        assert_eq!(prefs.inference.num_threads, 2);
        assert_eq!(prefs.stop_words.len(), 3);
    }

    #[test]
    fn test_store_persists_updates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(PREFERENCES_FILE);

        let store = PreferenceStore::open(&path);
        assert!(store.model_path().is_none());
        store.update(|p| p.set_model("/models/phi.gguf")).unwrap();

        let reopened = PreferenceStore::open(&path);
        assert_eq!(reopened.model_path(), Some(PathBuf::from("/models/phi.gguf")));
        assert_eq!(reopened.get().model_file_name.as_deref(), Some("phi.gguf"));
    }
}
