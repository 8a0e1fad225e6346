//! Persistent storage
//!
//! Handles persistence of user preferences (the chosen model and inference overrides).

use std::path::PathBuf;
use thiserror::Error;

pub mod preferences;

pub use preferences::{PreferenceStore, Preferences};

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to access data directory: {0}")]
    DataDirError(String),
    #[error("Failed to read file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to serialize/deserialize JSON: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Get the application data directory
///
/// Returns the platform-specific application data directory:
/// - Windows: `C:\Users\{user}\AppData\Roaming\PassForge\PassForge\data`
/// - macOS: `/Users/{user}/Library/Application Support/com.PassForge.PassForge`
/// - Linux: `/home/{user}/.local/share/passforge`
pub fn get_data_dir() -> Result<PathBuf, StorageError> {
    directories::ProjectDirs::from("com", "PassForge", "PassForge")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or_else(|| StorageError::DataDirError("Could not determine data directory".to_string()))
}
