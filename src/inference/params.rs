//! Inference parameters
//!
//! User-facing options and their resolution against the defaults a model file ships with.

use serde::{Deserialize, Serialize};

use crate::inference::gguf::ModelMetadata;
use crate::inference::template::DEFAULT_CHAT_TEMPLATE;

/// Context size used when neither the caller nor the model file provides one
pub const DEFAULT_CONTEXT_SIZE: u64 = 1024;

/// Options for loading a model into a session.
///
/// `context_size` and `chat_template` are overrides: when `None`, the value from
/// the GGUF metadata is used, then the built-in default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceParams {
    /// Minimum token probability relative to the most likely token (0.0 - 1.0)
    pub min_p: f32,
    /// Temperature for sampling. Higher values make the output more random.
    pub temperature: f32,
    /// Keep the conversation history across completions
    pub store_chats: bool,
    /// Context window override, in tokens
    pub context_size: Option<u64>,
    /// Jinja chat template override
    pub chat_template: Option<String>,
    /// Number of CPU threads used for generation
    pub num_threads: u32,
    /// Memory-map the model file instead of reading it
    pub use_mmap: bool,
    /// Lock the model in RAM
    pub use_mlock: bool,
}

impl Default for InferenceParams {
    fn default() -> Self {
        Self {
            min_p: 0.01,
            temperature: 1.1,
            store_chats: false,
            context_size: None,
            chat_template: None,
            num_threads: 4,
            use_mmap: true,
            use_mlock: false,
        }
    }
}

impl InferenceParams {
    /// Validate parameter values
    ///
    /// Clamps numeric options into range and treats empty overrides as absent.
    pub fn validate(&mut self) {
        if !self.min_p.is_finite() {
            self.min_p = 0.01;
        }
        self.min_p = self.min_p.clamp(0.0, 1.0);

        if !self.temperature.is_finite() {
            self.temperature = 1.1;
        }
        self.temperature = self.temperature.clamp(0.0, 2.0);

        if self.num_threads == 0 {
            self.num_threads = 1;
        }

        if self.context_size == Some(0) {
            self.context_size = None;
        }

        if self
            .chat_template
            .as_deref()
            .is_some_and(|t| t.trim().is_empty())
        {
            self.chat_template = None;
        }
    }

    /// Computes the effective settings: explicit override, then model metadata, then built-in default.
    pub fn resolve(&self, metadata: &ModelMetadata) -> RuntimeSettings {
        let mut params = self.clone();
        params.validate();

        let context_size = params
            .context_size
            .or(metadata.context_size)
            .unwrap_or(DEFAULT_CONTEXT_SIZE);

        let chat_template = params
            .chat_template
            .or_else(|| metadata.chat_template.clone())
            .unwrap_or_else(|| DEFAULT_CHAT_TEMPLATE.to_string());

        RuntimeSettings {
            min_p: params.min_p,
            temperature: params.temperature,
            store_chats: params.store_chats,
            context_size,
            chat_template,
            num_threads: params.num_threads,
            use_mmap: params.use_mmap,
            use_mlock: params.use_mlock,
        }
    }
}

/// Fully resolved settings handed to the model runtime when a handle is constructed
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeSettings {
    pub min_p: f32,
    pub temperature: f32,
    pub store_chats: bool,
    /// Effective context window, in tokens
    pub context_size: u64,
    /// Effective chat template
    pub chat_template: String,
    pub num_threads: u32,
    pub use_mmap: bool,
    pub use_mlock: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(context: Option<u64>, template: Option<&str>) -> ModelMetadata {
        ModelMetadata {
            context_size: context,
            chat_template: template.map(str::to_string),
            architecture: None,
        }
    }

    #[test]
    fn test_default_params() {
        let params = InferenceParams::default();
        assert!((params.min_p - 0.01).abs() < f32::EPSILON);
        assert!((params.temperature - 1.1).abs() < f32::EPSILON);
        assert!(!params.store_chats);
        assert_eq!(params.num_threads, 4);
        assert!(params.use_mmap);
        assert!(!params.use_mlock);
        assert_eq!(params.context_size, None);
    }

    #[test]
    fn test_metadata_fills_unset_overrides() {
        let settings = InferenceParams::default().resolve(&metadata(Some(2048), None));
        assert_eq!(settings.context_size, 2048);
        assert_eq!(settings.chat_template, DEFAULT_CHAT_TEMPLATE);
    }

    #[test]
    fn test_overrides_win_over_metadata() {
        let params = InferenceParams {
            context_size: Some(512),
            chat_template: Some("{{ x }}".into()),
            ..Default::default()
        };
        let settings = params.resolve(&metadata(Some(4096), Some("{{ y }}")));
        assert_eq!(settings.context_size, 512);
        assert_eq!(settings.chat_template, "{{ x }}");
    }

    #[test]
    fn test_builtin_defaults_when_nothing_known() {
        let settings = InferenceParams::default().resolve(&ModelMetadata::default());
        assert_eq!(settings.context_size, DEFAULT_CONTEXT_SIZE);
        assert_eq!(settings.chat_template, DEFAULT_CHAT_TEMPLATE);
    }

    #[test]
    fn test_validation() {
        let mut params = InferenceParams {
            min_p: 3.0,
            temperature: -1.0,
            num_threads: 0,
            context_size: Some(0),
            chat_template: Some("  ".into()),
            ..Default::default()
        };
        params.validate();
        assert_eq!(params.min_p, 1.0);
        assert_eq!(params.temperature, 0.0);
        assert_eq!(params.num_threads, 1);
        assert_eq!(params.context_size, None);
        assert_eq!(params.chat_template, None);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let params: InferenceParams = serde_json::from_str(r#"{"temperature":0.5}"#).unwrap();
        assert_eq!(params.temperature, 0.5);
        assert_eq!(params.num_threads, 4);
    }
}
