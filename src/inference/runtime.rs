//! Model runtime boundary
//!
//! The session never runs inference itself. It drives an opaque handle created
//! by a [`ModelRuntime`]; the native resources behind a handle are released when
//! the handle is dropped.

use std::path::Path;
use thiserror::Error;

use crate::inference::params::RuntimeSettings;

/// Errors surfaced by a model runtime
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("Failed to initialize backend: {0}")]
    Backend(String),

    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Failed to create context: {0}")]
    Context(String),

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Decoding failed: {0}")]
    Decode(String),

    #[error("Prompt needs {needed} tokens but the context only holds {capacity}")]
    ContextOverflow { needed: usize, capacity: usize },

    #[error("Runtime worker is gone: {0}")]
    WorkerGone(String),
}

/// Creates runtime handles for model files.
pub trait ModelRuntime: Send + Sync {
    /// Loads the model at `path` and creates its execution context.
    ///
    /// Long running; callers invoke it off the async executor.
    fn load(&self, path: &Path, settings: &RuntimeSettings) -> Result<Box<dyn RuntimeHandle>, RuntimeError>;
}

/// A loaded model plus execution context.
///
/// Not internally synchronized: the owner must serialize calls. Every method
/// may block on native work.
pub trait RuntimeHandle: Send {
    /// False once the native side has been torn down underneath the handle.
    fn is_valid(&self) -> bool;

    /// Tokenizes and ingests a fully formatted prompt, starting a new completion.
    fn start_completion(&mut self, prompt: &str) -> Result<(), RuntimeError>;

    /// Generates the next text fragment, or [`EOG_SENTINEL`](crate::inference::EOG_SENTINEL)
    /// once generation has ended.
    fn completion_loop(&mut self) -> Result<String, RuntimeError>;

    /// Ends the current completion and frees per-generation resources.
    fn stop_completion(&mut self);

    /// Tokens per second of the last completion
    fn generation_speed(&self) -> f32;

    /// Tokens currently held in the context window
    fn context_size_used(&self) -> u64;
}
