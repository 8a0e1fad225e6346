//! LLM inference
//!
//! GGUF metadata, parameter resolution, chat templates, the model runtime and
//! the stateful session that ties them together.

pub mod engine;
pub mod gguf;
pub mod params;
pub mod runtime;
pub mod session;
pub mod streaming;
pub mod template;

// Re-export main types for convenience
pub use engine::LlamaRuntime;
pub use gguf::{read_metadata, validate_gguf, GgufError, GgufHeader, ModelMetadata, GGUF_MAGIC};
pub use params::{InferenceParams, RuntimeSettings, DEFAULT_CONTEXT_SIZE};
pub use runtime::{ModelRuntime, RuntimeError, RuntimeHandle};
pub use session::{CompletionStream, GenerationStats, LoadError, ModelSession, SessionError, SessionState};
pub use streaming::{Emission, StopWordFilter, StopWords, EOG_SENTINEL};
pub use template::{ChatTemplate, DEFAULT_CHAT_TEMPLATE, DEFAULT_SYSTEM_PERSONA};
