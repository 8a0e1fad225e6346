//! PassForge Library
//!
//! Local, on-device password strengthening with a GGUF language model.

pub mod inference;
pub mod storage;
pub mod strengthen;
pub mod system;
pub mod types;
