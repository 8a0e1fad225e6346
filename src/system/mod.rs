//! Host system inspection

pub mod cpu;

pub use cpu::{runtime_variant, select_runtime_variant, CpuFeatures, RuntimeVariant};
