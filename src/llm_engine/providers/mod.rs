//! Inference backend implementations
//!
//! Each backend implements the InferenceBackend trait for a specific engine

pub mod sidecar_provider;

pub use sidecar_provider::{SidecarBackend, SidecarConfig, SidecarSession};
