//! Model Manager Types

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Display name to registry repository mapping
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CatalogEntry {
    /// Human-readable name shown in the model picker
    pub display_name: String,
    /// Registry repository ID (e.g., "bartowski/Llama-3.2-1B-Instruct-GGUF")
    pub repo_id: String,
}

impl CatalogEntry {
    pub fn new(display_name: impl Into<String>, repo_id: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            repo_id: repo_id.into(),
        }
    }
}

/// A weight file offered by the registry, with its local state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelFile {
    pub display_name: String,
    pub repo_id: String,
    /// GGUF filename in the registry repo, also the local filename
    pub filename: String,
    pub local_path: PathBuf,
    /// Probed from local storage when the record is built
    pub downloaded: bool,
}

/// Download progress information
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadProgress {
    pub filename: String,
    pub downloaded_bytes: u64,
    /// None when the server did not send a content length
    pub total_bytes: Option<u64>,
    /// Completed fraction in [0, 1]
    pub fraction: f64,
    pub status: DownloadStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum DownloadStatus {
    Downloading,
    Complete,
}
