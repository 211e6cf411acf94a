//! LLM Model Manager
//!
//! Handles discovering, downloading and managing GGUF models for on-device inference.
//!
//! Module structure:
//! - types.rs: CatalogEntry, ModelFile, DownloadProgress
//! - registry.rs: display-name table and remote file listing
//! - downloader.rs: FileFetcher, idempotent streamed downloads
//! - manager.rs: LlmModelManager struct

pub mod types;
pub mod registry;
pub mod downloader;
pub mod manager;

pub use types::{CatalogEntry, DownloadProgress, DownloadStatus, ModelFile};
pub use registry::{default_catalog, filter_gguf_files, ModelRegistry};
pub use downloader::FileFetcher;
pub use manager::LlmModelManager;
