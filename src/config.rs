//! Application configuration
//!
//! Stored as JSON. Every field has a default so partial files are accepted.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::llm_engine::model_manager::{default_catalog, CatalogEntry};
use crate::llm_engine::provider::{LlmError, LlmResult, SessionParams};
use crate::llm_engine::providers::SidecarConfig;

/// Environment variable overriding the models directory
pub const MODELS_DIR_ENV: &str = "EDGE_LLM_MODELS_DIR";

pub const DEFAULT_SYSTEM_PROMPT: &str =
    "This is a conversation between user and assistant, a friendly chatbot.";

/// Remote registry settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RegistryConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    /// Display name to repository table
    pub models: Vec<CatalogEntry>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            base_url: "https://huggingface.co".to_string(),
            timeout_secs: 30,
            models: default_catalog(),
        }
    }
}

/// Generation settings for every completion
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GenerationConfig {
    pub system_prompt: String,
    pub n_predict: u32,
    pub stop_words: Vec<String>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        let stop_words = [
            "</s>",
            "<|end|>",
            "user:",
            "assistant:",
            "<|im_end|>",
            "<|eot_id|>",
            "<|end▁of▁sentence|>",
            "<|end_of_text|>",
            "<｜end▁of▁sentence｜>",
        ];

        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            n_predict: 10000,
            stop_words: stop_words.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Flat directory holding downloaded model files
    pub models_dir: PathBuf,
    pub registry: RegistryConfig,
    pub session: SessionParams,
    pub generation: GenerationConfig,
    pub sidecar: SidecarConfig,
    /// Whole-transfer timeout for model downloads
    pub download_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            models_dir: default_models_dir(),
            registry: RegistryConfig::default(),
            session: SessionParams::default(),
            generation: GenerationConfig::default(),
            sidecar: SidecarConfig::default(),
            download_timeout_secs: 3600,
        }
    }
}

fn default_models_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(MODELS_DIR_ENV) {
        return PathBuf::from(dir);
    }
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("edge-llm")
        .join("models")
}

impl AppConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> LlmResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| LlmError::Config(format!("Failed to read {:?}: {}", path, e)))?;
        serde_json::from_str(&raw)
            .map_err(|e| LlmError::Config(format!("Invalid config {:?}: {}", path, e)))
    }

    /// Load configuration, falling back to defaults when the file does not exist
    pub fn load_or_default(path: &Path) -> LlmResult<Self> {
        if !path.exists() {
            log::info!("No config at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn save(&self, path: &Path) -> LlmResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| LlmError::Config(format!("Failed to create {:?}: {}", parent, e)))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| LlmError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, json)
            .map_err(|e| LlmError::Config(format!("Failed to write {:?}: {}", path, e)))
    }
}
