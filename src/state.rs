// State management for edge-llm

use std::path::Path;
use std::sync::Arc;

use crate::chat::ChatService;
use crate::config::AppConfig;
use crate::llm_engine::provider::{InferenceBackend, LlmResult};
use crate::llm_engine::providers::SidecarBackend;

pub struct AppState {
    /// Configuration the state was built from
    config: AppConfig,
    /// Model acquisition, the live session and the conversation
    pub chat: Arc<ChatService>,
}

impl AppState {
    pub fn new(config: AppConfig, backend: Arc<dyn InferenceBackend>) -> LlmResult<Self> {
        log::info!(
            "Initializing state (models dir {:?}, backend {})",
            config.models_dir,
            backend.backend_name()
        );
        let chat = Arc::new(ChatService::new(&config, backend)?);
        Ok(Self { config, chat })
    }

    /// Load configuration from `config_path` (defaults when missing) and
    /// wire up the sidecar backend
    pub fn from_config_file(config_path: &Path) -> LlmResult<Self> {
        let config = AppConfig::load_or_default(config_path)?;
        let backend = Arc::new(SidecarBackend::new(config.sidecar.clone()));
        Self::new(config, backend)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Get the chat service Arc for background tasks
    pub fn chat_arc(&self) -> Arc<ChatService> {
        self.chat.clone()
    }
}
