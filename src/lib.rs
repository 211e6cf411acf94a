// edge-llm - on-device GGUF model acquisition and streaming chat
//
// - Model registry listing and streamed downloads
// - A single live inference session behind a pluggable backend
// - Streaming responses with <think> block separation

// Performance logging macros - exported for use by other modules
#[macro_use]
pub mod macros;

pub mod config;
pub mod logging;
pub mod state;
pub mod llm_engine;
pub mod chat;

#[cfg(test)]
pub(crate) mod test_utils;

pub use chat::{ChatService, ConversationEvent, ConversationStore};
pub use config::AppConfig;
pub use llm_engine::model_manager::{DownloadProgress, LlmModelManager, ModelFile, ModelRegistry};
pub use llm_engine::{LlmError, LlmResult, Message, MessageRole};
pub use logging::init_logging;
pub use state::AppState;
