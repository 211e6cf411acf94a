//! LLM engine types and backend traits
//!
//! Defines the error taxonomy, the conversation message format and the
//! interface every on-device inference backend must implement.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Error types for model acquisition and inference
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq)]
pub enum LlmError {
    /// Transport failure while talking to the registry or downloading
    #[error("Network error: {0}")]
    Network(String),
    /// Local storage could not be read or written
    #[error("Storage error: {0}")]
    Storage(String),
    /// Registry call failed or returned a malformed payload
    #[error("Registry error: {0}")]
    Registry(String),
    /// Display name has no repository mapping
    #[error("No repository mapping found for model: {0}")]
    UnknownModel(String),
    /// Model file is not present on disk
    #[error("Model file not found: {0}")]
    ModelFileMissing(String),
    /// Inference backend refused to load the model
    #[error("Failed to load model: {0}")]
    ModelLoad(String),
    /// A load or completion is already in flight
    #[error("Session is busy")]
    SessionBusy,
    /// The completion call itself failed
    #[error("Inference failed: {0}")]
    Inference(String),
    /// No model loaded
    #[error("Model not loaded")]
    NotInitialized,
    /// Invalid request parameters
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    /// Configuration file unreadable or malformed
    #[error("Configuration error: {0}")]
    Config(String),
}

impl LlmError {
    /// Title and body of the notification shown to the user
    pub fn user_message(&self) -> (&'static str, String) {
        match self {
            LlmError::Network(msg) | LlmError::Storage(msg) => {
                ("Error", format!("Download failed: {}", msg))
            }
            LlmError::Registry(_) | LlmError::UnknownModel(_) => (
                "Error",
                format!("Failed to fetch .gguf files: {}", self),
            ),
            LlmError::ModelFileMissing(_) | LlmError::ModelLoad(_) => {
                ("Error Loading Model", self.to_string())
            }
            LlmError::SessionBusy => (
                "Busy",
                "Please wait for the current operation to finish.".to_string(),
            ),
            LlmError::Inference(msg) => ("Error During Inference", msg.clone()),
            LlmError::NotInitialized => (
                "Model Not Loaded",
                "Please load the model first.".to_string(),
            ),
            LlmError::InvalidRequest(msg) => ("Input Error", msg.clone()),
            LlmError::Config(_) => ("Error", self.to_string()),
        }
    }
}

pub type LlmResult<T> = Result<T, LlmError>;

/// Role of a message in a conversation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// A single turn in a conversation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: MessageRole,
    /// User-facing text only, reasoning markers stripped
    pub content: String,
    /// Hidden reasoning block, if the model produced a complete one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought: Option<String>,
    #[serde(default)]
    pub show_thought: bool,
}

impl Message {
    fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            thought: None,
            show_thought: false,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }
}

/// Message as sent to the inference backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl From<&Message> for ChatMessage {
    fn from(msg: &Message) -> Self {
        Self {
            role: msg.role,
            content: msg.content.clone(),
        }
    }
}

/// Fixed runtime parameters used when loading a model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionParams {
    /// Context window size in tokens
    pub context_size: u32,
    /// Lock model weights in memory
    pub use_mlock: bool,
    /// Number of layers offloaded to the GPU
    pub gpu_layers: u32,
}

impl Default for SessionParams {
    fn default() -> Self {
        Self {
            context_size: 2048,
            use_mlock: true,
            gpu_layers: 1,
        }
    }
}

/// Request for a streamed completion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    /// Maximum tokens to predict
    pub n_predict: u32,
    /// Stop sequences
    pub stop: Vec<String>,
}

/// Timing report produced by the backend at the end of a completion
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CompletionTimings {
    #[serde(default)]
    pub prompt_n: u32,
    #[serde(default)]
    pub prompt_ms: f64,
    #[serde(default)]
    pub predicted_n: u32,
    #[serde(default)]
    pub predicted_ms: f64,
    #[serde(default)]
    pub predicted_per_second: f64,
}

/// Why generation ended
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    #[default]
    EndOfStream,
    StopWord,
    Limit,
    Aborted,
}

/// Final result of a completion call
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CompletionResult {
    /// Full raw text as generated
    pub text: String,
    pub timings: CompletionTimings,
    #[serde(default)]
    pub stop_reason: StopReason,
}

/// Callback invoked once per generated token, in generation order
pub type TokenCallback = Box<dyn Fn(String) + Send + Sync>;

/// A live, loaded-model inference context
#[async_trait]
pub trait InferenceSession: Send + Sync {
    /// Path of the model this session was loaded from
    fn model_path(&self) -> &Path;

    /// Run a completion, invoking `on_token` for every generated token.
    /// Resolves when generation ends, including after `stop()`.
    async fn completion(
        &self,
        request: CompletionRequest,
        on_token: TokenCallback,
    ) -> LlmResult<CompletionResult>;

    /// Ask the in-flight completion to end early. Idempotent.
    async fn stop(&self);

    /// Free the underlying resources. The session is unusable afterwards.
    async fn release(&self) -> LlmResult<()>;
}

/// An inference engine able to load GGUF models into sessions
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Backend name for logging (e.g. "sidecar")
    fn backend_name(&self) -> &'static str;

    /// Load a model file into a new session
    async fn load(
        &self,
        model_path: &Path,
        params: &SessionParams,
    ) -> LlmResult<Arc<dyn InferenceSession>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_serializes_lowercase_role() {
        let json = serde_json::to_value(Message::user("hi")).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["content"], "hi");
        assert!(json.get("thought").is_none());
    }

    #[test]
    fn test_user_message_titles() {
        let (title, body) = LlmError::NotInitialized.user_message();
        assert_eq!(title, "Model Not Loaded");
        assert_eq!(body, "Please load the model first.");

        let (title, body) = LlmError::Network("timeout".into()).user_message();
        assert_eq!(title, "Error");
        assert_eq!(body, "Download failed: timeout");

        let (title, _) = LlmError::ModelLoad("bad magic".into()).user_message();
        assert_eq!(title, "Error Loading Model");
    }

    #[test]
    fn test_timings_tolerate_missing_fields() {
        let timings: CompletionTimings =
            serde_json::from_str(r#"{"predicted_per_second": 12.5}"#).unwrap();
        assert_eq!(timings.predicted_per_second, 12.5);
        assert_eq!(timings.predicted_n, 0);
    }
}
