//! LLM engine module: model acquisition and streaming inference
//!
//! - model_manager: registry listing, downloads and the local model inventory
//! - engine: the single live inference session
//! - streaming: token stream processing and the thought-block state machine
//! - providers: concrete inference backends

pub mod provider;
pub mod engine;
pub mod streaming;
pub mod model_manager;
pub mod providers;

pub use provider::{
    ChatMessage, CompletionRequest, CompletionResult, CompletionTimings, InferenceBackend,
    InferenceSession, LlmError, LlmResult, Message, MessageRole, SessionParams, StopReason,
};
pub use engine::{ActiveSession, SessionManager};
pub use streaming::{run_completion, CompletionMetrics, CompletionOutcome, StreamState};
