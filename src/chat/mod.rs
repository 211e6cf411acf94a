//! Chat module for conversations with the local model
//!
//! Module structure:
//! - conversation.rs: ordered turn list and change events
//! - completion.rs: ChatService, the send/stop/load flows
//! - task_registry.rs: cancellable completion tasks
//! - metrics.rs: per-turn throughput samples

pub mod conversation;
pub mod completion;
pub mod task_registry;
pub mod metrics;

pub use conversation::{ConversationEvent, ConversationStore, TurnUpdate};
pub use completion::ChatService;
pub use metrics::ThroughputLog;
