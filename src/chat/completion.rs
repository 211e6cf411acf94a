//! Chat service - ties model acquisition, the live session and the
//! conversation together behind the operations a UI triggers

use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::chat::conversation::ConversationStore;
use crate::chat::metrics::ThroughputLog;
use crate::chat::task_registry::TaskRegistry;
use crate::config::{AppConfig, GenerationConfig};
use crate::llm_engine::engine::{ActiveSession, SessionManager};
use crate::llm_engine::model_manager::{DownloadProgress, LlmModelManager, ModelFile};
use crate::llm_engine::provider::{InferenceBackend, LlmError, LlmResult, Message};
use crate::llm_engine::streaming::{drive_completion, CompletionOutcome};

pub struct ChatService {
    models: LlmModelManager,
    sessions: SessionManager,
    conversation: Arc<RwLock<ConversationStore>>,
    throughput: RwLock<ThroughputLog>,
    tasks: TaskRegistry,
    generation: GenerationConfig,
}

impl ChatService {
    pub fn new(config: &AppConfig, backend: Arc<dyn InferenceBackend>) -> LlmResult<Self> {
        Ok(Self {
            models: LlmModelManager::new(config)?,
            sessions: SessionManager::new(backend, config.session.clone()),
            conversation: Arc::new(RwLock::new(ConversationStore::new(
                config.generation.system_prompt.clone(),
            ))),
            throughput: RwLock::new(ThroughputLog::default()),
            tasks: TaskRegistry::new(),
            generation: config.generation.clone(),
        })
    }

    pub fn models(&self) -> &LlmModelManager {
        &self.models
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn conversation(&self) -> Arc<RwLock<ConversationStore>> {
        self.conversation.clone()
    }

    pub async fn throughput(&self) -> ThroughputLog {
        self.throughput.read().await.clone()
    }

    pub fn is_generating(&self) -> bool {
        self.tasks.is_processing()
    }

    /// Registry files for a model, each with a fresh local-state probe
    pub async fn model_files(&self, display_name: &str) -> LlmResult<Vec<ModelFile>> {
        self.models.model_files(display_name).await
    }

    /// Load an already-downloaded model file
    pub async fn load_model(&self, filename: &str) -> LlmResult<ActiveSession> {
        let path = self.models.model_path(filename);
        self.sessions.load_model(&path, &self.conversation).await
    }

    /// Download a model file if needed, then load it
    pub async fn download_and_load<F>(
        &self,
        display_name: &str,
        filename: &str,
        on_progress: F,
    ) -> LlmResult<ActiveSession>
    where
        F: Fn(DownloadProgress) + Send,
    {
        let path: PathBuf = self
            .models
            .download_model(display_name, filename, on_progress)
            .await?;
        self.sessions.load_model(&path, &self.conversation).await
    }

    /// Send a user turn and stream the assistant's reply into the conversation
    pub async fn send_message(&self, input: &str) -> LlmResult<CompletionOutcome> {
        let session = self.sessions.current().await.ok_or(LlmError::NotInitialized)?;

        if input.trim().is_empty() {
            return Err(LlmError::InvalidRequest("Please enter a message.".to_string()));
        }

        let guard = session.begin_completion()?;
        self.conversation.write().await.append(Message::user(input));

        let cancel = CancellationToken::new();
        let task_id = self.tasks.register(cancel.clone());

        let result = drive_completion(
            &session,
            guard,
            &self.conversation,
            &self.generation,
            &cancel,
        )
        .await;

        self.tasks.remove(&task_id);

        if let Ok(CompletionOutcome::Completed(metrics)) = &result {
            self.throughput.write().await.record(metrics.tokens_per_second);
        }
        result
    }

    /// Stop the running completion. Returns false if nothing was stopped.
    pub fn stop_generation(&self) -> bool {
        self.tasks.cancel_all() > 0
    }

    pub async fn toggle_thought(&self, index: usize) -> bool {
        self.conversation.write().await.toggle_thought_visibility(index)
    }

    /// Release the session and start over with an empty conversation
    pub async fn back_to_model_selection(&self) -> LlmResult<()> {
        self.sessions.release().await?;
        self.conversation.write().await.reset();
        self.throughput.write().await.clear();
        Ok(())
    }
}
