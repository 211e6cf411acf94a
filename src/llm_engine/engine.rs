//! Session manager - owns the single live inference session
//!
//! Mediates load, replace and release so that two sessions never coexist.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::chat::conversation::ConversationStore;
use crate::llm_engine::provider::{
    InferenceBackend, InferenceSession, LlmError, LlmResult, SessionParams,
};

/// Handle to the live session, shared with the completion in flight
#[derive(Clone)]
pub struct ActiveSession {
    id: Uuid,
    inner: Arc<dyn InferenceSession>,
    busy: Arc<AtomicBool>,
    /// Set once the manager has let go of this session; never cleared
    retired: Arc<AtomicBool>,
}

impl ActiveSession {
    fn new(inner: Arc<dyn InferenceSession>) -> Self {
        Self {
            id: Uuid::new_v4(),
            inner,
            busy: Arc::new(AtomicBool::new(false)),
            retired: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn session(&self) -> &Arc<dyn InferenceSession> {
        &self.inner
    }

    pub fn model_path(&self) -> &Path {
        self.inner.model_path()
    }

    /// Whether a completion is running on this session
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Whether the session was replaced or released
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Claim the session for one completion
    pub fn begin_completion(&self) -> LlmResult<CompletionGuard> {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| {
                if self.is_retired() {
                    LlmError::NotInitialized
                } else {
                    LlmError::SessionBusy
                }
            })?;
        Ok(CompletionGuard {
            busy: self.busy.clone(),
        })
    }

    /// Take the session away from every handle. Claims `busy` for good, so
    /// it fails while a completion runs and no completion can start after.
    fn retire(&self) -> LlmResult<()> {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| LlmError::SessionBusy)?;
        self.retired.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Marks the session idle again when dropped
pub struct CompletionGuard {
    busy: Arc<AtomicBool>,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::SeqCst);
    }
}

/// Owns at most one live session
pub struct SessionManager {
    backend: Arc<dyn InferenceBackend>,
    params: SessionParams,
    current: RwLock<Option<ActiveSession>>,
    /// Held for the duration of a load
    loading: Mutex<()>,
}

impl SessionManager {
    pub fn new(backend: Arc<dyn InferenceBackend>, params: SessionParams) -> Self {
        Self {
            backend,
            params,
            current: RwLock::new(None),
            loading: Mutex::new(()),
        }
    }

    pub fn params(&self) -> &SessionParams {
        &self.params
    }

    /// Get the live session, if any
    pub async fn current(&self) -> Option<ActiveSession> {
        self.current.read().await.clone()
    }

    pub async fn is_loaded(&self) -> bool {
        self.current.read().await.is_some()
    }

    /// Load a model, replacing any live session.
    ///
    /// Replacing a session releases it first and resets `conversation` to
    /// its initial state. On failure no session is left live. A load while
    /// another load or a completion is running fails with `SessionBusy`.
    pub async fn load_model(
        &self,
        model_path: &Path,
        conversation: &RwLock<ConversationStore>,
    ) -> LlmResult<ActiveSession> {
        let _loading = self.loading.try_lock().map_err(|_| {
            log::warn!("Rejecting load of {:?}: another load is in progress", model_path);
            LlmError::SessionBusy
        })?;

        match tokio::fs::try_exists(model_path).await {
            Ok(true) => {}
            Ok(false) => {
                return Err(LlmError::ModelFileMissing(model_path.display().to_string()))
            }
            Err(e) => {
                log::warn!("Error checking model file {:?}: {}", model_path, e);
                return Err(LlmError::ModelFileMissing(model_path.display().to_string()));
            }
        }

        {
            let mut current = self.current.write().await;

            if let Some(old) = current.as_ref() {
                old.retire()?;
            }

            if let Some(old) = current.take() {
                log::info!(
                    "Releasing session {} ({:?}) before loading {:?}",
                    old.id,
                    old.model_path(),
                    model_path
                );
                conversation.write().await.reset();
                old.session().release().await.map_err(|e| {
                    log::error!("Failed to release previous session: {}", e);
                    LlmError::ModelLoad(format!("Failed to release previous session: {}", e))
                })?;
            }
        }

        log::info!(
            "Loading model {:?} with {} backend (n_ctx={}, mlock={}, gpu_layers={})",
            model_path,
            self.backend.backend_name(),
            self.params.context_size,
            self.params.use_mlock,
            self.params.gpu_layers
        );

        let session = self.backend.load(model_path, &self.params).await.map_err(|e| {
            log::error!("Failed to load model {:?}: {}", model_path, e);
            match e {
                LlmError::ModelLoad(msg) => LlmError::ModelLoad(msg),
                other => LlmError::ModelLoad(other.to_string()),
            }
        })?;

        let active = ActiveSession::new(session);
        *self.current.write().await = Some(active.clone());

        log::info!("Model loaded, session {}", active.id);
        Ok(active)
    }

    /// Release the live session, if any
    pub async fn release(&self) -> LlmResult<()> {
        let mut current = self.current.write().await;

        if let Some(old) = current.as_ref() {
            old.retire()?;
        }

        if let Some(old) = current.take() {
            log::info!("Releasing session {}", old.id);
            old.session().release().await?;
        }
        Ok(())
    }
}
