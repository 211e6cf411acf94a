//! Test utilities: a scripted in-memory inference backend

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::llm_engine::provider::{
    CompletionRequest, CompletionResult, CompletionTimings, InferenceBackend, InferenceSession,
    LlmError, LlmResult, SessionParams, StopReason, TokenCallback,
};

/// What every session created by the backend will do on `completion`
#[derive(Clone, Default)]
struct Script {
    tokens: Vec<String>,
    tokens_per_second: f64,
    fail_with: Option<String>,
    /// Cancel this token after emitting N tokens, then wait for `stop`
    cancel_after: Option<(usize, CancellationToken)>,
}

#[derive(Default)]
struct Counters {
    loads: AtomicUsize,
    live: AtomicUsize,
    stops: AtomicUsize,
    last_request: Mutex<Option<CompletionRequest>>,
}

pub struct FakeBackend {
    counters: Arc<Counters>,
    script: Mutex<Script>,
    fail_next_load: Mutex<Option<String>>,
    load_gate: Mutex<Option<Arc<Notify>>>,
    load_started: Notify,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            counters: Arc::new(Counters::default()),
            script: Mutex::new(Script::default()),
            fail_next_load: Mutex::new(None),
            load_gate: Mutex::new(None),
            load_started: Notify::new(),
        })
    }

    pub fn set_tokens(&self, tokens: &[&str]) {
        self.script.lock().unwrap().tokens = tokens.iter().map(|t| t.to_string()).collect();
    }

    pub fn set_tokens_per_second(&self, value: f64) {
        self.script.lock().unwrap().tokens_per_second = value;
    }

    pub fn fail_completion(&self, message: &str) {
        self.script.lock().unwrap().fail_with = Some(message.to_string());
    }

    pub fn cancel_after(&self, tokens: usize, token: CancellationToken) {
        self.script.lock().unwrap().cancel_after = Some((tokens, token));
    }

    pub fn fail_next_load(&self, message: &str) {
        *self.fail_next_load.lock().unwrap() = Some(message.to_string());
    }

    /// Make loads wait until the returned notify fires
    pub fn hold_loads(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.load_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub async fn wait_for_load_started(&self) {
        self.load_started.notified().await;
    }

    pub fn loads(&self) -> usize {
        self.counters.loads.load(Ordering::SeqCst)
    }

    pub fn live_sessions(&self) -> usize {
        self.counters.live.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.counters.stops.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<CompletionRequest> {
        self.counters.last_request.lock().unwrap().clone()
    }
}

#[async_trait]
impl InferenceBackend for FakeBackend {
    fn backend_name(&self) -> &'static str {
        "fake"
    }

    async fn load(
        &self,
        model_path: &Path,
        _params: &SessionParams,
    ) -> LlmResult<Arc<dyn InferenceSession>> {
        self.counters.loads.fetch_add(1, Ordering::SeqCst);
        self.load_started.notify_one();

        let gate = self.load_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if let Some(message) = self.fail_next_load.lock().unwrap().take() {
            return Err(LlmError::ModelLoad(message));
        }

        self.counters.live.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeSession {
            path: model_path.to_path_buf(),
            counters: self.counters.clone(),
            script: self.script.lock().unwrap().clone(),
            released: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            stop_signal: Notify::new(),
        }))
    }
}

pub struct FakeSession {
    path: PathBuf,
    counters: Arc<Counters>,
    script: Script,
    released: AtomicBool,
    stopped: AtomicBool,
    stop_signal: Notify,
}

#[async_trait]
impl InferenceSession for FakeSession {
    fn model_path(&self) -> &Path {
        &self.path
    }

    async fn completion(
        &self,
        request: CompletionRequest,
        on_token: TokenCallback,
    ) -> LlmResult<CompletionResult> {
        *self.counters.last_request.lock().unwrap() = Some(request);

        let mut text = String::new();
        for (i, token) in self.script.tokens.iter().enumerate() {
            if let Some((after, cancel)) = &self.script.cancel_after {
                if i == *after {
                    cancel.cancel();
                    self.stop_signal.notified().await;
                }
            }
            if self.stopped.load(Ordering::SeqCst) {
                return Ok(CompletionResult {
                    text,
                    timings: CompletionTimings::default(),
                    stop_reason: StopReason::Aborted,
                });
            }
            text.push_str(token);
            on_token(token.clone());
            tokio::task::yield_now().await;
        }

        if let Some(message) = &self.script.fail_with {
            return Err(LlmError::Inference(message.clone()));
        }

        Ok(CompletionResult {
            text,
            timings: CompletionTimings {
                predicted_n: self.script.tokens.len() as u32,
                predicted_per_second: self.script.tokens_per_second,
                ..Default::default()
            },
            stop_reason: StopReason::EndOfStream,
        })
    }

    async fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.counters.stops.fetch_add(1, Ordering::SeqCst);
            self.stop_signal.notify_one();
        }
    }

    async fn release(&self) -> LlmResult<()> {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.counters.live.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
