//! Streaming response processor
//!
//! Consumes the token stream of one completion call, splits it into visible
//! answer text and a hidden reasoning block, and applies each partial turn
//! to the conversation in arrival order.
//!
//! Reasoning markers may be split across token boundaries, so detection runs
//! over the accumulated text with a small `Idle -> InThought -> Idle` state
//! machine instead of per-token matching.

use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::chat::conversation::{ConversationStore, TurnUpdate};
use crate::config::GenerationConfig;
use crate::llm_engine::engine::{ActiveSession, CompletionGuard};
use crate::llm_engine::provider::{
    CompletionRequest, CompletionResult, LlmError, LlmResult, TokenCallback,
};

pub const THINK_OPEN: &str = "<think>";
pub const THINK_CLOSE: &str = "</think>";

/// Appended once to the assistant turn when the user stops generation
pub const CANCELLATION_MARKER: &str = "\n\n*Generation stopped by user*";

static THOUGHT_SPAN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        "(?s){}.*?{}",
        regex::escape(THINK_OPEN),
        regex::escape(THINK_CLOSE)
    ))
    .expect("thought span pattern is valid")
});

/// Remove every closed thought block from `text`
pub fn strip_thought_spans(text: &str) -> String {
    THOUGHT_SPAN.replace_all(text, "").into_owned()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThoughtPhase {
    Idle,
    InThought,
}

/// Per-completion stream state
#[derive(Debug)]
pub struct StreamState {
    accumulated: String,
    thought_buffer: String,
    phase: ThoughtPhase,
    /// Byte offset of the open marker while in a thought block
    open_at: usize,
    /// Marker search resumes here
    scan_from: usize,
    thoughts: Vec<String>,
    token_count: usize,
    started_at: Instant,
}

impl Default for StreamState {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamState {
    pub fn new() -> Self {
        Self {
            accumulated: String::new(),
            thought_buffer: String::new(),
            phase: ThoughtPhase::Idle,
            open_at: 0,
            scan_from: 0,
            thoughts: Vec::new(),
            token_count: 0,
            started_at: Instant::now(),
        }
    }

    pub fn phase(&self) -> ThoughtPhase {
        self.phase
    }

    pub fn token_count(&self) -> usize {
        self.token_count
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Reasoning text collected so far for an unclosed block
    pub fn thought_buffer(&self) -> &str {
        &self.thought_buffer
    }

    /// Feed one token and return the turn as it should now be displayed
    pub fn push_token(&mut self, token: &str) -> TurnUpdate {
        self.token_count += 1;
        self.accumulated.push_str(token);
        self.advance();
        self.snapshot()
    }

    /// Final turn once the stream has ended normally.
    ///
    /// An unclosed thought block is kept verbatim in the content and does
    /// not become the turn's thought.
    pub fn finish(&self) -> TurnUpdate {
        TurnUpdate {
            content: strip_thought_spans(&self.accumulated).trim().to_string(),
            thought: self.joined_thoughts(),
        }
    }

    fn advance(&mut self) {
        loop {
            match self.phase {
                ThoughtPhase::Idle => match self.accumulated[self.scan_from..].find(THINK_OPEN) {
                    Some(offset) => {
                        self.open_at = self.scan_from + offset;
                        self.scan_from = self.open_at + THINK_OPEN.len();
                        self.thought_buffer.clear();
                        self.phase = ThoughtPhase::InThought;
                    }
                    None => {
                        let tail = tail_start(&self.accumulated, THINK_OPEN.len());
                        self.scan_from = self.scan_from.max(tail);
                        return;
                    }
                },
                ThoughtPhase::InThought => {
                    let body_start = self.open_at + THINK_OPEN.len();
                    match self.accumulated[self.scan_from..].find(THINK_CLOSE) {
                        Some(offset) => {
                            let close_at = self.scan_from + offset;
                            let thought = self.accumulated[body_start..close_at].trim().to_string();
                            // Excise the exact <open>...<close> span
                            self.accumulated
                                .replace_range(self.open_at..close_at + THINK_CLOSE.len(), "");
                            perf_debug!("Thought block closed ({} chars)", thought.len());
                            self.thoughts.push(thought);
                            self.thought_buffer.clear();
                            self.scan_from = self.open_at;
                            self.phase = ThoughtPhase::Idle;
                        }
                        None => {
                            self.thought_buffer = self.accumulated[body_start..].to_string();
                            let tail = tail_start(&self.accumulated, THINK_CLOSE.len());
                            self.scan_from = self.scan_from.max(tail);
                            return;
                        }
                    }
                }
            }
        }
    }

    fn snapshot(&self) -> TurnUpdate {
        let visible_end = match self.phase {
            ThoughtPhase::InThought => self.open_at,
            // Hold back a possible partial open marker
            ThoughtPhase::Idle => {
                self.accumulated.len() - partial_marker_len(&self.accumulated, THINK_OPEN)
            }
        };

        TurnUpdate {
            content: strip_thought_spans(&self.accumulated[..visible_end])
                .trim()
                .to_string(),
            thought: self.joined_thoughts(),
        }
    }

    fn joined_thoughts(&self) -> Option<String> {
        if self.thoughts.is_empty() {
            None
        } else {
            Some(self.thoughts.join("\n\n"))
        }
    }
}

/// Earliest offset at which a marker of `marker_len` bytes could still begin
fn tail_start(text: &str, marker_len: usize) -> usize {
    let mut start = text.len().saturating_sub(marker_len.saturating_sub(1));
    while !text.is_char_boundary(start) {
        start -= 1;
    }
    start
}

/// Length of the longest proper prefix of `marker` that `text` ends with
fn partial_marker_len(text: &str, marker: &str) -> usize {
    (1..marker.len())
        .rev()
        .find(|&len| text.ends_with(&marker[..len]))
        .unwrap_or(0)
}

/// Throughput sample for one completed turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionMetrics {
    /// Rounded to two decimals
    pub tokens_per_second: f64,
    pub tokens_predicted: u32,
    pub elapsed_ms: u64,
}

impl CompletionMetrics {
    /// Prefer the backend's timing report, falling back to wall-clock timing
    fn from_result(result: &CompletionResult, state: &StreamState) -> Self {
        let elapsed = state.elapsed();
        let reported = result.timings.predicted_per_second;

        let tokens_per_second = if reported.is_finite() && reported > 0.0 {
            reported
        } else if elapsed.as_secs_f64() > 0.0 {
            state.token_count() as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        let tokens_predicted = if result.timings.predicted_n > 0 {
            result.timings.predicted_n
        } else {
            state.token_count() as u32
        };

        Self {
            tokens_per_second: (tokens_per_second * 100.0).round() / 100.0,
            tokens_predicted,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }
}

/// Terminal state of a completion call
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionOutcome {
    Completed(CompletionMetrics),
    /// Stopped by the user; not an error
    Cancelled,
}

/// Run one completion against the conversation so far.
///
/// Appends an in-progress assistant turn and amends it once per token.
/// Cancelling `cancel` stops the session exactly once, appends the
/// cancellation marker and resolves with `CompletionOutcome::Cancelled`.
pub async fn run_completion(
    session: &ActiveSession,
    conversation: &RwLock<ConversationStore>,
    generation: &GenerationConfig,
    cancel: &CancellationToken,
) -> LlmResult<CompletionOutcome> {
    let guard = session.begin_completion()?;
    drive_completion(session, guard, conversation, generation, cancel).await
}

/// Same as `run_completion`, for callers that already claimed the session
pub(crate) async fn drive_completion(
    session: &ActiveSession,
    _guard: CompletionGuard,
    conversation: &RwLock<ConversationStore>,
    generation: &GenerationConfig,
    cancel: &CancellationToken,
) -> LlmResult<CompletionOutcome> {
    let request = {
        let mut conv = conversation.write().await;
        conv.begin_assistant_turn();
        CompletionRequest {
            messages: conv.history(),
            n_predict: generation.n_predict,
            stop: generation.stop_words.clone(),
        }
    };

    log::info!(
        "Starting completion on session {} ({} messages)",
        session.id(),
        request.messages.len()
    );

    // Unbounded so the backend never blocks; order is preserved
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let on_token: TokenCallback = Box::new(move |token: String| {
        let _ = tx.send(token);
    });

    let inference = session.session();

    let drive = async {
        let completion = inference.completion(request, on_token);
        tokio::pin!(completion);

        tokio::select! {
            result = &mut completion => result,
            _ = cancel.cancelled() => {
                log::info!("Stopping generation on session {}", session.id());
                inference.stop().await;
                completion.await
            }
        }
    };

    let consume = async {
        let mut state = StreamState::new();
        while let Some(token) = rx.recv().await {
            perf_trace!("token #{}: {:?}", state.token_count() + 1, token);
            let update = state.push_token(&token);
            conversation.write().await.amend_last(update);
        }
        state
    };

    let (result, state) = tokio::join!(drive, consume);

    let mut conv = conversation.write().await;

    if cancel.is_cancelled() {
        if let Err(e) = &result {
            log::debug!("Completion ended with {} after stop", e);
        }
        conv.append_to_last(CANCELLATION_MARKER);
        conv.end_streaming();
        log::info!("Generation stopped by user after {} tokens", state.token_count());
        return Ok(CompletionOutcome::Cancelled);
    }

    conv.amend_last(state.finish());
    conv.end_streaming();
    drop(conv);

    match result {
        Ok(result) => {
            let metrics = CompletionMetrics::from_result(&result, &state);
            log::info!(
                "Completion finished ({:?}): {} tokens, {:.2} tokens/s",
                result.stop_reason,
                metrics.tokens_predicted,
                metrics.tokens_per_second
            );
            Ok(CompletionOutcome::Completed(metrics))
        }
        Err(e) => {
            log::error!("Completion failed: {}", e);
            Err(match e {
                LlmError::Inference(msg) => LlmError::Inference(msg),
                other => LlmError::Inference(other.to_string()),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_engine::engine::SessionManager;
    use crate::llm_engine::provider::{CompletionTimings, Message, MessageRole, SessionParams};
    use crate::test_utils::FakeBackend;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn feed(tokens: &[&str]) -> TurnUpdate {
        let mut state = StreamState::new();
        for token in tokens {
            state.push_token(token);
        }
        state.finish()
    }

    #[test]
    fn test_plain_tokens_concatenate() {
        let update = feed(&["  Hel", "lo", " world ", "\n"]);
        assert_eq!(update.content, "Hello world");
        assert_eq!(update.thought, None);
    }

    #[test]
    fn test_thought_block_scenario() {
        let update = feed(&["<think>", "reason ", "more</think>", "Answer"]);
        assert_eq!(update.thought.as_deref(), Some("reason more"));
        assert_eq!(update.content, "Answer");
    }

    #[test]
    fn test_markers_split_across_tokens() {
        let text = "<think> weigh options </think>The answer is 42.";
        // Every split point of every token size
        for size in 1..=text.len() {
            let tokens: Vec<String> = text
                .as_bytes()
                .chunks(size)
                .map(|c| String::from_utf8(c.to_vec()).unwrap())
                .collect();
            let refs: Vec<&str> = tokens.iter().map(String::as_str).collect();
            let update = feed(&refs);
            assert_eq!(update.thought.as_deref(), Some("weigh options"), "size {}", size);
            assert_eq!(update.content, "The answer is 42.", "size {}", size);
            assert!(!update.content.contains("<think>"));
        }
    }

    #[test]
    fn test_thought_text_never_visible_while_streaming() {
        let mut state = StreamState::new();
        let mut seen = Vec::new();
        for token in ["Sure. <th", "ink>secret", " plan</th", "ink> Done"] {
            seen.push(state.push_token(token).content);
        }
        assert!(seen.iter().all(|c| !c.contains("secret") && !c.contains("<th")));
        assert_eq!(seen.last().unwrap(), "Sure.  Done");
        assert_eq!(state.phase(), ThoughtPhase::Idle);
    }

    #[test]
    fn test_visible_content_grows_monotonically() {
        let mut state = StreamState::new();
        let mut previous = String::new();
        for token in ["Hel", "lo", " <", "think>x</think>", " there"] {
            let content = state.push_token(token).content;
            assert!(content.starts_with(&previous), "{:?} -> {:?}", previous, content);
            previous = content;
        }
        assert_eq!(previous, "Hello  there");
    }

    #[test]
    fn test_unclosed_thought_is_kept_in_content() {
        let mut state = StreamState::new();
        state.push_token("<think>");
        let update = state.push_token("still thinking");
        assert_eq!(update.content, "");
        assert_eq!(state.phase(), ThoughtPhase::InThought);
        assert_eq!(state.thought_buffer(), "still thinking");

        let done = state.finish();
        assert_eq!(done.thought, None);
        assert_eq!(done.content, "<think>still thinking");
    }

    #[test]
    fn test_multiple_thought_blocks_are_joined() {
        let update = feed(&["<think>a</think>One ", "<think>b</think>Two"]);
        assert_eq!(update.thought.as_deref(), Some("a\n\nb"));
        assert_eq!(update.content, "One Two");
    }

    #[test]
    fn test_multibyte_text_near_markers() {
        let update = feed(&["é<thi", "nk>日本", "語</thi", "nk>ü"]);
        assert_eq!(update.thought.as_deref(), Some("日本語"));
        assert_eq!(update.content, "éü");
    }

    #[test]
    fn test_strip_thought_spans() {
        assert_eq!(strip_thought_spans("a<think>x\ny</think>b<think>z</think>"), "ab");
        assert_eq!(strip_thought_spans("a<think>open"), "a<think>open");
    }

    #[test]
    fn test_metrics_prefer_reported_timings() {
        let state = StreamState::new();
        let result = CompletionResult {
            timings: CompletionTimings {
                predicted_n: 40,
                predicted_per_second: 23.4567,
                ..Default::default()
            },
            ..Default::default()
        };
        let metrics = CompletionMetrics::from_result(&result, &state);
        assert_eq!(metrics.tokens_per_second, 23.46);
        assert_eq!(metrics.tokens_predicted, 40);
    }

    async fn loaded(backend: Arc<FakeBackend>) -> (SessionManager, ActiveSession, RwLock<ConversationStore>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("m.gguf");
        std::fs::write(&path, b"x").unwrap();
        let manager = SessionManager::new(backend, SessionParams::default());
        let conv = RwLock::new(ConversationStore::new("system"));
        let active = manager.load_model(&path, &conv).await.unwrap();
        conv.write().await.append(Message::user("hi"));
        (manager, active, conv, dir)
    }

    #[tokio::test]
    async fn test_completion_scenario_hello() {
        let backend = FakeBackend::new();
        backend.set_tokens(&["Hel", "lo"]);
        backend.set_tokens_per_second(31.0);
        let (_manager, active, conv, _dir) = loaded(backend.clone()).await;

        let outcome = run_completion(
            &active,
            &conv,
            &GenerationConfig::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        match outcome {
            CompletionOutcome::Completed(metrics) => assert_eq!(metrics.tokens_per_second, 31.0),
            other => panic!("Expected Completed, got {:?}", other),
        }

        let conv = conv.read().await;
        assert_eq!(conv.len(), 3);
        let last = conv.last().unwrap();
        assert_eq!(last.role, MessageRole::Assistant);
        assert_eq!(last.content, "Hello");
        assert!(!conv.is_streaming());
        assert!(!active.is_busy());

        // The request carried the history without the placeholder turn
        let request = backend.last_request().unwrap();
        assert_eq!(request.messages.len(), 2);
        assert_eq!(request.n_predict, 10000);
        assert!(request.stop.contains(&"<|eot_id|>".to_string()));
    }

    #[tokio::test]
    async fn test_cancel_mid_stream() {
        let backend = FakeBackend::new();
        let cancel = CancellationToken::new();
        backend.set_tokens(&["<think>", "plan</think>", "Part", "ial", " never"]);
        backend.cancel_after(3, cancel.clone());
        let (_manager, active, conv, _dir) = loaded(backend.clone()).await;

        let outcome = run_completion(&active, &conv, &GenerationConfig::default(), &cancel)
            .await
            .unwrap();

        assert_eq!(outcome, CompletionOutcome::Cancelled);
        assert_eq!(backend.stop_calls(), 1);

        let conv = conv.read().await;
        let last = conv.last().unwrap();
        assert_eq!(last.content, format!("Part{}", CANCELLATION_MARKER));
        assert_eq!(last.content.matches(CANCELLATION_MARKER).count(), 1);
        assert_eq!(last.thought.as_deref(), Some("plan"));
        assert!(!conv.is_streaming());

        // Cancelling again is a no-op
        cancel.cancel();
        assert_eq!(backend.stop_calls(), 1);
    }

    #[tokio::test]
    async fn test_inference_failure_keeps_partial_turn() {
        let backend = FakeBackend::new();
        backend.set_tokens(&["Half an ", "answer"]);
        backend.fail_completion("context overflow");
        let (_manager, active, conv, _dir) = loaded(backend).await;

        let err = run_completion(
            &active,
            &conv,
            &GenerationConfig::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert_eq!(err, LlmError::Inference("context overflow".to_string()));
        let conv = conv.read().await;
        assert_eq!(conv.last().unwrap().content, "Half an answer");
        assert!(!active.is_busy());
    }

    #[tokio::test]
    async fn test_second_completion_is_busy() {
        let backend = FakeBackend::new();
        let (_manager, active, conv, _dir) = loaded(backend).await;
        let _guard = active.begin_completion().unwrap();

        let err = run_completion(
            &active,
            &conv,
            &GenerationConfig::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert_eq!(err, LlmError::SessionBusy);
        // Nothing was appended
        assert_eq!(conv.read().await.len(), 2);
    }
}
