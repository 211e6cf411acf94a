//! Sidecar inference backend
//!
//! Runs the llama engine in a separate process and talks to it with
//! newline-delimited JSON-RPC over stdin/stdout. One process per session.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

#[cfg(target_os = "windows")]
use std::os::windows::process::CommandExt;

/// Windows flag to prevent console window from appearing
#[cfg(target_os = "windows")]
const CREATE_NO_WINDOW: u32 = 0x08000000;

use crate::llm_engine::provider::{
    CompletionRequest, CompletionResult, CompletionTimings, InferenceBackend, InferenceSession,
    LlmError, LlmResult, SessionParams, StopReason, TokenCallback,
};

// ============================================================================
// JSON-RPC Types
// ============================================================================

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    /// Absent for notifications (no reply expected)
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    method: &'a str,
    params: serde_json::Value,
}

impl<'a> JsonRpcRequest<'a> {
    fn call(id: u64, method: &'a str, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id: Some(id),
            method,
            params,
        }
    }

    fn notification(method: &'a str) -> Self {
        Self {
            jsonrpc: "2.0",
            id: None,
            method,
            params: serde_json::json!({}),
        }
    }
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    id: Option<u64>,
    result: Option<serde_json::Value>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    #[serde(default)]
    code: i32,
    message: String,
}

/// Final frame of a streamed completion
#[derive(Debug, Deserialize)]
struct DoneFrame {
    #[serde(default)]
    text: String,
    #[serde(default)]
    timings: CompletionTimings,
    #[serde(default)]
    stop_reason: StopReason,
}

/// One line read from the sidecar while a completion streams
#[derive(Debug, PartialEq)]
enum Frame {
    Token(String),
    Done(CompletionResult),
}

/// A decoded response line: the request it answers and its outcome
struct Envelope {
    id: Option<u64>,
    body: LlmResult<serde_json::Value>,
}

/// Fails only when the line is not a JSON-RPC response at all
fn parse_envelope(line: &str) -> LlmResult<Envelope> {
    let response: JsonRpcResponse = serde_json::from_str(line.trim())
        .map_err(|e| LlmError::Inference(format!("Failed to parse sidecar response: {}", e)))?;

    let body = match (response.error, response.result) {
        (Some(error), _) => Err(LlmError::Inference(format!(
            "{} (code {})",
            error.message, error.code
        ))),
        (None, Some(result)) => Ok(result),
        (None, None) => Err(LlmError::Inference("Empty sidecar response".to_string())),
    };

    Ok(Envelope {
        id: response.id,
        body,
    })
}

fn parse_response(line: &str) -> LlmResult<serde_json::Value> {
    parse_envelope(line)?.body
}

fn frame_from(result: serde_json::Value) -> LlmResult<Frame> {
    if result.get("done").and_then(|d| d.as_bool()).unwrap_or(false) {
        let done: DoneFrame = serde_json::from_value(result)
            .map_err(|e| LlmError::Inference(format!("Malformed final frame: {}", e)))?;
        return Ok(Frame::Done(CompletionResult {
            text: done.text,
            timings: done.timings,
            stop_reason: done.stop_reason,
        }));
    }

    match result.get("token").and_then(|t| t.as_str()) {
        Some(token) => Ok(Frame::Token(token.to_string())),
        None => Err(LlmError::Inference(format!(
            "Unexpected sidecar frame: {}",
            result
        ))),
    }
}

/// Turn the `initialize` reply into a load result carrying the engine's message
fn initialize_outcome(handshake: LlmResult<serde_json::Value>) -> LlmResult<()> {
    let result = handshake.map_err(|e| match e {
        LlmError::Inference(msg) => LlmError::ModelLoad(msg),
        other => LlmError::ModelLoad(other.to_string()),
    })?;

    if result.get("success").and_then(|s| s.as_bool()).unwrap_or(false) {
        return Ok(());
    }

    let reason = result
        .get("message")
        .or_else(|| result.get("error"))
        .and_then(|m| m.as_str())
        .unwrap_or("engine reported failure without a message");
    Err(LlmError::ModelLoad(reason.to_string()))
}

fn completion_params(request: &CompletionRequest) -> serde_json::Value {
    serde_json::json!({
        "messages": request.messages,
        "n_predict": request.n_predict,
        "stop": request.stop,
        "stream": true
    })
}

async fn write_line(stdin: &mut ChildStdin, request: &JsonRpcRequest<'_>) -> LlmResult<()> {
    let mut line = serde_json::to_string(request)
        .map_err(|e| LlmError::Inference(format!("Failed to serialize request: {}", e)))?;
    line.push('\n');

    stdin
        .write_all(line.as_bytes())
        .await
        .map_err(|e| LlmError::Inference(format!("Failed to write to sidecar: {}", e)))?;
    stdin
        .flush()
        .await
        .map_err(|e| LlmError::Inference(format!("Failed to flush: {}", e)))
}

async fn read_line(stdout: &mut BufReader<ChildStdout>) -> LlmResult<String> {
    let mut line = String::new();
    let read = stdout
        .read_line(&mut line)
        .await
        .map_err(|e| LlmError::Inference(format!("Failed to read from sidecar: {}", e)))?;
    if read == 0 {
        return Err(LlmError::Inference("Sidecar exited unexpectedly".to_string()));
    }
    Ok(line)
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SidecarConfig {
    /// Path to the sidecar binary; searched next to the executable if unset
    #[serde(default)]
    pub sidecar_path: Option<PathBuf>,
    /// Extra command-line arguments for the sidecar
    #[serde(default)]
    pub sidecar_args: Vec<String>,
}

// ============================================================================
// Backend
// ============================================================================

pub struct SidecarBackend {
    config: SidecarConfig,
}

impl SidecarBackend {
    pub fn new(config: SidecarConfig) -> Self {
        Self { config }
    }

    /// Find the sidecar binary path
    fn find_sidecar_path(&self) -> LlmResult<PathBuf> {
        if let Some(ref path) = self.config.sidecar_path {
            if path.exists() {
                return Ok(path.clone());
            }
            log::warn!("Configured sidecar not found: {}", path.display());
        }

        let sidecar_name = if cfg!(windows) {
            "llama-sidecar.exe"
        } else {
            "llama-sidecar"
        };

        if let Ok(exe_path) = std::env::current_exe() {
            let exe_dir = exe_path.parent().unwrap_or(Path::new("."));

            let path = exe_dir.join(sidecar_name);
            if path.exists() {
                log::debug!("Found sidecar in exe dir: {}", path.display());
                return Ok(path);
            }

            // Dev builds: exe lives under target/<profile>
            let mut current = exe_dir;
            for _ in 0..3 {
                let Some(parent) = current.parent() else { break };
                for profile in &["debug", "release"] {
                    let path = parent.join("target").join(profile).join(sidecar_name);
                    if path.exists() {
                        log::debug!("Found sidecar at: {}", path.display());
                        return Ok(path);
                    }
                }
                current = parent;
            }
        }

        Err(LlmError::ModelLoad(format!(
            "Inference sidecar binary '{}' not found",
            sidecar_name
        )))
    }

    fn spawn(&self) -> LlmResult<(Child, ChildStdin, ChildStdout)> {
        let sidecar_path = self.find_sidecar_path()?;
        log::info!("Starting inference sidecar: {}", sidecar_path.display());

        let mut cmd = Command::new(&sidecar_path);
        cmd.args(&self.config.sidecar_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        #[cfg(target_os = "windows")]
        cmd.creation_flags(CREATE_NO_WINDOW);

        let mut child = cmd
            .spawn()
            .map_err(|e| LlmError::ModelLoad(format!("Failed to start sidecar: {}", e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| LlmError::ModelLoad("Failed to get sidecar stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LlmError::ModelLoad("Failed to get sidecar stdout".to_string()))?;

        Ok((child, stdin, stdout))
    }
}

#[async_trait]
impl InferenceBackend for SidecarBackend {
    fn backend_name(&self) -> &'static str {
        "sidecar"
    }

    async fn load(
        &self,
        model_path: &Path,
        params: &SessionParams,
    ) -> LlmResult<Arc<dyn InferenceSession>> {
        let (mut child, mut stdin, stdout) = self.spawn()?;
        let mut stdout = BufReader::new(stdout);

        let init = serde_json::json!({
            "model_path": model_path.to_string_lossy(),
            "context_size": params.context_size,
            "use_mlock": params.use_mlock,
            "gpu_layers": params.gpu_layers,
        });

        let handshake = async {
            write_line(&mut stdin, &JsonRpcRequest::call(1, "initialize", init)).await?;
            parse_response(&read_line(&mut stdout).await?)
        }
        .await;

        if let Err(e) = initialize_outcome(handshake) {
            log::error!("Sidecar failed to load {}: {}", model_path.display(), e);
            let _ = child.kill().await;
            return Err(e);
        }

        log::info!("Model loaded in sidecar: {}", model_path.display());

        Ok(Arc::new(SidecarSession {
            model_path: model_path.to_path_buf(),
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(stdout),
            child: Mutex::new(Some(child)),
            request_id: AtomicU64::new(1),
            stopping: AtomicBool::new(false),
            released: AtomicBool::new(false),
        }))
    }
}

// ============================================================================
// Session
// ============================================================================

pub struct SidecarSession {
    model_path: PathBuf,
    stdin: Mutex<ChildStdin>,
    /// Held for the whole completion; a second completion waits here
    stdout: Mutex<BufReader<ChildStdout>>,
    child: Mutex<Option<Child>>,
    request_id: AtomicU64,
    stopping: AtomicBool,
    released: AtomicBool,
}

impl SidecarSession {
    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[async_trait]
impl InferenceSession for SidecarSession {
    fn model_path(&self) -> &Path {
        &self.model_path
    }

    async fn completion(
        &self,
        request: CompletionRequest,
        on_token: TokenCallback,
    ) -> LlmResult<CompletionResult> {
        if self.released.load(Ordering::SeqCst) {
            return Err(LlmError::NotInitialized);
        }

        let mut stdout = self.stdout.lock().await;
        self.stopping.store(false, Ordering::SeqCst);

        let id = self.next_id();
        {
            let mut stdin = self.stdin.lock().await;
            write_line(
                &mut stdin,
                &JsonRpcRequest::call(id, "complete", completion_params(&request)),
            )
            .await?;
        }

        let mut streamed = 0usize;
        loop {
            let line = read_line(&mut stdout).await?;
            let envelope = parse_envelope(&line)?;
            // Leftovers of an abandoned earlier request
            if envelope.id != Some(id) {
                log::debug!("Skipping sidecar frame for request {:?}", envelope.id);
                continue;
            }
            match frame_from(envelope.body?)? {
                Frame::Token(token) => {
                    streamed += 1;
                    on_token(token);
                }
                Frame::Done(result) => {
                    log::debug!(
                        "Sidecar completion done: {} tokens streamed, reason {:?}",
                        streamed,
                        result.stop_reason
                    );
                    return Ok(result);
                }
            }
        }
    }

    async fn stop(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut stdin = self.stdin.lock().await;
        if let Err(e) = write_line(&mut stdin, &JsonRpcRequest::notification("stop")).await {
            log::warn!("Failed to send stop to sidecar: {}", e);
        }
    }

    async fn release(&self) -> LlmResult<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        {
            let mut stdin = self.stdin.lock().await;
            let _ = write_line(
                &mut stdin,
                &JsonRpcRequest::call(self.next_id(), "shutdown", serde_json::json!({})),
            )
            .await;
        }

        if let Some(mut child) = self.child.lock().await.take() {
            child
                .kill()
                .await
                .map_err(|e| LlmError::Inference(format!("Failed to stop sidecar: {}", e)))?;
        }

        log::info!("Sidecar session released: {}", self.model_path.display());
        Ok(())
    }
}
