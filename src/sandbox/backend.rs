//! Completion backend consumed by `recursive_query` and the driver loop

use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, warn};

/// One call to the completion backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    pub prompt: String,
    /// Resolved chunk content or caller-supplied text
    pub context: Option<String>,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

/// Distinguishable backend failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Completion failed: {0}")]
    Failed(String),

    #[error("Completion timed out after {0:?}")]
    Timeout(Duration),
}

/// Synchronous text completion
pub trait CompletionBackend: Send + Sync {
    fn complete(&self, request: &CompletionRequest) -> Result<String, BackendError>;
}

impl<F> CompletionBackend for F
where
    F: Fn(&CompletionRequest) -> Result<String, BackendError> + Send + Sync,
{
    fn complete(&self, request: &CompletionRequest) -> Result<String, BackendError> {
        self(request)
    }
}

/// Replays canned responses in order and records every request
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    responses: Mutex<VecDeque<Result<String, BackendError>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedBackend {
    pub fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            responses: Mutex::new(responses.into_iter().map(|r| Ok(r.into())).collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queue a failure after the responses already scripted
    pub fn push_error(&self, error: BackendError) {
        self.responses.lock().push_back(Err(error));
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().len()
    }
}

impl CompletionBackend for ScriptedBackend {
    fn complete(&self, request: &CompletionRequest) -> Result<String, BackendError> {
        self.requests.lock().push(request.clone());
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(BackendError::Unavailable("no scripted response left".into())))
    }
}

/// Call the backend on a helper thread, giving up once `timeout` elapses
///
/// An abandoned call keeps running on its thread; its result is dropped.
pub fn call_with_deadline(
    backend: &Arc<dyn CompletionBackend>,
    request: CompletionRequest,
    timeout: Duration,
) -> Result<String, BackendError> {
    if timeout.is_zero() {
        return Err(BackendError::Timeout(timeout));
    }

    let (tx, rx) = mpsc::sync_channel(1);
    let backend = Arc::clone(backend);
    let spawned = thread::Builder::new()
        .name("meridian-completion".into())
        .spawn(move || {
            let _ = tx.send(backend.complete(&request));
        });
    if let Err(e) = spawned {
        return Err(BackendError::Unavailable(format!(
            "failed to spawn completion thread: {}",
            e
        )));
    }

    match rx.recv_timeout(timeout) {
        Ok(result) => {
            debug!(ok = result.is_ok(), "Completion returned");
            result
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            warn!(timeout_ms = timeout.as_millis() as u64, "Completion abandoned at deadline");
            Err(BackendError::Timeout(timeout))
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(BackendError::Failed(
            "completion thread exited without a result".into(),
        )),
    }
}

static CODE_FENCE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```(?:python|repl|py)?[ \t]*\r?\n(.*?)```").unwrap()
});

/// Extract the snippet from a model reply
///
/// Prefers the first fenced block; a reply without fences is taken as-is.
pub fn extract_code(reply: &str) -> String {
    match CODE_FENCE_RE.captures(reply).and_then(|c| c.get(1)) {
        Some(code) => code.as_str().trim_end().to_string(),
        None => reply.trim().to_string(),
    }
}
