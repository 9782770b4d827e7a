//! Execution session: one recursive-reasoning run over the chunk store
//!
//! A session owns its scratch namespace, budgets and terminal result slot.
//! Each `execute` call validates one snippet, runs it, and moves the state
//! machine:
//!
//! ```text
//! idle -> running -> (awaiting_recursive_result -> running)* -> done | exhausted | failed
//! ```
//!
//! Runtime faults leave the session running so the caller can send a
//! corrected snippet. Violations and storage faults fail it; budgets
//! exhaust it. A terminal session refuses further steps.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::backend::{call_with_deadline, extract_code, BackendError, CompletionBackend, CompletionRequest};
use super::builtins::{bind_args, expect_str, too_large};
use super::capability::{CapabilitySurface, ChunkSource};
use super::fault::{
    BudgetExceeded, BudgetKind, FaultKind, Interrupt, RuntimeFault, SandboxViolation,
};
use super::interpreter::{Host, Interpreter, Limits};
use super::policy::{Rejection, SecurityPolicy};
use super::value::Value;
use crate::config::SessionConfig;
use crate::error::{MeridianError, Result};
use crate::storage::ChunkStore;

/// Feedback from one step is cut to this many characters in driver prompts
const FEEDBACK_CHARS: usize = 4000;

/// Lifecycle of an execution session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Running,
    AwaitingRecursiveResult,
    Done,
    Exhausted,
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Running => "running",
            SessionState::AwaitingRecursiveResult => "awaiting_recursive_result",
            SessionState::Done => "done",
            SessionState::Exhausted => "exhausted",
            SessionState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Done | SessionState::Exhausted | SessionState::Failed
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one step ended with
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepOutcome {
    /// `final` was called; the session is done
    Final { answer: String },
    Violation(SandboxViolation),
    Fault(RuntimeFault),
    BudgetExceeded(BudgetExceeded),
    StorageFault { message: String },
    /// Ran to completion without a final answer
    AwaitingNextStep,
}

/// Structured result of `ExecutionSession::execute`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepReport {
    pub outcome: StepOutcome,
    /// Captured `print` output
    pub output: String,
    /// `repr` of a trailing expression statement, if any
    pub value: Option<String>,
    /// State after the step
    pub state: SessionState,
}

impl StepReport {
    /// Text fed back to the model by the driver loop
    pub fn feedback(&self) -> String {
        let mut text = String::new();
        if !self.output.is_empty() {
            text.push_str(&self.output);
        }
        if let Some(value) = &self.value {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(value);
        }
        match &self.outcome {
            StepOutcome::Fault(f) => {
                if !text.is_empty() && !text.ends_with('\n') {
                    text.push('\n');
                }
                text.push_str(&f.to_string());
            }
            StepOutcome::AwaitingNextStep if text.is_empty() => text.push_str("(no output)"),
            _ => {}
        }
        truncate_chars(&text, FEEDBACK_CHARS)
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => format!("{}... (truncated)", &text[..cut]),
        None => text.to_string(),
    }
}

/// Why a session reached a terminal state
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Termination {
    Answered,
    Violation(SandboxViolation),
    Budget(BudgetExceeded),
    StorageFault { message: String },
    /// The driver loop could not obtain the next snippet
    BackendFailure { message: String },
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Answered => f.write_str("final answer recorded"),
            Termination::Violation(v) => write!(f, "{}", v),
            Termination::Budget(b) => write!(f, "{}", b),
            Termination::StorageFault { message } => write!(f, "storage fault: {}", message),
            Termination::BackendFailure { message } => write!(f, "backend failure: {}", message),
        }
    }
}

/// Write-once terminal answer
#[derive(Debug, Clone, Default)]
pub struct ResultSlot(Option<String>);

impl ResultSlot {
    pub fn set(&mut self, answer: String) -> std::result::Result<(), RuntimeFault> {
        if self.0.is_some() {
            return Err(RuntimeFault::new(
                FaultKind::RuntimeError,
                "final answer already recorded",
            ));
        }
        self.0 = Some(answer);
        Ok(())
    }

    pub fn get(&self) -> Option<&str> {
        self.0.as_deref()
    }

    pub fn is_set(&self) -> bool {
        self.0.is_some()
    }
}

/// Outcome of a driven run
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub state: SessionState,
    pub answer: Option<String>,
    /// Diagnosed reason for the terminal state
    pub termination: Option<String>,
    pub recursion_count: usize,
    pub code_steps: usize,
    /// Most recent runtime fault, if the last steps were failing
    pub last_fault: Option<String>,
    pub elapsed_ms: u64,
}

/// Longest wall-clock budget a session honours, whatever the configuration says
const MAX_SESSION_TIMEOUT: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Namespace callbacks for one step
struct SessionHost<'s, S: ChunkSource> {
    surface: &'s CapabilitySurface<S>,
    backend: &'s Arc<dyn CompletionBackend>,
    result: &'s mut ResultSlot,
    state: &'s mut SessionState,
    recursion_count: &'s mut usize,
    max_recursion: usize,
    max_value_bytes: usize,
    deadline: Instant,
    timeout_ms: u64,
    session_id: &'s str,
}

impl<S: ChunkSource> SessionHost<'_, S> {
    fn finish(&mut self, args: Vec<Value>, kwargs: Vec<(String, Value)>) -> std::result::Result<Value, Interrupt> {
        let [answer] = first::<1>(bind_args("final", &["answer"], 1, args, kwargs)?);
        let answer = answer.to_display();
        self.result.set(answer.clone())?;
        Err(Interrupt::Final(answer))
    }

    fn recursive_query(
        &mut self,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> std::result::Result<Value, Interrupt> {
        let [prompt, context] = first::<2>(bind_args(
            "recursive_query",
            &["prompt", "context"],
            1,
            args,
            kwargs,
        )?);
        let prompt = expect_str("recursive_query", &prompt)?.to_string();

        if *self.recursion_count >= self.max_recursion {
            return Err(BudgetExceeded {
                kind: BudgetKind::Iterations,
                limit: self.max_recursion as u64,
            }
            .into());
        }

        let remaining = self.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(BudgetExceeded {
                kind: BudgetKind::Time,
                limit: self.timeout_ms,
            }
            .into());
        }

        let context = self.surface.resolve_context(&context)?;
        *self.recursion_count += 1;

        let mut request = CompletionRequest::new(prompt);
        if let Some(context) = context {
            request = request.with_context(context);
        }

        debug!(
            session_id = self.session_id,
            call = *self.recursion_count,
            "Issuing recursive query"
        );
        *self.state = SessionState::AwaitingRecursiveResult;
        let reply = call_with_deadline(self.backend, request, remaining);
        *self.state = SessionState::Running;

        match reply {
            Ok(text) => {
                if text.len() > self.max_value_bytes {
                    return Err(too_large(text.len(), self.max_value_bytes).into());
                }
                Ok(Value::Str(text))
            }
            Err(BackendError::Timeout(_)) => Err(BudgetExceeded {
                kind: BudgetKind::Time,
                limit: self.timeout_ms,
            }
            .into()),
            Err(e) => Err(RuntimeFault::new(FaultKind::BackendError, e.to_string()).into()),
        }
    }
}

impl<S: ChunkSource> Host for SessionHost<'_, S> {
    fn call(&mut self, name: &str, args: Vec<Value>, kwargs: Vec<(String, Value)>) -> std::result::Result<Value, Interrupt> {
        match name {
            "final" | "FINAL" => self.finish(args, kwargs),
            "recursive_query" | "llm_query" => self.recursive_query(args, kwargs),
            _ => self.surface.call(name, args, kwargs),
        }
    }
}

fn first<const N: usize>(args: Vec<Option<Value>>) -> [Value; N] {
    let mut out: [Value; N] = std::array::from_fn(|_| Value::None);
    for (slot, value) in out.iter_mut().zip(args) {
        *slot = value.unwrap_or_default();
    }
    out
}

const DRIVER_PREAMBLE: &str = "\
You answer questions by writing Python snippets that explore a memory store.
Reply with one ```python code block per turn. Available functions:
  search_chunks(query, limit=10) -> list of chunk ids
  list_chunks_by_tag(tag_or_tags, match='any') -> list of chunk ids
  read_chunk(chunk_id) -> chunk with .content, .tags, .links, .found
  get_linked_chunks(chunk_id, link_type=None) -> list of chunk ids
  traverse_chunks(start, max_nodes=25, order='bfs') -> list of chunk ids
  recursive_query(prompt, context=None) -> text answer from a sub-model
  final(answer) -> record the answer and stop
Variables persist between turns. Use print() to see values.";

/// A sandboxed recursive-reasoning session over a chunk source
pub struct ExecutionSession<S: ChunkSource = ChunkStore> {
    id: String,
    surface: CapabilitySurface<S>,
    backend: Arc<dyn CompletionBackend>,
    policy: SecurityPolicy,
    config: SessionConfig,
    state: SessionState,
    scratch: BTreeMap<String, Value>,
    result: ResultSlot,
    termination: Option<Termination>,
    last_fault: Option<RuntimeFault>,
    recursion_count: usize,
    code_steps: usize,
    started: Option<Instant>,
    deadline: Option<Instant>,
}

impl<S: ChunkSource> ExecutionSession<S> {
    pub fn new(source: S, backend: Arc<dyn CompletionBackend>, config: SessionConfig) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            surface: CapabilitySurface::new(source, &config),
            backend,
            policy: SecurityPolicy::from_config(&config),
            config,
            state: SessionState::Idle,
            scratch: BTreeMap::new(),
            result: ResultSlot::default(),
            termination: None,
            last_fault: None,
            recursion_count: 0,
            code_steps: 0,
            started: None,
            deadline: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The final answer, once the session is done
    pub fn result(&self) -> Option<&str> {
        self.result.get()
    }

    pub fn termination(&self) -> Option<&Termination> {
        self.termination.as_ref()
    }

    pub fn last_fault(&self) -> Option<&RuntimeFault> {
        self.last_fault.as_ref()
    }

    pub fn recursion_count(&self) -> usize {
        self.recursion_count
    }

    pub fn code_steps(&self) -> usize {
        self.code_steps
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Snapshot of the scratch namespace
    pub fn scratch(&self) -> BTreeMap<String, Value> {
        self.scratch.clone()
    }

    pub fn source(&self) -> &S {
        self.surface.source()
    }

    /// The deadline starts with the first step
    fn deadline(&mut self) -> Instant {
        let timeout = self.config.timeout().min(MAX_SESSION_TIMEOUT);
        let started = *self.started.get_or_insert_with(Instant::now);
        *self.deadline.get_or_insert_with(|| started + timeout)
    }

    fn terminate(&mut self, state: SessionState, termination: Termination) {
        match state {
            SessionState::Done => info!(
                session_id = %self.id,
                code_steps = self.code_steps,
                recursion_count = self.recursion_count,
                "Session done"
            ),
            _ => warn!(
                session_id = %self.id,
                state = %state,
                reason = %termination,
                "Session terminated"
            ),
        }
        self.state = state;
        self.termination = Some(termination);
    }

    fn exhausted(&mut self, budget: BudgetExceeded) -> StepReport {
        self.terminate(SessionState::Exhausted, Termination::Budget(budget));
        StepReport {
            outcome: StepOutcome::BudgetExceeded(budget),
            output: String::new(),
            value: None,
            state: self.state,
        }
    }

    /// Validate and run one snippet
    pub fn execute(&mut self, snippet: &str) -> Result<StepReport> {
        if self.state.is_terminal() {
            return Err(MeridianError::SessionClosed(self.state));
        }

        let deadline = self.deadline();
        if Instant::now() >= deadline {
            return Ok(self.exhausted(BudgetExceeded {
                kind: BudgetKind::Time,
                limit: self.config.timeout_ms,
            }));
        }
        if self.code_steps >= self.config.max_code_steps {
            return Ok(self.exhausted(BudgetExceeded {
                kind: BudgetKind::CodeSteps,
                limit: self.config.max_code_steps as u64,
            }));
        }

        self.code_steps += 1;
        self.state = SessionState::Running;
        debug!(session_id = %self.id, step = self.code_steps, bytes = snippet.len(), "Executing snippet");

        let program = match self.policy.prepare(snippet) {
            Ok(program) => program,
            Err(Rejection::Violation(v)) => {
                self.terminate(SessionState::Failed, Termination::Violation(v.clone()));
                return Ok(StepReport {
                    outcome: StepOutcome::Violation(v),
                    output: String::new(),
                    value: None,
                    state: self.state,
                });
            }
            Err(Rejection::Syntax(f)) => {
                self.last_fault = Some(f.clone());
                return Ok(StepReport {
                    outcome: StepOutcome::Fault(f),
                    output: String::new(),
                    value: None,
                    state: self.state,
                });
            }
        };

        let limits = Limits {
            max_value_bytes: self.config.max_value_bytes,
            deadline,
            timeout_ms: self.config.timeout_ms,
        };
        let mut host = SessionHost {
            surface: &self.surface,
            backend: &self.backend,
            result: &mut self.result,
            state: &mut self.state,
            recursion_count: &mut self.recursion_count,
            max_recursion: self.config.max_recursion,
            max_value_bytes: self.config.max_value_bytes,
            deadline,
            timeout_ms: self.config.timeout_ms,
            session_id: &self.id,
        };
        let mut interpreter = Interpreter::new(&mut self.scratch, &mut host, limits);
        let result = interpreter.run(&program);
        let output = interpreter.take_output();

        let mut value = None;
        let outcome = match result {
            Ok(v) => {
                value = v.filter(|v| *v != Value::None).map(|v| v.repr());
                StepOutcome::AwaitingNextStep
            }
            Err(Interrupt::Final(answer)) => {
                self.terminate(SessionState::Done, Termination::Answered);
                StepOutcome::Final { answer }
            }
            Err(Interrupt::Violation(v)) => {
                self.terminate(SessionState::Failed, Termination::Violation(v.clone()));
                StepOutcome::Violation(v)
            }
            Err(Interrupt::Budget(b)) => {
                self.terminate(SessionState::Exhausted, Termination::Budget(b));
                StepOutcome::BudgetExceeded(b)
            }
            Err(Interrupt::Fault(f)) => {
                debug!(session_id = %self.id, fault = %f, "Snippet raised a runtime fault");
                self.last_fault = Some(f.clone());
                StepOutcome::Fault(f)
            }
            Err(Interrupt::Storage(message)) => {
                self.terminate(
                    SessionState::Failed,
                    Termination::StorageFault {
                        message: message.clone(),
                    },
                );
                StepOutcome::StorageFault { message }
            }
            Err(Interrupt::Break) | Err(Interrupt::Continue) => {
                StepOutcome::Fault(RuntimeFault::new(FaultKind::SyntaxError, "loop control outside loop"))
            }
        };

        Ok(StepReport {
            outcome,
            output,
            value,
            state: self.state,
        })
    }

    /// Drive the session from a question until it reaches a terminal state
    ///
    /// Each turn asks the backend for the next snippet and feeds the step's
    /// output or fault back in. Turns count as code steps.
    pub fn run(&mut self, query: &str) -> Result<SessionSummary> {
        if self.state.is_terminal() {
            return Err(MeridianError::SessionClosed(self.state));
        }
        info!(session_id = %self.id, "Starting driven session");

        let deadline = self.deadline();
        let mut history: Vec<(String, String)> = Vec::new();

        while !self.state.is_terminal() {
            if self.code_steps >= self.config.max_code_steps {
                self.exhausted(BudgetExceeded {
                    kind: BudgetKind::CodeSteps,
                    limit: self.config.max_code_steps as u64,
                });
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining == Duration::ZERO {
                self.exhausted(BudgetExceeded {
                    kind: BudgetKind::Time,
                    limit: self.config.timeout_ms,
                });
                break;
            }

            let request = CompletionRequest::new(driver_prompt(query, &history));
            let reply = match call_with_deadline(&self.backend, request, remaining) {
                Ok(reply) => reply,
                Err(BackendError::Timeout(_)) => {
                    self.exhausted(BudgetExceeded {
                        kind: BudgetKind::Time,
                        limit: self.config.timeout_ms,
                    });
                    break;
                }
                Err(e) => {
                    self.terminate(
                        SessionState::Failed,
                        Termination::BackendFailure {
                            message: e.to_string(),
                        },
                    );
                    break;
                }
            };

            let code = extract_code(&reply);
            let report = self.execute(&code)?;
            history.push((code, report.feedback()));
        }

        Ok(self.summary())
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.id.clone(),
            state: self.state,
            answer: self.result.get().map(str::to_string),
            termination: self.termination.as_ref().map(|t| t.to_string()),
            recursion_count: self.recursion_count,
            code_steps: self.code_steps,
            last_fault: self.last_fault.as_ref().map(|f| f.to_string()),
            elapsed_ms: self
                .started
                .map(|s| s.elapsed().as_millis() as u64)
                .unwrap_or(0),
        }
    }
}

fn driver_prompt(query: &str, history: &[(String, String)]) -> String {
    let mut prompt = format!("{}\n\nQuestion: {}\n", DRIVER_PREAMBLE, query);
    for (i, (code, feedback)) in history.iter().enumerate() {
        prompt.push_str(&format!(
            "\n--- step {} ---\n```python\n{}\n```\nResult:\n{}\n",
            i + 1,
            code,
            feedback
        ));
    }
    prompt.push_str("\nWrite the next snippet.");
    prompt
}
