//! Sandboxed execution of agent-authored snippets
//!
//! A snippet goes through the lexer and parser, is checked by the
//! [`SecurityPolicy`], then runs in the [`interpreter`] with a namespace
//! holding the allow-listed builtins, the [`CapabilitySurface`] and the
//! session primitives (`final`, `recursive_query`).

mod ast;
mod backend;
mod builtins;
mod capability;
mod fault;
mod interpreter;
mod lexer;
mod parser;
mod policy;
mod session;
mod value;

pub use ast::Program;
pub use backend::{
    call_with_deadline, extract_code, BackendError, CompletionBackend, CompletionRequest,
    ScriptedBackend,
};
pub use capability::{CapabilitySurface, ChunkSource, DEFAULT_TRAVERSAL_NODES};
pub use fault::{BudgetExceeded, BudgetKind, FaultKind, RuntimeFault, SandboxViolation, ViolationRule};
pub use interpreter::MAX_VALUE_DEPTH;
pub use lexer::{tokenize, LexError, Tok, Token};
pub use parser::{parse, ParseError};
pub use policy::{
    is_callable_name, is_private, Rejection, SecurityPolicy, ALLOWED_METHODS, BUILTIN_FUNCTIONS,
    CAPABILITY_FUNCTIONS, PRIMITIVE_FUNCTIONS,
};
pub use session::{
    ExecutionSession, ResultSlot, SessionState, SessionSummary, StepOutcome, StepReport,
    Termination,
};
pub use value::{format_float, Dict, Record, Value};
