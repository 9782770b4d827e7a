//! Outcomes a snippet can raise
//!
//! None of these are `MeridianError`s: a step always returns a report, and
//! the session decides from the condition which state it moves to.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Security rule a violation is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationRule {
    /// import, def, class, lambda, global, nonlocal
    ForbiddenSyntax,
    /// Names, attributes or keys starting with `_`
    PrivateAccess,
    /// Call to something outside the allow-list
    DisallowedCall,
    /// Rebinding a builtin or capability name
    ReservedName,
    SnippetTooLarge,
    NestingTooDeep,
    ValueTooLarge,
    /// Chunk id shaped like a filesystem path
    PathLikeId,
}

impl ViolationRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationRule::ForbiddenSyntax => "forbidden_syntax",
            ViolationRule::PrivateAccess => "private_access",
            ViolationRule::DisallowedCall => "disallowed_call",
            ViolationRule::ReservedName => "reserved_name",
            ViolationRule::SnippetTooLarge => "snippet_too_large",
            ViolationRule::NestingTooDeep => "nesting_too_deep",
            ViolationRule::ValueTooLarge => "value_too_large",
            ViolationRule::PathLikeId => "path_like_id",
        }
    }
}

impl fmt::Display for ViolationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A snippet attempted something outside the capability surface
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[error("sandbox violation [{rule}]: {reason}")]
pub struct SandboxViolation {
    pub rule: ViolationRule,
    pub reason: String,
    pub line: Option<usize>,
}

impl SandboxViolation {
    pub fn new(rule: ViolationRule, reason: impl Into<String>) -> Self {
        Self {
            rule,
            reason: reason.into(),
            line: None,
        }
    }

    pub fn at_line(mut self, line: usize) -> Self {
        self.line.get_or_insert(line);
        self
    }
}

/// Which session budget ran out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetKind {
    /// Recursive-query calls
    Iterations,
    /// Wall-clock deadline
    Time,
    /// Executed snippets
    CodeSteps,
}

impl BudgetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetKind::Iterations => "iterations",
            BudgetKind::Time => "time",
            BudgetKind::CodeSteps => "code steps",
        }
    }
}

impl fmt::Display for BudgetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A session budget was exhausted; the snippet itself did nothing wrong
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize)]
#[error("budget exceeded: {kind} (limit {limit})")]
pub struct BudgetExceeded {
    pub kind: BudgetKind,
    /// Calls, steps, or milliseconds depending on `kind`
    pub limit: u64,
}

/// Python-style exception class of a runtime fault
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FaultKind {
    SyntaxError,
    NameError,
    TypeError,
    ValueError,
    KeyError,
    IndexError,
    AttributeError,
    ZeroDivisionError,
    OverflowError,
    RuntimeError,
    BackendError,
}

impl FaultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultKind::SyntaxError => "SyntaxError",
            FaultKind::NameError => "NameError",
            FaultKind::TypeError => "TypeError",
            FaultKind::ValueError => "ValueError",
            FaultKind::KeyError => "KeyError",
            FaultKind::IndexError => "IndexError",
            FaultKind::AttributeError => "AttributeError",
            FaultKind::ZeroDivisionError => "ZeroDivisionError",
            FaultKind::OverflowError => "OverflowError",
            FaultKind::RuntimeError => "RuntimeError",
            FaultKind::BackendError => "BackendError",
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An ordinary error in the snippet's own logic; the session stays usable
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
pub struct RuntimeFault {
    pub kind: FaultKind,
    pub message: String,
    pub line: Option<usize>,
}

impl RuntimeFault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            line: None,
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(FaultKind::TypeError, message)
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new(FaultKind::ValueError, message)
    }

    pub fn at_line(mut self, line: usize) -> Self {
        self.line.get_or_insert(line);
        self
    }
}

impl fmt::Display for RuntimeFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "{}: {} (line {})", self.kind, self.message, line),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

/// Anything that stops evaluation of a snippet early
///
/// `Break` and `Continue` are loop control and never leave the interpreter.
#[derive(Debug, Clone)]
pub(crate) enum Interrupt {
    Final(String),
    Violation(SandboxViolation),
    Budget(BudgetExceeded),
    Fault(RuntimeFault),
    Storage(String),
    Break,
    Continue,
}

impl Interrupt {
    pub(crate) fn at_line(self, line: usize) -> Self {
        match self {
            Interrupt::Violation(v) => Interrupt::Violation(v.at_line(line)),
            Interrupt::Fault(f) => Interrupt::Fault(f.at_line(line)),
            other => other,
        }
    }
}

impl From<SandboxViolation> for Interrupt {
    fn from(v: SandboxViolation) -> Self {
        Interrupt::Violation(v)
    }
}

impl From<RuntimeFault> for Interrupt {
    fn from(f: RuntimeFault) -> Self {
        Interrupt::Fault(f)
    }
}

impl From<BudgetExceeded> for Interrupt {
    fn from(b: BudgetExceeded) -> Self {
        Interrupt::Budget(b)
    }
}
