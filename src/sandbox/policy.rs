//! Security policy for agent-authored snippets
//!
//! The static layer walks the parsed snippet and accepts only what is on the
//! allow-lists below: named calls to known builtins, capabilities and
//! primitives, and a fixed set of methods. Anything starting with `_` is
//! private and never reachable. Runtime checks in the interpreter cover what
//! the tree cannot show (record keys built at runtime, value sizes).

use super::ast::*;
use super::fault::{FaultKind, RuntimeFault, SandboxViolation, ViolationRule};
use super::parser::{parse, ParseError};
use crate::config::SessionConfig;

/// General-purpose builtins callable by snippets
pub const BUILTIN_FUNCTIONS: &[&str] = &[
    "len", "str", "int", "float", "bool", "list", "dict", "range", "sorted", "reversed", "min",
    "max", "sum", "abs", "round", "enumerate", "zip", "any", "all", "print", "repr",
];

/// Read functions over the chunk store
pub const CAPABILITY_FUNCTIONS: &[&str] = &[
    "read_chunk",
    "search_chunks",
    "list_chunks_by_tag",
    "get_linked_chunks",
    "traverse_chunks",
];

/// Session primitives
pub const PRIMITIVE_FUNCTIONS: &[&str] = &["final", "FINAL", "recursive_query", "llm_query"];

/// Methods callable on strings, lists, dicts and chunk records
pub const ALLOWED_METHODS: &[&str] = &[
    // str
    "lower", "upper", "strip", "lstrip", "rstrip", "split", "join", "replace", "startswith",
    "endswith", "find", "count", "splitlines", "title", "capitalize", "isdigit", "isalpha",
    "isalnum",
    // list
    "append", "extend", "insert", "pop", "remove", "index", "sort", "reverse", "copy", "clear",
    // dict and record
    "get", "keys", "values", "items", "update", "setdefault",
];

/// Host builtins whose mere mention is refused, called or not
const HOST_BUILTINS: &[&str] = &[
    "eval",
    "exec",
    "compile",
    "open",
    "globals",
    "locals",
    "vars",
    "getattr",
    "setattr",
    "delattr",
    "breakpoint",
    "memoryview",
    "super",
    "exit",
    "quit",
];

pub fn is_callable_name(name: &str) -> bool {
    BUILTIN_FUNCTIONS.contains(&name)
        || CAPABILITY_FUNCTIONS.contains(&name)
        || PRIMITIVE_FUNCTIONS.contains(&name)
}

/// Private names: anything starting with `_` except the bare `_`
pub fn is_private(name: &str) -> bool {
    name.starts_with('_') && name != "_"
}

/// Why a snippet was not run
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    Violation(SandboxViolation),
    /// Not a security concern; the caller may send a corrected snippet
    Syntax(RuntimeFault),
}

/// Static and runtime limits applied to every snippet of a session
#[derive(Debug, Clone)]
pub struct SecurityPolicy {
    max_snippet_bytes: usize,
    max_nesting_depth: usize,
    max_value_bytes: usize,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self::from_config(&SessionConfig::default())
    }
}

impl SecurityPolicy {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            max_snippet_bytes: config.max_snippet_bytes,
            max_nesting_depth: config.max_nesting_depth,
            max_value_bytes: config.max_value_bytes,
        }
    }

    pub fn max_value_bytes(&self) -> usize {
        self.max_value_bytes
    }

    pub fn max_nesting_depth(&self) -> usize {
        self.max_nesting_depth
    }

    pub fn check_source(&self, source: &str) -> Result<(), SandboxViolation> {
        if source.len() > self.max_snippet_bytes {
            return Err(SandboxViolation::new(
                ViolationRule::SnippetTooLarge,
                format!(
                    "snippet is {} bytes, limit is {}",
                    source.len(),
                    self.max_snippet_bytes
                ),
            ));
        }
        Ok(())
    }

    /// Size-check, parse and statically check a snippet
    pub fn prepare(&self, source: &str) -> Result<Program, Rejection> {
        self.check_source(source).map_err(Rejection::Violation)?;

        let program = parse(source, self.max_nesting_depth).map_err(|e| match e {
            ParseError::Syntax { message, line } => {
                Rejection::Syntax(RuntimeFault::new(FaultKind::SyntaxError, message).at_line(line))
            }
            ParseError::TooDeep { line, limit } => Rejection::Violation(
                SandboxViolation::new(
                    ViolationRule::NestingTooDeep,
                    format!("snippet nests deeper than {} levels", limit),
                )
                .at_line(line),
            ),
        })?;

        self.check(&program).map_err(Rejection::Violation)?;
        Ok(program)
    }

    /// Structural allow-list check over a parsed snippet
    pub fn check(&self, program: &Program) -> Result<(), SandboxViolation> {
        check_block(&program.body)
    }
}

fn check_block(body: &[Stmt]) -> Result<(), SandboxViolation> {
    body.iter()
        .try_for_each(|stmt| check_stmt(stmt).map_err(|v| v.at_line(stmt.line)))
}

fn forbidden(what: &str) -> SandboxViolation {
    SandboxViolation::new(
        ViolationRule::ForbiddenSyntax,
        format!("{} is not allowed", what),
    )
}

fn check_stmt(stmt: &Stmt) -> Result<(), SandboxViolation> {
    match &stmt.kind {
        StmtKind::Expr(expr) => check_expr(expr),
        StmtKind::Assign { targets, value } => {
            for target in targets {
                check_target(target)?;
            }
            check_expr(value)
        }
        StmtKind::AugAssign { target, value, .. } => {
            check_target(target)?;
            check_expr(value)
        }
        StmtKind::If { branches, orelse } => {
            for (test, body) in branches {
                check_expr(test)?;
                check_block(body)?;
            }
            check_block(orelse)
        }
        StmtKind::For { target, iter, body } => {
            check_target(target)?;
            check_expr(iter)?;
            check_block(body)
        }
        StmtKind::While { test, body } => {
            check_expr(test)?;
            check_block(body)
        }
        StmtKind::Break | StmtKind::Continue | StmtKind::Pass => Ok(()),
        StmtKind::Import { modules } => Err(forbidden(&format!(
            "import of '{}'",
            modules.join(", ")
        ))),
        StmtKind::Global { names } | StmtKind::Nonlocal { names } => Err(forbidden(&format!(
            "rebinding outer scope names ({})",
            names.join(", ")
        ))),
        StmtKind::FunctionDef { name } => Err(forbidden(&format!("defining function '{}'", name))),
        StmtKind::ClassDef { name } => Err(forbidden(&format!("defining class '{}'", name))),
    }
}

/// Assignment targets may not rebind allow-listed callables
fn check_target(target: &Expr) -> Result<(), SandboxViolation> {
    match target {
        Expr::Name(name) => {
            check_name(name)?;
            if is_callable_name(name) {
                return Err(SandboxViolation::new(
                    ViolationRule::ReservedName,
                    format!("'{}' is reserved and cannot be reassigned", name),
                ));
            }
            Ok(())
        }
        Expr::Tuple(items) | Expr::List(items) => items.iter().try_for_each(check_target),
        other => check_expr(other),
    }
}

fn check_name(name: &str) -> Result<(), SandboxViolation> {
    if is_private(name) {
        return Err(SandboxViolation::new(
            ViolationRule::PrivateAccess,
            format!("access to '{}' is not allowed", name),
        ));
    }
    if HOST_BUILTINS.contains(&name) {
        return Err(SandboxViolation::new(
            ViolationRule::DisallowedCall,
            format!("'{}' is not available in the sandbox", name),
        ));
    }
    Ok(())
}

fn check_expr(expr: &Expr) -> Result<(), SandboxViolation> {
    match expr {
        Expr::Const(_) => Ok(()),
        Expr::FString(parts) => parts.iter().try_for_each(|part| match part {
            FStringPart::Literal(_) => Ok(()),
            FStringPart::Expr { value, .. } => check_expr(value),
        }),
        Expr::Name(name) => check_name(name),
        Expr::List(items) | Expr::Tuple(items) => items.iter().try_for_each(check_expr),
        Expr::Dict(entries) => entries.iter().try_for_each(|(k, v)| {
            check_expr(k)?;
            check_expr(v)
        }),
        Expr::Attribute { value, attr } => {
            check_expr(value)?;
            if is_private(attr) {
                return Err(SandboxViolation::new(
                    ViolationRule::PrivateAccess,
                    format!("access to '{}' is not allowed", attr),
                ));
            }
            Ok(())
        }
        Expr::Subscript { value, index } => {
            check_expr(value)?;
            match index {
                Index::Single(key) => {
                    if let Expr::Const(Const::Str(key)) = key.as_ref() {
                        if is_private(key) {
                            return Err(SandboxViolation::new(
                                ViolationRule::PrivateAccess,
                                format!("access to '{}' is not allowed", key),
                            ));
                        }
                    }
                    check_expr(key)
                }
                Index::Slice { lower, upper, step } => [lower, upper, step]
                    .into_iter()
                    .flatten()
                    .try_for_each(|e| check_expr(e)),
            }
        }
        Expr::Call { func, args, kwargs } => {
            check_callee(func)?;
            args.iter().try_for_each(check_expr)?;
            kwargs.iter().try_for_each(|kw| {
                if is_private(&kw.name) {
                    return Err(SandboxViolation::new(
                        ViolationRule::PrivateAccess,
                        format!("keyword argument '{}' is not allowed", kw.name),
                    ));
                }
                check_expr(&kw.value)
            })
        }
        Expr::Unary { operand, .. } => check_expr(operand),
        Expr::Binary { left, right, .. } => {
            check_expr(left)?;
            check_expr(right)
        }
        Expr::BoolOp { values, .. } => values.iter().try_for_each(check_expr),
        Expr::Compare { left, ops } => {
            check_expr(left)?;
            ops.iter().try_for_each(|(_, e)| check_expr(e))
        }
        Expr::IfExp { test, body, orelse } => {
            check_expr(test)?;
            check_expr(body)?;
            check_expr(orelse)
        }
        Expr::ListComp {
            element,
            generators,
        } => {
            check_generators(generators)?;
            check_expr(element)
        }
        Expr::DictComp {
            key,
            value,
            generators,
        } => {
            check_generators(generators)?;
            check_expr(key)?;
            check_expr(value)
        }
        Expr::Lambda { .. } => Err(forbidden("lambda")),
    }
}

fn check_generators(generators: &[Generator]) -> Result<(), SandboxViolation> {
    generators.iter().try_for_each(|generator| {
        check_target(&generator.target)?;
        check_expr(&generator.iter)?;
        generator.conditions.iter().try_for_each(check_expr)
    })
}

fn check_callee(func: &Expr) -> Result<(), SandboxViolation> {
    match func {
        Expr::Name(name) => {
            check_name(name)?;
            if !is_callable_name(name) {
                return Err(SandboxViolation::new(
                    ViolationRule::DisallowedCall,
                    format!("call to '{}' is not allowed", name),
                ));
            }
            Ok(())
        }
        Expr::Attribute { value, attr } => {
            check_expr(value)?;
            if is_private(attr) {
                return Err(SandboxViolation::new(
                    ViolationRule::PrivateAccess,
                    format!("access to '{}' is not allowed", attr),
                ));
            }
            if !ALLOWED_METHODS.contains(&attr.as_str()) {
                return Err(SandboxViolation::new(
                    ViolationRule::DisallowedCall,
                    format!("method '{}' is not allowed", attr),
                ));
            }
            Ok(())
        }
        _ => Err(SandboxViolation::new(
            ViolationRule::DisallowedCall,
            "only named functions and methods can be called",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejection(src: &str) -> Rejection {
        SecurityPolicy::default()
            .prepare(src)
            .expect_err(&format!("{src:?} should be rejected"))
    }

    fn violation(src: &str) -> SandboxViolation {
        match rejection(src) {
            Rejection::Violation(v) => v,
            other => panic!("{src:?}: expected violation, got {other:?}"),
        }
    }

    #[test]
    fn test_allows_ordinary_snippets() {
        let policy = SecurityPolicy::default();
        for src in [
            "ids = search_chunks('python', limit=3)\nc = read_chunk(ids[0])\nfinal(c.content)",
            "for _ in range(3):\n    print(_)",
            "tags = [t.upper() for t in chunk['tags'] if t]",
            "answer = recursive_query('summarize', context=ids)\nprint(f'{answer!r}')",
            "d = {}\nd.setdefault('k', 0)\nd['k'] += 1",
        ] {
            assert!(policy.prepare(src).is_ok(), "{src}");
        }
    }

    #[test]
    fn test_reflection_chain_rejected() {
        let v = violation("c = read_chunk('chunk-a')\nx = c.__class__.__bases__");
        assert_eq!(v.rule, ViolationRule::PrivateAccess);
        assert!(v.reason.contains("__class__"));
        assert_eq!(v.line, Some(2));

        let v = violation("x = ().__class__.__mro__[1].__subclasses__()");
        assert_eq!(v.rule, ViolationRule::PrivateAccess);
    }

    #[test]
    fn test_rules() {
        let cases = [
            ("import os", ViolationRule::ForbiddenSyntax),
            ("from os import path", ViolationRule::ForbiddenSyntax),
            ("def f():\n    return 1", ViolationRule::ForbiddenSyntax),
            ("g = lambda: 1", ViolationRule::ForbiddenSyntax),
            ("global x", ViolationRule::ForbiddenSyntax),
            ("eval('1')", ViolationRule::DisallowedCall),
            ("g = globals", ViolationRule::DisallowedCall),
            ("open('/etc/passwd')", ViolationRule::DisallowedCall),
            ("type(x)", ViolationRule::DisallowedCall),
            ("'{0.__class__}'.format(x)", ViolationRule::DisallowedCall),
            ("search_chunks('a')[0]()", ViolationRule::DisallowedCall),
            ("__import__('os')", ViolationRule::PrivateAccess),
            ("x = c['__dict__']", ViolationRule::PrivateAccess),
            ("print(f'{c.__class__}')", ViolationRule::PrivateAccess),
            ("len = 3", ViolationRule::ReservedName),
            ("for final in xs: pass", ViolationRule::ReservedName),
        ];
        for (src, rule) in cases {
            assert_eq!(violation(src).rule, rule, "{src}");
        }
    }

    #[test]
    fn test_limits() {
        let config = SessionConfig {
            max_snippet_bytes: 16,
            max_nesting_depth: 4,
            ..SessionConfig::default()
        };
        let policy = SecurityPolicy::from_config(&config);
        assert_eq!(
            policy.check_source(&"x".repeat(17)).unwrap_err().rule,
            ViolationRule::SnippetTooLarge
        );
        match policy.prepare("x = [[[[[1]]]]]") {
            Err(Rejection::Violation(v)) => assert_eq!(v.rule, ViolationRule::NestingTooDeep),
            other => panic!("expected nesting violation, got {other:?}"),
        }
    }

    #[test]
    fn test_syntax_error_is_not_a_violation() {
        match rejection("x = (1,") {
            Rejection::Syntax(fault) => assert_eq!(fault.kind, FaultKind::SyntaxError),
            other => panic!("expected syntax fault, got {other:?}"),
        }
    }
}
