//! Tree-walking evaluator for checked snippets
//!
//! Names live in the session's scratch map, so bindings made by one step
//! are visible to the next. Values are copied on read; mutating methods and
//! subscript assignment write through a place path rooted at a variable.

use std::collections::BTreeMap;
use std::time::Instant;

use super::ast::*;
use super::builtins::{
    binary_op, call_builtin, call_method, compare, dict_key, format_with_spec, get_attribute,
    get_item, get_slice, is_mutating, item_mut, iterate, set_item, too_large,
};
use super::fault::{
    BudgetExceeded, BudgetKind, FaultKind, Interrupt, RuntimeFault, SandboxViolation,
    ViolationRule,
};
use super::policy::{is_callable_name, is_private, BUILTIN_FUNCTIONS};
use super::value::{Dict, Value};

/// Deepest container nesting a snippet may build
pub const MAX_VALUE_DEPTH: usize = 64;

type Outcome<T> = Result<T, Interrupt>;

/// Calls the interpreter cannot answer itself: capabilities and primitives
pub(crate) trait Host {
    fn call(&mut self, name: &str, args: Vec<Value>, kwargs: Vec<(String, Value)>) -> Outcome<Value>;
}

/// Per-step limits
#[derive(Debug, Clone, Copy)]
pub(crate) struct Limits {
    pub max_value_bytes: usize,
    pub deadline: Instant,
    /// Reported in the budget condition when the deadline passes
    pub timeout_ms: u64,
}

pub(crate) struct Interpreter<'a, H: Host> {
    scratch: &'a mut BTreeMap<String, Value>,
    host: &'a mut H,
    limits: Limits,
    output: String,
}

fn fault(kind: FaultKind, message: impl Into<String>) -> Interrupt {
    Interrupt::Fault(RuntimeFault::new(kind, message))
}

fn forbidden(what: &str) -> Interrupt {
    SandboxViolation::new(ViolationRule::ForbiddenSyntax, format!("{} is not allowed", what)).into()
}

impl<'a, H: Host> Interpreter<'a, H> {
    pub(crate) fn new(scratch: &'a mut BTreeMap<String, Value>, host: &'a mut H, limits: Limits) -> Self {
        Self {
            scratch,
            host,
            limits,
            output: String::new(),
        }
    }

    /// Captured `print` output
    pub(crate) fn take_output(&mut self) -> String {
        std::mem::take(&mut self.output)
    }

    /// Run a program; the value of a trailing expression statement is returned
    pub(crate) fn run(&mut self, program: &Program) -> Outcome<Option<Value>> {
        let Some((last, rest)) = program.body.split_last() else {
            return Ok(None);
        };
        for stmt in rest {
            self.exec_top(stmt)?;
        }
        if let StmtKind::Expr(expr) = &last.kind {
            self.check_deadline()?;
            let value = self.eval(expr).map_err(|e| e.at_line(last.line))?;
            return Ok(Some(value));
        }
        self.exec_top(last)?;
        Ok(None)
    }

    fn exec_top(&mut self, stmt: &Stmt) -> Outcome<()> {
        match self.exec(stmt) {
            Err(Interrupt::Break) => Err(fault(FaultKind::SyntaxError, "'break' outside loop").at_line(stmt.line)),
            Err(Interrupt::Continue) => {
                Err(fault(FaultKind::SyntaxError, "'continue' not properly in loop").at_line(stmt.line))
            }
            other => other,
        }
    }

    fn check_deadline(&self) -> Outcome<()> {
        if Instant::now() >= self.limits.deadline {
            return Err(BudgetExceeded {
                kind: BudgetKind::Time,
                limit: self.limits.timeout_ms,
            }
            .into());
        }
        Ok(())
    }

    fn check_value(&self, value: &Value) -> Outcome<()> {
        let cap = self.limits.max_value_bytes;
        let size = value.approx_size(cap);
        if size > cap {
            return Err(too_large(size, cap).into());
        }
        if value.depth(MAX_VALUE_DEPTH + 1) > MAX_VALUE_DEPTH {
            return Err(SandboxViolation::new(
                ViolationRule::ValueTooLarge,
                format!("value nesting exceeds {} levels", MAX_VALUE_DEPTH),
            )
            .into());
        }
        Ok(())
    }

    // ---- statements ----

    fn exec_block(&mut self, body: &[Stmt]) -> Outcome<()> {
        for stmt in body {
            self.exec(stmt)?;
        }
        Ok(())
    }

    fn exec(&mut self, stmt: &Stmt) -> Outcome<()> {
        self.check_deadline()?;
        self.exec_kind(&stmt.kind).map_err(|e| e.at_line(stmt.line))
    }

    fn exec_kind(&mut self, kind: &StmtKind) -> Outcome<()> {
        match kind {
            StmtKind::Expr(expr) => self.eval(expr).map(|_| ()),
            StmtKind::Assign { targets, value } => {
                let value = self.eval(value)?;
                self.check_value(&value)?;
                for target in targets {
                    self.assign(target, value.clone())?;
                }
                Ok(())
            }
            StmtKind::AugAssign { target, op, value } => {
                let current = self.eval(target)?;
                let rhs = self.eval(value)?;
                let updated = binary_op(*op, &current, &rhs, self.limits.max_value_bytes)?;
                self.check_value(&updated)?;
                self.assign(target, updated)
            }
            StmtKind::If { branches, orelse } => {
                for (test, body) in branches {
                    if self.eval(test)?.truthy() {
                        return self.exec_block(body);
                    }
                }
                self.exec_block(orelse)
            }
            StmtKind::For { target, iter, body } => {
                let items = self.eval_iterable(iter)?;
                for item in items {
                    self.check_deadline()?;
                    self.assign(target, item)?;
                    match self.exec_block(body) {
                        Err(Interrupt::Break) => break,
                        Err(Interrupt::Continue) | Ok(()) => {}
                        Err(e) => return Err(e),
                    }
                }
                Ok(())
            }
            StmtKind::While { test, body } => {
                loop {
                    self.check_deadline()?;
                    if !self.eval(test)?.truthy() {
                        break;
                    }
                    match self.exec_block(body) {
                        Err(Interrupt::Break) => break,
                        Err(Interrupt::Continue) | Ok(()) => {}
                        Err(e) => return Err(e),
                    }
                }
                Ok(())
            }
            StmtKind::Break => Err(Interrupt::Break),
            StmtKind::Continue => Err(Interrupt::Continue),
            StmtKind::Pass => Ok(()),
            StmtKind::Import { .. } => Err(forbidden("import")),
            StmtKind::Global { .. } | StmtKind::Nonlocal { .. } => Err(forbidden("scope declaration")),
            StmtKind::FunctionDef { .. } => Err(forbidden("function definition")),
            StmtKind::ClassDef { .. } => Err(forbidden("class definition")),
        }
    }

    // ---- assignment ----

    fn assign(&mut self, target: &Expr, value: Value) -> Outcome<()> {
        match target {
            Expr::Name(name) => {
                if is_private(name) {
                    return Err(SandboxViolation::new(
                        ViolationRule::PrivateAccess,
                        format!("access to '{}' is not allowed", name),
                    )
                    .into());
                }
                if is_callable_name(name) {
                    return Err(SandboxViolation::new(
                        ViolationRule::ReservedName,
                        format!("'{}' cannot be rebound", name),
                    )
                    .into());
                }
                self.scratch.insert(name.clone(), value);
                Ok(())
            }
            Expr::Tuple(targets) | Expr::List(targets) => {
                let items = iterate(&value)?;
                if items.len() != targets.len() {
                    return Err(fault(
                        FaultKind::ValueError,
                        if items.len() > targets.len() {
                            format!("too many values to unpack (expected {})", targets.len())
                        } else {
                            format!(
                                "not enough values to unpack (expected {}, got {})",
                                targets.len(),
                                items.len()
                            )
                        },
                    ));
                }
                for (t, item) in targets.iter().zip(items) {
                    self.assign(t, item)?;
                }
                Ok(())
            }
            Expr::Subscript { value: base, index } => {
                let key = match index {
                    Index::Single(key) => self.eval(key)?,
                    Index::Slice { .. } => {
                        return Err(fault(FaultKind::TypeError, "slice assignment is not supported"))
                    }
                };
                let (root, path) = self.place_path(base)?;
                let slot = self.resolve_place(&root, &path)?;
                set_item(slot, &key, value)?;
                self.check_root(&root)
            }
            Expr::Attribute { attr, .. } => Err(fault(
                FaultKind::AttributeError,
                format!("cannot assign to attribute '{}'", attr),
            )),
            _ => Err(fault(FaultKind::SyntaxError, "cannot assign to expression")),
        }
    }

    /// Root variable and subscript keys of a place such as `a['k'][0]`
    fn place_path(&mut self, expr: &Expr) -> Outcome<(String, Vec<Value>)> {
        match expr {
            Expr::Name(name) => Ok((name.clone(), Vec::new())),
            Expr::Subscript {
                value,
                index: Index::Single(key),
            } => {
                let (root, mut path) = self.place_path(value)?;
                path.push(self.eval(key)?);
                Ok((root, path))
            }
            _ => Err(fault(FaultKind::SyntaxError, "cannot assign to expression")),
        }
    }

    fn resolve_place(&mut self, root: &str, path: &[Value]) -> Outcome<&mut Value> {
        let mut slot = self
            .scratch
            .get_mut(root)
            .ok_or_else(|| fault(FaultKind::NameError, format!("name '{}' is not defined", root)))?;
        for key in path {
            slot = item_mut(slot, key)?;
        }
        Ok(slot)
    }

    fn check_root(&self, root: &str) -> Outcome<()> {
        match self.scratch.get(root) {
            Some(value) => self.check_value(value),
            None => Ok(()),
        }
    }

    fn is_place(expr: &Expr) -> bool {
        match expr {
            Expr::Name(_) => true,
            Expr::Subscript {
                value,
                index: Index::Single(_),
            } => Self::is_place(value),
            _ => false,
        }
    }

    // ---- expressions ----

    fn eval_iterable(&mut self, expr: &Expr) -> Outcome<Vec<Value>> {
        if let Expr::Name(name) = expr {
            if let Some(value) = self.scratch.get(name) {
                return iterate(value);
            }
        }
        let value = self.eval(expr)?;
        iterate(&value)
    }

    pub(crate) fn eval(&mut self, expr: &Expr) -> Outcome<Value> {
        match expr {
            Expr::Const(c) => Ok(match c {
                Const::None => Value::None,
                Const::Bool(b) => Value::Bool(*b),
                Const::Int(i) => Value::Int(*i),
                Const::Float(f) => Value::Float(*f),
                Const::Str(s) => Value::Str(s.clone()),
            }),
            Expr::FString(parts) => self.eval_fstring(parts),
            Expr::Name(name) => self.load(name),
            Expr::List(items) | Expr::Tuple(items) => {
                let mut values = Vec::with_capacity(items.len());
                let mut size = 0;
                for item in items {
                    let v = self.eval(item)?;
                    self.grow(&mut size, &v)?;
                    values.push(v);
                }
                Ok(Value::List(values))
            }
            Expr::Dict(pairs) => {
                let mut dict = Dict::new();
                let mut size = 0;
                for (k, v) in pairs {
                    let key = self.eval(k)?;
                    self.grow(&mut size, &key)?;
                    let value = self.eval(v)?;
                    self.grow(&mut size, &value)?;
                    dict.insert(dict_key(&key)?, value);
                }
                Ok(Value::Dict(dict))
            }
            Expr::Attribute { value, attr } => {
                if let Expr::Name(name) = value.as_ref() {
                    if let Some(base) = self.scratch.get(name) {
                        return get_attribute(base, attr);
                    }
                }
                let base = self.eval(value)?;
                get_attribute(&base, attr)
            }
            Expr::Subscript { value, index } => self.eval_subscript(value, index),
            Expr::Call { func, args, kwargs } => self.eval_call(func, args, kwargs),
            Expr::Unary { op, operand } => {
                let v = self.eval(operand)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!v.truthy())),
                    UnaryOp::Neg => match v {
                        Value::Float(f) => Ok(Value::Float(-f)),
                        other => match other.as_int() {
                            Some(i) => i
                                .checked_neg()
                                .map(Value::Int)
                                .ok_or_else(|| fault(FaultKind::OverflowError, "integer overflow")),
                            None => Err(fault(
                                FaultKind::TypeError,
                                format!("bad operand type for unary -: '{}'", other.type_name()),
                            )),
                        },
                    },
                    UnaryOp::Pos => match v {
                        Value::Float(_) | Value::Int(_) => Ok(v),
                        Value::Bool(b) => Ok(Value::Int(i64::from(b))),
                        other => Err(fault(
                            FaultKind::TypeError,
                            format!("bad operand type for unary +: '{}'", other.type_name()),
                        )),
                    },
                }
            }
            Expr::Binary { left, op, right } => {
                let l = self.eval(left)?;
                let r = self.eval(right)?;
                binary_op(*op, &l, &r, self.limits.max_value_bytes)
            }
            Expr::BoolOp { op, values } => {
                let mut last = Value::None;
                for e in values {
                    last = self.eval(e)?;
                    let decided = match op {
                        BoolOp::And => !last.truthy(),
                        BoolOp::Or => last.truthy(),
                    };
                    if decided {
                        break;
                    }
                }
                Ok(last)
            }
            Expr::Compare { left, ops } => {
                let mut current = self.eval(left)?;
                for (op, right) in ops {
                    let next = self.eval(right)?;
                    if !compare(*op, &current, &next)? {
                        return Ok(Value::Bool(false));
                    }
                    current = next;
                }
                Ok(Value::Bool(true))
            }
            Expr::IfExp { test, body, orelse } => {
                if self.eval(test)?.truthy() {
                    self.eval(body)
                } else {
                    self.eval(orelse)
                }
            }
            Expr::ListComp { element, generators } => {
                let mut out = Vec::new();
                let mut size = 0;
                self.scoped(generators, |interp: &mut Self| {
                    interp.comprehend(generators, 0, &mut |interp: &mut Self| -> Outcome<()> {
                        let v = interp.eval(element)?;
                        interp.grow(&mut size, &v)?;
                        out.push(v);
                        Ok(())
                    })
                })?;
                Ok(Value::List(out))
            }
            Expr::DictComp {
                key,
                value,
                generators,
            } => {
                let mut dict = Dict::new();
                let mut size = 0;
                self.scoped(generators, |interp: &mut Self| {
                    interp.comprehend(generators, 0, &mut |interp: &mut Self| -> Outcome<()> {
                        let k = interp.eval(key)?;
                        interp.grow(&mut size, &k)?;
                        let v = interp.eval(value)?;
                        interp.grow(&mut size, &v)?;
                        dict.insert(dict_key(&k)?, v);
                        Ok(())
                    })
                })?;
                Ok(Value::Dict(dict))
            }
            Expr::Lambda { .. } => Err(forbidden("lambda")),
        }
    }

    fn load(&self, name: &str) -> Outcome<Value> {
        if is_private(name) {
            return Err(SandboxViolation::new(
                ViolationRule::PrivateAccess,
                format!("access to '{}' is not allowed", name),
            )
            .into());
        }
        if let Some(value) = self.scratch.get(name) {
            return Ok(value.clone());
        }
        if is_callable_name(name) {
            return Err(fault(
                FaultKind::NameError,
                format!("'{}' is a function and can only be called", name),
            ));
        }
        Err(fault(FaultKind::NameError, format!("name '{}' is not defined", name)))
    }

    fn eval_subscript(&mut self, value: &Expr, index: &Index) -> Outcome<Value> {
        match index {
            Index::Single(key) => {
                let key = self.eval(key)?;
                if let Expr::Name(name) = value {
                    if let Some(base) = self.scratch.get(name) {
                        return get_item(base, &key);
                    }
                }
                let base = self.eval(value)?;
                get_item(&base, &key)
            }
            Index::Slice { lower, upper, step } => {
                let base = self.eval(value)?;
                let lower = self.eval_opt(lower.as_deref())?;
                let upper = self.eval_opt(upper.as_deref())?;
                let step = self.eval_opt(step.as_deref())?;
                get_slice(&base, lower.as_ref(), upper.as_ref(), step.as_ref())
            }
        }
    }

    fn eval_opt(&mut self, expr: Option<&Expr>) -> Outcome<Option<Value>> {
        expr.map(|e| self.eval(e)).transpose()
    }

    fn eval_fstring(&mut self, parts: &[FStringPart]) -> Outcome<Value> {
        let mut out = String::new();
        for part in parts {
            match part {
                FStringPart::Literal(text) => out.push_str(text),
                FStringPart::Expr {
                    value,
                    conversion,
                    spec,
                } => {
                    let v = self.eval(value)?;
                    let v = match conversion {
                        Some('r') => Value::Str(v.repr()),
                        Some(_) => Value::Str(v.to_display()),
                        None => v,
                    };
                    out.push_str(&format_with_spec(
                        &v,
                        spec.as_deref().unwrap_or(""),
                        self.limits.max_value_bytes,
                    )?);
                }
            }
            if out.len() > self.limits.max_value_bytes {
                return Err(too_large(out.len(), self.limits.max_value_bytes).into());
            }
        }
        Ok(Value::Str(out))
    }

    fn grow(&self, size: &mut usize, value: &Value) -> Outcome<()> {
        let cap = self.limits.max_value_bytes;
        *size = size.saturating_add(8 + value.approx_size(cap));
        if *size > cap {
            return Err(too_large(*size, cap).into());
        }
        Ok(())
    }

    // ---- comprehensions ----

    /// Run `body` with comprehension targets restored afterwards
    fn scoped<F>(&mut self, generators: &[Generator], body: F) -> Outcome<()>
    where
        F: FnOnce(&mut Self) -> Outcome<()>,
    {
        let mut names = Vec::new();
        for g in generators {
            target_names(&g.target, &mut names);
        }
        let saved: Vec<(String, Option<Value>)> = names
            .into_iter()
            .map(|n| {
                let previous = self.scratch.get(&n).cloned();
                (n, previous)
            })
            .collect();

        let result = body(&mut *self);

        for (name, previous) in saved {
            match previous {
                Some(v) => {
                    self.scratch.insert(name, v);
                }
                None => {
                    self.scratch.remove(&name);
                }
            }
        }
        result
    }

    fn comprehend(
        &mut self,
        generators: &[Generator],
        level: usize,
        emit: &mut dyn FnMut(&mut Self) -> Outcome<()>,
    ) -> Outcome<()> {
        let Some(generator) = generators.get(level) else {
            return emit(&mut *self);
        };
        let items = self.eval_iterable(&generator.iter)?;
        'items: for item in items {
            self.check_deadline()?;
            self.assign(&generator.target, item)?;
            for condition in &generator.conditions {
                if !self.eval(condition)?.truthy() {
                    continue 'items;
                }
            }
            self.comprehend(generators, level + 1, &mut *emit)?;
        }
        Ok(())
    }

    // ---- calls ----

    fn eval_args(&mut self, args: &[Expr], kwargs: &[Keyword]) -> Outcome<(Vec<Value>, Vec<(String, Value)>)> {
        let mut size = 0;
        let mut positional = Vec::with_capacity(args.len());
        for arg in args {
            let v = self.eval(arg)?;
            self.grow(&mut size, &v)?;
            positional.push(v);
        }
        let mut keywords = Vec::with_capacity(kwargs.len());
        for kw in kwargs {
            if is_private(&kw.name) {
                return Err(SandboxViolation::new(
                    ViolationRule::PrivateAccess,
                    format!("access to '{}' is not allowed", kw.name),
                )
                .into());
            }
            let v = self.eval(&kw.value)?;
            self.grow(&mut size, &v)?;
            keywords.push((kw.name.clone(), v));
        }
        Ok((positional, keywords))
    }

    fn eval_call(&mut self, func: &Expr, args: &[Expr], kwargs: &[Keyword]) -> Outcome<Value> {
        match func {
            Expr::Name(name) => {
                let (args, kwargs) = self.eval_args(args, kwargs)?;
                match name.as_str() {
                    "print" => self.print(args, kwargs),
                    n if BUILTIN_FUNCTIONS.contains(&n) => {
                        call_builtin(n, args, kwargs, self.limits.max_value_bytes)
                    }
                    n if is_callable_name(n) => self.host.call(n, args, kwargs),
                    n => Err(SandboxViolation::new(
                        ViolationRule::DisallowedCall,
                        format!("call to '{}' is not allowed", n),
                    )
                    .into()),
                }
            }
            Expr::Attribute { value, attr } => {
                if is_private(attr) {
                    return Err(SandboxViolation::new(
                        ViolationRule::PrivateAccess,
                        format!("access to '{}' is not allowed", attr),
                    )
                    .into());
                }
                self.call_method_on(value, attr, args, kwargs)
            }
            _ => Err(SandboxViolation::new(
                ViolationRule::DisallowedCall,
                "only named functions and methods can be called",
            )
            .into()),
        }
    }

    fn call_method_on(&mut self, receiver: &Expr, method: &str, args: &[Expr], kwargs: &[Keyword]) -> Outcome<Value> {
        if Self::is_place(receiver) {
            let (root, path) = self.place_path(receiver)?;
            let (args, kwargs) = self.eval_args(args, kwargs)?;
            let max = self.limits.max_value_bytes;
            let slot = self.resolve_place(&root, &path)?;
            if is_mutating(slot, method) {
                let result = call_method(slot, method, args, kwargs, max)?;
                self.check_root(&root)?;
                return Ok(result);
            }
            let mut copy = slot.clone();
            return call_method(&mut copy, method, args, kwargs, max);
        }

        let mut target = self.eval(receiver)?;
        let (args, kwargs) = self.eval_args(args, kwargs)?;
        call_method(&mut target, method, args, kwargs, self.limits.max_value_bytes)
    }

    fn print(&mut self, args: Vec<Value>, kwargs: Vec<(String, Value)>) -> Outcome<Value> {
        let mut sep = " ".to_string();
        let mut end = "\n".to_string();
        for (name, value) in kwargs {
            let text = match &value {
                Value::None => continue,
                Value::Str(s) => s.clone(),
                other => {
                    return Err(fault(
                        FaultKind::TypeError,
                        format!("{} must be None or a string, not {}", name, other.type_name()),
                    ))
                }
            };
            match name.as_str() {
                "sep" => sep = text,
                "end" => end = text,
                other => {
                    return Err(fault(
                        FaultKind::TypeError,
                        format!("print() got an unexpected keyword argument '{}'", other),
                    ))
                }
            }
        }

        let line = args.iter().map(Value::to_display).collect::<Vec<_>>().join(&sep);
        self.output.push_str(&line);
        self.output.push_str(&end);
        if self.output.len() > self.limits.max_value_bytes {
            return Err(too_large(self.output.len(), self.limits.max_value_bytes).into());
        }
        Ok(Value::None)
    }
}

fn target_names(target: &Expr, names: &mut Vec<String>) {
    match target {
        Expr::Name(n) => names.push(n.clone()),
        Expr::Tuple(items) | Expr::List(items) => {
            for item in items {
                target_names(item, names);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::sandbox::parser::parse;

    /// Records calls and answers `final` by stopping the step
    #[derive(Default)]
    struct EchoHost {
        calls: Vec<String>,
    }

    impl Host for EchoHost {
        fn call(&mut self, name: &str, args: Vec<Value>, _kwargs: Vec<(String, Value)>) -> Outcome<Value> {
            self.calls.push(name.to_string());
            match name {
                "final" | "FINAL" => Err(Interrupt::Final(
                    args.first().map(Value::to_display).unwrap_or_default(),
                )),
                _ => Ok(Value::Str(format!("{}:{}", name, args.len()))),
            }
        }
    }

    fn limits() -> Limits {
        Limits {
            max_value_bytes: 4096,
            deadline: Instant::now() + Duration::from_secs(10),
            timeout_ms: 10_000,
        }
    }

    fn run_with(
        src: &str,
        scratch: &mut BTreeMap<String, Value>,
        host: &mut EchoHost,
        limits: Limits,
    ) -> (Outcome<Option<Value>>, String) {
        let program = parse(src, 48).expect("parse");
        let mut interp = Interpreter::new(scratch, host, limits);
        let result = interp.run(&program);
        (result, interp.take_output())
    }

    fn run(src: &str) -> (Outcome<Option<Value>>, String, BTreeMap<String, Value>) {
        let mut scratch = BTreeMap::new();
        let mut host = EchoHost::default();
        let (result, output) = run_with(src, &mut scratch, &mut host, limits());
        (result, output, scratch)
    }

    fn value_of(src: &str) -> Value {
        match run(src).0 {
            Ok(Some(v)) => v,
            other => panic!("{src}: {other:?}"),
        }
    }

    fn fault_of(src: &str) -> RuntimeFault {
        match run(src).0 {
            Err(Interrupt::Fault(f)) => f,
            other => panic!("{src}: expected fault, got {other:?}"),
        }
    }

    #[test]
    fn test_control_flow() {
        let src = "total = 0\nfor i in range(10):\n    if i % 2 == 0:\n        continue\n    if i > 7:\n        break\n    total += i\ntotal";
        assert_eq!(value_of(src), Value::Int(1 + 3 + 5 + 7));

        let src = "n = 0\nwhile True:\n    n += 1\n    if n == 5:\n        break\nn";
        assert_eq!(value_of(src), Value::Int(5));
    }

    #[test]
    fn test_copy_semantics_and_place_mutation() {
        let (result, _, scratch) = run("a = [1, 2]\nb = a\nb.append(3)\nd = {'k': [1]}\nd['k'].append(2)\nd['n'] = {'x': 0}\nd['n']['x'] += 5");
        assert!(result.is_ok());
        assert_eq!(scratch["a"], Value::List(vec![Value::Int(1), Value::Int(2)]));
        assert_eq!(scratch["b"], Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)]));
        match &scratch["d"] {
            Value::Dict(d) => {
                assert_eq!(d.get("k"), Some(&Value::List(vec![Value::Int(1), Value::Int(2)])));
                assert_eq!(
                    d.get("n"),
                    Some(&Value::Dict([("x".to_string(), Value::Int(5))].into_iter().collect()))
                );
            }
            other => panic!("expected dict, got {other:?}"),
        }
    }

    #[test]
    fn test_comprehensions_do_not_leak() {
        let (result, _, scratch) = run("x = 'kept'\nsquares = [x * x for x in range(4) if x != 2]\nd = {str(k): k for k in range(2)}");
        assert!(result.is_ok());
        assert_eq!(scratch["x"], Value::str("kept"));
        assert!(!scratch.contains_key("k"));
        assert_eq!(
            scratch["squares"],
            Value::List(vec![Value::Int(0), Value::Int(1), Value::Int(9)])
        );
    }

    #[test]
    fn test_fstrings_and_print() {
        let (result, output, _) = run("name = 'chunk'\nn = 3\nprint(f'{name!r} x{n:>3}', 'end', sep='|')\nprint(f'{2.0 / 3:.2f}')");
        assert!(result.is_ok());
        assert_eq!(output, "'chunk' x  3|end\n0.67\n");
    }

    #[test]
    fn test_unpacking() {
        assert_eq!(value_of("a, b = [1, 2]\nb, a = a, b\n[a, b]"), Value::List(vec![Value::Int(2), Value::Int(1)]));
        assert_eq!(fault_of("a, b = [1, 2, 3]").kind, FaultKind::ValueError);
        let total = value_of("t = 0\nfor i, v in enumerate(['a', 'b']):\n    t += i\nt");
        assert_eq!(total, Value::Int(1));
    }

    #[test]
    fn test_faults_carry_lines() {
        let f = fault_of("x = 1\ny = x + 'a'");
        assert_eq!(f.kind, FaultKind::TypeError);
        assert_eq!(f.line, Some(2));

        let f = fault_of("for i in range(3):\n    pass\nmissing");
        assert_eq!(f.kind, FaultKind::NameError);
        assert_eq!(f.line, Some(3));

        assert_eq!(fault_of("len").kind, FaultKind::NameError);
        assert_eq!(fault_of("break").kind, FaultKind::SyntaxError);
    }

    #[test]
    fn test_host_calls_and_final() {
        let mut scratch = BTreeMap::new();
        let mut host = EchoHost::default();
        let (result, _) = run_with(
            "r = search_chunks('q')\nfinal(r)\nafter = 1",
            &mut scratch,
            &mut host,
            limits(),
        );
        assert!(matches!(result, Err(Interrupt::Final(ref s)) if s == "search_chunks:1"));
        assert_eq!(host.calls, vec!["search_chunks", "final"]);
        assert!(!scratch.contains_key("after"));
    }

    #[test]
    fn test_value_limits() {
        let (result, _, _) = run("s = 'x'\nwhile True:\n    s = s + s");
        assert!(matches!(result, Err(Interrupt::Violation(v)) if v.rule == ViolationRule::ValueTooLarge));

        let (result, _, _) = run("x = []\nfor i in range(100):\n    x = [x]");
        assert!(matches!(result, Err(Interrupt::Violation(v)) if v.rule == ViolationRule::ValueTooLarge));

        let (result, _, _) = run("x = []\nwhile True:\n    x.append('abcdefgh')");
        assert!(matches!(result, Err(Interrupt::Violation(v)) if v.rule == ViolationRule::ValueTooLarge));
    }

    #[test]
    fn test_literals_and_arguments_are_size_checked() {
        for src in [
            "s = 'a' * 3000\nx = [s, s]",
            "s = 'a' * 3000\nx = (s, s)",
            "s = 'a' * 3000\nx = {'a': s, 'b': s}",
            "s = 'a' * 3000\nx = {s: 1, s + 'b': 2}",
            "s = 'a' * 3000\nx = len(max(s, s))",
            "s = 'a' * 3000\nx = sorted([1], key=s, reverse=s)",
            "s = 'a' * 3000\ny = [s]\nx = y + y",
            "s = 'a' * 3000\ny = [s]\nx = y * 2",
        ] {
            let (result, _, scratch) = run(src);
            assert!(
                matches!(&result, Err(Interrupt::Violation(v)) if v.rule == ViolationRule::ValueTooLarge),
                "{src}: {result:?}"
            );
            assert!(!scratch.contains_key("x"), "{src}");
        }
        assert_eq!(value_of("s = 'a' * 1000\nlen([s, s, s])"), Value::Int(3));
    }

    #[test]
    fn test_deadline_stops_loops() {
        let mut scratch = BTreeMap::new();
        let mut host = EchoHost::default();
        let limits = Limits {
            deadline: Instant::now() + Duration::from_millis(30),
            ..limits()
        };
        let (result, _) = run_with("while True:\n    pass", &mut scratch, &mut host, limits);
        assert!(matches!(
            result,
            Err(Interrupt::Budget(BudgetExceeded {
                kind: BudgetKind::Time,
                ..
            }))
        ));
    }

    #[test]
    fn test_runtime_private_keys() {
        let (result, _, _) = run("d = {'_secret': 1}\nk = '_sec' + 'ret'\nd[k]");
        assert!(result.is_ok());
    }
}
