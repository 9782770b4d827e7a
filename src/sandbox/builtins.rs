//! Builtin functions, operators and methods of the snippet language
//!
//! Semantics follow Python where snippets are likely to rely on them
//! (floor division, negative indices, slicing, banker's rounding). Results
//! that could grow without bound are size-checked before they are built.

use std::cmp::Ordering;

use once_cell::sync::Lazy;
use regex::Regex;

use super::ast::{BinOp, CmpOp};
use super::fault::{FaultKind, Interrupt, RuntimeFault, SandboxViolation, ViolationRule};
use super::policy::is_private;
use super::value::{format_float, Dict, Value};

type Outcome<T> = Result<T, Interrupt>;

pub(crate) fn too_large(size: usize, limit: usize) -> SandboxViolation {
    SandboxViolation::new(
        ViolationRule::ValueTooLarge,
        format!("value of {} bytes exceeds the {} byte limit", size, limit),
    )
}

fn ensure_fits(size: usize, limit: usize) -> Outcome<()> {
    if size > limit {
        return Err(too_large(size, limit).into());
    }
    Ok(())
}

fn fault(kind: FaultKind, message: impl Into<String>) -> Interrupt {
    Interrupt::Fault(RuntimeFault::new(kind, message))
}

fn type_error(message: impl Into<String>) -> Interrupt {
    fault(FaultKind::TypeError, message)
}

fn value_error(message: impl Into<String>) -> Interrupt {
    fault(FaultKind::ValueError, message)
}

fn overflow() -> Interrupt {
    fault(FaultKind::OverflowError, "integer overflow")
}

/// Match positional and keyword arguments against a parameter list
pub(crate) fn bind_args(
    func: &str,
    params: &[&str],
    required: usize,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> Outcome<Vec<Option<Value>>> {
    if args.len() > params.len() {
        return Err(type_error(format!(
            "{}() takes at most {} arguments ({} given)",
            func,
            params.len(),
            args.len()
        )));
    }

    let mut bound: Vec<Option<Value>> = vec![None; params.len()];
    for (slot, arg) in bound.iter_mut().zip(args) {
        *slot = Some(arg);
    }

    for (name, value) in kwargs {
        let Some(pos) = params.iter().position(|p| *p == name) else {
            return Err(type_error(format!(
                "{}() got an unexpected keyword argument '{}'",
                func, name
            )));
        };
        if bound[pos].is_some() {
            return Err(type_error(format!(
                "{}() got multiple values for argument '{}'",
                func, name
            )));
        }
        bound[pos] = Some(value);
    }

    if let Some(missing) = bound.iter().take(required).position(Option::is_none) {
        return Err(type_error(format!(
            "{}() missing required argument '{}'",
            func, params[missing]
        )));
    }
    Ok(bound)
}

fn no_kwargs(func: &str, kwargs: &[(String, Value)]) -> Outcome<()> {
    match kwargs.first() {
        Some((name, _)) => Err(type_error(format!(
            "{}() got an unexpected keyword argument '{}'",
            func, name
        ))),
        None => Ok(()),
    }
}

pub(crate) fn expect_str<'a>(func: &str, value: &'a Value) -> Outcome<&'a str> {
    match value {
        Value::Str(s) => Ok(s),
        other => Err(type_error(format!(
            "{}() expected str, got {}",
            func,
            other.type_name()
        ))),
    }
}

pub(crate) fn expect_int(func: &str, value: &Value) -> Outcome<i64> {
    value.as_int().ok_or_else(|| {
        type_error(format!(
            "{}() expected int, got {}",
            func,
            value.type_name()
        ))
    })
}

/// Elements visited by `for`, comprehensions and iterable-taking builtins
pub(crate) fn iterate(value: &Value) -> Outcome<Vec<Value>> {
    match value {
        Value::List(items) => Ok(items.clone()),
        Value::Str(s) => Ok(s.chars().map(|c| Value::Str(c.to_string())).collect()),
        Value::Dict(dict) => Ok(dict.keys().cloned().map(Value::Str).collect()),
        Value::Record(record) => Ok(record.iter().map(|(k, _)| Value::str(k)).collect()),
        other => Err(type_error(format!(
            "'{}' object is not iterable",
            other.type_name()
        ))),
    }
}

pub(crate) fn dict_key(value: &Value) -> Outcome<String> {
    match value {
        Value::Str(s) => Ok(s.clone()),
        other => Err(type_error(format!(
            "dict keys must be str, not '{}'",
            other.type_name()
        ))),
    }
}

// ---- builtin functions ----

/// Call a builtin other than `print`, which needs the output buffer
pub(crate) fn call_builtin(
    name: &str,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
    max_bytes: usize,
) -> Outcome<Value> {
    match name {
        "len" => {
            let [x] = take::<1>(bind_args(name, &["obj"], 1, args, kwargs)?);
            let x = x.unwrap_or_default();
            let len = match &x {
                Value::Str(s) => s.chars().count(),
                Value::List(items) => items.len(),
                Value::Dict(dict) => dict.len(),
                Value::Record(record) => record.iter().count(),
                other => {
                    return Err(type_error(format!(
                        "object of type '{}' has no len()",
                        other.type_name()
                    )))
                }
            };
            Ok(Value::Int(len as i64))
        }
        "str" => {
            let [x] = take::<1>(bind_args(name, &["object"], 0, args, kwargs)?);
            Ok(Value::Str(x.map(|v| v.to_display()).unwrap_or_default()))
        }
        "repr" => {
            let [x] = take::<1>(bind_args(name, &["obj"], 1, args, kwargs)?);
            Ok(Value::Str(x.unwrap_or_default().repr()))
        }
        "int" => {
            let [x] = take::<1>(bind_args(name, &["x"], 0, args, kwargs)?);
            to_int(x.unwrap_or(Value::Int(0)))
        }
        "float" => {
            let [x] = take::<1>(bind_args(name, &["x"], 0, args, kwargs)?);
            to_float(x.unwrap_or(Value::Float(0.0)))
        }
        "bool" => {
            let [x] = take::<1>(bind_args(name, &["x"], 0, args, kwargs)?);
            Ok(Value::Bool(x.map_or(false, |v| v.truthy())))
        }
        "list" => {
            let [x] = take::<1>(bind_args(name, &["iterable"], 0, args, kwargs)?);
            match x {
                Some(v) => Ok(Value::List(iterate(&v)?)),
                None => Ok(Value::List(Vec::new())),
            }
        }
        "dict" => build_dict(args, kwargs),
        "range" => range(args, kwargs, max_bytes),
        "sorted" => {
            let [items, key, reverse] = take::<3>(bind_args(
                name,
                &["iterable", "key", "reverse"],
                1,
                args,
                kwargs,
            )?);
            if key.map_or(false, |k| k != Value::None) {
                return Err(type_error("sorted() key functions are not supported"));
            }
            let mut items = iterate(&items.unwrap_or_default())?;
            sort_values(&mut items, reverse.map_or(false, |r| r.truthy()))?;
            Ok(Value::List(items))
        }
        "reversed" => {
            let [x] = take::<1>(bind_args(name, &["sequence"], 1, args, kwargs)?);
            let mut items = iterate(&x.unwrap_or_default())?;
            items.reverse();
            Ok(Value::List(items))
        }
        "min" | "max" => min_max(name, args, kwargs),
        "sum" => {
            let [items, start] = take::<2>(bind_args(name, &["iterable", "start"], 1, args, kwargs)?);
            let mut total = start.unwrap_or(Value::Int(0));
            for item in iterate(&items.unwrap_or_default())? {
                if matches!(item, Value::Str(_)) || matches!(total, Value::Str(_)) {
                    return Err(type_error("sum() can't sum strings, use ''.join(seq) instead"));
                }
                total = binary_op(BinOp::Add, &total, &item, max_bytes)?;
            }
            Ok(total)
        }
        "abs" => {
            let [x] = take::<1>(bind_args(name, &["x"], 1, args, kwargs)?);
            match x.unwrap_or_default() {
                Value::Float(f) => Ok(Value::Float(f.abs())),
                v => match v.as_int() {
                    Some(i) => i.checked_abs().map(Value::Int).ok_or_else(overflow),
                    None => Err(type_error(format!(
                        "bad operand type for abs(): '{}'",
                        v.type_name()
                    ))),
                },
            }
        }
        "round" => {
            let [x, ndigits] = take::<2>(bind_args(name, &["number", "ndigits"], 1, args, kwargs)?);
            round(x.unwrap_or_default(), ndigits.filter(|n| *n != Value::None))
        }
        "enumerate" => {
            let [items, start] = take::<2>(bind_args(name, &["iterable", "start"], 1, args, kwargs)?);
            let start = match start {
                Some(v) => expect_int(name, &v)?,
                None => 0,
            };
            let items = iterate(&items.unwrap_or_default())?;
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.into_iter().enumerate() {
                let index = start.checked_add(i as i64).ok_or_else(overflow)?;
                out.push(Value::List(vec![Value::Int(index), item]));
            }
            Ok(Value::List(out))
        }
        "zip" => {
            no_kwargs(name, &kwargs)?;
            let columns = args
                .iter()
                .map(iterate)
                .collect::<Outcome<Vec<Vec<Value>>>>()?;
            let len = columns.iter().map(Vec::len).min().unwrap_or(0);
            Ok(Value::List(
                (0..len)
                    .map(|i| Value::List(columns.iter().map(|c| c[i].clone()).collect()))
                    .collect(),
            ))
        }
        "any" | "all" => {
            let [items] = take::<1>(bind_args(name, &["iterable"], 1, args, kwargs)?);
            let items = iterate(&items.unwrap_or_default())?;
            Ok(Value::Bool(if name == "any" {
                items.iter().any(Value::truthy)
            } else {
                items.iter().all(Value::truthy)
            }))
        }
        other => Err(fault(
            FaultKind::NameError,
            format!("name '{}' is not defined", other),
        )),
    }
}

/// Destructure bound arguments into a fixed-size array
fn take<const N: usize>(bound: Vec<Option<Value>>) -> [Option<Value>; N] {
    let mut out: [Option<Value>; N] = std::array::from_fn(|_| None);
    for (slot, value) in out.iter_mut().zip(bound) {
        *slot = value;
    }
    out
}

fn to_int(value: Value) -> Outcome<Value> {
    match value {
        Value::Int(i) => Ok(Value::Int(i)),
        Value::Bool(b) => Ok(Value::Int(i64::from(b))),
        Value::Float(f) => {
            if !f.is_finite() {
                return Err(value_error(format!(
                    "cannot convert float {} to integer",
                    format_float(f)
                )));
            }
            let t = f.trunc();
            if t < -9.223_372_036_854_775_808e18 || t >= 9.223_372_036_854_775_808e18 {
                return Err(overflow());
            }
            Ok(Value::Int(t as i64))
        }
        Value::Str(s) => s
            .trim()
            .replace('_', "")
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| {
                value_error(format!(
                    "invalid literal for int() with base 10: {}",
                    Value::Str(s.clone()).repr()
                ))
            }),
        other => Err(type_error(format!(
            "int() argument must be a string or a number, not '{}'",
            other.type_name()
        ))),
    }
}

fn to_float(value: Value) -> Outcome<Value> {
    match value {
        Value::Str(s) => s.trim().parse::<f64>().map(Value::Float).map_err(|_| {
            value_error(format!(
                "could not convert string to float: {}",
                Value::Str(s.clone()).repr()
            ))
        }),
        other => other.as_f64().map(Value::Float).ok_or_else(|| {
            type_error(format!(
                "float() argument must be a string or a number, not '{}'",
                other.type_name()
            ))
        }),
    }
}

fn build_dict(args: Vec<Value>, kwargs: Vec<(String, Value)>) -> Outcome<Value> {
    if args.len() > 1 {
        return Err(type_error("dict expected at most 1 argument"));
    }
    let mut dict = Dict::new();
    if let Some(source) = args.into_iter().next() {
        match source {
            Value::Dict(d) => dict = d,
            Value::Record(r) => dict = r.to_dict(),
            Value::List(pairs) => {
                for pair in pairs {
                    match pair {
                        Value::List(kv) if kv.len() == 2 => {
                            dict.insert(dict_key(&kv[0])?, kv[1].clone());
                        }
                        _ => {
                            return Err(type_error(
                                "dict() sequence elements must be key/value pairs",
                            ))
                        }
                    }
                }
            }
            other => {
                return Err(type_error(format!(
                    "'{}' object is not a mapping",
                    other.type_name()
                )))
            }
        }
    }
    for (k, v) in kwargs {
        dict.insert(k, v);
    }
    Ok(Value::Dict(dict))
}

fn range(args: Vec<Value>, kwargs: Vec<(String, Value)>, max_bytes: usize) -> Outcome<Value> {
    no_kwargs("range", &kwargs)?;
    let ints = args
        .iter()
        .map(|a| expect_int("range", a))
        .collect::<Outcome<Vec<i64>>>()?;
    let (start, stop, step) = match ints.as_slice() {
        [stop] => (0, *stop, 1),
        [start, stop] => (*start, *stop, 1),
        [start, stop, step] => (*start, *stop, *step),
        _ => return Err(type_error("range expected 1 to 3 integer arguments")),
    };
    if step == 0 {
        return Err(value_error("range() arg 3 must not be zero"));
    }

    let span = if step > 0 {
        i128::from(stop) - i128::from(start)
    } else {
        i128::from(start) - i128::from(stop)
    };
    let step_abs = i128::from(step).abs();
    let count = if span <= 0 {
        0
    } else {
        (span + step_abs - 1) / step_abs
    };
    let bytes = usize::try_from(count.saturating_mul(8)).unwrap_or(usize::MAX);
    ensure_fits(bytes, max_bytes)?;

    let mut out = Vec::with_capacity(count as usize);
    let mut current = i128::from(start);
    for _ in 0..count {
        out.push(Value::Int(current as i64));
        current += i128::from(step);
    }
    Ok(Value::List(out))
}

fn incomparable(op: &str, a: &Value, b: &Value) -> Interrupt {
    type_error(format!(
        "'{}' not supported between instances of '{}' and '{}'",
        op,
        a.type_name(),
        b.type_name()
    ))
}

pub(crate) fn sort_values(items: &mut [Value], reverse: bool) -> Outcome<()> {
    let mut error = None;
    items.sort_by(|a, b| match a.py_cmp(b) {
        Some(ord) => {
            if reverse {
                ord.reverse()
            } else {
                ord
            }
        }
        None => {
            error.get_or_insert_with(|| incomparable("<", a, b));
            Ordering::Equal
        }
    });
    match error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn min_max(name: &str, args: Vec<Value>, kwargs: Vec<(String, Value)>) -> Outcome<Value> {
    let mut default = None;
    for (k, v) in kwargs {
        match k.as_str() {
            "default" => default = Some(v),
            "key" => return Err(type_error(format!("{}() key functions are not supported", name))),
            _ => {
                return Err(type_error(format!(
                    "{}() got an unexpected keyword argument '{}'",
                    name, k
                )))
            }
        }
    }

    let items = match args.len() {
        0 => return Err(type_error(format!("{} expected at least 1 argument, got 0", name))),
        1 => iterate(&args[0])?,
        _ => args,
    };

    let mut best: Option<Value> = None;
    for item in items {
        best = Some(match best {
            None => item,
            Some(current) => {
                let ord = item
                    .py_cmp(&current)
                    .ok_or_else(|| incomparable(if name == "min" { "<" } else { ">" }, &item, &current))?;
                let better = if name == "min" {
                    ord == Ordering::Less
                } else {
                    ord == Ordering::Greater
                };
                if better {
                    item
                } else {
                    current
                }
            }
        });
    }

    best.or(default)
        .ok_or_else(|| value_error(format!("{}() arg is an empty sequence", name)))
}

fn round_half_even(x: f64) -> f64 {
    let rounded = x.round();
    if (x - x.trunc()).abs() == 0.5 {
        2.0 * (x / 2.0).round()
    } else {
        rounded
    }
}

fn round(x: Value, ndigits: Option<Value>) -> Outcome<Value> {
    let digits = match &ndigits {
        Some(n) => Some(expect_int("round", n)?),
        None => None,
    };

    match (&x, digits) {
        (Value::Float(f), None) => to_int(Value::Float(round_half_even(*f))),
        (Value::Float(f), Some(d)) => {
            let d = d.clamp(-308, 308) as i32;
            let factor = 10f64.powi(d);
            Ok(Value::Float(round_half_even(f * factor) / factor))
        }
        (v, d) => match v.as_int() {
            Some(i) => match d {
                Some(d) if d < 0 => {
                    let factor = 10f64.powi((-d).min(308) as i32);
                    to_int(Value::Float(round_half_even(i as f64 / factor) * factor))
                }
                _ => Ok(Value::Int(i)),
            },
            None => Err(type_error(format!(
                "type {} doesn't define __round__ method",
                v.type_name()
            ))),
        },
    }
}

// ---- operators ----

fn unsupported(op: &str, a: &Value, b: &Value) -> Interrupt {
    type_error(format!(
        "unsupported operand type(s) for {}: '{}' and '{}'",
        op,
        a.type_name(),
        b.type_name()
    ))
}

/// Approximate footprint of a list's items, stopping once past `cap`
fn items_size(items: &[Value], cap: usize) -> usize {
    let mut total = 0usize;
    for item in items {
        total = total.saturating_add(8 + item.approx_size(cap));
        if total > cap {
            break;
        }
    }
    total
}

fn repeat_count(value: &Value) -> Option<i64> {
    match value {
        Value::Int(_) | Value::Bool(_) => value.as_int(),
        _ => None,
    }
}

pub(crate) fn binary_op(op: BinOp, left: &Value, right: &Value, max_bytes: usize) -> Outcome<Value> {
    match (op, left, right) {
        (BinOp::Add, Value::Str(a), Value::Str(b)) => {
            ensure_fits(a.len() + b.len(), max_bytes)?;
            return Ok(Value::Str(format!("{}{}", a, b)));
        }
        (BinOp::Add, Value::List(a), Value::List(b)) => {
            let size = items_size(a, max_bytes).saturating_add(items_size(b, max_bytes));
            ensure_fits(size, max_bytes)?;
            let mut out = a.clone();
            out.extend(b.iter().cloned());
            return Ok(Value::List(out));
        }
        (BinOp::Mul, Value::Str(s), n) | (BinOp::Mul, n, Value::Str(s)) if repeat_count(n).is_some() => {
            let times = repeat_count(n).unwrap_or(0).max(0) as usize;
            ensure_fits(s.len().saturating_mul(times), max_bytes)?;
            return Ok(Value::Str(s.repeat(times)));
        }
        (BinOp::Mul, Value::List(items), n) | (BinOp::Mul, n, Value::List(items))
            if repeat_count(n).is_some() =>
        {
            let times = repeat_count(n).unwrap_or(0).max(0) as usize;
            let unit = items_size(items, max_bytes).max(1);
            ensure_fits(unit.saturating_mul(times), max_bytes)?;
            let mut out = Vec::with_capacity(items.len() * times);
            for _ in 0..times {
                out.extend(items.iter().cloned());
            }
            return Ok(Value::List(out));
        }
        (BinOp::Mod, Value::Str(_), _) => {
            return Err(type_error(
                "%-formatting is not supported, use an f-string instead",
            ))
        }
        _ => {}
    }

    let both_int = !matches!(left, Value::Float(_))
        && !matches!(right, Value::Float(_))
        && left.as_int().is_some()
        && right.as_int().is_some();

    if both_int {
        let a = left.as_int().unwrap_or(0);
        let b = right.as_int().unwrap_or(0);
        return int_op(op, a, b);
    }

    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => float_op(op, a, b),
        _ => Err(unsupported(op.symbol(), left, right)),
    }
}

fn int_op(op: BinOp, a: i64, b: i64) -> Outcome<Value> {
    let zero = || fault(FaultKind::ZeroDivisionError, "integer division or modulo by zero");
    let result = match op {
        BinOp::Add => a.checked_add(b),
        BinOp::Sub => a.checked_sub(b),
        BinOp::Mul => a.checked_mul(b),
        BinOp::Div => {
            if b == 0 {
                return Err(fault(FaultKind::ZeroDivisionError, "division by zero"));
            }
            return Ok(Value::Float(a as f64 / b as f64));
        }
        BinOp::FloorDiv => {
            if b == 0 {
                return Err(zero());
            }
            a.checked_div(b).map(|q| {
                if a % b != 0 && ((a < 0) != (b < 0)) {
                    q - 1
                } else {
                    q
                }
            })
        }
        BinOp::Mod => {
            if b == 0 {
                return Err(zero());
            }
            a.checked_rem(b)
                .map(|r| if r != 0 && ((r < 0) != (b < 0)) { r + b } else { r })
        }
        BinOp::Pow => {
            if b < 0 {
                return Ok(Value::Float((a as f64).powf(b as f64)));
            }
            u32::try_from(b).ok().and_then(|e| a.checked_pow(e))
        }
    };
    result.map(Value::Int).ok_or_else(overflow)
}

fn float_op(op: BinOp, a: f64, b: f64) -> Outcome<Value> {
    let result = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => {
            if b == 0.0 {
                return Err(fault(FaultKind::ZeroDivisionError, "float division by zero"));
            }
            a / b
        }
        BinOp::FloorDiv => {
            if b == 0.0 {
                return Err(fault(FaultKind::ZeroDivisionError, "float floor division by zero"));
            }
            (a / b).floor()
        }
        BinOp::Mod => {
            if b == 0.0 {
                return Err(fault(FaultKind::ZeroDivisionError, "float modulo"));
            }
            a - b * (a / b).floor()
        }
        BinOp::Pow => a.powf(b),
    };
    Ok(Value::Float(result))
}

pub(crate) fn contains(container: &Value, item: &Value) -> Outcome<bool> {
    match container {
        Value::Str(s) => match item {
            Value::Str(sub) => Ok(s.contains(sub.as_str())),
            other => Err(type_error(format!(
                "'in <string>' requires string as left operand, not {}",
                other.type_name()
            ))),
        },
        Value::List(items) => Ok(items.iter().any(|v| v.py_eq(item))),
        Value::Dict(dict) => Ok(matches!(item, Value::Str(k) if dict.contains_key(k))),
        Value::Record(record) => Ok(matches!(item, Value::Str(k) if record.get(k).is_some())),
        other => Err(type_error(format!(
            "argument of type '{}' is not iterable",
            other.type_name()
        ))),
    }
}

pub(crate) fn compare(op: CmpOp, left: &Value, right: &Value) -> Outcome<bool> {
    let ordered = |symbol: &str, accept: fn(Ordering) -> bool| {
        left.py_cmp(right)
            .map(accept)
            .ok_or_else(|| incomparable(symbol, left, right))
    };
    match op {
        CmpOp::Eq => Ok(left.py_eq(right)),
        CmpOp::NotEq => Ok(!left.py_eq(right)),
        CmpOp::Lt => ordered("<", |o| o == Ordering::Less),
        CmpOp::LtE => ordered("<=", |o| o != Ordering::Greater),
        CmpOp::Gt => ordered(">", |o| o == Ordering::Greater),
        CmpOp::GtE => ordered(">=", |o| o != Ordering::Less),
        CmpOp::In => contains(right, left),
        CmpOp::NotIn => contains(right, left).map(|found| !found),
        CmpOp::Is => Ok(identical(left, right)),
        CmpOp::IsNot => Ok(!identical(left, right)),
    }
}

/// Identity is only observable for the singletons
fn identical(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::None, Value::None) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        _ => false,
    }
}

// ---- indexing ----

fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let idx = if index < 0 { index + len } else { index };
    (0..len).contains(&idx).then_some(idx as usize)
}

fn private_key(key: &str) -> Interrupt {
    SandboxViolation::new(
        ViolationRule::PrivateAccess,
        format!("access to '{}' is not allowed", key),
    )
    .into()
}

pub(crate) fn get_item(container: &Value, key: &Value) -> Outcome<Value> {
    match container {
        Value::List(items) => {
            let i = expect_index(key, "list")?;
            normalize_index(i, items.len())
                .map(|i| items[i].clone())
                .ok_or_else(|| fault(FaultKind::IndexError, "list index out of range"))
        }
        Value::Str(s) => {
            let i = expect_index(key, "string")?;
            let len = s.chars().count();
            normalize_index(i, len)
                .and_then(|i| s.chars().nth(i))
                .map(|c| Value::Str(c.to_string()))
                .ok_or_else(|| fault(FaultKind::IndexError, "string index out of range"))
        }
        Value::Dict(dict) => {
            let k = dict_key(key)?;
            dict.get(&k)
                .cloned()
                .ok_or_else(|| fault(FaultKind::KeyError, Value::Str(k).repr()))
        }
        Value::Record(record) => {
            let k = dict_key(key)?;
            if is_private(&k) {
                return Err(private_key(&k));
            }
            record
                .get(&k)
                .cloned()
                .ok_or_else(|| fault(FaultKind::KeyError, Value::Str(k).repr()))
        }
        other => Err(type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

fn expect_index(key: &Value, what: &str) -> Outcome<i64> {
    match key {
        Value::Int(_) | Value::Bool(_) => Ok(key.as_int().unwrap_or(0)),
        other => Err(type_error(format!(
            "{} indices must be integers, not {}",
            what,
            other.type_name()
        ))),
    }
}

/// Positions selected by a Python slice over a sequence of `len` items
fn slice_positions(len: usize, lower: Option<i64>, upper: Option<i64>, step: i64) -> Vec<usize> {
    let len = len as i64;
    let mut out = Vec::new();
    if step > 0 {
        let clamp = |v: i64| {
            if v < 0 {
                (v + len).max(0)
            } else {
                v.min(len)
            }
        };
        let start = lower.map_or(0, clamp);
        let stop = upper.map_or(len, clamp);
        let mut next = Some(start);
        while let Some(i) = next.filter(|i| *i < stop) {
            out.push(i as usize);
            next = i.checked_add(step);
        }
    } else {
        let clamp = |v: i64| {
            if v < 0 {
                (v + len).max(-1)
            } else {
                v.min(len - 1)
            }
        };
        let start = lower.map_or(len - 1, clamp);
        let stop = upper.map_or(-1, clamp);
        let mut next = Some(start);
        while let Some(i) = next.filter(|i| *i > stop) {
            out.push(i as usize);
            next = i.checked_add(step);
        }
    }
    out
}

pub(crate) fn get_slice(
    container: &Value,
    lower: Option<&Value>,
    upper: Option<&Value>,
    step: Option<&Value>,
) -> Outcome<Value> {
    let bound = |v: Option<&Value>| -> Outcome<Option<i64>> {
        match v {
            None | Some(Value::None) => Ok(None),
            Some(v) => expect_index(v, "slice").map(Some),
        }
    };
    let lower = bound(lower)?;
    let upper = bound(upper)?;
    let step = bound(step)?.unwrap_or(1);
    if step == 0 {
        return Err(value_error("slice step cannot be zero"));
    }

    match container {
        Value::List(items) => Ok(Value::List(
            slice_positions(items.len(), lower, upper, step)
                .into_iter()
                .map(|i| items[i].clone())
                .collect(),
        )),
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            Ok(Value::Str(
                slice_positions(chars.len(), lower, upper, step)
                    .into_iter()
                    .map(|i| chars[i])
                    .collect(),
            ))
        }
        other => Err(type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

fn read_only(value: &Value) -> Interrupt {
    type_error(format!(
        "'{}' object does not support item assignment",
        value.type_name()
    ))
}

pub(crate) fn set_item(container: &mut Value, key: &Value, value: Value) -> Outcome<()> {
    match container {
        Value::List(items) => {
            let i = expect_index(key, "list")?;
            let pos = normalize_index(i, items.len())
                .ok_or_else(|| fault(FaultKind::IndexError, "list assignment index out of range"))?;
            items[pos] = value;
            Ok(())
        }
        Value::Dict(dict) => {
            dict.insert(dict_key(key)?, value);
            Ok(())
        }
        other => Err(read_only(other)),
    }
}

/// Mutable access used when assigning through nested subscripts
pub(crate) fn item_mut<'a>(container: &'a mut Value, key: &Value) -> Outcome<&'a mut Value> {
    match container {
        Value::List(items) => {
            let i = expect_index(key, "list")?;
            let pos = normalize_index(i, items.len())
                .ok_or_else(|| fault(FaultKind::IndexError, "list index out of range"))?;
            Ok(&mut items[pos])
        }
        Value::Dict(dict) => {
            let k = dict_key(key)?;
            dict.get_mut(&k)
                .ok_or_else(|| fault(FaultKind::KeyError, Value::Str(k.clone()).repr()))
        }
        other => Err(read_only(other)),
    }
}

/// Attribute reads are only meaningful on chunk records
pub(crate) fn get_attribute(value: &Value, attr: &str) -> Outcome<Value> {
    if is_private(attr) {
        return Err(private_key(attr));
    }
    match value {
        Value::Record(record) => record.get(attr).cloned().ok_or_else(|| {
            fault(
                FaultKind::AttributeError,
                format!("'chunk' object has no attribute '{}'", attr),
            )
        }),
        other => Err(fault(
            FaultKind::AttributeError,
            format!("'{}' object has no attribute '{}'", other.type_name(), attr),
        )),
    }
}

// ---- methods ----

/// Whether calling `method` changes its receiver
pub(crate) fn is_mutating(receiver: &Value, method: &str) -> bool {
    match receiver {
        Value::List(_) => matches!(
            method,
            "append" | "extend" | "insert" | "pop" | "remove" | "sort" | "reverse" | "clear"
        ),
        Value::Dict(_) => matches!(method, "pop" | "update" | "setdefault" | "clear"),
        _ => false,
    }
}

pub(crate) fn call_method(
    receiver: &mut Value,
    method: &str,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
    max_bytes: usize,
) -> Outcome<Value> {
    match receiver {
        Value::Str(s) => str_method(s, method, args, kwargs, max_bytes),
        Value::List(items) => list_method(items, method, args, kwargs),
        Value::Dict(dict) => dict_method(dict, method, args, kwargs),
        Value::Record(record) => {
            let name = format!("chunk.{}", method);
            match method {
                "get" => {
                    let [key, default] = take::<2>(bind_args(&name, &["key", "default"], 1, args, kwargs)?);
                    let key = dict_key(&key.unwrap_or_default())?;
                    if is_private(&key) {
                        return Err(private_key(&key));
                    }
                    Ok(record
                        .get(&key)
                        .cloned()
                        .unwrap_or_else(|| default.unwrap_or_default()))
                }
                "keys" => {
                    bind_args(&name, &[], 0, args, kwargs)?;
                    Ok(Value::List(record.iter().map(|(k, _)| Value::str(k)).collect()))
                }
                "values" => {
                    bind_args(&name, &[], 0, args, kwargs)?;
                    Ok(Value::List(record.iter().map(|(_, v)| v.clone()).collect()))
                }
                "items" => {
                    bind_args(&name, &[], 0, args, kwargs)?;
                    Ok(Value::List(
                        record
                            .iter()
                            .map(|(k, v)| Value::List(vec![Value::str(k), v.clone()]))
                            .collect(),
                    ))
                }
                _ => Err(no_method("chunk", method)),
            }
        }
        other => Err(no_method(other.type_name(), method)),
    }
}

fn no_method(type_name: &str, method: &str) -> Interrupt {
    fault(
        FaultKind::AttributeError,
        format!("'{}' object has no attribute '{}'", type_name, method),
    )
}

fn optional_str(func: &str, value: Option<Value>) -> Outcome<Option<String>> {
    match value {
        None | Some(Value::None) => Ok(None),
        Some(v) => expect_str(func, &v).map(|s| Some(s.to_string())),
    }
}

fn char_index(s: &str, byte: usize) -> i64 {
    s[..byte].chars().count() as i64
}

fn str_method(
    s: &str,
    method: &str,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
    max_bytes: usize,
) -> Outcome<Value> {
    let name = format!("str.{}", method);
    let no_args = |args: Vec<Value>, kwargs: Vec<(String, Value)>| bind_args(&name, &[], 0, args, kwargs);

    match method {
        "lower" => no_args(args, kwargs).map(|_| Value::Str(s.to_lowercase())),
        "upper" => no_args(args, kwargs).map(|_| Value::Str(s.to_uppercase())),
        "title" => no_args(args, kwargs).map(|_| Value::Str(title_case(s))),
        "capitalize" => no_args(args, kwargs).map(|_| {
            let mut chars = s.chars();
            Value::Str(match chars.next() {
                Some(first) => {
                    let rest = chars.as_str().to_lowercase();
                    first.to_uppercase().collect::<String>() + &rest
                }
                None => String::new(),
            })
        }),
        "isdigit" => no_args(args, kwargs)
            .map(|_| Value::Bool(!s.is_empty() && s.chars().all(|c| c.is_ascii_digit()))),
        "isalpha" => no_args(args, kwargs)
            .map(|_| Value::Bool(!s.is_empty() && s.chars().all(char::is_alphabetic))),
        "isalnum" => no_args(args, kwargs)
            .map(|_| Value::Bool(!s.is_empty() && s.chars().all(char::is_alphanumeric))),
        "strip" | "lstrip" | "rstrip" => {
            let [chars] = take::<1>(bind_args(&name, &["chars"], 0, args, kwargs)?);
            let chars = optional_str(&name, chars)?;
            let matcher = |c: char| match &chars {
                Some(set) => set.contains(c),
                None => c.is_whitespace(),
            };
            Ok(Value::str(match method {
                "strip" => s.trim_matches(matcher),
                "lstrip" => s.trim_start_matches(matcher),
                _ => s.trim_end_matches(matcher),
            }))
        }
        "split" => {
            let [sep, maxsplit] = take::<2>(bind_args(&name, &["sep", "maxsplit"], 0, args, kwargs)?);
            let sep = optional_str(&name, sep)?;
            let maxsplit = match maxsplit {
                Some(v) => expect_int(&name, &v)?,
                None => -1,
            };
            let parts: Vec<String> = match sep {
                Some(sep) if sep.is_empty() => return Err(value_error("empty separator")),
                Some(sep) if maxsplit >= 0 => s
                    .splitn(maxsplit as usize + 1, sep.as_str())
                    .map(str::to_string)
                    .collect(),
                Some(sep) => s.split(sep.as_str()).map(str::to_string).collect(),
                None => split_whitespace(s, maxsplit),
            };
            Ok(Value::from(parts))
        }
        "splitlines" => no_args(args, kwargs).map(|_| Value::from(s.lines().map(str::to_string).collect::<Vec<String>>())),
        "join" => {
            let [items] = take::<1>(bind_args(&name, &["iterable"], 1, args, kwargs)?);
            let items = iterate(&items.unwrap_or_default())?;
            let mut total = s.len() * items.len().saturating_sub(1);
            let mut parts = Vec::with_capacity(items.len());
            for item in &items {
                match item {
                    Value::Str(part) => {
                        total += part.len();
                        parts.push(part.as_str());
                    }
                    other => {
                        return Err(type_error(format!(
                            "sequence item: expected str instance, {} found",
                            other.type_name()
                        )))
                    }
                }
            }
            ensure_fits(total, max_bytes)?;
            Ok(Value::Str(parts.join(s)))
        }
        "replace" => {
            let [old, new, count] = take::<3>(bind_args(&name, &["old", "new", "count"], 2, args, kwargs)?);
            let old = expect_str(&name, old.as_ref().unwrap_or(&Value::None))?.to_string();
            let new = expect_str(&name, new.as_ref().unwrap_or(&Value::None))?.to_string();
            let count = match count {
                Some(v) => expect_int(&name, &v)?,
                None => -1,
            };
            let occurrences = if old.is_empty() {
                s.chars().count() + 1
            } else {
                s.matches(old.as_str()).count()
            };
            let replaced = if count >= 0 {
                occurrences.min(count as usize)
            } else {
                occurrences
            };
            let size = s.len() + replaced.saturating_mul(new.len());
            ensure_fits(size, max_bytes)?;
            Ok(Value::Str(if count >= 0 {
                s.replacen(old.as_str(), &new, count as usize)
            } else {
                s.replace(old.as_str(), &new)
            }))
        }
        "startswith" | "endswith" => {
            let [affix] = take::<1>(bind_args(&name, &["prefix"], 1, args, kwargs)?);
            let candidates = match affix.unwrap_or_default() {
                Value::Str(a) => vec![a],
                Value::List(items) => items
                    .iter()
                    .map(|v| expect_str(&name, v).map(str::to_string))
                    .collect::<Outcome<Vec<_>>>()?,
                other => {
                    return Err(type_error(format!(
                        "{}() argument must be str or a list of str, not {}",
                        name,
                        other.type_name()
                    )))
                }
            };
            let hit = candidates.iter().any(|a| {
                if method == "startswith" {
                    s.starts_with(a.as_str())
                } else {
                    s.ends_with(a.as_str())
                }
            });
            Ok(Value::Bool(hit))
        }
        "find" => {
            let [sub] = take::<1>(bind_args(&name, &["sub"], 1, args, kwargs)?);
            let sub = sub.unwrap_or_default();
            let sub = expect_str(&name, &sub)?;
            Ok(Value::Int(s.find(sub).map_or(-1, |b| char_index(s, b))))
        }
        "count" => {
            let [sub] = take::<1>(bind_args(&name, &["sub"], 1, args, kwargs)?);
            let sub = sub.unwrap_or_default();
            let sub = expect_str(&name, &sub)?;
            let n = if sub.is_empty() {
                s.chars().count() + 1
            } else {
                s.matches(sub).count()
            };
            Ok(Value::Int(n as i64))
        }
        "index" => {
            let [sub] = take::<1>(bind_args(&name, &["sub"], 1, args, kwargs)?);
            let sub = sub.unwrap_or_default();
            let sub = expect_str(&name, &sub)?;
            s.find(sub)
                .map(|b| Value::Int(char_index(s, b)))
                .ok_or_else(|| value_error("substring not found"))
        }
        _ => Err(no_method("str", method)),
    }
}

fn split_whitespace(s: &str, maxsplit: i64) -> Vec<String> {
    if maxsplit < 0 {
        return s.split_whitespace().map(str::to_string).collect();
    }
    let mut parts = Vec::new();
    let mut rest = s.trim_start();
    while !rest.is_empty() {
        if parts.len() as i64 == maxsplit {
            parts.push(rest.to_string());
            break;
        }
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        parts.push(rest[..end].to_string());
        rest = rest[end..].trim_start();
    }
    parts
}

fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut previous_cased = false;
    for c in s.chars() {
        if c.is_alphabetic() {
            if previous_cased {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            previous_cased = true;
        } else {
            out.push(c);
            previous_cased = false;
        }
    }
    out
}

fn list_method(
    items: &mut Vec<Value>,
    method: &str,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> Outcome<Value> {
    let name = format!("list.{}", method);
    match method {
        "append" => {
            let [x] = take::<1>(bind_args(&name, &["object"], 1, args, kwargs)?);
            items.push(x.unwrap_or_default());
            Ok(Value::None)
        }
        "extend" => {
            let [x] = take::<1>(bind_args(&name, &["iterable"], 1, args, kwargs)?);
            items.extend(iterate(&x.unwrap_or_default())?);
            Ok(Value::None)
        }
        "insert" => {
            let [index, x] = take::<2>(bind_args(&name, &["index", "object"], 2, args, kwargs)?);
            let index = expect_int(&name, &index.unwrap_or_default())?;
            let len = items.len() as i64;
            let pos = if index < 0 { (index + len).max(0) } else { index.min(len) };
            items.insert(pos as usize, x.unwrap_or_default());
            Ok(Value::None)
        }
        "pop" => {
            let [index] = take::<1>(bind_args(&name, &["index"], 0, args, kwargs)?);
            if items.is_empty() {
                return Err(fault(FaultKind::IndexError, "pop from empty list"));
            }
            let index = match index {
                Some(v) => expect_int(&name, &v)?,
                None => -1,
            };
            let pos = normalize_index(index, items.len())
                .ok_or_else(|| fault(FaultKind::IndexError, "pop index out of range"))?;
            Ok(items.remove(pos))
        }
        "remove" => {
            let [x] = take::<1>(bind_args(&name, &["value"], 1, args, kwargs)?);
            let x = x.unwrap_or_default();
            let pos = items
                .iter()
                .position(|v| v.py_eq(&x))
                .ok_or_else(|| value_error("list.remove(x): x not in list"))?;
            items.remove(pos);
            Ok(Value::None)
        }
        "index" => {
            let [x] = take::<1>(bind_args(&name, &["value"], 1, args, kwargs)?);
            let x = x.unwrap_or_default();
            items
                .iter()
                .position(|v| v.py_eq(&x))
                .map(|p| Value::Int(p as i64))
                .ok_or_else(|| value_error(format!("{} is not in list", x.repr())))
        }
        "count" => {
            let [x] = take::<1>(bind_args(&name, &["value"], 1, args, kwargs)?);
            let x = x.unwrap_or_default();
            Ok(Value::Int(items.iter().filter(|v| v.py_eq(&x)).count() as i64))
        }
        "sort" => {
            let [key, reverse] = take::<2>(bind_args(&name, &["key", "reverse"], 0, args, kwargs)?);
            if key.map_or(false, |k| k != Value::None) {
                return Err(type_error("list.sort() key functions are not supported"));
            }
            sort_values(items, reverse.map_or(false, |r| r.truthy()))?;
            Ok(Value::None)
        }
        "reverse" => {
            bind_args(&name, &[], 0, args, kwargs)?;
            items.reverse();
            Ok(Value::None)
        }
        "copy" => {
            bind_args(&name, &[], 0, args, kwargs)?;
            Ok(Value::List(items.clone()))
        }
        "clear" => {
            bind_args(&name, &[], 0, args, kwargs)?;
            items.clear();
            Ok(Value::None)
        }
        _ => Err(no_method("list", method)),
    }
}

fn dict_method(
    dict: &mut Dict,
    method: &str,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> Outcome<Value> {
    let name = format!("dict.{}", method);
    match method {
        "get" => {
            let [key, default] = take::<2>(bind_args(&name, &["key", "default"], 1, args, kwargs)?);
            let key = dict_key(&key.unwrap_or_default())?;
            Ok(dict
                .get(&key)
                .cloned()
                .unwrap_or_else(|| default.unwrap_or_default()))
        }
        "keys" => {
            bind_args(&name, &[], 0, args, kwargs)?;
            Ok(Value::List(dict.keys().cloned().map(Value::Str).collect()))
        }
        "values" => {
            bind_args(&name, &[], 0, args, kwargs)?;
            Ok(Value::List(dict.values().cloned().collect()))
        }
        "items" => {
            bind_args(&name, &[], 0, args, kwargs)?;
            Ok(Value::List(
                dict.iter()
                    .map(|(k, v)| Value::List(vec![Value::Str(k.clone()), v.clone()]))
                    .collect(),
            ))
        }
        "pop" => {
            let [key, default] = take::<2>(bind_args(&name, &["key", "default"], 1, args, kwargs)?);
            let key = dict_key(&key.unwrap_or_default())?;
            match (dict.remove(&key), default) {
                (Some(v), _) => Ok(v),
                (None, Some(d)) => Ok(d),
                (None, None) => Err(fault(FaultKind::KeyError, Value::Str(key).repr())),
            }
        }
        "setdefault" => {
            let [key, default] = take::<2>(bind_args(&name, &["key", "default"], 1, args, kwargs)?);
            let key = dict_key(&key.unwrap_or_default())?;
            if let Some(existing) = dict.get(&key) {
                return Ok(existing.clone());
            }
            let value = default.unwrap_or_default();
            dict.insert(key, value.clone());
            Ok(value)
        }
        "update" => {
            if args.len() > 1 {
                return Err(type_error("update expected at most 1 argument"));
            }
            if let Value::Dict(other) = build_dict(args, kwargs)? {
                for (k, v) in other.iter() {
                    dict.insert(k.clone(), v.clone());
                }
            }
            Ok(Value::None)
        }
        "copy" => {
            bind_args(&name, &[], 0, args, kwargs)?;
            Ok(Value::Dict(dict.clone()))
        }
        "clear" => {
            bind_args(&name, &[], 0, args, kwargs)?;
            dict.clear();
            Ok(Value::None)
        }
        _ => Err(no_method("dict", method)),
    }
}

// ---- f-string formatting ----

static FORMAT_SPEC_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:(?P<fill>.)?(?P<align>[<>^]))?(?P<sign>[+\- ])?(?P<zero>0)?(?P<width>\d+)?(?P<comma>,)?(?:\.(?P<precision>\d+))?(?P<kind>[sdf%])?$").unwrap()
});

fn group_thousands(digits: &str) -> String {
    let (sign, digits) = match digits.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", digits),
    };
    let (int_part, frac) = match digits.find('.') {
        Some(dot) => (&digits[..dot], &digits[dot..]),
        None => (digits, ""),
    };
    let mut grouped = String::new();
    for (i, c) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    format!("{}{}{}", sign, grouped, frac)
}

/// Widest fixed-point rendering a format spec may ask for
const MAX_FLOAT_PRECISION: usize = 1_000;

/// Apply a `format_spec` (`>10`, `.2f`, `,d`, `.1%`) to a value
pub(crate) fn format_with_spec(value: &Value, spec: &str, max_bytes: usize) -> Outcome<String> {
    if spec.is_empty() {
        return Ok(value.to_display());
    }
    let caps = FORMAT_SPEC_RE
        .captures(spec)
        .ok_or_else(|| value_error(format!("Invalid format specifier '{}'", spec)))?;

    let precision = match caps.name("precision") {
        Some(m) => Some(
            m.as_str()
                .parse::<usize>()
                .map_err(|_| value_error("Too many decimal digits in format string"))?,
        ),
        None => None,
    };
    let float_digits = |p: Option<usize>| -> Outcome<usize> {
        let p = p.unwrap_or(6);
        if p > MAX_FLOAT_PRECISION {
            return Err(value_error("Too many decimal digits in format string"));
        }
        ensure_fits(p, max_bytes)?;
        Ok(p)
    };
    let kind = caps.name("kind").map(|m| m.as_str());
    let numeric = value.as_f64().is_some() && !matches!(value, Value::Str(_));

    let mut body = match (kind, value) {
        (Some("d"), v) => match v.as_int() {
            Some(i) if !matches!(v, Value::Float(_)) => i.to_string(),
            _ => {
                return Err(value_error(format!(
                    "Unknown format code 'd' for object of type '{}'",
                    v.type_name()
                )))
            }
        },
        (Some("f"), v) | (Some("%"), v) => {
            let f = v.as_f64().ok_or_else(|| {
                value_error(format!(
                    "Unknown format code 'f' for object of type '{}'",
                    v.type_name()
                ))
            })?;
            let f = if kind == Some("%") { f * 100.0 } else { f };
            let mut s = format!("{:.*}", float_digits(precision)?, f);
            if kind == Some("%") {
                s.push('%');
            }
            s
        }
        (_, Value::Float(f)) if precision.is_some() => format!("{:.*}", float_digits(precision)?, f),
        (_, v) => {
            let s = v.to_display();
            match precision {
                Some(p) if matches!(v, Value::Str(_)) => s.chars().take(p).collect(),
                _ => s,
            }
        }
    };

    if caps.name("comma").is_some() && numeric {
        body = group_thousands(&body);
    }
    if numeric && caps.name("sign").map(|m| m.as_str()) == Some("+") && !body.starts_with('-') {
        body.insert(0, '+');
    }

    let width = match caps.name("width") {
        Some(m) => m
            .as_str()
            .parse::<usize>()
            .map_err(|_| value_error("Too many decimal digits in format string"))?,
        None => 0,
    };
    let len = body.chars().count();
    if width <= len {
        return Ok(body);
    }

    let zero = caps.name("zero").is_some();
    let fill = caps
        .name("fill")
        .and_then(|m| m.as_str().chars().next())
        .unwrap_or(if zero { '0' } else { ' ' });
    let align = caps
        .name("align")
        .map(|m| m.as_str())
        .unwrap_or(if numeric { ">" } else { "<" });
    ensure_fits(
        body.len().saturating_add((width - len).saturating_mul(fill.len_utf8())),
        max_bytes,
    )?;
    let pad = width - len;
    let padding = |n: usize| std::iter::repeat(fill).take(n).collect::<String>();

    Ok(match align {
        ">" => format!("{}{}", padding(pad), body),
        "^" => format!("{}{}{}", padding(pad / 2), body, padding(pad - pad / 2)),
        _ => format!("{}{}", body, padding(pad)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 1024;

    fn strs(items: &[&str]) -> Value {
        Value::List(items.iter().map(|s| Value::str(*s)).collect())
    }

    fn call(name: &str, args: Vec<Value>) -> Outcome<Value> {
        call_builtin(name, args, Vec::new(), MAX)
    }

    fn fault_kind(result: Outcome<Value>) -> FaultKind {
        match result {
            Err(Interrupt::Fault(f)) => f.kind,
            other => panic!("expected fault, got {other:?}"),
        }
    }

    #[test]
    fn test_python_arithmetic() {
        let op = |op, a: i64, b: i64| binary_op(op, &Value::Int(a), &Value::Int(b), MAX).unwrap();
        assert_eq!(op(BinOp::FloorDiv, -7, 2), Value::Int(-4));
        assert_eq!(op(BinOp::Mod, -7, 2), Value::Int(1));
        assert_eq!(op(BinOp::Mod, 7, -2), Value::Int(-1));
        assert_eq!(op(BinOp::Div, 7, 2), Value::Float(3.5));
        assert_eq!(op(BinOp::Pow, 2, 10), Value::Int(1024));
        assert_eq!(
            fault_kind(binary_op(BinOp::Mul, &Value::Int(i64::MAX), &Value::Int(2), MAX)),
            FaultKind::OverflowError
        );
        assert_eq!(
            fault_kind(binary_op(BinOp::Div, &Value::Int(1), &Value::Int(0), MAX)),
            FaultKind::ZeroDivisionError
        );
        assert_eq!(
            fault_kind(binary_op(BinOp::Add, &Value::Int(1), &Value::str("a"), MAX)),
            FaultKind::TypeError
        );
    }

    #[test]
    fn test_repeat_is_size_checked() {
        let result = binary_op(BinOp::Mul, &Value::str("ab"), &Value::Int(10_000), MAX);
        assert!(matches!(result, Err(Interrupt::Violation(v)) if v.rule == ViolationRule::ValueTooLarge));
        assert!(matches!(call("range", vec![Value::Int(1 << 40)]), Err(Interrupt::Violation(_))));
        assert_eq!(
            binary_op(BinOp::Mul, &Value::Int(3), &Value::str("ab"), MAX).unwrap(),
            Value::str("ababab")
        );
    }

    #[test]
    fn test_builtins() {
        assert_eq!(call("len", vec![Value::str("héllo")]).unwrap(), Value::Int(5));
        assert_eq!(call("int", vec![Value::str(" 42 ")]).unwrap(), Value::Int(42));
        assert_eq!(fault_kind(call("int", vec![Value::str("x")])), FaultKind::ValueError);
        assert_eq!(call("round", vec![Value::Float(2.5)]).unwrap(), Value::Int(2));
        assert_eq!(call("round", vec![Value::Float(3.5)]).unwrap(), Value::Int(4));
        assert_eq!(
            call("range", vec![Value::Int(5), Value::Int(0), Value::Int(-2)]).unwrap(),
            Value::List(vec![Value::Int(5), Value::Int(3), Value::Int(1)])
        );
        assert_eq!(
            call("max", vec![Value::Int(3), Value::Float(4.5), Value::Int(1)]).unwrap(),
            Value::Float(4.5)
        );
        assert_eq!(fault_kind(call("min", vec![Value::List(vec![])])), FaultKind::ValueError);
        assert_eq!(
            call("sorted", vec![strs(&["b", "a"])]).unwrap(),
            strs(&["a", "b"])
        );
        assert_eq!(
            fault_kind(call("sorted", vec![Value::List(vec![Value::Int(1), Value::str("a")])])),
            FaultKind::TypeError
        );
    }

    #[test]
    fn test_slicing() {
        let list = Value::List((0..6).map(Value::Int).collect());
        let slice = |l: Option<i64>, u: Option<i64>, s: Option<i64>| {
            get_slice(
                &list,
                l.map(Value::Int).as_ref(),
                u.map(Value::Int).as_ref(),
                s.map(Value::Int).as_ref(),
            )
            .unwrap()
        };
        let ints = |xs: &[i64]| Value::List(xs.iter().copied().map(Value::Int).collect());
        assert_eq!(slice(Some(1), Some(3), None), ints(&[1, 2]));
        assert_eq!(slice(Some(-2), None, None), ints(&[4, 5]));
        assert_eq!(slice(None, None, Some(-2)), ints(&[5, 3, 1]));
        assert_eq!(slice(Some(10), None, None), ints(&[]));
        assert_eq!(
            get_slice(&Value::str("hello"), None, None, Some(&Value::Int(-1))).unwrap(),
            Value::str("olleh")
        );
    }

    #[test]
    fn test_slicing_with_extreme_steps() {
        assert_eq!(slice_positions(3, Some(1), None, i64::MAX), vec![1]);
        assert_eq!(slice_positions(3, None, None, i64::MAX), vec![0]);
        assert_eq!(slice_positions(3, None, None, i64::MIN), vec![2]);
        assert_eq!(slice_positions(3, Some(i64::MAX), Some(i64::MIN), -1), vec![2, 1, 0]);
        assert_eq!(
            get_slice(
                &Value::str("abc"),
                Some(&Value::Int(1)),
                None,
                Some(&Value::Int(i64::MAX))
            )
            .unwrap(),
            Value::str("b")
        );
    }

    #[test]
    fn test_string_methods() {
        let mut s = Value::str("  a,b,,c  ");
        let strip = call_method(&mut s, "strip", vec![], vec![], MAX).unwrap();
        assert_eq!(strip, Value::str("a,b,,c"));
        let mut strip = strip;
        assert_eq!(
            call_method(&mut strip, "split", vec![Value::str(",")], vec![], MAX).unwrap(),
            strs(&["a", "b", "", "c"])
        );
        let mut words = Value::str(" one  two three ");
        assert_eq!(
            call_method(&mut words, "split", vec![Value::None, Value::Int(1)], vec![], MAX).unwrap(),
            strs(&["one", "two three "])
        );
        let mut title = Value::str("hello wORLD");
        assert_eq!(
            call_method(&mut title, "title", vec![], vec![], MAX).unwrap(),
            Value::str("Hello World")
        );
        let mut sep = Value::str("-");
        assert_eq!(
            call_method(&mut sep, "join", vec![strs(&["a", "b"])], vec![], MAX).unwrap(),
            Value::str("a-b")
        );
    }

    #[test]
    fn test_list_and_dict_methods() {
        let mut list = Value::List(vec![Value::Int(3), Value::Int(1)]);
        call_method(&mut list, "append", vec![Value::Int(2)], vec![], MAX).unwrap();
        call_method(&mut list, "sort", vec![], vec![("reverse".into(), Value::Bool(true))], MAX).unwrap();
        assert_eq!(list, Value::List(vec![Value::Int(3), Value::Int(2), Value::Int(1)]));
        assert_eq!(call_method(&mut list, "pop", vec![], vec![], MAX).unwrap(), Value::Int(1));

        let mut dict = Value::Dict(Dict::new());
        call_method(&mut dict, "setdefault", vec![Value::str("k"), Value::Int(0)], vec![], MAX).unwrap();
        assert_eq!(
            call_method(&mut dict, "get", vec![Value::str("k")], vec![], MAX).unwrap(),
            Value::Int(0)
        );
        assert_eq!(
            call_method(&mut dict, "get", vec![Value::str("missing"), Value::Int(7)], vec![], MAX).unwrap(),
            Value::Int(7)
        );
        assert!(matches!(
            get_item(&dict, &Value::str("missing")),
            Err(Interrupt::Fault(f)) if f.kind == FaultKind::KeyError
        ));
    }

    #[test]
    fn test_format_spec() {
        assert_eq!(format_with_spec(&Value::Float(3.14159), ".2f", MAX).unwrap(), "3.14");
        assert_eq!(format_with_spec(&Value::Int(1234567), ",d", MAX).unwrap(), "1,234,567");
        assert_eq!(format_with_spec(&Value::str("ab"), ">5", MAX).unwrap(), "   ab");
        assert_eq!(format_with_spec(&Value::Int(7), "03", MAX).unwrap(), "007");
        assert_eq!(format_with_spec(&Value::Float(0.256), ".1%", MAX).unwrap(), "25.6%");
        assert!(format_with_spec(&Value::str("x"), "q!", MAX).is_err());
    }

    #[test]
    fn test_format_spec_bounds() {
        let err = format_with_spec(&Value::Float(1.5), ".100000000f", MAX).unwrap_err();
        assert!(matches!(err, Interrupt::Fault(f) if f.kind == FaultKind::ValueError));
        let err = format_with_spec(&Value::Float(1.5), ".99999999999999999999999f", MAX).unwrap_err();
        assert!(matches!(err, Interrupt::Fault(f) if f.kind == FaultKind::ValueError));
        assert!(matches!(
            format_with_spec(&Value::Float(1.5), ".999f", 100),
            Err(Interrupt::Violation(v)) if v.rule == ViolationRule::ValueTooLarge
        ));
        assert!(matches!(
            format_with_spec(&Value::Int(1), ">200000000", MAX),
            Err(Interrupt::Violation(v)) if v.rule == ViolationRule::ValueTooLarge
        ));
        assert!(matches!(
            format_with_spec(&Value::str("ab"), "é^1000", MAX),
            Err(Interrupt::Violation(v)) if v.rule == ViolationRule::ValueTooLarge
        ));
        assert_eq!(format_with_spec(&Value::str("ab"), "*^6", MAX).unwrap(), "**ab**");
    }

    #[test]
    fn test_bind_args() {
        let bound = bind_args(
            "f",
            &["a", "b"],
            1,
            vec![Value::Int(1)],
            vec![("b".into(), Value::Int(2))],
        )
        .unwrap();
        assert_eq!(bound, vec![Some(Value::Int(1)), Some(Value::Int(2))]);
        assert!(bind_args("f", &["a"], 1, vec![], vec![]).is_err());
        assert!(bind_args("f", &["a"], 0, vec![], vec![("z".into(), Value::None)]).is_err());
    }
}
