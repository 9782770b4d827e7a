//! Runtime values of the snippet language

use std::cmp::Ordering;
use std::fmt::Write as _;

use crate::types::{Chunk, ChunkLookup};

/// A value held by sandboxed code
///
/// Values are plain data with copy semantics: assigning a list to a second
/// name copies it. Chunks are exposed as read-only [`Record`]s.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Dict(Dict),
    Record(Record),
}

/// Insertion-ordered mapping with string keys
#[derive(Debug, Clone, Default)]
pub struct Dict {
    entries: Vec<(String, Value)>,
}

impl PartialEq for Dict {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .entries
                .iter()
                .all(|(k, v)| other.get(k).map_or(false, |o| o.py_eq(v)))
    }
}

impl Dict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.entries
            .iter_mut()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Insert or overwrite, keeping the original position of an existing key
    pub fn insert(&mut self, key: String, value: Value) {
        match self.get_mut(&key) {
            Some(slot) => *slot = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let pos = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(pos).1)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.iter().map(|(k, _)| k)
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.entries.iter().map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl FromIterator<(String, Value)> for Dict {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut dict = Dict::new();
        for (k, v) in iter {
            dict.insert(k, v);
        }
        dict
    }
}

/// Read-only view of a chunk lookup
///
/// Field order is fixed so `keys()` and `repr` are stable.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    fields: Vec<(&'static str, Value)>,
}

impl Record {
    pub const FIELDS: &'static [&'static str] = &[
        "found",
        "id",
        "status",
        "content",
        "type",
        "tags",
        "links",
        "confidence",
        "source",
        "conversation_id",
        "created_at",
        "updated_at",
        "access_count",
    ];

    pub fn from_chunk(chunk: &Chunk) -> Self {
        let links: Dict = chunk
            .links
            .iter()
            .filter(|(_, targets)| !targets.is_empty())
            .map(|(link_type, targets)| {
                (
                    link_type.as_str().to_string(),
                    Value::List(targets.iter().cloned().map(Value::Str).collect()),
                )
            })
            .collect();

        let fields = vec![
            ("found", Value::Bool(true)),
            ("id", Value::Str(chunk.id.clone())),
            ("status", Value::Str("active".into())),
            ("content", Value::Str(chunk.content.clone())),
            ("type", Value::Str(chunk.chunk_type.as_str().to_string())),
            (
                "tags",
                Value::List(chunk.tags.iter().cloned().map(Value::Str).collect()),
            ),
            ("links", Value::Dict(links)),
            ("confidence", Value::Float(f64::from(chunk.metadata.confidence))),
            ("source", Value::Str(chunk.metadata.source.clone())),
            (
                "conversation_id",
                chunk
                    .metadata
                    .conversation_id
                    .clone()
                    .map_or(Value::None, Value::Str),
            ),
            ("created_at", Value::Str(chunk.metadata.created_at.to_rfc3339())),
            ("updated_at", Value::Str(chunk.metadata.updated_at.to_rfc3339())),
            (
                "access_count",
                Value::Int(i64::try_from(chunk.metadata.access_count).unwrap_or(i64::MAX)),
            ),
        ];
        Self { fields }
    }

    fn absent(id: &str, status: &str) -> Self {
        let fields = Self::FIELDS
            .iter()
            .map(|name| {
                let value = match *name {
                    "found" => Value::Bool(false),
                    "id" => Value::Str(id.to_string()),
                    "status" => Value::Str(status.to_string()),
                    "tags" => Value::List(Vec::new()),
                    "links" => Value::Dict(Dict::new()),
                    _ => Value::None,
                };
                (*name, value)
            })
            .collect();
        Self { fields }
    }

    pub fn from_lookup(lookup: &ChunkLookup) -> Self {
        match lookup {
            ChunkLookup::Found(chunk) => Self::from_chunk(chunk),
            ChunkLookup::Inactive(id) => Self::absent(id, "inactive"),
            ChunkLookup::Missing(id) => Self::absent(id, "not_found"),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(k, _)| *k == name).map(|(_, v)| v)
    }

    pub fn found(&self) -> bool {
        matches!(self.get("found"), Some(Value::Bool(true)))
    }

    pub fn id(&self) -> Option<&str> {
        match self.get("id") {
            Some(Value::Str(id)) => Some(id),
            _ => None,
        }
    }

    pub fn content(&self) -> Option<&str> {
        match self.get("content") {
            Some(Value::Str(content)) => Some(content),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &Value)> {
        self.fields.iter().map(|(k, v)| (*k, v))
    }

    pub fn to_dict(&self) -> Dict {
        self.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }
}

impl Value {
    pub fn str(s: impl Into<String>) -> Self {
        Value::Str(s.into())
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
            Value::Record(_) => "chunk",
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.is_empty(),
            Value::Dict(dict) => !dict.is_empty(),
            Value::Record(record) => record.found(),
        }
    }

    /// Numeric view used by arithmetic; bools count as ints
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Bool(b) => Some(i64::from(*b)),
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Equality with numeric coercion between bool, int and float
    pub fn py_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.py_eq(y))
            }
            (Value::Dict(a), Value::Dict(b)) => a == b,
            (Value::Record(a), Value::Record(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }

    /// Ordering for `<`, `sorted`, `min` and `max`; `None` when incomparable
    pub fn py_cmp(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            (Value::List(a), Value::List(b)) => {
                for (x, y) in a.iter().zip(b) {
                    match x.py_cmp(y)? {
                        Ordering::Equal => continue,
                        ord => return Some(ord),
                    }
                }
                Some(a.len().cmp(&b.len()))
            }
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => None,
            },
        }
    }

    /// Python `str()`
    pub fn to_display(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            other => other.repr(),
        }
    }

    /// Python `repr()`
    pub fn repr(&self) -> String {
        let mut out = String::new();
        self.write_repr(&mut out);
        out
    }

    fn write_repr(&self, out: &mut String) {
        match self {
            Value::None => out.push_str("None"),
            Value::Bool(true) => out.push_str("True"),
            Value::Bool(false) => out.push_str("False"),
            Value::Int(i) => {
                let _ = write!(out, "{}", i);
            }
            Value::Float(f) => out.push_str(&format_float(*f)),
            Value::Str(s) => out.push_str(&quote_str(s)),
            Value::List(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    item.write_repr(out);
                }
                out.push(']');
            }
            Value::Dict(dict) => {
                out.push('{');
                for (i, (k, v)) in dict.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    out.push_str(&quote_str(k));
                    out.push_str(": ");
                    v.write_repr(out);
                }
                out.push('}');
            }
            Value::Record(record) => {
                out.push_str("chunk(");
                for (i, (k, v)) in record.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    out.push_str(k);
                    out.push('=');
                    v.write_repr(out);
                }
                out.push(')');
            }
        }
    }

    /// Approximate heap footprint, giving up once it passes `cap`
    pub fn approx_size(&self, cap: usize) -> usize {
        let mut total = 0;
        self.accumulate_size(cap, &mut total);
        total
    }

    fn accumulate_size(&self, cap: usize, total: &mut usize) {
        if *total > cap {
            return;
        }
        match self {
            Value::Str(s) => *total += s.len(),
            Value::List(items) => {
                *total += items.len() * 8;
                for item in items {
                    item.accumulate_size(cap, total);
                    if *total > cap {
                        return;
                    }
                }
            }
            Value::Dict(dict) => {
                for (k, v) in dict.iter() {
                    *total += k.len() + 8;
                    v.accumulate_size(cap, total);
                    if *total > cap {
                        return;
                    }
                }
            }
            Value::Record(record) => {
                for (_, v) in record.iter() {
                    v.accumulate_size(cap, total);
                }
            }
            _ => *total += 8,
        }
    }

    /// Container nesting depth, giving up once it passes `cap`
    pub fn depth(&self, cap: usize) -> usize {
        if cap == 0 {
            return 1;
        }
        let children = match self {
            Value::List(items) => items.iter().map(|v| v.depth(cap - 1)).max(),
            Value::Dict(dict) => dict.values().map(|v| v.depth(cap - 1)).max(),
            Value::Record(record) => record.iter().map(|(_, v)| v.depth(cap - 1)).max(),
            _ => return 0,
        };
        1 + children.unwrap_or(0)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<String>> for Value {
    fn from(items: Vec<String>) -> Self {
        Value::List(items.into_iter().map(Value::Str).collect())
    }
}

pub fn format_float(f: f64) -> String {
    if f.is_nan() {
        "nan".to_string()
    } else if f.is_infinite() {
        if f > 0.0 { "inf" } else { "-inf" }.to_string()
    } else if f == f.trunc() && f.abs() < 1e16 {
        format!("{:.1}", f)
    } else {
        format!("{}", f)
    }
}

fn quote_str(s: &str) -> String {
    let quote = if s.contains('\'') && !s.contains('"') {
        '"'
    } else {
        '\''
    };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(quote);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if c.is_control() => {
                let _ = write!(out, "\\x{:02x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}
