//! Read-only functions snippets use to explore the chunk store
//!
//! Every id-shaped argument is validated before storage is touched.
//! Path-like ids are sandbox violations; other malformed ids are ordinary
//! `ValueError`s. A well-formed id that does not resolve comes back as a
//! not-found record, never as a fault.

use tracing::{debug, warn};

use super::builtins::{bind_args, expect_int, expect_str};
use super::fault::{FaultKind, Interrupt, RuntimeFault, SandboxViolation, ViolationRule};
use super::value::{Record, Value};
use crate::config::SessionConfig;
use crate::error::{MeridianError, Result};
use crate::storage::ChunkStore;
use crate::types::{validate_chunk_id, ChunkId, ChunkLookup, LinkType, TagMatch, TraversalOrder};

/// Default `max_nodes` for `traverse_chunks`
pub const DEFAULT_TRAVERSAL_NODES: usize = 25;

/// Read access a session needs from the chunk store
pub trait ChunkSource: Send + Sync {
    fn read(&self, id: &str) -> Result<ChunkLookup>;

    fn search(&self, query: &str, limit: usize) -> Result<Vec<ChunkId>>;

    fn by_tags(&self, tags: &[String], mode: TagMatch, limit: usize) -> Result<Vec<ChunkId>>;

    fn outgoing(&self, id: &str, link_type: Option<LinkType>) -> Result<Vec<ChunkId>>;

    fn incoming(&self, id: &str, link_type: Option<LinkType>) -> Result<Vec<ChunkId>>;

    fn traverse(
        &self,
        start: &[ChunkId],
        max_nodes: usize,
        order: TraversalOrder,
        types: Option<&[LinkType]>,
    ) -> Result<Vec<ChunkId>>;
}

impl ChunkSource for ChunkStore {
    fn read(&self, id: &str) -> Result<ChunkLookup> {
        ChunkStore::read(self, id)
    }

    fn search(&self, query: &str, limit: usize) -> Result<Vec<ChunkId>> {
        self.search_by_keyword(query, limit)
    }

    fn by_tags(&self, tags: &[String], mode: TagMatch, limit: usize) -> Result<Vec<ChunkId>> {
        self.list_by_tag(tags, mode, limit)
    }

    fn outgoing(&self, id: &str, link_type: Option<LinkType>) -> Result<Vec<ChunkId>> {
        Ok(self.get_linked(id, link_type))
    }

    fn incoming(&self, id: &str, link_type: Option<LinkType>) -> Result<Vec<ChunkId>> {
        Ok(self.get_incoming(id, link_type))
    }

    fn traverse(
        &self,
        start: &[ChunkId],
        max_nodes: usize,
        order: TraversalOrder,
        types: Option<&[LinkType]>,
    ) -> Result<Vec<ChunkId>> {
        Ok(ChunkStore::traverse(self, start, max_nodes, order, types))
    }
}

impl<T: ChunkSource + ?Sized> ChunkSource for std::sync::Arc<T> {
    fn read(&self, id: &str) -> Result<ChunkLookup> {
        (**self).read(id)
    }

    fn search(&self, query: &str, limit: usize) -> Result<Vec<ChunkId>> {
        (**self).search(query, limit)
    }

    fn by_tags(&self, tags: &[String], mode: TagMatch, limit: usize) -> Result<Vec<ChunkId>> {
        (**self).by_tags(tags, mode, limit)
    }

    fn outgoing(&self, id: &str, link_type: Option<LinkType>) -> Result<Vec<ChunkId>> {
        (**self).outgoing(id, link_type)
    }

    fn incoming(&self, id: &str, link_type: Option<LinkType>) -> Result<Vec<ChunkId>> {
        (**self).incoming(id, link_type)
    }

    fn traverse(
        &self,
        start: &[ChunkId],
        max_nodes: usize,
        order: TraversalOrder,
        types: Option<&[LinkType]>,
    ) -> Result<Vec<ChunkId>> {
        (**self).traverse(start, max_nodes, order, types)
    }
}

/// Direction and type filter parsed from a `link_type` argument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkFilter {
    Outgoing(Option<LinkType>),
    Incoming(Option<LinkType>),
}

fn parse_link_filter(raw: &str) -> std::result::Result<LinkFilter, String> {
    let raw = raw.trim().to_lowercase();
    if raw == "reverse" || raw == "incoming" {
        return Ok(LinkFilter::Incoming(None));
    }
    match raw.strip_suffix("_reverse") {
        Some(base) => base.parse().map(|t| LinkFilter::Incoming(Some(t))),
        None => raw.parse().map(|t| LinkFilter::Outgoing(Some(t))),
    }
}

fn storage_fault(err: MeridianError) -> Interrupt {
    warn!(error = %err, "Storage fault during capability call");
    Interrupt::Storage(err.to_string())
}

fn value_error(message: impl Into<String>) -> Interrupt {
    Interrupt::Fault(RuntimeFault::new(FaultKind::ValueError, message))
}

/// Validate an id-shaped argument
pub(crate) fn checked_id(raw: &str) -> std::result::Result<ChunkId, Interrupt> {
    match validate_chunk_id(raw) {
        Ok(id) => Ok(id.to_string()),
        Err(e) if e.is_path_like() => Err(SandboxViolation::new(
            ViolationRule::PathLikeId,
            format!("chunk id {} looks like a filesystem path", Value::str(raw).repr()),
        )
        .into()),
        Err(e) => Err(value_error(format!(
            "invalid chunk id {}: {}",
            Value::str(raw).repr(),
            e
        ))),
    }
}

/// An id argument may be the id itself or a record previously returned
fn id_argument(func: &str, value: &Value) -> std::result::Result<ChunkId, Interrupt> {
    match value {
        Value::Record(record) => match record.id() {
            Some(id) => checked_id(id),
            None => Err(value_error(format!("{}() got a chunk record without an id", func))),
        },
        other => checked_id(expect_str(func, other)?),
    }
}

/// The chunk-store functions bound into a session's namespace
pub struct CapabilitySurface<S: ChunkSource> {
    source: S,
    default_limit: usize,
    max_nodes: usize,
}

impl<S: ChunkSource> CapabilitySurface<S> {
    pub fn new(source: S, config: &SessionConfig) -> Self {
        Self {
            source,
            default_limit: config.default_search_limit,
            max_nodes: config.max_traversal_nodes,
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Dispatch a capability call by name
    pub(crate) fn call(
        &self,
        name: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> std::result::Result<Value, Interrupt> {
        debug!(capability = name, "Capability call");
        match name {
            "read_chunk" => {
                let [id] = bound::<1>(bind_args(name, &["chunk_id"], 1, args, kwargs)?);
                let id = id_argument(name, &id)?;
                self.read_chunk(&id)
            }
            "search_chunks" => {
                let [query, limit] = bound::<2>(bind_args(name, &["query", "limit"], 1, args, kwargs)?);
                let query = expect_str(name, &query)?.to_string();
                let limit = self.limit_argument(name, &limit)?;
                self.source
                    .search(&query, limit)
                    .map(Value::from)
                    .map_err(storage_fault)
            }
            "list_chunks_by_tag" => {
                let [tags, mode, limit] = bound::<3>(bind_args(
                    name,
                    &["tags", "match", "limit"],
                    1,
                    args,
                    kwargs,
                )?);
                let tags = tag_list(name, &tags)?;
                let mode = match &mode {
                    Value::None => TagMatch::Any,
                    v => match expect_str(name, v)?.to_lowercase().as_str() {
                        "any" => TagMatch::Any,
                        "all" => TagMatch::All,
                        other => {
                            return Err(value_error(format!(
                                "match must be 'any' or 'all', not '{}'",
                                other
                            )))
                        }
                    },
                };
                let limit = self.limit_argument(name, &limit)?;
                self.source
                    .by_tags(&tags, mode, limit)
                    .map(Value::from)
                    .map_err(storage_fault)
            }
            "get_linked_chunks" => {
                let [id, link_type] = bound::<2>(bind_args(
                    name,
                    &["chunk_id", "link_type"],
                    1,
                    args,
                    kwargs,
                )?);
                let id = id_argument(name, &id)?;
                let filter = match &link_type {
                    Value::None => LinkFilter::Outgoing(None),
                    v => parse_link_filter(expect_str(name, v)?).map_err(value_error)?,
                };
                let linked = match filter {
                    LinkFilter::Outgoing(t) => self.source.outgoing(&id, t),
                    LinkFilter::Incoming(t) => self.source.incoming(&id, t),
                };
                linked.map(Value::from).map_err(storage_fault)
            }
            "traverse_chunks" => {
                let [start, max_nodes, order, link_types] = bound::<4>(bind_args(
                    name,
                    &["start", "max_nodes", "order", "link_types"],
                    1,
                    args,
                    kwargs,
                )?);
                let start = match &start {
                    Value::List(items) => items
                        .iter()
                        .map(|v| id_argument(name, v))
                        .collect::<std::result::Result<Vec<_>, _>>()?,
                    v => vec![id_argument(name, v)?],
                };
                let max_nodes = match &max_nodes {
                    Value::None => DEFAULT_TRAVERSAL_NODES,
                    v => positive(name, "max_nodes", expect_int(name, v)?)?,
                }
                .min(self.max_nodes);
                let order = match &order {
                    Value::None => TraversalOrder::BreadthFirst,
                    v => expect_str(name, v)?.parse().map_err(value_error)?,
                };
                let types = match &link_types {
                    Value::None => None,
                    v => Some(
                        tag_list(name, v)?
                            .iter()
                            .map(|t| t.parse::<LinkType>())
                            .collect::<std::result::Result<Vec<_>, _>>()
                            .map_err(value_error)?,
                    ),
                };
                self.source
                    .traverse(&start, max_nodes, order, types.as_deref())
                    .map(Value::from)
                    .map_err(storage_fault)
            }
            other => Err(Interrupt::Fault(RuntimeFault::new(
                FaultKind::NameError,
                format!("name '{}' is not defined", other),
            ))),
        }
    }

    fn read_chunk(&self, id: &str) -> std::result::Result<Value, Interrupt> {
        match self.source.read(id) {
            Ok(lookup) => Ok(Value::Record(Record::from_lookup(&lookup))),
            Err(e) if e.is_not_found() => Ok(Value::Record(Record::from_lookup(
                &ChunkLookup::Missing(id.to_string()),
            ))),
            Err(e) => Err(storage_fault(e)),
        }
    }

    fn limit_argument(&self, func: &str, value: &Value) -> std::result::Result<usize, Interrupt> {
        match value {
            Value::None => Ok(self.default_limit),
            v => Ok(positive(func, "limit", expect_int(func, v)?)?.min(self.max_nodes)),
        }
    }

    /// Turn a `recursive_query` context argument into prompt text
    ///
    /// Chunk ids and records are replaced by their content. Strings that
    /// are not chunk ids are passed through as plain text.
    pub(crate) fn resolve_context(&self, value: &Value) -> std::result::Result<Option<String>, Interrupt> {
        let mut sections = Vec::new();
        match value {
            Value::None => return Ok(None),
            Value::List(items) => {
                for item in items {
                    self.resolve_item(item, &mut sections)?;
                }
            }
            other => self.resolve_item(other, &mut sections)?,
        }
        Ok(Some(sections.join("\n\n")))
    }

    fn resolve_item(&self, value: &Value, sections: &mut Vec<String>) -> std::result::Result<(), Interrupt> {
        match value {
            Value::Record(record) => match (record.id(), record.content()) {
                (Some(id), Some(content)) => sections.push(chunk_section(id, content)),
                (Some(id), None) => sections.push(format!("[{}] (not found)", id)),
                _ => {}
            },
            Value::Str(text) => {
                if text.starts_with(crate::types::CHUNK_ID_PREFIX) && !text.contains(char::is_whitespace) {
                    let id = checked_id(text)?;
                    let record = self.read_chunk(&id)?;
                    return self.resolve_item(&record, sections);
                }
                sections.push(text.clone());
            }
            Value::None => {}
            other => sections.push(other.to_display()),
        }
        Ok(())
    }
}

fn chunk_section(id: &str, content: &str) -> String {
    format!("[{}]\n{}", id, content)
}

fn positive(func: &str, param: &str, n: i64) -> std::result::Result<usize, Interrupt> {
    if n < 1 {
        return Err(value_error(format!("{}() {} must be at least 1, got {}", func, param, n)));
    }
    Ok(n as usize)
}

/// A single tag or a list of tags
fn tag_list(func: &str, value: &Value) -> std::result::Result<Vec<String>, Interrupt> {
    match value {
        Value::Str(tag) => Ok(vec![tag.clone()]),
        Value::List(items) => items
            .iter()
            .map(|v| expect_str(func, v).map(str::to_string))
            .collect(),
        other => Err(Interrupt::Fault(RuntimeFault::type_error(format!(
            "{}() expected a str or a list of str, got {}",
            func,
            other.type_name()
        )))),
    }
}

fn bound<const N: usize>(args: Vec<Option<Value>>) -> [Value; N] {
    let mut out: [Value; N] = std::array::from_fn(|_| Value::None);
    for (slot, value) in out.iter_mut().zip(args) {
        *slot = value.unwrap_or_default();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::types::CreateChunkInput;

    /// Counts every storage touch
    #[derive(Default)]
    struct CountingSource {
        calls: AtomicUsize,
    }

    impl CountingSource {
        fn touch(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl ChunkSource for CountingSource {
        fn read(&self, id: &str) -> Result<ChunkLookup> {
            self.touch();
            Ok(ChunkLookup::Missing(id.to_string()))
        }

        fn search(&self, _query: &str, _limit: usize) -> Result<Vec<ChunkId>> {
            self.touch();
            Ok(Vec::new())
        }

        fn by_tags(&self, tags: &[String], _mode: TagMatch, _limit: usize) -> Result<Vec<ChunkId>> {
            self.touch();
            Ok(tags.iter().map(|t| format!("chunk-{}", t)).collect())
        }

        fn outgoing(&self, _id: &str, _link_type: Option<LinkType>) -> Result<Vec<ChunkId>> {
            self.touch();
            Ok(vec!["chunk-out".into()])
        }

        fn incoming(&self, _id: &str, _link_type: Option<LinkType>) -> Result<Vec<ChunkId>> {
            self.touch();
            Ok(vec!["chunk-in".into()])
        }

        fn traverse(
            &self,
            start: &[ChunkId],
            max_nodes: usize,
            _order: TraversalOrder,
            _types: Option<&[LinkType]>,
        ) -> Result<Vec<ChunkId>> {
            self.touch();
            Ok(start.iter().take(max_nodes).cloned().collect())
        }
    }

    struct FailingSource;

    impl ChunkSource for FailingSource {
        fn read(&self, _id: &str) -> Result<ChunkLookup> {
            Err(MeridianError::Storage("disk unavailable".into()))
        }

        fn search(&self, _query: &str, _limit: usize) -> Result<Vec<ChunkId>> {
            Err(MeridianError::Storage("disk unavailable".into()))
        }

        fn by_tags(&self, _tags: &[String], _mode: TagMatch, _limit: usize) -> Result<Vec<ChunkId>> {
            Err(MeridianError::Storage("disk unavailable".into()))
        }

        fn outgoing(&self, _id: &str, _link_type: Option<LinkType>) -> Result<Vec<ChunkId>> {
            Err(MeridianError::Storage("disk unavailable".into()))
        }

        fn incoming(&self, _id: &str, _link_type: Option<LinkType>) -> Result<Vec<ChunkId>> {
            Err(MeridianError::Storage("disk unavailable".into()))
        }

        fn traverse(
            &self,
            _start: &[ChunkId],
            _max_nodes: usize,
            _order: TraversalOrder,
            _types: Option<&[LinkType]>,
        ) -> Result<Vec<ChunkId>> {
            Err(MeridianError::Storage("disk unavailable".into()))
        }
    }

    fn surface<S: ChunkSource>(source: S) -> CapabilitySurface<S> {
        CapabilitySurface::new(source, &SessionConfig::default())
    }

    fn call<S: ChunkSource>(s: &CapabilitySurface<S>, name: &str, args: Vec<Value>) -> std::result::Result<Value, Interrupt> {
        s.call(name, args, Vec::new())
    }

    #[test]
    fn test_path_like_ids_never_reach_storage() {
        let s = surface(CountingSource::default());
        for id in ["../etc/passwd", "chunk-a/../b", "chunk-a\\b", "~/chunk-a", ".hidden"] {
            let result = call(&s, "read_chunk", vec![Value::str(id)]);
            assert!(
                matches!(&result, Err(Interrupt::Violation(v)) if v.rule == ViolationRule::PathLikeId),
                "{id}: {result:?}"
            );
            let result = call(&s, "get_linked_chunks", vec![Value::str(id)]);
            assert!(matches!(result, Err(Interrupt::Violation(_))));
        }
        assert_eq!(s.source().calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_malformed_ids_are_value_errors() {
        let s = surface(CountingSource::default());
        let result = call(&s, "read_chunk", vec![Value::str("note-1")]);
        assert!(matches!(result, Err(Interrupt::Fault(f)) if f.kind == FaultKind::ValueError));
        let result = call(&s, "read_chunk", vec![Value::Int(3)]);
        assert!(matches!(result, Err(Interrupt::Fault(f)) if f.kind == FaultKind::TypeError));
        assert_eq!(s.source().calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_tags_accept_str_or_list() {
        let s = surface(CountingSource::default());
        assert_eq!(
            call(&s, "list_chunks_by_tag", vec![Value::str("rust")]).unwrap(),
            Value::from(vec!["chunk-rust".to_string()])
        );
        let both = Value::List(vec![Value::str("a"), Value::str("b")]);
        assert_eq!(
            call(&s, "list_chunks_by_tag", vec![both]).unwrap(),
            Value::from(vec!["chunk-a".to_string(), "chunk-b".to_string()])
        );
        let result = s.call(
            "list_chunks_by_tag",
            vec![Value::str("a")],
            vec![("match".into(), Value::str("some"))],
        );
        assert!(matches!(result, Err(Interrupt::Fault(_))));
    }

    #[test]
    fn test_reverse_link_filter() {
        assert_eq!(
            parse_link_filter("follows_reverse"),
            Ok(LinkFilter::Incoming(Some(LinkType::Follows)))
        );
        assert_eq!(
            parse_link_filter("supports"),
            Ok(LinkFilter::Outgoing(Some(LinkType::Supports)))
        );
        assert!(parse_link_filter("cites").is_err());

        let s = surface(CountingSource::default());
        assert_eq!(
            call(&s, "get_linked_chunks", vec![Value::str("chunk-a"), Value::str("follows_reverse")]).unwrap(),
            Value::from(vec!["chunk-in".to_string()])
        );
    }

    #[test]
    fn test_traversal_nodes_are_capped() {
        let s = surface(CountingSource::default());
        let start = Value::List((0..300).map(|i| Value::Str(format!("chunk-{i}"))).collect());
        let result = s
            .call(
                "traverse_chunks",
                vec![start],
                vec![("max_nodes".into(), Value::Int(10_000))],
            )
            .unwrap();
        match result {
            Value::List(ids) => assert_eq!(ids.len(), SessionConfig::default().max_traversal_nodes),
            other => panic!("expected list, got {other:?}"),
        }
    }

    #[test]
    fn test_storage_fault_is_not_not_found() {
        let s = surface(FailingSource);
        assert!(matches!(
            call(&s, "read_chunk", vec![Value::str("chunk-a")]),
            Err(Interrupt::Storage(_))
        ));
        assert!(matches!(
            call(&s, "search_chunks", vec![Value::str("x")]),
            Err(Interrupt::Storage(_))
        ));
    }

    #[test]
    fn test_read_chunk_against_store() {
        let store = ChunkStore::open_in_memory().unwrap();
        let chunk = store
            .create(CreateChunkInput::new("Use tempfile for scratch dirs").with_tags(&["rust"]))
            .unwrap();
        let s = surface(store);

        let record = call(&s, "read_chunk", vec![Value::Str(chunk.id.clone())]).unwrap();
        match &record {
            Value::Record(r) => {
                assert!(r.found());
                assert_eq!(r.content(), Some("Use tempfile for scratch dirs"));
            }
            other => panic!("expected record, got {other:?}"),
        }

        let missing = call(&s, "read_chunk", vec![Value::str("chunk-20240101-ffff")]).unwrap();
        assert!(!missing.truthy());

        let context = s
            .resolve_context(&Value::List(vec![Value::Str(chunk.id.clone()), Value::str("plain note")]))
            .unwrap()
            .unwrap();
        assert!(context.contains("Use tempfile for scratch dirs"));
        assert!(context.contains("plain note"));
    }
}
