//! Chunk store facade: records in SQLite, links mirrored in memory
//!
//! Write path (create, update, soft delete, manual links) holds the graph
//! write lock for the whole operation: the SQLite transaction runs first and
//! the in-memory graph is only touched after it commits. Lock order is
//! always graph, then connection. Readers take the graph read lock and never
//! wait on a writer's connection while holding it.

use chrono::Utc;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::connection::Storage;
use super::queries;
use crate::config::{LinkerConfig, MeridianConfig};
use crate::error::{MeridianError, Result};
use crate::graph::{AutoLinker, LinkGraph, MANUAL_STRENGTH};
use crate::search::query_terms;
use crate::types::*;

/// Durable chunk storage with an auto-maintained link graph
#[derive(Clone)]
pub struct ChunkStore {
    storage: Storage,
    graph: Arc<RwLock<LinkGraph>>,
    linker: AutoLinker,
}

impl ChunkStore {
    /// Open the store described by `config`, rebuilding the link graph
    pub fn open(config: &MeridianConfig) -> Result<Self> {
        let storage = Storage::open(config.storage.clone())?;
        Self::with_storage(storage, config.linker.clone())
    }

    /// Ephemeral store with default settings
    pub fn open_in_memory() -> Result<Self> {
        Self::with_storage(Storage::open_in_memory()?, LinkerConfig::default())
    }

    pub fn with_storage(storage: Storage, linker: LinkerConfig) -> Result<Self> {
        let links = storage.with_connection(queries::load_links)?;
        let graph = LinkGraph::from_links(links);

        tracing::debug!(
            db_path = storage.db_path(),
            edges = graph.edge_count(),
            "Link graph rebuilt"
        );

        Ok(Self {
            storage,
            graph: Arc::new(RwLock::new(graph)),
            linker: AutoLinker::new(linker),
        })
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Create a chunk and run the auto-linker over it, atomically
    pub fn create(&self, input: CreateChunkInput) -> Result<Chunk> {
        if input.content.trim().is_empty() {
            return Err(MeridianError::InvalidInput(
                "Chunk content cannot be empty".into(),
            ));
        }

        let confidence = match input.confidence {
            Some(c) => validate_confidence(c).map_err(MeridianError::InvalidInput)?,
            None => self.storage.config().default_confidence,
        };

        let now = Utc::now();
        let created_at = input.created_at.unwrap_or(now);
        let mut chunk = Chunk {
            id: generate_chunk_id(created_at),
            content: input.content,
            chunk_type: input.chunk_type,
            metadata: ChunkMetadata {
                created_at,
                updated_at: created_at,
                confidence,
                source: input.source.unwrap_or_else(|| "conversation".to_string()),
                conversation_id: input.conversation_id.filter(|c| !c.trim().is_empty()),
                access_count: 0,
                last_accessed_at: None,
                content_hash: String::new(),
                deleted_at: None,
            },
            tags: normalize_tags(&input.tags),
            links: ChunkLinks::new(),
        };
        chunk.metadata.content_hash = queries::compute_content_hash(&chunk.content);

        let mut graph = self.graph.write();

        let (chunk, created_links) = self.storage.with_transaction(|conn| {
            queries::insert_chunk(conn, &chunk)?;

            let planned = self.linker.link_on_create(conn, &chunk)?;
            let mut created = Vec::with_capacity(planned.len());
            // Reverse edges land on existing records, grouped so each is rewritten once
            let mut touched: BTreeMap<ChunkId, Vec<(LinkType, ChunkId)>> = BTreeMap::new();

            for link in planned {
                if !queries::insert_link(conn, &link)? {
                    continue;
                }
                if link.from_id == chunk.id {
                    chunk.links.insert(link.link_type, &link.to_id);
                } else {
                    touched
                        .entry(link.from_id.clone())
                        .or_default()
                        .push((link.link_type, link.to_id.clone()));
                }
                created.push(link);
            }

            queries::save_chunk(conn, &chunk)?;

            for (id, additions) in touched {
                let mut target = queries::load_active_chunk(conn, &id)?;
                for (link_type, to) in additions {
                    target.links.insert(link_type, &to);
                }
                queries::save_chunk(conn, &target)?;
            }

            Ok((chunk, created))
        })?;

        let count = |t: LinkType| {
            created_links
                .iter()
                .filter(|l| l.from_id == chunk.id && l.link_type == t)
                .count()
        };
        tracing::info!(
            chunk_id = %chunk.id,
            context = count(LinkType::ContextOf),
            follows = count(LinkType::Follows),
            related = count(LinkType::RelatedTo),
            "Auto-linked chunk"
        );

        for link in created_links {
            graph.add_link(link);
        }

        Ok(chunk)
    }

    /// Get an active chunk, tracking the access
    pub fn get(&self, id: &str) -> Result<Chunk> {
        check_id(id)?;
        self.storage.with_transaction(|conn| {
            let mut chunk = queries::load_active_chunk(conn, id)?;
            queries::record_access(conn, &mut chunk, Utc::now())?;
            Ok(chunk)
        })
    }

    /// Get an active chunk without touching access metadata
    pub fn peek(&self, id: &str) -> Result<Option<Chunk>> {
        check_id(id)?;
        self.storage
            .with_connection(|conn| Ok(queries::lookup_chunk(conn, id)?.found()))
    }

    /// Look a chunk up, telling soft-deleted and unknown ids apart
    pub fn lookup(&self, id: &str) -> Result<ChunkLookup> {
        check_id(id)?;
        self.storage
            .with_connection(|conn| queries::lookup_chunk(conn, id))
    }

    /// Like `lookup`, but counts an access when the chunk is found
    pub fn read(&self, id: &str) -> Result<ChunkLookup> {
        check_id(id)?;
        self.storage.with_transaction(|conn| {
            let lookup = queries::lookup_chunk(conn, id)?;
            if let ChunkLookup::Found(mut chunk) = lookup {
                queries::record_access(conn, &mut chunk, Utc::now())?;
                return Ok(ChunkLookup::Found(chunk));
            }
            Ok(lookup)
        })
    }

    /// Edit content and metadata; identity and links are preserved
    pub fn update(&self, id: &str, input: UpdateChunkInput) -> Result<Chunk> {
        check_id(id)?;

        if let Some(content) = &input.content {
            if content.trim().is_empty() {
                return Err(MeridianError::InvalidInput(
                    "Chunk content cannot be empty".into(),
                ));
            }
        }
        let confidence = input
            .confidence
            .map(validate_confidence)
            .transpose()
            .map_err(MeridianError::InvalidInput)?;

        let _graph = self.graph.write();

        let chunk = self.storage.with_transaction(|conn| {
            let mut chunk = queries::load_active_chunk(conn, id)?;
            let mut reindex = false;

            if let Some(content) = input.content {
                chunk.metadata.content_hash = queries::compute_content_hash(&content);
                chunk.content = content;
                reindex = true;
            }
            if let Some(chunk_type) = input.chunk_type {
                chunk.chunk_type = chunk_type;
            }
            if let Some(tags) = input.tags {
                chunk.tags = normalize_tags(&tags);
                queries::replace_tags(conn, id, &chunk.tags)?;
                reindex = true;
            }
            if let Some(confidence) = confidence {
                chunk.metadata.confidence = confidence;
            }
            if let Some(source) = input.source {
                chunk.metadata.source = source;
            }
            chunk.metadata.updated_at = Utc::now();

            if reindex {
                queries::replace_terms(conn, id, &chunk.content, &chunk.tags)?;
            }
            queries::save_chunk(conn, &chunk)?;
            Ok(chunk)
        })?;

        tracing::debug!(chunk_id = %id, "Updated chunk");
        Ok(chunk)
    }

    /// Move a chunk out of the active index; links pointing at it remain
    pub fn soft_delete(&self, id: &str) -> Result<()> {
        check_id(id)?;
        let _graph = self.graph.write();
        self.storage
            .with_transaction(|conn| queries::soft_delete_chunk(conn, id, Utc::now()))?;
        tracing::info!(chunk_id = %id, "Soft-deleted chunk");
        Ok(())
    }

    /// Token-overlap search; same query and store state give the same order
    pub fn search_by_keyword(&self, query: &str, limit: usize) -> Result<Vec<ChunkId>> {
        let terms = query_terms(query);
        self.storage
            .with_connection(|conn| queries::search_terms(conn, &terms, limit))
    }

    pub fn list_by_tag<S: AsRef<str>>(
        &self,
        tags: &[S],
        mode: TagMatch,
        limit: usize,
    ) -> Result<Vec<ChunkId>> {
        let tags = normalize_tags(tags);
        self.storage
            .with_connection(|conn| queries::list_by_tags(conn, &tags, mode, limit))
    }

    /// Active chunks in creation order
    pub fn list(&self, conversation_id: Option<&str>, limit: usize) -> Result<Vec<Chunk>> {
        self.storage
            .with_connection(|conn| queries::list_chunks(conn, conversation_id, limit))
    }

    /// Assert a `supports` or `contradicts` link between two active chunks
    pub fn add_manual_link(
        &self,
        from_id: &str,
        to_id: &str,
        link_type: LinkType,
        reason: Option<String>,
    ) -> Result<Link> {
        check_id(from_id)?;
        check_id(to_id)?;

        if link_type.is_auto() {
            return Err(MeridianError::InvalidInput(format!(
                "'{}' links are derived automatically; manual links must be supports or contradicts",
                link_type
            )));
        }
        if from_id == to_id {
            return Err(MeridianError::InvalidInput(
                "A chunk cannot link to itself".into(),
            ));
        }

        let link = Link {
            from_id: from_id.to_string(),
            to_id: to_id.to_string(),
            link_type,
            strength: MANUAL_STRENGTH,
            origin: LinkOrigin::Manual,
            reason,
            created_at: Utc::now(),
        };

        let mut graph = self.graph.write();

        let inserted = self.storage.with_transaction(|conn| {
            let mut source = queries::load_active_chunk(conn, from_id)?;
            queries::load_active_chunk(conn, to_id)?;

            if !queries::insert_link(conn, &link)? {
                return Ok(false);
            }
            source.links.insert(link_type, to_id);
            queries::save_chunk(conn, &source)?;
            Ok(true)
        })?;

        if inserted {
            graph.add_link(link.clone());
            tracing::info!(from = %from_id, to = %to_id, link_type = %link_type, "Added manual link");
        }

        Ok(link)
    }

    /// Ids one hop away along outgoing links
    pub fn get_linked(&self, id: &str, link_type: Option<LinkType>) -> Vec<ChunkId> {
        self.graph.read().get_outgoing(id, link_type)
    }

    /// Ids whose links point at `id`
    pub fn get_incoming(&self, id: &str, link_type: Option<LinkType>) -> Vec<ChunkId> {
        self.graph.read().get_incoming(id, link_type)
    }

    pub fn links_of(&self, id: &str) -> Vec<Link> {
        self.graph.read().get_links(id).to_vec()
    }

    pub fn traverse(
        &self,
        starts: &[ChunkId],
        max_nodes: usize,
        order: TraversalOrder,
        types: Option<&[LinkType]>,
    ) -> Vec<ChunkId> {
        self.graph.read().traverse(starts, max_nodes, order, types)
    }

    pub fn get_path(&self, from: &str, to: &str, types: Option<&[LinkType]>) -> Option<Vec<ChunkId>> {
        self.graph.read().get_path(from, to, types)
    }

    /// Whether the record's `links` field matches the graph's forward index
    pub fn links_consistent(&self, id: &str) -> Result<bool> {
        check_id(id)?;
        let graph = self.graph.read();
        let record = self
            .storage
            .with_connection(|conn| queries::load_chunk(conn, id))?
            .ok_or_else(|| MeridianError::NotFound(id.to_string()))?;
        Ok(record.links == graph.outgoing_map(id))
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let mut stats = self.storage.with_connection(queries::get_stats)?;
        stats.storage_mode = self.storage.storage_mode().as_str().to_string();
        Ok(stats)
    }
}

fn check_id(id: &str) -> Result<()> {
    validate_chunk_id(id)
        .map(|_| ())
        .map_err(|e| MeridianError::InvalidChunkId {
            id: id.to_string(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;

    fn base_time() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 10, 0, 0).unwrap()
    }

    fn create(store: &ChunkStore, content: &str, tags: &[&str], conv: &str, minutes: i64) -> Chunk {
        store
            .create(
                CreateChunkInput::new(content)
                    .with_tags(tags)
                    .in_conversation(conv)
                    .created_at(base_time() + Duration::minutes(minutes)),
            )
            .unwrap()
    }

    #[test]
    fn test_create_assigns_identity() {
        let store = ChunkStore::open_in_memory().unwrap();
        let chunk = store
            .create(CreateChunkInput::new("Prefers tabs").with_type(ChunkType::Preference))
            .unwrap();

        assert!(validate_chunk_id(&chunk.id).is_ok());
        assert_eq!(chunk.metadata.confidence, 0.7);
        assert_eq!(chunk.metadata.content_hash, queries::compute_content_hash("Prefers tabs"));
        assert!(chunk.links.is_empty());
        assert!(store.create(CreateChunkInput::new("   ")).is_err());
        assert!(store
            .create(CreateChunkInput::new("x").with_confidence(1.5))
            .is_err());
    }

    #[test]
    fn test_scenario_links() {
        let store = ChunkStore::open_in_memory().unwrap();
        let c1 = create(&store, "pytest fixtures", &["python", "testing"], "k", 0);
        let c2 = create(&store, "tkinter layout", &["python", "ui"], "k", 2);

        assert_eq!(c2.links.get(LinkType::ContextOf), &[c1.id.clone()]);
        assert_eq!(c2.links.get(LinkType::Follows), &[c1.id.clone()]);
        assert!(c2.links.get(LinkType::RelatedTo).is_empty());

        let c1 = store.peek(&c1.id).unwrap().unwrap();
        assert_eq!(c1.links.get(LinkType::ContextOf), &[c2.id.clone()]);
        assert!(c1.links.get(LinkType::Follows).is_empty());
        assert_eq!(store.get_incoming(&c1.id, Some(LinkType::Follows)), vec![c2.id.clone()]);
        assert!(store.links_consistent(&c1.id).unwrap());
        assert!(store.links_consistent(&c2.id).unwrap());
    }

    #[test]
    fn test_related_to_needs_two_shared_tags() {
        let store = ChunkStore::open_in_memory().unwrap();
        let a = create(&store, "a", &["rust", "async", "tokio"], "one", 0);
        let b = create(&store, "b", &["rust", "async"], "two", 60);

        assert_eq!(store.get_linked(&b.id, Some(LinkType::RelatedTo)), vec![a.id.clone()]);
        assert_eq!(store.get_linked(&a.id, Some(LinkType::RelatedTo)), vec![b.id.clone()]);
        assert!(store.get_linked(&b.id, Some(LinkType::ContextOf)).is_empty());

        let strength = store
            .links_of(&b.id)
            .into_iter()
            .find(|l| l.link_type == LinkType::RelatedTo)
            .unwrap()
            .strength;
        assert!((strength - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_follows_only_most_recent_predecessor() {
        let store = ChunkStore::open_in_memory().unwrap();
        let _a = create(&store, "a", &[], "k", 0);
        let b = create(&store, "b", &[], "k", 1);
        let c = create(&store, "c", &[], "k", 2);

        assert_eq!(c.links.get(LinkType::Follows), &[b.id.clone()]);
        assert_eq!(c.links.get(LinkType::ContextOf).len(), 2);
    }

    #[test]
    fn test_get_tracks_access_peek_does_not() {
        let store = ChunkStore::open_in_memory().unwrap();
        let chunk = store.create(CreateChunkInput::new("hello")).unwrap();

        store.peek(&chunk.id).unwrap();
        store.get(&chunk.id).unwrap();
        let fetched = store.get(&chunk.id).unwrap();
        assert_eq!(fetched.metadata.access_count, 2);
        assert!(fetched.metadata.last_accessed_at.is_some());
    }

    #[test]
    fn test_update_preserves_identity_and_links() {
        let store = ChunkStore::open_in_memory().unwrap();
        let a = create(&store, "first note", &["x"], "k", 0);
        let b = create(&store, "second note", &["x"], "k", 1);

        let updated = store
            .update(
                &b.id,
                UpdateChunkInput {
                    content: Some("rewritten text".into()),
                    tags: Some(vec!["Y".into()]),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(updated.id, b.id);
        assert_eq!(updated.tags, vec!["y"]);
        assert_eq!(updated.links, b.links);
        assert_eq!(store.search_by_keyword("rewritten", 10).unwrap(), vec![b.id.clone()]);
        assert!(store.search_by_keyword("second", 10).unwrap().is_empty());
        assert!(store.links_consistent(&a.id).unwrap());
    }

    #[test]
    fn test_soft_delete_keeps_links() {
        let store = ChunkStore::open_in_memory().unwrap();
        let a = create(&store, "alpha", &[], "k", 0);
        let b = create(&store, "beta", &[], "k", 1);

        store.soft_delete(&a.id).unwrap();

        assert_eq!(store.lookup(&a.id).unwrap(), ChunkLookup::Inactive(a.id.clone()));
        assert!(store.get(&a.id).unwrap_err().is_not_found());
        assert!(store.soft_delete(&a.id).unwrap_err().is_not_found());
        assert_eq!(store.get_linked(&b.id, Some(LinkType::ContextOf)), vec![a.id.clone()]);

        // Deleted chunks are no longer link candidates
        let c = create(&store, "gamma", &[], "k", 2);
        assert_eq!(c.links.get(LinkType::ContextOf), &[b.id.clone()]);
    }

    #[test]
    fn test_invalid_ids_rejected_before_storage() {
        let store = ChunkStore::open_in_memory().unwrap();
        let err = store.get("../../etc/passwd").unwrap_err();
        assert!(matches!(err, MeridianError::InvalidChunkId { .. }));
        assert_eq!(
            store.lookup("chunk-unknown").unwrap(),
            ChunkLookup::Missing("chunk-unknown".into())
        );
    }

    #[test]
    fn test_manual_links() {
        let store = ChunkStore::open_in_memory().unwrap();
        let a = store.create(CreateChunkInput::new("claim")).unwrap();
        let b = store.create(CreateChunkInput::new("evidence")).unwrap();

        let link = store
            .add_manual_link(&b.id, &a.id, LinkType::Supports, Some("benchmark".into()))
            .unwrap();
        assert_eq!(link.origin, LinkOrigin::Manual);
        assert_eq!(store.get_linked(&b.id, Some(LinkType::Supports)), vec![a.id.clone()]);
        assert!(store.get_linked(&a.id, None).is_empty());
        assert_eq!(store.get_incoming(&a.id, None), vec![b.id.clone()]);
        assert!(store.links_consistent(&b.id).unwrap());

        assert!(store
            .add_manual_link(&b.id, &a.id, LinkType::RelatedTo, None)
            .is_err());
        assert!(store
            .add_manual_link(&b.id, "chunk-missing", LinkType::Contradicts, None)
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_graph_rebuilt_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = MeridianConfig::default();
        config.storage.db_path = dir.path().join("chunks.db").to_string_lossy().to_string();

        let (a, b) = {
            let store = ChunkStore::open(&config).unwrap();
            let a = create(&store, "one", &["p", "q"], "k", 0);
            let b = create(&store, "two", &["p", "q"], "k", 1);
            (a, b)
        };

        let store = ChunkStore::open(&config).unwrap();
        assert_eq!(
            store.get_linked(&b.id, None),
            vec![a.id.clone()]
        );
        assert_eq!(store.links_of(&b.id).len(), 3);
        assert_eq!(
            store.traverse(&[a.id.clone()], 10, TraversalOrder::BreadthFirst, None),
            vec![a.id.clone(), b.id.clone()]
        );
        assert!(store.links_consistent(&a.id).unwrap());
    }

    #[test]
    fn test_list_and_stats() {
        let store = ChunkStore::open_in_memory().unwrap();
        let a = create(&store, "one", &["p"], "k", 0);
        let b = create(&store, "two", &["p"], "k", 1);
        create(&store, "three", &[], "other", 2);
        store.soft_delete(&b.id).unwrap();

        let listed: Vec<ChunkId> = store
            .list(Some("k"), 10)
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(listed, vec![a.id]);

        let stats = store.stats().unwrap();
        assert_eq!(stats.active_chunks, 2);
        assert_eq!(stats.deleted_chunks, 1);
        assert_eq!(stats.total_links, 3);
        assert_eq!(stats.partitions.get("2026-05"), Some(&2));
        assert_eq!(stats.storage_mode, "local");
    }

    #[test]
    fn test_concurrent_creates_keep_links_symmetric() {
        use std::collections::BTreeSet;

        let store = ChunkStore::open_in_memory().unwrap();
        let ids: Vec<ChunkId> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|worker| {
                    let store = &store;
                    scope.spawn(move || {
                        (0..15)
                            .map(|i| {
                                store
                                    .create(
                                        CreateChunkInput::new(format!("note {worker}-{i}"))
                                            .with_tags(&["a", "b"])
                                            .in_conversation("k"),
                                    )
                                    .unwrap()
                                    .id
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            workers
                .into_iter()
                .flat_map(|w| w.join().unwrap())
                .collect()
        });
        assert_eq!(ids.iter().collect::<BTreeSet<_>>().len(), 120);

        for id in &ids {
            assert!(store.links_consistent(id).unwrap(), "{id}");
            for link_type in [LinkType::ContextOf, LinkType::RelatedTo] {
                let outgoing: BTreeSet<_> = store.get_linked(id, Some(link_type)).into_iter().collect();
                let incoming: BTreeSet<_> = store.get_incoming(id, Some(link_type)).into_iter().collect();
                assert!(!outgoing.is_empty(), "{id} has no {link_type:?} links");
                assert_eq!(outgoing, incoming);
                for other in &outgoing {
                    assert!(store.get_linked(other, Some(link_type)).contains(id));
                }
            }
        }
    }
}
