//! In-memory link graph over chunks
//!
//! Provides:
//! - Forward index (chunk -> link type -> targets) mirroring each record's `links`
//! - Reverse index keyed by `<type>_reverse` for "what points here" queries
//! - Breadth-first and depth-first traversal with a node budget
//! - Shortest path lookup
//!
//! The graph is a cache of the `links` table: it is rebuilt from storage when
//! a store opens and updated by the store after every committed write.

mod linker;

pub use linker::{
    follows_strength, related_strength, AutoLinker, LinkCandidates, CONTEXT_STRENGTH,
    MANUAL_STRENGTH,
};

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use crate::types::{ChunkId, ChunkLinks, Link, LinkType, TraversalOrder};

/// Bidirectional index of typed chunk relations
#[derive(Debug, Clone, Default)]
pub struct LinkGraph {
    /// Outgoing links per source, in insertion order
    outgoing: HashMap<ChunkId, Vec<Link>>,
    /// Incoming sources per target and link type, in insertion order
    incoming: HashMap<ChunkId, BTreeMap<LinkType, Vec<ChunkId>>>,
    edge_count: usize,
}

impl LinkGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from links in their original insertion order
    pub fn from_links<I: IntoIterator<Item = Link>>(links: I) -> Self {
        let mut graph = Self::new();
        for link in links {
            graph.add_link(link);
        }
        graph
    }

    /// Add a directed edge; returns false if the same typed edge exists
    pub fn add_link(&mut self, link: Link) -> bool {
        if self.contains(&link.from_id, &link.to_id, link.link_type) {
            return false;
        }

        self.incoming
            .entry(link.to_id.clone())
            .or_default()
            .entry(link.link_type)
            .or_default()
            .push(link.from_id.clone());
        self.outgoing
            .entry(link.from_id.clone())
            .or_default()
            .push(link);
        self.edge_count += 1;
        true
    }

    pub fn contains(&self, from: &str, to: &str, link_type: LinkType) -> bool {
        self.outgoing
            .get(from)
            .map(|links| {
                links
                    .iter()
                    .any(|l| l.to_id == to && l.link_type == link_type)
            })
            .unwrap_or(false)
    }

    /// Full outgoing links of a chunk
    pub fn get_links(&self, id: &str) -> &[Link] {
        self.outgoing.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Targets one hop away, optionally of one link type, without duplicates
    pub fn get_outgoing(&self, id: &str, link_type: Option<LinkType>) -> Vec<ChunkId> {
        let mut seen = HashSet::new();
        self.get_links(id)
            .iter()
            .filter(|l| link_type.map_or(true, |t| l.link_type == t))
            .filter(|l| seen.insert(l.to_id.as_str()))
            .map(|l| l.to_id.clone())
            .collect()
    }

    /// Sources pointing at a chunk, optionally of one link type
    pub fn get_incoming(&self, id: &str, link_type: Option<LinkType>) -> Vec<ChunkId> {
        let Some(by_type) = self.incoming.get(id) else {
            return vec![];
        };

        let mut seen = HashSet::new();
        by_type
            .iter()
            .filter(|(t, _)| link_type.map_or(true, |lt| **t == lt))
            .flat_map(|(_, sources)| sources.iter())
            .filter(|s| seen.insert(s.as_str()))
            .cloned()
            .collect()
    }

    /// Forward index for one chunk, shaped like a record's `links` field
    pub fn outgoing_map(&self, id: &str) -> ChunkLinks {
        let mut links = ChunkLinks::new();
        for link in self.get_links(id) {
            links.insert(link.link_type, &link.to_id);
        }
        links
    }

    /// Reverse index for one chunk, keyed by `<type>_reverse`
    pub fn incoming_map(&self, id: &str) -> BTreeMap<String, Vec<ChunkId>> {
        self.incoming
            .get(id)
            .map(|by_type| {
                by_type
                    .iter()
                    .map(|(t, sources)| (t.reverse_name(), sources.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn neighbours<'a>(
        &'a self,
        id: &str,
        types: Option<&'a [LinkType]>,
    ) -> impl Iterator<Item = &'a ChunkId> + 'a {
        self.get_links(id)
            .iter()
            .filter(move |l| types.map_or(true, |ts| ts.contains(&l.link_type)))
            .map(|l| &l.to_id)
    }

    /// Visit chunks reachable from `starts` along outgoing edges
    ///
    /// Start ids come first (deduplicated, in the order given), then
    /// neighbours in link insertion order. At most `max_nodes` ids are
    /// returned. The result depends only on the graph contents, so
    /// repeated calls on the same graph return the same sequence.
    pub fn traverse(
        &self,
        starts: &[ChunkId],
        max_nodes: usize,
        order: TraversalOrder,
        types: Option<&[LinkType]>,
    ) -> Vec<ChunkId> {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut result = Vec::new();

        if max_nodes == 0 {
            return result;
        }

        match order {
            TraversalOrder::BreadthFirst => {
                let mut queue: VecDeque<&str> = VecDeque::new();
                for start in starts {
                    if visited.insert(start.as_str()) {
                        queue.push_back(start.as_str());
                    }
                }

                while let Some(current) = queue.pop_front() {
                    result.push(current.to_string());
                    if result.len() >= max_nodes {
                        break;
                    }
                    for next in self.neighbours(current, types) {
                        if visited.insert(next.as_str()) {
                            queue.push_back(next.as_str());
                        }
                    }
                }
            }
            TraversalOrder::DepthFirst => {
                let mut stack: Vec<&str> = starts.iter().rev().map(String::as_str).collect();

                while let Some(current) = stack.pop() {
                    if !visited.insert(current) {
                        continue;
                    }
                    result.push(current.to_string());
                    if result.len() >= max_nodes {
                        break;
                    }
                    let next: Vec<&str> = self
                        .neighbours(current, types)
                        .map(String::as_str)
                        .filter(|n| !visited.contains(n))
                        .collect();
                    stack.extend(next.into_iter().rev());
                }
            }
        }

        result
    }

    /// Shortest path along outgoing edges, both endpoints included
    pub fn get_path(&self, from: &str, to: &str, types: Option<&[LinkType]>) -> Option<Vec<ChunkId>> {
        if from == to {
            return Some(vec![from.to_string()]);
        }

        let mut parent: HashMap<&str, &str> = HashMap::new();
        let mut queue = VecDeque::from([from]);
        parent.insert(from, from);

        while let Some(current) = queue.pop_front() {
            for next in self.neighbours(current, types) {
                if parent.contains_key(next.as_str()) {
                    continue;
                }
                parent.insert(next.as_str(), current);

                if next == to {
                    let mut path = vec![to.to_string()];
                    let mut node = current;
                    while node != from {
                        path.push(node.to_string());
                        node = parent[node];
                    }
                    path.push(from.to_string());
                    path.reverse();
                    return Some(path);
                }

                queue.push_back(next.as_str());
            }
        }

        None
    }

    /// Chunks with at least one outgoing or incoming edge
    pub fn node_count(&self) -> usize {
        let mut nodes: HashSet<&str> = self.outgoing.keys().map(String::as_str).collect();
        nodes.extend(self.incoming.keys().map(String::as_str));
        nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edge_count
    }

    pub fn is_empty(&self) -> bool {
        self.edge_count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LinkOrigin;
    use chrono::Utc;

    fn make_link(from: &str, to: &str, link_type: LinkType) -> Link {
        Link {
            from_id: from.to_string(),
            to_id: to.to_string(),
            link_type,
            strength: 1.0,
            origin: LinkOrigin::Auto,
            reason: None,
            created_at: Utc::now(),
        }
    }

    fn ids(v: &[&str]) -> Vec<ChunkId> {
        v.iter().map(|s| s.to_string()).collect()
    }

    /// a -> b, a -> c, b -> d, c -> d, d -> e
    fn diamond() -> LinkGraph {
        LinkGraph::from_links([
            make_link("a", "b", LinkType::RelatedTo),
            make_link("a", "c", LinkType::Follows),
            make_link("b", "d", LinkType::RelatedTo),
            make_link("c", "d", LinkType::RelatedTo),
            make_link("d", "e", LinkType::Supports),
        ])
    }

    #[test]
    fn test_add_link_dedupes() {
        let mut graph = LinkGraph::new();
        assert!(graph.add_link(make_link("a", "b", LinkType::ContextOf)));
        assert!(!graph.add_link(make_link("a", "b", LinkType::ContextOf)));
        assert!(graph.add_link(make_link("a", "b", LinkType::RelatedTo)));
        assert_eq!(graph.edge_count(), 2);
        assert_eq!(graph.get_outgoing("a", None), ids(&["b"]));
        assert_eq!(graph.get_incoming("b", Some(LinkType::RelatedTo)), ids(&["a"]));
    }

    #[test]
    fn test_incoming_map_uses_reverse_names() {
        let graph = diamond();
        let incoming = graph.incoming_map("d");
        assert_eq!(incoming.get("related_to_reverse"), Some(&ids(&["b", "c"])));
        assert!(graph.incoming_map("a").is_empty());
    }

    #[test]
    fn test_bfs_and_dfs_orders() {
        let graph = diamond();
        let starts = ids(&["a"]);
        assert_eq!(
            graph.traverse(&starts, 10, TraversalOrder::BreadthFirst, None),
            ids(&["a", "b", "c", "d", "e"])
        );
        assert_eq!(
            graph.traverse(&starts, 10, TraversalOrder::DepthFirst, None),
            ids(&["a", "b", "d", "e", "c"])
        );
    }

    #[test]
    fn test_traverse_respects_budget_and_filter() {
        let graph = diamond();
        let starts = ids(&["a"]);
        assert_eq!(
            graph.traverse(&starts, 2, TraversalOrder::BreadthFirst, None),
            ids(&["a", "b"])
        );
        assert_eq!(
            graph.traverse(&starts, 10, TraversalOrder::BreadthFirst, Some(&[LinkType::RelatedTo])),
            ids(&["a", "b", "d"])
        );
        assert!(graph.traverse(&starts, 0, TraversalOrder::DepthFirst, None).is_empty());
    }

    #[test]
    fn test_traverse_dedupes_starts() {
        let graph = diamond();
        assert_eq!(
            graph.traverse(&ids(&["d", "d", "zz"]), 10, TraversalOrder::BreadthFirst, None),
            ids(&["d", "zz", "e"])
        );
    }

    #[test]
    fn test_get_path() {
        let graph = diamond();
        assert_eq!(graph.get_path("a", "e", None), Some(ids(&["a", "b", "d", "e"])));
        assert_eq!(
            graph.get_path("a", "d", Some(&[LinkType::Follows, LinkType::RelatedTo])),
            Some(ids(&["a", "b", "d"]))
        );
        assert_eq!(graph.get_path("e", "a", None), None);
        assert_eq!(graph.get_path("a", "a", None), Some(ids(&["a"])));
    }
}
