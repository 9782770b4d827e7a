//! Automatic link generation on chunk creation
//!
//! Three independent passes, unioned:
//! - `context_of`: other active chunks of the same conversation (bidirectional)
//! - `follows`: the most recent predecessor(s) in the same conversation
//!   within the temporal window (directional, new -> older)
//! - `related_to`: chunks sharing at least `min_shared_tags` tags (bidirectional)
//!
//! Every candidate scan is an indexed, capped query; nothing walks the
//! whole store.

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;

use crate::config::LinkerConfig;
use crate::error::Result;
use crate::storage::queries;
use crate::types::{Chunk, ChunkId, Link, LinkOrigin, LinkType};

/// Strength of a `context_of` link
pub const CONTEXT_STRENGTH: f32 = 1.0;

/// Strength of a manual `supports`/`contradicts` link
pub const MANUAL_STRENGTH: f32 = 0.8;

/// Time-decayed strength of a `follows` link, floored at 0.3
pub fn follows_strength(elapsed: Duration, window: Duration) -> f32 {
    let window_secs = window.num_milliseconds().max(1) as f32 / 1000.0;
    let elapsed_secs = elapsed.num_milliseconds().abs() as f32 / 1000.0;
    (1.0 - elapsed_secs / window_secs).max(0.3)
}

/// Strength of a `related_to` link from the number of shared tags
pub fn related_strength(shared: usize) -> f32 {
    (0.3 + 0.2 * shared as f32).min(0.9)
}

/// Candidates gathered for one new chunk
#[derive(Debug, Clone, Default)]
pub struct LinkCandidates {
    /// Active chunks of the same conversation, newest first
    pub same_conversation: Vec<ChunkId>,
    /// Active chunks of the same conversation inside the window, newest first
    pub predecessors: Vec<(ChunkId, DateTime<Utc>)>,
    /// Active chunks with their shared tag count, most overlap first
    pub tag_overlaps: Vec<(ChunkId, usize)>,
}

/// Derives auto links for newly created chunks
#[derive(Debug, Clone, Default)]
pub struct AutoLinker {
    config: LinkerConfig,
}

impl AutoLinker {
    pub fn new(config: LinkerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LinkerConfig {
        &self.config
    }

    /// Run the bounded candidate scans for `chunk` against the store
    pub fn gather(&self, conn: &Connection, chunk: &Chunk) -> Result<LinkCandidates> {
        let limit = self.config.max_candidates;
        let mut candidates = LinkCandidates::default();

        if let Some(conversation_id) = chunk.metadata.conversation_id.as_deref() {
            candidates.same_conversation =
                queries::conversation_members(conn, conversation_id, &chunk.id, limit)?;

            let until = chunk.metadata.created_at;
            let since = until - self.config.temporal_window();
            candidates.predecessors = queries::recent_in_conversation(
                conn,
                conversation_id,
                &chunk.id,
                since,
                until,
                self.config.max_predecessors.min(limit),
            )?;
        }

        if self.config.min_shared_tags > 0 {
            candidates.tag_overlaps = queries::tag_neighbours(
                conn,
                &chunk.tags,
                &chunk.id,
                self.config.min_shared_tags,
                limit,
            )?;
        }

        Ok(candidates)
    }

    /// Turn candidates into directed links, both directions for bidirectional types
    pub fn plan(&self, chunk: &Chunk, candidates: &LinkCandidates) -> Vec<Link> {
        let now = Utc::now();
        let created = chunk.metadata.created_at;
        let window = self.config.temporal_window();
        let mut links = Vec::new();

        let both_ways = |links: &mut Vec<Link>, target: &str, link_type, strength| {
            links.push(auto_link(&chunk.id, target, link_type, strength, now));
            links.push(auto_link(target, &chunk.id, link_type, strength, now));
        };

        for target in &candidates.same_conversation {
            both_ways(&mut links, target.as_str(), LinkType::ContextOf, CONTEXT_STRENGTH);
        }

        for (target, target_created) in candidates
            .predecessors
            .iter()
            .filter(|(_, at)| *at <= created && created - *at <= window)
            .take(self.config.max_predecessors)
        {
            links.push(auto_link(
                &chunk.id,
                target,
                LinkType::Follows,
                follows_strength(created - *target_created, window),
                now,
            ));
        }

        for (target, shared) in &candidates.tag_overlaps {
            if *shared >= self.config.min_shared_tags.max(1) {
                both_ways(&mut links, target.as_str(), LinkType::RelatedTo, related_strength(*shared));
            }
        }

        links
    }

    /// Gather and plan in one go
    pub fn link_on_create(&self, conn: &Connection, chunk: &Chunk) -> Result<Vec<Link>> {
        let candidates = self.gather(conn, chunk)?;
        Ok(self.plan(chunk, &candidates))
    }
}

fn auto_link(from: &str, to: &str, link_type: LinkType, strength: f32, now: DateTime<Utc>) -> Link {
    Link {
        from_id: from.to_string(),
        to_id: to.to_string(),
        link_type,
        strength,
        origin: LinkOrigin::Auto,
        reason: None,
        created_at: now,
    }
}
