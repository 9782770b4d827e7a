//! Database queries for chunk records, tags, the keyword index and links

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::error::{MeridianError, Result};
use crate::search::term_frequencies;
use crate::types::*;

/// SHA256 of the exact content, used as an integrity check on load
pub fn compute_content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Parse a stored record, rejecting it when it no longer matches its key or hash
pub fn chunk_from_record(id: &str, record: &str) -> Result<Chunk> {
    let chunk: Chunk = serde_json::from_str(record)?;

    if chunk.id != id {
        return Err(MeridianError::Storage(format!(
            "corrupt record: row '{}' holds chunk '{}'",
            id, chunk.id
        )));
    }

    if compute_content_hash(&chunk.content) != chunk.metadata.content_hash {
        return Err(MeridianError::Storage(format!(
            "corrupt record: content hash mismatch for '{}'",
            id
        )));
    }

    Ok(chunk)
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

/// Insert a brand-new chunk record with its tag and term index rows
pub fn insert_chunk(conn: &Connection, chunk: &Chunk) -> Result<()> {
    let record = serde_json::to_string(chunk)?;

    conn.execute(
        "INSERT INTO chunks (id, partition, record, chunk_type, conversation_id,
                             created_at, created_ts, active)
         VALUES (?, ?, ?, ?, ?, ?, ?, 1)",
        params![
            chunk.id,
            partition_for(chunk.metadata.created_at),
            record,
            chunk.chunk_type.as_str(),
            chunk.metadata.conversation_id,
            chunk.metadata.created_at.to_rfc3339(),
            to_millis(chunk.metadata.created_at),
        ],
    )?;

    replace_tags(conn, &chunk.id, &chunk.tags)?;
    replace_terms(conn, &chunk.id, &chunk.content, &chunk.tags)?;

    Ok(())
}

/// Rewrite the JSON record and the columns derived from it
pub fn save_chunk(conn: &Connection, chunk: &Chunk) -> Result<()> {
    let record = serde_json::to_string(chunk)?;

    let changed = conn.execute(
        "UPDATE chunks SET record = ?, chunk_type = ?, active = ? WHERE id = ?",
        params![
            record,
            chunk.chunk_type.as_str(),
            chunk.is_active() as i32,
            chunk.id
        ],
    )?;

    if changed == 0 {
        return Err(MeridianError::NotFound(chunk.id.clone()));
    }

    Ok(())
}

pub fn replace_tags(conn: &Connection, chunk_id: &str, tags: &[String]) -> Result<()> {
    conn.execute("DELETE FROM chunk_tags WHERE chunk_id = ?", params![chunk_id])?;

    let mut stmt = conn.prepare_cached("INSERT OR IGNORE INTO chunk_tags (chunk_id, tag) VALUES (?, ?)")?;
    for tag in tags {
        stmt.execute(params![chunk_id, tag])?;
    }

    Ok(())
}

pub fn replace_terms(conn: &Connection, chunk_id: &str, content: &str, tags: &[String]) -> Result<()> {
    conn.execute("DELETE FROM chunk_terms WHERE chunk_id = ?", params![chunk_id])?;

    let mut stmt =
        conn.prepare_cached("INSERT INTO chunk_terms (term, chunk_id, tf) VALUES (?, ?, ?)")?;
    for (term, tf) in term_frequencies(content, tags) {
        stmt.execute(params![term, chunk_id, tf])?;
    }

    Ok(())
}

/// Load a record whether or not it is active
pub fn load_chunk(conn: &Connection, id: &str) -> Result<Option<Chunk>> {
    let record: Option<String> = conn
        .query_row(
            "SELECT record FROM chunks WHERE id = ?",
            params![id],
            |row| row.get(0),
        )
        .optional()?;

    record.map(|r| chunk_from_record(id, &r)).transpose()
}

/// Load a record, reporting soft-deleted and unknown ids distinctly
pub fn lookup_chunk(conn: &Connection, id: &str) -> Result<ChunkLookup> {
    Ok(match load_chunk(conn, id)? {
        Some(chunk) if chunk.is_active() => ChunkLookup::Found(Box::new(chunk)),
        Some(_) => ChunkLookup::Inactive(id.to_string()),
        None => ChunkLookup::Missing(id.to_string()),
    })
}

/// Load an active chunk or fail with `NotFound`
pub fn load_active_chunk(conn: &Connection, id: &str) -> Result<Chunk> {
    match load_chunk(conn, id)? {
        Some(chunk) if chunk.is_active() => Ok(chunk),
        _ => Err(MeridianError::NotFound(id.to_string())),
    }
}

/// Bump the access counter of a loaded chunk and persist it
pub fn record_access(conn: &Connection, chunk: &mut Chunk, now: DateTime<Utc>) -> Result<()> {
    chunk.metadata.access_count += 1;
    chunk.metadata.last_accessed_at = Some(now);
    save_chunk(conn, chunk)
}

/// Mark a chunk inactive; its index rows go, its link rows stay
pub fn soft_delete_chunk(conn: &Connection, id: &str, now: DateTime<Utc>) -> Result<()> {
    let mut chunk = load_active_chunk(conn, id)?;
    chunk.metadata.deleted_at = Some(now);
    chunk.metadata.updated_at = now;
    save_chunk(conn, &chunk)?;

    conn.execute("DELETE FROM chunk_terms WHERE chunk_id = ?", params![id])?;

    Ok(())
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Token-overlap search over the inverted index
///
/// Ranked by distinct terms matched, then summed term frequency, then
/// newest first, then id, so equal stores always give equal orderings.
pub fn search_terms(conn: &Connection, terms: &[String], limit: usize) -> Result<Vec<ChunkId>> {
    if terms.is_empty() || limit == 0 {
        return Ok(vec![]);
    }

    let sql = format!(
        "SELECT t.chunk_id, COUNT(*) AS matched, SUM(t.tf) AS freq, c.created_ts
         FROM chunk_terms t
         JOIN chunks c ON c.id = t.chunk_id
         WHERE c.active = 1 AND t.term IN ({})
         GROUP BY t.chunk_id
         ORDER BY matched DESC, freq DESC, c.created_ts DESC, t.chunk_id ASC
         LIMIT ?",
        placeholders(terms.len())
    );

    let mut values: Vec<rusqlite::types::Value> = terms
        .iter()
        .map(|t| rusqlite::types::Value::Text(t.clone()))
        .collect();
    values.push(rusqlite::types::Value::Integer(limit as i64));

    let mut stmt = conn.prepare(&sql)?;
    let ids = stmt
        .query_map(params_from_iter(values), |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<ChunkId>>>()?;

    Ok(ids)
}

/// Active chunks carrying any (or all) of `tags`
///
/// `Any` ranks by number of matching tags first; both modes then order
/// newest first with the id as tiebreaker.
pub fn list_by_tags(
    conn: &Connection,
    tags: &[String],
    mode: TagMatch,
    limit: usize,
) -> Result<Vec<ChunkId>> {
    if tags.is_empty() || limit == 0 {
        return Ok(vec![]);
    }

    let having = match mode {
        TagMatch::Any => String::new(),
        TagMatch::All => format!("HAVING matched = {}", tags.len()),
    };

    let sql = format!(
        "SELECT ct.chunk_id, COUNT(*) AS matched, c.created_ts
         FROM chunk_tags ct
         JOIN chunks c ON c.id = ct.chunk_id
         WHERE c.active = 1 AND ct.tag IN ({})
         GROUP BY ct.chunk_id
         {}
         ORDER BY matched DESC, c.created_ts DESC, ct.chunk_id ASC
         LIMIT ?",
        placeholders(tags.len()),
        having
    );

    let mut values: Vec<rusqlite::types::Value> = tags
        .iter()
        .map(|t| rusqlite::types::Value::Text(t.clone()))
        .collect();
    values.push(rusqlite::types::Value::Integer(limit as i64));

    let mut stmt = conn.prepare(&sql)?;
    let ids = stmt
        .query_map(params_from_iter(values), |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<ChunkId>>>()?;

    Ok(ids)
}

/// Active chunks in creation order, optionally within one conversation
pub fn list_chunks(
    conn: &Connection,
    conversation_id: Option<&str>,
    limit: usize,
) -> Result<Vec<Chunk>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, record FROM chunks
         WHERE active = 1 AND (?1 IS NULL OR conversation_id = ?1)
         ORDER BY created_ts ASC, id ASC
         LIMIT ?2",
    )?;

    let rows = stmt
        .query_map(params![conversation_id, limit as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    rows.iter()
        .map(|(id, record)| chunk_from_record(id, record))
        .collect()
}

/// Most recent active chunks of a conversation, newest first
pub fn conversation_members(
    conn: &Connection,
    conversation_id: &str,
    exclude_id: &str,
    limit: usize,
) -> Result<Vec<ChunkId>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id FROM chunks
         WHERE conversation_id = ? AND active = 1 AND id != ?
         ORDER BY created_ts DESC, id DESC
         LIMIT ?",
    )?;

    let ids = stmt
        .query_map(params![conversation_id, exclude_id, limit as i64], |row| {
            row.get(0)
        })?
        .collect::<rusqlite::Result<Vec<ChunkId>>>()?;

    Ok(ids)
}

/// Active chunks of a conversation created in `[since, until]`, newest first
pub fn recent_in_conversation(
    conn: &Connection,
    conversation_id: &str,
    exclude_id: &str,
    since: DateTime<Utc>,
    until: DateTime<Utc>,
    limit: usize,
) -> Result<Vec<(ChunkId, DateTime<Utc>)>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, created_ts FROM chunks
         WHERE conversation_id = ? AND active = 1 AND id != ?
           AND created_ts >= ? AND created_ts <= ?
         ORDER BY created_ts DESC, id DESC
         LIMIT ?",
    )?;

    let rows = stmt
        .query_map(
            params![
                conversation_id,
                exclude_id,
                to_millis(since),
                to_millis(until),
                limit as i64
            ],
            |row| Ok((row.get::<_, String>(0)?, from_millis(row.get(1)?))),
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(rows)
}

/// Active chunks sharing at least `min_shared` of `tags`, most overlap first
pub fn tag_neighbours(
    conn: &Connection,
    tags: &[String],
    exclude_id: &str,
    min_shared: usize,
    limit: usize,
) -> Result<Vec<(ChunkId, usize)>> {
    if tags.is_empty() || tags.len() < min_shared {
        return Ok(vec![]);
    }

    let sql = format!(
        "SELECT ct.chunk_id, COUNT(*) AS shared
         FROM chunk_tags ct
         JOIN chunks c ON c.id = ct.chunk_id
         WHERE c.active = 1 AND ct.chunk_id != ? AND ct.tag IN ({})
         GROUP BY ct.chunk_id
         HAVING shared >= ?
         ORDER BY shared DESC, c.created_ts DESC, ct.chunk_id ASC
         LIMIT ?",
        placeholders(tags.len())
    );

    let mut values: Vec<rusqlite::types::Value> =
        vec![rusqlite::types::Value::Text(exclude_id.to_string())];
    values.extend(tags.iter().map(|t| rusqlite::types::Value::Text(t.clone())));
    values.push(rusqlite::types::Value::Integer(min_shared.max(1) as i64));
    values.push(rusqlite::types::Value::Integer(limit as i64));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(values), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(rows)
}

/// Insert a link row; returns false when the same typed edge already exists
pub fn insert_link(conn: &Connection, link: &Link) -> Result<bool> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO links (from_id, to_id, link_type, strength, origin,
                                      reason, created_at, seq)
         VALUES (?, ?, ?, ?, ?, ?, ?, (SELECT COALESCE(MAX(seq), 0) + 1 FROM links))",
        params![
            link.from_id,
            link.to_id,
            link.link_type.as_str(),
            link.strength,
            link.origin.as_str(),
            link.reason,
            link.created_at.to_rfc3339(),
        ],
    )?;

    Ok(inserted > 0)
}

/// Every link in insertion order, for rebuilding the in-memory graph
pub fn load_links(conn: &Connection) -> Result<Vec<Link>> {
    let mut stmt = conn.prepare_cached(
        "SELECT from_id, to_id, link_type, strength, origin, reason, created_at
         FROM links ORDER BY seq ASC",
    )?;

    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    rows.into_iter()
        .map(|(from_id, to_id, link_type, strength, origin, reason, created_at)| {
            let link_type: LinkType = link_type.parse().map_err(MeridianError::Storage)?;
            Ok(Link {
                from_id,
                to_id,
                link_type,
                strength: strength as f32,
                origin: if origin == "manual" {
                    LinkOrigin::Manual
                } else {
                    LinkOrigin::Auto
                },
                reason,
                created_at: DateTime::parse_from_rfc3339(&created_at)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| MeridianError::Storage(format!("bad link timestamp: {}", e)))?,
            })
        })
        .collect()
}

/// Get store statistics
pub fn get_stats(conn: &Connection) -> Result<StoreStats> {
    let (active_chunks, deleted_chunks): (i64, i64) = conn.query_row(
        "SELECT COALESCE(SUM(active = 1), 0), COALESCE(SUM(active = 0), 0) FROM chunks",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    let total_links: i64 = conn.query_row("SELECT COUNT(*) FROM links", [], |row| row.get(0))?;

    let total_tags: i64 = conn.query_row(
        "SELECT COUNT(DISTINCT tag) FROM chunk_tags",
        [],
        |row| row.get(0),
    )?;

    let db_size_bytes: i64 = conn.query_row(
        "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
        [],
        |row| row.get(0),
    )?;

    let schema_version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    let mut partitions = BTreeMap::new();
    let mut stmt = conn.prepare_cached(
        "SELECT partition, COUNT(*) FROM chunks WHERE active = 1 GROUP BY partition",
    )?;
    for row in stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))? {
        let (partition, count) = row?;
        partitions.insert(partition, count);
    }

    let mut type_counts = BTreeMap::new();
    let mut stmt = conn.prepare_cached(
        "SELECT chunk_type, COUNT(*) FROM chunks WHERE active = 1 GROUP BY chunk_type",
    )?;
    for row in stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))? {
        let (chunk_type, count) = row?;
        type_counts.insert(chunk_type, count);
    }

    Ok(StoreStats {
        active_chunks,
        deleted_chunks,
        total_links,
        total_tags,
        db_size_bytes,
        storage_mode: String::new(),
        schema_version,
        partitions,
        type_counts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    fn make_chunk(id: &str, content: &str, tags: &[&str], conversation: Option<&str>, minute: u32) -> Chunk {
        let created_at = Utc.with_ymd_and_hms(2026, 5, 1, 10, minute, 0).unwrap();
        Chunk {
            id: id.to_string(),
            content: content.to_string(),
            chunk_type: ChunkType::Note,
            metadata: ChunkMetadata {
                created_at,
                updated_at: created_at,
                confidence: 0.7,
                source: "test".to_string(),
                conversation_id: conversation.map(str::to_string),
                access_count: 0,
                last_accessed_at: None,
                content_hash: compute_content_hash(content),
                deleted_at: None,
            },
            tags: normalize_tags(tags),
            links: ChunkLinks::new(),
        }
    }

    #[test]
    fn test_record_roundtrip_and_partition() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_transaction(|conn| {
                insert_chunk(conn, &make_chunk("chunk-a", "hello world", &["x"], None, 0))
            })
            .unwrap();

        storage
            .with_connection(|conn| {
                let chunk = load_chunk(conn, "chunk-a")?.unwrap();
                assert_eq!(chunk.content, "hello world");
                let partition: String = conn.query_row(
                    "SELECT partition FROM chunks WHERE id = 'chunk-a'",
                    [],
                    |r| r.get(0),
                )?;
                assert_eq!(partition, "2026-05");
                assert!(load_chunk(conn, "chunk-b")?.is_none());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_tampered_record_is_storage_fault() {
        let storage = Storage::open_in_memory().unwrap();
        let err = storage
            .with_transaction(|conn| {
                insert_chunk(conn, &make_chunk("chunk-a", "original", &[], None, 0))?;
                conn.execute(
                    "UPDATE chunks SET record = json_set(record, '$.content', 'edited')",
                    [],
                )?;
                load_chunk(conn, "chunk-a")
            })
            .unwrap_err();

        assert!(err.is_storage_fault());
        assert!(!err.is_not_found());
        assert!(err.to_string().contains("corrupt record"));
    }

    #[test]
    fn test_search_ranking_is_total() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_transaction(|conn| {
                insert_chunk(conn, &make_chunk("chunk-a", "rust async runtime", &[], None, 0))?;
                insert_chunk(conn, &make_chunk("chunk-b", "rust rust ownership", &[], None, 1))?;
                insert_chunk(conn, &make_chunk("chunk-c", "python async", &[], None, 2))?;
                insert_chunk(conn, &make_chunk("chunk-d", "rust async", &[], None, 2))?;
                Ok(())
            })
            .unwrap();

        let ids = storage
            .with_connection(|conn| {
                search_terms(conn, &["async".to_string(), "rust".to_string()], 10)
            })
            .unwrap();

        // a and d match both terms with equal frequency; d is newer
        assert_eq!(ids, vec!["chunk-d", "chunk-a", "chunk-b", "chunk-c"]);
    }

    #[test]
    fn test_tag_listing_modes() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_transaction(|conn| {
                insert_chunk(conn, &make_chunk("chunk-a", "a", &["python", "testing"], None, 0))?;
                insert_chunk(conn, &make_chunk("chunk-b", "b", &["python"], None, 1))?;
                insert_chunk(conn, &make_chunk("chunk-c", "c", &["ui"], None, 2))?;
                Ok(())
            })
            .unwrap();

        let tags = vec!["python".to_string(), "testing".to_string()];
        let (any, all) = storage
            .with_connection(|conn| {
                Ok((
                    list_by_tags(conn, &tags, TagMatch::Any, 10)?,
                    list_by_tags(conn, &tags, TagMatch::All, 10)?,
                ))
            })
            .unwrap();

        assert_eq!(any, vec!["chunk-a", "chunk-b"]);
        assert_eq!(all, vec!["chunk-a"]);
    }

    #[test]
    fn test_soft_delete_hides_from_indexes() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_transaction(|conn| {
                insert_chunk(conn, &make_chunk("chunk-a", "python", &["python"], Some("k"), 0))?;
                soft_delete_chunk(conn, "chunk-a", Utc::now())
            })
            .unwrap();

        storage
            .with_connection(|conn| {
                assert!(search_terms(conn, &["python".to_string()], 10)?.is_empty());
                assert!(list_by_tags(conn, &["python".to_string()], TagMatch::Any, 10)?.is_empty());
                assert!(conversation_members(conn, "k", "chunk-z", 10)?.is_empty());
                assert_eq!(lookup_chunk(conn, "chunk-a")?, ChunkLookup::Inactive("chunk-a".into()));
                assert!(load_active_chunk(conn, "chunk-a").unwrap_err().is_not_found());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_links_keep_insertion_order() {
        let storage = Storage::open_in_memory().unwrap();
        let link = |from: &str, to: &str, link_type| Link {
            from_id: from.to_string(),
            to_id: to.to_string(),
            link_type,
            strength: 1.0,
            origin: LinkOrigin::Auto,
            reason: None,
            created_at: Utc::now(),
        };

        storage
            .with_transaction(|conn| {
                assert!(insert_link(conn, &link("chunk-b", "chunk-a", LinkType::Follows))?);
                assert!(insert_link(conn, &link("chunk-b", "chunk-a", LinkType::ContextOf))?);
                assert!(!insert_link(conn, &link("chunk-b", "chunk-a", LinkType::Follows))?);
                Ok(())
            })
            .unwrap();

        let links = storage.with_connection(load_links).unwrap();
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].link_type, LinkType::Follows);
        assert_eq!(links[1].link_type, LinkType::ContextOf);
    }
}
