//! Database migrations for Meridian

use rusqlite::Connection;

use crate::error::Result;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// Run all migrations
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    let current_version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    if current_version < 1 {
        migrate_v1(conn)?;
    }

    if current_version < SCHEMA_VERSION {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Initial schema (v1): chunk records, tags and the persisted link index
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- One self-contained JSON record per chunk, keyed by id
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            partition TEXT NOT NULL,
            record TEXT NOT NULL,
            chunk_type TEXT NOT NULL,
            conversation_id TEXT,
            created_at TEXT NOT NULL,
            created_ts INTEGER NOT NULL,
            active INTEGER NOT NULL DEFAULT 1
        );

        -- Bounded auto-linker scans: same conversation, ordered by time
        CREATE INDEX IF NOT EXISTS idx_chunks_conversation_time
            ON chunks(conversation_id, created_ts) WHERE active = 1;
        CREATE INDEX IF NOT EXISTS idx_chunks_created ON chunks(created_ts);
        CREATE INDEX IF NOT EXISTS idx_chunks_partition ON chunks(partition);

        CREATE TABLE IF NOT EXISTS chunk_tags (
            chunk_id TEXT NOT NULL,
            tag TEXT NOT NULL,
            PRIMARY KEY (chunk_id, tag),
            FOREIGN KEY (chunk_id) REFERENCES chunks(id) ON DELETE CASCADE
        );
        CREATE INDEX IF NOT EXISTS idx_chunk_tags_tag ON chunk_tags(tag);

        -- Forward edges; the reverse index is derived from to_id
        CREATE TABLE IF NOT EXISTS links (
            from_id TEXT NOT NULL,
            to_id TEXT NOT NULL,
            link_type TEXT NOT NULL,
            strength REAL NOT NULL DEFAULT 1.0,
            origin TEXT NOT NULL DEFAULT 'auto',
            reason TEXT,
            created_at TEXT NOT NULL,
            seq INTEGER NOT NULL,
            PRIMARY KEY (from_id, to_id, link_type)
        );
        CREATE INDEX IF NOT EXISTS idx_links_to ON links(to_id, link_type);
        CREATE INDEX IF NOT EXISTS idx_links_seq ON links(seq);

        INSERT INTO schema_version (version) VALUES (1);
        "#,
    )?;

    Ok(())
}

/// v2: inverted keyword index for token-overlap search
fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS chunk_terms (
            term TEXT NOT NULL,
            chunk_id TEXT NOT NULL,
            tf INTEGER NOT NULL DEFAULT 1,
            PRIMARY KEY (term, chunk_id),
            FOREIGN KEY (chunk_id) REFERENCES chunks(id) ON DELETE CASCADE
        );
        CREATE INDEX IF NOT EXISTS idx_chunk_terms_chunk ON chunk_terms(chunk_id);

        INSERT INTO schema_version (version) VALUES (2);
        "#,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }
}
