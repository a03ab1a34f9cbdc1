// Schema manager - one backing table per collection, expression indexes

use crate::document::ID_FIELD;
use crate::error::{JotDbError, Result};
use crate::query;
use regex::Regex;
use rusqlite::{params, Connection};

/// Prefix distinguishing collection tables from anything else living in the
/// same database file.
pub(crate) const COLLECTION_PREFIX: &str = "col_";

const MAX_NAME_LEN: usize = 64;

/// Check a collection name: must start with a letter, then letters, digits,
/// `_` or `-`, at most 64 characters. Keeps the derived table name a safe,
/// quotable SQL identifier.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(JotDbError::InvalidName(format!(
            "collection name must be 1-{MAX_NAME_LEN} characters, got {:?}",
            name
        )));
    }
    let pattern = Regex::new(r"^[A-Za-z][A-Za-z0-9_-]*$").expect("name pattern is valid");
    if !pattern.is_match(name) {
        return Err(JotDbError::InvalidName(format!(
            "collection name must be alphanumeric with underscores or hyphens, got {name:?}"
        )));
    }
    Ok(())
}

/// Derive the backing table name for a collection.
pub(crate) fn table_name(collection: &str) -> String {
    format!("{COLLECTION_PREFIX}{collection}")
}

/// Create the backing table if absent. Idempotent; safe under concurrent
/// callers because the engine's DDL is atomic.
pub(crate) fn ensure_table(conn: &Connection, collection: &str) -> Result<()> {
    validate_name(collection)?;
    let table = table_name(collection);
    conn.execute_batch(&format!(
        r#"CREATE TABLE IF NOT EXISTS "{table}" (
            id TEXT PRIMARY KEY NOT NULL,
            data TEXT NOT NULL CHECK (json_valid(data)),
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );"#
    ))?;
    log::debug!("ensured table {table}");
    Ok(())
}

/// Drop the backing table and all rows in it. Idempotent.
pub(crate) fn drop_table(conn: &Connection, collection: &str) -> Result<()> {
    validate_name(collection)?;
    conn.execute_batch(&format!(r#"DROP TABLE IF EXISTS "{}";"#, table_name(collection)))?;
    Ok(())
}

pub(crate) fn table_exists(conn: &Connection, collection: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![table_name(collection)],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Names of all collections in the database, in lexical order.
pub(crate) fn list_collections(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master
         WHERE type = 'table' AND name LIKE 'col\\_%' ESCAPE '\\'
         ORDER BY name",
    )?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

    let mut names = Vec::new();
    for row in rows {
        let table = row?;
        names.push(table[COLLECTION_PREFIX.len()..].to_string());
    }
    Ok(names)
}

pub(crate) fn rename_table(conn: &Connection, old: &str, new: &str) -> Result<()> {
    validate_name(old)?;
    validate_name(new)?;
    conn.execute_batch(&format!(
        r#"ALTER TABLE "{}" RENAME TO "{}";"#,
        table_name(old),
        table_name(new)
    ))?;
    Ok(())
}

/// Create an index over a document field path, so filters and sorts on that
/// path become index scans. The index expression must textually match what
/// the query translator emits for the same path.
pub(crate) fn create_index(conn: &Connection, collection: &str, field_path: &str) -> Result<()> {
    if !table_exists(conn, collection)? {
        return Err(JotDbError::CollectionNotFound(collection.to_string()));
    }
    let json_path = match query::parse_path(field_path)? {
        // the identifier column is the primary key; nothing to do
        query::FieldRef::Id => {
            log::debug!("index on {ID_FIELD:?} skipped, already the primary key");
            return Ok(());
        }
        query::FieldRef::JsonPath(p) => p,
    };

    let table = table_name(collection);
    let index = format!(
        "idx_{table}_{}",
        field_path.replace(['.', '-'], "_")
    );
    conn.execute_batch(&format!(
        r#"CREATE INDEX IF NOT EXISTS "{index}" ON "{table}" (json_extract(data, '{json_path}'));"#
    ))?;
    log::debug!("ensured index {index} on {table} ({json_path})");
    Ok(())
}
