use crate::document::{DocumentCodec, IdStrategy};
use crate::error::{JotDbError, Result};
use crate::query::{self, CompiledQuery, Query};
use crate::schema;
use crate::txn;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// The main entry point. Owns the single engine connection, manages
/// collection lifecycle, and hands out collection handles for document
/// operations.
///
/// Concurrent callers share the connection behind a mutex: every public
/// operation acquires it, runs to completion, and releases it before
/// returning, so the lock is never held across caller suspension points.
pub struct Store {
    conn: Mutex<Connection>,
    codec: DocumentCodec,
    path: Option<PathBuf>,
}

impl Store {
    /// Open or create persistent storage at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)?;
        Self::initialize(conn, Some(path))
    }

    /// Open an ephemeral in-memory store.
    pub fn open_in_memory() -> Result<Self> {
        Self::initialize(Connection::open_in_memory()?, None)
    }

    fn initialize(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA foreign_keys=ON;
             PRAGMA busy_timeout=5000;",
        )?;
        Ok(Store {
            conn: Mutex::new(conn),
            codec: DocumentCodec::default(),
            path,
        })
    }

    /// Select how identifiers are generated for documents inserted without
    /// one. ULID is the default.
    pub fn with_id_strategy(mut self, strategy: IdStrategy) -> Self {
        self.codec = DocumentCodec::new(strategy);
        self
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // a poisoned lock means another caller panicked mid-operation; the
        // connection itself is still usable and any open transaction on it
        // was already rolled back on drop
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a collection, or open it if it already exists.
    pub fn create_collection(&self, name: &str) -> Result<Collection<'_>> {
        schema::ensure_table(&self.conn(), name)?;
        Ok(Collection {
            store: self,
            name: name.to_string(),
        })
    }

    /// Handle to an existing collection.
    pub fn collection(&self, name: &str) -> Result<Collection<'_>> {
        schema::validate_name(name)?;
        if !schema::table_exists(&self.conn(), name)? {
            return Err(JotDbError::CollectionNotFound(name.to_string()));
        }
        Ok(Collection {
            store: self,
            name: name.to_string(),
        })
    }

    /// Drop a collection and every document in it, irreversibly.
    pub fn drop_collection(&self, name: &str) -> Result<()> {
        schema::drop_table(&self.conn(), name)
    }

    /// Names of all collections, in lexical order.
    pub fn list_collections(&self) -> Result<Vec<String>> {
        schema::list_collections(&self.conn())
    }

    pub fn rename_collection(&self, old: &str, new: &str) -> Result<()> {
        let conn = self.conn();
        if !schema::table_exists(&conn, old)? {
            return Err(JotDbError::CollectionNotFound(old.to_string()));
        }
        schema::rename_table(&conn, old, new)
    }

    /// Close the store and delete its database file. In-memory stores just
    /// close.
    pub fn destroy(self) -> Result<()> {
        let Store { conn, path, .. } = self;
        let conn = conn.into_inner().unwrap_or_else(PoisonError::into_inner);
        conn.close().map_err(|(_, e)| JotDbError::Storage(e))?;
        if let Some(path) = path {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

/// How `Collection::update` rewrites matching documents.
#[derive(Debug, Clone)]
pub enum Update {
    /// Replace the entire payload; each document keeps its identifier.
    Replace(Value),
    /// RFC 7386 merge patch applied by the engine (`json_patch`): object
    /// fields merge recursively and a null field value removes that field.
    Merge(Value),
}

/// A named group of schema-less documents backed by one table.
pub struct Collection<'a> {
    store: &'a Store,
    name: String,
}

impl<'a> Collection<'a> {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn table(&self) -> String {
        schema::table_name(&self.name)
    }

    fn duplicate_key(&self, err: rusqlite::Error, id: &str) -> JotDbError {
        if let rusqlite::Error::SqliteFailure(e, _) = &err {
            if e.code == rusqlite::ErrorCode::ConstraintViolation {
                return JotDbError::DuplicateKey {
                    collection: self.name.clone(),
                    id: id.to_string(),
                };
            }
        }
        JotDbError::Storage(err)
    }

    /// Insert one document, returning its identifier.
    pub fn insert(&self, document: &Value) -> Result<String> {
        let (id, payload) = self.store.codec.encode(document)?;
        let sql = format!(r#"INSERT INTO "{}" (id, data) VALUES (?1, ?2)"#, self.table());
        let mut conn = self.store.conn();
        txn::run_atomic(&mut conn, |tx| {
            tx.execute(&sql, params![id, payload])
                .map_err(|e| self.duplicate_key(e, &id))?;
            Ok(())
        })?;
        Ok(id)
    }

    /// Insert a batch in one atomic unit. If any document fails to encode
    /// or collides on its identifier, nothing from the batch is applied and
    /// the error names the offending document.
    pub fn insert_many(&self, documents: &[Value]) -> Result<Vec<String>> {
        // encode everything up front so a doomed batch never reaches the engine
        let mut rows = Vec::with_capacity(documents.len());
        for document in documents {
            rows.push(self.store.codec.encode(document)?);
        }

        let sql = format!(r#"INSERT INTO "{}" (id, data) VALUES (?1, ?2)"#, self.table());
        let mut conn = self.store.conn();
        txn::run_atomic(&mut conn, |tx| {
            let mut stmt = tx.prepare_cached(&sql)?;
            for (id, payload) in &rows {
                stmt.execute(params![id, payload])
                    .map_err(|e| self.duplicate_key(e, id))?;
            }
            Ok(())
        })?;
        Ok(rows.into_iter().map(|(id, _)| id).collect())
    }

    /// Insert or replace by identifier. Returns the identifier.
    pub fn upsert(&self, document: &Value) -> Result<String> {
        let (id, payload) = self.store.codec.encode(document)?;
        let sql = format!(
            r#"INSERT OR REPLACE INTO "{}" (id, data) VALUES (?1, ?2)"#,
            self.table()
        );
        let mut conn = self.store.conn();
        txn::run_atomic(&mut conn, |tx| {
            tx.execute(&sql, params![id, payload])?;
            Ok(())
        })?;
        Ok(id)
    }

    /// Find documents matching `query`.
    ///
    /// The query is compiled immediately (unsupported operators and
    /// malformed paths fail here) but nothing executes until the cursor is
    /// first iterated, and iterating it again after [`Cursor::restart`]
    /// re-executes against the latest committed state.
    pub fn find(&self, query: impl Into<Query>) -> Result<Cursor<'a>> {
        let query: Query = query.into();
        let compiled = query.compile()?;
        Ok(Cursor {
            store: self.store,
            table: self.table(),
            compiled,
            projection: query.projection,
            buffer: None,
            failed: false,
        })
    }

    /// First document matching `query`, if any.
    pub fn find_one(&self, query: impl Into<Query>) -> Result<Option<Value>> {
        let query: Query = query.into();
        let mut cursor = self.find(query.limit(1))?;
        cursor.next().transpose()
    }

    /// Fetch a single document by identifier.
    pub fn get(&self, id: &str) -> Result<Value> {
        let sql = format!(r#"SELECT data FROM "{}" WHERE id = ?1"#, self.table());
        let conn = self.store.conn();
        let payload: Option<String> = conn
            .query_row(&sql, params![id], |row| row.get(0))
            .optional()?;
        match payload {
            Some(payload) => self.store.codec.decode(id, &payload),
            None => Err(JotDbError::DocumentNotFound {
                collection: self.name.clone(),
                id: id.to_string(),
            }),
        }
    }

    /// Fetch several documents by identifier, in identifier order. Missing
    /// identifiers are skipped.
    pub fn get_many(&self, ids: &[&str]) -> Result<Vec<Value>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            r#"SELECT id, data FROM "{}" WHERE id IN ({placeholders}) ORDER BY id"#,
            self.table()
        );
        let conn = self.store.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(ids.iter()), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut documents = Vec::new();
        for row in rows {
            let (id, payload) = row?;
            documents.push(self.store.codec.decode(&id, &payload)?);
        }
        Ok(documents)
    }

    /// Update all documents matching `query` with one atomic statement.
    /// Returns the number of documents affected.
    pub fn update(&self, query: impl Into<Query>, update: Update) -> Result<usize> {
        let query: Query = query.into();
        let compiled = query.compile()?;
        let (set_expr, payload) = match &update {
            Update::Replace(document) => (
                "data = ?, updated_at = datetime('now')",
                self.store.codec.encode_replacement(document),
            ),
            Update::Merge(patch) => (
                "data = json_patch(data, ?), updated_at = datetime('now')",
                self.store.codec.encode_patch(patch)?,
            ),
        };
        let sql = compiled.update_sql(&self.table(), set_expr);
        log::debug!("update: {sql}");

        let set_value = SqlValue::Text(payload);
        let mut conn = self.store.conn();
        txn::run_atomic(&mut conn, |tx| {
            let bound = std::iter::once(&set_value).chain(compiled.params.iter());
            Ok(tx.execute(&sql, params_from_iter(bound))?)
        })
    }

    /// Read-modify-write every document matching `query` inside one atomic
    /// unit, for updates that depend on the current value. The rewrite
    /// function receives each decoded document and returns its replacement;
    /// identifiers are preserved. The unit may re-run if the engine reports
    /// contention, so `rewrite` should be pure.
    pub fn update_with(
        &self,
        query: impl Into<Query>,
        mut rewrite: impl FnMut(Value) -> Value,
    ) -> Result<usize> {
        let query: Query = query.into();
        let compiled = query.compile()?;
        let select = compiled.select_sql(&self.table());
        let update = format!(
            r#"UPDATE "{}" SET data = ?1, updated_at = datetime('now') WHERE id = ?2"#,
            self.table()
        );

        let mut conn = self.store.conn();
        txn::run_atomic(&mut conn, |tx| {
            let mut rows = Vec::new();
            {
                let mut stmt = tx.prepare(&select)?;
                let mapped = stmt.query_map(params_from_iter(compiled.params.iter()), |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?;
                for row in mapped {
                    rows.push(row?);
                }
            }

            let mut stmt = tx.prepare_cached(&update)?;
            let mut count = 0;
            for (id, payload) in rows {
                let document = self.store.codec.decode(&id, &payload)?;
                let replacement = self.store.codec.encode_replacement(&rewrite(document));
                count += stmt.execute(params![replacement, id])?;
            }
            Ok(count)
        })
    }

    /// Delete all documents matching `query`; returns the count removed.
    pub fn delete(&self, query: impl Into<Query>) -> Result<usize> {
        let query: Query = query.into();
        let compiled = query.compile()?;
        let sql = compiled.delete_sql(&self.table());
        log::debug!("delete: {sql}");
        let mut conn = self.store.conn();
        txn::run_atomic(&mut conn, |tx| {
            Ok(tx.execute(&sql, params_from_iter(compiled.params.iter()))?)
        })
    }

    /// Delete one document by identifier. Returns whether it existed.
    pub fn remove(&self, id: &str) -> Result<bool> {
        let sql = format!(r#"DELETE FROM "{}" WHERE id = ?1"#, self.table());
        let mut conn = self.store.conn();
        let removed = txn::run_atomic(&mut conn, |tx| Ok(tx.execute(&sql, params![id])?))?;
        Ok(removed > 0)
    }

    /// Delete several documents by identifier; returns the count removed.
    pub fn remove_many(&self, ids: &[&str]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            r#"DELETE FROM "{}" WHERE id IN ({placeholders})"#,
            self.table()
        );
        let mut conn = self.store.conn();
        txn::run_atomic(&mut conn, |tx| {
            Ok(tx.execute(&sql, params_from_iter(ids.iter()))?)
        })
    }

    /// Number of documents in the collection.
    pub fn count(&self) -> Result<u64> {
        let sql = format!(r#"SELECT COUNT(*) FROM "{}""#, self.table());
        let conn = self.store.conn();
        let count: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Page through the collection in identifier order.
    pub fn list(&self, limit: u64, offset: u64) -> Result<Vec<Value>> {
        let sql = format!(
            r#"SELECT id, data FROM "{}" ORDER BY id LIMIT ?1 OFFSET ?2"#,
            self.table()
        );
        let conn = self.store.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![limit as i64, offset as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut documents = Vec::new();
        for row in rows {
            let (id, payload) = row?;
            documents.push(self.store.codec.decode(&id, &payload)?);
        }
        Ok(documents)
    }

    /// Index a document field path so filters and sorts on it use an index
    /// scan instead of a full scan.
    pub fn create_index(&self, field_path: &str) -> Result<()> {
        schema::create_index(&self.store.conn(), &self.name, field_path)
    }
}

/// A lazily-executed, restartable result sequence.
///
/// No statement runs until the first `next()`. Decoded rows are buffered at
/// that point so the connection lock is released before the caller consumes
/// them. A decode failure ends the sequence at the failing row. Dropping a
/// cursor that was never iterated performs no I/O, which is the
/// cancelled-before-execution case.
pub struct Cursor<'a> {
    store: &'a Store,
    table: String,
    compiled: CompiledQuery,
    projection: Option<Vec<String>>,
    buffer: Option<VecDeque<(String, String)>>,
    failed: bool,
}

impl Cursor<'_> {
    fn execute(&mut self) -> Result<VecDeque<(String, String)>> {
        let sql = self.compiled.select_sql(&self.table);
        log::debug!("find: {sql}");
        let conn = self.store.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(self.compiled.params.iter()), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut buffer = VecDeque::new();
        for row in rows {
            buffer.push_back(row?);
        }
        Ok(buffer)
    }

    /// Forget buffered rows so the next iteration re-executes the query and
    /// observes the latest committed state.
    pub fn restart(&mut self) {
        self.buffer = None;
        self.failed = false;
    }
}

impl Iterator for Cursor<'_> {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if self.buffer.is_none() {
            match self.execute() {
                Ok(buffer) => self.buffer = Some(buffer),
                Err(err) => {
                    self.failed = true;
                    return Some(Err(err));
                }
            }
        }

        let (id, payload) = self.buffer.as_mut()?.pop_front()?;
        let decoded = self.store.codec.decode(&id, &payload).map(|document| {
            match &self.projection {
                Some(fields) => query::project(&document, fields),
                None => document,
            }
        });
        if decoded.is_err() {
            self.failed = true;
        }
        Some(decoded)
    }
}
