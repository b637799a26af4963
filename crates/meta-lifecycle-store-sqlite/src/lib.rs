//! `DocumentStore` on SQLite.
//!
//! Each collection is a table of JSON documents (`doc_<collection>`), and each
//! index is a SQLite expression index over `json_extract` paths. Index
//! definitions and access counters live in bookkeeping tables next to them.

#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::cell::Cell;
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use meta_lifecycle_core::{
    format_rfc3339, now_utc, validate_field_path, validate_identifier, CollectionStats,
    DatabaseStats, DocumentStore, FieldAgreement, Filter, ForeignKey, IndexKey, IndexOptions,
    IndexSpec, IndexUsage, StoreError, Update, PRIMARY_INDEX_NAME,
};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension};
use serde_json::Value;
use tracing::{debug, info};

const STORE_SCHEMA_VERSION: i64 = 1;

const SCHEMA_STORE_V1: &str = r"
CREATE TABLE IF NOT EXISTS store_collections (
  name TEXT PRIMARY KEY,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS store_indexes (
  collection TEXT NOT NULL,
  name TEXT NOT NULL,
  keys_json TEXT NOT NULL CHECK (json_valid(keys_json)),
  is_unique INTEGER NOT NULL CHECK (is_unique IN (0, 1)),
  is_sparse INTEGER NOT NULL CHECK (is_sparse IN (0, 1)),
  created_at TEXT NOT NULL,
  PRIMARY KEY (collection, name),
  FOREIGN KEY (collection) REFERENCES store_collections(name)
);

CREATE TABLE IF NOT EXISTS store_index_usage (
  collection TEXT NOT NULL,
  name TEXT NOT NULL,
  ops INTEGER NOT NULL DEFAULT 0 CHECK (ops >= 0),
  since TEXT NOT NULL,
  PRIMARY KEY (collection, name)
);
";

/// Where the database lives, parsed from a connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    Memory,
    File(PathBuf),
}

impl StoreLocation {
    /// Accepts `sqlite://<path>`, `sqlite:<path>`, `sqlite::memory:`,
    /// `:memory:`, or a plain path.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(anyhow!("connection string MUST be non-empty"));
        }
        if matches!(raw, "sqlite::memory:" | ":memory:" | "sqlite://:memory:") {
            return Ok(Self::Memory);
        }

        let path = if let Some(rest) = raw.strip_prefix("sqlite://") {
            rest
        } else if let Some(rest) = raw.strip_prefix("sqlite:") {
            rest
        } else if let Some((scheme, _)) = raw.split_once("://") {
            return Err(anyhow!(
                "unsupported connection scheme {scheme:?}; expected sqlite://<path> or a file path"
            ));
        } else {
            raw
        };

        if path.is_empty() {
            return Err(anyhow!("connection string {raw:?} has no database path"));
        }
        Ok(Self::File(PathBuf::from(path)))
    }

    #[must_use]
    pub fn label(&self) -> String {
        match self {
            Self::Memory => ":memory:".to_string(),
            Self::File(path) => path.display().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    /// Create a collection on first index creation or insert.
    pub implicit_collections: bool,
    /// Count index hits by inspecting each query plan.
    pub track_index_usage: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self { implicit_collections: true, track_index_usage: true }
    }
}

pub struct SqliteDocumentStore {
    conn: Connection,
    label: String,
    options: StoreOptions,
    usage_paused: Cell<bool>,
}

impl SqliteDocumentStore {
    pub fn open(location: &StoreLocation) -> Result<Self> {
        let conn = match location {
            StoreLocation::Memory => {
                Connection::open_in_memory().context("failed to open in-memory sqlite database")?
            }
            StoreLocation::File(path) => Connection::open(path)
                .with_context(|| format!("failed to open sqlite database at {}", path.display()))?,
        };

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self {
            conn,
            label: location.label(),
            options: StoreOptions::default(),
            usage_paused: Cell::new(false),
        })
    }

    /// Parses `connection_string`, opens the database, and applies the store
    /// schema.
    pub fn connect(connection_string: &str) -> Result<Self> {
        let location = StoreLocation::parse(connection_string)?;
        let store = Self::open(&location)?;
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let store = Self::open(&StoreLocation::Memory)?;
        store.migrate()?;
        Ok(store)
    }

    #[must_use]
    pub fn with_options(mut self, options: StoreOptions) -> Self {
        self.options = options;
        self
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_STORE_V1)
            .context("failed to apply document store schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![STORE_SCHEMA_VERSION, now],
            )
            .context("failed to register document store schema")?;

        Ok(())
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    fn collection_registered(&self, collection: &str) -> Result<bool, StoreError> {
        let table = table_name(collection)?;
        let found = self
            .conn
            .query_row(
                "SELECT 1
                 FROM store_collections c
                 JOIN sqlite_master m ON m.type = 'table' AND m.name = ?2
                 WHERE c.name = ?1
                 LIMIT 1",
                params![collection, table],
                |_| Ok(()),
            )
            .optional()
            .map_err(|err| backend("failed to query store_collections", &err))?
            .is_some();
        Ok(found)
    }

    fn require_collection(&self, collection: &str) -> Result<String, StoreError> {
        if self.collection_registered(collection)? {
            table_name(collection)
        } else {
            Err(StoreError::CollectionMissing(collection.to_string()))
        }
    }

    /// Creates the collection on demand when the store allows it.
    fn writable_collection(&self, collection: &str) -> Result<String, StoreError> {
        if !self.collection_registered(collection)? {
            if !self.options.implicit_collections {
                return Err(StoreError::CollectionMissing(collection.to_string()));
            }
            self.create_collection(collection)?;
        }
        table_name(collection)
    }

    /// Registered index whose physical SQLite index still exists.
    fn stored_index(&self, collection: &str, name: &str) -> Result<Option<IndexSpec>, StoreError> {
        self.stored_indexes(collection).map(|indexes| {
            indexes.into_iter().find(|index| index.name() == name)
        })
    }

    fn stored_indexes(&self, collection: &str) -> Result<Vec<IndexSpec>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT i.name, i.keys_json, i.is_unique, i.is_sparse
                 FROM store_indexes i
                 JOIN sqlite_master m
                   ON m.type = 'index' AND m.name = 'ix_' || i.collection || '__' || i.name
                 WHERE i.collection = ?1
                 ORDER BY i.rowid ASC",
            )
            .map_err(|err| backend("failed to prepare index listing", &err))?;
        let rows = stmt
            .query_map(params![collection], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)? == 1,
                    row.get::<_, i64>(3)? == 1,
                ))
            })
            .map_err(|err| backend("failed to list indexes", &err))?;

        let mut indexes = Vec::new();
        for row in rows {
            let (name, keys_json, unique, sparse) =
                row.map_err(|err| backend("failed to read index row", &err))?;
            let keys: Vec<IndexKey> =
                serde_json::from_str(&keys_json).map_err(|err| StoreError::Backend(format!(
                    "stored keys for index {name} on {collection} are invalid: {err}"
                )))?;
            indexes.push(IndexSpec {
                collection: collection.to_string(),
                keys,
                options: IndexOptions { name, unique, sparse },
            });
        }
        Ok(indexes)
    }

    fn note_index_usage(&self, sql: &str, params: &[SqlValue]) -> Result<(), StoreError> {
        if !self.options.track_index_usage || self.usage_paused.get() {
            return Ok(());
        }

        let mut stmt = self
            .conn
            .prepare(&format!("EXPLAIN QUERY PLAN {sql}"))
            .map_err(|err| backend("failed to explain query", &err))?;
        let details = stmt
            .query_map(params_from_iter(params.iter()), |row| row.get::<_, String>(3))
            .map_err(|err| backend("failed to explain query", &err))?;

        let mut used = BTreeSet::new();
        for detail in details {
            let detail = detail.map_err(|err| backend("failed to read query plan", &err))?;
            used.extend(indexes_in_plan(&detail));
        }

        for (collection, name) in used {
            self.conn
                .execute(
                    "UPDATE store_index_usage SET ops = ops + 1 WHERE collection = ?1 AND name = ?2",
                    params![collection, name],
                )
                .map_err(|err| backend("failed to update index usage", &err))?;
        }
        Ok(())
    }

    fn count_sql(&self, sql: &str, params: &[SqlValue]) -> Result<u64, StoreError> {
        self.note_index_usage(sql, params)?;
        let count: i64 = self
            .conn
            .query_row(sql, params_from_iter(params.iter()), |row| row.get(0))
            .map_err(|err| backend("failed to count documents", &err))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

impl DocumentStore for SqliteDocumentStore {
    fn list_collections(&self) -> Result<Vec<String>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT c.name
                 FROM store_collections c
                 JOIN sqlite_master m ON m.type = 'table' AND m.name = 'doc_' || c.name
                 ORDER BY c.name ASC",
            )
            .map_err(|err| backend("failed to prepare collection listing", &err))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|err| backend("failed to list collections", &err))?;
        collect_rows(rows)
    }

    fn collection_exists(&self, collection: &str) -> Result<bool, StoreError> {
        self.collection_registered(collection)
    }

    fn create_collection(&self, collection: &str) -> Result<(), StoreError> {
        let table = table_name(collection)?;
        let now = timestamp()?;

        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(|err| backend("failed to start collection transaction", &err))?;
        tx.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS \"{table}\" (
               id INTEGER PRIMARY KEY AUTOINCREMENT,
               body TEXT NOT NULL CHECK (json_valid(body))
             );"
        ))
        .map_err(|err| backend("failed to create collection table", &err))?;
        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO store_collections(name, created_at) VALUES (?1, ?2)",
                params![collection, now],
            )
            .map_err(|err| backend("failed to register collection", &err))?;
        tx.commit()
            .map_err(|err| backend("failed to commit collection creation", &err))?;

        if inserted > 0 {
            info!(collection, "created collection");
        }
        Ok(())
    }

    fn create_index(&self, spec: &IndexSpec) -> Result<(), StoreError> {
        table_name(&spec.collection)?;
        validate_identifier("index", spec.name())
            .map_err(|err| StoreError::InvalidName(err.to_string()))?;
        if spec.keys.is_empty() {
            return Err(StoreError::InvalidName(format!("index {} declares no keys", spec.name())));
        }
        let table = self.writable_collection(&spec.collection)?;

        if let Some(existing) = self.stored_index(&spec.collection, spec.name())? {
            if existing.same_definition(spec) {
                return Ok(());
            }
            return Err(StoreError::IndexExists {
                collection: spec.collection.clone(),
                name: spec.name().to_string(),
                existing: existing.to_string(),
            });
        }

        let mut columns = Vec::with_capacity(spec.keys.len());
        for key in &spec.keys {
            columns.push(format!("{} {}", json_path("body", &key.field)?, key.direction.as_sql()));
        }
        let mut sql = format!(
            "CREATE {}INDEX \"{}\" ON \"{table}\" ({})",
            if spec.options.unique { "UNIQUE " } else { "" },
            sqlite_index_name(&spec.collection, spec.name()),
            columns.join(", ")
        );
        if spec.options.sparse {
            let mut present = Vec::with_capacity(spec.keys.len());
            for key in &spec.keys {
                present.push(format!("{} IS NOT NULL", json_type("body", &key.field)?));
            }
            let _ = write!(sql, " WHERE {}", present.join(" OR "));
        }

        let keys_json = serde_json::to_string(&spec.keys)
            .map_err(|err| StoreError::Backend(format!("failed to encode index keys: {err}")))?;
        let now = timestamp()?;

        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(|err| backend("failed to start index transaction", &err))?;
        tx.execute_batch(&sql).map_err(|err| {
            if is_constraint_violation(&err) {
                StoreError::DuplicateKey {
                    collection: spec.collection.clone(),
                    index: spec.name().to_string(),
                }
            } else {
                backend("failed to create index", &err)
            }
        })?;
        tx.execute(
            "INSERT OR REPLACE INTO store_indexes(collection, name, keys_json, is_unique, is_sparse, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                spec.collection,
                spec.name(),
                keys_json,
                i64::from(spec.options.unique),
                i64::from(spec.options.sparse),
                now
            ],
        )
        .map_err(|err| backend("failed to register index", &err))?;
        tx.execute(
            "INSERT OR REPLACE INTO store_index_usage(collection, name, ops, since) VALUES (?1, ?2, 0, ?3)",
            params![spec.collection, spec.name(), now],
        )
        .map_err(|err| backend("failed to initialize index usage", &err))?;
        tx.commit().map_err(|err| backend("failed to commit index creation", &err))?;

        debug!(
            collection = %spec.collection,
            index = spec.name(),
            sql = %sql,
            "created sqlite index"
        );
        Ok(())
    }

    fn list_indexes(&self, collection: &str) -> Result<Vec<IndexSpec>, StoreError> {
        self.require_collection(collection)?;
        let mut indexes = vec![IndexSpec::primary(collection)];
        indexes.extend(self.stored_indexes(collection)?);
        Ok(indexes)
    }

    fn count(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError> {
        if !self.collection_registered(collection)? {
            return Ok(0);
        }
        let table = table_name(collection)?;
        let clause = compile_filter(filter, "body")?;
        self.count_sql(
            &format!("SELECT COUNT(*) FROM \"{table}\" WHERE {}", clause.sql),
            &clause.params,
        )
    }

    fn find(
        &self,
        collection: &str,
        filter: &Filter,
        limit: Option<usize>,
    ) -> Result<Vec<Value>, StoreError> {
        if !self.collection_registered(collection)? {
            return Ok(Vec::new());
        }
        let table = table_name(collection)?;
        let clause = compile_filter(filter, "body")?;
        let mut sql = format!("SELECT body FROM \"{table}\" WHERE {} ORDER BY id ASC", clause.sql);
        if let Some(limit) = limit {
            let _ = write!(sql, " LIMIT {limit}");
        }
        self.note_index_usage(&sql, &clause.params)?;

        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|err| backend("failed to prepare find", &err))?;
        let rows = stmt
            .query_map(params_from_iter(clause.params.iter()), |row| row.get::<_, String>(0))
            .map_err(|err| backend("failed to find documents", &err))?;

        let mut documents = Vec::new();
        for body in collect_rows(rows)? {
            let document = serde_json::from_str(&body).map_err(|err| StoreError::MalformedDocument {
                collection: collection.to_string(),
                message: err.to_string(),
            })?;
            documents.push(document);
        }
        Ok(documents)
    }

    fn distinct(
        &self,
        collection: &str,
        field: &str,
        filter: &Filter,
    ) -> Result<Vec<Value>, StoreError> {
        if !self.collection_registered(collection)? {
            return Ok(Vec::new());
        }
        let table = table_name(collection)?;
        let kind = json_type("body", field)?;
        let value = json_path("body", field)?;
        let clause = compile_filter(filter, "body")?;
        let sql = format!(
            "SELECT {kind}, {value}
             FROM \"{table}\"
             WHERE {kind} IS NOT NULL AND {kind} != 'null' AND ({})
             GROUP BY {kind}, {value}
             ORDER BY MIN(id) ASC",
            clause.sql
        );
        self.note_index_usage(&sql, &clause.params)?;

        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|err| backend("failed to prepare distinct", &err))?;
        let mut rows = stmt
            .query(params_from_iter(clause.params.iter()))
            .map_err(|err| backend("failed to read distinct values", &err))?;

        let mut values = Vec::new();
        while let Some(row) = rows
            .next()
            .map_err(|err| backend("failed to read distinct row", &err))?
        {
            let kind: String = row.get(0).map_err(|err| backend("failed to read json_type", &err))?;
            let raw = row.get_ref(1).map_err(|err| backend("failed to read json value", &err))?;
            values.push(json_value(collection, &kind, raw)?);
        }
        Ok(values)
    }

    fn update_many(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
    ) -> Result<u64, StoreError> {
        if update.is_empty() || !self.collection_registered(collection)? {
            return Ok(0);
        }
        let table = table_name(collection)?;

        let mut expression = "body".to_string();
        let mut params = Vec::new();
        for (field, value) in &update.set {
            validate_field_path(field).map_err(|err| StoreError::InvalidName(err.to_string()))?;
            expression = format!("json_set({expression}, '$.{field}', json(?))");
            let encoded = serde_json::to_string(value)
                .map_err(|err| StoreError::Backend(format!("failed to encode {field}: {err}")))?;
            params.push(SqlValue::Text(encoded));
        }
        for field in &update.unset {
            validate_field_path(field).map_err(|err| StoreError::InvalidName(err.to_string()))?;
            expression = format!("json_remove({expression}, '$.{field}')");
        }

        let clause = compile_filter(filter, "body")?;
        params.extend(clause.params);
        let sql = format!("UPDATE \"{table}\" SET body = {expression} WHERE {}", clause.sql);
        self.note_index_usage(&sql, &params)?;

        let changed = self
            .conn
            .execute(&sql, params_from_iter(params.iter()))
            .map_err(|err| write_error(collection, &err, "failed to update documents"))?;
        Ok(u64::try_from(changed).unwrap_or(u64::MAX))
    }

    fn insert_one(&self, collection: &str, document: &Value) -> Result<(), StoreError> {
        if !document.is_object() {
            return Err(StoreError::MalformedDocument {
                collection: collection.to_string(),
                message: "documents MUST be JSON objects".to_string(),
            });
        }
        let table = self.writable_collection(collection)?;
        let body = serde_json::to_string(document)
            .map_err(|err| StoreError::Backend(format!("failed to encode document: {err}")))?;
        self.conn
            .execute(&format!("INSERT INTO \"{table}\"(body) VALUES (?1)"), params![body])
            .map_err(|err| write_error(collection, &err, "failed to insert document"))?;
        Ok(())
    }

    /// The primary index is listed but its hits are not counted.
    fn index_usage(&self, collection: &str) -> Result<Vec<IndexUsage>, StoreError> {
        self.require_collection(collection)?;
        let created_at: Option<String> = self
            .conn
            .query_row(
                "SELECT created_at FROM store_collections WHERE name = ?1",
                params![collection],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| backend("failed to read collection metadata", &err))?;

        let mut usage = vec![IndexUsage {
            name: PRIMARY_INDEX_NAME.to_string(),
            ops: 0,
            since: created_at,
        }];

        let mut stmt = self
            .conn
            .prepare(
                "SELECT u.name, u.ops, u.since
                 FROM store_index_usage u
                 JOIN store_indexes i ON i.collection = u.collection AND i.name = u.name
                 JOIN sqlite_master m
                   ON m.type = 'index' AND m.name = 'ix_' || i.collection || '__' || i.name
                 WHERE u.collection = ?1
                 ORDER BY i.rowid ASC",
            )
            .map_err(|err| backend("failed to prepare index usage listing", &err))?;
        let rows = stmt
            .query_map(params![collection], |row| {
                Ok(IndexUsage {
                    name: row.get(0)?,
                    ops: u64::try_from(row.get::<_, i64>(1)?).unwrap_or(0),
                    since: row.get(2)?,
                })
            })
            .map_err(|err| backend("failed to read index usage", &err))?;
        usage.extend(collect_rows(rows)?);
        Ok(usage)
    }

    #[allow(clippy::cast_precision_loss)]
    fn set_usage_tracking(&self, enabled: bool) -> bool {
        !self.usage_paused.replace(!enabled)
    }

    fn collection_stats(&self, collection: &str) -> Result<CollectionStats, StoreError> {
        let table = self.require_collection(collection)?;
        let (count, size): (i64, i64) = self
            .conn
            .query_row(
                &format!(
                    "SELECT COUNT(*), COALESCE(SUM(LENGTH(CAST(body AS BLOB))), 0) FROM \"{table}\""
                ),
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(|err| backend("failed to read collection statistics", &err))?;

        let count = u64::try_from(count).unwrap_or(0);
        let size_bytes = u64::try_from(size).unwrap_or(0);
        let avg_obj_size_bytes = if count == 0 { 0.0 } else { size_bytes as f64 / count as f64 };
        Ok(CollectionStats {
            collection: collection.to_string(),
            count,
            size_bytes,
            avg_obj_size_bytes,
        })
    }

    fn database_stats(&self) -> Result<DatabaseStats, StoreError> {
        let collections = self.list_collections()?;
        let mut documents = 0;
        let mut data_size_bytes = 0;
        for collection in &collections {
            let stats = self.collection_stats(collection)?;
            documents += stats.count;
            data_size_bytes += stats.size_bytes;
        }

        let page_count: i64 = self
            .conn
            .query_row("PRAGMA page_count", [], |row| row.get(0))
            .map_err(|err| backend("failed to read page_count", &err))?;
        let page_size: i64 = self
            .conn
            .query_row("PRAGMA page_size", [], |row| row.get(0))
            .map_err(|err| backend("failed to read page_size", &err))?;
        let indexes: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*)
                 FROM store_indexes i
                 JOIN sqlite_master m
                   ON m.type = 'index' AND m.name = 'ix_' || i.collection || '__' || i.name",
                [],
                |row| row.get(0),
            )
            .map_err(|err| backend("failed to count indexes", &err))?;

        Ok(DatabaseStats {
            database: self.label.clone(),
            collections: u64::try_from(collections.len()).unwrap_or(u64::MAX),
            indexes: u64::try_from(indexes).unwrap_or(0),
            documents,
            data_size_bytes,
            storage_size_bytes: u64::try_from(page_count.saturating_mul(page_size)).unwrap_or(0),
        })
    }

    fn count_orphans(&self, link: &ForeignKey) -> Result<u64, StoreError> {
        let source = self.require_collection(&link.source)?;
        let target = self.require_collection(&link.target)?;
        let source_value = json_path("s.body", &link.source_field)?;
        let target_value = json_path("t.body", &link.target_field)?;
        let sql = format!(
            "SELECT COUNT(*)
             FROM \"{source}\" AS s
             WHERE NOT EXISTS (
               SELECT 1 FROM \"{target}\" AS t WHERE {target_value} = {source_value}
             )"
        );
        self.count_sql(&sql, &[])
    }

    fn count_disagreements(&self, agreement: &FieldAgreement) -> Result<u64, StoreError> {
        let link = &agreement.link;
        let source = self.require_collection(&link.source)?;
        let target = self.require_collection(&link.target)?;
        let source_key = json_path("s.body", &link.source_field)?;
        let target_key = json_path("t.body", &link.target_field)?;
        let source_present = json_type("s.body", &agreement.source_value)?;
        let source_value = json_path("s.body", &agreement.source_value)?;
        let target_value = json_path("t.body", &agreement.target_value)?;
        let sql = format!(
            "SELECT COUNT(*)
             FROM \"{source}\" AS s
             WHERE {source_present} IS NOT NULL
               AND EXISTS (SELECT 1 FROM \"{target}\" AS t WHERE {target_key} = {source_key})
               AND NOT EXISTS (
                 SELECT 1 FROM \"{target}\" AS t
                 WHERE {target_key} = {source_key} AND {target_value} IS {source_value}
               )"
        );
        self.count_sql(&sql, &[])
    }
}

struct Clause {
    sql: String,
    params: Vec<SqlValue>,
}

fn compile_filter(filter: &Filter, column: &str) -> Result<Clause, StoreError> {
    let mut params = Vec::new();
    let sql = compile_into(filter, column, &mut params)?;
    Ok(Clause { sql, params })
}

fn compile_into(
    filter: &Filter,
    column: &str,
    params: &mut Vec<SqlValue>,
) -> Result<String, StoreError> {
    match filter {
        Filter::All => Ok("1 = 1".to_string()),
        Filter::Eq(field, Value::Null) => {
            let kind = json_type(column, field)?;
            Ok(format!("({kind} IS NULL OR {kind} = 'null')"))
        }
        Filter::Eq(field, Value::Bool(flag)) => {
            let literal = if *flag { "true" } else { "false" };
            Ok(format!("{} = '{literal}'", json_type(column, field)?))
        }
        Filter::Eq(field, value) => {
            params.push(scalar(field, value)?);
            Ok(format!("{} = ?", json_path(column, field)?))
        }
        Filter::In(field, values) => {
            if values.is_empty() {
                return Ok("0 = 1".to_string());
            }
            let path = json_path(column, field)?;
            for value in values {
                params.push(scalar(field, value)?);
            }
            Ok(format!("{path} IN ({})", vec!["?"; values.len()].join(", ")))
        }
        Filter::Exists(field, present) => Ok(format!(
            "{} IS {}NULL",
            json_type(column, field)?,
            if *present { "NOT " } else { "" }
        )),
        Filter::Lt(field, value) => {
            params.push(scalar(field, value)?);
            Ok(format!("{} < ?", json_path(column, field)?))
        }
        Filter::And(clauses) => {
            if clauses.is_empty() {
                return Ok("1 = 1".to_string());
            }
            let mut parts = Vec::with_capacity(clauses.len());
            for clause in clauses {
                parts.push(format!("({})", compile_into(clause, column, params)?));
            }
            Ok(parts.join(" AND "))
        }
    }
}

fn scalar(field: &str, value: &Value) -> Result<SqlValue, StoreError> {
    match value {
        Value::String(text) => Ok(SqlValue::Text(text.clone())),
        Value::Bool(flag) => Ok(SqlValue::Integer(i64::from(*flag))),
        Value::Number(number) => match (number.as_i64(), number.as_f64()) {
            (Some(integer), _) => Ok(SqlValue::Integer(integer)),
            (None, Some(real)) => Ok(SqlValue::Real(real)),
            (None, None) => Err(StoreError::UnsupportedFilter(format!(
                "{field}: number {number} is out of range"
            ))),
        },
        Value::Null | Value::Array(_) | Value::Object(_) => Err(StoreError::UnsupportedFilter(
            format!("{field}: cannot compare against {value}"),
        )),
    }
}

fn json_value(collection: &str, kind: &str, raw: ValueRef<'_>) -> Result<Value, StoreError> {
    let malformed = |message: String| StoreError::MalformedDocument {
        collection: collection.to_string(),
        message,
    };
    match (kind, raw) {
        ("null", _) => Ok(Value::Null),
        ("true", _) => Ok(Value::Bool(true)),
        ("false", _) => Ok(Value::Bool(false)),
        ("integer", ValueRef::Integer(integer)) => Ok(Value::from(integer)),
        ("real", ValueRef::Real(real)) => Ok(serde_json::Number::from_f64(real)
            .map_or(Value::Null, Value::Number)),
        ("text", ValueRef::Text(text)) => {
            Ok(Value::String(String::from_utf8_lossy(text).into_owned()))
        }
        ("array" | "object", ValueRef::Text(text)) => {
            serde_json::from_slice(text).map_err(|err| malformed(err.to_string()))
        }
        (other, _) => Err(malformed(format!("unexpected json_type {other}"))),
    }
}

fn table_name(collection: &str) -> Result<String, StoreError> {
    validate_identifier("collection", collection)
        .map_err(|err| StoreError::InvalidName(err.to_string()))?;
    Ok(format!("doc_{collection}"))
}

fn sqlite_index_name(collection: &str, index: &str) -> String {
    format!("ix_{collection}__{index}")
}

fn json_path(column: &str, field: &str) -> Result<String, StoreError> {
    validate_field_path(field).map_err(|err| StoreError::InvalidName(err.to_string()))?;
    Ok(format!("json_extract({column}, '$.{field}')"))
}

fn json_type(column: &str, field: &str) -> Result<String, StoreError> {
    validate_field_path(field).map_err(|err| StoreError::InvalidName(err.to_string()))?;
    Ok(format!("json_type({column}, '$.{field}')"))
}

/// `(collection, index)` pairs named by one `EXPLAIN QUERY PLAN` detail line,
/// e.g. `SEARCH s USING COVERING INDEX ix_events__idx_events_eventId_unique (<expr>=?)`.
fn indexes_in_plan(detail: &str) -> Vec<(String, String)> {
    let words: Vec<&str> = detail.split_whitespace().collect();
    words
        .windows(2)
        .filter(|pair| pair[0] == "INDEX")
        .filter_map(|pair| {
            let (collection, name) = pair[1].strip_prefix("ix_")?.split_once("__")?;
            Some((collection.to_string(), name.to_string()))
        })
        .collect()
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(inner, _) if inner.code == ErrorCode::ConstraintViolation
    )
}

fn write_error(collection: &str, err: &rusqlite::Error, context: &str) -> StoreError {
    if let rusqlite::Error::SqliteFailure(inner, message) = err {
        if inner.code == ErrorCode::ConstraintViolation {
            let prefix = format!("ix_{collection}__");
            let index = message
                .as_deref()
                .and_then(|message| message.split_once("index '"))
                .and_then(|(_, rest)| rest.split_once('\''))
                .map(|(name, _)| name.strip_prefix(&prefix).unwrap_or(name).to_string())
                .unwrap_or_else(|| "unknown".to_string());
            return StoreError::DuplicateKey { collection: collection.to_string(), index };
        }
    }
    backend(context, err)
}

fn backend(context: &str, err: &rusqlite::Error) -> StoreError {
    StoreError::Backend(format!("{context}: {err}"))
}

fn timestamp() -> Result<String, StoreError> {
    format_rfc3339(now_utc()).map_err(|err| StoreError::Backend(err.to_string()))
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>, StoreError> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row.map_err(|err| backend("failed to read row", &err))?);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp, clippy::too_many_lines)]

    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn fixture_store() -> SqliteDocumentStore {
        must(SqliteDocumentStore::open_in_memory())
    }

    fn seed(store: &SqliteDocumentStore, collection: &str, documents: &[Value]) {
        for document in documents {
            must(store.insert_one(collection, document));
        }
    }

    #[test]
    fn connection_strings_resolve_to_locations() {
        assert_eq!(must(StoreLocation::parse("sqlite::memory:")), StoreLocation::Memory);
        assert_eq!(must(StoreLocation::parse(":memory:")), StoreLocation::Memory);
        assert_eq!(
            must(StoreLocation::parse("sqlite://./meta.sqlite3")),
            StoreLocation::File(PathBuf::from("./meta.sqlite3"))
        );
        assert_eq!(
            must(StoreLocation::parse("sqlite:///var/lib/meta.db")),
            StoreLocation::File(PathBuf::from("/var/lib/meta.db"))
        );
        assert_eq!(
            must(StoreLocation::parse("meta.db")),
            StoreLocation::File(PathBuf::from("meta.db"))
        );
        assert!(StoreLocation::parse("mongodb://localhost:27017").is_err());
        assert!(StoreLocation::parse("sqlite://").is_err());
        assert!(StoreLocation::parse("  ").is_err());
    }

    #[test]
    fn migrate_is_repeatable() {
        let store = fixture_store();
        must(store.migrate());
        let versions: i64 = must(store.connection().query_row(
            "SELECT COUNT(*) FROM schema_migrations",
            [],
            |row| row.get(0),
        ));
        assert_eq!(versions, 1);
    }

    #[test]
    fn create_index_registers_collection_and_lists_primary_first() {
        let store = fixture_store();
        let spec = IndexSpec::builder("events").asc("format").desc("startAt").build();
        must(store.create_index(&spec));

        assert!(must(store.collection_exists("events")));
        let indexes = must(store.list_indexes("events"));
        assert_eq!(indexes.len(), 2);
        assert_eq!(indexes[0].name(), PRIMARY_INDEX_NAME);
        assert_eq!(indexes[1], spec);
    }

    #[test]
    fn create_index_is_idempotent_and_detects_redefinition() {
        let store = fixture_store();
        let spec = IndexSpec::builder("events").desc("startAt").build();
        must(store.create_index(&spec));
        must(store.create_index(&spec));
        assert_eq!(must(store.list_indexes("events")).len(), 2);

        let mut changed = spec.clone();
        changed.keys = vec![IndexKey::asc("startAt")];
        match store.create_index(&changed) {
            Err(StoreError::IndexExists { name, .. }) => assert_eq!(name, "idx_events_startAt"),
            other => panic!("expected IndexExists, got {other:?}"),
        }
    }

    #[test]
    fn implicit_creation_can_be_disabled() {
        let store = fixture_store().with_options(StoreOptions {
            implicit_collections: false,
            track_index_usage: true,
        });
        let spec = IndexSpec::builder("champions").asc("slug").unique().build();
        assert_eq!(
            store.create_index(&spec),
            Err(StoreError::CollectionMissing("champions".to_string()))
        );
        assert_eq!(
            store.list_indexes("champions"),
            Err(StoreError::CollectionMissing("champions".to_string()))
        );

        must(store.create_collection("champions"));
        must(store.create_index(&spec));
        assert_eq!(must(store.list_collections()), vec!["champions".to_string()]);
    }

    #[test]
    fn invalid_names_never_reach_sql() {
        let store = fixture_store();
        assert!(matches!(
            store.create_collection("events; DROP TABLE x"),
            Err(StoreError::InvalidName(_))
        ));
        assert!(matches!(
            store.count("events", &Filter::eq("format') OR 1=1 --", "x")),
            Ok(0) | Err(StoreError::InvalidName(_))
        ));
        must(store.create_collection("events"));
        assert!(matches!(
            store.count("events", &Filter::eq("format') OR 1=1 --", "x")),
            Err(StoreError::InvalidName(_))
        ));
    }

    #[test]
    fn filters_cover_engine_vocabulary() {
        let store = fixture_store();
        seed(
            &store,
            "standings",
            &[
                json!({"eventId": "E1", "playerId": 1, "madeCut": true, "format": "Standard"}),
                json!({"eventId": "E1", "playerId": 2, "madeCut": false}),
                json!({"eventId": "E2", "playerId": 3, "format": null}),
                json!({"eventId": 7, "playerId": 4}),
            ],
        );

        let count = |filter: Filter| must(store.count("standings", &filter));
        assert_eq!(count(Filter::All), 4);
        assert_eq!(count(Filter::eq("eventId", "E1")), 2);
        assert_eq!(count(Filter::eq("eventId", 7)), 1);
        assert_eq!(count(Filter::eq("madeCut", true)), 1);
        assert_eq!(count(Filter::eq("madeCut", false)), 1);
        assert_eq!(count(Filter::eq("format", Value::Null)), 3);
        assert_eq!(count(Filter::exists("format")), 2);
        assert_eq!(count(Filter::missing("format")), 2);
        assert_eq!(count(Filter::is_in("eventId", vec![json!("E2"), json!(7)])), 2);
        assert_eq!(count(Filter::is_in("eventId", Vec::new())), 0);
        assert_eq!(count(Filter::lt("playerId", 3)), 2);
        assert_eq!(count(Filter::eq("eventId", "E1").and(Filter::missing("format"))), 1);
        assert_eq!(count(Filter::And(Vec::new())), 4);

        assert!(matches!(
            store.count("standings", &Filter::eq("eventId", json!({"nested": true}))),
            Err(StoreError::UnsupportedFilter(_))
        ));
    }

    #[test]
    fn missing_collections_read_as_empty() {
        let store = fixture_store();
        assert_eq!(must(store.count("events", &Filter::All)), 0);
        assert!(must(store.find("events", &Filter::All, None)).is_empty());
        assert!(must(store.distinct("events", "format", &Filter::All)).is_empty());
        assert_eq!(must(store.update_many("events", &Filter::All, &Update::set("x", 1))), 0);
        assert!(!must(store.collection_exists("events")));
    }

    #[test]
    fn find_preserves_insertion_order_and_limit() {
        let store = fixture_store();
        seed(
            &store,
            "events",
            &[json!({"eventId": "E2"}), json!({"eventId": "E1"}), json!({"eventId": "E3"})],
        );
        let found = must(store.find("events", &Filter::All, Some(2)));
        assert_eq!(found, vec![json!({"eventId": "E2"}), json!({"eventId": "E1"})]);
    }

    #[test]
    fn distinct_keeps_json_types_and_first_seen_order_without_nulls() {
        let store = fixture_store();
        seed(
            &store,
            "standings",
            &[
                json!({"eventId": "E2"}),
                json!({"eventId": 1}),
                json!({"eventId": "E2"}),
                json!({"eventId": "1"}),
                json!({"playerId": 9}),
                json!({"eventId": null}),
                json!({"eventId": true}),
            ],
        );
        let values = must(store.distinct("standings", "eventId", &Filter::All));
        assert_eq!(values, vec![json!("E2"), json!(1), json!("1"), json!(true)]);
    }

    #[test]
    fn update_many_sets_and_unsets_only_matching_documents() {
        let store = fixture_store();
        seed(
            &store,
            "standings",
            &[
                json!({"eventId": "E1", "playerId": 1}),
                json!({"eventId": "E1", "playerId": 2, "format": "Draft"}),
                json!({"eventId": "E2", "playerId": 3}),
            ],
        );

        let scoped = Filter::eq("eventId", "E1").and(Filter::missing("format"));
        let update = Update::set("format", "Standard");
        assert_eq!(must(store.update_many("standings", &scoped, &update)), 1);
        assert_eq!(must(store.update_many("standings", &scoped, &update)), 0);

        let formats: Vec<Value> = must(store.find("standings", &Filter::All, None))
            .into_iter()
            .map(|doc| doc.get("format").cloned().unwrap_or(Value::Null))
            .collect();
        assert_eq!(formats, vec![json!("Standard"), json!("Draft"), Value::Null]);

        assert_eq!(must(store.update_many("standings", &Filter::All, &Update::unset("format"))), 3);
        assert_eq!(must(store.count("standings", &Filter::exists("format"))), 0);
    }

    #[test]
    fn unique_indexes_reject_duplicates() {
        let store = fixture_store();
        must(store.create_index(&IndexSpec::builder("champions").asc("slug").unique().build()));
        must(store.insert_one("champions", &json!({"slug": "lorraine"})));

        match store.insert_one("champions", &json!({"slug": "lorraine"})) {
            Err(StoreError::DuplicateKey { collection, index }) => {
                assert_eq!(collection, "champions");
                assert_eq!(index, "idx_champions_slug_unique");
            }
            other => panic!("expected DuplicateKey, got {other:?}"),
        }
        assert_eq!(must(store.count("champions", &Filter::All)), 1);
    }

    #[test]
    fn unique_index_over_duplicate_data_fails_without_registering() {
        let store = fixture_store();
        seed(&store, "crawler_state", &[json!({"crawlerName": "a"}), json!({"crawlerName": "a"})]);
        let spec = IndexSpec::builder("crawler_state").asc("crawlerName").unique().build();
        assert!(matches!(store.create_index(&spec), Err(StoreError::DuplicateKey { .. })));
        assert_eq!(must(store.list_indexes("crawler_state")).len(), 1);
    }

    #[test]
    fn sparse_unique_index_ignores_documents_without_the_field() {
        let store = fixture_store();
        let spec = IndexSpec::builder("users").asc("passwordResetToken").unique().sparse().build();
        must(store.create_index(&spec));
        must(store.insert_one("users", &json!({"userId": 1})));
        must(store.insert_one("users", &json!({"userId": 2})));
        must(store.insert_one("users", &json!({"userId": 3, "passwordResetToken": "t"})));
        assert!(store
            .insert_one("users", &json!({"userId": 4, "passwordResetToken": "t"}))
            .is_err());
        assert!(must(store.list_indexes("users"))[1].options.sparse);
    }

    #[test]
    fn insert_rejects_non_objects() {
        let store = fixture_store();
        assert!(matches!(
            store.insert_one("events", &json!([1, 2])),
            Err(StoreError::MalformedDocument { .. })
        ));
    }

    #[test]
    fn missing_and_null_references_are_orphans() {
        let store = fixture_store();
        seed(&store, "events", &[json!({"eventId": "E1"}), json!({"eventId": null})]);
        seed(
            &store,
            "standings",
            &[
                json!({"eventId": "E1", "playerId": 1}),
                json!({"playerId": 2}),
                json!({"eventId": null, "playerId": 3}),
            ],
        );

        let link = ForeignKey::new("standings", "eventId", "events", "eventId");
        assert_eq!(must(store.count_orphans(&link)), 2);
    }

    #[test]
    fn orphans_and_disagreements_are_counted_exactly() {
        let store = fixture_store();
        seed(
            &store,
            "events",
            &[
                json!({"eventId": "E1", "format": "Standard"}),
                json!({"eventId": 2, "format": "Draft"}),
            ],
        );
        seed(
            &store,
            "standings",
            &[
                json!({"eventId": "E1", "format": "Standard"}),
                json!({"eventId": "E1", "format": "Draft"}),
                json!({"eventId": "2"}),
                json!({"eventId": 2, "format": "Draft"}),
                json!({"eventId": "E9", "format": "Draft"}),
                json!({"playerId": 5}),
            ],
        );

        let link = ForeignKey::new("standings", "eventId", "events", "eventId");
        // "2" is text and does not match the integer 2; no eventId resolves to nothing
        assert_eq!(must(store.count_orphans(&link)), 3);

        let agreement = FieldAgreement {
            link,
            source_value: "format".to_string(),
            target_value: "format".to_string(),
        };
        assert_eq!(must(store.count_disagreements(&agreement)), 1);

        let dangling = ForeignKey::new("standings", "championSlug", "champions", "slug");
        assert_eq!(
            store.count_orphans(&dangling),
            Err(StoreError::CollectionMissing("champions".to_string()))
        );
    }

    #[test]
    fn index_usage_counts_planner_hits() {
        let store = fixture_store();
        let spec = IndexSpec::builder("events").asc("eventId").unique().build();
        let unused = IndexSpec::builder("events").asc("category").asc("status").build();
        must(store.create_index(&spec));
        must(store.create_index(&unused));
        seed(&store, "events", &[json!({"eventId": "E1"}), json!({"eventId": "E2"})]);

        must(store.count("events", &Filter::eq("eventId", "E1")));
        must(store.find("events", &Filter::eq("eventId", "E2"), None));

        let usage = must(store.index_usage("events"));
        let names: Vec<&str> = usage.iter().map(|entry| entry.name.as_str()).collect();
        assert_eq!(
            names,
            vec![PRIMARY_INDEX_NAME, "idx_events_eventId_unique", "idx_events_category_status"]
        );
        assert_eq!(usage[1].ops, 2);
        assert_eq!(usage[2].ops, 0);
        assert!(usage[1].since.is_some());
    }

    #[test]
    fn usage_tracking_can_be_disabled() {
        let store = fixture_store().with_options(StoreOptions {
            implicit_collections: true,
            track_index_usage: false,
        });
        must(store.create_index(&IndexSpec::builder("events").asc("eventId").build()));
        must(store.count("events", &Filter::eq("eventId", "E1")));
        assert_eq!(must(store.index_usage("events"))[1].ops, 0);
    }

    #[test]
    fn plan_details_are_parsed_for_index_names() {
        assert_eq!(
            indexes_in_plan(
                "SEARCH t USING COVERING INDEX ix_events__idx_events_eventId_unique (<expr>=?)"
            ),
            vec![("events".to_string(), "idx_events_eventId_unique".to_string())]
        );
        assert!(indexes_in_plan("SCAN doc_events").is_empty());
        assert!(indexes_in_plan("SEARCH t USING INDEX sqlite_autoindex_x (a=?)").is_empty());
    }

    #[test]
    fn statistics_report_sizes() {
        let store = fixture_store();
        seed(&store, "champions", &[json!({"slug": "a"}), json!({"slug": "bbb"})]);
        must(store.create_index(&IndexSpec::builder("champions").asc("slug").build()));

        let stats = must(store.collection_stats("champions"));
        assert_eq!(stats.count, 2);
        assert_eq!(stats.size_bytes, 12 + 14);
        assert_eq!(stats.avg_obj_size_bytes, 13.0);

        let database = must(store.database_stats());
        assert_eq!(database.database, ":memory:");
        assert_eq!(database.collections, 1);
        assert_eq!(database.indexes, 1);
        assert_eq!(database.documents, 2);
        assert!(database.storage_size_bytes > 0);

        assert_eq!(
            store.collection_stats("events"),
            Err(StoreError::CollectionMissing("events".to_string()))
        );
    }

    #[test]
    fn file_backed_store_persists_across_connections() {
        let dir = std::env::temp_dir().join(format!("meta-store-{}", ulid::Ulid::new()));
        must(std::fs::create_dir_all(&dir));
        let path = dir.join("meta.sqlite3");
        let connection_string = format!("sqlite://{}", path.display());

        {
            let store = must(SqliteDocumentStore::connect(&connection_string));
            must(store.create_index(&IndexSpec::builder("events").asc("eventId").unique().build()));
            must(store.insert_one("events", &json!({"eventId": "E1"})));
        }

        let reopened = must(SqliteDocumentStore::connect(&connection_string));
        assert_eq!(must(reopened.count("events", &Filter::All)), 1);
        assert_eq!(must(reopened.list_indexes("events")).len(), 2);
        assert_eq!(reopened.label(), path.display().to_string());

        let _ = std::fs::remove_dir_all(&dir);
    }

    proptest! {
        #[test]
        fn scoped_backfill_is_idempotent(
            docs in prop::collection::vec(
                (prop::sample::select(vec!["E1", "E2", "E3"]), any::<bool>()),
                0..24,
            )
        ) {
            let store = fixture_store();
            for (event_id, has_format) in &docs {
                let mut doc = json!({"eventId": event_id});
                if *has_format {
                    doc["format"] = json!("Draft");
                }
                must(store.insert_one("standings", &doc));
            }

            let scoped = Filter::eq("eventId", "E1").and(Filter::missing("format"));
            let expected = docs.iter().filter(|(event_id, has)| *event_id == "E1" && !has).count();
            let update = Update::set("format", "Standard");
            let first = must(store.update_many("standings", &scoped, &update));
            let second = must(store.update_many("standings", &scoped, &update));

            prop_assert_eq!(first, expected as u64);
            prop_assert_eq!(second, 0);
            prop_assert_eq!(must(store.count("standings", &Filter::All)), docs.len() as u64);
        }
    }
}
