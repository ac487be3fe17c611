/// Database Module
///
/// This module handles the document/graph store the loader writes into:
/// - The `DocumentStore` capability set the storage gateway relies on
/// - A PostgreSQL backend where every collection is a JSONB table keyed by `_key`
/// - Mapping of backend error codes onto conflict kinds the gateway reacts to
#[cfg(test)]
pub mod memory;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::{postgres::PgPoolOptions, PgPool, Postgres, QueryBuilder, Row};
use thiserror::Error;

use crate::models::{Collection, CollectionKind};

/// Rows per multi-value INSERT; keeps bind parameters well under the protocol limit
const IMPORT_CHUNK_ROWS: usize = 5_000;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Collection {0} already exists")]
    AlreadyExists(&'static str),

    /// Unique-key conflict: the document already exists
    #[error("Unique constraint violated: {0}")]
    UniqueConflict(String),

    /// Transient write conflict, safe to retry
    #[error("Write conflict: {0}")]
    WriteConflict(String),

    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Malformed document: {0}")]
    InvalidDocument(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

/// A document as read back from storage, with its revision
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub rev: u64,
    pub body: Value,
}

/// What a bulk import does with a key that already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnDuplicate {
    Replace,
    Error,
}

/// Document/edge collection capabilities consumed by the storage gateway
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    async fn collection_exists(&self, collection: Collection) -> Result<bool, StoreError>;

    /// Fails with `AlreadyExists` if the collection is present
    async fn create_collection(&self, collection: Collection) -> Result<(), StoreError>;

    async fn get(&self, collection: Collection, key: &str) -> Result<Option<StoredDocument>, StoreError>;

    /// Fails with `UniqueConflict` if the key exists; returns the new revision
    async fn insert(&self, collection: Collection, doc: &Value) -> Result<u64, StoreError>;

    /// Replace an existing document. With `expected_rev`, fails with
    /// `WriteConflict` when the stored revision differs.
    async fn replace(
        &self,
        collection: Collection,
        key: &str,
        doc: &Value,
        expected_rev: Option<u64>,
    ) -> Result<u64, StoreError>;

    /// Atomically add `item` to the string array `field` of the document keyed
    /// like `seed`, inserting `seed` itself when no such document exists.
    /// Returns false when `item` was already present.
    async fn merge_into(&self, collection: Collection, seed: &Value, field: &str, item: &str)
        -> Result<bool, StoreError>;

    /// Bulk import; returns the number of documents written
    async fn import(&self, collection: Collection, docs: &[Value], on_duplicate: OnDuplicate)
        -> Result<usize, StoreError>;

    async fn count(&self, collection: Collection) -> Result<u64, StoreError>;

    /// Document with the highest integer value of `field`, if any
    async fn last_by(&self, collection: Collection, field: &str) -> Result<Option<Value>, StoreError>;

    async fn truncate(&self, collection: Collection) -> Result<(), StoreError>;
}

/// Pull `_key` (and `_from`/`_to` for edges) out of a document body
pub(crate) fn document_handles(
    collection: Collection,
    doc: &Value,
) -> Result<(String, Option<(String, String)>), StoreError> {
    let field = |name: &str| {
        doc.get(name)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| StoreError::InvalidDocument(format!("{} document without {}", collection, name)))
    };

    let key = field("_key")?;
    let endpoints = match collection.kind() {
        CollectionKind::Edge => Some((field("_from")?, field("_to")?)),
        CollectionKind::Document => None,
    };

    Ok((key, endpoints))
}

/// Only plain identifiers may be spliced into SQL as JSON paths
fn checked_field(field: &str) -> Result<&str, StoreError> {
    if !field.is_empty() && field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(field)
    } else {
        Err(StoreError::InvalidDocument(format!("unsupported field name {:?}", field)))
    }
}

/// Map a driver error onto the conflict kinds the gateway distinguishes
fn map_sqlx(err: sqlx::Error, context: String) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        match db.code().as_deref() {
            Some("23505") => return StoreError::UniqueConflict(context),
            // serialization_failure, deadlock_detected
            Some("40001") | Some("40P01") => return StoreError::WriteConflict(context),
            _ => {}
        }
    }

    StoreError::Backend(format!("{}: {}", context, err))
}

pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool
    pub async fn new(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to connect to PostgreSQL database")?;

        Ok(Self { pool })
    }

    /// Test the database connection
    pub async fn test_connection(&self) -> anyhow::Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await.context("Database connection test failed")?;

        Ok(())
    }

    async fn create_indexes(&self, collection: Collection) -> Result<(), StoreError> {
        let table = collection.name();
        let mut statements = Vec::new();

        if collection.kind() == CollectionKind::Edge {
            statements.push(format!("CREATE INDEX IF NOT EXISTS {table}_from_idx ON {table} (_from)"));
            statements.push(format!("CREATE INDEX IF NOT EXISTS {table}_to_idx ON {table} (_to)"));
        }
        if collection == Collection::Blocks {
            statements.push(format!(
                "CREATE INDEX IF NOT EXISTS {table}_height_idx ON {table} (((doc->>'height')::BIGINT))"
            ));
        }

        for statement in statements {
            sqlx::query(&statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx(e, format!("index on {}", table)))?;
        }

        Ok(())
    }
}

#[async_trait]
impl DocumentStore for Database {
    async fn collection_exists(&self, collection: Collection) -> Result<bool, StoreError> {
        sqlx::query_scalar::<_, bool>("SELECT to_regclass($1) IS NOT NULL")
            .bind(collection.name())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx(e, format!("lookup of {}", collection)))
    }

    async fn create_collection(&self, collection: Collection) -> Result<(), StoreError> {
        let edge_columns = match collection.kind() {
            CollectionKind::Edge => ", _from TEXT NOT NULL, _to TEXT NOT NULL",
            CollectionKind::Document => "",
        };
        let statement = format!(
            "CREATE TABLE {} (_key TEXT PRIMARY KEY, _rev BIGINT NOT NULL DEFAULT 1, doc JSONB NOT NULL{})",
            collection.name(),
            edge_columns
        );

        match sqlx::query(&statement).execute(&self.pool).await {
            Ok(_) => {}
            // duplicate_table
            Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some("42P07") => {
                return Err(StoreError::AlreadyExists(collection.name()));
            }
            Err(e) => return Err(map_sqlx(e, format!("create {}", collection))),
        }

        self.create_indexes(collection).await?;
        tracing::info!("Created collection {}", collection);
        Ok(())
    }

    async fn get(&self, collection: Collection, key: &str) -> Result<Option<StoredDocument>, StoreError> {
        let row = sqlx::query(&format!("SELECT _rev, doc FROM {} WHERE _key = $1", collection.name()))
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx(e, format!("get {}/{}", collection, key)))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let rev: i64 = row.try_get("_rev").map_err(|e| map_sqlx(e, format!("decode {}/{}", collection, key)))?;
        let body: Value = row.try_get("doc").map_err(|e| map_sqlx(e, format!("decode {}/{}", collection, key)))?;

        Ok(Some(StoredDocument { rev: rev as u64, body }))
    }

    async fn insert(&self, collection: Collection, doc: &Value) -> Result<u64, StoreError> {
        let (key, endpoints) = document_handles(collection, doc)?;
        let context = format!("insert {}/{}", collection, key);

        let rev: i64 = match endpoints {
            Some((from, to)) => sqlx::query_scalar(&format!(
                "INSERT INTO {} (_key, doc, _from, _to) VALUES ($1, $2, $3, $4) RETURNING _rev",
                collection.name()
            ))
            .bind(&key)
            .bind(doc)
            .bind(from)
            .bind(to)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx(e, context))?,
            None => sqlx::query_scalar(&format!(
                "INSERT INTO {} (_key, doc) VALUES ($1, $2) RETURNING _rev",
                collection.name()
            ))
            .bind(&key)
            .bind(doc)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx(e, context))?,
        };

        Ok(rev as u64)
    }

    async fn replace(
        &self,
        collection: Collection,
        key: &str,
        doc: &Value,
        expected_rev: Option<u64>,
    ) -> Result<u64, StoreError> {
        let (_, endpoints) = document_handles(collection, doc)?;
        let context = format!("replace {}/{}", collection, key);

        let mut query = QueryBuilder::<Postgres>::new(format!("UPDATE {} SET _rev = _rev + 1, doc = ", collection.name()));
        query.push_bind(doc);
        if let Some((from, to)) = endpoints {
            query.push(", _from = ").push_bind(from).push(", _to = ").push_bind(to);
        }
        query.push(" WHERE _key = ").push_bind(key);
        if let Some(rev) = expected_rev {
            query.push(" AND _rev = ").push_bind(rev as i64);
        }
        query.push(" RETURNING _rev");

        let updated = query
            .build_query_scalar::<i64>()
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx(e, context.clone()))?;

        if let Some(rev) = updated {
            return Ok(rev as u64);
        }
        if expected_rev.is_some() && self.get(collection, key).await?.is_some() {
            return Err(StoreError::WriteConflict(format!("{}: revision changed", context)));
        }

        Err(StoreError::NotFound(format!("{}/{}", collection, key)))
    }

    async fn merge_into(
        &self,
        collection: Collection,
        seed: &Value,
        field: &str,
        item: &str,
    ) -> Result<bool, StoreError> {
        let (key, endpoints) = document_handles(collection, seed)?;
        if endpoints.is_some() {
            return Err(StoreError::InvalidDocument(format!("cannot merge into edge {}/{}", collection, key)));
        }
        let field = checked_field(field)?;
        let table = collection.name();

        // The conflict branch only fires for a missing item, so a re-merge leaves _rev alone
        let statement = format!(
            "INSERT INTO {table} AS t (_key, doc) VALUES ($1, $2) \
             ON CONFLICT (_key) DO UPDATE \
             SET doc = jsonb_set(t.doc, '{{{field}}}', COALESCE(t.doc->'{field}', '[]'::jsonb) || to_jsonb($3::text)), \
                 _rev = t._rev + 1 \
             WHERE NOT COALESCE(t.doc->'{field}', '[]'::jsonb) ? $3 \
             RETURNING _rev"
        );

        let rev = sqlx::query_scalar::<_, i64>(&statement)
            .bind(&key)
            .bind(seed)
            .bind(item)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx(e, format!("merge into {}/{}", collection, key)))?;

        Ok(rev.is_some())
    }

    async fn import(
        &self,
        collection: Collection,
        docs: &[Value],
        on_duplicate: OnDuplicate,
    ) -> Result<usize, StoreError> {
        let table = collection.name();
        let is_edge = collection.kind() == CollectionKind::Edge;

        let mut rows = Vec::with_capacity(docs.len());
        for doc in docs {
            let (key, endpoints) = document_handles(collection, doc)?;
            rows.push((key, doc, endpoints));
        }

        let mut written = 0;
        for chunk in rows.chunks(IMPORT_CHUNK_ROWS) {
            let columns = if is_edge { "_key, doc, _from, _to" } else { "_key, doc" };
            let mut query = QueryBuilder::<Postgres>::new(format!("INSERT INTO {} ({}) ", table, columns));

            query.push_values(chunk, |mut row, (key, doc, endpoints)| {
                row.push_bind(key.as_str()).push_bind(*doc);
                if let Some((from, to)) = endpoints {
                    row.push_bind(from.as_str()).push_bind(to.as_str());
                }
            });

            if on_duplicate == OnDuplicate::Replace {
                query.push(format!(" ON CONFLICT (_key) DO UPDATE SET doc = EXCLUDED.doc, _rev = {}._rev + 1", table));
                if is_edge {
                    query.push(", _from = EXCLUDED._from, _to = EXCLUDED._to");
                }
            }

            let result = query
                .build()
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx(e, format!("import into {}", table)))?;
            written += result.rows_affected() as usize;
        }

        Ok(written)
    }

    async fn count(&self, collection: Collection) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", collection.name()))
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx(e, format!("count {}", collection)))?;

        Ok(count as u64)
    }

    async fn last_by(&self, collection: Collection, field: &str) -> Result<Option<Value>, StoreError> {
        let field = checked_field(field)?;
        let statement = format!(
            "SELECT doc FROM {} ORDER BY (doc->>'{}')::BIGINT DESC NULLS LAST LIMIT 1",
            collection.name(),
            field
        );

        sqlx::query_scalar::<_, Value>(&statement)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx(e, format!("last {} by {}", collection, field)))
    }

    async fn truncate(&self, collection: Collection) -> Result<(), StoreError> {
        sqlx::query(&format!("TRUNCATE TABLE {}", collection.name()))
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx(e, format!("truncate {}", collection)))?;

        Ok(())
    }
}
