/// In-memory `DocumentStore` for tests.
///
/// Behaves like the Postgres backend for keys, revisions and conflicts, and can
/// be told to fail upcoming single-document writes with a given error.
/// `Yielding` wraps any store so that concurrent callers interleave between
/// store calls, as they would against a remote database.
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use super::{document_handles, DocumentStore, OnDuplicate, StoreError, StoredDocument};
use crate::models::Collection;

type Table = BTreeMap<String, (u64, Value)>;

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<Collection, Table>>,
    write_faults: Mutex<VecDeque<StoreError>>,
    imports: AtomicUsize,
}

impl MemoryStore {
    /// Store with every collection already created
    pub fn bootstrapped() -> Self {
        let store = Self::default();
        {
            let mut tables = store.tables.lock().unwrap();
            for collection in Collection::ALL.into_iter().chain([Collection::Graphs]) {
                tables.insert(collection, Table::new());
            }
        }
        store
    }

    /// Fail the next single-document writes (insert/replace/merge) with these errors, in order
    pub fn fail_next_writes(&self, errors: impl IntoIterator<Item = StoreError>) {
        self.write_faults.lock().unwrap().extend(errors);
    }

    pub fn pending_faults(&self) -> usize {
        self.write_faults.lock().unwrap().len()
    }

    /// Number of bulk import calls received
    pub fn import_calls(&self) -> usize {
        self.imports.load(Ordering::SeqCst)
    }

    pub fn documents(&self, collection: Collection) -> Vec<Value> {
        let tables = self.tables.lock().unwrap();
        tables.get(&collection).map(|t| t.values().map(|(_, doc)| doc.clone()).collect()).unwrap_or_default()
    }

    pub fn document(&self, collection: Collection, key: &str) -> Option<Value> {
        let tables = self.tables.lock().unwrap();
        tables.get(&collection).and_then(|t| t.get(key)).map(|(_, doc)| doc.clone())
    }

    pub fn len(&self, collection: Collection) -> usize {
        let tables = self.tables.lock().unwrap();
        tables.get(&collection).map(Table::len).unwrap_or(0)
    }

    fn take_fault(&self) -> Option<StoreError> {
        self.write_faults.lock().unwrap().pop_front()
    }

    fn with_table<T>(
        &self,
        collection: Collection,
        f: impl FnOnce(&mut Table) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut tables = self.tables.lock().unwrap();
        let table = tables
            .get_mut(&collection)
            .ok_or_else(|| StoreError::Backend(format!("collection {} does not exist", collection)))?;
        f(table)
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn collection_exists(&self, collection: Collection) -> Result<bool, StoreError> {
        Ok(self.tables.lock().unwrap().contains_key(&collection))
    }

    async fn create_collection(&self, collection: Collection) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().unwrap();
        if tables.contains_key(&collection) {
            return Err(StoreError::AlreadyExists(collection.name()));
        }
        tables.insert(collection, Table::new());
        Ok(())
    }

    async fn get(&self, collection: Collection, key: &str) -> Result<Option<StoredDocument>, StoreError> {
        self.with_table(collection, |table| {
            Ok(table.get(key).map(|(rev, body)| StoredDocument { rev: *rev, body: body.clone() }))
        })
    }

    async fn insert(&self, collection: Collection, doc: &Value) -> Result<u64, StoreError> {
        if let Some(fault) = self.take_fault() {
            return Err(fault);
        }

        let (key, _) = document_handles(collection, doc)?;
        self.with_table(collection, |table| {
            if table.contains_key(&key) {
                return Err(StoreError::UniqueConflict(format!("{}/{}", collection, key)));
            }
            table.insert(key, (1, doc.clone()));
            Ok(1)
        })
    }

    async fn replace(
        &self,
        collection: Collection,
        key: &str,
        doc: &Value,
        expected_rev: Option<u64>,
    ) -> Result<u64, StoreError> {
        if let Some(fault) = self.take_fault() {
            return Err(fault);
        }

        document_handles(collection, doc)?;
        self.with_table(collection, |table| {
            let (rev, body) =
                table.get_mut(key).ok_or_else(|| StoreError::NotFound(format!("{}/{}", collection, key)))?;
            if expected_rev.is_some_and(|expected| expected != *rev) {
                return Err(StoreError::WriteConflict(format!("{}/{}: revision changed", collection, key)));
            }
            *rev += 1;
            *body = doc.clone();
            Ok(*rev)
        })
    }

    async fn merge_into(
        &self,
        collection: Collection,
        seed: &Value,
        field: &str,
        item: &str,
    ) -> Result<bool, StoreError> {
        if let Some(fault) = self.take_fault() {
            return Err(fault);
        }

        let (key, _) = document_handles(collection, seed)?;
        self.with_table(collection, |table| {
            if !table.contains_key(&key) {
                table.insert(key, (1, seed.clone()));
                return Ok(true);
            }

            let malformed = || StoreError::InvalidDocument(format!("{}/{}: {} is not an array", collection, key, field));
            let (rev, body) = table.get_mut(&key).ok_or_else(malformed)?;
            let items = body
                .as_object_mut()
                .ok_or_else(malformed)?
                .entry(field)
                .or_insert_with(|| Value::Array(Vec::new()))
                .as_array_mut()
                .ok_or_else(malformed)?;

            if items.iter().any(|existing| existing.as_str() == Some(item)) {
                return Ok(false);
            }
            items.push(Value::String(item.to_string()));
            *rev += 1;
            Ok(true)
        })
    }

    async fn import(
        &self,
        collection: Collection,
        docs: &[Value],
        on_duplicate: OnDuplicate,
    ) -> Result<usize, StoreError> {
        self.imports.fetch_add(1, Ordering::SeqCst);

        let mut rows = Vec::with_capacity(docs.len());
        for doc in docs {
            rows.push((document_handles(collection, doc)?.0, doc.clone()));
        }

        self.with_table(collection, |table| {
            if on_duplicate == OnDuplicate::Error {
                if let Some((key, _)) = rows.iter().find(|(key, _)| table.contains_key(key)) {
                    return Err(StoreError::UniqueConflict(format!("{}/{}", collection, key)));
                }
            }

            let written = rows.len();
            for (key, doc) in rows {
                let rev = table.get(&key).map(|(rev, _)| rev + 1).unwrap_or(1);
                table.insert(key, (rev, doc));
            }
            Ok(written)
        })
    }

    async fn count(&self, collection: Collection) -> Result<u64, StoreError> {
        self.with_table(collection, |table| Ok(table.len() as u64))
    }

    async fn last_by(&self, collection: Collection, field: &str) -> Result<Option<Value>, StoreError> {
        self.with_table(collection, |table| {
            Ok(table
                .values()
                .filter_map(|(_, doc)| doc.get(field).and_then(Value::as_u64).map(|v| (v, doc)))
                .max_by_key(|(v, _)| *v)
                .map(|(_, doc)| doc.clone()))
        })
    }

    async fn truncate(&self, collection: Collection) -> Result<(), StoreError> {
        self.with_table(collection, |table| {
            table.clear();
            Ok(())
        })
    }
}

/// Suspends the calling task after every store call
pub struct Yielding<S>(pub S);

#[async_trait]
impl<S: DocumentStore> DocumentStore for Yielding<S> {
    async fn collection_exists(&self, collection: Collection) -> Result<bool, StoreError> {
        let exists = self.0.collection_exists(collection).await;
        tokio::task::yield_now().await;
        exists
    }

    async fn create_collection(&self, collection: Collection) -> Result<(), StoreError> {
        let created = self.0.create_collection(collection).await;
        tokio::task::yield_now().await;
        created
    }

    async fn get(&self, collection: Collection, key: &str) -> Result<Option<StoredDocument>, StoreError> {
        let found = self.0.get(collection, key).await;
        tokio::task::yield_now().await;
        found
    }

    async fn insert(&self, collection: Collection, doc: &Value) -> Result<u64, StoreError> {
        tokio::task::yield_now().await;
        self.0.insert(collection, doc).await
    }

    async fn replace(
        &self,
        collection: Collection,
        key: &str,
        doc: &Value,
        expected_rev: Option<u64>,
    ) -> Result<u64, StoreError> {
        tokio::task::yield_now().await;
        self.0.replace(collection, key, doc, expected_rev).await
    }

    async fn merge_into(
        &self,
        collection: Collection,
        seed: &Value,
        field: &str,
        item: &str,
    ) -> Result<bool, StoreError> {
        tokio::task::yield_now().await;
        self.0.merge_into(collection, seed, field, item).await
    }

    async fn import(
        &self,
        collection: Collection,
        docs: &[Value],
        on_duplicate: OnDuplicate,
    ) -> Result<usize, StoreError> {
        tokio::task::yield_now().await;
        self.0.import(collection, docs, on_duplicate).await
    }

    async fn count(&self, collection: Collection) -> Result<u64, StoreError> {
        let count = self.0.count(collection).await;
        tokio::task::yield_now().await;
        count
    }

    async fn last_by(&self, collection: Collection, field: &str) -> Result<Option<Value>, StoreError> {
        let last = self.0.last_by(collection, field).await;
        tokio::task::yield_now().await;
        last
    }

    async fn truncate(&self, collection: Collection) -> Result<(), StoreError> {
        tokio::task::yield_now().await;
        self.0.truncate(collection).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_revisions_and_conflicts() {
        let store = MemoryStore::bootstrapped();
        let doc = json!({ "_key": "1A", "outputs": [] });

        assert_eq!(store.insert(Collection::Addresses, &doc).await.unwrap(), 1);
        let err = store.insert(Collection::Addresses, &doc).await.unwrap_err();
        assert!(matches!(err, StoreError::UniqueConflict(_)));

        let updated = json!({ "_key": "1A", "outputs": ["a:0"] });
        assert_eq!(store.replace(Collection::Addresses, "1A", &updated, Some(1)).await.unwrap(), 2);

        let err = store.replace(Collection::Addresses, "1A", &updated, Some(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::WriteConflict(_)));

        let err = store.replace(Collection::Addresses, "1B", &updated, None).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_injected_faults_hit_single_writes_only() {
        let store = MemoryStore::bootstrapped();
        store.fail_next_writes([StoreError::WriteConflict("busy".to_string())]);

        store.import(Collection::Outputs, &[json!({ "_key": "a:0", "value": 1.0 })], OnDuplicate::Replace).await.unwrap();
        assert_eq!(store.pending_faults(), 1);

        let err = store.insert(Collection::Outputs, &json!({ "_key": "a:1" })).await.unwrap_err();
        assert!(matches!(err, StoreError::WriteConflict(_)));
        assert_eq!(store.pending_faults(), 0);
    }

    #[tokio::test]
    async fn test_last_by_numeric_field() {
        let store = MemoryStore::bootstrapped();
        let blocks = [json!({ "_key": "h9", "height": 9 }), json!({ "_key": "h10", "height": 10 })];
        store.import(Collection::Blocks, &blocks, OnDuplicate::Replace).await.unwrap();

        let last = store.last_by(Collection::Blocks, "height").await.unwrap().unwrap();
        assert_eq!(last["_key"], "h10");
    }

    #[tokio::test]
    async fn test_missing_collection_is_an_error() {
        let store = MemoryStore::default();
        assert!(!store.collection_exists(Collection::Blocks).await.unwrap());
        assert!(store.count(Collection::Blocks).await.is_err());

        store.create_collection(Collection::Blocks).await.unwrap();
        let err = store.create_collection(Collection::Blocks).await.unwrap_err();
        assert_eq!(err, StoreError::AlreadyExists("blocks"));
    }

    #[tokio::test]
    async fn test_merge_into_creates_then_appends_once() {
        let store = MemoryStore::bootstrapped();
        let seed = |item: &str| json!({ "_key": "1A", "outputs": [item] });

        assert!(store.merge_into(Collection::Addresses, &seed("a:0"), "outputs", "a:0").await.unwrap());
        assert!(store.merge_into(Collection::Addresses, &seed("b:1"), "outputs", "b:1").await.unwrap());
        assert!(!store.merge_into(Collection::Addresses, &seed("a:0"), "outputs", "a:0").await.unwrap());

        assert_eq!(store.document(Collection::Addresses, "1A").unwrap()["outputs"], json!(["a:0", "b:1"]));
        assert_eq!(store.get(Collection::Addresses, "1A").await.unwrap().unwrap().rev, 2);
    }

    #[tokio::test]
    async fn test_merge_into_rejects_non_array_field() {
        let store = MemoryStore::bootstrapped();
        store.insert(Collection::Addresses, &json!({ "_key": "1A", "outputs": "a:0" })).await.unwrap();

        let seed = json!({ "_key": "1A", "outputs": ["b:0"] });
        let err = store.merge_into(Collection::Addresses, &seed, "outputs", "b:0").await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidDocument(_)));
    }
}
