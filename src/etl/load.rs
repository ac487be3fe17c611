/// Load Module
///
/// The storage gateway: owns the lifecycle of every document the block
/// processor derives.
///
/// - Bulk writes are buffered per collection and imported once a batch reaches
///   the configured size. Bulk import failures are fatal and never retried.
/// - Single-document writes retry transient write conflicts within a bounded
///   budget, yielding to contending writers between attempts.
/// - Address documents accumulate outputs through the store's atomic
///   `merge_into`, so concurrent merges never lose an entry and re-applying a
///   merge changes nothing.
///
/// The block collection doubles as the resume checkpoint. Whenever block
/// documents are imported, every other batch is imported first, so the stored
/// max height never covers data that is still only in memory.
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::Mutex;

use crate::db::{DocumentStore, OnDuplicate, StoreError};
use crate::error::Result;
use crate::models::{AddressDoc, BlockDoc, Collection, Document, GraphDefinition, OutputDoc};

/// Height the chain walk starts from when nothing has been stored yet
pub const GENESIS_HEIGHT: u64 = 1;

/// Import order for a full flush; blocks go last
const FLUSH_ORDER: [Collection; 7] = [
    Collection::Outputs,
    Collection::Transactions,
    Collection::Addresses,
    Collection::Received,
    Collection::Spent,
    Collection::Produced,
    Collection::Blocks,
];

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Documents per collection buffered before a bulk import
    pub batch_size: usize,
    /// Extra attempts after a transient write conflict
    pub retries: usize,
    /// Replace documents that already exist instead of failing
    pub overwrite: bool,
    pub perf: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self { batch_size: 1000, retries: 3, overwrite: true, perf: false }
    }
}

/// Where the chain walk continues from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumePoint {
    /// Nothing stored: start at the genesis height
    Fresh,
    /// Continue with the chain successor of this stored block
    After { height: u64, hash: String },
}

impl ResumePoint {
    /// Max stored block height, or the genesis height when nothing is stored
    pub fn height(&self) -> u64 {
        match self {
            Self::Fresh => GENESIS_HEIGHT,
            Self::After { height, .. } => *height,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GatewayStats {
    pub documents_imported: u64,
    pub imports: u64,
    pub conflicts_retried: u64,
}

impl GatewayStats {
    pub fn merge(&mut self, other: &GatewayStats) {
        self.documents_imported += other.documents_imported;
        self.imports += other.imports;
        self.conflicts_retried += other.conflicts_retried;
    }
}

/// Pending documents of one collection, at most one per key
#[derive(Default)]
struct Batch {
    docs: Vec<Document>,
    positions: HashMap<String, usize>,
}

impl Batch {
    fn push(&mut self, doc: Document) {
        match self.positions.get(doc.key()) {
            Some(&at) => self.docs[at] = doc,
            None => {
                self.positions.insert(doc.key().to_string(), self.docs.len());
                self.docs.push(doc);
            }
        }
    }

    fn get(&self, key: &str) -> Option<&Document> {
        self.positions.get(key).map(|&at| &self.docs[at])
    }

    fn len(&self) -> usize {
        self.docs.len()
    }

    fn take(&mut self) -> Vec<Document> {
        self.positions.clear();
        std::mem::take(&mut self.docs)
    }
}

pub struct StorageGateway<S> {
    store: Arc<S>,
    config: GatewayConfig,
    batches: Mutex<HashMap<Collection, Batch>>,
    documents_imported: AtomicU64,
    imports: AtomicU64,
    conflicts_retried: AtomicU64,
}

impl<S: DocumentStore> StorageGateway<S> {
    pub fn new(store: Arc<S>, config: GatewayConfig) -> Self {
        Self {
            store,
            config,
            batches: Mutex::new(HashMap::new()),
            documents_imported: AtomicU64::new(0),
            imports: AtomicU64::new(0),
            conflicts_retried: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> GatewayStats {
        GatewayStats {
            documents_imported: self.documents_imported.load(Ordering::Relaxed),
            imports: self.imports.load(Ordering::Relaxed),
            conflicts_retried: self.conflicts_retried.load(Ordering::Relaxed),
        }
    }

    /// Create every collection and the named graph if missing
    pub async fn ensure_collections_exist(&self) -> Result<()> {
        for collection in Collection::ALL.into_iter().chain([Collection::Graphs]) {
            if self.store.collection_exists(collection).await? {
                continue;
            }
            match self.store.create_collection(collection).await {
                Ok(()) | Err(StoreError::AlreadyExists(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let graph = GraphDefinition::chain_graph();
        if self.store.get(Collection::Graphs, graph.name).await?.is_none() {
            // replaces a copy written by a concurrent bootstrap
            self.save_single(Document::Graph(graph), true).await?;
        }

        Ok(())
    }

    /// Highest stored block, if any
    pub async fn resume_point(&self) -> Result<ResumePoint> {
        let Some(last) = self.store.last_by(Collection::Blocks, "height").await? else {
            return Ok(ResumePoint::Fresh);
        };

        let block: BlockDoc = serde_json::from_value(last)?;
        Ok(ResumePoint::After { height: block.height, hash: block.hash })
    }

    /// Documents currently stored in `collection`
    pub async fn count(&self, collection: Collection) -> Result<u64> {
        Ok(self.store.count(collection).await?)
    }

    /// Buffer a document, importing its batch once it is full
    pub async fn save(&self, doc: Document) -> Result<()> {
        let collection = doc.collection();
        let mut batches = self.batches.lock().await;

        let batch = batches.entry(collection).or_default();
        batch.push(doc);

        if batch.len() >= self.config.batch_size {
            if collection == Collection::Blocks {
                self.flush_locked(&mut batches, &FLUSH_ORDER).await?;
            } else {
                self.flush_locked(&mut batches, &[collection]).await?;
            }
        }

        Ok(())
    }

    /// Write one document immediately.
    ///
    /// A unique-key conflict replaces the stored document when `overwrite` is
    /// set and is fatal otherwise. Transient write conflicts are retried.
    pub async fn save_single(&self, doc: Document, overwrite: bool) -> Result<()> {
        let body = doc.to_json()?;
        self.retrying(doc.key(), || self.write_once(doc.collection(), doc.key(), &body, overwrite)).await?;

        Ok(())
    }

    /// Record that `address` received `output_key`. Returns false when the
    /// association was already stored.
    pub async fn merge_address(&self, address: &str, output_key: &str) -> Result<bool> {
        let mut seed = AddressDoc::new(address);
        seed.merge(output_key);
        let seed = serde_json::to_value(&seed)?;

        let merged = self
            .retrying(address, || self.store.merge_into(Collection::Addresses, &seed, "outputs", output_key))
            .await?;
        Ok(merged)
    }

    /// Look a document up in the pending batches first, then in storage
    pub async fn get_document(&self, collection: Collection, key: &str) -> Result<Option<Value>> {
        {
            let batches = self.batches.lock().await;
            if let Some(doc) = batches.get(&collection).and_then(|b| b.get(key)) {
                return Ok(Some(doc.to_json()?));
            }
        }

        Ok(self.store.get(collection, key).await?.map(|stored| stored.body))
    }

    pub async fn resolve_output(&self, key: &str) -> Result<Option<OutputDoc>> {
        match self.get_document(Collection::Outputs, key).await? {
            Some(body) => Ok(Some(serde_json::from_value(body)?)),
            None => Ok(None),
        }
    }

    /// Import every non-empty batch; returns the number of documents written
    pub async fn flush_all(&self) -> Result<usize> {
        let mut batches = self.batches.lock().await;
        self.flush_locked(&mut batches, &FLUSH_ORDER).await
    }

    /// Documents buffered and not yet imported
    #[cfg(test)]
    pub async fn pending(&self) -> usize {
        self.batches.lock().await.values().map(Batch::len).sum()
    }

    /// Truncate every data collection and drop anything still buffered
    pub async fn clean(&self) -> Result<()> {
        let mut batches = self.batches.lock().await;
        batches.clear();

        for collection in Collection::ALL {
            self.store.truncate(collection).await?;
            tracing::info!("Truncated collection {}", collection);
        }

        Ok(())
    }

    async fn flush_locked(&self, batches: &mut HashMap<Collection, Batch>, order: &[Collection]) -> Result<usize> {
        let on_duplicate = if self.config.overwrite { OnDuplicate::Replace } else { OnDuplicate::Error };
        let mut written = 0;

        for collection in order {
            let Some(batch) = batches.get_mut(collection) else {
                continue;
            };
            if batch.len() == 0 {
                continue;
            }

            let docs = batch.take().iter().map(Document::to_json).collect::<serde_json::Result<Vec<_>>>()?;
            let started = Instant::now();
            let count = self.store.import(*collection, &docs, on_duplicate).await?;

            if self.config.perf {
                tracing::info!(
                    "[perf] imported {} documents into {} in {:.1}ms",
                    count,
                    collection,
                    started.elapsed().as_secs_f64() * 1000.0
                );
            } else {
                tracing::debug!("Imported {} documents into {}", count, collection);
            }

            self.imports.fetch_add(1, Ordering::Relaxed);
            self.documents_imported.fetch_add(docs.len() as u64, Ordering::Relaxed);
            written += docs.len();
        }

        Ok(written)
    }

    async fn write_once(
        &self,
        collection: Collection,
        key: &str,
        body: &Value,
        overwrite: bool,
    ) -> std::result::Result<(), StoreError> {
        match self.store.insert(collection, body).await {
            Err(StoreError::UniqueConflict(_)) if overwrite => {
                self.store.replace(collection, key, body, None).await.map(|_| ())
            }
            other => other.map(|_| ()),
        }
    }

    /// Run `op` until it stops failing with a write conflict or the retry
    /// budget is spent.
    async fn retrying<T, F, Fut>(&self, what: &str, mut op: F) -> std::result::Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, StoreError>>,
    {
        let mut retries_left = self.config.retries;

        loop {
            match op().await {
                Err(StoreError::WriteConflict(msg)) if retries_left > 0 => {
                    retries_left -= 1;
                    self.conflicts_retried.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!("Write conflict on {}, retrying ({} left): {}", what, retries_left, msg);
                    tokio::task::yield_now().await;
                }
                other => return other,
            }
        }
    }
}
