/// Pipeline Module
///
/// Drives ingestion from the resume point to the chain tip:
/// Bootstrapping → Running → Draining → Terminated, with Cleaning reachable
/// from Bootstrapping when a clean start is requested.
///
/// A stop request is honoured between blocks only; the block in flight always
/// completes. Buffered documents are drained on every exit path except a clean.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::db::DocumentStore;
use crate::error::IngestError;
use crate::etl::extract::extract_block;
use crate::etl::load::{GatewayConfig, GatewayStats, ResumePoint, StorageGateway, GENESIS_HEIGHT};
use crate::etl::transform::{BlockProcessor, BlockSummary, Concurrency};
use crate::models::Collection;
use crate::progress::{format_number, rate, ProgressReporter};
use crate::rpc::{ChainReader, ChainSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Bootstrapping,
    Cleaning,
    Running,
    Draining,
    Terminated,
}

/// How a successful run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Cleaned,
    ReachedTip,
    Stopped,
}

/// Pipeline execution statistics
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub blocks: u64,
    pub transactions: u64,
    pub inputs: u64,
    pub outputs: u64,
    pub addresses: u64,
    pub missing_inputs: u64,
    pub warnings: u64,
    pub last_height: Option<u64>,
    pub gateway: GatewayStats,
    pub elapsed_time: Duration,
    pub outcome: Option<Outcome>,
    pub errors: Vec<PipelineError>,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one processed block
    pub fn record(&mut self, height: u64, summary: &BlockSummary) {
        self.blocks += 1;
        self.absorb(summary);
        self.last_height = self.last_height.max(Some(height));
    }

    fn absorb(&mut self, summary: &BlockSummary) {
        self.transactions += summary.transactions;
        self.inputs += summary.inputs;
        self.outputs += summary.outputs;
        self.addresses += summary.addresses;
        self.missing_inputs += summary.missing_inputs;
        self.warnings += summary.warnings;
    }

    fn merge_worker(&mut self, report: &WorkerReport) {
        self.blocks += report.blocks;
        self.absorb(&report.summary);
        self.last_height = self.last_height.max(report.last_height);
        self.gateway.merge(&report.gateway);
    }

    /// Log and keep `error`, handing it back for propagation
    fn record_error(&mut self, stage: PipelineStage, height: Option<u64>, error: anyhow::Error) -> anyhow::Error {
        tracing::error!("[{}] {:#}", stage, error);
        self.errors.push(PipelineError { stage, height, message: format!("{:#}", error) });
        error
    }

    /// Record every failure carried by `error`, handing back the first
    fn record_failures(
        &mut self,
        stage: PipelineStage,
        height: Option<u64>,
        error: IngestError,
        context: String,
    ) -> anyhow::Error {
        let mut first = None;
        for failure in error.into_failures() {
            let recorded = self.record_error(stage, height, anyhow::Error::new(failure).context(context.clone()));
            first.get_or_insert(recorded);
        }
        first.unwrap_or_else(|| anyhow::anyhow!(context))
    }

    pub fn blocks_per_second(&self) -> f64 {
        rate(self.blocks, self.elapsed_time)
    }

    pub fn transactions_per_second(&self) -> f64 {
        rate(self.transactions, self.elapsed_time)
    }
}

/// Pipeline error with context
#[derive(Debug, Clone)]
pub struct PipelineError {
    pub stage: PipelineStage,
    pub height: Option<u64>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Bootstrap,
    Extract,
    Transform,
    Load,
    Worker(usize),
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineStage::Bootstrap => write!(f, "Bootstrap"),
            PipelineStage::Extract => write!(f, "Extract"),
            PipelineStage::Transform => write!(f, "Transform"),
            PipelineStage::Load => write!(f, "Load"),
            PipelineStage::Worker(id) => write!(f, "Worker {}", id),
        }
    }
}

/// Configuration for pipeline execution
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub batch_size: usize,
    pub retries: usize,
    pub overwrite: bool,
    pub concurrency: Concurrency,
    pub max_workers: usize,
    pub clean: bool,
    pub perf: bool,
    /// Blocks between progress lines
    pub progress_interval: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            retries: 3,
            overwrite: true,
            concurrency: Concurrency::Sequential,
            max_workers: 1,
            clean: false,
            perf: false,
            progress_interval: 100,
        }
    }
}

impl PipelineConfig {
    fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            batch_size: self.batch_size,
            retries: self.retries,
            overwrite: self.overwrite,
            perf: self.perf,
        }
    }
}

/// Main ingestion pipeline
pub struct Pipeline<C, S> {
    chain: Arc<ChainReader<C>>,
    store: Arc<S>,
    config: PipelineConfig,
    stop: Arc<AtomicBool>,
    state: PipelineState,
    errors: Vec<PipelineError>,
}

impl<C: ChainSource + 'static, S: DocumentStore> Pipeline<C, S> {
    /// Create a new pipeline; `stop` is latched externally to request a halt
    pub fn new(chain: ChainReader<C>, store: Arc<S>, config: PipelineConfig, stop: Arc<AtomicBool>) -> Self {
        Self { chain: Arc::new(chain), store, config, stop, state: PipelineState::Bootstrapping, errors: Vec::new() }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Errors recorded by the last run, including a failed one
    pub fn errors(&self) -> &[PipelineError] {
        &self.errors
    }

    /// Run until the tip is reached, a stop is requested or an error occurs
    pub async fn run(&mut self) -> Result<PipelineStats> {
        let start_time = Instant::now();
        let mut stats = PipelineStats::new();

        println!("\n🚀 Starting ingestion pipeline...");
        println!("   📦 Batch size: {}", self.config.batch_size);
        println!("   🔄 Retries: {}", self.config.retries);
        println!("   👷 Workers: {}", self.config.max_workers);
        println!("   ⚡ Concurrent sub-tasks: {}", self.config.concurrency == Concurrency::Concurrent);

        let gateway = StorageGateway::new(self.store.clone(), self.config.gateway_config());
        let mut outcome = self.execute(&gateway, &mut stats).await;

        if !matches!(outcome, Ok(Outcome::Cleaned)) {
            self.transition(PipelineState::Draining);
            match gateway.flush_all().await {
                Ok(0) => {}
                Ok(drained) => tracing::info!("Drained {} buffered documents", drained),
                Err(e) => {
                    let error = stats.record_error(
                        PipelineStage::Load,
                        stats.last_height,
                        anyhow::Error::new(e).context("Failed to drain buffered documents"),
                    );
                    if outcome.is_ok() {
                        outcome = Err(error);
                    }
                }
            }
        }

        stats.gateway.merge(&gateway.stats());
        stats.elapsed_time = start_time.elapsed();
        self.transition(PipelineState::Terminated);

        match &outcome {
            Ok(Outcome::Cleaned) => println!("\n🧹 Collections truncated"),
            Ok(Outcome::ReachedTip) => println!("\n✅ Reached chain tip"),
            Ok(Outcome::Stopped) => println!("\n🛑 Stopped on request"),
            Err(_) => println!("\n❌ Pipeline failed"),
        }
        stats.outcome = outcome.as_ref().ok().copied();
        self.print_final_stats(&stats);
        self.errors = stats.errors.clone();

        outcome.map(|_| stats)
    }

    fn transition(&mut self, next: PipelineState) {
        tracing::debug!("Pipeline state {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    async fn execute(&mut self, gateway: &StorageGateway<S>, stats: &mut PipelineStats) -> Result<Outcome> {
        self.transition(PipelineState::Bootstrapping);

        gateway
            .ensure_collections_exist()
            .await
            .context("Failed to create collections")
            .map_err(|e| stats.record_error(PipelineStage::Bootstrap, None, e))?;

        if self.config.clean {
            self.transition(PipelineState::Cleaning);
            gateway
                .clean()
                .await
                .context("Failed to truncate collections")
                .map_err(|e| stats.record_error(PipelineStage::Bootstrap, None, e))?;
            return Ok(Outcome::Cleaned);
        }

        let resume = gateway
            .resume_point()
            .await
            .context("Failed to read resume point")
            .map_err(|e| stats.record_error(PipelineStage::Bootstrap, None, e))?;
        let tip = self
            .chain
            .get_chain_tip()
            .await
            .context("Failed to fetch chain tip")
            .map_err(|e| stats.record_error(PipelineStage::Extract, None, e))?;

        tracing::info!("Chain tip at height {} ({})", format_number(tip.height), tip.hash);
        match &resume {
            ResumePoint::Fresh => tracing::info!("No stored blocks, starting at height {}", resume.height()),
            ResumePoint::After { height, hash } => {
                let stored = gateway
                    .count(Collection::Blocks)
                    .await
                    .map_err(|e| stats.record_error(PipelineStage::Bootstrap, None, e.into()))?;
                tracing::info!(
                    "Resuming after stored block {} at height {} ({} blocks stored)",
                    hash,
                    format_number(*height),
                    format_number(stored)
                );
            }
        }

        self.transition(PipelineState::Running);
        if self.config.max_workers > 1 {
            self.run_workers(&resume, tip.height, stats).await
        } else {
            self.run_sequential(gateway, &resume, tip.height, stats).await
        }
    }

    /// Hash of the first block to process, or None when nothing is left
    async fn first_hash(&self, resume: &ResumePoint, tip_height: u64, stats: &mut PipelineStats) -> Result<Option<String>> {
        match resume {
            ResumePoint::Fresh if tip_height < GENESIS_HEIGHT => Ok(None),
            ResumePoint::Fresh => self
                .chain
                .get_block_hash_at_height(GENESIS_HEIGHT)
                .await
                .map(Some)
                .context("Failed to resolve the first block")
                .map_err(|e| stats.record_error(PipelineStage::Extract, Some(GENESIS_HEIGHT), e)),
            ResumePoint::After { height, hash } => {
                let stored = self
                    .chain
                    .get_block(hash)
                    .await
                    .with_context(|| format!("Failed to fetch resume block {}", hash))
                    .map_err(|e| stats.record_error(PipelineStage::Extract, Some(*height), e))?;
                Ok(stored.next_block_hash)
            }
        }
    }

    async fn run_sequential(
        &self,
        gateway: &StorageGateway<S>,
        resume: &ResumePoint,
        tip_height: u64,
        stats: &mut PipelineStats,
    ) -> Result<Outcome> {
        let Some(mut next) = self.first_hash(resume, tip_height, stats).await? else {
            tracing::info!("Already at chain tip");
            return Ok(Outcome::ReachedTip);
        };

        let processor = BlockProcessor::new(gateway, self.config.concurrency);
        let progress = ProgressReporter::new(tip_height, self.config.progress_interval);

        loop {
            if self.stop_requested() {
                tracing::info!("Stop requested, halting before block {}", next);
                return Ok(Outcome::Stopped);
            }

            let block = extract_block(self.chain.as_ref(), &next)
                .await
                .with_context(|| format!("Failed to extract block {}", next))
                .map_err(|e| stats.record_error(PipelineStage::Extract, None, e))?;

            let summary = match processor.process_block(&block).await {
                Ok(summary) => summary,
                Err(e) => {
                    let context = format!("Failed to process block {} at height {}", block.hash, block.height);
                    return Err(stats.record_failures(PipelineStage::Transform, Some(block.height), e, context));
                }
            };

            stats.record(block.height, &summary);
            progress.observe(block.height, block.time, stats);

            match block.next_hash {
                Some(hash) => next = hash,
                None => return Ok(Outcome::ReachedTip),
            }
        }
    }

    /// Fan heights out to independent workers, each with its own buffers
    async fn run_workers(&self, resume: &ResumePoint, tip_height: u64, stats: &mut PipelineStats) -> Result<Outcome> {
        let start = match resume {
            ResumePoint::Fresh => GENESIS_HEIGHT,
            ResumePoint::After { height, .. } => height + 1,
        };
        if start > tip_height {
            tracing::info!("Already at chain tip");
            return Ok(Outcome::ReachedTip);
        }

        let workers = self.config.max_workers;
        tracing::info!(
            "Dispatching heights {} to {} across {} workers",
            format_number(start),
            format_number(tip_height),
            workers
        );

        let (sender, receiver) = async_channel::bounded::<(u64, String)>(workers * 2);
        let handles: Vec<_> = (0..workers)
            .map(|id| {
                let worker = Worker {
                    id,
                    chain: self.chain.clone(),
                    gateway: StorageGateway::new(self.store.clone(), self.config.gateway_config()),
                    concurrency: self.config.concurrency,
                    stop: self.stop.clone(),
                    receiver: receiver.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();
        drop(receiver);

        let mut outcome = Ok(Outcome::ReachedTip);
        for height in start..=tip_height {
            if self.stop_requested() {
                tracing::info!("Stop requested, halting dispatch before height {}", height);
                outcome = Ok(Outcome::Stopped);
                break;
            }

            let hash = match self.chain.get_block_hash_at_height(height).await {
                Ok(hash) => hash,
                Err(e) => {
                    let error = anyhow::Error::new(e).context(format!("Failed to resolve block at height {}", height));
                    outcome = Err(stats.record_error(PipelineStage::Extract, Some(height), error));
                    break;
                }
            };

            // Closed once a worker fails
            if sender.send((height, hash)).await.is_err() {
                break;
            }
            if (height - start + 1) % self.config.progress_interval.max(1) == 0 {
                tracing::info!("Queued height {}/{}", format_number(height), format_number(tip_height));
            }
        }
        sender.close();

        for (id, handle) in handles.into_iter().enumerate() {
            match handle.await {
                Ok(mut report) => {
                    stats.merge_worker(&report);
                    if report.stopped && outcome.is_ok() {
                        outcome = Ok(Outcome::Stopped);
                    }
                    for error in std::mem::take(&mut report.errors) {
                        let error = stats.record_error(PipelineStage::Worker(id), report.failed_height, error);
                        if outcome.is_ok() {
                            outcome = Err(error);
                        }
                    }
                }
                Err(e) => {
                    let error = stats.record_error(
                        PipelineStage::Worker(id),
                        None,
                        anyhow::anyhow!("Worker {} did not finish: {}", id, e),
                    );
                    if outcome.is_ok() {
                        outcome = Err(error);
                    }
                }
            }
        }

        outcome
    }

    /// Print final statistics
    fn print_final_stats(&self, stats: &PipelineStats) {
        println!("\n📊 Pipeline Statistics:");
        println!("   ⏱️  Total time: {:.2}s", stats.elapsed_time.as_secs_f64());
        match stats.last_height {
            Some(height) => println!("   📦 Blocks: {} (last height {})", stats.blocks, format_number(height)),
            None => println!("   📦 Blocks: {}", stats.blocks),
        }
        println!("   📝 Transactions: {}", format_number(stats.transactions));
        println!("   ➡️  Inputs: {} ({} missing)", format_number(stats.inputs), stats.missing_inputs);
        println!("   ⬅️  Outputs: {}", format_number(stats.outputs));
        println!("   🏷️  Address links: {}", format_number(stats.addresses));
        println!("   ⚠️  Warnings: {}", stats.warnings);
        println!(
            "   💾 Documents imported: {} in {} batches ({} conflicts retried)",
            format_number(stats.gateway.documents_imported),
            stats.gateway.imports,
            stats.gateway.conflicts_retried
        );
        println!("   ⚡ Speed: {:.2} blocks/sec", stats.blocks_per_second());
        println!("   ⚡ Throughput: {:.0} txs/sec", stats.transactions_per_second());

        if !stats.errors.is_empty() {
            println!("\n❌ Errors encountered: {}", stats.errors.len());
            for (i, error) in stats.errors.iter().take(5).enumerate() {
                println!("   {}. [{}] Height {:?}: {}", i + 1, error.stage, error.height, error.message);
            }
            if stats.errors.len() > 5 {
                println!("   ... and {} more errors", stats.errors.len() - 5);
            }
        }
    }
}

#[derive(Default)]
struct WorkerReport {
    blocks: u64,
    summary: BlockSummary,
    last_height: Option<u64>,
    gateway: GatewayStats,
    stopped: bool,
    failed_height: Option<u64>,
    errors: Vec<anyhow::Error>,
}

struct Worker<C, S> {
    id: usize,
    chain: Arc<ChainReader<C>>,
    gateway: StorageGateway<S>,
    concurrency: Concurrency,
    stop: Arc<AtomicBool>,
    receiver: async_channel::Receiver<(u64, String)>,
}

impl<C: ChainSource, S: DocumentStore> Worker<C, S> {
    async fn run(self) -> WorkerReport {
        let mut report = WorkerReport::default();
        let processor = BlockProcessor::new(&self.gateway, self.concurrency);

        while let Ok((height, hash)) = self.receiver.recv().await {
            if self.stop.load(Ordering::SeqCst) {
                report.stopped = true;
                break;
            }

            let processed = match extract_block(self.chain.as_ref(), &hash).await {
                Ok(block) => processor.process_block(&block).await,
                Err(e) => Err(e),
            };

            match processed {
                Ok(summary) => {
                    report.blocks += 1;
                    report.summary.merge(&summary);
                    report.last_height = report.last_height.max(Some(height));
                }
                Err(e) => {
                    let context = format!("Failed to ingest block {} at height {}", hash, height);
                    report.failed_height = Some(height);
                    report.errors =
                        e.into_failures().into_iter().map(|f| anyhow::Error::new(f).context(context.clone())).collect();
                    // stops dispatch; queued heights are still taken by the others
                    self.receiver.close();
                    break;
                }
            }
        }

        if let Err(e) = self.gateway.flush_all().await {
            if report.errors.is_empty() {
                report.errors.push(anyhow::Error::new(e).context("Failed to drain worker buffers"));
            }
        }
        report.gateway = self.gateway.stats();

        tracing::debug!("Worker {} finished after {} blocks", self.id, report.blocks);
        report
    }
}
