/// Transform Module
///
/// Turns an extracted block into documents and hands them to the storage
/// gateway: every input becomes a "spent by" edge (coinbase inputs first mint a
/// pseudo-output carrying the block subsidy), every output becomes an output
/// document with a "produced" edge, and every address an output pays to gets
/// the output merged into its address document plus a "received" edge.
///
/// A transaction's summary is written only after all of its inputs and outputs,
/// and the block summary only after all of its transactions.
use futures::future::{join_all, BoxFuture, FutureExt};

use crate::db::DocumentStore;
use crate::error::{IngestError, Result};
use crate::etl::extract::{ExtractedBlock, ExtractedInput, ExtractedOutput, ExtractedTransaction};
use crate::etl::load::StorageGateway;
use crate::etl::parsers::{block_subsidy, resolve_addresses};
use crate::models::{output_key, BlockDoc, Document, EdgeDoc, OutputDoc, TransactionDoc};

/// How the per-transaction and per-input/output work of a block is scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Concurrency {
    /// One unit at a time; the first failure stops the block
    #[default]
    Sequential,
    /// Every unit at a level runs concurrently; all are awaited and every
    /// failure is returned
    Concurrent,
}

/// Counters for the work done on one or more blocks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockSummary {
    pub transactions: u64,
    pub inputs: u64,
    pub outputs: u64,
    /// Address associations recorded
    pub addresses: u64,
    /// Inputs whose spent output could not be found
    pub missing_inputs: u64,
    pub warnings: u64,
}

impl BlockSummary {
    pub fn merge(&mut self, other: &BlockSummary) {
        self.transactions += other.transactions;
        self.inputs += other.inputs;
        self.outputs += other.outputs;
        self.addresses += other.addresses;
        self.missing_inputs += other.missing_inputs;
        self.warnings += other.warnings;
    }
}

pub struct BlockProcessor<'a, S> {
    gateway: &'a StorageGateway<S>,
    mode: Concurrency,
}

impl<'a, S: DocumentStore> BlockProcessor<'a, S> {
    pub fn new(gateway: &'a StorageGateway<S>, mode: Concurrency) -> Self {
        Self { gateway, mode }
    }

    /// Derive and save every document of `block`
    pub async fn process_block(&self, block: &ExtractedBlock) -> Result<BlockSummary> {
        let tasks = block
            .transactions
            .iter()
            .enumerate()
            .map(|(position, tx)| self.process_transaction(block, position, tx).boxed())
            .collect();
        let summary = self.run_all(tasks).await?;

        self.gateway
            .save(Document::Block(BlockDoc {
                hash: block.hash.clone(),
                height: block.height,
                time: block.time,
                transactions: block.txids(),
            }))
            .await?;

        tracing::debug!(
            "Processed block {} at height {}: {} txs, {} inputs, {} outputs",
            block.hash,
            block.height,
            summary.transactions,
            summary.inputs,
            summary.outputs
        );
        Ok(summary)
    }

    async fn process_transaction(
        &self,
        block: &ExtractedBlock,
        position: usize,
        tx: &ExtractedTransaction,
    ) -> Result<BlockSummary> {
        let inputs = tx
            .inputs
            .iter()
            .enumerate()
            .map(|(index, input)| self.process_input(block, position, tx, index, input).boxed());
        let outputs = tx.outputs.iter().map(|output| self.process_output(tx, output).boxed());

        let mut summary = self.run_all(inputs.chain(outputs).collect()).await?;

        self.gateway
            .save(Document::Transaction(TransactionDoc { txid: tx.txid.clone(), block: block.hash.clone() }))
            .await?;

        summary.transactions += 1;
        Ok(summary)
    }

    async fn process_input(
        &self,
        block: &ExtractedBlock,
        position: usize,
        tx: &ExtractedTransaction,
        index: usize,
        input: &ExtractedInput,
    ) -> Result<BlockSummary> {
        let mut summary = BlockSummary { inputs: 1, ..Default::default() };

        let (spent_key, value) = match input {
            ExtractedInput::Coinbase => {
                if position != 0 || index != 0 {
                    tracing::warn!(
                        "Coinbase input {} of transaction {} at position {} in block {}",
                        index,
                        tx.txid,
                        position,
                        block.hash
                    );
                    summary.warnings += 1;
                }

                let minted = OutputDoc::coinbase(&tx.txid, block_subsidy(block.height));
                let key = minted.key.clone();
                let value = minted.value;
                self.gateway.save(Document::Output(minted)).await?;
                (key, value)
            }
            ExtractedInput::Spend { txid, vout } => {
                let key = output_key(txid, *vout);
                let value = match self.gateway.resolve_output(&key).await? {
                    Some(spent) => spent.value,
                    None => {
                        tracing::warn!("Output {} spent by {} not found, recording value 0", key, tx.txid);
                        summary.missing_inputs += 1;
                        summary.warnings += 1;
                        0
                    }
                };
                (key, value)
            }
        };

        self.gateway.save(Document::Spent(EdgeDoc::spent(&spent_key, &tx.txid, value))).await?;
        Ok(summary)
    }

    async fn process_output(&self, tx: &ExtractedTransaction, output: &ExtractedOutput) -> Result<BlockSummary> {
        let mut summary = BlockSummary { outputs: 1, ..Default::default() };

        let doc = OutputDoc::from_script(&tx.txid, output.index, output.value, output.script.as_ref())?;
        let key = doc.key.clone();
        self.gateway.save(Document::Output(doc)).await?;
        self.gateway.save(Document::Produced(EdgeDoc::produced(&tx.txid, &key))).await?;

        let Some(script) = &output.script else {
            return Ok(summary);
        };

        let resolved = resolve_addresses(script);
        if resolved.is_anomalous_empty() {
            tracing::warn!("Output {} ({}) pays to no address", key, script.script_type);
            summary.warnings += 1;
        }
        if resolved.addresses.len() > 1 {
            tracing::warn!("Output {} pays to {} addresses", key, resolved.addresses.len());
            summary.warnings += 1;
        }

        for address in &resolved.addresses {
            self.gateway.merge_address(address, &key).await?;
            self.gateway.save(Document::Received(EdgeDoc::received(address, &key))).await?;
            summary.addresses += 1;
        }

        Ok(summary)
    }

    async fn run_all(&self, tasks: Vec<BoxFuture<'_, Result<BlockSummary>>>) -> Result<BlockSummary> {
        let mut summary = BlockSummary::default();

        match self.mode {
            Concurrency::Sequential => {
                for task in tasks {
                    summary.merge(&task.await?);
                }
            }
            Concurrency::Concurrent => {
                let mut failures = Vec::new();
                for result in join_all(tasks).await {
                    match result {
                        Ok(done) => summary.merge(&done),
                        Err(e) => failures.extend(e.into_failures()),
                    }
                }
                if let Some(e) = IngestError::from_failures(failures) {
                    return Err(e);
                }
            }
        }

        Ok(summary)
    }
}
