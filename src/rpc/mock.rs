/// Scripted chain for tests, plus builders for verbose blocks.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::types::{RpcBlock, RpcInput, RpcOutput, RpcTransaction, ScriptPubKey};
use super::{ChainReadError, ChainSource};

#[derive(Clone, Default)]
pub struct MockChain {
    blocks: Arc<HashMap<String, RpcBlock>>,
    by_height: Arc<HashMap<u64, String>>,
    best: Option<String>,
    fetched: Arc<Mutex<Vec<String>>>,
    stop_on: Option<(String, Arc<AtomicBool>)>,
}

impl MockChain {
    /// Chain the blocks in the given order through previous/next hashes
    pub fn linked(mut blocks: Vec<RpcBlock>) -> Self {
        for i in 0..blocks.len() {
            blocks[i].previous_block_hash = i.checked_sub(1).map(|p| blocks[p].hash.clone());
            blocks[i].next_block_hash = blocks.get(i + 1).map(|n| n.hash.clone());
        }

        let best = blocks.last().map(|b| b.hash.clone());
        let by_height = blocks.iter().map(|b| (b.height, b.hash.clone())).collect();
        let blocks = blocks.into_iter().map(|b| (b.hash.clone(), b)).collect();

        Self { blocks: Arc::new(blocks), by_height: Arc::new(by_height), best, ..Default::default() }
    }

    /// Latch `flag` as soon as block `hash` is fetched
    pub fn with_stop_on(mut self, hash: &str, flag: Arc<AtomicBool>) -> Self {
        self.stop_on = Some((hash.to_string(), flag));
        self
    }

    /// Hashes passed to `get_block`, in call order
    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChainSource for MockChain {
    async fn get_best_block_hash(&self) -> Result<String, ChainReadError> {
        self.best.clone().ok_or(ChainReadError::EmptyResult { method: "getbestblockhash" })
    }

    async fn get_block(&self, hash: &str) -> Result<RpcBlock, ChainReadError> {
        self.fetched.lock().unwrap().push(hash.to_string());
        if let Some((stop_hash, flag)) = &self.stop_on {
            if stop_hash == hash {
                flag.store(true, Ordering::SeqCst);
            }
        }

        self.blocks.get(hash).cloned().ok_or_else(|| ChainReadError::BlockNotFound(hash.to_string()))
    }

    async fn get_block_hash(&self, height: u64) -> Result<String, ChainReadError> {
        self.by_height.get(&height).cloned().ok_or(ChainReadError::HeightNotFound(height))
    }
}

pub fn block(hash: &str, height: u64, tx: Vec<RpcTransaction>) -> RpcBlock {
    RpcBlock {
        hash: hash.to_string(),
        height,
        time: 1_231_006_505 + height as i64 * 600,
        previous_block_hash: None,
        next_block_hash: None,
        tx,
    }
}

pub fn pay_to(address: &str) -> ScriptPubKey {
    ScriptPubKey { script_type: "pubkeyhash".to_string(), address: Some(address.to_string()), ..Default::default() }
}

pub fn output(n: u32, value: f64, script: Option<ScriptPubKey>) -> RpcOutput {
    RpcOutput { value, n, script_pub_key: script }
}

pub fn coinbase_tx(txid: &str, value: f64, address: &str) -> RpcTransaction {
    RpcTransaction {
        txid: txid.to_string(),
        vin: vec![RpcInput { coinbase: Some("04ffff001d0104".to_string()), ..Default::default() }],
        vout: vec![output(0, value, Some(pay_to(address)))],
    }
}

/// Transaction spending `spends` (txid, vout) and paying `(value, address)` pairs
pub fn spend_tx(txid: &str, spends: &[(&str, u32)], pays: &[(f64, &str)]) -> RpcTransaction {
    RpcTransaction {
        txid: txid.to_string(),
        vin: spends
            .iter()
            .map(|(prev, vout)| RpcInput { txid: Some(prev.to_string()), vout: Some(*vout), ..Default::default() })
            .collect(),
        vout: pays
            .iter()
            .enumerate()
            .map(|(n, (value, address))| output(n as u32, *value, Some(pay_to(address))))
            .collect(),
    }
}
