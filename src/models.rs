/// Data Models Module
///
/// This module defines the documents persisted by the loader and the collections
/// they live in. Every entity is keyed by a natural identifier (block hash, txid,
/// output id, address) so replaying a block rewrites the same documents.
use serde::{Deserialize, Serialize};

use crate::error::IngestError;
use crate::etl::parsers::amount::{self, units_to_coins};
use crate::rpc::types::ScriptPubKey;

/// Name of the graph composed from the three edge collections
pub const GRAPH_NAME: &str = "chain_graph";

/// Script type recorded on the implicit coinbase pseudo-output
pub const COINBASE_SCRIPT_TYPE: &str = "coinbase";

/// Whether a collection holds plain documents or graph edges
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionKind {
    Document,
    Edge,
}

/// Every collection managed by the loader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Collection {
    Blocks,
    Transactions,
    Outputs,
    Addresses,
    /// address → output
    Received,
    /// output → transaction
    Spent,
    /// transaction → output
    Produced,
    /// Named graph definitions
    Graphs,
}

impl Collection {
    /// Collections holding chain data; `Graphs` is bootstrap metadata only
    pub const ALL: [Collection; 7] = [
        Collection::Blocks,
        Collection::Transactions,
        Collection::Outputs,
        Collection::Addresses,
        Collection::Received,
        Collection::Spent,
        Collection::Produced,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Blocks => "blocks",
            Self::Transactions => "transactions",
            Self::Outputs => "outputs",
            Self::Addresses => "addresses",
            Self::Received => "address_received",
            Self::Spent => "output_spent_by",
            Self::Produced => "transaction_produced",
            Self::Graphs => "graphs",
        }
    }

    pub fn kind(&self) -> CollectionKind {
        match self {
            Self::Received | Self::Spent | Self::Produced => CollectionKind::Edge,
            _ => CollectionKind::Document,
        }
    }

    /// Collection-qualified document handle, as used by edge endpoints
    pub fn qualify(&self, key: &str) -> String {
        format!("{}/{}", self.name(), key)
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One edge definition of the named graph
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EdgeDefinition {
    pub collection: &'static str,
    pub from: Vec<&'static str>,
    pub to: Vec<&'static str>,
}

/// Named graph composed from the edge collections
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphDefinition {
    #[serde(rename = "_key")]
    pub name: &'static str,
    pub edge_definitions: Vec<EdgeDefinition>,
}

impl GraphDefinition {
    pub fn chain_graph() -> Self {
        let edge = |edges: Collection, from: Collection, to: Collection| EdgeDefinition {
            collection: edges.name(),
            from: vec![from.name()],
            to: vec![to.name()],
        };

        Self {
            name: GRAPH_NAME,
            edge_definitions: vec![
                edge(Collection::Received, Collection::Addresses, Collection::Outputs),
                edge(Collection::Spent, Collection::Outputs, Collection::Transactions),
                edge(Collection::Produced, Collection::Transactions, Collection::Outputs),
            ],
        }
    }
}

/// Key of a real output: `<txid>:<index>`
pub fn output_key(txid: &str, index: u32) -> String {
    format!("{}:{}", txid, index)
}

/// Key of the coinbase pseudo-output: `<txid>:coinbase`
pub fn coinbase_key(txid: &str) -> String {
    format!("{}:coinbase", txid)
}

/// Block summary; the block collection's max height is the resume checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockDoc {
    #[serde(rename = "_key")]
    pub hash: String,
    pub height: u64,
    pub time: i64,
    pub transactions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionDoc {
    #[serde(rename = "_key")]
    pub txid: String,
    pub block: String,
}

/// A produced output (or the coinbase pseudo-output)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputDoc {
    #[serde(rename = "_key")]
    pub key: String,
    /// Stored as a decimal coin amount, held here in base units
    #[serde(with = "amount::coin_serde")]
    pub value: u64,
    pub script_type: String,
}

impl OutputDoc {
    /// Build the document for output `index` of `txid`.
    ///
    /// An output without a claim descriptor violates the node's data contract
    /// and is rejected here, before anything reaches storage.
    pub fn from_script(txid: &str, index: u32, value: u64, script: Option<&ScriptPubKey>) -> Result<Self, IngestError> {
        let script = script.ok_or_else(|| IngestError::MalformedOutput { txid: txid.to_string(), index })?;

        Ok(Self { key: output_key(txid, index), value, script_type: script.script_type.clone() })
    }

    pub fn coinbase(txid: &str, subsidy: u64) -> Self {
        Self { key: coinbase_key(txid), value: subsidy, script_type: COINBASE_SCRIPT_TYPE.to_string() }
    }
}

/// An address and every output it has received
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressDoc {
    #[serde(rename = "_key")]
    pub address: String,
    pub outputs: Vec<String>,
}

impl AddressDoc {
    pub fn new(address: &str) -> Self {
        Self { address: address.to_string(), outputs: Vec::new() }
    }

    /// Add an output association. Returns false if it was already recorded.
    pub fn merge(&mut self, output_key: &str) -> bool {
        if self.outputs.iter().any(|o| o == output_key) {
            return false;
        }
        self.outputs.push(output_key.to_string());
        true
    }
}

/// Directed graph edge between two collection-qualified documents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeDoc {
    #[serde(rename = "_key")]
    pub key: String,
    #[serde(rename = "_from")]
    pub from: String,
    #[serde(rename = "_to")]
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

impl EdgeDoc {
    /// address → output
    pub fn received(address: &str, output_key: &str) -> Self {
        Self {
            key: format!("{}:{}", address, output_key),
            from: Collection::Addresses.qualify(address),
            to: Collection::Outputs.qualify(output_key),
            value: None,
        }
    }

    /// output → spending transaction, keyed by the output so a replay rewrites it
    pub fn spent(output_key: &str, txid: &str, value: u64) -> Self {
        Self {
            key: output_key.to_string(),
            from: Collection::Outputs.qualify(output_key),
            to: Collection::Transactions.qualify(txid),
            value: Some(units_to_coins(value)),
        }
    }

    /// transaction → produced output
    pub fn produced(txid: &str, output_key: &str) -> Self {
        Self {
            key: output_key.to_string(),
            from: Collection::Transactions.qualify(txid),
            to: Collection::Outputs.qualify(output_key),
            value: None,
        }
    }
}

/// A document tagged with the entity kind it belongs to.
///
/// Address documents are not listed: they only change through
/// `StorageGateway::merge_address`.
#[derive(Debug, Clone, PartialEq)]
pub enum Document {
    Block(BlockDoc),
    Transaction(TransactionDoc),
    Output(OutputDoc),
    Received(EdgeDoc),
    Spent(EdgeDoc),
    Produced(EdgeDoc),
    Graph(GraphDefinition),
}

impl Document {
    pub fn collection(&self) -> Collection {
        match self {
            Self::Block(_) => Collection::Blocks,
            Self::Transaction(_) => Collection::Transactions,
            Self::Output(_) => Collection::Outputs,
            Self::Received(_) => Collection::Received,
            Self::Spent(_) => Collection::Spent,
            Self::Produced(_) => Collection::Produced,
            Self::Graph(_) => Collection::Graphs,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Self::Block(d) => &d.hash,
            Self::Transaction(d) => &d.txid,
            Self::Output(d) => &d.key,
            Self::Received(e) | Self::Spent(e) | Self::Produced(e) => &e.key,
            Self::Graph(g) => g.name,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            Self::Block(d) => serde_json::to_value(d),
            Self::Transaction(d) => serde_json::to_value(d),
            Self::Output(d) => serde_json::to_value(d),
            Self::Received(e) | Self::Spent(e) | Self::Produced(e) => serde_json::to_value(e),
            Self::Graph(g) => serde_json::to_value(g),
        }
    }
}
