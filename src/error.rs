/// Error Module
///
/// Typed failures of the ingestion core. Application layers wrap these in
/// `anyhow` with context; tests match on the variants directly.
use thiserror::Error;

use crate::db::StoreError;
use crate::rpc::ChainReadError;

/// Result type used by the block processor and storage gateway
pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Error, Debug)]
pub enum IngestError {
    /// An output arrived without a script/claim descriptor
    #[error("Output {txid}:{index} has no scriptPubKey")]
    MalformedOutput { txid: String, index: u32 },

    /// An input is neither coinbase nor a reference to a previous output
    #[error("Input {index} of transaction {txid} has no previous output reference")]
    MalformedInput { txid: String, index: usize },

    #[error("Chain read error: {0}")]
    Chain(#[from] ChainReadError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Several sibling tasks of one concurrent step failed
    #[error("{} concurrent tasks failed", .0.len())]
    Concurrent(Vec<IngestError>),
}

impl IngestError {
    /// Combine sibling failures; a lone failure is returned as is
    pub fn from_failures(mut failures: Vec<IngestError>) -> Option<Self> {
        match failures.len() {
            0 => None,
            1 => failures.pop(),
            _ => Some(Self::Concurrent(failures)),
        }
    }

    /// Every underlying failure, with nested aggregates flattened
    pub fn into_failures(self) -> Vec<IngestError> {
        match self {
            Self::Concurrent(failures) => failures.into_iter().flat_map(Self::into_failures).collect(),
            other => vec![other],
        }
    }
}
