/// RPC Types
///
/// Wire shapes of the node's JSON-RPC interface, as returned by
/// `getblock <hash> 2` (block with fully decoded transactions).
use serde::{Deserialize, Serialize};

/// JSON-RPC 1.0 request envelope
#[derive(Debug, Serialize)]
pub struct RpcRequest<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    pub params: serde_json::Value,
}

/// JSON-RPC response envelope; exactly one of `result`/`error` is set
#[derive(Debug, Deserialize)]
pub struct RpcResponse<T> {
    pub result: Option<T>,
    pub error: Option<RpcErrorObject>,
    #[allow(dead_code)]
    pub id: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
}

/// Verbose block with every transaction decoded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcBlock {
    pub hash: String,
    pub height: u64,
    pub time: i64,
    #[serde(default, rename = "previousblockhash")]
    pub previous_block_hash: Option<String>,
    #[serde(default, rename = "nextblockhash")]
    pub next_block_hash: Option<String>,
    #[serde(default)]
    pub tx: Vec<RpcTransaction>,
}

impl RpcBlock {
    pub fn header(&self) -> BlockHeader {
        BlockHeader { hash: self.hash.clone(), height: self.height, time: self.time }
    }
}

/// The parts of a block the driver needs without its transactions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub hash: String,
    pub height: u64,
    pub time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcTransaction {
    pub txid: String,
    #[serde(default)]
    pub vin: Vec<RpcInput>,
    #[serde(default)]
    pub vout: Vec<RpcOutput>,
}

/// Either a coinbase input (`coinbase` set) or a spend of `txid:vout`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coinbase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vout: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcOutput {
    /// Decimal coin amount
    pub value: f64,
    pub n: u32,
    #[serde(default, rename = "scriptPubKey", skip_serializing_if = "Option::is_none")]
    pub script_pub_key: Option<ScriptPubKey>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptPubKey {
    #[serde(rename = "type")]
    pub script_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addresses: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asm: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hex: Option<String>,
}
