/// Extract Module
///
/// Fetches verbose blocks from the node and parses them into typed blocks the
/// block processor walks. Amounts are converted to base units here; output
/// scripts are passed through untouched so the processor can reject outputs
/// that lack one.
use crate::error::{IngestError, Result};
use crate::etl::parsers::amount::coins_to_units;
use crate::rpc::types::{RpcBlock, RpcInput, RpcTransaction, ScriptPubKey};
use crate::rpc::{ChainReader, ChainSource};

/// Extracted block data with parsed transactions
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedBlock {
    pub hash: String,
    pub height: u64,
    pub time: i64,
    pub next_hash: Option<String>,
    pub transactions: Vec<ExtractedTransaction>,
}

impl ExtractedBlock {
    pub fn txids(&self) -> Vec<String> {
        self.transactions.iter().map(|tx| tx.txid.clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedTransaction {
    pub txid: String,
    pub inputs: Vec<ExtractedInput>,
    pub outputs: Vec<ExtractedOutput>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractedInput {
    /// New coins; no previous output
    Coinbase,
    /// Spend of output `vout` of `txid`
    Spend { txid: String, vout: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedOutput {
    pub index: u32,
    /// Base units
    pub value: u64,
    pub script: Option<ScriptPubKey>,
}

/// Parse a verbose block
pub fn parse_block(block: RpcBlock) -> Result<ExtractedBlock> {
    let transactions = block.tx.into_iter().map(parse_transaction).collect::<Result<Vec<_>>>()?;

    Ok(ExtractedBlock {
        hash: block.hash,
        height: block.height,
        time: block.time,
        next_hash: block.next_block_hash,
        transactions,
    })
}

fn parse_transaction(tx: RpcTransaction) -> Result<ExtractedTransaction> {
    let inputs = tx
        .vin
        .into_iter()
        .enumerate()
        .map(|(index, input)| parse_input(&tx.txid, index, input))
        .collect::<Result<Vec<_>>>()?;

    let outputs = tx
        .vout
        .into_iter()
        .map(|out| ExtractedOutput { index: out.n, value: coins_to_units(out.value), script: out.script_pub_key })
        .collect();

    Ok(ExtractedTransaction { txid: tx.txid, inputs, outputs })
}

fn parse_input(txid: &str, index: usize, input: RpcInput) -> Result<ExtractedInput> {
    if input.coinbase.is_some() {
        return Ok(ExtractedInput::Coinbase);
    }

    match (input.txid, input.vout) {
        (Some(txid), Some(vout)) => Ok(ExtractedInput::Spend { txid, vout }),
        _ => Err(IngestError::MalformedInput { txid: txid.to_string(), index }),
    }
}

/// Fetch and parse a single block
pub async fn extract_block<C: ChainSource>(reader: &ChainReader<C>, hash: &str) -> Result<ExtractedBlock> {
    let block = reader.get_block(hash).await?;
    let extracted = parse_block(block)?;

    tracing::debug!(
        "Extracted block {} at height {} with {} transactions",
        extracted.hash,
        extracted.height,
        extracted.transactions.len()
    );
    Ok(extracted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::mock::{block, coinbase_tx, spend_tx, MockChain};
    use crate::rpc::types::RpcOutput;

    #[test]
    fn test_parse_block_inputs_and_outputs() {
        let raw = block(
            "h2",
            2,
            vec![coinbase_tx("c2", 50.0, "A"), spend_tx("t2", &[("c1", 0)], &[(30.0, "B"), (19.99999999, "C")])],
        );

        let parsed = parse_block(raw).unwrap();
        assert_eq!(parsed.txids(), vec!["c2", "t2"]);

        let coinbase = &parsed.transactions[0];
        assert_eq!(coinbase.inputs, vec![ExtractedInput::Coinbase]);

        let spend = &parsed.transactions[1];
        assert_eq!(spend.inputs[0], ExtractedInput::Spend { txid: "c1".to_string(), vout: 0 });
        assert_eq!(spend.outputs[0].value, 3_000_000_000);
        assert_eq!(spend.outputs[1].value, 1_999_999_999);
        assert_eq!(spend.outputs[1].index, 1);
    }

    #[test]
    fn test_output_without_script_is_kept_for_processor() {
        let mut tx = coinbase_tx("c1", 50.0, "A");
        tx.vout.push(RpcOutput { value: 0.0, n: 1, script_pub_key: None });

        let parsed = parse_block(block("h1", 1, vec![tx])).unwrap();
        assert!(parsed.transactions[0].outputs[1].script.is_none());
    }

    #[test]
    fn test_input_without_reference_is_malformed() {
        let mut tx = spend_tx("t1", &[("c0", 0)], &[(1.0, "A")]);
        tx.vin.push(RpcInput { txid: Some("c0".to_string()), vout: None, coinbase: None });

        let err = parse_block(block("h1", 1, vec![tx])).unwrap_err();
        assert!(matches!(err, IngestError::MalformedInput { ref txid, index: 1 } if txid == "t1"));
    }

    #[tokio::test]
    async fn test_extract_block_follows_chain_links() {
        let chain = MockChain::linked(vec![
            block("h1", 1, vec![coinbase_tx("c1", 50.0, "A")]),
            block("h2", 2, vec![coinbase_tx("c2", 50.0, "B")]),
        ]);
        let reader = ChainReader::new(chain, false);

        let first = extract_block(&reader, "h1").await.unwrap();
        assert_eq!(first.next_hash.as_deref(), Some("h2"));

        let second = extract_block(&reader, "h2").await.unwrap();
        assert_eq!(second.height, 2);
        assert!(second.next_hash.is_none());
    }
}
