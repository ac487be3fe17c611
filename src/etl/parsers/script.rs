/// Script Parser
///
/// Resolves the addresses an output pays to from its decoded scriptPubKey.
///
/// Newer nodes report a single `address` field; older nodes report an
/// `addresses` array (one entry per key for bare multisig). Both are honoured,
/// the single field taking precedence.
use crate::rpc::types::ScriptPubKey;

/// Script template reported by the node's `type` field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptKind {
    PubKey,
    PubKeyHash,
    ScriptHash,
    MultiSig,
    WitnessV0KeyHash,
    WitnessV0ScriptHash,
    WitnessV1Taproot,
    WitnessUnknown,
    NullData,
    NonStandard,
    Other(String),
}

impl ScriptKind {
    pub fn parse(script_type: &str) -> Self {
        match script_type {
            "pubkey" => Self::PubKey,
            "pubkeyhash" => Self::PubKeyHash,
            "scripthash" => Self::ScriptHash,
            "multisig" => Self::MultiSig,
            "witness_v0_keyhash" => Self::WitnessV0KeyHash,
            "witness_v0_scripthash" => Self::WitnessV0ScriptHash,
            "witness_v1_taproot" => Self::WitnessV1Taproot,
            "witness_unknown" => Self::WitnessUnknown,
            "nulldata" => Self::NullData,
            "nonstandard" => Self::NonStandard,
            other => Self::Other(other.to_string()),
        }
    }

    /// Outputs of these kinds are expected to have no address
    pub fn is_unspendable(&self) -> bool {
        matches!(self, Self::NullData | Self::NonStandard)
    }
}

/// Addresses resolved from one output script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptAddresses {
    pub kind: ScriptKind,
    pub addresses: Vec<String>,
}

impl ScriptAddresses {
    /// A missing address is only anomalous for spendable script kinds
    pub fn is_anomalous_empty(&self) -> bool {
        self.addresses.is_empty() && !self.kind.is_unspendable()
    }
}

/// Resolve the addresses paid by `script`, preserving order and dropping duplicates
pub fn resolve_addresses(script: &ScriptPubKey) -> ScriptAddresses {
    let kind = ScriptKind::parse(&script.script_type);

    let mut addresses: Vec<String> = Vec::new();
    let candidates = script.address.iter().chain(script.addresses.iter().flatten());
    for address in candidates {
        if !address.is_empty() && !addresses.contains(address) {
            addresses.push(address.clone());
        }
    }

    ScriptAddresses { kind, addresses }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script(script_type: &str, address: Option<&str>, addresses: Option<Vec<&str>>) -> ScriptPubKey {
        ScriptPubKey {
            script_type: script_type.to_string(),
            address: address.map(String::from),
            addresses: addresses.map(|a| a.into_iter().map(String::from).collect()),
            ..Default::default()
        }
    }

    #[test]
    fn test_single_address_field() {
        let resolved = resolve_addresses(&script("witness_v0_keyhash", Some("bc1qxyz"), None));
        assert_eq!(resolved.kind, ScriptKind::WitnessV0KeyHash);
        assert_eq!(resolved.addresses, vec!["bc1qxyz"]);
        assert!(!resolved.is_anomalous_empty());
    }

    #[test]
    fn test_legacy_multisig_keeps_every_address() {
        let resolved = resolve_addresses(&script("multisig", None, Some(vec!["1A", "1B", "1A", "1C"])));
        assert_eq!(resolved.kind, ScriptKind::MultiSig);
        assert_eq!(resolved.addresses, vec!["1A", "1B", "1C"]);
    }

    #[test]
    fn test_address_field_wins_over_legacy_array() {
        let resolved = resolve_addresses(&script("pubkeyhash", Some("1A"), Some(vec!["1A"])));
        assert_eq!(resolved.addresses, vec!["1A"]);
    }

    #[test]
    fn test_unspendable_scripts_are_not_anomalous() {
        let nulldata = resolve_addresses(&script("nulldata", None, None));
        assert!(nulldata.addresses.is_empty());
        assert!(!nulldata.is_anomalous_empty());

        let nonstandard = resolve_addresses(&script("nonstandard", None, None));
        assert!(!nonstandard.is_anomalous_empty());

        let bare_pubkey = resolve_addresses(&script("pubkey", None, None));
        assert!(bare_pubkey.is_anomalous_empty());
    }

    #[test]
    fn test_unknown_script_type() {
        assert_eq!(ScriptKind::parse("anchor"), ScriptKind::Other("anchor".to_string()));
        assert!(!ScriptKind::parse("anchor").is_unspendable());
    }
}
