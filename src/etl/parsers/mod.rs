/// Parsers Module
///
/// Decoders for the node's verbose block data: output scripts and amounts.
pub mod amount;
pub mod script;

pub use amount::block_subsidy;
pub use script::resolve_addresses;
