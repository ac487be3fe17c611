/// ETL Module
///
/// - Extract: fetch verbose blocks from the node and parse them
/// - Transform: derive documents and edges from each block
/// - Load: buffer, merge and persist those documents
pub mod extract;
pub mod load;
pub mod parsers;
pub mod transform;
