//! Streaming ingestion of Transparency in Coverage in-network rate files.
//!
//! A payer's documents are listed from its index, streamed and decompressed,
//! decoded incrementally, filtered to the configured billing codes, resolved
//! against provider-group references and written as one row per price and
//! provider into a DuckDB rate store. Progress is tracked per document in an
//! ingestion ledger so interrupted runs resume where they stopped.

pub mod common;
pub mod config;
pub mod decode;
pub mod error;
pub mod fetch;
pub mod filter;
pub mod model;
pub mod normalize;
pub mod pipeline;
pub mod providers;
pub mod report;
pub mod resolve;
pub mod source;
pub mod store;
