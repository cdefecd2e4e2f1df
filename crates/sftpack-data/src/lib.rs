//! Conversion, tokenization and packing engine for sftpack.
//!
//! This crate provides:
//! - Record normalization through a registry of per-dataset-type strategies
//! - Schema finalization and parallel batch conversion to a column table
//! - Table export as JSON, JSON lines, Arrow and Parquet
//! - Tokenizer integration and chat templates with response masking
//! - Greedy sequence packing into fixed-length blocks
//! - An [`Engine`] facade with lifetime counters

#![warn(missing_docs)]

pub mod chat_templates;
pub mod converter;
pub mod dataset;
pub mod engine;
pub mod finalizer;
pub mod metrics;
pub mod normalizer;
pub mod packing;
pub mod table;
pub mod tokenizer;

pub use chat_templates::*;
pub use converter::*;
pub use dataset::*;
pub use engine::*;
pub use finalizer::*;
pub use metrics::*;
pub use normalizer::*;
pub use packing::*;
pub use table::*;
pub use tokenizer::*;
