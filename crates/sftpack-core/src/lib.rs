//! Core types, traits, and configuration for sftpack.
//!
//! This crate provides the foundational abstractions used by the conversion,
//! tokenization and packing engine:
//!
//! - The canonical conversation schema (`ConversationRecord` and friends)
//! - Strategy and codec traits (`NormalizeStrategy`, `TokenCodec`)
//! - Configuration types loadable from YAML
//! - The per-field text budget used for pre-tokenization truncation
//! - Error handling infrastructure

#![warn(missing_docs)]

mod budget;
mod config;
mod error;
mod traits;
mod types;

pub use budget::*;
pub use config::*;
pub use error::*;
pub use traits::*;
pub use types::*;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::budget::{TextBudget, CHARS_PER_TOKEN, DEFAULT_MAX_TOKENS};
    pub use crate::config::*;
    pub use crate::error::{RecordError, Result, SftPackError};
    pub use crate::traits::*;
    pub use crate::types::*;
}
