//! Core trait definitions.
//!
//! Two seams are pluggable: how a raw record of a given dataset type becomes a
//! conversation ([`NormalizeStrategy`]), and how text becomes token ids
//! ([`TokenCodec`]).

use crate::{
    ConversationRecord, FormatType, PromptPolicy, RecordError, Result, SftPackError, TextBudget,
};

/// Per-record state handed to a [`NormalizeStrategy`].
///
/// Carries the selected format, the instruction policy for the dataset type,
/// and the text budget. Tracks how many fields were clipped.
#[derive(Debug)]
pub struct NormalizeContext<'a> {
    format: FormatType,
    policy: &'a PromptPolicy,
    budget: TextBudget,
    truncated_fields: usize,
}

impl<'a> NormalizeContext<'a> {
    /// Create a context for one record.
    pub fn new(format: FormatType, policy: &'a PromptPolicy, budget: TextBudget) -> Self {
        Self {
            format,
            policy,
            budget,
            truncated_fields: 0,
        }
    }

    /// Selected format type.
    pub fn format(&self) -> FormatType {
        self.format
    }

    /// Instruction policy for the dataset type.
    pub fn policy(&self) -> &'a PromptPolicy {
        self.policy
    }

    /// Apply the text budget to one field.
    pub fn clip(&mut self, mut text: String) -> String {
        if self.budget.clip(&mut text) {
            self.truncated_fields += 1;
        }
        text
    }

    /// Number of fields clipped so far.
    pub fn truncated_fields(&self) -> usize {
        self.truncated_fields
    }
}

/// Maps one raw record of a dataset type into a conversation record.
///
/// Implementations must be pure: the same input and context always give the
/// same output, and nothing outside the context is touched. The output does
/// not need to satisfy the canonical invariants; the finalizer repairs it.
pub trait NormalizeStrategy: Send + Sync {
    /// Registry tag of this strategy (the `dataset_type` value).
    fn name(&self) -> &str;

    /// Normalize a parsed JSON record.
    fn normalize(
        &self,
        raw: serde_json::Value,
        ctx: &mut NormalizeContext<'_>,
    ) -> std::result::Result<ConversationRecord, RecordError>;
}

/// Text to token-id codec over a shared, immutable vocabulary.
///
/// Batch-first: the single-item methods wrap a one-element batch.
pub trait TokenCodec: Send + Sync {
    /// Encode many texts, preserving input order.
    fn encode_batch(&self, texts: &[&str]) -> Result<Vec<Vec<u32>>>;

    /// Decode many id sequences, preserving input order.
    fn decode_batch(&self, ids: &[&[u32]]) -> Result<Vec<String>>;

    /// Token used to fill padding positions, if the vocabulary defines one.
    fn pad_token_id(&self) -> Option<u32> {
        None
    }

    /// Encode one text.
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        self.encode_batch(&[text])?
            .pop()
            .ok_or_else(|| SftPackError::InvariantViolation("encode_batch returned no rows".into()))
    }

    /// Decode one id sequence.
    fn decode(&self, ids: &[u32]) -> Result<String> {
        self.decode_batch(&[ids])?
            .pop()
            .ok_or_else(|| SftPackError::InvariantViolation("decode_batch returned no rows".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// One id per byte; enough to exercise the default methods.
    struct ByteCodec;

    impl TokenCodec for ByteCodec {
        fn encode_batch(&self, texts: &[&str]) -> Result<Vec<Vec<u32>>> {
            Ok(texts
                .iter()
                .map(|t| t.bytes().map(u32::from).collect())
                .collect())
        }

        fn decode_batch(&self, ids: &[&[u32]]) -> Result<Vec<String>> {
            ids.iter()
                .map(|seq| {
                    let bytes: Vec<u8> = seq.iter().map(|&id| id as u8).collect();
                    String::from_utf8(bytes).map_err(|e| SftPackError::Tokenizer(e.to_string()))
                })
                .collect()
        }
    }

    #[test]
    fn test_single_item_wrappers() {
        let codec = ByteCodec;
        let ids = codec.encode("hi").unwrap();
        assert_eq!(ids, vec![104, 105]);
        assert_eq!(codec.decode(&ids).unwrap(), "hi");
        assert_eq!(codec.pad_token_id(), None);
    }

    #[test]
    fn test_context_counts_clipped_fields() {
        let policy = PromptPolicy::default();
        let mut ctx = NormalizeContext::new(FormatType::Alpaca, &policy, TextBudget::new(1));
        assert_eq!(ctx.clip("abc".into()), "abc");
        assert_eq!(ctx.clip("abcdef".into()), "abcd");
        assert_eq!(ctx.clip("ghijkl".into()), "ghij");
        assert_eq!(ctx.truncated_fields(), 2);
    }
}
