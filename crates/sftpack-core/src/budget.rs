//! Character budget applied to free text before tokenization.
//!
//! Tokenizing pathological inputs (multi-megabyte files, minified blobs) is
//! far more expensive than slicing them, so every text field is hard-cut to an
//! approximate token budget first, assuming four characters per token.

use serde::{Deserialize, Serialize};

/// Characters assumed per token by the truncation heuristic.
pub const CHARS_PER_TOKEN: usize = 4;

/// Default token budget per text field.
pub const DEFAULT_MAX_TOKENS: usize = 32_000;

/// Approximate per-field token budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextBudget {
    max_tokens: usize,
}

impl TextBudget {
    /// Create a budget of `max_tokens` tokens.
    pub const fn new(max_tokens: usize) -> Self {
        Self { max_tokens }
    }

    /// Token budget.
    pub const fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// Character limit derived from the token budget.
    pub const fn char_limit(&self) -> usize {
        self.max_tokens.saturating_mul(CHARS_PER_TOKEN)
    }

    /// Cut `text` to at most [`char_limit`](Self::char_limit) characters.
    ///
    /// Counts Unicode scalar values, so a cut never lands inside a code point.
    /// Returns `true` when the text was shortened.
    pub fn clip(&self, text: &mut String) -> bool {
        let limit = self.char_limit();
        // Byte length bounds the char count from above.
        if text.len() <= limit {
            return false;
        }
        match text.char_indices().nth(limit) {
            Some((byte_offset, _)) => {
                text.truncate(byte_offset);
                true
            }
            None => false,
        }
    }
}

impl Default for TextBudget {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TOKENS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limit() {
        assert_eq!(TextBudget::default().char_limit(), 128_000);
    }

    #[test]
    fn test_short_text_untouched() {
        let budget = TextBudget::new(2);
        let mut text = "abcdefgh".to_string();
        assert!(!budget.clip(&mut text));
        assert_eq!(text, "abcdefgh");
    }

    #[test]
    fn test_long_text_cut_at_limit() {
        let budget = TextBudget::new(2);
        let mut text = "abcdefghij".to_string();
        assert!(budget.clip(&mut text));
        assert_eq!(text, "abcdefgh");
    }

    #[test]
    fn test_multibyte_counts_characters() {
        let budget = TextBudget::new(1);
        // 5 chars, 15 bytes
        let mut text = "日本語です".to_string();
        assert!(budget.clip(&mut text));
        assert_eq!(text, "日本語で");
        assert_eq!(text.chars().count(), 4);

        // 4 chars, 12 bytes: byte length exceeds the limit but char count does not
        let mut exact = "日本語で".to_string();
        assert!(!budget.clip(&mut exact));
        assert_eq!(exact, "日本語で");
    }
}
