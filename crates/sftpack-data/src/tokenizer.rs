//! Tokenizer integration.
//!
//! The vocabulary is loaded once and shared behind an [`Arc`]; every method
//! takes `&self`, so a single [`Tokenizer`] can serve all worker threads.
//!
//! `decode(encode(s)) == s` holds for text the vocabulary can represent.
//! Known deviations come from the loaded `tokenizer.json` itself: normalizers
//! (Unicode normalization, lowercasing, accent stripping), unknown-token
//! replacement, and decoders that add or strip a prefix space. Byte-level BPE
//! vocabularies without a normalizer have none. Use
//! [`Tokenizer::check_round_trip`] to list the texts that do not survive.
//!
//! Decoding keeps special tokens, so source text that contains a literal such
//! as `"<|endoftext|>"` decodes back unchanged. [`Tokenizer::decode_skip_special_tokens`]
//! drops them for display.

use sftpack_core::{Result, SftPackError, TokenCodec};
use std::path::Path;
use std::sync::Arc;

/// Wrapper around the tokenizers library.
#[derive(Clone)]
pub struct Tokenizer {
    inner: Arc<tokenizers::Tokenizer>,
}

/// A text that did not survive `decode(encode(text))`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundTripMismatch {
    /// Position in the checked batch.
    pub index: usize,
    /// Input text.
    pub original: String,
    /// Text after the round trip.
    pub decoded: String,
}

impl Tokenizer {
    /// Load a tokenizer from a local `tokenizer.json`.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let inner = tokenizers::Tokenizer::from_file(path).map_err(|e| {
            SftPackError::EngineUnavailable(format!(
                "failed to load tokenizer from {}: {e}; pass the path of a HuggingFace tokenizer.json",
                path.display()
            ))
        })?;
        Ok(Self::from_inner(inner))
    }

    /// Load a tokenizer from the bytes of a `tokenizer.json`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_bytes(bytes).map_err(|e| {
            SftPackError::EngineUnavailable(format!("failed to parse tokenizer definition: {e}"))
        })?;
        Ok(Self::from_inner(inner))
    }

    /// Wrap an already-built tokenizer.
    pub fn from_inner(inner: tokenizers::Tokenizer) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Encode text to token IDs.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        single(self.encode_batch(&[text])?)
    }

    /// Encode text with special tokens.
    pub fn encode_with_special_tokens(&self, text: &str) -> Result<Vec<u32>> {
        single(self.encode_batch_inner(&[text], true)?)
    }

    /// Encode many texts, preserving input order.
    pub fn encode_batch(&self, texts: &[&str]) -> Result<Vec<Vec<u32>>> {
        self.encode_batch_inner(texts, false)
    }

    fn encode_batch_inner(&self, texts: &[&str], add_special_tokens: bool) -> Result<Vec<Vec<u32>>> {
        let encodings = self
            .inner
            .encode_batch(texts.to_vec(), add_special_tokens)
            .map_err(|e| SftPackError::Tokenizer(e.to_string()))?;
        Ok(encodings
            .into_iter()
            .map(|encoding| encoding.get_ids().to_vec())
            .collect())
    }

    /// Decode token IDs to text.
    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        single(self.decode_batch(&[ids])?)
    }

    /// Decode token IDs to text, dropping special tokens.
    pub fn decode_skip_special_tokens(&self, ids: &[u32]) -> Result<String> {
        self.inner
            .decode(ids, true)
            .map_err(|e| SftPackError::Tokenizer(e.to_string()))
    }

    /// Decode many id sequences, preserving input order. Special tokens are kept.
    pub fn decode_batch(&self, ids: &[&[u32]]) -> Result<Vec<String>> {
        self.inner
            .decode_batch(ids, false)
            .map_err(|e| SftPackError::Tokenizer(e.to_string()))
    }

    /// Texts from `texts` that do not round-trip exactly.
    pub fn check_round_trip(&self, texts: &[&str]) -> Result<Vec<RoundTripMismatch>> {
        let encoded = self.encode_batch(texts)?;
        let refs: Vec<&[u32]> = encoded.iter().map(Vec::as_slice).collect();
        let decoded = self.decode_batch(&refs)?;

        Ok(texts
            .iter()
            .zip(decoded)
            .enumerate()
            .filter(|(_, (original, decoded))| **original != decoded.as_str())
            .map(|(index, (original, decoded))| RoundTripMismatch {
                index,
                original: original.to_string(),
                decoded,
            })
            .collect())
    }

    /// Get vocabulary size.
    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    /// Get the underlying tokenizer.
    pub fn inner(&self) -> &tokenizers::Tokenizer {
        &self.inner
    }

    /// Look up a single token.
    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.inner.token_to_id(token)
    }

    /// Get pad token ID if available.
    ///
    /// Tries common pad token names, falls back to EOS token.
    pub fn pad_token_id(&self) -> Option<u32> {
        self.inner
            .token_to_id("<pad>")
            .or_else(|| self.inner.token_to_id("[PAD]"))
            .or_else(|| self.inner.token_to_id("<|pad|>"))
            .or_else(|| self.inner.token_to_id("<|finetune_right_pad_id|>"))
            .or_else(|| self.eos_token_id())
    }

    /// Get EOS token ID if available.
    pub fn eos_token_id(&self) -> Option<u32> {
        self.inner
            .token_to_id("</s>")
            .or_else(|| self.inner.token_to_id("<|endoftext|>"))
            .or_else(|| self.inner.token_to_id("<|end_of_text|>"))
            .or_else(|| self.inner.token_to_id("<|im_end|>"))
            .or_else(|| self.inner.token_to_id("<eos>"))
    }

    /// Get BOS token ID if available.
    pub fn bos_token_id(&self) -> Option<u32> {
        self.inner
            .token_to_id("<s>")
            .or_else(|| self.inner.token_to_id("<|begin_of_text|>"))
            .or_else(|| self.inner.token_to_id("<bos>"))
    }
}

impl std::fmt::Debug for Tokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tokenizer")
            .field("vocab_size", &self.vocab_size())
            .finish()
    }
}

impl TokenCodec for Tokenizer {
    fn encode_batch(&self, texts: &[&str]) -> Result<Vec<Vec<u32>>> {
        Tokenizer::encode_batch(self, texts)
    }

    fn decode_batch(&self, ids: &[&[u32]]) -> Result<Vec<String>> {
        Tokenizer::decode_batch(self, ids)
    }

    fn pad_token_id(&self) -> Option<u32> {
        Tokenizer::pad_token_id(self)
    }
}

fn single<T>(mut batch: Vec<T>) -> Result<T> {
    match (batch.pop(), batch.is_empty()) {
        (Some(item), true) => Ok(item),
        _ => Err(SftPackError::InvariantViolation(
            "tokenizer batch of one returned a different number of rows".to_string(),
        )),
    }
}

/// A byte-level BPE `tokenizer.json` with no merges, so every byte maps to
/// one token and every UTF-8 string round-trips. Byte `b` gets id `b`; the
/// special tokens follow from id 256.
///
/// Used as a self-contained vocabulary by tests and benchmarks.
#[doc(hidden)]
pub fn byte_level_tokenizer_json(special_tokens: &[&str]) -> String {
    let mut vocab = serde_json::Map::new();
    for (byte, ch) in bytes_to_unicode().into_iter().enumerate() {
        vocab.insert(ch.to_string(), serde_json::json!(byte));
    }
    let added: Vec<serde_json::Value> = special_tokens
        .iter()
        .enumerate()
        .map(|(i, content)| {
            let id = 256 + i;
            vocab.insert(content.to_string(), serde_json::json!(id));
            serde_json::json!({
                "id": id,
                "content": content,
                "single_word": false,
                "lstrip": false,
                "rstrip": false,
                "normalized": false,
                "special": true
            })
        })
        .collect();

    serde_json::json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": added,
        "normalizer": null,
        "pre_tokenizer": {
            "type": "ByteLevel",
            "add_prefix_space": false,
            "trim_offsets": true,
            "use_regex": true
        },
        "post_processor": null,
        "decoder": {
            "type": "ByteLevel",
            "add_prefix_space": false,
            "trim_offsets": true,
            "use_regex": true
        },
        "model": {
            "type": "BPE",
            "dropout": null,
            "unk_token": null,
            "continuing_subword_prefix": null,
            "end_of_word_suffix": null,
            "fuse_unk": false,
            "byte_fallback": false,
            "vocab": vocab,
            "merges": []
        }
    })
    .to_string()
}

/// GPT-2 byte to printable-character table, indexed by byte value.
fn bytes_to_unicode() -> Vec<char> {
    let mut printable: Vec<u32> = (u32::from(b'!')..=u32::from(b'~')).collect();
    printable.extend(0xA1..=0xAC);
    printable.extend(0xAE..=0xFF);

    let mut table = vec!['\0'; 256];
    let mut next = 256u32;
    for byte in 0..256u32 {
        let code = if printable.contains(&byte) {
            byte
        } else {
            let code = next;
            next += 1;
            code
        };
        // Codes stay below 0x144, all valid scalar values.
        table[byte as usize] = char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokenizer() -> Tokenizer {
        Tokenizer::from_bytes(byte_level_tokenizer_json(&["<|endoftext|>"]).as_bytes()).unwrap()
    }

    #[test]
    fn test_byte_level_encode() {
        let tok = tokenizer();
        assert!(tok.vocab_size() >= 256);
        assert_eq!(tok.encode("ab").unwrap(), vec![97, 98]);
        assert_eq!(tok.encode("").unwrap(), Vec::<u32>::new());
    }

    #[test]
    fn test_round_trip() {
        let tok = tokenizer();
        let texts = [
            "fn main() {\n    println!(\"hi\");\n}",
            "  leading spaces",
            "日本語 and émojis 🦀",
            "",
        ];
        assert!(tok.check_round_trip(&texts).unwrap().is_empty());
        for text in texts {
            assert_eq!(tok.decode(&tok.encode(text).unwrap()).unwrap(), text);
        }
    }

    #[test]
    fn test_batch_preserves_order() {
        let tok = tokenizer();
        let texts = ["c", "a", "b"];
        let ids = tok.encode_batch(&texts).unwrap();
        assert_eq!(ids, vec![vec![99], vec![97], vec![98]]);
        let refs: Vec<&[u32]> = ids.iter().map(Vec::as_slice).collect();
        assert_eq!(tok.decode_batch(&refs).unwrap(), vec!["c", "a", "b"]);
    }

    #[test]
    fn test_special_tokens() {
        let tok = tokenizer();
        assert_eq!(tok.eos_token_id(), Some(256));
        assert_eq!(tok.pad_token_id(), Some(256));
        assert_eq!(tok.bos_token_id(), None);

        let ids = tok.encode("a<|endoftext|>").unwrap();
        assert_eq!(ids, vec![97, 256]);
        assert_eq!(tok.decode_skip_special_tokens(&ids).unwrap(), "a");
    }

    #[test]
    fn test_round_trip_keeps_special_token_literals() {
        let tok = tokenizer();
        let text = "x = \"<|endoftext|>\"\nprint(x)";
        let ids = tok.encode(text).unwrap();
        assert!(ids.contains(&256));
        assert_eq!(tok.decode(&ids).unwrap(), text);
        assert!(tok.check_round_trip(&[text]).unwrap().is_empty());
    }

    #[test]
    fn test_missing_file_is_engine_unavailable() {
        let err = Tokenizer::from_file("/nonexistent/tokenizer.json").unwrap_err();
        assert!(matches!(err, SftPackError::EngineUnavailable(_)));
        assert!(err.is_fatal());
        assert!(err.to_string().contains("/nonexistent/tokenizer.json"));
    }

    #[test]
    fn test_codec_trait() {
        let tok = tokenizer();
        let codec: &dyn TokenCodec = &tok;
        assert_eq!(codec.encode("x").unwrap(), vec![120]);
        assert_eq!(codec.pad_token_id(), Some(256));
    }

    #[test]
    fn test_shared_across_threads() {
        let tok = tokenizer();
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let tok = tok.clone();
                std::thread::spawn(move || tok.encode(&format!("thread {i}")).unwrap())
            })
            .collect();
        for (i, handle) in handles.into_iter().enumerate() {
            let ids = handle.join().unwrap();
            assert_eq!(tok.decode(&ids).unwrap(), format!("thread {i}"));
        }
    }
}
