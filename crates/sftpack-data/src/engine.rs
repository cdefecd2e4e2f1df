//! Engine facade.
//!
//! An [`Engine`] is built once at startup from an [`EngineConfig`] and owns
//! everything the pipeline stages share: the converter, the tokenizer, the
//! chat template, a worker pool and the lifetime counters.

use crate::chat_templates::{ChatTemplate, RecordEncoder};
use crate::converter::{ConversionOutput, Converter};
use crate::metrics::EngineCounters;
use crate::packing::{PackedBlock, PackingStats, SequencePacker};
use crate::table::ConversationTable;
use crate::tokenizer::Tokenizer;
use crate::TokenizedExample;
use rayon::prelude::*;
use sftpack_core::{ConversationRecord, EngineConfig, FormatType, Result, SftPackError};
use tracing::info;

/// Records per encoder call when tokenizing in parallel.
const ENCODE_CHUNK: usize = 256;

/// Conversion, tokenization and packing behind one handle.
pub struct Engine {
    config: EngineConfig,
    converter: Converter,
    tokenizer: Option<Tokenizer>,
    template: ChatTemplate,
    pool: rayon::ThreadPool,
    pad_token_id: u32,
    counters: EngineCounters,
}

impl Engine {
    /// Build an engine, loading the configured tokenizer.
    ///
    /// Fails with [`SftPackError::EngineUnavailable`] if a tokenizer path is
    /// configured but cannot be loaded.
    pub fn from_config(config: EngineConfig) -> Result<Self> {
        let tokenizer = match &config.tokenizer_path {
            Some(path) => Some(Tokenizer::from_file(path)?),
            None => None,
        };
        Self::build(config, tokenizer)
    }

    /// Build an engine around an already-loaded tokenizer.
    pub fn with_tokenizer(config: EngineConfig, tokenizer: Tokenizer) -> Result<Self> {
        Self::build(config, Some(tokenizer))
    }

    fn build(config: EngineConfig, tokenizer: Option<Tokenizer>) -> Result<Self> {
        config.validate()?;

        let mut builder =
            rayon::ThreadPoolBuilder::new().thread_name(|i| format!("sftpack-worker-{i}"));
        if let Some(n) = config.num_threads {
            builder = builder.num_threads(n);
        }
        let pool = builder
            .build()
            .map_err(|e| SftPackError::Config(format!("failed to build worker pool: {e}")))?;

        let pad_token_id = config
            .packing
            .pad_token_id
            .or_else(|| tokenizer.as_ref().and_then(Tokenizer::pad_token_id))
            .unwrap_or(0);

        info!(
            threads = pool.current_num_threads(),
            tokenizer = tokenizer.is_some(),
            pad_token_id,
            template = ?config.template,
            block_length = config.packing.block_length,
            "Engine ready"
        );

        Ok(Self {
            converter: Converter::from_config(&config),
            template: ChatTemplate::new(config.template),
            tokenizer,
            pool,
            pad_token_id,
            counters: EngineCounters::default(),
            config,
        })
    }

    /// Configuration the engine was built from.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Converter.
    pub fn converter(&self) -> &Converter {
        &self.converter
    }

    /// Converter, for registering extra dataset types.
    pub fn converter_mut(&mut self) -> &mut Converter {
        &mut self.converter
    }

    /// Chat template used by [`tokenize_records`](Self::tokenize_records).
    pub fn template(&self) -> &ChatTemplate {
        &self.template
    }

    /// Resolved padding token.
    pub fn pad_token_id(&self) -> u32 {
        self.pad_token_id
    }

    /// Lifetime counters.
    pub fn counters(&self) -> &EngineCounters {
        &self.counters
    }

    /// The loaded tokenizer.
    pub fn tokenizer(&self) -> Result<&Tokenizer> {
        self.tokenizer.as_ref().ok_or_else(|| {
            SftPackError::EngineUnavailable(
                "no tokenizer loaded; set tokenizer_path in the engine configuration".to_string(),
            )
        })
    }

    /// Convert a batch of serialized raw records.
    ///
    /// `format_type` is `alpaca` or `sharegpt` (case-insensitive);
    /// `dataset_type` is a registered tag, `""` meaning generic.
    pub fn convert_batch<S>(
        &self,
        records: &[S],
        format_type: &str,
        dataset_type: &str,
    ) -> Result<ConversionOutput>
    where
        S: AsRef<str> + Sync,
    {
        let format_type: FormatType = format_type.parse()?;
        let output = self
            .pool
            .install(|| self.converter.convert_batch(records, format_type, dataset_type))?;
        self.counters.record_conversion(&output.stats);
        Ok(output)
    }

    /// Convert a batch with the configured format and dataset type.
    pub fn convert_batch_default<S>(&self, records: &[S]) -> Result<ConversionOutput>
    where
        S: AsRef<str> + Sync,
    {
        let output = self.pool.install(|| {
            self.converter
                .convert_batch(records, self.config.format_type, &self.config.dataset_type)
        })?;
        self.counters.record_conversion(&output.stats);
        Ok(output)
    }

    /// Convert one serialized raw record.
    pub fn convert_record(
        &self,
        record: &str,
        format_type: &str,
        dataset_type: &str,
    ) -> Result<ConversationRecord> {
        self.convert_batch(&[record], format_type, dataset_type)?
            .table
            .records()
            .pop()
            .ok_or_else(|| SftPackError::InvariantViolation("conversion returned no rows".into()))
    }

    /// Encode text to token IDs.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        self.tokenizer()?.encode(text)
    }

    /// Decode token IDs to text.
    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        self.tokenizer()?.decode(ids)
    }

    /// Encode many texts, preserving order.
    pub fn encode_batch(&self, texts: &[&str]) -> Result<Vec<Vec<u32>>> {
        let tokenizer = self.tokenizer()?;
        self.pool.install(|| tokenizer.encode_batch(texts))
    }

    /// Decode many id sequences, preserving order.
    pub fn decode_batch(&self, ids: &[&[u32]]) -> Result<Vec<String>> {
        let tokenizer = self.tokenizer()?;
        self.pool.install(|| tokenizer.decode_batch(ids))
    }

    /// Render and tokenize records with the configured chat template.
    pub fn tokenize_records(&self, records: &[ConversationRecord]) -> Result<Vec<TokenizedExample>> {
        let tokenizer = self.tokenizer()?;
        let encoder = RecordEncoder::new(&self.template, tokenizer);

        let chunks: Vec<Vec<TokenizedExample>> = self.pool.install(|| {
            records
                .par_chunks(ENCODE_CHUNK)
                .map(|chunk| encoder.encode_batch(chunk))
                .collect::<Result<_>>()
        })?;

        let examples: Vec<TokenizedExample> = chunks.into_iter().flatten().collect();
        if examples.len() != records.len() {
            return Err(SftPackError::InvariantViolation(format!(
                "tokenized {} examples from {} records",
                examples.len(),
                records.len()
            )));
        }
        Ok(examples)
    }

    /// Render and tokenize every row of a table.
    pub fn tokenize_table(&self, table: &ConversationTable) -> Result<Vec<TokenizedExample>> {
        self.tokenize_records(&table.records())
    }

    /// Packer for the configured block length and resolved padding token.
    pub fn packer(&self) -> Result<SequencePacker> {
        SequencePacker::new(self.config.packing.clone(), self.pad_token_id)
    }

    /// Pack examples in one sequential pass.
    pub fn pack(&self, examples: Vec<TokenizedExample>) -> Result<(Vec<PackedBlock>, PackingStats)> {
        let (blocks, stats) = self.packer()?.pack_with_stats(examples)?;
        self.counters.record_packing(&stats);
        Ok((blocks, stats))
    }

    /// Pack contiguous shards in parallel; one result per shard, in order.
    pub fn pack_sharded(
        &self,
        examples: Vec<TokenizedExample>,
        shard_size: usize,
    ) -> Result<Vec<Result<(Vec<PackedBlock>, PackingStats)>>> {
        let packer = self.packer()?;
        let shards = self
            .pool
            .install(|| packer.pack_sharded(examples, shard_size))?;
        for (_, stats) in shards.iter().flatten() {
            self.counters.record_packing(stats);
        }
        Ok(shards)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("tokenizer", &self.tokenizer)
            .field("pad_token_id", &self.pad_token_id)
            .field("threads", &self.pool.current_num_threads())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::byte_level_tokenizer_json;
    use sftpack_core::PackingConfig;

    fn tokenizer() -> Tokenizer {
        Tokenizer::from_bytes(byte_level_tokenizer_json(&["<|im_end|>"]).as_bytes()).unwrap()
    }

    fn config() -> EngineConfig {
        EngineConfig {
            num_threads: Some(2),
            packing: PackingConfig::with_block_length(256),
            ..Default::default()
        }
    }

    #[test]
    fn test_conversion_without_tokenizer() {
        let engine = Engine::from_config(config()).unwrap();
        let output = engine
            .convert_batch(&[r#"{"content": "x = 1"}"#], "ALPACA", "starcoder")
            .unwrap();
        assert_eq!(output.table.len(), 1);

        let err = engine.encode("x").unwrap_err();
        assert!(matches!(err, SftPackError::EngineUnavailable(_)));
        assert_eq!(engine.pad_token_id(), 0);
    }

    #[test]
    fn test_missing_tokenizer_file() {
        let config = EngineConfig {
            tokenizer_path: Some("/nonexistent/tokenizer.json".into()),
            ..config()
        };
        let err = Engine::from_config(config).unwrap_err();
        assert!(matches!(err, SftPackError::EngineUnavailable(_)));
    }

    #[test]
    fn test_unknown_format_type() {
        let engine = Engine::from_config(config()).unwrap();
        let err = engine
            .convert_batch(&[r#"{"content": "x"}"#], "markdown", "starcoder")
            .unwrap_err();
        assert!(matches!(err, SftPackError::InvalidArgument(_)));
    }

    #[test]
    fn test_pad_token_resolution() {
        let engine = Engine::with_tokenizer(config(), tokenizer()).unwrap();
        assert_eq!(engine.pad_token_id(), 256);

        let mut explicit = config();
        explicit.packing.pad_token_id = Some(3);
        let engine = Engine::with_tokenizer(explicit, tokenizer()).unwrap();
        assert_eq!(engine.pad_token_id(), 3);
    }

    #[test]
    fn test_pipeline_and_counters() {
        let engine = Engine::with_tokenizer(config(), tokenizer()).unwrap();
        let raw = vec![
            r#"{"input": "fn a() {}", "output": "Nothing."}"#,
            "garbage",
            r#"{"input": "fn b() {}", "output": "Also nothing."}"#,
        ];

        let output = engine.convert_batch(&raw, "alpaca", "rust_explanation").unwrap();
        let examples = engine.tokenize_table(&output.table).unwrap();
        assert_eq!(examples.len(), 3);
        assert!(examples.iter().all(|e| e.num_trainable() > 0));

        let (blocks, stats) = engine.pack(examples).unwrap();
        assert_eq!(stats.num_examples, 3);
        for block in &blocks {
            block.validate(256).unwrap();
            for (&id, &seg) in block.token_ids.iter().zip(&block.segment_ids) {
                if seg == crate::PAD_SEGMENT_ID {
                    assert_eq!(id, 256);
                }
            }
        }

        let snapshot = engine.counters().snapshot();
        assert_eq!(snapshot.rows_converted, 3);
        assert_eq!(snapshot.malformed_records, 1);
        assert_eq!(snapshot.examples_packed, 3);
        assert_eq!(snapshot.blocks_emitted, blocks.len() as u64);

        engine.convert_batch(&raw, "alpaca", "rust_explanation").unwrap();
        assert_eq!(engine.counters().snapshot().rows_converted, 6);
    }

    #[test]
    fn test_encode_decode_batch() {
        let engine = Engine::with_tokenizer(config(), tokenizer()).unwrap();
        let ids = engine.encode_batch(&["ab", "c"]).unwrap();
        assert_eq!(ids, vec![vec![97, 98], vec![99]]);
        let refs: Vec<&[u32]> = ids.iter().map(Vec::as_slice).collect();
        assert_eq!(engine.decode_batch(&refs).unwrap(), vec!["ab", "c"]);
        assert_eq!(engine.decode(&engine.encode("z").unwrap()).unwrap(), "z");
    }

    #[test]
    fn test_pack_sharded_counts_all_shards() {
        let engine = Engine::with_tokenizer(config(), tokenizer()).unwrap();
        let examples: Vec<_> = (0..10)
            .map(|i| TokenizedExample::fully_trainable(vec![i; 20]))
            .collect();
        let shards = engine.pack_sharded(examples, 4).unwrap();
        assert_eq!(shards.len(), 3);
        assert_eq!(engine.counters().snapshot().examples_packed, 10);
    }
}
