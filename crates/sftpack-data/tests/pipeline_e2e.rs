//! End-to-end pipeline tests.
//!
//! Verifies the full raw-record → table → tokens → blocks flow:
//! 1. Batch conversion keeps row count and order, recovering malformed rows
//! 2. Converted tables export to Arrow and Parquet with one row per record
//! 3. A tokenizer loaded from disk encodes and decodes losslessly
//! 4. Packing is deterministic and sharded packing matches per-shard packing
//! 5. Engine counters accumulate across calls

use sftpack_core::{ConversationRecord, EngineConfig, PackingConfig, Role, SftPackError};
use sftpack_data::{
    byte_level_tokenizer_json, Engine, PackedBlock, RawDataset, SequencePacker, Tokenizer,
    TokenizedExample, PAD_SEGMENT_ID,
};
use std::io::Write;
use std::path::Path;

fn write_tokenizer(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("tokenizer.json");
    std::fs::write(&path, byte_level_tokenizer_json(&["<|im_end|>"])).unwrap();
    path
}

fn engine_config(tokenizer_path: Option<std::path::PathBuf>) -> EngineConfig {
    EngineConfig {
        tokenizer_path,
        num_threads: Some(4),
        packing: PackingConfig::with_block_length(512),
        ..Default::default()
    }
}

fn explanation_rows(count: usize) -> Vec<String> {
    (0..count)
        .map(|i| {
            serde_json::json!({
                "input": format!("fn f{i}() -> u32 {{ {i} }}"),
                "output": format!("Returns {i}."),
            })
            .to_string()
        })
        .collect()
}

fn example(len: usize, start: u32) -> TokenizedExample {
    TokenizedExample::fully_trainable((start..start + len as u32).collect())
}

fn real_tokens(blocks: &[PackedBlock]) -> Vec<u32> {
    blocks
        .iter()
        .flat_map(|b| {
            b.token_ids
                .iter()
                .zip(&b.segment_ids)
                .filter(|(_, &seg)| seg != PAD_SEGMENT_ID)
                .map(|(&id, _)| id)
        })
        .collect()
}

#[test]
fn test_starcoder_alpaca_single_row() {
    let engine = Engine::from_config(engine_config(None)).unwrap();
    let output = engine
        .convert_batch(&[r#"{"content": "print('hi')"}"#], "alpaca", "starcoder")
        .unwrap();

    assert_eq!(output.table.len(), 1);
    let record = output.table.row(0).unwrap().to_record();
    record.validate().unwrap();
    assert_eq!(record.prompt.len() % 2, 1);
    assert_eq!(record.prompt[0].role, Role::User);
    assert_eq!(record.response.len(), 1);
    assert_eq!(record.response[0].role, Role::Assistant);
    assert_eq!(record.response[0].content, "print('hi')");
}

#[test]
fn test_malformed_row_recovered_in_place() {
    let engine = Engine::from_config(engine_config(None)).unwrap();
    let mut rows = explanation_rows(100);
    rows[42] = "{\"input\": ".to_string();

    let output = engine.convert_batch(&rows, "alpaca", "rust_explanation").unwrap();

    assert_eq!(output.table.len(), 100);
    assert_eq!(output.stats.malformed, 1);
    assert_eq!(output.stats.malformed_rows, vec![42]);
    assert_eq!(output.table.row(42).unwrap().to_record(), ConversationRecord::empty());
    for i in [0usize, 41, 43, 99] {
        let row = output.table.row(i).unwrap();
        assert_eq!(row.response[0].content, format!("Returns {i}."));
    }
}

#[test]
fn test_conversion_is_deterministic() {
    let engine = Engine::from_config(engine_config(None)).unwrap();
    let rows = explanation_rows(500);
    let first = engine.convert_batch(&rows, "alpaca", "rust_explanation").unwrap();
    let second = engine.convert_batch(&rows, "alpaca", "rust_explanation").unwrap();
    assert_eq!(first.table.to_json(), second.table.to_json());
}

#[test]
fn test_table_exports() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::from_config(engine_config(None)).unwrap();
    let output = engine
        .convert_batch(&explanation_rows(25), "sharegpt", "rust_explanation")
        .unwrap();

    let batch = output.table.to_record_batch().unwrap();
    assert_eq!(batch.num_rows(), 25);
    assert_eq!(output.table.to_jsonl_rows().len(), 25);

    let path = dir.path().join("table.parquet");
    output.table.write_parquet(&path).unwrap();
    let file = std::fs::File::open(&path).unwrap();
    let reader = parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder::try_new(file)
        .unwrap()
        .build()
        .unwrap();
    let rows: usize = reader.map(|b| b.unwrap().num_rows()).sum();
    assert_eq!(rows, 25);
}

#[test]
fn test_tokenizer_round_trip_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let tokenizer = Tokenizer::from_file(write_tokenizer(dir.path())).unwrap();

    let texts = ["fn main() {}", "héllo wörld", "tabs\tand\nnewlines", ""];
    assert!(tokenizer.check_round_trip(&texts).unwrap().is_empty());
    assert_eq!(tokenizer.encode("ab").unwrap(), vec![97, 98]);
    assert_eq!(tokenizer.eos_token_id(), Some(256));
}

#[test]
fn test_engine_decode_keeps_special_token_literals() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::from_config(engine_config(Some(write_tokenizer(dir.path())))).unwrap();

    let source = "END = \"<|im_end|>\"";
    let ids = engine.encode(source).unwrap();
    assert!(ids.contains(&256));
    assert_eq!(engine.decode(&ids).unwrap(), source);
}

#[test]
fn test_missing_tokenizer_is_engine_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let config = engine_config(Some(dir.path().join("missing.json")));
    let err = Engine::from_config(config).unwrap_err();
    assert!(matches!(err, SftPackError::EngineUnavailable(_)));
}

#[test]
fn test_greedy_packing_pads_each_block() {
    let packer = SequencePacker::new(PackingConfig::with_block_length(10), 0).unwrap();
    let (blocks, stats) = packer
        .pack_with_stats(vec![example(5, 1), example(7, 10), example(4, 20)])
        .unwrap();

    assert_eq!(blocks.len(), 3);
    let padding: Vec<usize> = blocks.iter().map(PackedBlock::num_padding).collect();
    assert_eq!(padding, vec![5, 3, 6]);
    assert_eq!(stats.real_tokens, 16);
    for block in &blocks {
        block.validate(10).unwrap();
        assert_eq!(block.num_segments(), 1);
    }
}

#[test]
fn test_streaming_matches_batch_packing() {
    let packer = SequencePacker::new(PackingConfig::with_block_length(64), 0).unwrap();
    let examples: Vec<_> = (0..200).map(|i| example(i % 50 + 1, i as u32)).collect();

    let batch = packer.pack(examples.clone()).unwrap();
    let mut iter = packer.pack_iter(examples.clone());
    let streamed: Vec<PackedBlock> = iter.by_ref().map(Result::unwrap).collect();

    assert_eq!(batch, streamed);
    assert_eq!(iter.stats().num_examples, 200);

    let expected: Vec<u32> = examples.iter().flat_map(|e| e.token_ids().to_vec()).collect();
    assert_eq!(real_tokens(&batch), expected);
}

#[test]
fn test_sharded_matches_per_shard_packing() {
    let packer = SequencePacker::new(PackingConfig::with_block_length(32), 0).unwrap();
    let examples: Vec<_> = (0..95).map(|i| example(i % 17 + 1, i as u32)).collect();

    let shards = packer.pack_sharded(examples.clone(), 20).unwrap();
    assert_eq!(shards.len(), 5);

    for (shard, chunk) in shards.into_iter().zip(examples.chunks(20)) {
        let (blocks, stats) = shard.unwrap();
        let (expected, _) = packer.pack_with_stats(chunk.to_vec()).unwrap();
        assert_eq!(blocks, expected);
        assert_eq!(stats.num_examples, chunk.len());
    }
}

#[test]
fn test_jsonl_to_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let tokenizer_path = write_tokenizer(dir.path());

    let data_path = dir.path().join("data.jsonl");
    let mut file = std::fs::File::create(&data_path).unwrap();
    for row in explanation_rows(30) {
        writeln!(file, "{row}").unwrap();
    }
    writeln!(file).unwrap();
    drop(file);

    let dataset = RawDataset::from_jsonl(&data_path).unwrap();
    assert_eq!(dataset.len(), 30);

    let engine = Engine::from_config(engine_config(Some(tokenizer_path))).unwrap();
    assert_eq!(engine.pad_token_id(), 256);

    let output = engine
        .convert_batch(dataset.records(), "alpaca", "rust_explanation")
        .unwrap();
    let examples = engine.tokenize_table(&output.table).unwrap();
    assert_eq!(examples.len(), 30);
    assert!(examples.iter().all(|e| e.num_trainable() > 0 && e.num_trainable() < e.len()));

    let expected = real_tokens_of(&examples);
    let (blocks, stats) = engine.pack(examples.clone()).unwrap();
    assert_eq!(stats.num_examples, 30);
    assert_eq!(real_tokens(&blocks), expected);

    let (again, _) = engine.pack(examples).unwrap();
    assert_eq!(blocks, again);

    for block in &blocks {
        block.validate(512).unwrap();
        for ((&id, &seg), &trainable) in block
            .token_ids
            .iter()
            .zip(&block.segment_ids)
            .zip(&block.loss_mask)
        {
            if seg == PAD_SEGMENT_ID {
                assert_eq!(id, 256);
                assert!(!trainable);
            }
        }
    }

    let snapshot = engine.counters().snapshot();
    assert_eq!(snapshot.rows_converted, 30);
    assert_eq!(snapshot.examples_packed, 60);
    assert_eq!(snapshot.blocks_emitted, 2 * blocks.len() as u64);
}

fn real_tokens_of(examples: &[TokenizedExample]) -> Vec<u32> {
    examples.iter().flat_map(|e| e.token_ids().to_vec()).collect()
}
