//! Sequence packing into fixed-length training blocks.
//!
//! Packing concatenates many variable-length examples into blocks of exactly
//! `block_length` tokens. Each block carries per-position segment ids so the
//! consumer can build a block-diagonal attention mask and no example ever
//! attends to another.
//!
//! # Overview
//!
//! Padding every example to the longest one wastes most of the batch:
//! ```text
//! [ex1: 3 tokens][PAD PAD]
//! [ex2: 4 tokens][PAD]
//! [ex3: 2 tokens][PAD PAD PAD]
//! [ex4: 5 tokens]
//! ```
//!
//! Packing into blocks of 10 fills them in input order:
//! ```text
//! [ex1: 3 tokens][ex2: 4 tokens][ex3: 2 tokens][PAD]
//! [ex4: 5 tokens][PAD PAD PAD PAD PAD]
//! ```
//!
//! # Algorithm
//!
//! Greedy first-fit in input order, one pass, one open block:
//! 1. An example that fits in the open block is appended with the next
//!    segment id.
//! 2. Otherwise the open block is padded, validated and emitted, and the
//!    example starts a new block.
//! 3. An example longer than a block is truncated (or skipped, per
//!    [`OverflowPolicy`]); it is never split across blocks.
//!
//! Output order and content depend only on the input, so packing the same
//! examples twice gives identical blocks.

use crate::TokenizedExample;
use rayon::prelude::*;
use serde::Serialize;
use sftpack_core::{OverflowPolicy, PackingConfig, Result, SftPackError};
use tracing::{debug, info};

/// Segment id of padding positions.
///
/// Larger than any real segment id, so segment ids never decrease along a
/// block.
pub const PAD_SEGMENT_ID: u32 = u32::MAX;

/// Error type for packing operations.
#[derive(Debug, thiserror::Error)]
pub enum PackingError {
    /// Blocks must hold at least one token.
    #[error("block_length must be positive")]
    ZeroBlockLength,
    /// Shards must hold at least one example.
    #[error("shard_size must be positive")]
    ZeroShardSize,
    /// A closed block broke a boundary invariant.
    #[error("invalid packed block: {0}")]
    InvalidBlock(String),
}

impl From<PackingError> for SftPackError {
    fn from(err: PackingError) -> Self {
        match err {
            PackingError::ZeroBlockLength | PackingError::ZeroShardSize => {
                SftPackError::InvalidArgument(err.to_string())
            }
            PackingError::InvalidBlock(_) => SftPackError::InvariantViolation(err.to_string()),
        }
    }
}

/// A fixed-length training block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackedBlock {
    /// Token ids, padding included.
    pub token_ids: Vec<u32>,
    /// Whether each position contributes to the loss.
    pub loss_mask: Vec<bool>,
    /// Source segment of each position; [`PAD_SEGMENT_ID`] for padding.
    pub segment_ids: Vec<u32>,
    /// Position within the segment (restarts at 0 per segment, 0 for padding).
    pub position_ids: Vec<u32>,
}

impl PackedBlock {
    /// Number of positions in the block.
    pub fn block_length(&self) -> usize {
        self.token_ids.len()
    }

    /// Number of real (non-padding) tokens.
    pub fn num_real_tokens(&self) -> usize {
        self.segment_ids
            .iter()
            .filter(|&&id| id != PAD_SEGMENT_ID)
            .count()
    }

    /// Number of padding positions.
    pub fn num_padding(&self) -> usize {
        self.block_length() - self.num_real_tokens()
    }

    /// Length of each segment, in segment order.
    pub fn segment_lengths(&self) -> Vec<usize> {
        let mut lengths: Vec<usize> = Vec::new();
        let mut previous = None;
        for &id in &self.segment_ids {
            if id == PAD_SEGMENT_ID {
                break;
            }
            if previous == Some(id) {
                if let Some(last) = lengths.last_mut() {
                    *last += 1;
                }
            } else {
                lengths.push(1);
                previous = Some(id);
            }
        }
        lengths
    }

    /// Number of segments in the block.
    pub fn num_segments(&self) -> usize {
        self.segment_lengths().len()
    }

    /// Cumulative segment lengths (`num_segments + 1` entries, starting at 0),
    /// as used by variable-length attention kernels.
    pub fn cu_seqlens(&self) -> Vec<u32> {
        let mut cu_seqlens = vec![0u32];
        let mut cumsum = 0u32;
        for len in self.segment_lengths() {
            cumsum += len as u32;
            cu_seqlens.push(cumsum);
        }
        cu_seqlens
    }

    /// Labels for the loss: the token id where the mask is set, `ignore_index`
    /// everywhere else.
    pub fn labels(&self, ignore_index: i64) -> Vec<i64> {
        self.token_ids
            .iter()
            .zip(&self.loss_mask)
            .map(|(&id, &trainable)| if trainable { i64::from(id) } else { ignore_index })
            .collect()
    }

    /// Build a block diagonal causal attention mask.
    ///
    /// Returns a row-major `n * n` mask where `mask[i * n + j]` is `0.0` if
    /// position `i` may attend to position `j` and `-inf` otherwise. Each
    /// segment attends causally to itself only. Padding positions attend to
    /// themselves so that every softmax row stays finite.
    pub fn build_attention_mask(&self) -> Vec<f32> {
        let n = self.block_length();
        let mut mask = vec![f32::NEG_INFINITY; n * n];

        let mut offset = 0usize;
        for len in self.segment_lengths() {
            for i in 0..len {
                let row_start = (offset + i) * n + offset;
                mask[row_start..row_start + i + 1].fill(0.0);
            }
            offset += len;
        }
        for i in offset..n {
            mask[i * n + i] = 0.0;
        }

        mask
    }

    /// Check the boundary invariants of a block of `block_length` positions.
    pub fn validate(&self, block_length: usize) -> std::result::Result<(), PackingError> {
        let invalid = |reason: String| Err(PackingError::InvalidBlock(reason));

        for (name, len) in [
            ("token_ids", self.token_ids.len()),
            ("loss_mask", self.loss_mask.len()),
            ("segment_ids", self.segment_ids.len()),
            ("position_ids", self.position_ids.len()),
        ] {
            if len != block_length {
                return invalid(format!("{name} has length {len}, expected {block_length}"));
            }
        }

        let mut previous: Option<u32> = None;
        let mut expected_position = 0u32;
        for i in 0..block_length {
            let id = self.segment_ids[i];
            let position = self.position_ids[i];

            if id == PAD_SEGMENT_ID {
                if self.loss_mask[i] {
                    return invalid(format!("padding position {i} is trainable"));
                }
                if position != 0 {
                    return invalid(format!("padding position {i} has position id {position}"));
                }
                previous = Some(PAD_SEGMENT_ID);
                continue;
            }

            match previous {
                None if id != 0 => {
                    return invalid(format!("first segment id is {id}, expected 0"));
                }
                None => expected_position = 0,
                Some(PAD_SEGMENT_ID) => {
                    return invalid(format!("segment {id} at {i} follows padding"));
                }
                Some(prev) if id == prev => {}
                Some(prev) if id == prev + 1 => expected_position = 0,
                Some(prev) => {
                    return invalid(format!("segment id jumps from {prev} to {id} at {i}"));
                }
            }
            if position != expected_position {
                return invalid(format!(
                    "position id {position} at {i}, expected {expected_position}"
                ));
            }
            expected_position += 1;
            previous = Some(id);
        }

        if previous.is_none() || self.segment_ids[0] == PAD_SEGMENT_ID {
            return invalid("block holds no segment".to_string());
        }
        Ok(())
    }
}

/// Statistics about packing efficiency.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PackingStats {
    /// Examples offered to the packer.
    pub num_examples: usize,
    /// Blocks emitted.
    pub num_blocks: usize,
    /// Segments placed into blocks.
    pub num_segments: usize,
    /// Real tokens placed into blocks.
    pub real_tokens: usize,
    /// Total capacity (blocks * block_length).
    pub total_capacity: usize,
    /// Overlong examples truncated to a block.
    pub overflow_truncated: usize,
    /// Overlong examples dropped.
    pub overflow_skipped: usize,
    /// Examples dropped for being shorter than `min_length`.
    pub skipped_short: usize,
    /// Packing efficiency (real tokens / capacity).
    pub efficiency: f64,
}

impl PackingStats {
    /// Accumulate another run's statistics.
    pub fn merge(&mut self, other: &PackingStats) {
        self.num_examples += other.num_examples;
        self.num_blocks += other.num_blocks;
        self.num_segments += other.num_segments;
        self.real_tokens += other.real_tokens;
        self.total_capacity += other.total_capacity;
        self.overflow_truncated += other.overflow_truncated;
        self.overflow_skipped += other.overflow_skipped;
        self.skipped_short += other.skipped_short;
        self.refresh_efficiency();
    }

    /// Overlong examples, whatever the policy did with them.
    pub fn overflowed(&self) -> usize {
        self.overflow_truncated + self.overflow_skipped
    }

    fn refresh_efficiency(&mut self) {
        self.efficiency = if self.total_capacity == 0 {
            0.0
        } else {
            self.real_tokens as f64 / self.total_capacity as f64
        };
    }

    /// Pretty print stats.
    pub fn summary(&self) -> String {
        format!(
            "Packing: {} examples → {} blocks ({} segments), {:.1}% efficiency, {} truncated, {} skipped overlong, {} skipped short",
            self.num_examples,
            self.num_blocks,
            self.num_segments,
            self.efficiency * 100.0,
            self.overflow_truncated,
            self.overflow_skipped,
            self.skipped_short
        )
    }
}

/// The open block of a [`BlockPacker`].
#[derive(Debug, Default)]
struct OpenBlock {
    token_ids: Vec<u32>,
    loss_mask: Vec<bool>,
    segment_ids: Vec<u32>,
    position_ids: Vec<u32>,
    next_segment: u32,
}

impl OpenBlock {
    fn with_capacity(block_length: usize) -> Self {
        Self {
            token_ids: Vec::with_capacity(block_length),
            loss_mask: Vec::with_capacity(block_length),
            segment_ids: Vec::with_capacity(block_length),
            position_ids: Vec::with_capacity(block_length),
            next_segment: 0,
        }
    }

    fn len(&self) -> usize {
        self.token_ids.len()
    }

    fn is_empty(&self) -> bool {
        self.token_ids.is_empty()
    }

    fn append(&mut self, example: TokenizedExample) {
        let len = example.len();
        let (token_ids, loss_mask) = example.into_parts();
        self.token_ids.extend(token_ids);
        self.loss_mask.extend(loss_mask);
        self.segment_ids
            .extend(std::iter::repeat(self.next_segment).take(len));
        self.position_ids.extend(0..len as u32);
        self.next_segment += 1;
    }

    fn into_block(mut self, block_length: usize, pad_token_id: u32) -> PackedBlock {
        self.token_ids.resize(block_length, pad_token_id);
        self.loss_mask.resize(block_length, false);
        self.segment_ids.resize(block_length, PAD_SEGMENT_ID);
        self.position_ids.resize(block_length, 0);
        PackedBlock {
            token_ids: self.token_ids,
            loss_mask: self.loss_mask,
            segment_ids: self.segment_ids,
            position_ids: self.position_ids,
        }
    }
}

/// Streaming greedy packer.
///
/// Feed examples with [`push`](Self::push); each call returns the block it
/// closed, if any. [`finish`](Self::finish) emits the final partial block.
#[derive(Debug)]
pub struct BlockPacker {
    config: PackingConfig,
    pad_token_id: u32,
    open: OpenBlock,
    stats: PackingStats,
}

impl BlockPacker {
    /// Create a packer.
    pub fn new(config: PackingConfig, pad_token_id: u32) -> Result<Self> {
        if config.block_length == 0 {
            return Err(PackingError::ZeroBlockLength.into());
        }
        Ok(Self {
            open: OpenBlock::with_capacity(config.block_length),
            config,
            pad_token_id,
            stats: PackingStats::default(),
        })
    }

    /// Statistics so far.
    pub fn stats(&self) -> &PackingStats {
        &self.stats
    }

    /// Offer one example.
    pub fn push(&mut self, mut example: TokenizedExample) -> Result<Option<PackedBlock>> {
        let block_length = self.config.block_length;
        let index = self.stats.num_examples;
        self.stats.num_examples += 1;

        let len = example.len();
        if len == 0 || len < self.config.min_length {
            self.stats.skipped_short += 1;
            debug!(index, len, min_length = self.config.min_length, "Skipping short example");
            return Ok(None);
        }

        if len > block_length {
            match self.config.overflow {
                OverflowPolicy::Skip => {
                    self.stats.overflow_skipped += 1;
                    debug!(index, len, block_length, "Skipping overlong example");
                    return Ok(None);
                }
                OverflowPolicy::Truncate => {
                    self.stats.overflow_truncated += 1;
                    debug!(index, len, block_length, "Truncating overlong example");
                    example.truncate(block_length);
                }
            }
        }

        let closed = if self.open.len() + example.len() > block_length {
            self.close()?
        } else {
            None
        };
        self.open.append(example);
        Ok(closed)
    }

    /// Emit the final partial block, if any.
    pub fn finish(&mut self) -> Result<Option<PackedBlock>> {
        self.close()
    }

    fn close(&mut self) -> Result<Option<PackedBlock>> {
        if self.open.is_empty() {
            return Ok(None);
        }
        let block_length = self.config.block_length;
        let open = std::mem::replace(&mut self.open, OpenBlock::with_capacity(block_length));
        let segments = open.next_segment as usize;
        let real = open.len();
        let block = open.into_block(block_length, self.pad_token_id);

        block.validate(block_length).map_err(|e| {
            SftPackError::from(PackingError::InvalidBlock(format!(
                "block {}: {e}",
                self.stats.num_blocks
            )))
        })?;

        self.stats.num_blocks += 1;
        self.stats.num_segments += segments;
        self.stats.real_tokens += real;
        self.stats.total_capacity += block_length;
        self.stats.refresh_efficiency();
        Ok(Some(block))
    }
}

/// Pull iterator over packed blocks. See [`SequencePacker::pack_iter`].
pub struct PackIter<I> {
    examples: I,
    packer: Option<BlockPacker>,
    stats: PackingStats,
}

impl<I> PackIter<I> {
    /// Statistics so far (final once the iterator is exhausted).
    pub fn stats(&self) -> &PackingStats {
        match &self.packer {
            Some(packer) => packer.stats(),
            None => &self.stats,
        }
    }
}

impl<I: Iterator<Item = TokenizedExample>> Iterator for PackIter<I> {
    type Item = Result<PackedBlock>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let packer = self.packer.as_mut()?;
            let step = match self.examples.next() {
                Some(example) => packer.push(example),
                None => {
                    let result = packer.finish();
                    self.stats = packer.stats().clone();
                    self.packer = None;
                    return result.transpose();
                }
            };
            match step {
                Ok(Some(block)) => return Some(Ok(block)),
                Ok(None) => continue,
                Err(e) => {
                    self.stats = packer.stats().clone();
                    self.packer = None;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Sequence packer for creating fixed-length blocks.
#[derive(Debug, Clone)]
pub struct SequencePacker {
    config: PackingConfig,
    pad_token_id: u32,
}

impl SequencePacker {
    /// Create a new sequence packer.
    pub fn new(config: PackingConfig, pad_token_id: u32) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            pad_token_id,
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &PackingConfig {
        &self.config
    }

    /// Padding token.
    pub fn pad_token_id(&self) -> u32 {
        self.pad_token_id
    }

    /// Pack examples into blocks.
    pub fn pack<I>(&self, examples: I) -> Result<Vec<PackedBlock>>
    where
        I: IntoIterator<Item = TokenizedExample>,
    {
        Ok(self.pack_with_stats(examples)?.0)
    }

    /// Pack examples into blocks and return stats.
    pub fn pack_with_stats<I>(&self, examples: I) -> Result<(Vec<PackedBlock>, PackingStats)>
    where
        I: IntoIterator<Item = TokenizedExample>,
    {
        let mut iter = self.pack_iter(examples);
        let blocks = iter.by_ref().collect::<Result<Vec<_>>>()?;
        let stats = iter.stats().clone();
        info!("{}", stats.summary());
        Ok((blocks, stats))
    }

    /// Lazily pack an example stream, one block at a time.
    pub fn pack_iter<I>(&self, examples: I) -> PackIter<I::IntoIter>
    where
        I: IntoIterator<Item = TokenizedExample>,
    {
        let packer = BlockPacker {
            open: OpenBlock::with_capacity(self.config.block_length),
            config: self.config.clone(),
            pad_token_id: self.pad_token_id,
            stats: PackingStats::default(),
        };
        PackIter {
            examples: examples.into_iter(),
            packer: Some(packer),
            stats: PackingStats::default(),
        }
    }

    /// Pack contiguous shards of `shard_size` examples in parallel.
    ///
    /// Each shard is packed independently, so a block never spans two shards
    /// and the last block of each shard may be partly empty. Results are in
    /// shard order; a failing shard does not affect the others.
    pub fn pack_sharded(
        &self,
        examples: Vec<TokenizedExample>,
        shard_size: usize,
    ) -> Result<Vec<Result<(Vec<PackedBlock>, PackingStats)>>> {
        if shard_size == 0 {
            return Err(PackingError::ZeroShardSize.into());
        }

        let mut shards = Vec::with_capacity(examples.len().div_ceil(shard_size));
        let mut iter = examples.into_iter();
        loop {
            let shard: Vec<TokenizedExample> = iter.by_ref().take(shard_size).collect();
            if shard.is_empty() {
                break;
            }
            shards.push(shard);
        }

        Ok(shards
            .into_par_iter()
            .map(|shard| self.pack_with_stats(shard))
            .collect())
    }
}
