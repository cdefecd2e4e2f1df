//! Batch conversion: raw records to the conversation table.
//!
//! Rows are normalized and finalized in parallel and reassembled by index,
//! so `output[i]` always derives from `input[i]`. A row that cannot be
//! normalized becomes [`ConversationRecord::empty`] and is counted; the batch
//! itself only fails on configuration errors or broken invariants.

use crate::finalizer::finalize;
use crate::normalizer::{parse_raw, StrategyRegistry};
use crate::table::ConversationTable;
use rayon::prelude::*;
use serde::Serialize;
use sftpack_core::{
    ConversationRecord, EngineConfig, FormatType, NormalizeContext, NormalizeStrategy,
    PromptPolicy, RecordError, Result, SftPackError, TextBudget,
};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Counters for one or more conversion calls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConversionStats {
    /// Rows converted.
    pub rows: usize,
    /// Rows replaced by the default record.
    pub malformed: usize,
    /// Text fields cut by the budget.
    pub truncated_fields: usize,
    /// Indices of malformed rows.
    pub malformed_rows: Vec<usize>,
}

impl ConversionStats {
    /// Append the statistics of the batch that followed this one.
    ///
    /// Row indices of `other` are shifted past the rows already counted.
    pub fn merge(&mut self, other: &ConversionStats) {
        let offset = self.rows;
        self.malformed_rows
            .extend(other.malformed_rows.iter().map(|i| i + offset));
        self.rows += other.rows;
        self.malformed += other.malformed;
        self.truncated_fields += other.truncated_fields;
    }

    /// One-line summary.
    pub fn summary(&self) -> String {
        format!(
            "Converted {} rows ({} malformed, {} fields truncated)",
            self.rows, self.malformed, self.truncated_fields
        )
    }
}

/// Result of a batch conversion.
#[derive(Debug, Clone)]
pub struct ConversionOutput {
    /// Converted rows.
    pub table: ConversationTable,
    /// Counters for this batch.
    pub stats: ConversionStats,
}

/// Outcome of converting one row.
struct RowOutcome {
    record: ConversationRecord,
    truncated_fields: usize,
    error: Option<RecordError>,
}

/// Normalizer + finalizer over batches of serialized raw records.
#[derive(Debug, Clone)]
pub struct Converter {
    registry: StrategyRegistry,
    prompts: HashMap<String, PromptPolicy>,
    budget: TextBudget,
}

impl Default for Converter {
    fn default() -> Self {
        Self::new(StrategyRegistry::with_builtins(), HashMap::new(), TextBudget::default())
    }
}

impl Converter {
    /// Create a converter.
    pub fn new(
        registry: StrategyRegistry,
        prompts: HashMap<String, PromptPolicy>,
        budget: TextBudget,
    ) -> Self {
        Self {
            registry,
            prompts,
            budget,
        }
    }

    /// Create a converter with the built-in strategies and the configured
    /// prompt policies and budget.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            StrategyRegistry::with_builtins(),
            config.prompts.clone(),
            config.budget(),
        )
    }

    /// Strategy registry.
    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }

    /// Mutable strategy registry, for registering extra dataset types.
    pub fn registry_mut(&mut self) -> &mut StrategyRegistry {
        &mut self.registry
    }

    /// Text budget.
    pub fn budget(&self) -> TextBudget {
        self.budget
    }

    /// Policy for a dataset type.
    pub fn policy_for(&self, dataset_type: &str) -> PromptPolicy {
        let tag = StrategyRegistry::canonical_tag(dataset_type);
        self.prompts.get(tag).cloned().unwrap_or_default()
    }

    /// Convert a batch of serialized raw records.
    ///
    /// Order- and length-preserving. Fails only for an unknown
    /// `dataset_type` or a broken internal invariant.
    pub fn convert_batch<S>(
        &self,
        records: &[S],
        format_type: FormatType,
        dataset_type: &str,
    ) -> Result<ConversionOutput>
    where
        S: AsRef<str> + Sync,
    {
        let strategy = self.registry.resolve(dataset_type)?;
        let policy = self.policy_for(dataset_type);

        let outcomes: Vec<RowOutcome> = records
            .par_iter()
            .map(|raw| self.convert_row(raw.as_ref(), strategy.as_ref(), format_type, &policy))
            .collect();

        if outcomes.len() != records.len() {
            return Err(SftPackError::InvariantViolation(format!(
                "conversion produced {} rows for {} inputs",
                outcomes.len(),
                records.len()
            )));
        }

        let mut stats = ConversionStats {
            rows: outcomes.len(),
            ..Default::default()
        };
        let mut converted = Vec::with_capacity(outcomes.len());
        for (index, outcome) in outcomes.into_iter().enumerate() {
            if let Some(error) = outcome.error {
                warn!(index, %error, "Malformed record replaced with default");
                stats.malformed += 1;
                stats.malformed_rows.push(index);
            }
            if outcome.truncated_fields > 0 {
                debug!(index, fields = outcome.truncated_fields, "Truncated oversized fields");
                stats.truncated_fields += outcome.truncated_fields;
            }
            outcome.record.validate().map_err(|e| {
                SftPackError::InvariantViolation(format!("row {index}: {e}"))
            })?;
            converted.push(outcome.record);
        }

        let table = ConversationTable::from_records(converted);
        if table.len() != records.len() {
            return Err(SftPackError::InvariantViolation(format!(
                "table has {} rows for {} inputs",
                table.len(),
                records.len()
            )));
        }

        info!(
            format_type = %format_type,
            dataset_type = strategy.name(),
            "{}",
            stats.summary()
        );
        Ok(ConversionOutput { table, stats })
    }

    /// Convert one serialized raw record.
    ///
    /// A malformed record yields [`ConversationRecord::empty`].
    pub fn convert_record(
        &self,
        record: &str,
        format_type: FormatType,
        dataset_type: &str,
    ) -> Result<ConversationRecord> {
        self.convert_batch(&[record], format_type, dataset_type)?
            .table
            .records()
            .pop()
            .ok_or_else(|| SftPackError::InvariantViolation("conversion returned no rows".into()))
    }

    fn convert_row(
        &self,
        raw: &str,
        strategy: &dyn NormalizeStrategy,
        format_type: FormatType,
        policy: &PromptPolicy,
    ) -> RowOutcome {
        let mut ctx = NormalizeContext::new(format_type, policy, self.budget);
        let normalized = parse_raw(raw).and_then(|value| strategy.normalize(value, &mut ctx));
        match normalized {
            Ok(record) => RowOutcome {
                record: finalize(record),
                truncated_fields: ctx.truncated_fields(),
                error: None,
            },
            Err(error) => RowOutcome {
                record: ConversationRecord::empty(),
                truncated_fields: ctx.truncated_fields(),
                error: Some(error),
            },
        }
    }
}
