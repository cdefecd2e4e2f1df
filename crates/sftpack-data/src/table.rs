//! Column-oriented conversation table.
//!
//! The conversion output is one table with six columns. `_prompt` and
//! `_response` hold lists of `{content, role}` turns, `_system` and `_tools`
//! hold strings, and `_images`/`_videos` are always null. The table can be
//! exported as a `{data, features}` JSON document, as JSON lines, as an Arrow
//! record batch, or as Parquet.

use arrow::array::{ArrayRef, ListBuilder, NullArray, StringArray, StringBuilder, StructBuilder};
use arrow::datatypes::{DataType, Field, Fields};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use serde_json::{json, Value};
use sftpack_core::{ConversationRecord, ConversationTurn, Result, SftPackError};
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

/// Prompt column.
pub const PROMPT_COLUMN: &str = "_prompt";
/// Response column.
pub const RESPONSE_COLUMN: &str = "_response";
/// System column.
pub const SYSTEM_COLUMN: &str = "_system";
/// Tools column.
pub const TOOLS_COLUMN: &str = "_tools";
/// Images column.
pub const IMAGES_COLUMN: &str = "_images";
/// Videos column.
pub const VIDEOS_COLUMN: &str = "_videos";

/// Feature dtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureType {
    /// UTF-8 string.
    String,
    /// Always null.
    Null,
}

/// Scalar feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeatureValue {
    /// Element type.
    pub dtype: FeatureType,
    /// Optional feature id.
    pub id: Option<String>,
}

impl FeatureValue {
    fn of(dtype: FeatureType) -> Self {
        Self { dtype, id: None }
    }
}

/// Schema of one conversation turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageSchema {
    /// Turn text.
    pub content: FeatureValue,
    /// Role name.
    pub role: FeatureValue,
}

/// Column schema of a [`ConversationTable`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Features {
    /// Prompt turns.
    pub _prompt: Vec<MessageSchema>,
    /// Response turns.
    pub _response: Vec<MessageSchema>,
    /// System message.
    pub _system: FeatureValue,
    /// Tool description.
    pub _tools: FeatureValue,
    /// Images.
    pub _images: FeatureValue,
    /// Videos.
    pub _videos: FeatureValue,
}

impl Default for Features {
    fn default() -> Self {
        let message = MessageSchema {
            content: FeatureValue::of(FeatureType::String),
            role: FeatureValue::of(FeatureType::String),
        };
        Self {
            _prompt: vec![message.clone()],
            _response: vec![message],
            _system: FeatureValue::of(FeatureType::String),
            _tools: FeatureValue::of(FeatureType::String),
            _images: FeatureValue::of(FeatureType::Null),
            _videos: FeatureValue::of(FeatureType::Null),
        }
    }
}

/// Read-only view of one table row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowView<'a> {
    /// Prompt turns.
    pub prompt: &'a [ConversationTurn],
    /// Response turns.
    pub response: &'a [ConversationTurn],
    /// System message.
    pub system: &'a str,
    /// Tool description.
    pub tools: &'a str,
}

impl RowView<'_> {
    /// The row as a JSON object keyed by column name.
    pub fn to_json(&self) -> Value {
        json!({
            PROMPT_COLUMN: self.prompt,
            RESPONSE_COLUMN: self.response,
            SYSTEM_COLUMN: self.system,
            TOOLS_COLUMN: self.tools,
            IMAGES_COLUMN: null,
            VIDEOS_COLUMN: null,
        })
    }

    /// Rebuild the owned record.
    pub fn to_record(&self) -> ConversationRecord {
        ConversationRecord {
            prompt: self.prompt.to_vec(),
            response: self.response.to_vec(),
            system: Some(self.system.to_string()),
            tools: Some(self.tools.to_string()),
            images: None,
            videos: None,
        }
    }
}

/// Conversion output, stored column by column.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationTable {
    prompt: Vec<Vec<ConversationTurn>>,
    response: Vec<Vec<ConversationTurn>>,
    system: Vec<String>,
    tools: Vec<String>,
}

impl ConversationTable {
    /// Build a table from records, one row per record.
    pub fn from_records(records: Vec<ConversationRecord>) -> Self {
        let mut table = Self {
            prompt: Vec::with_capacity(records.len()),
            response: Vec::with_capacity(records.len()),
            system: Vec::with_capacity(records.len()),
            tools: Vec::with_capacity(records.len()),
        };
        for record in records {
            table.prompt.push(record.prompt);
            table.response.push(record.response);
            table.system.push(record.system.unwrap_or_default());
            table.tools.push(record.tools.unwrap_or_default());
        }
        table
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.prompt.len()
    }

    /// Check if the table has no rows.
    pub fn is_empty(&self) -> bool {
        self.prompt.is_empty()
    }

    /// Column schema.
    pub fn features(&self) -> Features {
        Features::default()
    }

    /// View of row `index`.
    pub fn row(&self, index: usize) -> Option<RowView<'_>> {
        Some(RowView {
            prompt: self.prompt.get(index)?,
            response: self.response.get(index)?,
            system: self.system.get(index)?,
            tools: self.tools.get(index)?,
        })
    }

    /// Iterate over rows in order.
    pub fn rows(&self) -> impl Iterator<Item = RowView<'_>> + '_ {
        (0..self.len()).filter_map(move |i| self.row(i))
    }

    /// Rows of page `page` (0-based) with `page_size` rows per page.
    pub fn page(&self, page: usize, page_size: usize) -> Vec<RowView<'_>> {
        let start = page.saturating_mul(page_size).min(self.len());
        let end = start.saturating_add(page_size).min(self.len());
        (start..end).filter_map(|i| self.row(i)).collect()
    }

    /// Number of pages of `page_size` rows.
    pub fn num_pages(&self, page_size: usize) -> usize {
        if page_size == 0 {
            return 0;
        }
        self.len().div_ceil(page_size)
    }

    /// Rebuild the records, in row order.
    pub fn records(&self) -> Vec<ConversationRecord> {
        self.rows().map(|row| row.to_record()).collect()
    }

    /// `{"data": {column: [...]}, "features": {...}}` document.
    pub fn to_json(&self) -> Value {
        let nulls = vec![Value::Null; self.len()];
        json!({
            "data": {
                PROMPT_COLUMN: self.prompt,
                RESPONSE_COLUMN: self.response,
                SYSTEM_COLUMN: self.system,
                TOOLS_COLUMN: self.tools,
                IMAGES_COLUMN: nulls,
                VIDEOS_COLUMN: nulls,
            },
            "features": self.features(),
        })
    }

    /// One JSON object per row.
    pub fn to_jsonl_rows(&self) -> Vec<Value> {
        self.rows().map(|row| row.to_json()).collect()
    }

    /// Arrow record batch with one column per table column.
    pub fn to_record_batch(&self) -> Result<RecordBatch> {
        let columns: Vec<(&str, ArrayRef)> = vec![
            (PROMPT_COLUMN, turns_array(&self.prompt)?),
            (RESPONSE_COLUMN, turns_array(&self.response)?),
            (
                SYSTEM_COLUMN,
                Arc::new(StringArray::from_iter_values(&self.system)),
            ),
            (
                TOOLS_COLUMN,
                Arc::new(StringArray::from_iter_values(&self.tools)),
            ),
            (IMAGES_COLUMN, Arc::new(NullArray::new(self.len()))),
            (VIDEOS_COLUMN, Arc::new(NullArray::new(self.len()))),
        ];
        RecordBatch::try_from_iter(columns).map_err(|e| SftPackError::Arrow(e.to_string()))
    }

    /// Write the table as a Parquet file.
    pub fn write_parquet<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let batch = self.to_record_batch()?;
        let file = File::create(path.as_ref())?;
        let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
            .map_err(|e| SftPackError::Arrow(format!("Failed to create Parquet writer: {e}")))?;
        writer
            .write(&batch)
            .map_err(|e| SftPackError::Arrow(format!("Failed to write Parquet batch: {e}")))?;
        writer
            .close()
            .map_err(|e| SftPackError::Arrow(format!("Failed to finish Parquet file: {e}")))?;
        Ok(())
    }
}

fn turn_fields() -> Fields {
    Fields::from(vec![
        Field::new("content", DataType::Utf8, false),
        Field::new("role", DataType::Utf8, false),
    ])
}

/// `List<Struct<content: Utf8, role: Utf8>>` column.
fn turns_array(rows: &[Vec<ConversationTurn>]) -> Result<ArrayRef> {
    let missing = |name: &str| SftPackError::Arrow(format!("struct builder has no `{name}` field"));

    let capacity = rows.iter().map(Vec::len).sum();
    let mut list = ListBuilder::new(StructBuilder::from_fields(turn_fields(), capacity));
    for turns in rows {
        let values = list.values();
        for turn in turns {
            values
                .field_builder::<StringBuilder>(0)
                .ok_or_else(|| missing("content"))?
                .append_value(&turn.content);
            values
                .field_builder::<StringBuilder>(1)
                .ok_or_else(|| missing("role"))?
                .append_value(turn.role.as_str());
            values.append(true);
        }
        list.append(true);
    }
    Ok(Arc::new(list.finish()))
}
