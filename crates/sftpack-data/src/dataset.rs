//! Dataset types and loading.

use arrow::array::{Array as ArrowArray, ArrayRef, AsArray, LargeStringArray, StringArray};
use arrow::datatypes::DataType;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde_json::{Map, Value};
use sftpack_core::{Result, SftPackError};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// A tokenized training example.
///
/// `token_ids` and `loss_mask` always have equal length; positions with a
/// `true` mask contribute to the loss.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TokenizedExample {
    token_ids: Vec<u32>,
    loss_mask: Vec<bool>,
}

impl TokenizedExample {
    /// Create an example, checking that both sequences have the same length.
    pub fn new(token_ids: Vec<u32>, loss_mask: Vec<bool>) -> Result<Self> {
        if token_ids.len() != loss_mask.len() {
            return Err(SftPackError::InvalidArgument(format!(
                "token_ids has {} entries but loss_mask has {}",
                token_ids.len(),
                loss_mask.len()
            )));
        }
        Ok(Self {
            token_ids,
            loss_mask,
        })
    }

    /// Create an example where every token is trained on.
    pub fn fully_trainable(token_ids: Vec<u32>) -> Self {
        let loss_mask = vec![true; token_ids.len()];
        Self {
            token_ids,
            loss_mask,
        }
    }

    /// Token ids.
    pub fn token_ids(&self) -> &[u32] {
        &self.token_ids
    }

    /// Loss mask.
    pub fn loss_mask(&self) -> &[bool] {
        &self.loss_mask
    }

    /// Number of tokens.
    pub fn len(&self) -> usize {
        self.token_ids.len()
    }

    /// Check if the example has no tokens.
    pub fn is_empty(&self) -> bool {
        self.token_ids.is_empty()
    }

    /// Number of positions contributing to the loss.
    pub fn num_trainable(&self) -> usize {
        self.loss_mask.iter().filter(|&&m| m).count()
    }

    /// Keep only the first `len` tokens.
    pub fn truncate(&mut self, len: usize) {
        self.token_ids.truncate(len);
        self.loss_mask.truncate(len);
    }

    /// Split into `(token_ids, loss_mask)`.
    pub fn into_parts(self) -> (Vec<u32>, Vec<bool>) {
        (self.token_ids, self.loss_mask)
    }
}

/// Serialized raw records, one JSON object per entry.
#[derive(Debug, Clone, Default)]
pub struct RawDataset {
    records: Vec<String>,
}

impl RawDataset {
    /// Wrap already-serialized records.
    pub fn from_records(records: Vec<String>) -> Self {
        Self { records }
    }

    /// Load records from a JSONL file, skipping blank lines.
    pub fn from_jsonl<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            SftPackError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to open dataset file {}: {}", path.display(), e),
            ))
        })?;

        let mut records = Vec::new();
        for (line_num, line_result) in BufReader::new(file).lines().enumerate() {
            let line = line_result.map_err(|e| {
                SftPackError::Io(std::io::Error::new(
                    e.kind(),
                    format!("Failed to read line {}: {}", line_num + 1, e),
                ))
            })?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(line);
        }

        Ok(Self { records })
    }

    /// Load records from a Parquet file.
    ///
    /// Every string column (`Utf8` or `LargeUtf8`) becomes a field of the
    /// row's JSON object; other columns are skipped, and null cells are left
    /// out so the normalizer reports them as missing. With `columns`, only the
    /// named columns are read and each must exist and hold strings.
    pub fn from_parquet<P: AsRef<Path>>(path: P, columns: Option<&[&str]>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            SftPackError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to open Parquet file {}: {}", path.display(), e),
            ))
        })?;

        let builder = ParquetRecordBatchReaderBuilder::try_new(file)
            .map_err(|e| SftPackError::Arrow(format!("Failed to create Parquet reader: {e}")))?;

        let schema = builder.schema().clone();
        let selected: Vec<(usize, String)> = match columns {
            Some(names) => names
                .iter()
                .map(|name| {
                    let idx = schema.index_of(name).map_err(|_| {
                        SftPackError::Arrow(format!(
                            "Column '{}' not found in Parquet file. Available columns: {:?}",
                            name,
                            schema.fields().iter().map(|f| f.name()).collect::<Vec<_>>()
                        ))
                    })?;
                    let data_type = schema.field(idx).data_type();
                    if !is_string_type(data_type) {
                        return Err(SftPackError::Arrow(format!(
                            "Column '{name}' is not a string type ({data_type})"
                        )));
                    }
                    Ok((idx, name.to_string()))
                })
                .collect::<Result<_>>()?,
            None => schema
                .fields()
                .iter()
                .enumerate()
                .filter(|(_, f)| is_string_type(f.data_type()))
                .map(|(idx, f)| (idx, f.name().clone()))
                .collect(),
        };

        let reader = builder
            .build()
            .map_err(|e| SftPackError::Arrow(format!("Failed to build Parquet reader: {e}")))?;

        let mut records = Vec::new();
        for batch_result in reader {
            let batch = batch_result
                .map_err(|e| SftPackError::Arrow(format!("Failed to read Parquet batch: {e}")))?;

            let arrays = selected
                .iter()
                .map(|(idx, name)| {
                    StringColumn::new(batch.column(*idx))
                        .map(|column| (name.as_str(), column))
                        .ok_or_else(|| {
                            SftPackError::Arrow(format!("Column '{name}' is not a string type"))
                        })
                })
                .collect::<Result<Vec<_>>>()?;

            for row in 0..batch.num_rows() {
                let mut obj = Map::with_capacity(arrays.len());
                for (name, column) in &arrays {
                    if let Some(value) = column.value(row) {
                        obj.insert(name.to_string(), Value::String(value.to_string()));
                    }
                }
                records.push(serde_json::to_string(&Value::Object(obj))?);
            }
        }

        Ok(Self { records })
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if the dataset is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Serialized records.
    pub fn records(&self) -> &[String] {
        &self.records
    }

    /// Borrowed view suitable for batch conversion.
    pub fn as_strs(&self) -> Vec<&str> {
        self.records.iter().map(String::as_str).collect()
    }
}

fn is_string_type(data_type: &DataType) -> bool {
    matches!(data_type, DataType::Utf8 | DataType::LargeUtf8)
}

/// A string column with 32- or 64-bit offsets.
enum StringColumn<'a> {
    Utf8(&'a StringArray),
    LargeUtf8(&'a LargeStringArray),
}

impl<'a> StringColumn<'a> {
    fn new(array: &'a ArrayRef) -> Option<Self> {
        match array.data_type() {
            DataType::Utf8 => array.as_string_opt::<i32>().map(Self::Utf8),
            DataType::LargeUtf8 => array.as_string_opt::<i64>().map(Self::LargeUtf8),
            _ => None,
        }
    }

    fn value(&self, row: usize) -> Option<&'a str> {
        match *self {
            Self::Utf8(array) => (!array.is_null(row)).then(|| array.value(row)),
            Self::LargeUtf8(array) => (!array.is_null(row)).then(|| array.value(row)),
        }
    }
}

impl IntoIterator for RawDataset {
    type Item = String;
    type IntoIter = std::vec::IntoIter<String>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_example_lengths_checked() {
        let ex = TokenizedExample::new(vec![1, 2, 3], vec![false, true, true]).unwrap();
        assert_eq!(ex.len(), 3);
        assert_eq!(ex.num_trainable(), 2);

        let err = TokenizedExample::new(vec![1, 2], vec![true]).unwrap_err();
        assert!(matches!(err, SftPackError::InvalidArgument(_)));
    }

    #[test]
    fn test_example_truncate() {
        let mut ex = TokenizedExample::fully_trainable(vec![1, 2, 3, 4]);
        ex.truncate(2);
        assert_eq!(ex.into_parts(), (vec![1, 2], vec![true, true]));
    }

    #[test]
    fn test_jsonl_skips_blank_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"content": "a"}}"#).unwrap();
        writeln!(file).unwrap();
        writeln!(file, r#"{{"content": "b"}}"#).unwrap();

        let dataset = RawDataset::from_jsonl(file.path()).unwrap();
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.as_strs()[1], r#"{"content": "b"}"#);
    }

    #[test]
    fn test_jsonl_missing_file() {
        let err = RawDataset::from_jsonl("/nonexistent/data.jsonl").unwrap_err();
        assert!(err.to_string().contains("Failed to open dataset file"));
    }

    fn write_parquet(path: &Path) {
        use arrow::array::StringBuilder;
        use arrow::datatypes::{DataType, Field, Schema};
        use arrow::record_batch::RecordBatch;
        use parquet::arrow::arrow_writer::ArrowWriter;
        use std::sync::Arc;

        let schema = Arc::new(Schema::new(vec![
            Field::new("input", DataType::Utf8, false),
            Field::new("output", DataType::Utf8, true),
        ]));

        let mut input = StringBuilder::new();
        input.append_value("fn a() {}");
        input.append_value("fn b() {}");
        let mut output = StringBuilder::new();
        output.append_value("Does nothing.");
        output.append_null();

        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![Arc::new(input.finish()), Arc::new(output.finish())],
        )
        .unwrap();

        let file = File::create(path).unwrap();
        let mut writer = ArrowWriter::try_new(file, schema, None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();
    }

    #[test]
    fn test_parquet_rows_become_objects() {
        let temp = tempfile::NamedTempFile::new().unwrap();
        write_parquet(temp.path());

        let dataset = RawDataset::from_parquet(temp.path(), None).unwrap();
        assert_eq!(dataset.len(), 2);

        let first: Value = serde_json::from_str(&dataset.records()[0]).unwrap();
        assert_eq!(first["input"], "fn a() {}");
        assert_eq!(first["output"], "Does nothing.");

        let second: Value = serde_json::from_str(&dataset.records()[1]).unwrap();
        assert!(second.get("output").is_none());
    }

    #[test]
    fn test_parquet_column_selection() {
        let temp = tempfile::NamedTempFile::new().unwrap();
        write_parquet(temp.path());

        let dataset = RawDataset::from_parquet(temp.path(), Some(&["input"])).unwrap();
        let first: Value = serde_json::from_str(&dataset.records()[0]).unwrap();
        assert!(first.get("output").is_none());

        let err = RawDataset::from_parquet(temp.path(), Some(&["content"])).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_parquet_skips_non_string_columns() {
        use arrow::array::{Int64Array, LargeStringArray};
        use arrow::datatypes::{Field, Schema};
        use arrow::record_batch::RecordBatch;
        use parquet::arrow::arrow_writer::ArrowWriter;
        use std::sync::Arc;

        let schema = Arc::new(Schema::new(vec![
            Field::new("content", DataType::Utf8, false),
            Field::new("max_stars_count", DataType::Int64, true),
            Field::new("path", DataType::LargeUtf8, true),
        ]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(StringArray::from(vec!["print(1)", "print(2)"])),
                Arc::new(Int64Array::from(vec![Some(12), None])),
                Arc::new(LargeStringArray::from(vec![Some("a.py"), None])),
            ],
        )
        .unwrap();

        let temp = tempfile::NamedTempFile::new().unwrap();
        let mut writer =
            ArrowWriter::try_new(File::create(temp.path()).unwrap(), schema, None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();

        let dataset = RawDataset::from_parquet(temp.path(), None).unwrap();
        assert_eq!(dataset.len(), 2);
        let first: Value = serde_json::from_str(&dataset.records()[0]).unwrap();
        assert_eq!(first["content"], "print(1)");
        assert_eq!(first["path"], "a.py");
        assert!(first.get("max_stars_count").is_none());
        let second: Value = serde_json::from_str(&dataset.records()[1]).unwrap();
        assert!(second.get("path").is_none());

        let err = RawDataset::from_parquet(temp.path(), Some(&["max_stars_count"])).unwrap_err();
        assert!(err.to_string().contains("not a string type"));
    }
}
