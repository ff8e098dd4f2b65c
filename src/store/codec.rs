// src/store/codec.rs

use anyhow::{bail, Context, Result};
use arrow::{
    array::{Array, ArrayRef, Float64Array, Int64Array, StringArray},
    datatypes::{DataType, Field, Schema},
    record_batch::RecordBatch,
};
use parquet::{
    arrow::{arrow_reader::ParquetRecordBatchReaderBuilder, ArrowWriter},
    basic::Compression,
    file::properties::WriterProperties,
};
use std::{
    fs::File,
    io::{BufWriter, Write},
    ops::Range,
    path::Path,
    sync::Arc,
};

use crate::dataset::{Column, ColumnKind, Dataset, Value};

/// Rows per record batch and per row group.
pub const BATCH_ROWS: usize = 65_536;

/// Map a column kind onto its Arrow storage type.
pub fn data_type(kind: ColumnKind) -> DataType {
    match kind {
        ColumnKind::Int => DataType::Int64,
        ColumnKind::Float => DataType::Float64,
        ColumnKind::Text | ColumnKind::Null => DataType::Utf8,
    }
}

pub fn arrow_schema(columns: &[Column]) -> Arc<Schema> {
    let fields: Vec<Field> = columns
        .iter()
        .map(|c| Field::new(&c.name, data_type(c.kind), /* nullable = */ true))
        .collect();
    Arc::new(Schema::new(fields))
}

/// Encode `dataset` as a Snappy-compressed Parquet file into `out`.
pub fn write_dataset<W: Write + Send>(dataset: &Dataset, out: W) -> Result<()> {
    let schema = arrow_schema(dataset.columns());
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .set_max_row_group_size(BATCH_ROWS)
        .build();
    let mut writer = ArrowWriter::try_new(BufWriter::new(out), schema.clone(), Some(props))
        .context("creating ArrowWriter for artifact")?;

    let total = dataset.len();
    for start in (0..total).step_by(BATCH_ROWS) {
        let range = start..(start + BATCH_ROWS).min(total);
        let batch = to_record_batch(dataset, schema.clone(), range.clone())?;
        writer
            .write(&batch)
            .with_context(|| format!("writing rows {:?}", range))?;
    }
    writer.close().context("closing ArrowWriter for artifact")?;
    Ok(())
}

fn to_record_batch(dataset: &Dataset, schema: Arc<Schema>, range: Range<usize>) -> Result<RecordBatch> {
    let arrays: Vec<ArrayRef> = dataset
        .columns()
        .iter()
        .enumerate()
        .map(|(idx, col)| column_array(dataset, idx, col.kind, range.clone()))
        .collect();
    RecordBatch::try_new(schema, arrays).context("building artifact record batch")
}

fn column_array(dataset: &Dataset, idx: usize, kind: ColumnKind, range: Range<usize>) -> ArrayRef {
    let cells = range.filter_map(|r| dataset.row(r)).map(|row| &row.values()[idx]);
    match kind {
        ColumnKind::Int => Arc::new(
            cells
                .map(|v| match v {
                    Value::Int(i) => Some(*i),
                    _ => None,
                })
                .collect::<Int64Array>(),
        ),
        ColumnKind::Float => Arc::new(
            cells
                .map(|v| match v {
                    Value::Float(f) => Some(*f),
                    _ => None,
                })
                .collect::<Float64Array>(),
        ),
        ColumnKind::Text | ColumnKind::Null => Arc::new(
            cells
                .map(|v| match v {
                    Value::Text(s) => Some(s.as_str()),
                    _ => None,
                })
                .collect::<StringArray>(),
        ),
    }
}

/// Decode a Parquet file written by [`write_dataset`].
pub fn read_dataset(path: &Path) -> Result<Dataset> {
    let file = File::open(path).with_context(|| format!("failed to open `{}`", path.display()))?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)
        .with_context(|| format!("`{}` is not a readable parquet file", path.display()))?;

    let names: Vec<String> = builder
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().to_string())
        .collect();

    let reader = builder
        .with_batch_size(BATCH_ROWS)
        .build()
        .with_context(|| format!("failed to build RecordBatchReader for `{}`", path.display()))?;

    let mut rows: Vec<Vec<Value>> = Vec::new();
    for batch in reader {
        let batch =
            batch.with_context(|| format!("error reading RecordBatch from `{}`", path.display()))?;
        append_rows(&batch, &mut rows)?;
    }

    Dataset::from_rows(names, rows)
}

fn append_rows(batch: &RecordBatch, rows: &mut Vec<Vec<Value>>) -> Result<()> {
    let start = rows.len();
    let width = batch.num_columns();
    rows.extend((0..batch.num_rows()).map(|_| Vec::with_capacity(width)));
    let out = &mut rows[start..];

    let schema = batch.schema();
    for (array, field) in batch.columns().iter().zip(schema.fields().iter()) {
        match array.data_type() {
            DataType::Int64 => {
                let arr = downcast::<Int64Array>(array, field.name())?;
                for (i, row) in out.iter_mut().enumerate() {
                    row.push(if arr.is_null(i) {
                        Value::Null
                    } else {
                        Value::Int(arr.value(i))
                    });
                }
            }
            DataType::Float64 => {
                let arr = downcast::<Float64Array>(array, field.name())?;
                for (i, row) in out.iter_mut().enumerate() {
                    row.push(if arr.is_null(i) {
                        Value::Null
                    } else {
                        Value::Float(arr.value(i))
                    });
                }
            }
            DataType::Utf8 => {
                let arr = downcast::<StringArray>(array, field.name())?;
                for (i, row) in out.iter_mut().enumerate() {
                    row.push(if arr.is_null(i) {
                        Value::Null
                    } else {
                        Value::Text(arr.value(i).to_string())
                    });
                }
            }
            other => bail!("column `{}` has unsupported type {}", field.name(), other),
        }
    }
    Ok(())
}

fn downcast<'a, T: 'static>(array: &'a ArrayRef, name: &str) -> Result<&'a T> {
    array
        .as_any()
        .downcast_ref::<T>()
        .with_context(|| format!("column `{}` does not match its declared type", name))
}
