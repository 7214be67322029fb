//! Parquet chunk files.
//!
//! Column types are taken from the first non-null value of each column in the
//! first batch. Columns that are entirely NULL in that batch, and every type
//! without a natural Arrow counterpart (decimal, uuid, time, json), are stored
//! as UTF-8 text using the same rendering as CSV.

use std::fs::File;
use std::sync::Arc;

use arrow::array::{
    ArrayRef, BinaryArray, BooleanArray, Date32Array, Float64Array, Int64Array, StringArray,
    TimestampMicrosecondArray,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::Datelike;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;

use crate::core::{Batch, SqlValue};
use crate::error::{Result, TransferError};

/// Days between 0001-01-01 and 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Bool,
    Int64,
    Float64,
    Binary,
    Date,
    Timestamp,
    TimestampUtc,
    Text,
}

impl ColumnKind {
    fn of(value: &SqlValue) -> Self {
        match value {
            SqlValue::Bool(_) => ColumnKind::Bool,
            SqlValue::I64(_) => ColumnKind::Int64,
            SqlValue::F64(_) => ColumnKind::Float64,
            SqlValue::Bytes(_) => ColumnKind::Binary,
            SqlValue::Date(_) => ColumnKind::Date,
            SqlValue::DateTime(_) => ColumnKind::Timestamp,
            SqlValue::DateTimeTz(_) => ColumnKind::TimestampUtc,
            _ => ColumnKind::Text,
        }
    }

    fn data_type(&self) -> DataType {
        match self {
            ColumnKind::Bool => DataType::Boolean,
            ColumnKind::Int64 => DataType::Int64,
            ColumnKind::Float64 => DataType::Float64,
            ColumnKind::Binary => DataType::Binary,
            ColumnKind::Date => DataType::Date32,
            ColumnKind::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, None),
            ColumnKind::TimestampUtc => {
                DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()))
            }
            ColumnKind::Text => DataType::Utf8,
        }
    }
}

/// Incremental Parquet writer; the Arrow schema is fixed by the first batch.
pub(super) struct ParquetEncoder {
    file: Option<File>,
    columns: Arc<Vec<String>>,
    writer: Option<(ArrowWriter<File>, SchemaRef, Vec<ColumnKind>)>,
}

impl ParquetEncoder {
    pub(super) fn new(file: File, columns: Arc<Vec<String>>) -> Self {
        Self {
            file: Some(file),
            columns,
            writer: None,
        }
    }

    pub(super) fn write_batch(&mut self, batch: &Batch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        if self.writer.is_none() {
            let kinds = infer_kinds(self.columns.len(), batch);
            self.start(kinds)?;
        }
        let Some((writer, schema, kinds)) = self.writer.as_mut() else {
            return Ok(());
        };

        let arrays = kinds
            .iter()
            .enumerate()
            .map(|(idx, kind)| column_array(&schema.fields()[idx], *kind, idx, batch))
            .collect::<Result<Vec<ArrayRef>>>()?;
        let record = RecordBatch::try_new(schema.clone(), arrays).map_err(parquet_error)?;
        writer.write(&record).map_err(parquet_error)
    }

    /// Write the footer and return the file for syncing.
    pub(super) fn finish(mut self) -> Result<File> {
        if self.writer.is_none() {
            // No rows: still produce a readable file with an all-text schema.
            self.start(vec![ColumnKind::Text; self.columns.len()])?;
        }
        match self.writer {
            Some((writer, _, _)) => writer.into_inner().map_err(parquet_error),
            None => Err(TransferError::Serialization(
                "parquet writer was never opened".into(),
            )),
        }
    }

    fn start(&mut self, kinds: Vec<ColumnKind>) -> Result<()> {
        let Some(file) = self.file.take() else {
            return Err(TransferError::Serialization(
                "parquet writer already started".into(),
            ));
        };
        let fields: Vec<Field> = self
            .columns
            .iter()
            .zip(&kinds)
            .map(|(name, kind)| Field::new(name, kind.data_type(), true))
            .collect();
        let schema: SchemaRef = Arc::new(Schema::new(fields));

        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build();
        let writer = ArrowWriter::try_new(file, schema.clone(), Some(props)).map_err(parquet_error)?;
        self.writer = Some((writer, schema, kinds));
        Ok(())
    }
}

fn infer_kinds(width: usize, batch: &Batch) -> Vec<ColumnKind> {
    (0..width)
        .map(|idx| {
            batch
                .iter()
                .filter_map(|row| row.get(idx))
                .find(|v| !v.is_null())
                .map(ColumnKind::of)
                .unwrap_or(ColumnKind::Text)
        })
        .collect()
}

fn column_array(field: &Field, kind: ColumnKind, idx: usize, batch: &Batch) -> Result<ArrayRef> {
    let values = batch.iter().map(|row| &row[idx]);
    let mismatch = |value: &SqlValue| {
        TransferError::Serialization(format!(
            "column '{}' holds {:?} values, cannot store {:?} in the same parquet file",
            field.name(),
            kind,
            value
        ))
    };

    let array: ArrayRef = match kind {
        ColumnKind::Bool => Arc::new(BooleanArray::from(
            values
                .map(|v| match v {
                    SqlValue::Null => Ok(None),
                    SqlValue::Bool(b) => Ok(Some(*b)),
                    other => Err(mismatch(other)),
                })
                .collect::<Result<Vec<_>>>()?,
        )),
        ColumnKind::Int64 => Arc::new(Int64Array::from(
            values
                .map(|v| match v {
                    SqlValue::Null => Ok(None),
                    SqlValue::I64(n) => Ok(Some(*n)),
                    other => Err(mismatch(other)),
                })
                .collect::<Result<Vec<_>>>()?,
        )),
        ColumnKind::Float64 => Arc::new(Float64Array::from(
            values
                .map(|v| match v {
                    SqlValue::Null => Ok(None),
                    SqlValue::F64(f) => Ok(Some(*f)),
                    SqlValue::I64(n) => Ok(Some(*n as f64)),
                    other => Err(mismatch(other)),
                })
                .collect::<Result<Vec<_>>>()?,
        )),
        ColumnKind::Binary => Arc::new(BinaryArray::from(
            values
                .map(|v| match v {
                    SqlValue::Null => Ok(None),
                    SqlValue::Bytes(b) => Ok(Some(b.as_slice())),
                    other => Err(mismatch(other)),
                })
                .collect::<Result<Vec<_>>>()?,
        )),
        ColumnKind::Date => Arc::new(Date32Array::from(
            values
                .map(|v| match v {
                    SqlValue::Null => Ok(None),
                    SqlValue::Date(d) => Ok(Some(d.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE)),
                    other => Err(mismatch(other)),
                })
                .collect::<Result<Vec<_>>>()?,
        )),
        ColumnKind::Timestamp => Arc::new(TimestampMicrosecondArray::from(
            values
                .map(|v| match v {
                    SqlValue::Null => Ok(None),
                    SqlValue::DateTime(ts) => Ok(Some(ts.and_utc().timestamp_micros())),
                    other => Err(mismatch(other)),
                })
                .collect::<Result<Vec<_>>>()?,
        )),
        ColumnKind::TimestampUtc => Arc::new(
            TimestampMicrosecondArray::from(
                values
                    .map(|v| match v {
                        SqlValue::Null => Ok(None),
                        SqlValue::DateTimeTz(ts) => Ok(Some(ts.timestamp_micros())),
                        other => Err(mismatch(other)),
                    })
                    .collect::<Result<Vec<_>>>()?,
            )
            .with_timezone("UTC"),
        ),
        ColumnKind::Text => Arc::new(StringArray::from(
            values
                .map(|v| (!v.is_null()).then(|| v.to_csv_field()))
                .collect::<Vec<Option<String>>>(),
        )),
    };
    Ok(array)
}

fn parquet_error(e: impl std::fmt::Display) -> TransferError {
    TransferError::Serialization(format!("parquet: {}", e))
}
