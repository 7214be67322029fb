//! Row value types streamed from a source connection into chunk files.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::Result;

/// A single typed cell of a result row.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// SQL NULL.
    Null,

    /// Boolean value.
    Bool(bool),

    /// Any integer column, widened to 64 bits.
    I64(i64),

    /// Any floating point column, widened to 64 bits.
    F64(f64),

    /// Decimal value with arbitrary precision.
    Decimal(Decimal),

    /// Text data.
    Text(String),

    /// Binary data.
    Bytes(Vec<u8>),

    /// UUID/GUID value.
    Uuid(Uuid),

    /// Date without time component.
    Date(NaiveDate),

    /// Time without date component.
    Time(NaiveTime),

    /// Timestamp without timezone.
    DateTime(NaiveDateTime),

    /// Timestamp with timezone offset.
    DateTimeTz(DateTime<FixedOffset>),

    /// JSON document.
    Json(serde_json::Value),
}

impl SqlValue {
    /// Check if this value is NULL.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Render as a CSV field. NULL becomes the empty string, bytes are hex encoded.
    pub fn to_csv_field(&self) -> String {
        match self {
            SqlValue::Null => String::new(),
            SqlValue::Bool(v) => v.to_string(),
            SqlValue::I64(v) => v.to_string(),
            SqlValue::F64(v) => v.to_string(),
            SqlValue::Decimal(v) => v.to_string(),
            SqlValue::Text(v) => v.clone(),
            SqlValue::Bytes(v) => encode_hex(v),
            SqlValue::Uuid(v) => v.to_string(),
            SqlValue::Date(v) => v.format("%Y-%m-%d").to_string(),
            SqlValue::Time(v) => v.format("%H:%M:%S%.f").to_string(),
            SqlValue::DateTime(v) => v.format("%Y-%m-%d %H:%M:%S%.f").to_string(),
            SqlValue::DateTimeTz(v) => v.to_rfc3339(),
            SqlValue::Json(v) => v.to_string(),
        }
    }

    /// Convert to a JSON value for line-delimited JSON output.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;

        match self {
            SqlValue::Null => Value::Null,
            SqlValue::Bool(v) => Value::Bool(*v),
            SqlValue::I64(v) => Value::from(*v),
            // NaN and infinities have no JSON representation
            SqlValue::F64(v) => serde_json::Number::from_f64(*v)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            SqlValue::Json(v) => v.clone(),
            other => Value::String(other.to_csv_field()),
        }
    }
}

fn encode_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2 + 2);
    out.push_str("\\x");
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::I64(v as i64)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::I64(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::F64(v)
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// One result row.
pub type Row = Vec<SqlValue>;

/// A batch of rows delivered over the row stream channel.
pub type Batch = Vec<Row>;

/// Streaming result set returned by a source connection.
///
/// Rows arrive in batches over a bounded channel fed by the connection's
/// background task, so at most a few batches of a chunk are held in memory.
/// An `Err` item aborts the stream; the sender side is dropped when the
/// result set is exhausted.
#[derive(Debug)]
pub struct RowStream {
    /// Column names, in row order.
    pub columns: Vec<String>,

    receiver: mpsc::Receiver<Result<Batch>>,
}

impl RowStream {
    /// Wrap a batch receiver.
    pub fn new(columns: Vec<String>, receiver: mpsc::Receiver<Result<Batch>>) -> Self {
        Self { columns, receiver }
    }

    /// Create a stream plus the sender used to feed it.
    pub fn channel(columns: Vec<String>, buffer: usize) -> (mpsc::Sender<Result<Batch>>, Self) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (tx, Self::new(columns, rx))
    }

    /// Build a stream from already materialized batches.
    pub fn from_batches(columns: Vec<String>, batches: Vec<Result<Batch>>) -> Self {
        let (tx, rx) = mpsc::channel(batches.len().max(1));
        for batch in batches {
            // Capacity equals the batch count, so try_send cannot fail on a full buffer.
            let _ = tx.try_send(batch);
        }
        Self::new(columns, rx)
    }

    /// Receive the next batch, or `None` when the result set is exhausted.
    pub async fn next_batch(&mut self) -> Option<Result<Batch>> {
        self.receiver.recv().await
    }
}
