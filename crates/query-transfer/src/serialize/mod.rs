//! File serialization of row streams.
//!
//! CSV output carries a header row and may be gzip-compressed; JSON-lines
//! output writes one object per row keyed by column name; Parquet output is
//! snappy-compressed with a schema taken from the first batch. Encoding
//! happens on the blocking pool one batch at a time, so the async side only
//! ever holds the batch in flight.

mod parquet_file;

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tracing::debug;

use self::parquet_file::ParquetEncoder;
use crate::core::{Batch, RowSerializer, RowStream};
use crate::error::{Result, TransferError};

/// Output file format for chunk files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Csv,
    /// Gzip-compressed CSV.
    CsvGz,
    Jsonl,
    /// Snappy-compressed Parquet.
    Parquet,
}

impl OutputFormat {
    /// File extension without the leading dot.
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Csv => "csv",
            OutputFormat::CsvGz => "csv.gz",
            OutputFormat::Jsonl => "jsonl",
            OutputFormat::Parquet => "parquet",
        }
    }

    /// Name used in configuration and on the command line.
    pub fn name(&self) -> &'static str {
        match self {
            OutputFormat::Csv => "csv",
            OutputFormat::CsvGz => "csv_gz",
            OutputFormat::Jsonl => "jsonl",
            OutputFormat::Parquet => "parquet",
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "csv" => Ok(OutputFormat::Csv),
            "csv_gz" | "csv.gz" | "gzip" => Ok(OutputFormat::CsvGz),
            "jsonl" | "json" | "ndjson" => Ok(OutputFormat::Jsonl),
            "parquet" => Ok(OutputFormat::Parquet),
            other => Err(TransferError::Config(format!(
                "unsupported output format '{}' (expected csv, csv_gz, jsonl or parquet)",
                other
            ))),
        }
    }
}

/// Byte sink under the text encoders.
enum Sink {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
}

impl Sink {
    /// Flush everything, write the gzip trailer if any, and return the file.
    fn into_file(self) -> Result<File> {
        let mut out = match self {
            Sink::Plain(out) => out,
            Sink::Gzip(gz) => gz.finish()?,
        };
        out.flush()?;
        out.into_inner()
            .map_err(|e| TransferError::Io(e.into_error()))
    }
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Sink::Plain(out) => out.write(buf),
            Sink::Gzip(gz) => gz.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Sink::Plain(out) => out.flush(),
            Sink::Gzip(gz) => gz.flush(),
        }
    }
}

/// Encoder state moved in and out of the blocking pool between batches.
enum Encoder {
    Csv(csv::Writer<Sink>),
    Jsonl {
        out: Sink,
        columns: Arc<Vec<String>>,
    },
    Parquet(ParquetEncoder),
}

impl Encoder {
    fn open(path: &Path, format: OutputFormat, columns: Arc<Vec<String>>) -> Result<Self> {
        let file = File::create(path)?;
        match format {
            OutputFormat::Csv | OutputFormat::CsvGz => {
                let out = BufWriter::new(file);
                let sink = if format == OutputFormat::CsvGz {
                    Sink::Gzip(GzEncoder::new(out, Compression::default()))
                } else {
                    Sink::Plain(out)
                };
                let mut writer = csv::WriterBuilder::new()
                    .has_headers(false)
                    .from_writer(sink);
                writer
                    .write_record(columns.iter())
                    .map_err(|e| TransferError::Serialization(format!("CSV header: {}", e)))?;
                Ok(Encoder::Csv(writer))
            }
            OutputFormat::Jsonl => Ok(Encoder::Jsonl {
                out: Sink::Plain(BufWriter::new(file)),
                columns,
            }),
            OutputFormat::Parquet => Ok(Encoder::Parquet(ParquetEncoder::new(file, columns))),
        }
    }

    fn write_batch(&mut self, batch: &Batch, width: usize) -> Result<()> {
        if let Some(row) = batch.iter().find(|row| row.len() != width) {
            return Err(TransferError::Serialization(format!(
                "row has {} values but the result set has {} columns",
                row.len(),
                width
            )));
        }
        match self {
            Encoder::Csv(writer) => {
                for row in batch {
                    writer
                        .write_record(row.iter().map(|v| v.to_csv_field()))
                        .map_err(|e| TransferError::Serialization(format!("CSV row: {}", e)))?;
                }
            }
            Encoder::Jsonl { out, columns } => {
                for row in batch {
                    let object: serde_json::Map<String, serde_json::Value> = columns
                        .iter()
                        .cloned()
                        .zip(row.iter().map(|v| v.to_json()))
                        .collect();
                    serde_json::to_writer(&mut *out, &object)
                        .map_err(|e| TransferError::Serialization(format!("JSON row: {}", e)))?;
                    out.write_all(b"\n")?;
                }
            }
            Encoder::Parquet(encoder) => encoder.write_batch(batch)?,
        }
        Ok(())
    }

    fn finish(self) -> Result<()> {
        let file = match self {
            Encoder::Csv(writer) => writer
                .into_inner()
                .map_err(|e| TransferError::Serialization(format!("CSV flush: {}", e)))?
                .into_file()?,
            Encoder::Jsonl { out, .. } => out.into_file()?,
            Encoder::Parquet(encoder) => encoder.finish()?,
        };
        file.sync_all()?;
        Ok(())
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| TransferError::Orchestration(format!("serializer task panicked: {}", e)))?
}

/// CSV / JSON-lines serializer writing to the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileSerializer;

impl FileSerializer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RowSerializer for FileSerializer {
    async fn write(&self, mut rows: RowStream, path: &Path, format: OutputFormat) -> Result<u64> {
        let columns = Arc::new(rows.columns.clone());
        let width = columns.len();
        let owned_path = path.to_path_buf();

        let mut encoder =
            run_blocking(move || Encoder::open(&owned_path, format, columns)).await?;
        let mut written = 0u64;

        while let Some(batch) = rows.next_batch().await {
            let batch = batch?;
            let count = batch.len() as u64;
            encoder = run_blocking(move || {
                encoder.write_batch(&batch, width)?;
                Ok(encoder)
            })
            .await?;
            written += count;
        }

        run_blocking(move || encoder.finish()).await?;
        debug!("Serialized {} rows to {}", written, path.display());
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SqlValue;
    use tempfile::TempDir;

    fn sample_stream() -> RowStream {
        RowStream::from_batches(
            vec!["id".into(), "name".into()],
            vec![
                Ok(vec![
                    vec![SqlValue::I64(1), SqlValue::Text("alpha".into())],
                    vec![SqlValue::I64(2), SqlValue::Null],
                ]),
                Ok(vec![vec![SqlValue::I64(3), SqlValue::Text("a,b".into())]]),
            ],
        )
    }

    #[tokio::test]
    async fn test_write_csv() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.csv");

        let rows = FileSerializer
            .write(sample_stream(), &path, OutputFormat::Csv)
            .await
            .unwrap();
        assert_eq!(rows, 3);

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "id,name\n1,alpha\n2,\n3,\"a,b\"\n");
    }

    #[tokio::test]
    async fn test_write_jsonl() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.jsonl");

        FileSerializer
            .write(sample_stream(), &path, OutputFormat::Jsonl)
            .await
            .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["id"], 1);
        assert_eq!(lines[1]["name"], serde_json::Value::Null);
    }

    #[tokio::test]
    async fn test_row_width_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.csv");
        let stream = RowStream::from_batches(
            vec!["a".into(), "b".into()],
            vec![Ok(vec![vec![SqlValue::I64(1)]])],
        );

        let err = FileSerializer
            .write(stream, &path, OutputFormat::Csv)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Serialization(_)));
    }

    #[tokio::test]
    async fn test_stream_error_propagates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("err.csv");
        let stream = RowStream::from_batches(
            vec!["a".into()],
            vec![Err(TransferError::transient("connection reset"))],
        );

        let err = FileSerializer
            .write(stream, &path, OutputFormat::Csv)
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_output_format_parse() {
        assert_eq!("CSV".parse::<OutputFormat>().unwrap(), OutputFormat::Csv);
        assert_eq!("jsonl".parse::<OutputFormat>().unwrap(), OutputFormat::Jsonl);
        assert_eq!("parquet".parse::<OutputFormat>().unwrap(), OutputFormat::Parquet);
        assert_eq!("csv.gz".parse::<OutputFormat>().unwrap(), OutputFormat::CsvGz);
        assert_eq!("csv-gz".parse::<OutputFormat>().unwrap(), OutputFormat::CsvGz);
        assert!("xlsx".parse::<OutputFormat>().is_err());
        assert_eq!(OutputFormat::Jsonl.extension(), "jsonl");
        assert_eq!(OutputFormat::CsvGz.extension(), "csv.gz");
        assert_eq!(OutputFormat::CsvGz.to_string(), "csv_gz");
    }

    #[tokio::test]
    async fn test_write_gzip_csv() {
        use flate2::read::GzDecoder;
        use std::io::Read;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.csv.gz");

        let rows = FileSerializer
            .write(sample_stream(), &path, OutputFormat::CsvGz)
            .await
            .unwrap();
        assert_eq!(rows, 3);

        let mut content = String::new();
        GzDecoder::new(std::fs::File::open(&path).unwrap())
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "id,name\n1,alpha\n2,\n3,\"a,b\"\n");
    }

    #[tokio::test]
    async fn test_write_parquet() {
        use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.parquet");

        let rows = FileSerializer
            .write(sample_stream(), &path, OutputFormat::Parquet)
            .await
            .unwrap();
        assert_eq!(rows, 3);

        let builder =
            ParquetRecordBatchReaderBuilder::try_new(std::fs::File::open(&path).unwrap()).unwrap();
        assert_eq!(builder.metadata().file_metadata().num_rows(), 3);
        let names: Vec<String> = builder
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect();
        assert_eq!(names, vec!["id", "name"]);
    }
}
