//! PostgreSQL source connection.
//!
//! Opens a fresh client per call; no pool is kept between chunks. Result
//! sets are streamed with `query_raw` and forwarded in batches over a bounded
//! channel, so a chunk never sits fully in memory.

use std::sync::Arc;

use async_trait::async_trait;
use futures::TryStreamExt;
use rustls::ClientConfig;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, Config as PgConfig, NoTls};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{debug, info, warn};

use crate::config::SourceConfig;
use crate::core::{Batch, RowStream, SourceConnection, SqlValue};
use crate::error::{Result, TransferError};

/// Batches buffered between the reader task and the serializer.
const STREAM_BUFFER_BATCHES: usize = 4;

/// PostgreSQL implementation of [`SourceConnection`].
pub struct PgConnection {
    pg_config: PgConfig,
    tls: Option<MakeRustlsConnect>,
    fetch_batch_size: usize,
    label: String,
}

impl PgConnection {
    /// Build a connection factory from SourceConfig. No connection is opened yet.
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let mut pg_config = PgConfig::new();
        pg_config.host(&config.host);
        pg_config.port(config.port);
        pg_config.dbname(&config.database);
        pg_config.user(&config.user);
        pg_config.password(&config.password);
        pg_config.connect_timeout(config.get_connect_timeout());
        pg_config.application_name("query-transfer");

        let tls = match config.ssl_mode.to_lowercase().as_str() {
            "disable" => {
                warn!("PostgreSQL TLS is disabled. Credentials will be transmitted in plaintext.");
                None
            }
            mode => Some(MakeRustlsConnect::new(Self::build_tls_config(mode)?)),
        };

        Ok(Self {
            pg_config,
            tls,
            fetch_batch_size: config.get_fetch_batch_size().max(1),
            label: format!("postgres://{}:{}/{}", config.host, config.port, config.database),
        })
    }

    /// Build TLS configuration based on ssl_mode.
    fn build_tls_config(ssl_mode: &str) -> Result<ClientConfig> {
        let builder =
            ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
                .with_safe_default_protocol_versions()
                .map_err(|e| TransferError::Config(format!("TLS setup failed: {}", e)))?;

        let config = match ssl_mode {
            "require" => {
                warn!(
                    "ssl_mode=require: TLS enabled but server certificate is not verified. \
                     Consider using 'verify-full' for production."
                );
                builder
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(NoVerifier))
                    .with_no_client_auth()
            }
            "verify-ca" | "verify-full" => {
                let mut root_store = rustls::RootCertStore::empty();
                root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                builder
                    .with_root_certificates(root_store)
                    .with_no_client_auth()
            }
            other => {
                return Err(TransferError::Config(format!(
                    "Invalid ssl_mode '{}'. Valid options: disable, require, verify-ca, verify-full",
                    other
                )));
            }
        };

        Ok(config)
    }

    /// Open a client and spawn its connection driver.
    async fn connect(&self) -> Result<Client> {
        let client = match &self.tls {
            None => {
                let (client, connection) = self
                    .pg_config
                    .connect(NoTls)
                    .await
                    .map_err(classify_connect_error)?;
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        debug!("PostgreSQL connection closed: {}", e);
                    }
                });
                client
            }
            Some(tls) => {
                let (client, connection) = self
                    .pg_config
                    .connect(tls.clone())
                    .await
                    .map_err(classify_connect_error)?;
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        debug!("PostgreSQL connection closed: {}", e);
                    }
                });
                client
            }
        };
        Ok(client)
    }
}

#[async_trait]
impl SourceConnection for PgConnection {
    async fn get_row_count(&self, query: &str) -> Result<u64> {
        let client = self.connect().await?;
        let sql = count_query(query);
        debug!("Counting rows: {}", sql);

        let row = client
            .query_one(sql.as_str(), &[])
            .await
            .map_err(classify_query_error)?;
        let count: i64 = row.try_get(0).map_err(classify_query_error)?;

        u64::try_from(count).map_err(|_| {
            TransferError::QueryExecution(format!("source reported a negative row count ({})", count))
        })
    }

    async fn execute(&self, query: &str) -> Result<RowStream> {
        let client = self.connect().await?;
        let statement = client
            .prepare(query)
            .await
            .map_err(classify_query_error)?;

        let columns: Vec<String> = statement
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        let col_types: Vec<String> = statement
            .columns()
            .iter()
            .map(|c| c.type_().name().to_string())
            .collect();

        let (tx, stream) = RowStream::channel(columns, STREAM_BUFFER_BATCHES);
        let batch_size = self.fetch_batch_size;

        tokio::spawn(async move {
            let params: Vec<&(dyn ToSql + Sync)> = Vec::new();
            let rows = match client.query_raw(&statement, params).await {
                Ok(rows) => rows,
                Err(e) => {
                    let _ = tx.send(Err(classify_query_error(e))).await;
                    return;
                }
            };
            let mut rows = Box::pin(rows);
            let mut batch: Batch = Vec::with_capacity(batch_size);

            loop {
                match rows.try_next().await {
                    Ok(Some(row)) => {
                        let values: Result<Vec<SqlValue>> = col_types
                            .iter()
                            .enumerate()
                            .map(|(idx, data_type)| convert_pg_row_value(&row, idx, data_type))
                            .collect();
                        match values {
                            Ok(values) => batch.push(values),
                            Err(e) => {
                                let _ = tx.send(Err(e)).await;
                                return;
                            }
                        }
                        if batch.len() >= batch_size {
                            let full = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
                            if tx.send(Ok(full)).await.is_err() {
                                // Consumer went away; stop reading.
                                return;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.send(Err(classify_query_error(e))).await;
                        return;
                    }
                }
            }

            if !batch.is_empty() {
                let _ = tx.send(Ok(batch)).await;
            }
        });

        Ok(stream)
    }

    async fn test_connection(&self) -> Result<()> {
        let client = self.connect().await?;
        client.simple_query("SELECT 1").await?;
        info!("Connected to PostgreSQL source: {}", self.label);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.label
    }
}

/// Wrap a query so the source counts its rows.
pub fn count_query(query: &str) -> String {
    let inner = query.trim_end().trim_end_matches(';').trim_end();
    format!("SELECT COUNT(*) FROM ({}) AS count_subquery", inner)
}

/// Whether a SQLSTATE code denotes a condition worth retrying.
///
/// Class 08 (connection exception), class 53 (insufficient resources),
/// admin/crash shutdown and "cannot connect now" (57P01-57P03),
/// serialization failure (40001) and deadlock (40P01).
pub fn is_transient_sqlstate(code: &str) -> bool {
    code.starts_with("08")
        || code.starts_with("53")
        || matches!(code, "57P01" | "57P02" | "57P03" | "40001" | "40P01")
}

/// Classify a driver error as transient (retry) or permanent.
pub(crate) fn is_transient_pg_error(e: &tokio_postgres::Error) -> bool {
    if let Some(db) = e.as_db_error() {
        return is_transient_sqlstate(db.code().code());
    }
    if e.is_closed() {
        return true;
    }
    std::error::Error::source(e).is_some_and(|s| s.is::<std::io::Error>())
}

fn classify_query_error(e: tokio_postgres::Error) -> TransferError {
    if is_transient_pg_error(&e) {
        return TransferError::transient(describe(&e));
    }
    match e.as_db_error() {
        Some(_) => TransferError::QueryExecution(describe(&e)),
        None => TransferError::connection(describe(&e)),
    }
}

fn classify_connect_error(e: tokio_postgres::Error) -> TransferError {
    TransferError::Connection {
        message: describe(&e),
        transient: is_transient_pg_error(&e),
    }
}

fn describe(e: &tokio_postgres::Error) -> String {
    match e.as_db_error() {
        Some(db) => format!("{} (SQLSTATE {})", db.message(), db.code().code()),
        None => match std::error::Error::source(e) {
            Some(source) => format!("{}: {}", e, source),
            None => e.to_string(),
        },
    }
}

/// Convert a PostgreSQL row value to SqlValue based on column type.
///
/// A value the driver cannot decode fails the row instead of becoming NULL.
fn convert_pg_row_value(row: &tokio_postgres::Row, idx: usize, data_type: &str) -> Result<SqlValue> {
    let value = match data_type {
        "bool" => get::<bool>(row, idx, data_type)?.into(),
        "int2" => get::<i16>(row, idx, data_type)?
            .map(|v| SqlValue::I64(v as i64))
            .unwrap_or(SqlValue::Null),
        "int4" => get::<i32>(row, idx, data_type)?
            .map(|v| SqlValue::I64(v as i64))
            .unwrap_or(SqlValue::Null),
        "int8" => get::<i64>(row, idx, data_type)?.into(),
        "float4" => get::<f32>(row, idx, data_type)?
            .map(|v| SqlValue::F64(v as f64))
            .unwrap_or(SqlValue::Null),
        "float8" => get::<f64>(row, idx, data_type)?.into(),
        "numeric" => get::<rust_decimal::Decimal>(row, idx, data_type)?
            .map(SqlValue::Decimal)
            .unwrap_or(SqlValue::Null),
        "uuid" => get::<uuid::Uuid>(row, idx, data_type)?
            .map(SqlValue::Uuid)
            .unwrap_or(SqlValue::Null),
        "timestamp" => get::<chrono::NaiveDateTime>(row, idx, data_type)?
            .map(SqlValue::DateTime)
            .unwrap_or(SqlValue::Null),
        "timestamptz" => get::<chrono::DateTime<chrono::FixedOffset>>(row, idx, data_type)?
            .map(SqlValue::DateTimeTz)
            .unwrap_or(SqlValue::Null),
        "date" => get::<chrono::NaiveDate>(row, idx, data_type)?
            .map(SqlValue::Date)
            .unwrap_or(SqlValue::Null),
        "time" => get::<chrono::NaiveTime>(row, idx, data_type)?
            .map(SqlValue::Time)
            .unwrap_or(SqlValue::Null),
        "bytea" => get::<Vec<u8>>(row, idx, data_type)?
            .map(SqlValue::Bytes)
            .unwrap_or(SqlValue::Null),
        "json" | "jsonb" => get::<serde_json::Value>(row, idx, data_type)?
            .map(SqlValue::Json)
            .unwrap_or(SqlValue::Null),
        // text, varchar, bpchar, name and anything else with a text representation
        _ => get::<String>(row, idx, data_type)?.into(),
    };
    Ok(value)
}

fn get<'a, T>(row: &'a tokio_postgres::Row, idx: usize, data_type: &str) -> Result<Option<T>>
where
    T: tokio_postgres::types::FromSql<'a>,
{
    row.try_get::<_, Option<T>>(idx)
        .map_err(|e| conversion_error(idx, data_type, &e))
}

fn conversion_error(idx: usize, data_type: &str, cause: &dyn std::fmt::Display) -> TransferError {
    TransferError::Serialization(format!(
        "column {} ({}): {}; cast it to text in the query to export it",
        idx, data_type, cause
    ))
}

/// Certificate verifier that accepts any certificate.
///
/// Only used for `ssl_mode=require`, which encrypts the connection without
/// authenticating the server. Use `verify-full` on untrusted networks.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
