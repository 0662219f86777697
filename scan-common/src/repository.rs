//! # Scan repository
//!
//! Persistence of `NormalizedRecord`s with latest-wins semantics.
use std::str::FromStr;
use std::time;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use thiserror::Error;

use crate::record::NormalizedRecord;

/// Enumeration of storage errors. All of them are considered transient by the processor.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("pool creation failed with: {error}")]
    PoolCreationError { error: sqlx::Error },
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("stored port {0} is not a valid port")]
    InvalidPort(i32),
}

/// Storage capability consumed by the message handler.
#[async_trait]
pub trait ScanRepository: Send + Sync {
    /// Persist `record` unless a strictly newer record is already stored for its key.
    ///
    /// Implementations must perform the comparison and the write as one atomic operation, so
    /// concurrent writers on the same key converge to the record with the greatest timestamp.
    async fn upsert_latest(&self, record: &NormalizedRecord) -> Result<(), StorageError>;
}

/// Open a connection pool to the scans database and check it is reachable.
///
/// # Arguments
///
/// * `url`: A URL pointing to where the PostgreSQL database is hosted.
/// * `max_connections`: Upper bound of connections kept by the pool.
/// * `app_name`: Reported to PostgreSQL as `application_name`.
pub async fn connect(
    url: &str,
    max_connections: u32,
    app_name: &'static str,
) -> Result<PgPool, StorageError> {
    let options = PgConnectOptions::from_str(url)
        .map_err(|error| StorageError::PoolCreationError { error })?
        .application_name(app_name);

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .min_connections(2.min(max_connections))
        .idle_timeout(time::Duration::from_secs(5 * 60))
        .connect_with(options)
        .await
        .map_err(|error| StorageError::ConnectionError { error })?;

    sqlx::query("SELECT 1")
        .execute(&pool)
        .await
        .map_err(|error| StorageError::QueryError {
            command: "SELECT".to_owned(),
            error,
        })?;

    Ok(pool)
}

#[derive(sqlx::FromRow)]
struct ScanRow {
    ip: String,
    port: i32,
    service: String,
    last_scanned: DateTime<Utc>,
    response: String,
}

impl TryFrom<ScanRow> for NormalizedRecord {
    type Error = StorageError;

    fn try_from(row: ScanRow) -> Result<Self, Self::Error> {
        let port = u16::try_from(row.port).map_err(|_| StorageError::InvalidPort(row.port))?;

        Ok(NormalizedRecord {
            ip: row.ip,
            port,
            service: row.service,
            timestamp: row.last_scanned,
            response: row.response,
        })
    }
}

/// A `ScanRepository` backed by the `scans` table in PostgreSQL.
#[derive(Clone)]
pub struct PgScanRepository {
    pool: PgPool,
}

impl PgScanRepository {
    /// Wrap an existing pool. The `scans` table must exist, see the migrations directory.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Read the record currently stored for a key.
    pub async fn get_latest(
        &self,
        ip: &str,
        port: u16,
        service: &str,
    ) -> Result<Option<NormalizedRecord>, StorageError> {
        let base_query = r#"
SELECT
    ip, port, service, last_scanned, response
FROM
    scans
WHERE
    ip = $1
    AND port = $2
    AND service = $3
        "#;

        let row: Option<ScanRow> = sqlx::query_as(base_query)
            .bind(ip)
            .bind(i32::from(port))
            .bind(service)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| StorageError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })?;

        row.map(NormalizedRecord::try_from).transpose()
    }
}

#[async_trait]
impl ScanRepository for PgScanRepository {
    async fn upsert_latest(&self, record: &NormalizedRecord) -> Result<(), StorageError> {
        // The WHERE clause makes the comparison part of the same statement as the write, which
        // leaves the row untouched when an older scan arrives after a newer one.
        let base_query = r#"
INSERT INTO scans
    (ip, port, service, last_scanned, response)
VALUES
    ($1, $2, $3, $4, $5)
ON CONFLICT (ip, port, service)
DO UPDATE SET
    last_scanned = EXCLUDED.last_scanned,
    response = EXCLUDED.response
WHERE
    EXCLUDED.last_scanned >= scans.last_scanned
        "#;

        sqlx::query(base_query)
            .bind(&record.ip)
            .bind(i32::from(record.port))
            .bind(&record.service)
            .bind(record.timestamp)
            .bind(&record.response)
            .execute(&self.pool)
            .await
            .map_err(|error| StorageError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        Ok(())
    }
}
