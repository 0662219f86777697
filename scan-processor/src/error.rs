use rdkafka::error::KafkaError;
use scan_common::pgqueue;
use scan_common::repository::StorageError;
use thiserror::Error;

/// Enumeration of errors that stop the poll loop of a `ScanWorker`.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("a database error occurred when dequeuing messages")]
    DatabaseError(#[from] pgqueue::DatabaseError),
}

/// Enumeration of errors that make the processor exit.
#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error("invalid configuration: {0}")]
    Config(#[from] envconfig::Error),
    #[error("storage is not available: {0}")]
    Storage(#[from] StorageError),
    #[error("failed to apply migrations: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("dead letter producer is not available: {0}")]
    Kafka(#[from] KafkaError),
    #[error("failed to install metrics recorder: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
}
