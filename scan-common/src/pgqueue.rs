//! # PgQueue
//!
//! An at-least-once message queue backed by a PostgreSQL table.
//!
//! Dequeuing a message leases it for a limited time. A leased message must be acknowledged or
//! negatively acknowledged before the lease runs out; otherwise it becomes available again and is
//! redelivered with an incremented `attempt`.
use std::time;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use thiserror::Error;

/// Enumeration of database-related errors in PgQueue.
/// Errors that can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
}

pub type PgQueueResult<T> = std::result::Result<T, DatabaseError>;

/// A leased message handed to a worker.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Delivery {
    /// A unique id identifying the message.
    pub id: i64,
    /// The queue the message was dequeued from.
    pub queue: String,
    /// The raw message body.
    pub data: Vec<u8>,
    /// 1 on first delivery, incremented on every redelivery.
    pub attempt: i32,
    pub created_at: DateTime<Utc>,
}

impl Delivery {
    /// The id reported in log lines and dead letter metadata.
    pub fn message_id(&self) -> String {
        self.id.to_string()
    }
}

/// A queue implemented on top of the `scan_queue` table in PostgreSQL.
#[derive(Clone)]
pub struct PgQueue {
    name: String,
    pool: PgPool,
}

impl PgQueue {
    /// Initialize a new PgQueue from a provided connection pool.
    pub async fn new_from_pool(queue_name: &str, pool: PgPool) -> PgQueue {
        let name = queue_name.to_owned();

        Self { name, pool }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lease up to `limit` messages for `lease`.
    ///
    /// Messages whose previous lease expired without an ack or nack are picked up again here.
    pub async fn dequeue(
        &self,
        attempted_by: &str,
        limit: u32,
        lease: time::Duration,
    ) -> PgQueueResult<Vec<Delivery>> {
        // The query that follows uses a FOR UPDATE SKIP LOCKED clause so concurrent consumers never
        // lease the same row twice.
        let base_query = r#"
WITH available_in_queue AS (
    SELECT
        id
    FROM
        scan_queue
    WHERE
        queue = $1
        AND (
            (status = 'available' AND scheduled_at <= NOW())
            OR (status = 'leased' AND leased_until <= NOW())
        )
    ORDER BY
        attempt,
        scheduled_at
    LIMIT $2
    FOR UPDATE SKIP LOCKED
)
UPDATE
    scan_queue
SET
    status = 'leased'::delivery_status,
    leased_until = NOW() + $3,
    attempt = attempt + 1,
    attempted_by = array_append(attempted_by, $4::text)
FROM
    available_in_queue
WHERE
    scan_queue.id = available_in_queue.id
RETURNING
    scan_queue.id, scan_queue.queue, scan_queue.data, scan_queue.attempt, scan_queue.created_at
        "#;

        sqlx::query_as(base_query)
            .bind(&self.name)
            .bind(limit as i64)
            .bind(lease)
            .bind(attempted_by)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| DatabaseError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })
    }

    /// Mark `delivery` as completed.
    ///
    /// Returns `false` when the lease was lost in the meantime, i.e. the message expired and was
    /// redelivered. The message stays with whoever holds the current lease.
    pub async fn ack(&self, delivery: &Delivery) -> PgQueueResult<bool> {
        let base_query = r#"
UPDATE
    scan_queue
SET
    status = 'completed'::delivery_status,
    last_attempt_finished_at = NOW(),
    leased_until = NULL
WHERE
    queue = $1
    AND id = $2
    AND attempt = $3
    AND status = 'leased'
        "#;

        let result = sqlx::query(base_query)
            .bind(&self.name)
            .bind(delivery.id)
            .bind(delivery.attempt)
            .execute(&self.pool)
            .await
            .map_err(|error| DatabaseError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(result.rows_affected() == 1)
    }

    /// Release `delivery` so it becomes available again after `retry_interval`.
    ///
    /// Returns `false` when the lease was lost in the meantime.
    pub async fn nack(
        &self,
        delivery: &Delivery,
        retry_interval: time::Duration,
    ) -> PgQueueResult<bool> {
        let base_query = r#"
UPDATE
    scan_queue
SET
    status = 'available'::delivery_status,
    last_attempt_finished_at = NOW(),
    scheduled_at = NOW() + $4,
    leased_until = NULL
WHERE
    queue = $1
    AND id = $2
    AND attempt = $3
    AND status = 'leased'
        "#;

        let result = sqlx::query(base_query)
            .bind(&self.name)
            .bind(delivery.id)
            .bind(delivery.attempt)
            .bind(retry_interval)
            .execute(&self.pool)
            .await
            .map_err(|error| DatabaseError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(result.rows_affected() == 1)
    }

    /// Publish a raw message body into this queue.
    pub async fn enqueue(&self, data: &[u8]) -> PgQueueResult<i64> {
        let base_query = r#"
INSERT INTO scan_queue
    (queue, data, attempt, created_at, scheduled_at, status)
VALUES
    ($1, $2, 0, NOW(), NOW(), 'available'::delivery_status)
RETURNING
    id
        "#;

        sqlx::query_scalar(base_query)
            .bind(&self.name)
            .bind(data)
            .fetch_one(&self.pool)
            .await
            .map_err(|error| DatabaseError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })
    }
}
