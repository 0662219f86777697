use std::future::Future;
use std::sync::Arc;
use std::time;

use metrics::{counter, gauge, histogram};
use scan_common::health::HealthHandle;
use scan_common::metrics_consts::{
    DEQUEUE_ERRORS, HANDLE_DURATION, MESSAGES_ACKED, MESSAGES_NACKED, MESSAGES_RECEIVED,
    SETTLE_ERRORS, STALE_LEASES, WORKER_SATURATION,
};
use scan_common::pgqueue::{Delivery, PgQueue};
use scan_common::retry::RetryPolicy;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::error::WorkerError;
use crate::handler::ScanHandler;

/// Flow control knobs of a `ScanWorker`.
#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    /// The interval for polling the queue.
    pub poll_interval: time::Duration,
    /// Upper bound of messages leased by a single poll.
    pub dequeue_batch_size: u32,
    /// How long a message stays ours before the queue hands it out again.
    pub lease_duration: time::Duration,
    /// Number of messages processed at the same time.
    pub worker_count: usize,
    /// Number of messages leased at the same time, being processed or waiting for a worker.
    pub max_outstanding: u32,
    /// How long in-flight messages are waited for after a shutdown was requested.
    pub shutdown_timeout: time::Duration,
}

/// A worker to poll `PgQueue` and spawn tasks to process scans when messages become available.
pub struct ScanWorker {
    /// An identifier for this worker. Used to mark messages we have leased.
    name: String,
    queue: PgQueue,
    handler: Arc<ScanHandler>,
    /// Decides when a nacked message becomes available again.
    retry_policy: RetryPolicy,
    settings: WorkerSettings,
    /// The liveness check handle, to call on a schedule to report healthy
    liveness: HealthHandle,
}

impl ScanWorker {
    pub fn new(
        name: &str,
        queue: PgQueue,
        handler: Arc<ScanHandler>,
        retry_policy: RetryPolicy,
        settings: WorkerSettings,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            name: name.to_owned(),
            queue,
            handler,
            retry_policy,
            settings,
            liveness,
        }
    }

    /// Poll the queue until `shutdown` resolves, then wait for in-flight messages to settle.
    ///
    /// Returns an error if the queue cannot be polled. Messages already in flight at that point
    /// are left to lease expiry.
    pub async fn run<F>(self, shutdown: F) -> Result<(), WorkerError>
    where
        F: Future<Output = ()>,
    {
        let max_outstanding = self.settings.max_outstanding;
        let outstanding = Arc::new(Semaphore::new(max_outstanding as usize));
        let workers = Arc::new(Semaphore::new(self.settings.worker_count));

        let mut interval = tokio::time::interval(self.settings.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(
            worker = self.name,
            queue = self.queue.name(),
            worker_count = self.settings.worker_count,
            max_outstanding,
            "started polling for scans"
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {}
            }
            self.liveness.report_healthy();

            let available = outstanding.available_permits();
            let in_flight = (max_outstanding as usize).saturating_sub(available);
            gauge!(WORKER_SATURATION).set(100.0 * in_flight as f64 / f64::from(max_outstanding));

            // Only lease what we can hold: the rest stays in the queue for other consumers.
            let limit = self
                .settings
                .dequeue_batch_size
                .min(u32::try_from(available).unwrap_or(u32::MAX));
            if limit == 0 {
                continue;
            }

            let deliveries = match self
                .queue
                .dequeue(&self.name, limit, self.settings.lease_duration)
                .await
            {
                Ok(deliveries) => deliveries,
                Err(error) => {
                    counter!(DEQUEUE_ERRORS).increment(1);
                    error!(%error, "failed to dequeue scans");
                    return Err(error.into());
                }
            };

            for delivery in deliveries {
                // Never blocks: we leased no more than the permits available, and only this loop
                // acquires them.
                let Ok(permit) = outstanding.clone().acquire_owned().await else {
                    break;
                };
                let workers = workers.clone();
                let queue = self.queue.clone();
                let handler = self.handler.clone();
                let retry_policy = self.retry_policy;

                tokio::spawn(async move {
                    let _permit = permit;
                    let Ok(_worker) = workers.acquire().await else {
                        return;
                    };
                    process_delivery(&queue, &handler, &retry_policy, delivery).await;
                });
            }
        }

        info!("shutdown requested, waiting for in-flight scans");
        match tokio::time::timeout(
            self.settings.shutdown_timeout,
            outstanding.acquire_many(max_outstanding),
        )
        .await
        {
            Ok(_) => info!("all in-flight scans settled"),
            Err(_) => warn!(
                in_flight = (max_outstanding as usize).saturating_sub(outstanding.available_permits()),
                "shutdown timeout elapsed, in-flight scans will be redelivered"
            ),
        }

        Ok(())
    }
}

/// Handle a single delivery and settle it with the queue.
async fn process_delivery(
    queue: &PgQueue,
    handler: &ScanHandler,
    retry_policy: &RetryPolicy,
    delivery: Delivery,
) {
    counter!(MESSAGES_RECEIVED).increment(1);
    let start = tokio::time::Instant::now();

    let outcome = handler.handle(&delivery).await;
    histogram!(HANDLE_DURATION).record(start.elapsed().as_secs_f64());

    let settled = if outcome.should_ack() {
        counter!(MESSAGES_ACKED).increment(1);
        queue.ack(&delivery).await
    } else {
        counter!(MESSAGES_NACKED).increment(1);
        let attempt = u32::try_from(delivery.attempt).unwrap_or(1);
        queue
            .nack(&delivery, retry_policy.retry_interval(attempt))
            .await
    };

    match settled {
        Ok(true) => {}
        Ok(false) => {
            counter!(STALE_LEASES).increment(1);
            warn!(
                message_id = delivery.message_id(),
                attempt = delivery.attempt,
                "lease expired before the scan was settled"
            );
        }
        Err(error) => {
            // The lease will expire and the scan will be delivered again.
            counter!(SETTLE_ERRORS).increment(1);
            error!(
                message_id = delivery.message_id(),
                attempt = delivery.attempt,
                %error,
                "failed to settle scan"
            );
        }
    }
}
