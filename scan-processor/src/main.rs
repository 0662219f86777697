//! Consume scan messages from a `PgQueue` and keep the latest scan of every service in PostgreSQL.
use std::future::ready;
use std::sync::Arc;

use axum::{routing::get, Router};
use envconfig::Envconfig;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use scan_common::dead_letter::{
    DeadLetterPublisher, KafkaDeadLetterPublisher, NoopDeadLetterPublisher,
};
use scan_common::health::HealthRegistry;
use scan_common::kafka_producer::create_kafka_producer;
use scan_common::metrics::{serve, setup_metrics_routes};
use scan_common::normalize::Normalizer;
use scan_common::pgqueue::PgQueue;
use scan_common::repository::{connect, PgScanRepository};
use scan_processor::config::Config;
use scan_processor::error::ProcessorError;
use scan_processor::handler::ScanHandler;
use scan_processor::worker::{ScanWorker, WorkerSettings};

const APP_NAME: &str = "scan-processor";

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

pub async fn index() -> &'static str {
    "scan processor"
}

/// Resolves on SIGTERM or SIGINT.
async fn shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let signals = signal(SignalKind::terminate())
        .and_then(|term| signal(SignalKind::interrupt()).map(|interrupt| (term, interrupt)));

    match signals {
        Ok((mut term, mut interrupt)) => {
            tokio::select! {
                _ = term.recv() => {},
                _ = interrupt.recv() => {},
            };
        }
        Err(error) => {
            // Without handlers the process can only be killed, so keep running.
            error!(%error, "failed to register signal handlers");
            std::future::pending::<()>().await;
        }
    }

    info!("shutting down gracefully...");
}

#[tokio::main]
async fn main() -> Result<(), ProcessorError> {
    setup_tracing();
    info!("starting up...");

    let config = Config::init_from_env()?;
    let liveness = HealthRegistry::new("liveness");

    let pool = connect(&config.database_url, config.max_pg_connections, APP_NAME).await?;
    sqlx::migrate!("../migrations").run(&pool).await?;

    // The queue table may live in its own database.
    let queue_url = config.queue_database_url();
    let queue_pool = if queue_url != config.database_url {
        let queue_pool = connect(queue_url, config.max_pg_connections, APP_NAME).await?;
        sqlx::migrate!("../migrations").run(&queue_pool).await?;
        queue_pool
    } else {
        pool.clone()
    };
    let queue = PgQueue::new_from_pool(config.queue_name.as_str(), queue_pool.clone()).await;

    let dead_letter: Arc<dyn DeadLetterPublisher> = match config.dead_letter_topic() {
        Some(topic) => {
            let producer_liveness =
                liveness.register("dead_letter_producer", time::Duration::seconds(30));
            let producer = create_kafka_producer(&config.kafka, producer_liveness).await?;
            info!(topic, "dead lettering to kafka");
            Arc::new(
                KafkaDeadLetterPublisher::new(producer, topic)
                    .with_timeout(config.dead_letter_timeout.0),
            )
        }
        None => {
            info!("no dead letter topic configured, rejected scans will be dropped");
            Arc::new(NoopDeadLetterPublisher)
        }
    };

    let handler = ScanHandler::new(
        Arc::new(PgScanRepository::new(pool.clone())),
        dead_letter,
        Normalizer::default(),
        config.persist_timeout.0,
    );

    let worker_liveness = liveness.register("worker", time::Duration::seconds(30));
    let worker = ScanWorker::new(
        &config.worker_name,
        queue,
        Arc::new(handler),
        config.retry_policy.policy(),
        WorkerSettings {
            poll_interval: config.poll_interval.0,
            dequeue_batch_size: config.dequeue_batch_size,
            lease_duration: config.lease_duration.0,
            worker_count: config.worker_count(),
            max_outstanding: config.max_outstanding(),
            shutdown_timeout: config.shutdown_timeout.0,
        },
        worker_liveness,
    );

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())));
    let router = setup_metrics_routes(router)?;
    let bind = config.bind();
    tokio::task::spawn(async move {
        if let Err(error) = serve(router, &bind).await {
            error!(%error, "failed to serve health and metrics");
        }
    });

    let result = worker.run(shutdown()).await;
    queue_pool.close().await;
    pool.close().await;
    info!("stopped");

    result?;
    Ok(())
}
