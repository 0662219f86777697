pub mod dead_letter;
pub mod envelope;
pub mod health;
pub mod kafka_producer;
pub mod metrics;
pub mod metrics_consts;
pub mod normalize;
pub mod pgqueue;
pub mod record;
pub mod repository;
pub mod retry;
