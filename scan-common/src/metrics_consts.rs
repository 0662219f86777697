pub const MESSAGES_RECEIVED: &str = "scan_processor_messages_received";
pub const MESSAGES_ACKED: &str = "scan_processor_messages_acked";
pub const MESSAGES_NACKED: &str = "scan_processor_messages_nacked";
pub const MESSAGES_DEAD_LETTERED: &str = "scan_processor_messages_dead_lettered";
pub const MESSAGES_DROPPED: &str = "scan_processor_messages_dropped";
pub const STALE_LEASES: &str = "scan_processor_stale_leases";
pub const SETTLE_ERRORS: &str = "scan_processor_settle_errors";
pub const HANDLE_DURATION: &str = "scan_processor_handle_duration_seconds";
pub const RECORDS_PERSISTED: &str = "scan_processor_records_persisted";
pub const STORAGE_ERRORS: &str = "scan_processor_storage_errors";
pub const STORAGE_TIMEOUTS: &str = "scan_processor_storage_timeouts";
pub const DEAD_LETTER_PUBLISH_ERRORS: &str = "scan_processor_dead_letter_publish_errors";
pub const WORKER_SATURATION: &str = "scan_processor_worker_saturation_percent";
pub const DEQUEUE_ERRORS: &str = "scan_processor_dequeue_errors";
pub const KAFKA_PRODUCER_QUEUE_DEPTH: &str = "scan_processor_kafka_producer_queue_depth";
pub const KAFKA_PRODUCER_QUEUE_BYTES: &str = "scan_processor_kafka_producer_queue_bytes";
