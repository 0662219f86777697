use chrono::{DateTime, Utc};

/// The canonical, persisted form of a scan.
///
/// Records are identified by `(ip, port, service)`. A newer record supersedes an older one as a
/// whole; records are never merged field by field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedRecord {
    pub ip: String,
    pub port: u16,
    pub service: String,
    pub timestamp: DateTime<Utc>,
    pub response: String,
}

