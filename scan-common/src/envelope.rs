//! Decoding of raw scan messages into a `ScanEnvelope`.
use serde::Deserialize;
use serde_json::value::RawValue;
use thiserror::Error;

/// Enumeration of errors that can occur while decoding a raw message body.
/// All of them are permanent: the same bytes will always fail the same way.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("unmarshal scan: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("missing data field")]
    MissingData,
}

/// A scan event as it was received from the queue.
///
/// The version-specific `data` blob is kept as raw JSON so the normalizer can pick a decoding
/// rule based on `data_version`. The decoder itself never looks at the version.
#[derive(Debug)]
pub struct ScanEnvelope {
    pub ip: String,
    pub port: u16,
    pub service: String,
    /// Unix seconds.
    pub timestamp: i64,
    pub data_version: i64,
    pub data: Box<RawValue>,
}

#[derive(Deserialize)]
struct WireEnvelope {
    ip: String,
    port: u16,
    service: String,
    timestamp: i64,
    data_version: i64,
    // `null` and a missing field both land here as `None`.
    data: Option<Box<RawValue>>,
}

impl ScanEnvelope {
    /// Parse a raw message body.
    pub fn decode(raw: &[u8]) -> Result<ScanEnvelope, DecodeError> {
        let wire: WireEnvelope = serde_json::from_slice(raw)?;
        let data = wire.data.ok_or(DecodeError::MissingData)?;

        Ok(ScanEnvelope {
            ip: wire.ip,
            port: wire.port,
            service: wire.service,
            timestamp: wire.timestamp,
            data_version: wire.data_version,
            data,
        })
    }

    /// Human readable identity, used in log lines.
    pub fn identity(&self) -> String {
        format!("{}:{}/{}", self.ip, self.port, self.service)
    }
}
