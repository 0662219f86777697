//! # Normalizer
//!
//! Version-aware extraction of the response string from a `ScanEnvelope`.
//!
//! Every supported `data_version` maps to a `ResponseRule`. Supporting a new payload version means
//! registering a new rule; the dispatch in `Normalizer::response` never changes.
use std::collections::HashMap;
use std::fmt;

use base64::Engine;
use chrono::DateTime;
use serde::Deserialize;
use serde_json::value::RawValue;
use thiserror::Error;

use crate::envelope::ScanEnvelope;
use crate::record::NormalizedRecord;

pub const V1: i64 = 1;
pub const V2: i64 = 2;

/// Bounds of a PostgreSQL `timestamptz` in Unix seconds: 4714-11-24 BC up to the end of 294276 AD.
pub const MIN_STORABLE_TIMESTAMP: i64 = -210_866_803_200;
pub const MAX_STORABLE_TIMESTAMP: i64 = 9_224_318_015_999;

/// Enumeration of errors a single rule can produce when its blob does not have the expected shape.
#[derive(Error, Debug)]
pub enum RuleError {
    #[error("decode data: {0}")]
    Json(#[from] serde_json::Error),
    #[error("decode base64 response: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("response is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("{0} contains a NUL character")]
    NulCharacter(&'static str),
}

/// Enumeration of errors returned by the `Normalizer`. All of them are permanent.
#[derive(Error, Debug)]
pub enum NormalizeError {
    #[error("unsupported data_version {0}")]
    UnsupportedVersion(i64),
    #[error("malformed payload for version {version}: {source}")]
    MalformedPayload {
        version: i64,
        #[source]
        source: RuleError,
    },
    #[error("timestamp {0} is out of range")]
    InvalidTimestamp(i64),
}

/// A pure function from a version-specific blob to a response string.
pub trait ResponseRule: Send + Sync {
    fn response(&self, data: &RawValue) -> Result<String, RuleError>;
}

impl<F> ResponseRule for F
where
    F: Fn(&RawValue) -> Result<String, RuleError> + Send + Sync,
{
    fn response(&self, data: &RawValue) -> Result<String, RuleError> {
        self(data)
    }
}

#[derive(Deserialize)]
struct V1Data {
    response_bytes_utf8: String,
}

#[derive(Deserialize)]
struct V2Data {
    response_str: String,
}

/// Version 1 carries the response as base64 encoded bytes.
pub fn v1_response(data: &RawValue) -> Result<String, RuleError> {
    let payload: V1Data = serde_json::from_str(data.get())?;
    let bytes = base64::engine::general_purpose::STANDARD.decode(payload.response_bytes_utf8)?;

    Ok(String::from_utf8(bytes)?)
}

/// Version 2 carries the response as a plain string.
pub fn v2_response(data: &RawValue) -> Result<String, RuleError> {
    let payload: V2Data = serde_json::from_str(data.get())?;

    Ok(payload.response_str)
}

/// Registry of response rules keyed by `data_version`.
pub struct Normalizer {
    rules: HashMap<i64, Box<dyn ResponseRule>>,
}

impl Normalizer {
    /// An empty registry. Every version is unsupported until a rule is registered.
    pub fn new() -> Self {
        Self {
            rules: HashMap::new(),
        }
    }

    /// Register `rule` for `version`, replacing any rule already registered for it.
    pub fn register<R: ResponseRule + 'static>(&mut self, version: i64, rule: R) {
        self.rules.insert(version, Box::new(rule));
    }

    pub fn with_rule<R: ResponseRule + 'static>(mut self, version: i64, rule: R) -> Self {
        self.register(version, rule);
        self
    }

    pub fn supports(&self, version: i64) -> bool {
        self.rules.contains_key(&version)
    }

    /// Extract the response string of `envelope` using the rule registered for its version.
    pub fn response(&self, envelope: &ScanEnvelope) -> Result<String, NormalizeError> {
        let rule = self
            .rules
            .get(&envelope.data_version)
            .ok_or(NormalizeError::UnsupportedVersion(envelope.data_version))?;

        rule.response(&envelope.data)
            .map_err(|source| NormalizeError::MalformedPayload {
                version: envelope.data_version,
                source,
            })
    }

    /// Produce the canonical record for `envelope`.
    ///
    /// The record must be storable as is: text fields cannot hold NUL and the timestamp has to fit
    /// a `timestamptz`. Anything else would fail in storage on every redelivery.
    pub fn normalize(&self, envelope: &ScanEnvelope) -> Result<NormalizedRecord, NormalizeError> {
        let response = self.response(envelope)?;

        for (field, value) in [
            ("ip", envelope.ip.as_str()),
            ("service", envelope.service.as_str()),
            ("response", response.as_str()),
        ] {
            if value.contains('\0') {
                return Err(NormalizeError::MalformedPayload {
                    version: envelope.data_version,
                    source: RuleError::NulCharacter(field),
                });
            }
        }

        if !(MIN_STORABLE_TIMESTAMP..=MAX_STORABLE_TIMESTAMP).contains(&envelope.timestamp) {
            return Err(NormalizeError::InvalidTimestamp(envelope.timestamp));
        }
        let timestamp = DateTime::from_timestamp(envelope.timestamp, 0)
            .ok_or(NormalizeError::InvalidTimestamp(envelope.timestamp))?;

        Ok(NormalizedRecord {
            ip: envelope.ip.clone(),
            port: envelope.port,
            service: envelope.service.clone(),
            timestamp,
            response,
        })
    }
}

impl Default for Normalizer {
    /// A registry with all payload versions currently emitted by scanners.
    fn default() -> Self {
        Normalizer::new()
            .with_rule(V1, v1_response)
            .with_rule(V2, v2_response)
    }
}

impl fmt::Debug for Normalizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut versions: Vec<&i64> = self.rules.keys().collect();
        versions.sort();
        f.debug_struct("Normalizer")
            .field("versions", &versions)
            .finish()
    }
}
