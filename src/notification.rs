use chrono::{DateTime, Utc};
use percent_encoding::percent_decode_str;
use serde::Deserialize;

use crate::error::GateError;

/// One object-created event, flattened from the storage event envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub bucket: String,
    pub key: String,
    pub etag: String,
    pub size: u64,
    pub event_time: DateTime<Utc>,
    pub submitter: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EventEnvelope {
    #[serde(rename = "Records")]
    records: Vec<EventRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventRecord {
    event_time: DateTime<Utc>,
    #[serde(default)]
    user_identity: Option<UserIdentity>,
    s3: S3Entity,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserIdentity {
    principal_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct S3Entity {
    bucket: BucketEntity,
    object: ObjectEntity,
}

#[derive(Debug, Deserialize)]
struct BucketEntity {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ObjectEntity {
    key: String,
    #[serde(default)]
    size: u64,
    #[serde(rename = "eTag", default)]
    etag: String,
}

impl Notification {
    /// Parses an S3-style event document. Every record becomes one
    /// notification; object keys arrive URL-encoded.
    pub fn from_event_json(json: &str) -> Result<Vec<Notification>, GateError> {
        let envelope: EventEnvelope =
            serde_json::from_str(json).map_err(|err| GateError::Notification(err.to_string()))?;
        if envelope.records.is_empty() {
            return Err(GateError::Notification("event has no records".to_string()));
        }
        envelope
            .records
            .into_iter()
            .map(|record| {
                let key = decode_key(&record.s3.object.key)?;
                if record.s3.object.etag.is_empty() {
                    return Err(GateError::Notification(format!("{key} has no etag")));
                }
                Ok(Notification {
                    bucket: record.s3.bucket.name,
                    key,
                    etag: record.s3.object.etag.trim_matches('"').to_string(),
                    size: record.s3.object.size,
                    event_time: record.event_time,
                    submitter: record.user_identity.and_then(|identity| identity.principal_id),
                })
            })
            .collect()
    }
}

/// Event keys are form-encoded: `+` is a space and `%XX` an escaped byte.
fn decode_key(raw: &str) -> Result<String, GateError> {
    percent_decode_str(&raw.replace('+', " "))
        .decode_utf8()
        .map(|key| key.into_owned())
        .map_err(|_| GateError::Notification(format!("key {raw} is not UTF-8")))
}
