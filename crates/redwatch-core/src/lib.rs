//! Core domain types shared by the harvest pipeline.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "redwatch-core";

/// One harvested notice as it travels through the queue.
///
/// This is the wire contract between producer and consumer: a UTF-8 JSON
/// object where every field except `name` may be absent or null. Decoding
/// accepts the legacy `scraped_at` key for the collection timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawNotice {
    pub name: String,
    #[serde(default)]
    pub age: Option<String>,
    #[serde(default)]
    pub nationality: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(alias = "scraped_at", with = "flexible_timestamp")]
    pub collected_at: DateTime<Utc>,
}

impl RawNotice {
    /// Whether this notice carries the natural identity key required for
    /// persistence. Nameless notices are filtered by the producer and
    /// rejected without retry by the consumer.
    pub fn has_usable_name(&self) -> bool {
        !self.name.trim().is_empty()
    }
}

/// A persisted notice row. `name` is the idempotency key: exactly one row
/// exists per distinct name, `created_at` never changes after the first
/// write, and `updated_at` moves forward on every write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoticeRow {
    pub id: i64,
    pub name: String,
    pub age: Option<String>,
    pub nationality: Option<String>,
    pub image_url: Option<String>,
    pub collected_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NoticeRow {
    /// True once a redelivery or a later harvest has overwritten the row.
    pub fn was_updated(&self) -> bool {
        self.updated_at > self.created_at
    }
}

/// Parse an ISO-8601 timestamp, tolerating the offset-less form the
/// original upstream emitted (`2024-01-01T00:00:00`, taken as UTC).
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| raw.parse::<NaiveDateTime>().map(|naive| naive.and_utc()))
}

/// Serde adapter serializing timestamps as RFC 3339 and deserializing via
/// [`parse_timestamp`].
pub mod flexible_timestamp {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&ts.to_rfc3339())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        super::parse_timestamp(&raw).map_err(serde::de::Error::custom)
    }
}
