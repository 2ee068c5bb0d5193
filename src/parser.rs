//! Decoders for raw feed payloads.

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, Utc};
use prost::Message;
use serde::Deserialize;

use crate::gtfs_rt::FeedMessage;

/// Decodes a protobuf-encoded GTFS-RT [`FeedMessage`] from raw bytes.
///
/// # Errors
///
/// Returns an error if the bytes are not valid protobuf for a `FeedMessage`.
pub fn parse_feed(bytes: &[u8]) -> Result<FeedMessage> {
    Ok(FeedMessage::decode(bytes)?)
}

/// A JSON ETA document: one entry per (stop, trip) prediction.
///
/// Entries are kept as raw JSON so one malformed entry cannot reject the
/// whole document.
#[derive(Debug, Deserialize)]
pub struct EtaDocument {
    #[serde(default)]
    pub generated_timestamp: Option<String>,
    #[serde(default)]
    pub data: Vec<serde_json::Value>,
}

/// Decodes a JSON ETA document.
pub fn parse_eta_json(bytes: &[u8]) -> Result<EtaDocument> {
    serde_json::from_slice(bytes).context("ETA payload is not a valid JSON document")
}

/// Parses an ETA timestamp.
///
/// Accepts RFC 3339 (with or without fractional seconds, `Z` or `+08:00`)
/// and offsets written without a colon (`+0800`).
pub fn parse_datetime(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f%z", "%Y-%m-%dT%H:%M:%S%z"]
        .iter()
        .find_map(|fmt| DateTime::<FixedOffset>::parse_from_str(value, fmt).ok())
        .map(|parsed| parsed.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_empty_bytes_returns_default_feed() {
        let feed = parse_feed(&[]).unwrap();
        assert_eq!(feed.header.gtfs_realtime_version, "");
        assert!(feed.entity.is_empty());
    }

    #[test]
    fn test_parse_invalid_bytes() {
        let invalid_bytes = vec![0xFF, 0xFE, 0x00, 0x01];
        assert!(parse_feed(&invalid_bytes).is_err());
    }

    #[test]
    fn test_parse_valid_minimal_feed() {
        use crate::gtfs_rt::FeedHeader;

        let feed = FeedMessage {
            header: FeedHeader {
                gtfs_realtime_version: "2.0".to_string(),
                timestamp: Some(1234567890),
                incrementality: None,
                feed_version: None,
            },
            entity: vec![],
        };
        let parsed = parse_feed(&feed.encode_to_vec()).unwrap();

        assert_eq!(parsed.header.gtfs_realtime_version, "2.0");
        assert_eq!(parsed.header.timestamp, Some(1234567890));
    }

    #[test]
    fn test_parse_datetime_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 5, 1, 2, 3, 4).unwrap();
        assert_eq!(parse_datetime("2024-05-01T10:03:04+08:00"), Some(expected));
        assert_eq!(parse_datetime("2024-05-01T10:03:04+0800"), Some(expected));
        assert_eq!(parse_datetime("2024-05-01T02:03:04Z"), Some(expected));
        assert_eq!(
            parse_datetime("2024-05-01T02:03:04.500Z"),
            Some(expected + chrono::Duration::milliseconds(500))
        );
        assert_eq!(parse_datetime("not a time"), None);
        assert_eq!(parse_datetime(""), None);
    }

    #[test]
    fn test_parse_eta_json_tolerates_missing_fields() {
        let doc = parse_eta_json(br#"{"data": [{"stop": "A"}, 5]}"#).unwrap();
        assert!(doc.generated_timestamp.is_none());
        assert_eq!(doc.data.len(), 2);

        assert!(parse_eta_json(b"[").is_err());
    }
}
