//! Stored content variants.
//!
//! Each captured variant of an item lives under its digest inside a map
//! attribute, so re-captures of identical markup collapse naturally and
//! different captures accumulate. Payloads are xz-compressed before base64;
//! the digest is always taken over the uncompressed bytes.

use std::io::Read;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use super::{StoreError, StoreResult};
use crate::surface::{digest_bytes, RawMarkup};

/// Content stored as base64 of the raw bytes, without compression.
pub const CONTENT_ENCODING_RAW: &str = "raw";

/// Content stored as base64 of an xz stream.
pub const CONTENT_ENCODING_XZ: &str = "xz";

const XZ_PRESET: u32 = 6;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentEntry {
    /// Base64 payload.
    pub content: String,
    pub encoding: String,
    /// RFC 3339 capture time.
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub contains_json: bool,
}

impl ContentEntry {
    /// An xz-compressed entry.
    pub fn new(bytes: &[u8], captured_at: DateTime<Utc>) -> StoreResult<Self> {
        let mut compressed = Vec::new();
        xz2::read::XzEncoder::new(bytes, XZ_PRESET).read_to_end(&mut compressed)?;
        Ok(Self {
            content: STANDARD.encode(compressed),
            encoding: CONTENT_ENCODING_XZ.to_string(),
            timestamp: captured_at.to_rfc3339(),
            contains_json: false,
        })
    }

    /// An uncompressed entry.
    pub fn raw(bytes: &[u8], captured_at: DateTime<Utc>) -> Self {
        Self {
            content: STANDARD.encode(bytes),
            encoding: CONTENT_ENCODING_RAW.to_string(),
            timestamp: captured_at.to_rfc3339(),
            contains_json: false,
        }
    }

    pub fn json(bytes: &[u8], captured_at: DateTime<Utc>) -> StoreResult<Self> {
        Ok(Self {
            contains_json: true,
            ..Self::new(bytes, captured_at)?
        })
    }

    pub fn parsed_timestamp(&self) -> Option<DateTime<FixedOffset>> {
        DateTime::parse_from_rfc3339(&self.timestamp).ok()
    }

    /// Decoded payload, checked against the digest it is stored under.
    pub fn decode(&self, hash: &str) -> StoreResult<Vec<u8>> {
        let payload = STANDARD
            .decode(&self.content)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let bytes = match self.encoding.as_str() {
            CONTENT_ENCODING_RAW => payload,
            CONTENT_ENCODING_XZ => {
                let mut bytes = Vec::new();
                xz2::read::XzDecoder::new(payload.as_slice()).read_to_end(&mut bytes)?;
                bytes
            }
            other => {
                return Err(StoreError::Serialization(format!(
                    "unsupported content encoding '{}'",
                    other
                )))
            }
        };
        if digest_bytes(&bytes) != hash {
            return Err(StoreError::DigestMismatch {
                hash: hash.to_string(),
            });
        }
        Ok(bytes)
    }

    /// Decoded payload as text. Each lone surrogate becomes one U+FFFD.
    pub fn decode_text(&self, hash: &str) -> StoreResult<String> {
        Ok(RawMarkup::from_bytes(self.decode(hash)?).to_text_lossy())
    }

    pub fn to_value(&self) -> StoreResult<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Pick the variant to treat as current from a `{hash -> entry}` map.
///
/// The latest timestamp wins. Unparseable timestamps rank below every valid
/// one. Equal timestamps resolve to the lexicographically smallest hash.
/// Entries that are not content entries at all are skipped.
pub fn select_latest_variant(variants: &Map<String, Value>) -> Option<(&str, ContentEntry)> {
    variants
        .iter()
        .filter_map(|(hash, value)| match ContentEntry::deserialize(value) {
            Ok(entry) => Some((hash.as_str(), entry)),
            Err(e) => {
                warn!("Skipping malformed content entry '{}': {}", hash, e);
                None
            }
        })
        .max_by(|(hash_a, a), (hash_b, b)| {
            a.parsed_timestamp()
                .cmp(&b.parsed_timestamp())
                .then_with(|| hash_b.cmp(hash_a))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn entry(timestamp: &str) -> Value {
        json!({ "content": "", "encoding": "raw", "timestamp": timestamp })
    }

    #[test]
    fn test_latest_timestamp_wins() {
        let mut map = Map::new();
        map.insert("SHA256:b".into(), entry("2024-03-01T10:00:00+00:00"));
        map.insert("SHA256:a".into(), entry("2024-03-01T09:00:00+00:00"));
        map.insert("SHA256:c".into(), entry("2024-03-01T12:00:00+02:00"));
        let (hash, _) = select_latest_variant(&map).unwrap();
        assert_eq!(hash, "SHA256:b");
    }

    #[test]
    fn test_tie_breaks_on_smallest_hash() {
        let mut map = Map::new();
        map.insert("SHA256:ff".into(), entry("2024-03-01T10:00:00+00:00"));
        map.insert("SHA256:0a".into(), entry("2024-03-01T10:00:00+00:00"));
        map.insert("SHA256:77".into(), entry("2024-03-01T10:00:00+00:00"));
        assert_eq!(select_latest_variant(&map).unwrap().0, "SHA256:0a");
    }

    #[test]
    fn test_malformed_timestamps_rank_lowest() {
        let mut map = Map::new();
        map.insert("SHA256:0".into(), entry("yesterday"));
        map.insert("SHA256:1".into(), entry("2020-01-01T00:00:00Z"));
        assert_eq!(select_latest_variant(&map).unwrap().0, "SHA256:1");

        let mut only_bad = Map::new();
        only_bad.insert("SHA256:9".into(), entry("bad"));
        only_bad.insert("SHA256:3".into(), entry("worse"));
        assert_eq!(select_latest_variant(&only_bad).unwrap().0, "SHA256:3");
    }

    #[test]
    fn test_non_entries_are_skipped() {
        let mut map = Map::new();
        map.insert("junk".into(), json!(42));
        assert!(select_latest_variant(&map).is_none());
    }

    #[test]
    fn test_decode_checks_digest() {
        let captured_at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let entry = ContentEntry::new(b"<div></div>", captured_at).unwrap();
        let hash = digest_bytes(b"<div></div>");
        assert_eq!(entry.encoding, CONTENT_ENCODING_XZ);
        assert_eq!(entry.decode(&hash).unwrap(), b"<div></div>");
        assert!(matches!(
            entry.decode("SHA256:00"),
            Err(StoreError::DigestMismatch { .. })
        ));
        assert!(!entry.to_value().unwrap().as_object().unwrap().contains_key("contains_json"));
        assert!(ContentEntry::json(b"[]", captured_at).unwrap().contains_json);
    }

    #[test]
    fn test_xz_keeps_lone_surrogates() {
        let captured_at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let markup = RawMarkup::from_code_points(&[0x3C, 0x62, 0x3E, 0xD83D, 0x3C, 0x2F, 0x62, 0x3E])
            .unwrap();
        let entry = ContentEntry::new(markup.as_bytes(), captured_at).unwrap();
        assert_ne!(STANDARD.decode(&entry.content).unwrap(), markup.as_bytes());

        let decoded = entry.decode(&markup.digest()).unwrap();
        assert_eq!(RawMarkup::from_bytes(decoded), markup);
        assert_eq!(entry.decode_text(&markup.digest()).unwrap(), "<b>\u{FFFD}</b>");
    }

    #[test]
    fn test_raw_entries_still_decode() {
        let captured_at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let entry = ContentEntry::raw(b"<p>old</p>", captured_at);
        assert_eq!(entry.encoding, CONTENT_ENCODING_RAW);
        assert_eq!(entry.decode(&digest_bytes(b"<p>old</p>")).unwrap(), b"<p>old</p>");

        let unknown = ContentEntry {
            encoding: "bz2".to_string(),
            ..entry
        };
        assert!(matches!(
            unknown.decode(&digest_bytes(b"<p>old</p>")),
            Err(StoreError::Serialization(_))
        ));
    }
}
