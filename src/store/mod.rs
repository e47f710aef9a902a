pub mod concurrency;
pub mod session;

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::Arc;

use base64::{engine::general_purpose, Engine as _};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Config;

/// A logical channel merged from one or more upstream playlists.
///
/// `urls` maps a source index (one upstream provider) to its sub-indexed
/// alternative URLs for this channel. Both maps are ordered so iteration is
/// deterministic.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamInfo {
    pub title: String,
    #[serde(default)]
    pub tvg_id: String,
    #[serde(default)]
    pub tvg_chno: String,
    #[serde(default)]
    pub tvg_type: String,
    #[serde(default)]
    pub logo_url: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub urls: BTreeMap<String, BTreeMap<String, String>>,
}

impl StreamInfo {
    /// True when at least one (source, sub) pair carries a URL.
    pub fn has_urls(&self) -> bool {
        self.urls.values().any(|inner| !inner.is_empty())
    }
}

#[derive(Error, Debug)]
pub enum SlugError {
    #[error("base64 decode failed: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("decompression failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode a channel into a URL-safe slug: JSON, zlib-compressed, base64
/// without padding. The slug is self-contained so no catalog lookup is
/// needed to serve it.
pub fn encode_slug(info: &StreamInfo) -> Result<String, SlugError> {
    let json = serde_json::to_vec(info)?;
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(&json)?;
    let compressed = encoder.finish()?;
    Ok(general_purpose::URL_SAFE_NO_PAD.encode(compressed))
}

pub fn decode_slug(slug: &str) -> Result<StreamInfo, SlugError> {
    let compressed = general_purpose::URL_SAFE_NO_PAD.decode(slug)?;
    let mut decoder = ZlibDecoder::new(compressed.as_slice());
    let mut json = Vec::new();
    decoder.read_to_end(&mut json)?;
    Ok(serde_json::from_slice(&json)?)
}

/// Resolves the channel id embedded in a stream URL.
pub trait SlugParser: Send + Sync {
    fn get_stream_by_slug(&self, slug: &str) -> Result<StreamInfo, SlugError>;
}

/// The stock parser: slugs are the codec output of [`encode_slug`].
pub struct DefaultSlugParser;

impl SlugParser for DefaultSlugParser {
    fn get_stream_by_slug(&self, slug: &str) -> Result<StreamInfo, SlugError> {
        decode_slug(slug)
    }
}

/// Supplies the configured source indexes in preferred order.
pub trait IndexProvider: Send + Sync {
    fn source_indexes(&self) -> Vec<String>;
}

/// Index provider backed by the concurrency cap table.
pub struct ConfigIndexProvider {
    config: Arc<Config>,
}

impl ConfigIndexProvider {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }
}

impl IndexProvider for ConfigIndexProvider {
    fn source_indexes(&self) -> Vec<String> {
        self.config.source_indexes()
    }
}

/// Source indexes are usually small integers; compare them numerically when
/// both sides parse, lexicographically otherwise.
pub fn compare_indexes(a: &String, b: &String) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_stream() -> StreamInfo {
        let mut urls = BTreeMap::new();
        let mut inner = BTreeMap::new();
        inner.insert("a".to_string(), "http://upstream.example/live/1.ts".to_string());
        urls.insert("0".to_string(), inner);
        StreamInfo {
            title: "News 24".to_string(),
            tvg_id: "news24".to_string(),
            group: "News".to_string(),
            urls,
            ..Default::default()
        }
    }

    #[test]
    fn slug_round_trip() {
        let stream = sample_stream();
        let slug = encode_slug(&stream).unwrap();
        assert!(!slug.contains('+'));
        assert!(!slug.contains('/'));
        assert!(!slug.contains('='));
        let decoded = decode_slug(&slug).unwrap();
        assert_eq!(decoded, stream);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_slug("not-a-slug!!").is_err());
        assert!(decode_slug("aGVsbG8").is_err());
    }

    #[test]
    fn has_urls_requires_a_populated_source() {
        let mut stream = sample_stream();
        assert!(stream.has_urls());
        stream.urls.get_mut("0").unwrap().clear();
        assert!(!stream.has_urls());
        stream.urls.clear();
        assert!(!stream.has_urls());
    }

    #[test]
    fn numeric_index_ordering() {
        let mut indexes = vec!["10".to_string(), "2".to_string(), "1".to_string()];
        indexes.sort_by(compare_indexes);
        assert_eq!(indexes, vec!["1", "2", "10"]);
    }
}
