//! Response envelope persisted as `meta.json`

use std::collections::BTreeMap;

use hyper::header::{HeaderName, HeaderValue};
use hyper::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{Result, TapedeckError};

/// Status code and headers of a recorded response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    /// HTTP status code
    pub status: u16,
    /// Response headers, repeated names joined with `", "`
    pub headers: BTreeMap<String, String>,
}

impl Meta {
    /// Capture the envelope of a response
    ///
    /// Header values that are not valid UTF-8 cannot be stored in JSON
    /// without loss, so they are left out of the envelope.
    #[must_use]
    pub fn from_response(status: StatusCode, headers: &HeaderMap) -> Self {
        let mut flattened: BTreeMap<String, String> = BTreeMap::new();
        for (name, value) in headers {
            let Ok(value) = std::str::from_utf8(value.as_bytes()) else {
                warn!("Not recording header '{name}': value is not valid UTF-8");
                continue;
            };
            flattened
                .entry(name.as_str().to_string())
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(value);
                })
                .or_insert_with(|| value.to_string());
        }
        Self {
            status: status.as_u16(),
            headers: flattened,
        }
    }

    /// Recorded status code
    ///
    /// # Errors
    ///
    /// Returns error if the stored status is not a valid HTTP status
    pub fn status_code(&self) -> Result<StatusCode> {
        StatusCode::from_u16(self.status).map_err(|e| {
            TapedeckError::Other(format!("Invalid recorded status {}: {e}", self.status))
        })
    }

    /// Recorded headers as a header map
    ///
    /// # Errors
    ///
    /// Returns error if a stored name or value is not a valid header
    pub fn header_map(&self) -> Result<HeaderMap> {
        let mut map = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                TapedeckError::Other(format!("Invalid recorded header '{name}': {e}"))
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                TapedeckError::Other(format!("Invalid recorded value for '{name}': {e}"))
            })?;
            map.append(name, value);
        }
        Ok(map)
    }

    /// Encode as indented JSON
    ///
    /// # Errors
    ///
    /// Returns error if encoding fails
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Decode from JSON
    ///
    /// # Errors
    ///
    /// Returns error if the bytes are not a valid envelope
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| TapedeckError::Other(format!("Malformed meta.json: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_from_response_joins_repeated_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "application/json".parse().unwrap());
        headers.append("vary", "accept".parse().unwrap());
        headers.append("vary", "origin".parse().unwrap());

        let meta = Meta::from_response(StatusCode::CREATED, &headers);
        assert_eq!(meta.status, 201);
        assert_eq!(meta.headers["vary"], "accept, origin");
        assert_eq!(meta.headers["content-type"], "application/json");
    }

    #[test]
    fn test_meta_skips_non_utf8_values() {
        let mut headers = HeaderMap::new();
        headers.insert("x-joke", HeaderValue::from_bytes("caf\u{e9}".as_bytes()).unwrap());
        headers.insert("x-legacy", HeaderValue::from_bytes(b"caf\xe9").unwrap());

        let meta = Meta::from_response(StatusCode::OK, &headers);
        assert_eq!(meta.headers["x-joke"], "caf\u{e9}");
        assert!(!meta.headers.contains_key("x-legacy"));

        let replayed = meta.header_map().unwrap();
        assert_eq!(replayed["x-joke"].as_bytes(), "caf\u{e9}".as_bytes());
    }

    #[test]
    fn test_meta_json_shape() {
        let json = br#"{"status": 200, "headers": {"content-type": "text/plain"}}"#;
        let meta = Meta::from_json(json).unwrap();

        assert_eq!(meta.status_code().unwrap(), StatusCode::OK);
        let map = meta.header_map().unwrap();
        assert_eq!(map.get("content-type").unwrap(), "text/plain");

        let encoded: serde_json::Value = serde_json::from_slice(&meta.to_json().unwrap()).unwrap();
        assert_eq!(encoded["status"], 200);
        assert_eq!(encoded["headers"]["content-type"], "text/plain");
    }

    #[test]
    fn test_meta_rejects_malformed() {
        assert!(Meta::from_json(b"{\"status\": \"ok\"}").is_err());

        let mut meta = Meta::from_json(br#"{"status": 200, "headers": {}}"#).unwrap();
        meta.status = 1000;
        assert!(meta.status_code().is_err());
    }
}
