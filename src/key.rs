//! Key makers: projections from an inbound request to its cache identity

use futures_util::future::BoxFuture;
use hyper::http::request::Parts;
use hyper::{HeaderMap, Method, Uri};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::fingerprint::Key;
use crate::Result;

/// Logical identity of an inbound request, as seen by key makers
#[derive(Debug, Clone)]
pub struct RequestInfo {
    /// HTTP method
    pub method: Method,
    /// Request path as received, percent-encoded
    pub path: String,
    /// Raw query string without the leading `?`
    pub query: Option<String>,
    /// Inbound headers
    pub headers: HeaderMap,
}

impl RequestInfo {
    /// Build from method, URI and headers
    #[must_use]
    pub fn new(method: Method, uri: &Uri, headers: HeaderMap) -> Self {
        Self {
            method,
            path: uri.path().to_string(),
            query: uri.query().map(str::to_string),
            headers,
        }
    }

    /// Build from the head of a hyper request
    #[must_use]
    pub fn from_parts(parts: &Parts) -> Self {
        Self::new(parts.method.clone(), &parts.uri, parts.headers.clone())
    }

    /// Decoded query parameters in request order
    #[must_use]
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        let Some(query) = self.query.as_deref() else {
            return Vec::new();
        };
        query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| {
                let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
                (decode_component(name), decode_component(value))
            })
            .collect()
    }

    /// First value of a query parameter
    #[must_use]
    pub fn query_param(&self, name: &str) -> Option<String> {
        self.query_pairs()
            .into_iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// Whether a query parameter is present, with or without a value
    #[must_use]
    pub fn has_query_param(&self, name: &str) -> bool {
        self.query_pairs().iter().any(|(n, _)| n == name)
    }

    /// Header value as text, if present and valid UTF-8
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|decoded| decoded.into_owned())
        .unwrap_or(spaced)
}

/// Projection of a request onto the [`Key`] that identifies it for replay
///
/// Plain closures `Fn(&RequestInfo) -> Key` are key makers. Implement the
/// trait directly for key makers that need to await something.
pub trait KeyMaker: Send + Sync {
    /// Produce the key for a request
    fn make_key<'a>(&'a self, request: &'a RequestInfo) -> BoxFuture<'a, Result<Key>>;
}

impl<F> KeyMaker for F
where
    F: Fn(&RequestInfo) -> Key + Send + Sync,
{
    fn make_key<'a>(&'a self, request: &'a RequestInfo) -> BoxFuture<'a, Result<Key>> {
        let key = self(request);
        Box::pin(async move { Ok(key) })
    }
}

/// Key on the request path only
#[must_use]
pub fn path_key(request: &RequestInfo) -> Key {
    let mut key = Map::new();
    key.insert("path".to_string(), Value::String(request.path.clone()));
    Value::Object(key)
}

/// Key on the request path and every query parameter
#[must_use]
pub fn path_and_query_key(request: &RequestInfo) -> Key {
    let mut query = Map::new();
    for (name, value) in request.query_pairs() {
        query.entry(name).or_insert(Value::String(value));
    }
    let mut key = Map::new();
    key.insert("path".to_string(), Value::String(request.path.clone()));
    key.insert("query".to_string(), Value::Object(query));
    Value::Object(key)
}

/// Declarative key maker, loaded from configuration
///
/// Members are emitted in a fixed order (`method`, `path`, `query`, `flags`,
/// `headers`) so equal requests always produce byte-identical keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySpec {
    /// Include the HTTP method
    #[serde(default)]
    pub method: bool,
    /// Include the request path
    #[serde(default = "default_true")]
    pub path: bool,
    /// Query parameters whose values are part of the key
    #[serde(default)]
    pub query: Vec<String>,
    /// Query parameters whose presence is part of the key
    #[serde(default)]
    pub query_flags: Vec<String>,
    /// Headers whose values are part of the key
    #[serde(default)]
    pub headers: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl Default for KeySpec {
    fn default() -> Self {
        Self {
            method: false,
            path: true,
            query: Vec::new(),
            query_flags: Vec::new(),
            headers: Vec::new(),
        }
    }
}

impl KeySpec {
    /// Whether no request part is selected
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.method
            && !self.path
            && self.query.is_empty()
            && self.query_flags.is_empty()
            && self.headers.is_empty()
    }

    /// Build the key for a request
    #[must_use]
    pub fn key_for(&self, request: &RequestInfo) -> Key {
        let mut key = Map::new();
        if self.method {
            key.insert(
                "method".to_string(),
                Value::String(request.method.as_str().to_string()),
            );
        }
        if self.path {
            key.insert("path".to_string(), Value::String(request.path.clone()));
        }
        if !self.query.is_empty() {
            let query = self
                .query
                .iter()
                .map(|name| {
                    let value = request.query_param(name).map_or(Value::Null, Value::String);
                    (name.clone(), value)
                })
                .collect();
            key.insert("query".to_string(), Value::Object(query));
        }
        if !self.query_flags.is_empty() {
            let flags = self
                .query_flags
                .iter()
                .map(|name| (name.clone(), Value::Bool(request.has_query_param(name))))
                .collect();
            key.insert("flags".to_string(), Value::Object(flags));
        }
        if !self.headers.is_empty() {
            let headers = self
                .headers
                .iter()
                .map(|name| {
                    let value = request
                        .header(name)
                        .map_or(Value::Null, |v| Value::String(v.to_string()));
                    (name.to_ascii_lowercase(), value)
                })
                .collect();
            key.insert("headers".to_string(), Value::Object(headers));
        }
        Value::Object(key)
    }
}

impl KeyMaker for KeySpec {
    fn make_key<'a>(&'a self, request: &'a RequestInfo) -> BoxFuture<'a, Result<Key>> {
        let key = self.key_for(request);
        Box::pin(async move { Ok(key) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::FingerprintEngine;
    use serde_json::json;
    use std::sync::Arc;

    fn request(uri: &str) -> RequestInfo {
        let uri: Uri = uri.parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("accept-language", "en".parse().unwrap());
        RequestInfo::new(Method::GET, &uri, headers)
    }

    #[test]
    fn test_query_pairs_decoding() {
        let req = request("/search?q=hello+world&lang=en%2Dgb&flag");

        assert_eq!(
            req.query_pairs(),
            vec![
                ("q".to_string(), "hello world".to_string()),
                ("lang".to_string(), "en-gb".to_string()),
                ("flag".to_string(), String::new()),
            ]
        );
        assert!(req.has_query_param("flag"));
        assert_eq!(req.query_param("lang").as_deref(), Some("en-gb"));
        assert_eq!(req.query_param("missing"), None);
    }

    #[test]
    fn test_path_key() {
        let req = request("/jokes/random?safe-mode");
        assert_eq!(path_key(&req), json!({"path": "/jokes/random"}));
    }

    #[test]
    fn test_path_and_query_key_keeps_first_value() {
        let req = request("/jokes?b=2&a=1&b=3");
        assert_eq!(
            path_and_query_key(&req),
            json!({"path": "/jokes", "query": {"b": "2", "a": "1"}})
        );
    }

    #[test]
    fn test_key_spec() {
        let spec = KeySpec {
            method: true,
            path: true,
            query: vec!["lang".to_string()],
            query_flags: vec!["safe-mode".to_string()],
            headers: vec!["Accept-Language".to_string(), "x-missing".to_string()],
        };
        let req = request("/jokes/random?safe-mode&lang=de");

        assert_eq!(
            spec.key_for(&req),
            json!({
                "method": "GET",
                "path": "/jokes/random",
                "query": {"lang": "de"},
                "flags": {"safe-mode": true},
                "headers": {"accept-language": "en", "x-missing": null},
            })
        );
    }

    #[test]
    fn test_key_spec_from_toml() {
        let spec: KeySpec = toml::from_str(r#"query_flags = ["safe-mode"]"#).unwrap();
        assert!(spec.path);
        assert!(!spec.method);
        assert_eq!(spec.query_flags, vec!["safe-mode".to_string()]);
    }

    struct YieldingKeyMaker;

    impl KeyMaker for YieldingKeyMaker {
        fn make_key<'a>(&'a self, request: &'a RequestInfo) -> BoxFuture<'a, Result<Key>> {
            Box::pin(async move {
                tokio::task::yield_now().await;
                Ok(path_key(request))
            })
        }
    }

    #[tokio::test]
    async fn test_sync_and_async_key_makers_agree() {
        let req = request("/jokes/random");
        let sync_engine = FingerprintEngine::new(Arc::new(path_key));
        let async_engine = FingerprintEngine::new(Arc::new(YieldingKeyMaker));

        let a = sync_engine.fingerprint_request(&req).await.unwrap();
        let b = async_engine.fingerprint_request(&req).await.unwrap();
        assert_eq!(a, b);
    }
}
