//! Upstream HTTP client for forwarding recorded requests

use std::time::Duration;

use futures_util::future::BoxFuture;
use hyper::{Request, Response, Uri};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::{debug, warn};

use crate::{Result, TapedeckError};

use super::http::incoming;
use super::ProxyBody;

/// Sends a request to the upstream and resolves once response headers arrive
///
/// The request URI carries only path and query; implementations supply the
/// upstream's scheme and authority. The response body is left unread.
pub trait Upstream: Send + Sync {
    /// Forward one request
    fn send(&self, request: Request<ProxyBody>) -> BoxFuture<'_, Result<Response<ProxyBody>>>;
}

/// Streaming HTTP(S) client bound to one upstream base URL
pub struct UpstreamClient {
    client: Client<HttpsConnector<HttpConnector>, ProxyBody>,
    base: Uri,
}

impl UpstreamClient {
    /// Create a client for `base_url`
    ///
    /// # Errors
    ///
    /// Returns error if the URL is not absolute http(s) or TLS roots fail to load
    pub fn new(base_url: &str) -> Result<Self> {
        let base = parse_base_url(base_url)?;
        ensure_crypto_provider()?;

        let builder = match HttpsConnectorBuilder::new().with_native_roots() {
            Ok(builder) => builder,
            Err(e) => {
                // Plain http upstreams still work; https ones fail per request
                warn!("No native TLS roots available: {e}");
                let tls = rustls::ClientConfig::builder()
                    .with_root_certificates(rustls::RootCertStore::empty())
                    .with_no_client_auth();
                HttpsConnectorBuilder::new().with_tls_config(tls)
            }
        };
        let connector = builder
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .build(connector);

        Ok(Self { client, base })
    }

    /// Upstream base URL
    #[must_use]
    pub fn base(&self) -> &Uri {
        &self.base
    }
}

impl Upstream for UpstreamClient {
    fn send(&self, request: Request<ProxyBody>) -> BoxFuture<'_, Result<Response<ProxyBody>>> {
        Box::pin(async move {
            let (mut parts, body) = request.into_parts();
            parts.uri = upstream_uri(&self.base, &parts.uri)?;
            debug!("Forwarding {} to {}", parts.method, parts.uri);

            let response = self
                .client
                .request(Request::from_parts(parts, body))
                .await
                .map_err(|e| {
                    warn!("Upstream request failed: {e}");
                    TapedeckError::Upstream(e.to_string())
                })?;
            Ok(response.map(incoming))
        })
    }
}

fn ensure_crypto_provider() -> Result<()> {
    if rustls::crypto::CryptoProvider::get_default().is_some() {
        return Ok(());
    }
    // Losing an install race to another thread is fine
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        return Err(TapedeckError::Config(
            "Failed to install rustls crypto provider".to_string(),
        ));
    }
    Ok(())
}

/// Parse and check an upstream base URL
///
/// # Errors
///
/// Returns error unless the URL is absolute with an http or https scheme
pub fn parse_base_url(base_url: &str) -> Result<Uri> {
    let uri = base_url
        .parse::<Uri>()
        .map_err(|e| TapedeckError::Config(format!("Invalid upstream URL '{base_url}': {e}")))?;

    match uri.scheme_str() {
        Some("http" | "https") => {}
        _ => {
            return Err(TapedeckError::Config(format!(
                "Upstream URL must use http or https: {base_url}"
            )))
        }
    }
    if uri.authority().is_none() {
        return Err(TapedeckError::Config(format!(
            "Upstream URL has no host: {base_url}"
        )));
    }
    if uri.query().is_some() {
        return Err(TapedeckError::Config(format!(
            "Upstream URL cannot carry a query: {base_url}"
        )));
    }
    Ok(uri)
}

/// Join the upstream base with an inbound request's path and query
///
/// The query string is passed through verbatim.
fn upstream_uri(base: &Uri, original: &Uri) -> Result<Uri> {
    let base_path = base.path().trim_end_matches('/');
    let path_and_query = original
        .path_and_query()
        .map_or("/", hyper::http::uri::PathAndQuery::as_str);

    let mut builder = Uri::builder().path_and_query(format!("{base_path}{path_and_query}"));
    if let Some(scheme) = base.scheme() {
        builder = builder.scheme(scheme.clone());
    }
    if let Some(authority) = base.authority() {
        builder = builder.authority(authority.clone());
    }
    builder
        .build()
        .map_err(|e| TapedeckError::InvalidRequest(format!("Cannot build upstream URI: {e}")))
}
