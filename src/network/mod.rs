//! Network layer for Tapedeck
//!
//! Inbound server, upstream client and the body type shared between them.

mod client;
mod connection_pool;
mod http;
mod server;

use std::error::Error as StdError;

use http_body_util::combinators::BoxBody;
use hyper::body::Bytes;

pub use client::{parse_base_url, Upstream, UpstreamClient};
pub use connection_pool::{ConnectionGuard, ConnectionPool};
pub use http::{error_response, error_status, full, incoming, strip_hop_by_hop, text_response};
pub use server::Server;

/// Error carried by streamed bodies
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Body type flowing through the proxy in both directions
pub type ProxyBody = BoxBody<Bytes, BoxError>;

/// Default maximum number of concurrent connections
pub const MAX_CONNECTIONS: usize = 4096;

/// Graceful shutdown timeout
pub const SHUTDOWN_TIMEOUT_MS: u64 = 5000;
