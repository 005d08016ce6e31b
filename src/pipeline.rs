//! Header and response processing applied to recorded responses

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use hyper::header::HeaderName;
use hyper::{HeaderMap, StatusCode};
use tracing::warn;

/// Mutates response headers before they are sent and persisted
pub type HeaderProcessor = Arc<dyn Fn(&mut HeaderMap) + Send + Sync>;

/// Observes a fully captured response; cannot change what was sent or stored
pub type ResponseProcessor = Arc<dyn Fn(&CapturedResponse) + Send + Sync>;

/// A recorded response with its whole body buffered
#[derive(Debug, Clone)]
pub struct CapturedResponse {
    /// Upstream status
    pub status: StatusCode,
    /// Headers after header processing
    pub headers: HeaderMap,
    /// Body bytes exactly as stored
    pub body: Bytes,
}

/// Header processor removing the named headers when present
pub fn strip_headers<I, S>(names: I) -> HeaderProcessor
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let names: Vec<HeaderName> = names
        .into_iter()
        .filter_map(|name| match HeaderName::from_bytes(name.as_ref().as_bytes()) {
            Ok(name) => Some(name),
            Err(e) => {
                warn!("Ignoring invalid header name '{}': {}", name.as_ref(), e);
                None
            }
        })
        .collect();

    Arc::new(move |headers: &mut HeaderMap| {
        for name in &names {
            headers.remove(name);
        }
    })
}

/// Ordered header processors plus response observers
///
/// Header processors run in registration order, after the default `date`
/// stripper unless defaults are disabled.
#[derive(Clone)]
pub struct Pipeline {
    header_processors: Vec<HeaderProcessor>,
    response_processors: Vec<ResponseProcessor>,
}

impl Pipeline {
    /// Pipeline with the default `date` stripper
    #[must_use]
    pub fn new() -> Self {
        Self::with_defaults(true)
    }

    /// Pipeline with or without the default `date` stripper
    #[must_use]
    pub fn with_defaults(enabled: bool) -> Self {
        let header_processors = if enabled {
            vec![strip_headers(["date"])]
        } else {
            Vec::new()
        };
        Self {
            header_processors,
            response_processors: Vec::new(),
        }
    }

    /// Append a header processor
    #[must_use]
    pub fn with_header_processor(mut self, processor: HeaderProcessor) -> Self {
        self.header_processors.push(processor);
        self
    }

    /// Append a response processor
    #[must_use]
    pub fn with_response_processor(mut self, processor: ResponseProcessor) -> Self {
        self.response_processors.push(processor);
        self
    }

    /// Apply every header processor in order
    pub fn process_headers(&self, headers: &mut HeaderMap) {
        for processor in &self.header_processors {
            processor(headers);
        }
    }

    /// Whether bodies need buffering for response processors
    #[must_use]
    pub fn wants_body(&self) -> bool {
        !self.response_processors.is_empty()
    }

    /// Hand a captured response to every response processor in order
    pub fn observe(&self, response: &CapturedResponse) {
        for processor in &self.response_processors {
            processor(response);
        }
    }

    /// Number of header processors, including defaults
    #[must_use]
    pub fn header_processor_count(&self) -> usize {
        self.header_processors.len()
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("header_processors", &self.header_processors.len())
            .field("response_processors", &self.response_processors.len())
            .finish()
    }
}
