//! Serves recorded responses from the store

use bytes::Bytes;
use futures_util::TryStreamExt;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use hyper::{HeaderMap, Response, StatusCode};
use tokio::io::AsyncReadExt;
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::fingerprint::{CanonicalKey, FingerprintEngine};
use crate::key::RequestInfo;
use crate::network::{BoxError, ProxyBody};
use crate::storage::{path_prefix, Lookup, RecordingHandle, RecordingStore};
use crate::{Result, TapedeckError};

/// Where a request's recording lives, if anywhere
#[derive(Debug, Clone)]
pub struct Located {
    /// Canonical key of the request
    pub key: CanonicalKey,
    /// Store namespace derived from the request path
    pub path_prefix: String,
    /// Lookup result
    pub lookup: Lookup,
}

/// Fully read recorded response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResponse {
    /// Recorded status
    pub status: StatusCode,
    /// Recorded headers
    pub headers: HeaderMap,
    /// Recorded body
    pub body: Bytes,
}

/// Replays recordings without contacting any upstream
#[derive(Debug, Clone)]
pub struct Replayer {
    fingerprints: FingerprintEngine,
    store: RecordingStore,
}

impl Replayer {
    /// Create a replayer over a store
    #[must_use]
    pub fn new(fingerprints: FingerprintEngine, store: RecordingStore) -> Self {
        Self {
            fingerprints,
            store,
        }
    }

    /// Store replayed from
    #[must_use]
    pub fn store(&self) -> &RecordingStore {
        &self.store
    }

    /// Fingerprint a request and look for its recording
    ///
    /// # Errors
    ///
    /// Returns error if the key cannot be made or the store cannot be read
    pub async fn locate(&self, request: &RequestInfo) -> Result<Located> {
        let key = self.fingerprints.fingerprint_request(request).await?;
        let path_prefix = path_prefix(&request.path)?;
        let lookup = self.store.locate(&path_prefix, &key).await?;

        debug!(
            "Lookup {} {} (fingerprint {}): {:?}",
            request.method, request.path, key.fingerprint, lookup
        );

        Ok(Located {
            key,
            path_prefix,
            lookup,
        })
    }

    /// Replay the recording for a request
    ///
    /// # Errors
    ///
    /// Returns [`TapedeckError::NotFound`] or
    /// [`TapedeckError::IncompleteRecording`] on a miss
    pub async fn replay(&self, request: &RequestInfo) -> Result<Response<ProxyBody>> {
        match self.locate(request).await?.lookup {
            Lookup::Complete(handle) => self.respond(&handle).await,
            Lookup::Incomplete { handle, artifact } => Err(TapedeckError::IncompleteRecording {
                dir: handle.dir().to_path_buf(),
                artifact,
            }),
            Lookup::Missing => Err(TapedeckError::NotFound {
                path: request.path.clone(),
            }),
        }
    }

    /// Stream a complete recording back as a response
    ///
    /// # Errors
    ///
    /// Returns error if an artifact vanished or `meta.json` is malformed
    pub async fn respond(&self, handle: &RecordingHandle) -> Result<Response<ProxyBody>> {
        let meta = handle.read_meta().await?;
        let status = meta.status_code()?;
        let headers = meta.header_map()?;
        let content = handle.open_content().await?;

        let stream = ReaderStream::new(content)
            .map_ok(Frame::data)
            .map_err(|e| -> BoxError { Box::new(e) });
        let mut response = Response::new(StreamBody::new(stream).boxed());
        *response.status_mut() = status;
        *response.headers_mut() = headers;

        debug!("Replaying {} from {}", status, handle.dir().display());
        Ok(response)
    }

    /// Read a complete recording into memory
    ///
    /// # Errors
    ///
    /// Returns error if an artifact is missing or unreadable
    pub async fn load(&self, handle: &RecordingHandle) -> Result<StoredResponse> {
        let meta = handle.read_meta().await?;
        let mut body = Vec::new();
        handle.open_content().await?.read_to_end(&mut body).await?;

        Ok(StoredResponse {
            status: meta.status_code()?,
            headers: meta.header_map()?,
            body: Bytes::from(body),
        })
    }
}
