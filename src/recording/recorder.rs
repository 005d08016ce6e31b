//! Records upstream responses while streaming them to the caller

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use http_body_util::BodyExt;
use hyper::header::HOST;
use hyper::http::request::Parts;
use hyper::{Request, Response, StatusCode};
use tracing::{debug, info, warn};

use crate::fingerprint::{CanonicalKey, Fingerprint, FingerprintEngine};
use crate::key::RequestInfo;
use crate::network::{strip_hop_by_hop, ProxyBody, Upstream};
use crate::pipeline::{CapturedResponse, Pipeline};
use crate::storage::{path_prefix, Claim, ClaimTable, Meta, RecordingStore};
use crate::{Result, TapedeckError};

use super::tee::{CaptureBody, CaptureOutcome};

/// Resolves once a recording is finalized or abandoned
pub type Completion = BoxFuture<'static, Result<RecordingSummary>>;

/// What a finished recording wrote
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingSummary {
    /// Recording directory
    pub dir: PathBuf,
    /// Request fingerprint
    pub fingerprint: Fingerprint,
    /// Recorded status
    pub status: StatusCode,
    /// Size of `response.content`
    pub bytes_written: u64,
}

/// A response being recorded
pub struct Recorded {
    /// Response to hand to the caller; its body feeds the recording
    pub response: Response<ProxyBody>,
    /// Finalizes the recording once the body has been fully consumed
    ///
    /// Must be polled for `meta.json` to be written. It holds the claim on
    /// the recording directory until it resolves.
    pub completion: Completion,
}

impl fmt::Debug for Recorded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recorded")
            .field("status", &self.response.status())
            .finish_non_exhaustive()
    }
}

/// Forwards requests upstream and records what comes back
#[derive(Clone)]
pub struct Recorder {
    fingerprints: FingerprintEngine,
    store: RecordingStore,
    upstream: Arc<dyn Upstream>,
    pipeline: Arc<Pipeline>,
    claims: ClaimTable,
}

impl Recorder {
    /// Create a recorder
    #[must_use]
    pub fn new(
        fingerprints: FingerprintEngine,
        store: RecordingStore,
        upstream: Arc<dyn Upstream>,
        pipeline: Pipeline,
    ) -> Self {
        Self {
            fingerprints,
            store,
            upstream,
            pipeline: Arc::new(pipeline),
            claims: ClaimTable::new(),
        }
    }

    /// Store written to
    #[must_use]
    pub fn store(&self) -> &RecordingStore {
        &self.store
    }

    /// Claim the recording directory for a key, waiting for any other writer
    ///
    /// # Errors
    ///
    /// Returns error if the path prefix is invalid
    pub async fn claim(&self, path_prefix: &str, key: &CanonicalKey) -> Result<Claim> {
        let dir = self.store.recording_dir(path_prefix, key.fingerprint)?;
        Ok(self.claims.claim(&dir).await)
    }

    /// Record a request unconditionally, replacing any previous recording
    ///
    /// # Errors
    ///
    /// Returns error if the key cannot be made, the store is unwritable,
    /// or the upstream cannot be reached
    pub async fn record(&self, request: Request<ProxyBody>) -> Result<Recorded> {
        let (parts, body) = request.into_parts();
        let info = RequestInfo::from_parts(&parts);
        let key = self.fingerprints.fingerprint_request(&info).await?;
        let prefix = path_prefix(&info.path)?;
        let claim = self.claim(&prefix, &key).await?;

        self.record_claimed(parts, body, key, &prefix, claim).await
    }

    /// Record a request whose directory is already claimed
    ///
    /// # Errors
    ///
    /// Returns error if the store is unwritable or the upstream cannot be
    /// reached; no `meta.json` is written in either case
    pub async fn record_claimed(
        &self,
        mut parts: Parts,
        body: ProxyBody,
        key: CanonicalKey,
        path_prefix: &str,
        claim: Claim,
    ) -> Result<Recorded> {
        let handle = self.store.create(path_prefix, key.fingerprint).await?;
        debug!(
            "Recording {} {} into {}",
            parts.method,
            parts.uri.path(),
            handle.dir().display()
        );

        parts.headers.remove(HOST);
        let response = self.upstream.send(Request::from_parts(parts, body)).await?;
        let (mut response_parts, upstream_body) = response.into_parts();
        strip_hop_by_hop(&mut response_parts.headers);
        self.pipeline.process_headers(&mut response_parts.headers);

        // Any earlier recording stops being replayable before its content changes
        handle.invalidate().await?;
        let sink = handle.create_content().await?;
        let (body, outcome) = CaptureBody::new(upstream_body, sink, self.pipeline.wants_body());

        let status = response_parts.status;
        let headers = response_parts.headers.clone();
        let pipeline = Arc::clone(&self.pipeline);
        let completion: Completion = Box::pin(async move {
            let _claim = claim;
            let outcome = outcome.await.unwrap_or_else(|_| CaptureOutcome::Aborted {
                bytes_written: 0,
                reason: "capture dropped without reporting".to_string(),
            });

            match outcome {
                CaptureOutcome::Completed {
                    bytes_written,
                    body,
                } => {
                    handle.write_key(&key.bytes).await?;
                    handle
                        .write_meta(&Meta::from_response(status, &headers))
                        .await?;
                    info!(
                        "Recorded {} ({} bytes) in {}",
                        status,
                        bytes_written,
                        handle.dir().display()
                    );

                    if let Some(body) = body {
                        pipeline.observe(&CapturedResponse {
                            status,
                            headers,
                            body,
                        });
                    }

                    Ok(RecordingSummary {
                        dir: handle.dir().to_path_buf(),
                        fingerprint: key.fingerprint,
                        status,
                        bytes_written,
                    })
                }
                CaptureOutcome::Aborted {
                    bytes_written,
                    reason,
                } => {
                    warn!(
                        "Recording in {} left incomplete after {} bytes: {}",
                        handle.dir().display(),
                        bytes_written,
                        reason
                    );
                    Err(TapedeckError::CaptureAborted(reason))
                }
            }
        });

        Ok(Recorded {
            response: Response::from_parts(response_parts, body.boxed()),
            completion,
        })
    }
}

impl fmt::Debug for Recorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recorder")
            .field("store", &self.store)
            .field("pipeline", &self.pipeline)
            .finish_non_exhaustive()
    }
}
