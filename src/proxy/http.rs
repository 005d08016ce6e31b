//! HTTP proxy dispatching on record, replay and record-once

use std::sync::Arc;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::{Request, Response};
use tokio_util::task::TaskTracker;
use tracing::{debug, error};

use crate::config::{Config, Mode};
use crate::fingerprint::FingerprintEngine;
use crate::key::{KeyMaker, RequestInfo};
use crate::network::{error_response, incoming, ProxyBody, Upstream, UpstreamClient};
use crate::pipeline::{strip_headers, Pipeline};
use crate::recording::{Recorded, Recorder};
use crate::replay::Replayer;
use crate::storage::{Lookup, RecordingStore};
use crate::{Result, TapedeckError};

/// HTTP proxy that records, replays, or records once
pub struct HttpProxy {
    mode: Mode,
    replayer: Replayer,
    recorder: Option<Recorder>,
    completions: TaskTracker,
}

impl HttpProxy {
    /// Proxy that only replays; it never needs an upstream
    #[must_use]
    pub fn replaying(store: RecordingStore, key_maker: Arc<dyn KeyMaker>) -> Self {
        Self {
            mode: Mode::Replay,
            replayer: Replayer::new(FingerprintEngine::new(key_maker), store),
            recorder: None,
            completions: TaskTracker::new(),
        }
    }

    /// Proxy in any mode, forwarding misses to `upstream`
    #[must_use]
    pub fn new(
        mode: Mode,
        store: RecordingStore,
        key_maker: Arc<dyn KeyMaker>,
        upstream: Arc<dyn Upstream>,
        pipeline: Pipeline,
    ) -> Self {
        let fingerprints = FingerprintEngine::new(key_maker);
        Self {
            mode,
            replayer: Replayer::new(fingerprints.clone(), store.clone()),
            recorder: Some(Recorder::new(fingerprints, store, upstream, pipeline)),
            completions: TaskTracker::new(),
        }
    }

    /// Build the proxy a configuration describes
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid or the client cannot be built
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;

        let store = RecordingStore::new(&config.store_root)
            .with_scope(config.lookup_scope)
            .with_key_verification(config.verify_key);
        let key_maker: Arc<dyn KeyMaker> = Arc::new(config.key.clone());

        if !config.mode.uses_upstream() {
            return Ok(Self::replaying(store, key_maker));
        }

        let upstream = config.upstream.as_deref().ok_or_else(|| {
            TapedeckError::Config(format!("An upstream URL is required in {} mode", config.mode))
        })?;
        let client = UpstreamClient::new(upstream)?;

        let mut pipeline = Pipeline::with_defaults(!config.disable_default_header_processors);
        if !config.strip_headers.is_empty() {
            pipeline = pipeline.with_header_processor(strip_headers(&config.strip_headers));
        }

        Ok(Self::new(
            config.mode,
            store,
            key_maker,
            Arc::new(client),
            pipeline,
        ))
    }

    /// Operating mode
    #[must_use]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Recordings whose response is still streaming or being finalized
    #[must_use]
    pub fn pending_recordings(&self) -> usize {
        self.completions.len()
    }

    /// Serve one inbound request, mapping failures to diagnostic responses
    pub async fn handle(&self, request: Request<Incoming>) -> Response<ProxyBody> {
        match self.proxy(request.map(incoming)).await {
            Ok(response) => response,
            Err(e) => error_response(&e),
        }
    }

    /// Serve one request according to the mode
    ///
    /// # Errors
    ///
    /// Returns [`TapedeckError::NotFound`] or
    /// [`TapedeckError::IncompleteRecording`] on a replay miss, and upstream or
    /// storage errors while recording
    pub async fn proxy(&self, request: Request<ProxyBody>) -> Result<Response<ProxyBody>> {
        debug!(
            "{} mode: {} {}",
            self.mode,
            request.method(),
            request.uri()
        );

        match self.mode {
            Mode::Replay => {
                let (parts, _body) = request.into_parts();
                self.replayer.replay(&RequestInfo::from_parts(&parts)).await
            }
            Mode::Record => {
                let recorded = self.recorder()?.record(request).await?;
                Ok(self.track(recorded))
            }
            Mode::RecordOnce => self.record_once(request).await,
        }
    }

    /// Replay when a complete recording exists, otherwise record
    ///
    /// Concurrent first requests for one key are serialized by a claim on the
    /// recording directory: one records, the rest wait and then replay.
    async fn record_once(&self, request: Request<ProxyBody>) -> Result<Response<ProxyBody>> {
        let (parts, body) = request.into_parts();
        let info = RequestInfo::from_parts(&parts);
        let located = self.replayer.locate(&info).await?;

        if let Lookup::Complete(handle) = &located.lookup {
            return self.replayer.respond(handle).await;
        }

        let recorder = self.recorder()?;
        let claim = recorder.claim(&located.path_prefix, &located.key).await?;

        // The previous claim holder may have just finished this recording
        if let Some(handle) = self
            .replayer
            .store()
            .lookup(&located.path_prefix, &located.key)
            .await?
        {
            debug!("Recorded concurrently, replaying {}", handle.dir().display());
            return self.replayer.respond(&handle).await;
        }

        let recorded = recorder
            .record_claimed(parts, body, located.key, &located.path_prefix, claim)
            .await?;
        Ok(self.track(recorded))
    }

    fn recorder(&self) -> Result<&Recorder> {
        self.recorder.as_ref().ok_or_else(|| {
            TapedeckError::Config(format!("No upstream configured in {} mode", self.mode))
        })
    }

    /// Finalize a recording in the background once its body drains
    fn track(&self, recorded: Recorded) -> Response<ProxyBody> {
        let Recorded {
            response,
            completion,
        } = recorded;

        self.completions.spawn(async move {
            match completion.await {
                Ok(summary) => debug!(
                    "Finalized {} ({} bytes)",
                    summary.dir.display(),
                    summary.bytes_written
                ),
                // Logged where the capture ended
                Err(TapedeckError::CaptureAborted(_)) => {}
                Err(e) => error!("Failed to finalize recording: {}", e),
            }
        });
        response
    }

    /// Wait for in-flight recordings to finalize
    ///
    /// Returns `false` if some were still pending when `timeout` elapsed.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.completions.close();
        let drained = tokio::time::timeout(timeout, self.completions.wait())
            .await
            .is_ok();
        self.completions.reopen();
        drained
    }
}
