//! Capture tee: forwards a response body while writing it to a recording

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Bytes, BytesMut};
use hyper::body::{Body, Frame, SizeHint};
use tokio::io::AsyncWrite;
use tokio::sync::oneshot;

use crate::network::BoxError;

/// How a captured body ended
#[derive(Debug)]
pub enum CaptureOutcome {
    /// Source exhausted and sink closed
    Completed {
        /// Bytes written to the sink
        bytes_written: u64,
        /// Buffered body, when buffering was requested
        body: Option<Bytes>,
    },
    /// Source failed, sink failed, or the body was dropped early
    Aborted {
        /// Bytes written before the abort
        bytes_written: u64,
        /// Human-readable cause
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Streaming,
    Closing,
    Done,
}

struct PendingChunk {
    data: Bytes,
    written: usize,
}

/// Body wrapper that writes every data frame to `sink` before yielding it
///
/// The outcome is reported exactly once on the channel returned by
/// [`CaptureBody::new`]: on end of stream after the sink is shut down, on the
/// first source or sink error, or when the body is dropped unfinished.
pub struct CaptureBody<B, W> {
    inner: Option<B>,
    sink: Option<W>,
    pending: Option<PendingChunk>,
    buffer: Option<BytesMut>,
    bytes_written: u64,
    expected_len: Option<u64>,
    last: Option<Bytes>,
    state: State,
    outcome_tx: Option<oneshot::Sender<CaptureOutcome>>,
}

impl<B: Body, W> CaptureBody<B, W> {
    /// Wrap `inner`, teeing its data into `sink`
    ///
    /// When `buffer_body` is set the whole body is also kept in memory and
    /// handed back in [`CaptureOutcome::Completed`].
    pub fn new(
        inner: B,
        sink: W,
        buffer_body: bool,
    ) -> (Self, oneshot::Receiver<CaptureOutcome>) {
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let body = Self {
            expected_len: inner.size_hint().exact(),
            inner: Some(inner),
            sink: Some(sink),
            pending: None,
            buffer: buffer_body.then(BytesMut::new),
            bytes_written: 0,
            last: None,
            state: State::Streaming,
            outcome_tx: Some(outcome_tx),
        };
        (body, outcome_rx)
    }
}

impl<B, W> CaptureBody<B, W> {
    /// Bytes written to the sink so far
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    fn finish(&mut self, outcome: CaptureOutcome) {
        self.state = State::Done;
        self.inner = None;
        self.sink = None;
        self.pending = None;
        if let Some(tx) = self.outcome_tx.take() {
            // Receiver gone means nobody is waiting to persist metadata
            let _ = tx.send(outcome);
        }
    }

    fn complete(&mut self) {
        let bytes_written = self.bytes_written;
        let body = self.buffer.take().map(BytesMut::freeze);
        self.finish(CaptureOutcome::Completed {
            bytes_written,
            body,
        });
    }

    /// Every byte of a known-length source has reached the sink
    fn delivered_expected(&self) -> bool {
        self.pending.is_none() && self.expected_len == Some(self.bytes_written)
    }

    fn abort(&mut self, reason: String) {
        let bytes_written = self.bytes_written;
        self.finish(CaptureOutcome::Aborted {
            bytes_written,
            reason,
        });
    }
}

impl<B, W: AsyncWrite + Unpin> CaptureBody<B, W> {
    /// Drive the pending chunk into the sink and flush it
    fn poll_write_pending(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<Bytes>> {
        let (Some(pending), Some(sink)) = (self.pending.as_mut(), self.sink.as_mut()) else {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "capture sink already closed",
            )));
        };

        while pending.written < pending.data.len() {
            let n = ready!(Pin::new(&mut *sink).poll_write(cx, &pending.data[pending.written..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            pending.written += n;
            self.bytes_written += n as u64;
        }
        ready!(Pin::new(&mut *sink).poll_flush(cx))?;

        let data = self.pending.take().map(|p| p.data).unwrap_or_default();
        Poll::Ready(Ok(data))
    }
}

impl<B, W> Body for CaptureBody<B, W>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<BoxError>,
    W: AsyncWrite + Unpin,
{
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();

        loop {
            match this.state {
                State::Done => return Poll::Ready(None),
                State::Closing => {
                    let result = match this.sink.as_mut() {
                        Some(sink) => ready!(Pin::new(sink).poll_shutdown(cx)),
                        None => Ok(()),
                    };
                    return match result {
                        Ok(()) => {
                            let last = this.last.take();
                            this.complete();
                            Poll::Ready(last.map(|data| Ok(Frame::data(data))))
                        }
                        Err(e) => {
                            this.abort(format!("closing capture sink: {e}"));
                            Poll::Ready(Some(Err(Box::new(e))))
                        }
                    };
                }
                State::Streaming => {}
            }

            if this.pending.is_some() {
                match ready!(this.poll_write_pending(cx)) {
                    Ok(data) => {
                        if let Some(buffer) = this.buffer.as_mut() {
                            buffer.extend_from_slice(&data);
                        }
                        // A server that knows the length stops polling after
                        // the final chunk, so close the sink before yielding it
                        let source_done = this.inner.as_ref().map_or(true, Body::is_end_stream);
                        if source_done || this.delivered_expected() {
                            this.inner = None;
                            this.last = Some(data);
                            this.state = State::Closing;
                            continue;
                        }
                        return Poll::Ready(Some(Ok(Frame::data(data))));
                    }
                    Err(e) => {
                        this.abort(format!("writing capture sink: {e}"));
                        return Poll::Ready(Some(Err(Box::new(e))));
                    }
                }
            }

            let Some(inner) = this.inner.as_mut() else {
                this.state = State::Closing;
                continue;
            };

            match ready!(Pin::new(inner).poll_frame(cx)) {
                None => {
                    // Source exhausted: release it before closing the sink
                    this.inner = None;
                    this.state = State::Closing;
                }
                Some(Ok(frame)) => match frame.into_data() {
                    Ok(data) if data.is_empty() => {}
                    Ok(data) => this.pending = Some(PendingChunk { data, written: 0 }),
                    Err(frame) => return Poll::Ready(Some(Ok(frame))),
                },
                Some(Err(e)) => {
                    let err: BoxError = e.into();
                    this.abort(format!("upstream body: {err}"));
                    return Poll::Ready(Some(Err(err)));
                }
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.state == State::Done
    }

    fn size_hint(&self) -> SizeHint {
        let pending = self
            .pending
            .as_ref()
            .map_or(0, |p| (p.data.len() - p.written) as u64)
            + self.last.as_ref().map_or(0, |data| data.len() as u64);
        match (&self.inner, self.state) {
            (Some(inner), State::Streaming) => {
                let inner_hint = inner.size_hint();
                let mut hint = SizeHint::new();
                if let Some(upper) = inner_hint.upper() {
                    hint.set_upper(upper + pending);
                }
                hint.set_lower(inner_hint.lower() + pending);
                hint
            }
            _ => SizeHint::with_exact(pending),
        }
    }
}

impl<B, W> Drop for CaptureBody<B, W> {
    fn drop(&mut self) {
        if self.outcome_tx.is_none() {
            return;
        }
        // Chunks are flushed as they are written, so a known-length body
        // that was fully written is complete even if never polled to the end
        if self.delivered_expected() {
            self.complete();
        } else {
            self.abort("response body dropped before completion".to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use http_body_util::{BodyExt, Empty, Full, StreamBody};
    use hyper::service::service_fn;
    use hyper::{Request, Response};
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::TempDir;

    type Chunks = StreamBody<stream::Iter<std::vec::IntoIter<Result<Frame<Bytes>, io::Error>>>>;

    fn chunks(parts: &[&'static str]) -> Chunks {
        let frames: Vec<Result<Frame<Bytes>, io::Error>> = parts
            .iter()
            .map(|p| Ok(Frame::data(Bytes::from_static(p.as_bytes()))))
            .collect();
        StreamBody::new(stream::iter(frames))
    }

    async fn sink(dir: &TempDir) -> (std::path::PathBuf, tokio::fs::File) {
        let path = dir.path().join("response.content");
        let file = tokio::fs::File::create(&path).await.unwrap();
        (path, file)
    }

    #[tokio::test]
    async fn test_tee_forwards_and_persists() {
        let dir = TempDir::new().unwrap();
        let (path, file) = sink(&dir).await;
        let source = chunks(&["why did ", "the crab ", "never share"]);
        let (body, outcome) = CaptureBody::new(source, file, false);

        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(&collected[..], b"why did the crab never share");
        assert_eq!(tokio::fs::read(&path).await.unwrap(), collected.to_vec());

        match outcome.await.unwrap() {
            CaptureOutcome::Completed { bytes_written, body } => {
                assert_eq!(bytes_written, collected.len() as u64);
                assert!(body.is_none(), "Body must not be buffered unless requested");
            }
            CaptureOutcome::Aborted { reason, .. } => panic!("unexpected abort: {reason}"),
        }
    }

    #[tokio::test]
    async fn test_chunk_is_written_before_it_is_yielded() {
        let dir = TempDir::new().unwrap();
        let (path, file) = sink(&dir).await;
        let (mut body, _outcome) = CaptureBody::new(chunks(&["first", "second"]), file, false);

        let frame = body.frame().await.unwrap().unwrap();
        assert_eq!(frame.into_data().unwrap(), Bytes::from_static(b"first"));
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"first");
    }

    #[tokio::test]
    async fn test_tee_buffers_when_requested() {
        let dir = TempDir::new().unwrap();
        let (_path, file) = sink(&dir).await;
        let (body, outcome) = CaptureBody::new(chunks(&["a", "", "b"]), file, true);

        body.collect().await.unwrap();
        match outcome.await.unwrap() {
            CaptureOutcome::Completed { body, .. } => {
                assert_eq!(body, Some(Bytes::from_static(b"ab")));
            }
            CaptureOutcome::Aborted { reason, .. } => panic!("unexpected abort: {reason}"),
        }
    }

    #[tokio::test]
    async fn test_source_error_aborts_and_keeps_partial_content() {
        let dir = TempDir::new().unwrap();
        let (path, file) = sink(&dir).await;
        let frames: Vec<Result<Frame<Bytes>, io::Error>> = vec![
            Ok(Frame::data(Bytes::from_static(b"partial"))),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "upstream reset")),
        ];
        let (body, outcome) = CaptureBody::new(StreamBody::new(stream::iter(frames)), file, false);

        assert!(body.collect().await.is_err());
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"partial");
        match outcome.await.unwrap() {
            CaptureOutcome::Aborted {
                bytes_written,
                reason,
            } => {
                assert_eq!(bytes_written, 7);
                assert!(reason.contains("upstream reset"));
            }
            CaptureOutcome::Completed { .. } => panic!("error must abort the capture"),
        }
    }

    #[tokio::test]
    async fn test_dropped_body_reports_abort() {
        let dir = TempDir::new().unwrap();
        let (_path, file) = sink(&dir).await;
        let (mut body, outcome) = CaptureBody::new(chunks(&["one", "two"]), file, false);

        body.frame().await.unwrap().unwrap();
        drop(body);

        assert!(matches!(
            outcome.await.unwrap(),
            CaptureOutcome::Aborted { bytes_written: 3, .. }
        ));
    }

    #[tokio::test]
    async fn test_size_hint_follows_source() {
        let dir = TempDir::new().unwrap();
        let (_path, file) = sink(&dir).await;
        let (body, _outcome) =
            CaptureBody::new(Full::new(Bytes::from_static(b"12345")), file, false);

        assert_eq!(body.size_hint().exact(), Some(5));
    }

    #[tokio::test]
    async fn test_final_frame_completes_capture() {
        let dir = TempDir::new().unwrap();
        let (_path, file) = sink(&dir).await;
        let source = Full::new(Bytes::from_static(b"abc"));
        let (mut body, mut outcome) = CaptureBody::new(source, file, false);

        let frame = body.frame().await.unwrap().unwrap();
        assert_eq!(frame.into_data().unwrap(), Bytes::from_static(b"abc"));
        assert!(body.is_end_stream());
        assert!(matches!(
            outcome.try_recv().unwrap(),
            CaptureOutcome::Completed { bytes_written: 3, .. }
        ));
    }

    #[tokio::test]
    async fn test_unpolled_empty_body_is_complete() {
        let dir = TempDir::new().unwrap();
        let (_path, file) = sink(&dir).await;
        let (body, outcome) = CaptureBody::new(Full::new(Bytes::new()), file, false);

        drop(body);
        assert!(matches!(
            outcome.await.unwrap(),
            CaptureOutcome::Completed { bytes_written: 0, .. }
        ));
    }

    /// Serve one captured response over an in-memory HTTP/1 connection
    async fn serve_captured<B>(body: CaptureBody<B, tokio::fs::File>) -> Bytes
    where
        B: Body<Data = Bytes> + Unpin + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let (client_io, server_io) = tokio::io::duplex(64);
        let slot = Arc::new(Mutex::new(Some(body)));
        let service = service_fn(move |_request: Request<hyper::body::Incoming>| {
            let body = slot.lock().unwrap().take().unwrap();
            async move { Ok::<_, Infallible>(Response::new(body)) }
        });
        tokio::spawn(
            hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(server_io), service),
        );

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(client_io))
            .await
            .unwrap();
        tokio::spawn(conn);
        let request = Request::get("/jokes/random")
            .body(Empty::<Bytes>::new())
            .unwrap();
        let response = sender.send_request(request).await.unwrap();
        response.into_body().collect().await.unwrap().to_bytes()
    }

    #[tokio::test]
    async fn test_known_length_body_completes_behind_http1_server() {
        let dir = TempDir::new().unwrap();
        let (path, file) = sink(&dir).await;
        let source = Full::new(Bytes::from_static(b"hello joke"));
        let (body, outcome) = CaptureBody::new(source, file, true);

        let received = serve_captured(body).await;
        assert_eq!(&received[..], b"hello joke");

        let outcome = tokio::time::timeout(Duration::from_secs(5), outcome)
            .await
            .unwrap()
            .unwrap();
        match outcome {
            CaptureOutcome::Completed {
                bytes_written,
                body,
            } => {
                assert_eq!(bytes_written, 10);
                assert_eq!(body, Some(Bytes::from_static(b"hello joke")));
            }
            CaptureOutcome::Aborted { reason, .. } => panic!("unexpected abort: {reason}"),
        }
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"hello joke");
    }

    #[tokio::test]
    async fn test_chunked_body_completes_behind_http1_server() {
        let dir = TempDir::new().unwrap();
        let (path, file) = sink(&dir).await;
        let (body, outcome) = CaptureBody::new(chunks(&["knock ", "knock"]), file, false);

        let received = serve_captured(body).await;
        assert_eq!(&received[..], b"knock knock");

        let outcome = tokio::time::timeout(Duration::from_secs(5), outcome)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            outcome,
            CaptureOutcome::Completed {
                bytes_written: 11,
                ..
            }
        ));
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"knock knock");
    }
}
