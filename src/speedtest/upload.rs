use bytes::Bytes;
use futures::Stream;
use rand::{Rng, SeedableRng};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::event::{Completion, Emitter, Event, EventSink, Notice};
use super::throughput::{TransferState, PROGRESS_INTERVAL};
use super::SessionOutcome;
use crate::error::TransferError;
use crate::settings::{kib_to_bytes, mib_to_bytes};

/// What an upload session intends to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadPlan {
    pub total_bytes: u64,
    pub chunk_bytes: usize,
}

impl UploadPlan {
    pub fn new(total_bytes: u64, chunk_bytes: usize) -> Self {
        Self {
            total_bytes,
            chunk_bytes: chunk_bytes.max(1),
        }
    }

    /// Plan from a size in MiB and a chunk size in KiB (at least 1 KiB).
    /// Sizes too large to represent saturate.
    pub fn from_sizes(size_mb: u64, chunk_kb: usize) -> Self {
        Self::new(
            mib_to_bytes(size_mb).unwrap_or(u64::MAX),
            kib_to_bytes(chunk_kb),
        )
    }
}

/// One chunk of random bytes, re-sent for every write of a session.
pub fn random_payload(len: usize) -> Bytes {
    let mut rng = rand::rngs::StdRng::from_entropy();
    let mut data = vec![0u8; len];
    rng.fill(&mut data[..]);
    Bytes::from(data)
}

/// Request body fed chunk by chunk from [`HttpSink::write`].
///
/// The client only polls the body once the connection (and TLS, if any) is
/// up and the request head is written; the first poll fires `started`.
struct BodyStream {
    chunks: mpsc::Receiver<std::io::Result<Bytes>>,
    started: Option<oneshot::Sender<()>>,
}

impl Stream for BodyStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(started) = self.started.take() {
            let _ = started.send(());
        }
        self.chunks.poll_recv(cx)
    }
}

type PendingRequest = JoinHandle<Result<reqwest::StatusCode, reqwest::Error>>;

/// Streams a chunked `POST` body to a remote endpoint.
pub struct HttpSink {
    url: String,
    tx: Option<mpsc::Sender<std::io::Result<Bytes>>>,
    request: Option<PendingRequest>,
    io_timeout: Duration,
}

impl HttpSink {
    /// Starts the request and returns once the endpoint is ready for body
    /// bytes. Connect, TLS and early-response failures all surface here.
    pub async fn open(
        client: &reqwest::Client,
        url: &str,
        connect_timeout: Duration,
        io_timeout: Duration,
    ) -> Result<Self, TransferError> {
        let parsed = reqwest::Url::parse(url).map_err(|e| TransferError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        if parsed.host_str().is_none() {
            return Err(TransferError::InvalidUrl {
                url: url.to_string(),
                reason: "missing host".into(),
            });
        }

        let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(4);
        let (started_tx, started_rx) = oneshot::channel();
        let body = BodyStream {
            chunks: rx,
            started: Some(started_tx),
        };
        let pending = client
            .post(parsed)
            .body(reqwest::Body::wrap_stream(body))
            .send();
        let mut request: PendingRequest =
            tokio::spawn(async move { pending.await.map(|response| response.status()) });

        let handshake = async {
            tokio::select! {
                Ok(()) = started_rx => None,
                finished = &mut request => Some(finished),
            }
        };
        let limit = connect_timeout + io_timeout;
        let opened = tokio::time::timeout(limit, handshake).await;
        match opened {
            Ok(None) => {}
            Ok(Some(finished)) => {
                return Err(match finished {
                    Ok(Err(e)) => TransferError::Http(e),
                    Ok(Ok(status)) => {
                        TransferError::SinkClosed(format!("responded {status} before any data"))
                    }
                    Err(e) => TransferError::SinkClosed(e.to_string()),
                });
            }
            Err(_) => {
                request.abort();
                return Err(TransferError::SinkTimeout(limit));
            }
        }

        Ok(Self {
            url: url.to_string(),
            tx: Some(tx),
            request: Some(request),
            io_timeout,
        })
    }

    async fn write(&mut self, chunk: Bytes) -> Result<(), TransferError> {
        let Some(tx) = self.tx.as_ref() else {
            return Err(TransferError::SinkClosed("sink already closed".into()));
        };
        let sent = tokio::time::timeout(self.io_timeout, tx.send(Ok(chunk))).await;
        match sent {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => {
                // The request finished before the body did.
                self.tx = None;
                Err(self.request_failure().await)
            }
            Err(_) => Err(TransferError::SinkTimeout(self.io_timeout)),
        }
    }

    async fn request_failure(&mut self) -> TransferError {
        match self.request.take() {
            Some(request) => match request.await {
                Ok(Err(e)) => TransferError::Http(e),
                Ok(Ok(status)) => TransferError::SinkClosed(format!("responded {status} early")),
                Err(e) => TransferError::SinkClosed(e.to_string()),
            },
            None => TransferError::SinkClosed("request already finished".into()),
        }
    }

    /// Ends the body and waits briefly for the response status.
    async fn close(mut self) {
        self.tx = None;
        let Some(request) = self.request.take() else {
            return;
        };
        match tokio::time::timeout(self.io_timeout, request).await {
            Ok(Ok(Ok(status))) => tracing::debug!(url = %self.url, %status, "upload sink closed"),
            Ok(Ok(Err(e))) => tracing::debug!(url = %self.url, error = %e, "upload sink response failed"),
            Ok(Err(e)) => tracing::debug!(url = %self.url, error = %e, "upload sink task failed"),
            Err(_) => tracing::debug!(url = %self.url, "upload sink response timed out"),
        }
    }
}

impl Drop for HttpSink {
    fn drop(&mut self) {
        if let Some(request) = self.request.take() {
            request.abort();
        }
    }
}

/// Destination of upload chunks.
pub trait ChunkSink: Send {
    fn write(&mut self, chunk: Bytes) -> impl Future<Output = Result<(), TransferError>> + Send;

    /// Ends the transfer. Called once, on every exit path.
    fn close(self) -> impl Future<Output = ()> + Send;

    fn is_simulated(&self) -> bool {
        false
    }
}

/// Where upload bytes go.
pub enum UploadSink {
    Remote(HttpSink),
    /// Local no-op write; the session still runs its full loop.
    Simulated,
}

impl UploadSink {
    /// Opens `url` if one is configured, falling back to simulation when it
    /// cannot be opened. The fallback is announced once as an `info` event.
    pub async fn open<S: EventSink>(
        client: &reqwest::Client,
        url: Option<&str>,
        connect_timeout: Duration,
        io_timeout: Duration,
        emitter: &mut Emitter<S>,
    ) -> Self {
        let Some(url) = url.map(str::trim).filter(|u| !u.is_empty()) else {
            return UploadSink::Simulated;
        };

        match HttpSink::open(client, url, connect_timeout, io_timeout).await {
            Ok(sink) => {
                tracing::debug!(url, "upload sink opened");
                UploadSink::Remote(sink)
            }
            Err(e) => {
                tracing::warn!(url, error = %e, "upload sink unavailable, simulating");
                emitter.emit(Event::Info(Notice::simulate(e.to_string()))).await;
                UploadSink::Simulated
            }
        }
    }
}

impl ChunkSink for UploadSink {
    async fn write(&mut self, chunk: Bytes) -> Result<(), TransferError> {
        match self {
            UploadSink::Remote(sink) => sink.write(chunk).await,
            UploadSink::Simulated => {
                tokio::task::yield_now().await;
                Ok(())
            }
        }
    }

    async fn close(self) {
        if let UploadSink::Remote(sink) = self {
            sink.close().await;
        }
    }

    fn is_simulated(&self) -> bool {
        matches!(self, UploadSink::Simulated)
    }
}

pub struct UploadTest {
    plan: UploadPlan,
    payload: Bytes,
    interval: Duration,
}

impl UploadTest {
    pub fn new(plan: UploadPlan) -> Self {
        Self {
            plan,
            payload: random_payload(plan.chunk_bytes),
            interval: PROGRESS_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sends the planned bytes through `sink` until done or cancelled.
    ///
    /// A cancelled session ends without a `done` event.
    pub async fn run<W: ChunkSink, S: EventSink>(
        &self,
        mut sink: W,
        emitter: &mut Emitter<S>,
        cancel: &CancellationToken,
    ) -> SessionOutcome {
        let total = self.plan.total_bytes;
        let mut state = TransferState::new(Some(total)).with_interval(self.interval);
        tracing::info!(
            total,
            chunk = self.plan.chunk_bytes,
            simulated = sink.is_simulated(),
            "upload started"
        );

        while !cancel.is_cancelled() && state.bytes() < total {
            let len = (self.plan.chunk_bytes as u64).min(total - state.bytes()) as usize;

            if let Err(e) = sink.write(self.payload.slice(..len)).await {
                tracing::warn!(bytes = state.bytes(), error = %e, "upload write failed");
                sink.close().await;
                let message = e.to_string();
                emitter.emit(Event::Error(message.clone())).await;
                return SessionOutcome::Failed(message);
            }
            state.record(len as u64);

            if cancel.is_cancelled() {
                break;
            }

            if let Some(sample) = state.poll_progress() {
                emitter.emit(Event::Progress(sample)).await;
            }
        }

        sink.close().await;

        if cancel.is_cancelled() {
            tracing::info!(bytes = state.bytes(), "upload cancelled");
            return SessionOutcome::Cancelled;
        }

        let summary = state.summary();
        tracing::info!(bytes = summary.total_bytes, avg_mbps = summary.avg_mbps, "upload finished");
        emitter.emit(Event::Done(Completion::transfer(summary.clone()))).await;
        SessionOutcome::Completed(Some(summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_from_sizes() {
        let plan = UploadPlan::from_sizes(10, 128);
        assert_eq!(plan.total_bytes, 10 * 1024 * 1024);
        assert_eq!(plan.chunk_bytes, 128 * 1024);

        assert_eq!(UploadPlan::from_sizes(1, 0).chunk_bytes, 1024);
        assert_eq!(UploadPlan::new(10, 0).chunk_bytes, 1);
        assert_eq!(UploadPlan::from_sizes(u64::MAX, 128).total_bytes, u64::MAX);
    }

    #[test]
    fn payload_has_requested_length() {
        assert_eq!(random_payload(4096).len(), 4096);
    }

    #[tokio::test]
    async fn simulated_upload_reaches_total_exactly() {
        // 1000 bytes in 300-byte chunks ends with a short write.
        let test = UploadTest::new(UploadPlan::new(1_000, 300));
        let mut emitter = Emitter::new(Vec::new(), CancellationToken::new());
        let outcome = test
            .run(UploadSink::Simulated, &mut emitter, &CancellationToken::new())
            .await;

        let events = emitter.into_sink();
        let Some(Event::Done(done)) = events.last() else {
            panic!("expected done, got {events:?}");
        };
        let summary = done.transfer.clone().unwrap();
        assert_eq!(summary.total_bytes, 1_000);
        assert_eq!(summary.percent, 100.0);
        assert_eq!(outcome, SessionOutcome::Completed(Some(summary)));

        for event in &events {
            if let Event::Progress(sample) = event {
                assert!(sample.bytes <= 1_000);
            }
        }
    }

    /// Takes `delay` per write and cancels `cancel` during write `cancel_on`.
    struct PacedSink {
        delay: Duration,
        writes: usize,
        cancel_on: usize,
        cancel: CancellationToken,
    }

    impl ChunkSink for PacedSink {
        async fn write(&mut self, _chunk: Bytes) -> Result<(), TransferError> {
            tokio::time::sleep(self.delay).await;
            self.writes += 1;
            if self.writes == self.cancel_on {
                self.cancel.cancel();
            }
            Ok(())
        }

        async fn close(self) {}
    }

    #[tokio::test(start_paused = true)]
    async fn progress_is_spaced_and_stops_at_cancel() {
        let cancel = CancellationToken::new();
        let sink = PacedSink {
            delay: Duration::from_millis(40),
            writes: 0,
            cancel_on: 10,
            cancel: cancel.clone(),
        };
        let test = UploadTest::new(UploadPlan::new(1 << 30, 1024));
        let mut emitter = Emitter::new(Vec::new(), cancel.clone());

        let outcome = test.run(sink, &mut emitter, &cancel).await;
        assert_eq!(outcome, SessionOutcome::Cancelled);

        let events = emitter.into_sink();
        let samples: Vec<_> = events
            .iter()
            .map(|event| match event {
                Event::Progress(sample) => sample.clone(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();

        // Writes land every 40 ms; write 10 at 400 ms would be due for a
        // sample but observes the cancel first.
        let bytes: Vec<u64> = samples.iter().map(|s| s.bytes).collect();
        assert_eq!(bytes, vec![1024, 4 * 1024, 7 * 1024]);
        for pair in samples.windows(2) {
            assert!(pair[1].seconds - pair[0].seconds >= 0.1 - 1e-9, "{pair:?}");
        }
    }

    #[tokio::test]
    async fn cancel_before_start_sends_nothing() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let test = UploadTest::new(UploadPlan::new(1 << 20, 1 << 10));
        let mut emitter = Emitter::new(Vec::new(), cancel.clone());

        let outcome = test.run(UploadSink::Simulated, &mut emitter, &cancel).await;
        assert_eq!(outcome, SessionOutcome::Cancelled);
        assert!(emitter.into_sink().is_empty());
    }

    #[tokio::test]
    async fn no_sink_configured_means_silent_simulation() {
        let mut emitter = Emitter::new(Vec::new(), CancellationToken::new());
        let client = reqwest::Client::new();
        for url in [None, Some(""), Some("   ")] {
            let sink = UploadSink::open(
                &client,
                url,
                Duration::from_secs(1),
                Duration::from_secs(1),
                &mut emitter,
            )
            .await;
            assert!(sink.is_simulated());
        }
        assert!(emitter.into_sink().is_empty());
    }

    #[tokio::test]
    async fn unreachable_sink_falls_back_once() {
        let mut emitter = Emitter::new(Vec::new(), CancellationToken::new());
        let sink = UploadSink::open(
            &reqwest::Client::new(),
            Some("http://127.0.0.1:1/sink"),
            Duration::from_secs(2),
            Duration::from_secs(2),
            &mut emitter,
        )
        .await;

        assert!(sink.is_simulated());
        let events = emitter.into_sink();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], Event::Info(notice) if notice.is_fallback()));
    }

    #[tokio::test]
    async fn malformed_sink_url_falls_back() {
        let mut emitter = Emitter::new(Vec::new(), CancellationToken::new());
        let sink = UploadSink::open(
            &reqwest::Client::new(),
            Some("not a url"),
            Duration::from_secs(1),
            Duration::from_secs(1),
            &mut emitter,
        )
        .await;
        assert!(sink.is_simulated());
        assert_eq!(emitter.into_sink().len(), 1);
    }
}
