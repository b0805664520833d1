pub mod download;
pub mod event;
pub mod ping;
pub mod registry;
pub mod throughput;
pub mod upload;

use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{ProbeError, TransferError};
use crate::settings::Settings;
use download::DownloadTest;
use event::{Emitter, OutcomeSink};
use ping::{PingTest, ProbeResult, ProbeTarget};
use registry::{CancelRegistry, SessionGuard};
use upload::{UploadPlan, UploadSink, UploadTest};

pub use event::{Completion, Event, EventSink, Notice};
pub use throughput::{ProgressSample, TransferSummary};

/// Timeout of the single-shot ping.
pub const SINGLE_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, Default)]
pub struct SpeedTestResult {
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub ping_ms: f64,
    pub jitter_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestPhase {
    Idle,
    Ping,
    Download,
    Upload,
    Complete,
}

/// How a session ended.
///
/// `Cancelled` sessions never emitted `done`; `Failed` ones ended with an
/// `error` event carrying the same message.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    /// Finished normally; transfers carry their final figures.
    Completed(Option<TransferSummary>),
    Cancelled,
    Failed(String),
}

impl SessionOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            SessionOutcome::Completed(_) => "completed",
            SessionOutcome::Cancelled => "cancelled",
            SessionOutcome::Failed(_) => "failed",
        }
    }
}

/// A running measurement: its ordered events plus the task driving it.
///
/// Dropping the session (or its event receiver) counts as the subscriber
/// going away, which cancels the driver at its next chunk boundary.
pub struct Session {
    events: mpsc::Receiver<Event>,
    task: JoinHandle<SessionOutcome>,
}

impl Session {
    fn spawn<F, Fut>(cancel: CancellationToken, run: F) -> Self
    where
        F: FnOnce(Emitter<mpsc::Sender<Event>>) -> Fut,
        Fut: Future<Output = SessionOutcome> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let task = tokio::spawn(run(Emitter::new(tx, cancel)));
        Self { events: rx, task }
    }

    pub async fn next_event(&mut self) -> Option<Event> {
        self.events.recv().await
    }

    /// Drains every remaining event, then waits for the driver.
    pub async fn collect(mut self) -> (Vec<Event>, SessionOutcome) {
        let mut events = Vec::new();
        while let Some(event) = self.events.recv().await {
            events.push(event);
        }
        let outcome = Self::join(self.task).await;
        (events, outcome)
    }

    pub fn into_parts(self) -> (mpsc::Receiver<Event>, JoinHandle<SessionOutcome>) {
        (self.events, self.task)
    }

    async fn join(task: JoinHandle<SessionOutcome>) -> SessionOutcome {
        match task.await {
            Ok(outcome) => outcome,
            Err(e) => SessionOutcome::Failed(format!("session task ended abnormally: {e}")),
        }
    }
}

impl Stream for Session {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        self.events.poll_recv(cx)
    }
}

/// Entry point for every measurement.
///
/// Owns the HTTP client and the cancellation registry shared by all upload
/// sessions it starts.
pub struct SpeedTest {
    client: reqwest::Client,
    registry: Arc<CancelRegistry>,
    settings: Settings,
}

impl SpeedTest {
    pub fn new(settings: Settings) -> Result<Self, TransferError> {
        let client = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout())
            .build()?;
        Ok(Self::with_registry(client, settings, Arc::new(CancelRegistry::new())))
    }

    pub fn with_registry(
        client: reqwest::Client,
        settings: Settings,
        registry: Arc<CancelRegistry>,
    ) -> Self {
        Self {
            client,
            registry,
            settings,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<CancelRegistry> {
        &self.registry
    }

    fn download_test(&self, url: Option<&str>) -> DownloadTest {
        let url = match url.map(str::trim) {
            Some(url) if !url.is_empty() => url.to_string(),
            _ => self.settings.download_url(),
        };
        DownloadTest::new(self.client.clone(), url, self.settings.read_chunk_bytes())
    }

    /// Streams a download of `url`, or of the configured URL.
    pub fn start_download(&self, url: Option<&str>) -> Session {
        let test = self.download_test(url);
        let cancel = CancellationToken::new();
        Session::spawn(cancel.clone(), move |mut emitter| async move {
            test.run(&mut emitter, &cancel).await
        })
    }

    /// Streams an upload of `total_bytes` in `chunk_bytes` writes.
    ///
    /// `id` is registered before this returns, so [`cancel`](Self::cancel)
    /// reaches the session immediately. An `id` that is still running is
    /// refused: the returned session holds a single `error` event. Without
    /// `sink_url` the configured sink is used; without either the upload is
    /// simulated.
    pub fn start_upload(
        &self,
        id: &str,
        total_bytes: u64,
        chunk_bytes: usize,
        sink_url: Option<&str>,
    ) -> Session {
        let Some(handle) = self.registry.try_register(id) else {
            let message = TransferError::SessionInUse(id.to_string()).to_string();
            tracing::warn!(session = id, "upload id already in use");
            return Session::spawn(CancellationToken::new(), move |mut emitter| async move {
                emitter.emit(Event::Error(message.clone())).await;
                SessionOutcome::Failed(message)
            });
        };
        let guard = SessionGuard::new(Arc::clone(&self.registry), handle);
        let cancel = guard.handle().token();

        let test = UploadTest::new(UploadPlan::new(total_bytes, chunk_bytes));
        let client = self.client.clone();
        let sink_url = sink_url
            .or_else(|| self.settings.upload_url())
            .map(str::to_string);
        let connect_timeout = self.settings.connect_timeout();
        let io_timeout = self.settings.io_timeout();
        let session = id.to_string();

        Session::spawn(cancel.clone(), move |mut emitter| async move {
            let sink = UploadSink::open(
                &client,
                sink_url.as_deref(),
                connect_timeout,
                io_timeout,
                &mut emitter,
            )
            .await;
            let outcome = test.run(sink, &mut emitter, &cancel).await;
            // Release the id before the event stream closes.
            drop(guard);
            tracing::debug!(session = %session, outcome = outcome.label(), "upload session ended");
            outcome
        })
    }

    /// Asks a running upload to stop. `false` if `id` is unknown or done.
    pub fn cancel(&self, id: &str) -> bool {
        self.registry.cancel(id)
    }

    pub async fn probe(&self, target: &str, timeout: Duration) -> Result<ProbeResult, ProbeError> {
        let target: ProbeTarget = target.parse()?;
        PingTest::new(self.client.clone())
            .probe_once(&target, 1, timeout)
            .await
    }

    /// Streams `count` probes of `target`, `interval` apart.
    pub fn probe_stream(&self, target: &str, count: u32, interval: Duration) -> Session {
        let prober = PingTest::new(self.client.clone());
        let target = target.to_string();
        let timeout = self.settings.probe_timeout();
        Session::spawn(CancellationToken::new(), move |mut emitter| async move {
            match target.parse::<ProbeTarget>() {
                Ok(target) => {
                    prober
                        .run(&target, count, interval, timeout, &mut emitter)
                        .await
                }
                Err(e) => {
                    let message = e.to_string();
                    emitter.emit(Event::Error(message.clone())).await;
                    SessionOutcome::Failed(message)
                }
            }
        })
    }

    /// One probe of the configured target.
    pub async fn ping_once(&self) -> Result<ProbeResult, ProbeError> {
        self.probe(&self.settings.ping_target, SINGLE_PROBE_TIMEOUT)
            .await
    }

    /// Download without live events; runs inline on the caller's task.
    pub async fn download_once(&self, url: Option<&str>) -> SessionOutcome {
        let test = self.download_test(url);
        let cancel = CancellationToken::new();
        let mut emitter = Emitter::new(OutcomeSink::default(), cancel.clone());
        test.run(&mut emitter, &cancel).await
    }

    /// Upload without live events or a registry entry.
    pub async fn upload_once(
        &self,
        total_bytes: u64,
        chunk_bytes: usize,
        sink_url: Option<&str>,
    ) -> SessionOutcome {
        let test = UploadTest::new(UploadPlan::new(total_bytes, chunk_bytes));
        let cancel = CancellationToken::new();
        let mut emitter = Emitter::new(OutcomeSink::default(), cancel.clone());
        let sink = UploadSink::open(
            &self.client,
            sink_url.or_else(|| self.settings.upload_url()),
            self.settings.connect_timeout(),
            self.settings.io_timeout(),
            &mut emitter,
        )
        .await;
        test.run(sink, &mut emitter, &cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn engine() -> SpeedTest {
        SpeedTest::new(Settings::default()).unwrap()
    }

    #[tokio::test]
    async fn session_is_a_stream_of_events() {
        let engine = engine();
        let mut session = engine.start_upload("stream", 64 * 1024, 16 * 1024, None);

        let mut names = Vec::new();
        while let Some(event) = session.next().await {
            names.push(event.name());
        }
        assert_eq!(names.last(), Some(&"done"));
        assert!(!names.contains(&"info"));
        assert!(engine.registry().is_empty());
    }

    #[tokio::test]
    async fn duplicate_live_upload_id_is_refused() {
        let engine = engine();
        let running = engine.start_upload("dup", 1 << 40, 64 * 1024, None);

        let (events, outcome) = engine
            .start_upload("dup", 1024, 1024, None)
            .collect()
            .await;
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], Event::Error(message) if message.contains("dup")));
        assert!(matches!(outcome, SessionOutcome::Failed(_)));

        // The first session still owns the id.
        assert!(engine.cancel("dup"));
        let (_, outcome) = running.collect().await;
        assert_eq!(outcome, SessionOutcome::Cancelled);
        assert!(engine.registry().is_empty());

        let (_, outcome) = engine.start_upload("dup", 1024, 1024, None).collect().await;
        assert!(matches!(outcome, SessionOutcome::Completed(_)));
    }

    #[tokio::test]
    async fn upload_once_skips_registry() {
        let engine = engine();
        let outcome = engine.upload_once(300_000, 100_000, None).await;
        let SessionOutcome::Completed(Some(summary)) = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert_eq!(summary.total_bytes, 300_000);
        assert!(engine.registry().is_empty());
    }

    #[tokio::test]
    async fn bad_probe_target_ends_with_error() {
        let engine = engine();
        let (events, outcome) = engine
            .probe_stream("host:port", 3, Duration::from_millis(10))
            .collect()
            .await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Event::Error(_)));
        assert!(matches!(outcome, SessionOutcome::Failed(_)));
    }

    #[test]
    fn outcome_labels() {
        assert_eq!(SessionOutcome::Cancelled.label(), "cancelled");
        assert_eq!(SessionOutcome::Completed(None).label(), "completed");
        assert_eq!(SessionOutcome::Failed("x".into()).label(), "failed");
    }
}
