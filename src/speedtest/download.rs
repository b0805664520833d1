use futures::stream::{BoxStream, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

use super::event::{Completion, Emitter, Event, EventSink};
use super::throughput::{TransferState, PROGRESS_INTERVAL};
use super::SessionOutcome;
use crate::error::TransferError;

/// Smallest read buffer the driver will use.
pub const MIN_READ_CHUNK: usize = 64 * 1024;

type BodyReader = StreamReader<BoxStream<'static, std::io::Result<bytes::Bytes>>, bytes::Bytes>;

pub struct DownloadTest {
    client: reqwest::Client,
    url: String,
    chunk_size: usize,
    interval: Duration,
}

impl DownloadTest {
    pub fn new(client: reqwest::Client, url: impl Into<String>, chunk_size: usize) -> Self {
        Self {
            client,
            url: url.into(),
            chunk_size: chunk_size.max(MIN_READ_CHUNK),
            interval: PROGRESS_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Opens the remote resource and returns its body with the advertised
    /// length, if any.
    async fn open(&self) -> Result<(BodyReader, Option<u64>), TransferError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?;
        let total = response.content_length().filter(|&len| len > 0);
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other))
            .boxed();
        Ok((StreamReader::new(body), total))
    }

    pub async fn run<S: EventSink>(
        &self,
        emitter: &mut Emitter<S>,
        cancel: &CancellationToken,
    ) -> SessionOutcome {
        tracing::info!(url = %self.url, "download started");
        let (reader, total) = match self.open().await {
            Ok(opened) => opened,
            Err(e) => {
                tracing::warn!(url = %self.url, error = %e, "download failed to open");
                let message = e.to_string();
                emitter.emit(Event::Error(message.clone())).await;
                return SessionOutcome::Failed(message);
            }
        };

        let outcome = drive_download(reader, total, self.chunk_size, self.interval, emitter, cancel).await;
        tracing::info!(url = %self.url, outcome = outcome.label(), "download finished");
        outcome
    }
}

/// Reads `reader` to the end, reporting progress through `emitter`.
///
/// The reader is consumed and dropped before this returns, on every path.
pub async fn drive_download<R, S>(
    mut reader: R,
    total: Option<u64>,
    chunk_size: usize,
    interval: Duration,
    emitter: &mut Emitter<S>,
    cancel: &CancellationToken,
) -> SessionOutcome
where
    R: AsyncRead + Unpin,
    S: EventSink,
{
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut state = TransferState::new(total).with_interval(interval);

    loop {
        if cancel.is_cancelled() {
            tracing::debug!(bytes = state.bytes(), "download cancelled");
            return SessionOutcome::Cancelled;
        }

        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                let message = e.to_string();
                emitter.emit(Event::Error(message.clone())).await;
                return SessionOutcome::Failed(message);
            }
        };

        state.record(n as u64);
        tracing::trace!(chunk = n, bytes = state.bytes(), "download chunk");

        if let Some(sample) = state.poll_progress() {
            emitter.emit(Event::Progress(sample)).await;
        }
    }
    drop(reader);

    let summary = state.summary();
    emitter.emit(Event::Done(Completion::transfer(summary.clone()))).await;
    SessionOutcome::Completed(Some(summary))
}
