//! Events pushed to a session's subscriber and the sinks that carry them.

use serde::Serialize;
use std::future::Future;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::ping::ProbeResult;
use super::throughput::{ProgressSample, TransferSummary};

/// One message in a session's event sequence.
///
/// Serialized adjacently tagged, e.g.
/// `{"event":"progress","data":{"bytes":1024,"avgMbps":8.19,...}}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum Event {
    Progress(ProgressSample),
    Ping(ProbeResult),
    Info(Notice),
    Done(Completion),
    Error(String),
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Progress(_) => "progress",
            Event::Ping(_) => "ping",
            Event::Info(_) => "info",
            Event::Done(_) => "done",
            Event::Error(_) => "error",
        }
    }

    /// `done` and `error` end a sequence.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::Done(_) | Event::Error(_))
    }
}

/// Informational notice that does not change the session's outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Notice {
    /// The remote upload sink could not be opened; bytes are simulated.
    Fallback { fallback: String, reason: String },
    Message { message: String },
}

impl Notice {
    pub fn simulate(reason: impl Into<String>) -> Self {
        Notice::Fallback {
            fallback: "simulate".to_string(),
            reason: reason.into(),
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Notice::Fallback { .. })
    }
}

/// Payload of the terminal `done` event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Completion {
    done: bool,
    #[serde(flatten)]
    pub transfer: Option<TransferSummary>,
}

impl Completion {
    /// Completion of a sequence with no transfer figures (probe streams).
    pub fn bare() -> Self {
        Self {
            done: true,
            transfer: None,
        }
    }

    pub fn transfer(summary: TransferSummary) -> Self {
        Self {
            done: true,
            transfer: Some(summary),
        }
    }
}

/// The subscriber went away; further deliveries are pointless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("event subscriber disconnected")]
pub struct Disconnected;

/// Delivers events to a subscriber, one at a time and in order.
pub trait EventSink: Send {
    fn deliver(&mut self, event: Event) -> impl Future<Output = Result<(), Disconnected>> + Send;
}

impl EventSink for mpsc::Sender<Event> {
    async fn deliver(&mut self, event: Event) -> Result<(), Disconnected> {
        self.send(event).await.map_err(|_| Disconnected)
    }
}

impl<S: EventSink> EventSink for &mut S {
    fn deliver(&mut self, event: Event) -> impl Future<Output = Result<(), Disconnected>> + Send {
        (**self).deliver(event)
    }
}

/// Buffers every event; used by single-shot callers and tests.
impl EventSink for Vec<Event> {
    async fn deliver(&mut self, event: Event) -> Result<(), Disconnected> {
        self.push(event);
        Ok(())
    }
}

/// Keeps everything except progress samples.
///
/// Single-shot operations only care about the outcome, so the driver's
/// live samples are dropped on the floor.
#[derive(Debug, Default)]
pub struct OutcomeSink {
    pub events: Vec<Event>,
}

impl EventSink for OutcomeSink {
    async fn deliver(&mut self, event: Event) -> Result<(), Disconnected> {
        if !matches!(event, Event::Progress(_)) {
            self.events.push(event);
        }
        Ok(())
    }
}

/// Wraps a sink with the session's delivery rules.
///
/// A failed delivery cancels the session's token, so a driver whose
/// subscriber vanished stops at the next chunk boundary. Nothing is
/// delivered after the first terminal event.
pub struct Emitter<S> {
    sink: S,
    cancel: CancellationToken,
    disconnected: bool,
    terminated: bool,
}

impl<S: EventSink> Emitter<S> {
    pub fn new(sink: S, cancel: CancellationToken) -> Self {
        Self {
            sink,
            cancel,
            disconnected: false,
            terminated: false,
        }
    }

    /// Returns whether the event reached the subscriber.
    pub async fn emit(&mut self, event: Event) -> bool {
        if self.disconnected || self.terminated {
            return false;
        }
        let terminal = event.is_terminal();
        let name = event.name();
        match self.sink.deliver(event).await {
            Ok(()) => {
                self.terminated = terminal;
                true
            }
            Err(Disconnected) => {
                tracing::debug!(event = name, "subscriber gone; cancelling session");
                self.disconnected = true;
                self.cancel.cancel();
                false
            }
        }
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    pub fn into_sink(self) -> S {
        self.sink
    }
}
