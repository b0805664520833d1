use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;

use super::event::{Completion, Emitter, Event, EventSink};
use super::SessionOutcome;
use crate::error::ProbeError;

/// Port used for bare host targets.
pub const DEFAULT_PROBE_PORT: u16 = 443;

/// Something a latency probe can be aimed at.
///
/// `http://` and `https://` targets are probed with a `GET`; anything else is
/// treated as `host[:port]` and probed with a TCP connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeTarget {
    Http(reqwest::Url),
    Tcp { host: String, port: u16 },
}

impl FromStr for ProbeTarget {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ProbeError::InvalidTarget("empty target".into()));
        }

        if s.starts_with("http://") || s.starts_with("https://") {
            let url = reqwest::Url::parse(s)
                .map_err(|e| ProbeError::InvalidTarget(format!("{s}: {e}")))?;
            return Ok(ProbeTarget::Http(url));
        }

        // Bracketed IPv6 with optional port, e.g. [::1]:53
        if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| ProbeError::InvalidTarget(s.to_string()))?;
            let port = match tail.strip_prefix(':') {
                Some(port) => parse_port(s, port)?,
                None if tail.is_empty() => DEFAULT_PROBE_PORT,
                None => return Err(ProbeError::InvalidTarget(s.to_string())),
            };
            return Ok(ProbeTarget::Tcp {
                host: host.to_string(),
                port,
            });
        }

        match s.rsplit_once(':') {
            // A bare IPv6 address has several colons and no port.
            Some((host, port)) if !host.contains(':') => Ok(ProbeTarget::Tcp {
                host: host.to_string(),
                port: parse_port(s, port)?,
            }),
            _ => Ok(ProbeTarget::Tcp {
                host: s.to_string(),
                port: DEFAULT_PROBE_PORT,
            }),
        }
    }
}

fn parse_port(target: &str, port: &str) -> Result<u16, ProbeError> {
    port.parse()
        .map_err(|_| ProbeError::InvalidTarget(format!("{target}: bad port {port:?}")))
}

impl fmt::Display for ProbeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeTarget::Http(url) => write!(f, "{url}"),
            ProbeTarget::Tcp { host, port } if host.contains(':') => write!(f, "[{host}]:{port}"),
            ProbeTarget::Tcp { host, port } => write!(f, "{host}:{port}"),
        }
    }
}

/// Outcome of one probe tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub seq: u32,
    pub ok: bool,
    pub latency_ms: u64,
}

pub struct PingTest {
    client: reqwest::Client,
}

impl PingTest {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Probes `target` once.
    ///
    /// Unreachable or slow hosts give `ok == false`; only a target that
    /// cannot be resolved or requested at all is an error.
    pub async fn probe_once(
        &self,
        target: &ProbeTarget,
        seq: u32,
        timeout: Duration,
    ) -> Result<ProbeResult, ProbeError> {
        let (ok, latency) = match target {
            ProbeTarget::Http(url) => self.probe_http(url, timeout).await?,
            ProbeTarget::Tcp { host, port } => probe_tcp(host, *port, timeout).await?,
        };

        let result = ProbeResult {
            seq,
            ok,
            latency_ms: latency.as_millis() as u64,
        };
        tracing::trace!(probe = %target, seq, ok, latency_ms = result.latency_ms, "probe");
        Ok(result)
    }

    async fn probe_http(
        &self,
        url: &reqwest::Url,
        timeout: Duration,
    ) -> Result<(bool, Duration), ProbeError> {
        let start = Instant::now();
        match self.client.get(url.clone()).timeout(timeout).send().await {
            Ok(_) => Ok((true, start.elapsed())),
            Err(e) if e.is_builder() => Err(ProbeError::Client(e)),
            Err(_) => Ok((false, start.elapsed())),
        }
    }

    /// Runs `count` probes one after another with `interval` between them,
    /// emitting one `ping` event per probe and a bare `done` at the end.
    ///
    /// Stops early, without `done`, once the subscriber disconnects.
    pub async fn run<S: EventSink>(
        &self,
        target: &ProbeTarget,
        count: u32,
        interval: Duration,
        timeout: Duration,
        emitter: &mut Emitter<S>,
    ) -> SessionOutcome {
        tracing::info!(probe = %target, count, ?interval, "probe stream started");

        for seq in 1..=count {
            let result = match self.probe_once(target, seq, timeout).await {
                Ok(result) => result,
                Err(e) => {
                    tracing::warn!(probe = %target, error = %e, "probe stream failed");
                    let message = e.to_string();
                    emitter.emit(Event::Error(message.clone())).await;
                    return SessionOutcome::Failed(message);
                }
            };

            if !emitter.emit(Event::Ping(result)).await {
                return SessionOutcome::Cancelled;
            }

            if seq < count {
                tokio::time::sleep(interval).await;
            }
        }

        emitter.emit(Event::Done(Completion::bare())).await;
        tracing::info!(probe = %target, count, "probe stream finished");
        SessionOutcome::Completed(None)
    }
}

async fn probe_tcp(host: &str, port: u16, timeout: Duration) -> Result<(bool, Duration), ProbeError> {
    let addr = tokio::net::lookup_host((host, port))
        .await
        .map_err(|source| ProbeError::Resolve {
            host: host.to_string(),
            source,
        })?
        .next()
        .ok_or_else(|| ProbeError::NoAddress(host.to_string()))?;

    let start = Instant::now();
    let ok = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_stream)) => true,
        // A refusal still proves the host answered.
        Ok(Err(e)) => e.kind() == std::io::ErrorKind::ConnectionRefused,
        Err(_) => false,
    };
    Ok((ok, start.elapsed()))
}

/// Average latency and jitter over the successful probes.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PingStats {
    pub avg_ms: f64,
    pub jitter_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub sent: usize,
    pub received: usize,
}

impl PingStats {
    pub fn from_results(results: &[ProbeResult]) -> Self {
        let samples: Vec<f64> = results
            .iter()
            .filter(|r| r.ok)
            .map(|r| r.latency_ms as f64)
            .collect();

        if samples.is_empty() {
            return PingStats {
                sent: results.len(),
                ..Default::default()
            };
        }

        let avg = samples.iter().sum::<f64>() / samples.len() as f64;
        let jitter = if samples.len() > 1 {
            let variance: f64 = samples.iter().map(|&x| (x - avg).powi(2)).sum::<f64>()
                / (samples.len() - 1) as f64;
            variance.sqrt()
        } else {
            0.0
        };

        PingStats {
            avg_ms: avg,
            jitter_ms: jitter,
            min_ms: samples.iter().cloned().fold(f64::MAX, f64::min),
            max_ms: samples.iter().cloned().fold(f64::MIN, f64::max),
            sent: results.len(),
            received: samples.len(),
        }
    }
}
