use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use livespeed::settings::{kib_to_bytes, mib_to_bytes, Settings};
use livespeed::speedtest::{Completion, Event, SessionOutcome, SpeedTest};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "livespeed", version, about = "Live network speed test")]
pub struct Cli {
    #[command(flatten)]
    pub options: Options,

    /// Runs one measurement and prints its events as JSON lines.
    /// Without a subcommand the interactive dashboard starts.
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Args)]
pub struct Options {
    /// Host, host:port or http(s) URL to probe.
    #[arg(long, global = true, env = "LIVESPEED_PING_TARGET")]
    pub ping_target: Option<String>,

    #[arg(long, global = true)]
    pub ping_count: Option<u32>,

    #[arg(long, global = true, env = "LIVESPEED_DOWNLOAD_URL")]
    pub download_url: Option<String>,

    /// Size of the default download, in MB.
    #[arg(long, global = true)]
    pub download_size_mb: Option<u64>,

    /// Remote upload sink. Uploads are simulated when unset.
    #[arg(long, global = true, env = "LIVESPEED_UPLOAD_URL")]
    pub upload_url: Option<String>,

    /// Planned upload size, in MiB.
    #[arg(long, global = true)]
    pub upload_size_mb: Option<u64>,

    #[arg(long, global = true)]
    pub chunk_kb: Option<usize>,

    #[arg(long, global = true, value_name = "MS")]
    pub connect_timeout_ms: Option<u64>,

    #[arg(long, global = true, env = "LIVESPEED_LOG")]
    pub log_level: Option<String>,

    /// Write logs here. The dashboard logs nothing without it.
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
}

impl Options {
    pub fn settings(&self) -> Settings {
        let mut settings = Settings::default();
        if let Some(target) = &self.ping_target {
            settings.ping_target = target.clone();
        }
        if let Some(count) = self.ping_count {
            settings.ping_count = count;
        }
        if self.download_url.is_some() {
            settings.download_url = self.download_url.clone();
        }
        if let Some(size) = self.download_size_mb {
            settings.download_size_mb = size;
        }
        if self.upload_url.is_some() {
            settings.upload_url = self.upload_url.clone();
        }
        if let Some(size) = self.upload_size_mb {
            settings.upload_size_mb = size;
        }
        if let Some(chunk) = self.chunk_kb {
            settings.chunk_kb = chunk;
        }
        if let Some(ms) = self.connect_timeout_ms {
            settings.connect_timeout_ms = ms;
        }
        if let Some(level) = &self.log_level {
            settings.log_level = level.clone();
        }
        settings
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Stream repeated latency probes.
    Ping {
        target: Option<String>,
        #[arg(long)]
        count: Option<u32>,
        #[arg(long)]
        interval_ms: Option<u64>,
    },
    /// Probe a target once.
    Probe {
        target: Option<String>,
        #[arg(long, default_value_t = 5_000)]
        timeout_ms: u64,
    },
    /// Stream a download.
    Download {
        url: Option<String>,
        /// Print only the final result.
        #[arg(long)]
        once: bool,
    },
    /// Stream an upload. Ctrl-C cancels it.
    Upload {
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        size_mb: Option<u64>,
        #[arg(long)]
        chunk_kb: Option<usize>,
        #[arg(long)]
        sink: Option<String>,
        /// Print only the final result.
        #[arg(long)]
        once: bool,
    },
}

fn upload_total(size_mb: u64) -> Result<u64> {
    match mib_to_bytes(size_mb) {
        Some(bytes) => Ok(bytes),
        None => bail!("--size-mb {size_mb} is too large"),
    }
}

fn print_event(event: &Event) -> Result<()> {
    println!("{}", serde_json::to_string(event)?);
    Ok(())
}

fn print_outcome(outcome: SessionOutcome) -> Result<()> {
    match outcome {
        SessionOutcome::Completed(summary) => print_event(&Event::Done(match summary {
            Some(summary) => Completion::transfer(summary),
            None => Completion::bare(),
        })),
        SessionOutcome::Cancelled => Ok(()),
        SessionOutcome::Failed(message) => {
            print_event(&Event::Error(message.clone()))?;
            bail!(message)
        }
    }
}

async fn stream(mut session: livespeed::speedtest::Session) -> Result<SessionOutcome> {
    while let Some(event) = session.next_event().await {
        print_event(&event)?;
    }
    let (_, outcome) = session.collect().await;
    Ok(outcome)
}

pub async fn run(command: Command, engine: Arc<SpeedTest>) -> Result<()> {
    let settings = engine.settings().clone();

    let outcome = match command {
        Command::Ping {
            target,
            count,
            interval_ms,
        } => {
            let target = target.unwrap_or_else(|| settings.ping_target.clone());
            let count = count.unwrap_or(settings.ping_count);
            let interval = interval_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| settings.ping_interval());
            stream(engine.probe_stream(&target, count, interval)).await?
        }
        Command::Probe { target, timeout_ms } => {
            let target = target.unwrap_or_else(|| settings.ping_target.clone());
            let result = engine
                .probe(&target, Duration::from_millis(timeout_ms))
                .await?;
            return print_event(&Event::Ping(result));
        }
        Command::Download { url, once } => {
            if once {
                return print_outcome(engine.download_once(url.as_deref()).await);
            }
            stream(engine.start_download(url.as_deref())).await?
        }
        Command::Upload {
            id,
            size_mb,
            chunk_kb,
            sink,
            once,
        } => {
            let total = match size_mb {
                Some(mb) => upload_total(mb)?,
                None => settings.upload_size_bytes(),
            };
            let chunk = chunk_kb
                .map(kib_to_bytes)
                .unwrap_or_else(|| settings.chunk_bytes());

            if once {
                return print_outcome(engine.upload_once(total, chunk, sink.as_deref()).await);
            }

            let id = id.unwrap_or_else(|| format!("cli-{}", std::process::id()));
            let interrupt = {
                let engine = Arc::clone(&engine);
                let id = id.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        let cancelled = engine.cancel(&id);
                        tracing::info!(session = %id, cancelled, "interrupt received");
                    }
                })
            };
            let outcome = stream(engine.start_upload(&id, total, chunk, sink.as_deref())).await;
            interrupt.abort();
            outcome?
        }
    };

    match outcome {
        SessionOutcome::Completed(_) => Ok(()),
        SessionOutcome::Cancelled => {
            tracing::info!("session cancelled");
            Ok(())
        }
        // The error event was already printed.
        SessionOutcome::Failed(message) => bail!(message),
    }
}
