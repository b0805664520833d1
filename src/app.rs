use anyhow::Result;
use crossterm::event::{self, Event as TermEvent, KeyCode, KeyEventKind};
use livespeed::settings::Settings;
use livespeed::speedtest::ping::{PingStats, ProbeResult};
use livespeed::speedtest::{Event, Session, SessionOutcome, SpeedTest, SpeedTestResult, TestPhase};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const MAX_SAMPLES: usize = 200;

pub struct App {
    pub phase: TestPhase,
    pub result: SpeedTestResult,
    pub should_quit: bool,
    pub settings: Settings,

    /// Fraction complete, `None` while the total is unknown.
    pub download_progress: Option<f64>,
    pub upload_progress: Option<f64>,

    // Speed samples for charts
    pub download_samples: Vec<f64>,
    pub upload_samples: Vec<f64>,
    pub ping_samples: Vec<f64>,
    pub ping_results: Vec<ProbeResult>,

    pub notice: Option<String>,
    pub error: Option<String>,

    runs: u64,
    cancel_tx: Option<mpsc::Sender<()>>,
}

impl App {
    pub fn new(settings: Settings) -> Self {
        Self {
            phase: TestPhase::Idle,
            result: SpeedTestResult::default(),
            should_quit: false,
            settings,
            download_progress: None,
            upload_progress: None,
            download_samples: Vec::new(),
            upload_samples: Vec::new(),
            ping_samples: Vec::new(),
            ping_results: Vec::new(),
            notice: None,
            error: None,
            runs: 0,
            cancel_tx: None,
        }
    }

    pub fn is_running(&self) -> bool {
        !matches!(self.phase, TestPhase::Idle | TestPhase::Complete)
    }

    pub fn handle_key_event(&mut self, key: event::KeyEvent) -> Option<AppAction> {
        if key.kind != KeyEventKind::Press {
            return None;
        }

        match key.code {
            KeyCode::Char('q') => {
                self.should_quit = true;
                Some(AppAction::Quit)
            }
            KeyCode::Enter if !self.is_running() => Some(AppAction::StartTest),
            KeyCode::Esc if self.is_running() => Some(AppAction::CancelTest),
            _ => None,
        }
    }

    /// Clears the previous run and returns the upload session id for the next.
    pub fn reset_for_new_test(&mut self) -> String {
        self.phase = TestPhase::Idle;
        self.result = SpeedTestResult::default();
        self.download_progress = None;
        self.upload_progress = None;
        self.download_samples.clear();
        self.upload_samples.clear();
        self.ping_samples.clear();
        self.ping_results.clear();
        self.notice = None;
        self.error = None;
        self.runs += 1;
        format!("dashboard-{}-{}", std::process::id(), self.runs)
    }

    pub fn apply(&mut self, update: TestUpdate) {
        match update {
            TestUpdate::Phase(phase) => self.phase = phase,
            TestUpdate::Event(event) => self.apply_event(event),
            TestUpdate::Outcome(phase, outcome) => match outcome {
                SessionOutcome::Completed(_) if phase == TestPhase::Upload => self.complete_test(),
                SessionOutcome::Completed(_) => {}
                SessionOutcome::Cancelled => self.phase = TestPhase::Idle,
                SessionOutcome::Failed(message) => {
                    self.error = Some(message);
                    self.complete_test();
                }
            },
        }
    }

    fn apply_event(&mut self, event: Event) {
        match event {
            Event::Ping(result) => {
                if result.ok {
                    push_sample(&mut self.ping_samples, result.latency_ms as f64);
                }
                self.ping_results.push(result);
                let stats = PingStats::from_results(&self.ping_results);
                self.result.ping_ms = stats.avg_ms;
                self.result.jitter_ms = stats.jitter_ms;
            }
            Event::Progress(sample) => {
                let fraction = (sample.percent >= 0.0).then(|| sample.percent / 100.0);
                match self.phase {
                    TestPhase::Download => {
                        self.download_progress = fraction;
                        push_sample(&mut self.download_samples, sample.current_mbps);
                    }
                    TestPhase::Upload => {
                        self.upload_progress = fraction;
                        push_sample(&mut self.upload_samples, sample.current_mbps);
                    }
                    _ => {}
                }
            }
            Event::Done(completion) => {
                let Some(summary) = completion.transfer else {
                    return;
                };
                match self.phase {
                    TestPhase::Download => {
                        self.result.download_mbps = summary.avg_mbps;
                        self.download_progress = Some(1.0);
                    }
                    TestPhase::Upload => {
                        self.result.upload_mbps = summary.avg_mbps;
                        self.upload_progress = Some(1.0);
                    }
                    _ => {}
                }
            }
            Event::Info(notice) => {
                if notice.is_fallback() {
                    self.notice = Some("upload sink unreachable, simulating upload".to_string());
                }
            }
            Event::Error(message) => self.error = Some(message),
        }
    }

    pub fn complete_test(&mut self) {
        self.phase = TestPhase::Complete;
        self.cancel_tx = None;
    }

    pub fn set_cancel_tx(&mut self, tx: mpsc::Sender<()>) {
        self.cancel_tx = Some(tx);
    }

    pub fn cancel_test(&mut self) {
        if let Some(tx) = self.cancel_tx.take() {
            let _ = tx.try_send(());
        }
        self.phase = TestPhase::Idle;
    }
}

fn push_sample(samples: &mut Vec<f64>, value: f64) {
    samples.push(value);
    if samples.len() > MAX_SAMPLES {
        samples.remove(0);
    }
}

#[derive(Debug, Clone, Copy)]
pub enum AppAction {
    Quit,
    StartTest,
    CancelTest,
}

pub enum TestUpdate {
    Phase(TestPhase),
    Event(Event),
    Outcome(TestPhase, SessionOutcome),
}

/// Forwards one session's events until it ends or the user cancels.
///
/// Returns whether the run should go on to the next phase.
async fn forward(
    phase: TestPhase,
    mut session: Session,
    update_tx: &mpsc::Sender<TestUpdate>,
    cancel_rx: &mut mpsc::Receiver<()>,
    on_cancel: impl FnOnce(),
) -> bool {
    let _ = update_tx.send(TestUpdate::Phase(phase)).await;

    loop {
        tokio::select! {
            event = session.next_event() => match event {
                Some(event) => {
                    let _ = update_tx.send(TestUpdate::Event(event)).await;
                }
                None => break,
            },
            _ = cancel_rx.recv() => {
                on_cancel();
                // Dropping the session stops drivers that are not registered.
                return false;
            }
        }
    }

    let (_, outcome) = session.collect().await;
    let proceed = matches!(outcome, SessionOutcome::Completed(_));
    let _ = update_tx.send(TestUpdate::Outcome(phase, outcome)).await;
    proceed
}

/// Runs latency, download and upload one after another.
pub async fn run_speed_test(
    engine: Arc<SpeedTest>,
    update_tx: mpsc::Sender<TestUpdate>,
    mut cancel_rx: mpsc::Receiver<()>,
    upload_id: String,
) -> Result<()> {
    let settings = engine.settings().clone();

    let ping = engine.probe_stream(
        &settings.ping_target,
        settings.ping_count,
        settings.ping_interval(),
    );
    if !forward(TestPhase::Ping, ping, &update_tx, &mut cancel_rx, || {}).await {
        return Ok(());
    }

    let download = engine.start_download(None);
    if !forward(TestPhase::Download, download, &update_tx, &mut cancel_rx, || {}).await {
        return Ok(());
    }

    let upload = engine.start_upload(
        &upload_id,
        settings.upload_size_bytes(),
        settings.chunk_bytes(),
        None,
    );
    forward(TestPhase::Upload, upload, &update_tx, &mut cancel_rx, || {
        engine.cancel(&upload_id);
    })
    .await;

    Ok(())
}

pub fn poll_event(timeout: Duration) -> Result<Option<TermEvent>> {
    if event::poll(timeout)? {
        Ok(Some(event::read()?))
    } else {
        Ok(None)
    }
}
