mod app;
mod cli;
mod ui;

use anyhow::Result;
use app::{poll_event, run_speed_test, App, AppAction, TestUpdate};
use clap::Parser;
use cli::Cli;
use crossterm::event::Event;
use livespeed::speedtest::{SpeedTest, TestPhase};
use ratatui::DefaultTerminal;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use ui::draw_ui;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = cli.options.settings();
    init_tracing(
        &settings.log_level,
        cli.options.log_file.as_deref(),
        cli.command.is_none(),
    )?;

    let engine = Arc::new(SpeedTest::new(settings)?);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "livespeed starting");

    if let Some(command) = cli.command {
        return cli::run(command, engine).await;
    }

    let mut terminal = ratatui::init();
    terminal.clear()?;

    let result = run_app(&mut terminal, engine).await;

    ratatui::restore();
    result
}

/// `RUST_LOG` wins over the configured level. The dashboard owns the
/// terminal, so it only logs when a file is given.
fn init_tracing(level: &str, log_file: Option<&Path>, dashboard: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        None if dashboard => {}
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(true)
                .compact()
                .init();
        }
    }
    Ok(())
}

async fn run_app(terminal: &mut DefaultTerminal, engine: Arc<SpeedTest>) -> Result<()> {
    let mut app = App::new(engine.settings().clone());
    let mut test_rx: Option<mpsc::Receiver<TestUpdate>> = None;

    loop {
        terminal.draw(|frame| draw_ui(frame, &app))?;

        // Drain test updates
        if let Some(rx) = test_rx.as_mut() {
            loop {
                match rx.try_recv() {
                    Ok(update) => app.apply(update),
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        if app.phase != TestPhase::Idle {
                            app.complete_test();
                        }
                        test_rx = None;
                        break;
                    }
                }
            }
        }

        // Handle input
        if let Some(Event::Key(key)) = poll_event(Duration::from_millis(30))? {
            if let Some(action) = app.handle_key_event(key) {
                match action {
                    AppAction::Quit => break,
                    AppAction::StartTest => {
                        let upload_id = app.reset_for_new_test();
                        app.phase = TestPhase::Ping;

                        let (tx, rx) = mpsc::channel(64);
                        let (cancel_tx, cancel_rx) = mpsc::channel(1);

                        app.set_cancel_tx(cancel_tx);
                        test_rx = Some(rx);

                        let engine = Arc::clone(&engine);
                        tokio::spawn(async move {
                            if let Err(e) = run_speed_test(engine, tx, cancel_rx, upload_id).await {
                                tracing::warn!(error = %e, "speed test run failed");
                            }
                        });
                    }
                    AppAction::CancelTest => {
                        app.cancel_test();
                        test_rx = None;
                    }
                }
            }
        }

        if app.should_quit {
            break;
        }
    }

    Ok(())
}
