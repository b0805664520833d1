use crate::app::App;
use livespeed::speedtest::TestPhase;
use ratatui::{
    layout::{Alignment, Constraint, Layout, Rect},
    style::{Color, Modifier, Style},
    symbols,
    text::{Line, Span},
    widgets::{Axis, Block, Borders, Chart, Dataset, GraphType, Paragraph},
    Frame,
};

const ACCENT: Color = Color::Rgb(100, 149, 237);
const SUCCESS: Color = Color::Rgb(134, 194, 156);
const SUCCESS_DIM: Color = Color::Rgb(80, 120, 90);
const INFO: Color = Color::Rgb(147, 180, 220);
const INFO_DIM: Color = Color::Rgb(90, 110, 140);
const WARN: Color = Color::Rgb(220, 180, 130);
const ERROR: Color = Color::Rgb(220, 120, 120);
const TEXT_PRIMARY: Color = Color::Rgb(230, 230, 230);
const TEXT_MUTED: Color = Color::Rgb(100, 100, 100);
const BORDER: Color = Color::Rgb(60, 60, 65);

pub fn draw_ui(frame: &mut Frame, app: &App) {
    let chunks = Layout::vertical([
        Constraint::Length(3),
        Constraint::Min(8),
        Constraint::Length(1),
        Constraint::Length(1),
    ])
    .split(frame.area());

    draw_header(frame, chunks[0], app);

    let panels = Layout::horizontal([
        Constraint::Ratio(1, 3),
        Constraint::Ratio(1, 3),
        Constraint::Ratio(1, 3),
    ])
    .split(chunks[1]);

    draw_transfer_panel(
        frame,
        panels[0],
        Transfer {
            title: "Download",
            color: SUCCESS,
            dim: SUCCESS_DIM,
            mbps: current_speed(app.result.download_mbps, &app.download_samples),
            progress: phase_progress(app, TestPhase::Download, app.download_progress),
            samples: &app.download_samples,
        },
    );
    draw_transfer_panel(
        frame,
        panels[1],
        Transfer {
            title: "Upload",
            color: INFO,
            dim: INFO_DIM,
            mbps: current_speed(app.result.upload_mbps, &app.upload_samples),
            progress: phase_progress(app, TestPhase::Upload, app.upload_progress),
            samples: &app.upload_samples,
        },
    );
    draw_ping_panel(frame, panels[2], app);

    draw_status_line(frame, chunks[2], app);
    draw_help(frame, chunks[3], app);
}

fn draw_header(frame: &mut Frame, area: Rect, app: &App) {
    let block = Block::default()
        .borders(Borders::BOTTOM)
        .border_style(Style::default().fg(BORDER));
    let inner = block.inner(area);
    frame.render_widget(block, area);

    let chunks = Layout::horizontal([Constraint::Length(12), Constraint::Min(10)]).split(inner);

    frame.render_widget(
        Paragraph::new("livespeed")
            .style(Style::default().fg(TEXT_PRIMARY).add_modifier(Modifier::BOLD)),
        chunks[0],
    );

    let (status, color) = match app.phase {
        TestPhase::Idle => ("Ready", TEXT_MUTED),
        TestPhase::Ping => ("Measuring latency...", WARN),
        TestPhase::Download => ("Testing download...", SUCCESS),
        TestPhase::Upload => ("Testing upload...", INFO),
        TestPhase::Complete => ("Complete", ACCENT),
    };
    frame.render_widget(
        Paragraph::new(status)
            .style(Style::default().fg(color))
            .alignment(Alignment::Center),
        chunks[1],
    );
}

struct Transfer<'a> {
    title: &'a str,
    color: Color,
    dim: Color,
    mbps: f64,
    /// `None` draws an indeterminate bar.
    progress: Option<f64>,
    samples: &'a [f64],
}

fn draw_transfer_panel(frame: &mut Frame, area: Rect, transfer: Transfer<'_>) {
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(BORDER))
        .title(Span::styled(
            format!(" {} ", transfer.title),
            Style::default().fg(transfer.color),
        ));
    let inner = block.inner(area);
    frame.render_widget(block, area);

    let chunks = Layout::vertical([
        Constraint::Length(2),
        Constraint::Length(1),
        Constraint::Min(3),
    ])
    .split(inner);

    frame.render_widget(
        Paragraph::new(format_speed(transfer.mbps))
            .style(Style::default().fg(TEXT_PRIMARY).add_modifier(Modifier::BOLD))
            .alignment(Alignment::Center),
        chunks[0],
    );
    draw_progress_bar(frame, chunks[1], transfer.progress, transfer.color, transfer.dim);
    draw_sparkline(frame, chunks[2], transfer.samples, transfer.color);
}

fn draw_ping_panel(frame: &mut Frame, area: Rect, app: &App) {
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(BORDER))
        .title(Span::styled(" Latency ", Style::default().fg(WARN)));
    let inner = block.inner(area);
    frame.render_widget(block, area);

    let chunks = Layout::vertical([
        Constraint::Length(2),
        Constraint::Length(1),
        Constraint::Min(3),
    ])
    .split(inner);

    let value = if app.result.ping_ms > 0.0 {
        format!("{:.0} ms", app.result.ping_ms)
    } else {
        "-".to_string()
    };
    frame.render_widget(
        Paragraph::new(value)
            .style(Style::default().fg(TEXT_PRIMARY).add_modifier(Modifier::BOLD))
            .alignment(Alignment::Center),
        chunks[0],
    );

    let lost = app.ping_results.iter().filter(|r| !r.ok).count();
    let detail = format!(
        "jitter {:.1} ms · {}/{} probes · {} lost",
        app.result.jitter_ms,
        app.ping_results.len(),
        app.settings.ping_count,
        lost
    );
    frame.render_widget(
        Paragraph::new(detail)
            .style(Style::default().fg(TEXT_MUTED))
            .alignment(Alignment::Center),
        chunks[1],
    );

    draw_sparkline(frame, chunks[2], &app.ping_samples, WARN);
}

fn draw_progress_bar(frame: &mut Frame, area: Rect, ratio: Option<f64>, color: Color, dim: Color) {
    if area.width < 4 {
        return;
    }

    let width = (area.width - 2) as usize;
    let bar = match ratio {
        Some(ratio) => {
            let filled = ((ratio.clamp(0.0, 1.0) * width as f64) as usize).min(width);
            vec![
                Span::styled("━".repeat(filled), Style::default().fg(color)),
                Span::styled("━".repeat(width - filled), Style::default().fg(dim)),
            ]
        }
        None => vec![Span::styled("╍".repeat(width), Style::default().fg(dim))],
    };

    let mut spans = vec![Span::raw(" ")];
    spans.extend(bar);
    frame.render_widget(Paragraph::new(Line::from(spans)), area);
}

fn draw_sparkline(frame: &mut Frame, area: Rect, data: &[f64], color: Color) {
    if data.is_empty() || area.width < 4 || area.height < 2 {
        return;
    }

    let (min_val, max_val) = data_range(data);
    let range = (max_val - min_val).max(1.0);
    let points: Vec<(f64, f64)> = data.iter().enumerate().map(|(i, &v)| (i as f64, v)).collect();

    let dataset = Dataset::default()
        .marker(symbols::Marker::Braille)
        .graph_type(GraphType::Line)
        .style(Style::default().fg(color))
        .data(&points);

    let chart = Chart::new(vec![dataset])
        .x_axis(Axis::default().bounds([0.0, data.len() as f64]))
        .y_axis(Axis::default().bounds([min_val - range * 0.1, max_val + range * 0.1]));

    frame.render_widget(chart, area);
}

fn draw_status_line(frame: &mut Frame, area: Rect, app: &App) {
    let line = match (&app.error, &app.notice) {
        (Some(error), _) => Span::styled(format!("error: {error}"), Style::default().fg(ERROR)),
        (None, Some(notice)) => Span::styled(notice.clone(), Style::default().fg(WARN)),
        (None, None) => Span::raw(""),
    };
    frame.render_widget(Paragraph::new(line).alignment(Alignment::Center), area);
}

fn draw_help(frame: &mut Frame, area: Rect, app: &App) {
    let help = if app.is_running() {
        "esc cancel · q quit"
    } else {
        "enter start · q quit"
    };
    frame.render_widget(
        Paragraph::new(help)
            .style(Style::default().fg(TEXT_MUTED))
            .alignment(Alignment::Center),
        area,
    );
}

fn current_speed(final_mbps: f64, samples: &[f64]) -> f64 {
    if final_mbps > 0.0 {
        final_mbps
    } else {
        samples.last().copied().unwrap_or(0.0)
    }
}

fn phase_progress(app: &App, phase: TestPhase, progress: Option<f64>) -> Option<f64> {
    let order = |p: TestPhase| match p {
        TestPhase::Idle => 0,
        TestPhase::Ping => 1,
        TestPhase::Download => 2,
        TestPhase::Upload => 3,
        TestPhase::Complete => 4,
    };
    match order(app.phase).cmp(&order(phase)) {
        std::cmp::Ordering::Less => Some(0.0),
        std::cmp::Ordering::Equal => progress,
        std::cmp::Ordering::Greater => Some(progress.unwrap_or(1.0)),
    }
}

fn data_range(data: &[f64]) -> (f64, f64) {
    let min = data.iter().cloned().fold(f64::MAX, f64::min);
    let max = data.iter().cloned().fold(f64::MIN, f64::max);
    (if min == f64::MAX { 0.0 } else { min }, if max == f64::MIN { 0.0 } else { max })
}

fn format_speed(mbps: f64) -> String {
    if mbps >= 1000.0 {
        format!("{:.1} Gbps", mbps / 1000.0)
    } else if mbps >= 1.0 {
        format!("{:.1} Mbps", mbps)
    } else if mbps > 0.0 {
        format!("{:.0} Kbps", mbps * 1000.0)
    } else {
        "-".to_string()
    }
}
