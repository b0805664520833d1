use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use livespeed::settings::Settings;
use livespeed::speedtest::{Event, SessionOutcome, SpeedTest};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const UNREACHABLE_SINK: &str = "http://127.0.0.1:1/sink";

fn engine() -> SpeedTest {
    SpeedTest::new(Settings::default()).unwrap()
}

async fn read_head(stream: &mut TcpStream) -> bool {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return false,
            Ok(n) => head.extend_from_slice(&buf[..n]),
        }
    }
    true
}

/// Answers every request with `size` zero bytes. Without `advertise` the
/// body is delimited by closing the connection.
async fn serve_body(size: usize, advertise: bool) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                if !read_head(&mut stream).await {
                    return;
                }
                let header = if advertise {
                    format!("HTTP/1.1 200 OK\r\nContent-Length: {size}\r\nConnection: close\r\n\r\n")
                } else {
                    "HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n".to_string()
                };
                if stream.write_all(header.as_bytes()).await.is_err() {
                    return;
                }
                let chunk = vec![0u8; 64 * 1024];
                let mut left = size;
                while left > 0 {
                    let n = left.min(chunk.len());
                    if stream.write_all(&chunk[..n]).await.is_err() {
                        return;
                    }
                    left -= n;
                }
                let _ = stream.shutdown().await;
            });
        }
    });
    format!("http://{addr}/100MB.zip")
}

/// Accepts TCP connections and drops them at once, so any TLS handshake
/// fails.
async fn accept_and_close() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            drop(stream);
        }
    });
    format!("https://{addr}/api/speedtest/sink")
}

/// Accepts chunked uploads and counts the raw bytes received.
async fn serve_sink() -> (String, Arc<AtomicU64>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let received = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&received);
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let counter = Arc::clone(&counter);
            tokio::spawn(async move {
                let mut buf = vec![0u8; 64 * 1024];
                let mut tail: Vec<u8> = Vec::new();
                loop {
                    let n = match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    counter.fetch_add(n as u64, Ordering::SeqCst);
                    tail.extend_from_slice(&buf[..n]);
                    if tail.len() > 8 {
                        tail.drain(..tail.len() - 8);
                    }
                    if tail.ends_with(b"0\r\n\r\n") {
                        break;
                    }
                }
                let _ = stream
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                    .await;
            });
        }
    });
    (format!("http://{addr}/api/speedtest/sink"), received)
}

fn progress_bytes(events: &[Event]) -> Vec<u64> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::Progress(sample) => Some(sample.bytes),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn download_with_advertised_length() {
    let size = 3 * 1024 * 1024;
    let url = serve_body(size, true).await;
    let (events, outcome) = engine().start_download(Some(&url)).collect().await;

    let bytes = progress_bytes(&events);
    assert!(!bytes.is_empty());
    assert!(bytes.windows(2).all(|w| w[0] <= w[1]));
    assert!(bytes.iter().all(|&b| b <= size as u64));

    let Some(Event::Done(done)) = events.last() else {
        panic!("expected done, got {:?}", events.last());
    };
    let summary = done.transfer.clone().unwrap();
    assert_eq!(summary.total_bytes, size as u64);
    assert_eq!(summary.percent, 100.0);
    assert_eq!(outcome, SessionOutcome::Completed(Some(summary)));
}

#[tokio::test]
async fn download_without_length_reports_unknown_percent() {
    let url = serve_body(512 * 1024, false).await;
    let (events, _) = engine().start_download(Some(&url)).collect().await;

    let json = serde_json::to_value(events.last().unwrap()).unwrap();
    assert_eq!(json["event"], "done");
    assert_eq!(json["data"]["totalBytes"], 512 * 1024);
    assert_eq!(json["data"]["percent"], -1.0);
}

#[tokio::test]
async fn download_connect_failure_is_an_error_event() {
    let (events, outcome) = engine()
        .start_download(Some("http://127.0.0.1:1/100MB.zip"))
        .collect()
        .await;

    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], Event::Error(_)));
    assert!(matches!(outcome, SessionOutcome::Failed(_)));
}

#[tokio::test]
async fn upload_to_unreachable_sink_is_simulated() {
    let engine = engine();
    let (events, outcome) = engine
        .start_upload("u1", 1_048_576, 131_072, Some(UNREACHABLE_SINK))
        .collect()
        .await;

    assert!(matches!(&events[0], Event::Info(notice) if notice.is_fallback()));
    assert_eq!(events.iter().filter(|e| e.name() == "info").count(), 1);
    assert_eq!(events.iter().filter(|e| e.name() == "done").count(), 1);
    assert!(events.iter().all(|e| e.name() != "error"));

    // Progress is throttled, so a fast run may report only part of the way;
    // the terminal `done` is what closes the sequence at the planned total.
    let bytes = progress_bytes(&events);
    assert!(!bytes.is_empty());
    assert!(bytes.windows(2).all(|w| w[0] < w[1]));
    assert!(bytes.iter().all(|&b| b % 131_072 == 0));
    let last_progress = *bytes.last().unwrap();
    assert!(last_progress <= 1_048_576);

    let json = serde_json::to_value(events.last().unwrap()).unwrap();
    assert_eq!(json["event"], "done");
    assert_eq!(json["data"]["done"], true);
    assert_eq!(json["data"]["totalBytes"], 1_048_576);
    assert!(json["data"]["totalBytes"].as_u64().unwrap() >= last_progress);
    assert_eq!(json["data"]["percent"], 100.0);

    assert!(matches!(outcome, SessionOutcome::Completed(Some(_))));
    assert!(engine.registry().is_empty());
}

#[tokio::test]
async fn upload_falls_back_when_sink_handshake_fails() {
    let url = accept_and_close().await;
    let engine = engine();
    let (events, outcome) = engine
        .start_upload("u-tls", 1_048_576, 131_072, Some(&url))
        .collect()
        .await;

    assert!(matches!(&events[0], Event::Info(notice) if notice.is_fallback()), "{events:?}");
    assert_eq!(events.iter().filter(|e| e.name() == "info").count(), 1);
    assert!(events.iter().all(|e| e.name() != "error"), "{events:?}");
    assert_eq!(events.last().map(Event::name), Some("done"));
    assert!(matches!(outcome, SessionOutcome::Completed(Some(_))));
    assert!(engine.registry().is_empty());
}

#[tokio::test]
async fn upload_to_live_sink_sends_every_byte() {
    let (url, received) = serve_sink().await;
    let engine = engine();
    let (events, outcome) = engine
        .start_upload("u-live", 512 * 1024, 64 * 1024, Some(&url))
        .collect()
        .await;

    assert!(events.iter().all(|e| e.name() != "info"), "{events:?}");
    let Some(Event::Done(done)) = events.last() else {
        panic!("expected done, got {:?}", events.last());
    };
    assert_eq!(done.transfer.as_ref().unwrap().total_bytes, 512 * 1024);
    assert!(matches!(outcome, SessionOutcome::Completed(_)));
    // Chunk framing adds a few bytes on top of the payload.
    assert!(received.load(Ordering::SeqCst) >= 512 * 1024);
}

#[tokio::test]
async fn cancelled_upload_has_no_done() {
    let engine = engine();
    let mut session = engine.start_upload("u-cancel", 1 << 40, 64 * 1024, None);

    let first = session.next_event().await.unwrap();
    assert_eq!(first.name(), "progress");
    assert!(engine.cancel("u-cancel"));

    let (rest, outcome) = session.collect().await;
    assert_eq!(outcome, SessionOutcome::Cancelled);
    assert!(rest.iter().all(|e| e.name() == "progress"));

    assert!(engine.registry().is_empty());
    assert!(!engine.cancel("u-cancel"));
}

#[tokio::test]
async fn cancel_unknown_session_is_noop() {
    let engine = engine();
    assert!(!engine.cancel("never-started"));
    assert!(engine.registry().is_empty());
}

#[tokio::test]
async fn subscriber_disconnect_stops_upload() {
    let engine = engine();
    let (events, task) = engine
        .start_upload("u-gone", 1 << 40, 64 * 1024, None)
        .into_parts();
    drop(events);

    let outcome = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("upload did not stop after disconnect")
        .unwrap();
    assert_eq!(outcome, SessionOutcome::Cancelled);
    assert!(engine.registry().is_empty());
}

#[tokio::test]
async fn probe_stream_sequence() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = listener.local_addr().unwrap().to_string();

    let (events, outcome) = engine()
        .probe_stream(&target, 3, Duration::from_millis(100))
        .collect()
        .await;

    let json: Vec<_> = events
        .iter()
        .map(|e| serde_json::to_value(e).unwrap())
        .collect();
    assert_eq!(json.len(), 4);
    for (i, event) in json[..3].iter().enumerate() {
        assert_eq!(event["event"], "ping");
        assert_eq!(event["data"]["seq"], i as u64 + 1);
        assert_eq!(event["data"]["ok"], true);
    }
    assert_eq!(json[3], serde_json::json!({ "event": "done", "data": { "done": true } }));
    assert_eq!(outcome, SessionOutcome::Completed(None));
}

#[tokio::test]
async fn single_shot_download_returns_summary() {
    let url = serve_body(256 * 1024, true).await;
    let outcome = engine().download_once(Some(&url)).await;
    let SessionOutcome::Completed(Some(summary)) = outcome else {
        panic!("unexpected outcome {outcome:?}");
    };
    assert_eq!(summary.total_bytes, 256 * 1024);
}
