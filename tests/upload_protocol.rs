//! End-to-end tests of the upload protocol against an in-process server.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use futures_util::stream::{self, Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use bet_uploader::events::AckFailure;
use bet_uploader::frame::{decode_batch, DONE_PREFIX};
use bet_uploader::records::{from_lines, RecordItem};
use bet_uploader::signals::spawn_watcher_on;
use bet_uploader::{
    ClientConfig, MemorySink, SessionCloser, State, UploadController, UploadEvent,
};

// =============================================================================
// Fake server
// =============================================================================

/// Everything the server saw on its single connection.
#[derive(Debug, Default)]
struct Received {
    frames: Vec<String>,
    done: Option<String>,
}

impl Received {
    fn batch_sizes(&self) -> Vec<usize> {
        self.frames
            .iter()
            .map(|f| decode_batch(f).unwrap().len())
            .collect()
    }
}

struct FakeServer {
    addr: String,
    handle: JoinHandle<Received>,
}

/// `ack` maps (batch index, records in batch) to the acknowledgment line,
/// `None` meaning no answer. `result` is written after the completion marker.
async fn fake_server<A>(ack: A, result: Option<&'static str>) -> FakeServer
where
    A: Fn(usize, usize) -> Option<String> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let handle = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut received = Received::default();
        let mut buf = String::new();
        let mut chunk = [0u8; 4096];

        loop {
            let n = sock.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                return received;
            }
            buf.push_str(std::str::from_utf8(&chunk[..n]).unwrap());

            while let Some(pos) = buf.find('\n') {
                let frame: String = buf.drain(..=pos).collect();
                let frame = frame.trim_end_matches('\n').to_owned();
                let count = decode_batch(&frame).unwrap().len();
                if let Some(line) = ack(received.frames.len(), count) {
                    sock.write_all(format!("{line}\n").as_bytes()).await.unwrap();
                }
                received.frames.push(frame);
            }

            if received.done.is_none() {
                if let Some(id) = buf.strip_prefix(DONE_PREFIX) {
                    received.done = Some(id.to_owned());
                    buf.clear();
                    if let Some(result) = result {
                        sock.write_all(format!("{result}\n").as_bytes()).await.unwrap();
                    }
                }
            }
        }
    });

    FakeServer { addr, handle }
}

/// Accepts one connection, reads until `until` has been seen, then closes
/// its side without answering.
async fn hang_up_after(until: &'static str) -> (String, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let handle = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut seen = String::new();
        let mut chunk = [0u8; 4096];
        while !seen.contains(until) {
            let n = sock.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                break;
            }
            seen.push_str(std::str::from_utf8(&chunk[..n]).unwrap());
        }
        seen
    });

    (addr, handle)
}

/// A source with no records that force-closes the session when polled.
fn closes_session(closer: SessionCloser) -> impl Stream<Item = RecordItem> {
    stream::once(async move {
        closer.close();
    })
    .filter_map(|()| async { None::<RecordItem> })
}

fn echo_count(_: usize, count: usize) -> Option<String> {
    Some(count.to_string())
}

fn config(addr: &str) -> ClientConfig {
    let mut config = ClientConfig::new("7", addr);
    config.loop_period = Duration::from_millis(100);
    config.poll_timeout = Duration::from_millis(100);
    config
}

fn bet_lines(n: usize) -> Vec<String> {
    (0..n)
        .map(|i| format!("Name{i},Last,{:08},1990-01-{:02},{i}", 10_000_000 + i, 1 + i % 28))
        .collect()
}

fn controller(config: ClientConfig, cancel: CancellationToken) -> (UploadController, Arc<MemorySink>) {
    let sink = MemorySink::new();
    (UploadController::new(config, cancel, sink.clone()), sink)
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn three_records_in_batches_of_two() {
    let server = fake_server(echo_count, Some("2")).await;
    let mut config = config(&server.addr);
    config.batch_max_amount = 2;
    let (controller, sink) = controller(config, CancellationToken::new());

    let lines = bet_lines(3);
    let report = controller.run(from_lines("7", &lines)).await;
    let received = server.handle.await.unwrap();

    assert_eq!(report.state, State::Closed);
    assert_eq!(report.batches_sent, 2);
    assert_eq!(report.records_sent, 3);
    assert_eq!(report.acks_ok, 2);
    assert_eq!(report.winners.as_deref(), Some("2"));

    assert_eq!(received.batch_sizes(), vec![2, 1]);
    assert_eq!(received.done.as_deref(), Some("7"));

    let events = sink.events();
    assert_eq!(
        events,
        vec![
            UploadEvent::Connected,
            UploadEvent::BatchSent { count: 2 },
            UploadEvent::BatchAcked { count: 2 },
            UploadEvent::BatchSent { count: 1 },
            UploadEvent::BatchAcked { count: 1 },
            UploadEvent::DoneSent,
            UploadEvent::Winners {
                result: "2".to_owned()
            },
            UploadEvent::LoopFinished,
        ]
    );
}

#[tokio::test]
async fn frames_carry_records_in_file_order() {
    let server = fake_server(echo_count, Some("0")).await;
    let mut config = config(&server.addr);
    config.batch_max_amount = 3;
    let (controller, _sink) = controller(config, CancellationToken::new());

    let lines = bet_lines(7);
    let report = controller.run(from_lines("7", &lines)).await;
    let received = server.handle.await.unwrap();

    assert_eq!(report.state, State::Closed);
    assert_eq!(received.batch_sizes(), vec![3, 3, 1]);

    let first_names: Vec<String> = received
        .frames
        .iter()
        .flat_map(|f| decode_batch(f).unwrap())
        .map(|fields| {
            assert_eq!(fields[0], "7");
            fields[1].clone()
        })
        .collect();
    let expected: Vec<String> = (0..7).map(|i| format!("Name{i}")).collect();
    assert_eq!(first_names, expected);
}

#[tokio::test]
async fn ack_mismatch_is_reported_and_upload_continues() {
    let ack = |index: usize, count: usize| {
        if index == 0 {
            Some("1".to_owned())
        } else {
            Some(count.to_string())
        }
    };
    let server = fake_server(ack, Some("5")).await;
    let mut config = config(&server.addr);
    config.batch_max_amount = 2;
    let (controller, sink) = controller(config, CancellationToken::new());

    let report = controller.run(from_lines("7", bet_lines(4))).await;
    let received = server.handle.await.unwrap();

    assert_eq!(report.state, State::Closed);
    assert_eq!(report.acks_failed, 1);
    assert_eq!(report.acks_ok, 1);
    assert_eq!(received.batch_sizes(), vec![2, 2]);
    assert!(sink.events().contains(&UploadEvent::BatchAckFailed(AckFailure::Mismatch {
        expected: 2,
        received: "1".to_owned(),
    })));
}

#[tokio::test]
async fn missing_ack_times_out_without_aborting() {
    let ack = |index: usize, count: usize| (index > 0).then(|| count.to_string());
    let server = fake_server(ack, Some("1")).await;
    let mut config = config(&server.addr);
    config.batch_max_amount = 1;
    let (controller, sink) = controller(config, CancellationToken::new());

    let report = controller.run(from_lines("7", bet_lines(2))).await;
    server.handle.await.unwrap();

    assert_eq!(report.state, State::Closed);
    assert_eq!(report.batches_sent, 2);
    assert!(sink
        .events()
        .contains(&UploadEvent::BatchAckFailed(AckFailure::Timeout)));
}

#[tokio::test]
async fn invalid_records_are_skipped_and_do_not_count() {
    let server = fake_server(echo_count, Some("0")).await;
    let mut config = config(&server.addr);
    config.batch_max_amount = 2;
    let (controller, sink) = controller(config, CancellationToken::new());

    let mut lines = bet_lines(3);
    lines.insert(1, "Bad,Line,notanid,1990-01-01,1".to_owned());
    let report = controller.run(from_lines("7", &lines)).await;
    let received = server.handle.await.unwrap();

    assert_eq!(report.records_rejected, 1);
    assert_eq!(received.batch_sizes(), vec![2, 1]);
    assert!(received.frames.iter().all(|f| !f.contains("Bad")));
    assert!(sink
        .events()
        .iter()
        .any(|e| matches!(e, UploadEvent::RecordRejected(r) if r.line == 2)));
}

#[tokio::test]
async fn empty_source_still_sends_done_and_polls() {
    let server = fake_server(echo_count, Some("0")).await;
    let (controller, sink) = controller(config(&server.addr), CancellationToken::new());

    let report = controller.run(from_lines("7", Vec::<String>::new())).await;
    let received = server.handle.await.unwrap();

    assert!(received.frames.is_empty());
    assert_eq!(received.done.as_deref(), Some("7"));
    assert_eq!(report.state, State::Closed);
    assert_eq!(
        sink.events(),
        vec![
            UploadEvent::Connected,
            UploadEvent::DoneSent,
            UploadEvent::Winners {
                result: "0".to_owned()
            },
            UploadEvent::LoopFinished,
        ]
    );
}

#[tokio::test]
async fn connect_failure_sends_nothing() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let (controller, sink) = controller(config(&addr), CancellationToken::new());
    let report = controller.run(from_lines("7", bet_lines(3))).await;

    assert_eq!(report.state, State::Aborted);
    assert!(!report.cancelled);
    assert_eq!(report.batches_sent, 0);
    let events = sink.events();
    assert_eq!(events.len(), 2);
    assert!(matches!(events[0], UploadEvent::ConnectFailed { .. }));
    assert_eq!(events[1], UploadEvent::LoopFinished);
}

#[tokio::test]
async fn poll_gives_up_after_bounded_attempts() {
    let server = fake_server(echo_count, None).await;
    let mut config = config(&server.addr);
    config.poll_timeout = Duration::from_millis(50);
    let (controller, sink) = controller(config, CancellationToken::new());

    let started = Instant::now();
    let report = controller.run(from_lines("7", bet_lines(1))).await;
    let elapsed = started.elapsed();
    server.handle.await.unwrap();

    assert_eq!(report.state, State::Aborted);
    assert_eq!(report.winners, None);
    assert!(elapsed >= Duration::from_millis(250), "{elapsed:?}");
    assert!(sink
        .events()
        .contains(&UploadEvent::PollExhausted { attempts: 5 }));
}

#[tokio::test]
async fn cancellation_while_polling_ends_within_a_deadline() {
    let server = fake_server(echo_count, None).await;
    let mut config = config(&server.addr);
    config.poll_timeout = Duration::from_secs(2);
    config.poll_attempts = 5;

    let cancel = CancellationToken::new();
    let (controller, sink) = controller(config, cancel.clone());
    let (signal_tx, signal_rx) = tokio::sync::oneshot::channel::<()>();
    let watcher = spawn_watcher_on(
        async move {
            let _ = signal_rx.await;
            "SIGTERM"
        },
        cancel.clone(),
        controller.closer(),
        "7".to_owned(),
    );

    let run = tokio::spawn(controller.run(from_lines("7", bet_lines(1))));
    // Pacing (100ms) + ack + done, then the client is polling.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let started = Instant::now();
    signal_tx.send(()).unwrap();

    let report = run.await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    watcher.await.unwrap();
    let received = server.handle.await.unwrap();

    assert_eq!(received.done.as_deref(), Some("7"));
    assert_eq!(report.state, State::Aborted);
    assert!(report.cancelled);
    assert!(report.winners.is_none());
    let events = sink.events();
    assert!(events.contains(&UploadEvent::Cancelled));
    assert!(!events
        .iter()
        .any(|e| matches!(e, UploadEvent::PollFailed { .. } | UploadEvent::PollExhausted { .. })));
}

#[tokio::test]
async fn cancellation_during_pacing_stops_before_next_batch() {
    let server = fake_server(echo_count, Some("0")).await;
    let mut config = config(&server.addr);
    config.loop_period = Duration::from_secs(5);
    config.batch_max_amount = 1;

    let cancel = CancellationToken::new();
    let (controller, sink) = controller(config, cancel.clone());
    let run = tokio::spawn(controller.run(from_lines("7", bet_lines(3))));

    tokio::time::sleep(Duration::from_millis(200)).await;
    let started = Instant::now();
    cancel.cancel();
    let report = run.await.unwrap();
    let received = server.handle.await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(report.cancelled);
    assert_eq!(report.batches_sent, 0);
    assert!(received.frames.is_empty());
    assert!(received.done.is_none());
    assert!(sink.events().contains(&UploadEvent::Cancelled));
}

#[tokio::test]
async fn peer_hanging_up_while_polling_aborts() {
    let (addr, server) = hang_up_after("DONE:7").await;
    let (controller, sink) = controller(config(&addr), CancellationToken::new());

    let report = controller.run(from_lines("7", Vec::<String>::new())).await;
    assert_eq!(server.await.unwrap(), "DONE:7");

    assert_eq!(report.state, State::Aborted);
    assert!(!report.cancelled);
    assert!(report.winners.is_none());
    let events = sink.events();
    assert_eq!(events[..2], [UploadEvent::Connected, UploadEvent::DoneSent]);
    assert!(matches!(events[2], UploadEvent::PollFailed { .. }), "{events:?}");
    assert_eq!(events[3], UploadEvent::LoopFinished);
}

#[tokio::test]
async fn peer_hanging_up_before_ack_is_a_transport_failure() {
    let (addr, server) = hang_up_after("\n").await;
    let mut config = config(&addr);
    config.batch_max_amount = 1;
    let (controller, sink) = controller(config, CancellationToken::new());

    let report = controller.run(from_lines("7", bet_lines(2))).await;
    let seen = server.await.unwrap();

    assert_eq!(decode_batch(seen.trim_end()).unwrap().len(), 1);
    assert_eq!(report.state, State::Aborted);
    assert!(!report.cancelled);
    assert!(report.acks_failed >= 1);

    let events = sink.events();
    let failed = events
        .iter()
        .position(|e| matches!(e, UploadEvent::BatchAckFailed(AckFailure::Transport(_))))
        .expect("ack read should fail on the closed connection");
    assert_eq!(events[failed - 1], UploadEvent::BatchSent { count: 1 });
    // The upload goes on with the second batch instead of stopping.
    assert!(matches!(
        events[failed + 1],
        UploadEvent::BatchSent { count: 1 } | UploadEvent::BatchWriteFailed { count: 1, .. }
    ));
    assert!(!events.contains(&UploadEvent::Cancelled));
}

#[tokio::test]
async fn session_closed_elsewhere_fails_the_batch_write() {
    let server = fake_server(echo_count, Some("0")).await;
    let (controller, sink) = controller(config(&server.addr), CancellationToken::new());

    let source = from_lines("7", bet_lines(1)).chain(closes_session(controller.closer()));
    let report = controller.run(source).await;
    let received = server.handle.await.unwrap();

    assert!(received.frames.is_empty());
    assert!(received.done.is_none());
    assert_eq!(report.state, State::Aborted);
    assert!(!report.cancelled);
    assert_eq!(report.batches_sent, 0);

    let events = sink.events();
    assert_eq!(events.len(), 3);
    assert_eq!(events[0], UploadEvent::Connected);
    assert!(matches!(
        events[1],
        UploadEvent::BatchWriteFailed { count: 1, .. }
    ));
    assert_eq!(events[2], UploadEvent::LoopFinished);
}

#[tokio::test]
async fn session_closed_elsewhere_fails_the_done_marker() {
    let server = fake_server(echo_count, Some("0")).await;
    let (controller, sink) = controller(config(&server.addr), CancellationToken::new());

    let source = closes_session(controller.closer());
    let report = controller.run(source).await;
    let received = server.handle.await.unwrap();

    assert!(received.done.is_none());
    assert_eq!(report.state, State::Aborted);
    assert!(!report.cancelled);

    let events = sink.events();
    assert_eq!(events.len(), 3);
    assert_eq!(events[0], UploadEvent::Connected);
    assert!(matches!(events[1], UploadEvent::DoneFailed { .. }), "{events:?}");
    assert_eq!(events[2], UploadEvent::LoopFinished);
}
