//! Log fan-out integration tests.

use std::time::Duration;

use bytes::Bytes;
use sandpiper_logmgr::{LogError, LogFanout};

fn fanout(idle: Duration) -> (tempfile::TempDir, LogFanout) {
    let dir = tempfile::tempdir().expect("tempdir");
    let logs = LogFanout::new(dir.path(), idle).expect("log fanout");
    (dir, logs)
}

#[tokio::test]
async fn lines_are_persisted_and_delivered_in_order() {
    let (_dir, logs) = fanout(Duration::from_secs(5));

    // Subscriber registered before any write sees everything live.
    let (sub_id, mut rx) = logs.tail("x", 100).await.expect("tail");

    for line in ["first", "second", "third"] {
        logs.write("x", Bytes::from(line)).await.expect("write");
    }

    for expected in ["first", "second", "third"] {
        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("line within two seconds");
        assert_eq!(got.as_deref(), Some(expected));
    }

    // Give the handler a moment to finish the file writes.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let contents = std::fs::read_to_string(logs.log_path("x")).expect("read log file");
    assert_eq!(contents, "first\nsecond\nthird\n");

    logs.close_tail("x", sub_id);
}

#[tokio::test]
async fn embedded_newlines_are_rejected() {
    let (_dir, logs) = fanout(Duration::from_secs(5));
    let err = logs.write("x", Bytes::from("two\nlines")).await.unwrap_err();
    assert!(matches!(err, LogError::LineContainsNewline));
}

#[tokio::test]
async fn unwritable_directory_fails_construction() {
    let err = LogFanout::new("/nonexistent/sandpiper-logs", Duration::from_secs(5)).unwrap_err();
    assert!(matches!(err, LogError::Unwritable { .. }));
}

#[tokio::test]
async fn tail_returns_the_last_n_lines() {
    let (_dir, logs) = fanout(Duration::from_secs(5));

    for i in 0..5 {
        logs.write("x", Bytes::from(format!("line-{i}")))
            .await
            .expect("write");
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    let (_id, mut rx) = logs.tail("x", 2).await.expect("tail");
    assert_eq!(rx.recv().await.as_deref(), Some("line-3"));
    assert_eq!(rx.recv().await.as_deref(), Some("line-4"));

    // And the channel keeps receiving live lines afterwards.
    logs.write("x", Bytes::from("line-5")).await.expect("write");
    let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("live line");
    assert_eq!(got.as_deref(), Some("line-5"));
}

#[tokio::test]
async fn tail_of_an_unknown_app_is_empty_but_live() {
    let (_dir, logs) = fanout(Duration::from_secs(5));

    let (_id, mut rx) = logs.tail("fresh", 50).await.expect("tail");
    assert!(rx.try_recv().is_err());

    logs.write("fresh", Bytes::from("hello")).await.expect("write");
    let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("live line");
    assert_eq!(got.as_deref(), Some("hello"));
}

#[tokio::test]
async fn full_subscriber_drops_while_others_keep_receiving() {
    let (_dir, logs) = fanout(Duration::from_secs(5));

    // tail(1) gives the minimum channel capacity (16).
    let (_slow, mut slow_rx) = logs.tail("x", 1).await.expect("slow tail");
    let (_fast, mut fast_rx) = logs.tail("x", 1).await.expect("fast tail");

    let total = 40;
    for i in 0..total {
        logs.write("x", Bytes::from(format!("l{i}")))
            .await
            .expect("write");
        // Drain the fast subscriber as we go.
        let got = tokio::time::timeout(Duration::from_secs(2), fast_rx.recv())
            .await
            .expect("fast line");
        assert_eq!(got, Some(format!("l{i}")));
    }

    // The slow subscriber saw an in-order prefix and nothing else.
    let mut seen = Vec::new();
    while let Ok(line) = slow_rx.try_recv() {
        seen.push(line);
    }
    assert!(seen.len() < total);
    for (i, line) in seen.iter().enumerate() {
        assert_eq!(line, &format!("l{i}"));
    }
}

#[tokio::test]
async fn handler_restarts_after_going_idle() {
    let (_dir, logs) = fanout(Duration::from_millis(150));

    logs.write("x", Bytes::from("before")).await.expect("write");
    // Let the handler flush and then expire.
    tokio::time::sleep(Duration::from_millis(500)).await;

    logs.write("x", Bytes::from("after")).await.expect("write");
    tokio::time::sleep(Duration::from_millis(300)).await;

    let contents = std::fs::read_to_string(logs.log_path("x")).expect("read log file");
    assert_eq!(contents, "before\nafter\n");
}

#[tokio::test]
async fn non_utf8_lines_persist_but_are_not_delivered() {
    let (_dir, logs) = fanout(Duration::from_secs(5));

    let (_id, mut rx) = logs.tail("x", 10).await.expect("tail");

    logs.write("x", Bytes::from(vec![0xff, 0xfe, 0x01]))
        .await
        .expect("write");
    logs.write("x", Bytes::from("readable")).await.expect("write");

    let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("utf8 line");
    assert_eq!(got.as_deref(), Some("readable"));

    tokio::time::sleep(Duration::from_millis(200)).await;
    let contents = std::fs::read(logs.log_path("x")).expect("read log file");
    assert_eq!(contents, [0xff, 0xfe, 0x01, b'\n', b'r', b'e', b'a', b'd', b'a', b'b', b'l', b'e', b'\n']);
}
