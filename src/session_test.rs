use super::*;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::test_helpers::{
    self, Call, ScriptedTransport, StreamScript, bind_body, data_frame, data_payload, established_frame, ok, ping_frame,
    status,
};

struct Harness {
    transport: Arc<ScriptedTransport>,
    running_tx: watch::Sender<bool>,
    snapshot_rx: watch::Receiver<SessionSnapshot>,
    events: broadcast::Receiver<ChannelEvent>,
}

fn harness(max_attempts: i64) -> (Harness, Lifecycle) {
    let transport = ScriptedTransport::new();
    let ctx = test_helpers::context(transport.clone(), max_attempts);
    let events = ctx.bus.subscribe();
    let session = Session::with_request_id("room-1", 1000);
    let (running_tx, running_rx) = watch::channel(true);
    let (snapshot_tx, snapshot_rx) = watch::channel(session.snapshot());
    let lifecycle = Lifecycle::new(session, ctx, running_rx, snapshot_tx);
    (Harness { transport, running_tx, snapshot_rx, events }, lifecycle)
}

async fn next(events: &mut broadcast::Receiver<ChannelEvent>) -> ChannelEvent {
    events.recv().await.expect("event")
}

async fn kinds(events: &mut broadcast::Receiver<ChannelEvent>, n: usize) -> Vec<&'static str> {
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(next(events).await.kind());
    }
    out
}

// =========================================================================
// Session
// =========================================================================

#[test]
fn request_ids_are_consumed_in_order() {
    let mut s = Session::with_request_id("r", 7);
    assert_eq!(s.take_request_id(), 7);
    assert_eq!(s.take_request_id(), 8);
    assert_eq!(s.next_request_id, 9);
}

#[test]
fn new_session_is_seeded_and_empty() {
    let s = Session::new("r");
    assert!(REQUEST_ID_SEED_RANGE.contains(&s.next_request_id));
    assert!(s.server_session_id.is_empty());
    assert!(s.sid.is_empty());
    assert_eq!(s.reconnect_attempts, 0);
    assert_eq!(s.rooms(), vec!["r".to_string()]);
    assert!(!s.snapshot().has_credentials);
}

// =========================================================================
// Lifecycle: happy path
// =========================================================================

#[tokio::test]
async fn handshake_then_frames_in_stream_order() {
    let (mut h, lifecycle) = harness(0);
    let mut stream = established_frame("tok-1");
    stream.extend(ping_frame(2, "1700000000000"));
    stream.extend(data_frame(3, "hello"));
    let (a, b) = stream.split_at(stream.len() / 2);
    h.transport.push_stream(Ok(StreamScript::hold(vec![a.to_vec(), b.to_vec()])));

    let task = tokio::spawn(lifecycle.run());

    assert_eq!(
        kinds(&mut h.events, 5).await,
        vec!["server_session_id_obtained", "session_id_obtained", "connected", "ping", "data"]
    );

    h.running_tx.send_replace(false);
    assert_eq!(task.await.unwrap(), LifecycleExit::Stopped);

    let snapshot = h.snapshot_rx.borrow().clone();
    assert_eq!(snapshot.sid, "sid-default");
    assert_eq!(snapshot.last_sequence, 3);
    assert!(snapshot.has_credentials);
}

#[tokio::test]
async fn data_event_carries_frame_length_and_sequence() {
    let (mut h, lifecycle) = harness(0);
    let declared = data_payload(9, "payload").to_string().len();
    h.transport.push_stream(Ok(StreamScript::hold(vec![data_frame(9, "payload")])));

    let task = tokio::spawn(lifecycle.run());
    let _ = kinds(&mut h.events, 2).await;

    match next(&mut h.events).await {
        ChannelEvent::Data { frame, length, sequence, session } => {
            assert_eq!(frame, data_payload(9, "payload"));
            assert_eq!(length, declared);
            assert_eq!(sequence, 9);
            assert_eq!(session.last_sequence, 9);
        }
        other => panic!("unexpected event {other:?}"),
    }

    h.running_tx.send_replace(false);
    task.await.unwrap();
}

#[tokio::test]
async fn stream_request_acknowledges_bind_ack() {
    let (mut h, lifecycle) = harness(0);
    h.transport.push_bind(ok(bind_body(77, "SID-X")));
    let task = tokio::spawn(lifecycle.run());
    let _ = kinds(&mut h.events, 2).await;

    h.running_tx.send_replace(false);
    task.await.unwrap();

    let opened: Vec<_> = h
        .transport
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            Call::OpenStream(r) => Some(r),
            _ => None,
        })
        .collect();
    assert_eq!(opened.len(), 1);
    assert_eq!(opened[0].sid, "SID-X");
    assert_eq!(opened[0].server_session_id, "gsid-default");
    assert_eq!(opened[0].last_sequence, 77);
}

#[tokio::test]
async fn handshake_declares_only_the_session_room() {
    let (mut h, lifecycle) = harness(0);
    let task = tokio::spawn(lifecycle.run());
    let _ = kinds(&mut h.events, 2).await;

    h.running_tx.send_replace(false);
    task.await.unwrap();

    for call in h.transport.calls() {
        match call {
            Call::ChooseServer(r) => assert_eq!(r.rooms, vec!["room-1".to_string()]),
            Call::Bind(r) => assert_eq!(r.rooms, vec!["room-1".to_string()]),
            _ => {}
        }
    }
}

#[tokio::test(start_paused = true)]
async fn connected_is_published_once_per_session() {
    let (mut h, lifecycle) = harness(0);
    let mut first = established_frame("tok-1");
    first.extend(established_frame("tok-2"));
    first.extend(data_frame(2, "after"));
    h.transport.push_stream(Ok(StreamScript::close(vec![first])));
    let mut second = established_frame("tok-3");
    second.extend(data_frame(2, "again"));
    h.transport.push_stream(Ok(StreamScript::hold(vec![second])));

    let task = tokio::spawn(lifecycle.run());
    assert_eq!(
        kinds(&mut h.events, 9).await,
        vec![
            "server_session_id_obtained",
            "session_id_obtained",
            "connected",
            "data",
            "error",
            "reconnecting",
            "server_session_id_obtained",
            "session_id_obtained",
            "data",
        ]
    );

    h.running_tx.send_replace(false);
    task.await.unwrap();
}

#[tokio::test]
async fn malformed_frames_are_reported_and_skipped() {
    let (mut h, lifecycle) = harness(0);
    let mut stream = b"xx[".to_vec();
    stream.extend_from_slice(b"5[1,,]");
    stream.extend(frames::encode_frame(&serde_json::json!(["no", "envelope"])));
    stream.extend(data_frame(4, "still here"));
    h.transport.push_stream(Ok(StreamScript::hold(vec![stream])));

    let task = tokio::spawn(lifecycle.run());
    let _ = kinds(&mut h.events, 2).await;

    let mut codes = Vec::new();
    for _ in 0..3 {
        match next(&mut h.events).await {
            ChannelEvent::Error { fatal, code, .. } => {
                assert!(!fatal);
                codes.push(code);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert_eq!(codes, vec![E_FRAME, E_FRAME, "E_SHAPE"]);
    assert_eq!(next(&mut h.events).await.kind(), "data");

    h.running_tx.send_replace(false);
    task.await.unwrap();
}

// =========================================================================
// Lifecycle: reconnect
// =========================================================================

#[tokio::test(start_paused = true)]
async fn stream_end_reconnects_after_backoff() {
    let (mut h, lifecycle) = harness(0);
    h.transport.push_stream(Ok(StreamScript::close(Vec::new())));
    let task = tokio::spawn(lifecycle.run());

    let _ = kinds(&mut h.events, 2).await;
    match next(&mut h.events).await {
        ChannelEvent::Error { fatal, code, .. } => {
            assert!(!fatal);
            assert_eq!(code, "E_STREAM_ENDED");
        }
        other => panic!("unexpected event {other:?}"),
    }
    match next(&mut h.events).await {
        ChannelEvent::Reconnecting { attempt, wait, session } => {
            assert_eq!(attempt, 1);
            assert_eq!(wait, Duration::from_millis(1000));
            assert_eq!(session.reconnect_attempts, 1);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(kinds(&mut h.events, 2).await, vec!["server_session_id_obtained", "session_id_obtained"]);

    h.running_tx.send_replace(false);
    task.await.unwrap();
    assert_eq!(h.transport.count(|c| matches!(c, Call::OpenStream(_))), 2);
    assert_eq!(h.snapshot_rx.borrow().reconnect_attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn attempts_reset_after_successful_connect() {
    let (mut h, lifecycle) = harness(0);
    h.transport.push_choose(status(500));
    h.transport.push_choose(status(500));
    h.transport.push_stream(Ok(StreamScript::close(Vec::new())));
    let task = tokio::spawn(lifecycle.run());

    let mut waits = Vec::new();
    while waits.len() < 3 {
        if let ChannelEvent::Reconnecting { attempt, wait, .. } = next(&mut h.events).await {
            waits.push((attempt, wait.as_millis()));
        }
    }
    // two handshake failures, then a connect whose stream ends
    assert_eq!(waits, vec![(1, 1000), (2, 2000), (1, 1000)]);

    h.running_tx.send_replace(false);
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn gives_up_after_attempt_ceiling() {
    let (mut h, lifecycle) = harness(2);
    for _ in 0..3 {
        h.transport.push_choose(status(503));
    }

    assert_eq!(lifecycle.run().await, LifecycleExit::GaveUp);

    let mut events = Vec::new();
    while let Ok(event) = h.events.try_recv() {
        events.push(event);
    }
    let kinds: Vec<&str> = events.iter().map(ChannelEvent::kind).collect();
    assert_eq!(kinds, vec!["error", "reconnecting", "error", "reconnecting", "error", "error"]);
    match events.last() {
        Some(ChannelEvent::Error { fatal, code, .. }) => {
            assert!(*fatal);
            assert_eq!(code, E_RECONNECT_EXHAUSTED);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(h.transport.count(|c| matches!(c, Call::ChooseServer(_))), 3);
}

#[tokio::test(start_paused = true)]
async fn stop_during_backoff_exits_without_retrying() {
    let (mut h, lifecycle) = harness(0);
    h.transport.push_choose(status(500));
    let task = tokio::spawn(lifecycle.run());

    assert_eq!(kinds(&mut h.events, 2).await, vec!["error", "reconnecting"]);
    h.running_tx.send_replace(false);

    assert_eq!(task.await.unwrap(), LifecycleExit::Stopped);
    assert_eq!(h.transport.count(|c| matches!(c, Call::ChooseServer(_))), 1);
}

// =========================================================================
// Lifecycle: credential refresh
// =========================================================================

#[tokio::test(start_paused = true)]
async fn refresh_runs_while_stream_is_open() {
    let (mut h, lifecycle) = harness(0);
    let mut stream = established_frame("tok-1");
    stream.extend(established_frame("tok-2"));
    h.transport.push_stream(Ok(StreamScript::hold(vec![stream])));
    let task = tokio::spawn(lifecycle.run());

    assert_eq!(kinds(&mut h.events, 3).await, vec!["server_session_id_obtained", "session_id_obtained", "connected"]);
    assert_eq!(next(&mut h.events).await.kind(), "credentials_refreshed");

    let refreshes: Vec<_> = h
        .transport
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            Call::Refresh(r) => Some(r),
            _ => None,
        })
        .collect();
    assert_eq!(refreshes.len(), 1);
    assert_eq!(refreshes[0].credentials_token, "tok-2");
    assert_eq!(refreshes[0].server_session_id, "gsid-default");

    h.running_tx.send_replace(false);
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn refresh_is_cancelled_when_stream_closes() {
    let (mut h, lifecycle) = harness(0);
    h.transport.push_stream(Ok(StreamScript::close(vec![established_frame("tok-1")])));
    let task = tokio::spawn(lifecycle.run());

    assert_eq!(
        kinds(&mut h.events, 5).await,
        vec!["server_session_id_obtained", "session_id_obtained", "connected", "error", "reconnecting"]
    );

    tokio::time::sleep(test_helpers::REFRESH_INTERVAL * 3).await;
    assert_eq!(h.transport.count(|c| matches!(c, Call::Refresh(_))), 0);

    h.running_tx.send_replace(false);
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn stop_cancels_refresh() {
    let (mut h, lifecycle) = harness(0);
    h.transport.push_stream(Ok(StreamScript::hold(vec![established_frame("tok-1")])));
    let task = tokio::spawn(lifecycle.run());
    let _ = kinds(&mut h.events, 3).await;

    h.running_tx.send_replace(false);
    task.await.unwrap();

    tokio::time::sleep(test_helpers::REFRESH_INTERVAL * 3).await;
    assert_eq!(h.transport.count(|c| matches!(c, Call::Refresh(_))), 0);
    assert!(h.events.try_recv().is_err());
}
