//! Client handshake and oneshot against in-memory connectors

mod common;

use bytes::Bytes;
use c2link::client::{Mux, handshake, oneshot};
use c2link::protocol::{Flags, message};
use c2link::util::limits::{DEFAULT_JITTER, DEFAULT_SLEEP, MAX_ERRORS, MEDIUM_LIMIT};
use c2link::{ErrorKind, Packet, Profile, Setting, State};
use common::{FailingConnector, Reply, StubConnector, init_tracing};
use std::sync::Arc;
use tokio::time::{Duration, timeout};
use tokio_util::sync::CancellationToken;

#[test]
fn test_profile_defaults() {
    let profile = Profile::default();
    assert_eq!(profile.sleep(), DEFAULT_SLEEP);
    assert_eq!(profile.jitter(), DEFAULT_JITTER);
    assert_eq!(profile.size(), MEDIUM_LIMIT);
    assert!(profile.wrapper().is_none());
    assert!(profile.transform().is_none());
    assert!(profile.setting().connector().is_none());
}

#[tokio::test]
async fn test_complete_reply_creates_session() -> anyhow::Result<()> {
    init_tracing();
    let (stub, mut received) = StubConnector::complete();
    let root = CancellationToken::new();
    let mux = Arc::new(Mux::new());

    let session = handshake(
        &root,
        mux.clone(),
        "stub:1",
        Some(stub.clone()),
        Some(&Profile::default()),
        None,
    )
    .await?;

    assert_eq!(session.state(), State::Established);
    assert_eq!(session.queue_capacity(), MEDIUM_LIMIT);
    assert_eq!(session.sleep(), DEFAULT_SLEEP);
    assert!(session.is_client());
    assert_eq!(mux.sessions().len(), 1);

    let hello = received.recv().await.expect("hello");
    assert_eq!(hello.id, message::HELLO);
    assert_eq!(hello.device, session.id());

    // The handshake connection is closed before the session is returned
    assert_eq!(stub.connects(), 1);
    assert_eq!(stub.shutdowns(), 1);
    assert_eq!(stub.drops(), 1);

    timeout(Duration::from_secs(10), session.close()).await?;
    assert_eq!(session.state(), State::Closed);
    assert!(mux.sessions().is_empty());

    // Closing sent a best-effort Shutdown through the connector
    let notice = received.recv().await.expect("shutdown notice");
    assert_eq!(notice.id, message::SHUTDOWN);
    Ok(())
}

#[tokio::test]
async fn test_hello_carries_first_packet() -> anyhow::Result<()> {
    let (stub, mut received) = StubConnector::complete();
    let root = CancellationToken::new();
    let first = Packet::with_payload(0x30, 5, Bytes::from_static(b"first"));

    let session = handshake(
        &root,
        Arc::new(Mux::new()),
        "stub:1",
        Some(stub),
        None,
        Some(first),
    )
    .await?;

    let hello = received.recv().await.expect("hello");
    assert!(hello.flags.has(Flags::DATA));
    root.cancel();
    session.wait().await;
    Ok(())
}

#[tokio::test]
async fn test_failed_polls_retry_then_close() -> anyhow::Result<()> {
    init_tracing();
    let (stub, mut received) = StubConnector::new(Reply::CompleteThenHangup);
    let root = CancellationToken::new();
    let mux = Arc::new(Mux::new());
    let profile = Profile::builder()
        .sleep(Duration::from_millis(200))
        .jitter(0)
        .build();

    let session = handshake(&root, mux.clone(), "stub:1", Some(stub.clone()), Some(&profile), None)
        .await?;
    assert_eq!(mux.sessions().len(), 1);
    session
        .write(Packet::with_payload(0x33, 12, Bytes::from_static(b"retry")))
        .await?;

    timeout(Duration::from_secs(10), session.wait()).await?;
    assert_eq!(session.state(), State::Closed);
    assert!(mux.sessions().is_empty());
    // One handshake plus one dial per failed poll; giving up sends no notice
    assert_eq!(stub.connects(), 1 + MAX_ERRORS as usize);

    let hello = received.recv().await.expect("hello");
    assert_eq!(hello.id, message::HELLO);
    let mut polls = Vec::new();
    while let Ok(packet) = received.try_recv() {
        polls.push(packet);
    }
    assert_eq!(polls.len(), MAX_ERRORS as usize);
    let copies: Vec<&Packet> = polls.iter().filter(|p| p.id == 0x33).collect();
    assert!(copies.len() >= 2, "unsent packet was not retried: {:?}", polls);
    assert!(copies.iter().all(|p| p.job == 12 && p.payload == Bytes::from_static(b"retry")));
    assert!(polls.last().is_some_and(|p| p.id == 0x33));
    Ok(())
}

#[tokio::test]
async fn test_unexpected_reply_is_protocol_error() {
    init_tracing();
    for reply in [
        Reply::Message(message::NOP),
        Reply::Message(message::SHUTDOWN),
        Reply::Garbage,
        Reply::Hangup,
    ] {
        let (stub, _received) = StubConnector::new(reply.clone());
        let mux = Arc::new(Mux::new());
        let err = handshake(
            &CancellationToken::new(),
            mux.clone(),
            "stub:1",
            Some(stub.clone()),
            None,
            None,
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Protocol, "reply {:?}: {}", reply, err);
        assert_eq!(stub.shutdowns(), 1);
        assert_eq!(stub.drops(), 1);
        assert!(mux.sessions().is_empty());
    }
}

#[tokio::test]
async fn test_unreachable_is_transport_error() {
    let err = handshake(
        &CancellationToken::new(),
        Arc::new(Mux::new()),
        "10.0.0.1:443",
        Some(Arc::new(FailingConnector)),
        None,
        None,
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
    assert!(err.to_string().contains("10.0.0.1:443"));
}

#[tokio::test]
async fn test_cancelled_root_refuses_handshake() {
    let (stub, _received) = StubConnector::complete();
    let root = CancellationToken::new();
    root.cancel();
    let err = handshake(&root, Arc::new(Mux::new()), "stub:1", Some(stub.clone()), None, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::State);
    assert_eq!(stub.connects(), 0);
}

#[tokio::test]
async fn test_no_connector_anywhere() {
    let profile = Profile::builder().setting(Setting::new(vec![0x00])).build();
    let err = handshake(
        &CancellationToken::new(),
        Arc::new(Mux::new()),
        "127.0.0.1:1",
        None,
        Some(&profile),
        None,
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[tokio::test]
async fn test_oneshot_closes_once() -> anyhow::Result<()> {
    let (stub, mut received) = StubConnector::new(Reply::Silent);
    let packet = Packet::with_payload(0x41, 3, Bytes::from_static(b"fire"));

    oneshot("stub:1", Some(stub.clone()), None, Some(packet)).await?;

    let sent = received.recv().await.expect("oneshot packet");
    assert!(sent.flags.has(Flags::ONESHOT));
    assert_eq!(sent.id, 0x41);
    assert_eq!(sent.payload, Bytes::from_static(b"fire"));
    assert!(!sent.device.is_nil());
    assert_eq!(stub.connects(), 1);
    assert_eq!(stub.shutdowns(), 1);
    assert_eq!(stub.drops(), 1);
    Ok(())
}

#[tokio::test]
async fn test_oneshot_dial_failure() {
    let err = oneshot("10.0.0.1:443", Some(Arc::new(FailingConnector)), None, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
}
