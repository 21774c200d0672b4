//! Server, listener and session lifecycle over real TCP listeners

mod common;

use c2link::connector::TcpConnector;
use c2link::protocol::message;
use c2link::{ErrorKind, Profile, Server, Setting, State};
use common::{FailingConnector, init_tracing, send_hello, test_device};
use std::sync::Arc;
use tokio::time::{Duration, timeout};

async fn populate(server: &Server, listeners: usize, sessions: usize) -> anyhow::Result<()> {
    for l in 0..listeners {
        let listener = server
            .listen(
                &format!("listener-{l}"),
                "127.0.0.1:0",
                Some(Arc::new(TcpConnector)),
                None,
            )
            .await?;
        for s in 0..sessions {
            let device = test_device(&format!("host-{l}-{s}"));
            let reply = send_hello(listener.address(), &device).await?;
            assert_eq!(reply.id, message::COMPLETE);
            assert_eq!(reply.device, device.id);
        }
        assert_eq!(listener.connected().await.len(), sessions);
    }
    Ok(())
}

#[tokio::test]
async fn test_close_releases_everything() -> anyhow::Result<()> {
    init_tracing();

    for (listeners, sessions) in [(0, 0), (1, 0), (1, 5), (5, 5)] {
        let server = Server::new();
        populate(&server, listeners, sessions).await?;

        let opened = server.listeners().await;
        let admitted = server.connected().await;
        assert_eq!(opened.len(), listeners);
        assert_eq!(admitted.len(), listeners * sessions);

        timeout(Duration::from_secs(10), server.close()).await??;

        assert!(!server.is_active());
        assert!(server.listeners().await.is_empty());
        assert!(server.connected().await.is_empty());
        assert!(opened.iter().all(|l| !l.is_active()));
        assert!(admitted.iter().all(|s| s.state() == State::Closed));
        assert_eq!(server.to_json().await["listeners"], serde_json::json!({}));
    }
    Ok(())
}

#[tokio::test]
async fn test_duplicate_listener_name() -> anyhow::Result<()> {
    init_tracing();
    let server = Server::new();
    server
        .listen("Alpha", "127.0.0.1:0", Some(Arc::new(TcpConnector)), None)
        .await?;

    let err = server
        .listen("ALPHA", "127.0.0.1:0", Some(Arc::new(TcpConnector)), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::State);
    assert_eq!(server.listeners().await.len(), 1);

    server.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_listen_without_connector() -> anyhow::Result<()> {
    let server = Server::new();
    let err = server
        .listen("none", "127.0.0.1:0", None, Some(&Profile::default()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);

    // TLS hints need certificates, so the setting alone cannot listen
    let profile = Profile::builder().setting(Setting::tls(true)).build();
    let err = server
        .listen("tls", "127.0.0.1:0", None, Some(&profile))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);

    server.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_failed_bind_frees_name() -> anyhow::Result<()> {
    let server = Server::new();
    let err = server
        .listen("beta", "127.0.0.1:0", Some(Arc::new(FailingConnector)), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);

    let listener = server
        .listen("beta", "127.0.0.1:0", Some(Arc::new(TcpConnector)), None)
        .await?;
    assert_eq!(listener.name(), "beta");

    server.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_listener_close_keeps_server() -> anyhow::Result<()> {
    init_tracing();
    let server = Server::new();
    populate(&server, 2, 2).await?;

    let first = server.listener("listener-0").await.expect("listener-0");
    let sessions = first.connected().await;
    first.close().await;
    assert!(sessions.iter().all(|s| s.state() == State::Closed));

    let mut remaining = server.listeners().await;
    for _ in 0..50 {
        if remaining.len() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        remaining = server.listeners().await;
    }
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].name(), "listener-1");
    assert!(server.is_active());

    server.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_shutdown_packet_removes_session() -> anyhow::Result<()> {
    init_tracing();
    let server = Server::new();
    let listener = server
        .listen("gamma", "127.0.0.1:0", Some(Arc::new(TcpConnector)), None)
        .await?;

    let device = test_device("leaving");
    send_hello(listener.address(), &device).await?;
    let session = listener.connected().await.pop().expect("admitted session");

    let bye = c2link::Packet::new(message::SHUTDOWN).from_device(device.id);
    let reply = common::round_trip(listener.address(), &bye).await?;
    assert_eq!(reply.id, message::SHUTDOWN);

    timeout(Duration::from_secs(5), session.wait()).await?;
    assert_eq!(session.state(), State::Closed);
    for _ in 0..50 {
        if listener.connected().await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(listener.connected().await.is_empty());

    server.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_operations_after_close() -> anyhow::Result<()> {
    let server = Server::new();
    server.close().await?;

    let err = server
        .listen("late", "127.0.0.1:0", Some(Arc::new(TcpConnector)), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::State);

    // Closing twice is harmless
    server.close().await?;
    Ok(())
}
