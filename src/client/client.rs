//! Client path: handshake, oneshot delivery and the default dispatch target

use crate::connector::Connector;
use crate::profile::Profile;
use crate::protocol::{Flags, Packet, encode_packet, message};
use crate::server::{Dispatch, Job, Scheduler};
use crate::session::{Session, SessionParts, new_job};
use crate::util::device;
use crate::util::limits::HANDSHAKE_TIMEOUT;
use crate::util::{C2Error, Result};
use bytes::BytesMut;
use once_cell::sync::Lazy;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

static DEFAULT_ROOT: Lazy<CancellationToken> = Lazy::new(CancellationToken::new);
static DEFAULT_MUX: Lazy<Arc<Mux>> = Lazy::new(|| Arc::new(Mux::new()));

/// Root token of sessions opened through the free functions
pub fn default_root() -> &'static CancellationToken {
    &DEFAULT_ROOT
}

/// Process-wide dispatch target of client sessions
pub fn default_mux() -> Arc<Mux> {
    Arc::clone(&DEFAULT_MUX)
}

/// Dispatch target for client sessions
///
/// Tracks the client sessions that are still open and queues their packets
/// on an inner [`Scheduler`].
#[derive(Debug, Default)]
pub struct Mux {
    scheduler: Scheduler,
    sessions: Mutex<HashMap<Uuid, Session>>,
}

impl Mux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the next packet delivered to a client session
    pub async fn next(&self) -> Option<Job> {
        self.scheduler.next().await
    }

    pub fn try_next(&self) -> Option<Job> {
        self.scheduler.try_next()
    }

    /// Open client sessions
    pub fn sessions(&self) -> Vec<Session> {
        self.sessions
            .lock()
            .map(|s| s.values().cloned().collect())
            .unwrap_or_default()
    }
}

impl Dispatch for Mux {
    fn dispatch(&self, packet: Packet, session: Option<&Session>) {
        self.scheduler.dispatch(packet, session);
    }

    fn attach(&self, session: &Session) {
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.insert(session.id(), session.clone());
        }
    }

    fn detach(&self, id: Uuid) {
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.remove(&id);
        }
    }

    fn status(&self) -> serde_json::Value {
        json!({
            "sessions": self.sessions().len(),
            "jobs": self.scheduler.status(),
        })
    }
}

fn resolve_connector(
    connector: Option<Arc<dyn Connector>>,
    profile: Option<&Profile>,
) -> Result<Arc<dyn Connector>> {
    connector
        .or_else(|| profile.and_then(|p| p.setting().connector()))
        .ok_or(C2Error::NoConnector)
}

/// Hello announcing the local device, optionally carrying a first packet
fn hello(packet: Option<Packet>) -> Result<Packet> {
    let local = device::local();
    let mut payload = BytesMut::new();
    local.marshal(&mut payload);

    let mut hello = Packet::new(message::HELLO).from_device(local.id);
    hello.job = new_job();
    if let Some(mut packet) = packet {
        packet.device = local.id;
        payload.extend_from_slice(&encode_packet(&packet)?);
        hello.flags.set(Flags::DATA);
    }
    hello.payload = payload.freeze();
    Ok(hello)
}

/// Run the client handshake against `address`
///
/// The session exists from the start and moves Connecting, Handshaking,
/// Established. The handshake connection is always closed before returning.
/// On success the session is started under a child of `root` and attached to
/// `dispatch`; on failure it is closed without ever being attached.
pub async fn handshake(
    root: &CancellationToken,
    dispatch: Arc<dyn Dispatch>,
    address: &str,
    connector: Option<Arc<dyn Connector>>,
    profile: Option<&Profile>,
    packet: Option<Packet>,
) -> Result<Session> {
    let connector = resolve_connector(connector, profile)?;
    if root.is_cancelled() {
        return Err(C2Error::ServerClosed);
    }
    let profile = profile.cloned().unwrap_or_default();
    let hello = hello(packet)?;

    let session = Session::new(SessionParts {
        device: device::local().clone(),
        host: address.to_string(),
        sleep: profile.sleep(),
        jitter: profile.jitter(),
        size: profile.size(),
        pipeline: profile.pipeline(),
        connector: Some(Arc::clone(&connector)),
        dispatch: Arc::clone(&dispatch),
        cancel: root.child_token(),
    });
    if let Err(e) = greet(&session, connector.as_ref(), &profile, &hello).await {
        session.close().await;
        return Err(e);
    }

    session.start(None);
    dispatch.attach(&session);
    tracing::info!("[Client] Session {} established with {}", session.id(), address);
    Ok(session)
}

/// Dial, send the Hello and check for `Complete`
async fn greet(
    session: &Session,
    connector: &dyn Connector,
    profile: &Profile,
    hello: &Packet,
) -> Result<()> {
    let address = session.host();
    let pipeline = profile.pipeline();

    tracing::debug!("[Client] Connecting to {} over {}", address, connector.kind());
    let mut conn = connector
        .connect(address)
        .await
        .map_err(|e| C2Error::transport(format!("unable to connect to {}", address), e))?;

    let result = match session.begin_handshake() {
        Ok(()) => {
            let exchange = async {
                pipeline.write_packet(&mut conn, hello).await?;
                pipeline.read_packet(&mut conn).await
            };
            tokio::time::timeout(HANDSHAKE_TIMEOUT, exchange).await
        }
        Err(e) => Ok(Err(e)),
    };
    let _ = conn.shutdown().await;
    drop(conn);

    let reply = match result {
        Err(_) => {
            return Err(C2Error::Protocol(format!(
                "no handshake reply from {} within {:?}",
                address, HANDSHAKE_TIMEOUT
            )));
        }
        Ok(Err(C2Error::Io(e))) => {
            return Err(C2Error::transport(format!("handshake with {} failed", address), e));
        }
        Ok(Err(C2Error::InvalidPacket(reason))) => {
            return Err(C2Error::Protocol(format!(
                "invalid handshake reply from {}: {}",
                address, reason
            )));
        }
        Ok(Err(e)) => return Err(e),
        Ok(Ok(None)) => return Err(C2Error::InvalidResponse),
        Ok(Ok(Some(reply))) => reply,
    };
    if reply.id != message::COMPLETE {
        tracing::warn!(
            "[Client] {} answered the handshake with id {:#04x}",
            address,
            reply.id
        );
        return Err(C2Error::InvalidResponse);
    }
    Ok(())
}

/// Handshake with the profile's setting under the default root
pub async fn connect(address: &str, profile: &Profile) -> Result<Session> {
    connect_with(address, None, Some(profile), None).await
}

/// Handshake under the default root, dispatching to [`default_mux`]
pub async fn connect_with(
    address: &str,
    connector: Option<Arc<dyn Connector>>,
    profile: Option<&Profile>,
    packet: Option<Packet>,
) -> Result<Session> {
    handshake(
        default_root(),
        default_mux(),
        address,
        connector,
        profile,
        packet,
    )
    .await
}

/// Write a single packet flagged Oneshot and close the connection
///
/// No session is created and no reply is read. The connection is closed
/// exactly once whether or not the write succeeded.
pub async fn oneshot(
    address: &str,
    connector: Option<Arc<dyn Connector>>,
    profile: Option<&Profile>,
    packet: Option<Packet>,
) -> Result<()> {
    let connector = resolve_connector(connector, profile)?;
    let pipeline = profile.map(Profile::pipeline).unwrap_or_default();

    let local = device::local();
    let mut packet = packet.unwrap_or_else(|| Packet::nop(local.id));
    if packet.device.is_nil() {
        packet.device = local.id;
    }
    packet.flags.set(Flags::ONESHOT);

    let mut conn = connector
        .connect(address)
        .await
        .map_err(|e| C2Error::transport(format!("unable to connect to {}", address), e))?;
    let result = pipeline.write_packet(&mut conn, &packet).await;
    let _ = conn.shutdown().await;
    drop(conn);

    result.map_err(|e| match e {
        C2Error::Io(e) => C2Error::transport(format!("oneshot to {} failed", address), e),
        other => other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::decode_packet;
    use crate::session::State;
    use crate::util::{Device, ErrorKind};

    #[test]
    fn test_hello_layout() {
        let hello = hello(None).unwrap();
        assert_eq!(hello.id, message::HELLO);
        assert_eq!(hello.device, device::local().id);
        assert!(!hello.flags.has(Flags::DATA));

        let mut payload = hello.payload.clone();
        assert_eq!(&Device::unmarshal(&mut payload).unwrap(), device::local());
        assert!(payload.is_empty());
    }

    #[test]
    fn test_hello_embeds_packet() {
        let inner = Packet::with_payload(0x44, 2, bytes::Bytes::from_static(b"x"));
        let hello = hello(Some(inner)).unwrap();
        assert!(hello.flags.has(Flags::DATA));

        let mut payload = hello.payload.clone();
        Device::unmarshal(&mut payload).unwrap();
        let embedded = decode_packet(payload).unwrap();
        assert_eq!(embedded.id, 0x44);
        assert_eq!(embedded.device, device::local().id);
    }

    #[tokio::test]
    async fn test_missing_connector_is_configuration_error() {
        let err = connect_with("127.0.0.1:1", None, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        let err = oneshot("127.0.0.1:1", None, Some(&Profile::default()), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    /// Answers `Complete` and records the session state seen at connect and at the Hello
    #[derive(Debug)]
    struct Observer {
        session: Mutex<Option<Session>>,
        seen: Arc<Mutex<Vec<State>>>,
    }

    impl Observer {
        fn state(&self) -> Option<State> {
            self.session.lock().ok()?.as_ref().map(Session::state)
        }

        fn record(seen: &Mutex<Vec<State>>, state: Option<State>) {
            if let (Ok(mut seen), Some(state)) = (seen.lock(), state) {
                seen.push(state);
            }
        }
    }

    #[async_trait::async_trait]
    impl Connector for Observer {
        fn kind(&self) -> &'static str {
            "observer"
        }

        async fn connect(&self, _address: &str) -> std::io::Result<crate::Connection> {
            Self::record(&self.seen, self.state());
            let (near, mut far) = tokio::io::duplex(64 * 1024);
            let session = self.session.lock().ok().and_then(|s| s.clone());
            let seen = Arc::clone(&self.seen);
            tokio::spawn(async move {
                let pipeline = crate::Pipeline::default();
                let Ok(Some(hello)) = pipeline.read_packet(&mut far).await else {
                    return;
                };
                Self::record(&seen, session.as_ref().map(Session::state));
                let reply = Packet::new(message::COMPLETE).from_device(hello.device);
                let _ = pipeline.write_packet(&mut far, &reply).await;
            });
            Ok(Box::new(near))
        }

        async fn listen(&self, _bind: &str) -> std::io::Result<Box<dyn crate::Acceptor>> {
            Err(std::io::ErrorKind::Unsupported.into())
        }
    }

    #[tokio::test]
    async fn test_handshake_walks_every_state() {
        let observer = Observer {
            session: Mutex::new(None),
            seen: Arc::new(Mutex::new(Vec::new())),
        };
        let mux: Arc<dyn Dispatch> = Arc::new(Mux::new());
        let session = Session::new(SessionParts {
            device: device::local().clone(),
            host: "observer:1".into(),
            sleep: std::time::Duration::from_secs(60),
            jitter: 0,
            size: 4,
            pipeline: crate::Pipeline::default(),
            connector: None,
            dispatch: Arc::clone(&mux),
            cancel: CancellationToken::new(),
        });
        if let Ok(mut slot) = observer.session.lock() {
            *slot = Some(session.clone());
        }

        let hello = hello(None).unwrap();
        greet(&session, &observer, &Profile::default(), &hello)
            .await
            .unwrap();
        session.start(None);

        let seen = observer.seen.lock().unwrap().clone();
        assert_eq!(seen, vec![State::Connecting, State::Handshaking]);
        assert_eq!(session.state(), State::Established);
        session.close().await;
        assert_eq!(session.state(), State::Closed);
    }

    #[tokio::test]
    async fn test_closed_session_cannot_handshake() {
        let observer = Observer {
            session: Mutex::new(None),
            seen: Arc::new(Mutex::new(Vec::new())),
        };
        let session = Session::new(SessionParts {
            device: device::local().clone(),
            host: "observer:1".into(),
            sleep: std::time::Duration::from_secs(60),
            jitter: 0,
            size: 4,
            pipeline: crate::Pipeline::default(),
            connector: None,
            dispatch: Arc::new(Mux::new()),
            cancel: CancellationToken::new(),
        });
        // A session already past Connecting cannot handshake again
        session.close().await;
        let hello = hello(None).unwrap();
        let err = greet(&session, &observer, &Profile::default(), &hello)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Session);
        assert_eq!(session.state(), State::Closed);
    }

    #[test]
    fn test_mux_tracks_sessions() {
        let mux = Mux::new();
        assert_eq!(mux.status()["sessions"], 0);
        mux.detach(Uuid::new_v4());
        assert!(mux.sessions().is_empty());
    }
}
