//! Process-wide session registry.
//!
//! The registry owns every active session and listener, allocates session
//! ids, and runs the shared timer service. Sessions hold a non-owning
//! handle back to the registry; dropping the registry stops the timer and
//! lets sessions wind down on their own.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::session::{Session, SessionEvents};
use crate::timer::{self, ReplyTracker};
use crate::transport::{self, IoStream};

/// Timing knobs, fixed at registry construction.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How long a reply-expected message may stay unanswered.
    pub reply_timeout: Duration,
    /// Idle window after which a ready session is probed.
    pub heartbeat_interval: Duration,
    /// Cadence of the timer sweep.
    pub tick_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(3),
            tick_interval: Duration::from_millis(100),
        }
    }
}

struct Listener {
    handle: JoinHandle<()>,
    addr: Option<SocketAddr>,
}

/// State shared between the registry, its sessions, and the timer task.
pub(crate) struct RegistryShared {
    pub(crate) config: RegistryConfig,
    pub(crate) events: Arc<dyn SessionEvents>,
    pub(crate) replies: ReplyTracker,
    sessions: Mutex<HashMap<u32, Session>>,
    listeners: Mutex<HashMap<u32, Listener>>,
    session_id_counter: AtomicU32,
    server_id_counter: AtomicU32,
    handshake_message_id: AtomicU32,
}

impl RegistryShared {
    /// Look a session up by id.
    pub(crate) fn session(&self, session_id: u32) -> Option<Session> {
        self.sessions.lock().unwrap().get(&session_id).cloned()
    }

    pub(crate) fn sessions_snapshot(&self) -> Vec<Session> {
        self.sessions.lock().unwrap().values().cloned().collect()
    }

    /// Insert `session` under `session_id` if that id is free.
    pub(crate) fn try_claim_session(&self, session_id: u32, session: &Session) -> bool {
        let mut sessions = self.sessions.lock().unwrap();
        if sessions.contains_key(&session_id) {
            return false;
        }
        sessions.insert(session_id, session.clone());
        true
    }

    /// Allocate an unused id and register `session` under it. The counter
    /// wraps; ids colliding with live sessions are skipped, as is `0`.
    pub(crate) fn claim_next_session_id(&self, session: &Session) -> u32 {
        let mut sessions = self.sessions.lock().unwrap();
        loop {
            let id = self
                .session_id_counter
                .fetch_add(1, Ordering::Relaxed)
                .wrapping_add(1);
            if id != 0 && !sessions.contains_key(&id) {
                sessions.insert(id, session.clone());
                return id;
            }
        }
    }

    /// Move a session from one id to another during the handshake.
    pub(crate) fn rekey_session(&self, old_id: u32, new_id: u32) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(session) = sessions.remove(&old_id) {
            sessions.insert(new_id, session);
        }
    }

    pub(crate) fn remove_session(&self, session_id: u32) -> Option<Session> {
        self.sessions.lock().unwrap().remove(&session_id)
    }

    /// Message ids for handshake traffic sent before a session id exists.
    pub(crate) fn next_handshake_message_id(&self) -> u32 {
        self.handshake_message_id
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1)
    }
}

/// Process-wide home of active sessions, listeners, and the shared timer.
pub struct SessionRegistry {
    shared: Arc<RegistryShared>,
    timer: JoinHandle<()>,
}

impl SessionRegistry {
    /// Create a registry and start its timer service.
    pub fn new(config: RegistryConfig, events: Arc<dyn SessionEvents>) -> Self {
        let shared = Arc::new(RegistryShared {
            replies: ReplyTracker::new(config.reply_timeout),
            config,
            events,
            sessions: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
            session_id_counter: AtomicU32::new(0),
            server_id_counter: AtomicU32::new(0),
            handshake_message_id: AtomicU32::new(0),
        });

        let timer = tokio::spawn(timer::run_timer(Arc::downgrade(&shared)));

        Self { shared, timer }
    }

    /// Open a client session over TCP and start the handshake.
    pub async fn connect_tcp(&self, addr: SocketAddr, session_identifier: u64) -> Result<Session> {
        let stream = transport::connect_tcp(addr).await?;
        info!("connected to {addr}");
        Ok(self.open_session(IoStream::Plain(stream), session_identifier))
    }

    /// Open a client session over a UNIX domain socket and start the
    /// handshake.
    #[cfg(unix)]
    pub async fn connect_uds(
        &self,
        path: &std::path::Path,
        session_identifier: u64,
    ) -> Result<Session> {
        let stream = transport::connect_uds(path).await?;
        info!("connected to {}", path.display());
        Ok(self.open_session(IoStream::Unix(stream), session_identifier))
    }

    /// Start a client session over an already-established byte channel.
    pub fn open_session(&self, stream: IoStream, session_identifier: u64) -> Session {
        let session = Session::spawn(&self.shared, stream, true);
        let offered = self.shared.claim_next_session_id(&session);
        session.begin_handshake(offered, session_identifier);
        session
    }

    /// Adopt an accepted byte channel as a server-side session. The session
    /// is registered once the peer's handshake assigns it an id.
    pub fn accept_session(&self, stream: IoStream) -> Session {
        Session::spawn(&self.shared, stream, false)
    }

    /// Listen for TCP connections, accepting each into a server session.
    /// Returns the listener id.
    pub async fn add_tcp_listener(&self, addr: SocketAddr) -> Result<u32> {
        let listener = transport::listen_tcp(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("listening on {local_addr}");

        let shared = Arc::downgrade(&self.shared);
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, peer)) => {
                        let Some(shared) = shared.upgrade() else {
                            break;
                        };
                        debug!("accepted connection from {peer}");
                        Session::spawn(&shared, IoStream::Plain(socket), false);
                    }
                    Err(e) => {
                        warn!("accept failed on {local_addr}: {e}");
                        break;
                    }
                }
            }
        });

        Ok(self.insert_listener(handle, Some(local_addr)))
    }

    /// Listen on a UNIX domain socket. Returns the listener id.
    #[cfg(unix)]
    pub fn add_uds_listener(&self, path: &std::path::Path) -> Result<u32> {
        let listener = transport::listen_uds(path)?;
        info!("listening on {}", path.display());

        let shared = Arc::downgrade(&self.shared);
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, _)) => {
                        let Some(shared) = shared.upgrade() else {
                            break;
                        };
                        Session::spawn(&shared, IoStream::Unix(socket), false);
                    }
                    Err(e) => {
                        warn!("uds accept failed: {e}");
                        break;
                    }
                }
            }
        });

        Ok(self.insert_listener(handle, None))
    }

    /// Open a client session over TLS and start the handshake.
    #[cfg(feature = "tls")]
    pub async fn connect_tls(
        &self,
        addr: SocketAddr,
        sni: &str,
        config: rustls::ClientConfig,
        session_identifier: u64,
    ) -> Result<Session> {
        let tcp = transport::connect_tcp(addr).await?;
        let stream = transport::tls::connect_tls(config, tcp, sni).await?;
        info!("connected to {addr} (tls)");
        Ok(self.open_session(stream, session_identifier))
    }

    /// Listen for TLS connections over TCP. Returns the listener id.
    #[cfg(feature = "tls")]
    pub async fn add_tls_tcp_listener(
        &self,
        addr: SocketAddr,
        config: rustls::ServerConfig,
    ) -> Result<u32> {
        let listener = transport::listen_tcp(addr).await?;
        let local_addr = listener.local_addr()?;
        let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(config));
        info!("listening on {local_addr} (tls)");

        let shared = Arc::downgrade(&self.shared);
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, peer)) => {
                        let Some(shared) = shared.upgrade() else {
                            break;
                        };
                        match transport::tls::accept_tls(&acceptor, socket).await {
                            Ok(stream) => {
                                debug!("accepted tls connection from {peer}");
                                Session::spawn(&shared, stream, false);
                            }
                            Err(e) => warn!("tls accept from {peer} failed: {e:#}"),
                        }
                    }
                    Err(e) => {
                        warn!("accept failed on {local_addr}: {e}");
                        break;
                    }
                }
            }
        });

        Ok(self.insert_listener(handle, Some(local_addr)))
    }

    /// The bound address of a TCP listener.
    pub fn listener_addr(&self, server_id: u32) -> Option<SocketAddr> {
        self.shared
            .listeners
            .lock()
            .unwrap()
            .get(&server_id)
            .and_then(|l| l.addr)
    }

    /// Stop accepting on a listener. Existing sessions stay up.
    pub fn close_listener(&self, server_id: u32) -> bool {
        match self.shared.listeners.lock().unwrap().remove(&server_id) {
            Some(listener) => {
                listener.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Look a session up by id.
    pub fn session(&self, session_id: u32) -> Option<Session> {
        self.shared.session(session_id)
    }

    /// Number of registered sessions.
    pub fn session_count(&self) -> usize {
        self.shared.sessions.lock().unwrap().len()
    }

    /// Orderly shutdown: close every session, then every listener, then the
    /// timer.
    pub fn shutdown(&self) {
        info!("registry shutting down");
        for session in self.shared.sessions_snapshot() {
            session.close_session(false);
        }

        let listeners: Vec<Listener> = {
            let mut map = self.shared.listeners.lock().unwrap();
            map.drain().map(|(_, l)| l).collect()
        };
        for listener in listeners {
            listener.handle.abort();
        }

        self.timer.abort();
    }

    fn insert_listener(&self, handle: JoinHandle<()>, addr: Option<SocketAddr>) -> u32 {
        let id = self
            .shared
            .server_id_counter
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1);
        self.shared
            .listeners
            .lock()
            .unwrap()
            .insert(id, Listener { handle, addr });
        id
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        self.timer.abort();
        for listener in self.shared.listeners.lock().unwrap().values() {
            listener.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SessionState;
    use bytes::BytesMut;
    use lattice_wire::{ErrorCode, Flags, Frame, FrameDecoder, Message};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    #[derive(Debug, Clone)]
    enum TestEvent {
        Session {
            established: bool,
            identifier: u64,
            session_id: u32,
        },
        Data {
            is_stream: bool,
            payload: Vec<u8>,
        },
        Error {
            code: ErrorCode,
            message: String,
        },
    }

    struct ChannelEvents {
        tx: mpsc::UnboundedSender<TestEvent>,
    }

    impl SessionEvents for ChannelEvents {
        fn session_changed(&self, session: &Session, established: bool, identifier: u64) {
            self.tx
                .send(TestEvent::Session {
                    established,
                    identifier,
                    session_id: session.session_id(),
                })
                .ok();
        }

        fn data_received(&self, _session: &Session, is_stream: bool, payload: &[u8]) {
            self.tx
                .send(TestEvent::Data {
                    is_stream,
                    payload: payload.to_vec(),
                })
                .ok();
        }

        fn error_occurred(&self, _session: Option<&Session>, code: ErrorCode, message: &str) {
            self.tx
                .send(TestEvent::Error {
                    code,
                    message: message.to_string(),
                })
                .ok();
        }
    }

    fn channel_events() -> (Arc<ChannelEvents>, mpsc::UnboundedReceiver<TestEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(ChannelEvents { tx }), rx)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<TestEvent>) -> TestEvent {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    fn test_config() -> RegistryConfig {
        RegistryConfig {
            reply_timeout: Duration::from_millis(400),
            heartbeat_interval: Duration::from_secs(60),
            tick_interval: Duration::from_millis(25),
        }
    }

    async fn connected_pair() -> (
        SessionRegistry,
        mpsc::UnboundedReceiver<TestEvent>,
        SessionRegistry,
        mpsc::UnboundedReceiver<TestEvent>,
        Session,
    ) {
        let (server_events, mut server_rx) = channel_events();
        let server = SessionRegistry::new(test_config(), server_events);
        let listener_id = server
            .add_tcp_listener("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = server.listener_addr(listener_id).unwrap();

        let (client_events, mut client_rx) = channel_events();
        let client = SessionRegistry::new(test_config(), client_events);
        let session = client.connect_tcp(addr, 0x11).await.unwrap();

        match next_event(&mut client_rx).await {
            TestEvent::Session {
                established: true,
                identifier: 0x11,
                ..
            } => {}
            other => panic!("unexpected client event: {other:?}"),
        }
        match next_event(&mut server_rx).await {
            TestEvent::Session {
                established: true,
                identifier: 0x11,
                ..
            } => {}
            other => panic!("unexpected server event: {other:?}"),
        }

        (server, server_rx, client, client_rx, session)
    }

    #[tokio::test]
    async fn test_handshake_and_stream_roundtrip() {
        let (server, mut server_rx, _client, mut client_rx, session) = connected_pair().await;

        assert!(matches!(
            session.state(),
            SessionState::Connected(crate::state::ConnectedState::SessionReady { active: true })
        ));
        assert!(session.is_client_side());
        assert_ne!(session.session_id(), 0);
        assert_eq!(server.session_count(), 1);

        assert!(session.send_stream_data(b"hello", true, true));
        match next_event(&mut server_rx).await {
            TestEvent::Data { is_stream, payload } => {
                assert!(is_stream);
                assert_eq!(payload, b"hello");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        // The reply clears the pending entry; no timeout may fire.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(client_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_static_stream_data() {
        let (_server, mut server_rx, _client, _client_rx, session) = connected_pair().await;

        assert!(session.send_stream_data(b"fixed stride", false, false));
        match next_event(&mut server_rx).await {
            TestEvent::Data { is_stream, payload } => {
                assert!(is_stream);
                assert_eq!(payload, b"fixed stride");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_requires_active_session() {
        let (server_events, _server_rx) = channel_events();
        let server = SessionRegistry::new(test_config(), server_events);
        let listener_id = server
            .add_tcp_listener("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = server.listener_addr(listener_id).unwrap();

        let (client_events, mut client_rx) = channel_events();
        let client = SessionRegistry::new(test_config(), client_events);
        let session = client.connect_tcp(addr, 1).await.unwrap();

        // Until the handshake completes the session is not active.
        // The race is acceptable here: either the send is rejected or the
        // ready event arrived first, so poll the state instead.
        if !session.is_ready() {
            assert!(!session.send_stream_data(b"x", false, false));
            assert_eq!(session.send_multiblock_data(b"x"), 0);
        }

        match next_event(&mut client_rx).await {
            TestEvent::Session {
                established: true, ..
            } => {}
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(session.send_stream_data(b"x", false, false));
    }

    #[tokio::test]
    async fn test_session_id_collision() {
        let (server_events, mut server_rx) = channel_events();
        let server = SessionRegistry::new(test_config(), server_events);
        let listener_id = server
            .add_tcp_listener("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = server.listener_addr(listener_id).unwrap();

        // Both client registries allocate the same first id, forcing the
        // server to hand the second one a replacement.
        let (events_a, mut rx_a) = channel_events();
        let client_a = SessionRegistry::new(test_config(), events_a);
        let session_a = client_a.connect_tcp(addr, 0xA).await.unwrap();
        next_event(&mut rx_a).await;
        next_event(&mut server_rx).await;

        let (events_b, mut rx_b) = channel_events();
        let client_b = SessionRegistry::new(test_config(), events_b);
        let session_b = client_b.connect_tcp(addr, 0xB).await.unwrap();

        match next_event(&mut rx_b).await {
            TestEvent::Session {
                established: true,
                identifier: 0xB,
                session_id,
            } => {
                assert_ne!(session_id, session_a.session_id());
                assert_eq!(session_id, session_b.session_id());
            }
            other => panic!("unexpected event: {other:?}"),
        }
        match next_event(&mut server_rx).await {
            TestEvent::Session {
                established: true,
                identifier: 0xB,
                session_id,
            } => assert_eq!(session_id, session_b.session_id()),
            other => panic!("unexpected event: {other:?}"),
        }

        assert_eq!(server.session_count(), 2);
        assert!(session_b.send_stream_data(b"after id change", true, false));
        match next_event(&mut server_rx).await {
            TestEvent::Data { payload, .. } => assert_eq!(payload, b"after id change"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_multiblock_roundtrip() {
        let (_server, mut server_rx, _client, _client_rx, session) = connected_pair().await;

        let payload: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
        let multiblock_id = session.send_multiblock_data(&payload);
        assert_ne!(multiblock_id, 0);

        match next_event(&mut server_rx).await {
            TestEvent::Data { is_stream, payload: received } => {
                assert!(!is_stream);
                assert_eq!(received, payload);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_multiblock_delivers_empty_payload() {
        let (_server, mut server_rx, _client, _client_rx, session) = connected_pair().await;

        let multiblock_id = session.send_multiblock_data(&[]);
        assert_ne!(multiblock_id, 0);

        match next_event(&mut server_rx).await {
            TestEvent::Data { is_stream, payload } => {
                assert!(!is_stream);
                assert!(payload.is_empty());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_orderly_close_with_reply() {
        let (server, mut server_rx, _client, mut client_rx, session) = connected_pair().await;

        assert!(session.close_session(true));

        match next_event(&mut server_rx).await {
            TestEvent::Session {
                established: false, ..
            } => {}
            other => panic!("unexpected event: {other:?}"),
        }
        match next_event(&mut client_rx).await {
            TestEvent::Session {
                established: false, ..
            } => {}
            other => panic!("unexpected event: {other:?}"),
        }

        assert_eq!(session.state(), SessionState::NotConnected);
        // Closing an already-closed session is a no-op.
        assert!(!session.close_session(false));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.session_count(), 0);
    }

    #[tokio::test]
    async fn test_immediate_close() {
        let (_server, mut server_rx, _client, mut client_rx, session) = connected_pair().await;

        assert!(session.close_session(false));
        assert_eq!(session.state(), SessionState::NotConnected);

        match next_event(&mut client_rx).await {
            TestEvent::Session {
                established: false, ..
            } => {}
            other => panic!("unexpected event: {other:?}"),
        }
        match next_event(&mut server_rx).await {
            TestEvent::Session {
                established: false, ..
            } => {}
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_registry_shutdown_closes_sessions() {
        let (_server, _server_rx, client, mut client_rx, session) = connected_pair().await;

        client.shutdown();
        match next_event(&mut client_rx).await {
            TestEvent::Session {
                established: false, ..
            } => {}
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(session.state(), SessionState::NotConnected);
        assert_eq!(client.session_count(), 0);
    }

    /// Drive the server half of the handshake by hand, then go silent so
    /// reply-expected messages run into their deadline.
    async fn silent_peer(listener: tokio::net::TcpListener) {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::new();

        loop {
            if socket.read_buf(&mut buf).await.unwrap() == 0 {
                return;
            }
            while let Some(frame) = decoder.decode(&mut buf).unwrap() {
                if let Message::SessionInitStart {
                    offered_session_id, ..
                } = frame.message
                {
                    let reply = Frame::new(
                        Message::SessionInitReply {
                            session_id: offered_session_id,
                        },
                        offered_session_id,
                        frame.header.message_id,
                        Flags::IS_REPLY,
                    );
                    socket.write_all(&reply.encode()).await.unwrap();
                }
                // Everything after the handshake is ignored.
            }
        }
    }

    #[tokio::test]
    async fn test_message_timeout_fires_once() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(silent_peer(listener));

        let (client_events, mut client_rx) = channel_events();
        let client = SessionRegistry::new(test_config(), client_events);
        let session = client.connect_tcp(addr, 7).await.unwrap();

        match next_event(&mut client_rx).await {
            TestEvent::Session {
                established: true, ..
            } => {}
            other => panic!("unexpected event: {other:?}"),
        }

        assert!(session.send_stream_data(b"ping", false, true));

        match next_event(&mut client_rx).await {
            TestEvent::Error { code, message } => {
                assert_eq!(code, ErrorCode::MessageTimeout);
                assert!(message.contains("messageId"), "message: {message}");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        // Exactly one timeout per outstanding request.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(client_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_heartbeat_timeout_on_silent_peer() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(silent_peer(listener));

        let config = RegistryConfig {
            reply_timeout: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(150),
            tick_interval: Duration::from_millis(25),
        };
        let (client_events, mut client_rx) = channel_events();
        let client = SessionRegistry::new(config, client_events);
        let _session = client.connect_tcp(addr, 7).await.unwrap();

        match next_event(&mut client_rx).await {
            TestEvent::Session {
                established: true, ..
            } => {}
            other => panic!("unexpected event: {other:?}"),
        }

        // The idle session gets probed; the silent peer never answers.
        match next_event(&mut client_rx).await {
            TestEvent::Error { code, message } => {
                assert_eq!(code, ErrorCode::MessageTimeout);
                assert!(message.contains("Heartbeat"), "message: {message}");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_abrupt_disconnect_tears_down() {
        let (server_events, mut server_rx) = channel_events();
        let server = SessionRegistry::new(test_config(), server_events);
        let listener_id = server
            .add_tcp_listener("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = server.listener_addr(listener_id).unwrap();

        // A hand-rolled client offering id 42; the server has it free and
        // accepts it verbatim.
        let mut socket = tokio::net::TcpStream::connect(addr).await.unwrap();
        let init = Frame::new(
            Message::SessionInitStart {
                offered_session_id: 42,
                session_identifier: 0x11,
            },
            42,
            1,
            Flags::REPLY_EXPECTED,
        );
        socket.write_all(&init.encode()).await.unwrap();

        match next_event(&mut server_rx).await {
            TestEvent::Session {
                established: true,
                identifier: 0x11,
                session_id: 42,
            } => {}
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(server.session(42).is_some());

        // Vanish without a close handshake; the server tears down locally.
        drop(socket);
        match next_event(&mut server_rx).await {
            TestEvent::Session {
                established: false, ..
            } => {}
            other => panic!("unexpected event: {other:?}"),
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.session_count(), 0);
    }

    #[tokio::test]
    async fn test_close_listener_stops_accepting() {
        let (server_events, _server_rx) = channel_events();
        let server = SessionRegistry::new(test_config(), server_events);
        let listener_id = server
            .add_tcp_listener("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = server.listener_addr(listener_id).unwrap();

        assert!(server.close_listener(listener_id));
        assert!(!server.close_listener(listener_id));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let result = tokio::net::TcpStream::connect(addr).await;
        if let Ok(mut stream) = result {
            // The port may still accept the TCP handshake briefly, but the
            // connection must be dead: no session layer behind it.
            let mut buf = [0u8; 1];
            let read = timeout(Duration::from_secs(1), stream.read(&mut buf)).await;
            assert!(matches!(read, Ok(Ok(0)) | Ok(Err(_)) | Err(_)));
        }
    }
}
