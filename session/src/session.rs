//! Per-connection session object and its I/O loop.
//!
//! A [`Session`] is a cheap handle around shared per-connection state: the
//! lifecycle state machine, the message-id counter, the multiblock engine,
//! and the outbound channel into the I/O task. The I/O task owns the
//! transport stream, reads bytes into the inbound buffer, and dispatches
//! complete frames inline.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use lattice_wire::{ErrorCode, Flags, Frame, FrameDecoder, Message, WireError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::dispatch;
use crate::multiblock::{self, MultiblockIo};
use crate::registry::RegistryShared;
use crate::state::{SessionState, StateMachine, Transition};
use crate::transport::IoStream;

/// Callbacks a session invokes towards the application.
///
/// All three are called synchronously from library tasks; implementations
/// should hand work off instead of blocking.
pub trait SessionEvents: Send + Sync {
    /// A session became ready (`established = true`) or went away. The
    /// identifier is the opaque value the initiator passed when opening.
    fn session_changed(&self, session: &Session, established: bool, identifier: u64);

    /// A complete message arrived: a single-block frame (`is_stream = true`)
    /// or a reassembled multiblock payload (`is_stream = false`).
    fn data_received(&self, session: &Session, is_stream: bool, payload: &[u8]);

    /// An error surfaced. `session` is `None` for pre-session framing
    /// errors.
    fn error_occurred(&self, session: Option<&Session>, code: ErrorCode, message: &str);
}

/// Counters describing one session's traffic.
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    /// Total bytes received.
    pub bytes_in: u64,
    /// Total bytes sent.
    pub bytes_out: u64,
    /// Number of frames received.
    pub frames_in: u64,
    /// Number of frames sent.
    pub frames_out: u64,
    /// Timestamp of the last received frame.
    pub last_frame_in: Option<Instant>,
    /// Timestamp of the last sent frame.
    pub last_frame_out: Option<Instant>,
}

/// Commands consumed by the I/O task.
pub(crate) enum WriteCommand {
    /// Write an encoded frame to the transport.
    Frame(Bytes),
    /// Flush, shut the transport down, and exit the loop.
    Shutdown,
}

pub(crate) struct SessionInner {
    registry: Weak<RegistryShared>,
    client_side: bool,
    state: Mutex<StateMachine>,
    session_id: AtomicU32,
    session_identifier: AtomicU64,
    message_id: AtomicU32,
    multiblock: MultiblockIo,
    outbound: mpsc::UnboundedSender<WriteCommand>,
    stats: Mutex<SessionStats>,
    heartbeat_mark: Mutex<Instant>,
    peer: String,
}

/// Handle to one logical conversation over one transport.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Create the session state and spawn its I/O and multiblock worker
    /// tasks. The transport is already established, so the state machine
    /// moves straight to `Connected`.
    pub(crate) fn spawn(
        shared: &Arc<RegistryShared>,
        stream: IoStream,
        client_side: bool,
    ) -> Session {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let peer = stream.peer_label();

        let session = Session {
            inner: Arc::new(SessionInner {
                registry: Arc::downgrade(shared),
                client_side,
                state: Mutex::new(StateMachine::new()),
                session_id: AtomicU32::new(0),
                session_identifier: AtomicU64::new(0),
                message_id: AtomicU32::new(0),
                multiblock: MultiblockIo::new(),
                outbound: outbound_tx,
                stats: Mutex::new(SessionStats::default()),
                heartbeat_mark: Mutex::new(Instant::now()),
                peer,
            }),
        };

        session
            .inner
            .state
            .lock()
            .unwrap()
            .apply(Transition::Connect);

        tokio::spawn(run_io(session.clone(), stream, outbound_rx));
        tokio::spawn(multiblock::run_worker(session.clone()));

        session
    }

    /// Send one single-block message. `dynamic` selects the exact-length
    /// frame over the padded one, at the cost of a copy on decode;
    /// `reply_expected` registers the message for timeout tracking.
    ///
    /// Returns `false` iff the session is not `Active`.
    pub fn send_stream_data(&self, data: &[u8], dynamic: bool, reply_expected: bool) -> bool {
        if !self.inner.state.lock().unwrap().is_active() {
            return false;
        }

        let payload = Bytes::copy_from_slice(data);
        let message = if dynamic {
            Message::DataSingleDynamic { payload }
        } else {
            Message::DataSingleStatic { payload }
        };
        let flags = if reply_expected {
            Flags::REPLY_EXPECTED
        } else {
            Flags::empty()
        };

        let message_id = self.next_message_id();
        self.send_message(message, flags, message_id)
    }

    /// Hand a large payload to the multiblock engine. Returns the transfer
    /// id, or `0` when the session is not `Active` or the announcement could
    /// not be sent.
    pub fn send_multiblock_data(&self, data: &[u8]) -> u64 {
        if !self.inner.state.lock().unwrap().is_active() {
            return 0;
        }
        self.inner.multiblock.create_outgoing(self, data)
    }

    /// Cancel an outbound multiblock transfer. A transfer still waiting in
    /// the backlog is dropped silently; once anything reached the wire the
    /// peer is told to discard its inbound buffer.
    pub fn abort_messages(&self, multiblock_id: u64) {
        if self.inner.multiblock.remove_outgoing(multiblock_id) {
            debug!(
                "session {}: multiblock {:#x} aborted before transmission",
                self.session_id(),
                multiblock_id
            );
            return;
        }

        self.inner.multiblock.abort_in_flight(multiblock_id);
        let message_id = self.next_message_id();
        self.send_message(
            Message::DataMultiAbortInit { multiblock_id },
            Flags::REPLY_EXPECTED,
            message_id,
        );
    }

    /// Orderly teardown. With `reply_expected` the session stays up until
    /// the peer acknowledges with a close reply; otherwise the state machine
    /// is in `NotConnected` and the transport is closing by return.
    ///
    /// Returns `false` when the session is not ready (closing twice is a
    /// no-op).
    pub fn close_session(&self, reply_expected: bool) -> bool {
        if !self.inner.state.lock().unwrap().is_ready() {
            return false;
        }

        // Outstanding transfers are cancelled without callbacks.
        self.inner.multiblock.clear();

        if reply_expected {
            let message_id = self.next_message_id();
            self.send_message(
                Message::SessionCloseStart {
                    session_id: self.session_id(),
                    reply_expected: true,
                },
                Flags::REPLY_EXPECTED,
                message_id,
            )
        } else {
            self.end_session(true)
        }
    }

    /// The id of this session, `0` while unassigned.
    pub fn session_id(&self) -> u32 {
        self.inner.session_id.load(Ordering::Relaxed)
    }

    /// Whether this endpoint initiated the connection.
    pub fn is_client_side(&self) -> bool {
        self.inner.client_side
    }

    /// The opaque identifier chosen by the initiator.
    pub fn session_identifier(&self) -> u64 {
        self.inner.session_identifier.load(Ordering::Relaxed)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.inner.state.lock().unwrap().current()
    }

    /// Snapshot of the traffic counters.
    pub fn stats(&self) -> SessionStats {
        self.inner.stats.lock().unwrap().clone()
    }

    // ---- crate-internal surface ----------------------------------------

    pub(crate) fn shared(&self) -> Option<Arc<RegistryShared>> {
        self.inner.registry.upgrade()
    }

    pub(crate) fn multiblock(&self) -> &MultiblockIo {
        &self.inner.multiblock
    }

    pub(crate) fn set_session_id(&self, session_id: u32) {
        self.inner.session_id.store(session_id, Ordering::Relaxed);
    }

    pub(crate) fn set_identifier(&self, identifier: u64) {
        self.inner
            .session_identifier
            .store(identifier, Ordering::Relaxed);
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.inner.state.lock().unwrap().is_ready()
    }

    /// Increase the message-id counter and return the new id. Wraps.
    pub(crate) fn next_message_id(&self) -> u32 {
        self.inner
            .message_id
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1)
    }

    /// Kick off the client half of the handshake.
    pub(crate) fn begin_handshake(&self, offered_session_id: u32, identifier: u64) {
        self.set_session_id(offered_session_id);
        self.set_identifier(identifier);

        let message_id = self
            .shared()
            .map(|s| s.next_handshake_message_id())
            .unwrap_or(1);

        debug!(
            "session: offering id {} to {} (identifier {:#x})",
            offered_session_id, self.inner.peer, identifier
        );
        self.send_message(
            Message::SessionInitStart {
                offered_session_id,
                session_identifier: identifier,
            },
            Flags::REPLY_EXPECTED,
            message_id,
        );
    }

    /// Enter `SessionReady` and notify the application.
    pub(crate) fn make_ready(&self, session_id: u32, identifier: u64) -> bool {
        if !self
            .inner
            .state
            .lock()
            .unwrap()
            .apply(Transition::StartSession)
        {
            return false;
        }

        self.set_session_id(session_id);
        self.set_identifier(identifier);
        self.mark_activity();

        debug!(
            "session {} ready with {} (identifier {:#x})",
            session_id, self.inner.peer, identifier
        );
        if let Some(shared) = self.shared() {
            shared.events.session_changed(self, true, identifier);
        }
        true
    }

    /// Stop the session, optionally telling the peer, and disconnect.
    pub(crate) fn end_session(&self, init: bool) -> bool {
        if !self
            .inner
            .state
            .lock()
            .unwrap()
            .apply(Transition::StopSession)
        {
            return false;
        }

        debug!("session {}: closing", self.session_id());
        if let Some(shared) = self.shared() {
            shared
                .events
                .session_changed(self, false, self.session_identifier());
        }

        if init {
            let message_id = self.next_message_id();
            self.send_message(
                Message::SessionCloseStart {
                    session_id: self.session_id(),
                    reply_expected: false,
                },
                Flags::empty(),
                message_id,
            );
        }

        self.cleanup();
        self.disconnect()
    }

    /// Local teardown without any wire traffic: abrupt disconnects and
    /// post-error paths. Idempotent.
    pub(crate) fn teardown_local(&self) {
        let was_ready = self
            .inner
            .state
            .lock()
            .unwrap()
            .apply(Transition::StopSession);

        if was_ready {
            if let Some(shared) = self.shared() {
                shared
                    .events
                    .session_changed(self, false, self.session_identifier());
            }
        }

        if self
            .inner
            .state
            .lock()
            .unwrap()
            .apply(Transition::Disconnect)
        {
            self.cleanup();
            let _ = self.inner.outbound.send(WriteCommand::Shutdown);
        }
    }

    /// Handle a framing error: best-effort error frame to the peer, error
    /// callback, then teardown.
    pub(crate) fn fail_framing(&self, err: &WireError) {
        if !self.inner.state.lock().unwrap().is_connected() {
            return;
        }

        let code = err.error_code();
        let text = err.to_string();
        warn!(
            "session {} ({}): framing error: {}",
            self.session_id(),
            self.inner.peer,
            text
        );

        let message_id = self.next_message_id();
        self.send_message(
            Message::Error {
                code,
                message: text.clone(),
            },
            Flags::empty(),
            message_id,
        );

        if let Some(shared) = self.shared() {
            let session = (self.session_id() != 0).then_some(self);
            shared.events.error_occurred(session, code, &text);
        }

        self.teardown_local();
    }

    /// Serialize and queue a frame; reply-expected messages are registered
    /// with the timer service first.
    pub(crate) fn send_message(&self, message: Message, flags: Flags, message_id: u32) -> bool {
        if flags.contains(Flags::REPLY_EXPECTED) {
            if let Some(shared) = self.shared() {
                let (msg_type, sub_type) = message.kind();
                shared
                    .replies
                    .add(self.session_id(), message_id, msg_type, sub_type);
            }
        }

        let frame = Frame::new(message, self.session_id(), message_id, flags);
        let bytes = frame.encode();

        {
            let mut stats = self.inner.stats.lock().unwrap();
            stats.bytes_out += bytes.len() as u64;
            stats.frames_out += 1;
            stats.last_frame_out = Some(Instant::now());
        }

        self.inner.outbound.send(WriteCommand::Frame(bytes)).is_ok()
    }

    /// Probe the peer. Only permitted while the session is ready.
    pub(crate) fn send_heartbeat(&self) -> bool {
        if !self.inner.state.lock().unwrap().is_ready() {
            return false;
        }

        self.mark_activity();
        debug!("session {}: sending heartbeat", self.session_id());
        let message_id = self.next_message_id();
        self.send_message(Message::HeartbeatStart, Flags::REPLY_EXPECTED, message_id)
    }

    pub(crate) fn heartbeat_due(&self, interval: Duration) -> bool {
        self.inner.state.lock().unwrap().is_ready()
            && self.inner.heartbeat_mark.lock().unwrap().elapsed() >= interval
    }

    pub(crate) fn mark_activity(&self) {
        *self.inner.heartbeat_mark.lock().unwrap() = Instant::now();
    }

    pub(crate) fn peer(&self) -> &str {
        &self.inner.peer
    }

    fn cleanup(&self) {
        if let Some(shared) = self.shared() {
            shared.remove_session(self.session_id());
            shared.replies.remove_session(self.session_id());
        }
        self.inner.multiblock.close();
    }

    fn disconnect(&self) -> bool {
        if self
            .inner
            .state
            .lock()
            .unwrap()
            .apply(Transition::Disconnect)
        {
            let _ = self.inner.outbound.send(WriteCommand::Shutdown);
            true
        } else {
            false
        }
    }

    fn note_inbound_bytes(&self, n: usize) {
        self.inner.stats.lock().unwrap().bytes_in += n as u64;
    }

    fn note_inbound_frame(&self) {
        let mut stats = self.inner.stats.lock().unwrap();
        stats.frames_in += 1;
        stats.last_frame_in = Some(Instant::now());
        drop(stats);
        self.mark_activity();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id())
            .field("client_side", &self.inner.client_side)
            .field("peer", &self.inner.peer)
            .finish()
    }
}

/// Per-transport I/O task: reads bytes into the inbound buffer, dispatches
/// complete frames inline, and drains the outbound channel.
async fn run_io(
    session: Session,
    mut stream: IoStream,
    mut outbound_rx: mpsc::UnboundedReceiver<WriteCommand>,
) {
    let mut decoder = FrameDecoder::new();
    let mut read_buf = BytesMut::with_capacity(64 * 1024);

    loop {
        tokio::select! {
            biased;

            cmd = outbound_rx.recv() => {
                match cmd {
                    Some(WriteCommand::Frame(bytes)) => {
                        if let Err(e) = stream.write_all(&bytes).await {
                            warn!("session {}: write failed: {}", session.session_id(), e);
                            session.teardown_local();
                            break;
                        }
                    }
                    Some(WriteCommand::Shutdown) | None => {
                        let _ = stream.shutdown().await;
                        break;
                    }
                }
            }

            read = stream.read_buf(&mut read_buf) => {
                match read {
                    Ok(0) => {
                        debug!(
                            "session {}: peer {} disconnected",
                            session.session_id(),
                            session.peer()
                        );
                        session.teardown_local();
                        break;
                    }
                    Ok(n) => {
                        session.note_inbound_bytes(n);

                        loop {
                            match decoder.decode(&mut read_buf) {
                                Ok(Some(frame)) => {
                                    session.note_inbound_frame();
                                    dispatch::process_frame(&session, frame);
                                }
                                Ok(None) => break,
                                Err(err) => {
                                    // Queue the error frame and shutdown; the
                                    // biased select drains both before the
                                    // next read.
                                    session.fail_framing(&err);
                                    break;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        warn!("session {}: read failed: {}", session.session_id(), e);
                        session.teardown_local();
                        break;
                    }
                }
            }
        }
    }

    debug!(
        "session {}: io loop ended ({})",
        session.session_id(),
        session.peer()
    );
}
