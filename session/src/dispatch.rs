//! Frame dispatch.
//!
//! One entry point routes a decoded frame to its handler by message
//! variant. Handlers run synchronously inside the session's I/O task: they
//! may mutate session state, feed the multiblock engine, invoke user
//! callbacks, and queue replies. A handler answering a reply-expected
//! message echoes the incoming `messageId` with the is-reply bit set.

use lattice_wire::{CommonHeader, ErrorCode, Flags, Frame, Message, MessageType};
use tracing::{debug, warn};

use crate::session::Session;

/// Dispatch one decoded frame on its owning session.
pub(crate) fn process_frame(session: &Session, frame: Frame) {
    let header = frame.header;

    if header.flags.contains(Flags::IS_REPLY) {
        let matched = session
            .shared()
            .map(|s| s.replies.remove(session.session_id(), header.message_id))
            .unwrap_or(false);

        // Pure acknowledgments carry no state of their own; an unmatched one
        // is stale and gets discarded.
        let pure_ack = matches!(
            frame.message,
            Message::DataSingleReply | Message::HeartbeatReply | Message::DataMultiAbortReply { .. }
        );
        if pure_ack && !matched {
            debug!(
                "session {}: discarding unmatched reply (messageId {})",
                session.session_id(),
                header.message_id
            );
            return;
        }
    }

    // Post-handshake traffic must reference this session.
    if session.is_ready()
        && header.session_id != 0
        && header.session_id != session.session_id()
        && matches!(
            header.msg_type,
            MessageType::Heartbeat | MessageType::DataSingle | MessageType::DataMulti
        )
    {
        process_unknown_session(session, &header);
        return;
    }

    match frame.message {
        Message::SessionInitStart {
            offered_session_id,
            session_identifier,
        } => process_session_init_start(session, &header, offered_session_id, session_identifier),
        Message::SessionIdChange {
            old_offered_session_id,
            new_offered_session_id,
        } => process_session_id_change(
            session,
            &header,
            old_offered_session_id,
            new_offered_session_id,
        ),
        Message::SessionIdConfirm {
            confirmed_session_id,
        } => process_session_id_confirm(session, &header, confirmed_session_id),
        Message::SessionInitReply { session_id } => {
            process_session_init_reply(session, session_id)
        }
        Message::SessionCloseStart { .. } => process_session_close_start(session, &header),
        Message::SessionCloseReply { .. } => {
            debug!("session {}: close acknowledged", session.session_id());
            session.end_session(false);
        }

        Message::HeartbeatStart => {
            session.send_message(Message::HeartbeatReply, Flags::IS_REPLY, header.message_id);
        }
        Message::HeartbeatReply => {
            debug!("session {}: heartbeat answered", session.session_id());
        }

        Message::Error { code, message } => {
            warn!(
                "session {}: peer reported error {:?}: {}",
                session.session_id(),
                code,
                message
            );
            if let Some(shared) = session.shared() {
                shared.events.error_occurred(Some(session), code, &message);
            }
        }

        Message::DataSingleStatic { payload } | Message::DataSingleDynamic { payload } => {
            if let Some(shared) = session.shared() {
                shared.events.data_received(session, true, &payload);
            }
            if header.flags.contains(Flags::REPLY_EXPECTED) {
                session.send_message(Message::DataSingleReply, Flags::IS_REPLY, header.message_id);
            }
        }
        Message::DataSingleReply => {}

        Message::DataMultiInit {
            multiblock_id,
            total_size,
        } => process_data_multi_init(session, &header, multiblock_id, total_size),
        Message::DataMultiInitReply { multiblock_id, ok } => {
            process_data_multi_init_reply(session, multiblock_id, ok)
        }
        Message::DataMultiStatic {
            multiblock_id,
            total_parts,
            part_id,
            payload,
        } => {
            let ok = session
                .multiblock()
                .write_part(multiblock_id, total_parts, part_id, &payload);
            if !ok {
                multiblock_failed(
                    session,
                    format!("rejected part {part_id}/{total_parts} of multiblock {multiblock_id:#x}"),
                );
            }
        }
        Message::DataMultiFinish { multiblock_id } => {
            match session.multiblock().finish_incoming(multiblock_id) {
                Some(payload) => {
                    debug!(
                        "session {}: multiblock {:#x} complete ({} bytes)",
                        session.session_id(),
                        multiblock_id,
                        payload.len()
                    );
                    if let Some(shared) = session.shared() {
                        shared.events.data_received(session, false, &payload);
                    }
                }
                None => multiblock_failed(
                    session,
                    format!("finish for incomplete multiblock {multiblock_id:#x}"),
                ),
            }
        }
        Message::DataMultiAbortInit { multiblock_id } => {
            session.multiblock().abort_incoming(multiblock_id);
            session.send_message(
                Message::DataMultiAbortReply { multiblock_id },
                Flags::IS_REPLY,
                header.message_id,
            );
        }
        Message::DataMultiAbortReply { multiblock_id } => {
            debug!(
                "session {}: abort of multiblock {:#x} acknowledged",
                session.session_id(),
                multiblock_id
            );
        }
    }
}

/// Server side: a client offered an id and an identifier. The offered id is
/// taken when free; otherwise the server picks its own and asks the client
/// to confirm it.
fn process_session_init_start(
    session: &Session,
    header: &CommonHeader,
    offered_session_id: u32,
    session_identifier: u64,
) {
    let Some(shared) = session.shared() else {
        return;
    };
    if session.is_client_side() || session.is_ready() {
        warn!(
            "session {}: unexpected init start",
            session.session_id()
        );
        return;
    }

    // Hold the identifier across the handshake; it is not re-echoed on the
    // wire.
    session.set_identifier(session_identifier);

    if offered_session_id != 0 && shared.try_claim_session(offered_session_id, session) {
        session.make_ready(offered_session_id, session_identifier);
        session.send_message(
            Message::SessionInitReply {
                session_id: offered_session_id,
            },
            Flags::IS_REPLY,
            header.message_id,
        );
    } else {
        let new_id = shared.claim_next_session_id(session);
        session.set_session_id(new_id);
        debug!(
            "session init: offered id {} in use, proposing {}",
            offered_session_id, new_id
        );
        session.send_message(
            Message::SessionIdChange {
                old_offered_session_id: offered_session_id,
                new_offered_session_id: new_id,
            },
            Flags::IS_REPLY | Flags::REPLY_EXPECTED,
            header.message_id,
        );
    }
}

/// Client side: the server rejected the offered id; confirm the new one.
fn process_session_id_change(
    session: &Session,
    header: &CommonHeader,
    old_offered_session_id: u32,
    new_offered_session_id: u32,
) {
    let Some(shared) = session.shared() else {
        return;
    };
    if !session.is_client_side() {
        return;
    }

    shared.rekey_session(old_offered_session_id, new_offered_session_id);
    session.set_session_id(new_offered_session_id);

    session.send_message(
        Message::SessionIdConfirm {
            confirmed_session_id: new_offered_session_id,
        },
        Flags::IS_REPLY | Flags::REPLY_EXPECTED,
        header.message_id,
    );
}

/// Server side: the client confirmed the server-chosen id.
fn process_session_id_confirm(session: &Session, header: &CommonHeader, confirmed_session_id: u32) {
    if session.is_client_side() {
        return;
    }
    if confirmed_session_id != session.session_id() {
        warn!(
            "session {}: confirm for unexpected id {}",
            session.session_id(),
            confirmed_session_id
        );
        return;
    }

    session.make_ready(confirmed_session_id, session.session_identifier());
    session.send_message(
        Message::SessionInitReply {
            session_id: confirmed_session_id,
        },
        Flags::IS_REPLY,
        header.message_id,
    );
}

/// Client side: the server finalized the handshake.
fn process_session_init_reply(session: &Session, session_id: u32) {
    if !session.is_client_side() {
        return;
    }
    let old_id = session.session_id();
    if old_id != session_id {
        if let Some(shared) = session.shared() {
            shared.rekey_session(old_id, session_id);
        }
    }
    session.make_ready(session_id, session.session_identifier());
}

/// Peer asked for an orderly close: acknowledge first, then tear down
/// locally. The shutdown command queues behind the reply, so the reply
/// still reaches the wire.
fn process_session_close_start(session: &Session, header: &CommonHeader) {
    if header.flags.contains(Flags::REPLY_EXPECTED) {
        session.send_message(
            Message::SessionCloseReply {
                session_id: session.session_id(),
            },
            Flags::IS_REPLY,
            header.message_id,
        );
    }
    session.end_session(false);
}

fn process_unknown_session(session: &Session, header: &CommonHeader) {
    let text = format!("unknown session id {}", header.session_id);
    warn!("session {}: {}", session.session_id(), text);

    let message_id = session.next_message_id();
    session.send_message(
        Message::Error {
            code: ErrorCode::UnknownSession,
            message: text.clone(),
        },
        Flags::empty(),
        message_id,
    );
    if let Some(shared) = session.shared() {
        shared
            .events
            .error_occurred(Some(session), ErrorCode::UnknownSession, &text);
    }
}

/// Sender side: a transfer fell apart. Only the affected transfer is
/// aborted; the session stays up.
fn process_data_multi_init_reply(session: &Session, multiblock_id: u64, ok: bool) {
    if ok {
        if !session.multiblock().make_ready(multiblock_id) {
            debug!(
                "session {}: init reply for vanished multiblock {:#x}",
                session.session_id(),
                multiblock_id
            );
        }
    } else {
        session.multiblock().remove_outgoing(multiblock_id);
        multiblock_failed(
            session,
            format!("peer refused multiblock {multiblock_id:#x}"),
        );
    }
}

fn process_data_multi_init(
    session: &Session,
    header: &CommonHeader,
    multiblock_id: u64,
    total_size: u64,
) {
    let ok = session.multiblock().create_incoming(multiblock_id, total_size);
    if !ok {
        warn!(
            "session {}: refusing multiblock {:#x} ({} bytes)",
            session.session_id(),
            multiblock_id,
            total_size
        );
    }
    session.send_message(
        Message::DataMultiInitReply { multiblock_id, ok },
        Flags::IS_REPLY,
        header.message_id,
    );
}

fn multiblock_failed(session: &Session, text: String) {
    warn!("session {}: {}", session.session_id(), text);
    if let Some(shared) = session.shared() {
        shared
            .events
            .error_occurred(Some(session), ErrorCode::MultiblockFailed, &text);
    }
}
