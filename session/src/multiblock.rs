//! Multiblock transfer engine.
//!
//! Large payloads travel out-of-band as a coordinated frame sequence:
//! `INIT` announces the transfer, the peer answers `INIT_REPLY`, the payload
//! follows as `STATIC` parts of at most [`PART_SIZE`] bytes, and `FINISH`
//! closes it. Outbound transfers on one session are serialized through a
//! FIFO backlog drained by a single worker task; inbound transfers may run
//! concurrently because their state lives in a table keyed by id.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use bytes::{Bytes, BytesMut};
use lattice_wire::{Flags, Message};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::session::Session;

/// Fixed part payload size in bytes; the final part may be shorter.
pub const PART_SIZE: usize = 1000;

/// Upper bound on a single transfer, guarding inbound allocations.
pub const MAX_TRANSFER_SIZE: u64 = 64 * 1024 * 1024;

/// Number of parts a payload of `total_size` bytes splits into.
pub fn part_count(total_size: u64) -> u32 {
    total_size.div_ceil(PART_SIZE as u64) as u32
}

/// An outbound transfer waiting in the backlog.
#[derive(Debug)]
struct OutgoingTransfer {
    multiblock_id: u64,
    /// Set once the peer acknowledged `INIT`; the worker only pops ready
    /// front entries.
    ready: bool,
    payload: Bytes,
}

/// An inbound transfer being reassembled.
#[derive(Debug)]
struct IncomingTransfer {
    total_size: u64,
    buffer: BytesMut,
    next_part: u32,
}

/// Per-session multiblock engine. The backlog and the incoming table are
/// guarded by independent locks.
pub(crate) struct MultiblockIo {
    backlog: Mutex<VecDeque<OutgoingTransfer>>,
    incoming: Mutex<HashMap<u64, IncomingTransfer>>,
    /// Transfer the worker is currently draining, if any.
    current: Mutex<Option<u64>>,
    abort_current: AtomicBool,
    notify: Notify,
    closed: AtomicBool,
}

impl MultiblockIo {
    pub(crate) fn new() -> Self {
        Self {
            backlog: Mutex::new(VecDeque::new()),
            incoming: Mutex::new(HashMap::new()),
            current: Mutex::new(None),
            abort_current: AtomicBool::new(false),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Queue an outbound transfer and announce it to the peer.
    ///
    /// Returns the freshly generated non-zero transfer id, or `0` when the
    /// announcement could not be sent.
    pub(crate) fn create_outgoing(&self, session: &Session, data: &[u8]) -> u64 {
        let multiblock_id = random_multiblock_id();
        let total_size = data.len() as u64;

        self.backlog.lock().unwrap().push_back(OutgoingTransfer {
            multiblock_id,
            ready: false,
            payload: Bytes::copy_from_slice(data),
        });

        let message_id = session.next_message_id();
        let sent = session.send_message(
            Message::DataMultiInit {
                multiblock_id,
                total_size,
            },
            Flags::REPLY_EXPECTED,
            message_id,
        );

        if !sent {
            self.remove_outgoing(multiblock_id);
            return 0;
        }

        debug!(
            "session {}: queued multiblock {:#x} ({} bytes)",
            session.session_id(),
            multiblock_id,
            total_size
        );
        multiblock_id
    }

    /// Mark a backlog entry ready and unpark the worker. Returns `false`
    /// when the entry is gone (aborted before the peer answered).
    pub(crate) fn make_ready(&self, multiblock_id: u64) -> bool {
        let mut found = false;
        for transfer in self.backlog.lock().unwrap().iter_mut() {
            if transfer.multiblock_id == multiblock_id {
                transfer.ready = true;
                found = true;
            }
        }

        if found {
            self.notify.notify_one();
        }
        found
    }

    /// Drop a transfer from the backlog. Returns `true` when an entry was
    /// removed, meaning nothing of it ever reached the wire.
    pub(crate) fn remove_outgoing(&self, multiblock_id: u64) -> bool {
        let mut backlog = self.backlog.lock().unwrap();
        let before = backlog.len();
        backlog.retain(|t| t.multiblock_id != multiblock_id);
        before != backlog.len()
    }

    /// Flag the in-flight transfer so the worker stops between parts.
    pub(crate) fn abort_in_flight(&self, multiblock_id: u64) {
        if *self.current.lock().unwrap() == Some(multiblock_id) {
            self.abort_current.store(true, Ordering::SeqCst);
        }
    }

    /// Allocate an inbound buffer for an announced transfer.
    pub(crate) fn create_incoming(&self, multiblock_id: u64, total_size: u64) -> bool {
        if multiblock_id == 0 || total_size > MAX_TRANSFER_SIZE {
            return false;
        }

        let mut incoming = self.incoming.lock().unwrap();
        if incoming.contains_key(&multiblock_id) {
            return false;
        }

        incoming.insert(
            multiblock_id,
            IncomingTransfer {
                total_size,
                buffer: BytesMut::with_capacity(total_size as usize),
                next_part: 0,
            },
        );
        true
    }

    /// Append one part to an inbound transfer. Parts must arrive in order;
    /// any inconsistency discards the transfer and returns `false`.
    pub(crate) fn write_part(
        &self,
        multiblock_id: u64,
        total_parts: u32,
        part_id: u32,
        payload: &[u8],
    ) -> bool {
        let mut incoming = self.incoming.lock().unwrap();
        let Some(transfer) = incoming.get_mut(&multiblock_id) else {
            return false;
        };

        let consistent = part_id == transfer.next_part
            && total_parts == part_count(transfer.total_size)
            && part_id < total_parts
            && payload.len() <= PART_SIZE
            && transfer.buffer.len() + payload.len() <= transfer.total_size as usize;

        if !consistent {
            warn!(
                "multiblock {multiblock_id:#x}: dropping transfer, \
                 inconsistent part {part_id}/{total_parts} ({} bytes)",
                payload.len()
            );
            incoming.remove(&multiblock_id);
            return false;
        }

        transfer.buffer.extend_from_slice(payload);
        transfer.next_part += 1;
        true
    }

    /// Complete an inbound transfer, returning the reassembled payload.
    /// `None` means the transfer is unknown or short, and no data must be
    /// delivered.
    pub(crate) fn finish_incoming(&self, multiblock_id: u64) -> Option<Bytes> {
        let transfer = self.incoming.lock().unwrap().remove(&multiblock_id)?;
        if transfer.buffer.len() as u64 != transfer.total_size {
            warn!(
                "multiblock {multiblock_id:#x}: finish with {}/{} bytes",
                transfer.buffer.len(),
                transfer.total_size
            );
            return None;
        }
        Some(transfer.buffer.freeze())
    }

    /// Discard an inbound transfer without delivering partial data.
    pub(crate) fn abort_incoming(&self, multiblock_id: u64) -> bool {
        self.incoming.lock().unwrap().remove(&multiblock_id).is_some()
    }

    /// Drop all transfers, both directions, without callbacks.
    pub(crate) fn clear(&self) {
        self.backlog.lock().unwrap().clear();
        self.incoming.lock().unwrap().clear();
        if self.current.lock().unwrap().is_some() {
            self.abort_current.store(true, Ordering::SeqCst);
        }
    }

    /// Shut the engine down; the worker exits on its next wakeup.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.clear();
        self.notify.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Pop the front transfer if it is ready to send.
    fn pop_ready(&self) -> Option<OutgoingTransfer> {
        let mut backlog = self.backlog.lock().unwrap();
        if backlog.front().is_some_and(|t| t.ready) {
            let transfer = backlog.pop_front();
            if let Some(ref t) = transfer {
                *self.current.lock().unwrap() = Some(t.multiblock_id);
                self.abort_current.store(false, Ordering::SeqCst);
            }
            transfer
        } else {
            None
        }
    }

    fn finish_current(&self) {
        *self.current.lock().unwrap() = None;
        self.abort_current.store(false, Ordering::SeqCst);
    }
}

fn random_multiblock_id() -> u64 {
    // 0 is reserved for the implicit session-scoped transfer.
    loop {
        let id = rand::random::<u64>();
        if id != 0 {
            return id;
        }
    }
}

/// The single outbound worker of one session. Parks on the backlog and
/// drains ready transfers front to back.
pub(crate) async fn run_worker(session: Session) {
    loop {
        let io = session.multiblock();
        if io.is_closed() {
            break;
        }

        // Register interest before checking the backlog so a concurrent
        // make_ready cannot be lost.
        let notified = io.notify.notified();

        match io.pop_ready() {
            Some(transfer) => send_parts(&session, transfer),
            None => notified.await,
        }
    }

    debug!("session {}: multiblock worker stopped", session.session_id());
}

fn send_parts(session: &Session, transfer: OutgoingTransfer) {
    let io = session.multiblock();
    let total_size = transfer.payload.len();
    let total_parts = part_count(total_size as u64);
    let mut aborted = false;

    for part_id in 0..total_parts {
        if io.abort_current.load(Ordering::SeqCst) {
            aborted = true;
            break;
        }

        let offset = part_id as usize * PART_SIZE;
        let end = (offset + PART_SIZE).min(total_size);
        let message_id = session.next_message_id();
        let sent = session.send_message(
            Message::DataMultiStatic {
                multiblock_id: transfer.multiblock_id,
                total_parts,
                part_id,
                payload: transfer.payload.slice(offset..end),
            },
            Flags::empty(),
            message_id,
        );

        if !sent {
            aborted = true;
            break;
        }
    }

    if !aborted && !io.abort_current.load(Ordering::SeqCst) {
        let message_id = session.next_message_id();
        session.send_message(
            Message::DataMultiFinish {
                multiblock_id: transfer.multiblock_id,
            },
            Flags::empty(),
            message_id,
        );
        debug!(
            "session {}: multiblock {:#x} sent ({} parts, {} bytes)",
            session.session_id(),
            transfer.multiblock_id,
            total_parts,
            total_size
        );
    }

    io.finish_current();
}
