use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use crate::dispatch::{ReplyCallback, StateTag};
use crate::error::TransportError;
use crate::host_registry::HostId;
use crate::protocol::{DgramHeader, Niceness};
use crate::seq_bitmap::SeqBitmap;
use crate::slot_table::SlotHandle;

/// Identity of a transaction within the server. Transaction ids are only
/// unique per peer and direction, so the peer address and the direction are
/// part of the key.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct SlotKey {
    pub trans_id: u32,
    pub peer: SocketAddr,
    /// true for transactions the peer initiated.
    pub incoming: bool,
}

impl SlotKey {
    pub(crate) fn unused() -> SlotKey {
        SlotKey {
            trans_id: 0,
            peer: SocketAddr::from(([0, 0, 0, 0], 0)),
            incoming: false,
        }
    }
}

/// Which intrusive list a slot is currently threaded on. `Detached` is the
/// transient state while user code (callback or handler) runs for the slot.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum ListId {
    Free,
    Active,
    Ready,
    Detached,
}

/// Coarse progress of a transaction, exposed in slot snapshots.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SlotPhase {
    /// Outgoing: request datagrams on the wire, not all acked.
    SendingRequest,
    /// Outgoing: request fully acked, no reply datagram seen yet.
    AwaitingReply,
    /// Outgoing: reply partially reassembled.
    ReceivingReply,
    /// Outgoing: outcome determined, callback not yet invoked.
    Resolved,
    /// Incoming: request partially reassembled.
    ReceivingRequest,
    /// Incoming: request complete, handler not yet invoked.
    HandlerReady,
    /// Incoming: handler invoked, no reply posted yet.
    AwaitingHandlerReply,
    /// Incoming: reply datagrams on the wire, not all acked.
    SendingReply,
}

pub(crate) enum AckOutcome {
    /// Newly acknowledged; `all` is true once every send-half datagram is
    /// acked.
    Acked { all: bool },
    /// The datagram was already acked; window occupancy is unchanged.
    Duplicate,
    /// Not a datagram we ever sent; dropped.
    Ignored,
}

#[derive(Debug)]
pub(crate) enum RecvOutcome {
    Recorded { complete: bool },
    Duplicate,
}

/// The record of one in-flight transaction. A slot owns the send-half
/// framing state, the receive-half reassembly state, all per-transaction
/// timers, and the completion callback; it is threaded on the slot table's
/// intrusive lists through the `next`/`prev`/`list` fields.
pub(crate) struct Slot {
    pub(crate) next: Option<SlotHandle>,
    pub(crate) prev: Option<SlotHandle>,
    pub(crate) list: ListId,

    pub(crate) key: SlotKey,
    pub(crate) phase: SlotPhase,
    pub(crate) msg_type: u8,
    pub(crate) niceness: Niceness,
    pub(crate) tag: StateTag,
    pub(crate) host_id: Option<HostId>,

    // send half
    pub(crate) send_buf: Bytes,
    pub(crate) send_total: u16,
    pub(crate) send_is_error: bool,
    pub(crate) acked: SeqBitmap,
    pub(crate) resend: SeqBitmap,
    pub(crate) next_to_send: u16,
    /// Datagrams sent at least once and not yet acked (window occupancy).
    pub(crate) outstanding: u16,
    pub(crate) any_ack_received: bool,

    // receive half
    pub(crate) read_buf: Vec<u8>,
    pub(crate) read_len: usize,
    pub(crate) received: SeqBitmap,
    pub(crate) recv_total: Option<u16>,
    pub(crate) recv_last_len: usize,
    /// ACKs that could not be emitted eagerly (socket pushed back).
    pub(crate) pending_acks: SeqBitmap,

    // timers
    pub(crate) created_at: Instant,
    pub(crate) last_send_time: Instant,
    pub(crate) last_recv_time: Instant,
    pub(crate) next_resend_time: Instant,
    pub(crate) deadline: Instant,
    pub(crate) backoff: Duration,
    /// Datagrams actually retransmitted on the wire.
    pub(crate) resend_count: u32,
    /// Retransmit rounds started by the sweep for the current message half.
    pub(crate) resend_rounds: u32,
    /// `None` means retransmit until the deadline.
    pub(crate) max_resends: Option<u32>,

    pub(crate) error: Option<TransportError>,
    pub(crate) callback: Option<ReplyCallback>,
    pub(crate) reply_posted: bool,

    pub(crate) bytes_sent: u64,
    pub(crate) bytes_received: u64,
}

impl Debug for Slot {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Slot{{{:?} {:?} msg_type:{}}}", self.key, self.phase, self.msg_type)
    }
}

impl Slot {
    pub(crate) fn unused() -> Slot {
        let never = Instant::now();
        Slot {
            next: None,
            prev: None,
            list: ListId::Free,
            key: SlotKey::unused(),
            phase: SlotPhase::SendingRequest,
            msg_type: 0,
            niceness: Niceness::Low,
            tag: StateTag(0),
            host_id: None,
            send_buf: Bytes::new(),
            send_total: 0,
            send_is_error: false,
            acked: SeqBitmap::default(),
            resend: SeqBitmap::default(),
            next_to_send: 0,
            outstanding: 0,
            any_ack_received: false,
            read_buf: Vec::new(),
            read_len: 0,
            received: SeqBitmap::default(),
            recv_total: None,
            recv_last_len: 0,
            pending_acks: SeqBitmap::default(),
            created_at: never,
            last_send_time: never,
            last_recv_time: never,
            next_resend_time: never,
            deadline: never,
            backoff: Duration::ZERO,
            resend_count: 0,
            resend_rounds: 0,
            max_resends: None,
            error: None,
            callback: None,
            reply_posted: false,
            bytes_sent: 0,
            bytes_received: 0,
        }
    }

    /// Clear everything except the intrusive-list threading, which is owned
    /// by the slot table.
    pub(crate) fn reset(&mut self) {
        let links = (self.next, self.prev, self.list);
        *self = Slot::unused();
        (self.next, self.prev, self.list) = links;
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn prime_outgoing(
        &mut self,
        key: SlotKey,
        msg_type: u8,
        niceness: Niceness,
        tag: StateTag,
        host_id: Option<HostId>,
        msg: Bytes,
        max_payload: usize,
        callback: ReplyCallback,
        now: Instant,
        timeout: Duration,
        backoff: Duration,
        max_resends: Option<u32>,
    ) {
        self.reset();
        self.key = key;
        self.phase = SlotPhase::SendingRequest;
        self.msg_type = msg_type;
        self.niceness = niceness;
        self.tag = tag;
        self.host_id = host_id;
        self.callback = Some(callback);
        self.frame_send(msg, false, max_payload);
        self.init_timers(now, timeout, backoff);
    }

    pub(crate) fn prime_incoming(
        &mut self,
        key: SlotKey,
        msg_type: u8,
        niceness: Niceness,
        now: Instant,
        timeout: Duration,
        backoff: Duration,
    ) {
        self.reset();
        self.key = key;
        self.phase = SlotPhase::ReceivingRequest;
        self.msg_type = msg_type;
        self.niceness = niceness;
        self.init_timers(now, timeout, backoff);
    }

    /// Post the reply of an incoming transaction: the send half is framed
    /// anew and the deadline restarts for the reply delivery.
    pub(crate) fn install_reply(
        &mut self,
        msg: Bytes,
        is_error: bool,
        max_payload: usize,
        now: Instant,
        timeout: Duration,
        backoff: Duration,
    ) {
        self.frame_send(msg, is_error, max_payload);
        self.phase = SlotPhase::SendingReply;
        self.reply_posted = true;
        self.any_ack_received = false;
        self.resend_count = 0;
        self.resend_rounds = 0;
        self.init_timers(now, timeout, backoff);
    }

    fn init_timers(&mut self, now: Instant, timeout: Duration, backoff: Duration) {
        self.created_at = now;
        self.last_send_time = now;
        self.last_recv_time = now;
        self.next_resend_time = now + backoff;
        self.deadline = now + timeout;
        self.backoff = backoff;
    }

    fn frame_send(&mut self, msg: Bytes, is_error: bool, max_payload: usize) {
        let total = crate::protocol::dgram_count(msg.len(), max_payload) as u16;
        self.send_buf = msg;
        self.send_total = total;
        self.send_is_error = is_error;
        self.acked = SeqBitmap::new(total);
        self.resend = SeqBitmap::new(total);
        self.next_to_send = 0;
        self.outstanding = 0;
    }

    // --- send half -------------------------------------------------------

    pub(crate) fn dgram_payload(&self, n: u16, max_payload: usize) -> &[u8] {
        let start = n as usize * max_payload;
        let end = (start + max_payload).min(self.send_buf.len());
        &self.send_buf[start.min(self.send_buf.len())..end]
    }

    /// Next never-sent datagram, if the send half has one.
    pub(crate) fn next_fresh(&self) -> Option<u16> {
        (self.next_to_send < self.send_total).then_some(self.next_to_send)
    }

    pub(crate) fn all_send_acked(&self) -> bool {
        self.send_total > 0 && self.acked.is_full()
    }

    pub(crate) fn record_ack(&mut self, n: u16, now: Instant, initial_backoff: Duration) -> AckOutcome {
        if n >= self.next_to_send {
            // never sent, nothing to acknowledge
            return AckOutcome::Ignored;
        }
        if !self.acked.set(n) {
            return AckOutcome::Duplicate;
        }

        self.resend.clear(n);
        self.outstanding -= 1;
        self.any_ack_received = true;
        self.backoff = initial_backoff;
        self.last_recv_time = now;
        AckOutcome::Acked { all: self.all_send_acked() }
    }

    /// Flag every sent-but-unacked datagram for retransmission. Returns how
    /// many were newly flagged.
    pub(crate) fn mark_resends(&mut self, now: Instant) -> u32 {
        let mut marked = 0;
        for n in 0..self.next_to_send {
            if !self.acked.get(n) && self.resend.set(n) {
                marked += 1;
            }
        }
        if marked > 0 {
            self.next_resend_time = now;
        }
        marked
    }

    pub(crate) fn data_header(&self, n: u16) -> DgramHeader {
        DgramHeader {
            trans_id: self.key.trans_id,
            msg_type: self.msg_type,
            dgram_num: n,
            total_dgrams: self.send_total,
            is_ack: false,
            is_reply: self.key.incoming,
            niceness: self.niceness,
            is_error: self.send_is_error,
        }
    }

    // --- receive half ----------------------------------------------------

    pub(crate) fn record_data(
        &mut self,
        n: u16,
        total: u16,
        payload: &[u8],
        max_payload: usize,
        max_total: u16,
        now: Instant,
    ) -> Result<RecvOutcome, TransportError> {
        if total == 0 || n >= total {
            return Err(TransportError::ProtocolError);
        }
        match self.recv_total {
            None => {
                if total > max_total {
                    return Err(TransportError::ProtocolError);
                }
                self.recv_total = Some(total);
                self.received = SeqBitmap::new(total);
                self.pending_acks = SeqBitmap::new(total);
                self.read_buf = vec![0; total as usize * max_payload];
            }
            Some(t) if t != total => return Err(TransportError::ProtocolError),
            Some(_) => {}
        }

        let is_last = n == total - 1;
        if payload.len() > max_payload || (!is_last && payload.len() != max_payload) {
            return Err(TransportError::ProtocolError);
        }

        if !self.received.set(n) {
            return Ok(RecvOutcome::Duplicate);
        }

        let offset = n as usize * max_payload;
        self.read_buf[offset..offset + payload.len()].copy_from_slice(payload);
        if is_last {
            self.recv_last_len = payload.len();
        }
        self.bytes_received += payload.len() as u64;
        self.last_recv_time = now;

        let complete = self.received.is_full();
        if complete {
            self.read_len = (total as usize - 1) * max_payload + self.recv_last_len;
        }
        Ok(RecvOutcome::Recorded { complete })
    }

    /// Hand out the reassembled message. Valid once `record_data` reported
    /// completion.
    pub(crate) fn take_assembled(&mut self) -> Bytes {
        let mut buf = std::mem::take(&mut self.read_buf);
        buf.truncate(self.read_len);
        Bytes::from(buf)
    }

    pub(crate) fn ack_header(&self, n: u16) -> DgramHeader {
        DgramHeader {
            trans_id: self.key.trans_id,
            msg_type: self.msg_type,
            dgram_num: n,
            total_dgrams: 0,
            is_ack: true,
            is_reply: !self.key.incoming,
            niceness: self.niceness,
            is_error: false,
        }
    }

    // --- resolution ------------------------------------------------------

    /// Determine the transaction outcome. The first resolution wins; later
    /// calls must not overwrite the error code.
    pub(crate) fn resolve(&mut self, error: Option<TransportError>) {
        if self.error.is_none() {
            self.error = error;
        }
        if self.key.incoming {
            self.phase = SlotPhase::HandlerReady;
        } else {
            self.phase = SlotPhase::Resolved;
        }
    }

    pub(crate) fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }
}
