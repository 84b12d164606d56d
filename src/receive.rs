//! The receive path: one datagram per invocation, demultiplexed through the
//! slot table. ACKs update the send half of the matched slot; data
//! datagrams feed reassembly and are acknowledged eagerly, falling back to
//! pending-ACK bits when the socket pushes back. A completed request either
//! returns the handler for inline invocation or parks the slot on the
//! callback-ready list.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::BytesMut;
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use tokio::time::Instant;
use tracing::{debug, error, span, trace, warn, Level};
use uuid::Uuid;

use crate::dispatch::{HandlerMode, IncomingRequest, ReplyToken, RequestHandler};
use crate::error::{peer_code, TransportError};
use crate::protocol::{DgramHeader, Niceness, WireCodec, MAX_MSG_TYPES};
use crate::server::{ServerCore, Shared};
use crate::slot::{AckOutcome, RecvOutcome, SlotKey, SlotPhase};
use crate::slot_table::SlotHandle;
use crate::socket::is_would_block;

pub(crate) enum ReadOne {
    /// Nothing left to read; the event loop re-arms readability.
    WouldBlock,
    /// One datagram consumed (possibly dropped); keep draining.
    Processed,
    /// A request completed reassembly and its handler is registered inline;
    /// the caller invokes it without the lock held.
    Inline(Arc<dyn RequestHandler>, IncomingRequest),
}

pub(crate) fn read_one(core: &mut ServerCore, sh: &Shared, staging: &mut [u8], now: Instant) -> ReadOne {
    let (len, from) = match sh.socket.try_recv_from(staging) {
        Ok(x) => x,
        Err(e) if is_would_block(&e) => return ReadOne::WouldBlock,
        Err(e) => {
            error!("socket read error: {}", e);
            return ReadOne::WouldBlock;
        }
    };
    sh.stats.record_in(from, len);

    let correlation_id = Uuid::new_v4();
    let span = span!(Level::TRACE, "datagram", ?correlation_id);
    let _entered = span.enter();

    let dgram = &staging[..len];
    let header = match sh.codec.parse(dgram) {
        Ok(header) => header,
        Err(e) => {
            debug!("dropping malformed datagram from {:?}: {}", from, e);
            sh.stats.malformed_dropped.fetch_add(1, Ordering::Relaxed);
            return ReadOne::Processed;
        }
    };
    if header.msg_type as usize >= MAX_MSG_TYPES {
        debug!("dropping datagram with out-of-range message type {} from {:?}", header.msg_type, from);
        sh.stats.malformed_dropped.fetch_add(1, Ordering::Relaxed);
        return ReadOne::Processed;
    }
    let payload = &dgram[sh.codec.header_len()..];

    // An ACK is filed under the direction of the data it acknowledges, so
    // the two bits collapse into: incoming key iff ack == reply.
    let key = SlotKey {
        trans_id: header.trans_id,
        peer: from,
        incoming: header.is_ack == header.is_reply,
    };
    trace!("datagram from {:?}: {:?}", from, header);

    match core.table.lookup(&key) {
        Some(h) => {
            if header.is_ack {
                handle_ack(core, sh, h, header.dgram_num, now);
                ReadOne::Processed
            } else {
                handle_data(core, sh, h, &header, payload, now)
            }
        }
        None if !header.is_ack && !header.is_reply => handle_new_request(core, sh, key, &header, payload, now),
        None => {
            // most likely a late retransmit for a transaction we already
            // finished
            trace!("dropping datagram for unknown transaction {:?}", key);
            sh.stats.unmatched_dropped.fetch_add(1, Ordering::Relaxed);
            ReadOne::Processed
        }
    }
}

fn handle_ack(core: &mut ServerCore, sh: &Shared, h: SlotHandle, dgram_num: u16, now: Instant) {
    let slot = core.table.slot_mut(h);
    match slot.record_ack(dgram_num, now, sh.config.initial_backoff) {
        AckOutcome::Acked { all: true } => {
            if slot.key.incoming && slot.phase == SlotPhase::SendingReply {
                debug!("reply fully acked for {:?}, releasing slot", slot.key);
                core.table.free(h);
            } else if !slot.key.incoming && slot.phase == SlotPhase::SendingRequest {
                slot.phase = SlotPhase::AwaitingReply;
            }
        }
        AckOutcome::Acked { all: false } | AckOutcome::Duplicate => {}
        AckOutcome::Ignored => {
            trace!("ignoring ACK for never-sent datagram {} on {:?}", dgram_num, slot.key);
        }
    }
}

fn handle_data(
    core: &mut ServerCore,
    sh: &Shared,
    h: SlotHandle,
    header: &DgramHeader,
    payload: &[u8],
    now: Instant,
) -> ReadOne {
    if header.is_error {
        return handle_error_reply(core, sh, h, payload);
    }

    let max_payload = sh.codec.max_payload_len();
    let max_total = sh.config.max_dgrams_per_msg(max_payload);
    let slot = core.table.slot_mut(h);

    let outcome = slot.record_data(header.dgram_num, header.total_dgrams, payload, max_payload, max_total, now);
    match outcome {
        Err(e) => {
            warn!("inconsistent datagram {} for {:?}: {}", header.dgram_num, slot.key, e);
            if slot.key.incoming {
                free_incoming(core, sh, h);
            } else {
                resolve_outgoing(core, h, Some(TransportError::ProtocolError));
            }
            ReadOne::Processed
        }
        Ok(RecvOutcome::Duplicate) => {
            // duplicates are re-acked but never re-recorded
            emit_ack(core, sh, h, header.dgram_num, true);
            ReadOne::Processed
        }
        Ok(RecvOutcome::Recorded { complete }) => {
            if !slot.key.incoming && slot.phase != SlotPhase::ReceivingReply {
                slot.phase = SlotPhase::ReceivingReply;
            }
            emit_ack(core, sh, h, header.dgram_num, true);
            if !complete {
                return ReadOne::Processed;
            }

            let slot = core.table.slot_mut(h);
            if !slot.key.incoming {
                debug!("reply complete for {:?}", slot.key);
                resolve_outgoing(core, h, None);
                return ReadOne::Processed;
            }

            debug!("request complete for {:?}", slot.key);
            let msg_type = slot.msg_type;
            match core.handlers.get(msg_type) {
                None => {
                    // handlers cannot be deregistered, so admission should
                    // have caught this
                    warn!("request of type {} completed without a registered handler", msg_type);
                    free_incoming(core, sh, h);
                    ReadOne::Processed
                }
                Some((handler, HandlerMode::Inline)) => {
                    let request = detach_for_handler(core, h);
                    ReadOne::Inline(handler, request)
                }
                Some((_, HandlerMode::Deferred)) => {
                    core.table.slot_mut(h).phase = SlotPhase::HandlerReady;
                    core.table.move_to_ready(h);
                    ReadOne::Processed
                }
            }
        }
    }
}

/// Pull the slot out of the lists and package the reassembled request for
/// its handler. The slot waits detached (or re-attached, once the handler
/// returns without replying) until a reply is posted.
pub(crate) fn detach_for_handler(core: &mut ServerCore, h: SlotHandle) -> IncomingRequest {
    core.table.detach(h);
    let slot = core.table.slot_mut(h);
    slot.phase = SlotPhase::AwaitingHandlerReply;
    IncomingRequest {
        token: ReplyToken { handle: h, key: slot.key },
        msg_type: slot.msg_type,
        peer: slot.key.peer,
        niceness: slot.niceness,
        payload: slot.take_assembled(),
    }
}

fn handle_error_reply(core: &mut ServerCore, sh: &Shared, h: SlotHandle, payload: &[u8]) -> ReadOne {
    let slot = core.table.slot_mut(h);
    if slot.key.incoming {
        warn!("error-flagged request datagram for {:?}, dropping transaction", slot.key);
        free_incoming(core, sh, h);
        return ReadOne::Processed;
    }

    let code = {
        let mut buf = payload;
        buf.try_get_u32()
    };
    let error = match code {
        Ok(code) => {
            debug!("peer error reply {} for {:?}", code, slot.key);
            TransportError::PeerError(code)
        }
        Err(_) => TransportError::ProtocolError,
    };

    // acknowledge so the peer can release its reply slot; best effort only,
    // since this slot is about to resolve
    let header = slot.ack_header(0);
    send_raw(sh, slot.key.peer, &header, &[]);

    resolve_outgoing(core, h, Some(error));
    ReadOne::Processed
}

fn handle_new_request(
    core: &mut ServerCore,
    sh: &Shared,
    key: SlotKey,
    header: &DgramHeader,
    payload: &[u8],
    now: Instant,
) -> ReadOne {
    if core.shutdown.is_some() {
        debug!("rejecting request from {:?} while shutting down", key.peer);
        send_error_reply_raw(sh, key.peer, key.trans_id, header.msg_type, header.niceness, peer_code::SHUTTING_DOWN);
        return ReadOne::Processed;
    }
    if !core.handlers.has_handler(header.msg_type) {
        warn!(
            "no handler registered for message type {} from {:?} - ignoring. Peers may be running a different software version",
            header.msg_type, key.peer
        );
        return ReadOne::Processed;
    }

    let h = match core.table.allocate(key) {
        Ok(h) => h,
        Err(e) => {
            warn!("cannot accept request from {:?}: {}", key.peer, e);
            return ReadOne::Processed;
        }
    };
    core.table.slot_mut(h).prime_incoming(
        key,
        header.msg_type,
        header.niceness,
        now,
        sh.config.incoming_timeout,
        sh.config.initial_backoff,
    );
    sh.stats.inc_in_waiting(header.msg_type);
    debug!("new incoming transaction {:?}", key);

    handle_data(core, sh, h, header, payload, now)
}

/// Emit an ACK for a received data datagram. Eager send first; a blocked
/// socket parks the ACK on the slot's pending bitmap for the scheduler.
fn emit_ack(core: &mut ServerCore, sh: &Shared, h: SlotHandle, dgram_num: u16, allow_pending: bool) {
    let (header, peer) = {
        let slot = core.table.slot(h);
        (slot.ack_header(dgram_num), slot.key.peer)
    };

    let mut buf = BytesMut::with_capacity(sh.codec.header_len());
    sh.codec.encode(&header, &[], &mut buf);

    match sh.socket.try_send_to(&buf, peer) {
        Ok(sent) => {
            sh.stats.record_out(peer, sent);
        }
        Err(e) if is_would_block(&e) => {
            if allow_pending {
                core.table.slot_mut(h).pending_acks.set(dgram_num);
            }
            core.need_write = true;
        }
        Err(e) => {
            error!("error sending ACK to {:?}: {}", peer, e);
        }
    }
}

/// Fire-and-forget single datagram, bypassing the slot machinery.
fn send_raw(sh: &Shared, to: std::net::SocketAddr, header: &DgramHeader, payload: &[u8]) {
    let mut buf = BytesMut::with_capacity(sh.codec.header_len() + payload.len());
    sh.codec.encode(header, payload, &mut buf);
    match sh.socket.try_send_to(&buf, to) {
        Ok(sent) => sh.stats.record_out(to, sent),
        Err(e) if is_would_block(&e) => {}
        Err(e) => error!("error sending datagram to {:?}: {}", to, e),
    }
}

/// Error reply for a request that never got (or no longer has) a slot.
/// Unacknowledged and unretransmitted; a lost one costs the peer a timeout.
pub(crate) fn send_error_reply_raw(
    sh: &Shared,
    to: std::net::SocketAddr,
    trans_id: u32,
    msg_type: u8,
    niceness: Niceness,
    code: u32,
) {
    let header = DgramHeader {
        trans_id,
        msg_type,
        dgram_num: 0,
        total_dgrams: 1,
        is_ack: false,
        is_reply: true,
        niceness,
        is_error: true,
    };
    send_raw(sh, to, &header, &code.to_be_bytes());
}

pub(crate) fn resolve_outgoing(core: &mut ServerCore, h: SlotHandle, error: Option<TransportError>) {
    let slot = core.table.slot_mut(h);
    if slot.phase == SlotPhase::Resolved {
        // outcome already determined, callback already scheduled
        return;
    }
    slot.resolve(error);
    core.table.move_to_ready(h);
}

/// Release an incoming slot, keeping the in-waiting gauge honest for
/// requests that die before a reply was posted.
pub(crate) fn free_incoming(core: &mut ServerCore, sh: &Shared, h: SlotHandle) {
    let slot = core.table.slot(h);
    if !slot.reply_posted {
        sh.stats.dec_in_waiting(slot.msg_type);
    }
    core.table.free(h);
}
