//! The send scheduler: picks the best slot and the next datagram of that
//! slot, emits it, and repeats until the socket pushes back or nothing is
//! eligible. Selection order: overdue retransmits first, then fresh
//! datagrams within the ACK window, then standalone ACKs that could not be
//! sent eagerly. Ties go to high-niceness slots, then to the slot most
//! caught up to its ACKs, so progress is spread across transactions instead
//! of draining one. Serviced slots rotate to the active tail, which keeps
//! equally eligible slots taking turns.

use bytes::BytesMut;
use tokio::time::Instant;
use tracing::{error, trace};

use crate::protocol::WireCodec;
use crate::server::{ServerCore, Shared};
use crate::slot::Slot;
use crate::slot_table::SlotHandle;
use crate::socket::is_would_block;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum SendPoll {
    /// No eligible slot remains.
    Drained,
    /// The socket would block; the event loop must re-arm writability.
    WouldBlock,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Action {
    Resend(u16),
    Fresh(u16),
    Ack(u16),
}

impl Action {
    fn class(&self) -> u8 {
        match self {
            Action::Resend(_) => 0,
            Action::Fresh(_) => 1,
            Action::Ack(_) => 2,
        }
    }
}

/// What this slot would send next, if anything.
fn classify(slot: &Slot, now: Instant, ack_window: u16) -> Option<Action> {
    if !slot.resend.is_empty() && slot.next_resend_time <= now {
        return slot.resend.first_set().map(Action::Resend);
    }
    if slot.outstanding < ack_window {
        if let Some(n) = slot.next_fresh() {
            return Some(Action::Fresh(n));
        }
    }
    slot.pending_acks.first_set().map(Action::Ack)
}

fn pick_best(core: &ServerCore, now: Instant, ack_window: u16) -> Option<(SlotHandle, Action)> {
    let mut best: Option<(SlotHandle, Action, (u8, u8, u16))> = None;
    for h in core.table.active_handles() {
        let slot = core.table.slot(h);
        let Some(action) = classify(slot, now, ack_window) else {
            continue;
        };
        let rank = (action.class(), u8::from(slot.niceness), slot.outstanding);
        match &best {
            Some((_, _, best_rank)) if *best_rank <= rank => {}
            _ => best = Some((h, action, rank)),
        }
    }
    best.map(|(h, action, _)| (h, action))
}

/// Emit datagrams until the socket would block or no slot has anything to
/// send.
pub(crate) fn send_poll(core: &mut ServerCore, sh: &Shared, now: Instant) -> SendPoll {
    let ack_window = sh.codec.ack_window();
    loop {
        let Some((h, action)) = pick_best(core, now, ack_window) else {
            return SendPoll::Drained;
        };

        let (header, payload_len) = {
            let slot = core.table.slot(h);
            match action {
                Action::Resend(n) | Action::Fresh(n) => {
                    (slot.data_header(n), slot.dgram_payload(n, sh.codec.max_payload_len()).len())
                }
                Action::Ack(n) => (slot.ack_header(n), 0),
            }
        };

        let mut buf = BytesMut::with_capacity(sh.codec.header_len() + payload_len);
        {
            let slot = core.table.slot(h);
            let payload = match action {
                Action::Resend(n) | Action::Fresh(n) => slot.dgram_payload(n, sh.codec.max_payload_len()),
                Action::Ack(_) => &[],
            };
            sh.codec.encode(&header, payload, &mut buf);
        }

        let peer = core.table.slot(h).key.peer;
        match sh.socket.try_send_to(&buf, peer) {
            Ok(sent) => {
                trace!("sent {:?} datagram {} to {:?}", action, header.dgram_num, peer);
                sh.stats.record_out(peer, sent);
            }
            Err(e) if is_would_block(&e) => {
                trace!("socket would block, re-arming writability");
                core.need_write = true;
                return SendPoll::WouldBlock;
            }
            Err(e) => {
                // advance the slot state anyway; the retransmit engine will
                // recover if the datagram mattered
                error!("error sending datagram to {:?}: {}", peer, e);
            }
        }

        let slot = core.table.slot_mut(h);
        slot.bytes_sent += payload_len as u64;
        match action {
            Action::Resend(n) => {
                slot.resend.clear(n);
                slot.resend_count += 1;
                slot.last_send_time = now;
                sh.stats.retransmitted_dgrams.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
            Action::Fresh(_) => {
                slot.next_to_send += 1;
                slot.outstanding += 1;
                slot.last_send_time = now;
            }
            Action::Ack(n) => {
                slot.pending_acks.clear(n);
            }
        }
        core.table.rotate_active_to_tail(h);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::dispatch::{HandlerTable, StateTag};
    use crate::protocol::{Niceness, StandardCodec, WireCodec};
    use crate::slot::SlotKey;
    use crate::slot_table::SlotTable;
    use crate::socket::MockDatagramSocket;
    use crate::stats::TransportStats;
    use bytes::Bytes;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    const MAX_PAYLOAD: usize = StandardCodec::MAX_DGRAM_LEN - StandardCodec::HEADER_LEN;

    fn shared(socket: MockDatagramSocket) -> Shared {
        Shared {
            socket: Arc::new(socket),
            codec: Arc::new(StandardCodec::new()),
            config: ServerConfig::default_ipv4(SocketAddr::from(([0, 0, 0, 0], 8053))),
            stats: Arc::new(TransportStats::new(None, None)),
        }
    }

    fn core_with_outgoing(msgs: &[(u32, usize, Niceness)]) -> (ServerCore, Vec<SlotHandle>) {
        let mut core = ServerCore {
            table: SlotTable::new(16),
            handlers: HandlerTable::new(),
            need_write: false,
            shutdown: None,
        };
        let now = Instant::now();
        let mut handles = Vec::new();
        for &(trans_id, msg_len, niceness) in msgs {
            let key = SlotKey {
                trans_id,
                peer: SocketAddr::from(([10, 0, 0, 1], 9000)),
                incoming: false,
            };
            let h = core.table.allocate(key).unwrap();
            core.table.slot_mut(h).prime_outgoing(
                key,
                1,
                niceness,
                StateTag(0),
                None,
                Bytes::from(vec![0u8; msg_len]),
                MAX_PAYLOAD,
                Box::new(|_| {}),
                now,
                Duration::from_secs(10),
                Duration::from_millis(30),
                None,
            );
            handles.push(h);
        }
        (core, handles)
    }

    #[test]
    fn test_window_caps_fresh_sends() {
        let mut socket = MockDatagramSocket::new();
        // 10 datagrams framed, but only ACK_WINDOW_SIZE may leave the slot
        socket.expect_try_send_to().times(4).returning(|buf, _| Ok(buf.len()));

        let (mut core, handles) = core_with_outgoing(&[(1, MAX_PAYLOAD * 10, Niceness::High)]);
        let sh = shared(socket);

        assert_eq!(send_poll(&mut core, &sh, Instant::now()), SendPoll::Drained);

        let slot = core.table.slot(handles[0]);
        assert_eq!(slot.next_to_send, 4);
        assert_eq!(slot.outstanding, 4);
    }

    #[test]
    fn test_resends_go_first() {
        let mut socket = MockDatagramSocket::new();
        let sent: Arc<std::sync::Mutex<Vec<Vec<u8>>>> = Arc::default();
        let sent_clone = sent.clone();
        socket.expect_try_send_to().returning(move |buf, _| {
            sent_clone.lock().unwrap().push(buf.to_vec());
            Ok(buf.len())
        });

        let (mut core, handles) = core_with_outgoing(&[(1, MAX_PAYLOAD * 2, Niceness::High)]);
        let sh = shared(socket);
        let now = Instant::now();

        // datagram 0 already sent once and overdue for a retransmit
        {
            let slot = core.table.slot_mut(handles[0]);
            slot.next_to_send = 1;
            slot.outstanding = 1;
            slot.mark_resends(now);
        }

        assert_eq!(send_poll(&mut core, &sh, now), SendPoll::Drained);

        let codec = StandardCodec::new();
        let nums: Vec<u16> = sent.lock().unwrap().iter().map(|d| codec.parse(d).unwrap().dgram_num).collect();
        assert_eq!(nums, vec![0, 1], "retransmit of 0 must precede fresh send of 1");
        assert_eq!(core.table.slot(handles[0]).resend_count, 1);
    }

    #[test]
    fn test_would_block_sets_write_flag_and_keeps_state() {
        let mut socket = MockDatagramSocket::new();
        socket
            .expect_try_send_to()
            .returning(|_, _| Err(std::io::Error::new(std::io::ErrorKind::WouldBlock, "full")));

        let (mut core, handles) = core_with_outgoing(&[(1, 10, Niceness::High)]);
        let sh = shared(socket);

        assert_eq!(send_poll(&mut core, &sh, Instant::now()), SendPoll::WouldBlock);
        assert!(core.need_write);

        let slot = core.table.slot(handles[0]);
        assert_eq!(slot.next_to_send, 0, "blocked send must not consume the datagram");
        assert_eq!(slot.outstanding, 0);
    }

    #[test]
    fn test_high_niceness_wins_tie() {
        let mut socket = MockDatagramSocket::new();
        let sent: Arc<std::sync::Mutex<Vec<Vec<u8>>>> = Arc::default();
        let sent_clone = sent.clone();
        socket.expect_try_send_to().returning(move |buf, _| {
            sent_clone.lock().unwrap().push(buf.to_vec());
            Ok(buf.len())
        });

        // low-priority slot first in list order, high-priority second
        let (mut core, _) = core_with_outgoing(&[(1, 10, Niceness::Low), (2, 10, Niceness::High)]);
        let sh = shared(socket);

        assert_eq!(send_poll(&mut core, &sh, Instant::now()), SendPoll::Drained);

        let codec = StandardCodec::new();
        let ids: Vec<u32> = sent.lock().unwrap().iter().map(|d| codec.parse(d).unwrap().trans_id).collect();
        assert_eq!(ids, vec![2, 1]);
    }

    #[test]
    fn test_most_caught_up_wins_within_niceness() {
        let mut socket = MockDatagramSocket::new();
        let sent: Arc<std::sync::Mutex<Vec<Vec<u8>>>> = Arc::default();
        let sent_clone = sent.clone();
        socket.expect_try_send_to().returning(move |buf, _| {
            sent_clone.lock().unwrap().push(buf.to_vec());
            Ok(buf.len())
        });

        let (mut core, handles) = core_with_outgoing(&[
            (1, MAX_PAYLOAD * 4, Niceness::High),
            (2, MAX_PAYLOAD * 4, Niceness::High),
        ]);
        // slot 1 has more of the window in flight than slot 2
        {
            let slot = core.table.slot_mut(handles[0]);
            slot.next_to_send = 2;
            slot.outstanding = 2;
        }
        {
            let slot = core.table.slot_mut(handles[1]);
            slot.next_to_send = 1;
            slot.outstanding = 1;
        }
        let sh = shared(socket);

        assert_eq!(send_poll(&mut core, &sh, Instant::now()), SendPoll::Drained);

        let codec = StandardCodec::new();
        let first = codec.parse(&sent.lock().unwrap()[0]).unwrap();
        assert_eq!(first.trans_id, 2, "the slot most caught up to its ACKs goes first");
    }

    #[test]
    fn test_pending_acks_emitted_last() {
        let mut socket = MockDatagramSocket::new();
        let sent: Arc<std::sync::Mutex<Vec<Vec<u8>>>> = Arc::default();
        let sent_clone = sent.clone();
        socket.expect_try_send_to().returning(move |buf, _| {
            sent_clone.lock().unwrap().push(buf.to_vec());
            Ok(buf.len())
        });

        let (mut core, handles) = core_with_outgoing(&[(1, 10, Niceness::High)]);
        {
            // simulate a partially received reply whose eager ACK was blocked
            let slot = core.table.slot_mut(handles[0]);
            slot.recv_total = Some(2);
            slot.received = crate::seq_bitmap::SeqBitmap::new(2);
            slot.pending_acks = crate::seq_bitmap::SeqBitmap::new(2);
            slot.pending_acks.set(0);
        }
        let sh = shared(socket);

        assert_eq!(send_poll(&mut core, &sh, Instant::now()), SendPoll::Drained);

        let codec = StandardCodec::new();
        let parsed: Vec<_> = sent.lock().unwrap().iter().map(|d| codec.parse(d).unwrap()).collect();
        assert_eq!(parsed.len(), 2);
        assert!(!parsed[0].is_ack, "data before standalone ACKs");
        assert!(parsed[1].is_ack);
        assert!(core.table.slot(handles[0]).pending_acks.is_empty());
    }
}
