//! The periodic sweep over the active list: times out slots past their
//! deadline, flags overdue unacked datagrams for retransmission, and gives
//! up early on peers that never acked anything.
//!
//! Backoff grows exponentially (capped) for low-priority slots; for
//! high-priority slots it stays at the configured initial value, trading
//! bandwidth for tail latency. An arriving ACK resets the backoff to the
//! initial value (see `Slot::record_ack`), so the growth restarts from
//! scratch whenever the peer shows signs of life.
//!
//! A slot that has never been acked gives up once its message half has
//! already been transmitted `max_resends` times, instead of burning the
//! whole deadline on a dead peer. With one ACK seen, the slot keeps
//! retransmitting until the deadline.

use tokio::time::Instant;
use tracing::debug;

use crate::error::TransportError;
use crate::protocol::Niceness;
use crate::receive::{free_incoming, resolve_outgoing};
use crate::server::{ServerCore, Shared};

/// Returns true if any slot changed state, i.e. there are datagrams to send
/// or callbacks to make.
pub(crate) fn time_poll(core: &mut ServerCore, sh: &Shared, now: Instant) -> bool {
    let mut did_something = false;

    for h in core.table.active_handles() {
        let slot = core.table.slot(h);

        if now >= slot.deadline {
            did_something = true;
            if slot.key.incoming {
                debug!("incoming transaction {:?} passed its deadline in {:?}, dropping", slot.key, slot.phase);
                free_incoming(core, sh, h);
            } else {
                debug!("outgoing transaction {:?} timed out", slot.key);
                resolve_outgoing(core, h, Some(TransportError::TimedOut));
            }
            continue;
        }

        let backoff_expired =
            slot.outstanding > 0 && now.saturating_duration_since(slot.last_send_time) >= slot.backoff;
        if !backoff_expired {
            continue;
        }

        let transmissions_so_far = 1 + slot.resend_rounds;
        let budget_exhausted = slot
            .max_resends
            .is_some_and(|max| !slot.any_ack_received && transmissions_so_far >= max);
        if budget_exhausted {
            debug!("giving up on {:?}: {} transmissions, not one ACK", slot.key, transmissions_so_far);
            resolve_outgoing(core, h, Some(TransportError::NoAck));
            did_something = true;
            continue;
        }

        let slot = core.table.slot_mut(h);
        if slot.mark_resends(now) == 0 {
            // the previous round is still queued behind a blocked socket
            continue;
        }
        slot.resend_rounds += 1;
        if slot.niceness == Niceness::Low {
            slot.backoff = (slot.backoff * 2).min(sh.config.max_backoff);
        }
        did_something = true;
    }

    did_something
}
