//! A reliable request/reply datagram transport over UDP.
//!
//! One non-blocking UDP socket multiplexes thousands of short-lived
//! transactions: sequenced datagrams, per-datagram ACKs, a sliding ACK
//! window, retransmission with backoff, and timeouts - reliability without
//! the per-peer connection state of TCP. The design target is a large fleet
//! broadcasting small RPCs to many random machines, where TCP
//! connect/teardown overhead dominates the actual work.
//!
//! ## Design goals
//!
//! * A *transaction* is one bounded request plus its bounded reply; there is
//!   no byte-stream abstraction and no ordering between distinct
//!   transactions.
//! * Every in-flight transaction is a *slot* in a fixed pre-allocated pool.
//!   A slot carries the send-side framing state, the receive-side
//!   reassembly state, the timers and the completion callback; slots are
//!   found by `(transaction id, peer address, direction)`.
//! * All I/O is non-blocking and edge-triggered: the single event-loop task
//!   reads one datagram at a time, sweeps timers at a fixed cadence, and
//!   lets the scheduler emit datagrams until the socket pushes back.
//! * The sender may keep `ACK_WINDOW_SIZE` datagrams per transaction in
//!   flight before it needs the first ACK; retransmits are preferred over
//!   fresh sends, and progress is spread across transactions rather than
//!   draining one at a time.
//! * Two priority classes: niceness 0 retransmits on an (approximately)
//!   constant tight backoff for minimal tail latency, niceness 1 backs off
//!   exponentially.
//! * Wire framing is pluggable through [`protocol::WireCodec`], so overlays
//!   with foreign datagram shapes can reuse the slot table, scheduler and
//!   retransmit machinery.
//!
//! ## Transaction flow
//!
//! ```ascii
//! caller                 transport                          peer
//!   | send_request          |                                 |
//!   |---------------------->| request datagrams 0..N          |
//!   |                       |-------------------------------->|
//!   |                       |<--------------------------------| ACK per datagram
//!   |                       |<--------------------------------| reply datagrams 0..M
//!   |                       |-------------------------------->| ACK per datagram
//!   |  callback(reply)      |                                 |
//!   |<----------------------|  (slot freed)                   |
//! ```
//!
//! Inbound requests run the mirror image: the first request datagram
//! allocates an incoming slot, reassembly completes, the registered
//! [`dispatch::RequestHandler`] runs and posts a reply, and the slot is
//! freed once the reply is fully acked.
//!
//! Errors reach the caller exclusively through the per-transaction
//! callback, as one of the codes in [`error::TransportError`]; there is no
//! global error state.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod host_registry;
pub mod protocol;
mod receive;
mod retransmit;
mod scheduler;
mod seq_bitmap;
pub mod server;
mod slot;
mod slot_table;
pub mod socket;
pub mod stats;
pub mod trans_id;

pub use config::{ServerConfig, Subnet, INFINITE_TIMEOUT};
pub use dispatch::{Completion, HandlerMode, IncomingRequest, RequestHandler, StateTag};
pub use error::TransportError;
pub use host_registry::{HostId, HostRegistry};
pub use protocol::{DgramHeader, Niceness, StandardCodec, WireCodec, ACK_WINDOW_SIZE, MAX_MSG_TYPES};
pub use server::{Dest, UdpServer};
pub use slot::SlotPhase;
pub use socket::DatagramSocket;
pub use stats::{SlotSnapshot, StatsSnapshot};
pub use trans_id::{CounterSnapshot, CounterStore, FileCounterStore};

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
