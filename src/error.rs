use thiserror::Error;

/// Error codes that resolve a transaction. A slot carries at most one of
/// these, set exactly once; it reaches the user through the completion
/// callback (outgoing transactions) or through the API return value
/// (registration and send calls).
#[derive(Debug, Clone, Copy, Eq, PartialEq, Error)]
pub enum TransportError {
    /// The transaction deadline passed before the reply completed.
    #[error("transaction deadline exceeded")]
    TimedOut,

    /// The retransmit budget was exhausted without a single ACK ever
    /// arriving on this slot. This typically fires long before the
    /// deadline and signals a dead or unreachable peer.
    #[error("retransmit budget exhausted without any ACK")]
    NoAck,

    /// The user cancelled the transaction via [`cancel`](crate::server::UdpServer::cancel).
    #[error("transaction cancelled")]
    Cancelled,

    /// The transport was shut down while the transaction was in flight.
    #[error("transport shutting down")]
    ShuttingDown,

    /// The slot pool was exhausted at allocation time.
    #[error("no free transaction slots")]
    NoSlots,

    /// The peer answered with an error reply; its code is carried verbatim.
    #[error("peer replied with error code {0}")]
    PeerError(u32),

    /// The peer sent traffic that is inconsistent with the transaction
    /// state (e.g. a changing total-datagram count).
    #[error("protocol violation by peer")]
    ProtocolError,

    /// API misuse by the caller.
    #[error("bad call: {0}")]
    BadCall(&'static str),
}

/// Well-known application error codes carried in error replies.
///
/// The code space is otherwise owned by the application; a peer receiving
/// one of these sees [`TransportError::PeerError`] with the code verbatim.
pub mod peer_code {
    /// Sent in reply to requests arriving while the responder shuts down.
    pub const SHUTTING_DOWN: u32 = 0xffff_fff1;
}
