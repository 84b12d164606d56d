use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::bail;

use crate::protocol::dgram_count;

/// A timeout large enough to never fire in practice, for callers that want
/// the deadline disabled and only the retransmit budget to bound a request.
pub const INFINITE_TIMEOUT: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 10);

/// An IP subnet used to classify traffic into the per-interface statistics
/// buckets. Addresses of the other IP family never match.
#[derive(Debug, Clone, Copy)]
pub struct Subnet {
    pub net: IpAddr,
    pub prefix_len: u8,
}

impl Subnet {
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.net, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = if self.prefix_len == 0 { 0 } else { u32::MAX << (32 - self.prefix_len as u32) };
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = if self.prefix_len == 0 { 0 } else { u128::MAX << (128 - self.prefix_len as u32) };
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

/// Construction-time parameters of a transport instance. The surrounding
/// program owns the values; the transport only validates and reads them.
pub struct ServerConfig {
    /// Address of the one UDP socket all transactions share.
    pub bind_addr: SocketAddr,

    /// Size of the pre-allocated slot pool, i.e. the maximum number of
    /// concurrent transactions (both directions combined).
    pub max_slots: usize,

    /// Cadence of the retransmit/timeout sweep. Must not exceed the
    /// smallest timeout the application intends to use.
    pub poll_interval: Duration,

    /// Backoff before the first retransmit, and the value the backoff
    /// resets to whenever an ACK arrives.
    pub initial_backoff: Duration,

    /// Cap for the exponentially growing backoff of low-priority slots.
    pub max_backoff: Duration,

    /// Upper bound for a single message (request or reply payload).
    pub max_msg_size: u32,

    /// Deadline granted to an incoming transaction: from its first datagram
    /// until the request is complete and answered, and again from posting
    /// the reply until the reply is fully acked.
    pub incoming_timeout: Duration,

    /// Subnets of the two primary interfaces for statistics classification;
    /// everything else counts as outsider traffic.
    pub primary_subnet: Option<Subnet>,
    pub secondary_subnet: Option<Subnet>,
}

impl ServerConfig {
    /// Defaults suitable for a data-center IPv4 deployment.
    pub fn default_ipv4(bind_addr: SocketAddr) -> ServerConfig {
        ServerConfig {
            bind_addr,
            max_slots: 4096,
            poll_interval: Duration::from_millis(30),
            initial_backoff: Duration::from_millis(30),
            max_backoff: Duration::from_secs(2),
            max_msg_size: 256 * 1024,
            incoming_timeout: Duration::from_secs(60),
            primary_subnet: None,
            secondary_subnet: None,
        }
    }

    pub fn validate(&self, max_payload_len: usize) -> anyhow::Result<()> {
        if self.max_slots == 0 {
            bail!("slot pool must hold at least one slot");
        }
        if self.poll_interval.is_zero() {
            bail!("poll interval must be positive");
        }
        if self.initial_backoff.is_zero() {
            bail!("initial backoff must be positive");
        }
        if self.max_backoff < self.initial_backoff {
            bail!("maximum backoff must not be smaller than the initial backoff");
        }
        if max_payload_len == 0 {
            bail!("codec leaves no room for payload");
        }
        if dgram_count(self.max_msg_size as usize, max_payload_len) > u16::MAX as usize {
            bail!(
                "max message size of {} does not fit the codec's sequence number space",
                self.max_msg_size
            );
        }
        Ok(())
    }

    /// Largest datagram count a message may occupy under this config.
    pub(crate) fn max_dgrams_per_msg(&self, max_payload_len: usize) -> u16 {
        dgram_count(self.max_msg_size as usize, max_payload_len) as u16
    }
}
