use std::net::SocketAddr;

#[cfg(test)]
use mockall::automock;

/// Logical host identifier understood by the surrounding system's host
/// registry.
pub type HostId = u32;

/// Consumed interface to the external host registry. The transport only
/// needs it when a caller addresses a request by host id instead of an
/// explicit socket address; the registry's change notifications are pushed
/// into the transport via
/// [`replace_host`](crate::server::UdpServer::replace_host).
#[cfg_attr(test, automock)]
pub trait HostRegistry: Send + Sync + 'static {
    fn lookup(&self, host_id: HostId) -> Option<SocketAddr>;
}
