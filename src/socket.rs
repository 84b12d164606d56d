use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use std::io;
use std::net::SocketAddr;

use tokio::net::UdpSocket;

/// Non-blocking datagram I/O, abstracted so tests can run the whole
/// transport against an in-memory network. Reads and writes never block:
/// they return `WouldBlock` and the event loop re-arms on the readiness
/// futures.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    fn try_send_to(&self, buf: &[u8], to: SocketAddr) -> io::Result<usize>;

    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    async fn readable(&self) -> io::Result<()>;

    async fn writable(&self) -> io::Result<()>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl DatagramSocket for UdpSocket {
    fn try_send_to(&self, buf: &[u8], to: SocketAddr) -> io::Result<usize> {
        UdpSocket::try_send_to(self, buf, to)
    }

    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::try_recv_from(self, buf)
    }

    async fn readable(&self) -> io::Result<()> {
        UdpSocket::readable(self).await
    }

    async fn writable(&self) -> io::Result<()> {
        UdpSocket::writable(self).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// True for the error kind a non-blocking socket reports when the operation
/// must be retried once the socket is ready again.
pub(crate) fn is_would_block(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
}
