//! Shared test harness: an in-memory datagram network with programmable
//! loss, plus canned request handlers. Everything runs under a paused-clock
//! current-thread runtime, so retransmit timelines are deterministic and
//! tests finish in milliseconds of real time.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::pin::pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;

use trudp::{
    DatagramSocket, HostId, HostRegistry, IncomingRequest, RequestHandler, ServerConfig, StandardCodec,
    UdpServer, WireCodec,
};

pub const MAX_PAYLOAD: usize = StandardCodec::MAX_DGRAM_LEN - StandardCodec::HEADER_LEN;

/// Drop decision for a datagram a socket is about to put on the wire.
/// Returning true drops it.
pub type LossRule = Box<dyn FnMut(&[u8]) -> bool + Send>;

struct EndpointState {
    inbox: Mutex<VecDeque<(Vec<u8>, SocketAddr)>>,
    readable: Notify,
}

/// The in-memory network: a map from address to endpoint mailbox.
/// Datagrams sent to unregistered addresses vanish, which doubles as the
/// unresponsive-peer blackhole.
pub struct TestNet {
    endpoints: Mutex<HashMap<SocketAddr, Arc<EndpointState>>>,
}

impl TestNet {
    pub fn new() -> Arc<TestNet> {
        Arc::new(TestNet { endpoints: Mutex::new(HashMap::new()) })
    }

    pub fn socket(self: &Arc<TestNet>, port: u16) -> Arc<TestSocket> {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let state = Arc::new(EndpointState {
            inbox: Mutex::new(VecDeque::new()),
            readable: Notify::new(),
        });
        self.endpoints.lock().unwrap().insert(addr, state.clone());
        Arc::new(TestSocket {
            net: self.clone(),
            addr,
            state,
            loss: Mutex::new(None),
            sent_log: Mutex::new(Vec::new()),
        })
    }

    pub fn blackhole_addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }
}

pub struct TestSocket {
    net: Arc<TestNet>,
    addr: SocketAddr,
    state: Arc<EndpointState>,
    loss: Mutex<Option<LossRule>>,
    sent_log: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
}

impl TestSocket {
    /// Install a loss rule applied to every datagram this socket sends.
    pub fn set_loss_rule(&self, rule: LossRule) {
        *self.loss.lock().unwrap() = Some(rule);
    }

    /// Number of datagrams this socket attempted to send (including lost
    /// ones).
    pub fn sent_count(&self) -> usize {
        self.sent_log.lock().unwrap().len()
    }

    /// Copy of everything this socket attempted to send.
    pub fn sent_log(&self) -> Vec<(Vec<u8>, SocketAddr)> {
        self.sent_log.lock().unwrap().clone()
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

#[async_trait]
impl DatagramSocket for TestSocket {
    fn try_send_to(&self, buf: &[u8], to: SocketAddr) -> io::Result<usize> {
        self.sent_log.lock().unwrap().push((buf.to_vec(), to));

        if let Some(rule) = self.loss.lock().unwrap().as_mut() {
            if rule(buf) {
                return Ok(buf.len());
            }
        }

        let target = self.net.endpoints.lock().unwrap().get(&to).cloned();
        if let Some(target) = target {
            target.inbox.lock().unwrap().push_back((buf.to_vec(), self.addr));
            target.readable.notify_waiters();
        }
        Ok(buf.len())
    }

    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut inbox = self.state.inbox.lock().unwrap();
        match inbox.pop_front() {
            Some((dgram, from)) => {
                buf[..dgram.len()].copy_from_slice(&dgram);
                Ok((dgram.len(), from))
            }
            None => Err(io::Error::new(io::ErrorKind::WouldBlock, "inbox empty")),
        }
    }

    async fn readable(&self) -> io::Result<()> {
        loop {
            let mut notified = pin!(self.state.readable.notified());
            notified.as_mut().enable();
            if !self.state.inbox.lock().unwrap().is_empty() {
                return Ok(());
            }
            notified.await;
        }
    }

    async fn writable(&self) -> io::Result<()> {
        Ok(())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }
}

/// A transport on the in-memory network with its event loop spawned.
pub fn spawn_server(socket: Arc<TestSocket>) -> Arc<UdpServer> {
    spawn_server_with_registry(socket, None)
}

pub fn spawn_server_with_registry(
    socket: Arc<TestSocket>,
    registry: Option<Arc<dyn HostRegistry>>,
) -> Arc<UdpServer> {
    let config = ServerConfig::default_ipv4(socket.addr());
    let server =
        UdpServer::with_socket(socket, Arc::new(StandardCodec::new()), config, registry, None).unwrap();
    tokio::spawn(server.clone().run());
    server
}

/// Fixed host-id to address mapping.
pub struct StaticRegistry {
    entries: HashMap<HostId, SocketAddr>,
}

impl StaticRegistry {
    pub fn new(entries: impl IntoIterator<Item = (HostId, SocketAddr)>) -> Arc<StaticRegistry> {
        Arc::new(StaticRegistry { entries: entries.into_iter().collect() })
    }
}

impl HostRegistry for StaticRegistry {
    fn lookup(&self, host_id: HostId) -> Option<SocketAddr> {
        self.entries.get(&host_id).copied()
    }
}

/// Replies with the configured bytes (or echoes the request payload),
/// optionally after a delay, counting invocations.
pub struct EchoHandler {
    pub invocations: AtomicUsize,
    pub reply: Option<Bytes>,
    pub delay: Option<Duration>,
}

impl EchoHandler {
    pub fn immediate(reply: Option<Bytes>) -> Arc<EchoHandler> {
        Arc::new(EchoHandler { invocations: AtomicUsize::new(0), reply, delay: None })
    }

    pub fn delayed(reply: Option<Bytes>, delay: Duration) -> Arc<EchoHandler> {
        Arc::new(EchoHandler { invocations: AtomicUsize::new(0), reply, delay: Some(delay) })
    }

    pub fn invocation_count(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RequestHandler for EchoHandler {
    async fn on_request(&self, server: Arc<UdpServer>, request: IncomingRequest) {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let reply = self.reply.clone().unwrap_or_else(|| request.payload.clone());
        server.send_reply(request, reply).unwrap();
    }
}

/// Swallows requests without ever replying.
pub struct DropHandler {
    pub invocations: AtomicUsize,
}

impl DropHandler {
    pub fn new() -> Arc<DropHandler> {
        Arc::new(DropHandler { invocations: AtomicUsize::new(0) })
    }
}

#[async_trait]
impl RequestHandler for DropHandler {
    async fn on_request(&self, _server: Arc<UdpServer>, _request: IncomingRequest) {
        self.invocations.fetch_add(1, Ordering::SeqCst);
    }
}

/// Parse helper for loss rules.
pub fn parse(dgram: &[u8]) -> trudp::DgramHeader {
    StandardCodec::new().parse(dgram).expect("harness only sees well-formed datagrams")
}

/// Wait (in virtual time) until the condition holds, panicking after a
/// generous budget.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within the time budget");
}
