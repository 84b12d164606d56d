//! The transport instance: one UDP socket, the slot table behind a single
//! mutex, and the event loop driving receive, timer and send phases to
//! quiescence. User code (completion callbacks and request handlers) always
//! runs with the mutex released.

use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Notify;
use tokio::time::{interval, Instant};
use tracing::{debug, error, info, trace};

use crate::config::ServerConfig;
use crate::dispatch::{
    Completion, HandlerMode, HandlerTable, IncomingRequest, ReplyCallback, RequestHandler, StateTag,
};
use crate::error::{peer_code, TransportError};
use crate::host_registry::{HostId, HostRegistry};
use crate::protocol::{Niceness, WireCodec, MAX_MSG_TYPES};
use crate::receive::{self, ReadOne};
use crate::retransmit;
use crate::scheduler;
use crate::slot::{ListId, SlotKey, SlotPhase};
use crate::slot_table::{SlotHandle, SlotTable};
use crate::socket::DatagramSocket;
use crate::stats::{SlotSnapshot, StatsSnapshot, TransportStats};
use crate::trans_id::{CounterStore, TransIdCounter};

/// Destination of an outgoing request: an explicit address, or a logical
/// host resolved through the host registry at send time.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Dest {
    Addr(SocketAddr),
    Host(HostId),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum ShutdownMode {
    Graceful,
    Urgent,
}

/// Everything the mutex protects: the slot table with its intrusive lists,
/// the handler registrations, and the event-loop flags.
pub(crate) struct ServerCore {
    pub(crate) table: SlotTable,
    pub(crate) handlers: HandlerTable,
    /// Set when a send hit `WouldBlock`; tells the event loop to re-arm
    /// writability.
    pub(crate) need_write: bool,
    pub(crate) shutdown: Option<ShutdownMode>,
}

/// The pieces shared lock-free across the receive, send and timer paths.
pub(crate) struct Shared {
    pub(crate) socket: Arc<dyn DatagramSocket>,
    pub(crate) codec: Arc<dyn WireCodec>,
    pub(crate) config: ServerConfig,
    pub(crate) stats: Arc<TransportStats>,
}

enum ReadyItem {
    Outgoing {
        h: SlotHandle,
        callback: ReplyCallback,
        completion: Completion,
    },
    Incoming {
        h: SlotHandle,
        key: SlotKey,
        handler: Arc<dyn RequestHandler>,
        request: IncomingRequest,
    },
    Skip,
}

/// A reliable request/reply datagram transport multiplexing transactions
/// over a single UDP socket.
///
/// Lifecycle: construct with [`UdpServer::bind`] (or
/// [`UdpServer::with_socket`] for a custom socket/codec), spawn
/// [`UdpServer::run`] as the event-loop task, then issue requests with
/// [`UdpServer::send_request`] and serve inbound traffic through handlers
/// registered with [`UdpServer::register_handler`]. Terminate with
/// [`UdpServer::shutdown`].
pub struct UdpServer {
    shared: Shared,
    core: Mutex<ServerCore>,
    trans_ids: TransIdCounter,
    registry: Option<Arc<dyn HostRegistry>>,
    send_wake: Notify,
    shutdown_done: Notify,
}

impl Debug for UdpServer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "UdpServer{{{:?}}}", self.shared.socket.local_addr())
    }
}

impl UdpServer {
    /// Bind a UDP socket at the configured address and build the transport
    /// on it.
    pub async fn bind(config: ServerConfig, codec: Arc<dyn WireCodec>) -> anyhow::Result<Arc<UdpServer>> {
        let socket = tokio::net::UdpSocket::bind(config.bind_addr).await?;
        info!("bound transport socket to {:?}", socket.local_addr()?);
        Self::with_socket(Arc::new(socket), codec, config, None, None)
    }

    /// Build the transport on an externally provided socket. This is the
    /// full constructor: host registry and transaction-id persistence are
    /// optional collaborators.
    pub fn with_socket(
        socket: Arc<dyn DatagramSocket>,
        codec: Arc<dyn WireCodec>,
        config: ServerConfig,
        registry: Option<Arc<dyn HostRegistry>>,
        counter_store: Option<Arc<dyn CounterStore>>,
    ) -> anyhow::Result<Arc<UdpServer>> {
        config.validate(codec.max_payload_len())?;

        let stats = Arc::new(TransportStats::new(config.primary_subnet, config.secondary_subnet));
        let core = ServerCore {
            table: SlotTable::new(config.max_slots),
            handlers: HandlerTable::new(),
            need_write: false,
            shutdown: None,
        };

        Ok(Arc::new(UdpServer {
            shared: Shared { socket, codec, config, stats },
            core: Mutex::new(core),
            trans_ids: TransIdCounter::new(counter_store)?,
            registry,
            send_wake: Notify::new(),
            shutdown_done: Notify::new(),
        }))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.shared.socket.local_addr()
    }

    // --- registration and outbound API -----------------------------------

    /// Install the handler for one message type. Registering a second
    /// handler for the same type is a programming error.
    pub fn register_handler(
        &self,
        msg_type: u8,
        handler: Arc<dyn RequestHandler>,
        mode: HandlerMode,
    ) -> Result<(), TransportError> {
        self.core.lock().unwrap().handlers.register(msg_type, handler, mode)
    }

    pub fn has_handler(&self, msg_type: u8) -> bool {
        self.core.lock().unwrap().handlers.has_handler(msg_type)
    }

    /// Start an outgoing transaction. The callback fires exactly once, with
    /// the reply bytes or the terminal error; on `Err` here it never fires.
    #[allow(clippy::too_many_arguments)]
    pub fn send_request(
        &self,
        msg: Bytes,
        msg_type: u8,
        dest: Dest,
        tag: StateTag,
        callback: impl FnOnce(Completion) + Send + 'static,
        timeout: Duration,
        niceness: Niceness,
        max_resends: Option<u32>,
    ) -> Result<(), TransportError> {
        if msg_type as usize >= MAX_MSG_TYPES {
            return Err(TransportError::BadCall("message type out of range"));
        }
        if msg.len() > self.shared.config.max_msg_size as usize {
            return Err(TransportError::BadCall("request exceeds maximum message size"));
        }

        let (peer, host_id) = match dest {
            Dest::Addr(addr) => (addr, None),
            Dest::Host(id) => {
                let registry = self
                    .registry
                    .as_ref()
                    .ok_or(TransportError::BadCall("no host registry configured"))?;
                let addr = registry.lookup(id).ok_or(TransportError::BadCall("unknown host id"))?;
                (addr, Some(id))
            }
        };

        {
            let mut core = self.core.lock().unwrap();
            if core.shutdown.is_some() {
                return Err(TransportError::ShuttingDown);
            }

            let key = SlotKey { trans_id: self.trans_ids.allocate(), peer, incoming: false };
            let h = core.table.allocate(key)?;
            core.table.slot_mut(h).prime_outgoing(
                key,
                msg_type,
                niceness,
                tag,
                host_id,
                msg,
                self.shared.codec.max_payload_len(),
                Box::new(callback),
                Instant::now(),
                timeout,
                self.shared.config.initial_backoff,
                max_resends,
            );
            trace!("queued outgoing transaction {:?}", key);
        }

        self.send_wake.notify_one();
        Ok(())
    }

    /// Answer an incoming request. Consumes the request, so a transaction
    /// can only ever be answered once.
    pub fn send_reply(&self, request: IncomingRequest, msg: Bytes) -> Result<(), TransportError> {
        self.post_reply(request, msg, false)
    }

    /// Propagate an error code to the requesting peer; its callback sees
    /// `PeerError(code)`.
    pub fn send_error_reply(&self, request: IncomingRequest, code: u32) -> Result<(), TransportError> {
        self.post_reply(request, Bytes::copy_from_slice(&code.to_be_bytes()), true)
    }

    fn post_reply(&self, request: IncomingRequest, msg: Bytes, is_error: bool) -> Result<(), TransportError> {
        if msg.len() > self.shared.config.max_msg_size as usize {
            return Err(TransportError::BadCall("reply exceeds maximum message size"));
        }
        let token = request.token;

        {
            let mut core = self.core.lock().unwrap();
            if !core.table.is_live(token.handle, &token.key) {
                return Err(TransportError::BadCall("reply token no longer names a live transaction"));
            }

            let h = token.handle;
            let msg_type = {
                let slot = core.table.slot_mut(h);
                match slot.phase {
                    SlotPhase::HandlerReady | SlotPhase::AwaitingHandlerReply => {}
                    _ => return Err(TransportError::BadCall("reply already posted")),
                }
                slot.install_reply(
                    msg,
                    is_error,
                    self.shared.codec.max_payload_len(),
                    Instant::now(),
                    self.shared.config.incoming_timeout,
                    self.shared.config.initial_backoff,
                );
                slot.msg_type
            };
            debug!("reply posted for {:?}", token.key);
            self.shared.stats.dec_in_waiting(msg_type);
            core.table.ensure_active(h);
        }

        self.send_wake.notify_one();
        Ok(())
    }

    /// Fail every active outgoing transaction matching both the tag and the
    /// message type; their callbacks fire with `Cancelled` from the event
    /// loop. Returns how many were cancelled.
    pub fn cancel(&self, tag: StateTag, msg_type: u8) -> usize {
        let mut cancelled = 0;
        {
            let mut core = self.core.lock().unwrap();
            for h in core.table.active_handles() {
                let slot = core.table.slot(h);
                if !slot.key.incoming && slot.tag == tag && slot.msg_type == msg_type {
                    debug!("cancelling {:?}", slot.key);
                    receive::resolve_outgoing(&mut core, h, Some(TransportError::Cancelled));
                    cancelled += 1;
                }
            }
        }
        if cancelled > 0 {
            self.send_wake.notify_one();
        }
        cancelled
    }

    /// Retarget every transaction addressed at `old` to `new`. Datagrams
    /// already on the wire are lost; retransmissions go to the new address.
    pub fn replace_host(&self, old: SocketAddr, new: SocketAddr) -> usize {
        self.retarget(|_, peer| peer == old, new)
    }

    /// Retarget every transaction that was addressed through the given host
    /// id; called when the host registry remaps the id to a new address.
    pub fn retarget_host(&self, host_id: HostId, new: SocketAddr) -> usize {
        self.retarget(|slot_host, _| slot_host == Some(host_id), new)
    }

    fn retarget(&self, matches: impl Fn(Option<HostId>, SocketAddr) -> bool, new: SocketAddr) -> usize {
        let mut moved = 0;
        {
            let mut core = self.core.lock().unwrap();
            for h in core.table.live_handles() {
                let (key, host_id) = {
                    let slot = core.table.slot(h);
                    (slot.key, slot.host_id)
                };
                if matches(host_id, key.peer) && key.peer != new {
                    let new_key = SlotKey { peer: new, ..key };
                    if core.table.rekey(h, new_key) {
                        moved += 1;
                    }
                }
            }
        }
        if moved > 0 {
            debug!("retargeted {} transactions to {:?}", moved, new);
            self.send_wake.notify_one();
        }
        moved
    }

    // --- observability ---------------------------------------------------

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn used_slot_count(&self) -> usize {
        self.core.lock().unwrap().table.used_count()
    }

    pub fn used_incoming_slot_count(&self) -> usize {
        self.core.lock().unwrap().table.used_incoming_count()
    }

    /// Point-in-time summary of every live slot, optionally restricted to
    /// one message type.
    pub fn slot_snapshots(&self, msg_type: Option<u8>) -> Vec<SlotSnapshot> {
        let now = Instant::now();
        let core = self.core.lock().unwrap();
        let mut snapshots = Vec::new();
        for h in core.table.live_handles() {
            let slot = core.table.slot(h);
            if msg_type.is_some_and(|t| t != slot.msg_type) {
                continue;
            }
            snapshots.push(SlotSnapshot {
                trans_id: slot.key.trans_id,
                peer: slot.key.peer,
                incoming: slot.key.incoming,
                msg_type: slot.msg_type,
                niceness: slot.niceness,
                phase: slot.phase,
                age: slot.age(now),
                resend_count: slot.resend_count,
                bytes_sent: slot.bytes_sent,
                bytes_received: slot.bytes_received,
            });
        }
        snapshots
    }

    // --- shutdown --------------------------------------------------------

    /// Terminate the transport.
    ///
    /// Urgent: every outbound transaction fails with `ShuttingDown` (their
    /// callbacks run before this returns), pending incoming requests get an
    /// error reply, and the event loop exits.
    ///
    /// Graceful: no new transactions are accepted in either direction, but
    /// everything already in the slot table drains naturally. Returns true
    /// once the transport is fully drained, false while work remains (the
    /// event loop keeps draining; use [`UdpServer::wait_shutdown`]).
    pub async fn shutdown(self: &Arc<Self>, urgent: bool) -> bool {
        {
            let mut core = self.core.lock().unwrap();
            match (core.shutdown, urgent) {
                (Some(ShutdownMode::Urgent), _) => {}
                (_, true) => core.shutdown = Some(ShutdownMode::Urgent),
                (None, false) => core.shutdown = Some(ShutdownMode::Graceful),
                (Some(_), false) => {}
            }
            info!("shutdown requested ({})", if urgent { "urgent" } else { "graceful" });
            if urgent {
                self.fail_all_locked(&mut core);
            }
        }

        if urgent {
            self.make_callbacks().await;
        }

        let drained = self.core.lock().unwrap().table.is_drained();
        if drained {
            self.trans_ids.persist_clean();
            self.shutdown_done.notify_waiters();
        }
        self.send_wake.notify_one();
        drained
    }

    /// Resolves once a requested shutdown has fully drained the slot table.
    pub async fn wait_shutdown(&self) {
        loop {
            let mut notified = std::pin::pin!(self.shutdown_done.notified());
            notified.as_mut().enable();
            if self.is_complete() {
                return;
            }
            notified.await;
        }
    }

    fn is_complete(&self) -> bool {
        let core = self.core.lock().unwrap();
        core.shutdown.is_some() && core.table.is_drained()
    }

    /// Urgent-shutdown sweep: error replies for incoming transactions,
    /// `ShuttingDown` for active outgoing ones. Slots already callback-ready
    /// keep the outcome they resolved with.
    fn fail_all_locked(&self, core: &mut ServerCore) {
        for h in core.table.live_handles() {
            let slot = core.table.slot(h);
            if slot.key.incoming {
                receive::send_error_reply_raw(
                    &self.shared,
                    slot.key.peer,
                    slot.key.trans_id,
                    slot.msg_type,
                    slot.niceness,
                    peer_code::SHUTTING_DOWN,
                );
                receive::free_incoming(core, &self.shared, h);
            } else if slot.list == ListId::Active {
                receive::resolve_outgoing(core, h, Some(TransportError::ShuttingDown));
            }
        }
    }

    // --- event loop ------------------------------------------------------

    /// The event-loop task. Drives the transport until shutdown completes;
    /// spawn it right after construction:
    ///
    /// ```ignore
    /// let server = UdpServer::bind(config, codec).await?;
    /// tokio::spawn(server.clone().run());
    /// ```
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let mut poll = interval(self.shared.config.poll_interval);
        let mut staging = vec![0u8; self.shared.codec.max_dgram_len()];
        info!("transport event loop running");

        loop {
            if self.is_complete() {
                break;
            }
            let need_write = self.core.lock().unwrap().need_write;

            tokio::select! {
                ready = self.shared.socket.readable() => {
                    if let Err(e) = ready {
                        error!("socket failed: {}", e);
                        self.shutdown(true).await;
                        return Err(e.into());
                    }
                    self.process(false, &mut staging).await;
                }
                _ = poll.tick() => {
                    self.process(true, &mut staging).await;
                }
                _ = self.send_wake.notified() => {
                    self.process(false, &mut staging).await;
                }
                ready = self.shared.socket.writable(), if need_write => {
                    if let Err(e) = ready {
                        error!("socket failed: {}", e);
                        self.shutdown(true).await;
                        return Err(e.into());
                    }
                    self.core.lock().unwrap().need_write = false;
                    self.process(false, &mut staging).await;
                }
            }
        }

        info!("transport event loop stopped");
        Ok(())
    }

    /// One tick: drain the socket (dispatching inline handlers as requests
    /// complete), run the timer sweep if due, emit what the scheduler will
    /// give, then make callbacks until quiescent.
    async fn process(self: &Arc<Self>, timer_fired: bool, staging: &mut [u8]) {
        loop {
            let work = {
                let mut core = self.core.lock().unwrap();
                receive::read_one(&mut core, &self.shared, staging, Instant::now())
            };
            match work {
                ReadOne::WouldBlock => break,
                ReadOne::Processed => continue,
                ReadOne::Inline(handler, request) => {
                    let h = request.token.handle;
                    let key = request.token.key;
                    handler.on_request(self.clone(), request).await;
                    self.reattach_after_handler(h, key);
                }
            }
        }

        if timer_fired {
            let mut core = self.core.lock().unwrap();
            retransmit::time_poll(&mut core, &self.shared, Instant::now());
        }

        {
            let mut core = self.core.lock().unwrap();
            scheduler::send_poll(&mut core, &self.shared, Instant::now());
        }

        // callbacks may post replies or new requests, which in turn may
        // produce more sendable datagrams and more completions
        loop {
            let invoked = self.make_callbacks().await;
            let mut core = self.core.lock().unwrap();
            scheduler::send_poll(&mut core, &self.shared, Instant::now());
            if invoked == 0 {
                break;
            }
        }

        if self.is_complete() {
            self.trans_ids.persist_clean();
            self.shutdown_done.notify_waiters();
        }
    }

    /// Drain the callback-ready list, high priority first. Callbacks and
    /// handlers run without the lock; an outgoing slot is freed immediately
    /// after its callback returns.
    async fn make_callbacks(self: &Arc<Self>) -> usize {
        let mut invoked = 0;
        loop {
            let item = {
                let mut core = self.core.lock().unwrap();
                match core.table.pop_ready() {
                    None => None,
                    Some(h) => Some(self.build_ready_item(&mut core, h)),
                }
            };
            let Some(item) = item else { break };

            match item {
                ReadyItem::Outgoing { h, callback, completion } => {
                    trace!("invoking completion callback: {:?}", completion);
                    callback(completion);
                    self.core.lock().unwrap().table.free(h);
                    invoked += 1;
                }
                ReadyItem::Incoming { h, key, handler, request } => {
                    trace!("invoking request handler: {:?}", request);
                    handler.on_request(self.clone(), request).await;
                    self.reattach_after_handler(h, key);
                    invoked += 1;
                }
                ReadyItem::Skip => {}
            }
        }
        invoked
    }

    fn build_ready_item(&self, core: &mut ServerCore, h: SlotHandle) -> ReadyItem {
        if core.table.slot(h).key.incoming {
            let msg_type = core.table.slot(h).msg_type;
            match core.handlers.get(msg_type) {
                None => {
                    receive::free_incoming(core, &self.shared, h);
                    ReadyItem::Skip
                }
                Some((handler, _)) => {
                    let request = receive::detach_for_handler(core, h);
                    let key = request.token.key;
                    ReadyItem::Incoming { h, key, handler, request }
                }
            }
        } else {
            let slot = core.table.slot_mut(h);
            let result = match slot.error {
                Some(e) => Err(e),
                None => Ok(slot.take_assembled()),
            };
            let completion = Completion {
                peer: slot.key.peer,
                msg_type: slot.msg_type,
                tag: slot.tag,
                result,
            };
            match slot.callback.take() {
                Some(callback) => ReadyItem::Outgoing { h, callback, completion },
                None => {
                    // resolved outgoing slots always carry their callback
                    core.table.free(h);
                    ReadyItem::Skip
                }
            }
        }
    }

    /// A handler returned without posting a reply: put the slot back on the
    /// active list so the deadline sweep still sees it, and so a deferred
    /// reply can find it.
    fn reattach_after_handler(&self, h: SlotHandle, key: SlotKey) {
        let mut core = self.core.lock().unwrap();
        if core.table.is_live(h, &key) {
            let slot = core.table.slot(h);
            if slot.phase == SlotPhase::AwaitingHandlerReply && slot.list == ListId::Detached {
                core.table.attach_active(h);
            }
        }
    }
}
