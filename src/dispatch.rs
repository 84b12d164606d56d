use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)]
use mockall::automock;

use crate::error::TransportError;
use crate::protocol::{Niceness, MAX_MSG_TYPES};
use crate::server::UdpServer;
use crate::slot::SlotKey;
use crate::slot_table::SlotHandle;

/// Opaque caller state attached to outgoing requests, echoed back in the
/// completion and used by [`cancel`](UdpServer::cancel) to select
/// transactions.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Default)]
pub struct StateTag(pub u64);

/// Outcome of an outgoing transaction, handed to its completion callback
/// exactly once. On success the reply bytes are moved into the callback.
pub struct Completion {
    pub peer: SocketAddr,
    pub msg_type: u8,
    pub tag: StateTag,
    pub result: Result<Bytes, TransportError>,
}

impl Debug for Completion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let result = match &self.result {
            Ok(reply) => format!("reply of {} bytes", reply.len()),
            Err(e) => format!("{:?}", e),
        };
        write!(f, "Completion{{peer:{:?} msg_type:{} {}}}", self.peer, self.msg_type, result)
    }
}

pub type ReplyCallback = Box<dyn FnOnce(Completion) + Send + 'static>;

/// A reassembled inbound request. The handler that receives it must
/// eventually pass it back to [`UdpServer::send_reply`] or
/// [`UdpServer::send_error_reply`]; consuming it there makes a double reply
/// unrepresentable. A request that is merely dropped leaves its slot to the
/// incoming-deadline sweep.
pub struct IncomingRequest {
    pub(crate) token: ReplyToken,
    pub msg_type: u8,
    pub peer: SocketAddr,
    pub niceness: Niceness,
    pub payload: Bytes,
}

impl Debug for IncomingRequest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "IncomingRequest{{peer:{:?} msg_type:{} {} bytes}}",
            self.peer,
            self.msg_type,
            self.payload.len()
        )
    }
}

/// Names the slot an [`IncomingRequest`] belongs to. The key is kept next
/// to the handle so a token surviving its slot (e.g. past the reply
/// deadline) is detected instead of touching a recycled slot.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReplyToken {
    pub(crate) handle: SlotHandle,
    pub(crate) key: SlotKey,
}

/// When a registered handler runs relative to the event loop.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum HandlerMode {
    /// Invoked straight from the receive path the moment the request
    /// completes reassembly. Lowest latency; runs before further datagrams
    /// are read.
    Inline,
    /// Invoked from the event loop's callback phase, batched with other
    /// completions.
    Deferred,
}

/// Inbound request handler for one message type.
///
/// The handler is awaited by the transport's event loop, so it holds up
/// datagram processing while it runs. Non-trivial work should be offloaded
/// (e.g. `tokio::spawn`, moving the request along) and the reply posted
/// from there; the transport keeps the slot alive until a reply is posted
/// or the incoming deadline passes.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn on_request(&self, server: Arc<UdpServer>, request: IncomingRequest);
}

struct HandlerEntry {
    handler: Arc<dyn RequestHandler>,
    mode: HandlerMode,
}

/// Fixed-size registration table indexed by message type.
pub(crate) struct HandlerTable {
    entries: [Option<HandlerEntry>; MAX_MSG_TYPES],
}

impl HandlerTable {
    pub(crate) fn new() -> HandlerTable {
        HandlerTable { entries: [const { None }; MAX_MSG_TYPES] }
    }

    pub(crate) fn register(
        &mut self,
        msg_type: u8,
        handler: Arc<dyn RequestHandler>,
        mode: HandlerMode,
    ) -> Result<(), TransportError> {
        let entry = self
            .entries
            .get_mut(msg_type as usize)
            .ok_or(TransportError::BadCall("message type out of range"))?;
        if entry.is_some() {
            return Err(TransportError::BadCall("duplicate handler registration"));
        }
        *entry = Some(HandlerEntry { handler, mode });
        Ok(())
    }

    pub(crate) fn get(&self, msg_type: u8) -> Option<(Arc<dyn RequestHandler>, HandlerMode)> {
        self.entries
            .get(msg_type as usize)?
            .as_ref()
            .map(|e| (e.handler.clone(), e.mode))
    }

    pub(crate) fn has_handler(&self, msg_type: u8) -> bool {
        self.entries.get(msg_type as usize).is_some_and(|e| e.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration() {
        let mut table = HandlerTable::new();
        assert!(!table.has_handler(5));

        let handler: Arc<dyn RequestHandler> = Arc::new(MockRequestHandler::new());
        table.register(5, handler.clone(), HandlerMode::Deferred).unwrap();
        assert!(table.has_handler(5));
        assert!(table.get(5).is_some());
        assert_eq!(table.get(5).unwrap().1, HandlerMode::Deferred);

        // double registration is a programming error
        let result = table.register(5, handler.clone(), HandlerMode::Inline);
        assert!(matches!(result, Err(TransportError::BadCall(_))));

        // out-of-range message types are rejected
        let result = table.register(MAX_MSG_TYPES as u8, handler, HandlerMode::Inline);
        assert!(matches!(result, Err(TransportError::BadCall(_))));
    }
}
