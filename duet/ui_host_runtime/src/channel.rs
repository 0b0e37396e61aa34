//! Ordered message transport between exactly two thread endpoints.
//!
//! A [`Port`] is the `Send` half that moves onto its thread; an [`Endpoint`]
//! wraps it on that thread and owns the handler table and the pending-call
//! table. Everything crossing a port is an encoded frame, never a shared
//! object.

use crate::error::{CallError, ChannelError};
use crate::protocol::{decode_frame, encode_frame, BACKGROUND_TO_MAIN_CAP};
use futures::channel::oneshot;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::task::{Context, Poll};
use tracing::{debug, error, warn};

/// Event type of the reply that settles a pending call.
pub const FUNCTION_CALL_RET: &str = "FunctionCallRet";

const FRAME_CAP: usize = BACKGROUND_TO_MAIN_CAP;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
    /// Present when the sender awaits a `FunctionCallRet`.
    #[serde(rename = "retId", default, skip_serializing_if = "Option::is_none")]
    pub ret_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionCallRet {
    pub resolve_id: u64,
    #[serde(default)]
    pub return_value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct Port {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
}

/// Two connected ports. Frames sent on one arrive in order on the other.
pub fn port_pair() -> (Port, Port) {
    let (left_tx, right_rx) = mpsc::channel();
    let (right_tx, left_rx) = mpsc::channel();
    (
        Port {
            tx: left_tx,
            rx: left_rx,
        },
        Port {
            tx: right_tx,
            rx: right_rx,
        },
    )
}

impl Port {
    pub fn send(&self, message: &Message) -> Result<(), ChannelError> {
        let frame = encode_frame(message, FRAME_CAP)?;
        self.tx.send(frame).map_err(|_| ChannelError::Disconnected)
    }

    pub fn try_recv(&self) -> Result<Option<Message>, ChannelError> {
        match self.rx.try_recv() {
            Ok(frame) => Ok(Some(decode_frame(&frame, FRAME_CAP)?)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(ChannelError::Disconnected),
        }
    }

    /// Blocks the current thread until a frame arrives.
    pub fn recv(&self) -> Result<Message, ChannelError> {
        let frame = self.rx.recv().map_err(|_| ChannelError::Disconnected)?;
        Ok(decode_frame(&frame, FRAME_CAP)?)
    }
}

pub type Handler = Box<dyn FnMut(Value) -> Result<Value, String>>;

type SharedHandler = Rc<RefCell<Handler>>;
type ReplySender = oneshot::Sender<Result<Value, CallError>>;

/// Resolves once the peer answers the call with a `FunctionCallRet`.
///
/// No timeout applies. If the peer never replies the entry stays in the
/// pending table until the endpoint is dropped, which resolves it to
/// [`CallError::Abandoned`].
#[derive(Debug)]
pub struct PendingReply {
    resolve_id: u64,
    rx: oneshot::Receiver<Result<Value, CallError>>,
}

impl PendingReply {
    pub fn resolve_id(&self) -> u64 {
        self.resolve_id
    }

    /// Non-blocking check for a reply that already arrived.
    pub fn try_take(&mut self) -> Option<Result<Value, CallError>> {
        match self.rx.try_recv() {
            Ok(reply) => reply,
            Err(oneshot::Canceled) => Some(Err(CallError::Abandoned)),
        }
    }
}

impl Future for PendingReply {
    type Output = Result<Value, CallError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|reply| match reply {
            Ok(reply) => reply,
            Err(oneshot::Canceled) => Err(CallError::Abandoned),
        })
    }
}

struct EndpointInner {
    port: Port,
    handlers: HashMap<String, SharedHandler>,
    cache: HashMap<String, Vec<Message>>,
    pending: HashMap<u64, ReplySender>,
    next_call_id: u64,
    max_in_flight: usize,
}

/// Single-threaded owner of one side of a port pair.
///
/// Handlers run while no internal borrow is held, so they may dispatch,
/// invoke and register handlers on the same endpoint. They must not call
/// [`Endpoint::pump`] themselves.
#[derive(Clone)]
pub struct Endpoint {
    inner: Rc<RefCell<EndpointInner>>,
}

impl Endpoint {
    pub fn new(port: Port, max_in_flight: usize) -> Self {
        Self {
            inner: Rc::new(RefCell::new(EndpointInner {
                port,
                handlers: HashMap::new(),
                cache: HashMap::new(),
                pending: HashMap::new(),
                next_call_id: 1,
                max_in_flight: max_in_flight.max(1),
            })),
        }
    }

    /// Binds `handler` to `event_type` and replays any messages that arrived
    /// for it while it was unbound, in arrival order.
    pub fn register_handler<F>(&self, event_type: &str, handler: F)
    where
        F: FnMut(Value) -> Result<Value, String> + 'static,
    {
        let cached = {
            let mut inner = self.inner.borrow_mut();
            inner.handlers.insert(
                event_type.to_string(),
                Rc::new(RefCell::new(Box::new(handler))),
            );
            inner.cache.remove(event_type).unwrap_or_default()
        };

        if !cached.is_empty() {
            debug!(event_type, count = cached.len(), "replaying cached messages");
        }
        for message in cached {
            self.handle(message);
        }
    }

    pub fn remove_handler(&self, event_type: &str) -> bool {
        self.inner.borrow_mut().handlers.remove(event_type).is_some()
    }

    /// Fire-and-forget send.
    pub fn dispatch(&self, event_type: &str, data: Value) -> Result<(), ChannelError> {
        self.inner.borrow().port.send(&Message {
            event_type: event_type.to_string(),
            data,
            ret_id: None,
        })
    }

    /// Sends a message that expects a `FunctionCallRet` and returns the
    /// future settled by it.
    pub fn invoke(&self, event_type: &str, data: Value) -> Result<PendingReply, ChannelError> {
        let mut inner = self.inner.borrow_mut();
        if inner.pending.len() >= inner.max_in_flight {
            return Err(ChannelError::TooManyInFlight {
                limit: inner.max_in_flight,
            });
        }

        let resolve_id = inner.next_call_id;
        inner.port.send(&Message {
            event_type: event_type.to_string(),
            data,
            ret_id: Some(resolve_id),
        })?;
        inner.next_call_id += 1;

        let (tx, rx) = oneshot::channel();
        inner.pending.insert(resolve_id, tx);
        Ok(PendingReply { resolve_id, rx })
    }

    /// Handles every message currently queued on the port and returns how
    /// many there were. Fails with `Disconnected` only when the queue is
    /// empty and the peer is gone.
    pub fn pump(&self) -> Result<usize, ChannelError> {
        let mut handled = 0;
        loop {
            let next = self.inner.borrow().port.try_recv();
            match next {
                Ok(Some(message)) => {
                    self.handle(message);
                    handled += 1;
                }
                Ok(None) => return Ok(handled),
                Err(ChannelError::Disconnected) if handled > 0 => return Ok(handled),
                Err(err) => return Err(err),
            }
        }
    }

    /// Blocks until one message arrives, then handles it and everything
    /// queued behind it.
    pub fn pump_blocking(&self) -> Result<usize, ChannelError> {
        let message = self.inner.borrow().port.recv()?;
        self.handle(message);
        Ok(1 + self.pump().unwrap_or(0))
    }

    pub fn pending_calls(&self) -> usize {
        self.inner.borrow().pending.len()
    }

    pub fn cached_messages(&self, event_type: &str) -> usize {
        self.inner
            .borrow()
            .cache
            .get(event_type)
            .map_or(0, Vec::len)
    }

    fn handle(&self, message: Message) {
        if message.event_type == FUNCTION_CALL_RET && message.ret_id.is_none() {
            self.settle(message.data);
            return;
        }

        let handler = self.inner.borrow().handlers.get(&message.event_type).cloned();
        let Some(handler) = handler else {
            debug!(event_type = %message.event_type, "caching message for unbound handler");
            self.inner
                .borrow_mut()
                .cache
                .entry(message.event_type.clone())
                .or_default()
                .push(message);
            return;
        };

        let result = (handler.borrow_mut())(message.data);
        if let Err(reason) = &result {
            error!(event_type = %message.event_type, %reason, "handler failed");
        }

        if let Some(resolve_id) = message.ret_id {
            let reply = match result {
                Ok(return_value) => FunctionCallRet {
                    resolve_id,
                    return_value,
                    error: None,
                },
                Err(reason) => FunctionCallRet {
                    resolve_id,
                    return_value: Value::Null,
                    error: Some(reason),
                },
            };
            if let Err(err) = self.send_reply(&reply) {
                warn!(resolve_id, %err, "failed to send call reply");
            }
        }
    }

    fn send_reply(&self, reply: &FunctionCallRet) -> Result<(), ChannelError> {
        let data = serde_json::to_value(reply)
            .map_err(|err| ChannelError::Codec(std::io::Error::other(err)))?;
        self.dispatch(FUNCTION_CALL_RET, data)
    }

    fn settle(&self, data: Value) {
        let reply: FunctionCallRet = match serde_json::from_value(data) {
            Ok(reply) => reply,
            Err(err) => {
                warn!(%err, "malformed FunctionCallRet");
                return;
            }
        };

        let Some(tx) = self.inner.borrow_mut().pending.remove(&reply.resolve_id) else {
            warn!(resolve_id = reply.resolve_id, "reply for unknown or settled call");
            return;
        };

        let outcome = match reply.error {
            Some(reason) => Err(CallError::Remote(reason)),
            None => Ok(reply.return_value),
        };
        // The caller may have dropped its future; nothing to do then.
        let _ = tx.send(outcome);
    }
}
