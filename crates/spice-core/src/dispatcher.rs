//! Cross-thread serialized RPC onto the server thread.
//!
//! Grounded on the original's `Dispatcher`: a socket-pair transport, a
//! mutex-guarded writer side, and a reader side drained on the server thread
//! by a `Watch` registered on the receive endpoint.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use mio::Interest;
use spice_net::{DISPATCHER_ACK, DISPATCHER_CUSTOM_TYPE, DispatcherHeader, SocketPairTransport};
use spice_utils::safe_panic;

use crate::event_loop::{EventLoop, WatchHandle};

pub type Handler = Box<dyn FnMut(&[u8])>;
pub type UniversalHandler = Box<dyn FnMut(u32, &[u8])>;

struct HandlerEntry {
    handler: Handler,
    payload_size: usize,
    ack: bool,
}

struct SenderInner {
    transport: Mutex<SocketPairTransport>,
}

/// The sending half, cloneable and `Send` so worker threads can each hold
/// one. All writers share the same socket-pair via the inner mutex, matching
/// the original's "writers serialize on an internal mutex spanning header
/// and payload write."
#[derive(Clone)]
pub struct DispatcherSender {
    inner: Arc<SenderInner>,
}

// SAFETY: the socket-pair fd itself is safe to use from any thread as long
// as writes are serialized, which `SenderInner`'s mutex guarantees.
unsafe impl Send for SenderInner {}
unsafe impl Sync for SenderInner {}

impl DispatcherSender {
    /// Sends `payload` (must match the registered size for `msg_type`,
    /// checked by the receiver's handler table at dispatch time — this side
    /// trusts the caller). Blocks until the ack sentinel is read back iff
    /// `ack` is true.
    pub fn send_message(&self, msg_type: u32, ack: bool, payload: &[u8]) -> std::io::Result<()> {
        let header = DispatcherHeader {
            handler: 0,
            size: payload.len() as u32,
            message_type: msg_type,
            ack,
        };
        let mut transport = self.inner.transport.lock().unwrap();
        transport.write_message(header, payload)?;
        if ack {
            let got = transport.read_ack()?;
            spice_utils::safe_assert_eq!(got, DISPATCHER_ACK, "dispatcher ack sentinel mismatch");
        }
        Ok(())
    }

    /// Sends to a runtime-provided handler pointer rather than a registered
    /// type, using the reserved "custom" pseudo-type. `handler_id` is an
    /// opaque numeric key the receiver's custom-handler table understands.
    pub fn send_message_custom(
        &self,
        handler_id: u32,
        ack: bool,
        payload: &[u8],
    ) -> std::io::Result<()> {
        let header = DispatcherHeader {
            handler: handler_id,
            size: payload.len() as u32,
            message_type: DISPATCHER_CUSTOM_TYPE,
            ack,
        };
        let mut transport = self.inner.transport.lock().unwrap();
        transport.write_message(header, payload)?;
        if ack {
            let got = transport.read_ack()?;
            spice_utils::safe_assert_eq!(got, DISPATCHER_ACK, "dispatcher ack sentinel mismatch");
        }
        Ok(())
    }
}

/// The receiving half, owned by the server thread. Holds the fixed handler
/// table and drains the socket-pair when its Watch fires.
pub struct Dispatcher {
    receiver: SocketPairTransport,
    sender: DispatcherSender,
    handlers: std::collections::HashMap<u32, HandlerEntry>,
    custom_handlers: std::collections::HashMap<u32, Handler>,
    universal: Option<UniversalHandler>,
    watch: Option<WatchHandle>,
}

impl Dispatcher {
    pub fn new() -> std::io::Result<Self> {
        let (send_end, recv_end) = SocketPairTransport::pair()?;
        Ok(Self {
            receiver: recv_end,
            sender: DispatcherSender { inner: Arc::new(SenderInner { transport: Mutex::new(send_end) }) },
            handlers: Default::default(),
            custom_handlers: Default::default(),
            universal: None,
            watch: None,
        })
    }

    /// A cloneable sender handle worker threads can hold independently.
    pub fn sender(&self) -> DispatcherSender {
        self.sender.clone()
    }

    /// Registers a handler for a fixed numeric message type. `payload_size`
    /// is advisory (the original validates it on the C side; we trust
    /// callers to size their payloads consistently per type).
    pub fn register_handler(
        &mut self,
        msg_type: u32,
        payload_size: usize,
        ack: bool,
        handler: Handler,
    ) {
        self.handlers.insert(msg_type, HandlerEntry { handler, payload_size, ack });
    }

    pub fn register_custom_handler(&mut self, handler_id: u32, handler: Handler) {
        self.custom_handlers.insert(handler_id, handler);
    }

    /// Optional tap invoked before every registered handler — used for
    /// logging/recording.
    pub fn register_universal_handler(&mut self, handler: UniversalHandler) {
        self.universal = Some(handler);
    }

    /// Drains every pending message on the receive socket, invoking the
    /// matching registered (or custom) handler, and the universal tap before
    /// each. ACKed messages get an ack byte written back immediately after
    /// the handler returns, satisfying "after `send_message` returns, the
    /// handler has been invoked iff `ack=true`."
    pub fn drain(&mut self) -> std::io::Result<()> {
        let handlers = &mut self.handlers;
        let custom_handlers = &mut self.custom_handlers;
        let universal = &mut self.universal;
        let mut needs_ack = false;

        self.receiver.drain_pending(|header, payload| {
            if let Some(tap) = universal {
                tap(header.message_type, &payload);
            }

            if header.message_type == spice_net::DISPATCHER_CUSTOM_TYPE {
                if let Some(handler) = custom_handlers.get_mut(&header.handler) {
                    handler(&payload);
                } else {
                    safe_panic!("dispatcher: unknown custom handler id {}", header.handler);
                }
            } else if let Some(entry) = handlers.get_mut(&header.message_type) {
                spice_utils::safe_assert_eq!(
                    entry.payload_size,
                    payload.len(),
                    "dispatcher payload size mismatch for type {}",
                    header.message_type
                );
                (entry.handler)(&payload);
            } else {
                safe_panic!("dispatcher: unregistered message type {}", header.message_type);
            }

            needs_ack = header.ack;
        })?;

        if needs_ack {
            self.receiver.write_ack()?;
        }
        Ok(())
    }
}

/// Registers a Watch on `dispatcher`'s receive endpoint so the server thread
/// drains pending messages whenever the socket pair is readable. Takes
/// `dispatcher` behind `Rc<RefCell<_>>` so the watch callback (which only
/// receives `&mut EventLoop`) can reach back into it via a `Weak` upgrade and
/// call `drain()` for real when `run_once` reports readiness.
pub fn create_watch(dispatcher: &Rc<RefCell<Dispatcher>>, event_loop: &mut EventLoop) -> std::io::Result<()> {
    let token = event_loop.alloc_token();
    let mut mio_end = dispatcher.borrow_mut().receiver.try_clone_for_registration()?;
    event_loop.registry().register(&mut mio_end, token, Interest::READABLE)?;
    // keep the clone alive for as long as the registration is live
    std::mem::forget(mio_end);
    let weak = Rc::downgrade(dispatcher);
    let handle = event_loop.add_watch(
        token,
        Interest::READABLE,
        Box::new(move |_el, _interest| {
            if let Some(d) = weak.upgrade() {
                if let Err(err) = d.borrow_mut().drain() {
                    tracing::warn!(?err, "dispatcher: drain on watch readiness failed");
                }
            }
        }),
    );
    dispatcher.borrow_mut().watch = Some(handle);
    Ok(())
}
