//! `MainDispatcher`: a Dispatcher pre-configured with the fixed control
//! message set (spec §4.3).

use std::cell::RefCell;
use std::rc::Rc;

use crate::dispatcher::{self, Dispatcher, DispatcherSender};
use crate::event_loop::EventLoop;
use crate::types::ClientId;

pub const CHANNEL_EVENT: u32 = 0;
pub const MIGRATE_SEAMLESS_DST_COMPLETE: u32 = 1;
pub const SET_MM_TIME_LATENCY: u32 = 2;
pub const CLIENT_DISCONNECT: u32 = 3;

// Wire sizes below are explicit byte counts, not `size_of` on a Rust struct
// layout (which would be platform-padding-dependent) — they describe the
// payload exactly as packed by the senders in this module.
const CHANNEL_EVENT_PAYLOAD_LEN: usize = 1 + 3 + 4 + 4; // event + pad + type + id
const MM_TIME_LATENCY_PAYLOAD_LEN: usize = 8 + 4; // client + latency_ms
const CLIENT_ID_PAYLOAD_LEN: usize = 8;

/// True while the calling thread is the server thread that owns this
/// dispatcher's receive end — set by whoever drives `EventLoop::run_once`.
/// Callers outside this crate track this with a thread-local; `MainDispatcher`
/// takes it as an explicit flag so the decision stays testable.
pub struct MainDispatcher {
    dispatcher: Rc<RefCell<Dispatcher>>,
}

pub trait MainDispatcherHandlers {
    fn on_channel_event(&mut self, event: u8, channel_type: u32, channel_id: u32);
    fn on_migrate_seamless_dst_complete(&mut self, client: ClientId);
    fn on_set_mm_time_latency(&mut self, client: ClientId, latency_ms: u32);
    fn on_client_disconnect(&mut self, client: ClientId);
}

impl MainDispatcher {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self { dispatcher: Rc::new(RefCell::new(Dispatcher::new()?)) })
    }

    pub fn sender(&self) -> DispatcherSender {
        self.dispatcher.borrow().sender()
    }

    /// Registers a Watch on the underlying dispatcher's receive endpoint so
    /// the server thread drains pending control messages as part of its
    /// normal `EventLoop::run_once` loop.
    pub fn create_watch(&mut self, event_loop: &mut EventLoop) -> std::io::Result<()> {
        dispatcher::create_watch(&self.dispatcher, event_loop)
    }

    /// Wires the four fixed message types onto `handlers`. `handlers` is
    /// `'static` and boxed so the closures can own it; callers normally pass
    /// an `Rc<RefCell<_>>`-wrapped state struct.
    pub fn register_handlers<T>(&mut self, handlers: std::rc::Rc<std::cell::RefCell<T>>)
    where
        T: MainDispatcherHandlers + 'static,
    {
        let mut dispatcher = self.dispatcher.borrow_mut();

        let h = handlers.clone();
        dispatcher.register_handler(
            CHANNEL_EVENT,
            CHANNEL_EVENT_PAYLOAD_LEN,
            false,
            Box::new(move |payload| {
                let event = payload[0];
                let channel_type = u32::from_le_bytes(payload[4..8].try_into().unwrap());
                let channel_id = u32::from_le_bytes(payload[8..12].try_into().unwrap());
                h.borrow_mut().on_channel_event(event, channel_type, channel_id);
            }),
        );

        let h = handlers.clone();
        dispatcher.register_handler(
            MIGRATE_SEAMLESS_DST_COMPLETE,
            CLIENT_ID_PAYLOAD_LEN,
            true,
            Box::new(move |payload| {
                let client = ClientId::from_le_bytes(payload[0..8].try_into().unwrap());
                h.borrow_mut().on_migrate_seamless_dst_complete(client);
            }),
        );

        let h = handlers.clone();
        dispatcher.register_handler(
            SET_MM_TIME_LATENCY,
            MM_TIME_LATENCY_PAYLOAD_LEN,
            false,
            Box::new(move |payload| {
                let client = ClientId::from_le_bytes(payload[0..8].try_into().unwrap());
                let latency_ms = u32::from_le_bytes(payload[8..12].try_into().unwrap());
                h.borrow_mut().on_set_mm_time_latency(client, latency_ms);
            }),
        );

        let h = handlers;
        dispatcher.register_handler(
            CLIENT_DISCONNECT,
            CLIENT_ID_PAYLOAD_LEN,
            true,
            Box::new(move |payload| {
                let client = ClientId::from_le_bytes(payload[0..8].try_into().unwrap());
                h.borrow_mut().on_client_disconnect(client);
            }),
        );
    }

    pub fn drain(&mut self) -> std::io::Result<()> {
        self.dispatcher.borrow_mut().drain()
    }
}

/// Dispatches `channel_event` either inline (already on the server thread)
/// or via the dispatcher, per spec §4.3's "check whether the caller already
/// runs on the server thread" pattern.
pub fn channel_event<T: MainDispatcherHandlers>(
    on_server_thread: bool,
    inline_target: Option<&mut T>,
    sender: &DispatcherSender,
    event: u8,
    channel_type: u32,
    channel_id: u32,
) -> std::io::Result<()> {
    if on_server_thread {
        if let Some(target) = inline_target {
            target.on_channel_event(event, channel_type, channel_id);
        }
        return Ok(());
    }
    let mut payload = vec![event, 0, 0, 0];
    payload.extend_from_slice(&channel_type.to_le_bytes());
    payload.extend_from_slice(&channel_id.to_le_bytes());
    sender.send_message(CHANNEL_EVENT, false, &payload)
}

pub fn migrate_seamless_dst_complete(
    on_server_thread: bool,
    inline_target: Option<&mut dyn MainDispatcherHandlers>,
    sender: &DispatcherSender,
    client: ClientId,
) -> std::io::Result<()> {
    if on_server_thread {
        if let Some(target) = inline_target {
            target.on_migrate_seamless_dst_complete(client);
        }
        return Ok(());
    }
    sender.send_message(MIGRATE_SEAMLESS_DST_COMPLETE, true, &client.to_le_bytes())
}

pub fn set_mm_time_latency(
    on_server_thread: bool,
    inline_target: Option<&mut dyn MainDispatcherHandlers>,
    sender: &DispatcherSender,
    client: ClientId,
    latency_ms: u32,
) -> std::io::Result<()> {
    if on_server_thread {
        if let Some(target) = inline_target {
            target.on_set_mm_time_latency(client, latency_ms);
        }
        return Ok(());
    }
    let mut payload = Vec::with_capacity(MM_TIME_LATENCY_PAYLOAD_LEN);
    payload.extend_from_slice(&client.to_le_bytes());
    payload.extend_from_slice(&latency_ms.to_le_bytes());
    sender.send_message(SET_MM_TIME_LATENCY, false, &payload)
}

pub fn client_disconnect(
    on_server_thread: bool,
    inline_target: Option<&mut dyn MainDispatcherHandlers>,
    sender: &DispatcherSender,
    client: ClientId,
) -> std::io::Result<()> {
    if on_server_thread {
        if let Some(target) = inline_target {
            target.on_client_disconnect(client);
        }
        return Ok(());
    }
    sender.send_message(CLIENT_DISCONNECT, true, &client.to_le_bytes())
}

#[cfg(test)]
mod test {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        events: Vec<(u8, u32, u32)>,
        disconnected: Vec<ClientId>,
    }

    impl MainDispatcherHandlers for Recorder {
        fn on_channel_event(&mut self, event: u8, channel_type: u32, channel_id: u32) {
            self.events.push((event, channel_type, channel_id));
        }
        fn on_migrate_seamless_dst_complete(&mut self, _client: ClientId) {}
        fn on_set_mm_time_latency(&mut self, _client: ClientId, _latency_ms: u32) {}
        fn on_client_disconnect(&mut self, client: ClientId) {
            self.disconnected.push(client);
        }
    }

    #[test]
    fn channel_event_runs_inline_on_server_thread() {
        let mut recorder = Recorder::default();
        let dispatcher = MainDispatcher::new().unwrap();
        let sender = dispatcher.sender();
        channel_event(true, Some(&mut recorder), &sender, 1, 7, 3).unwrap();
        assert_eq!(recorder.events, vec![(1, 7, 3)]);
    }

    #[test]
    fn client_disconnect_blocks_until_handled_when_dispatched() {
        let recorder = Rc::new(RefCell::new(Recorder::default()));
        let mut main_dispatcher = MainDispatcher::new().unwrap();
        main_dispatcher.register_handlers(recorder.clone());
        let sender = main_dispatcher.sender();

        let worker = std::thread::spawn(move || {
            client_disconnect(false, None, &sender, 42).unwrap();
        });

        std::thread::sleep(std::time::Duration::from_millis(20));
        main_dispatcher.drain().unwrap();
        worker.join().unwrap();

        assert_eq!(recorder.borrow().disconnected, vec![42]);
    }

    #[test]
    fn watch_drives_disconnect_handling_via_run_once() {
        let recorder = Rc::new(RefCell::new(Recorder::default()));
        let mut main_dispatcher = MainDispatcher::new().unwrap();
        main_dispatcher.register_handlers(recorder.clone());
        let mut event_loop = EventLoop::new().unwrap();
        main_dispatcher.create_watch(&mut event_loop).unwrap();
        let sender = main_dispatcher.sender();

        let worker = std::thread::spawn(move || {
            client_disconnect(false, None, &sender, 99).unwrap();
        });

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while recorder.borrow().disconnected.is_empty() && std::time::Instant::now() < deadline {
            event_loop.run_once().unwrap();
        }
        worker.join().unwrap();

        assert_eq!(recorder.borrow().disconnected, vec![99]);
    }
}
